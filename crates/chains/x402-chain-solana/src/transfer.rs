//! SPL token transfer construction and inspection.
//!
//! Settlement moves tokens between associated token accounts (ATAs) with
//! `TransferChecked`. Missing destination ATAs are created in the same
//! transaction with the idempotent ATA-create instruction, the facilitator
//! paying the rent.

use solana_message::v0::Message as MessageV0;
use solana_message::{Hash, VersionedMessage};
use solana_pubkey::{Pubkey, pubkey};
use solana_signature::Signature;
use solana_signer::Signer;
use solana_transaction::Instruction;
use solana_transaction::versioned::VersionedTransaction;
use spl_token::solana_program::instruction::AccountMeta;
use spl_token::solana_program::program_pack::Pack;
use spl_token_2022::extension::StateWithExtensions;
use x402_types::proto::PaymentError;
use x402_types::util::Base64Bytes;

use crate::chain::{Address, SolanaChainProviderError, SolanaChainProviderLike, sign_at_signer_index};

pub const ATA_PROGRAM_PUBKEY: Pubkey = pubkey!("ATokenGPvbdGVxr1b2hvZbsiqW5xWH25efTNsLJA8knL");
pub const SYSTEM_PROGRAM_PUBKEY: Pubkey = pubkey!("11111111111111111111111111111111");

/// Instruction tag of `CreateIdempotent` in the ATA program.
const ATA_CREATE_IDEMPOTENT: u8 = 1;

#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("{0}")]
    InvalidAddress(String),
    #[error("Token mint {actual} is not accepted, expected {expected}")]
    AssetMismatch { expected: Address, actual: String },
    #[error("Account {0} is not an SPL token mint")]
    UnknownMint(Pubkey),
    #[error("Payer token account {0} does not exist")]
    MissingSenderAccount(Pubkey),
    #[error("Can not decode transaction: {0}")]
    TransactionDecoding(String),
    #[error("Can not compile transaction: {0}")]
    Compile(String),
    #[error("Instruction at index {0} not found")]
    NoInstructionAtIndex(usize),
    #[error("No account at index {0}")]
    NoAccountAtIndex(u8),
    #[error("Program not allowed in sponsored transaction: {0}")]
    ProgramNotAllowed(Pubkey),
    #[error("Invalid token instruction")]
    InvalidTokenInstruction,
    #[error("Expected exactly one transfer instruction, found {0}")]
    TransferCount(usize),
    #[error("Fee payer must be the facilitator")]
    FeePayerMismatch,
    #[error("Fee payer found transferring funds")]
    FeePayerTransferringFunds,
    #[error("Transfer authority must be the payer")]
    AuthorityMismatch,
    #[error("Transfer destination is not the recipient's token account")]
    RecipientMismatch,
    #[error("Transfer amount {actual} does not match payment amount {expected}")]
    AmountMismatch { expected: u64, actual: u64 },
    #[error("Transaction is missing the payer signature")]
    MissingPayerSignature,
    #[error(transparent)]
    Provider(#[from] SolanaChainProviderError),
}

impl From<TransferError> for PaymentError {
    fn from(value: TransferError) -> Self {
        match value {
            TransferError::Provider(e) => PaymentError::Settlement(e.to_string()),
            TransferError::Compile(e) => PaymentError::Settlement(e),
            other => PaymentError::Validation(vec![other.to_string()]),
        }
    }
}

/// Mint information read from the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mint {
    Token { decimals: u8, token_program: Pubkey },
    Token2022 { decimals: u8, token_program: Pubkey },
}

impl Mint {
    pub fn token_program(&self) -> &Pubkey {
        match self {
            Mint::Token { token_program, .. } => token_program,
            Mint::Token2022 { token_program, .. } => token_program,
        }
    }

    pub fn decimals(&self) -> u8 {
        match self {
            Mint::Token { decimals, .. } | Mint::Token2022 { decimals, .. } => *decimals,
        }
    }
}

/// Reads decimals and owning token program of a mint.
pub async fn fetch_mint<P: SolanaChainProviderLike>(
    provider: &P,
    mint_address: &Address,
) -> Result<Mint, TransferError> {
    let mint_pubkey = *mint_address.pubkey();
    let accounts = provider.get_multiple_accounts(&[mint_pubkey]).await?;
    let account = accounts
        .into_iter()
        .next()
        .flatten()
        .ok_or(TransferError::UnknownMint(mint_pubkey))?;
    if account.owner == spl_token::id() {
        let mint = spl_token::state::Mint::unpack(&account.data)
            .map_err(|_| TransferError::UnknownMint(mint_pubkey))?;
        Ok(Mint::Token {
            decimals: mint.decimals,
            token_program: spl_token::id(),
        })
    } else if account.owner == spl_token_2022::id() {
        let mint = StateWithExtensions::<spl_token_2022::state::Mint>::unpack(&account.data)
            .map_err(|_| TransferError::UnknownMint(mint_pubkey))?;
        Ok(Mint::Token2022 {
            decimals: mint.base.decimals,
            token_program: spl_token_2022::id(),
        })
    } else {
        Err(TransferError::UnknownMint(mint_pubkey))
    }
}

/// `findAssociatedTokenPda(owner, token_program, mint)`.
pub fn associated_token_address(owner: &Pubkey, token_program: &Pubkey, mint: &Pubkey) -> Pubkey {
    let (ata, _) = Pubkey::find_program_address(
        &[owner.as_ref(), token_program.as_ref(), mint.as_ref()],
        &ATA_PROGRAM_PUBKEY,
    );
    ata
}

/// Creates `owner`'s ATA for `mint` unless it already exists; `funder` pays rent.
pub fn create_ata_idempotent_instruction(
    funder: &Pubkey,
    owner: &Pubkey,
    mint: &Pubkey,
    token_program: &Pubkey,
) -> Instruction {
    let ata = associated_token_address(owner, token_program, mint);
    Instruction::new_with_bytes(
        ATA_PROGRAM_PUBKEY,
        &[ATA_CREATE_IDEMPOTENT],
        vec![
            AccountMeta::new(*funder, true),
            AccountMeta::new(ata, false),
            AccountMeta::new_readonly(*owner, false),
            AccountMeta::new_readonly(*mint, false),
            AccountMeta::new_readonly(SYSTEM_PROGRAM_PUBKEY, false),
            AccountMeta::new_readonly(*token_program, false),
        ],
    )
}

pub fn transfer_checked_instruction(
    mint: &Mint,
    mint_address: &Pubkey,
    source: &Pubkey,
    destination: &Pubkey,
    authority: &Pubkey,
    amount: u64,
) -> Result<Instruction, TransferError> {
    let instruction = match mint {
        Mint::Token {
            decimals,
            token_program,
        } => spl_token::instruction::transfer_checked(
            token_program,
            source,
            mint_address,
            destination,
            authority,
            &[],
            amount,
            *decimals,
        ),
        Mint::Token2022 {
            decimals,
            token_program,
        } => spl_token_2022::instruction::transfer_checked(
            token_program,
            source,
            mint_address,
            destination,
            authority,
            &[],
            amount,
            *decimals,
        ),
    };
    instruction.map_err(|_| TransferError::InvalidTokenInstruction)
}

/// One destination of a transfer plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferLeg {
    pub owner: Pubkey,
    pub amount: u64,
}

/// Token movements out of one payer's ATA, signed by `authority`.
///
/// The authority is either the payer itself or the facilitator acting as the
/// payer's SPL delegate.
#[derive(Debug, Clone)]
pub struct TransferPlan {
    pub mint: Address,
    pub payer: Pubkey,
    pub authority: Pubkey,
    pub legs: Vec<TransferLeg>,
}

/// Resolves ATAs and turns a plan into instructions.
///
/// Zero-amount legs are skipped. A destination ATA missing on the cluster gets a
/// create instruction funded by the provider's key.
pub async fn build_transfer_instructions<P: SolanaChainProviderLike>(
    provider: &P,
    plan: &TransferPlan,
) -> Result<Vec<Instruction>, TransferError> {
    let mint = fetch_mint(provider, &plan.mint).await?;
    let mint_pubkey = *plan.mint.pubkey();
    let token_program = *mint.token_program();
    let source = associated_token_address(&plan.payer, &token_program, &mint_pubkey);

    let legs: Vec<(TransferLeg, Pubkey)> = plan
        .legs
        .iter()
        .filter(|leg| leg.amount > 0)
        .map(|leg| {
            let ata = associated_token_address(&leg.owner, &token_program, &mint_pubkey);
            (*leg, ata)
        })
        .collect();

    let mut lookup = Vec::with_capacity(legs.len() + 1);
    lookup.push(source);
    lookup.extend(legs.iter().map(|(_, ata)| *ata));
    let accounts = provider.get_multiple_accounts(&lookup).await?;
    if accounts.first().cloned().flatten().is_none() {
        return Err(TransferError::MissingSenderAccount(source));
    }

    let funder = provider.pubkey();
    let mut instructions = Vec::with_capacity(legs.len() * 2);
    let mut created = Vec::new();
    for (index, (leg, ata)) in legs.iter().enumerate() {
        let exists = accounts.get(index + 1).cloned().flatten().is_some();
        if !exists && !created.contains(ata) {
            tracing::debug!(owner = %leg.owner, ata = %ata, "Creating missing token account");
            instructions.push(create_ata_idempotent_instruction(
                &funder,
                &leg.owner,
                &mint_pubkey,
                &token_program,
            ));
            created.push(*ata);
        }
        instructions.push(transfer_checked_instruction(
            &mint,
            &mint_pubkey,
            &source,
            ata,
            &plan.authority,
            leg.amount,
        )?);
    }
    Ok(instructions)
}

/// Compiles an unsigned v0 transaction with room for every required signature.
pub fn compile_transaction(
    fee_payer: &Pubkey,
    instructions: &[Instruction],
    recent_blockhash: Hash,
) -> Result<VersionedTransaction, TransferError> {
    let message = MessageV0::try_compile(fee_payer, instructions, &[], recent_blockhash)
        .map_err(|e| TransferError::Compile(format!("{e:?}")))?;
    let num_required = message.header.num_required_signatures as usize;
    Ok(VersionedTransaction {
        signatures: vec![Signature::default(); num_required],
        message: VersionedMessage::V0(message),
    })
}

/// A decoded `TransferChecked` instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferCheckedInstruction {
    pub amount: u64,
    pub source: Pubkey,
    pub mint: Pubkey,
    pub destination: Pubkey,
    pub authority: Pubkey,
    pub token_program: Pubkey,
}

/// What a pre-signed sponsored transaction must do.
#[derive(Debug, Clone, Copy)]
pub struct ExpectedTransfer {
    pub payer: Pubkey,
    pub recipient: Pubkey,
    pub mint: Pubkey,
    pub amount: u64,
}

pub struct TransactionInt {
    inner: VersionedTransaction,
}

pub struct InstructionInt<'a> {
    index: usize,
    program_id: Pubkey,
    accounts: &'a [u8],
    data: &'a [u8],
    account_keys: &'a [Pubkey],
}

impl TransactionInt {
    pub fn new(transaction: VersionedTransaction) -> Self {
        Self { inner: transaction }
    }

    pub fn from_base64(encoded: &str) -> Result<Self, TransferError> {
        let bytes = Base64Bytes::from(encoded.trim())
            .decode()
            .map_err(|e| TransferError::TransactionDecoding(e.to_string()))?;
        let inner: VersionedTransaction = bincode::deserialize(&bytes)
            .map_err(|e| TransferError::TransactionDecoding(e.to_string()))?;
        Ok(Self { inner })
    }

    pub fn inner(&self) -> &VersionedTransaction {
        &self.inner
    }

    pub fn into_inner(self) -> VersionedTransaction {
        self.inner
    }

    pub fn fee_payer(&self) -> Option<&Pubkey> {
        self.inner.message.static_account_keys().first()
    }

    pub fn instructions_len(&self) -> usize {
        self.inner.message.instructions().len()
    }

    pub fn instruction(&self, index: usize) -> Result<InstructionInt<'_>, TransferError> {
        let instruction = self
            .inner
            .message
            .instructions()
            .get(index)
            .ok_or(TransferError::NoInstructionAtIndex(index))?;
        let account_keys = self.inner.message.static_account_keys();
        let program_id = *account_keys
            .get(instruction.program_id_index as usize)
            .ok_or(TransferError::NoInstructionAtIndex(index))?;
        Ok(InstructionInt {
            index,
            program_id,
            accounts: &instruction.accounts,
            data: &instruction.data,
            account_keys,
        })
    }

    /// Whether `signer` holds a non-default signature in its slot.
    pub fn is_signed_by(&self, signer: &Pubkey) -> bool {
        let num_required = self.inner.message.header().num_required_signatures as usize;
        self.inner
            .message
            .static_account_keys()
            .iter()
            .take(num_required)
            .position(|k| k == signer)
            .and_then(|pos| self.inner.signatures.get(pos))
            .is_some_and(|signature| *signature != Signature::default())
    }

    pub fn is_fully_signed(&self) -> bool {
        let num_required = self.inner.message.header().num_required_signatures as usize;
        if self.inner.signatures.len() < num_required {
            return false;
        }
        let default = Signature::default();
        self.inner.signatures.iter().all(|s| *s != default)
    }

    pub fn sign<P: SolanaChainProviderLike>(self, provider: &P) -> Result<Self, TransferError> {
        let tx = provider.sign(self.inner)?;
        Ok(Self { inner: tx })
    }

    pub fn sign_with_keypair<S: Signer>(self, signer: &S) -> Result<Self, TransferError> {
        let tx = sign_at_signer_index(self.inner, signer)?;
        Ok(Self { inner: tx })
    }

    pub fn as_base64(&self) -> Result<String, TransferError> {
        let bytes = bincode::serialize(&self.inner)
            .map_err(|e| TransferError::TransactionDecoding(e.to_string()))?;
        Ok(Base64Bytes::encode(bytes).to_string())
    }

    /// Checks a payer-signed transaction before the facilitator co-signs it.
    ///
    /// The facilitator must be the fee payer and nothing else: it may fund the
    /// creation of the recipient's token account, but never move tokens. The
    /// transaction must hold exactly one `TransferChecked` of the expected amount
    /// and mint, from the payer's authority, into the recipient's ATA.
    pub fn verify_sponsored_transfer(
        &self,
        facilitator: &Pubkey,
        expected: &ExpectedTransfer,
    ) -> Result<TransferCheckedInstruction, TransferError> {
        if self.fee_payer() != Some(facilitator) {
            return Err(TransferError::FeePayerMismatch);
        }
        let mut transfers = Vec::new();
        for index in 0..self.instructions_len() {
            let instruction = self.instruction(index)?;
            let program_id = instruction.program_id;
            if program_id == ATA_PROGRAM_PUBKEY {
                instruction.assert_recipient_ata_creation(expected)?;
            } else if program_id == spl_token::ID || program_id == spl_token_2022::ID {
                transfers.push(instruction.transfer_checked()?);
            } else {
                return Err(TransferError::ProgramNotAllowed(program_id));
            }
        }
        let [transfer] = transfers.as_slice() else {
            return Err(TransferError::TransferCount(transfers.len()));
        };
        let transfer = *transfer;
        if transfer.authority == *facilitator {
            return Err(TransferError::FeePayerTransferringFunds);
        }
        if transfer.authority != expected.payer {
            return Err(TransferError::AuthorityMismatch);
        }
        if transfer.mint != expected.mint {
            return Err(TransferError::AssetMismatch {
                expected: Address::new(expected.mint),
                actual: transfer.mint.to_string(),
            });
        }
        let ata = associated_token_address(&expected.recipient, &transfer.token_program, &expected.mint);
        if transfer.destination != ata {
            return Err(TransferError::RecipientMismatch);
        }
        if transfer.amount != expected.amount {
            return Err(TransferError::AmountMismatch {
                expected: expected.amount,
                actual: transfer.amount,
            });
        }
        if !self.is_signed_by(&expected.payer) {
            return Err(TransferError::MissingPayerSignature);
        }
        Ok(transfer)
    }
}

impl InstructionInt<'_> {
    pub fn account(&self, index: u8) -> Result<Pubkey, TransferError> {
        let account_index = self
            .accounts
            .get(index as usize)
            .ok_or(TransferError::NoAccountAtIndex(index))?;
        self.account_keys
            .get(*account_index as usize)
            .copied()
            .ok_or(TransferError::NoAccountAtIndex(index))
    }

    pub fn transfer_checked(&self) -> Result<TransferCheckedInstruction, TransferError> {
        let amount = if self.program_id == spl_token::ID {
            match spl_token::instruction::TokenInstruction::unpack(self.data) {
                Ok(spl_token::instruction::TokenInstruction::TransferChecked { amount, .. }) => amount,
                _ => return Err(TransferError::InvalidTokenInstruction),
            }
        } else if self.program_id == spl_token_2022::ID {
            match spl_token_2022::instruction::TokenInstruction::unpack(self.data) {
                Ok(spl_token_2022::instruction::TokenInstruction::TransferChecked {
                    amount, ..
                }) => amount,
                _ => return Err(TransferError::InvalidTokenInstruction),
            }
        } else {
            return Err(TransferError::InvalidTokenInstruction);
        };
        Ok(TransferCheckedInstruction {
            amount,
            source: self.account(0)?,
            mint: self.account(1)?,
            destination: self.account(2)?,
            authority: self.account(3)?,
            token_program: self.program_id,
        })
    }

    /// Only `CreateIdempotent`/`Create` of the recipient's ATA for the expected mint.
    fn assert_recipient_ata_creation(&self, expected: &ExpectedTransfer) -> Result<(), TransferError> {
        let is_create = self.data.is_empty() || self.data == [ATA_CREATE_IDEMPOTENT];
        if !is_create {
            return Err(TransferError::ProgramNotAllowed(self.program_id));
        }
        let owner = self.account(2)?;
        let mint = self.account(3)?;
        if owner != expected.recipient || mint != expected.mint {
            tracing::debug!(index = self.index, %owner, %mint, "Unexpected token account creation");
            return Err(TransferError::RecipientMismatch);
        }
        Ok(())
    }
}
