//! In-memory cluster for unit tests.

use solana_account::Account;
use solana_client::client_error::ClientErrorKind;
use solana_keypair::Keypair;
use solana_message::Hash;
use solana_message::v0::Message as MessageV0;
use solana_pubkey::Pubkey;
use solana_signature::Signature;
use solana_signer::Signer;
use solana_transaction::versioned::VersionedTransaction;
use spl_token::solana_program::program_option::COption;
use spl_token::solana_program::program_pack::Pack;
use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use crate::chain::{
    Confirmation, SignatureStatus, SolanaChainProviderError, SolanaChainProviderLike,
    sign_at_signer_index,
};
use crate::transfer::associated_token_address;

pub fn random_pubkey() -> Pubkey {
    Keypair::new().pubkey()
}

pub struct MockProvider {
    keypair: Keypair,
    mint: Pubkey,
    accounts: Mutex<HashMap<Pubkey, Account>>,
    statuses: Mutex<HashMap<Signature, SignatureStatus>>,
    /// Transactions that reached the cluster, once per signature.
    pub sent: Mutex<Vec<VersionedTransaction>>,
    pub balance: AtomicU64,
    pub fee: AtomicU64,
    /// Sends failing with a transport error before one goes through.
    pub transport_failures: AtomicU32,
    /// Sends that reach the cluster but answer with a transport error.
    pub lost_acks: AtomicU32,
    /// Confirmations failing with a transport error after the send went through.
    pub confirm_failures: AtomicU32,
    /// Sent transactions never confirm.
    pub unconfirmed: AtomicBool,
    pub reject: AtomicBool,
    blockhashes: AtomicU8,
    slot: AtomicU64,
}

fn take_one(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

fn transport(message: &str) -> SolanaChainProviderError {
    SolanaChainProviderError::Transport(Box::new(ClientErrorKind::Custom(message.to_string())))
}

impl MockProvider {
    pub fn new() -> Self {
        let mint = random_pubkey();
        let mut data = vec![0u8; spl_token::state::Mint::LEN];
        let state = spl_token::state::Mint {
            mint_authority: COption::None,
            supply: 1_000_000_000_000,
            decimals: 6,
            is_initialized: true,
            freeze_authority: COption::None,
        };
        spl_token::state::Mint::pack(state, &mut data).unwrap();
        let mut accounts = HashMap::new();
        accounts.insert(
            mint,
            Account {
                lamports: 1_461_600,
                data,
                owner: spl_token::id(),
                executable: false,
                rent_epoch: 0,
            },
        );
        Self {
            keypair: Keypair::new(),
            mint,
            accounts: Mutex::new(accounts),
            statuses: Mutex::new(HashMap::new()),
            sent: Mutex::new(Vec::new()),
            balance: AtomicU64::new(1_000_000_000),
            fee: AtomicU64::new(5_000),
            transport_failures: AtomicU32::new(0),
            lost_acks: AtomicU32::new(0),
            confirm_failures: AtomicU32::new(0),
            unconfirmed: AtomicBool::new(false),
            reject: AtomicBool::new(false),
            blockhashes: AtomicU8::new(1),
            slot: AtomicU64::new(1_000),
        }
    }

    pub fn mint(&self) -> Pubkey {
        self.mint
    }

    /// Registers `owner`'s token account for the mock mint.
    pub fn add_token_account(&self, owner: &Pubkey) {
        let ata = associated_token_address(owner, &spl_token::id(), &self.mint);
        self.accounts.lock().unwrap().insert(
            ata,
            Account {
                lamports: 2_039_280,
                data: vec![0u8; spl_token::state::Account::LEN],
                owner: spl_token::id(),
                executable: false,
                rent_epoch: 0,
            },
        );
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }

    pub fn last_sent(&self) -> Option<VersionedTransaction> {
        self.sent.lock().unwrap().last().cloned()
    }

    pub fn blockhashes_fetched(&self) -> u8 {
        self.blockhashes.load(Ordering::SeqCst) - 1
    }

    /// Lands `tx` unless a transaction with the same signature already did.
    fn land(&self, tx: &VersionedTransaction) -> Signature {
        let signature = tx.signatures.first().copied().unwrap_or_default();
        let mut sent = self.sent.lock().unwrap();
        if sent.iter().any(|t| t.signatures.first() == Some(&signature)) {
            return signature;
        }
        sent.push(tx.clone());
        if !self.unconfirmed.load(Ordering::SeqCst) {
            let slot = self.slot.fetch_add(1, Ordering::SeqCst);
            self.statuses.lock().unwrap().insert(
                signature,
                SignatureStatus {
                    slot,
                    confirmations: Some(1),
                    error: None,
                },
            );
        }
        signature
    }
}

impl SolanaChainProviderLike for MockProvider {
    fn pubkey(&self) -> Pubkey {
        self.keypair.pubkey()
    }

    async fn get_multiple_accounts(
        &self,
        pubkeys: &[Pubkey],
    ) -> Result<Vec<Option<Account>>, SolanaChainProviderError> {
        let accounts = self.accounts.lock().unwrap();
        Ok(pubkeys.iter().map(|k| accounts.get(k).cloned()).collect())
    }

    async fn get_balance(&self, _pubkey: &Pubkey) -> Result<u64, SolanaChainProviderError> {
        Ok(self.balance.load(Ordering::SeqCst))
    }

    async fn get_latest_blockhash(&self) -> Result<Hash, SolanaChainProviderError> {
        let n = self.blockhashes.fetch_add(1, Ordering::SeqCst);
        Ok(Hash::new_from_array([n; 32]))
    }

    async fn get_fee_for_message(&self, _message: &MessageV0) -> Result<u64, SolanaChainProviderError> {
        Ok(self.fee.load(Ordering::SeqCst))
    }

    async fn get_signature_status(
        &self,
        signature: &Signature,
    ) -> Result<Option<SignatureStatus>, SolanaChainProviderError> {
        Ok(self.statuses.lock().unwrap().get(signature).cloned())
    }

    fn sign(
        &self,
        tx: VersionedTransaction,
    ) -> Result<VersionedTransaction, SolanaChainProviderError> {
        sign_at_signer_index(tx, &self.keypair)
    }

    async fn send_transaction(
        &self,
        tx: &VersionedTransaction,
    ) -> Result<Signature, SolanaChainProviderError> {
        if take_one(&self.transport_failures) {
            return Err(transport("connection reset"));
        }
        if self.reject.load(Ordering::SeqCst) {
            return Err(SolanaChainProviderError::Rejected(
                "insufficient funds".to_string(),
            ));
        }
        let signature = self.land(tx);
        if take_one(&self.lost_acks) {
            return Err(transport("response lost"));
        }
        Ok(signature)
    }

    async fn confirm_transaction(
        &self,
        signature: &Signature,
    ) -> Result<Confirmation, SolanaChainProviderError> {
        if take_one(&self.confirm_failures) {
            return Err(transport("status poll failed"));
        }
        match self.statuses.lock().unwrap().get(signature) {
            Some(status) => Ok(Confirmation {
                signature: *signature,
                slot: status.slot,
            }),
            None => Err(SolanaChainProviderError::Timeout(Duration::from_secs(10))),
        }
    }
}
