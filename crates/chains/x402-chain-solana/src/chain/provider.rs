use solana_account::Account;
use solana_client::client_error::{ClientError, ClientErrorKind};
use solana_client::nonblocking::rpc_client::RpcClient;
use solana_client::rpc_config::RpcSendTransactionConfig;
use solana_commitment_config::CommitmentConfig;
use solana_keypair::Keypair;
use solana_message::Hash;
use solana_message::v0::Message as MessageV0;
use solana_pubkey::Pubkey;
use solana_signature::Signature;
use solana_signer::{Signer, SignerError};
use solana_transaction::versioned::VersionedTransaction;
use std::fmt::{Debug, Formatter};
use std::sync::Arc;
use std::time::Duration;

use crate::chain::Address;
use crate::chain::config::SolanaChainConfig;

/// Errors that can occur when interacting with a Solana chain provider.
#[derive(thiserror::Error, Debug)]
pub enum SolanaChainProviderError {
    #[error(transparent)]
    Signer(#[from] SignerError),
    /// The cluster processed the transaction and it failed.
    #[error("Transaction rejected: {0}")]
    Rejected(String),
    /// RPC transport error. The only kind worth retrying.
    #[error(transparent)]
    Transport(Box<ClientErrorKind>),
    #[error("Timed out after {0:?} waiting for the cluster")]
    Timeout(Duration),
    #[error("{0}")]
    Custom(String),
}

impl SolanaChainProviderError {
    pub fn is_transport(&self) -> bool {
        matches!(self, SolanaChainProviderError::Transport(_))
    }
}

impl From<ClientError> for SolanaChainProviderError {
    fn from(value: ClientError) -> Self {
        SolanaChainProviderError::Transport(value.kind)
    }
}

/// A confirmed transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Confirmation {
    pub signature: Signature,
    pub slot: u64,
}

/// Cluster view of a submitted transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureStatus {
    pub slot: u64,
    /// `None` once the transaction is rooted.
    pub confirmations: Option<usize>,
    pub error: Option<String>,
}

/// Provider for interacting with a Solana cluster as the facilitator.
///
/// Holds the facilitator keypair (fee payer and SPL delegate) and an RPC client
/// whose every request is bounded by the configured timeout. Confirmation is
/// polled every 200ms under the same bound.
pub struct SolanaChainProvider {
    keypair: Arc<Keypair>,
    rpc_client: Arc<RpcClient>,
    commitment: CommitmentConfig,
    timeout: Duration,
}

impl Debug for SolanaChainProvider {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SolanaChainProvider")
            .field("pubkey", &self.keypair.pubkey())
            .field("rpc_url", &self.rpc_client.url())
            .field("commitment", &self.commitment)
            .finish()
    }
}

impl SolanaChainProvider {
    pub fn new(
        keypair: Keypair,
        rpc_url: String,
        commitment: CommitmentConfig,
        timeout: Duration,
    ) -> Self {
        tracing::info!(
            rpc = rpc_url,
            signer = %keypair.pubkey(),
            commitment = ?commitment.commitment,
            timeout = ?timeout,
            "Using Solana provider"
        );
        let rpc_client = RpcClient::new_with_timeout_and_commitment(rpc_url, timeout, commitment);
        Self {
            keypair: Arc::new(keypair),
            rpc_client: Arc::new(rpc_client),
            commitment,
            timeout,
        }
    }

    /// Builds a provider when the configuration carries a signer, `None` otherwise.
    pub fn from_config(config: &SolanaChainConfig) -> Result<Option<Self>, SolanaChainProviderError> {
        let Some(key) = config.signer() else {
            return Ok(None);
        };
        let keypair = key.keypair().map_err(SolanaChainProviderError::Custom)?;
        Ok(Some(Self::new(
            keypair,
            config.rpc_url(),
            config.commitment.into(),
            config.rpc_timeout(),
        )))
    }

    pub fn rpc_client(&self) -> Arc<RpcClient> {
        Arc::clone(&self.rpc_client)
    }
}

const POLL_INTERVAL: Duration = Duration::from_millis(200);

/// One look at a sent transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Polled {
    Pending,
    Confirmed { slot: u64 },
    Failed(String),
}

/// Polls `fetch` until the transaction is confirmed or the cluster reports it failed.
///
/// A failed poll does not end the wait: the transaction is already out, and only the
/// caller's timeout decides when to stop looking for it.
async fn poll_until_final<F, Fut>(
    signature: &Signature,
    interval: Duration,
    mut fetch: F,
) -> Result<Confirmation, SolanaChainProviderError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Polled, SolanaChainProviderError>>,
{
    loop {
        match fetch().await {
            Ok(Polled::Confirmed { slot }) => {
                return Ok(Confirmation {
                    signature: *signature,
                    slot,
                });
            }
            Ok(Polled::Failed(err)) => return Err(SolanaChainProviderError::Rejected(err)),
            Ok(Polled::Pending) => {}
            Err(e) => tracing::warn!(%signature, error = %e, "Status poll failed, still waiting"),
        }
        tokio::time::sleep(interval).await;
    }
}

/// Operations the x402 Solana rail needs from a cluster.
///
/// Implemented by [`SolanaChainProvider`] against RPC, and by in-memory doubles in tests.
pub trait SolanaChainProviderLike {
    /// The facilitator's public key.
    fn pubkey(&self) -> Pubkey;

    fn fee_payer(&self) -> Address {
        Address::new(self.pubkey())
    }

    fn get_multiple_accounts(
        &self,
        pubkeys: &[Pubkey],
    ) -> impl Future<Output = Result<Vec<Option<Account>>, SolanaChainProviderError>> + Send;

    fn get_balance(
        &self,
        pubkey: &Pubkey,
    ) -> impl Future<Output = Result<u64, SolanaChainProviderError>> + Send;

    /// A fresh blockhash. Never cached: each transaction asks for its own.
    fn get_latest_blockhash(
        &self,
    ) -> impl Future<Output = Result<Hash, SolanaChainProviderError>> + Send;

    fn get_fee_for_message(
        &self,
        message: &MessageV0,
    ) -> impl Future<Output = Result<u64, SolanaChainProviderError>> + Send;

    fn get_signature_status(
        &self,
        signature: &Signature,
    ) -> impl Future<Output = Result<Option<SignatureStatus>, SolanaChainProviderError>> + Send;

    /// Places the facilitator's signature at its signer index.
    fn sign(
        &self,
        tx: VersionedTransaction,
    ) -> Result<VersionedTransaction, SolanaChainProviderError>;

    /// Sends a signed transaction without waiting for it.
    ///
    /// Resending the same signed transaction is safe: the cluster processes a
    /// signature at most once.
    fn send_transaction(
        &self,
        tx: &VersionedTransaction,
    ) -> impl Future<Output = Result<Signature, SolanaChainProviderError>> + Send;

    /// Waits until a sent transaction is confirmed at the provider's commitment,
    /// fails on the cluster, or the timeout passes.
    fn confirm_transaction(
        &self,
        signature: &Signature,
    ) -> impl Future<Output = Result<Confirmation, SolanaChainProviderError>> + Send;
}

impl SolanaChainProviderLike for SolanaChainProvider {
    fn pubkey(&self) -> Pubkey {
        self.keypair.pubkey()
    }

    async fn get_multiple_accounts(
        &self,
        pubkeys: &[Pubkey],
    ) -> Result<Vec<Option<Account>>, SolanaChainProviderError> {
        let accounts = self.rpc_client.get_multiple_accounts(pubkeys).await?;
        Ok(accounts)
    }

    async fn get_balance(&self, pubkey: &Pubkey) -> Result<u64, SolanaChainProviderError> {
        let balance = self.rpc_client.get_balance(pubkey).await?;
        Ok(balance)
    }

    async fn get_latest_blockhash(&self) -> Result<Hash, SolanaChainProviderError> {
        let hash = self.rpc_client.get_latest_blockhash().await?;
        Ok(hash)
    }

    async fn get_fee_for_message(&self, message: &MessageV0) -> Result<u64, SolanaChainProviderError> {
        let fee = self.rpc_client.get_fee_for_message(message).await?;
        Ok(fee)
    }

    async fn get_signature_status(
        &self,
        signature: &Signature,
    ) -> Result<Option<SignatureStatus>, SolanaChainProviderError> {
        let statuses = self
            .rpc_client
            .get_signature_statuses(std::slice::from_ref(signature))
            .await?;
        let status = statuses.value.into_iter().next().flatten();
        Ok(status.map(|status| SignatureStatus {
            slot: status.slot,
            confirmations: status.confirmations,
            error: status.err.as_ref().map(|e| e.to_string()),
        }))
    }

    fn sign(
        &self,
        tx: VersionedTransaction,
    ) -> Result<VersionedTransaction, SolanaChainProviderError> {
        sign_at_signer_index(tx, self.keypair.as_ref())
    }

    async fn send_transaction(
        &self,
        tx: &VersionedTransaction,
    ) -> Result<Signature, SolanaChainProviderError> {
        let signature = self
            .rpc_client
            .send_transaction_with_config(
                tx,
                RpcSendTransactionConfig {
                    preflight_commitment: Some(self.commitment.commitment),
                    max_retries: Some(0),
                    ..RpcSendTransactionConfig::default()
                },
            )
            .await?;
        tracing::debug!(%signature, "Transaction sent");
        Ok(signature)
    }

    async fn confirm_transaction(
        &self,
        signature: &Signature,
    ) -> Result<Confirmation, SolanaChainProviderError> {
        let rpc_client = &self.rpc_client;
        let commitment = self.commitment;
        let polling = poll_until_final(signature, POLL_INTERVAL, || async move {
            let statuses = rpc_client
                .get_signature_statuses(std::slice::from_ref(signature))
                .await?;
            let polled = match statuses.value.into_iter().next().flatten() {
                None => Polled::Pending,
                Some(status) => match status.err.as_ref() {
                    Some(err) => Polled::Failed(err.to_string()),
                    None if status.satisfies_commitment(commitment) => {
                        Polled::Confirmed { slot: status.slot }
                    }
                    None => Polled::Pending,
                },
            };
            Ok(polled)
        });
        tokio::time::timeout(self.timeout, polling)
            .await
            .map_err(|_| SolanaChainProviderError::Timeout(self.timeout))?
    }
}

/// Signs the message and stores the signature at the signer's position among the
/// required signers, growing the signature list if needed.
pub fn sign_at_signer_index<S: Signer + ?Sized>(
    mut tx: VersionedTransaction,
    signer: &S,
) -> Result<VersionedTransaction, SolanaChainProviderError> {
    let msg_bytes = tx.message.serialize();
    let signature = signer.try_sign_message(msg_bytes.as_slice())?;
    // Required signatures are the first N account keys
    let num_required = tx.message.header().num_required_signatures as usize;
    let static_keys = tx.message.static_account_keys();
    let pos = static_keys
        .iter()
        .take(num_required)
        .position(|k| *k == signer.pubkey())
        .ok_or_else(|| {
            SolanaChainProviderError::Custom(format!(
                "{} is not a required signer of the transaction",
                signer.pubkey()
            ))
        })?;
    if tx.signatures.len() < num_required {
        tx.signatures.resize(num_required, Signature::default());
    }
    tx.signatures[pos] = signature;
    Ok(tx)
}

impl<T: SolanaChainProviderLike> SolanaChainProviderLike for Arc<T> {
    fn pubkey(&self) -> Pubkey {
        (**self).pubkey()
    }

    fn get_multiple_accounts(
        &self,
        pubkeys: &[Pubkey],
    ) -> impl Future<Output = Result<Vec<Option<Account>>, SolanaChainProviderError>> + Send {
        (**self).get_multiple_accounts(pubkeys)
    }

    fn get_balance(
        &self,
        pubkey: &Pubkey,
    ) -> impl Future<Output = Result<u64, SolanaChainProviderError>> + Send {
        (**self).get_balance(pubkey)
    }

    fn get_latest_blockhash(
        &self,
    ) -> impl Future<Output = Result<Hash, SolanaChainProviderError>> + Send {
        (**self).get_latest_blockhash()
    }

    fn get_fee_for_message(
        &self,
        message: &MessageV0,
    ) -> impl Future<Output = Result<u64, SolanaChainProviderError>> + Send {
        (**self).get_fee_for_message(message)
    }

    fn get_signature_status(
        &self,
        signature: &Signature,
    ) -> impl Future<Output = Result<Option<SignatureStatus>, SolanaChainProviderError>> + Send {
        (**self).get_signature_status(signature)
    }

    fn sign(
        &self,
        tx: VersionedTransaction,
    ) -> Result<VersionedTransaction, SolanaChainProviderError> {
        (**self).sign(tx)
    }

    fn send_transaction(
        &self,
        tx: &VersionedTransaction,
    ) -> impl Future<Output = Result<Signature, SolanaChainProviderError>> + Send {
        (**self).send_transaction(tx)
    }

    fn confirm_transaction(
        &self,
        signature: &Signature,
    ) -> impl Future<Output = Result<Confirmation, SolanaChainProviderError>> + Send {
        (**self).confirm_transaction(signature)
    }
}
