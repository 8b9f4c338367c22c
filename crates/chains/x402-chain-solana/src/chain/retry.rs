//! Bounded retry with exponential backoff for transaction submission.

use solana_transaction::versioned::VersionedTransaction;
use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;
use tracing::{debug, warn};

use crate::chain::{Confirmation, SolanaChainProviderError, SolanaChainProviderLike};

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of attempts, the first one included.
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay before the given attempt (0-indexed): `base * 2^(attempt-1)`,
    /// capped at `max_delay`, with +-25% jitter.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let multiplier = 2u32.saturating_pow(attempt - 1);
        let base = self.base_delay.saturating_mul(multiplier);
        let capped = std::cmp::min(base, self.max_delay);

        let jitter_range = capped.as_millis() as u64 / 4;
        if jitter_range == 0 {
            return capped;
        }
        let jitter = rand::random::<u64>() % (jitter_range * 2);
        let jittered_ms = (capped.as_millis() as u64)
            .saturating_sub(jitter_range)
            .saturating_add(jitter);
        Duration::from_millis(jittered_ms)
    }

    /// Runs `operation` until it succeeds, fails with a non-transport error,
    /// or runs out of attempts.
    pub async fn execute<F, Fut, T>(&self, mut operation: F) -> Result<T, SolanaChainProviderError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, SolanaChainProviderError>>,
    {
        let mut attempt = 0;
        loop {
            let delay = self.delay_for_attempt(attempt);
            if !delay.is_zero() {
                debug!(attempt, ?delay, "Retrying after delay");
                sleep(delay).await;
            }
            match operation(attempt).await {
                Ok(result) => return Ok(result),
                Err(e) if e.is_transport() && attempt + 1 < self.max_attempts => {
                    warn!(
                        attempt = attempt + 1,
                        max_attempts = self.max_attempts,
                        error = %e,
                        "Transport error, will retry"
                    );
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

impl RetryPolicy {
    /// Sends one signed transaction and waits for it to confirm.
    ///
    /// Only the send is retried, and always with the same signed bytes. When every
    /// send fails with a transport error the transaction may still have reached the
    /// cluster, so its signature is awaited before giving up. A transaction is never
    /// rebuilt once it has been handed to the cluster.
    pub async fn submit<P>(
        &self,
        provider: &P,
        tx: &VersionedTransaction,
    ) -> Result<Confirmation, SolanaChainProviderError>
    where
        P: SolanaChainProviderLike + Sync,
    {
        let signature = tx.signatures.first().copied().ok_or_else(|| {
            SolanaChainProviderError::Custom("Transaction carries no signature".to_string())
        })?;
        match self.execute(|_attempt| provider.send_transaction(tx)).await {
            Ok(_) => {}
            Err(e) if e.is_transport() => {
                warn!(%signature, error = %e, "Send failed, checking whether the transaction landed");
            }
            Err(e) => return Err(e),
        }
        provider.confirm_transaction(&signature).await
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use solana_client::client_error::ClientErrorKind;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn transport() -> SolanaChainProviderError {
        SolanaChainProviderError::Transport(Box::new(ClientErrorKind::Custom(
            "connection refused".to_string(),
        )))
    }

    #[test]
    fn delay_grows_and_is_capped() {
        let policy = RetryPolicy::new(10, Duration::from_millis(100), Duration::from_millis(500));
        assert_eq!(policy.delay_for_attempt(0), Duration::ZERO);
        let d1 = policy.delay_for_attempt(1);
        assert!(d1 >= Duration::from_millis(75) && d1 <= Duration::from_millis(125));
        let d2 = policy.delay_for_attempt(2);
        assert!(d2 >= Duration::from_millis(150) && d2 <= Duration::from_millis(250));
        let d9 = policy.delay_for_attempt(9);
        assert!(d9 >= Duration::from_millis(375) && d9 <= Duration::from_millis(625));
    }

    #[tokio::test]
    async fn retries_transport_errors_up_to_limit() {
        let policy = RetryPolicy::new(3, Duration::from_millis(5), Duration::from_millis(20));
        let attempts = Arc::new(AtomicU32::new(0));
        let result = policy
            .execute(|_| {
                let attempts = Arc::clone(&attempts);
                async move {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(transport())
                }
            })
            .await;
        assert!(matches!(result, Err(SolanaChainProviderError::Transport(_))));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn succeeds_after_transient_failure() {
        let policy = RetryPolicy::new(3, Duration::from_millis(5), Duration::from_millis(20));
        let result = policy
            .execute(|attempt| async move {
                if attempt == 0 {
                    Err(transport())
                } else {
                    Ok(attempt)
                }
            })
            .await;
        assert_eq!(result.unwrap(), 1);
    }

    #[tokio::test]
    async fn rejections_are_not_retried() {
        let policy = RetryPolicy::default();
        let attempts = Arc::new(AtomicU32::new(0));
        let result = policy
            .execute(|_| {
                let attempts = Arc::clone(&attempts);
                async move {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(SolanaChainProviderError::Rejected("insufficient funds".into()))
                }
            })
            .await;
        assert!(matches!(result, Err(SolanaChainProviderError::Rejected(_))));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }
}
