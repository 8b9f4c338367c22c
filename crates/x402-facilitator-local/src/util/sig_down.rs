//! Shutdown on SIGTERM or SIGINT.
//!
//! [`SigDown`] turns the first shutdown signal into a cancelled
//! [`CancellationToken`]. The HTTP server and the background maintenance
//! tasks each hold a clone and wind down when it fires.

use std::future::Future;
use tokio::signal::unix::{SignalKind, signal};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

pub struct SigDown {
    task_tracker: TaskTracker,
    cancellation_token: CancellationToken,
}

impl SigDown {
    /// Registers the signal handlers. Fails only if the runtime can not install them.
    pub fn try_new() -> Result<Self, std::io::Error> {
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;
        let cancellation_token = CancellationToken::new();
        let token = cancellation_token.clone();
        let task_tracker = TaskTracker::new();
        task_tracker.spawn(async move {
            let received = tokio::select! {
                _ = sigterm.recv() => "SIGTERM",
                _ = sigint.recv() => "SIGINT",
                _ = token.cancelled() => return,
            };
            tracing::info!(signal = received, "Shutdown signal received, draining");
            token.cancel();
        });
        task_tracker.close();
        Ok(Self {
            task_tracker,
            cancellation_token,
        })
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation_token.clone()
    }

    /// Resolves once shutdown starts. Suitable for `with_graceful_shutdown`.
    pub fn graceful(&self) -> impl Future<Output = ()> + Send + 'static {
        let token = self.cancellation_token.clone();
        async move { token.cancelled().await }
    }

    /// Waits for shutdown and for the signal listener to exit.
    pub async fn recv(&self) {
        self.cancellation_token.cancelled().await;
        self.task_tracker.wait().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cancelling_the_token_releases_waiters() {
        let sig_down = SigDown::try_new().unwrap();
        let graceful = sig_down.graceful();
        sig_down.cancellation_token().cancel();
        graceful.await;
        sig_down.recv().await;
    }
}
