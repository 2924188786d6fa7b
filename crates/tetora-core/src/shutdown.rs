//! Graceful drain
//!
//! A drain signal closes new admission; in-flight dispatches run to
//! completion or cancel at their own timeouts; once the top-level pool is
//! idle the process exits.

use crate::admission::AdmissionController;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Default drain timeout in seconds
const DEFAULT_DRAIN_TIMEOUT_SECS: u64 = 30;

/// Coordinates shutdown across the engine loops
pub struct ShutdownController {
    cancel_token: CancellationToken,
    admission: Arc<AdmissionController>,
    drain_timeout: Duration,
}

impl ShutdownController {
    /// Create a controller with the default drain timeout
    #[must_use]
    pub fn new(admission: Arc<AdmissionController>) -> Self {
        Self::with_timeout(admission, Duration::from_secs(DEFAULT_DRAIN_TIMEOUT_SECS))
    }

    /// Create a controller with a custom drain timeout
    #[must_use]
    pub fn with_timeout(admission: Arc<AdmissionController>, drain_timeout: Duration) -> Self {
        Self {
            cancel_token: CancellationToken::new(),
            admission,
            drain_timeout,
        }
    }

    /// Get a child cancellation token for a background loop
    #[must_use]
    pub fn token(&self) -> CancellationToken {
        self.cancel_token.child_token()
    }

    /// Whether shutdown has started
    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    /// Close admission, stop background loops, and wait for in-flight
    /// dispatches to finish (bounded by the drain timeout).
    pub async fn shutdown(&self) {
        info!("shutdown initiated, draining in-flight dispatches");
        self.admission.begin_drain();
        self.cancel_token.cancel();

        if self.admission.wait_idle(self.drain_timeout).await {
            info!("drain complete");
        } else {
            warn!(
                timeout_secs = self.drain_timeout.as_secs(),
                active = self.admission.active_top_level(),
                "drain timeout reached with dispatches still in flight"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConcurrencyConfig;

    #[tokio::test]
    async fn test_shutdown_closes_admission() {
        let admission = Arc::new(AdmissionController::new(ConcurrencyConfig::default()));
        let controller = ShutdownController::with_timeout(
            admission.clone(),
            Duration::from_millis(200),
        );

        assert!(!controller.is_shutting_down());
        controller.shutdown().await;
        assert!(controller.is_shutting_down());
        assert!(admission.is_draining());
        assert!(admission.admit(0, None).await.is_err());
    }

    #[tokio::test]
    async fn test_shutdown_waits_for_in_flight() {
        let admission = Arc::new(AdmissionController::new(ConcurrencyConfig {
            max_concurrent: 1,
            ..Default::default()
        }));
        let permit = admission.admit(0, None).await.unwrap();

        let controller =
            ShutdownController::with_timeout(admission.clone(), Duration::from_secs(5));
        let handle = tokio::spawn({
            let admission = admission.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                drop(permit);
                admission.active_top_level()
            }
        });

        controller.shutdown().await;
        assert_eq!(admission.active_top_level(), 0);
        handle.await.unwrap();
    }
}
