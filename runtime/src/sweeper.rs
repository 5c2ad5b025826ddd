//! Background cancellation of stale `PENDING` records.
//!
//! Each sweep cancels transactions and transfers that stayed `PENDING`
//! past their timeout, then trims the rate limiter and the balance cache.

use crate::config::SweeperConfig;
use crate::service::{LedgerService, ServiceResult};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// What one sweep did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Transactions cancelled
    pub transactions: usize,
    /// Transfers cancelled
    pub transfers: usize,
    /// Idle users dropped from the rate limiter
    pub rate_limiter_evictions: usize,
    /// Expired cache entries dropped
    pub cache_evictions: usize,
}

impl SweepReport {
    /// Records cancelled in total.
    #[must_use]
    pub const fn cancelled(&self) -> usize {
        self.transactions + self.transfers
    }
}

/// Periodic timeout sweeper.
pub struct TimeoutSweeper {
    service: Arc<LedgerService>,
    config: SweeperConfig,
}

impl TimeoutSweeper {
    /// Create a sweeper over `service`.
    #[must_use]
    pub const fn new(service: Arc<LedgerService>, config: SweeperConfig) -> Self {
        Self { service, config }
    }

    /// Run a single sweep.
    ///
    /// # Errors
    ///
    /// Returns the error if the pending records cannot be listed.
    pub async fn sweep_once(&self) -> ServiceResult<SweepReport> {
        let transactions = self
            .service
            .expire_pending_transactions(self.config.transaction_timeout(), self.config.batch_limit)
            .await?;
        let transfers = self
            .service
            .expire_pending_transfers(self.config.transfer_timeout(), self.config.batch_limit)
            .await?;

        let env = self.service.environment();
        let rate_limiter_evictions = env.policy.sweep_rate_limiter(env.clock.now());
        let cache_evictions = self.service.cache().cleanup_expired_cache();

        let report = SweepReport {
            transactions,
            transfers,
            rate_limiter_evictions,
            cache_evictions,
        };
        if report.cancelled() > 0 {
            tracing::info!(
                transactions = report.transactions,
                transfers = report.transfers,
                "Timed-out records cancelled"
            );
        } else {
            tracing::debug!(?report, "Sweep finished");
        }
        Ok(report)
    }

    /// Sweep every `interval_seconds` on a background task until shut down.
    #[must_use]
    pub fn spawn(self) -> SweeperHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let interval = self.config.interval();

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            tracing::info!(interval_secs = interval.as_secs(), "Timeout sweeper started");

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(err) = self.sweep_once().await {
                            tracing::warn!(error = %err, "Sweep failed");
                        }
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            tracing::info!("Timeout sweeper stopped");
        });

        SweeperHandle {
            shutdown: shutdown_tx,
            task,
        }
    }
}

/// Handle to a running [`TimeoutSweeper`].
pub struct SweeperHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SweeperHandle {
    /// Stop the sweeper and wait for the in-flight sweep to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(err) = self.task.await {
            tracing::error!(error = %err, "Timeout sweeper task failed");
        }
    }

    /// Whether the background task has exited.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}
