//! Delivery worker orchestration
//!
//! The worker polls the queue directory and works through each listing as one
//! batch: every queued job gets a task, at most `max_parallel_sends` of them
//! hold a send slot at a time, and the next poll only starts once the whole
//! batch has finished.

mod process;

use std::{sync::Arc, time::Duration};

pub use process::JobOutcome;
use serde::{Deserialize, Serialize};
use spoolgate_common::{
    Signal, internal,
    tracing::{self, debug, error, info, warn},
};
use spoolgate_spool::{JobHandle, SpoolStore};
use tokio::{
    sync::{Semaphore, broadcast, watch},
    task::JoinSet,
};

use crate::{policy::RetryPolicy, transport::MailTransport};

const MIN_POLL_INTERVAL_MS: u64 = 300;

const fn default_max_parallel_sends() -> usize {
    4
}

const fn default_poll_interval_ms() -> u64 {
    2000
}

const fn default_max_attempts() -> u32 {
    5
}

const fn default_base_retry_delay_ms() -> u64 {
    2000
}

const fn default_max_retry_delay_ms() -> u64 {
    60_000
}

/// Worker settings
///
/// # Examples
///
/// ```ron
/// delivery: (
///     max_parallel_sends: 8,
///     poll_interval_ms: 1000,
///     max_attempts: 3,
/// )
/// ```
#[derive(Debug, Clone, Deserialize)]
pub struct DeliveryConfig {
    /// Jobs delivered at the same time, at least 1
    #[serde(default = "default_max_parallel_sends")]
    pub max_parallel_sends: usize,

    /// Wait between polls of an empty queue, at least 300ms
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Attempts per job before it is failed, at least 1
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Backoff after attempt `n` is `min(max, 2^n * base)`
    #[serde(default = "default_base_retry_delay_ms")]
    pub base_retry_delay_ms: u64,

    #[serde(default = "default_max_retry_delay_ms")]
    pub max_retry_delay_ms: u64,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            max_parallel_sends: default_max_parallel_sends(),
            poll_interval_ms: default_poll_interval_ms(),
            max_attempts: default_max_attempts(),
            base_retry_delay_ms: default_base_retry_delay_ms(),
            max_retry_delay_ms: default_max_retry_delay_ms(),
        }
    }
}

impl DeliveryConfig {
    #[must_use]
    pub fn parallelism(&self) -> usize {
        self.max_parallel_sends.max(1)
    }

    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(MIN_POLL_INTERVAL_MS))
    }

    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts.max(1),
            base_delay: Duration::from_millis(self.base_retry_delay_ms),
            max_delay: Duration::from_millis(self.max_retry_delay_ms),
        }
    }
}

/// Outcome counts of one batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BatchReport {
    pub sent: usize,
    pub failed: usize,
    /// Jobs left in the queue because shutdown arrived during a backoff
    pub interrupted: usize,
    /// Jobs that disappeared before they could be read
    pub vanished: usize,
    /// Shutdown was requested while the batch ran
    pub cancelled: bool,
}

impl BatchReport {
    const fn record(&mut self, outcome: JobOutcome) {
        match outcome {
            JobOutcome::Sent => self.sent += 1,
            JobOutcome::Failed => self.failed += 1,
            JobOutcome::Interrupted => self.interrupted += 1,
            JobOutcome::Vanished => self.vanished += 1,
        }
    }
}

fn log_shutdown(signal: Result<Signal, broadcast::error::RecvError>) {
    match signal {
        Ok(Signal::Shutdown | Signal::Finalised) => {
            internal!("Delivery worker received shutdown signal");
        }
        Err(e) => {
            warn!("Delivery worker shutdown channel error: {e}");
        }
    }
}

/// Delivers queued jobs through a [`MailTransport`].
#[derive(Clone)]
pub struct DeliveryWorker {
    store: SpoolStore,
    transport: Arc<dyn MailTransport>,
    policy: RetryPolicy,
    poll_interval: Duration,
    slots: Arc<Semaphore>,
}

impl std::fmt::Debug for DeliveryWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeliveryWorker")
            .field("store", &self.store)
            .field("policy", &self.policy)
            .field("poll_interval", &self.poll_interval)
            .field("slots", &self.slots.available_permits())
            .finish_non_exhaustive()
    }
}

impl DeliveryWorker {
    #[must_use]
    pub fn new(
        store: SpoolStore,
        transport: Arc<dyn MailTransport>,
        config: &DeliveryConfig,
    ) -> Self {
        Self {
            store,
            transport,
            policy: config.retry_policy(),
            poll_interval: config.poll_interval(),
            slots: Arc::new(Semaphore::new(config.parallelism())),
        }
    }

    #[must_use]
    pub const fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run the worker until shutdown.
    ///
    /// Shutdown aborts poll sleeps, slot waits and backoff sleeps. A send that
    /// is already talking to the relay is allowed to finish, and its result
    /// still moves the job.
    #[tracing::instrument(level = "trace", skip_all)]
    pub async fn serve(&self, mut shutdown: broadcast::Receiver<Signal>) {
        internal!(
            level = INFO,
            "Delivery worker started: poll every {}ms, {} attempts, {} parallel sends",
            self.poll_interval.as_millis(),
            self.policy.max_attempts,
            self.slots.available_permits()
        );

        loop {
            let queued = match self.store.list_queued().await {
                Ok(queued) => queued,
                Err(e) => {
                    error!(error = %e, "Cannot list queued jobs");
                    Vec::new()
                }
            };

            if queued.is_empty() {
                tokio::select! {
                    () = tokio::time::sleep(self.poll_interval) => continue,
                    sig = shutdown.recv() => {
                        log_shutdown(sig);
                        break;
                    }
                }
            }

            let report = self.run_batch(&queued, &mut shutdown).await;
            if report.sent > 0 || report.failed > 0 {
                info!(
                    sent = report.sent,
                    failed = report.failed,
                    interrupted = report.interrupted,
                    "Delivery batch finished"
                );
            } else {
                debug!(?report, "Delivery batch finished");
            }

            if report.cancelled {
                break;
            }
        }

        internal!(level = INFO, "Delivery worker stopped");
    }

    /// Process `jobs` and wait for all of them.
    ///
    /// Each job waits for a send slot and keeps it through all of its
    /// attempts. Once shutdown is seen no further job is started, and jobs
    /// waiting out a backoff give up and stay queued.
    pub async fn run_batch(
        &self,
        jobs: &[JobHandle],
        shutdown: &mut broadcast::Receiver<Signal>,
    ) -> BatchReport {
        let (stop_tx, stop_rx) = watch::channel(false);
        let mut tasks = JoinSet::new();
        let mut report = BatchReport::default();

        for handle in jobs {
            let permit = tokio::select! {
                biased;
                sig = shutdown.recv() => {
                    log_shutdown(sig);
                    report.cancelled = true;
                    break;
                }
                permit = Arc::clone(&self.slots).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(e) => {
                        error!("Send slots unavailable: {e}");
                        break;
                    }
                },
            };

            let worker = self.clone();
            let handle = handle.clone();
            let stop = stop_rx.clone();
            tasks.spawn(async move {
                let _slot = permit;
                worker.deliver_job(&handle, stop).await
            });
        }

        if report.cancelled {
            let _ = stop_tx.send(true);
        }

        loop {
            tokio::select! {
                joined = tasks.join_next() => match joined {
                    None => break,
                    Some(Ok(outcome)) => report.record(outcome),
                    Some(Err(e)) => error!("Delivery task failed: {e}"),
                },
                sig = shutdown.recv(), if !report.cancelled => {
                    log_shutdown(sig);
                    report.cancelled = true;
                    let _ = stop_tx.send(true);
                }
            }
        }

        report
    }

    /// Deliver one job with retries, without a shutdown hook.
    pub async fn process_job(&self, handle: &JobHandle) -> JobOutcome {
        let (_stop_tx, stop_rx) = watch::channel(false);
        self.deliver_job(handle, stop_rx).await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults_and_floors() {
        let config: DeliveryConfig = ron::from_str("()").unwrap();
        assert_eq!(config.parallelism(), 4);
        assert_eq!(config.poll_interval(), Duration::from_secs(2));
        assert_eq!(config.retry_policy(), RetryPolicy::default());

        let config: DeliveryConfig =
            ron::from_str("(max_parallel_sends: 0, poll_interval_ms: 10, max_attempts: 0)")
                .unwrap();
        assert_eq!(config.parallelism(), 1);
        assert_eq!(config.poll_interval(), Duration::from_millis(300));
        assert_eq!(config.retry_policy().max_attempts, 1);
    }

    #[test]
    fn test_batch_report_counts() {
        let mut report = BatchReport::default();
        for outcome in [
            JobOutcome::Sent,
            JobOutcome::Sent,
            JobOutcome::Failed,
            JobOutcome::Interrupted,
            JobOutcome::Vanished,
        ] {
            report.record(outcome);
        }

        assert_eq!(
            report,
            BatchReport {
                sent: 2,
                failed: 1,
                interrupted: 1,
                vanished: 1,
                cancelled: false,
            }
        );
    }
}
