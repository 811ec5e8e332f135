//! The attempt loop for a single job

use spoolgate_common::tracing::{self, error, info, warn};
use spoolgate_spool::{JobHandle, SpoolError};
use tokio::sync::watch;

use super::DeliveryWorker;
use crate::{
    error::{DeliveryError, SystemError},
    transport::OutgoingMail,
};

/// What became of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    /// Delivered, marked in the idempotency index and moved to `sent`
    Sent,
    /// Moved to `failed`
    Failed,
    /// Still queued: shutdown arrived during a backoff
    Interrupted,
    /// The file was gone before it could be read
    Vanished,
}

/// Resolves once the batch is told to stop. A dropped sender never stops it.
async fn stopped(mut stop: watch::Receiver<bool>) {
    let closed = stop.wait_for(|stop| *stop).await.is_err();
    if closed {
        std::future::pending::<()>().await;
    }
}

impl DeliveryWorker {
    async fn fail(&self, handle: &JobHandle) {
        if let Err(e) = self.store.move_to_failed(handle).await {
            error!(job = %handle, error = %e, "Cannot move job to failed, it stays queued");
        }
    }

    #[tracing::instrument(level = "debug", skip_all, fields(job = %handle))]
    pub(super) async fn deliver_job(
        &self,
        handle: &JobHandle,
        stop: watch::Receiver<bool>,
    ) -> JobOutcome {
        let job = match self.store.read(handle).await {
            Ok(job) => job,
            Err(SpoolError::NotFound(_)) => {
                warn!(job = %handle, "Job disappeared before delivery");
                return JobOutcome::Vanished;
            }
            Err(e) => {
                warn!(job = %handle, error = %e, "Unreadable job, moving to failed");
                self.fail(handle).await;
                return JobOutcome::Failed;
            }
        };

        let request_id = job.resolved_request_id();
        let mail = OutgoingMail::from_job(&job);
        let max_attempts = self.policy.max_attempts;
        let mut attempt = 0;

        loop {
            attempt += 1;

            let error = match self.transport.deliver(&mail).await {
                // The marker must exist before the job shows up in `sent`.
                // Without it the job stays queued and is sent again.
                Ok(()) => match self.store.mark_delivered(&request_id).await {
                    Ok(()) => {
                        match self.store.move_to_sent(handle).await {
                            Ok(_) => {
                                info!(job = %handle, request_id = %request_id, attempt, "Delivered");
                            }
                            Err(e) => {
                                error!(job = %handle, error = %e, "Delivered, but cannot move job to sent");
                            }
                        }

                        return JobOutcome::Sent;
                    }
                    Err(e) => {
                        error!(job = %handle, request_id = %request_id, error = %e, "Delivered, but cannot write idempotency marker");
                        DeliveryError::from(SystemError::Internal(format!(
                            "idempotency marker not written: {e}"
                        )))
                    }
                },
                Err(e) => e,
            };

            if !error.is_retryable() {
                warn!(job = %handle, request_id = %request_id, error = %error, "Permanent failure, moving to failed");
                self.fail(handle).await;
                return JobOutcome::Failed;
            }

            warn!(
                job = %handle,
                request_id = %request_id,
                attempt,
                max_attempts,
                error = %error,
                "Delivery attempt failed"
            );

            if !self.policy.should_retry(attempt) {
                self.fail(handle).await;
                return JobOutcome::Failed;
            }

            tokio::select! {
                biased;
                () = stopped(stop.clone()) => {
                    info!(job = %handle, attempt, "Shutdown during backoff, job stays queued");
                    return JobOutcome::Interrupted;
                }
                () = tokio::time::sleep(self.policy.backoff(attempt)) => {}
            }
        }
    }
}
