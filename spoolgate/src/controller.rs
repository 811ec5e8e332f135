use std::sync::Arc;

use serde::Deserialize;
use spoolgate_common::{Signal, internal, logging};
use spoolgate_delivery::{DeliveryConfig, DeliveryWorker, SmtpConfig, SmtpTransport};
use spoolgate_spool::{RetentionConfig, RetentionSweeper, SpoolConfig, SpoolStore};
use tokio::{sync::broadcast, task::JoinSet};

/// Top level configuration, and the owner of everything that runs.
///
/// # Examples
///
/// ```ron
/// Spoolgate (
///     spool: (root: "/var/spool/spoolgate"),
///     delivery: (max_parallel_sends: 8),
///     retention: (sent_days: 7),
///     smtp: (host: Some("relay.internal"), from: Some("noreply@example.com")),
/// )
/// ```
#[derive(Debug, Default, Deserialize)]
pub struct Spoolgate {
    #[serde(default)]
    pub spool: SpoolConfig,
    #[serde(default)]
    pub delivery: DeliveryConfig,
    #[serde(default)]
    pub retention: RetentionConfig,
    #[serde(default)]
    pub smtp: SmtpConfig,
}

/// The background loops of a started controller.
#[derive(Debug)]
pub struct Running {
    store: SpoolStore,
    shutdown: broadcast::Sender<Signal>,
    tasks: JoinSet<&'static str>,
}

async fn wait_for_signal() -> anyhow::Result<()> {
    let mut terminate = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    tokio::select! {
        r = tokio::signal::ctrl_c() => {
            r?;
            internal!(level = INFO, "CTRL+C entered -- Enter it again to force shutdown");
        }
        _ = terminate.recv() => {
            internal!(level = INFO, "Terminate Signal received, shutting down");
        }
    };

    Ok(())
}

impl Spoolgate {
    /// Open the spool described by this configuration.
    ///
    /// # Errors
    /// Fails if the spool directories cannot be created.
    pub async fn open_store(&self) -> anyhow::Result<SpoolStore> {
        Ok(SpoolStore::open(self.spool.clone()).await?)
    }

    #[must_use]
    pub fn sweeper(&self, store: SpoolStore) -> RetentionSweeper {
        RetentionSweeper::new(self.retention.clone(), store)
    }

    /// Open the spool and spawn the delivery worker and retention sweeper.
    ///
    /// # Errors
    /// Fails if the spool cannot be opened.
    #[tracing::instrument(level = "trace", skip_all, err)]
    pub async fn start(mut self) -> anyhow::Result<Running> {
        self.smtp.apply_env_overrides(|key| std::env::var(key).ok());

        let store = self.open_store().await?;
        let stats = store.stats().await;
        internal!(
            level = INFO,
            "Spool opened at {}: {} queued, {} sent, {} failed",
            store.root().display(),
            stats.queued,
            stats.sent,
            stats.failed
        );

        if self.smtp.host.is_none() {
            tracing::warn!("No SMTP host configured, every delivery will fail");
        }

        let (shutdown, _) = broadcast::channel(64);
        let mut tasks = JoinSet::new();

        let transport = Arc::new(SmtpTransport::new(self.smtp.clone()));
        let worker = DeliveryWorker::new(store.clone(), transport, &self.delivery);
        let receiver = shutdown.subscribe();
        tasks.spawn(async move {
            worker.serve(receiver).await;
            "delivery worker"
        });

        let sweeper = self.sweeper(store.clone());
        let receiver = shutdown.subscribe();
        tasks.spawn(async move {
            sweeper.serve(receiver).await;
            "retention sweeper"
        });

        Ok(Running {
            store,
            shutdown,
            tasks,
        })
    }

    /// Run this controller, and everything it controls, until SIGINT or
    /// SIGTERM.
    ///
    /// # Errors
    /// Fails if the spool cannot be opened or the signal handlers cannot be
    /// installed.
    pub async fn run(self) -> anyhow::Result<()> {
        logging::init();
        internal!("Controller running");

        let running = self.start().await?;

        wait_for_signal().await?;
        internal!(level = INFO, "Shutting down...");

        tokio::select! {
            () = running.shutdown() => {}
            _ = tokio::signal::ctrl_c() => {
                internal!(level = WARN, "Forced shutdown");
            }
        }

        Ok(())
    }
}

impl Running {
    #[must_use]
    pub const fn store(&self) -> &SpoolStore {
        &self.store
    }

    /// Broadcast shutdown and wait for every loop to return.
    pub async fn shutdown(mut self) {
        if self.shutdown.send(Signal::Shutdown).is_err() {
            tracing::debug!("No loop was listening for shutdown");
        }

        while let Some(joined) = self.tasks.join_next().await {
            match joined {
                Ok(name) => internal!("{name} stopped"),
                Err(e) => tracing::error!("Background loop failed: {e}"),
            }
        }

        internal!(level = INFO, "Shutdown complete");
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config: Spoolgate = ron::from_str("Spoolgate()").unwrap();

        assert_eq!(
            config.spool.root(),
            std::path::Path::new("/var/spool/spoolgate")
        );
        assert_eq!(config.delivery.max_parallel_sends, 4);
        assert!(config.retention.enabled);
        assert_eq!(config.smtp.port, 25);
        assert!(config.smtp.host.is_none());
    }

    #[test]
    fn test_sections_are_read() {
        let config: Spoolgate = ron::from_str(
            r#"Spoolgate(
                spool: (root: "/srv/spool", idempotency_hours: 48),
                delivery: (max_parallel_sends: 8, poll_interval_ms: 500),
                retention: (enabled: false, sent_days: 3),
                smtp: (host: Some("relay.internal"), port: 2525, from: Some("noreply@example.com")),
            )"#,
        )
        .unwrap();

        assert_eq!(config.spool.root(), std::path::Path::new("/srv/spool"));
        assert_eq!(config.spool.idempotency_hours, 48);
        assert_eq!(config.delivery.max_parallel_sends, 8);
        assert_eq!(config.delivery.poll_interval_ms, 500);
        assert!(!config.retention.enabled);
        assert_eq!(config.retention.sent_days, 3);
        assert_eq!(config.smtp.host.as_deref(), Some("relay.internal"));
        assert_eq!(config.smtp.port, 2525);
    }

    #[test]
    fn test_system_spool_root_is_rejected() {
        let parsed = ron::from_str::<Spoolgate>(r#"Spoolgate(spool: (root: "/etc/spool"))"#);
        assert!(parsed.is_err());
    }

    #[tokio::test]
    async fn test_start_and_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let config = Spoolgate {
            spool: SpoolConfig::with_root(dir.path().join("spool")).unwrap(),
            ..Spoolgate::default()
        };

        let running = config.start().await.unwrap();
        assert!(running.store().root().join("queued").is_dir());

        tokio::time::timeout(Duration::from_secs(5), running.shutdown())
            .await
            .unwrap();
    }
}
