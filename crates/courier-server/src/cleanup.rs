//! Background maintenance: stale connection sweeps and orphaned file reclaim.
//!
//! Both jobs are best-effort. Delivery and storage stay correct if they never
//! run; they only bound memory and disk use.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

use crate::config::ServerConfig;
use crate::connections::ConnectionRegistry;
use crate::content_store::ContentStore;

#[derive(Debug, Clone, Copy)]
pub struct CleanupSettings {
    pub stale_after: Duration,
    pub sweep_interval: Duration,
    pub reclaim_interval: Duration,
    pub reclaim_grace: Duration,
}

impl From<&ServerConfig> for CleanupSettings {
    fn from(config: &ServerConfig) -> Self {
        Self {
            stale_after: config.stale_after,
            sweep_interval: config.connection_sweep_interval,
            reclaim_interval: config.reclaim_interval,
            reclaim_grace: config.reclaim_grace,
        }
    }
}

pub struct CleanupScheduler {
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl CleanupScheduler {
    pub fn spawn(
        registry: Arc<ConnectionRegistry>,
        content: Arc<ContentStore>,
        settings: CleanupSettings,
    ) -> Self {
        let (shutdown, rx) = watch::channel(false);

        let sweeper = spawn_periodic("connection-sweep", settings.sweep_interval, rx.clone(), move || {
            let registry = registry.clone();
            async move {
                registry.sweep_stale(settings.stale_after).await;
            }
        });

        let reclaimer = spawn_periodic("file-reclaim", settings.reclaim_interval, rx, move || {
            let content = content.clone();
            async move {
                if let Err(e) = content.reclaim(settings.reclaim_grace).await {
                    error!(error = %e, "File reclaim run failed");
                }
            }
        });

        info!(
            sweep_every = ?settings.sweep_interval,
            reclaim_every = ?settings.reclaim_interval,
            "Cleanup scheduler started"
        );

        Self {
            shutdown,
            tasks: vec![sweeper, reclaimer],
        }
    }

    /// Stop both jobs and wait for them. A run already in progress finishes
    /// first.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for task in self.tasks {
            if let Err(e) = task.await {
                error!(error = %e, "Cleanup task panicked");
            }
        }
        info!("Cleanup scheduler stopped");
    }
}

fn spawn_periodic<F, Fut>(
    name: &'static str,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
    mut job: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => job().await,
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        debug!(task = name, "Cleanup task stopped");
    })
}
