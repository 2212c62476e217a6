//! Periodic cleanup of consumers whose releasing entity has terminated

use super::service::RestraintService;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

pub struct RestraintSweeper {
    service: Arc<RestraintService>,
    interval: Duration,
}

impl RestraintSweeper {
    pub fn new(service: Arc<RestraintService>, interval: Duration) -> Self {
        Self { service, interval }
    }

    /// Run `cleanup` every interval until `shutdown` flips to true
    pub fn spawn(self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(interval_secs = self.interval.as_secs(), "Restraint sweeper started");
            let mut ticker = tokio::time::interval(self.interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = self.service.cleanup().await {
                            error!(error = %e, "Restraint cleanup sweep failed");
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            debug!("Restraint sweeper shutting down");
                            break;
                        }
                    }
                }
            }
        })
    }
}
