//! # Notification Worker
//!
//! Drains the wait-notify channel and routes each notification to the
//! strategy engine. Aggregate waiters resume the node, per-id waiters feed the
//! single-callback hook, and expired waiters resume with timeout markers for
//! the ids that never reported.

use super::strategy::ExecutionStrategyEngine;
use super::types::{ResponseData, ResumeOutcome};
use crate::waiter::{Notification, NotifyCallback};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

pub struct NotificationWorker {
    engine: Arc<ExecutionStrategyEngine>,
    receiver: mpsc::UnboundedReceiver<Notification>,
}

impl NotificationWorker {
    pub fn new(
        engine: Arc<ExecutionStrategyEngine>,
        receiver: mpsc::UnboundedReceiver<Notification>,
    ) -> Self {
        Self { engine, receiver }
    }

    /// Route one notification
    pub async fn handle(&self, notification: Notification) {
        match notification {
            Notification::Fired {
                callback: NotifyCallback::Resume { execution_id },
                mut responses,
                pending,
                timed_out,
                ..
            } => {
                if timed_out {
                    for callback_id in pending {
                        responses.insert(callback_id, ResponseData::Timeout);
                    }
                }
                match self.engine.resume(&execution_id, responses).await {
                    Ok(ResumeOutcome::Ignored { reason }) => {
                        debug!(execution_id = %execution_id, reason = %reason, "Notification ignored");
                    }
                    Ok(_) => {}
                    Err(e) => {
                        error!(execution_id = %execution_id, error = %e, "Resume failed");
                    }
                }
            }
            Notification::Fired {
                callback:
                    NotifyCallback::SingleCallback {
                        execution_id,
                        callback_id,
                    },
                responses,
                ..
            } => {
                if let Some(response) = responses.get(&callback_id) {
                    self.engine
                        .deliver_single_callback(&execution_id, &callback_id, response)
                        .await;
                }
            }
            Notification::Progress {
                execution_id, data, ..
            } => {
                self.engine.progress(&execution_id, &data).await;
            }
        }
    }

    /// Process everything already queued without waiting; returns the count
    pub async fn drain_pending(&mut self) -> usize {
        let mut processed = 0;
        while let Ok(notification) = self.receiver.try_recv() {
            self.handle(notification).await;
            processed += 1;
        }
        processed
    }

    /// Run until the channel closes or `shutdown` flips to true
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!("Notification worker started");
        loop {
            tokio::select! {
                notification = self.receiver.recv() => match notification {
                    Some(notification) => self.handle(notification).await,
                    None => break,
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("Notification worker stopped");
    }

    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }
}
