use super::types::{Notification, NotifyCallback, ProgressCallback, StaleWaiter, WaitInstance};
use super::WaitNotifyEngine;
use crate::constants::system;
use crate::error::{EngineError, EngineResult};
use crate::execution::types::{ResponseData, ResponseMap};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug)]
struct StoredResponse {
    data: ResponseData,
    received_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct WaitState {
    waits: HashMap<String, WaitInstance>,
    /// correlation id -> wait instance ids interested in it
    by_correlation: HashMap<String, Vec<String>>,
    responses: HashMap<String, StoredResponse>,
    /// correlation id -> owning execution id
    bindings: HashMap<String, String>,
    /// correlation ids whose last waiter fired or was cancelled
    completed: HashMap<String, DateTime<Utc>>,
}

impl WaitState {
    fn is_satisfied(&self, wait: &WaitInstance) -> bool {
        wait.correlation_ids
            .iter()
            .all(|id| self.responses.contains_key(id))
    }

    fn collect_responses(&self, wait: &WaitInstance) -> (ResponseMap, Vec<String>) {
        let mut responses = ResponseMap::new();
        let mut pending = Vec::new();
        for id in &wait.correlation_ids {
            match self.responses.get(id) {
                Some(response) => {
                    responses.insert(id.clone(), response.data.clone());
                }
                None => pending.push(id.clone()),
            }
        }
        (responses, pending)
    }

    /// Remove a wait and drop correlation state nobody references anymore.
    /// Dropped ids are remembered as completed so late responses are discarded.
    fn remove_wait(&mut self, wait_id: &str) -> Option<WaitInstance> {
        let wait = self.waits.remove(wait_id)?;
        let now = Utc::now();
        for id in &wait.correlation_ids {
            let now_unreferenced = match self.by_correlation.get_mut(id) {
                Some(ids) => {
                    ids.retain(|w| w != wait_id);
                    ids.is_empty()
                }
                None => true,
            };
            if now_unreferenced {
                self.by_correlation.remove(id);
                self.bindings.remove(id);
                self.responses.remove(id);
                self.completed.insert(id.clone(), now);
            }
        }
        Some(wait)
    }

    fn fire(&mut self, wait_id: &str, timed_out: bool) -> Option<Notification> {
        let wait = self.waits.get(wait_id)?;
        let (responses, pending) = self.collect_responses(wait);
        let wait = self.remove_wait(wait_id)?;
        Some(Notification::Fired {
            wait_instance_id: wait.id,
            callback: wait.callback,
            responses,
            pending,
            timed_out,
        })
    }

    /// Forget completed ids and unclaimed responses older than `cutoff`.
    /// Responses a pending waiter still needs are kept.
    fn evict_retained(&mut self, cutoff: DateTime<Utc>) -> usize {
        let before = self.responses.len() + self.completed.len();
        self.completed.retain(|_, at| *at > cutoff);

        let by_correlation = &self.by_correlation;
        self.responses
            .retain(|id, r| r.received_at > cutoff || by_correlation.contains_key(id));

        before - (self.responses.len() + self.completed.len())
    }
}

/// Wait-notify engine that keeps waiters in process memory.
///
/// Responses nobody waits for yet, and the ids of completed waiters, are kept
/// for `retention` and then evicted by [`InMemoryWaitNotifyEngine::expire_overdue`].
pub struct InMemoryWaitNotifyEngine {
    state: Mutex<WaitState>,
    sender: mpsc::UnboundedSender<Notification>,
    retention: Duration,
}

impl InMemoryWaitNotifyEngine {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Notification>) {
        Self::with_retention(Duration::from_secs(system::DEFAULT_RESPONSE_RETENTION_SECS))
    }

    pub fn with_retention(retention: Duration) -> (Self, mpsc::UnboundedReceiver<Notification>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (
            Self {
                state: Mutex::new(WaitState::default()),
                sender,
                retention,
            },
            receiver,
        )
    }

    fn publish(&self, notifications: Vec<Notification>) {
        for notification in notifications {
            if self.sender.send(notification).is_err() {
                warn!("Notification receiver dropped; notification discarded");
            }
        }
    }

    /// Fire every waiter whose timeout elapsed before `now`, with a timeout
    /// marker, then evict retained responses and completed ids past retention.
    pub fn expire_overdue(&self, now: DateTime<Utc>) -> usize {
        let retention = chrono::Duration::from_std(self.retention).unwrap_or(chrono::Duration::MAX);
        let cutoff = now.checked_sub_signed(retention).unwrap_or(DateTime::<Utc>::MIN_UTC);

        let (notifications, evicted): (Vec<Notification>, usize) = {
            let mut state = self.state.lock();
            let expired: Vec<String> = state
                .waits
                .values()
                .filter(|w| w.expires_at().is_some_and(|at| at <= now))
                .map(|w| w.id.clone())
                .collect();
            let fired = expired
                .iter()
                .filter_map(|id| state.fire(id, true))
                .collect();
            (fired, state.evict_retained(cutoff))
        };

        if evicted > 0 {
            debug!(evicted = evicted, "Evicted retained correlation state");
        }

        let count = notifications.len();
        if count > 0 {
            info!(expired = count, "Expired overdue waiters");
        }
        self.publish(notifications);
        count
    }

    /// Waiters without a timeout outstanding longer than `threshold`.
    ///
    /// These never resume on their own and are reported as stuck executions.
    pub fn stale_waiters(&self, now: DateTime<Utc>, threshold: Duration) -> Vec<StaleWaiter> {
        let threshold = chrono::Duration::from_std(threshold).unwrap_or(chrono::Duration::MAX);
        let state = self.state.lock();
        let stale: Vec<StaleWaiter> = state
            .waits
            .values()
            .filter(|w| w.timeout.is_none() && w.registered_at + threshold <= now)
            .map(|w| StaleWaiter {
                wait_instance_id: w.id.clone(),
                execution_id: w.callback.execution_id().to_string(),
                missing_correlation_ids: state.collect_responses(w).1,
                registered_at: w.registered_at,
            })
            .collect();

        for waiter in &stale {
            warn!(
                execution_id = %waiter.execution_id,
                wait_instance_id = %waiter.wait_instance_id,
                missing = ?waiter.missing_correlation_ids,
                "Stuck execution: waiter without timeout never fired"
            );
        }
        stale
    }

    pub fn pending_wait_count(&self) -> usize {
        self.state.lock().waits.len()
    }

    /// Responses held for correlation ids, claimed or not
    pub fn retained_response_count(&self) -> usize {
        self.state.lock().responses.len()
    }

    /// Periodically expire overdue waiters until `shutdown` flips to true
    pub fn spawn_timeout_sweeper(
        self: Arc<Self>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.expire_overdue(Utc::now());
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            debug!("Waiter timeout sweeper shutting down");
                            break;
                        }
                    }
                }
            }
        })
    }
}

#[async_trait]
impl WaitNotifyEngine for InMemoryWaitNotifyEngine {
    async fn wait_for_all_on(
        &self,
        callback: NotifyCallback,
        progress: Option<ProgressCallback>,
        correlation_ids: Vec<String>,
        timeout: Duration,
    ) -> EngineResult<String> {
        if correlation_ids.is_empty() {
            return Err(EngineError::ValidationError(
                "Cannot wait on an empty set of correlation ids".to_string(),
            ));
        }

        let execution_id = callback.execution_id().to_string();
        let wait = WaitInstance {
            id: Uuid::new_v4().to_string(),
            callback,
            progress,
            correlation_ids,
            timeout: (!timeout.is_zero()).then_some(timeout),
            registered_at: Utc::now(),
        };
        let wait_id = wait.id.clone();

        let notification = {
            let mut state = self.state.lock();
            for id in &wait.correlation_ids {
                if let Some(owner) = state.bindings.get(id) {
                    if owner != &execution_id {
                        return Err(EngineError::DuplicateCallback {
                            callback_id: id.clone(),
                            execution_id: owner.clone(),
                        });
                    }
                }
            }
            for id in &wait.correlation_ids {
                state.completed.remove(id);
                state.bindings.insert(id.clone(), execution_id.clone());
                state
                    .by_correlation
                    .entry(id.clone())
                    .or_default()
                    .push(wait_id.clone());
            }
            let satisfied = state.is_satisfied(&wait);
            state.waits.insert(wait_id.clone(), wait);

            // Responses may arrive before the waiter is registered
            if satisfied {
                state.fire(&wait_id, false)
            } else {
                None
            }
        };

        debug!(execution_id = %execution_id, wait_instance_id = %wait_id, "Registered waiter");
        if let Some(notification) = notification {
            self.publish(vec![notification]);
        }
        Ok(wait_id)
    }

    async fn done_with(&self, correlation_id: &str, response: ResponseData) -> EngineResult<()> {
        let notifications: Vec<Notification> = {
            let mut state = self.state.lock();
            if state.completed.contains_key(correlation_id) {
                warn!(correlation_id = %correlation_id, "Response after completion dropped");
                return Ok(());
            }
            if state.responses.contains_key(correlation_id) {
                warn!(correlation_id = %correlation_id, "Duplicate response ignored");
                return Ok(());
            }
            state.responses.insert(
                correlation_id.to_string(),
                StoredResponse {
                    data: response,
                    received_at: Utc::now(),
                },
            );

            let interested = state
                .by_correlation
                .get(correlation_id)
                .cloned()
                .unwrap_or_default();
            let satisfied: Vec<String> = interested
                .into_iter()
                .filter(|wait_id| {
                    state
                        .waits
                        .get(wait_id)
                        .is_some_and(|w| state.is_satisfied(w))
                })
                .collect();
            satisfied
                .iter()
                .filter_map(|wait_id| state.fire(wait_id, false))
                .collect()
        };

        debug!(
            correlation_id = %correlation_id,
            fired = notifications.len(),
            "Recorded callback response"
        );
        self.publish(notifications);
        Ok(())
    }

    async fn progress_on(&self, correlation_id: &str, data: Value) -> EngineResult<()> {
        let notifications: Vec<Notification> = {
            let state = self.state.lock();
            state
                .by_correlation
                .get(correlation_id)
                .into_iter()
                .flatten()
                .filter_map(|wait_id| state.waits.get(wait_id))
                .filter_map(|w| w.progress.as_ref())
                .map(|p| Notification::Progress {
                    execution_id: p.execution_id.clone(),
                    correlation_id: correlation_id.to_string(),
                    data: data.clone(),
                })
                .collect()
        };
        self.publish(notifications);
        Ok(())
    }

    async fn cancel_waits(&self, execution_id: &str) -> EngineResult<usize> {
        let mut state = self.state.lock();
        let owned: Vec<String> = state
            .waits
            .values()
            .filter(|w| w.callback.execution_id() == execution_id)
            .map(|w| w.id.clone())
            .collect();
        for wait_id in &owned {
            state.remove_wait(wait_id);
        }
        if !owned.is_empty() {
            debug!(execution_id = %execution_id, removed = owned.len(), "Cancelled waiters");
        }
        Ok(owned.len())
    }
}
