use super::{
    errors::{StateMachineError, StateMachineResult},
    events::ExecutionEvent,
    states::ExecutionStatus,
};
use crate::execution::store::ExecutionStore;
use std::sync::Arc;
use tracing::debug;

/// Execution node state machine backed by the execution store
#[derive(Clone)]
pub struct NodeStateMachine {
    execution_id: String,
    store: Arc<dyn ExecutionStore>,
}

impl NodeStateMachine {
    pub fn new(execution_id: impl Into<String>, store: Arc<dyn ExecutionStore>) -> Self {
        Self {
            execution_id: execution_id.into(),
            store,
        }
    }

    pub fn execution_id(&self) -> &str {
        &self.execution_id
    }

    /// Get the current status of the node
    pub async fn current_state(&self) -> StateMachineResult<ExecutionStatus> {
        match self.store.get_node(&self.execution_id).await? {
            Some(node) => Ok(node.status),
            None => Err(StateMachineError::Internal(format!(
                "Execution {} not found",
                self.execution_id
            ))),
        }
    }

    /// Attempt to transition the node; the write is conditional on the status just read
    pub async fn transition(&self, event: ExecutionEvent) -> StateMachineResult<ExecutionStatus> {
        let current_state = self.current_state().await?;
        let target_state = Self::determine_target_state(current_state, &event)?;

        let applied = self
            .store
            .compare_and_set_status(&self.execution_id, current_state, target_state)
            .await?;
        if !applied {
            return Err(StateMachineError::ConcurrentModification {
                execution_id: self.execution_id.clone(),
            });
        }

        debug!(
            execution_id = %self.execution_id,
            from = %current_state,
            to = %target_state,
            event = event.event_type(),
            "Execution node transitioned"
        );
        Ok(target_state)
    }

    /// Determine the target state based on current state and event
    pub fn determine_target_state(
        current_state: ExecutionStatus,
        event: &ExecutionEvent,
    ) -> StateMachineResult<ExecutionStatus> {
        use ExecutionStatus as S;

        let target = match (current_state, event) {
            (from, _) if from.is_terminal() => {
                return Err(StateMachineError::InvalidTransition {
                    from: Some(from.to_string()),
                    to: format!("{event:?}"),
                })
            }

            (S::Queued, ExecutionEvent::Start) => S::Running,

            // Chain links suspend again from Resumed
            (S::Running | S::Resumed, ExecutionEvent::Suspend) => S::SuspendedAsync,

            (S::SuspendedAsync, ExecutionEvent::Resume) => S::Resumed,

            (S::Running | S::Resumed, ExecutionEvent::Succeed) => S::Succeeded,
            (S::Running | S::Resumed, ExecutionEvent::Skip) => S::Skipped,

            (_, ExecutionEvent::Fail(_)) => S::Failed,
            (_, ExecutionEvent::Abort) => S::Aborted,
            (S::Running | S::SuspendedAsync | S::Resumed, ExecutionEvent::Expire) => S::Expired,

            (from, _) => {
                return Err(StateMachineError::InvalidTransition {
                    from: Some(from.to_string()),
                    to: format!("{event:?}"),
                })
            }
        };

        Ok(target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::store::InMemoryExecutionStore;
    use crate::execution::types::{Ambiance, ExecutionMode, ExecutionNode};
    use serde_json::json;

    #[test]
    fn test_lifecycle_transitions() {
        use ExecutionStatus as S;
        let next = NodeStateMachine::determine_target_state;

        assert_eq!(next(S::Queued, &ExecutionEvent::Start).unwrap(), S::Running);
        assert_eq!(next(S::Running, &ExecutionEvent::Suspend).unwrap(), S::SuspendedAsync);
        assert_eq!(next(S::SuspendedAsync, &ExecutionEvent::Resume).unwrap(), S::Resumed);
        assert_eq!(next(S::Resumed, &ExecutionEvent::Suspend).unwrap(), S::SuspendedAsync);
        assert_eq!(next(S::Resumed, &ExecutionEvent::Succeed).unwrap(), S::Succeeded);
        assert_eq!(
            next(S::SuspendedAsync, &ExecutionEvent::Expire).unwrap(),
            S::Expired
        );
        assert_eq!(
            next(S::Running, &ExecutionEvent::Fail("x".into())).unwrap(),
            S::Failed
        );
    }

    #[test]
    fn test_terminal_states_are_final() {
        use ExecutionStatus as S;
        for terminal in [S::Succeeded, S::Failed, S::Aborted, S::Expired, S::Skipped] {
            for event in [
                ExecutionEvent::Start,
                ExecutionEvent::Resume,
                ExecutionEvent::Abort,
                ExecutionEvent::Fail("late".into()),
            ] {
                assert!(NodeStateMachine::determine_target_state(terminal, &event).is_err());
            }
        }
    }

    #[test]
    fn test_resume_requires_suspension() {
        assert!(NodeStateMachine::determine_target_state(
            ExecutionStatus::Running,
            &ExecutionEvent::Resume
        )
        .is_err());
        assert!(NodeStateMachine::determine_target_state(
            ExecutionStatus::Queued,
            &ExecutionEvent::Succeed
        )
        .is_err());
    }

    #[tokio::test]
    async fn test_transition_persists() {
        let store = Arc::new(InMemoryExecutionStore::new());
        store
            .insert_node(ExecutionNode::new(
                Ambiance::new("e1", "p1", "acct"),
                "noop",
                json!({}),
                json!({}),
                ExecutionMode::Async,
            ))
            .await
            .unwrap();

        let sm = NodeStateMachine::new("e1", store.clone());
        assert_eq!(
            sm.transition(ExecutionEvent::Start).await.unwrap(),
            ExecutionStatus::Running
        );
        assert_eq!(sm.current_state().await.unwrap(), ExecutionStatus::Running);
    }
}
