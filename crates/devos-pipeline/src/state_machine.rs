//! Valid-transition table for [`PipelineState`] and the lock/store-backed
//! transition service that enforces it.

use devos_core::cache::CacheBackend;
use devos_core::lock::{Lock, LockError};
use devos_core::store::{Store, StoreError};
use devos_core::types::{PipelineContext, PipelineState, PipelineStateHistory};
use devos_events::event_bus::EventBus;
use devos_events::protocol::{DevosEvent, PipelineStateChangedPayload};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

pub const LOCK_TTL: Duration = Duration::from_secs(30);
pub const STALE_THRESHOLD: chrono::Duration = chrono::Duration::hours(2);

#[derive(Debug, thiserror::Error)]
pub enum PipelineStateError {
    #[error("invalid transition: {from} -> {to}")]
    InvalidStateTransition { from: PipelineState, to: PipelineState },
    #[error("no active pipeline context for project {0}")]
    NotFound(String),
    #[error("an active pipeline context already exists for project {0}")]
    AlreadyActive(String),
    #[error("could not acquire project lock")]
    Lock(#[from] LockError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// Returns the set of states reachable directly from `from`, per the
/// exact transition table (no skipping).
pub fn allowed_targets(from: PipelineState) -> &'static [PipelineState] {
    use PipelineState::*;
    match from {
        Idle => &[Planning, Implementing],
        Planning => &[Implementing, Failed, Paused],
        Implementing => &[Qa, Failed, Paused],
        Qa => &[Deploying, Implementing, Failed, Paused],
        Deploying => &[Complete, Failed, Paused],
        Complete => &[Idle],
        Failed => &[Idle, Planning, Implementing],
        Paused => &[Planning, Implementing, Qa, Deploying],
    }
}

pub fn can_transition(from: PipelineState, to: PipelineState) -> bool {
    allowed_targets(from).contains(&to)
}

fn project_lock_key(project_id: &str) -> String {
    format!("project-lock:{project_id}")
}

pub struct PipelineStateMachine {
    store: Arc<Store>,
    cache: Arc<dyn CacheBackend>,
    events: EventBus,
}

impl PipelineStateMachine {
    pub fn new(store: Arc<Store>, cache: Arc<dyn CacheBackend>, events: EventBus) -> Self {
        Self { store, cache, events }
    }

    /// Fails if an active context already exists for `project_id`; creates a
    /// new one in `planning`.
    pub async fn start_pipeline(
        &self,
        project_id: &str,
        workspace_id: &str,
    ) -> Result<PipelineContext, PipelineStateError> {
        if let Some(existing) = self.store.find_pipeline_context(project_id).await? {
            if !existing.current_state.is_terminal() {
                return Err(PipelineStateError::AlreadyActive(project_id.to_string()));
            }
        }

        let now = Utc::now();
        let ctx = PipelineContext {
            project_id: project_id.to_string(),
            workspace_id: workspace_id.to_string(),
            workflow_id: Uuid::new_v4(),
            current_state: PipelineState::Planning,
            previous_state: None,
            state_entered_at: now,
            active_agent_id: None,
            active_agent_type: None,
            current_story_id: None,
            retry_count: 0,
            max_retries: 3,
            metadata: serde_json::json!({}),
            created_at: now,
            updated_at: now,
        };
        self.store.save_pipeline_context(ctx.clone()).await?;
        Ok(ctx)
    }

    /// Acquires the project lock, rereads context, rejects disallowed
    /// transitions, writes the new context plus a history record, then emits
    /// `pipeline.state_changed` only after the durable commit succeeds.
    pub async fn transition(
        &self,
        project_id: &str,
        target: PipelineState,
        triggered_by: &str,
    ) -> Result<PipelineContext, PipelineStateError> {
        let lock = Lock::acquire(self.cache.clone(), &project_lock_key(project_id), LOCK_TTL).await?;

        let result = self.transition_locked(project_id, target, triggered_by).await;
        lock.release().await;
        result
    }

    async fn transition_locked(
        &self,
        project_id: &str,
        target: PipelineState,
        triggered_by: &str,
    ) -> Result<PipelineContext, PipelineStateError> {
        let mut ctx = self
            .store
            .find_pipeline_context(project_id)
            .await?
            .ok_or_else(|| PipelineStateError::NotFound(project_id.to_string()))?;

        if !can_transition(ctx.current_state, target) {
            return Err(PipelineStateError::InvalidStateTransition {
                from: ctx.current_state,
                to: target,
            });
        }

        let previous = ctx.current_state;
        let now = Utc::now();
        ctx.previous_state = Some(previous);
        ctx.current_state = target;
        ctx.state_entered_at = now;
        ctx.updated_at = now;

        self.store.save_pipeline_context(ctx.clone()).await?;
        self.store
            .append_state_history(PipelineStateHistory {
                id: Uuid::new_v4(),
                project_id: project_id.to_string(),
                workspace_id: ctx.workspace_id.clone(),
                workflow_id: ctx.workflow_id,
                previous_state: Some(previous),
                new_state: target,
                triggered_by: triggered_by.to_string(),
                agent_id: ctx.active_agent_id,
                story_id: ctx.current_story_id.clone(),
                metadata: serde_json::json!({}),
                error_message: None,
                created_at: now,
            })
            .await?;

        self.events.publish(DevosEvent::PipelineStateChanged(PipelineStateChangedPayload {
            project_id: project_id.to_string(),
            workspace_id: ctx.workspace_id.clone(),
            previous_state: Some(previous.to_string()),
            new_state: target.to_string(),
            triggered_by: triggered_by.to_string(),
            timestamp: now,
        }));

        Ok(ctx)
    }

    pub async fn pause(&self, project_id: &str) -> Result<PipelineContext, PipelineStateError> {
        self.transition(project_id, PipelineState::Paused, "pause").await
    }

    pub async fn resume(
        &self,
        project_id: &str,
        into_state: PipelineState,
    ) -> Result<PipelineContext, PipelineStateError> {
        self.transition(project_id, into_state, "resume").await
    }

    /// Scans every persisted active context; any whose `state_entered_at` is
    /// older than `stale_threshold` and not in a terminal state is moved to
    /// `failed` with `triggered_by="recovery:stale"`.
    pub async fn recover(&self) -> Result<RecoverySummary, PipelineStateError> {
        let active = self.store.list_active_pipeline_contexts().await?;
        let total = active.len();
        let mut stale = 0;
        let mut recovered = 0;

        for ctx in active {
            if ctx.current_state.is_terminal() {
                continue;
            }
            let age = Utc::now() - ctx.state_entered_at;
            if age > STALE_THRESHOLD {
                stale += 1;
                if self
                    .transition(&ctx.project_id, PipelineState::Failed, "recovery:stale")
                    .await
                    .is_ok()
                {
                    recovered += 1;
                }
            }
        }

        Ok(RecoverySummary { recovered, stale, total })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecoverySummary {
    pub recovered: usize,
    pub stale: usize,
    pub total: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use devos_core::cache::InMemoryCacheBackend;

    async fn harness() -> PipelineStateMachine {
        let store = Arc::new(Store::open_in_memory().await.unwrap());
        let cache: Arc<dyn CacheBackend> = Arc::new(InMemoryCacheBackend::new());
        PipelineStateMachine::new(store, cache, EventBus::new())
    }

    #[test]
    fn qa_to_implementing_is_the_rejection_path() {
        assert!(can_transition(PipelineState::Qa, PipelineState::Implementing));
    }

    #[test]
    fn complete_only_reenters_idle() {
        assert_eq!(allowed_targets(PipelineState::Complete), &[PipelineState::Idle]);
    }

    #[test]
    fn idle_cannot_jump_to_qa() {
        assert!(!can_transition(PipelineState::Idle, PipelineState::Qa));
    }

    #[tokio::test]
    async fn start_pipeline_rejects_duplicate_active_context() {
        let sm = harness().await;
        sm.start_pipeline("P1", "W1").await.unwrap();
        let err = sm.start_pipeline("P1", "W1").await;
        assert!(matches!(err, Err(PipelineStateError::AlreadyActive(_))));
    }

    #[tokio::test]
    async fn transition_rejects_invalid_target() {
        let sm = harness().await;
        sm.start_pipeline("P1", "W1").await.unwrap();
        let err = sm.transition("P1", PipelineState::Deploying, "test").await;
        assert!(matches!(err, Err(PipelineStateError::InvalidStateTransition { .. })));
    }

    #[tokio::test]
    async fn transition_persists_history_and_emits_event() {
        let sm = harness().await;
        sm.start_pipeline("P1", "W1").await.unwrap();
        let rx = sm.events.subscribe();
        sm.transition("P1", PipelineState::Implementing, "planner:done").await.unwrap();
        let event = rx.try_recv().unwrap();
        match event {
            DevosEvent::PipelineStateChanged(p) => assert_eq!(p.new_state, "implementing"),
            _ => panic!("wrong event"),
        }
    }

    #[tokio::test]
    async fn recover_fails_stale_non_terminal_contexts() {
        let sm = harness().await;
        let mut ctx = sm.start_pipeline("P1", "W1").await.unwrap();
        ctx.state_entered_at = Utc::now() - chrono::Duration::hours(3);
        sm.store.save_pipeline_context(ctx).await.unwrap();

        let summary = sm.recover().await.unwrap();
        assert_eq!(summary.total, 1);
        assert_eq!(summary.stale, 1);
        assert_eq!(summary.recovered, 1);

        let ctx = sm.store.find_pipeline_context("P1").await.unwrap().unwrap();
        assert_eq!(ctx.current_state, PipelineState::Failed);
    }
}
