//! Handoff coordinator: decides the next agent for a completing story,
//! enforces coordination invariants via the rules engine, and maintains the
//! per-workspace handoff queue and audit trail.

use crate::dependency::StoryDependencyManager;
use crate::queue::HandoffQueue;
use crate::rules::{ActiveAgent, CoordinationRulesEngine, HandoffIntent, Severity, DEFAULT_MAX_PARALLEL_AGENTS, MAX_QA_ITERATIONS};
use chrono::Utc;
use devos_core::store::{Store, StoreError};
use devos_core::types::{HandoffHistory, HandoffType};
use devos_events::event_bus::EventBus;
use devos_events::protocol::{DevosEvent, HandoffPayload, StoryBlockedPayload, StoryProgressPayload};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandoffParams {
    pub completing_agent_type: String,
    pub story_id: String,
    pub workspace_id: String,
    pub from_agent_id: Option<Uuid>,
    pub context: serde_json::Value,
    pub qa_verdict: Option<String>,
    pub iteration_count: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HandoffResult {
    pub success: bool,
    pub queued: bool,
    pub error: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

struct ChainEntry {
    to_agent_type: &'static str,
    from_phase: &'static str,
    to_phase: &'static str,
}

fn chain_entry(completing_agent_type: &str) -> Option<ChainEntry> {
    match completing_agent_type {
        "planner" => Some(ChainEntry { to_agent_type: "dev", from_phase: "planning", to_phase: "implementing" }),
        "dev" => Some(ChainEntry { to_agent_type: "qa", from_phase: "implementing", to_phase: "qa" }),
        "qa" => Some(ChainEntry { to_agent_type: "devops", from_phase: "qa", to_phase: "deploying" }),
        "devops" => Some(ChainEntry { to_agent_type: "complete", from_phase: "deploying", to_phase: "complete" }),
        _ => None,
    }
}

#[derive(Debug, Clone)]
pub struct CoordinationStatus {
    pub blocked_stories: Vec<String>,
    pub active_agents: usize,
    pub max_agents: usize,
    pub queued_handoffs: usize,
}

pub struct HandoffCoordinator {
    store: Arc<Store>,
    events: EventBus,
    dependencies: Arc<StoryDependencyManager>,
    queue: Arc<HandoffQueue>,
    max_parallel_agents: usize,
}

impl HandoffCoordinator {
    pub fn new(
        store: Arc<Store>,
        events: EventBus,
        dependencies: Arc<StoryDependencyManager>,
        queue: Arc<HandoffQueue>,
    ) -> Self {
        Self { store, events, dependencies, queue, max_parallel_agents: DEFAULT_MAX_PARALLEL_AGENTS }
    }

    pub async fn process_handoff(
        &self,
        params: HandoffParams,
        active_agents: &[ActiveAgent],
    ) -> Result<HandoffResult, CoordinatorError> {
        let Some(entry) = chain_entry(&params.completing_agent_type) else {
            return Ok(HandoffResult {
                success: false,
                queued: false,
                error: Some("unrecognized agent type".to_string()),
            });
        };

        let blocking = self.dependencies.get_blocking_stories(&params.workspace_id, &params.story_id);
        if !blocking.is_empty() {
            self.events.publish(DevosEvent::OrchestratorStoryBlocked(StoryBlockedPayload {
                workspace_id: params.workspace_id.clone(),
                story_id: params.story_id.clone(),
                blocking_story_ids: blocking,
                timestamp: Utc::now(),
            }));
            return Ok(HandoffResult { success: false, queued: true, error: None });
        }

        let intent = HandoffIntent {
            to_agent_type: entry.to_agent_type,
            story_id: &params.story_id,
            intended_qa_agent_id: None,
            intended_dev_agent_id: params.from_agent_id,
            qa_verdict: params.qa_verdict.as_deref(),
            iteration_count: params.iteration_count,
            max_parallel_agents: self.max_parallel_agents,
        };
        let evaluation = CoordinationRulesEngine::evaluate(&intent, active_agents);

        if !evaluation.allowed {
            let only_max_parallel = evaluation
                .violations
                .iter()
                .filter(|v| v.severity == Severity::Error)
                .all(|v| v.rule == "max-parallel-agents");

            if only_max_parallel {
                self.queue.enqueue(&params.workspace_id, 5, &params).await;
                return Ok(HandoffResult { success: false, queued: true, error: None });
            }

            let message = evaluation
                .violations
                .iter()
                .filter(|v| v.severity == Severity::Error)
                .map(|v| v.message.clone())
                .collect::<Vec<_>>()
                .join("; ");
            return Ok(HandoffResult { success: false, queued: false, error: Some(message) });
        }

        let now = Utc::now();
        self.events.publish(DevosEvent::OrchestratorHandoff(HandoffPayload {
            workspace_id: params.workspace_id.clone(),
            story_id: params.story_id.clone(),
            from_agent_type: params.completing_agent_type.clone(),
            to_agent_type: entry.to_agent_type.to_string(),
            timestamp: now,
        }));
        self.events.publish(DevosEvent::OrchestratorStoryProgress(StoryProgressPayload {
            workspace_id: params.workspace_id.clone(),
            story_id: params.story_id.clone(),
            phase: entry.to_phase.to_string(),
            timestamp: now,
        }));

        let handoff_type = if entry.to_agent_type == "complete" { HandoffType::Completion } else { HandoffType::Normal };
        self.store
            .append_handoff_history(HandoffHistory {
                id: Uuid::new_v4(),
                workspace_id: params.workspace_id.clone(),
                story_id: params.story_id.clone(),
                from_agent_type: params.completing_agent_type.clone(),
                from_agent_id: params.from_agent_id,
                to_agent_type: entry.to_agent_type.to_string(),
                to_agent_id: None,
                from_phase: entry.from_phase.to_string(),
                to_phase: entry.to_phase.to_string(),
                handoff_type,
                context_summary: params.context.to_string(),
                iteration_count: params.iteration_count,
                duration_ms: 0,
                metadata: serde_json::json!({}),
                created_at: now,
            })
            .await?;

        if params.completing_agent_type == "devops" {
            self.dependencies.mark_story_complete(&params.workspace_id, &params.story_id);
        }

        Ok(HandoffResult { success: true, queued: false, error: None })
    }

    pub async fn process_qa_rejection(&self, params: HandoffParams) -> Result<HandoffResult, CoordinatorError> {
        let now = Utc::now();
        if params.iteration_count > MAX_QA_ITERATIONS {
            self.events.publish(DevosEvent::OrchestratorEscalation(HandoffPayload {
                workspace_id: params.workspace_id.clone(),
                story_id: params.story_id.clone(),
                from_agent_type: "qa".to_string(),
                to_agent_type: "user".to_string(),
                timestamp: now,
            }));
            self.store
                .append_handoff_history(HandoffHistory {
                    id: Uuid::new_v4(),
                    workspace_id: params.workspace_id.clone(),
                    story_id: params.story_id.clone(),
                    from_agent_type: "qa".to_string(),
                    from_agent_id: params.from_agent_id,
                    to_agent_type: "user".to_string(),
                    to_agent_id: None,
                    from_phase: "qa".to_string(),
                    to_phase: "paused".to_string(),
                    handoff_type: HandoffType::Escalation,
                    context_summary: params.context.to_string(),
                    iteration_count: params.iteration_count,
                    duration_ms: 0,
                    metadata: serde_json::json!({}),
                    created_at: now,
                })
                .await?;
            return Ok(HandoffResult { success: false, queued: false, error: Some("escalated".to_string()) });
        }

        self.events.publish(DevosEvent::OrchestratorQaRejection(HandoffPayload {
            workspace_id: params.workspace_id.clone(),
            story_id: params.story_id.clone(),
            from_agent_type: "qa".to_string(),
            to_agent_type: "dev".to_string(),
            timestamp: now,
        }));
        self.store
            .append_handoff_history(HandoffHistory {
                id: Uuid::new_v4(),
                workspace_id: params.workspace_id.clone(),
                story_id: params.story_id.clone(),
                from_agent_type: "qa".to_string(),
                from_agent_id: params.from_agent_id,
                to_agent_type: "dev".to_string(),
                to_agent_id: None,
                from_phase: "qa".to_string(),
                to_phase: "implementing".to_string(),
                handoff_type: HandoffType::Rejection,
                context_summary: params.context.to_string(),
                iteration_count: params.iteration_count,
                duration_ms: 0,
                metadata: serde_json::json!({}),
                created_at: now,
            })
            .await?;

        Ok(HandoffResult { success: true, queued: false, error: None })
    }

    pub async fn process_next_in_queue(&self, workspace_id: &str) -> Option<HandoffParams> {
        self.queue.peek_and_pop(workspace_id).await
    }

    pub async fn get_coordination_status(
        &self,
        workspace_id: &str,
        active_agent_count: usize,
    ) -> Result<CoordinationStatus, CoordinatorError> {
        Ok(CoordinationStatus {
            blocked_stories: self.dependencies.list_blocked_stories(workspace_id),
            active_agents: active_agent_count,
            max_agents: self.max_parallel_agents,
            queued_handoffs: self.queue.depth(workspace_id).await,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use devos_core::cache::InMemoryCacheBackend;

    async fn harness() -> HandoffCoordinator {
        let store = Arc::new(Store::open_in_memory().await.unwrap());
        let events = EventBus::new();
        let cache: Arc<dyn devos_core::cache::CacheBackend> = Arc::new(InMemoryCacheBackend::new());
        let deps = Arc::new(StoryDependencyManager::new(events.clone()));
        let queue = Arc::new(HandoffQueue::new(cache));
        HandoffCoordinator::new(store, events, deps, queue)
    }

    fn params(agent: &str, story: &str) -> HandoffParams {
        HandoffParams {
            completing_agent_type: agent.to_string(),
            story_id: story.to_string(),
            workspace_id: "W1".to_string(),
            from_agent_id: None,
            context: serde_json::json!({}),
            qa_verdict: None,
            iteration_count: 0,
        }
    }

    #[tokio::test]
    async fn unrecognized_agent_type_fails_cleanly() {
        let coord = harness().await;
        let result = coord.process_handoff(params("ghost", "S1"), &[]).await.unwrap();
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("unrecognized agent type"));
    }

    #[tokio::test]
    async fn blocked_story_returns_queued_without_enqueueing() {
        let coord = harness().await;
        coord.dependencies.add_dependency("W1", "S1", "S0").unwrap();
        let result = coord.process_handoff(params("planner", "S1"), &[]).await.unwrap();
        assert!(!result.success);
        assert!(result.queued);
        assert_eq!(coord.queue.depth("W1").await, 0);
    }

    #[tokio::test]
    async fn successful_handoff_persists_history() {
        let coord = harness().await;
        let result = coord.process_handoff(params("planner", "S1"), &[]).await.unwrap();
        assert!(result.success);
        assert_eq!(coord.store.count_handoff_history("W1").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn max_parallel_agents_enqueues_instead_of_failing() {
        let coord = harness().await;
        let active: Vec<ActiveAgent> = (0..DEFAULT_MAX_PARALLEL_AGENTS)
            .map(|i| ActiveAgent {
                agent_id: Uuid::new_v4(),
                agent_type: "dev".to_string(),
                story_id: format!("other-{i}"),
                phase: "implementing".to_string(),
            })
            .collect();
        let result = coord.process_handoff(params("planner", "S1"), &active).await.unwrap();
        assert!(result.queued);
        assert_eq!(coord.queue.depth("W1").await, 1);
    }

    #[tokio::test]
    async fn devops_completion_marks_story_complete() {
        let coord = harness().await;
        coord.dependencies.add_dependency("W1", "S2", "S1").unwrap();
        coord.process_handoff(params("devops", "S1"), &[]).await.unwrap();
        assert!(coord.dependencies.get_blocking_stories("W1", "S2").is_empty());
    }

    #[tokio::test]
    async fn qa_rejection_escalates_past_max_iterations() {
        let coord = harness().await;
        let mut p = params("qa", "S1");
        p.iteration_count = MAX_QA_ITERATIONS + 1;
        let result = coord.process_qa_rejection(p).await.unwrap();
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("escalated"));
    }

    #[tokio::test]
    async fn qa_rejection_routes_back_to_dev_under_limit() {
        let coord = harness().await;
        let result = coord.process_qa_rejection(params("qa", "S1")).await.unwrap();
        assert!(result.success);
    }

    #[tokio::test]
    async fn process_next_in_queue_returns_none_when_empty() {
        let coord = harness().await;
        assert!(coord.process_next_in_queue("W1").await.is_none());
    }
}
