//! Wire event envelope for every event named in the specification's
//! external interfaces: pipeline state changes, CLI session lifecycle and
//! output, orchestrator handoff/queue/coordination events, and story
//! changes from the Jira sync engine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum DevosEvent {
    #[serde(rename = "pipeline.state_changed")]
    PipelineStateChanged(PipelineStateChangedPayload),

    #[serde(rename = "cli.session.started")]
    CliSessionStarted(CliSessionPayload),
    #[serde(rename = "cli.session.terminated")]
    CliSessionTerminated(CliSessionPayload),
    #[serde(rename = "cli.session.completed")]
    CliSessionCompleted(CliSessionPayload),
    #[serde(rename = "cli.session.failed")]
    CliSessionFailed(CliSessionPayload),
    #[serde(rename = "cli.output")]
    CliOutput(CliOutputPayload),

    #[serde(rename = "orchestrator.handoff")]
    OrchestratorHandoff(HandoffPayload),
    #[serde(rename = "orchestrator.story_progress")]
    OrchestratorStoryProgress(StoryProgressPayload),
    #[serde(rename = "orchestrator.story_blocked")]
    OrchestratorStoryBlocked(StoryBlockedPayload),
    #[serde(rename = "orchestrator.story_unblocked")]
    OrchestratorStoryUnblocked(StoryUnblockedPayload),
    #[serde(rename = "orchestrator.qa_rejection")]
    OrchestratorQaRejection(HandoffPayload),
    #[serde(rename = "orchestrator.escalation")]
    OrchestratorEscalation(HandoffPayload),

    #[serde(rename = "story.changed")]
    StoryChanged(StoryChangedPayload),

    Error(ErrorPayload),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineStateChangedPayload {
    pub project_id: String,
    pub workspace_id: String,
    pub previous_state: Option<String>,
    pub new_state: String,
    pub triggered_by: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CliSessionPayload {
    pub session_id: Uuid,
    pub workspace_id: String,
    pub project_id: String,
    pub agent_type: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CliOutputPayload {
    pub session_id: Uuid,
    pub lines: Vec<String>,
    pub line_offset: u64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandoffPayload {
    pub workspace_id: String,
    pub story_id: String,
    pub from_agent_type: String,
    pub to_agent_type: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoryProgressPayload {
    pub workspace_id: String,
    pub story_id: String,
    pub phase: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoryBlockedPayload {
    pub workspace_id: String,
    pub story_id: String,
    pub blocking_story_ids: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoryUnblockedPayload {
    pub workspace_id: String,
    pub story_id: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoryChangeType {
    Created,
    Updated,
    StatusChanged,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoryChangedPayload {
    pub workspace_id: String,
    pub story_id: String,
    pub change_type: StoryChangeType,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pipeline_state_changed_tags_as_snake_case_name() {
        let event = DevosEvent::PipelineStateChanged(PipelineStateChangedPayload {
            project_id: "P1".into(),
            workspace_id: "W1".into(),
            previous_state: Some("planning".into()),
            new_state: "implementing".into(),
            triggered_by: "agent:planner".into(),
            timestamp: Utc::now(),
        });
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "pipeline.state_changed");
        assert_eq!(json["payload"]["new_state"], "implementing");
    }

    #[test]
    fn cli_output_roundtrips() {
        let event = DevosEvent::CliOutput(CliOutputPayload {
            session_id: Uuid::new_v4(),
            lines: vec!["hello".into()],
            line_offset: 10,
            timestamp: Utc::now(),
        });
        let json = serde_json::to_string(&event).unwrap();
        let back: DevosEvent = serde_json::from_str(&json).unwrap();
        match back {
            DevosEvent::CliOutput(p) => assert_eq!(p.line_offset, 10),
            _ => panic!("wrong variant"),
        }
    }
}
