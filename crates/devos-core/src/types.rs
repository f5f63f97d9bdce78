//! Shared domain records from the data model: [`PipelineContext`],
//! [`PipelineStateHistory`], [`HandoffHistory`], [`Story`], [`JiraIntegration`],
//! [`JiraSyncItem`], and the BYOK [`Secret`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    Idle,
    Planning,
    Implementing,
    Qa,
    Deploying,
    Complete,
    Failed,
    Paused,
}

impl PipelineState {
    pub fn is_terminal(self) -> bool {
        matches!(self, PipelineState::Complete | PipelineState::Failed)
    }
}

impl std::fmt::Display for PipelineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PipelineState::Idle => "idle",
            PipelineState::Planning => "planning",
            PipelineState::Implementing => "implementing",
            PipelineState::Qa => "qa",
            PipelineState::Deploying => "deploying",
            PipelineState::Complete => "complete",
            PipelineState::Failed => "failed",
            PipelineState::Paused => "paused",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineContext {
    pub project_id: String,
    pub workspace_id: String,
    pub workflow_id: Uuid,
    pub current_state: PipelineState,
    pub previous_state: Option<PipelineState>,
    pub state_entered_at: DateTime<Utc>,
    pub active_agent_id: Option<Uuid>,
    pub active_agent_type: Option<String>,
    pub current_story_id: Option<String>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineStateHistory {
    pub id: Uuid,
    pub project_id: String,
    pub workspace_id: String,
    pub workflow_id: Uuid,
    pub previous_state: Option<PipelineState>,
    pub new_state: PipelineState,
    pub triggered_by: String,
    pub agent_id: Option<Uuid>,
    pub story_id: Option<String>,
    pub metadata: serde_json::Value,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentRole {
    Planner,
    Dev,
    Qa,
    Devops,
}

impl std::fmt::Display for AgentRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AgentRole::Planner => "planner",
            AgentRole::Dev => "dev",
            AgentRole::Qa => "qa",
            AgentRole::Devops => "devops",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandoffType {
    Normal,
    Rejection,
    Escalation,
    Completion,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandoffHistory {
    pub id: Uuid,
    pub workspace_id: String,
    pub story_id: String,
    pub from_agent_type: String,
    pub from_agent_id: Option<Uuid>,
    pub to_agent_type: String,
    pub to_agent_id: Option<Uuid>,
    pub from_phase: String,
    pub to_phase: String,
    pub handoff_type: HandoffType,
    pub context_summary: String,
    pub iteration_count: u32,
    pub duration_ms: u64,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoryStatus {
    Backlog,
    InProgress,
    Done,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Story {
    pub id: String,
    pub workspace_id: String,
    pub title: String,
    pub description: String,
    pub status: StoryStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JiraSyncDirection {
    DevosToJira,
    JiraToDevos,
    Bidirectional,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JiraIntegration {
    pub id: Uuid,
    pub workspace_id: String,
    pub cloud_id: Option<String>,
    pub jira_site_url: Option<String>,
    pub jira_project_key: Option<String>,
    pub jira_project_name: Option<String>,
    pub issue_type: Option<String>,
    pub sync_direction: JiraSyncDirection,
    pub status_mapping: HashMap<String, String>,
    pub field_mapping: HashMap<String, String>,
    pub access_token_encrypted: String,
    pub access_token_iv: String,
    pub refresh_token_encrypted: String,
    pub refresh_token_iv: String,
    pub token_expires_at: Option<DateTime<Utc>>,
    pub webhook_id: Option<String>,
    pub webhook_secret_encrypted: Option<String>,
    pub webhook_secret_iv: Option<String>,
    pub is_active: bool,
    pub error_count: u32,
    pub sync_count: u32,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub last_error_at: Option<DateTime<Utc>>,
    pub connected_by: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JiraSyncStatus {
    Pending,
    Synced,
    Conflict,
    Error,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConflictDetails {
    pub devos_value: serde_json::Value,
    pub jira_value: serde_json::Value,
    pub conflicted_fields: Vec<String>,
    pub detected_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JiraSyncItem {
    pub id: Uuid,
    pub jira_integration_id: Uuid,
    pub devos_story_id: String,
    pub jira_issue_key: String,
    pub jira_issue_id: String,
    pub jira_issue_type: Option<String>,
    pub sync_status: JiraSyncStatus,
    pub sync_direction_last: Option<JiraSyncDirection>,
    pub last_synced_at: Option<DateTime<Utc>>,
    pub last_devos_update_at: Option<DateTime<Utc>>,
    pub last_jira_update_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub conflict_details: Option<ConflictDetails>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecretProvider {
    Anthropic,
    Openai,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Secret {
    pub id: Uuid,
    pub workspace_id: String,
    pub key_name: String,
    pub provider: SecretProvider,
    pub encrypted_key: String,
    pub encryption_iv: String,
    pub created_by_user_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_used_at: Option<DateTime<Utc>>,
    pub is_active: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pipeline_state_serializes_snake_case() {
        let json = serde_json::to_string(&PipelineState::Implementing).unwrap();
        assert_eq!(json, "\"implementing\"");
    }

    #[test]
    fn terminal_states() {
        assert!(PipelineState::Complete.is_terminal());
        assert!(PipelineState::Failed.is_terminal());
        assert!(!PipelineState::Qa.is_terminal());
    }
}
