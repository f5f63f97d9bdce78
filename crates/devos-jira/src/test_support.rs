//! Shared test fixtures for the Jira sync engine's unit tests.
#![cfg(test)]

use devos_core::types::{JiraIntegration, JiraSyncDirection};
use std::collections::HashMap;
use uuid::Uuid;

pub fn sample_integration(workspace_id: &str) -> JiraIntegration {
    JiraIntegration {
        id: Uuid::new_v4(),
        workspace_id: workspace_id.to_string(),
        cloud_id: Some("cloud-1".to_string()),
        jira_site_url: Some("https://example.atlassian.net".to_string()),
        jira_project_key: None,
        jira_project_name: None,
        issue_type: Some("Task".to_string()),
        sync_direction: JiraSyncDirection::Bidirectional,
        status_mapping: HashMap::new(),
        field_mapping: HashMap::new(),
        access_token_encrypted: String::new(),
        access_token_iv: String::new(),
        refresh_token_encrypted: String::new(),
        refresh_token_iv: String::new(),
        token_expires_at: None,
        webhook_id: None,
        webhook_secret_encrypted: None,
        webhook_secret_iv: None,
        is_active: false,
        error_count: 0,
        sync_count: 0,
        last_sync_at: None,
        last_error: None,
        last_error_at: None,
        connected_by: "user-1".to_string(),
    }
}
