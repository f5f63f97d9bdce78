//! Bidirectional sync service (`spec.md` §4.6.c): pushes story changes to
//! Jira, reverse-maps webhook-driven Jira changes back onto stories, detects
//! and resolves conflicts, and runs a full reconciliation pass.

use crate::adf::{convert_from_adf, convert_to_adf};
use crate::client::{find_transition, ApiClient, JiraApiError};
use async_trait::async_trait;
use chrono::Utc;
use devos_core::cache::CacheBackend;
use devos_core::lock::{Lock, LockError};
use devos_core::store::{Store, StoreError};
use devos_core::types::{ConflictDetails, JiraSyncDirection, JiraSyncItem, JiraSyncStatus, Story, StoryStatus};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

const SYNC_LOCK_TTL: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("no resource found for this sync operation")]
    NotFound,
    #[error("conflicting operation: {0}")]
    Conflict(String),
    #[error("could not acquire the sync lock for this story")]
    Locked,
    #[error("jira api error: {0}")]
    Api(#[from] JiraApiError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

impl From<LockError> for SyncError {
    fn from(_: LockError) -> Self {
        SyncError::Locked
    }
}

/// The surrounding system owns the `Story` record; the sync engine only
/// needs to read and write it through this seam.
#[async_trait]
pub trait StoryRepository: Send + Sync {
    async fn find(&self, workspace_id: &str, story_id: &str) -> Option<Story>;
    async fn save(&self, story: Story);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct FullSyncCounts {
    pub created: u32,
    pub updated: u32,
    pub conflicts: u32,
    pub errors: u32,
}

pub enum ConflictResolution {
    KeepDevos,
    KeepJira,
}

fn story_status_to_jira(status: &StoryStatus, status_mapping: &std::collections::HashMap<String, String>) -> Option<String> {
    let key = match status {
        StoryStatus::Backlog => "backlog",
        StoryStatus::InProgress => "in_progress",
        StoryStatus::Done => "done",
    };
    status_mapping.get(key).cloned()
}

fn jira_status_to_story(jira_status: &str, status_mapping: &std::collections::HashMap<String, String>) -> Option<StoryStatus> {
    status_mapping
        .iter()
        .find(|(_, v)| v.eq_ignore_ascii_case(jira_status))
        .and_then(|(k, _)| match k.as_str() {
            "backlog" => Some(StoryStatus::Backlog),
            "in_progress" => Some(StoryStatus::InProgress),
            "done" => Some(StoryStatus::Done),
            _ => None,
        })
}

pub struct SyncService {
    store: Arc<Store>,
    cache: Arc<dyn CacheBackend>,
    api: Arc<ApiClient>,
    stories: Arc<dyn StoryRepository>,
}

impl SyncService {
    pub fn new(store: Arc<Store>, cache: Arc<dyn CacheBackend>, api: Arc<ApiClient>, stories: Arc<dyn StoryRepository>) -> Self {
        Self { store, cache, api, stories }
    }

    pub async fn sync_story_to_jira(&self, workspace_id: &str, story_id: &str) -> Result<JiraSyncItem, SyncError> {
        let mut integration = self.store.find_jira_integration(workspace_id).await?.ok_or(SyncError::NotFound)?;
        if integration.sync_direction == JiraSyncDirection::JiraToDevos {
            return self
                .store
                .find_sync_item_by_story(integration.id, story_id)
                .await?
                .ok_or(SyncError::NotFound);
        }

        let lock_key = format!("jira-sync-lock:{story_id}");
        let lock = Lock::acquire(self.cache.clone(), &lock_key, SYNC_LOCK_TTL).await?;
        let result = self.sync_story_to_jira_locked(&mut integration, story_id).await;
        lock.release().await;
        result
    }

    async fn sync_story_to_jira_locked(
        &self,
        integration: &mut devos_core::types::JiraIntegration,
        story_id: &str,
    ) -> Result<JiraSyncItem, SyncError> {
        let story = self.stories.find(&integration.workspace_id, story_id).await.ok_or(SyncError::NotFound)?;
        let existing = self.store.find_sync_item_by_story(integration.id, story_id).await?;

        let outcome = match existing.clone() {
            None => self.create_jira_issue(integration, &story).await,
            Some(item) => self.update_jira_issue(integration, &story, item).await,
        };

        if let Err(SyncError::Api(err)) = &outcome {
            let message = err.to_string();
            let _ = self.store.increment_jira_error_count(&integration.workspace_id, &message).await;
            if let Some(mut item) = existing {
                item.sync_status = JiraSyncStatus::Error;
                item.error_message = Some(message);
                let _ = self.store.save_sync_item(item).await;
            }
        }
        outcome
    }

    async fn create_jira_issue(
        &self,
        integration: &mut devos_core::types::JiraIntegration,
        story: &Story,
    ) -> Result<JiraSyncItem, SyncError> {
        let project_key = integration.jira_project_key.clone().ok_or(SyncError::NotFound)?;
        let issue_type = integration.issue_type.clone().unwrap_or_else(|| "Task".to_string());
        let description = convert_to_adf(&story.description);

        let issue = self.api.create_issue(integration, &project_key, &story.title, description, &issue_type).await?;

        if let Some(target_status) = story_status_to_jira(&story.status, &integration.status_mapping) {
            if !target_status.eq_ignore_ascii_case(&issue.fields.status.name) {
                let transitions = self.api.get_transitions(integration, &issue.key).await?;
                if let Some(t) = find_transition(&transitions, &target_status) {
                    self.api.execute_transition(integration, &issue.key, &t.id).await?;
                }
            }
        }

        let now = Utc::now();
        let item = JiraSyncItem {
            id: Uuid::new_v4(),
            jira_integration_id: integration.id,
            devos_story_id: story.id.clone(),
            jira_issue_key: issue.key,
            jira_issue_id: issue.id,
            jira_issue_type: Some(issue_type),
            sync_status: JiraSyncStatus::Synced,
            sync_direction_last: Some(JiraSyncDirection::DevosToJira),
            last_synced_at: Some(now),
            last_devos_update_at: Some(now),
            last_jira_update_at: None,
            error_message: None,
            conflict_details: None,
        };
        self.store.save_sync_item(item.clone()).await?;
        Ok(item)
    }

    async fn update_jira_issue(
        &self,
        integration: &mut devos_core::types::JiraIntegration,
        story: &Story,
        mut item: JiraSyncItem,
    ) -> Result<JiraSyncItem, SyncError> {
        self.api
            .update_issue_fields(
                integration,
                &item.jira_issue_key,
                serde_json::json!({"summary": story.title, "description": convert_to_adf(&story.description)}),
            )
            .await?;

        let target_status = story_status_to_jira(&story.status, &integration.status_mapping);
        let transitions = self.api.get_transitions(integration, &item.jira_issue_key).await?;
        match target_status.as_deref().and_then(|ts| find_transition(&transitions, ts)) {
            Some(t) => {
                self.api.execute_transition(integration, &item.jira_issue_key, &t.id).await?;
                item.sync_status = JiraSyncStatus::Synced;
                item.conflict_details = None;
            }
            None => {
                item.sync_status = JiraSyncStatus::Conflict;
                item.conflict_details = Some(ConflictDetails {
                    devos_value: serde_json::json!(story.status),
                    jira_value: serde_json::json!(null),
                    conflicted_fields: vec!["status".to_string()],
                    detected_at: Utc::now(),
                });
            }
        }
        item.sync_direction_last = Some(JiraSyncDirection::DevosToJira);
        item.last_synced_at = Some(Utc::now());
        item.last_devos_update_at = Some(Utc::now());
        self.store.save_sync_item(item.clone()).await?;
        Ok(item)
    }

    pub async fn sync_jira_to_devos(
        &self,
        integration_id: Uuid,
        jira_issue_id: &str,
        changelog: &crate::types::Changelog,
    ) -> Result<Option<JiraSyncItem>, SyncError> {
        let mut integration = self
            .store
            .find_jira_integration_by_id(integration_id)
            .await?
            .ok_or(SyncError::NotFound)?;
        if integration.sync_direction == JiraSyncDirection::DevosToJira {
            return Ok(None);
        }

        let lock_key = format!("jira-sync-lock:{jira_issue_id}");
        let lock = Lock::acquire(self.cache.clone(), &lock_key, SYNC_LOCK_TTL).await?;
        let result = self.sync_jira_to_devos_locked(&mut integration, jira_issue_id, changelog).await;
        lock.release().await;
        result
    }

    async fn sync_jira_to_devos_locked(
        &self,
        integration: &mut devos_core::types::JiraIntegration,
        jira_issue_id: &str,
        changelog: &crate::types::Changelog,
    ) -> Result<Option<JiraSyncItem>, SyncError> {
        let Some(mut item) = self.store.find_sync_item_by_issue(integration.id, jira_issue_id).await? else {
            return Ok(None);
        };

        if let (Some(devos_update), Some(synced)) = (item.last_devos_update_at, item.last_synced_at) {
            if devos_update > synced {
                item.sync_status = JiraSyncStatus::Conflict;
                item.conflict_details = Some(ConflictDetails {
                    devos_value: serde_json::json!({"last_devos_update_at": devos_update}),
                    jira_value: serde_json::json!({"jira_issue_id": jira_issue_id}),
                    conflicted_fields: changelog.items.iter().map(|c| c.field.clone()).collect(),
                    detected_at: Utc::now(),
                });
                self.store.save_sync_item(item.clone()).await?;
                return Ok(Some(item));
            }
        }

        let Some(issue) = self.api.get_issue(integration, &item.jira_issue_key).await? else {
            return Ok(Some(item));
        };

        let mut story = self.stories.find(&integration.workspace_id, &item.devos_story_id).await.ok_or(SyncError::NotFound)?;
        story.title = issue.fields.summary.clone();
        if let Some(description) = &issue.fields.description {
            story.description = convert_from_adf(description);
        }
        if let Some(status) = jira_status_to_story(&issue.fields.status.name, &integration.status_mapping) {
            story.status = status;
        }
        self.stories.save(story).await;

        item.sync_status = JiraSyncStatus::Synced;
        item.sync_direction_last = Some(JiraSyncDirection::JiraToDevos);
        item.last_synced_at = Some(Utc::now());
        item.last_jira_update_at = Some(Utc::now());
        item.conflict_details = None;
        self.store.save_sync_item(item.clone()).await?;
        Ok(Some(item))
    }

    pub async fn resolve_conflict(
        &self,
        workspace_id: &str,
        sync_item: JiraSyncItem,
        resolution: ConflictResolution,
    ) -> Result<JiraSyncItem, SyncError> {
        let mut integration = self.store.find_jira_integration(workspace_id).await?.ok_or(SyncError::NotFound)?;
        let mut item = sync_item;
        match resolution {
            ConflictResolution::KeepDevos => {
                let story = self.stories.find(workspace_id, &item.devos_story_id).await.ok_or(SyncError::NotFound)?;
                item = self.update_jira_issue(&mut integration, &story, item).await?;
                item.sync_direction_last = Some(JiraSyncDirection::DevosToJira);
            }
            ConflictResolution::KeepJira => {
                let issue = self.api.get_issue(&mut integration, &item.jira_issue_key).await?.ok_or(SyncError::NotFound)?;
                let mut story = self.stories.find(workspace_id, &item.devos_story_id).await.ok_or(SyncError::NotFound)?;
                story.title = issue.fields.summary.clone();
                if let Some(description) = &issue.fields.description {
                    story.description = convert_from_adf(description);
                }
                if let Some(status) = jira_status_to_story(&issue.fields.status.name, &integration.status_mapping) {
                    story.status = status;
                }
                self.stories.save(story).await;
                item.sync_direction_last = Some(JiraSyncDirection::JiraToDevos);
            }
        }
        item.conflict_details = None;
        item.sync_status = JiraSyncStatus::Synced;
        self.store.save_sync_item(item.clone()).await?;
        Ok(item)
    }

    pub async fn link_story_to_issue(&self, workspace_id: &str, story_id: &str, jira_issue_key: &str) -> Result<JiraSyncItem, SyncError> {
        let mut integration = self.store.find_jira_integration(workspace_id).await?.ok_or(SyncError::NotFound)?;
        if self.store.find_sync_item_by_story(integration.id, story_id).await?.is_some() {
            return Err(SyncError::Conflict(format!("story {story_id} is already linked")));
        }
        if self.stories.find(workspace_id, story_id).await.is_none() {
            return Err(SyncError::NotFound);
        }
        let issue = self.api.get_issue(&mut integration, jira_issue_key).await?.ok_or(SyncError::NotFound)?;

        let now = Utc::now();
        let item = JiraSyncItem {
            id: Uuid::new_v4(),
            jira_integration_id: integration.id,
            devos_story_id: story_id.to_string(),
            jira_issue_key: issue.key,
            jira_issue_id: issue.id,
            jira_issue_type: issue.fields.issuetype.map(|t| t.name),
            sync_status: JiraSyncStatus::Pending,
            sync_direction_last: None,
            last_synced_at: None,
            last_devos_update_at: Some(now),
            last_jira_update_at: None,
            error_message: None,
            conflict_details: None,
        };
        self.store.save_sync_item(item.clone()).await?;
        Ok(item)
    }

    pub async fn full_sync(&self, workspace_id: &str) -> Result<FullSyncCounts, SyncError> {
        let integration = self.store.find_jira_integration(workspace_id).await?.ok_or(SyncError::NotFound)?;
        let items = self.store.list_sync_items(integration.id).await?;
        let mut counts = FullSyncCounts::default();
        for item in items {
            match self.sync_story_to_jira(workspace_id, &item.devos_story_id).await {
                Ok(_) => counts.updated += 1,
                Err(SyncError::Conflict(_)) => counts.conflicts += 1,
                Err(_) => counts.errors += 1,
            }
        }
        Ok(counts)
    }

    /// Retries every sync item parked in `Error` status after a prior push
    /// failed. The dead-letter state itself is just `JiraSyncStatus::Error`
    /// plus `error_message` on the item row — there is no separate queue
    /// table, since `list_sync_items` filtered by status already gives the
    /// retry set.
    pub async fn retry_dead_letters(&self, workspace_id: &str) -> Result<FullSyncCounts, SyncError> {
        let integration = self.store.find_jira_integration(workspace_id).await?.ok_or(SyncError::NotFound)?;
        let items = self.store.list_sync_items(integration.id).await?;
        let mut counts = FullSyncCounts::default();
        for item in items.into_iter().filter(|i| i.sync_status == JiraSyncStatus::Error) {
            match self.sync_story_to_jira(workspace_id, &item.devos_story_id).await {
                Ok(_) => counts.updated += 1,
                Err(SyncError::Conflict(_)) => counts.conflicts += 1,
                Err(_) => counts.errors += 1,
            }
        }
        Ok(counts)
    }

    /// Retries a single dead-lettered sync item by id, regardless of its
    /// current status — the explicit per-item counterpart to
    /// `retry_dead_letters`'s blanket sweep.
    pub async fn retry_sync_item(&self, workspace_id: &str, sync_item_id: Uuid) -> Result<JiraSyncItem, SyncError> {
        let integration = self.store.find_jira_integration(workspace_id).await?.ok_or(SyncError::NotFound)?;
        let items = self.store.list_sync_items(integration.id).await?;
        let item = items.into_iter().find(|i| i.id == sync_item_id).ok_or(SyncError::NotFound)?;
        self.sync_story_to_jira(workspace_id, &item.devos_story_id).await
    }
}
