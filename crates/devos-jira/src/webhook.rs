//! Story listener and Jira webhook handler (`spec.md` §4.6.d).
//!
//! Both sides feed the [`crate::sync::SyncService`] but never propagate its
//! failures to their caller: the listener logs and drops, the webhook always
//! responds success regardless of what it found.

use crate::sync::SyncService;
use crate::types::WebhookEvent;
use devos_core::store::Store;
use devos_core::types::JiraSyncDirection;
use devos_events::protocol::StoryChangedPayload;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

const DEBOUNCE: Duration = Duration::from_secs(2);

/// Listens for `story.changed` and enqueues a debounced DevOS→Jira sync.
pub struct StoryListener {
    store: Arc<Store>,
    sync: Arc<SyncService>,
    debounced: dashmap::DashMap<String, JoinHandle<()>>,
}

impl StoryListener {
    pub fn new(store: Arc<Store>, sync: Arc<SyncService>) -> Arc<Self> {
        Arc::new(Self { store, sync, debounced: dashmap::DashMap::new() })
    }

    pub async fn on_story_changed(self: &Arc<Self>, event: StoryChangedPayload) {
        let integration = match self.store.find_jira_integration(&event.workspace_id).await {
            Ok(Some(i)) if i.is_active && i.sync_direction != JiraSyncDirection::JiraToDevos => i,
            _ => return,
        };
        let _ = integration;

        if let Some((_, previous)) = self.debounced.remove(&event.story_id) {
            previous.abort();
        }

        let this = self.clone();
        let workspace_id = event.workspace_id.clone();
        let story_id = event.story_id.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(DEBOUNCE).await;
            if let Err(err) = this.sync.sync_story_to_jira(&workspace_id, &story_id).await {
                tracing::warn!(%story_id, %err, "devos-to-jira sync failed");
            }
        });
        self.debounced.insert(event.story_id, handle);
    }
}

/// Handles the public `POST /integrations/jira/webhooks` endpoint's parsed
/// body. Unknown project keys and comment events are silently ignored.
pub struct JiraWebhookHandler {
    store: Arc<Store>,
    sync: Arc<SyncService>,
}

impl JiraWebhookHandler {
    pub fn new(store: Arc<Store>, sync: Arc<SyncService>) -> Self {
        Self { store, sync }
    }

    pub async fn handle(&self, event: WebhookEvent) {
        let Some(issue) = &event.issue else { return };
        let Some(project_key) = issue.key.split('-').next() else { return };
        let Ok(Some(integration)) = self.store.find_jira_integration_by_project_key(project_key).await else { return };

        match event.webhook_event.as_str() {
            "jira:issue_updated" => {
                let _ = self.sync.sync_jira_to_devos(integration.id, &issue.id, &event.changelog).await;
            }
            "jira:issue_created" if integration.sync_direction != JiraSyncDirection::DevosToJira => {
                let _ = self.sync.sync_jira_to_devos(integration.id, &issue.id, &event.changelog).await;
            }
            "jira:issue_deleted" => {
                let _ = self.store.remove_sync_item(integration.id, &issue.key).await;
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ApiClient;
    use crate::sync::StoryRepository;
    use crate::test_support::sample_integration;
    use crate::types::{Changelog, JiraIssue, JiraIssueFields, JiraStatus};
    use async_trait::async_trait;
    use devos_core::cache::{CacheBackend, InMemoryCacheBackend};
    use devos_core::config::JiraConfig;
    use devos_core::crypto::EncryptionKey;
    use devos_core::types::Story;

    struct EmptyStories;
    #[async_trait]
    impl StoryRepository for EmptyStories {
        async fn find(&self, _workspace_id: &str, _story_id: &str) -> Option<Story> {
            None
        }
        async fn save(&self, _story: Story) {}
    }

    fn jira_config() -> JiraConfig {
        JiraConfig {
            client_id: "c".into(),
            client_secret: "s".into(),
            redirect_uri: "http://localhost/cb".into(),
            webhook_url: "http://localhost/wh".into(),
        }
    }

    #[tokio::test]
    async fn webhook_ignores_unknown_project_key() {
        let cache: Arc<dyn CacheBackend> = Arc::new(InMemoryCacheBackend::new());
        let store = Arc::new(Store::open_in_memory().await.unwrap());
        let key = EncryptionKey::generate().unwrap();
        let api = Arc::new(ApiClient::new(cache.clone(), store.clone(), key, jira_config()));
        let sync = Arc::new(SyncService::new(store.clone(), cache, api, Arc::new(EmptyStories)));
        let handler = JiraWebhookHandler::new(store, sync);

        handler
            .handle(WebhookEvent {
                webhook_event: "jira:issue_updated".to_string(),
                issue: Some(JiraIssue {
                    id: "1".to_string(),
                    key: "UNKNOWN-1".to_string(),
                    fields: JiraIssueFields { summary: "x".to_string(), description: None, status: JiraStatus { name: "To Do".to_string() }, issuetype: None },
                }),
                changelog: Changelog::default(),
            })
            .await;
        // No panic, no integration found means the handler is a silent no-op.
    }

    #[tokio::test]
    async fn webhook_issue_deleted_removes_sync_item() {
        let cache: Arc<dyn CacheBackend> = Arc::new(InMemoryCacheBackend::new());
        let store = Arc::new(Store::open_in_memory().await.unwrap());
        let key = EncryptionKey::generate().unwrap();
        let api = Arc::new(ApiClient::new(cache.clone(), store.clone(), key, jira_config()));

        let mut integration = sample_integration("W1");
        integration.jira_project_key = Some("PROJ".to_string());
        store.save_jira_integration(integration.clone()).await.unwrap();
        store
            .save_sync_item(devos_core::types::JiraSyncItem {
                id: uuid::Uuid::new_v4(),
                jira_integration_id: integration.id,
                devos_story_id: "S1".to_string(),
                jira_issue_key: "PROJ-7".to_string(),
                jira_issue_id: "9001".to_string(),
                jira_issue_type: None,
                sync_status: devos_core::types::JiraSyncStatus::Synced,
                sync_direction_last: None,
                last_synced_at: None,
                last_devos_update_at: None,
                last_jira_update_at: None,
                error_message: None,
                conflict_details: None,
            })
            .await
            .unwrap();

        let sync = Arc::new(SyncService::new(store.clone(), cache, api, Arc::new(EmptyStories)));
        let handler = JiraWebhookHandler::new(store.clone(), sync);

        handler
            .handle(WebhookEvent {
                webhook_event: "jira:issue_deleted".to_string(),
                issue: Some(JiraIssue {
                    id: "9001".to_string(),
                    key: "PROJ-7".to_string(),
                    fields: JiraIssueFields { summary: "x".to_string(), description: None, status: JiraStatus { name: "Done".to_string() }, issuetype: None },
                }),
                changelog: Changelog::default(),
            })
            .await;

        assert!(store.find_sync_item_by_issue(integration.id, "9001").await.unwrap().is_none());
    }
}
