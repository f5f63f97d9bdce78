//! Jira OAuth 2.0 (3LO) flow (`spec.md` §4.6.b): authorize, callback, setup
//! completion, and disconnect.

use crate::client::ApiClient;
use devos_core::cache::CacheBackend;
use devos_core::config::JiraConfig;
use devos_core::crypto::{encrypt_parts, CryptoError};
use devos_core::store::{Store, StoreError};
use devos_core::types::{JiraIntegration, JiraSyncDirection};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

const STATE_TTL: Duration = Duration::from_secs(600);
const OAUTH_SCOPES: &str = "read:jira-work write:jira-work manage:jira-webhook offline_access";

#[derive(Debug, thiserror::Error)]
pub enum OAuthError {
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("oauth state is missing or expired")]
    InvalidState,
    #[error("this workspace already has a Jira integration")]
    Conflict,
    #[error("no Jira integration configured for this workspace")]
    NotFound,
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("jira api error: {0}")]
    Api(#[from] crate::client::JiraApiError),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct OAuthStateEntry {
    workspace_id: String,
    user_id: Uuid,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expires_in: Option<u64>,
}

pub struct OAuthService {
    cache: Arc<dyn CacheBackend>,
    store: Arc<Store>,
    api: Arc<ApiClient>,
    key: devos_core::crypto::EncryptionKey,
    config: JiraConfig,
    http: reqwest::Client,
}

fn oauth_state_key(state: &str) -> String {
    format!("jira-oauth:{state}")
}

impl OAuthService {
    pub fn new(
        cache: Arc<dyn CacheBackend>,
        store: Arc<Store>,
        api: Arc<ApiClient>,
        key: devos_core::crypto::EncryptionKey,
        config: JiraConfig,
    ) -> Self {
        Self { cache, store, api, key, config, http: reqwest::Client::new() }
    }

    /// Generates a single-use CSRF state token and the Atlassian 3LO
    /// authorize URL. The state is stored for 600s so `callback` can verify it.
    pub async fn authorization_url(&self, workspace_id: &str, user_id: Uuid) -> String {
        let state = format!("{}{}", Uuid::new_v4().simple(), Uuid::new_v4().simple());
        let entry = OAuthStateEntry { workspace_id: workspace_id.to_string(), user_id };
        let json = serde_json::to_string(&entry).expect("OAuthStateEntry always serializes");
        self.cache.set(&oauth_state_key(&state), &json, Some(STATE_TTL)).await;

        format!(
            "https://auth.atlassian.com/authorize\
             ?audience=api.atlassian.com\
             &client_id={client_id}\
             &scope={scope}\
             &redirect_uri={redirect_uri}\
             &state={state}\
             &response_type=code\
             &prompt=consent",
            client_id = urlencoding::encode(&self.config.client_id),
            scope = urlencoding::encode(OAUTH_SCOPES),
            redirect_uri = urlencoding::encode(&self.config.redirect_uri),
            state = state,
        )
    }

    /// Exchanges the callback `code`, creates an inactive integration, and
    /// returns the workspace id plus the sites the user can connect.
    pub async fn callback(&self, code: &str, state: &str) -> Result<(String, Vec<crate::types::AccessibleResource>), OAuthError> {
        let raw = self.cache.get(&oauth_state_key(state)).await.ok_or(OAuthError::InvalidState)?;
        self.cache.del(&oauth_state_key(state)).await;
        let entry: OAuthStateEntry = serde_json::from_str(&raw).map_err(|_| OAuthError::InvalidState)?;

        if self.store.find_jira_integration(&entry.workspace_id).await?.is_some() {
            return Err(OAuthError::Conflict);
        }

        let token: TokenResponse = self
            .http
            .post("https://auth.atlassian.com/oauth/token")
            .json(&serde_json::json!({
                "grant_type": "authorization_code",
                "client_id": self.config.client_id,
                "client_secret": self.config.client_secret,
                "code": code,
                "redirect_uri": self.config.redirect_uri,
            }))
            .send()
            .await?
            .json()
            .await?;

        let (access_iv, access_ct) = encrypt_parts(&self.key, &token.access_token)?;
        let refresh_token = token.refresh_token.clone().unwrap_or_default();
        let (refresh_iv, refresh_ct) = encrypt_parts(&self.key, &refresh_token)?;

        let integration = JiraIntegration {
            id: Uuid::new_v4(),
            workspace_id: entry.workspace_id.clone(),
            cloud_id: None,
            jira_site_url: None,
            jira_project_key: None,
            jira_project_name: None,
            issue_type: None,
            sync_direction: JiraSyncDirection::Bidirectional,
            status_mapping: HashMap::new(),
            field_mapping: HashMap::new(),
            access_token_encrypted: access_ct,
            access_token_iv: access_iv,
            refresh_token_encrypted: refresh_ct,
            refresh_token_iv: refresh_iv,
            token_expires_at: token.expires_in.map(|s| chrono::Utc::now() + chrono::Duration::seconds(s as i64)),
            webhook_id: None,
            webhook_secret_encrypted: None,
            webhook_secret_iv: None,
            is_active: false,
            error_count: 0,
            sync_count: 0,
            last_sync_at: None,
            last_error: None,
            last_error_at: None,
            connected_by: entry.user_id.to_string(),
        };
        self.store.save_jira_integration(integration).await?;

        let resources = self.api.accessible_resources(&token.access_token).await?;
        Ok((entry.workspace_id, resources))
    }

    /// Binds the chosen site/project, registers a webhook best-effort, and
    /// activates the integration.
    #[allow(clippy::too_many_arguments)]
    pub async fn complete_setup(
        &self,
        workspace_id: &str,
        cloud_id: &str,
        site_url: &str,
        project_key: &str,
        project_name: Option<&str>,
        issue_type: &str,
        sync_direction: JiraSyncDirection,
        status_mapping: HashMap<String, String>,
        field_mapping: HashMap<String, String>,
        webhook_url: &str,
    ) -> Result<(), OAuthError> {
        let mut integration = self.store.find_jira_integration(workspace_id).await?.ok_or(OAuthError::NotFound)?;

        integration.cloud_id = Some(cloud_id.to_string());
        integration.jira_site_url = Some(site_url.to_string());
        integration.jira_project_key = Some(project_key.to_string());
        integration.jira_project_name = project_name.map(str::to_string);
        integration.issue_type = Some(issue_type.to_string());
        integration.sync_direction = sync_direction;
        integration.status_mapping = status_mapping;
        integration.field_mapping = field_mapping;

        let webhook_secret = format!("{}{}", Uuid::new_v4().simple(), Uuid::new_v4().simple());
        let (secret_iv, secret_ct) = encrypt_parts(&self.key, &webhook_secret)?;
        integration.webhook_secret_iv = Some(secret_iv);
        integration.webhook_secret_encrypted = Some(secret_ct);

        if let Ok(webhook_id) = self.api.register_webhook(&mut integration, webhook_url).await {
            integration.webhook_id = webhook_id;
        }
        integration.is_active = true;

        self.store.save_jira_integration(integration).await?;
        Ok(())
    }

    /// Best-effort deletes the remote webhook, then always removes the
    /// local integration record.
    pub async fn disconnect(&self, workspace_id: &str) -> Result<(), OAuthError> {
        let mut integration = self.store.find_jira_integration(workspace_id).await?.ok_or(OAuthError::NotFound)?;
        if let Some(webhook_id) = integration.webhook_id.clone() {
            let _ = self.api.delete_webhook(&mut integration, &webhook_id).await;
        }
        self.store.delete_jira_integration(workspace_id).await?;
        Ok(())
    }

    pub async fn status(&self, workspace_id: &str) -> Result<Option<JiraIntegration>, OAuthError> {
        Ok(self.store.find_jira_integration(workspace_id).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use devos_core::cache::InMemoryCacheBackend;
    use devos_core::crypto::EncryptionKey;

    fn jira_config() -> JiraConfig {
        JiraConfig {
            client_id: "client".to_string(),
            client_secret: "secret".to_string(),
            redirect_uri: "http://localhost/callback".to_string(),
            webhook_url: "http://localhost/webhooks".to_string(),
        }
    }

    #[tokio::test]
    async fn authorization_url_contains_state_and_scopes() {
        let cache: Arc<dyn CacheBackend> = Arc::new(InMemoryCacheBackend::new());
        let store = Arc::new(Store::open_in_memory().await.unwrap());
        let key = EncryptionKey::generate().unwrap();
        let api = Arc::new(ApiClient::new(cache.clone(), store.clone(), key.clone(), jira_config()));
        let service = OAuthService::new(cache.clone(), store, api, key, jira_config());

        let url = service.authorization_url("W1", Uuid::new_v4()).await;
        assert!(url.starts_with("https://auth.atlassian.com/authorize"));
        assert!(url.contains("offline_access"));
        assert!(url.contains("state="));
    }

    #[tokio::test]
    async fn callback_rejects_unknown_state() {
        let cache: Arc<dyn CacheBackend> = Arc::new(InMemoryCacheBackend::new());
        let store = Arc::new(Store::open_in_memory().await.unwrap());
        let key = EncryptionKey::generate().unwrap();
        let api = Arc::new(ApiClient::new(cache.clone(), store.clone(), key.clone(), jira_config()));
        let service = OAuthService::new(cache, store, api, key, jira_config());

        let result = service.callback("some-code", "unknown-state").await;
        assert!(matches!(result, Err(OAuthError::InvalidState)));
    }

    #[tokio::test]
    async fn disconnect_without_existing_integration_is_not_found() {
        let cache: Arc<dyn CacheBackend> = Arc::new(InMemoryCacheBackend::new());
        let store = Arc::new(Store::open_in_memory().await.unwrap());
        let key = EncryptionKey::generate().unwrap();
        let api = Arc::new(ApiClient::new(cache.clone(), store.clone(), key.clone(), jira_config()));
        let service = OAuthService::new(cache, store, api, key, jira_config());

        let result = service.disconnect("W-missing").await;
        assert!(matches!(result, Err(OAuthError::NotFound)));
    }
}
