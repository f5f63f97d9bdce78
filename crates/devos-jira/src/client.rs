//! Jira REST v3 API client (`spec.md` §4.6.a): a single `request` entry
//! point wrapping token freshness, sliding-window rate limiting, and the
//! HTTP retry/error semantics the rest of the sync engine relies on.

use crate::oauth::TokenResponse;
use crate::types::{
    AccessibleResource, CreateIssueFields, CreateIssueRequest, IssueTypeRef, JiraIssue,
    JiraTransitionsResponse, ProjectKeyRef,
};
use chrono::{Duration as ChronoDuration, Utc};
use devos_core::cache::CacheBackend;
use devos_core::config::JiraConfig;
use devos_core::crypto::{decrypt_parts, encrypt_parts, CryptoError, EncryptionKey};
use devos_core::lock::{acquire_or_wait_once, LockError};
use devos_core::store::{Store, StoreError};
use devos_core::types::JiraIntegration;
use devos_harness::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError};
use devos_harness::rate_limiter::{SlidingWindowConfig, SlidingWindowRateLimiter};
use reqwest::Method;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

const MAX_RETRIES: u32 = 3;
const RETRY_DELAYS_MS: [u64; 3] = [1000, 2000, 4000];
const REFRESH_SKEW: ChronoDuration = ChronoDuration::minutes(5);
const TOKEN_REFRESH_LOCK_TTL: Duration = Duration::from_secs(30);
const TOKEN_REFRESH_RETRY_AFTER: Duration = Duration::from_secs(2);

#[derive(Debug, thiserror::Error)]
pub enum JiraApiError {
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("jira api error, status {status}")]
    Api { status: u16 },
    #[error("unauthorized")]
    Unauthorized,
    #[error("rate limit exceeded, retry after {retry_after}s")]
    RateLimit { retry_after: u64 },
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("lock error: {0}")]
    Lock(#[from] LockError),
    #[error("jira api circuit breaker open — too many recent 5xx/timeouts")]
    CircuitOpen,
    #[error("jira api request failed after retries: {0}")]
    RequestFailed(String),
}

/// Outcome of a single HTTP attempt, fed to the circuit breaker: a 5xx
/// status counts as a failure the same as a transport error, everything
/// else (including 4xx) counts as the breaker's definition of success.
#[derive(Debug)]
enum AttemptError {
    Http(reqwest::Error),
    Status(u16),
}

impl std::fmt::Display for AttemptError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AttemptError::Http(e) => write!(f, "{e}"),
            AttemptError::Status(status) => write!(f, "http {status}"),
        }
    }
}

pub struct ApiClient {
    http: reqwest::Client,
    cache: Arc<dyn CacheBackend>,
    store: Arc<Store>,
    key: EncryptionKey,
    oauth: JiraConfig,
    rate_limiter: SlidingWindowRateLimiter,
    breaker: CircuitBreaker,
}

impl ApiClient {
    pub fn new(cache: Arc<dyn CacheBackend>, store: Arc<Store>, key: EncryptionKey, oauth: JiraConfig) -> Self {
        let rate_limiter = SlidingWindowRateLimiter::new(
            cache.clone(),
            SlidingWindowConfig {
                window: Duration::from_secs(60),
                threshold: 90,
                key_ttl: Duration::from_secs(120),
            },
        );
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .expect("failed to build reqwest client");
        let breaker = CircuitBreaker::new(CircuitBreakerConfig::default());
        Self { http, cache, store, key, oauth, rate_limiter, breaker }
    }

    fn base_url(integration: &JiraIntegration) -> String {
        format!(
            "https://api.atlassian.com/ex/jira/{}/rest/api/3",
            integration.cloud_id.as_deref().unwrap_or_default()
        )
    }

    async fn ensure_fresh_token(&self, integration: &mut JiraIntegration) -> Result<(), JiraApiError> {
        let needs_refresh = integration
            .token_expires_at
            .map(|expires_at| expires_at - Utc::now() < REFRESH_SKEW)
            .unwrap_or(false);
        if needs_refresh {
            self.force_refresh(integration).await?;
        }
        Ok(())
    }

    async fn force_refresh(&self, integration: &mut JiraIntegration) -> Result<(), JiraApiError> {
        let lock_key = format!("jira-token-refresh:{}", integration.id);
        match acquire_or_wait_once(self.cache.clone(), &lock_key, TOKEN_REFRESH_LOCK_TTL, TOKEN_REFRESH_RETRY_AFTER).await? {
            Some(lock) => {
                let refresh_token = decrypt_parts(&self.key, &integration.refresh_token_iv, &integration.refresh_token_encrypted)?;
                let resp: TokenResponse = self
                    .http
                    .post("https://auth.atlassian.com/oauth/token")
                    .json(&json!({
                        "grant_type": "refresh_token",
                        "client_id": self.oauth.client_id,
                        "client_secret": self.oauth.client_secret,
                        "refresh_token": refresh_token,
                    }))
                    .send()
                    .await?
                    .json()
                    .await?;

                let (access_iv, access_ct) = encrypt_parts(&self.key, &resp.access_token)?;
                let new_refresh_token = resp.refresh_token.unwrap_or(refresh_token);
                let (refresh_iv, refresh_ct) = encrypt_parts(&self.key, &new_refresh_token)?;

                integration.access_token_iv = access_iv;
                integration.access_token_encrypted = access_ct;
                integration.refresh_token_iv = refresh_iv;
                integration.refresh_token_encrypted = refresh_ct;
                integration.token_expires_at =
                    Some(Utc::now() + ChronoDuration::seconds(resp.expires_in.unwrap_or(3600) as i64));

                self.store.save_jira_integration(integration.clone()).await?;
                lock.release().await;
                Ok(())
            }
            None => {
                if let Some(fresh) = self.store.find_jira_integration(&integration.workspace_id).await? {
                    *integration = fresh;
                }
                Ok(())
            }
        }
    }

    async fn check_rate_limit(&self, integration: &JiraIntegration) -> Result<(), JiraApiError> {
        let key = format!("jira-rate:{}", integration.id);
        self.rate_limiter.check(&key).await.map_err(|_| JiraApiError::RateLimit { retry_after: 60 })
    }

    /// Single entry point wrapping the Jira REST v3 API. Returns `None` for
    /// a `204 No Content` response.
    pub async fn request<T: DeserializeOwned>(
        &self,
        integration: &mut JiraIntegration,
        method: Method,
        path: &str,
        body: Option<Value>,
    ) -> Result<Option<T>, JiraApiError> {
        self.ensure_fresh_token(integration).await?;
        self.check_rate_limit(integration).await?;

        let mut attempt = 0u32;
        let mut retried_auth = false;

        loop {
            let access_token = decrypt_parts(&self.key, &integration.access_token_iv, &integration.access_token_encrypted)?;
            let url = format!("{}{}", Self::base_url(integration), path);
            let mut req = self
                .http
                .request(method.clone(), &url)
                .header("Authorization", format!("Bearer {access_token}"))
                .header("Accept", "application/json");
            if let Some(b) = &body {
                req = req.json(b);
            }

            // Route every attempt through the breaker: a 5xx status counts
            // as a failure the same as a transport error, so three bad
            // upstreams in a row trip it open and the next call fails fast
            // instead of burning another round of retries against a down
            // Jira.
            let outcome = self
                .breaker
                .call(move || async move {
                    let resp = req.send().await.map_err(AttemptError::Http)?;
                    let status = resp.status().as_u16();
                    if (500..=599).contains(&status) {
                        Err(AttemptError::Status(status))
                    } else {
                        Ok(resp)
                    }
                })
                .await;

            match outcome {
                Ok(resp) => {
                    let status = resp.status().as_u16();
                    match status {
                        204 => return Ok(None),
                        200..=299 => return Ok(Some(resp.json::<T>().await?)),
                        401 if !retried_auth => {
                            retried_auth = true;
                            self.force_refresh(integration).await?;
                            continue;
                        }
                        401 => return Err(JiraApiError::Unauthorized),
                        403 => return Err(JiraApiError::Api { status: 403 }),
                        404 => return Err(JiraApiError::Api { status: 404 }),
                        429 => {
                            let retry_after = resp
                                .headers()
                                .get("Retry-After")
                                .and_then(|v| v.to_str().ok())
                                .and_then(|v| v.parse().ok())
                                .unwrap_or(60);
                            return Err(JiraApiError::RateLimit { retry_after });
                        }
                        other => return Err(JiraApiError::Api { status: other }),
                    }
                }
                Err(CircuitBreakerError::Open) => return Err(JiraApiError::CircuitOpen),
                Err(CircuitBreakerError::Timeout(_)) => {
                    if attempt < MAX_RETRIES {
                        tokio::time::sleep(Duration::from_millis(RETRY_DELAYS_MS[attempt as usize])).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(JiraApiError::RequestFailed("call timed out".to_string()));
                }
                Err(CircuitBreakerError::Inner(message)) => {
                    if attempt < MAX_RETRIES {
                        tokio::time::sleep(Duration::from_millis(RETRY_DELAYS_MS[attempt as usize])).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(JiraApiError::RequestFailed(message));
                }
            }
        }
    }

    /// 404 translates to `None`; all other errors propagate.
    pub async fn get_issue(&self, integration: &mut JiraIntegration, issue_id_or_key: &str) -> Result<Option<JiraIssue>, JiraApiError> {
        let path = format!("/issue/{issue_id_or_key}");
        match self.request::<JiraIssue>(integration, Method::GET, &path, None).await {
            Ok(issue) => Ok(issue),
            Err(JiraApiError::Api { status: 404 }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub async fn create_issue(
        &self,
        integration: &mut JiraIntegration,
        project_key: &str,
        summary: &str,
        description: Value,
        issue_type: &str,
    ) -> Result<JiraIssue, JiraApiError> {
        let body = CreateIssueRequest {
            fields: CreateIssueFields {
                project: ProjectKeyRef { key: project_key.to_string() },
                summary: summary.to_string(),
                description,
                issuetype: IssueTypeRef { name: issue_type.to_string() },
            },
        };
        let value = serde_json::to_value(body).expect("CreateIssueRequest always serializes");
        self.request::<JiraIssue>(integration, Method::POST, "/issue", Some(value))
            .await?
            .ok_or(JiraApiError::Api { status: 204 })
    }

    pub async fn update_issue_fields(&self, integration: &mut JiraIntegration, issue_key: &str, fields: Value) -> Result<(), JiraApiError> {
        let path = format!("/issue/{issue_key}");
        self.request::<Value>(integration, Method::PUT, &path, Some(json!({ "fields": fields }))).await?;
        Ok(())
    }

    pub async fn get_transitions(&self, integration: &mut JiraIntegration, issue_key: &str) -> Result<JiraTransitionsResponse, JiraApiError> {
        let path = format!("/issue/{issue_key}/transitions");
        self.request::<JiraTransitionsResponse>(integration, Method::GET, &path, None)
            .await?
            .ok_or(JiraApiError::Api { status: 204 })
    }

    pub async fn execute_transition(&self, integration: &mut JiraIntegration, issue_key: &str, transition_id: &str) -> Result<(), JiraApiError> {
        let path = format!("/issue/{issue_key}/transitions");
        self.request::<Value>(integration, Method::POST, &path, Some(json!({ "transition": { "id": transition_id } })))
            .await?;
        Ok(())
    }

    pub async fn accessible_resources(&self, access_token: &str) -> Result<Vec<AccessibleResource>, JiraApiError> {
        let resources = self
            .http
            .get("https://api.atlassian.com/oauth/token/accessible-resources")
            .header("Authorization", format!("Bearer {access_token}"))
            .header("Accept", "application/json")
            .send()
            .await?
            .json::<Vec<AccessibleResource>>()
            .await?;
        Ok(resources)
    }

    pub async fn register_webhook(&self, integration: &mut JiraIntegration, webhook_url: &str) -> Result<Option<String>, JiraApiError> {
        let body = json!({
            "url": webhook_url,
            "events": ["jira:issue_created", "jira:issue_updated", "jira:issue_deleted", "comment_created", "comment_updated"],
        });
        let resp: Option<Value> = self.request(integration, Method::POST, "/webhook", Some(body)).await?;
        Ok(resp.and_then(|v| v.get("id").and_then(|id| id.as_str()).map(str::to_string)))
    }

    pub async fn delete_webhook(&self, integration: &mut JiraIntegration, webhook_id: &str) -> Result<(), JiraApiError> {
        let path = format!("/webhook/{webhook_id}");
        self.request::<Value>(integration, Method::DELETE, &path, None).await?;
        Ok(())
    }
}

/// Finds the transition whose target status name matches `target_status`
/// case-insensitively, per §4.6.c's workflow-transition lookup.
pub fn find_transition<'a>(transitions: &'a JiraTransitionsResponse, target_status: &str) -> Option<&'a crate::types::JiraTransition> {
    transitions.transitions.iter().find(|t| t.to.name.eq_ignore_ascii_case(target_status))
}
