use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};

use devos_core::byok::KeyBridge;
use devos_core::cache::{CacheBackend, InMemoryCacheBackend};
use devos_core::config::Config;
use devos_core::crypto::{CryptoError, EncryptionKey};
use devos_core::store::{Store, StoreError};
use devos_core::types::Story;
use devos_events::event_bus::EventBus;
use devos_events::protocol::DevosEvent;
use devos_harness::shutdown::ShutdownSignal;
use devos_jira::client::ApiClient;
use devos_jira::oauth::OAuthService;
use devos_jira::sync::{StoryRepository, SyncService};
use devos_jira::webhook::{JiraWebhookHandler, StoryListener};
use devos_pipeline::coordinator::HandoffCoordinator;
use devos_pipeline::dependency::StoryDependencyManager;
use devos_pipeline::queue::HandoffQueue;
use devos_pipeline::state_machine::PipelineStateMachine;
use devos_session::manager::SessionManager;
use devos_session::streaming::OutputStreamer;

#[derive(Debug, thiserror::Error)]
pub enum DaemonError {
    #[error("failed to open store: {0}")]
    Store(#[from] StoreError),
    #[error("encryption key error: {0}")]
    Crypto(#[from] CryptoError),
}

/// Placeholder implementation of the story boundary this subsystem consumes
/// but does not own. A deployment that wires a real project-management
/// backend replaces this with an adapter over that system; standalone runs
/// of the daemon have no story source, so lookups always miss.
struct NoStoryRepository;

#[async_trait::async_trait]
impl StoryRepository for NoStoryRepository {
    async fn find(&self, _workspace_id: &str, _story_id: &str) -> Option<Story> {
        None
    }

    async fn save(&self, _story: Story) {}
}

#[derive(Debug, Clone)]
pub struct DaemonIntervals {
    pub recovery_sweep_secs: u64,
    pub jira_sync_sweep_secs: u64,
}

impl From<&Config> for DaemonIntervals {
    fn from(config: &Config) -> Self {
        Self {
            recovery_sweep_secs: config.daemon.recovery_sweep_secs,
            jira_sync_sweep_secs: config.daemon.jira_sync_sweep_secs,
        }
    }
}

struct JiraHandles {
    sync: Arc<SyncService>,
    oauth: Arc<OAuthService>,
    webhook_handler: Arc<JiraWebhookHandler>,
    listener: Arc<StoryListener>,
}

/// The pipeline orchestrator's background process.
///
/// Owns the durable per-project state machine, the handoff coordinator, CLI
/// session lifecycle management, and — when a Jira integration is
/// configured — the two-way sync engine. `run_loops` drives two sweeps
/// (stale-pipeline recovery, Jira full sync) until the shutdown signal
/// fires.
pub struct Daemon {
    config: Config,
    store: Arc<Store>,
    events: EventBus,
    shutdown: ShutdownSignal,
    intervals: DaemonIntervals,
    state_machine: Arc<PipelineStateMachine>,
    coordinator: Arc<HandoffCoordinator>,
    sessions: Arc<SessionManager>,
    jira: Option<JiraHandles>,
}

impl Daemon {
    pub async fn new(config: Config) -> Result<Self, DaemonError> {
        let store = Arc::new(Store::open(Path::new(&config.daemon.db_path)).await?);
        let cache: Arc<dyn CacheBackend> = Arc::new(InMemoryCacheBackend::new());
        let events = EventBus::new();
        let shutdown = ShutdownSignal::new();
        let intervals = DaemonIntervals::from(&config);

        let state_machine = Arc::new(PipelineStateMachine::new(
            store.clone(),
            cache.clone(),
            events.clone(),
        ));

        let dependencies = Arc::new(StoryDependencyManager::new(events.clone()));
        let queue = Arc::new(HandoffQueue::new(cache.clone()));
        let coordinator = Arc::new(HandoffCoordinator::new(
            store.clone(),
            events.clone(),
            dependencies,
            queue,
        ));

        let key = match &config.daemon.encryption_key_base64 {
            Some(encoded) => EncryptionKey::from_base64(encoded)?,
            None => {
                warn!("DEVOS_ENCRYPTION_KEY unset — generating an ephemeral key; encrypted columns from a prior run will be unreadable");
                EncryptionKey::generate()?
            }
        };
        let key_bridge = Arc::new(KeyBridge::new(store.clone(), key.clone()));
        let streamer = OutputStreamer::new(cache.clone(), events.clone(), store.clone());
        let sessions = Arc::new(SessionManager::new(
            config.cli_session.clone(),
            events.clone(),
            streamer,
            key_bridge,
        ));

        let jira = match &config.jira {
            Some(jira_config) => {
                let api = Arc::new(ApiClient::new(
                    cache.clone(),
                    store.clone(),
                    key.clone(),
                    jira_config.clone(),
                ));
                let oauth = Arc::new(OAuthService::new(
                    cache.clone(),
                    store.clone(),
                    api.clone(),
                    key.clone(),
                    jira_config.clone(),
                ));
                let stories: Arc<dyn StoryRepository> = Arc::new(NoStoryRepository);
                let sync = Arc::new(SyncService::new(store.clone(), cache.clone(), api, stories));
                let webhook_handler = Arc::new(JiraWebhookHandler::new(store.clone(), sync.clone()));
                let listener = StoryListener::new(store.clone(), sync.clone());
                Some(JiraHandles { sync, oauth, webhook_handler, listener })
            }
            None => None,
        };

        Ok(Self {
            config,
            store,
            events,
            shutdown,
            intervals,
            state_machine,
            coordinator,
            sessions,
            jira,
        })
    }

    pub fn shutdown_handle(&self) -> ShutdownSignal {
        self.shutdown.clone()
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn coordinator(&self) -> &Arc<HandoffCoordinator> {
        &self.coordinator
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    pub fn oauth(&self) -> Option<&Arc<OAuthService>> {
        self.jira.as_ref().map(|j| &j.oauth)
    }

    pub fn webhook_handler(&self) -> Option<&Arc<JiraWebhookHandler>> {
        self.jira.as_ref().map(|j| &j.webhook_handler)
    }

    /// Runs `PipelineStateMachine::recover` once, moving any pipeline stuck
    /// past the stale threshold to `failed`. Called on startup before
    /// entering the background loop, and again on every recovery tick.
    async fn run_recovery_sweep(&self) {
        match self.state_machine.recover().await {
            Ok(summary) => {
                if summary.recovered > 0 {
                    warn!(
                        recovered = summary.recovered,
                        stale = summary.stale,
                        total = summary.total,
                        "recovered stale pipeline contexts"
                    );
                } else {
                    info!(total = summary.total, "recovery sweep found nothing stale");
                }
            }
            Err(err) => error!(%err, "recovery sweep failed"),
        }
    }

    async fn run_jira_sweep(&self) {
        let Some(jira) = &self.jira else { return };
        let integrations = match self.store.list_active_jira_integrations().await {
            Ok(integrations) => integrations,
            Err(err) => {
                error!(%err, "failed to list active jira integrations");
                return;
            }
        };
        for integration in integrations {
            match jira.sync.full_sync(&integration.workspace_id).await {
                Ok(counts) => info!(
                    workspace_id = %integration.workspace_id,
                    created = counts.created,
                    updated = counts.updated,
                    conflicts = counts.conflicts,
                    errors = counts.errors,
                    "jira full sync completed"
                ),
                Err(err) => error!(workspace_id = %integration.workspace_id, %err, "jira full sync failed"),
            }
        }
    }

    /// Forwards `StoryChanged` events published on the bus to the Jira
    /// story listener's debounced devos-to-jira sync, when Jira is
    /// configured. Runs for the lifetime of the process; there is no
    /// explicit unsubscribe, so it exits once the bus and all senders drop.
    fn spawn_story_listener_bridge(&self) {
        let Some(jira) = &self.jira else { return };
        let listener = jira.listener.clone();
        let rx = self.events.subscribe();
        tokio::spawn(async move {
            while let Ok(event) = rx.recv_async().await {
                if let DevosEvent::StoryChanged(payload) = event {
                    listener.on_story_changed(payload).await;
                }
            }
        });
    }

    /// Runs the recovery and Jira sync sweeps on their configured intervals
    /// until the shutdown signal fires.
    pub async fn run_loops(&self) {
        self.run_recovery_sweep().await;
        self.spawn_story_listener_bridge();

        let mut recovery_interval =
            tokio::time::interval(Duration::from_secs(self.intervals.recovery_sweep_secs));
        let mut jira_interval =
            tokio::time::interval(Duration::from_secs(self.intervals.jira_sync_sweep_secs));

        // Consume the first immediate tick so both loops don't fire again at t=0.
        recovery_interval.tick().await;
        jira_interval.tick().await;

        let mut shutdown_rx = self.shutdown.subscribe();

        loop {
            tokio::select! {
                _ = recovery_interval.tick() => {
                    self.run_recovery_sweep().await;
                }
                _ = jira_interval.tick() => {
                    self.run_jira_sweep().await;
                }
                _ = shutdown_rx.recv() => {
                    info!("shutdown signal received, stopping background loops");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_db_path(name: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!("devos-daemon-test-{name}-{}.sqlite3", uuid::Uuid::new_v4()))
    }

    #[tokio::test]
    async fn new_without_jira_config_has_no_oauth() {
        let path = temp_db_path("no-jira");
        let mut config = Config::default();
        config.daemon.db_path = path.to_string_lossy().into_owned();

        let daemon = Daemon::new(config).await.unwrap();
        assert!(daemon.oauth().is_none());
        assert!(daemon.webhook_handler().is_none());

        let _ = tokio::fs::remove_file(&path).await;
    }

    #[tokio::test]
    async fn new_with_jira_config_wires_oauth() {
        let path = temp_db_path("with-jira");
        let mut config = Config::default();
        config.daemon.db_path = path.to_string_lossy().into_owned();
        config.jira = Some(devos_core::config::JiraConfig {
            client_id: "id".to_string(),
            client_secret: "secret".to_string(),
            redirect_uri: "https://example.com/callback".to_string(),
            webhook_url: "https://example.com/webhook".to_string(),
        });

        let daemon = Daemon::new(config).await.unwrap();
        assert!(daemon.oauth().is_some());
        assert!(daemon.webhook_handler().is_some());

        let _ = tokio::fs::remove_file(&path).await;
    }

    #[tokio::test]
    async fn recovery_sweep_runs_cleanly_on_an_empty_store() {
        let path = temp_db_path("recovery");
        let mut config = Config::default();
        config.daemon.db_path = path.to_string_lossy().into_owned();

        let daemon = Daemon::new(config).await.unwrap();
        daemon.run_recovery_sweep().await;

        let _ = tokio::fs::remove_file(&path).await;
    }
}
