//! Process-wide configuration, read once at startup from the environment.
//!
//! No global mutable state: callers receive an owned [`Config`] (or an
//! `Arc<Config>`) at construction time rather than reaching for a singleton.

use std::env;

#[derive(Debug, Clone)]
pub struct JiraConfig {
    pub client_id: String,
    pub client_secret: String,
    pub redirect_uri: String,
    pub webhook_url: String,
}

#[derive(Debug, Clone)]
pub struct CliSessionConfig {
    pub workspace_base_path: String,
    pub max_session_duration_ms: u64,
    pub max_concurrent_sessions: usize,
    pub default_model: String,
}

impl Default for CliSessionConfig {
    fn default() -> Self {
        Self {
            workspace_base_path: "/workspaces".to_string(),
            max_session_duration_ms: 7_200_000,
            max_concurrent_sessions: 5,
            default_model: String::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub db_path: String,
    /// Base64-encoded 32-byte encryption key. Absent in dev — the daemon
    /// generates an ephemeral key, which means encrypted columns from a
    /// prior run become unreadable across restarts.
    pub encryption_key_base64: Option<String>,
    /// How often `recover()` re-sweeps for stale pipeline contexts.
    pub recovery_sweep_secs: u64,
    /// How often each active Jira integration's `full_sync` runs.
    pub jira_sync_sweep_secs: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            db_path: "./devos.sqlite3".to_string(),
            encryption_key_base64: None,
            recovery_sweep_secs: 300,
            jira_sync_sweep_secs: 120,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Config {
    pub jira: Option<JiraConfig>,
    pub cli_session: CliSessionConfig,
    pub daemon: DaemonConfig,
}

impl Config {
    /// Build configuration from environment variables. `jira` is `None` when
    /// `JIRA_CLIENT_ID`/`JIRA_CLIENT_SECRET` are unset — the Jira subsystem
    /// is optional, the pipeline and CLI lifecycle are not.
    pub fn from_env() -> Self {
        let jira = match (env::var("JIRA_CLIENT_ID"), env::var("JIRA_CLIENT_SECRET")) {
            (Ok(client_id), Ok(client_secret)) => Some(JiraConfig {
                client_id,
                client_secret,
                redirect_uri: env::var("JIRA_REDIRECT_URI").unwrap_or_default(),
                webhook_url: env::var("JIRA_WEBHOOK_URL").unwrap_or_default(),
            }),
            _ => None,
        };

        let cli_session = CliSessionConfig {
            workspace_base_path: env::var("CLI_WORKSPACE_BASE_PATH")
                .unwrap_or_else(|_| "/workspaces".to_string()),
            max_session_duration_ms: env::var("CLI_MAX_SESSION_DURATION_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(7_200_000),
            max_concurrent_sessions: env::var("CLI_MAX_CONCURRENT_SESSIONS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(5),
            default_model: env::var("CLI_DEFAULT_MODEL").unwrap_or_default(),
        };

        let daemon = DaemonConfig {
            db_path: env::var("DEVOS_DB_PATH").unwrap_or_else(|_| "./devos.sqlite3".to_string()),
            encryption_key_base64: env::var("DEVOS_ENCRYPTION_KEY").ok(),
            recovery_sweep_secs: env::var("DEVOS_RECOVERY_SWEEP_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(300),
            jira_sync_sweep_secs: env::var("DEVOS_JIRA_SYNC_SWEEP_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(120),
        };

        Self { jira, cli_session, daemon }
    }
}
