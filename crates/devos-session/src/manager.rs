//! CLI Session Lifecycle (`spec.md` §4.3): spawn a sandboxed agent child
//! process with env-only secret injection, track it to completion, and
//! terminate it on demand.

use crate::streaming::OutputStreamer;
use chrono::{DateTime, Utc};
use devos_core::byok::{ByokError, KeyBridge};
use devos_core::config::CliSessionConfig;
use devos_core::types::SecretProvider;
use devos_events::event_bus::EventBus;
use devos_events::protocol::{CliSessionPayload, DevosEvent};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::Notify;
use uuid::Uuid;

pub const DEFAULT_MAX_TOKENS: u32 = 200_000;
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(2 * 60 * 60);
pub const MAX_TIMEOUT: Duration = Duration::from_secs(4 * 60 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Running,
    Completed,
    Failed,
    Terminated,
}

#[derive(Debug, Clone)]
pub struct SpawnParams {
    pub workspace_id: String,
    pub project_id: String,
    pub agent_type: String,
    pub prompt: String,
    pub repo_url: Option<String>,
    pub max_tokens: Option<u32>,
    pub timeout: Option<Duration>,
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("workspace {0} is at its concurrent session limit")]
    ConcurrencyLimitReached(String),
    #[error("invalid session config: {0}")]
    InvalidConfig(String),
    #[error("byok: {0}")]
    Byok(#[from] ByokError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("session {0} not found")]
    NotFound(Uuid),
}

#[derive(Debug, Clone, Copy)]
pub struct SessionStatusSnapshot {
    pub status: SessionStatus,
    pub pid: Option<u32>,
    pub output_line_count: u64,
    pub duration_ms: u64,
}

struct SessionRecord {
    workspace_id: String,
    status: Mutex<SessionStatus>,
    pid: Option<u32>,
    started_at: DateTime<Utc>,
    output_line_count: Arc<AtomicU64>,
    terminate: Notify,
}

pub struct SessionManager {
    config: CliSessionConfig,
    events: EventBus,
    streamer: Arc<OutputStreamer>,
    key_bridge: Arc<KeyBridge>,
    sessions: dashmap::DashMap<Uuid, Arc<SessionRecord>>,
}

impl SessionManager {
    pub fn new(
        config: CliSessionConfig,
        events: EventBus,
        streamer: Arc<OutputStreamer>,
        key_bridge: Arc<KeyBridge>,
    ) -> Self {
        Self { config, events, streamer, key_bridge, sessions: dashmap::DashMap::new() }
    }

    fn active_count(&self, workspace_id: &str) -> usize {
        self.sessions
            .iter()
            .filter(|e| e.workspace_id == workspace_id && *e.status.lock().unwrap() == SessionStatus::Running)
            .count()
    }

    async fn prepare_workspace(&self, workspace_id: &str, project_id: &str, repo_url: Option<&str>) -> Result<PathBuf, SessionError> {
        let path = PathBuf::from(&self.config.workspace_base_path).join(workspace_id).join(project_id);
        let is_new = !path.exists();
        tokio::fs::create_dir_all(&path).await?;

        if is_new {
            if let Some(url) = repo_url {
                run_git(&path, &["clone", url, "."]).await?;
            } else {
                run_git(&path, &["init"]).await?;
            }
        } else if repo_url.is_some() {
            let _ = run_git(&path, &["pull", "--ff-only"]).await;
        }

        let _ = run_git(&path, &["config", "user.name", "devos-agent"]).await;
        let _ = run_git(&path, &["config", "user.email", "devos-agent@localhost"]).await;
        Ok(path)
    }

    /// Enforces the per-workspace concurrency cap, prepares the workspace,
    /// resolves the BYOK key, and spawns the child process with the key
    /// passed only through its environment.
    pub async fn spawn_session(&self, params: SpawnParams) -> Result<Uuid, SessionError> {
        if self.active_count(&params.workspace_id) >= self.config.max_concurrent_sessions {
            return Err(SessionError::ConcurrencyLimitReached(params.workspace_id.clone()));
        }
        if params.prompt.trim().is_empty() {
            return Err(SessionError::InvalidConfig("prompt must not be empty".to_string()));
        }

        let timeout = params.timeout.unwrap_or(DEFAULT_TIMEOUT).min(MAX_TIMEOUT);
        let max_tokens = params.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS);

        let workspace_path = self
            .prepare_workspace(&params.workspace_id, &params.project_id, params.repo_url.as_deref())
            .await?;
        let api_key = self.key_bridge.resolve(&params.workspace_id, SecretProvider::Anthropic).await?;

        let mut command = Command::new("claude");
        command
            .arg("-p")
            .arg(&params.prompt)
            .arg("--max-tokens")
            .arg(max_tokens.to_string())
            .current_dir(&workspace_path)
            .env("ANTHROPIC_API_KEY", &api_key)
            .env("GIT_TERMINAL_PROMPT", "0")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if !self.config.default_model.is_empty() {
            command.arg("--model").arg(&self.config.default_model);
        }

        let mut child = command.spawn()?;
        let pid = child.id();
        let stdout = child.stdout.take().expect("stdout piped at spawn");
        let stderr = child.stderr.take().expect("stderr piped at spawn");

        let session_id = Uuid::new_v4();
        let record = Arc::new(SessionRecord {
            workspace_id: params.workspace_id.clone(),
            status: Mutex::new(SessionStatus::Running),
            pid,
            started_at: Utc::now(),
            output_line_count: Arc::new(AtomicU64::new(0)),
            terminate: Notify::new(),
        });
        self.sessions.insert(session_id, record.clone());
        self.streamer.start_streaming(session_id).await;

        self.events.publish(DevosEvent::CliSessionStarted(CliSessionPayload {
            session_id,
            workspace_id: params.workspace_id.clone(),
            project_id: params.project_id.clone(),
            agent_type: params.agent_type.clone(),
            timestamp: Utc::now(),
        }));

        spawn_stdout_reader(stdout, session_id, self.streamer.clone(), record.output_line_count.clone());
        spawn_stderr_reader(stderr, session_id);
        self.spawn_exit_watcher(session_id, child, timeout, record, params.workspace_id, params.project_id, params.agent_type);

        Ok(session_id)
    }

    fn spawn_exit_watcher(
        &self,
        session_id: Uuid,
        mut child: tokio::process::Child,
        timeout: Duration,
        record: Arc<SessionRecord>,
        workspace_id: String,
        project_id: String,
        agent_type: String,
    ) {
        let events = self.events.clone();
        let streamer = self.streamer.clone();

        tokio::spawn(async move {
            let final_status = tokio::select! {
                outcome = tokio::time::timeout(timeout, child.wait()) => {
                    match outcome {
                        Ok(Ok(exit_status)) => {
                            if exit_status.success() { SessionStatus::Completed } else { SessionStatus::Failed }
                        }
                        Ok(Err(_)) => SessionStatus::Failed,
                        Err(_) => {
                            let _ = child.start_kill();
                            SessionStatus::Failed
                        }
                    }
                }
                _ = record.terminate.notified() => {
                    let _ = child.start_kill();
                    SessionStatus::Terminated
                }
            };

            *record.status.lock().unwrap() = final_status;
            let _ = streamer.stop_streaming(session_id).await;

            let payload = CliSessionPayload {
                session_id,
                workspace_id,
                project_id,
                agent_type,
                timestamp: Utc::now(),
            };
            let event = match final_status {
                SessionStatus::Completed => DevosEvent::CliSessionCompleted(payload),
                SessionStatus::Failed => DevosEvent::CliSessionFailed(payload),
                SessionStatus::Terminated => DevosEvent::CliSessionTerminated(payload),
                SessionStatus::Running => return,
            };
            events.publish(event);
        });
    }

    /// Signals the child process to terminate; the exit watcher observes
    /// this before any natural exit race and reports `Terminated`.
    pub async fn terminate(&self, session_id: Uuid) -> Result<(), SessionError> {
        let record = self.sessions.get(&session_id).map(|e| e.clone()).ok_or(SessionError::NotFound(session_id))?;
        record.terminate.notify_one();
        Ok(())
    }

    pub fn status(&self, session_id: Uuid) -> Result<SessionStatusSnapshot, SessionError> {
        let record = self.sessions.get(&session_id).ok_or(SessionError::NotFound(session_id))?;
        let status = *record.status.lock().unwrap();
        let duration_ms = (Utc::now() - record.started_at).num_milliseconds().max(0) as u64;
        Ok(SessionStatusSnapshot {
            status,
            pid: if status == SessionStatus::Running { record.pid } else { None },
            output_line_count: record.output_line_count.load(Ordering::Relaxed),
            duration_ms,
        })
    }
}

fn spawn_stdout_reader(
    stdout: tokio::process::ChildStdout,
    session_id: Uuid,
    streamer: Arc<OutputStreamer>,
    line_count: Arc<AtomicU64>,
) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stdout).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            line_count.fetch_add(1, Ordering::Relaxed);
            streamer.on_output(session_id, line.as_bytes());
        }
    });
}

fn spawn_stderr_reader(stderr: tokio::process::ChildStderr, session_id: Uuid) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if contains_secret(&line) {
                continue;
            }
            tracing::warn!(%session_id, stderr = %line, "cli session stderr");
        }
    });
}

fn contains_secret(line: &str) -> bool {
    line.contains("sk-ant-") || line.contains("ANTHROPIC_API_KEY")
}

async fn run_git(cwd: &std::path::Path, args: &[&str]) -> Result<(), SessionError> {
    let output = Command::new("git")
        .args(args)
        .current_dir(cwd)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await?;
    if output.status.success() {
        Ok(())
    } else {
        Err(SessionError::InvalidConfig(String::from_utf8_lossy(&output.stderr).to_string()))
    }
}
