//! SQLite-backed persistence for the entities in [`crate::types`].
//!
//! Plain records plus a repository per entity (`find_by_*`, `save`,
//! `remove`), per the ORM-replacement guidance: no query builder, no
//! migration tool, one hand-written `init_schema` call versioning the
//! schema. Enums round-trip through SQLite TEXT columns via
//! `serde_json::to_string`/`from_str` with the surrounding quotes trimmed,
//! the same trick the teacher's cache layer uses.

use crate::types::*;
use chrono::{DateTime, Utc};
use std::path::Path;
use tokio_rusqlite::Connection;
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] tokio_rusqlite::Error),
    #[error("row error: {0}")]
    Row(String),
    #[error("not found")]
    NotFound,
}

fn enum_to_sql<T: serde::Serialize>(value: &T) -> String {
    let json = serde_json::to_string(value).unwrap_or_default();
    json.trim_matches('"').to_string()
}

fn enum_from_sql<T: serde::de::DeserializeOwned>(s: &str) -> Result<T, StoreError> {
    serde_json::from_str(&format!("\"{s}\"")).map_err(|e| StoreError::Row(e.to_string()))
}

fn json_to_sql<T: serde::Serialize>(value: &T) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| "null".to_string())
}

fn json_from_sql<T: serde::de::DeserializeOwned + Default>(s: &str) -> T {
    serde_json::from_str(s).unwrap_or_default()
}

pub struct Store {
    conn: Connection,
}

impl Store {
    pub async fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path).await?;
        let store = Self { conn };
        store.init_schema().await?;
        Ok(store)
    }

    pub async fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().await?;
        let store = Self { conn };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> Result<(), StoreError> {
        self.conn
            .call(|conn| {
                conn.execute_batch(
                    "PRAGMA journal_mode=WAL;
                     PRAGMA synchronous=NORMAL;
                     PRAGMA busy_timeout=5000;

                     CREATE TABLE IF NOT EXISTS pipeline_contexts (
                        project_id TEXT PRIMARY KEY,
                        workspace_id TEXT NOT NULL,
                        workflow_id TEXT NOT NULL,
                        current_state TEXT NOT NULL,
                        previous_state TEXT,
                        state_entered_at TEXT NOT NULL,
                        active_agent_id TEXT,
                        active_agent_type TEXT,
                        current_story_id TEXT,
                        retry_count INTEGER NOT NULL,
                        max_retries INTEGER NOT NULL,
                        metadata TEXT NOT NULL,
                        created_at TEXT NOT NULL,
                        updated_at TEXT NOT NULL
                     );

                     CREATE TABLE IF NOT EXISTS pipeline_state_history (
                        id TEXT PRIMARY KEY,
                        project_id TEXT NOT NULL,
                        workspace_id TEXT NOT NULL,
                        workflow_id TEXT NOT NULL,
                        previous_state TEXT,
                        new_state TEXT NOT NULL,
                        triggered_by TEXT NOT NULL,
                        agent_id TEXT,
                        story_id TEXT,
                        metadata TEXT NOT NULL,
                        error_message TEXT,
                        created_at TEXT NOT NULL
                     );
                     CREATE INDEX IF NOT EXISTS idx_history_project ON pipeline_state_history(project_id);

                     CREATE TABLE IF NOT EXISTS handoff_history (
                        id TEXT PRIMARY KEY,
                        workspace_id TEXT NOT NULL,
                        story_id TEXT NOT NULL,
                        from_agent_type TEXT NOT NULL,
                        from_agent_id TEXT,
                        to_agent_type TEXT NOT NULL,
                        to_agent_id TEXT,
                        from_phase TEXT NOT NULL,
                        to_phase TEXT NOT NULL,
                        handoff_type TEXT NOT NULL,
                        context_summary TEXT NOT NULL,
                        iteration_count INTEGER NOT NULL,
                        duration_ms INTEGER NOT NULL,
                        metadata TEXT NOT NULL,
                        created_at TEXT NOT NULL
                     );
                     CREATE INDEX IF NOT EXISTS idx_handoff_workspace ON handoff_history(workspace_id);

                     CREATE TABLE IF NOT EXISTS jira_integrations (
                        id TEXT PRIMARY KEY,
                        workspace_id TEXT NOT NULL UNIQUE,
                        cloud_id TEXT,
                        jira_site_url TEXT,
                        jira_project_key TEXT,
                        jira_project_name TEXT,
                        issue_type TEXT,
                        sync_direction TEXT NOT NULL,
                        status_mapping TEXT NOT NULL,
                        field_mapping TEXT NOT NULL,
                        access_token_encrypted TEXT NOT NULL,
                        access_token_iv TEXT NOT NULL,
                        refresh_token_encrypted TEXT NOT NULL,
                        refresh_token_iv TEXT NOT NULL,
                        token_expires_at TEXT,
                        webhook_id TEXT,
                        webhook_secret_encrypted TEXT,
                        webhook_secret_iv TEXT,
                        is_active INTEGER NOT NULL,
                        error_count INTEGER NOT NULL,
                        sync_count INTEGER NOT NULL,
                        last_sync_at TEXT,
                        last_error TEXT,
                        last_error_at TEXT,
                        connected_by TEXT NOT NULL
                     );

                     CREATE TABLE IF NOT EXISTS jira_sync_items (
                        id TEXT PRIMARY KEY,
                        jira_integration_id TEXT NOT NULL,
                        devos_story_id TEXT NOT NULL,
                        jira_issue_key TEXT NOT NULL,
                        jira_issue_id TEXT NOT NULL,
                        jira_issue_type TEXT,
                        sync_status TEXT NOT NULL,
                        sync_direction_last TEXT,
                        last_synced_at TEXT,
                        last_devos_update_at TEXT,
                        last_jira_update_at TEXT,
                        error_message TEXT,
                        conflict_details TEXT,
                        UNIQUE(jira_integration_id, devos_story_id)
                     );

                     CREATE TABLE IF NOT EXISTS byok_secrets (
                        id TEXT PRIMARY KEY,
                        workspace_id TEXT NOT NULL,
                        key_name TEXT NOT NULL,
                        provider TEXT NOT NULL,
                        encrypted_key TEXT NOT NULL,
                        encryption_iv TEXT NOT NULL,
                        created_by_user_id TEXT NOT NULL,
                        created_at TEXT NOT NULL,
                        updated_at TEXT NOT NULL,
                        last_used_at TEXT,
                        is_active INTEGER NOT NULL DEFAULT 1
                     );
                     CREATE INDEX IF NOT EXISTS idx_secrets_workspace_active ON byok_secrets(workspace_id, is_active);

                     CREATE TABLE IF NOT EXISTS cli_output_archives (
                        session_id TEXT PRIMARY KEY,
                        output TEXT NOT NULL,
                        archived_at TEXT NOT NULL
                     );
                     ",
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    pub async fn find_pipeline_context(&self, project_id: &str) -> Result<Option<PipelineContext>, StoreError> {
        let project_id = project_id.to_string();
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare("SELECT * FROM pipeline_contexts WHERE project_id = ?1")?;
                let mut rows = stmt.query(rusqlite::params![project_id])?;
                if let Some(row) = rows.next()? {
                    Ok(Some(row_to_pipeline_context(row)?))
                } else {
                    Ok(None)
                }
            })
            .await
            .map_err(StoreError::from)
    }

    pub async fn list_active_pipeline_contexts(&self) -> Result<Vec<PipelineContext>, StoreError> {
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT * FROM pipeline_contexts WHERE current_state NOT IN ('complete', 'failed')",
                )?;
                let rows = stmt.query_map([], row_to_pipeline_context)?;
                let mut out = Vec::new();
                for r in rows {
                    out.push(r?);
                }
                Ok(out)
            })
            .await
            .map_err(StoreError::from)
    }

    pub async fn save_pipeline_context(&self, ctx: PipelineContext) -> Result<(), StoreError> {
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO pipeline_contexts
                        (project_id, workspace_id, workflow_id, current_state, previous_state,
                         state_entered_at, active_agent_id, active_agent_type, current_story_id,
                         retry_count, max_retries, metadata, created_at, updated_at)
                     VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14)
                     ON CONFLICT(project_id) DO UPDATE SET
                        workspace_id=excluded.workspace_id,
                        workflow_id=excluded.workflow_id,
                        current_state=excluded.current_state,
                        previous_state=excluded.previous_state,
                        state_entered_at=excluded.state_entered_at,
                        active_agent_id=excluded.active_agent_id,
                        active_agent_type=excluded.active_agent_type,
                        current_story_id=excluded.current_story_id,
                        retry_count=excluded.retry_count,
                        max_retries=excluded.max_retries,
                        metadata=excluded.metadata,
                        updated_at=excluded.updated_at",
                    rusqlite::params![
                        ctx.project_id,
                        ctx.workspace_id,
                        ctx.workflow_id.to_string(),
                        enum_to_sql(&ctx.current_state),
                        ctx.previous_state.as_ref().map(enum_to_sql),
                        ctx.state_entered_at.to_rfc3339(),
                        ctx.active_agent_id.map(|id| id.to_string()),
                        ctx.active_agent_type,
                        ctx.current_story_id,
                        ctx.retry_count,
                        ctx.max_retries,
                        json_to_sql(&ctx.metadata),
                        ctx.created_at.to_rfc3339(),
                        ctx.updated_at.to_rfc3339(),
                    ],
                )?;
                Ok(())
            })
            .await
            .map_err(StoreError::from)
    }

    pub async fn append_state_history(&self, row: PipelineStateHistory) -> Result<(), StoreError> {
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO pipeline_state_history
                        (id, project_id, workspace_id, workflow_id, previous_state, new_state,
                         triggered_by, agent_id, story_id, metadata, error_message, created_at)
                     VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12)",
                    rusqlite::params![
                        row.id.to_string(),
                        row.project_id,
                        row.workspace_id,
                        row.workflow_id.to_string(),
                        row.previous_state.as_ref().map(enum_to_sql),
                        enum_to_sql(&row.new_state),
                        row.triggered_by,
                        row.agent_id.map(|id| id.to_string()),
                        row.story_id,
                        json_to_sql(&row.metadata),
                        row.error_message,
                        row.created_at.to_rfc3339(),
                    ],
                )?;
                Ok(())
            })
            .await
            .map_err(StoreError::from)
    }

    pub async fn append_handoff_history(&self, row: HandoffHistory) -> Result<(), StoreError> {
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO handoff_history
                        (id, workspace_id, story_id, from_agent_type, from_agent_id, to_agent_type,
                         to_agent_id, from_phase, to_phase, handoff_type, context_summary,
                         iteration_count, duration_ms, metadata, created_at)
                     VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15)",
                    rusqlite::params![
                        row.id.to_string(),
                        row.workspace_id,
                        row.story_id,
                        row.from_agent_type,
                        row.from_agent_id.map(|id| id.to_string()),
                        row.to_agent_type,
                        row.to_agent_id.map(|id| id.to_string()),
                        row.from_phase,
                        row.to_phase,
                        enum_to_sql(&row.handoff_type),
                        row.context_summary,
                        row.iteration_count,
                        row.duration_ms,
                        json_to_sql(&row.metadata),
                        row.created_at.to_rfc3339(),
                    ],
                )?;
                Ok(())
            })
            .await
            .map_err(StoreError::from)
    }

    pub async fn count_handoff_history(&self, workspace_id: &str) -> Result<u64, StoreError> {
        let workspace_id = workspace_id.to_string();
        self.conn
            .call(move |conn| {
                Ok(conn.query_row(
                    "SELECT COUNT(*) FROM handoff_history WHERE workspace_id = ?1",
                    rusqlite::params![workspace_id],
                    |r| r.get::<_, i64>(0),
                )
                .map(|n| n as u64)?)
            })
            .await
            .map_err(StoreError::from)
    }

    /// The active BYOK secret for a workspace/provider pair, if any.
    pub async fn find_active_secret(
        &self,
        workspace_id: &str,
        provider: SecretProvider,
    ) -> Result<Option<Secret>, StoreError> {
        let workspace_id = workspace_id.to_string();
        let provider = enum_to_sql(&provider);
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT * FROM byok_secrets WHERE workspace_id = ?1 AND provider = ?2 AND is_active = 1
                     ORDER BY created_at DESC LIMIT 1",
                )?;
                let mut rows = stmt.query(rusqlite::params![workspace_id, provider])?;
                if let Some(row) = rows.next()? {
                    Ok(Some(row_to_secret(row)?))
                } else {
                    Ok(None)
                }
            })
            .await
            .map_err(StoreError::from)
    }

    pub async fn save_secret(&self, secret: Secret) -> Result<(), StoreError> {
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO byok_secrets
                        (id, workspace_id, key_name, provider, encrypted_key, encryption_iv,
                         created_by_user_id, created_at, updated_at, last_used_at, is_active)
                     VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11)
                     ON CONFLICT(id) DO UPDATE SET
                        encrypted_key=excluded.encrypted_key,
                        encryption_iv=excluded.encryption_iv,
                        updated_at=excluded.updated_at,
                        last_used_at=excluded.last_used_at,
                        is_active=excluded.is_active",
                    rusqlite::params![
                        secret.id.to_string(),
                        secret.workspace_id,
                        secret.key_name,
                        enum_to_sql(&secret.provider),
                        secret.encrypted_key,
                        secret.encryption_iv,
                        secret.created_by_user_id.to_string(),
                        secret.created_at.to_rfc3339(),
                        secret.updated_at.to_rfc3339(),
                        secret.last_used_at.map(|t| t.to_rfc3339()),
                        secret.is_active as i64,
                    ],
                )?;
                Ok(())
            })
            .await
            .map_err(StoreError::from)
    }

    pub async fn touch_secret_last_used(&self, id: Uuid) -> Result<(), StoreError> {
        let id = id.to_string();
        let now = Utc::now().to_rfc3339();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "UPDATE byok_secrets SET last_used_at = ?1 WHERE id = ?2",
                    rusqlite::params![now, id],
                )?;
                Ok(())
            })
            .await
            .map_err(StoreError::from)
    }

    pub async fn find_jira_integration_by_id(&self, id: Uuid) -> Result<Option<JiraIntegration>, StoreError> {
        let id = id.to_string();
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare("SELECT * FROM jira_integrations WHERE id = ?1")?;
                let mut rows = stmt.query(rusqlite::params![id])?;
                if let Some(row) = rows.next()? {
                    Ok(Some(row_to_jira_integration(row)?))
                } else {
                    Ok(None)
                }
            })
            .await
            .map_err(StoreError::from)
    }

    pub async fn find_jira_integration_by_project_key(&self, project_key: &str) -> Result<Option<JiraIntegration>, StoreError> {
        let project_key = project_key.to_string();
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare("SELECT * FROM jira_integrations WHERE jira_project_key = ?1")?;
                let mut rows = stmt.query(rusqlite::params![project_key])?;
                if let Some(row) = rows.next()? {
                    Ok(Some(row_to_jira_integration(row)?))
                } else {
                    Ok(None)
                }
            })
            .await
            .map_err(StoreError::from)
    }

    pub async fn find_jira_integration(&self, workspace_id: &str) -> Result<Option<JiraIntegration>, StoreError> {
        let workspace_id = workspace_id.to_string();
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare("SELECT * FROM jira_integrations WHERE workspace_id = ?1")?;
                let mut rows = stmt.query(rusqlite::params![workspace_id])?;
                if let Some(row) = rows.next()? {
                    Ok(Some(row_to_jira_integration(row)?))
                } else {
                    Ok(None)
                }
            })
            .await
            .map_err(StoreError::from)
    }

    pub async fn list_active_jira_integrations(&self) -> Result<Vec<JiraIntegration>, StoreError> {
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare("SELECT * FROM jira_integrations WHERE is_active = 1")?;
                let rows = stmt.query_map([], row_to_jira_integration)?;
                let mut out = Vec::new();
                for r in rows {
                    out.push(r?);
                }
                Ok(out)
            })
            .await
            .map_err(StoreError::from)
    }

    pub async fn save_jira_integration(&self, integration: JiraIntegration) -> Result<(), StoreError> {
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO jira_integrations
                        (id, workspace_id, cloud_id, jira_site_url, jira_project_key, jira_project_name,
                         issue_type, sync_direction, status_mapping, field_mapping, access_token_encrypted,
                         access_token_iv, refresh_token_encrypted, refresh_token_iv, token_expires_at,
                         webhook_id, webhook_secret_encrypted, webhook_secret_iv, is_active, error_count,
                         sync_count, last_sync_at, last_error, last_error_at, connected_by)
                     VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17,?18,?19,?20,?21,?22,?23,?24,?25)
                     ON CONFLICT(workspace_id) DO UPDATE SET
                        cloud_id=excluded.cloud_id,
                        jira_site_url=excluded.jira_site_url,
                        jira_project_key=excluded.jira_project_key,
                        jira_project_name=excluded.jira_project_name,
                        issue_type=excluded.issue_type,
                        sync_direction=excluded.sync_direction,
                        status_mapping=excluded.status_mapping,
                        field_mapping=excluded.field_mapping,
                        access_token_encrypted=excluded.access_token_encrypted,
                        access_token_iv=excluded.access_token_iv,
                        refresh_token_encrypted=excluded.refresh_token_encrypted,
                        refresh_token_iv=excluded.refresh_token_iv,
                        token_expires_at=excluded.token_expires_at,
                        webhook_id=excluded.webhook_id,
                        webhook_secret_encrypted=excluded.webhook_secret_encrypted,
                        webhook_secret_iv=excluded.webhook_secret_iv,
                        is_active=excluded.is_active,
                        error_count=excluded.error_count,
                        sync_count=excluded.sync_count,
                        last_sync_at=excluded.last_sync_at,
                        last_error=excluded.last_error,
                        last_error_at=excluded.last_error_at",
                    rusqlite::params![
                        integration.id.to_string(),
                        integration.workspace_id,
                        integration.cloud_id,
                        integration.jira_site_url,
                        integration.jira_project_key,
                        integration.jira_project_name,
                        integration.issue_type,
                        enum_to_sql(&integration.sync_direction),
                        json_to_sql(&integration.status_mapping),
                        json_to_sql(&integration.field_mapping),
                        integration.access_token_encrypted,
                        integration.access_token_iv,
                        integration.refresh_token_encrypted,
                        integration.refresh_token_iv,
                        integration.token_expires_at.map(|t| t.to_rfc3339()),
                        integration.webhook_id,
                        integration.webhook_secret_encrypted,
                        integration.webhook_secret_iv,
                        integration.is_active as i64,
                        integration.error_count,
                        integration.sync_count,
                        integration.last_sync_at.map(|t| t.to_rfc3339()),
                        integration.last_error,
                        integration.last_error_at.map(|t| t.to_rfc3339()),
                        integration.connected_by,
                    ],
                )?;
                Ok(())
            })
            .await
            .map_err(StoreError::from)
    }

    pub async fn increment_jira_error_count(&self, workspace_id: &str, message: &str) -> Result<(), StoreError> {
        let workspace_id = workspace_id.to_string();
        let message = message.to_string();
        let now = Utc::now().to_rfc3339();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "UPDATE jira_integrations
                     SET error_count = error_count + 1, last_error = ?1, last_error_at = ?2
                     WHERE workspace_id = ?3",
                    rusqlite::params![message, now, workspace_id],
                )?;
                Ok(())
            })
            .await
            .map_err(StoreError::from)
    }

    pub async fn delete_jira_integration(&self, workspace_id: &str) -> Result<(), StoreError> {
        let workspace_id = workspace_id.to_string();
        self.conn
            .call(move |conn| {
                conn.execute("DELETE FROM jira_integrations WHERE workspace_id = ?1", rusqlite::params![workspace_id])?;
                Ok(())
            })
            .await
            .map_err(StoreError::from)
    }

    pub async fn find_sync_item_by_story(
        &self,
        jira_integration_id: Uuid,
        devos_story_id: &str,
    ) -> Result<Option<JiraSyncItem>, StoreError> {
        let jira_integration_id = jira_integration_id.to_string();
        let devos_story_id = devos_story_id.to_string();
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT * FROM jira_sync_items WHERE jira_integration_id = ?1 AND devos_story_id = ?2",
                )?;
                let mut rows = stmt.query(rusqlite::params![jira_integration_id, devos_story_id])?;
                if let Some(row) = rows.next()? {
                    Ok(Some(row_to_sync_item(row)?))
                } else {
                    Ok(None)
                }
            })
            .await
            .map_err(StoreError::from)
    }

    pub async fn find_sync_item_by_issue(
        &self,
        jira_integration_id: Uuid,
        jira_issue_id: &str,
    ) -> Result<Option<JiraSyncItem>, StoreError> {
        let jira_integration_id = jira_integration_id.to_string();
        let jira_issue_id = jira_issue_id.to_string();
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT * FROM jira_sync_items WHERE jira_integration_id = ?1 AND jira_issue_id = ?2",
                )?;
                let mut rows = stmt.query(rusqlite::params![jira_integration_id, jira_issue_id])?;
                if let Some(row) = rows.next()? {
                    Ok(Some(row_to_sync_item(row)?))
                } else {
                    Ok(None)
                }
            })
            .await
            .map_err(StoreError::from)
    }

    pub async fn list_sync_items(&self, jira_integration_id: Uuid) -> Result<Vec<JiraSyncItem>, StoreError> {
        let jira_integration_id = jira_integration_id.to_string();
        self.conn
            .call(move |conn| {
                let mut stmt =
                    conn.prepare("SELECT * FROM jira_sync_items WHERE jira_integration_id = ?1")?;
                let rows = stmt.query_map(rusqlite::params![jira_integration_id], row_to_sync_item)?;
                let mut out = Vec::new();
                for r in rows {
                    out.push(r?);
                }
                Ok(out)
            })
            .await
            .map_err(StoreError::from)
    }

    pub async fn save_sync_item(&self, item: JiraSyncItem) -> Result<(), StoreError> {
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO jira_sync_items
                        (id, jira_integration_id, devos_story_id, jira_issue_key, jira_issue_id,
                         jira_issue_type, sync_status, sync_direction_last, last_synced_at,
                         last_devos_update_at, last_jira_update_at, error_message, conflict_details)
                     VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13)
                     ON CONFLICT(jira_integration_id, devos_story_id) DO UPDATE SET
                        jira_issue_key=excluded.jira_issue_key,
                        jira_issue_id=excluded.jira_issue_id,
                        jira_issue_type=excluded.jira_issue_type,
                        sync_status=excluded.sync_status,
                        sync_direction_last=excluded.sync_direction_last,
                        last_synced_at=excluded.last_synced_at,
                        last_devos_update_at=excluded.last_devos_update_at,
                        last_jira_update_at=excluded.last_jira_update_at,
                        error_message=excluded.error_message,
                        conflict_details=excluded.conflict_details",
                    rusqlite::params![
                        item.id.to_string(),
                        item.jira_integration_id.to_string(),
                        item.devos_story_id,
                        item.jira_issue_key,
                        item.jira_issue_id,
                        item.jira_issue_type,
                        enum_to_sql(&item.sync_status),
                        item.sync_direction_last.as_ref().map(enum_to_sql),
                        item.last_synced_at.map(|t| t.to_rfc3339()),
                        item.last_devos_update_at.map(|t| t.to_rfc3339()),
                        item.last_jira_update_at.map(|t| t.to_rfc3339()),
                        item.error_message,
                        item.conflict_details.as_ref().map(json_to_sql),
                    ],
                )?;
                Ok(())
            })
            .await
            .map_err(StoreError::from)
    }

    /// Persists the full text of a finished CLI session's output.
    pub async fn archive_cli_output(&self, session_id: Uuid, output: &str) -> Result<(), StoreError> {
        let session_id = session_id.to_string();
        let output = output.to_string();
        let now = Utc::now().to_rfc3339();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO cli_output_archives (session_id, output, archived_at)
                     VALUES (?1,?2,?3)
                     ON CONFLICT(session_id) DO UPDATE SET output=excluded.output, archived_at=excluded.archived_at",
                    rusqlite::params![session_id, output, now],
                )?;
                Ok(())
            })
            .await
            .map_err(StoreError::from)
    }

    pub async fn find_archived_cli_output(&self, session_id: Uuid) -> Result<Option<String>, StoreError> {
        let session_id = session_id.to_string();
        self.conn
            .call(move |conn| {
                Ok(conn.query_row(
                    "SELECT output FROM cli_output_archives WHERE session_id = ?1",
                    rusqlite::params![session_id],
                    |r| r.get::<_, String>(0),
                )
                .map(Some)
                .or_else(|e| match e {
                    rusqlite::Error::QueryReturnedNoRows => Ok(None),
                    other => Err(other),
                })?)
            })
            .await
            .map_err(StoreError::from)
    }

    pub async fn remove_sync_item(&self, jira_integration_id: Uuid, jira_issue_key: &str) -> Result<(), StoreError> {
        let jira_integration_id = jira_integration_id.to_string();
        let jira_issue_key = jira_issue_key.to_string();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "DELETE FROM jira_sync_items WHERE jira_integration_id = ?1 AND jira_issue_key = ?2",
                    rusqlite::params![jira_integration_id, jira_issue_key],
                )?;
                Ok(())
            })
            .await
            .map_err(StoreError::from)
    }
}

fn row_to_secret(row: &rusqlite::Row) -> rusqlite::Result<Secret> {
    let provider: String = row.get("provider")?;
    Ok(Secret {
        id: Uuid::parse_str(&row.get::<_, String>("id")?).unwrap_or_default(),
        workspace_id: row.get("workspace_id")?,
        key_name: row.get("key_name")?,
        provider: enum_from_sql(&provider).unwrap_or(SecretProvider::Anthropic),
        encrypted_key: row.get("encrypted_key")?,
        encryption_iv: row.get("encryption_iv")?,
        created_by_user_id: Uuid::parse_str(&row.get::<_, String>("created_by_user_id")?).unwrap_or_default(),
        created_at: parse_dt(&row.get::<_, String>("created_at")?),
        updated_at: parse_dt(&row.get::<_, String>("updated_at")?),
        last_used_at: row.get::<_, Option<String>>("last_used_at")?.map(|s| parse_dt(&s)),
        is_active: row.get::<_, i64>("is_active")? != 0,
    })
}

fn row_to_jira_integration(row: &rusqlite::Row) -> rusqlite::Result<JiraIntegration> {
    let sync_direction: String = row.get("sync_direction")?;
    let status_mapping: String = row.get("status_mapping")?;
    let field_mapping: String = row.get("field_mapping")?;
    Ok(JiraIntegration {
        id: Uuid::parse_str(&row.get::<_, String>("id")?).unwrap_or_default(),
        workspace_id: row.get("workspace_id")?,
        cloud_id: row.get("cloud_id")?,
        jira_site_url: row.get("jira_site_url")?,
        jira_project_key: row.get("jira_project_key")?,
        jira_project_name: row.get("jira_project_name")?,
        issue_type: row.get("issue_type")?,
        sync_direction: enum_from_sql(&sync_direction).unwrap_or(JiraSyncDirection::Bidirectional),
        status_mapping: json_from_sql(&status_mapping),
        field_mapping: json_from_sql(&field_mapping),
        access_token_encrypted: row.get("access_token_encrypted")?,
        access_token_iv: row.get("access_token_iv")?,
        refresh_token_encrypted: row.get("refresh_token_encrypted")?,
        refresh_token_iv: row.get("refresh_token_iv")?,
        token_expires_at: row.get::<_, Option<String>>("token_expires_at")?.map(|s| parse_dt(&s)),
        webhook_id: row.get("webhook_id")?,
        webhook_secret_encrypted: row.get("webhook_secret_encrypted")?,
        webhook_secret_iv: row.get("webhook_secret_iv")?,
        is_active: row.get::<_, i64>("is_active")? != 0,
        error_count: row.get("error_count")?,
        sync_count: row.get("sync_count")?,
        last_sync_at: row.get::<_, Option<String>>("last_sync_at")?.map(|s| parse_dt(&s)),
        last_error: row.get("last_error")?,
        last_error_at: row.get::<_, Option<String>>("last_error_at")?.map(|s| parse_dt(&s)),
        connected_by: row.get("connected_by")?,
    })
}

fn row_to_sync_item(row: &rusqlite::Row) -> rusqlite::Result<JiraSyncItem> {
    let sync_status: String = row.get("sync_status")?;
    let sync_direction_last: Option<String> = row.get("sync_direction_last")?;
    let conflict_details: Option<String> = row.get("conflict_details")?;
    Ok(JiraSyncItem {
        id: Uuid::parse_str(&row.get::<_, String>("id")?).unwrap_or_default(),
        jira_integration_id: Uuid::parse_str(&row.get::<_, String>("jira_integration_id")?).unwrap_or_default(),
        devos_story_id: row.get("devos_story_id")?,
        jira_issue_key: row.get("jira_issue_key")?,
        jira_issue_id: row.get("jira_issue_id")?,
        jira_issue_type: row.get("jira_issue_type")?,
        sync_status: enum_from_sql(&sync_status).unwrap_or(JiraSyncStatus::Pending),
        sync_direction_last: sync_direction_last.and_then(|s| enum_from_sql(&s).ok()),
        last_synced_at: row.get::<_, Option<String>>("last_synced_at")?.map(|s| parse_dt(&s)),
        last_devos_update_at: row.get::<_, Option<String>>("last_devos_update_at")?.map(|s| parse_dt(&s)),
        last_jira_update_at: row.get::<_, Option<String>>("last_jira_update_at")?.map(|s| parse_dt(&s)),
        error_message: row.get("error_message")?,
        conflict_details: conflict_details.map(|s| json_from_sql(&s)),
    })
}

fn parse_dt(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s).map(|d| d.with_timezone(&Utc)).unwrap_or_else(|_| Utc::now())
}

fn row_to_pipeline_context(row: &rusqlite::Row) -> rusqlite::Result<PipelineContext> {
    let current_state: String = row.get("current_state")?;
    let previous_state: Option<String> = row.get("previous_state")?;
    let metadata: String = row.get("metadata")?;
    Ok(PipelineContext {
        project_id: row.get("project_id")?,
        workspace_id: row.get("workspace_id")?,
        workflow_id: Uuid::parse_str(&row.get::<_, String>("workflow_id")?).unwrap_or_default(),
        current_state: enum_from_sql(&current_state).unwrap_or(PipelineState::Idle),
        previous_state: previous_state.and_then(|s| enum_from_sql(&s).ok()),
        state_entered_at: parse_dt(&row.get::<_, String>("state_entered_at")?),
        active_agent_id: row
            .get::<_, Option<String>>("active_agent_id")?
            .and_then(|s| Uuid::parse_str(&s).ok()),
        active_agent_type: row.get("active_agent_type")?,
        current_story_id: row.get("current_story_id")?,
        retry_count: row.get("retry_count")?,
        max_retries: row.get("max_retries")?,
        metadata: json_from_sql(&metadata),
        created_at: parse_dt(&row.get::<_, String>("created_at")?),
        updated_at: parse_dt(&row.get::<_, String>("updated_at")?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;

    fn sample_context(project_id: &str) -> PipelineContext {
        let now = Utc::now();
        PipelineContext {
            project_id: project_id.to_string(),
            workspace_id: "W1".to_string(),
            workflow_id: Uuid::new_v4(),
            current_state: PipelineState::Planning,
            previous_state: None,
            state_entered_at: now,
            active_agent_id: None,
            active_agent_type: None,
            current_story_id: None,
            retry_count: 0,
            max_retries: 3,
            metadata: json!({}),
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn save_and_find_roundtrip() {
        let store = Store::open_in_memory().await.unwrap();
        store.save_pipeline_context(sample_context("P1")).await.unwrap();
        let found = store.find_pipeline_context("P1").await.unwrap().unwrap();
        assert_eq!(found.current_state, PipelineState::Planning);
        assert_eq!(found.workspace_id, "W1");
    }

    #[tokio::test]
    async fn upsert_overwrites_existing() {
        let store = Store::open_in_memory().await.unwrap();
        store.save_pipeline_context(sample_context("P1")).await.unwrap();
        let mut updated = sample_context("P1");
        updated.current_state = PipelineState::Qa;
        store.save_pipeline_context(updated).await.unwrap();
        let found = store.find_pipeline_context("P1").await.unwrap().unwrap();
        assert_eq!(found.current_state, PipelineState::Qa);
    }

    #[tokio::test]
    async fn list_active_excludes_terminal_states() {
        let store = Store::open_in_memory().await.unwrap();
        store.save_pipeline_context(sample_context("P1")).await.unwrap();
        let mut terminal = sample_context("P2");
        terminal.current_state = PipelineState::Complete;
        store.save_pipeline_context(terminal).await.unwrap();
        let active = store.list_active_pipeline_contexts().await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].project_id, "P1");
    }

    #[tokio::test]
    async fn append_and_count_handoff_history() {
        let store = Store::open_in_memory().await.unwrap();
        let now = Utc::now();
        store
            .append_handoff_history(HandoffHistory {
                id: Uuid::new_v4(),
                workspace_id: "W1".to_string(),
                story_id: "S1".to_string(),
                from_agent_type: "planner".to_string(),
                from_agent_id: None,
                to_agent_type: "dev".to_string(),
                to_agent_id: None,
                from_phase: "planning".to_string(),
                to_phase: "implementing".to_string(),
                handoff_type: HandoffType::Normal,
                context_summary: "story ready".to_string(),
                iteration_count: 0,
                duration_ms: 10,
                metadata: json!({}),
                created_at: now,
            })
            .await
            .unwrap();
        assert_eq!(store.count_handoff_history("W1").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn secret_roundtrip_and_active_lookup() {
        let store = Store::open_in_memory().await.unwrap();
        let now = Utc::now();
        store
            .save_secret(Secret {
                id: Uuid::new_v4(),
                workspace_id: "W1".to_string(),
                key_name: "primary".to_string(),
                provider: SecretProvider::Anthropic,
                encrypted_key: "ct".to_string(),
                encryption_iv: "iv".to_string(),
                created_by_user_id: Uuid::new_v4(),
                created_at: now,
                updated_at: now,
                last_used_at: None,
                is_active: true,
            })
            .await
            .unwrap();
        let found = store.find_active_secret("W1", SecretProvider::Anthropic).await.unwrap();
        assert!(found.is_some());
        assert_eq!(found.unwrap().key_name, "primary");
    }

    #[tokio::test]
    async fn jira_integration_upsert_by_workspace() {
        let store = Store::open_in_memory().await.unwrap();
        let mut integration = sample_integration("W1");
        store.save_jira_integration(integration.clone()).await.unwrap();
        integration.is_active = true;
        integration.sync_count = 5;
        store.save_jira_integration(integration).await.unwrap();
        let found = store.find_jira_integration("W1").await.unwrap().unwrap();
        assert_eq!(found.sync_count, 5);
        assert!(found.is_active);
    }

    #[tokio::test]
    async fn find_jira_integration_by_id_and_project_key() {
        let store = Store::open_in_memory().await.unwrap();
        let mut integration = sample_integration("W1");
        integration.jira_project_key = Some("PROJ".to_string());
        let id = integration.id;
        store.save_jira_integration(integration).await.unwrap();

        assert_eq!(store.find_jira_integration_by_id(id).await.unwrap().unwrap().workspace_id, "W1");
        assert_eq!(store.find_jira_integration_by_project_key("PROJ").await.unwrap().unwrap().id, id);
        assert!(store.find_jira_integration_by_project_key("NOPE").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn delete_jira_integration_removes_the_row() {
        let store = Store::open_in_memory().await.unwrap();
        store.save_jira_integration(sample_integration("W1")).await.unwrap();
        store.delete_jira_integration("W1").await.unwrap();
        assert!(store.find_jira_integration("W1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn increment_jira_error_count_is_additive() {
        let store = Store::open_in_memory().await.unwrap();
        store.save_jira_integration(sample_integration("W1")).await.unwrap();
        store.increment_jira_error_count("W1", "boom").await.unwrap();
        store.increment_jira_error_count("W1", "boom again").await.unwrap();
        let found = store.find_jira_integration("W1").await.unwrap().unwrap();
        assert_eq!(found.error_count, 2);
        assert_eq!(found.last_error.as_deref(), Some("boom again"));
    }

    #[tokio::test]
    async fn sync_item_roundtrip_and_removal() {
        let store = Store::open_in_memory().await.unwrap();
        let integration_id = Uuid::new_v4();
        store
            .save_sync_item(JiraSyncItem {
                id: Uuid::new_v4(),
                jira_integration_id: integration_id,
                devos_story_id: "S1".to_string(),
                jira_issue_key: "PROJ-1".to_string(),
                jira_issue_id: "10001".to_string(),
                jira_issue_type: Some("Story".to_string()),
                sync_status: JiraSyncStatus::Synced,
                sync_direction_last: Some(JiraSyncDirection::DevosToJira),
                last_synced_at: Some(Utc::now()),
                last_devos_update_at: Some(Utc::now()),
                last_jira_update_at: None,
                error_message: None,
                conflict_details: None,
            })
            .await
            .unwrap();
        let found = store.find_sync_item_by_story(integration_id, "S1").await.unwrap();
        assert!(found.is_some());
        store.remove_sync_item(integration_id, "PROJ-1").await.unwrap();
        let gone = store.find_sync_item_by_story(integration_id, "S1").await.unwrap();
        assert!(gone.is_none());
    }

    #[tokio::test]
    async fn archive_cli_output_roundtrips() {
        let store = Store::open_in_memory().await.unwrap();
        let session_id = Uuid::new_v4();
        store.archive_cli_output(session_id, "line one\nline two").await.unwrap();
        let found = store.find_archived_cli_output(session_id).await.unwrap();
        assert_eq!(found.as_deref(), Some("line one\nline two"));
    }

    fn sample_integration(workspace_id: &str) -> JiraIntegration {
        JiraIntegration {
            id: Uuid::new_v4(),
            workspace_id: workspace_id.to_string(),
            cloud_id: None,
            jira_site_url: None,
            jira_project_key: None,
            jira_project_name: None,
            issue_type: None,
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
}
