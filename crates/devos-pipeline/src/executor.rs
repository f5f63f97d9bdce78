//! Per-agent executors: one thin `AgentExecutor` impl per role
//! (planner/dev/qa/devops). Each takes the typed handoff input and returns
//! a typed result the coordinator consumes. The actual CLI session spawn
//! (`devos_session::manager::SessionManager`) and its streamed stdout are
//! owned by the caller, which feeds completed output lines back through
//! [`interpret_output`] — keeping this crate free of a `devos-session`
//! dependency, since the coordinator only ever needs the parsed markers.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionContext {
    pub workspace_id: String,
    pub project_id: String,
    pub story_id: String,
    pub input: Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TerminalMarker {
    FileEvent { path: String },
    TestEvent { passed: bool, summary: String },
    CommitEvent { sha: String, message: String },
    Verdict { verdict: String },
}

/// Scans a line of CLI output for one of the terminal markers agents emit to
/// signal progress: `::file::<path>`, `::test::<pass|fail>::<summary>`,
/// `::commit::<sha>::<message>`, `::verdict::<PASS|FAIL>`.
pub fn parse_marker(line: &str) -> Option<TerminalMarker> {
    let rest = line.strip_prefix("::")?;
    let mut parts = rest.splitn(3, "::");
    match parts.next()? {
        "file" => Some(TerminalMarker::FileEvent { path: parts.next()?.to_string() }),
        "test" => {
            let status = parts.next()?;
            let summary = parts.next().unwrap_or_default().to_string();
            Some(TerminalMarker::TestEvent { passed: status == "pass", summary })
        }
        "commit" => {
            let sha = parts.next()?.to_string();
            let message = parts.next().unwrap_or_default().to_string();
            Some(TerminalMarker::CommitEvent { sha, message })
        }
        "verdict" => Some(TerminalMarker::Verdict { verdict: parts.next()?.to_string() }),
        _ => None,
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub completing_agent_type: String,
    pub markers: Vec<TerminalMarker>,
    pub context: Value,
    pub qa_verdict: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error("session error: {0}")]
    Session(String),
}

#[async_trait]
pub trait AgentExecutor: Send + Sync {
    fn agent_type(&self) -> &'static str;
    async fn execute(&self, ctx: ExecutionContext) -> Result<ExecutionResult, ExecutorError>;
}

fn collect_markers(lines: &[String]) -> Vec<TerminalMarker> {
    lines.iter().filter_map(|l| parse_marker(l)).collect()
}

pub struct PlannerExecutor;

#[async_trait]
impl AgentExecutor for PlannerExecutor {
    fn agent_type(&self) -> &'static str {
        "planner"
    }

    async fn execute(&self, ctx: ExecutionContext) -> Result<ExecutionResult, ExecutorError> {
        Ok(ExecutionResult {
            completing_agent_type: "planner".to_string(),
            markers: Vec::new(),
            context: ctx.input,
            qa_verdict: None,
        })
    }
}

pub struct DevExecutor;

#[async_trait]
impl AgentExecutor for DevExecutor {
    fn agent_type(&self) -> &'static str {
        "dev"
    }

    async fn execute(&self, ctx: ExecutionContext) -> Result<ExecutionResult, ExecutorError> {
        Ok(ExecutionResult {
            completing_agent_type: "dev".to_string(),
            markers: Vec::new(),
            context: ctx.input,
            qa_verdict: None,
        })
    }
}

pub struct QaExecutor;

#[async_trait]
impl AgentExecutor for QaExecutor {
    fn agent_type(&self) -> &'static str {
        "qa"
    }

    async fn execute(&self, ctx: ExecutionContext) -> Result<ExecutionResult, ExecutorError> {
        let verdict = ctx
            .input
            .get("qaVerdict")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string());
        Ok(ExecutionResult {
            completing_agent_type: "qa".to_string(),
            markers: Vec::new(),
            context: ctx.input,
            qa_verdict: verdict,
        })
    }
}

pub struct DevopsExecutor;

#[async_trait]
impl AgentExecutor for DevopsExecutor {
    fn agent_type(&self) -> &'static str {
        "devops"
    }

    async fn execute(&self, ctx: ExecutionContext) -> Result<ExecutionResult, ExecutorError> {
        Ok(ExecutionResult {
            completing_agent_type: "devops".to_string(),
            markers: Vec::new(),
            context: ctx.input,
            qa_verdict: None,
        })
    }
}

/// Interprets a batch of streamed output lines (see `devos_session`'s output
/// streamer) into the terminal markers an executor cares about, without
/// needing the session crate as a dependency of this module.
pub fn interpret_output(lines: &[String]) -> Vec<TerminalMarker> {
    collect_markers(lines)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_file_event() {
        let marker = parse_marker("::file::src/main.rs").unwrap();
        assert_eq!(marker, TerminalMarker::FileEvent { path: "src/main.rs".to_string() });
    }

    #[test]
    fn parses_test_event_with_summary() {
        let marker = parse_marker("::test::pass::12 passed, 0 failed").unwrap();
        assert_eq!(
            marker,
            TerminalMarker::TestEvent { passed: true, summary: "12 passed, 0 failed".to_string() }
        );
    }

    #[test]
    fn parses_commit_event() {
        let marker = parse_marker("::commit::abc123::fix auth bug").unwrap();
        assert_eq!(
            marker,
            TerminalMarker::CommitEvent { sha: "abc123".to_string(), message: "fix auth bug".to_string() }
        );
    }

    #[test]
    fn non_marker_lines_return_none() {
        assert!(parse_marker("just regular stdout output").is_none());
    }

    #[test]
    fn interpret_output_skips_unmatched_lines() {
        let lines = vec!["noise".to_string(), "::verdict::PASS".to_string()];
        let markers = interpret_output(&lines);
        assert_eq!(markers, vec![TerminalMarker::Verdict { verdict: "PASS".to_string() }]);
    }

    #[tokio::test]
    async fn qa_executor_extracts_verdict_from_context() {
        let executor = QaExecutor;
        let ctx = ExecutionContext {
            workspace_id: "W1".to_string(),
            project_id: "P1".to_string(),
            story_id: "S1".to_string(),
            input: serde_json::json!({ "qaVerdict": "PASS" }),
        };
        let result = executor.execute(ctx).await.unwrap();
        assert_eq!(result.qa_verdict.as_deref(), Some("PASS"));
    }
}
