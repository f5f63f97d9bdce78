//! CLI session lifecycle and output streaming (`spec.md` §4.3, §4.4).
//!
//! Agent processes are plain child processes (`tokio::process::Command`),
//! not pseudo-terminals — their stdout/stderr are piped and consumed
//! line-by-line, which is all the handoff contract in `devos-pipeline`
//! needs from them.

pub mod manager;
pub mod streaming;
