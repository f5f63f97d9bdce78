//! Background daemon for the agent pipeline orchestrator.
//!
//! The daemon owns the durable pipeline state machine, the handoff
//! coordinator, CLI session lifecycle management, and (when configured) the
//! Jira two-way sync engine. It runs two background sweeps — stale pipeline
//! recovery and Jira full sync — until asked to shut down.

pub mod daemon;
