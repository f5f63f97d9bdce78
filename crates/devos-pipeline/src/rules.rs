//! Coordination rules engine: independent predicates evaluated against the
//! current active-agents snapshot and the intended handoff.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const DEFAULT_MAX_PARALLEL_AGENTS: usize = 5;
pub const MAX_QA_ITERATIONS: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Severity {
    Warning,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleViolation {
    pub rule: &'static str,
    pub severity: Severity,
    pub message: String,
}

#[derive(Debug, Clone)]
pub struct ActiveAgent {
    pub agent_id: Uuid,
    pub agent_type: String,
    pub story_id: String,
    pub phase: String,
}

#[derive(Debug, Clone)]
pub struct HandoffIntent<'a> {
    pub to_agent_type: &'a str,
    pub story_id: &'a str,
    pub intended_qa_agent_id: Option<Uuid>,
    pub intended_dev_agent_id: Option<Uuid>,
    pub qa_verdict: Option<&'a str>,
    pub iteration_count: u32,
    pub max_parallel_agents: usize,
}

#[derive(Debug, Clone)]
pub struct RuleEvalResult {
    pub allowed: bool,
    pub violations: Vec<RuleViolation>,
}

pub struct CoordinationRulesEngine;

impl CoordinationRulesEngine {
    pub fn evaluate(intent: &HandoffIntent<'_>, active_agents: &[ActiveAgent]) -> RuleEvalResult {
        let mut violations = Vec::new();

        // 1. one-dev-per-story
        if intent.to_agent_type == "dev"
            && active_agents
                .iter()
                .any(|a| a.agent_type == "dev" && a.story_id == intent.story_id)
        {
            violations.push(RuleViolation {
                rule: "one-dev-per-story",
                severity: Severity::Error,
                message: format!("story {} already has an active dev agent", intent.story_id),
            });
        }

        // 2. qa-independence
        if intent.to_agent_type == "qa" {
            if let (Some(qa_id), Some(dev_id)) =
                (intent.intended_qa_agent_id, intent.intended_dev_agent_id)
            {
                if qa_id == dev_id {
                    violations.push(RuleViolation {
                        rule: "qa-independence",
                        severity: Severity::Error,
                        message: "qa agent must differ from the dev agent for the same story".into(),
                    });
                }
            }
        }

        // 3. devops-requires-qa-pass
        if intent.to_agent_type == "devops" && intent.qa_verdict != Some("PASS") {
            violations.push(RuleViolation {
                rule: "devops-requires-qa-pass",
                severity: Severity::Error,
                message: "devops handoff requires a PASS qa verdict".into(),
            });
        }

        // 4. max-parallel-agents
        if active_agents.len() >= intent.max_parallel_agents {
            violations.push(RuleViolation {
                rule: "max-parallel-agents",
                severity: Severity::Error,
                message: format!(
                    "{} active agents already at the {} limit",
                    active_agents.len(),
                    intent.max_parallel_agents
                ),
            });
        }

        // 5. no-duplicate-phases
        let target_phase = phase_for(intent.to_agent_type);
        if active_agents
            .iter()
            .any(|a| a.story_id == intent.story_id && a.phase == target_phase)
        {
            violations.push(RuleViolation {
                rule: "no-duplicate-phases",
                severity: Severity::Error,
                message: format!("story {} is already active in phase {target_phase}", intent.story_id),
            });
        }

        // 6. iteration-limit
        if intent.iteration_count > MAX_QA_ITERATIONS {
            violations.push(RuleViolation {
                rule: "iteration-limit",
                severity: Severity::Error,
                message: format!("iteration count {} exceeds the limit", intent.iteration_count),
            });
        } else if intent.iteration_count == MAX_QA_ITERATIONS - 1 {
            violations.push(RuleViolation {
                rule: "iteration-limit",
                severity: Severity::Warning,
                message: "one iteration remains before escalation".into(),
            });
        }

        let allowed = !violations.iter().any(|v| v.severity == Severity::Error);
        RuleEvalResult { allowed, violations }
    }
}

fn phase_for(agent_type: &str) -> &'static str {
    match agent_type {
        "planner" => "planning",
        "dev" => "implementing",
        "qa" => "qa",
        "devops" => "deploying",
        _ => "unknown",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_intent() -> HandoffIntent<'static> {
        HandoffIntent {
            to_agent_type: "dev",
            story_id: "S1",
            intended_qa_agent_id: None,
            intended_dev_agent_id: None,
            qa_verdict: None,
            iteration_count: 0,
            max_parallel_agents: DEFAULT_MAX_PARALLEL_AGENTS,
        }
    }

    #[test]
    fn one_dev_per_story_blocks_second_dev() {
        let active = vec![ActiveAgent {
            agent_id: Uuid::new_v4(),
            agent_type: "dev".into(),
            story_id: "S1".into(),
            phase: "implementing".into(),
        }];
        let result = CoordinationRulesEngine::evaluate(&base_intent(), &active);
        assert!(!result.allowed);
        assert!(result.violations.iter().any(|v| v.rule == "one-dev-per-story"));
    }

    #[test]
    fn devops_without_pass_verdict_is_blocked() {
        let mut intent = base_intent();
        intent.to_agent_type = "devops";
        intent.qa_verdict = Some("FAIL");
        let result = CoordinationRulesEngine::evaluate(&intent, &[]);
        assert!(!result.allowed);
        assert!(result.violations.iter().any(|v| v.rule == "devops-requires-qa-pass"));
    }

    #[test]
    fn max_parallel_agents_is_the_only_queueing_violation() {
        let mut intent = base_intent();
        intent.max_parallel_agents = 1;
        let active = vec![ActiveAgent {
            agent_id: Uuid::new_v4(),
            agent_type: "qa".into(),
            story_id: "S9".into(),
            phase: "qa".into(),
        }];
        let result = CoordinationRulesEngine::evaluate(&intent, &active);
        assert!(!result.allowed);
        assert_eq!(result.violations.len(), 1);
        assert_eq!(result.violations[0].rule, "max-parallel-agents");
    }

    #[test]
    fn iteration_limit_warns_one_below_escalation() {
        let mut intent = base_intent();
        intent.iteration_count = MAX_QA_ITERATIONS - 1;
        let result = CoordinationRulesEngine::evaluate(&intent, &[]);
        assert!(result.allowed);
        assert_eq!(result.violations[0].severity, Severity::Warning);
    }

    #[test]
    fn iteration_limit_errors_when_exceeded() {
        let mut intent = base_intent();
        intent.iteration_count = MAX_QA_ITERATIONS + 1;
        let result = CoordinationRulesEngine::evaluate(&intent, &[]);
        assert!(!result.allowed);
    }

    #[test]
    fn clean_intent_with_no_active_agents_is_allowed() {
        let result = CoordinationRulesEngine::evaluate(&base_intent(), &[]);
        assert!(result.allowed);
        assert!(result.violations.is_empty());
    }
}
