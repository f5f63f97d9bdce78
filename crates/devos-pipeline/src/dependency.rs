//! Per-workspace "depends-on" graph. A story unblocks once every dependency
//! it names has completed.

use devos_events::event_bus::EventBus;
use devos_events::protocol::{DevosEvent, StoryUnblockedPayload};
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use chrono::Utc;

#[derive(Debug, thiserror::Error)]
pub enum DependencyError {
    #[error("adding dependency {from} -> {to} would introduce a cycle")]
    CircularDependency { from: String, to: String },
}

#[derive(Default)]
struct WorkspaceGraph {
    /// story_id -> set of story_ids it depends on (unmet until those complete)
    depends_on: HashMap<String, HashSet<String>>,
    completed: HashSet<String>,
}

pub struct StoryDependencyManager {
    graphs: Mutex<HashMap<String, WorkspaceGraph>>,
    events: EventBus,
}

impl StoryDependencyManager {
    pub fn new(events: EventBus) -> Self {
        Self { graphs: Mutex::new(HashMap::new()), events }
    }

    /// Adds `story_id depends on depends_on_id`. Rejects if this would
    /// introduce a cycle in the depends-on graph.
    pub fn add_dependency(
        &self,
        workspace_id: &str,
        story_id: &str,
        depends_on_id: &str,
    ) -> Result<(), DependencyError> {
        let mut graphs = self.graphs.lock().unwrap();
        let graph = graphs.entry(workspace_id.to_string()).or_default();

        if would_cycle(&graph.depends_on, story_id, depends_on_id) {
            return Err(DependencyError::CircularDependency {
                from: story_id.to_string(),
                to: depends_on_id.to_string(),
            });
        }

        graph
            .depends_on
            .entry(story_id.to_string())
            .or_default()
            .insert(depends_on_id.to_string());
        Ok(())
    }

    pub fn remove_dependency(&self, workspace_id: &str, story_id: &str, depends_on_id: &str) {
        let mut graphs = self.graphs.lock().unwrap();
        if let Some(graph) = graphs.get_mut(workspace_id) {
            if let Some(deps) = graph.depends_on.get_mut(story_id) {
                deps.remove(depends_on_id);
            }
        }
    }

    /// Stories still blocking `story_id` — dependencies not yet completed.
    pub fn get_blocking_stories(&self, workspace_id: &str, story_id: &str) -> Vec<String> {
        let graphs = self.graphs.lock().unwrap();
        let Some(graph) = graphs.get(workspace_id) else { return Vec::new() };
        graph
            .depends_on
            .get(story_id)
            .map(|deps| {
                deps.iter()
                    .filter(|d| !graph.completed.contains(*d))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Marks `story_id` complete and returns the stories newly unblocked by
    /// it, emitting `orchestrator.story_unblocked` for each.
    pub fn mark_story_complete(&self, workspace_id: &str, story_id: &str) -> Vec<String> {
        let mut unblocked = Vec::new();
        {
            let mut graphs = self.graphs.lock().unwrap();
            let graph = graphs.entry(workspace_id.to_string()).or_default();
            graph.completed.insert(story_id.to_string());

            for (candidate, deps) in graph.depends_on.iter() {
                if candidate == story_id {
                    continue;
                }
                let still_blocked = deps.iter().any(|d| !graph.completed.contains(d));
                let had_this_dependency = deps.contains(story_id);
                if had_this_dependency && !still_blocked {
                    unblocked.push(candidate.clone());
                }
            }
        }

        for story_id in &unblocked {
            self.events.publish(DevosEvent::OrchestratorStoryUnblocked(StoryUnblockedPayload {
                workspace_id: workspace_id.to_string(),
                story_id: story_id.clone(),
                timestamp: Utc::now(),
            }));
        }
        unblocked
    }

    /// Stories that currently have at least one unmet dependency.
    pub fn list_blocked_stories(&self, workspace_id: &str) -> Vec<String> {
        let graphs = self.graphs.lock().unwrap();
        let Some(graph) = graphs.get(workspace_id) else { return Vec::new() };
        graph
            .depends_on
            .iter()
            .filter(|(_, deps)| deps.iter().any(|d| !graph.completed.contains(d)))
            .map(|(story, _)| story.clone())
            .collect()
    }

    pub fn get_dependency_graph(&self, workspace_id: &str) -> HashMap<String, Vec<String>> {
        let graphs = self.graphs.lock().unwrap();
        graphs
            .get(workspace_id)
            .map(|g| {
                g.depends_on
                    .iter()
                    .map(|(k, v)| (k.clone(), v.iter().cloned().collect()))
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Would adding `story depends_on target` create a cycle? True if `story`
/// is reachable from `target` via the existing depends-on edges.
fn would_cycle(
    depends_on: &HashMap<String, HashSet<String>>,
    story: &str,
    target: &str,
) -> bool {
    if story == target {
        return true;
    }
    let mut stack = vec![target.to_string()];
    let mut seen = HashSet::new();
    while let Some(node) = stack.pop() {
        if node == story {
            return true;
        }
        if !seen.insert(node.clone()) {
            continue;
        }
        if let Some(deps) = depends_on.get(&node) {
            stack.extend(deps.iter().cloned());
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blocking_stories_lists_incomplete_dependencies() {
        let mgr = StoryDependencyManager::new(EventBus::new());
        mgr.add_dependency("W1", "S2", "S1").unwrap();
        assert_eq!(mgr.get_blocking_stories("W1", "S2"), vec!["S1".to_string()]);
    }

    #[test]
    fn completing_dependency_unblocks_dependent() {
        let mgr = StoryDependencyManager::new(EventBus::new());
        mgr.add_dependency("W1", "S2", "S1").unwrap();
        let unblocked = mgr.mark_story_complete("W1", "S1");
        assert_eq!(unblocked, vec!["S2".to_string()]);
        assert!(mgr.get_blocking_stories("W1", "S2").is_empty());
    }

    #[test]
    fn direct_cycle_is_rejected() {
        let mgr = StoryDependencyManager::new(EventBus::new());
        mgr.add_dependency("W1", "S1", "S2").unwrap();
        let err = mgr.add_dependency("W1", "S2", "S1");
        assert!(matches!(err, Err(DependencyError::CircularDependency { .. })));
    }

    #[test]
    fn indirect_cycle_is_rejected() {
        let mgr = StoryDependencyManager::new(EventBus::new());
        mgr.add_dependency("W1", "S2", "S1").unwrap();
        mgr.add_dependency("W1", "S3", "S2").unwrap();
        let err = mgr.add_dependency("W1", "S1", "S3");
        assert!(matches!(err, Err(DependencyError::CircularDependency { .. })));
    }

    #[test]
    fn story_with_multiple_dependencies_stays_blocked_until_all_complete() {
        let mgr = StoryDependencyManager::new(EventBus::new());
        mgr.add_dependency("W1", "S3", "S1").unwrap();
        mgr.add_dependency("W1", "S3", "S2").unwrap();
        assert!(mgr.mark_story_complete("W1", "S1").is_empty());
        let unblocked = mgr.mark_story_complete("W1", "S2");
        assert_eq!(unblocked, vec!["S3".to_string()]);
    }
}
