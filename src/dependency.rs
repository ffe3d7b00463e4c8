//! C4: registry of parent->child model dependencies; topological level
//! assignment; task sort (§4.3).

use std::collections::{HashMap, HashSet};

use crate::queue::SyncQueueItem;

const MAX_LEVEL_ITERATIONS: usize = 100;

#[derive(Default)]
pub struct DependencyResolver {
    /// child -> {parents}, generated from ManyToOne relations.
    parents_of: HashMap<String, HashSet<String>>,
}

impl DependencyResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, child_type: impl Into<String>, parent_type: impl Into<String>) {
        self.parents_of.entry(child_type.into()).or_default().insert(parent_type.into());
    }

    /// level(type) = 0 for roots, else 1 + max(level(parent)); iterative
    /// longest-path, capped at 100 iterations (logs a warning on saturation).
    pub fn level(&self, model_type: &str) -> u32 {
        let mut levels: HashMap<&str, u32> = HashMap::new();
        for _ in 0..MAX_LEVEL_ITERATIONS {
            let mut changed = false;
            for (child, parents) in &self.parents_of {
                let parent_max = parents.iter().map(|p| *levels.get(p.as_str()).unwrap_or(&0)).max().unwrap_or(0);
                let candidate = if parents.is_empty() { 0 } else { parent_max + 1 };
                let current = levels.get(child.as_str()).copied().unwrap_or(0);
                if candidate > current {
                    levels.insert(child.as_str(), candidate);
                    changed = true;
                }
            }
            if !changed {
                return *levels.get(model_type).unwrap_or(&0);
            }
        }
        tracing::warn!(model_type, "dependency level computation saturated at {MAX_LEVEL_ITERATIONS} iterations");
        *levels.get(model_type).unwrap_or(&0)
    }

    /// Groups tasks by `modelType`, orders groups ascending by level, within
    /// each group by ascending `createdAt`.
    pub fn sort_tasks_by_dependency_order(&self, tasks: Vec<SyncQueueItem>) -> Vec<SyncQueueItem> {
        let mut groups: HashMap<String, Vec<SyncQueueItem>> = HashMap::new();
        for task in tasks {
            groups.entry(task.model_type.clone()).or_default().push(task);
        }

        let mut group_keys: Vec<String> = groups.keys().cloned().collect();
        group_keys.sort_by_key(|t| self.level(t));

        let mut ordered = Vec::new();
        for key in group_keys {
            let mut group = groups.remove(&key).unwrap();
            group.sort_by_key(|t| t.created_at);
            ordered.extend(group);
        }
        ordered
    }

    /// DFS cycle check over the parent graph.
    pub fn has_circular_dependencies(&self) -> bool {
        #[derive(PartialEq)]
        enum Mark {
            Visiting,
            Done,
        }
        let mut marks: HashMap<&str, Mark> = HashMap::new();

        fn visit<'a>(
            node: &'a str,
            parents_of: &'a HashMap<String, HashSet<String>>,
            marks: &mut HashMap<&'a str, Mark>,
        ) -> bool {
            match marks.get(node) {
                Some(Mark::Visiting) => return true,
                Some(Mark::Done) => return false,
                None => {}
            }
            marks.insert(node, Mark::Visiting);
            if let Some(parents) = parents_of.get(node) {
                for parent in parents {
                    if visit(parent.as_str(), parents_of, marks) {
                        return true;
                    }
                }
            }
            marks.insert(node, Mark::Done);
            false
        }

        for child in self.parents_of.keys() {
            if visit(child.as_str(), &self.parents_of, &mut marks) {
                return true;
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{QueueItemStatus, SyncOp};
    use chrono::Utc;

    fn task(id: i64, model_type: &str, created_at: chrono::DateTime<Utc>) -> SyncQueueItem {
        SyncQueueItem {
            id,
            model_type: model_type.to_string(),
            model_id: format!("m{id}"),
            op: SyncOp::Create,
            payload: "{}".into(),
            attempt_count: 0,
            last_error: None,
            next_retry_at: None,
            idempotency_key: format!("k{id}"),
            status: QueueItemStatus::Pending,
            created_at,
            headers: None,
            extra: None,
            temporary_client_id: None,
            id_negotiation_status: None,
        }
    }

    #[test]
    fn levels_follow_parent_chain() {
        let mut resolver = DependencyResolver::new();
        resolver.register("Project", "User");
        resolver.register("Task", "Project");
        assert_eq!(resolver.level("User"), 0);
        assert_eq!(resolver.level("Project"), 1);
        assert_eq!(resolver.level("Task"), 2);
    }

    #[test]
    fn sort_places_parents_before_children() {
        let mut resolver = DependencyResolver::new();
        resolver.register("Project", "User");
        let now = Utc::now();
        let tasks = vec![
            task(1, "Project", now),
            task(2, "User", now + chrono::Duration::seconds(1)),
        ];
        let sorted = resolver.sort_tasks_by_dependency_order(tasks);
        assert_eq!(sorted[0].model_type, "User");
        assert_eq!(sorted[1].model_type, "Project");
    }

    #[test]
    fn detects_cycles() {
        let mut resolver = DependencyResolver::new();
        resolver.register("A", "B");
        resolver.register("B", "A");
        assert!(resolver.has_circular_dependencies());

        let mut acyclic = DependencyResolver::new();
        acyclic.register("Project", "User");
        assert!(!acyclic.has_circular_dependencies());
    }
}
