//! Incremental task graph with admission-time validation.
//!
//! The graph is owned by one scheduler instance per pipeline run. An edge
//! (A → B) means "B cannot start until A completes". Admission validates
//! dependencies and rejects any insertion that would close a cycle, leaving
//! the graph exactly as it was before the call.

use std::collections::{HashMap, HashSet};

use crate::errors::SchedulerError;
use crate::task::{Task, TaskId, TaskStatus};

/// A directed acyclic graph of tasks keyed by id.
#[derive(Debug, Default)]
pub struct TaskGraph {
    tasks: HashMap<TaskId, Task>,
    /// Forward edges: task id -> ids of tasks that depend on it.
    dependents: HashMap<TaskId, Vec<TaskId>>,
    /// Ids in admission order, for FIFO tie-breaking.
    admission_order: Vec<TaskId>,
    total_admitted: usize,
}

impl TaskGraph {
    /// Create an empty graph.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a task and its declared dependencies.
    ///
    /// Every referenced dependency must already be admitted (a task may
    /// reference itself, which the cycle check then rejects). If inserting
    /// the task would create a cycle it is removed again and the call fails
    /// with `CycleDetected`; no partial insertion survives.
    pub fn admit(&mut self, task: Task) -> Result<(), SchedulerError> {
        if self.tasks.contains_key(&task.id) {
            return Err(SchedulerError::DuplicateTask {
                task_id: task.id.clone(),
            });
        }
        for dep in &task.depends_on {
            if *dep != task.id && !self.tasks.contains_key(dep) {
                return Err(SchedulerError::UnknownDependency {
                    task_id: task.id.clone(),
                    dependency: dep.clone(),
                });
            }
        }

        let id = task.id.clone();
        for dep in &task.depends_on {
            self.dependents.entry(dep.clone()).or_default().push(id.clone());
        }
        self.tasks.insert(id.clone(), task);
        self.admission_order.push(id.clone());

        if self.has_cycle() {
            let task = self.tasks.remove(&id).expect("task was just inserted");
            for dep in &task.depends_on {
                if let Some(deps) = self.dependents.get_mut(dep) {
                    deps.retain(|t| t != &id);
                }
            }
            self.admission_order.pop();
            return Err(SchedulerError::CycleDetected { task_id: id });
        }

        self.total_admitted += 1;
        Ok(())
    }

    /// Insert a task without dependency or cycle validation. Test support
    /// for corrupted-state scenarios the normal API cannot produce.
    #[cfg(test)]
    pub(crate) fn admit_unchecked(&mut self, task: Task) {
        let id = task.id.clone();
        for dep in &task.depends_on {
            self.dependents.entry(dep.clone()).or_default().push(id.clone());
        }
        self.tasks.insert(id.clone(), task);
        self.admission_order.push(id);
        self.total_admitted += 1;
    }

    /// Total tasks ever admitted.
    pub fn total_admitted(&self) -> usize {
        self.total_admitted
    }

    /// Number of tasks in the graph.
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Check if the graph is empty.
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Get a task by id.
    pub fn get(&self, id: &str) -> Option<&Task> {
        self.tasks.get(id)
    }

    /// Get a mutable task by id.
    pub fn get_mut(&mut self, id: &str) -> Option<&mut Task> {
        self.tasks.get_mut(id)
    }

    /// Pending tasks whose dependencies are all completed, in admission
    /// order.
    pub fn ready_tasks(&self) -> Vec<TaskId> {
        self.admission_order
            .iter()
            .filter(|id| {
                let Some(task) = self.tasks.get(*id) else {
                    return false;
                };
                task.status == TaskStatus::Pending && self.dependencies_satisfied(task)
            })
            .cloned()
            .collect()
    }

    fn dependencies_satisfied(&self, task: &Task) -> bool {
        task.depends_on.iter().all(|dep| {
            self.tasks
                .get(dep)
                .is_some_and(|t| t.status == TaskStatus::Completed)
        })
    }

    /// Check if every task is in a terminal status.
    pub fn all_terminal(&self) -> bool {
        self.tasks.values().all(|t| t.status.is_terminal())
    }

    /// Number of tasks not yet in a terminal status.
    pub fn unfinished(&self) -> usize {
        self.tasks
            .values()
            .filter(|t| !t.status.is_terminal())
            .count()
    }

    /// Mark every non-terminal transitive dependent of a failed task as
    /// skipped. Returns the skipped ids in admission order.
    pub fn skip_dependents(&mut self, failed_id: &str) -> Vec<TaskId> {
        let mut affected = HashSet::new();
        let mut stack: Vec<TaskId> = self
            .dependents
            .get(failed_id)
            .cloned()
            .unwrap_or_default();

        while let Some(id) = stack.pop() {
            if !affected.insert(id.clone()) {
                continue;
            }
            if let Some(next) = self.dependents.get(&id) {
                stack.extend(next.iter().cloned());
            }
        }

        let mut skipped = Vec::new();
        for id in &self.admission_order {
            if affected.contains(id)
                && let Some(task) = self.tasks.get_mut(id)
                && !task.status.is_terminal()
            {
                task.mark_skipped();
                skipped.push(id.clone());
            }
        }
        skipped
    }

    /// Mark every non-terminal task cancelled. Returns the affected ids.
    pub fn cancel_remaining(&mut self) -> Vec<TaskId> {
        let mut cancelled = Vec::new();
        for id in &self.admission_order {
            if let Some(task) = self.tasks.get_mut(id)
                && !task.status.is_terminal()
            {
                task.mark_cancelled();
                cancelled.push(id.clone());
            }
        }
        cancelled
    }

    /// Ids with the given status, in admission order.
    pub fn ids_with_status(&self, status: TaskStatus) -> Vec<TaskId> {
        self.admission_order
            .iter()
            .filter(|id| self.tasks.get(*id).is_some_and(|t| t.status == status))
            .cloned()
            .collect()
    }

    /// Fraction of tasks in a terminal status, as a percentage.
    pub fn completion_percentage(&self) -> f64 {
        if self.tasks.is_empty() {
            return 100.0;
        }
        let terminal = self
            .tasks
            .values()
            .filter(|t| t.status.is_terminal())
            .count();
        (terminal as f64 / self.tasks.len() as f64) * 100.0
    }

    /// Cycle check via Kahn's algorithm over the current edge set.
    fn has_cycle(&self) -> bool {
        let mut in_degree: HashMap<&TaskId, usize> = self
            .tasks
            .iter()
            .map(|(id, task)| (id, task.depends_on.len()))
            .collect();

        let mut queue: Vec<&TaskId> = in_degree
            .iter()
            .filter(|&(_, deg)| *deg == 0)
            .map(|(id, _)| *id)
            .collect();

        let mut processed = 0;
        while let Some(id) = queue.pop() {
            processed += 1;
            if let Some(dependents) = self.dependents.get(id) {
                for dep in dependents {
                    if let Some(deg) = in_degree.get_mut(dep) {
                        *deg -= 1;
                        if *deg == 0 {
                            queue.push(dep);
                        }
                    }
                }
            }
        }

        processed != self.tasks.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskPriority;

    fn task(id: &str, deps: Vec<&str>) -> Task {
        Task::new(id, &format!("Task {id}"), "test")
            .with_dependencies(deps.into_iter().map(String::from).collect())
    }

    #[test]
    fn admit_simple_chain() {
        let mut graph = TaskGraph::new();
        graph.admit(task("a", vec![])).unwrap();
        graph.admit(task("b", vec!["a"])).unwrap();
        graph.admit(task("c", vec!["a", "b"])).unwrap();

        assert_eq!(graph.len(), 3);
        assert_eq!(graph.total_admitted(), 3);
        assert_eq!(graph.ready_tasks(), vec!["a".to_string()]);
    }

    #[test]
    fn admit_rejects_unknown_dependency() {
        let mut graph = TaskGraph::new();
        let err = graph.admit(task("b", vec!["missing"])).unwrap_err();
        match err {
            SchedulerError::UnknownDependency { task_id, dependency } => {
                assert_eq!(task_id, "b");
                assert_eq!(dependency, "missing");
            }
            other => panic!("Expected UnknownDependency, got {other:?}"),
        }
        assert!(graph.is_empty());
    }

    #[test]
    fn admit_rejects_duplicate_id() {
        let mut graph = TaskGraph::new();
        graph.admit(task("a", vec![])).unwrap();
        let err = graph.admit(task("a", vec![])).unwrap_err();
        assert!(matches!(err, SchedulerError::DuplicateTask { .. }));
        assert_eq!(graph.len(), 1);
    }

    #[test]
    fn self_dependency_is_a_cycle_and_leaves_graph_unchanged() {
        let mut graph = TaskGraph::new();
        graph.admit(task("a", vec![])).unwrap();

        let err = graph.admit(task("b", vec!["b"])).unwrap_err();
        assert!(matches!(err, SchedulerError::CycleDetected { .. }));

        // No partial insertion: the rejected task and its edges are gone.
        assert_eq!(graph.len(), 1);
        assert!(graph.get("b").is_none());
        assert_eq!(graph.total_admitted(), 1);
        assert_eq!(graph.ready_tasks(), vec!["a".to_string()]);
    }

    #[test]
    fn readiness_tracks_dependency_completion() {
        let mut graph = TaskGraph::new();
        graph.admit(task("a", vec![])).unwrap();
        graph.admit(task("b", vec![])).unwrap();
        graph.admit(task("c", vec!["a", "b"])).unwrap();

        assert_eq!(graph.ready_tasks().len(), 2);

        graph.get_mut("a").unwrap().mark_running();
        graph
            .get_mut("a")
            .unwrap()
            .mark_completed(serde_json::Value::Null, 0);
        // c still blocked on b.
        assert_eq!(graph.ready_tasks(), vec!["b".to_string()]);

        graph
            .get_mut("b")
            .unwrap()
            .mark_completed(serde_json::Value::Null, 0);
        assert_eq!(graph.ready_tasks(), vec!["c".to_string()]);
    }

    #[test]
    fn ready_tasks_preserve_admission_order() {
        let mut graph = TaskGraph::new();
        for id in ["third", "first", "second"] {
            graph
                .admit(task(id, vec![]).with_priority(TaskPriority::Medium))
                .unwrap();
        }
        assert_eq!(
            graph.ready_tasks(),
            vec!["third".to_string(), "first".to_string(), "second".to_string()]
        );
    }

    #[test]
    fn skip_dependents_is_transitive() {
        let mut graph = TaskGraph::new();
        graph.admit(task("a", vec![])).unwrap();
        graph.admit(task("b", vec!["a"])).unwrap();
        graph.admit(task("c", vec!["b"])).unwrap();
        graph.admit(task("d", vec![])).unwrap();

        graph.get_mut("a").unwrap().mark_failed(3);
        let skipped = graph.skip_dependents("a");

        assert_eq!(skipped, vec!["b".to_string(), "c".to_string()]);
        assert_eq!(graph.get("b").unwrap().status, TaskStatus::Skipped);
        assert_eq!(graph.get("c").unwrap().status, TaskStatus::Skipped);
        assert_eq!(graph.get("d").unwrap().status, TaskStatus::Pending);
    }

    #[test]
    fn skip_dependents_leaves_terminal_tasks_alone() {
        let mut graph = TaskGraph::new();
        graph.admit(task("a", vec![])).unwrap();
        graph.admit(task("b", vec!["a"])).unwrap();
        graph
            .get_mut("b")
            .unwrap()
            .mark_completed(serde_json::Value::Null, 0);

        graph.get_mut("a").unwrap().mark_failed(1);
        let skipped = graph.skip_dependents("a");
        assert!(skipped.is_empty());
        assert_eq!(graph.get("b").unwrap().status, TaskStatus::Completed);
    }

    #[test]
    fn cancel_remaining_marks_non_terminal_tasks() {
        let mut graph = TaskGraph::new();
        graph.admit(task("a", vec![])).unwrap();
        graph.admit(task("b", vec!["a"])).unwrap();
        graph
            .get_mut("a")
            .unwrap()
            .mark_completed(serde_json::Value::Null, 0);

        let cancelled = graph.cancel_remaining();
        assert_eq!(cancelled, vec!["b".to_string()]);
        assert_eq!(graph.get("a").unwrap().status, TaskStatus::Completed);
        assert_eq!(graph.get("b").unwrap().status, TaskStatus::Cancelled);
        assert!(graph.all_terminal());
    }

    #[test]
    fn completion_percentage_counts_terminal_states() {
        let mut graph = TaskGraph::new();
        assert_eq!(graph.completion_percentage(), 100.0);

        graph.admit(task("a", vec![])).unwrap();
        graph.admit(task("b", vec![])).unwrap();
        assert_eq!(graph.completion_percentage(), 0.0);

        graph.get_mut("a").unwrap().mark_failed(0);
        assert_eq!(graph.completion_percentage(), 50.0);
    }

    #[test]
    fn corrupted_cycle_is_detected_by_kahn_check() {
        let mut graph = TaskGraph::new();
        graph.admit_unchecked(task("a", vec!["b"]));
        graph.admit_unchecked(task("b", vec!["a"]));
        assert!(graph.has_cycle());
        assert!(graph.ready_tasks().is_empty());
    }
}
