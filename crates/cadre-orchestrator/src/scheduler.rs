// Task graph helpers
//
// Dependency hygiene for registered plans: duplicate ids, unknown
// dependencies, and cycles are repaired with warnings (a malformed graph is
// a plan defect, not a run failure), and tasks whose dependencies can never
// complete are blocked.

use std::collections::{HashMap, HashSet};

use cadre_types::{TaskId, TaskRecord, TaskStatus};

pub struct TaskScheduler;

impl TaskScheduler {
    /// Repair a freshly parsed task list in place. Returns warnings for
    /// everything that had to be dropped.
    pub fn sanitize(tasks: &mut Vec<TaskRecord>) -> Vec<String> {
        let mut warnings = Vec::new();

        // Duplicate ids keep the first occurrence.
        let mut seen: HashSet<TaskId> = HashSet::new();
        tasks.retain(|task| {
            if seen.insert(task.id.clone()) {
                true
            } else {
                warnings.push(format!("duplicate task id {} dropped", task.id));
                false
            }
        });

        // Unknown dependencies are dropped edge by edge.
        let ids: HashSet<TaskId> = tasks.iter().map(|t| t.id.clone()).collect();
        for task in tasks.iter_mut() {
            task.depends_on.retain(|dep| {
                if ids.contains(dep) {
                    true
                } else {
                    warnings.push(format!(
                        "task {} depends on unknown task {}; edge dropped",
                        task.id, dep
                    ));
                    false
                }
            });
        }

        // Cycles would deadlock the wave loop; clear the edges of every
        // task on the cycle path.
        while let Some(path) = Self::detect_cycle(tasks) {
            warnings.push(format!(
                "dependency cycle {}; edges cleared",
                path.join(" -> ")
            ));
            let on_path: HashSet<&str> = path.iter().map(|s| s.as_str()).collect();
            for task in tasks.iter_mut() {
                if on_path.contains(task.id.as_str()) {
                    task.depends_on.clear();
                }
            }
        }

        warnings
    }

    /// First dependency cycle found, as the path that closes it.
    pub fn detect_cycle(tasks: &[TaskRecord]) -> Option<Vec<TaskId>> {
        let by_id: HashMap<&str, &TaskRecord> =
            tasks.iter().map(|t| (t.id.as_str(), t)).collect();

        for task in tasks {
            let mut visited = HashSet::new();
            let mut path = Vec::new();
            if dfs_cycle(&task.id, &by_id, &mut visited, &mut path) {
                return Some(path);
            }
        }
        None
    }

    /// Pending tasks whose dependency set contains a task that can never
    /// complete.
    pub fn blocked_by_dead_deps(tasks: &[TaskRecord]) -> Vec<TaskId> {
        let dead: HashSet<&str> = tasks
            .iter()
            .filter(|t| matches!(t.status, TaskStatus::Blocked | TaskStatus::Cancelled))
            .map(|t| t.id.as_str())
            .collect();

        tasks
            .iter()
            .filter(|t| {
                t.status == TaskStatus::Pending
                    && t.depends_on.iter().any(|d| dead.contains(d.as_str()))
            })
            .map(|t| t.id.clone())
            .collect()
    }
}

fn dfs_cycle(
    task_id: &str,
    by_id: &HashMap<&str, &TaskRecord>,
    visited: &mut HashSet<String>,
    path: &mut Vec<String>,
) -> bool {
    if path.iter().any(|p| p == task_id) {
        path.push(task_id.to_string());
        return true;
    }
    if visited.contains(task_id) {
        return false;
    }
    visited.insert(task_id.to_string());
    path.push(task_id.to_string());

    if let Some(task) = by_id.get(task_id) {
        for dep in &task.depends_on {
            if dfs_cycle(dep, by_id, visited, path) {
                return true;
            }
        }
    }

    path.pop();
    false
}
