use std::collections::{HashMap, HashSet, VecDeque, hash_map::Entry::Occupied};

use super::Task;
use crate::error::{PipelineError, Result};

pub fn sort_topologically(tasks: &[Task]) -> Vec<String> {
    let mut in_degrees: HashMap<&str, usize> = HashMap::new();

    for task in tasks {
        in_degrees.insert(&task.id, task.dependencies.len());
    }

    let mut queue: VecDeque<&str> = VecDeque::new();
    for (task_id, &in_degree) in &in_degrees {
        if in_degree == 0 {
            queue.push_back(task_id);
        }
    }

    let mut sorted_tasks: Vec<String> = Vec::new();

    while let Some(task_id) = queue.pop_front() {
        sorted_tasks.push(task_id.to_string());

        for dependent in tasks {
            if !dependent.dependencies.iter().any(|dep| dep == task_id) {
                continue;
            }

            let entry = in_degrees.entry(&dependent.id).and_modify(|c| *c -= 1);

            if let Occupied(entry) = entry {
                if *entry.get() == 0 {
                    queue.push_back(&dependent.id);
                }
            }
        }
    }

    sorted_tasks
}

pub fn validate_tasks(tasks: &[Task]) -> Result<()> {
    let mut task_ids: HashSet<&str> = HashSet::new();
    for task in tasks {
        if !task_ids.insert(task.id.as_str()) {
            return Err(PipelineError::Dependency(format!(
                "Task '{}' is declared more than once",
                task.id
            )));
        }
    }

    for task in tasks {
        for dep_id in &task.dependencies {
            if dep_id == &task.id {
                return Err(PipelineError::Dependency(format!(
                    "Task '{}' depends on itself",
                    task.id
                )));
            }
            if !task_ids.contains(dep_id.as_str()) {
                return Err(PipelineError::Dependency(format!(
                    "Task '{}' depends on '{}' which doesn't exist",
                    task.id, dep_id
                )));
            }
        }
    }

    detect_cycles(tasks)?;
    Ok(())
}

/// Transitive dependency closure of `target_task_id`, in execution order.
pub fn get_required_tasks(tasks: &[Task], target_task_id: &str) -> Result<Vec<String>> {
    let task_map: HashMap<&str, &Task> = tasks.iter().map(|t| (t.id.as_str(), t)).collect();

    if !task_map.contains_key(target_task_id) {
        return Err(PipelineError::Task(format!(
            "Task '{}' not found",
            target_task_id
        )));
    }

    let mut needed_tasks = HashSet::new();
    let mut queue = VecDeque::new();

    queue.push_back(target_task_id);

    while let Some(current_task_id) = queue.pop_front() {
        if needed_tasks.contains(current_task_id) {
            continue;
        }

        needed_tasks.insert(current_task_id);

        if let Some(task) = task_map.get(current_task_id) {
            for dep in &task.dependencies {
                if !needed_tasks.contains(dep.as_str()) {
                    queue.push_back(dep);
                }
            }
        }
    }

    let filtered_tasks: Vec<Task> = tasks
        .iter()
        .filter(|task| needed_tasks.contains(task.id.as_str()))
        .cloned()
        .collect();

    Ok(sort_topologically(&filtered_tasks))
}

fn detect_cycles(tasks: &[Task]) -> Result<()> {
    let task_map: HashMap<&str, &Task> = tasks.iter().map(|t| (t.id.as_str(), t)).collect();

    for task in tasks {
        let mut visited = HashSet::new();
        let mut path = Vec::new();

        if has_cycle(&task.id, &task_map, &mut visited, &mut path) {
            path.push(task.id.clone());
            return Err(PipelineError::Dependency(format!(
                "Circular dependency: {}",
                path.join(" -> ")
            )));
        }
    }

    Ok(())
}

fn has_cycle(
    task_id: &str,
    task_map: &HashMap<&str, &Task>,
    visited: &mut HashSet<String>,
    path: &mut Vec<String>,
) -> bool {
    if path.iter().any(|id| id == task_id) {
        return true;
    }

    if visited.contains(task_id) {
        return false;
    }

    visited.insert(task_id.to_string());
    path.push(task_id.to_string());

    if let Some(task) = task_map.get(task_id) {
        for dep in &task.dependencies {
            if has_cycle(dep, task_map, visited, path) {
                return true;
            }
        }
    }

    path.pop();

    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::Task;

    fn chain() -> Vec<Task> {
        vec![
            Task::exec("trim", "trim.sh"),
            Task::exec("normalise", "norm.sh").after(&["trim"]),
            Task::exec("assemble", "asm.sh").after(&["normalise", "trim"]),
            Task::exec("stats", "stats.sh").after(&["assemble"]),
        ]
    }

    fn position(order: &[String], id: &str) -> usize {
        order.iter().position(|t| t == id).unwrap()
    }

    #[test]
    fn topological_sort_respects_dependencies() {
        let order = sort_topologically(&chain());
        assert_eq!(order.len(), 4);
        assert!(position(&order, "trim") < position(&order, "normalise"));
        assert!(position(&order, "normalise") < position(&order, "assemble"));
        assert!(position(&order, "assemble") < position(&order, "stats"));
    }

    #[test]
    fn required_tasks_is_transitive_closure() {
        let order = get_required_tasks(&chain(), "assemble").unwrap();
        assert_eq!(order.len(), 3);
        assert!(!order.contains(&"stats".to_string()));
        assert!(position(&order, "trim") < position(&order, "assemble"));
    }

    #[test]
    fn unknown_target_is_an_error() {
        assert!(get_required_tasks(&chain(), "polish").is_err());
    }

    #[test]
    fn unknown_dependency_fails_validation() {
        let tasks = vec![Task::exec("trim", "trim.sh").after(&["missing"])];
        let err = validate_tasks(&tasks).unwrap_err();
        assert!(err.to_string().contains("doesn't exist"));
    }

    #[test]
    fn duplicate_ids_fail_validation() {
        let tasks = vec![Task::exec("trim", "a.sh"), Task::exec("trim", "b.sh")];
        assert!(validate_tasks(&tasks).is_err());
    }

    #[test]
    fn cycles_fail_validation() {
        let tasks = vec![
            Task::exec("a", "a.sh").after(&["b"]),
            Task::exec("b", "b.sh").after(&["a"]),
        ];
        let err = validate_tasks(&tasks).unwrap_err();
        assert!(err.to_string().contains("Circular dependency"));
    }
}
