use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
    sync::Arc,
    thread,
    time::SystemTime,
};
use tokio::sync::Semaphore;

use crate::{
    cache,
    coverage::{self, Resources},
    error::{PipelineError, Result},
    task::{Task, TaskAction},
    util::{expand_globs, hash_files, parse_timeout, run_command},
};

fn default_workers() -> usize {
    thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

#[derive(Debug)]
pub struct ExecutionLevel {
    pub level: usize,
    pub task_ids: Vec<String>,
}

pub fn calculate_dependency_levels(tasks: &[Task]) -> Vec<ExecutionLevel> {
    let task_map: HashMap<&str, &Task> = tasks.iter().map(|t| (t.id.as_str(), t)).collect();
    let mut levels: HashMap<String, usize> = HashMap::new();

    for task in tasks {
        calculate_task_level(&task.id, &task_map, &mut levels);
    }

    let mut level_groups: HashMap<usize, Vec<String>> = HashMap::new();
    for (task_id, level) in levels {
        level_groups.entry(level).or_default().push(task_id);
    }

    let mut execution_levels: Vec<ExecutionLevel> = level_groups
        .into_iter()
        .map(|(level, task_ids)| ExecutionLevel { level, task_ids })
        .collect();

    execution_levels.sort_by_key(|el| el.level);
    execution_levels
}

fn calculate_task_level(
    task_id: &str,
    task_map: &HashMap<&str, &Task>,
    levels: &mut HashMap<String, usize>,
) -> usize {
    if let Some(&level) = levels.get(task_id) {
        return level;
    }

    let task = match task_map.get(task_id) {
        Some(task) => task,
        None => {
            levels.insert(task_id.to_string(), 0);
            return 0;
        }
    };

    if task.dependencies.is_empty() {
        levels.insert(task_id.to_string(), 0);
        return 0;
    }

    let max_dep_level = task
        .dependencies
        .iter()
        .map(|dep| calculate_task_level(dep, task_map, levels))
        .max()
        .unwrap_or(0);

    let level = max_dep_level + 1;
    levels.insert(task_id.to_string(), level);
    level
}

pub struct TaskRunner<'a> {
    tasks: &'a [Task],
    cache: &'a mut cache::Cache,
    default_timeout: Option<String>,
    workers: usize,
    continue_on_failure: bool,
}

impl<'a> TaskRunner<'a> {
    pub fn new(
        tasks: &'a [Task],
        cache: &'a mut cache::Cache,
        default_timeout: Option<String>,
        workers: Option<usize>,
        continue_on_failure: bool,
    ) -> Self {
        let workers = workers.unwrap_or_else(default_workers);
        Self {
            tasks,
            cache,
            default_timeout,
            workers,
            continue_on_failure,
        }
    }

    /// Run the listed tasks level by level. Returns true when any input
    /// hashes were added to the cache.
    pub async fn run_tasks(&mut self, task_ids: &[String]) -> bool {
        let tasks_to_run: Vec<Task> = task_ids
            .iter()
            .filter_map(|task_id| self.tasks.iter().find(|t| &t.id == task_id))
            .cloned()
            .collect();

        if tasks_to_run.is_empty() {
            return false;
        }

        let execution_levels = calculate_dependency_levels(&tasks_to_run);

        log::debug!(
            "Executing {} levels with up to {} workers",
            execution_levels.len(),
            self.workers
        );

        let mut any_cache_updated = false;

        for level in execution_levels {
            log::debug!(
                "Level {}: running {} tasks in parallel",
                level.level,
                level.task_ids.len()
            );

            match self.execute_level_parallel(&level.task_ids).await {
                Ok(cache_updated) => {
                    if cache_updated {
                        any_cache_updated = true;
                    }
                }
                Err(_) => {
                    if self.continue_on_failure {
                        eprintln!(
                            "Level {} had failures, but continuing due to --continue-on-failure",
                            level.level
                        );
                    } else {
                        eprintln!("Level {} failed, stopping execution", level.level);
                        return any_cache_updated;
                    }
                }
            }
        }

        any_cache_updated
    }

    async fn execute_level_parallel(&mut self, task_ids: &[String]) -> std::result::Result<bool, ()> {
        if task_ids.is_empty() {
            return Ok(false);
        }

        let semaphore = Arc::new(Semaphore::new(self.workers));
        let mut handles = Vec::new();
        let mut any_cache_updated = false;

        for task_id in task_ids {
            let task = match self.tasks.iter().find(|t| &t.id == task_id) {
                Some(task) => task,
                None => {
                    eprintln!("Error: task {} not found", task_id);
                    return Err(());
                }
            };

            if !needs_run(task, self.cache) {
                println!("Task '{}': outputs up-to-date, skipping", task.id);
                continue;
            }

            let task_clone = task.clone();
            let semaphore_clone = Arc::clone(&semaphore);
            let default_timeout = self.default_timeout.clone();

            let handle = tokio::spawn(async move {
                let _permit = semaphore_clone
                    .acquire()
                    .await
                    .map_err(|e| PipelineError::Task(e.to_string()))?;

                println!("Running task: {}", task_clone.id);
                execute_single_task(&task_clone, default_timeout).await
            });

            handles.push((task.id.clone(), handle));
        }

        let mut level_failed = false;

        for (task_id, handle) in handles {
            match handle.await {
                Ok(Ok(cache_updated)) => {
                    if cache_updated {
                        any_cache_updated = true;
                        if let Some(task) = self.tasks.iter().find(|t| t.id == task_id) {
                            if !task.inputs.is_empty() {
                                if let Ok(hash) = hash_files(task.inputs.clone()) {
                                    self.cache.insert(hash.to_hex().to_string());
                                }
                            }
                        }
                    }
                }
                Ok(Err(e)) => {
                    eprintln!("Task '{}' failed: {}", task_id, e);
                    level_failed = true;
                    if !self.continue_on_failure {
                        return Err(());
                    }
                }
                Err(e) => {
                    eprintln!("Task '{}' panicked: {}", task_id, e);
                    level_failed = true;
                    if !self.continue_on_failure {
                        return Err(());
                    }
                }
            }
        }

        if level_failed { Err(()) } else { Ok(any_cache_updated) }
    }
}

async fn execute_single_task(task: &Task, default_timeout: Option<String>) -> Result<bool> {
    for output in &task.outputs {
        if let Some(parent) = output.parent() {
            fs::create_dir_all(parent)?;
        }
    }

    match &task.action {
        TaskAction::Exec(command) => {
            let timeout = parse_timeout(task.timeout.as_deref(), default_timeout.as_deref());

            let mut envs = vec![("ASMPIPE_CPUS".to_string(), task.hints.cpus.to_string())];
            if let Some(mem) = task.hints.mem_per_cpu_mb {
                envs.push(("ASMPIPE_MEM_PER_CPU_MB".to_string(), mem.to_string()));
            }

            let output = run_command(command, &envs, timeout).await?;
            write_task_logs(task, &output.stdout, &output.stderr);

            if !output.status.success() {
                return Err(PipelineError::Task(format!(
                    "'{}' exited with {}",
                    task.id, output.status
                )));
            }
        }
        TaskAction::BinReadsByCoverage(job) => {
            coverage::run(job, Resources::from_env()).await?;
        }
    }

    Ok(!task.inputs.is_empty())
}

/// Captured stdout/stderr land next to the task's primary output.
fn write_task_logs(task: &Task, stdout: &[u8], stderr: &[u8]) {
    let log_dir = task
        .outputs
        .first()
        .and_then(|o| o.parent())
        .unwrap_or_else(|| Path::new("."));

    for (suffix, bytes) in [("log", stdout), ("err", stderr)] {
        let path = log_dir.join(format!("{}.{}", task.id, suffix));
        if let Err(e) = fs::write(&path, bytes) {
            log::warn!("Could not write '{}': {}", path.display(), e);
        }
    }
}

/// Make-style staleness: run when outputs are missing or older than inputs,
/// or when the input content hash is not in the cache. Tasks without
/// declared inputs always run.
pub fn needs_run(task: &Task, cache: &cache::Cache) -> bool {
    if task.inputs.is_empty() {
        log::debug!("Task '{}': no inputs, always run", task.id);
        return true;
    }

    if !outputs_exist(task) {
        log::debug!("Task '{}': outputs missing, must run", task.id);
        return true;
    }

    if outputs_outdated(task) {
        log::debug!("Task '{}': outputs older than inputs, must run", task.id);
        return true;
    }

    match hash_files(task.inputs.clone()) {
        Ok(hash) => {
            let hash_key = hash.to_hex().to_string();
            if !cache.contains(&hash_key) {
                log::debug!("Task '{}': input content changed, must run", task.id);
                return true;
            }
        }
        Err(e) => {
            log::warn!("Could not process inputs for task '{}': {}", task.id, e);
            return true;
        }
    }

    false
}

fn outputs_exist(task: &Task) -> bool {
    if task.outputs.is_empty() {
        return true;
    }

    task.outputs.iter().all(|output| output.exists())
}

fn outputs_outdated(task: &Task) -> bool {
    if task.outputs.is_empty() || task.inputs.is_empty() {
        return false;
    }

    let newest_input_time = match newest_timestamp(&task.inputs) {
        Some(time) => time,
        None => return true,
    };

    let oldest_output_time = match oldest_timestamp(&task.outputs) {
        Some(time) => time,
        None => return true,
    };

    newest_input_time > oldest_output_time
}

fn newest_timestamp(paths: &[PathBuf]) -> Option<SystemTime> {
    let expanded_paths = expand_globs(paths).ok()?;

    expanded_paths
        .iter()
        .filter_map(|path| {
            path.metadata()
                .ok()
                .and_then(|metadata| metadata.modified().ok())
        })
        .max()
}

fn oldest_timestamp(paths: &[PathBuf]) -> Option<SystemTime> {
    paths
        .iter()
        .filter_map(|path| {
            path.metadata()
                .ok()
                .and_then(|metadata| metadata.modified().ok())
        })
        .min()
}
