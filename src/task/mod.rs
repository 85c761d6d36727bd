pub mod analysis;
pub mod dependency;

pub use analysis::{show_task_relationships, write_flowchart};
pub use dependency::{get_required_tasks, sort_topologically, validate_tasks};

use std::path::PathBuf;

use crate::coverage::CoverageBinJob;

/// Opaque resource hints forwarded to the task's external script. The runner
/// does not schedule against these; a cluster wrapper may.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceHints {
    pub cpus: u32,
    pub mem_per_cpu_mb: Option<u64>,
}

impl Default for ResourceHints {
    fn default() -> Self {
        Self {
            cpus: 1,
            mem_per_cpu_mb: None,
        }
    }
}

#[derive(Debug, Clone)]
pub enum TaskAction {
    /// Shell command invoking an external tool or script.
    Exec(String),
    /// The in-process coverage-bin selection driver.
    BinReadsByCoverage(CoverageBinJob),
}

impl TaskAction {
    pub fn describe(&self) -> String {
        match self {
            TaskAction::Exec(command) => command.clone(),
            TaskAction::BinReadsByCoverage(_) => "builtin: bin reads by coverage".to_string(),
        }
    }
}

/// A node in the pipeline graph: declared inputs and outputs on disk, the
/// tasks that must complete first, and the action to run.
#[derive(Debug, Clone)]
pub struct Task {
    pub id: String,
    pub action: TaskAction,
    pub dependencies: Vec<String>,
    pub inputs: Vec<PathBuf>,
    pub outputs: Vec<PathBuf>,
    pub hints: ResourceHints,
    pub timeout: Option<String>,
}

impl Task {
    pub fn exec(id: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            action: TaskAction::Exec(command.into()),
            dependencies: Vec::new(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            hints: ResourceHints::default(),
            timeout: None,
        }
    }

    pub fn coverage_bin(id: impl Into<String>, job: CoverageBinJob) -> Self {
        Self {
            id: id.into(),
            action: TaskAction::BinReadsByCoverage(job),
            dependencies: Vec::new(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            hints: ResourceHints::default(),
            timeout: None,
        }
    }

    pub fn after(mut self, deps: &[&str]) -> Self {
        self.dependencies = deps.iter().map(|d| d.to_string()).collect();
        self
    }

    pub fn consumes(mut self, inputs: impl IntoIterator<Item = PathBuf>) -> Self {
        self.inputs = inputs.into_iter().collect();
        self
    }

    pub fn produces(mut self, outputs: impl IntoIterator<Item = PathBuf>) -> Self {
        self.outputs = outputs.into_iter().collect();
        self
    }

    pub fn hints(mut self, cpus: u32, mem_per_cpu_mb: Option<u64>) -> Self {
        self.hints = ResourceHints { cpus, mem_per_cpu_mb };
        self
    }
}
