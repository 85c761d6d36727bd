use std::{collections::HashMap, fmt::Write as _, fs, path::Path};

use super::Task;
use crate::error::Result;
use crate::util::is_glob_pattern;

pub fn show_task_relationships(tasks: &[Task], verbose: bool) {
    if !verbose {
        return;
    }

    let task_map: HashMap<&str, &Task> = tasks.iter().map(|t| (t.id.as_str(), t)).collect();

    for task in tasks {
        for dep_id in &task.dependencies {
            if let Some(dep_task) = task_map.get(dep_id.as_str()) {
                if !has_file_relationship(task, dep_task) {
                    println!(
                        "Info: Task '{}' depends on '{}' for ordering only",
                        task.id, dep_id
                    );
                }
            }
        }
    }
}

/// Render the task graph as Graphviz DOT, one edge per declared dependency.
pub fn write_flowchart(tasks: &[Task], path: &Path) -> Result<()> {
    fs::write(path, render_flowchart(tasks))?;
    Ok(())
}

pub fn render_flowchart(tasks: &[Task]) -> String {
    let mut dot = String::new();
    dot.push_str("digraph pipeline {\n");
    dot.push_str("    rankdir=LR;\n");
    dot.push_str("    node [shape=box];\n");

    for task in tasks {
        let _ = writeln!(dot, "    \"{}\";", task.id);
    }

    for task in tasks {
        for dep_id in &task.dependencies {
            let _ = writeln!(dot, "    \"{}\" -> \"{}\";", dep_id, task.id);
        }
    }

    dot.push_str("}\n");
    dot
}

fn has_file_relationship(task: &Task, dependency: &Task) -> bool {
    if dependency.outputs.is_empty() || task.inputs.is_empty() {
        return false;
    }

    for dep_output in &dependency.outputs {
        for task_input in &task.inputs {
            if paths_match(dep_output, task_input) {
                return true;
            }
        }
    }

    false
}

fn paths_match(output: &Path, input: &Path) -> bool {
    let output_str = output.to_string_lossy();
    let input_str = input.to_string_lossy();

    if output_str == input_str {
        return true;
    }

    if is_glob_pattern(&input_str) {
        if let Ok(glob_paths) = glob::glob(&input_str) {
            for entry in glob_paths.flatten() {
                if entry == *output {
                    return true;
                }
            }
        }
    }

    if input_str.contains("**") {
        if let Some(prefix) = input_str.split("**").next() {
            if !prefix.is_empty() && output_str.starts_with(prefix) {
                return true;
            }
        }
    }

    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::Task;
    use std::path::PathBuf;

    #[test]
    fn flowchart_lists_nodes_and_edges() {
        let tasks = vec![
            Task::exec("bbduk", "bbduk.sh"),
            Task::exec("bbnorm", "bbnorm.sh").after(&["bbduk"]),
        ];
        let dot = render_flowchart(&tasks);
        assert!(dot.starts_with("digraph pipeline {"));
        assert!(dot.contains("\"bbduk\";"));
        assert!(dot.contains("\"bbduk\" -> \"bbnorm\";"));
    }

    #[test]
    fn file_relationship_matches_exact_paths() {
        let producer = Task::exec("bbduk", "bbduk.sh")
            .produces([PathBuf::from("output/bbduk/trimmed.fastq.gz")]);
        let consumer = Task::exec("bbnorm", "bbnorm.sh")
            .after(&["bbduk"])
            .consumes([PathBuf::from("output/bbduk/trimmed.fastq.gz")]);
        assert!(has_file_relationship(&consumer, &producer));
    }
}
