use clap::Parser;
use std::process;

mod cache;
mod cli;
mod config;
mod coverage;
mod error;
mod execution;
mod pipeline;
mod task;
mod util;

use cache::{load_cache, save_cache};
use cli::Cli;
use error::Result;
use execution::TaskRunner;
use task::{get_required_tasks, show_task_relationships, sort_topologically, write_flowchart};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();

    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(if args.verbose { "debug" } else { "info" }),
    )
    .init();

    match run_pipeline(args).await {
        Ok(()) => Ok(()),
        Err(e) => {
            eprintln!("Error: {}", e);
            process::exit(1);
        }
    }
}

async fn run_pipeline(args: Cli) -> Result<()> {
    let config = config::load_config(&args.file)?;
    let mut tasks = pipeline::build(&config)?;

    if let Some(dot_path) = &args.flowchart {
        write_flowchart(&tasks, dot_path)?;
        println!("Flowchart written to {}", dot_path.display());
        return Ok(());
    }

    show_task_relationships(&tasks, args.verbose);

    let task_list = match &args.task {
        Some(task_id) => get_required_tasks(&tasks, task_id)?,
        None => sort_topologically(&tasks),
    };

    tasks.retain(|task| task_list.contains(&task.id));

    if args.verbose {
        println!("Task execution order: {}", task_list.join(" -> "));
    }

    if args.dry_run {
        println!("Dry run mode - showing what would be executed:");
        for task_id in &task_list {
            if let Some(task) = tasks.iter().find(|t| t.id == *task_id) {
                println!("  {} would run: {}", task.id, task.action.describe());
            }
        }
        return Ok(());
    }

    let workers = args.workers.or(config.run.workers);
    let default_timeout = args.timeout.clone().or(config.run.default_timeout.clone());

    let mut cache = load_cache(config.run.cache_dir.as_deref(), &args.file);
    let mut runner = TaskRunner::new(
        &tasks,
        &mut cache,
        default_timeout,
        workers,
        args.continue_on_failure,
    );
    let cache_changed = runner.run_tasks(&task_list).await;

    if cache_changed {
        save_cache(&cache, config.run.cache_dir.as_deref(), &args.file);
    } else {
        log::debug!("No changes detected, cache not saved.");
    }

    Ok(())
}
