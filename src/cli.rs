use std::path::PathBuf;

use clap::Parser;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Pipeline configuration file to use
    #[arg(short = 'f', long = "file", default_value = "asmpipe.toml")]
    pub file: String,

    /// Enable verbose output
    #[arg(short = 'v', long = "verbose")]
    pub verbose: bool,

    /// Override number of worker threads for parallel execution
    #[arg(short = 'j', long = "workers")]
    pub workers: Option<usize>,

    /// Override default timeout (e.g., "5m", "30s", "1h30m")
    #[arg(short = 't', long = "timeout")]
    pub timeout: Option<String>,

    /// Show what would be executed without running tasks
    #[arg(short = 'n', long = "dry-run")]
    pub dry_run: bool,

    /// Write the task graph as Graphviz DOT to this file and exit
    #[arg(long = "flowchart", value_name = "DOT_FILE")]
    pub flowchart: Option<PathBuf>,

    /// Continue executing independent tasks even if some fail
    #[arg(long = "continue-on-failure")]
    pub continue_on_failure: bool,

    /// Task to run (with its upstream dependencies); all tasks if not specified
    pub task: Option<String>,
}
