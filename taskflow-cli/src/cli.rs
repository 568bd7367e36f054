use clap::{Parser, Subcommand, ValueEnum};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "taskflow")]
#[command(about = "Drive bounded worker pools and pipelines with demonstration workloads")]
#[command(version)]
pub struct Args {
    /// Configuration file (defaults to <config_dir>/taskflow/config.toml)
    #[arg(short, long, global = true, env = "TASKFLOW_CONFIG")]
    pub config: Option<PathBuf>,

    /// Number of workers per pool
    #[arg(short, long, global = true)]
    pub workers: Option<usize>,

    /// Capacity of every queue (0 for rendezvous hand-offs)
    #[arg(long, global = true)]
    pub queue_capacity: Option<usize>,

    /// Log filter directive, e.g. "debug" or "taskflow=trace"
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    /// Log line format
    #[arg(long, global = true, value_enum)]
    pub log_format: Option<LogFormat>,

    /// Result output format
    #[arg(short, long, global = true, value_enum)]
    pub output: Option<OutputFormat>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Run mixed jobs (data processing, file operations, calculations) on one pool
    Pool {
        /// Number of jobs to submit
        #[arg(short, long, default_value_t = 9)]
        jobs: u64,
    },

    /// Generate 1..=N and run it through an even-number filter and a doubling stage
    Pipeline {
        /// Upper bound of the generated sequence
        #[arg(short = 'n', long, default_value_t = 5)]
        count: u64,

        /// Stage order
        #[arg(long, value_enum, default_value_t = StageOrder::FilterFirst)]
        order: StageOrder,
    },

    /// Run slow tasks under a deadline and report what was cancelled
    Timeout {
        /// Number of jobs to submit
        #[arg(short, long, default_value_t = 10)]
        jobs: u64,

        /// Deadline for the whole run, in milliseconds
        #[arg(short, long, default_value_t = 500)]
        deadline_ms: u64,

        /// Duration of each task, in milliseconds
        #[arg(short, long, default_value_t = 200)]
        task_ms: u64,
    },

    /// Run tasks that panic or fail and show how failures are classified
    Faults {
        /// Number of jobs to submit
        #[arg(short, long, default_value_t = 12)]
        jobs: u64,

        /// Every K-th job panics
        #[arg(short, long, default_value_t = 4)]
        panic_every: u64,
    },

    /// Several concurrent producers sharing one pool
    FanIn {
        /// Number of producers
        #[arg(short, long, default_value_t = 3)]
        producers: u64,

        /// Tasks submitted by each producer
        #[arg(long, default_value_t = 4)]
        per_producer: u64,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// Human-readable lines
    #[default]
    Pretty,
    /// One JSON object per result, then a summary object
    Json,
}

/// Order of the two stages of the `pipeline` command.
#[derive(ValueEnum, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum StageOrder {
    /// filter-even, then double: 1..=5 yields 4 and 8
    #[default]
    FilterFirst,
    /// double, then filter-even: every doubled value passes
    DoubleFirst,
}

impl StageOrder {
    pub fn describe(self) -> &'static str {
        match self {
            StageOrder::FilterFirst => "filter-even -> double",
            StageOrder::DoubleFirst => "double -> filter-even",
        }
    }
}

#[derive(ValueEnum, Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}
