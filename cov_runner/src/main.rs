use clap::{Parser, Subcommand};
use cov_runner::database::Database;
use cov_runner::executor::{ExecutorSettings, SampleExecutor};
use cov_runner::{afl_fuzzing, run_corpus};
use itertools::Itertools;
use log::{debug, error, info};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Campaign database with found edges and run records
    #[arg(short, long)]
    database: Option<PathBuf>,
    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand, Debug, Clone)]
enum Cmd {
    /// Execute one sample and report the coverage it reached
    Run {
        target: PathBuf,
        /// Arguments passed through to the target
        args: Vec<String>,
        /// Sample piped to the target's stdin
        #[arg(short, long)]
        input: Option<PathBuf>,
        #[arg(short, long, default_value = "1000")]
        timeout_ms: u64,
    },
    /// Replay a corpus directory and record its coverage
    Corpus {
        target: PathBuf,
        corpus: PathBuf,
        /// Arguments passed through to the target
        args: Vec<String>,
        #[arg(short, long, default_value = "1000")]
        timeout_ms: u64,
        /// Keep a hit counter per edge
        #[arg(short = 'e', long)]
        track_edges: bool,
    },
    /// Show what the campaign database contains
    Stats,
    /// Fuzz the target with the havoc pipeline
    Afl {
        target: PathBuf,
        /// Arguments passed through to the target
        args: Vec<String>,
        /// Directory for crashing inputs
        #[arg(short, long)]
        solutions: Option<PathBuf>,
        /// Stop after this many fuzzing rounds instead of running forever
        #[arg(short, long)]
        iterations: Option<u64>,
        #[arg(short, long, default_value = "1000")]
        timeout_ms: u64,
    },
}

#[tokio::main]
async fn main() {
    env_logger::init();

    let args = Args::parse();

    let database_file = args
        .database
        .unwrap_or_else(|| PathBuf::from("database.json"));
    let mut database = match Database::from_file(&database_file) {
        Ok(db) => db,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Database::empty(&database_file),
        Err(e) => {
            error!("Failed to load the database: {:?}", e);
            std::process::exit(1);
        }
    };
    info!("Loaded database from {:?}", &database.path);

    let exit_code = match args.cmd {
        Cmd::Run {
            target,
            args: target_args,
            input,
            timeout_ms,
        } => run_once(&mut database, target, target_args, input, timeout_ms).await,
        Cmd::Corpus {
            target,
            corpus,
            args: target_args,
            timeout_ms,
            track_edges,
        } => {
            replay_corpus(
                &mut database,
                target,
                target_args,
                corpus,
                timeout_ms,
                track_edges,
            )
            .await
        }
        Cmd::Stats => {
            print_stats(&database);
            0
        }
        Cmd::Afl {
            target,
            args: target_args,
            solutions,
            iterations,
            timeout_ms,
        } => {
            run_afl(
                &mut database,
                target,
                target_args,
                solutions,
                iterations,
                timeout_ms,
            )
            .await
        }
    };

    if let Err(e) = database.save().await {
        error!("Failed to save the database: {:?}", e);
    }

    std::process::exit(exit_code);
}

fn executor_for(
    target: PathBuf,
    target_args: Vec<String>,
    timeout_ms: u64,
    track_edges: bool,
) -> Option<SampleExecutor> {
    let settings = ExecutorSettings {
        timeout: Duration::from_millis(timeout_ms),
        track_edges,
        ..ExecutorSettings::default()
    };
    match SampleExecutor::new(target, target_args, settings) {
        Ok(executor) => Some(executor),
        Err(e) => {
            error!("Failed to set up the executor: {}", e);
            None
        }
    }
}

async fn run_once(
    database: &mut Database,
    target: PathBuf,
    target_args: Vec<String>,
    input: Option<PathBuf>,
    timeout_ms: u64,
) -> i32 {
    let Some(mut executor) = executor_for(target, target_args, timeout_ms, false) else {
        return 1;
    };

    let bytes = match &input {
        Some(path) => match std::fs::read(path) {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                error!("Failed to read the sample {:?}: {}", path, e);
                return 1;
            }
        },
        None => None,
    };
    let label = input
        .as_ref()
        .and_then(|path| path.file_name())
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "<no input>".to_string());

    match executor.execute_sample(bytes.as_deref()).await {
        Ok(result) => {
            println!("{}", result.exit);
            println!(
                "new edges: {} (total {} of {}, ratio {:.4})",
                result.new_edges.len(),
                executor.collector().found_edges(),
                executor.collector().num_edges(),
                executor.collector().coverage_ratio(),
            );
            debug!("edges: {}", result.new_edges.iter().join(", "));

            database.record_sample(&label, &result);
            if result.exit.is_crash() {
                1
            } else {
                0
            }
        }
        Err(e) => {
            error!("Failed to execute the sample: {}", e);
            1
        }
    }
}

async fn replay_corpus(
    database: &mut Database,
    target: PathBuf,
    target_args: Vec<String>,
    corpus: PathBuf,
    timeout_ms: u64,
    track_edges: bool,
) -> i32 {
    let Some(mut executor) = executor_for(target, target_args, timeout_ms, track_edges) else {
        return 1;
    };

    match run_corpus(&mut executor, database, &corpus).await {
        Ok(summary) => {
            println!(
                "{} files, {} crashes, {} timeouts, {} new edges",
                summary.files, summary.crashes, summary.timeouts, summary.new_edges
            );
            println!(
                "coverage now at {} of {} edges (ratio {:.4})",
                executor.collector().found_edges(),
                executor.collector().num_edges(),
                executor.collector().coverage_ratio(),
            );
            if let Some(counts) = executor.collector().edge_counts() {
                let hot = counts
                    .iter()
                    .enumerate()
                    .filter(|(_, count)| **count > 0)
                    .sorted_by_key(|(_, count)| core::cmp::Reverse(**count))
                    .take(10)
                    .map(|(index, count)| format!("E{:06x}:{}", index, count))
                    .join(", ");
                println!("hottest edges: {hot}");
            }
            0
        }
        Err(e) => {
            error!("Corpus replay failed: {}", e);
            1
        }
    }
}

async fn run_afl(
    database: &mut Database,
    target: PathBuf,
    target_args: Vec<String>,
    solutions: Option<PathBuf>,
    iterations: Option<u64>,
    timeout_ms: u64,
) -> i32 {
    let Some(mut executor) = executor_for(target, target_args, timeout_ms, false) else {
        return 1;
    };

    // the fuzzing loop blocks and the executor drives its own runtime
    let result = tokio::task::block_in_place(|| {
        afl_fuzzing::afl_main(&mut executor, database, solutions, iterations)
    });

    match result {
        Ok(()) => {
            print_stats(database);
            0
        }
        Err(e) => {
            error!("Fuzzing loop stopped: {}", e);
            1
        }
    }
}

fn print_stats(database: &Database) {
    let data = &database.data;

    println!(
        "Found {} edges over {} executions",
        data.found_edges.len(),
        data.executions
    );
    println!("Crashes: {}, timeouts: {}", data.crashes, data.timeouts);

    if !data.found_edges.is_empty() {
        let preview = data.found_edges.iter().take(16).join(", ");
        println!("First edges: {preview}");
    }

    if !data.runs.is_empty() {
        println!("Recent notable runs:");
        for run in data.runs.iter().rev().take(10) {
            println!(
                "  {} {} ({} new edges)",
                run.label, run.outcome, run.new_edges
            );
        }
    }
}
