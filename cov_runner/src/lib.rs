//! Host side of coverage-guided execution: spawns instrumented
//! targets, replays corpora and records campaign progress.

use crate::database::Database;
use crate::executor::SampleExecutor;
use log::{debug, info};
use std::path::{Path, PathBuf};

pub mod afl_fuzzing;
pub mod database;
pub mod executor;

#[derive(Debug, Default)]
pub struct CorpusSummary {
    pub files: usize,
    pub crashes: usize,
    pub timeouts: usize,
    /// Edges first reached during this replay.
    pub new_edges: u64,
}

/// Replays every file of `corpus` through the executor, in name order,
/// and folds the results into the database.
pub async fn run_corpus(
    executor: &mut SampleExecutor,
    database: &mut Database,
    corpus: &Path,
) -> executor::Result<CorpusSummary> {
    let mut files: Vec<PathBuf> = std::fs::read_dir(corpus)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.is_file())
        .collect();
    files.sort();
    info!("Replaying {} corpus files from {:?}", files.len(), corpus);

    let mut summary = CorpusSummary::default();
    for path in files {
        let input = std::fs::read(&path)?;
        let label = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();

        let result = executor.execute_sample(Some(&input)).await?;

        summary.files += 1;
        if result.exit.is_crash() {
            summary.crashes += 1;
        }
        if result.exit == executor::ExecutionExit::TimedOut {
            summary.timeouts += 1;
        }
        summary.new_edges += result.new_edges.len() as u64;

        if !result.new_edges.is_empty() || result.exit.is_crash() {
            info!(
                "{}: {}, {} new edges",
                label,
                result.exit,
                result.new_edges.len()
            );
        } else {
            debug!("{}: {}", label, result.exit);
        }

        database.record_sample(&label, &result);
    }

    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{ExecutorSettings, SampleExecutor};

    #[tokio::test]
    async fn corpus_files_are_replayed_in_order() {
        let corpus = tempfile::tempdir().unwrap();
        std::fs::write(corpus.path().join("b.bin"), b"second").unwrap();
        std::fs::write(corpus.path().join("a.bin"), b"first").unwrap();

        // nonzero exits land in the run list, which shows the order
        let mut executor = SampleExecutor::new(
            PathBuf::from("/bin/sh"),
            vec!["-c".to_string(), "exit 1".to_string()],
            ExecutorSettings {
                region_id: 0x200,
                ..ExecutorSettings::default()
            },
        )
        .unwrap();
        // no instrumented target around, fake the handshake
        executor.collector_mut().region_mut().set_num_edges(64);
        executor.collector_mut().finish_initialization(false).unwrap();

        let mut database = Database::empty("unused.json");
        let summary = run_corpus(&mut executor, &mut database, corpus.path())
            .await
            .unwrap();

        assert_eq!(summary.files, 2);
        assert_eq!(summary.crashes, 0);
        assert_eq!(database.data.executions, 2);
        let labels: Vec<&str> = database
            .data
            .runs
            .iter()
            .map(|run| run.label.as_str())
            .collect();
        assert_eq!(labels, vec!["a.bin", "b.bin"]);
    }

    #[tokio::test]
    async fn crashes_are_counted() {
        let corpus = tempfile::tempdir().unwrap();
        std::fs::write(corpus.path().join("boom.bin"), b"x").unwrap();

        let mut executor = SampleExecutor::new(
            PathBuf::from("/bin/sh"),
            vec!["-c".to_string(), "kill -ABRT $$".to_string()],
            ExecutorSettings {
                region_id: 0x201,
                ..ExecutorSettings::default()
            },
        )
        .unwrap();
        executor.collector_mut().region_mut().set_num_edges(64);
        executor.collector_mut().finish_initialization(false).unwrap();

        let mut database = Database::empty("unused.json");
        let summary = run_corpus(&mut executor, &mut database, corpus.path())
            .await
            .unwrap();

        assert_eq!(summary.files, 1);
        assert_eq!(summary.crashes, 1);
        assert_eq!(database.data.crashes, 1);
        assert_eq!(database.data.runs.len(), 1);
    }
}
