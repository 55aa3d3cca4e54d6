//! This module runs target samples under coverage observation.
//! It owns the shared region handshake with the in-target runtime and
//! turns raw process exits into coverage verdicts.

use cov::layout::SHM_ENV_VAR;
use cov::{CoverageCollector, EdgeSet};
use log::{debug, trace};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

#[derive(Error, Debug)]
pub enum ExecutorError {
    #[error("failed to spawn {target:?}: {source}")]
    Spawn {
        target: PathBuf,
        source: std::io::Error,
    },
    #[error("i/o towards the target failed: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Coverage(#[from] cov::CoverageError),
}

pub type Result<T> = core::result::Result<T, ExecutorError>;

/// How one run of the target ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutionExit {
    /// The target exited on its own with this status code.
    Exited(i32),
    /// The target was terminated by this signal.
    Crashed(i32),
    /// The target outlived its time budget and was killed.
    TimedOut,
}

impl ExecutionExit {
    pub const fn is_crash(&self) -> bool {
        matches!(self, ExecutionExit::Crashed(_))
    }
}

impl core::fmt::Display for ExecutionExit {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            ExecutionExit::Exited(code) => write!(f, "exited with code {code}"),
            ExecutionExit::Crashed(signal) => write!(f, "crashed with signal {signal}"),
            ExecutionExit::TimedOut => write!(f, "timed out"),
        }
    }
}

/// Coverage verdict for one observed sample.
#[derive(Debug)]
pub struct SampleExecutionResult {
    pub exit: ExecutionExit,
    /// Edges no non-crashing sample reached before.
    pub new_edges: EdgeSet,
    /// Whether a crashing sample reached code no earlier crash reached.
    pub new_crash_edges: bool,
}

#[derive(Debug, Clone)]
pub struct ExecutorSettings {
    pub timeout: Duration,
    /// Distinguishes the shared regions of concurrent executors.
    pub region_id: u32,
    /// Keep a hit counter per edge across samples.
    pub track_edges: bool,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(1),
            region_id: 0,
            track_edges: false,
        }
    }
}

/// Executes one instrumented target over and over, feeding samples via
/// stdin and collecting edge coverage through the shared region.
pub struct SampleExecutor {
    target: PathBuf,
    args: Vec<String>,
    collector: CoverageCollector,
    settings: ExecutorSettings,
}

impl SampleExecutor {
    pub fn new(target: PathBuf, args: Vec<String>, settings: ExecutorSettings) -> Result<Self> {
        let collector = CoverageCollector::new(settings.region_id)?;
        Ok(Self {
            target,
            args,
            collector,
            settings,
        })
    }

    pub fn collector(&self) -> &CoverageCollector {
        &self.collector
    }

    pub fn collector_mut(&mut self) -> &mut CoverageCollector {
        &mut self.collector
    }

    pub fn target(&self) -> &PathBuf {
        &self.target
    }

    /// Spawns the target once and waits for it within the time budget.
    ///
    /// `input` is piped to the target's stdin; without input stdin
    /// reads EOF right away. The region name travels in the
    /// environment, everything else of the parent environment stays.
    pub async fn run(&mut self, input: Option<&[u8]>) -> Result<ExecutionExit> {
        let mut command = Command::new(&self.target);
        command
            .args(&self.args)
            .stdin(if input.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        if let Some(name) = self.collector.shm_name() {
            command.env(SHM_ENV_VAR, name);
        }

        let mut child = command.spawn().map_err(|source| ExecutorError::Spawn {
            target: self.target.clone(),
            source,
        })?;

        // feeding stdin happens under the same deadline as the wait, a
        // target that never reads must not hang the fuzzer
        let wait_for_exit = async {
            if let Some(input) = input {
                if let Some(mut stdin) = child.stdin.take() {
                    // a target may crash before reading, that is a
                    // result and not an error
                    if let Err(error) = stdin.write_all(input).await {
                        if error.kind() != std::io::ErrorKind::BrokenPipe {
                            return Err(ExecutorError::from(error));
                        }
                        trace!("target closed stdin early: {error}");
                    }
                }
                // stdin dropped, the target reads EOF from here on
            }
            Ok(child.wait().await?)
        };

        match tokio::time::timeout(self.settings.timeout, wait_for_exit).await {
            Ok(status) => Ok(classify_exit(status?)),
            Err(_) => {
                debug!("target exceeded {:?}, killing it", self.settings.timeout);
                child.kill().await?;
                Ok(ExecutionExit::TimedOut)
            }
        }
    }

    /// Runs one sample and evaluates the coverage it produced.
    ///
    /// The first call performs the handshake: the target's startup
    /// announces the edge count, which this side then adopts. That
    /// extra run only serves the handshake, the sample is executed
    /// again afterwards so its coverage is observed like any other.
    pub async fn execute_sample(&mut self, input: Option<&[u8]>) -> Result<SampleExecutionResult> {
        if !self.collector.is_initialized() {
            let exit = self.run(input).await?;
            trace!("handshake run finished: {exit}");
            self.collector
                .finish_initialization(self.settings.track_edges)?;
            debug!(
                "coverage handshake done, target reports {} edges",
                self.collector.num_edges()
            );
        }

        self.collector.clear_bitmap();
        let exit = self.run(input).await?;

        let new_edges = self.collector.evaluate()?;
        let new_crash_edges = if exit.is_crash() {
            self.collector.evaluate_crash()?
        } else {
            false
        };

        Ok(SampleExecutionResult {
            exit,
            new_edges,
            new_crash_edges,
        })
    }
}

fn classify_exit(status: std::process::ExitStatus) -> ExecutionExit {
    use std::os::unix::process::ExitStatusExt;

    match status.code() {
        Some(code) => ExecutionExit::Exited(code),
        None => ExecutionExit::Crashed(status.signal().unwrap_or(0)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shell_executor(region_id: u32, timeout: Duration) -> SampleExecutor {
        SampleExecutor::new(
            PathBuf::from("/bin/sh"),
            vec![],
            ExecutorSettings {
                timeout,
                region_id,
                track_edges: false,
            },
        )
        .unwrap()
    }

    fn shell_command(region_id: u32, script: &str) -> SampleExecutor {
        SampleExecutor::new(
            PathBuf::from("/bin/sh"),
            vec!["-c".to_string(), script.to_string()],
            ExecutorSettings {
                region_id,
                ..ExecutorSettings::default()
            },
        )
        .unwrap()
    }

    #[tokio::test]
    async fn exit_codes_are_passed_through() {
        let mut executor = shell_command(0x100, "exit 7");
        assert_eq!(executor.run(None).await.unwrap(), ExecutionExit::Exited(7));
    }

    #[tokio::test]
    async fn signals_count_as_crashes() {
        let mut executor = shell_command(0x101, "kill -SEGV $$");
        assert_eq!(
            executor.run(None).await.unwrap(),
            ExecutionExit::Crashed(libc::SIGSEGV)
        );
    }

    #[tokio::test]
    async fn slow_targets_are_killed() {
        let mut executor = shell_executor(0x102, Duration::from_millis(100));
        executor.args = vec!["-c".to_string(), "sleep 5".to_string()];
        assert_eq!(executor.run(None).await.unwrap(), ExecutionExit::TimedOut);
    }

    #[tokio::test]
    async fn samples_arrive_on_stdin() {
        let mut executor = shell_command(0x103, "read line && exit 3");
        assert_eq!(
            executor.run(Some(b"hello\n")).await.unwrap(),
            ExecutionExit::Exited(3)
        );
    }

    #[tokio::test]
    async fn missing_targets_fail_to_spawn() {
        let mut executor = SampleExecutor::new(
            PathBuf::from("/nonexistent/target"),
            vec![],
            ExecutorSettings {
                region_id: 0x104,
                ..ExecutorSettings::default()
            },
        )
        .unwrap();
        assert!(matches!(
            executor.run(None).await,
            Err(ExecutorError::Spawn { .. })
        ));
    }

    #[tokio::test]
    async fn uninstrumented_targets_are_detected() {
        let mut executor = shell_command(0x105, "exit 0");
        assert!(matches!(
            executor.execute_sample(None).await,
            Err(ExecutorError::Coverage(
                cov::CoverageError::NoInstrumentation
            ))
        ));
    }

    #[tokio::test]
    async fn initialized_executor_reports_clean_runs() {
        let mut executor = shell_command(0x106, "exit 0");

        // fake the handshake an instrumented target would perform
        executor.collector_mut().region_mut().set_num_edges(64);
        executor.collector_mut().finish_initialization(false).unwrap();

        let result = executor.execute_sample(Some(b"data")).await.unwrap();
        assert_eq!(result.exit, ExecutionExit::Exited(0));
        assert!(result.new_edges.is_empty());
        assert!(!result.new_crash_edges);
    }
}
