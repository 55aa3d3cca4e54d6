//! Persistent record of a fuzzing campaign: every edge found so far
//! plus per-run bookkeeping, stored as pretty JSON next to the corpus.

use crate::executor::{ExecutionExit, SampleExecutionResult};
use cov::{EdgeIndex, EdgeSet};
use serde::ser::SerializeSeq;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::io;

/// One observed sample worth remembering.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    /// Where the sample came from, a file name or a generator tag.
    pub label: String,
    pub outcome: ExecutionExit,
    pub new_edges: u64,
    /// Seconds since the epoch.
    pub timestamp: u64,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct DatabaseData {
    #[serde(serialize_with = "serialize_hex", deserialize_with = "deserialize_hex")]
    pub found_edges: EdgeSet,
    pub executions: u64,
    pub crashes: u64,
    pub timeouts: u64,
    pub runs: Vec<RunRecord>,
}

#[derive(Debug)]
pub struct Database {
    pub path: PathBuf,
    pub data: DatabaseData,
    dirty: bool,
}

impl Database {
    pub fn empty<A: AsRef<Path>>(path: A) -> Self {
        Database {
            path: path.as_ref().to_path_buf(),
            data: DatabaseData::default(),
            dirty: false,
        }
    }

    pub fn from_file<A: AsRef<Path>>(path: A) -> io::Result<Self> {
        let file = std::fs::File::open(&path)?;
        let reader = std::io::BufReader::new(file);
        let data = serde_json::from_reader(reader)?;
        Ok(Database {
            path: path.as_ref().to_path_buf(),
            data,
            dirty: false,
        })
    }

    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    /// Folds one sample result into the campaign record.
    pub fn record_sample(&mut self, label: &str, result: &SampleExecutionResult) {
        self.data.executions += 1;
        match result.exit {
            ExecutionExit::Crashed(_) => self.data.crashes += 1,
            ExecutionExit::TimedOut => self.data.timeouts += 1,
            ExecutionExit::Exited(_) => {}
        }

        let new_edges = result
            .new_edges
            .iter()
            .filter(|edge| self.data.found_edges.insert(**edge))
            .count() as u64;

        // keep the run list to notable samples, plain clean runs only
        // bloat the file
        if new_edges > 0 || result.exit != ExecutionExit::Exited(0) {
            self.data.runs.push(RunRecord {
                label: label.to_string(),
                outcome: result.exit,
                new_edges,
                timestamp: timestamp(),
            });
        }

        self.mark_dirty();
    }

    /// Writes the database back to its file, if anything changed.
    pub async fn save(&mut self) -> io::Result<()> {
        if !self.dirty {
            return Ok(());
        }

        let json = serde_json::to_vec_pretty(&self.data)?;
        tokio::fs::write(&self.path, json).await?;
        self.dirty = false;
        Ok(())
    }
}

fn timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or(0)
}

fn serialize_hex<S>(v: &EdgeSet, serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    if serializer.is_human_readable() {
        let mut seq = serializer.serialize_seq(Some(v.len()))?;
        for edge in v {
            seq.serialize_element(&format!("{:06x}", edge.index()))?;
        }
        seq.end()
    } else {
        v.serialize(serializer)
    }
}

fn deserialize_hex<'de, D>(deserializer: D) -> Result<EdgeSet, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let v: Vec<String> = Vec::deserialize(deserializer)?;

    let indices = v.iter().map(|x| {
        let x = x.trim();
        let x = x.trim_start_matches("0x");
        u32::from_str_radix(x, 16).map_err(serde::de::Error::custom)
    });

    let mut result = EdgeSet::new();
    for index in indices {
        result.insert(EdgeIndex::from_const(index?));
    }

    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_result(exit: ExecutionExit, edges: &[u32]) -> SampleExecutionResult {
        SampleExecutionResult {
            exit,
            new_edges: edges.iter().map(|i| EdgeIndex::from_const(*i)).collect(),
            new_crash_edges: false,
        }
    }

    #[test]
    fn samples_accumulate_into_the_record() {
        let mut db = Database::empty("unused.json");

        db.record_sample("a", &sample_result(ExecutionExit::Exited(0), &[1, 2]));
        db.record_sample("b", &sample_result(ExecutionExit::Crashed(11), &[2, 3]));
        db.record_sample("c", &sample_result(ExecutionExit::TimedOut, &[]));

        assert_eq!(db.data.executions, 3);
        assert_eq!(db.data.crashes, 1);
        assert_eq!(db.data.timeouts, 1);
        assert_eq!(db.data.found_edges.len(), 3);

        // all three runs were notable
        assert_eq!(db.data.runs.len(), 3);
        assert_eq!(db.data.runs[1].new_edges, 1);
    }

    #[test]
    fn boring_runs_are_not_listed() {
        let mut db = Database::empty("unused.json");

        db.record_sample("a", &sample_result(ExecutionExit::Exited(0), &[5]));
        db.record_sample("a", &sample_result(ExecutionExit::Exited(0), &[5]));

        assert_eq!(db.data.executions, 2);
        assert_eq!(db.data.runs.len(), 1);
    }

    #[tokio::test]
    async fn round_trips_through_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("database.json");

        let mut db = Database::empty(&path);
        db.record_sample("seed", &sample_result(ExecutionExit::Crashed(6), &[0x2a, 0x7]));
        db.save().await.unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("00002a"), "edges are stored as hex: {text}");

        let reloaded = Database::from_file(&path).unwrap();
        assert_eq!(reloaded.data.found_edges, db.data.found_edges);
        assert_eq!(reloaded.data.crashes, 1);
        assert_eq!(reloaded.data.runs.len(), 1);
    }

    #[tokio::test]
    async fn clean_databases_skip_the_write() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("database.json");

        let mut db = Database::empty(&path);
        db.save().await.unwrap();

        assert!(!path.exists(), "nothing changed, nothing written");
    }
}
