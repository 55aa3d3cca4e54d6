//! Drives the sample executor with libafl's havoc pipeline.
//!
//! New edges reported by the coverage collector are folded into a
//! fixed-size map observer, so the usual map feedback decides corpus
//! membership while crashes go to the solutions directory.

use crate::database::Database;
use crate::executor::{ExecutionExit, SampleExecutor};
use cov::EdgeSet;
use libafl::corpus::{InMemoryCorpus, OnDiskCorpus};
use libafl::events::{SendExiting, SimpleEventManager};
use libafl::executors::{Executor, ExitKind, HasObservers};
use libafl::feedbacks::{CrashFeedback, MaxMapFeedback};
use libafl::generators::RandBytesGenerator;
use libafl::inputs::HasTargetBytes;
use libafl::monitors::SimpleMonitor;
use libafl::mutators::{havoc_mutations, HavocScheduledMutator};
use libafl::observers::{MapObserver, Observer, ObserversTuple};
use libafl::schedulers::QueueScheduler;
use libafl::stages::StdMutationalStage;
use libafl::state::{HasExecutions, StdState};
use libafl::{Fuzzer, StdFuzzer};
use libafl_bolts::rands::StdRand;
use libafl_bolts::tuples::{tuple_list, HasConstLen, RefIndexable};
use libafl_bolts::{nonzero, Error, ErrorBacktrace, HasLen, Named};
use log::error;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::hash::Hash;
use std::marker::PhantomData;
use std::ops::Deref;
use std::path::PathBuf;
use std::sync::Mutex;
use tokio::runtime::Runtime;

/// Slots in the observer map; edge indices are folded onto this size.
pub const AFL_MAP_SIZE: usize = 1 << 16;

static LAST_NEW_EDGES: Mutex<Option<EdgeSet>> = Mutex::new(None);

const HANDLE_EDGE_MAP: Cow<'static, str> = Cow::Borrowed("covEdges");

pub struct CovExecutor<'a, OT, I, S>
where
    OT: ObserversTuple<I, S>,
{
    executor: &'a mut SampleExecutor,
    database: &'a mut Database,
    observers: OT,
    phantom: PhantomData<(I, S)>,
    runtime: Runtime,
}

impl<'a, OT, I, S> CovExecutor<'a, OT, I, S>
where
    OT: ObserversTuple<I, S>,
{
    fn new(executor: &'a mut SampleExecutor, database: &'a mut Database, observers: OT) -> Self {
        CovExecutor {
            executor,
            database,
            observers,
            phantom: PhantomData,
            runtime: tokio::runtime::Runtime::new().expect("create tokio runtime"),
        }
    }
}

impl<'a, EM, I, S, Z, OT> Executor<EM, I, S, Z> for CovExecutor<'a, OT, I, S>
where
    S: HasExecutions,
    OT: ObserversTuple<I, S>,
    EM: SendExiting,
    I: HasTargetBytes,
{
    fn run_target(
        &mut self,
        _fuzzer: &mut Z,
        state: &mut S,
        mgr: &mut EM,
        input: &I,
    ) -> Result<ExitKind, Error> {
        *state.executions_mut() += 1;

        let bytes = input.target_bytes();
        let result = self
            .runtime
            .block_on(self.executor.execute_sample(Some(bytes.as_ref())));

        match result {
            Err(e) => {
                error!("Cannot execute samples anymore, stopping: {e}");
                let _ = mgr.send_exiting();
                Err(Error::Runtime(
                    format!("sample execution failed: {e}"),
                    ErrorBacktrace::new(),
                ))
            }
            Ok(outcome) => {
                if let Ok(mut data) = LAST_NEW_EDGES.lock() {
                    *data = Some(outcome.new_edges.clone());
                }

                self.database.record_sample("afl", &outcome);

                Ok(match outcome.exit {
                    ExecutionExit::Exited(_) => ExitKind::Ok,
                    ExecutionExit::Crashed(_) => ExitKind::Crash,
                    ExecutionExit::TimedOut => ExitKind::Timeout,
                })
            }
        }
    }
}

impl<'a, OT, I, S> HasObservers for CovExecutor<'a, OT, I, S>
where
    OT: ObserversTuple<I, S>,
{
    type Observers = OT;

    #[inline]
    fn observers(&self) -> RefIndexable<&Self::Observers, Self::Observers> {
        RefIndexable::from(&self.observers)
    }

    #[inline]
    fn observers_mut(&mut self) -> RefIndexable<&mut Self::Observers, Self::Observers> {
        RefIndexable::from(&mut self.observers)
    }
}

/// Map observer fed from the collector's edge verdicts.
///
/// The shared bitmap itself reports every edge only once, so this map
/// holds the newly discovered edges of the last run, folded onto
/// [`AFL_MAP_SIZE`] slots.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct EdgeMapObserver {
    #[serde(skip, default = "empty_map")]
    map: Vec<u8>,
}

fn empty_map() -> Vec<u8> {
    vec![0; AFL_MAP_SIZE]
}

impl Default for EdgeMapObserver {
    fn default() -> Self {
        EdgeMapObserver { map: empty_map() }
    }
}

impl<I, S> Observer<I, S> for EdgeMapObserver {
    fn pre_exec(&mut self, _state: &mut S, _input: &I) -> Result<(), Error> {
        if let Ok(mut data) = LAST_NEW_EDGES.lock() {
            *data = None;
        }
        self.reset_map()?;
        Ok(())
    }

    fn post_exec(&mut self, _state: &mut S, _input: &I, _exit_kind: &ExitKind) -> Result<(), Error> {
        if let Ok(data) = LAST_NEW_EDGES.lock() {
            if let Some(edges) = data.as_ref() {
                for edge in edges {
                    let slot = edge.index() as usize % AFL_MAP_SIZE;
                    self.map[slot] = self.map[slot].saturating_add(1);
                }
            }
        }
        Ok(())
    }
}

impl Named for EdgeMapObserver {
    fn name(&self) -> &Cow<'static, str> {
        &HANDLE_EDGE_MAP
    }
}

impl HasConstLen for EdgeMapObserver {
    const LEN: usize = AFL_MAP_SIZE;
}

impl HasLen for EdgeMapObserver {
    fn len(&self) -> usize {
        self.map.len()
    }
}

impl Hash for EdgeMapObserver {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.map.hash(state)
    }
}

impl MapObserver for EdgeMapObserver {
    type Entry = u8;

    fn count_bytes(&self) -> u64 {
        self.map.iter().filter(|&&slot| slot > 0).count() as u64
    }

    fn get(&self, idx: usize) -> Self::Entry {
        self.map.get(idx).copied().unwrap_or(0)
    }

    fn usable_count(&self) -> usize {
        self.map.len()
    }

    fn how_many_set(&self, indexes: &[usize]) -> usize {
        indexes.iter().filter(|&&idx| self.get(idx) > 0).count()
    }

    fn initial(&self) -> Self::Entry {
        0
    }

    fn reset_map(&mut self) -> Result<(), Error> {
        self.map.fill(0);
        Ok(())
    }

    fn set(&mut self, idx: usize, val: Self::Entry) {
        if let Some(slot) = self.map.get_mut(idx) {
            *slot = val;
        }
    }

    fn to_vec(&self) -> Vec<Self::Entry> {
        self.map.clone()
    }
}

impl AsRef<Self> for EdgeMapObserver {
    fn as_ref(&self) -> &Self {
        self
    }
}

impl AsMut<Self> for EdgeMapObserver {
    fn as_mut(&mut self) -> &mut Self {
        self
    }
}

impl Deref for EdgeMapObserver {
    type Target = [u8];
    fn deref(&self) -> &Self::Target {
        &self.map
    }
}

/// Runs the fuzzing loop until stopped, or for `iterations` rounds.
///
/// Crashing inputs land in `solutions`, the evolving corpus stays in
/// memory. Blocks the calling thread; the executor brings its own
/// runtime for the async sample path.
pub fn afl_main(
    executor: &mut SampleExecutor,
    database: &mut Database,
    solutions: Option<PathBuf>,
    iterations: Option<u64>,
) -> Result<(), Error> {
    let edge_observer = EdgeMapObserver::default();

    // Feedback to rate the interestingness of an input
    let mut feedback = MaxMapFeedback::new(&edge_observer);

    // A feedback to choose if an input is a solution or not
    let mut objective = CrashFeedback::new();

    let mut state = StdState::new(
        StdRand::new(),
        // Corpus that will be evolved, we keep it in memory for performance
        InMemoryCorpus::new(),
        // Corpus in which we store solutions on disk so the user can get them after stopping the fuzzer
        OnDiskCorpus::new(solutions.unwrap_or_else(|| PathBuf::from("./findings")))?,
        &mut feedback,
        &mut objective,
    )?;

    let mon = SimpleMonitor::new(|s| println!("{s}"));

    // The event manager handles the various events generated during the fuzzing loop
    // such as the notification of the addition of a new item to the corpus
    let mut mgr = SimpleEventManager::new(mon);

    // A queue policy to get testcases from the corpus
    let scheduler = QueueScheduler::new();

    let mut fuzzer = StdFuzzer::new(scheduler, feedback, objective);

    let mut executor = CovExecutor::new(executor, database, tuple_list!(edge_observer));

    // Generator of byte arrays of max size 64
    let mut generator = RandBytesGenerator::new(nonzero!(64));

    // Generate 8 initial inputs
    state.generate_initial_inputs(&mut fuzzer, &mut executor, &mut generator, &mut mgr, 8)?;

    // Setup a mutational stage with a basic bytes mutator
    let mutator = HavocScheduledMutator::new(havoc_mutations());
    let mut stages = tuple_list!(StdMutationalStage::new(mutator));

    match iterations {
        Some(rounds) => {
            fuzzer.fuzz_loop_for(&mut stages, &mut executor, &mut state, &mut mgr, rounds)?;
        }
        None => {
            fuzzer.fuzz_loop(&mut stages, &mut executor, &mut state, &mut mgr)?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use cov::EdgeIndex;

    fn publish_edges(indices: &[u32]) {
        if let Ok(mut data) = LAST_NEW_EDGES.lock() {
            *data = Some(indices.iter().map(|i| EdgeIndex::from_const(*i)).collect());
        }
    }

    // single test since the side channel is a process global
    #[test]
    fn edges_fold_into_the_observer_map() {
        let mut observer = EdgeMapObserver::default();

        publish_edges(&[3, 70000]);
        Observer::<(), ()>::post_exec(&mut observer, &mut (), &(), &ExitKind::Ok).unwrap();
        assert_eq!(observer.get(3), 1);
        assert_eq!(observer.get(70000 % AFL_MAP_SIZE), 1);
        assert_eq!(observer.count_bytes(), 2);

        // folded collisions accumulate in their shared slot
        Observer::<(), ()>::pre_exec(&mut observer, &mut (), &()).unwrap();
        publish_edges(&[5, 5 + AFL_MAP_SIZE as u32]);
        Observer::<(), ()>::post_exec(&mut observer, &mut (), &(), &ExitKind::Ok).unwrap();
        assert_eq!(observer.get(5), 2);
        assert_eq!(observer.count_bytes(), 1);

        // pre_exec resets both the map and the side channel
        Observer::<(), ()>::pre_exec(&mut observer, &mut (), &()).unwrap();
        assert_eq!(observer.count_bytes(), 0);
        assert!(LAST_NEW_EDGES.lock().unwrap().is_none());
    }
}
