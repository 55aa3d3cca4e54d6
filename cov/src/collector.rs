//! This module provides the fuzzer side of coverage collection.
//! It validates the map the instrumented target announced, scans the
//! shared bitmap after each sample and keeps the history needed to
//! decide whether a sample reached new code.

use crate::edge::{EdgeIndex, EdgeSet};
use crate::error::{CoverageError, Result};
use crate::layout::{bitmap_size, shm_name, MAX_EDGES};
use crate::region::Region;
use log::debug;

/// History the collector keeps between samples once the map is known.
struct MapState {
    num_edges: u32,
    /// Number of bitmap bytes covered by a scan, clamped to the region.
    scan_len: usize,
    /// One bit per edge, set while the edge was never hit.
    virgin_bits: Vec<u8>,
    /// Same filter, but consumed by crashing samples only.
    crash_bits: Vec<u8>,
    /// Per-edge hit counters, kept when edge tracking was requested.
    edge_counts: Option<Vec<u32>>,
    found_edges: u64,
}

/// Collects edge coverage from one target via a shared memory region.
///
/// The lifecycle follows the handshake with the in-target runtime:
/// create the region, run the target once so its startup announces the
/// edge count, then [`finish_initialization`](Self::finish_initialization)
/// and evaluate every further sample.
pub struct CoverageCollector {
    region: Region,
    state: Option<MapState>,
}

impl CoverageCollector {
    /// Creates the shared region this collector watches.
    ///
    /// # Arguments
    ///
    /// * `id` - Distinguishes concurrent collectors of this process
    pub fn new(id: u32) -> Result<Self> {
        let region = Region::create(&shm_name(id))?;
        debug!("created coverage region {:?}", region.name());
        Ok(Self {
            region,
            state: None,
        })
    }

    /// Wraps an existing region, mainly for tests and private mappings.
    pub fn with_region(region: Region) -> Self {
        Self {
            region,
            state: None,
        }
    }

    /// Name to hand to the target through the environment, if any.
    pub fn shm_name(&self) -> Option<&str> {
        self.region.name()
    }

    pub fn region(&self) -> &Region {
        &self.region
    }

    pub fn region_mut(&mut self) -> &mut Region {
        &mut self.region
    }

    pub const fn is_initialized(&self) -> bool {
        self.state.is_some()
    }

    /// Adopts the edge count the target wrote during its startup.
    ///
    /// Must happen after the first run of the target and before the
    /// first evaluation. Does nothing when already initialized.
    ///
    /// # Arguments
    ///
    /// * `track_edges` - Also keep a hit counter per edge
    pub fn finish_initialization(&mut self, track_edges: bool) -> Result<()> {
        if self.state.is_some() {
            return Ok(());
        }

        let num_edges = self.region.num_edges();
        if num_edges == 0 {
            return Err(CoverageError::NoInstrumentation);
        }
        if num_edges as usize > MAX_EDGES {
            return Err(CoverageError::TooManyEdges {
                num_edges,
                limit: MAX_EDGES,
            });
        }

        let scan_len = bitmap_size(num_edges).min(self.region.bitmap_len());
        let mut virgin_bits = vec![0xff; scan_len];
        let mut crash_bits = vec![0xff; scan_len];

        // edge 0 marks an untaken guard and is never reported
        virgin_bits[0] &= !1;
        crash_bits[0] &= !1;

        let edge_counts = track_edges.then(|| vec![0u32; num_edges as usize + 1]);

        // the startup run already left bits behind
        self.region.clear_bitmap();

        debug!("coverage map holds {} edges ({} scan bytes)", num_edges, scan_len);
        self.state = Some(MapState {
            num_edges,
            scan_len,
            virgin_bits,
            crash_bits,
            edge_counts,
            found_edges: 0,
        });
        Ok(())
    }

    /// Scans the bitmap of the last run and returns the edges no sample
    /// reached before. Reported edges are remembered and not reported
    /// again.
    pub fn evaluate(&mut self) -> Result<EdgeSet> {
        let state = self.state.as_mut().ok_or(CoverageError::NotInitialized)?;
        let shared = &self.region.bitmap()[..state.scan_len];

        if let Some(counts) = &mut state.edge_counts {
            count_hits(shared, counts);
        }

        let new_edges = take_new_edges(shared, &mut state.virgin_bits);
        state.found_edges += new_edges.len() as u64;
        Ok(new_edges)
    }

    /// Like [`evaluate`](Self::evaluate), but against the history of
    /// crashing samples. Returns whether the crash reached new code.
    ///
    /// Crash edges do not count towards [`found_edges`](Self::found_edges)
    /// and leave the regular history untouched, so a later clean sample
    /// through the same code still registers as progress.
    pub fn evaluate_crash(&mut self) -> Result<bool> {
        let state = self.state.as_mut().ok_or(CoverageError::NotInitialized)?;
        let shared = &self.region.bitmap()[..state.scan_len];

        let new_edges = take_new_edges(shared, &mut state.crash_bits);
        Ok(!new_edges.is_empty())
    }

    /// Zeroes the shared bitmap. Call before every sample.
    pub fn clear_bitmap(&mut self) {
        self.region.clear_bitmap();
    }

    /// Marks an edge as never seen again and drops its hit counter.
    /// Used to discard edges that turned out to be flaky.
    pub fn clear_edge_data(&mut self, index: EdgeIndex) -> Result<()> {
        let state = self.state.as_mut().ok_or(CoverageError::NotInitialized)?;

        let byte = index.byte();
        if byte < state.virgin_bits.len() {
            let mask = index.mask();
            if state.virgin_bits[byte] & mask == 0 {
                state.found_edges = state.found_edges.saturating_sub(1);
            }
            state.virgin_bits[byte] |= mask;
        }

        if let Some(counts) = &mut state.edge_counts {
            if let Some(count) = counts.get_mut(index.index() as usize) {
                *count = 0;
            }
        }
        Ok(())
    }

    /// Forgets all collected history, as if no sample had run yet.
    /// The shared bitmap stays as it is; callers clear it before the
    /// next run anyway.
    pub fn reset_state(&mut self) -> Result<()> {
        let state = self.state.as_mut().ok_or(CoverageError::NotInitialized)?;

        state.virgin_bits.fill(0xff);
        state.crash_bits.fill(0xff);
        state.virgin_bits[0] &= !1;
        state.crash_bits[0] &= !1;
        if let Some(counts) = &mut state.edge_counts {
            counts.fill(0);
        }
        state.found_edges = 0;
        Ok(())
    }

    /// Number of edges the target announced, 0 before initialization.
    pub fn num_edges(&self) -> u32 {
        self.state.as_ref().map_or(0, |state| state.num_edges)
    }

    /// Number of distinct edges seen by non-crashing samples so far.
    pub fn found_edges(&self) -> u64 {
        self.state.as_ref().map_or(0, |state| state.found_edges)
    }

    /// Whether every given edge is set in the bitmap of the last run.
    ///
    /// Lets a replay confirm that a sample still reaches the edges it
    /// was kept for.
    pub fn has_all_edges(&self, edges: &EdgeSet) -> Result<bool> {
        if self.state.is_none() {
            return Err(CoverageError::NotInitialized);
        }
        Ok(edges.iter().all(|edge| self.region.edge(edge.index())))
    }

    /// Fraction of announced edges found so far.
    pub fn coverage_ratio(&self) -> f64 {
        match &self.state {
            Some(state) if state.num_edges > 0 => {
                state.found_edges as f64 / f64::from(state.num_edges)
            }
            _ => 0.0,
        }
    }

    /// Hit counters per edge index, when tracking was requested.
    pub fn edge_counts(&self) -> Option<&[u32]> {
        self.state
            .as_ref()
            .and_then(|state| state.edge_counts.as_deref())
    }
}

/// Collects the set bits of `shared` that are still set in `filter`,
/// clearing them in `filter` so they are only reported once.
fn take_new_edges(shared: &[u8], filter: &mut [u8]) -> EdgeSet {
    let mut found = EdgeSet::new();
    let word_bytes = shared.len() - shared.len() % 8;
    let (shared_words, shared_tail) = shared.split_at(word_bytes);
    let (filter_words, filter_tail) = filter.split_at_mut(word_bytes);

    // the bitmap starts right after the u32 header, so it is not
    // 8-byte aligned in the mapping and gets read bytewise
    for (word_index, (shared_word, filter_word)) in shared_words
        .chunks_exact(8)
        .zip(filter_words.chunks_exact_mut(8))
        .enumerate()
    {
        let shared_value = u64::from_le_bytes(shared_word.try_into().unwrap());
        if shared_value == 0 {
            continue;
        }
        let new_bits = shared_value & u64::from_le_bytes(filter_word.try_into().unwrap());
        if new_bits == 0 {
            continue;
        }

        for bit in 0..64 {
            if new_bits & (1 << bit) != 0 {
                filter_word[bit / 8] &= !(1 << (bit % 8));
                found.insert(EdgeIndex::from_const((word_index * 64 + bit) as u32));
            }
        }
    }

    for (offset, (shared_byte, filter_byte)) in
        shared_tail.iter().zip(filter_tail.iter_mut()).enumerate()
    {
        let new_bits = shared_byte & *filter_byte;
        if new_bits == 0 {
            continue;
        }

        for bit in 0..8 {
            if new_bits & (1 << bit) != 0 {
                *filter_byte &= !(1 << bit);
                found.insert(EdgeIndex::from_const(
                    ((word_bytes + offset) * 8 + bit) as u32,
                ));
            }
        }
    }

    found
}

/// Bumps the counter of every edge set in `shared`.
fn count_hits(shared: &[u8], counts: &mut [u32]) {
    for (byte_index, byte) in shared.iter().enumerate() {
        if *byte == 0 {
            continue;
        }
        for bit in 0..8 {
            if byte & (1 << bit) != 0 {
                if let Some(count) = counts.get_mut(byte_index * 8 + bit) {
                    *count = count.saturating_add(1);
                }
            }
        }
    }
}
