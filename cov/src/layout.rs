//! This module defines the layout of the shared coverage region.
//! It fixes the sizes, offsets and naming scheme both sides of the
//! tracer/fuzzer pair have to agree on.

use core::mem::size_of;

/// Total size of the shared coverage region in bytes (1 MiB).
pub const SHM_SIZE: usize = 0x100000;

/// Size of the edge count header at the start of the region.
///
/// The instrumented target writes the number of discovered edge
/// guards here during startup; the bitmap follows directly after.
pub const NUM_EDGES_HEADER_SIZE: usize = size_of::<u32>();

/// Number of bytes available for the edge bitmap.
pub const BITMAP_CAPACITY: usize = SHM_SIZE - NUM_EDGES_HEADER_SIZE;

/// Upper bound on edge indices the bitmap can represent.
///
/// Edge indices start at 1 (index 0 marks an untaken guard), so the
/// largest edge count a target may report is `MAX_EDGES - 1`.
pub const MAX_EDGES: usize = BITMAP_CAPACITY * 8;

/// Environment variable carrying the region name to the target process.
///
/// When unset the in-target runtime falls back to a private mapping and
/// coverage is collected but never observed from the outside.
pub const SHM_ENV_VAR: &str = "SHM_ID";

/// Builds the region name for a collector of the current process.
///
/// # Arguments
///
/// * `id` - Distinguishes multiple concurrent regions of one process
///
/// # Returns
///
/// A name suitable for `shm_open`, unique per (process, id) pair
pub fn shm_name(id: u32) -> String {
    format!("shm_id_{}_{}", std::process::id(), id)
}

/// Calculates the number of bitmap bytes to scan for a given edge count.
///
/// Covers indices `0..=num_edges` and rounds up to a multiple of eight
/// bytes so the result can be walked in whole 64-bit words.
pub const fn bitmap_size(num_edges: u32) -> usize {
    if num_edges == 0 {
        return 0;
    }
    let bytes = (num_edges as usize + 1).div_ceil(8);
    bytes.div_ceil(8) * 8
}
