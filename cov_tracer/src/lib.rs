//! In-target runtime for SanitizerCoverage trace-pc-guard
//! instrumentation.
//!
//! Build the target with `-fsanitize-coverage=trace-pc-guard` and link
//! this crate as a static library. During startup the runtime numbers
//! all edge guards, opens the shared region named by the `SHM_ID`
//! environment variable and announces the edge count in the region
//! header. Every taken edge then flips its bit in the shared bitmap
//! exactly once per numbering.
//!
//! Without `SHM_ID` the runtime records into a private mapping, so an
//! instrumented binary stays runnable outside the fuzzer.

use core::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};
use cov::layout::{MAX_EDGES, NUM_EDGES_HEADER_SIZE, SHM_ENV_VAR};
use cov::Region;

/// Bitmap base of the published mapping, null until initialized.
static EDGES: AtomicPtr<u8> = AtomicPtr::new(core::ptr::null_mut());
/// Bitmap length in bytes, valid once [`EDGES`] is published.
static BITMAP_LEN: AtomicUsize = AtomicUsize::new(0);
/// Guard range of the one instrumented module.
static GUARD_START: AtomicPtr<u32> = AtomicPtr::new(core::ptr::null_mut());
static GUARD_STOP: AtomicPtr<u32> = AtomicPtr::new(core::ptr::null_mut());

/// Numbers `guards` starting at 1, in place.
///
/// Index 0 stays reserved for "guard not taken". Guards beyond the
/// bitmap capacity are zeroed so they never record anything.
///
/// # Returns
///
/// The highest index assigned
pub fn reset_guards(guards: &mut [u32]) -> u32 {
    let mut next: u32 = 0;
    for guard in guards.iter_mut() {
        if (next as usize) < MAX_EDGES - 1 {
            next += 1;
            *guard = next;
        } else {
            *guard = 0;
        }
    }
    next
}

/// Number of guards the instrumented module registered, 0 before
/// initialization.
pub fn edges_total() -> u32 {
    let start = GUARD_START.load(Ordering::Relaxed);
    let stop = GUARD_STOP.load(Ordering::Relaxed);
    if start.is_null() || stop.is_null() {
        return 0;
    }

    let num_guards = unsafe { stop.offset_from(start) };
    u32::try_from(num_guards).unwrap_or(u32::MAX)
}

fn attach_region() -> cov::Result<Region> {
    match Region::from_env()? {
        Some(region) => Ok(region),
        None => {
            println!("[cov] no shared memory bitmap available, keeping coverage private");
            Region::anonymous()
        }
    }
}

/// Called by the instrumented module once per object during startup.
///
/// Mirrors the usual trace-pc-guard contract: the runtime supports a
/// single instrumented module and terminates the process when a second
/// one announces itself.
#[allow(clippy::not_unsafe_ptr_arg_deref)]
#[no_mangle]
pub extern "C" fn __sanitizer_cov_trace_pc_guard_init(start: *mut u32, stop: *mut u32) {
    if start.is_null() || start == stop {
        return;
    }
    // a nonzero first guard means this module was initialized before
    if unsafe { start.read_volatile() } != 0 {
        return;
    }

    if !GUARD_START.load(Ordering::Relaxed).is_null()
        || !GUARD_STOP.load(Ordering::Relaxed).is_null()
    {
        eprintln!("[cov] coverage instrumentation is only supported for a single module");
        std::process::exit(-1);
    }
    GUARD_START.store(start, Ordering::Relaxed);
    GUARD_STOP.store(stop, Ordering::Relaxed);

    let region = match attach_region() {
        Ok(region) => region,
        Err(error) => {
            eprintln!(
                "[cov] failed to attach the {} region: {}",
                SHM_ENV_VAR, error
            );
            std::process::exit(-1);
        }
    };
    let region_name = region.name().map(str::to_string);
    let mut map = region.into_static();
    // the mapping stays alive for the rest of the process

    let num_guards = unsafe { stop.offset_from(start) } as usize;
    let guards = unsafe { core::slice::from_raw_parts_mut(start, num_guards) };
    reset_guards(guards);

    unsafe {
        map.write_num_edges(u32::try_from(num_guards).unwrap_or(u32::MAX));
    }

    BITMAP_LEN.store(map.bitmap_len(), Ordering::Relaxed);
    EDGES.store(
        unsafe { map.as_ptr().add(NUM_EDGES_HEADER_SIZE) },
        Ordering::Release,
    );

    println!(
        "[cov] edge guards initialized, {} edges on {}",
        num_guards,
        region_name.as_deref().unwrap_or("a private mapping")
    );
}

/// Renumbers all guards of the instrumented module.
///
/// Persistent-mode targets call this between iterations to make every
/// edge recordable again after the hit path zeroed its guard.
#[no_mangle]
pub extern "C" fn __sanitizer_cov_reset_edgeguards() {
    let start = GUARD_START.load(Ordering::Relaxed);
    let stop = GUARD_STOP.load(Ordering::Relaxed);
    if start.is_null() || stop.is_null() {
        return;
    }

    let num_guards = unsafe { stop.offset_from(start) } as usize;
    let guards = unsafe { core::slice::from_raw_parts_mut(start, num_guards) };
    reset_guards(guards);
}

/// Called by the instrumented module on every taken edge.
#[allow(clippy::not_unsafe_ptr_arg_deref)]
#[no_mangle]
pub extern "C" fn __sanitizer_cov_trace_pc_guard(guard: *mut u32) {
    if guard.is_null() {
        return;
    }
    let index = unsafe { guard.read_volatile() };
    if index == 0 {
        return;
    }

    let edges = EDGES.load(Ordering::Acquire);
    if edges.is_null() {
        return;
    }

    let byte = (index / 8) as usize;
    if byte >= BITMAP_LEN.load(Ordering::Relaxed) {
        return;
    }

    unsafe {
        // plain read-modify-write; a bit lost to a concurrent thread
        // shows up again on the next run of that edge numbering
        let target = edges.add(byte);
        target.write_volatile(target.read_volatile() | 1 << (index % 8));
        // record each edge once, the guard load is the hot-path filter
        guard.write_volatile(0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guards_are_numbered_from_one() {
        let mut guards = vec![0u32; 5];
        assert_eq!(reset_guards(&mut guards), 5);
        assert_eq!(guards, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn renumbering_restores_spent_guards() {
        let mut guards = vec![0u32; 4];
        reset_guards(&mut guards);
        guards[1] = 0;
        guards[3] = 0;

        assert_eq!(reset_guards(&mut guards), 4);
        assert_eq!(guards, vec![1, 2, 3, 4]);
    }

    #[test]
    fn numbering_is_capped_at_the_bitmap_capacity() {
        // ~32 MiB of guards, enough to run past the cap
        let mut guards = vec![0u32; MAX_EDGES + 10];

        assert_eq!(reset_guards(&mut guards) as usize, MAX_EDGES - 1);
        assert_eq!(guards[MAX_EDGES - 2] as usize, MAX_EDGES - 1);
        // everything past the cap must never record an edge
        assert!(guards[MAX_EDGES - 1..].iter().all(|guard| *guard == 0));
    }

    fn edges(indices: &[u32]) -> cov::EdgeSet {
        indices
            .iter()
            .map(|i| cov::EdgeIndex::from_const(*i))
            .collect()
    }

    // exercises the process-global guard registration, so it is the
    // only test in this crate going through the extern hooks
    #[test]
    fn handshake_with_a_collector() {
        let mut collector = cov::CoverageCollector::new(77).unwrap();
        std::env::set_var(SHM_ENV_VAR, collector.shm_name().unwrap());

        let mut guards = vec![0u32; 100];
        let start = guards.as_mut_ptr();
        let stop = unsafe { start.add(guards.len()) };
        __sanitizer_cov_trace_pc_guard_init(start, stop);
        std::env::remove_var(SHM_ENV_VAR);

        assert_eq!(guards[0], 1);
        assert_eq!(guards[99], 100);

        collector.finish_initialization(false).unwrap();
        assert_eq!(collector.num_edges(), 100);
        assert_eq!(edges_total(), 100);

        __sanitizer_cov_trace_pc_guard(&mut guards[4]);
        __sanitizer_cov_trace_pc_guard(&mut guards[41]);
        assert_eq!(guards[4], 0, "taken guards must be spent");
        assert_eq!(collector.evaluate().unwrap(), edges(&[5, 42]));

        // a spent guard stays silent
        collector.clear_bitmap();
        __sanitizer_cov_trace_pc_guard(&mut guards[4]);
        assert!(collector.evaluate().unwrap().is_empty());

        // renumbering makes the edge recordable, but it is known now
        __sanitizer_cov_reset_edgeguards();
        assert_eq!(guards[4], 5);
        collector.clear_bitmap();
        __sanitizer_cov_trace_pc_guard(&mut guards[4]);
        assert!(collector.evaluate().unwrap().is_empty());
        assert_eq!(collector.found_edges(), 2);

        // a second init of the same module is ignored, so a spent
        // guard stays spent and the rest keep their numbers
        __sanitizer_cov_trace_pc_guard_init(start, stop);
        assert_eq!(guards[4], 0, "an ignored init must not renumber");
        assert_eq!(guards[0], 1);
    }
}
