//! This module owns the mapped coverage region shared with the target.
//! The fuzzer side creates a named POSIX shared memory object, the
//! in-target runtime opens it by the name passed through [`SHM_ENV_VAR`].

use crate::error::{CoverageError, Result};
use crate::layout::{SHM_ENV_VAR, SHM_SIZE};
use core::ptr::NonNull;
use std::ffi::CString;
use std::io;

#[allow(clippy::missing_safety_doc)]
pub mod raw {
    use crate::layout::NUM_EDGES_HEADER_SIZE;
    use core::ptr::NonNull;

    /// Raw view of a mapped coverage region.
    ///
    /// All accesses are volatile since the other side of the mapping
    /// writes concurrently while a sample runs.
    pub struct CoverageMap {
        base: NonNull<u8>,
        size: usize,
    }

    impl CoverageMap {
        /// # Safety
        ///
        /// `base` must point to a readable and writable mapping of at
        /// least `size` bytes that stays valid for the lifetime of the
        /// returned view. `size` must exceed the header.
        pub unsafe fn new(base: NonNull<u8>, size: usize) -> Self {
            assert!(size > NUM_EDGES_HEADER_SIZE);
            Self { base, size }
        }

        pub const fn size(&self) -> usize {
            self.size
        }

        pub const fn as_ptr(&self) -> *mut u8 {
            self.base.as_ptr()
        }

        /// Number of bitmap bytes behind the header.
        pub const fn bitmap_len(&self) -> usize {
            self.size - NUM_EDGES_HEADER_SIZE
        }

        fn header(&self) -> NonNull<u32> {
            // the mapping is page aligned, the header sits at offset 0
            self.base.cast()
        }

        unsafe fn bitmap(&self) -> NonNull<u8> {
            self.base.add(NUM_EDGES_HEADER_SIZE)
        }

        pub unsafe fn read_num_edges(&self) -> u32 {
            self.header().read_volatile()
        }

        pub unsafe fn write_num_edges(&mut self, value: u32) {
            self.header().write_volatile(value);
        }

        pub unsafe fn read_edge(&self, index: u32) -> bool {
            let byte = (index / 8) as usize;
            if byte >= self.bitmap_len() {
                return false;
            }

            self.bitmap().add(byte).read_volatile() & (1 << (index % 8)) != 0
        }

        pub unsafe fn set_edge(&mut self, index: u32) {
            let byte = (index / 8) as usize;
            if byte >= self.bitmap_len() {
                return;
            }

            let target = self.bitmap().add(byte);
            target.write_volatile(target.read_volatile() | 1 << (index % 8));
        }

        pub unsafe fn clear_edge(&mut self, index: u32) {
            let byte = (index / 8) as usize;
            if byte >= self.bitmap_len() {
                return;
            }

            let target = self.bitmap().add(byte);
            target.write_volatile(target.read_volatile() & !(1 << (index % 8)));
        }

        pub unsafe fn fill(&mut self, value: u8) {
            self.bitmap().write_bytes(value, self.bitmap_len());
        }

        pub unsafe fn bitmap_slice(&self) -> &[u8] {
            core::slice::from_raw_parts(self.bitmap().as_ptr(), self.bitmap_len())
        }
    }
}

/// An owned coverage region.
///
/// Named regions are backed by `shm_open`; the creator unlinks the name
/// again on drop. [`Region::anonymous`] maps private memory instead and
/// is used by the in-target runtime when no region name was handed down
/// and by tests.
pub struct Region {
    map: raw::CoverageMap,
    name: Option<CString>,
    unlink_on_drop: bool,
}

// The mapping is plain memory without thread affinity.
unsafe impl Send for Region {}

impl Region {
    /// Creates (or recycles) the named region and maps it.
    ///
    /// Opens with `O_CREAT` but without `O_EXCL` so a region left over
    /// from a crashed run of the same pid is reused instead of failing.
    /// The mapping is zeroed either way. A create that fails once the
    /// name exists unlinks it again before returning.
    pub fn create(name: &str) -> Result<Self> {
        Self::create_sized(name, SHM_SIZE)
    }

    fn create_sized(name: &str, size: usize) -> Result<Self> {
        let c_name = cstring(name)?;

        let fd = unsafe {
            libc::shm_open(
                c_name.as_ptr(),
                libc::O_CREAT | libc::O_RDWR,
                libc::S_IRUSR | libc::S_IWUSR,
            )
        };
        if fd < 0 {
            return Err(shm_error("shm_open", name));
        }

        if unsafe { libc::ftruncate(fd, size as libc::off_t) } < 0 {
            let error = shm_error("ftruncate", name);
            unsafe {
                libc::close(fd);
                libc::shm_unlink(c_name.as_ptr());
            }
            return Err(error);
        }

        let mut map = match map_fd(fd, name, size) {
            Ok(map) => map,
            Err(error) => {
                unsafe { libc::shm_unlink(c_name.as_ptr()) };
                return Err(error);
            }
        };
        unsafe {
            map.write_num_edges(0);
            map.fill(0);
        }

        Ok(Self {
            map,
            name: Some(c_name),
            unlink_on_drop: true,
        })
    }

    /// Opens an existing named region, as the instrumented target does
    /// with the name from [`SHM_ENV_VAR`]. Never creates or unlinks.
    pub fn open(name: &str) -> Result<Self> {
        let c_name = cstring(name)?;

        let fd = unsafe {
            libc::shm_open(
                c_name.as_ptr(),
                libc::O_RDWR,
                libc::S_IRUSR | libc::S_IWUSR,
            )
        };
        if fd < 0 {
            return Err(shm_error("shm_open", name));
        }

        let map = map_fd(fd, name, SHM_SIZE)?;

        Ok(Self {
            map,
            name: Some(c_name),
            unlink_on_drop: false,
        })
    }

    /// Opens the region named by [`SHM_ENV_VAR`], if set.
    pub fn from_env() -> Result<Option<Self>> {
        match std::env::var(SHM_ENV_VAR) {
            Ok(name) => Self::open(&name).map(Some),
            Err(_) => Ok(None),
        }
    }

    /// Maps a private region of the same layout, visible to nobody else.
    pub fn anonymous() -> Result<Self> {
        let base = unsafe {
            libc::mmap(
                core::ptr::null_mut(),
                SHM_SIZE,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(CoverageError::AnonymousMapping(io::Error::last_os_error()));
        }

        // mmap never returns null on success
        let base = unsafe { NonNull::new_unchecked(base.cast::<u8>()) };
        Ok(Self {
            map: unsafe { raw::CoverageMap::new(base, SHM_SIZE) },
            name: None,
            unlink_on_drop: false,
        })
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_ref().and_then(|name| name.to_str().ok())
    }

    pub fn num_edges(&self) -> u32 {
        unsafe { self.map.read_num_edges() }
    }

    pub fn set_num_edges(&mut self, value: u32) {
        unsafe { self.map.write_num_edges(value) }
    }

    pub fn edge(&self, index: u32) -> bool {
        unsafe { self.map.read_edge(index) }
    }

    pub fn set_edge(&mut self, index: u32) {
        unsafe { self.map.set_edge(index) }
    }

    pub fn clear_edge(&mut self, index: u32) {
        unsafe { self.map.clear_edge(index) }
    }

    /// Zeroes the whole bitmap, leaving the header untouched.
    pub fn clear_bitmap(&mut self) {
        unsafe { self.map.fill(0) }
    }

    pub fn bitmap_len(&self) -> usize {
        self.map.bitmap_len()
    }

    /// The bitmap bytes behind the header.
    ///
    /// Only meaningful while no target is writing the region, so read
    /// it after the sample exited.
    pub fn bitmap(&self) -> &[u8] {
        unsafe { self.map.bitmap_slice() }
    }

    /// Gives up ownership and keeps the mapping alive for the rest of
    /// the process. The in-target runtime uses this since coverage is
    /// recorded until exit; a named region is left for its creator to
    /// unlink.
    pub fn into_static(self) -> raw::CoverageMap {
        let this = core::mem::ManuallyDrop::new(self);
        unsafe { core::ptr::read(&this.map) }
    }
}

impl Drop for Region {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.map.as_ptr().cast::<libc::c_void>(), self.map.size());
            if self.unlink_on_drop {
                if let Some(name) = &self.name {
                    libc::shm_unlink(name.as_ptr());
                }
            }
        }
    }
}

fn cstring(name: &str) -> Result<CString> {
    CString::new(name).map_err(|_| CoverageError::InvalidName(name.to_string()))
}

fn shm_error(operation: &'static str, name: &str) -> CoverageError {
    CoverageError::Shm {
        operation,
        name: name.to_string(),
        source: io::Error::last_os_error(),
    }
}

/// Maps `size` bytes of `fd` shared and closes the descriptor.
fn map_fd(fd: libc::c_int, name: &str, size: usize) -> Result<raw::CoverageMap> {
    let base = unsafe {
        libc::mmap(
            core::ptr::null_mut(),
            size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED,
            fd,
            0,
        )
    };
    let mmap_error = io::Error::last_os_error();
    unsafe { libc::close(fd) };

    if base == libc::MAP_FAILED {
        return Err(CoverageError::Shm {
            operation: "mmap",
            name: name.to_string(),
            source: mmap_error,
        });
    }

    let base = unsafe { NonNull::new_unchecked(base.cast::<u8>()) };
    Ok(unsafe { raw::CoverageMap::new(base, size) })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::{shm_name, BITMAP_CAPACITY};

    #[test]
    fn anonymous_region_starts_empty() {
        let region = Region::anonymous().unwrap();
        assert_eq!(region.num_edges(), 0);
        assert_eq!(region.bitmap_len(), BITMAP_CAPACITY);
        assert!(region.bitmap().iter().all(|byte| *byte == 0));
    }

    #[test]
    fn edge_bits_round_trip() {
        let mut region = Region::anonymous().unwrap();
        for index in [1u32, 8, 9, 4096, 70000] {
            assert!(!region.edge(index));
            region.set_edge(index);
            assert!(region.edge(index));
        }

        region.clear_edge(9);
        assert!(!region.edge(9));
        assert!(region.edge(8));

        region.clear_bitmap();
        assert!(!region.edge(1));
        assert!(region.bitmap().iter().all(|byte| *byte == 0));
    }

    #[test]
    fn out_of_range_edges_are_ignored() {
        let mut region = Region::anonymous().unwrap();
        let out_of_range = (BITMAP_CAPACITY as u32) * 8 + 1;
        region.set_edge(out_of_range);
        assert!(!region.edge(out_of_range));
    }

    #[test]
    fn named_region_is_shared_between_mappings() {
        let name = shm_name(9001);
        let mut creator = Region::create(&name).unwrap();
        let opened = Region::open(&name).unwrap();

        creator.set_num_edges(123);
        creator.set_edge(77);

        assert_eq!(opened.num_edges(), 123);
        assert!(opened.edge(77));
        assert_eq!(opened.name(), Some(name.as_str()));
    }

    #[test]
    fn open_of_missing_region_fails() {
        let result = Region::open(&shm_name(424242));
        assert!(matches!(result, Err(CoverageError::Shm { .. })));
    }

    #[test]
    fn failed_create_leaves_no_name_behind() {
        let name = shm_name(9003);

        // usize::MAX wraps to a negative length, ftruncate rejects it
        assert!(Region::create_sized(&name, usize::MAX).is_err());
        assert!(matches!(
            Region::open(&name),
            Err(CoverageError::Shm { .. })
        ));

        // a zero length passes ftruncate and dies at mmap
        assert!(Region::create_sized(&name, 0).is_err());
        assert!(matches!(
            Region::open(&name),
            Err(CoverageError::Shm { .. })
        ));
    }

    #[test]
    fn only_the_creator_unlinks_the_name() {
        let name = shm_name(9002);
        {
            let _creator = Region::create(&name).unwrap();
            // an opener coming and going leaves the name alone
            drop(Region::open(&name).unwrap());
            assert!(Region::open(&name).is_ok());
        }
        assert!(matches!(
            Region::open(&name),
            Err(CoverageError::Shm { .. })
        ));
    }
}
