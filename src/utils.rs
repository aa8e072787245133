#![allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]

use crate::error::{PdaError, PdaResult};
use std::fs::{File, OpenOptions};
use std::io;
use std::os::fd::AsRawFd;
use std::path::Path;
use std::ptr::{self, NonNull};
use std::sync::OnceLock;
use std::thread;
use std::time::Duration;

/// Number of open attempts used when the caller has no configuration at hand.
pub const DEFAULT_OPEN_SPIN: u32 = 21;

/// Longest single backoff step; keeps the worst case of a full spin bounded.
const MAX_BACKOFF_SHIFT: u32 = 20;

/// System page size, queried once.
#[must_use]
pub fn page_size() -> usize {
    static PAGE_SIZE: OnceLock<usize> = OnceLock::new();
    *PAGE_SIZE.get_or_init(|| {
        let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if size > 0 { size as usize } else { 4096 }
    })
}

/// Rounds `val` up to a multiple of `align` (a power of two). `None` on overflow.
#[must_use]
pub const fn align_up(val: usize, align: usize) -> Option<usize> {
    match val.checked_add(align - 1) {
        Some(end) => Some(end & !(align - 1)),
        None => None,
    }
}

/// Rounds `len` up to a whole number of system pages.
#[must_use]
pub fn page_align(len: usize) -> Option<usize> {
    align_up(len, page_size())
}

#[must_use]
pub fn is_page_aligned(addr: usize) -> bool {
    addr % page_size() == 0
}

/// Physical pages currently free, as reported by the kernel.
#[must_use]
pub fn available_phys_pages() -> u64 {
    let pages = unsafe { libc::sysconf(libc::_SC_AVPHYS_PAGES) };
    if pages > 0 { pages as u64 } else { 0 }
}

/// Opens `path`, retrying with exponential backoff (1us, 2us, 4us, ...) for at most
/// `spins` attempts. sysfs entries of a freshly bound device can take a moment to
/// appear, so the first failures are expected.
///
/// # Errors
/// Returns the error of the last attempt once the spin budget is exhausted.
pub fn spin_open(path: &Path, options: &OpenOptions, spins: u32) -> io::Result<File> {
    let mut last_err = io::Error::new(io::ErrorKind::NotFound, "no open attempt made");

    for attempt in 0..spins.max(1) {
        match options.open(path) {
            Ok(file) => return Ok(file),
            Err(e) => last_err = e,
        }
        thread::sleep(Duration::from_micros(1 << attempt.min(MAX_BACKOFF_SHIFT)));
    }

    log::debug!("spin_open({}) gave up: {last_err}", path.display());
    Err(last_err)
}

/// Buffer entries are named by their decimal index.
#[must_use]
pub fn parse_index(name: &str) -> Option<u64> {
    name.trim().parse::<u64>().ok()
}

// ===============================================================================================
// Mappings
// ===============================================================================================

/// An `mmap`ed region, unmapped on drop.
#[derive(Debug)]
pub struct MappedRegion {
    ptr: NonNull<u8>,
    len: usize,
}

// The region is plain shared memory; synchronizing access is the user's job.
unsafe impl Send for MappedRegion {}
unsafe impl Sync for MappedRegion {}

impl MappedRegion {
    /// Maps `len` bytes of `file` from offset 0, shared.
    ///
    /// # Errors
    /// Returns the `mmap` errno.
    pub fn map_file(file: &File, len: usize, prot: libc::c_int) -> PdaResult<Self> {
        Self::map_file_at(file, len, prot, ptr::null_mut(), 0)
    }

    /// Like [`Self::map_file`], with an address and extra `MAP_*` flags.
    ///
    /// # Errors
    /// Returns the `mmap` errno.
    pub fn map_file_at(
        file: &File,
        len: usize,
        prot: libc::c_int,
        addr: *mut u8,
        flags: libc::c_int,
    ) -> PdaResult<Self> {
        if len == 0 {
            return Err(PdaError::InvalidArgument("Cannot map zero bytes".into()));
        }

        let ptr = unsafe {
            libc::mmap(
                addr.cast(),
                len,
                prot,
                libc::MAP_SHARED | flags,
                file.as_raw_fd(),
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(PdaError::last_os_error("mmap"));
        }

        NonNull::new(ptr.cast::<u8>())
            .map(|ptr| Self { ptr, len })
            .ok_or_else(|| PdaError::InvalidArgument("mmap returned NULL".into()))
    }

    /// Anonymous, inaccessible range, used to claim address space.
    ///
    /// # Errors
    /// Returns the `mmap` errno.
    pub fn reserve(len: usize) -> PdaResult<Self> {
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_NONE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(PdaError::last_os_error("mmap (reserve)"));
        }

        NonNull::new(ptr.cast::<u8>())
            .map(|ptr| Self { ptr, len })
            .ok_or_else(|| PdaError::InvalidArgument("mmap returned NULL".into()))
    }

    /// Takes ownership of an existing mapping.
    ///
    /// # Safety
    /// `ptr..ptr + len` must be a mapping nobody else unmaps.
    #[must_use]
    pub const unsafe fn from_raw(ptr: NonNull<u8>, len: usize) -> Self {
        Self { ptr, len }
    }

    /// Gives up ownership without unmapping.
    #[must_use]
    pub fn into_raw(self) -> (NonNull<u8>, usize) {
        let raw = (self.ptr, self.len);
        std::mem::forget(self);
        raw
    }

    #[must_use]
    pub const fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Drop for MappedRegion {
    fn drop(&mut self) {
        let ret = unsafe { libc::munmap(self.ptr.as_ptr().cast(), self.len) };
        if ret != 0 {
            log::warn!(
                "munmap({:p}, {}) failed: {}",
                self.ptr,
                self.len,
                io::Error::last_os_error()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::TempDir;

    #[test]
    fn page_alignment() {
        let page = page_size();
        assert!(page.is_power_of_two());
        assert_eq!(page_align(1), Some(page));
        assert_eq!(page_align(page), Some(page));
        assert_eq!(page_align(page + 1), Some(2 * page));
        assert_eq!(page_align(usize::MAX - 10), None);
        assert_eq!(align_up(usize::MAX - 7, 8), Some(usize::MAX - 7));
        assert!(is_page_aligned(3 * page));
        assert!(!is_page_aligned(page + 8));
    }

    #[test]
    fn spin_open_gives_up_with_last_error() {
        let dir = TempDir::new("spin");
        let mut opts = OpenOptions::new();
        opts.read(true);
        let err = spin_open(&dir.path().join("missing"), &opts, 3).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);

        std::fs::write(dir.path().join("present"), b"1").unwrap();
        assert!(spin_open(&dir.path().join("present"), &opts, 3).is_ok());
    }

    #[test]
    fn index_names() {
        assert_eq!(parse_index("42"), Some(42));
        assert_eq!(parse_index("42\n"), Some(42));
        assert_eq!(parse_index("map"), None);
    }

    #[test]
    fn file_mapping_is_shared() {
        let dir = TempDir::new("mapping");
        let path = dir.path().join("data");
        let file = File::options()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .unwrap();
        file.set_len(page_size() as u64).unwrap();

        let region =
            MappedRegion::map_file(&file, page_size(), libc::PROT_READ | libc::PROT_WRITE).unwrap();
        unsafe { region.as_ptr().add(7).write_volatile(0x5a) };
        drop(region);

        assert_eq!(std::fs::read(&path).unwrap()[7], 0x5a);
        assert!(MappedRegion::map_file(&file, 0, libc::PROT_READ).is_err());
    }
}
