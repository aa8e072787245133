#![allow(clippy::cast_possible_truncation)]

use super::sglist::SgList;
use super::wrap::{wrap_file, wrap_user};
use crate::error::{PdaError, PdaResult};
use crate::uio::backend::DmaBackend;
use crate::uio::protocol::{BufferRequest, ScatterRecord};
use crate::utils::{MappedRegion, is_page_aligned, page_align, page_size};
use std::fs::File;
use std::io;
use std::os::fd::AsRawFd;
use std::ptr::NonNull;
use std::sync::Arc;

// ===============================================================================================
// Types
// ===============================================================================================

/// How the memory behind a buffer came to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferKind {
    /// Allocated by the adapter.
    KernelBacked,
    /// Caller memory, pinned and handed to the adapter.
    UserRegistered,
    /// Found on the adapter side without a handle in this process. Becomes
    /// `KernelBacked` once it is mapped.
    PersistentLookup,
}

/// The first view of the buffer data.
#[derive(Debug)]
enum Primary {
    Owned(MappedRegion),
    /// Caller pages, locked with `mlock` until the buffer is released.
    User { ptr: NonNull<u8>, locked: bool },
}

impl Primary {
    fn as_ptr(&self) -> *mut u8 {
        match self {
            Self::Owned(region) => region.as_ptr(),
            Self::User { ptr, .. } => ptr.as_ptr(),
        }
    }
}

/// A DMA buffer of one device, mapped into this process.
///
/// The length is always a whole number of pages. Dropping the handle unmaps the
/// buffer but leaves the adapter's allocation alone; [`DmaBuffer::free`] (usually
/// through the registry) decides about that.
#[derive(Debug)]
pub struct DmaBuffer {
    index: u64,
    name: String,
    len: usize,
    kind: BufferKind,
    backend: Arc<dyn DmaBackend>,
    map_file: File,
    primary: Option<Primary>,
    map_two: Option<MappedRegion>,
    sg: Option<SgList>,
}

// Raw pointers to caller memory only; no thread affinity.
unsafe impl Send for DmaBuffer {}

// ===============================================================================================
// Helpers
// ===============================================================================================

fn flock(file: &File, operation: libc::c_int) -> io::Result<()> {
    if unsafe { libc::flock(file.as_raw_fd(), operation) } == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Same estimate as the adapter side: the request plus one page must fit into the
/// currently free physical pages.
fn enough_memory(size: usize, available_pages: u64) -> bool {
    (size / page_size()) as u64 + 1 <= available_pages
}

fn too_large(size: usize) -> PdaError {
    PdaError::InvalidArgument(format!("Length {size:#x} cannot be rounded up to pages"))
}

fn request_error(name: &str, err: io::Error) -> PdaError {
    match err.kind() {
        io::ErrorKind::OutOfMemory => {
            PdaError::InsufficientMemory(format!("Allocating buffer {name} failed: {err}"))
        }
        io::ErrorKind::InvalidInput => {
            PdaError::InvalidArgument(format!("Buffer request {name} rejected: {err}"))
        }
        _ => PdaError::Io(err),
    }
}

// ===============================================================================================
// Lifecycle
// ===============================================================================================

impl DmaBuffer {
    /// Maps an existing adapter entry. The map file is share-locked for as long as
    /// the handle lives.
    fn attach(backend: Arc<dyn DmaBackend>, index: u64, kind: BufferKind) -> PdaResult<Self> {
        let name = index.to_string();
        let map_file = backend.open_map(&name)?;

        flock(&map_file, libc::LOCK_SH | libc::LOCK_NB).map_err(|e| {
            if e.kind() == io::ErrorKind::WouldBlock {
                PdaError::Busy(format!("Can't map buffer {name} because freeing is in progress"))
            } else {
                PdaError::Io(e)
            }
        })?;

        let len = map_file.metadata()?.len() as usize;
        let region = MappedRegion::map_file(&map_file, len, libc::PROT_READ | libc::PROT_WRITE)?;

        if kind == BufferKind::PersistentLookup {
            log::debug!("Reattached persistent buffer {name} ({len} bytes)");
        }

        Ok(Self {
            index,
            name,
            len,
            kind: BufferKind::KernelBacked,
            backend,
            map_file,
            primary: Some(Primary::Owned(region)),
            map_two: None,
            sg: None,
        })
    }

    /// Requests `size` bytes (rounded up to pages) of adapter memory as buffer `index`
    /// and maps it.
    ///
    /// # Errors
    /// `InvalidArgument` for a zero size, `InsufficientMemory` if the free physical
    /// pages cannot cover the request, or the adapter/mapping error. The adapter
    /// entry is released again if mapping fails.
    pub(crate) fn allocate(
        backend: &Arc<dyn DmaBackend>,
        index: u64,
        size: usize,
        numa_node: i32,
    ) -> PdaResult<Self> {
        if size == 0 {
            return Err(PdaError::InvalidArgument("Invalid length!".into()));
        }
        if !enough_memory(size, backend.available_pages()) {
            return Err(PdaError::InsufficientMemory(
                "Not enough memory available for DMA memory allocation".into(),
            ));
        }

        let name = index.to_string();
        let len = page_align(size).ok_or_else(|| too_large(size))?;
        let request = BufferRequest::new(&name, len as u64, numa_node, 0)?;
        backend.request(&request).map_err(|e| request_error(&name, e))?;

        Self::attach(Arc::clone(backend), index, BufferKind::KernelBacked).inspect_err(|e| {
            log::warn!("Mapping buffer {name} failed ({e}), releasing it");
            if let Err(free_err) = backend.free(&name) {
                log::error!("Releasing buffer {name} failed: {free_err}");
            }
        })
    }

    /// Pins `size` bytes at `start` and registers them as buffer `index`.
    ///
    /// # Safety
    /// `start..start + size` (rounded up to pages) must be a dedicated `mmap`ed range
    /// that stays valid until the buffer is freed. [`Self::wrap_map`] may move it.
    ///
    /// # Errors
    /// `InvalidArgument` for a null, unaligned or empty range, or the `mlock`/adapter
    /// error. The pages are unlocked again on failure.
    pub(crate) unsafe fn register(
        backend: &Arc<dyn DmaBackend>,
        index: u64,
        start: *mut u8,
        size: usize,
        numa_node: i32,
    ) -> PdaResult<Self> {
        let ptr = NonNull::new(start)
            .ok_or_else(|| PdaError::InvalidArgument("Invalid pointer!".into()))?;
        if !is_page_aligned(start as usize) {
            return Err(PdaError::InvalidArgument("Input buffer is not page aligned!".into()));
        }
        if size == 0 {
            return Err(PdaError::InvalidArgument("Invalid length!".into()));
        }

        let name = index.to_string();
        let len = page_align(size).ok_or_else(|| too_large(size))?;

        if unsafe { libc::mlock(start.cast(), len) } != 0 {
            return Err(PdaError::last_os_error("mlock"));
        }

        let registered = BufferRequest::new(&name, len as u64, numa_node, start as u64)
            .and_then(|request| backend.request(&request).map_err(|e| request_error(&name, e)))
            .and_then(|()| {
                backend.open_map(&name).map_err(|e| {
                    backend.free(&name).ok();
                    PdaError::Io(e)
                })
            });

        let map_file = match registered {
            Ok(file) => file,
            Err(e) => {
                unsafe { libc::munlock(start.cast(), len) };
                return Err(e);
            }
        };

        Ok(Self {
            index,
            name,
            len,
            kind: BufferKind::UserRegistered,
            backend: Arc::clone(backend),
            map_file,
            primary: Some(Primary::User { ptr, locked: true }),
            map_two: None,
            sg: None,
        })
    }

    /// Reattaches buffer `index` left behind on the adapter side and loads its
    /// scatter/gather list.
    ///
    /// # Errors
    /// `NotFound` if the adapter has no such entry, otherwise the mapping error.
    pub(crate) fn lookup(backend: &Arc<dyn DmaBackend>, index: u64) -> PdaResult<Self> {
        let name = index.to_string();
        if !backend.exists(&name) {
            return Err(PdaError::NotFound(format!("No persistent buffer {name}")));
        }

        let mut buffer = Self::attach(Arc::clone(backend), index, BufferKind::PersistentLookup)?;
        buffer.load_sg()?;
        Ok(buffer)
    }

    /// Unmaps both views and unlocks pinned pages. Safe to call more than once.
    fn release(&mut self) -> PdaResult<()> {
        self.map_two = None;

        match self.primary.take() {
            Some(Primary::User { ptr, locked: true }) => {
                if unsafe { libc::munlock(ptr.as_ptr().cast(), self.len) } != 0 {
                    return Err(PdaError::last_os_error("munlock"));
                }
            }
            Some(Primary::Owned(region)) => drop(region),
            _ => {}
        }
        Ok(())
    }

    /// Unmaps the buffer and, unless `persistent` is set, releases the adapter
    /// allocation. Registered user memory is always released.
    ///
    /// # Errors
    /// `Busy` if the buffer is still mapped elsewhere, or the adapter error.
    pub(crate) fn free(mut self, persistent: bool) -> PdaResult<()> {
        let delete = !persistent || self.kind == BufferKind::UserRegistered;
        self.release()?;

        if delete {
            flock(&self.map_file, libc::LOCK_EX | libc::LOCK_NB).map_err(|e| {
                if e.kind() == io::ErrorKind::WouldBlock {
                    PdaError::Busy(format!(
                        "Can't free buffer {} because it is mapped elsewhere",
                        self.name
                    ))
                } else {
                    PdaError::Io(e)
                }
            })?;
            self.backend.free(&self.name)?;
            log::debug!("Freed buffer {}", self.name);
        } else {
            log::debug!("Unmapped persistent buffer {}", self.name);
        }
        Ok(())
    }
}

impl Drop for DmaBuffer {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            log::error!("Releasing buffer {} failed: {e}", self.name);
        }
    }
}

// ===============================================================================================
// Access
// ===============================================================================================

impl DmaBuffer {
    #[must_use]
    pub const fn index(&self) -> u64 {
        self.index
    }

    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[must_use]
    pub const fn kind(&self) -> BufferKind {
        self.kind
    }

    /// Start of the buffer in this process.
    #[must_use]
    pub fn map(&self) -> *mut u8 {
        self.primary
            .as_ref()
            .map_or(std::ptr::null_mut(), Primary::as_ptr)
    }

    /// Start of the second view, set only after a successful [`Self::wrap_map`].
    #[must_use]
    pub fn map_two(&self) -> Option<*mut u8> {
        self.map_two.as_ref().map(MappedRegion::as_ptr)
    }

    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.map(), self.len) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.map(), self.len) }
    }

    /// The coalesced scatter/gather list, read from the adapter on first use.
    ///
    /// # Errors
    /// Returns an error if the `sg` file cannot be opened or mapped.
    pub fn sg_list(&mut self) -> PdaResult<&SgList> {
        if self.sg.is_none() {
            self.load_sg()?;
        }
        self.sg
            .as_ref()
            .ok_or_else(|| PdaError::NotFound(format!("No sg list for buffer {}", self.name)))
    }

    fn load_sg(&mut self) -> PdaResult<()> {
        let file = self.backend.open_sg(&self.name)?;
        let size = file.metadata()?.len() as usize;

        let records = if size == 0 {
            Vec::new()
        } else {
            let region = MappedRegion::map_file(&file, size, libc::PROT_READ)?;
            let raw = unsafe { std::slice::from_raw_parts(region.as_ptr(), size) };
            ScatterRecord::parse_all(raw)
        };

        let mut list = SgList::build(&records, self.map() as usize);
        list.coalesce();
        log::trace!(
            "buffer {}: {} sg records, {} after coalescing",
            self.name,
            records.len(),
            list.len()
        );
        self.sg = Some(list);
        Ok(())
    }

    /// Maps the buffer a second time directly behind the first view, so ring
    /// accesses can run over the end without wrapping.
    ///
    /// Failure leaves the buffer usable through [`Self::map`] with no second view.
    /// Registered user pages are moved in the process; use [`Self::map`] afterwards.
    ///
    /// # Errors
    /// Returns the mapping error.
    pub fn wrap_map(&mut self) -> PdaResult<()> {
        if self.map_two.is_some() {
            return Ok(());
        }
        let old_base = self.map() as usize;

        match self.primary.take() {
            Some(Primary::Owned(region)) => match wrap_file(&self.map_file, self.len) {
                Ok((first, second)) => {
                    drop(region);
                    self.primary = Some(Primary::Owned(first));
                    self.map_two = Some(second);
                }
                Err(e) => {
                    log::warn!("Wrap mapping buffer {} failed, keeping one view: {e}", self.name);
                    self.primary = Some(Primary::Owned(region));
                    return Err(e);
                }
            },
            Some(Primary::User { ptr, locked }) => {
                match unsafe { wrap_user(ptr, &self.map_file, self.len) } {
                    Ok(wrap) => {
                        self.primary = Some(Primary::User {
                            ptr: wrap.map,
                            locked,
                        });
                        self.map_two = wrap.second;
                    }
                    Err(e) => {
                        self.primary = Some(Primary::User { ptr, locked });
                        return Err(e);
                    }
                }
            }
            None => {
                return Err(PdaError::InvalidArgument(format!(
                    "Buffer {} is not mapped",
                    self.name
                )));
            }
        }

        let new_base = self.map() as usize;
        if let Some(sg) = self.sg.as_mut() {
            sg.rebase(old_base, new_base);
        }

        if self.map_two.is_none() {
            return Err(PdaError::InvalidArgument(format!(
                "Second mapping of buffer {} could not be placed",
                self.name
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::TempDir;
    use crate::uio::sim::SimulatedBackend;

    fn sim(dir: &TempDir) -> Arc<dyn DmaBackend> {
        Arc::new(SimulatedBackend::new(dir.path().join("dma")).unwrap())
    }

    #[test]
    fn allocation_rounds_to_pages_and_maps() {
        let dir = TempDir::new("buf-alloc");
        let backend = sim(&dir);
        let page = page_size();

        let mut buffer = DmaBuffer::allocate(&backend, 4, 3 * page + 1, -1).unwrap();
        assert_eq!(buffer.len(), 4 * page);
        assert_eq!(buffer.kind(), BufferKind::KernelBacked);
        assert!(buffer.map_two().is_none());

        buffer.as_mut_slice()[page] = 0x11;
        let base = buffer.map() as usize;
        let sg = buffer.sg_list().unwrap();
        assert_eq!(sg.total_length(), 4 * page as u64);
        assert_eq!(sg.get(0).unwrap().user_ptr, base);

        buffer.free(false).unwrap();
        assert!(!backend.exists("4"));
    }

    #[test]
    fn allocation_checks_size_and_memory() {
        let dir = TempDir::new("buf-reject");
        let backend: Arc<dyn DmaBackend> = Arc::new(
            SimulatedBackend::new(dir.path().join("dma"))
                .unwrap()
                .with_available_pages(8),
        );
        let page = page_size();

        assert!(matches!(
            DmaBuffer::allocate(&backend, 0, 0, -1),
            Err(PdaError::InvalidArgument(_))
        ));
        assert!(matches!(
            DmaBuffer::allocate(&backend, 0, 8 * page, -1),
            Err(PdaError::InsufficientMemory(_))
        ));
        assert!(DmaBuffer::allocate(&backend, 0, 7 * page, -1).is_ok());
    }

    #[test]
    fn wrap_map_rebases_sg_list() {
        let dir = TempDir::new("buf-wrap");
        let backend = sim(&dir);
        let page = page_size();

        let mut buffer = DmaBuffer::allocate(&backend, 0, 2 * page, -1).unwrap();
        buffer.sg_list().unwrap();
        buffer.as_mut_slice()[3] = 0x77;

        buffer.wrap_map().unwrap();
        let map = buffer.map();
        let map_two = buffer.map_two().unwrap();
        assert_eq!(map_two, map.wrapping_add(buffer.len()));
        assert_eq!(unsafe { map_two.add(3).read_volatile() }, 0x77);

        for i in 0..buffer.len() {
            unsafe { map.add(i).write_volatile((i % 253) as u8) };
            assert_eq!(unsafe { map_two.add(i).read_volatile() }, (i % 253) as u8);
        }

        let head = buffer.sg_list().unwrap().get(0).unwrap().user_ptr;
        assert_eq!(head, map as usize);
        buffer.free(false).unwrap();
    }

    #[test]
    fn busy_while_mapped_elsewhere() {
        let dir = TempDir::new("buf-busy");
        let backend = sim(&dir);

        let buffer = DmaBuffer::allocate(&backend, 9, page_size(), -1).unwrap();
        let other = DmaBuffer::lookup(&backend, 9).unwrap();

        assert!(matches!(buffer.free(false), Err(PdaError::Busy(_))));
        assert!(backend.exists("9"));

        other.free(false).unwrap();
        assert!(!backend.exists("9"));
    }

    #[test]
    fn registered_memory_is_always_released() {
        let dir = TempDir::new("buf-user");
        let backend = sim(&dir);
        let len = 2 * page_size();

        let anon = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        assert_ne!(anon, libc::MAP_FAILED);
        let start = anon.cast::<u8>();

        let unaligned = unsafe { DmaBuffer::register(&backend, 1, start.wrapping_add(8), 64, -1) };
        assert!(matches!(unaligned, Err(PdaError::InvalidArgument(_))));

        let mut buffer = unsafe { DmaBuffer::register(&backend, 1, start, len, -1) }.unwrap();
        assert_eq!(buffer.kind(), BufferKind::UserRegistered);
        assert_eq!(buffer.map(), start);
        assert_eq!(buffer.sg_list().unwrap().total_length(), len as u64);

        buffer.free(true).unwrap();
        assert!(!backend.exists("1"));
        unsafe { libc::munmap(anon, len) };
    }

    fn anon_pages(len: usize) -> *mut u8 {
        let anon = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        assert_ne!(anon, libc::MAP_FAILED);
        anon.cast()
    }

    /// Whether the mapping containing `addr` carries `VM_LOCKED`.
    fn is_locked(addr: *mut u8) -> bool {
        let addr = addr as usize;
        let smaps = std::fs::read_to_string("/proc/self/smaps").unwrap();
        let mut inside = false;
        for line in smaps.lines() {
            if let Some(flags) = line.strip_prefix("VmFlags:") {
                if inside {
                    return flags.split_whitespace().any(|f| f == "lo");
                }
                continue;
            }
            let range = line.split_whitespace().next().and_then(|r| r.split_once('-'));
            if let Some((lo, hi)) = range
                && let (Ok(lo), Ok(hi)) =
                    (usize::from_str_radix(lo, 16), usize::from_str_radix(hi, 16))
            {
                inside = (lo..hi).contains(&addr);
            }
        }
        panic!("no mapping contains {addr:#x}");
    }

    /// Lets requests through but hides the `map` file they create.
    #[derive(Debug)]
    struct MaplessBackend(SimulatedBackend);

    impl DmaBackend for MaplessBackend {
        fn dma_dir(&self) -> &std::path::Path {
            self.0.dma_dir()
        }

        fn spin_count(&self) -> u32 {
            1
        }

        fn request(&self, request: &BufferRequest) -> io::Result<()> {
            self.0.request(request)?;
            std::fs::remove_file(self.0.map_path(&request.name()))
        }

        fn free(&self, name: &str) -> io::Result<()> {
            self.0.free(name)
        }

        fn available_pages(&self) -> u64 {
            self.0.available_pages()
        }
    }

    #[test]
    fn failed_attach_releases_the_adapter_entry() {
        let dir = TempDir::new("buf-attach-fail");
        let backend: Arc<dyn DmaBackend> = Arc::new(MaplessBackend(
            SimulatedBackend::new(dir.path().join("dma")).unwrap(),
        ));

        let err = DmaBuffer::allocate(&backend, 6, page_size(), -1).unwrap_err();
        assert!(matches!(err, PdaError::Io(_)));
        assert!(!backend.exists("6"));
        assert!(backend.list().unwrap().is_empty());
    }

    #[test]
    fn rejected_registration_unlocks_the_pages() {
        let dir = TempDir::new("buf-register-fail");
        let backend = sim(&dir);
        let len = 2 * page_size();

        DmaBuffer::allocate(&backend, 1, page_size(), -1)
            .unwrap()
            .free(true)
            .unwrap();
        assert!(backend.exists("1"));

        let start = anon_pages(len);
        let err = unsafe { DmaBuffer::register(&backend, 1, start, len, -1) }.unwrap_err();
        assert!(matches!(err, PdaError::Io(_)));
        assert!(!is_locked(start));
        assert!(backend.exists("1"));
        assert_eq!(std::fs::metadata(backend.map_path("1")).unwrap().len(), page_size() as u64);

        let buffer = unsafe { DmaBuffer::register(&backend, 2, start, len, -1) }.unwrap();
        assert!(is_locked(start));
        buffer.free(false).unwrap();
        assert!(!is_locked(start));
        unsafe { libc::munmap(start.cast(), len) };
    }

    #[test]
    fn oversized_registration_is_rejected_before_pinning() {
        let dir = TempDir::new("buf-register-huge");
        let backend = sim(&dir);
        let start = page_size() as *mut u8;

        let err = unsafe { DmaBuffer::register(&backend, 0, start, usize::MAX - 10, -1) };
        assert!(matches!(err, Err(PdaError::InvalidArgument(_))));
        assert!(backend.list().unwrap().is_empty());
    }

    #[test]
    fn wrap_map_moves_registered_pages() {
        let dir = TempDir::new("buf-user-wrap");
        let backend = sim(&dir);
        let len = 2 * page_size();

        let start = anon_pages(len);
        unsafe { start.add(100).write(0x42) };

        let mut buffer = unsafe { DmaBuffer::register(&backend, 3, start, len, -1) }.unwrap();
        buffer.sg_list().unwrap();
        buffer.wrap_map().unwrap();

        let map = buffer.map();
        assert_eq!(buffer.map_two(), Some(map.wrapping_add(len)));
        assert_eq!(buffer.kind(), BufferKind::UserRegistered);
        assert_eq!(buffer.as_slice()[100], 0x42);
        assert!(is_locked(map));

        let sg = buffer.sg_list().unwrap();
        assert_eq!(sg.get(0).unwrap().user_ptr, map as usize);
        assert_eq!(sg.total_length(), len as u64);

        buffer.free(false).unwrap();
        assert!(!backend.exists("3"));
        assert!(!is_locked(map));
        unsafe { libc::munmap(map.cast(), len) };
    }

    #[test]
    fn lookup_of_missing_entry_fails() {
        let dir = TempDir::new("buf-missing");
        let backend = sim(&dir);
        assert!(matches!(
            DmaBuffer::lookup(&backend, 3),
            Err(PdaError::NotFound(_))
        ));
    }
}
