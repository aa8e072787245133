//! In-process stand-in for the `uio_pci_dma` adapter.
//!
//! Buffer entries are ordinary files below a directory of the caller's choice, so
//! everything userspace does with them (mmap, flock, mremap) behaves as it does on
//! sysfs. Physical placement is simulated: page runs land at scattered, partly
//! adjacent bus addresses and an IOMMU step shuffles them before the adapter's sort.
//!
//! Memory pinned through a user request is not aliased by the simulated `map` file;
//! the file only has the right size.

#![allow(clippy::cast_possible_truncation)]

use super::allocator::{
    PageRun, kernel_scatter, pages_for, plan_chunks, record_order_limit, user_scatter,
};
use super::backend::DmaBackend;
use super::protocol::{BufferRequest, ScatterRecord};
use crate::utils::{DEFAULT_OPEN_SPIN, available_phys_pages, page_size};
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Shared by every simulated device, like the adapter's single allocate/free lock.
static ALLOC_FREE_LOCK: Mutex<()> = Mutex::new(());

/// First bus address handed out; keeps zero out of the address space.
const FRAME_BASE: u64 = 0x1_0000_0000;

/// Deterministic source of fake physical placements.
#[derive(Debug)]
struct FrameSource {
    cursor: u64,
    state: u64,
}

impl FrameSource {
    const fn new(seed: u64) -> Self {
        Self {
            cursor: FRAME_BASE,
            state: seed | 1,
        }
    }

    // xorshift64
    fn next_random(&mut self) -> u64 {
        let mut x = self.state;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.state = x;
        x
    }

    /// Places a run of `length` bytes. Half of the runs directly follow the previous
    /// one, the rest leave a hole of a few pages.
    fn place(&mut self, length: u64, page: u64) -> u64 {
        if self.next_random() % 2 == 1 {
            self.cursor += (1 + self.next_random() % 8) * page;
        }
        let addr = self.cursor;
        self.cursor += length;
        addr
    }

    fn shuffle<T>(&mut self, items: &mut [T]) {
        for i in (1..items.len()).rev() {
            let j = (self.next_random() % (i as u64 + 1)) as usize;
            items.swap(i, j);
        }
    }
}

#[derive(Debug)]
pub struct SimulatedBackend {
    dma_dir: PathBuf,
    spins: u32,
    max_order: u32,
    available_pages: Option<u64>,
    frames: Mutex<FrameSource>,
}

impl SimulatedBackend {
    /// Creates (if needed) `dma_dir` and serves buffer entries from it.
    ///
    /// # Errors
    /// Returns an error if the directory cannot be created.
    pub fn new(dma_dir: impl Into<PathBuf>) -> io::Result<Self> {
        let dma_dir = dma_dir.into();
        fs::create_dir_all(&dma_dir)?;
        Ok(Self {
            dma_dir,
            spins: DEFAULT_OPEN_SPIN,
            max_order: 10,
            available_pages: None,
            frames: Mutex::new(FrameSource::new(0x9E37_79B9_7F4A_7C15)),
        })
    }

    #[must_use]
    pub const fn with_spin_count(mut self, spins: u32) -> Self {
        self.spins = spins;
        self
    }

    /// Largest buddy order used. Orders whose runs would overflow a scatter record's
    /// 32-bit length are capped.
    #[must_use]
    pub const fn with_max_order(mut self, order: u32) -> Self {
        self.max_order = order;
        self
    }

    /// Caps the free page count reported to allocation requests.
    #[must_use]
    pub const fn with_available_pages(mut self, pages: u64) -> Self {
        self.available_pages = Some(pages);
        self
    }

    #[must_use]
    pub fn with_seed(self, seed: u64) -> Self {
        if let Ok(mut frames) = self.frames.lock() {
            *frames = FrameSource::new(seed);
        }
        self
    }

    fn frames(&self) -> io::Result<std::sync::MutexGuard<'_, FrameSource>> {
        self.frames
            .lock()
            .map_err(|_| io::Error::other("frame source poisoned"))
    }

    fn allocate_kernel(&self, pages: u64) -> io::Result<Vec<ScatterRecord>> {
        if pages > self.available_pages() {
            return Err(io::Error::new(
                io::ErrorKind::OutOfMemory,
                "Failed to allocate DMA memory",
            ));
        }

        let page = page_size() as u64;
        let mut frames = self.frames()?;
        let max_order = self.max_order.min(record_order_limit(page));
        let mut runs: Vec<PageRun> = plan_chunks(pages, max_order)
            .into_iter()
            .map(|order| {
                let length = (1u64 << order) * page;
                let dma_address = frames.place(length, page);
                PageRun {
                    page_link: dma_address / page,
                    dma_address,
                    length,
                }
            })
            .collect();

        // IOMMU programming does not keep allocation order.
        frames.shuffle(&mut runs);
        Ok(kernel_scatter(&runs))
    }

    fn pin_user(&self, start: u64, pages: u64) -> io::Result<Vec<ScatterRecord>> {
        let page = page_size() as u64;
        if start % page != 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "Buffer is not page aligned",
            ));
        }

        let mut frames = self.frames()?;
        let addresses: Vec<u64> = (0..pages).map(|_| frames.place(page, page)).collect();
        Ok(user_scatter(&addresses, page))
    }

    fn create_entry(&self, name: &str, size: u64, records: &[ScatterRecord]) -> io::Result<()> {
        let dir = self.entry_dir(name);
        fs::create_dir(&dir)?;

        let populate = || -> io::Result<()> {
            File::create(self.map_path(name))?.set_len(size)?;
            fs::write(self.sg_path(name), ScatterRecord::encode_all(records))
        };

        populate().inspect_err(|_| {
            fs::remove_dir_all(&dir).ok();
        })
    }
}

impl DmaBackend for SimulatedBackend {
    fn dma_dir(&self) -> &Path {
        &self.dma_dir
    }

    fn spin_count(&self) -> u32 {
        self.spins
    }

    fn request(&self, request: &BufferRequest) -> io::Result<()> {
        let _guard = ALLOC_FREE_LOCK
            .lock()
            .map_err(|_| io::Error::other("allocation lock poisoned"))?;

        let name = request.name();
        let size = request.size;
        let start = request.start;

        if self.exists(&name) {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("Buffer {name} already exists"),
            ));
        }
        if size == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "Zero amount of pages requested",
            ));
        }

        let page = page_size() as u64;
        let pages = pages_for(size, page);
        let records = if start == 0 {
            self.allocate_kernel(pages)?
        } else {
            self.pin_user(start, pages)?
        };

        log::debug!(
            "simulated adapter: {pages} pages requested ({} entries), buffer {name} allocated",
            records.len()
        );
        self.create_entry(&name, pages * page, &records)
    }

    fn free(&self, name: &str) -> io::Result<()> {
        let _guard = ALLOC_FREE_LOCK
            .lock()
            .map_err(|_| io::Error::other("allocation lock poisoned"))?;

        let name = name.trim_end_matches('\0');
        if !self.exists(name) {
            // The adapter only logs unknown names.
            log::warn!("simulated adapter: freeing of buffer {name} failed");
            return Ok(());
        }
        fs::remove_dir_all(self.entry_dir(name))
    }

    fn available_pages(&self) -> u64 {
        self.available_pages.unwrap_or_else(available_phys_pages)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::TempDir;

    fn read_sg(backend: &SimulatedBackend, name: &str) -> Vec<ScatterRecord> {
        ScatterRecord::parse_all(&fs::read(backend.sg_path(name)).unwrap())
    }

    #[test]
    fn kernel_request_creates_sorted_entry() {
        let dir = TempDir::new("sim-kernel");
        let backend = SimulatedBackend::new(dir.path().join("dma"))
            .unwrap()
            .with_max_order(2);
        let page = page_size() as u64;

        let request = BufferRequest::new("0", 13 * page - 100, -1, 0).unwrap();
        backend.request(&request).unwrap();

        assert!(backend.exists("0"));
        let map_len = fs::metadata(backend.map_path("0")).unwrap().len();
        assert_eq!(map_len, 13 * page);

        let records = read_sg(&backend, "0");
        let total: u64 = records.iter().map(|r| u64::from(r.length)).sum();
        assert_eq!(total, 13 * page);
        assert!(records.windows(2).all(|w| w[0].dma_address < w[1].dma_address));
        assert!(records.iter().all(|r| u64::from(r.length) <= 4 * page));
    }

    #[test]
    fn user_request_keeps_one_page_per_entry() {
        let dir = TempDir::new("sim-user");
        let backend = SimulatedBackend::new(dir.path().join("dma")).unwrap();
        let page = page_size() as u64;

        let request = BufferRequest::new("3", 4 * page, -1, 16 * page).unwrap();
        backend.request(&request).unwrap();
        let records = read_sg(&backend, "3");
        assert_eq!(records.len(), 4);
        assert!(records.iter().all(|r| u64::from(r.length) == page));

        let unaligned = BufferRequest::new("4", page, -1, page + 8).unwrap();
        assert!(backend.request(&unaligned).is_err());
        assert!(!backend.exists("4"));
    }

    #[test]
    fn duplicate_zero_and_oversized_requests_fail() {
        let dir = TempDir::new("sim-reject");
        let backend = SimulatedBackend::new(dir.path().join("dma"))
            .unwrap()
            .with_available_pages(4);
        let page = page_size() as u64;

        backend
            .request(&BufferRequest::new("1", page, -1, 0).unwrap())
            .unwrap();
        let dup = backend.request(&BufferRequest::new("1", page, -1, 0).unwrap());
        assert_eq!(dup.unwrap_err().kind(), io::ErrorKind::AlreadyExists);

        let zero = backend.request(&BufferRequest::new("2", 0, -1, 0).unwrap());
        assert_eq!(zero.unwrap_err().kind(), io::ErrorKind::InvalidInput);

        let big = backend.request(&BufferRequest::new("5", 5 * page, -1, 0).unwrap());
        assert_eq!(big.unwrap_err().kind(), io::ErrorKind::OutOfMemory);
    }

    #[test]
    fn free_removes_entry_and_ignores_unknown_names() {
        let dir = TempDir::new("sim-free");
        let backend = SimulatedBackend::new(dir.path().join("dma")).unwrap();
        let page = page_size() as u64;

        for name in ["2", "10", "1"] {
            backend
                .request(&BufferRequest::new(name, page, -1, 0).unwrap())
                .unwrap();
        }
        assert_eq!(backend.list().unwrap(), vec!["1", "2", "10"]);

        backend.free("2\0").unwrap();
        assert!(!backend.exists("2"));
        backend.free("77").unwrap();
        assert_eq!(backend.list().unwrap(), vec!["1", "10"]);
    }
}
