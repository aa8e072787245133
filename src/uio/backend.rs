use super::protocol::{BufferRequest, DMA_DIR, FREE_FILE, MAP_FILE, REQUEST_FILE, SG_FILE};
use crate::utils::{available_phys_pages, parse_index, spin_open};
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

/// Access to a device's DMA buffer namespace.
///
/// This is the only place the buffer code touches the kernel adapter, so the
/// registry, coalescer and wrap-mapper run unchanged against the real sysfs tree or
/// against [`super::sim::SimulatedBackend`].
pub trait DmaBackend: Send + Sync + fmt::Debug {
    /// Directory holding `request`, `free` and one sub-directory per buffer.
    fn dma_dir(&self) -> &Path;

    /// Open attempts made before giving up on a protocol file.
    fn spin_count(&self) -> u32;

    /// Allocates (`request.start == 0`) or pins a buffer and creates its entry.
    fn request(&self, request: &BufferRequest) -> io::Result<()>;

    /// Releases buffer `name` and removes its entry.
    fn free(&self, name: &str) -> io::Result<()>;

    /// Physical pages a kernel-backed allocation may draw from.
    fn available_pages(&self) -> u64;

    fn entry_dir(&self, name: &str) -> PathBuf {
        self.dma_dir().join(name)
    }

    fn map_path(&self, name: &str) -> PathBuf {
        self.entry_dir(name).join(MAP_FILE)
    }

    fn sg_path(&self, name: &str) -> PathBuf {
        self.entry_dir(name).join(SG_FILE)
    }

    fn exists(&self, name: &str) -> bool {
        self.entry_dir(name).is_dir()
    }

    /// Opens the buffer data for shared read/write mapping.
    fn open_map(&self, name: &str) -> io::Result<File> {
        let mut opts = OpenOptions::new();
        opts.read(true).write(true);
        spin_open(&self.map_path(name), &opts, self.spin_count())
    }

    /// Opens the scatter list for read-only mapping.
    fn open_sg(&self, name: &str) -> io::Result<File> {
        let mut opts = OpenOptions::new();
        opts.read(true);
        spin_open(&self.sg_path(name), &opts, self.spin_count())
    }

    /// Names of all buffer entries currently known to the adapter.
    fn list(&self) -> io::Result<Vec<String>> {
        let mut names: Vec<String> = fs::read_dir(self.dma_dir())?
            .filter_map(std::result::Result::ok)
            .filter(|e| e.file_type().is_ok_and(|t| t.is_dir()))
            .filter_map(|e| e.file_name().to_str().map(str::to_string))
            .collect();

        names.sort_by_key(|n| parse_index(n).unwrap_or(u64::MAX));
        Ok(names)
    }
}

/// The real adapter: `<devices_root>/<bdf>/dma/` in sysfs.
#[derive(Debug, Clone)]
pub struct SysfsBackend {
    dma_dir: PathBuf,
    spins: u32,
}

impl SysfsBackend {
    #[must_use]
    pub fn new(device_dir: &Path, spins: u32) -> Self {
        Self {
            dma_dir: device_dir.join(DMA_DIR),
            spins,
        }
    }

    fn write_control(&self, file: &str, payload: &[u8]) -> io::Result<()> {
        let mut opts = OpenOptions::new();
        opts.write(true);
        let mut control = spin_open(&self.dma_dir.join(file), &opts, self.spins)?;
        control.write_all(payload)
    }
}

impl DmaBackend for SysfsBackend {
    fn dma_dir(&self) -> &Path {
        &self.dma_dir
    }

    fn spin_count(&self) -> u32 {
        self.spins
    }

    fn request(&self, request: &BufferRequest) -> io::Result<()> {
        log::trace!("request {} ({} bytes)", request.name(), { request.size });
        self.write_control(REQUEST_FILE, request.as_bytes())
    }

    fn free(&self, name: &str) -> io::Result<()> {
        log::trace!("free {name}");
        let mut payload = name.as_bytes().to_vec();
        payload.push(0);
        self.write_control(FREE_FILE, &payload)
    }

    fn available_pages(&self) -> u64 {
        available_phys_pages()
    }
}
