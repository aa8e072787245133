#![allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]

use super::protocol::{BusAddress, DriverVersion, MAX_PAYLOAD_SIZE_FILE, MAX_READ_REQUEST_SIZE_FILE};
use crate::utils::spin_open;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

// ===============================================================================================
// Config Space
// ===============================================================================================

/// Bytes of the standard (type 0) configuration header read at BAR init.
pub const CONFIG_HEADER_LEN: usize = 64;

pub const BAR_COUNT: usize = 6;

const BAR_REGISTER_OFFSET: usize = 0x10;

/// High byte of the command register; bit 2 of it is "interrupt disable".
pub const COMMAND_HIGH_OFFSET: u64 = 5;
pub const INTERRUPT_DISABLE_BIT: u8 = 0x4;

const BAR_IO_SPACE: u32 = 0x1;
const BAR_TYPE_MASK: u32 = 0x6;
const BAR_TYPE_64: u32 = 0x4;
const BAR_ADDRESS_MASK: u32 = 0xFFFF_FFF0;

/// What a BAR register slot describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BarKind {
    /// Zero register, or the upper half of a 64-bit BAR.
    NotMapped,
    Io,
    Mem32,
    Mem64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BarInfo {
    pub kind: BarKind,
    pub physical_address: u64,
}

impl BarInfo {
    const UNMAPPED: Self = Self {
        kind: BarKind::NotMapped,
        physical_address: 0,
    };
}

/// The six BAR registers of a raw configuration header.
#[must_use]
pub fn bar_registers(header: &[u8; CONFIG_HEADER_LEN]) -> [u32; BAR_COUNT] {
    let mut regs = [0u32; BAR_COUNT];
    for (i, reg) in regs.iter_mut().enumerate() {
        let off = BAR_REGISTER_OFFSET + i * 4;
        *reg = u32::from_le_bytes([header[off], header[off + 1], header[off + 2], header[off + 3]]);
    }
    regs
}

/// Decodes BAR types and bus addresses. A 64-bit BAR takes the following slot as its
/// upper address dword, which is then reported as not mapped.
#[must_use]
pub fn classify_bars(regs: &[u32; BAR_COUNT]) -> [BarInfo; BAR_COUNT] {
    let mut bars = [BarInfo::UNMAPPED; BAR_COUNT];

    let mut i = 0;
    while i < BAR_COUNT {
        let bar = regs[i];
        if bar == 0 {
            log::trace!("bar{i}              <- not mapped");
        } else if bar & BAR_IO_SPACE != 0 {
            log::trace!("bar{i}        {bar:#x}   <- I/O");
            bars[i].kind = BarKind::Io;
        } else if bar & BAR_TYPE_MASK == BAR_TYPE_64 && i + 1 < BAR_COUNT {
            log::trace!("bar{i}              <- 64Bit");
            let high = u64::from(regs[i + 1]);
            bars[i] = BarInfo {
                kind: BarKind::Mem64,
                physical_address: u64::from(bar & BAR_ADDRESS_MASK) | (high << 32),
            };
            i += 1;
        } else {
            log::trace!("bar{i}              <- 32Bit");
            bars[i] = BarInfo {
                kind: BarKind::Mem32,
                physical_address: u64::from(bar & BAR_ADDRESS_MASK),
            };
        }
        i += 1;
    }

    bars
}

/// Region sizes from a sysfs `resource` file (`start end flags` per line, hex).
/// Unused regions report `0x0 0x0 0x0` and get size 0.
#[must_use]
pub fn parse_resource_sizes(content: &str) -> [u64; BAR_COUNT] {
    let hex = |s: &str| u64::from_str_radix(s.trim_start_matches("0x"), 16).ok();

    let mut sizes = [0u64; BAR_COUNT];
    for (size, line) in sizes.iter_mut().zip(content.lines()) {
        let mut parts = line.split_whitespace();
        if let (Some(Some(start)), Some(Some(end))) = (parts.next().map(hex), parts.next().map(hex))
            && end > start
        {
            *size = end - start + 1;
        }
    }
    sizes
}

// ===============================================================================================
// Device Attributes
// ===============================================================================================

/// sysfs directory of one device bound to the adapter.
#[derive(Debug, Clone)]
pub struct DeviceDir {
    path: PathBuf,
    spins: u32,
}

impl DeviceDir {
    #[must_use]
    pub fn new(devices_root: &Path, address: BusAddress, spins: u32) -> Self {
        Self {
            path: devices_root.join(address.to_string()),
            spins,
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn exists(&self) -> bool {
        self.path.is_dir()
    }

    #[must_use]
    pub fn config_path(&self) -> PathBuf {
        self.path.join("config")
    }

    #[must_use]
    pub fn bar_path(&self, number: u8) -> PathBuf {
        self.path.join(format!("bar{number}"))
    }

    fn open(&self, name: &Path, write: bool) -> io::Result<File> {
        let mut opts = OpenOptions::new();
        opts.read(true).write(write);
        spin_open(name, &opts, self.spins)
    }

    /// Opens the configuration space for the interrupt re-enable writes.
    ///
    /// # Errors
    /// Returns an error if the `config` attribute cannot be opened read/write.
    pub fn open_config(&self) -> io::Result<File> {
        self.open(&self.config_path(), true)
    }

    /// Opens BAR `number` for mapping.
    ///
    /// # Errors
    /// Returns an error if the `bar<N>` file cannot be opened read/write.
    pub fn open_bar(&self, number: u8) -> io::Result<File> {
        self.open(&self.bar_path(number), true)
    }

    /// # Errors
    /// Returns an error if fewer than 64 header bytes can be read.
    pub fn read_config_header(&self) -> io::Result<[u8; CONFIG_HEADER_LEN]> {
        let file = self.open(&self.config_path(), false)?;
        let mut header = [0u8; CONFIG_HEADER_LEN];
        file.read_exact_at(&mut header, 0)?;
        Ok(header)
    }

    /// # Errors
    /// Returns an error if the `resource` attribute cannot be read.
    pub fn bar_sizes(&self) -> io::Result<[u64; BAR_COUNT]> {
        let content = fs::read_to_string(self.path.join("resource"))?;
        Ok(parse_resource_sizes(&content))
    }

    /// NUMA node the device is attached to, `-1` when the platform has none.
    #[must_use]
    pub fn numa_node(&self) -> i32 {
        fs::read_to_string(self.path.join("numa_node"))
            .ok()
            .and_then(|s| s.trim().parse::<i32>().ok())
            .unwrap_or(-1)
    }

    fn read_dma_attribute(&self, name: &str) -> io::Result<u64> {
        let mut file = self.open(&self.path.join(super::protocol::DMA_DIR).join(name), false)?;
        let mut raw = [0u8; 4];
        file.read_exact(&mut raw)?;
        Ok(u64::from(u32::from_ne_bytes(raw)))
    }

    /// Negotiated PCIe max payload size in bytes.
    ///
    /// # Errors
    /// Returns an error if the adapter attribute cannot be read.
    pub fn max_payload_size(&self) -> io::Result<u64> {
        self.read_dma_attribute(MAX_PAYLOAD_SIZE_FILE)
    }

    /// Negotiated PCIe max read request size in bytes.
    ///
    /// # Errors
    /// Returns an error if the adapter attribute cannot be read.
    pub fn max_read_request_size(&self) -> io::Result<u64> {
        self.read_dma_attribute(MAX_READ_REQUEST_SIZE_FILE)
    }
}

// ===============================================================================================
// Adapter Discovery
// ===============================================================================================

/// Reads the adapter's interface version (`/sys/module/uio_pci_dma/version`).
///
/// # Errors
/// Returns an error if the file is missing or malformed.
pub fn read_adapter_version(path: &Path) -> io::Result<DriverVersion> {
    let content = fs::read_to_string(path)?;
    content
        .parse::<DriverVersion>()
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))
}

/// Device node of the uio instance bound to `address`: the first `uioN` entry of
/// `<driver_root>/<bdf>/uio/`, resolved below `devfs_root`.
///
/// # Errors
/// Returns an error if the directory cannot be read or holds no `uio` entry.
pub fn find_uio_node(
    driver_root: &Path,
    devfs_root: &Path,
    address: BusAddress,
) -> io::Result<PathBuf> {
    let dir = driver_root.join(address.to_string()).join("uio");
    let mut names: Vec<String> = fs::read_dir(&dir)?
        .filter_map(std::result::Result::ok)
        .filter_map(|e| e.file_name().to_str().map(str::to_string))
        .filter(|n| n.starts_with("uio"))
        .collect();
    names.sort();

    names.into_iter().next().map(|n| devfs_root.join(n)).ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::NotFound,
            format!("No uio device below {}", dir.display()),
        )
    })
}
