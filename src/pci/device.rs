use super::bar::Bar;
use super::dma::{BufferRegistry, DmaBuffer};
use super::interrupt::InterruptHandler;
use crate::config::Config;
use crate::error::{PdaError, PdaResult};
use crate::uio::backend::{DmaBackend, SysfsBackend};
use crate::uio::protocol::BusAddress;
use crate::uio::sysfs::{
    BAR_COUNT, BarInfo, BarKind, DeviceDir, bar_registers, classify_bars, find_uio_node,
};
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};

// ===============================================================================================
// Device
// ===============================================================================================

/// BAR layout read from the configuration header and the `resource` file.
#[derive(Debug, Clone, Copy)]
struct BarTable {
    info: [BarInfo; BAR_COUNT],
    sizes: [u64; BAR_COUNT],
}

/// One PCI device bound to the `uio_pci_dma` adapter.
///
/// Owns the device's BAR mappings, its DMA buffers and the interrupt thread.
/// Dropping it stops the interrupt thread, unmaps the BARs and frees every buffer
/// still attached, like `close(false)`.
#[derive(Debug)]
pub struct PciDevice {
    address: BusAddress,
    dir: DeviceDir,
    driver_root: PathBuf,
    devfs_root: PathBuf,
    numa_node: i32,
    bar_table: Option<BarTable>,
    bars: [Option<Bar>; BAR_COUNT],
    isr: Option<InterruptHandler>,
    max_payload_size: OnceLock<u64>,
    max_read_request_size: OnceLock<u64>,
    // Declared last: buffers are released after the interrupt thread has stopped.
    registry: BufferRegistry,
}

impl PciDevice {
    /// Opens the device at `address` through the adapter's sysfs files.
    ///
    /// # Errors
    /// Returns `NotFound` if the device directory does not exist.
    pub fn open(config: &Config, address: BusAddress) -> PdaResult<Self> {
        let dir = DeviceDir::new(&config.devices_root, address, config.open_spin_count);
        let backend = SysfsBackend::new(dir.path(), config.open_spin_count);
        Self::open_with_backend(config, address, Arc::new(backend))
    }

    /// Opens the device at `address`, handling DMA buffers through `backend`.
    ///
    /// # Errors
    /// Returns `NotFound` if the device directory does not exist.
    pub fn open_with_backend(
        config: &Config,
        address: BusAddress,
        backend: Arc<dyn DmaBackend>,
    ) -> PdaResult<Self> {
        let dir = DeviceDir::new(&config.devices_root, address, config.open_spin_count);
        if !dir.exists() {
            return Err(PdaError::NotFound(format!(
                "No device {address} below {}",
                config.devices_root.display()
            )));
        }

        let numa_node = dir.numa_node();
        log::debug!("Opened device {address} (numa node {numa_node})");

        Ok(Self {
            address,
            dir,
            driver_root: config.driver_root.clone(),
            devfs_root: config.devfs_root.clone(),
            numa_node,
            bar_table: None,
            bars: Default::default(),
            isr: None,
            max_payload_size: OnceLock::new(),
            max_read_request_size: OnceLock::new(),
            registry: BufferRegistry::new(backend, numa_node),
        })
    }

    #[must_use]
    pub const fn address(&self) -> BusAddress {
        self.address
    }

    /// NUMA node of the device, `-1` if unknown. Forwarded with every allocation.
    #[must_use]
    pub const fn numa_node(&self) -> i32 {
        self.numa_node
    }

    // ===========================================================================================
    // BARs
    // ===========================================================================================

    fn bar_table(&mut self) -> PdaResult<BarTable> {
        if let Some(table) = self.bar_table {
            return Ok(table);
        }

        let header = self.dir.read_config_header()?;
        log::trace!(
            "config header of {}: vendor {:#06x} device {:#06x}",
            self.address,
            u16::from_le_bytes([header[0], header[1]]),
            u16::from_le_bytes([header[2], header[3]])
        );

        let table = BarTable {
            info: classify_bars(&bar_registers(&header)),
            sizes: self.dir.bar_sizes()?,
        };
        self.bar_table = Some(table);
        Ok(table)
    }

    fn check_bar_number(number: u8) -> PdaResult<usize> {
        let slot = usize::from(number);
        if slot >= BAR_COUNT {
            return Err(PdaError::NotFound(format!("There is no bar{number}")));
        }
        Ok(slot)
    }

    /// Type of BAR `number` as decoded from the configuration header.
    ///
    /// # Errors
    /// Returns an error if the header cannot be read or `number` is out of range.
    pub fn bar_kind(&mut self, number: u8) -> PdaResult<BarKind> {
        let slot = Self::check_bar_number(number)?;
        Ok(self.bar_table()?.info[slot].kind)
    }

    /// BAR `number`, mapped on first access.
    ///
    /// # Errors
    /// `NotFound` for numbers above 5, `InvalidArgument` for I/O-port or unmapped
    /// BARs, or the sysfs/mapping error.
    pub fn get_bar(&mut self, number: u8) -> PdaResult<&Bar> {
        let slot = Self::check_bar_number(number)?;

        if self.bars[slot].is_none() {
            let table = self.bar_table()?;
            let info = table.info[slot];
            if !matches!(info.kind, BarKind::Mem32 | BarKind::Mem64) {
                return Err(PdaError::InvalidArgument(format!(
                    "Register {number} is no BAR ({:?})",
                    info.kind
                )));
            }
            let file = self.dir.open_bar(number)?;
            self.bars[slot] = Some(Bar::map(number, info, table.sizes[slot], &file)?);
        }

        self.bars[slot]
            .as_ref()
            .ok_or_else(|| PdaError::NotFound(format!("bar{number} is not mapped")))
    }

    // ===========================================================================================
    // PCIe Attributes
    // ===========================================================================================

    /// Negotiated max payload size, read once.
    ///
    /// # Errors
    /// Returns an error if the adapter attribute cannot be read.
    pub fn max_payload_size(&self) -> PdaResult<u64> {
        if let Some(&mps) = self.max_payload_size.get() {
            return Ok(mps);
        }
        let mps = self.dir.max_payload_size()?;
        Ok(*self.max_payload_size.get_or_init(|| mps))
    }

    /// Negotiated max read request size, read once.
    ///
    /// # Errors
    /// Returns an error if the adapter attribute cannot be read.
    pub fn max_read_request_size(&self) -> PdaResult<u64> {
        if let Some(&mrrs) = self.max_read_request_size.get() {
            return Ok(mrrs);
        }
        let mrrs = self.dir.max_read_request_size()?;
        Ok(*self.max_read_request_size.get_or_init(|| mrrs))
    }

    // ===========================================================================================
    // DMA Buffers
    // ===========================================================================================

    /// Allocates a kernel-backed DMA buffer. `None` picks the next free index.
    ///
    /// # Errors
    /// See [`BufferRegistry::allocate`].
    pub fn allocate_buffer(
        &mut self,
        index: Option<u64>,
        size: usize,
    ) -> PdaResult<&mut DmaBuffer> {
        self.registry.allocate(index, size)
    }

    /// Registers caller memory as a DMA buffer.
    ///
    /// # Safety
    /// See [`BufferRegistry::register`].
    ///
    /// # Errors
    /// See [`BufferRegistry::register`].
    pub unsafe fn register_buffer(
        &mut self,
        index: Option<u64>,
        start: *mut u8,
        size: usize,
    ) -> PdaResult<&mut DmaBuffer> {
        unsafe { self.registry.register(index, start, size) }
    }

    /// The buffer `index`, reattaching a persistent one if needed.
    ///
    /// # Errors
    /// `NotFound` if neither this process nor the adapter has it.
    pub fn get_buffer(&mut self, index: u64) -> PdaResult<&mut DmaBuffer> {
        self.registry.get(index)
    }

    /// Frees buffer `index`; `persistent` keeps the adapter allocation for a later
    /// lookup.
    ///
    /// # Errors
    /// See [`BufferRegistry::free`].
    pub fn delete_buffer(&mut self, index: u64, persistent: bool) -> PdaResult<()> {
        self.registry.free(index, persistent)
    }

    /// Frees every attached buffer, then every adapter entry of this device that
    /// is not attached here.
    ///
    /// # Errors
    /// The first error encountered.
    pub fn free_all_buffers(&mut self) -> PdaResult<()> {
        self.registry.free_all(false)?;
        self.registry.delete_not_attached()
    }

    /// Indices of all buffers the adapter holds for this device.
    ///
    /// # Errors
    /// Returns an error if the adapter directory cannot be listed.
    pub fn buffer_ids(&self) -> PdaResult<Vec<u64>> {
        self.registry.adapter_indices()
    }

    /// Attaches every persistent buffer left on the adapter side.
    ///
    /// # Errors
    /// See [`BufferRegistry::reattach_all`].
    pub fn reattach_buffers(&mut self) -> PdaResult<Vec<u64>> {
        self.registry.reattach_all()
    }

    #[must_use]
    pub const fn buffers(&self) -> &BufferRegistry {
        &self.registry
    }

    pub fn buffers_mut(&mut self) -> &mut BufferRegistry {
        &mut self.registry
    }

    // ===========================================================================================
    // Interrupts
    // ===========================================================================================

    /// Starts delivering interrupts to `callback`, which receives the event count.
    /// Replaces a handler registered earlier.
    ///
    /// # Errors
    /// Returns an error if the uio node or the configuration space cannot be opened.
    pub fn register_isr<F>(&mut self, callback: F) -> PdaResult<()>
    where
        F: FnMut(u32) + Send + 'static,
    {
        self.kill_isr();

        let node = find_uio_node(&self.driver_root, &self.devfs_root, self.address)?;
        log::debug!("Interrupts of {} via {}", self.address, node.display());

        let irq = std::fs::File::options().read(true).write(true).open(&node)?;
        let config = self.dir.open_config()?;
        self.isr = Some(InterruptHandler::spawn(config, irq, callback)?);
        Ok(())
    }

    /// Stops the interrupt thread, if any.
    pub fn kill_isr(&mut self) {
        if let Some(mut handler) = self.isr.take() {
            handler.stop();
        }
    }

    #[must_use]
    pub const fn has_isr(&self) -> bool {
        self.isr.is_some()
    }

    /// Stops interrupts, unmaps the BARs and frees every attached buffer with the
    /// given `persistent` flag.
    ///
    /// # Errors
    /// The first buffer error; the device is released regardless.
    pub fn close(mut self, persistent: bool) -> PdaResult<()> {
        self.kill_isr();
        self.bars = Default::default();
        self.registry.free_all(persistent)
    }
}
