use super::device::PciDevice;
use crate::config::Config;
use crate::error::{PdaError, PdaResult};
use crate::uio::protocol::{BusAddress, DriverVersion, LIBRARY_ADAPTER_VERSION};
use crate::uio::sim::SimulatedBackend;
use crate::uio::sysfs::read_adapter_version;
use std::sync::Arc;

/// Entry point of the library: holds the configuration and hands out devices.
///
/// Creating a context checks that the loaded kernel adapter speaks an interface
/// this library understands.
#[derive(Debug)]
pub struct Context {
    config: Config,
    adapter_version: Option<DriverVersion>,
}

/// Reads and checks the adapter version. A missing or unreadable version file is
/// only logged, a readable but incompatible one is fatal.
fn check_adapter(config: &Config) -> PdaResult<Option<DriverVersion>> {
    let driver = match read_adapter_version(&config.module_version_path) {
        Ok(version) => version,
        Err(e) => {
            log::warn!(
                "Unable to read adapter version from {}: {e}",
                config.module_version_path.display()
            );
            return Ok(None);
        }
    };

    if !LIBRARY_ADAPTER_VERSION.accepts(&driver) {
        log::error!("Kernel adapter (uio_pci_dma) version mismatch!");
        return Err(PdaError::ProtocolMismatch {
            driver: driver.to_string(),
            library: LIBRARY_ADAPTER_VERSION.to_string(),
        });
    }

    log::debug!("Kernel adapter version {driver}");
    Ok(Some(driver))
}

impl Context {
    /// # Errors
    /// Returns `ProtocolMismatch` if the adapter version is incompatible.
    pub fn new(config: Config) -> PdaResult<Self> {
        let adapter_version = if config.check_version {
            check_adapter(&config)?
        } else {
            None
        };

        Ok(Self {
            config,
            adapter_version,
        })
    }

    /// A context built from [`Config::from_env`].
    ///
    /// # Errors
    /// See [`Context::new`].
    pub fn from_env() -> PdaResult<Self> {
        Self::new(Config::from_env())
    }

    #[must_use]
    pub const fn config(&self) -> &Config {
        &self.config
    }

    /// Version reported by the adapter, if it was checked and readable.
    #[must_use]
    pub const fn adapter_version(&self) -> Option<DriverVersion> {
        self.adapter_version
    }

    /// Opens the device at `address`.
    ///
    /// # Errors
    /// `NotFound` if no such device is bound to the adapter.
    pub fn device(&self, address: BusAddress) -> PdaResult<PciDevice> {
        PciDevice::open(&self.config, address)
    }

    /// Opens a device by its sysfs name (`0000:03:00.0`).
    ///
    /// # Errors
    /// `InvalidArgument` for a malformed name, otherwise see [`Context::device`].
    pub fn device_by_name(&self, name: &str) -> PdaResult<PciDevice> {
        self.device(name.parse()?)
    }

    /// Opens the device at `address` with DMA buffers served by an in-process
    /// stand-in for the adapter, below the device's `dma` directory.
    ///
    /// # Errors
    /// `NotFound` if the device directory does not exist, or the error creating
    /// the buffer directory.
    pub fn simulated_device(&self, address: BusAddress) -> PdaResult<PciDevice> {
        let dma_dir = self
            .config
            .devices_root
            .join(address.to_string())
            .join(crate::uio::protocol::DMA_DIR);
        if !dma_dir.parent().is_some_and(std::path::Path::is_dir) {
            return Err(PdaError::NotFound(format!("No device {address}")));
        }

        let backend = SimulatedBackend::new(dma_dir)?
            .with_spin_count(self.config.open_spin_count)
            .with_max_order(self.config.max_alloc_order);
        PciDevice::open_with_backend(&self.config, address, Arc::new(backend))
    }
}
