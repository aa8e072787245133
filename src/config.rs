use crate::utils::DEFAULT_OPEN_SPIN;
use std::env;
use std::path::PathBuf;

const DEVICES_ROOT: &str = "/sys/bus/pci/devices";
const DRIVER_ROOT: &str = "/sys/bus/pci/drivers/uio_pci_dma";
const DEVFS_ROOT: &str = "/dev";
const MODULE_VERSION_PATH: &str = "/sys/module/uio_pci_dma/version";

/// Largest buddy order the simulated allocator hands out (4 MiB runs with 4 KiB pages).
const DEFAULT_MAX_ALLOC_ORDER: u32 = 10;

/// Where to find the kernel adapter and how patiently to talk to it.
///
/// Built once at startup and threaded through `Context`; nothing in the crate keeps
/// global path state.
#[derive(Debug, Clone)]
pub struct Config {
    /// Per-device sysfs directories (`<root>/<bdf>/dma`, `<root>/<bdf>/config`, ...).
    pub devices_root: PathBuf,
    /// Driver directory of the adapter; `<root>/<bdf>/uio/uioN` names the IRQ node.
    pub driver_root: PathBuf,
    pub devfs_root: PathBuf,
    pub module_version_path: PathBuf,
    pub open_spin_count: u32,
    pub max_alloc_order: u32,
    pub check_version: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            devices_root: PathBuf::from(DEVICES_ROOT),
            driver_root: PathBuf::from(DRIVER_ROOT),
            devfs_root: PathBuf::from(DEVFS_ROOT),
            module_version_path: PathBuf::from(MODULE_VERSION_PATH),
            open_spin_count: DEFAULT_OPEN_SPIN,
            max_alloc_order: DEFAULT_MAX_ALLOC_ORDER,
            check_version: true,
        }
    }
}

impl Config {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults, with `PDA_SYSFS_ROOT` replacing the devices root and
    /// `PDA_SKIP_VERSION_CHECK` turning the adapter version check off.
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(root) = env::var("PDA_SYSFS_ROOT") {
            config.devices_root = PathBuf::from(root);
        }
        if env::var_os("PDA_SKIP_VERSION_CHECK").is_some() {
            config.check_version = false;
        }
        config
    }

    #[must_use]
    pub fn with_devices_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.devices_root = root.into();
        self
    }

    #[must_use]
    pub fn with_driver_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.driver_root = root.into();
        self
    }

    #[must_use]
    pub fn with_devfs_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.devfs_root = root.into();
        self
    }

    #[must_use]
    pub fn with_module_version_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.module_version_path = path.into();
        self
    }

    #[must_use]
    pub const fn with_open_spin_count(mut self, spins: u32) -> Self {
        self.open_spin_count = spins;
        self
    }

    #[must_use]
    pub const fn with_max_alloc_order(mut self, order: u32) -> Self {
        self.max_alloc_order = order;
        self
    }

    #[must_use]
    pub const fn without_version_check(mut self) -> Self {
        self.check_version = false;
        self
    }
}
