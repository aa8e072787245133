//! Kernel-facing layer: everything that knows the `uio_pci_dma` adapter's files and
//! record layouts.

pub mod allocator;
pub mod backend;
pub mod protocol;
pub mod sim;
pub mod sysfs;

pub use backend::{DmaBackend, SysfsBackend};
pub use protocol::{BusAddress, DriverVersion, LIBRARY_ADAPTER_VERSION};
pub use sim::SimulatedBackend;
