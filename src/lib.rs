//! Userspace access to PCI devices bound to the `uio_pci_dma` kernel adapter:
//! BAR mappings, DMA buffers with scatter/gather lists, ring-buffer double
//! mappings and interrupt delivery.

pub mod config;
pub mod error;
pub mod pci;
pub mod uio;
pub mod utils;

pub use config::Config;
pub use error::{PdaError, PdaResult};
pub use pci::dma::{BufferKind, BufferRegistry, DmaBuffer, SgList, SgNode};
pub use pci::interrupt::InterruptHandler;
pub use pci::{Bar, BusWidth, Context, PciDevice};
pub use uio::sysfs::BarKind;
pub use uio::{BusAddress, DmaBackend, DriverVersion, SimulatedBackend, SysfsBackend};
