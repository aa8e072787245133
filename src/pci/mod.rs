pub mod bar;
pub mod context;
pub mod device;
pub mod dma;
pub mod interrupt;

pub use bar::{Bar, BusWidth};
pub use context::Context;
pub use device::PciDevice;
