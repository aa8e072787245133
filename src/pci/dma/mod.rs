//! DMA buffers: lifecycle, scatter/gather lists and ring-buffer double mappings.

pub mod buffer;
pub mod registry;
pub mod sglist;
mod wrap;

pub use buffer::{BufferKind, DmaBuffer};
pub use registry::BufferRegistry;
pub use sglist::{SgList, SgNode};
