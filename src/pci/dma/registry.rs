use super::buffer::DmaBuffer;
use crate::error::{PdaError, PdaResult};
use crate::uio::backend::DmaBackend;
use crate::utils::parse_index;
use std::sync::Arc;

/// The DMA buffers one device has attached in this process, in creation order.
///
/// Not internally synchronized; callers sharing a registry across threads must
/// serialize allocate/free themselves.
#[derive(Debug)]
pub struct BufferRegistry {
    backend: Arc<dyn DmaBackend>,
    numa_node: i32,
    buffers: Vec<DmaBuffer>,
}

impl BufferRegistry {
    #[must_use]
    pub fn new(backend: Arc<dyn DmaBackend>, numa_node: i32) -> Self {
        Self {
            backend,
            numa_node,
            buffers: Vec::new(),
        }
    }

    #[must_use]
    pub fn backend(&self) -> &Arc<dyn DmaBackend> {
        &self.backend
    }

    fn position(&self, index: u64) -> Option<usize> {
        self.buffers.iter().position(|b| b.index() == index)
    }

    /// Explicit indices must be free; without one the next index after the largest
    /// attached one is used (0 for an empty registry). Freed indices are not reused.
    fn resolve_index(&self, index: Option<u64>) -> PdaResult<u64> {
        match index {
            Some(index) if self.position(index).is_some() => Err(PdaError::InvalidArgument(
                format!("Buffer {index} is already attached"),
            )),
            Some(index) => Ok(index),
            None => Ok(self
                .buffers
                .iter()
                .map(DmaBuffer::index)
                .max()
                .map_or(0, |max| max + 1)),
        }
    }

    fn push(&mut self, buffer: DmaBuffer) -> &mut DmaBuffer {
        log::debug!("Buffer {} attached ({} bytes)", buffer.index(), buffer.len());
        let at = self.buffers.len();
        self.buffers.push(buffer);
        &mut self.buffers[at]
    }

    /// Allocates a kernel-backed buffer of at least `size` bytes.
    ///
    /// # Errors
    /// `InvalidArgument` for a zero size or an index already in use,
    /// `InsufficientMemory` if the free physical memory is too small, or the
    /// adapter error.
    pub fn allocate(&mut self, index: Option<u64>, size: usize) -> PdaResult<&mut DmaBuffer> {
        let index = self.resolve_index(index)?;
        let buffer = DmaBuffer::allocate(&self.backend, index, size, self.numa_node)?;
        Ok(self.push(buffer))
    }

    /// Registers caller memory for DMA.
    ///
    /// # Safety
    /// `start..start + size` (rounded up to pages) must be a dedicated `mmap`ed range
    /// that stays valid until the buffer is freed; wrap-mapping moves it.
    ///
    /// # Errors
    /// `InvalidArgument` for an unaligned or empty range or an index already in use,
    /// or the `mlock`/adapter error.
    pub unsafe fn register(
        &mut self,
        index: Option<u64>,
        start: *mut u8,
        size: usize,
    ) -> PdaResult<&mut DmaBuffer> {
        let index = self.resolve_index(index)?;
        let buffer =
            unsafe { DmaBuffer::register(&self.backend, index, start, size, self.numa_node) }?;
        Ok(self.push(buffer))
    }

    /// Reattaches a buffer that exists on the adapter side only.
    ///
    /// # Errors
    /// `NotFound` if the adapter has no such buffer, `InvalidArgument` if it is
    /// already attached here.
    pub fn lookup(&mut self, index: u64) -> PdaResult<&mut DmaBuffer> {
        let index = self.resolve_index(Some(index))?;
        let buffer = DmaBuffer::lookup(&self.backend, index)?;
        Ok(self.push(buffer))
    }

    /// The attached buffer `index`, reattaching it from the adapter if needed.
    ///
    /// # Errors
    /// `NotFound` if neither this process nor the adapter knows the buffer.
    pub fn get(&mut self, index: u64) -> PdaResult<&mut DmaBuffer> {
        match self.position(index) {
            Some(at) => Ok(&mut self.buffers[at]),
            None => self.lookup(index),
        }
    }

    /// Detaches buffer `index` and frees it (see [`DmaBuffer`] for `persistent`).
    ///
    /// # Errors
    /// `NotFound` if no such buffer is attached, `Busy` if it is mapped elsewhere.
    /// The handle is gone in either case.
    pub fn free(&mut self, index: u64, persistent: bool) -> PdaResult<()> {
        let at = self
            .position(index)
            .ok_or_else(|| PdaError::NotFound(format!("No attached buffer {index}")))?;
        self.buffers.remove(at).free(persistent)
    }

    /// Frees every attached buffer, oldest first. Keeps going after a failure and
    /// reports the first one.
    ///
    /// # Errors
    /// The first error any buffer returned.
    pub fn free_all(&mut self, persistent: bool) -> PdaResult<()> {
        let mut first_err = None;
        for buffer in self.buffers.drain(..) {
            let index = buffer.index();
            if let Err(e) = buffer.free(persistent) {
                log::error!("Freeing buffer {index} failed: {e}");
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    /// Releases every adapter entry of the device that is not attached here.
    ///
    /// # Errors
    /// Returns the first adapter error.
    pub fn delete_not_attached(&mut self) -> PdaResult<()> {
        for name in self.backend.list()? {
            let attached = parse_index(&name).is_some_and(|i| self.position(i).is_some());
            if !attached {
                log::debug!("Deleting entry : {name}");
                self.backend.free(&name)?;
            }
        }
        Ok(())
    }

    /// Attaches every buffer the adapter holds for this device that is not attached
    /// yet, mapping it and loading its scatter/gather list. Returns the indices
    /// attached by this call.
    ///
    /// # Errors
    /// Stops at the first buffer that cannot be mapped.
    pub fn reattach_all(&mut self) -> PdaResult<Vec<u64>> {
        let mut attached = Vec::new();
        for index in self.backend.list()?.iter().filter_map(|n| parse_index(n)) {
            if self.position(index).is_none() {
                log::debug!("Rediscover entry : {index}");
                self.lookup(index)?;
                attached.push(index);
            }
        }
        Ok(attached)
    }

    /// Indices of every buffer the adapter holds for this device, attached or not.
    ///
    /// # Errors
    /// Returns an error if the adapter directory cannot be listed.
    pub fn adapter_indices(&self) -> PdaResult<Vec<u64>> {
        Ok(self
            .backend
            .list()?
            .iter()
            .filter_map(|n| parse_index(n))
            .collect())
    }

    pub fn iter(&self) -> impl Iterator<Item = &DmaBuffer> {
        self.buffers.iter()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }
}

impl Drop for BufferRegistry {
    fn drop(&mut self) {
        if self.buffers.is_empty() {
            return;
        }
        if let Err(e) = self.free_all(false) {
            log::error!("Releasing DMA buffers on drop failed: {e}");
        }
    }
}
