//! Memory-mapped register regions.
//!
//! Every access goes through `read_volatile`/`write_volatile` of exactly the
//! requested integer type. The compiler never merges, splits or vectorizes volatile
//! accesses, which is what devices that only decode their native bus width need.

use crate::error::{PdaError, PdaResult};
use crate::uio::sysfs::{BarInfo, BarKind};
use crate::utils::MappedRegion;
use std::fs::File;
use std::mem::size_of;

mod sealed {
    pub trait Sealed {}
    impl Sealed for u8 {}
    impl Sealed for u16 {}
    impl Sealed for u32 {}
    impl Sealed for u64 {}
}

/// Unsigned integer types a BAR can be accessed with.
pub trait BusWidth: Copy + sealed::Sealed {
    const BITS: u32;
}

impl BusWidth for u8 {
    const BITS: u32 = 8;
}
impl BusWidth for u16 {
    const BITS: u32 = 16;
}
impl BusWidth for u32 {
    const BITS: u32 = 32;
}
impl BusWidth for u64 {
    const BITS: u32 = 64;
}

#[derive(Debug)]
pub struct Bar {
    number: u8,
    kind: BarKind,
    physical_address: u64,
    map: MappedRegion,
}

impl Bar {
    /// Maps BAR `number` through its sysfs resource file.
    ///
    /// # Errors
    /// Returns `InvalidArgument` for I/O-port or unmapped BARs and for empty regions,
    /// or the `mmap` error.
    pub fn map(number: u8, info: BarInfo, size: u64, file: &File) -> PdaResult<Self> {
        if !matches!(info.kind, BarKind::Mem32 | BarKind::Mem64) {
            return Err(PdaError::InvalidArgument(format!(
                "bar{number} is no memory BAR ({:?})",
                info.kind
            )));
        }
        let size = usize::try_from(size)
            .ok()
            .filter(|&s| s > 0)
            .ok_or_else(|| PdaError::InvalidArgument(format!("bar{number} has no size")))?;

        let map = MappedRegion::map_file(file, size, libc::PROT_READ | libc::PROT_WRITE)?;
        log::debug!(
            "Mapped bar{number} ({:#x}, {size} bytes) -> {:p}",
            info.physical_address,
            map.as_ptr()
        );

        Ok(Self {
            number,
            kind: info.kind,
            physical_address: info.physical_address,
            map,
        })
    }

    #[must_use]
    pub const fn number(&self) -> u8 {
        self.number
    }

    #[must_use]
    pub const fn kind(&self) -> BarKind {
        self.kind
    }

    /// Bus address the BAR decodes, from the configuration header.
    #[must_use]
    pub const fn physical_address(&self) -> u64 {
        self.physical_address
    }

    #[must_use]
    pub const fn size(&self) -> usize {
        self.map.len()
    }

    /// Base pointer and size of the mapping.
    #[must_use]
    pub const fn get_map(&self) -> (*mut u8, usize) {
        (self.map.as_ptr(), self.map.len())
    }

    fn check<T: BusWidth>(&self, offset: usize, count: usize) -> PdaResult<()> {
        let end = count
            .checked_mul(size_of::<T>())
            .and_then(|bytes| bytes.checked_add(offset));
        match end {
            Some(end) if end <= self.map.len() && offset % size_of::<T>() == 0 => Ok(()),
            _ => Err(PdaError::InvalidArgument(format!(
                "{count} x {}-bit access at {offset:#x} is outside bar{} ({} bytes) or unaligned",
                T::BITS,
                self.number,
                self.map.len()
            ))),
        }
    }

    /// Reads one value at `offset`.
    ///
    /// # Safety
    /// `offset + size_of::<T>()` must not exceed the BAR size and `offset` must be
    /// aligned to `T`.
    #[must_use]
    pub unsafe fn get<T: BusWidth>(&self, offset: usize) -> T {
        unsafe { self.map.as_ptr().add(offset).cast::<T>().read_volatile() }
    }

    /// Writes one value at `offset`.
    ///
    /// # Safety
    /// Same contract as [`Self::get`].
    pub unsafe fn put<T: BusWidth>(&self, value: T, offset: usize) {
        unsafe { self.map.as_ptr().add(offset).cast::<T>().write_volatile(value) }
    }

    /// Bounds-checked [`Self::get`].
    ///
    /// # Errors
    /// Returns `InvalidArgument` if the access leaves the BAR or is unaligned.
    pub fn read<T: BusWidth>(&self, offset: usize) -> PdaResult<T> {
        self.check::<T>(offset, 1)?;
        Ok(unsafe { self.get(offset) })
    }

    /// Bounds-checked [`Self::put`].
    ///
    /// # Errors
    /// Returns `InvalidArgument` if the access leaves the BAR or is unaligned.
    pub fn write<T: BusWidth>(&self, value: T, offset: usize) -> PdaResult<()> {
        self.check::<T>(offset, 1)?;
        unsafe { self.put(value, offset) };
        Ok(())
    }

    /// Copies `source` into the BAR at `offset`, one `T`-wide write per element.
    ///
    /// # Errors
    /// Returns `InvalidArgument` if the range leaves the BAR or is unaligned.
    pub fn memcpy_to<T: BusWidth>(&self, offset: usize, source: &[T]) -> PdaResult<()> {
        self.check::<T>(offset, source.len())?;
        let target = unsafe { self.map.as_ptr().add(offset).cast::<T>() };
        for (i, value) in source.iter().enumerate() {
            unsafe { target.add(i).write_volatile(*value) };
        }
        Ok(())
    }

    /// Copies from the BAR at `offset` into `target`, one `T`-wide read per element.
    ///
    /// # Errors
    /// Returns `InvalidArgument` if the range leaves the BAR or is unaligned.
    pub fn memcpy_from<T: BusWidth>(&self, offset: usize, target: &mut [T]) -> PdaResult<()> {
        self.check::<T>(offset, target.len())?;
        let source = unsafe { self.map.as_ptr().add(offset).cast::<T>() };
        for (i, value) in target.iter_mut().enumerate() {
            *value = unsafe { source.add(i).read_volatile() };
        }
        Ok(())
    }
}
