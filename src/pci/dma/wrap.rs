//! Double mappings for ring buffers.
//!
//! The second view of a buffer sits directly behind the first one, so an access
//! that runs past the end of `map` lands at the start of the buffer again. Both
//! views are placed inside an inaccessible reservation of twice the buffer length,
//! which pins down the address pair before any file is mapped.

use crate::error::{PdaError, PdaResult};
use crate::utils::MappedRegion;
use std::fs::File;
use std::ptr::NonNull;

const PROT_RW: libc::c_int = libc::PROT_READ | libc::PROT_WRITE;

fn doubled(len: usize) -> PdaResult<usize> {
    len.checked_mul(2).ok_or_else(|| {
        PdaError::InvalidArgument(format!("Buffer of {len} bytes is too large to wrap"))
    })
}

fn verify(first: *mut u8, second: *mut u8, len: usize) -> PdaResult<()> {
    if second == first.wrapping_add(len) {
        Ok(())
    } else {
        Err(PdaError::InvalidArgument(format!(
            "Second mapping at {second:p} does not follow {first:p} + {len:#x}"
        )))
    }
}

fn overlay(
    file: &File,
    len: usize,
    reservation: &MappedRegion,
) -> PdaResult<(MappedRegion, MappedRegion)> {
    let base = reservation.as_ptr();

    let first = MappedRegion::map_file_at(file, len, PROT_RW, base, libc::MAP_FIXED)?;
    let tail = base.wrapping_add(len);
    let second = match MappedRegion::map_file_at(file, len, PROT_RW, tail, libc::MAP_FIXED) {
        Ok(second) => second,
        Err(e) => {
            // Still covered by the reservation, which unmaps it.
            let _ = first.into_raw();
            return Err(e);
        }
    };

    if let Err(e) = verify(first.as_ptr(), second.as_ptr(), len) {
        let _ = first.into_raw();
        let _ = second.into_raw();
        return Err(e);
    }
    Ok((first, second))
}

/// Maps the first `len` bytes of `file` twice, back to back.
///
/// # Errors
/// Returns the error of the failing `mmap`; nothing stays mapped in that case.
pub(crate) fn wrap_file(file: &File, len: usize) -> PdaResult<(MappedRegion, MappedRegion)> {
    let reservation = MappedRegion::reserve(doubled(len)?)?;
    let pair = overlay(file, len, &reservation)?;
    // Fully replaced by the two views.
    let _ = reservation.into_raw();
    log::trace!("wrap-mapped {len:#x} bytes at {:p}", pair.0.as_ptr());
    Ok(pair)
}

/// Result of wrapping caller-owned memory.
#[derive(Debug)]
pub(crate) struct UserWrap {
    /// Where the caller's pages live now.
    pub map: NonNull<u8>,
    /// The view of the adapter's `map` file behind them, if it could be placed.
    pub second: Option<MappedRegion>,
}

/// Moves the caller's mapping at `start` into a fresh reservation and maps `file`
/// right behind it.
///
/// # Safety
/// `start..start + len` must be an `mmap`ed range that nothing else uses through
/// its old address afterwards.
///
/// # Errors
/// Returns an error only if the pages could not be moved; they are then untouched.
pub(crate) unsafe fn wrap_user(start: NonNull<u8>, file: &File, len: usize) -> PdaResult<UserWrap> {
    let reservation = MappedRegion::reserve(doubled(len)?)?;
    let base = reservation.as_ptr();

    let moved = unsafe {
        libc::mremap(
            start.as_ptr().cast(),
            len,
            len,
            libc::MREMAP_FIXED | libc::MREMAP_MAYMOVE,
            base.cast::<libc::c_void>(),
        )
    };
    if moved == libc::MAP_FAILED {
        return Err(PdaError::last_os_error("mremap"));
    }

    // From here on the first half belongs to the caller's pages.
    let (_, _) = reservation.into_raw();
    let Some(map) = NonNull::new(moved.cast::<u8>()) else {
        return Err(PdaError::InvalidArgument("mremap returned NULL".into()));
    };

    let tail = map.as_ptr().wrapping_add(len);
    let second = match MappedRegion::map_file_at(file, len, PROT_RW, tail, libc::MAP_FIXED) {
        Ok(second) => match verify(map.as_ptr(), second.as_ptr(), len) {
            Ok(()) => Some(second),
            Err(e) => {
                log::warn!("Aligning second mapping failed: {e}");
                None
            }
        },
        Err(e) => {
            log::warn!("Second mapping failed: {e}");
            // Give back the unused half of the reservation.
            if let Some(tail) = NonNull::new(tail) {
                drop(unsafe { MappedRegion::from_raw(tail, len) });
            }
            None
        }
    };

    Ok(UserWrap { map, second })
}
