//! Binary layouts and naming conventions of the `uio_pci_dma` kernel adapter.
//!
//! Files under `<devices_root>/<bdf>/dma/`:
//! - `request`  write a [`BufferRequest`] to allocate (`start == 0`) or pin (`start != 0`)
//! - `free`     write a buffer name (NUL terminated) to release it
//! - `<name>/map`  mmap target with the buffer data
//! - `<name>/sg`   mmap target with an array of [`ScatterRecord`]
//! - `max_payload_size`, `max_read_request_size`  4-byte native-endian integers

use crate::error::{PdaError, PdaResult};
use bytemuck::{Pod, Zeroable};
use std::fmt;
use std::str::FromStr;

// ===============================================================================================
// Constants and Versioning
// ===============================================================================================

pub const DMA_DIR: &str = "dma";
pub const REQUEST_FILE: &str = "request";
pub const FREE_FILE: &str = "free";
pub const MAP_FILE: &str = "map";
pub const SG_FILE: &str = "sg";
pub const MAX_PAYLOAD_SIZE_FILE: &str = "max_payload_size";
pub const MAX_READ_REQUEST_SIZE_FILE: &str = "max_read_request_size";

pub const BUFFER_NAME_LEN: usize = 1024;

/// Bookkeeping the adapter keeps behind the user-visible request fields: two
/// kobject name blocks and nine pointer-sized members. Userspace sends zeros.
pub const KERNEL_PRIVATE_LEN: usize = 2 * 1024 + 9 * 8;

/// The adapter only accepts writes of exactly this many bytes.
pub const BUFFER_REQUEST_SIZE: usize = BUFFER_NAME_LEN + 8 + 4 + 8 + KERNEL_PRIVATE_LEN;

/// Adapter interface version this library was written against.
pub const LIBRARY_ADAPTER_VERSION: DriverVersion = DriverVersion {
    current: 0,
    revision: 10,
    age: 0,
};

// ===============================================================================================
// Request / Scatter Records
// ===============================================================================================

/// Allocation request written to `dma/request`.
#[repr(C, packed)]
#[derive(Debug, Copy, Clone, Pod, Zeroable)]
pub struct BufferRequest {
    pub name: [u8; BUFFER_NAME_LEN],
    pub size: u64,
    pub numa_node: i32,
    pub start: u64,
    pub kernel_private: [u8; KERNEL_PRIVATE_LEN],
}

const _: () = assert!(std::mem::size_of::<BufferRequest>() == BUFFER_REQUEST_SIZE);

impl BufferRequest {
    /// Builds a request for buffer `name`. `start` is 0 for kernel memory or the
    /// page-aligned user address to pin.
    ///
    /// # Errors
    /// Returns `InvalidArgument` if the name does not fit the fixed-size field.
    pub fn new(name: &str, size: u64, numa_node: i32, start: u64) -> PdaResult<Self> {
        let bytes = name.as_bytes();
        if bytes.is_empty() || bytes.len() >= BUFFER_NAME_LEN || bytes.contains(&0) {
            return Err(PdaError::InvalidArgument(format!(
                "Buffer name '{name}' is not a valid adapter entry name"
            )));
        }

        let mut request = Self::zeroed();
        request.name[..bytes.len()].copy_from_slice(bytes);
        request.size = size;
        request.numa_node = numa_node;
        request.start = start;
        Ok(request)
    }

    /// The name up to its NUL terminator.
    #[must_use]
    pub fn name(&self) -> String {
        let name = self.name;
        let end = name.iter().position(|&b| b == 0).unwrap_or(BUFFER_NAME_LEN);
        String::from_utf8_lossy(&name[..end]).into_owned()
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        bytemuck::bytes_of(self)
    }

    /// Parses a request as the adapter receives it.
    ///
    /// # Errors
    /// Returns `InvalidArgument` if the write does not have the exact request size.
    pub fn from_bytes(bytes: &[u8]) -> PdaResult<Self> {
        if bytes.len() != BUFFER_REQUEST_SIZE {
            return Err(PdaError::InvalidArgument(format!(
                "Invalid size of request struct ({} bytes, expected {BUFFER_REQUEST_SIZE})",
                bytes.len()
            )));
        }
        Ok(bytemuck::pod_read_unaligned(bytes))
    }
}

/// One entry of the `sg` file, in the order the adapter exposes them.
#[repr(C)]
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Pod, Zeroable)]
pub struct ScatterRecord {
    pub page_link: u64,
    pub offset: u32,
    pub length: u32,
    pub dma_address: u64,
}

pub const SCATTER_RECORD_SIZE: usize = std::mem::size_of::<ScatterRecord>();

const _: () = assert!(SCATTER_RECORD_SIZE == 24);

impl ScatterRecord {
    /// Decodes a raw `sg` file image. Trailing bytes that do not form a whole
    /// record are ignored, matching `st_size / sizeof(record)` on the C side.
    #[must_use]
    pub fn parse_all(bytes: &[u8]) -> Vec<Self> {
        bytes
            .chunks_exact(SCATTER_RECORD_SIZE)
            .map(bytemuck::pod_read_unaligned)
            .collect()
    }

    #[must_use]
    pub fn encode_all(records: &[Self]) -> Vec<u8> {
        bytemuck::cast_slice(records).to_vec()
    }
}

// ===============================================================================================
// Adapter Version
// ===============================================================================================

/// `current.revision.age` triple of the kernel adapter interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DriverVersion {
    pub current: u32,
    pub revision: u32,
    pub age: u32,
}

impl DriverVersion {
    /// Whether a library built for `self` can drive an adapter reporting `driver`.
    ///
    /// The `current` field is the interface family and must always match. Within a
    /// family, a newer `age` only adds interface, and a different `revision` at the
    /// same `age` changes no interface at all.
    #[must_use]
    pub fn accepts(&self, driver: &Self) -> bool {
        if self == driver {
            return true;
        }
        if driver.current != self.current {
            return false;
        }
        if driver.age > self.age {
            return true;
        }
        driver.age == self.age
    }
}

impl fmt::Display for DriverVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.current, self.revision, self.age)
    }
}

impl FromStr for DriverVersion {
    type Err = PdaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || PdaError::InvalidArgument(format!("Malformed adapter version '{s}'"));
        let mut parts = s.trim().split('.');
        let mut next = || -> PdaResult<u32> {
            parts
                .next()
                .and_then(|p| p.parse::<u32>().ok())
                .ok_or_else(invalid)
        };
        let version = Self {
            current: next()?,
            revision: next()?,
            age: next()?,
        };
        if parts.next().is_some() {
            return Err(invalid());
        }
        Ok(version)
    }
}

// ===============================================================================================
// Bus Address
// ===============================================================================================

/// PCI location `domain:bus:device.function`, formatted as sysfs names it
/// (`0000:03:00.0`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BusAddress {
    pub domain: u16,
    pub bus: u8,
    pub device: u8,
    pub function: u8,
}

impl BusAddress {
    #[must_use]
    pub const fn new(domain: u16, bus: u8, device: u8, function: u8) -> Self {
        Self {
            domain,
            bus,
            device,
            function,
        }
    }
}

impl fmt::Display for BusAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:04x}:{:02x}:{:02x}.{:x}",
            self.domain, self.bus, self.device, self.function
        )
    }
}

impl FromStr for BusAddress {
    type Err = PdaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || PdaError::InvalidArgument(format!("Invalid bus ID string '{s}'"));

        let (domain, rest) = s.split_once(':').ok_or_else(invalid)?;
        let (bus, rest) = rest.split_once(':').ok_or_else(invalid)?;
        let (device, function) = rest.split_once('.').ok_or_else(invalid)?;

        if domain.len() != 4 || bus.len() != 2 || device.len() != 2 || function.len() != 1 {
            return Err(invalid());
        }

        let address = Self {
            domain: u16::from_str_radix(domain, 16).map_err(|_| invalid())?,
            bus: u8::from_str_radix(bus, 16).map_err(|_| invalid())?,
            device: u8::from_str_radix(device, 16).map_err(|_| invalid())?,
            function: u8::from_str_radix(function, 16).map_err(|_| invalid())?,
        };
        if address.device > 0x1f || address.function > 7 {
            return Err(invalid());
        }
        Ok(address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_layout_matches_adapter() {
        let request = BufferRequest::new("7", 8192, -1, 0).unwrap();
        let bytes = request.as_bytes();
        assert_eq!(bytes.len(), BUFFER_REQUEST_SIZE);
        assert_eq!(bytes[0], b'7');
        assert_eq!(bytes[1], 0);
        assert_eq!(&bytes[1024..1032], &8192u64.to_ne_bytes());
        assert_eq!(&bytes[1032..1036], &(-1i32).to_ne_bytes());
        assert_eq!(&bytes[1036..1044], &0u64.to_ne_bytes());

        let back = BufferRequest::from_bytes(bytes).unwrap();
        assert_eq!(back.name(), "7");
        assert!(BufferRequest::from_bytes(&bytes[..100]).is_err());
    }

    #[test]
    fn request_rejects_bad_names() {
        assert!(BufferRequest::new("", 1, -1, 0).is_err());
        assert!(BufferRequest::new(&"1".repeat(BUFFER_NAME_LEN), 1, -1, 0).is_err());
    }

    #[test]
    fn scatter_records_decode_in_file_order() {
        let records = [
            ScatterRecord {
                page_link: 0xdead,
                offset: 0,
                length: 4096,
                dma_address: 0x1000,
            },
            ScatterRecord {
                page_link: 0xbeef,
                offset: 0,
                length: 8192,
                dma_address: 0x9000,
            },
        ];
        let mut image = ScatterRecord::encode_all(&records);
        assert_eq!(image.len(), 48);
        image.extend_from_slice(&[0xff; 5]);
        assert_eq!(ScatterRecord::parse_all(&image), records.to_vec());
    }

    #[test]
    fn version_compatibility() {
        let lib = DriverVersion {
            current: 1,
            revision: 2,
            age: 3,
        };
        let with = |current, revision, age| DriverVersion {
            current,
            revision,
            age,
        };
        assert!(lib.accepts(&lib));
        assert!(lib.accepts(&with(1, 0, 4)));
        assert!(lib.accepts(&with(1, 5, 3)));
        assert!(!lib.accepts(&with(1, 2, 2)));
        assert!(!lib.accepts(&with(2, 2, 3)));
        assert!(!lib.accepts(&with(0, 2, 4)));
    }

    #[test]
    fn version_parsing() {
        let v: DriverVersion = "0.10.0\n".parse().unwrap();
        assert_eq!(v, LIBRARY_ADAPTER_VERSION);
        assert_eq!(v.to_string(), "0.10.0");
        assert!("0.10".parse::<DriverVersion>().is_err());
        assert!("0.10.0.1".parse::<DriverVersion>().is_err());
        assert!("a.b.c".parse::<DriverVersion>().is_err());
    }

    #[test]
    fn bus_address_round_trip() {
        let addr: BusAddress = "0000:03:1f.7".parse().unwrap();
        assert_eq!(addr, BusAddress::new(0, 3, 0x1f, 7));
        assert_eq!(addr.to_string(), "0000:03:1f.7");
        assert!("0000:03:00".parse::<BusAddress>().is_err());
        assert!("000:03:00.0".parse::<BusAddress>().is_err());
        assert!("0000:03:20.0".parse::<BusAddress>().is_err());
    }
}
