//! I/O divertor seams
//!
//! The writer never touches a device directly; it emits physical bytes
//! through a `WriteDivertor` and fetches existing object bytes through a
//! `ReadDivertor`. Production wires these to the device path (direct or
//! via the write-ahead log, per the `deferred` flag); tests substitute
//! recording doubles.

use bytes::Bytes;
use carbide_common::Result;

/// Sink for physical writes scheduled by the writer
pub trait WriteDivertor {
    /// Write `data` at `disk_offset`
    ///
    /// `deferred` selects the write-ahead-log path: the payload is
    /// logged first and applied to its final location later, batching
    /// small I/Os at the cost of an extra journal write.
    fn write(&mut self, disk_offset: u64, data: &[u8], deferred: bool) -> Result<()>;
}

/// Source of existing object bytes
///
/// Used when a sub-block write needs read-modify-write of a partially
/// filled blob region; offsets are object-logical.
pub trait ReadDivertor {
    /// Read `length` bytes at object-logical `object_offset`
    fn read(&mut self, object_offset: u64, length: u64) -> Result<Bytes>;
}

/// One physical write observed by `MemDevice`
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IoRecord {
    /// Disk offset of the write
    pub disk_offset: u64,
    /// Bytes written
    pub length: u64,
    /// Whether the deferred path was requested
    pub deferred: bool,
}

/// In-memory device recording every write it receives
///
/// Backs the test suite and doubles as a reference divertor: bytes land
/// in a flat buffer immediately regardless of the deferred flag.
pub struct MemDevice {
    data: Vec<u8>,
    /// Every write, in scheduling order
    pub log: Vec<IoRecord>,
}

impl MemDevice {
    /// Create a device of `capacity` zeroed bytes
    #[must_use]
    pub fn new(capacity: u64) -> Self {
        Self {
            data: vec![0u8; capacity as usize],
            log: Vec::new(),
        }
    }

    /// Device capacity in bytes
    #[must_use]
    pub fn capacity(&self) -> u64 {
        self.data.len() as u64
    }

    /// Read back raw device bytes
    #[must_use]
    pub fn read_at(&self, disk_offset: u64, length: u64) -> &[u8] {
        &self.data[disk_offset as usize..(disk_offset + length) as usize]
    }
}

impl WriteDivertor for MemDevice {
    fn write(&mut self, disk_offset: u64, data: &[u8], deferred: bool) -> Result<()> {
        let end = disk_offset as usize + data.len();
        if end > self.data.len() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!("write [{disk_offset}, +{}) beyond device end", data.len()),
            )
            .into());
        }
        self.data[disk_offset as usize..end].copy_from_slice(data);
        self.log.push(IoRecord {
            disk_offset,
            length: data.len() as u64,
            deferred,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mem_device_records_writes() {
        let mut device = MemDevice::new(8192);
        device.write(4096, b"abc", true).unwrap();

        assert_eq!(device.read_at(4096, 3), b"abc");
        assert_eq!(
            device.log,
            vec![IoRecord {
                disk_offset: 4096,
                length: 3,
                deferred: true
            }]
        );
    }

    #[test]
    fn test_mem_device_rejects_out_of_range() {
        let mut device = MemDevice::new(4096);
        assert!(device.write(4090, b"0123456789", false).is_err());
        assert!(device.log.is_empty());
    }
}
