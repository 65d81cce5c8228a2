// CLASSIFICATION: COMMUNITY
// Filename: imem.rs v0.1
// Author: Lukas Bower
// Date Modified: 2027-09-02

//! Image-info table in always-on memory.
//!
//! One 20-byte record per instance id: `name[8]`, `start: le64`,
//! `size: le32`. Debug tools read it to find loaded images after a crash.

use std::sync::Arc;

use log::debug;

use crate::config::Window;
use crate::error::PilError;
use crate::memory::{FieldReader, MapAttrs, MemoryMapper};

pub const IMAGE_INFO_SIZE: usize = 20;
const NAME_LEN: usize = 8;

/// Decoded record, used by tests and diagnostics.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ImageInfo {
    pub name: String,
    pub start: u64,
    pub size: u32,
}

pub struct ImageInfoTable {
    window: Window,
    mapper: Arc<dyn MemoryMapper>,
}

impl ImageInfoTable {
    /// Take over `window` and clear every record.
    pub fn new(window: Window, mapper: Arc<dyn MemoryMapper>) -> Result<Self, PilError> {
        let table = Self { window, mapper };
        let len = usize::try_from(window.size).map_err(|_| PilError::MapFailed {
            paddr: window.base,
            size: window.size,
        })?;
        table
            .mapper
            .map(window.base, len, MapAttrs::empty())?
            .as_mut_slice()
            .fill(0);
        debug!("imem: {} image-info slots at {:#x}", table.slots(), window.base);
        Ok(table)
    }

    pub fn slots(&self) -> usize {
        self.window.size as usize / IMAGE_INFO_SIZE
    }

    fn write(&self, id: usize, off: usize, bytes: &[u8]) -> Result<(), PilError> {
        if id >= self.slots() {
            return Err(PilError::Config(format!("no image-info slot for id {id}")));
        }
        let addr = self.window.base + (id * IMAGE_INFO_SIZE + off) as u64;
        self.mapper
            .map(addr, bytes.len(), MapAttrs::empty())?
            .as_mut_slice()
            .copy_from_slice(bytes);
        Ok(())
    }

    pub fn set_name(&self, id: usize, name: &str) -> Result<(), PilError> {
        let mut buf = [0u8; NAME_LEN];
        let len = name.len().min(NAME_LEN);
        buf[..len].copy_from_slice(&name.as_bytes()[..len]);
        self.write(id, 0, &buf)
    }

    /// Record the region an image occupies. The size field is 32 bits wide.
    pub fn set_region(&self, id: usize, start: u64, size: u64) -> Result<(), PilError> {
        let mut buf = [0u8; IMAGE_INFO_SIZE - NAME_LEN];
        buf[..8].copy_from_slice(&start.to_le_bytes());
        buf[8..].copy_from_slice(&(size as u32).to_le_bytes());
        self.write(id, NAME_LEN, &buf)
    }

    pub fn clear_region(&self, id: usize) -> Result<(), PilError> {
        self.write(id, NAME_LEN, &[0u8; IMAGE_INFO_SIZE - NAME_LEN])
    }

    pub fn read(&self, id: usize) -> Option<ImageInfo> {
        if id >= self.slots() {
            return None;
        }
        let addr = self.window.base + (id * IMAGE_INFO_SIZE) as u64;
        let view = self.mapper.map(addr, IMAGE_INFO_SIZE, MapAttrs::empty()).ok()?;
        let r = FieldReader::new(view.as_slice());
        Some(ImageInfo {
            name: r.name(0, NAME_LEN)?,
            start: r.u64(NAME_LEN)?,
            size: r.u32(NAME_LEN + 8)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::RamMemory;

    #[test]
    fn records_round_trip_through_memory() {
        let ram = Arc::new(RamMemory::new().with_bank(0x146b_f000, 0x100));
        ram.fill(0x146b_f000, 0x100, 0xff);
        let window = Window {
            base: 0x146b_f000,
            size: 0x64,
        };
        let table = ImageInfoTable::new(window, ram.clone()).unwrap();
        assert_eq!(table.slots(), 5);
        assert_eq!(table.read(2), Some(ImageInfo::default()));

        table.set_name(2, "modem_long").unwrap();
        table.set_region(2, 0x8b00_0000, 0x1_0600_0000).unwrap();
        let info = table.read(2).unwrap();
        assert_eq!(info.name, "modem_lo");
        assert_eq!(info.start, 0x8b00_0000);
        assert_eq!(info.size, 0x0600_0000);

        table.clear_region(2).unwrap();
        assert_eq!(table.read(2).unwrap().start, 0);
        assert_eq!(table.read(2).unwrap().name, "modem_lo");
        assert!(table.set_name(5, "x").is_err());
        assert_eq!(ram.read(0x146b_f064, 1).unwrap(), vec![0xff]);
    }
}
