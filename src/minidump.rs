// CLASSIFICATION: COMMUNITY
// Filename: minidump.rs v0.1
// Author: Lukas Bower
// Date Modified: 2027-09-02

//! Shared minidump table of contents.
//!
//! The table lives in memory written by the processors themselves. It is
//! read one little-endian field at a time through [`FieldReader`] and every
//! value is range checked before it is used to map anything.

use log::debug;

use crate::error::PilError;
use crate::memory::{FieldReader, MapAttrs, MemoryMapper};

pub const MD_SS_ENABLED: u32 = 0x454E_424C;
pub const MD_SS_ENCR_DONE: u32 = 0x444F_4E45;
pub const MD_REGION_VALID: u32 = 0x5641_4C49;

/// Number of subsystem entries in the global table.
pub const MAX_NUM_OF_SS: usize = 10;
/// Upper bound on records trusted from one subsystem entry.
pub const MAX_REGION_COUNT: u32 = 4096;
/// Largest single region mapped for a minidump.
pub const MAX_REGION_SIZE: u64 = 256 << 20;

const GLOBAL_HEADER_SIZE: usize = 16;
pub const SS_TOC_SIZE: usize = 32;
pub const REGION_RECORD_SIZE: usize = 40;
pub const GLOBAL_TOC_SIZE: usize = GLOBAL_HEADER_SIZE + MAX_NUM_OF_SS * SS_TOC_SIZE;
const REGION_NAME_LEN: usize = 16;

/// Global table header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GlobalToc {
    pub init: u32,
    pub revision: u32,
    pub enable_status: u32,
}

impl GlobalToc {
    pub fn is_initialized(&self) -> bool {
        self.init == 1
    }
}

/// One processor's entry in the global table.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SubsystemToc {
    pub init: u32,
    pub enable_status: u32,
    pub encryption_status: u32,
    pub encryption_required: u32,
    pub region_count: u32,
    pub regions_base: u64,
}

impl SubsystemToc {
    fn parse(r: &FieldReader<'_>) -> Option<Self> {
        Some(Self {
            init: r.u32(0)?,
            enable_status: r.u32(4)?,
            encryption_status: r.u32(8)?,
            encryption_required: r.u32(12)?,
            region_count: r.u32(16)?,
            regions_base: r.u64(24)?,
        })
    }

    /// Initialised, enabled and pointing at a region table.
    pub fn is_ready(&self) -> bool {
        self.regions_base != 0 && self.init == 1 && self.enable_status == MD_SS_ENABLED
    }

    pub fn encryption_done(&self) -> bool {
        self.encryption_status == MD_SS_ENCR_DONE
    }

    /// Safe to read records from.
    pub fn is_trusted(&self) -> bool {
        self.is_ready() && self.encryption_done() && self.region_count <= MAX_REGION_COUNT
    }
}

/// One region descriptor from a subsystem's table.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RegionRecord {
    pub name: String,
    pub seq_num: u32,
    pub valid: u32,
    pub base: u64,
    pub size: u64,
}

impl RegionRecord {
    fn parse(r: &FieldReader<'_>, off: usize) -> Option<Self> {
        Some(Self {
            name: r.name(off, REGION_NAME_LEN)?,
            seq_num: r.u32(off + 16)?,
            valid: r.u32(off + 20)?,
            base: r.u64(off + 24)?,
            size: r.u64(off + 32)?,
        })
    }

    pub fn is_valid(&self) -> bool {
        self.valid == MD_REGION_VALID
            && self.size != 0
            && self.size <= MAX_REGION_SIZE
            && self.base.checked_add(self.size).is_some()
    }
}

/// Location of the global table in physical memory.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MinidumpToc {
    base: u64,
}

impl MinidumpToc {
    pub fn new(base: u64) -> Self {
        Self { base }
    }

    pub fn base(&self) -> u64 {
        self.base
    }

    pub fn read_global(&self, mapper: &dyn MemoryMapper) -> Result<GlobalToc, PilError> {
        let view = mapper.map(self.base, GLOBAL_HEADER_SIZE, MapAttrs::empty())?;
        let r = FieldReader::new(view.as_slice());
        let toc = (|| {
            Some(GlobalToc {
                init: r.u32(0)?,
                revision: r.u32(4)?,
                enable_status: r.u32(8)?,
            })
        })();
        toc.ok_or(PilError::MinidumpNotReady)
    }

    /// Physical address of subsystem entry `id`.
    pub fn subsystem_addr(&self, id: u32) -> Option<u64> {
        let id = usize::try_from(id).ok().filter(|id| *id < MAX_NUM_OF_SS)?;
        Some(self.base + (GLOBAL_HEADER_SIZE + id * SS_TOC_SIZE) as u64)
    }

    pub fn read_subsystem(&self, mapper: &dyn MemoryMapper, id: u32) -> Result<SubsystemToc, PilError> {
        let addr = self.subsystem_addr(id).ok_or(PilError::MinidumpNotReady)?;
        let view = mapper.map(addr, SS_TOC_SIZE, MapAttrs::empty())?;
        let toc = SubsystemToc::parse(&FieldReader::new(view.as_slice()))
            .ok_or(PilError::MinidumpNotReady)?;
        debug!(
            "minidump: ss {id} init {:#x} enable {:#x} encryption {:#x} count {:#x} base {:#x}",
            toc.init, toc.enable_status, toc.encryption_status, toc.region_count, toc.regions_base
        );
        Ok(toc)
    }
}

/// Read every region record a trusted subsystem entry points at.
pub fn read_regions(mapper: &dyn MemoryMapper, toc: &SubsystemToc) -> Result<Vec<RegionRecord>, PilError> {
    if !toc.is_trusted() {
        return Err(PilError::MinidumpNotReady);
    }
    let count = toc.region_count as usize;
    if count == 0 {
        return Ok(Vec::new());
    }
    let view = mapper.map(toc.regions_base, count * REGION_RECORD_SIZE, MapAttrs::empty())?;
    let r = FieldReader::new(view.as_slice());
    (0..count)
        .map(|i| RegionRecord::parse(&r, i * REGION_RECORD_SIZE).ok_or(PilError::MinidumpNotReady))
        .collect()
}

/// Encoders for building tables in tests and simulators.
pub mod layout {
    use super::*;

    pub fn global(init: u32, revision: u32, enable_status: u32) -> Vec<u8> {
        let mut out = vec![0u8; GLOBAL_HEADER_SIZE];
        out[0..4].copy_from_slice(&init.to_le_bytes());
        out[4..8].copy_from_slice(&revision.to_le_bytes());
        out[8..12].copy_from_slice(&enable_status.to_le_bytes());
        out
    }

    pub fn subsystem(toc: &SubsystemToc) -> Vec<u8> {
        let mut out = vec![0u8; SS_TOC_SIZE];
        out[0..4].copy_from_slice(&toc.init.to_le_bytes());
        out[4..8].copy_from_slice(&toc.enable_status.to_le_bytes());
        out[8..12].copy_from_slice(&toc.encryption_status.to_le_bytes());
        out[12..16].copy_from_slice(&toc.encryption_required.to_le_bytes());
        out[16..20].copy_from_slice(&toc.region_count.to_le_bytes());
        out[24..32].copy_from_slice(&toc.regions_base.to_le_bytes());
        out
    }

    pub fn region(rec: &RegionRecord) -> Vec<u8> {
        let mut out = vec![0u8; REGION_RECORD_SIZE];
        let name = rec.name.as_bytes();
        let len = name.len().min(REGION_NAME_LEN - 1);
        out[..len].copy_from_slice(&name[..len]);
        out[16..20].copy_from_slice(&rec.seq_num.to_le_bytes());
        out[20..24].copy_from_slice(&rec.valid.to_le_bytes());
        out[24..32].copy_from_slice(&rec.base.to_le_bytes());
        out[32..40].copy_from_slice(&rec.size.to_le_bytes());
        out
    }
}
