// CLASSIFICATION: COMMUNITY
// Filename: ramdump.rs v0.2
// Author: Lukas Bower
// Date Modified: 2027-09-02

//! Crash dump collector.
//!
//! Builds the list of physical ranges handed to a dump writer after a
//! processor crash: either every loaded segment, or the curated set the
//! processor published in the shared minidump table.

use log::{debug, error};

use crate::error::{PilError, ENODEV};
use crate::instance::{lock, LoaderInstance};
use crate::memory::{MapAttrs, MappedMemory, PhysRange};
use crate::minidump::{self, RegionRecord};
use crate::secure::DomainTransfer;

/// One physical range to copy out.
pub struct DumpSegment<'a> {
    pub name: Option<String>,
    pub address: u64,
    pub size: u64,
    /// Write-combined view, present for minidump ranges.
    pub view: Option<Box<dyn MappedMemory + 'a>>,
}

impl DumpSegment<'_> {
    pub fn bytes(&self) -> Option<&[u8]> {
        self.view.as_deref().map(|v| v.as_slice())
    }
}

/// Container the minidump writer should produce.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MinidumpFormat {
    Raw,
    Elf32,
}

/// Dump-writing service. Errors are the writer's return codes.
pub trait DumpWriter {
    fn write_elf(&self, segments: &[DumpSegment<'_>]) -> Result<(), i32>;

    fn write_minidump(&self, _segments: &[DumpSegment<'_>], _format: MinidumpFormat) -> Result<(), i32> {
        Err(-ENODEV)
    }
}

impl LoaderInstance {
    /// Collect a dump of the crashed processor.
    ///
    /// Uses the minidump table when this instance has a ready entry in it,
    /// otherwise dumps every loaded segment.
    pub fn ramdump(
        &self,
        full: Option<&dyn DumpWriter>,
        mini: Option<&dyn DumpWriter>,
    ) -> Result<(), PilError> {
        let _op = lock(&self.op_lock);
        let name = &*self.name;

        if let (Some(toc), Some(ids)) = (self.registry.minidump, &self.minidump) {
            let ss = toc.read_subsystem(&*self.registry.platform.memory, ids.primary)?;
            if ss.is_ready() {
                if ss.encryption_done() {
                    debug!("{name}: dumping minidump");
                    return self.do_minidump(mini);
                }
                debug!("{name}: minidump aborted");
                return Err(PilError::MinidumpNotReady);
            }
        }
        debug!("{name}: continuing with full dump");
        self.do_full_dump(full)
    }

    fn do_full_dump(&self, writer: Option<&dyn DumpWriter>) -> Result<(), PilError> {
        let writer = writer.ok_or(PilError::NoDumpDevice)?;
        let segments: Vec<DumpSegment<'_>> = self
            .segments()
            .iter()
            .map(|s| DumpSegment {
                name: None,
                address: s.paddr,
                size: s.size,
                view: None,
            })
            .collect();
        self.with_host_access(|| {
            writer.write_elf(&segments).map_err(|rc| {
                error!("{}: Ramdump collection failed rc:{rc}", self.name);
                PilError::DumpFailed(rc)
            })
        })
    }

    fn do_minidump(&self, writer: Option<&dyn DumpWriter>) -> Result<(), PilError> {
        let writer = writer.ok_or(PilError::NoDumpDevice)?;
        let Some(ids) = &self.minidump else {
            return Err(PilError::MinidumpNotReady);
        };
        let toc = self.registry.minidump.ok_or(PilError::MinidumpNotReady)?;
        let mem = &*self.registry.platform.memory;

        let primary = toc.read_subsystem(mem, ids.primary)?;
        let mut records = minidump::read_regions(mem, &primary)?;
        for aux in &ids.aux {
            match toc.read_subsystem(mem, *aux) {
                Ok(ss) if ss.is_trusted() => records.extend(minidump::read_regions(mem, &ss)?),
                Ok(_) => debug!("{}: aux minidump {aux} not ready, skipped", self.name),
                Err(e) => debug!("{}: aux minidump {aux} unreadable: {e}", self.name),
            }
        }

        let format = if self.config.minidump_as_elf32 {
            MinidumpFormat::Elf32
        } else {
            MinidumpFormat::Raw
        };
        self.with_host_access(|| {
            // Views drop, and unmap, on every exit from this closure.
            let segments = self.map_minidump_segments(&records)?;
            writer.write_minidump(&segments, format).map_err(|rc| {
                error!("{}: Minidump collection failed rc:{rc}", self.name);
                PilError::DumpFailed(rc)
            })
        })
    }

    /// Map every valid record. Invalid ones reduce the expected count.
    fn map_minidump_segments(&self, records: &[RegionRecord]) -> Result<Vec<DumpSegment<'_>>, PilError> {
        let mut valid = records.len();
        let mut segments = Vec::with_capacity(records.len());
        for rec in records {
            if !rec.is_valid() {
                valid -= 1;
                continue;
            }
            let len = usize::try_from(rec.size).map_err(|_| PilError::MapFailed {
                paddr: rec.base,
                size: rec.size,
            })?;
            let view = self.mapper.map(rec.base, len, MapAttrs::WRITE_COMBINE)?;
            debug!(
                "{}: minidump segment {} at {:#x} size {:#x}",
                self.name, rec.name, rec.base, rec.size
            );
            segments.push(DumpSegment {
                name: Some(rec.name.clone()),
                address: rec.base,
                size: rec.size,
                view: Some(view),
            });
        }
        debug_assert_eq!(segments.len(), valid);
        debug!("{}: {valid} of {} minidump segments valid", self.name, records.len());
        Ok(segments)
    }

    /// Run `dump` with the region readable by the host.
    ///
    /// The region goes back to the processor afterwards even if the dump
    /// failed. The first error wins.
    fn with_host_access<F>(&self, dump: F) -> Result<(), PilError>
    where
        F: FnOnce() -> Result<(), PilError>,
    {
        let (range, owned) = {
            let st = lock(&self.state);
            (st.region.range(), st.subsystem_owns_region)
        };
        let xfer = self.domain().filter(|_| owned && !range.is_empty());
        if let Some(xfer) = &xfer {
            xfer.to_host(range);
        }
        let result = dump();
        match &xfer {
            Some(xfer) => result.and(self.restore(xfer, range)),
            None => result,
        }
    }

    fn restore(&self, xfer: &DomainTransfer<'_>, range: PhysRange) -> Result<(), PilError> {
        xfer.to_subsystem(range).map_err(|e| {
            lock(&self.state).subsystem_owns_region = false;
            e
        })
    }
}
