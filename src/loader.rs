// CLASSIFICATION: COMMUNITY
// Filename: loader.rs v0.3
// Author: Lukas Bower
// Date Modified: 2027-09-02

//! Segment loader.
//!
//! Copies each segment's `.bNN` blob into its planned physical range and
//! zero-fills the remainder. Every segment is attempted; failures are
//! collected in a bitmap and reported together.

use std::sync::Arc;

use log::{debug, error};

use crate::error::PilError;
use crate::firmware::{FirmwareSource, SuspendBarrier};
use crate::memory::{MapAttrs, MemoryMapper, PhysRange};
use crate::ops::{Capabilities, DomainOps};
use crate::region::{Segment, SZ_1M};
use crate::workqueue::WorkQueue;

/// Largest window mapped at once while zero-filling.
pub const IOMAP_SIZE: u64 = SZ_1M;

/// Failed segment indices, one bit per segment.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FailureMap {
    words: Vec<u64>,
    len: usize,
}

impl FailureMap {
    pub fn new(len: usize) -> Self {
        Self {
            words: vec![0; len.div_ceil(64)],
            len,
        }
    }

    pub fn set(&mut self, idx: usize) {
        if idx < self.len {
            self.words[idx / 64] |= 1 << (idx % 64);
        }
    }

    pub fn is_set(&self, idx: usize) -> bool {
        idx < self.len && self.words[idx / 64] & (1 << (idx % 64)) != 0
    }

    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|w| *w == 0)
    }

    pub fn indices(&self) -> Vec<usize> {
        (0..self.len).filter(|i| self.is_set(*i)).collect()
    }
}

fn map_len(paddr: u64, len: u64) -> Result<usize, PilError> {
    usize::try_from(len).map_err(|_| PilError::MapFailed { paddr, size: len })
}

/// Zero `range`, mapping at most [`IOMAP_SIZE`] bytes at a time.
pub(crate) fn zero_range(
    mapper: &dyn MemoryMapper,
    range: PhysRange,
    attrs: MapAttrs,
) -> Result<(), PilError> {
    let mut paddr = range.addr;
    let mut count = range.size;
    while count > 0 {
        let chunk = count.min(IOMAP_SIZE);
        let mut buf = mapper.map(paddr, map_len(paddr, chunk)?, attrs)?;
        buf.as_mut_slice().fill(0);
        drop(buf);
        count -= chunk;
        paddr += chunk;
    }
    Ok(())
}

/// Everything a worker needs to load a segment on its own.
#[derive(Clone)]
pub struct SegmentLoader {
    name: Arc<str>,
    fw_name: Arc<str>,
    firmware: Arc<dyn FirmwareSource>,
    barrier: Arc<SuspendBarrier>,
    mapper: Arc<dyn MemoryMapper>,
    ops: Arc<dyn DomainOps>,
    caps: Capabilities,
    attrs: MapAttrs,
}

impl SegmentLoader {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: &str,
        fw_name: &str,
        firmware: Arc<dyn FirmwareSource>,
        barrier: Arc<SuspendBarrier>,
        mapper: Arc<dyn MemoryMapper>,
        ops: Arc<dyn DomainOps>,
        caps: Capabilities,
        attrs: MapAttrs,
    ) -> Self {
        Self {
            name: name.into(),
            fw_name: fw_name.into(),
            firmware,
            barrier,
            mapper,
            ops,
            caps,
            attrs,
        }
    }

    pub fn blob_name(&self, seg: &Segment) -> String {
        format!("{}.b{:02}", self.fw_name, seg.num)
    }

    /// Load one segment: blob bytes, zeroed tail, then optional verification.
    pub fn load_segment(&self, seg: &Segment) -> Result<(), PilError> {
        let name = &*self.name;
        if seg.file_size > 0 {
            let blob = self.blob_name(seg);
            let len = map_len(seg.paddr, seg.file_size)?;
            let read = {
                let mut buf = self.mapper.map(seg.paddr, len, self.attrs).map_err(|e| {
                    error!("{name}: failed to map memory for firmware buffer");
                    e
                })?;
                let _fetch = self.barrier.read();
                self.firmware.request_into(&blob, buf.as_mut_slice())
            };
            let read = read.map_err(|source| {
                let err = PilError::Blob {
                    name: blob.clone(),
                    source,
                };
                error!("{name}: {err} (rc:{})", err.errno());
                err
            })?;
            if read as u64 != seg.file_size {
                let err = PilError::SizeMismatch {
                    name: blob,
                    expected: seg.file_size,
                    actual: read as u64,
                };
                error!("{name}: {err}");
                return Err(err);
            }
            debug!("{name}: loaded {} at {:#x}", self.blob_name(seg), seg.paddr);
        }

        let tail = PhysRange::new(seg.paddr + seg.file_size, seg.size - seg.file_size);
        zero_range(&*self.mapper, tail, self.attrs).map_err(|e| {
            error!("{name}: failed to map memory");
            e
        })?;

        if self.caps.contains(Capabilities::VERIFY_BLOB) {
            if let Err(e) = self.ops.verify_blob(PhysRange::new(seg.paddr, seg.size)) {
                error!("{name}: blob{} failed verification({e})", seg.num);
                return Err(PilError::CallbackFailed {
                    op: "verify_blob",
                    rc: e.0,
                });
            }
        }
        Ok(())
    }

    /// Load every segment, in parallel when a work queue is supplied.
    ///
    /// Waits for all segments before looking at any result.
    pub fn load_all(&self, segments: &[Segment], wq: Option<&WorkQueue>) -> Result<(), PilError> {
        let outcomes: Vec<Result<(), PilError>> = match wq {
            Some(wq) => {
                let pending: Vec<_> = segments
                    .iter()
                    .map(|seg| {
                        let loader = self.clone();
                        let seg = *seg;
                        wq.queue(move || loader.load_segment(&seg))
                    })
                    .collect();
                pending
                    .into_iter()
                    .map(|w| w.flush().unwrap_or(Err(PilError::WorkerLost)))
                    .collect()
            }
            None => segments.iter().map(|seg| self.load_segment(seg)).collect(),
        };

        let mut failed = FailureMap::new(segments.len());
        for (idx, outcome) in outcomes.iter().enumerate() {
            if let Err(e) = outcome {
                error!(
                    "{}: failed to load the segment[{idx}]. ret = {}",
                    self.name,
                    e.errno()
                );
                failed.set(idx);
            }
        }
        if failed.is_empty() {
            Ok(())
        } else {
            Err(PilError::AggregateLoadFault {
                failed: failed.indices(),
            })
        }
    }
}
