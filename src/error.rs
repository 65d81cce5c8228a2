// CLASSIFICATION: COMMUNITY
// Filename: error.rs v0.1
// Author: Lukas Bower
// Date Modified: 2027-09-02

//! Error taxonomy shared by every loader component.

use thiserror::Error;

use crate::firmware::BlobError;
use crate::notify::NotifyError;

pub const EPERM: i32 = 1;
pub const ENOENT: i32 = 2;
pub const EIO: i32 = 5;
pub const ENOMEM: i32 = 12;
pub const EFAULT: i32 = 14;
pub const EBUSY: i32 = 16;
pub const ENODEV: i32 = 19;
pub const EINVAL: i32 = 22;
pub const EFBIG: i32 = 27;
pub const ENOSPC: i32 = 28;
pub const ETIME: i32 = 62;
pub const EADDRNOTAVAIL: i32 = 99;

/// Errors reported by boot, shutdown, planning and dump operations.
#[derive(Debug, Error)]
pub enum PilError {
    #[error("malformed image: {0}")]
    MalformedImage(String),
    #[error("can't reuse memory region, too small (have {have:#x}, need {need:#x})")]
    RegionTooSmall { have: u64, need: u64 },
    #[error("no memory region associated")]
    NoMemoryRegion,
    #[error("entry address {0:#x} not within range")]
    EntryOutOfRange(u64),
    #[error("failed to locate blob {name} or blob is too big: {source}")]
    Blob {
        name: String,
        #[source]
        source: BlobError,
    },
    #[error("blob {name} size {actual:#x} doesn't match {expected:#x}")]
    SizeMismatch {
        name: String,
        expected: u64,
        actual: u64,
    },
    #[error("failed to map {size:#x} bytes at {paddr:#x}")]
    MapFailed { paddr: u64, size: u64 },
    #[error("assigning {size:#x} bytes at {addr:#x} to vmid {vmid} failed (rc:{rc})")]
    DomainTransferFailed {
        addr: u64,
        size: u64,
        vmid: u32,
        rc: i32,
    },
    #[error("assigning {size:#x} bytes at {addr:#x} away from vmid {vmid} failed (rc:{rc}), owner unknown")]
    DomainTransferFatal {
        addr: u64,
        size: u64,
        vmid: u32,
        rc: i32,
    },
    #[error("{op} failed (rc:{rc})")]
    CallbackFailed { op: &'static str, rc: i32 },
    #[error("{} segment(s) failed to load: {failed:?}", failed.len())]
    AggregateLoadFault { failed: Vec<usize> },
    #[error("load state notification failed: {0}")]
    Notify(#[from] NotifyError),
    #[error("minidump table not ready")]
    MinidumpNotReady,
    #[error("no dump device")]
    NoDumpDevice,
    #[error("dump writer failed (rc:{0})")]
    DumpFailed(i32),
    #[error("no free instance ids")]
    IdsExhausted,
    #[error("worker exited before finishing its segment")]
    WorkerLost,
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl PilError {
    /// Negative errno-style code reported to callers and logs.
    pub fn errno(&self) -> i32 {
        let code = match self {
            PilError::MalformedImage(_) => EIO,
            PilError::RegionTooSmall { .. } | PilError::NoMemoryRegion => ENOMEM,
            PilError::EntryOutOfRange(_) => EADDRNOTAVAIL,
            PilError::Blob { source, .. } => match source {
                BlobError::NotFound => ENOENT,
                BlobError::TooLarge { .. } => EFBIG,
                BlobError::Io(_) => EIO,
            },
            PilError::SizeMismatch { .. } => EPERM,
            PilError::MapFailed { .. } => ENOMEM,
            PilError::DomainTransferFailed { rc, .. }
            | PilError::DomainTransferFatal { rc, .. }
            | PilError::CallbackFailed { rc, .. } => return -rc.abs(),
            PilError::AggregateLoadFault { .. } => EFAULT,
            PilError::Notify(NotifyError::Timeout) => ETIME,
            PilError::Notify(NotifyError::Failed(rc)) => return -rc.abs(),
            PilError::MinidumpNotReady => EINVAL,
            PilError::NoDumpDevice => ENODEV,
            PilError::DumpFailed(rc) => return -rc.abs(),
            PilError::IdsExhausted => ENOSPC,
            PilError::WorkerLost => EFAULT,
            PilError::Config(_) => EINVAL,
        };
        -code
    }

    pub(crate) fn malformed(msg: impl Into<String>) -> Self {
        PilError::MalformedImage(msg.into())
    }
}

pub type PilResult<T> = Result<T, PilError>;
