// CLASSIFICATION: COMMUNITY
// Filename: firmware.rs v0.1
// Author: Lukas Bower
// Date Modified: 2027-09-02

//! Firmware blob sources and the suspend barrier that gates every fetch.

use std::collections::HashMap;
use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::{Condvar, Mutex, PoisonError};

use log::debug;
use thiserror::Error;

/// Why a blob could not be supplied.
#[derive(Debug, Error)]
pub enum BlobError {
    #[error("not found")]
    NotFound,
    #[error("blob is {size:#x} bytes, buffer holds {capacity:#x}")]
    TooLarge { size: u64, capacity: u64 },
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Storage backend supplying firmware blobs by name.
pub trait FirmwareSource: Send + Sync {
    fn request(&self, name: &str) -> Result<Vec<u8>, BlobError>;

    /// Copy the blob straight into `buf` and return its length.
    fn request_into(&self, name: &str, buf: &mut [u8]) -> Result<usize, BlobError> {
        let data = self.request(name)?;
        if data.len() > buf.len() {
            return Err(BlobError::TooLarge {
                size: data.len() as u64,
                capacity: buf.len() as u64,
            });
        }
        buf[..data.len()].copy_from_slice(&data);
        Ok(data.len())
    }
}

/// Blobs stored as files under one directory, e.g. `/lib/firmware`.
pub struct DirFirmware {
    root: PathBuf,
}

impl DirFirmware {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    fn open(&self, name: &str) -> Result<File, BlobError> {
        if name.contains('/') || name.starts_with('.') {
            return Err(BlobError::NotFound);
        }
        File::open(self.root.join(name)).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => BlobError::NotFound,
            _ => BlobError::Io(e),
        })
    }
}

impl FirmwareSource for DirFirmware {
    fn request(&self, name: &str) -> Result<Vec<u8>, BlobError> {
        let mut data = Vec::new();
        self.open(name)?.read_to_end(&mut data)?;
        debug!("firmware: read {name} ({} bytes)", data.len());
        Ok(data)
    }

    fn request_into(&self, name: &str, buf: &mut [u8]) -> Result<usize, BlobError> {
        let mut file = self.open(name)?;
        let size = file.metadata()?.len();
        if size > buf.len() as u64 {
            return Err(BlobError::TooLarge {
                size,
                capacity: buf.len() as u64,
            });
        }
        let len = size as usize;
        file.read_exact(&mut buf[..len])?;
        debug!("firmware: read {name} into buffer ({len} bytes)");
        Ok(len)
    }
}

/// In-memory blob store.
#[derive(Default)]
pub struct MemFirmware {
    blobs: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemFirmware {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, name: &str, data: impl Into<Vec<u8>>) {
        self.blobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.into(), data.into());
    }

    pub fn remove(&self, name: &str) {
        self.blobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name);
    }
}

impl FirmwareSource for MemFirmware {
    fn request(&self, name: &str) -> Result<Vec<u8>, BlobError> {
        self.blobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
            .ok_or(BlobError::NotFound)
    }
}

#[derive(Default)]
struct GateState {
    readers: usize,
    suspended: bool,
}

/// Reader/writer gate between blob fetches and system suspend.
///
/// Fetches hold the read side for their duration. The write side is taken by
/// [`suspend_prepare`](Self::suspend_prepare) and held until
/// [`post_suspend`](Self::post_suspend).
#[derive(Default)]
pub struct SuspendBarrier {
    state: Mutex<GateState>,
    changed: Condvar,
}

/// Read side of the [`SuspendBarrier`], released on drop.
pub struct FetchGuard<'a> {
    barrier: &'a SuspendBarrier,
}

impl SuspendBarrier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Block while a suspend transition is in progress, then enter.
    pub fn read(&self) -> FetchGuard<'_> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        while state.suspended {
            state = self
                .changed
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
        state.readers += 1;
        FetchGuard { barrier: self }
    }

    /// Stop new fetches and wait for in-flight ones to finish.
    pub fn suspend_prepare(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        while state.suspended {
            state = self
                .changed
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
        state.suspended = true;
        while state.readers > 0 {
            state = self
                .changed
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
        debug!("firmware: fetches blocked for suspend");
    }

    /// Let fetches run again.
    pub fn post_suspend(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.suspended {
            state.suspended = false;
            self.changed.notify_all();
            debug!("firmware: fetches resumed");
        }
    }

    pub fn is_suspended(&self) -> bool {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .suspended
    }
}

impl Drop for FetchGuard<'_> {
    fn drop(&mut self) {
        let mut state = self
            .barrier
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        state.readers -= 1;
        self.barrier.changed.notify_all();
    }
}
