// CLASSIFICATION: COMMUNITY
// Filename: memory.rs v0.1
// Author: Lukas Bower
// Date Modified: 2027-09-02

//! Physical memory mapping seam.
//!
//! The loader never dereferences physical addresses itself. It asks a
//! [`MemoryMapper`] for a temporary view of a range and drops the view to
//! unmap it. [`RamMemory`] is the generic mapper used on hosted builds and in
//! tests: a sparse set of RAM banks addressed physically.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};

use bitflags::bitflags;

use crate::error::PilError;

bitflags! {
    /// Attributes requested for a mapping.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct MapAttrs: u32 {
        const WRITE_COMBINE = 1 << 0;
        const NO_KERNEL_MAPPING = 1 << 1;
    }
}

/// A physical range owned logically by a loader instance.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct PhysRange {
    pub addr: u64,
    pub size: u64,
}

impl PhysRange {
    pub fn new(addr: u64, size: u64) -> Self {
        Self { addr, size }
    }

    pub fn end(&self) -> u64 {
        self.addr + self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }
}

/// A live view of physical memory. Dropping it unmaps the range.
pub trait MappedMemory: Send {
    fn paddr(&self) -> u64;
    fn as_slice(&self) -> &[u8];
    fn as_mut_slice(&mut self) -> &mut [u8];

    fn len(&self) -> usize {
        self.as_slice().len()
    }

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Map/unmap callback pair. Override per instance for special attributes.
pub trait MemoryMapper: Send + Sync {
    fn map(
        &self,
        paddr: u64,
        size: usize,
        attrs: MapAttrs,
    ) -> Result<Box<dyn MappedMemory + '_>, PilError>;
}

struct Bank {
    base: u64,
    data: Vec<u8>,
}

impl Bank {
    fn window(&self, paddr: u64, size: usize) -> Option<std::ops::Range<usize>> {
        let off = paddr.checked_sub(self.base)?;
        let off = usize::try_from(off).ok()?;
        let end = off.checked_add(size)?;
        (end <= self.data.len()).then_some(off..end)
    }
}

/// Sparse physical RAM model.
///
/// A mapping copies the range out on `map` and writes it back when dropped,
/// so disjoint ranges can be held by several workers at once.
#[derive(Default)]
pub struct RamMemory {
    banks: Mutex<Vec<Bank>>,
    live: AtomicUsize,
    total: AtomicUsize,
}

impl RamMemory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_bank(self, base: u64, size: usize) -> Self {
        self.add_bank(base, size);
        self
    }

    /// Add a zeroed bank of RAM at `base`.
    pub fn add_bank(&self, base: u64, size: usize) {
        let mut banks = self.banks.lock().unwrap_or_else(PoisonError::into_inner);
        banks.push(Bank {
            base,
            data: vec![0; size],
        });
    }

    /// Copy `len` bytes at `paddr` out of RAM.
    pub fn read(&self, paddr: u64, len: usize) -> Option<Vec<u8>> {
        let banks = self.banks.lock().unwrap_or_else(PoisonError::into_inner);
        banks
            .iter()
            .find_map(|b| b.window(paddr, len).map(|w| b.data[w].to_vec()))
    }

    /// Store `data` at `paddr`. Returns false if no bank holds the range.
    pub fn write(&self, paddr: u64, data: &[u8]) -> bool {
        let mut banks = self.banks.lock().unwrap_or_else(PoisonError::into_inner);
        for bank in banks.iter_mut() {
            if let Some(w) = bank.window(paddr, data.len()) {
                bank.data[w].copy_from_slice(data);
                return true;
            }
        }
        false
    }

    pub fn fill(&self, paddr: u64, len: usize, byte: u8) -> bool {
        self.write(paddr, &vec![byte; len])
    }

    /// Number of mappings currently held.
    pub fn live_mappings(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    /// Number of mappings ever created.
    pub fn total_mappings(&self) -> usize {
        self.total.load(Ordering::SeqCst)
    }
}

struct RamMapping<'a> {
    mem: &'a RamMemory,
    paddr: u64,
    buf: Vec<u8>,
    dirty: bool,
}

impl MappedMemory for RamMapping<'_> {
    fn paddr(&self) -> u64 {
        self.paddr
    }

    fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    fn as_mut_slice(&mut self) -> &mut [u8] {
        self.dirty = true;
        &mut self.buf
    }
}

impl Drop for RamMapping<'_> {
    fn drop(&mut self) {
        if self.dirty {
            self.mem.write(self.paddr, &self.buf);
        }
        self.mem.live.fetch_sub(1, Ordering::SeqCst);
    }
}

impl MemoryMapper for RamMemory {
    fn map(
        &self,
        paddr: u64,
        size: usize,
        _attrs: MapAttrs,
    ) -> Result<Box<dyn MappedMemory + '_>, PilError> {
        let buf = self.read(paddr, size).ok_or(PilError::MapFailed {
            paddr,
            size: size as u64,
        })?;
        self.live.fetch_add(1, Ordering::SeqCst);
        self.total.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(RamMapping {
            mem: self,
            paddr,
            buf,
            dirty: false,
        }))
    }
}

/// Little-endian field reads over memory written by another domain.
///
/// Every read is bounds checked; nothing is reinterpreted as a typed struct.
pub(crate) struct FieldReader<'a> {
    bytes: &'a [u8],
}

impl<'a> FieldReader<'a> {
    pub(crate) fn new(bytes: &'a [u8]) -> Self {
        Self { bytes }
    }

    fn field<const N: usize>(&self, off: usize) -> Option<[u8; N]> {
        let end = off.checked_add(N)?;
        self.bytes.get(off..end)?.try_into().ok()
    }

    pub(crate) fn u32(&self, off: usize) -> Option<u32> {
        self.field::<4>(off).map(u32::from_le_bytes)
    }

    pub(crate) fn u64(&self, off: usize) -> Option<u64> {
        self.field::<8>(off).map(u64::from_le_bytes)
    }

    /// NUL-terminated string of at most `len` bytes.
    pub(crate) fn name(&self, off: usize, len: usize) -> Option<String> {
        let raw = self.bytes.get(off..off.checked_add(len)?)?;
        let end = raw.iter().position(|b| *b == 0).unwrap_or(raw.len());
        Some(String::from_utf8_lossy(&raw[..end]).into_owned())
    }
}
