// CLASSIFICATION: COMMUNITY
// Filename: testing.rs v0.2
// Author: Lukas Bower
// Date Modified: 2027-09-02

//! Builders and recording collaborators for unit and integration tests.
//!
//! Every mock records what the loader asked of it so tests can assert on the
//! exact sequence of domain transfers, callbacks and messages.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::image::{ELF32_HEADER_SIZE, ELF32_PHDR_SIZE, PF_RELOCATABLE};
use crate::memory::PhysRange;
use crate::notify::{Mailbox, NotifyError, RestartHook};
use crate::ops::{Capabilities, DomainOps, OpError, OpResult};
use crate::proxy::IrqLine;
use crate::ramdump::{DumpSegment, DumpWriter, MinidumpFormat};
use crate::secure::{Hypervisor, Perm, Vmid, VMID_HLOS};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

const PT_LOAD: u32 = 1;
const HASH_FLAGS: u32 = 0x2 << 24;

/// One program header for [`MdtBuilder`].
#[derive(Clone, Copy, Debug)]
pub struct PhdrSpec {
    kind: u32,
    flags: u32,
    paddr: u32,
    file_size: u32,
    mem_size: u32,
    align: u32,
}

impl PhdrSpec {
    pub fn load(paddr: u32, file_size: u32, mem_size: u32) -> Self {
        Self {
            kind: PT_LOAD,
            flags: 0x5,
            paddr,
            file_size,
            mem_size,
            align: 0x1000,
        }
    }

    /// Hash/signature segment: loadable type, never loaded.
    pub fn hash(size: u32) -> Self {
        Self {
            flags: HASH_FLAGS,
            ..Self::load(0, size, size)
        }
    }

    pub fn relocatable(mut self) -> Self {
        self.flags |= PF_RELOCATABLE;
        self
    }

    pub fn align(mut self, align: u64) -> Self {
        self.align = align as u32;
        self
    }

    /// Override the program header type.
    pub fn kind(mut self, kind: u32) -> Self {
        self.kind = kind;
        self
    }
}

/// Builds ELF32 little-endian segment tables.
#[derive(Clone, Debug)]
pub struct MdtBuilder {
    entry: u32,
    segments: Vec<PhdrSpec>,
}

impl MdtBuilder {
    pub fn new(entry: u32) -> Self {
        Self {
            entry,
            segments: Vec::new(),
        }
    }

    pub fn segment(mut self, spec: PhdrSpec) -> Self {
        self.segments.push(spec);
        self
    }

    pub fn build(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(ELF32_HEADER_SIZE + self.segments.len() * ELF32_PHDR_SIZE);
        out.extend_from_slice(&[0x7f, b'E', b'L', b'F', 1, 1, 1, 0]);
        out.extend_from_slice(&[0; 8]);
        out.extend_from_slice(&2u16.to_le_bytes()); // ET_EXEC
        out.extend_from_slice(&164u16.to_le_bytes()); // EM_HEXAGON
        out.extend_from_slice(&1u32.to_le_bytes());
        out.extend_from_slice(&self.entry.to_le_bytes());
        out.extend_from_slice(&(ELF32_HEADER_SIZE as u32).to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes()); // e_shoff
        out.extend_from_slice(&0u32.to_le_bytes()); // e_flags
        out.extend_from_slice(&(ELF32_HEADER_SIZE as u16).to_le_bytes());
        out.extend_from_slice(&(ELF32_PHDR_SIZE as u16).to_le_bytes());
        out.extend_from_slice(&(self.segments.len() as u16).to_le_bytes());
        out.extend_from_slice(&40u16.to_le_bytes());
        out.extend_from_slice(&0u16.to_le_bytes());
        out.extend_from_slice(&0u16.to_le_bytes());
        for seg in &self.segments {
            for word in [
                seg.kind,
                0,
                seg.paddr,
                seg.paddr,
                seg.file_size,
                seg.mem_size,
                seg.flags,
                seg.align,
            ] {
                out.extend_from_slice(&word.to_le_bytes());
            }
        }
        out
    }
}

/// One recorded arbiter request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HypCall {
    pub range: PhysRange,
    pub src: Vec<Vmid>,
    pub dest: Vec<Vmid>,
    pub perms: Vec<Perm>,
}

/// Arbiter that records every assignment and fails on request.
///
/// Like the real arbiter it tracks which domains own each range. A range
/// starts out owned by the host, and an assignment whose sources are not
/// exactly the current owners is rejected with `EPERM`.
#[derive(Default)]
pub struct MockHypervisor {
    calls: Mutex<Vec<HypCall>>,
    failures: Mutex<HashMap<usize, i32>>,
    owners: Mutex<HashMap<PhysRange, Vec<Vmid>>>,
}

impl MockHypervisor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next call with `rc`.
    pub fn fail_next(&self, rc: i32) {
        let next = lock(&self.calls).len();
        self.fail_call(next, rc);
    }

    /// Fail the `n`th call (zero-based, counting every call) with `rc`.
    pub fn fail_call(&self, n: usize, rc: i32) {
        lock(&self.failures).insert(n, rc);
    }

    pub fn calls(&self) -> Vec<HypCall> {
        lock(&self.calls).clone()
    }

    /// Calls whose only destination is `vmid`.
    pub fn calls_to(&self, vmid: Vmid) -> Vec<HypCall> {
        self.calls()
            .into_iter()
            .filter(|c| c.dest == [vmid])
            .collect()
    }

    /// Current owners of `range`, sorted.
    pub fn owners(&self, range: PhysRange) -> Vec<Vmid> {
        lock(&self.owners)
            .get(&range)
            .cloned()
            .unwrap_or_else(|| vec![VMID_HLOS])
    }
}

fn sorted(vmids: impl IntoIterator<Item = Vmid>) -> Vec<Vmid> {
    let mut v: Vec<Vmid> = vmids.into_iter().collect();
    v.sort_unstable();
    v.dedup();
    v
}

impl Hypervisor for MockHypervisor {
    fn assign(&self, range: PhysRange, src: &[Vmid], dest: &[(Vmid, Perm)]) -> Result<(), i32> {
        let mut calls = lock(&self.calls);
        let n = calls.len();
        calls.push(HypCall {
            range,
            src: src.to_vec(),
            dest: dest.iter().map(|(v, _)| *v).collect(),
            perms: dest.iter().map(|(_, p)| *p).collect(),
        });
        drop(calls);
        if let Some(rc) = lock(&self.failures).remove(&n) {
            return Err(rc);
        }
        let mut owners = lock(&self.owners);
        let current = owners.entry(range).or_insert_with(|| vec![VMID_HLOS]);
        if *current != sorted(src.iter().copied()) {
            return Err(-1);
        }
        *current = sorted(dest.iter().map(|(v, _)| *v));
        Ok(())
    }
}

/// Mailbox that keeps every message.
#[derive(Default)]
pub struct MockMailbox {
    sent: Mutex<Vec<String>>,
    fail: Mutex<Option<NotifyError>>,
}

impl MockMailbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail every send from now on.
    pub fn fail_with(&self, err: NotifyError) {
        *lock(&self.fail) = Some(err);
    }

    pub fn clear_failure(&self) {
        *lock(&self.fail) = None;
    }

    pub fn messages(&self) -> Vec<String> {
        lock(&self.sent).clone()
    }
}

impl Mailbox for MockMailbox {
    fn send(&self, msg: &str) -> Result<(), NotifyError> {
        lock(&self.sent).push(msg.to_string());
        match *lock(&self.fail) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[derive(Default)]
pub struct RecordingRestart {
    count: AtomicUsize,
}

impl RecordingRestart {
    pub fn count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }
}

impl RestartHook for RecordingRestart {
    fn force_restart(&self, _reason: &str) {
        self.count.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
struct OpsLog {
    calls: Vec<&'static str>,
    failures: HashMap<&'static str, i32>,
    verified: Vec<PhysRange>,
    mem_setup: Vec<PhysRange>,
    metadata: Vec<Vec<u8>>,
}

/// Driver operations that record each call by name.
pub struct MockOps {
    caps: Capabilities,
    log: Mutex<OpsLog>,
}

impl Default for MockOps {
    fn default() -> Self {
        Self::new()
    }
}

impl MockOps {
    pub fn new() -> Self {
        Self {
            caps: Capabilities::empty(),
            log: Mutex::new(OpsLog::default()),
        }
    }

    /// Every optional operation implemented.
    pub fn full() -> Self {
        Self::new().with_caps(Capabilities::all())
    }

    pub fn with_caps(mut self, caps: Capabilities) -> Self {
        self.caps = caps;
        self
    }

    /// Make `op` fail with `rc` until [`clear`](Self::clear) is called.
    pub fn fail(&self, op: &'static str, rc: i32) {
        lock(&self.log).failures.insert(op, rc);
    }

    pub fn clear(&self, op: &'static str) {
        lock(&self.log).failures.remove(op);
    }

    pub fn calls(&self) -> Vec<&'static str> {
        lock(&self.log).calls.clone()
    }

    pub fn count(&self, op: &str) -> usize {
        lock(&self.log).calls.iter().filter(|c| **c == op).count()
    }

    pub fn verified(&self) -> Vec<PhysRange> {
        lock(&self.log).verified.clone()
    }

    pub fn mem_setup_ranges(&self) -> Vec<PhysRange> {
        lock(&self.log).mem_setup.clone()
    }

    pub fn metadata(&self) -> Vec<Vec<u8>> {
        lock(&self.log).metadata.clone()
    }

    fn record(&self, op: &'static str) -> OpResult {
        let mut log = lock(&self.log);
        log.calls.push(op);
        match log.failures.get(op) {
            Some(rc) => Err(OpError(*rc)),
            None => Ok(()),
        }
    }
}

impl DomainOps for MockOps {
    fn capabilities(&self) -> Capabilities {
        self.caps
    }

    fn proxy_vote(&self) -> OpResult {
        self.record("proxy_vote")
    }

    fn proxy_unvote(&self) {
        let _ = self.record("proxy_unvote");
    }

    fn init_image(&self, metadata: &[u8]) -> OpResult {
        lock(&self.log).metadata.push(metadata.to_vec());
        self.record("init_image")
    }

    fn mem_setup(&self, region: PhysRange) -> OpResult {
        lock(&self.log).mem_setup.push(region);
        self.record("mem_setup")
    }

    fn auth_and_reset(&self) -> OpResult {
        self.record("auth_and_reset")
    }

    fn shutdown(&self) -> OpResult {
        self.record("shutdown")
    }

    fn deinit_image(&self) -> OpResult {
        self.record("deinit_image")
    }

    fn verify_blob(&self, segment: PhysRange) -> OpResult {
        lock(&self.log).verified.push(segment);
        self.record("verify_blob")
    }
}

/// Interrupt line that tracks its enable state.
#[derive(Default)]
pub struct MockIrq {
    enabled: AtomicBool,
    enables: AtomicUsize,
    disables: AtomicUsize,
}

impl MockIrq {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn enables(&self) -> usize {
        self.enables.load(Ordering::SeqCst)
    }

    pub fn disables(&self) -> usize {
        self.disables.load(Ordering::SeqCst)
    }
}

impl IrqLine for MockIrq {
    fn enable(&self) {
        self.enabled.store(true, Ordering::SeqCst);
        self.enables.fetch_add(1, Ordering::SeqCst);
    }

    fn disable(&self) {
        self.enabled.store(false, Ordering::SeqCst);
        self.disables.fetch_add(1, Ordering::SeqCst);
    }
}

/// A dump segment as the writer saw it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DumpedSegment {
    pub name: Option<String>,
    pub address: u64,
    pub size: u64,
    pub bytes: Option<Vec<u8>>,
}

/// Which writer entry point was used.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DumpKind {
    Elf,
    Minidump(MinidumpFormat),
}

/// Dump writer that snapshots what it is handed.
#[derive(Default)]
pub struct RecordingDumpWriter {
    dumps: Mutex<Vec<(DumpKind, Vec<DumpedSegment>)>>,
    fail: Mutex<Option<i32>>,
}

impl RecordingDumpWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_with(&self, rc: i32) {
        *lock(&self.fail) = Some(rc);
    }

    pub fn dumps(&self) -> Vec<(DumpKind, Vec<DumpedSegment>)> {
        lock(&self.dumps).clone()
    }

    fn record(&self, kind: DumpKind, segs: &[DumpSegment<'_>]) -> Result<(), i32> {
        let snap = segs
            .iter()
            .map(|s| DumpedSegment {
                name: s.name.clone(),
                address: s.address,
                size: s.size,
                bytes: s.bytes().map(<[u8]>::to_vec),
            })
            .collect();
        lock(&self.dumps).push((kind, snap));
        match *lock(&self.fail) {
            Some(rc) => Err(rc),
            None => Ok(()),
        }
    }
}

impl DumpWriter for RecordingDumpWriter {
    fn write_elf(&self, segments: &[DumpSegment<'_>]) -> Result<(), i32> {
        self.record(DumpKind::Elf, segments)
    }

    fn write_minidump(&self, segments: &[DumpSegment<'_>], format: MinidumpFormat) -> Result<(), i32> {
        self.record(DumpKind::Minidump(format), segments)
    }
}
