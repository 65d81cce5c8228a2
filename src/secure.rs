// CLASSIFICATION: COMMUNITY
// Filename: secure.rs v0.1
// Author: Lukas Bower
// Date Modified: 2027-09-02

//! Security domain transfer.
//!
//! Ownership of a physical range moves between the host and a processor's
//! domain through a privileged arbiter. Forward grants may fail and be
//! rolled back. Returning a range to a single domain may not: if that fails
//! nobody knows who owns the memory, so the process stops.

use bitflags::bitflags;
use log::error;

use crate::error::PilError;
use crate::memory::PhysRange;

/// Virtual machine id of a security domain.
pub type Vmid = u32;

/// The host's own domain.
pub const VMID_HLOS: Vmid = 0x3;

bitflags! {
    /// Access granted to a destination domain.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct Perm: u32 {
        const EXEC = 0x1;
        const WRITE = 0x2;
        const READ = 0x4;
    }
}

/// Privileged arbitration layer.
pub trait Hypervisor: Send + Sync {
    /// Move `range` from the `src` domains to the `dest` domains.
    /// Returns the arbiter's error code on failure.
    fn assign(&self, range: PhysRange, src: &[Vmid], dest: &[(Vmid, Perm)]) -> Result<(), i32>;
}

/// Domain transfers on behalf of one loader instance.
pub struct DomainTransfer<'a> {
    hyp: &'a dyn Hypervisor,
    name: &'a str,
    vmid: Vmid,
}

impl<'a> DomainTransfer<'a> {
    pub fn new(hyp: &'a dyn Hypervisor, name: &'a str, vmid: Vmid) -> Self {
        Self { hyp, name, vmid }
    }

    pub fn vmid(&self) -> Vmid {
        self.vmid
    }

    fn fatal(&self, range: PhysRange, rc: i32) -> ! {
        let err = PilError::DomainTransferFatal {
            addr: range.addr,
            size: range.size,
            vmid: self.vmid,
            rc,
        };
        error!("{}: {err}", self.name);
        panic!("{}: {err}. Fatal error.", self.name);
    }

    /// Host to processor domain, read/write.
    pub fn to_subsystem(&self, range: PhysRange) -> Result<(), PilError> {
        self.hyp
            .assign(range, &[VMID_HLOS], &[(self.vmid, Perm::READ | Perm::WRITE)])
            .map_err(|rc| self.failed(range, rc))
    }

    /// Processor domain back to the host, read/write/execute.
    pub fn to_host(&self, range: PhysRange) {
        let dest = [(VMID_HLOS, Perm::READ | Perm::WRITE | Perm::EXEC)];
        if let Err(rc) = self.hyp.assign(range, &[self.vmid], &dest) {
            self.fatal(range, rc);
        }
    }

    /// Host to host + processor, both read/write, for load-time verification.
    pub fn to_subsystem_and_host(&self, range: PhysRange) -> Result<(), PilError> {
        let rw = Perm::READ | Perm::WRITE;
        self.hyp
            .assign(range, &[VMID_HLOS], &[(VMID_HLOS, rw), (self.vmid, rw)])
            .map_err(|rc| self.failed(range, rc))
    }

    /// Collapse a host + processor grant onto `target` alone.
    pub fn reclaim(&self, range: PhysRange, target: Vmid) {
        let perm = if target == VMID_HLOS {
            Perm::READ | Perm::WRITE | Perm::EXEC
        } else {
            Perm::READ | Perm::WRITE
        };
        if let Err(rc) = self
            .hyp
            .assign(range, &[VMID_HLOS, self.vmid], &[(target, perm)])
        {
            self.fatal(range, rc);
        }
    }

    fn failed(&self, range: PhysRange, rc: i32) -> PilError {
        let err = PilError::DomainTransferFailed {
            addr: range.addr,
            size: range.size,
            vmid: self.vmid,
            rc,
        };
        error!("{}: {err}", self.name);
        err
    }
}
