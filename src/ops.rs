// CLASSIFICATION: COMMUNITY
// Filename: ops.rs v0.1
// Author: Lukas Bower
// Date Modified: 2027-09-02

//! Processor-specific operations supplied by each driver.

use bitflags::bitflags;
use thiserror::Error;

use crate::memory::PhysRange;

bitflags! {
    /// Optional operations a driver implements.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct Capabilities: u32 {
        const PROXY_VOTE = 1 << 0;
        const PROXY_UNVOTE = 1 << 1;
        const INIT_IMAGE = 1 << 2;
        const MEM_SETUP = 1 << 3;
        const SHUTDOWN = 1 << 4;
        const DEINIT_IMAGE = 1 << 5;
        const VERIFY_BLOB = 1 << 6;
    }
}

/// Return code of a failed driver operation.
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
#[error("rc:{0}")]
pub struct OpError(pub i32);

pub type OpResult = Result<(), OpError>;

/// Reset, power and authentication sequences for one processor.
///
/// Only `auth_and_reset` is mandatory. The others are called only when the
/// matching [`Capabilities`] bit is reported.
pub trait DomainOps: Send + Sync {
    fn capabilities(&self) -> Capabilities;

    fn proxy_vote(&self) -> OpResult {
        Ok(())
    }

    fn proxy_unvote(&self) {}

    /// Hand the segment table blob to the authenticator.
    fn init_image(&self, _metadata: &[u8]) -> OpResult {
        Ok(())
    }

    /// Set up the memory protection mapping for the region.
    fn mem_setup(&self, _region: PhysRange) -> OpResult {
        Ok(())
    }

    fn auth_and_reset(&self) -> OpResult;

    fn shutdown(&self) -> OpResult {
        Ok(())
    }

    fn deinit_image(&self) -> OpResult {
        Ok(())
    }

    fn verify_blob(&self, _segment: PhysRange) -> OpResult {
        Ok(())
    }
}

/// Capabilities after dropping combinations that make no sense.
pub(crate) fn effective_capabilities(name: &str, caps: Capabilities) -> Capabilities {
    if caps.contains(Capabilities::PROXY_UNVOTE) && !caps.contains(Capabilities::PROXY_VOTE) {
        log::warn!("{name}: invalid proxy voting, ignoring unvote");
        return caps - Capabilities::PROXY_UNVOTE;
    }
    caps
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unvote_without_vote_is_dropped() {
        let caps = effective_capabilities("venus", Capabilities::PROXY_UNVOTE | Capabilities::SHUTDOWN);
        assert_eq!(caps, Capabilities::SHUTDOWN);
        let both = Capabilities::PROXY_VOTE | Capabilities::PROXY_UNVOTE;
        assert_eq!(effective_capabilities("venus", both), both);
    }
}
