// CLASSIFICATION: COMMUNITY
// Filename: lib.rs v2.0
// Date Modified: 2027-09-02
// Author: Lukas Bower

//! Peripheral image loader.
//!
//! Loads, boots, dumps and shuts down firmware images for auxiliary
//! processors that share physical memory with the host.

/// Error taxonomy and errno mapping
pub mod error;

/// TOML configuration for the registry and its instances
pub mod config;

/// Physical memory mapping seam
pub mod memory;

/// Firmware blob sources and the suspend barrier
pub mod firmware;

/// Segment table parser
pub mod image;

/// Memory region planner
pub mod region;

/// Security domain transfer
pub mod secure;

/// Driver operations and capability flags
pub mod ops;

/// Load-state notifications
pub mod notify;

/// Worker pool for segment loads
pub mod workqueue;

/// Segment loader
pub mod loader;

/// Proxy power votes
pub mod proxy;

/// Minidump table of contents
pub mod minidump;

/// Image-info table
pub mod imem;

/// Loader registry
pub mod registry;

/// Loader instances
pub mod instance;

/// Boot orchestrator
pub mod boot;

/// Crash dump collector
pub mod ramdump;

/// Builders and mocks for tests
#[cfg(any(test, feature = "testing"))]
#[doc(hidden)]
pub mod testing;

pub use config::{InstanceConfig, LoaderConfig};
pub use error::{PilError, PilResult};
pub use instance::{BootPhase, InstanceParts, LoaderInstance};
pub use ops::{Capabilities, DomainOps, OpError, OpResult};
pub use ramdump::{DumpSegment, DumpWriter, MinidumpFormat};
pub use registry::{LoaderRegistry, Platform};
