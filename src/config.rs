// CLASSIFICATION: COMMUNITY
// Filename: config.rs v0.2
// Author: Lukas Bower
// Date Modified: 2027-09-02

//! Loader configuration loaded from TOML.
//!
//! ```toml
//! proxy_timeout_ms = -1
//! workers = 4
//! minidump_toc = 0x8660_0000
//!
//! [[instance]]
//! name = "modem"
//! fw_name = "modem"
//! subsys_vmid = 15
//! proxy_timeout_ms = 10000
//! memory_region = { base = 0x8b00_0000, size = 0x0600_0000 }
//! ```

use std::fs;
use std::path::Path;

use serde::Deserialize;

use crate::error::PilError;

/// Platform-reserved physical window handed to the region planner.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
pub struct ReservedRegion {
    pub base: u64,
    pub size: u64,
}

/// Base and size of a shared memory window.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
pub struct Window {
    pub base: u64,
    pub size: u64,
}

fn default_proxy_timeout() -> i64 {
    -1
}

/// Settings shared by every loader instance.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct LoaderConfig {
    /// -1 uses each instance's timeout, 0 holds votes until shutdown,
    /// anything else overrides the timeout in milliseconds.
    #[serde(default = "default_proxy_timeout")]
    pub proxy_timeout_ms: i64,
    pub disable_timeouts: bool,
    /// Size of the segment worker pool. Zero loads sequentially.
    pub workers: usize,
    pub imem_info: Option<Window>,
    pub imem_disable_timeout: Option<u64>,
    pub minidump_toc: Option<u64>,
    #[serde(rename = "instance")]
    pub instances: Vec<InstanceConfig>,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            proxy_timeout_ms: default_proxy_timeout(),
            disable_timeouts: false,
            workers: 4,
            imem_info: None,
            imem_disable_timeout: None,
            minidump_toc: None,
            instances: Vec::new(),
        }
    }
}

/// Per-processor settings.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct InstanceConfig {
    pub name: String,
    /// Firmware base name; `<fw_name>.mdt` and `<fw_name>.bNN` are fetched.
    pub fw_name: String,
    pub subsys_vmid: Option<u32>,
    pub proxy_timeout_ms: u64,
    pub proxy_unvote_irq: bool,
    pub minidump_id: Option<u32>,
    pub aux_minidump_ids: Vec<u32>,
    pub minidump_as_elf32: bool,
    pub sequential_loading: bool,
    pub skip_entry_check: bool,
    pub signal_aop: bool,
    pub memory_region: Option<ReservedRegion>,
}

impl InstanceConfig {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.into(),
            fw_name: name.into(),
            ..Self::default()
        }
    }

    /// Security domain of the processor, if it has one.
    pub fn vmid(&self) -> Option<u32> {
        self.subsys_vmid.filter(|v| *v > 0)
    }
}

impl LoaderConfig {
    pub fn from_toml_str(text: &str) -> Result<Self, PilError> {
        let cfg: LoaderConfig =
            toml::from_str(text).map_err(|e| PilError::Config(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Load and validate a configuration file.
    pub fn load(path: &Path) -> Result<Self, PilError> {
        let text = fs::read_to_string(path)
            .map_err(|e| PilError::Config(format!("{}: {e}", path.display())))?;
        Self::from_toml_str(&text)
    }

    fn validate(&self) -> Result<(), PilError> {
        if self.proxy_timeout_ms < -1 {
            return Err(PilError::Config(format!(
                "proxy_timeout_ms must be -1 or greater, got {}",
                self.proxy_timeout_ms
            )));
        }
        for inst in &self.instances {
            if inst.name.is_empty() || inst.fw_name.is_empty() {
                return Err(PilError::Config("instance needs name and fw_name".into()));
            }
            if inst.fw_name.len() > 24 {
                return Err(PilError::Config(format!("fw_name {} too long", inst.fw_name)));
            }
            if let Some(region) = inst.memory_region {
                if region.size == 0 || region.base.checked_add(region.size).is_none() {
                    return Err(PilError::Config(format!(
                        "{}: bad memory_region {:#x}+{:#x}",
                        inst.name, region.base, region.size
                    )));
                }
            }
        }
        Ok(())
    }
}
