// CLASSIFICATION: COMMUNITY
// Filename: mod.rs v0.1
// Author: Lukas Bower
// Date Modified: 2027-09-02

#![allow(dead_code)]

use std::sync::Arc;

use pil::config::{InstanceConfig, LoaderConfig, ReservedRegion};
use pil::firmware::{FirmwareSource, MemFirmware};
use pil::memory::RamMemory;
use pil::notify::RestartHook;
use pil::testing::{MdtBuilder, MockHypervisor, MockMailbox, PhdrSpec, RecordingRestart};
use pil::{LoaderRegistry, Platform};

pub const BASE: u64 = 0x8b00_0000;
pub const REGION_SIZE: usize = 0x10_0000;
pub const VMID: u32 = 22;

pub struct Rig {
    pub fw: Arc<MemFirmware>,
    pub ram: Arc<RamMemory>,
    pub hyp: Arc<MockHypervisor>,
    pub mailbox: Arc<MockMailbox>,
    pub restart: Arc<RecordingRestart>,
    pub registry: Arc<LoaderRegistry>,
}

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn rig() -> Rig {
    rig_with(LoaderConfig::default())
}

pub fn rig_with(config: LoaderConfig) -> Rig {
    rig_with_banks(config, &[])
}

/// Rig with RAM banks beyond the reserved region, present before the
/// registry reads its shared tables.
pub fn rig_with_banks(config: LoaderConfig, banks: &[(u64, usize)]) -> Rig {
    rig_prepared(config, banks, |_| {})
}

/// Like [`rig_with_banks`], with `prepare` writing RAM before the registry
/// is created.
pub fn rig_prepared(config: LoaderConfig, banks: &[(u64, usize)], prepare: impl FnOnce(&RamMemory)) -> Rig {
    let fw = Arc::new(MemFirmware::new());
    build(config, fw.clone(), fw, banks, prepare)
}

/// Build a rig whose registry fetches from `source`. `fw` stays available
/// for tests that stage blobs in memory.
pub fn rig_on(config: LoaderConfig, fw: Arc<MemFirmware>, source: Arc<dyn FirmwareSource>) -> Rig {
    build(config, fw, source, &[], |_| {})
}

fn build(
    config: LoaderConfig,
    fw: Arc<MemFirmware>,
    source: Arc<dyn FirmwareSource>,
    banks: &[(u64, usize)],
    prepare: impl FnOnce(&RamMemory),
) -> Rig {
    init_logging();
    let ram = Arc::new(RamMemory::new().with_bank(BASE, REGION_SIZE));
    for (base, size) in banks {
        ram.add_bank(*base, *size);
    }
    prepare(&ram);
    let hyp = Arc::new(MockHypervisor::new());
    let mailbox = Arc::new(MockMailbox::new());
    let restart = Arc::new(RecordingRestart::default());
    let registry = LoaderRegistry::new(
        &config,
        Platform {
            firmware: source,
            memory: ram.clone(),
            hypervisor: hyp.clone(),
            mailbox: Some(mailbox.clone()),
            restart: Some(restart.clone() as Arc<dyn RestartHook>),
        },
    )
    .unwrap();
    Rig {
        fw,
        ram,
        hyp,
        mailbox,
        restart,
        registry,
    }
}

/// Relocatable image of `count` 4K segments, each carrying 0x20 bytes.
pub fn relocatable_mdt(count: u32) -> Vec<u8> {
    (0..count)
        .fold(MdtBuilder::new(0x100), |b, i| {
            b.segment(PhdrSpec::load(i * 0x1000, 0x20, 0x1000).relocatable())
        })
        .build()
}

/// Stage `<name>.mdt` plus one 0x20-byte blob per segment, filled with
/// `0xa0 + index`.
pub fn stage(fw: &MemFirmware, name: &str, count: u32) {
    fw.insert(&format!("{name}.mdt"), relocatable_mdt(count));
    for i in 0..count {
        fw.insert(&format!("{name}.b{i:02}"), vec![0xa0 + i as u8; 0x20]);
    }
}

pub fn config(name: &str) -> InstanceConfig {
    let mut cfg = InstanceConfig::new(name);
    cfg.subsys_vmid = Some(VMID);
    cfg.signal_aop = true;
    cfg.memory_region = Some(ReservedRegion {
        base: BASE,
        size: REGION_SIZE as u64,
    });
    cfg
}
