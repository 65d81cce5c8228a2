// CLASSIFICATION: COMMUNITY
// Filename: test_boot.rs v0.1
// Author: Lukas Bower
// Date Modified: 2027-09-02

mod common;

use std::fs;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use common::{config, rig, rig_on, rig_with_banks, stage, BASE, VMID};
use pil::config::{LoaderConfig, Window};
use pil::firmware::{DirFirmware, MemFirmware};
use pil::imem::IMAGE_INFO_SIZE;
use pil::notify::NotifyError;
use pil::registry::PIL_NUM_DESC;
use pil::secure::VMID_HLOS;
use pil::testing::MockOps;
use pil::{BootPhase, InstanceParts, PilError};
use tempfile::tempdir;

#[test]
fn boots_from_firmware_directory() {
    let dir = tempdir().unwrap();
    fs::write(dir.path().join("lpass.mdt"), common::relocatable_mdt(2)).unwrap();
    fs::write(dir.path().join("lpass.b00"), vec![0x11; 0x20]).unwrap();
    fs::write(dir.path().join("lpass.b01"), vec![0x22; 0x20]).unwrap();
    let rig = rig_on(
        LoaderConfig::default(),
        Arc::new(MemFirmware::new()),
        Arc::new(DirFirmware::new(dir.path())),
    );
    let ops = Arc::new(MockOps::full());
    let inst = rig
        .registry
        .register(config("lpass"), InstanceParts::new(ops.clone()))
        .unwrap();

    inst.boot().unwrap();
    assert_eq!(inst.phase(), BootPhase::Running);
    assert_eq!(inst.entry_addr(), BASE + 0x100);
    assert_eq!(rig.ram.read(BASE, 0x20).unwrap(), vec![0x11; 0x20]);
    assert_eq!(rig.ram.read(BASE + 0x20, 0x10).unwrap(), vec![0; 0x10]);
    assert_eq!(rig.ram.read(BASE + 0x1000, 0x20).unwrap(), vec![0x22; 0x20]);
    assert_eq!(ops.metadata(), vec![common::relocatable_mdt(2)]);
    assert_eq!(ops.mem_setup_ranges()[0].addr, BASE);
    assert_eq!(ops.mem_setup_ranges()[0].size, 0x2000);

    let calls = rig.hyp.calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[0].src, vec![VMID_HLOS]);
    assert_eq!(calls[0].dest, vec![VMID_HLOS, VMID]);
    assert_eq!(calls[1].src, vec![VMID_HLOS, VMID]);
    assert_eq!(calls[1].dest, vec![VMID]);
    assert_eq!(rig.ram.live_mappings(), 0);
}

#[test]
fn failed_segment_reports_aggregate_fault() {
    for sequential in [false, true] {
        let rig = rig();
        stage(&rig.fw, "lpass", 3);
        rig.fw.insert("lpass.b01", vec![0xee; 0x10]);
        let ops = Arc::new(MockOps::full());
        let mut cfg = config("lpass");
        cfg.sequential_loading = sequential;
        let inst = rig
            .registry
            .register(cfg, InstanceParts::new(ops.clone()))
            .unwrap();

        let err = inst.boot().unwrap_err();
        match err {
            PilError::AggregateLoadFault { failed } => assert_eq!(failed, vec![1]),
            other => panic!("unexpected error {other:?}"),
        }

        let mut verified: Vec<u64> = ops.verified().iter().map(|r| r.addr).collect();
        verified.sort_unstable();
        assert_eq!(verified, vec![BASE, BASE + 0x2000]);
        assert_eq!(ops.count("auth_and_reset"), 0);
        assert_eq!(ops.count("deinit_image"), 1);
        assert_eq!(ops.count("proxy_unvote"), 1);

        // Loaded segments are wiped with the rest of the region.
        assert_eq!(rig.ram.read(BASE, 0x20).unwrap(), vec![0; 0x20]);
        assert_eq!(rig.ram.read(BASE + 0x2000, 0x20).unwrap(), vec![0; 0x20]);
        assert!(!inst.region().allocated);
        assert!(inst.segments().is_empty());
        assert_eq!(inst.phase(), BootPhase::Idle);
    }
}

#[test]
fn load_failure_reclaims_to_host_once() {
    let rig = rig();
    stage(&rig.fw, "lpass", 2);
    rig.fw.remove("lpass.b00");
    let inst = rig
        .registry
        .register(config("lpass"), InstanceParts::new(Arc::new(MockOps::full())))
        .unwrap();

    assert!(matches!(
        inst.boot().unwrap_err(),
        PilError::AggregateLoadFault { .. }
    ));
    let to_host = rig.hyp.calls_to(VMID_HLOS);
    assert_eq!(to_host.len(), 1);
    assert_eq!(to_host[0].src, vec![VMID_HLOS, VMID]);
    assert_eq!(rig.hyp.calls().len(), 2);
}

#[test]
fn auth_failure_returns_memory_without_reclaim() {
    let rig = rig();
    stage(&rig.fw, "lpass", 1);
    let ops = Arc::new(MockOps::full());
    ops.fail("auth_and_reset", -13);
    let inst = rig
        .registry
        .register(config("lpass"), InstanceParts::new(ops.clone()))
        .unwrap();

    let err = inst.boot().unwrap_err();
    assert!(matches!(
        err,
        PilError::CallbackFailed {
            op: "auth_and_reset",
            rc: -13
        }
    ));
    let calls = rig.hyp.calls();
    assert_eq!(calls.len(), 3);
    assert_eq!(calls[1].dest, vec![VMID]);
    assert_eq!(calls[2].src, vec![VMID]);
    assert_eq!(calls[2].dest, vec![VMID_HLOS]);
    assert_eq!(ops.count("deinit_image"), 1);
    assert_eq!(ops.count("proxy_unvote"), 1);
    assert_eq!(inst.phase(), BootPhase::Idle);
}

#[test]
fn region_is_reused_and_must_fit() {
    let rig = rig();
    stage(&rig.fw, "lpass", 1);
    let ops = Arc::new(MockOps::full());
    let inst = rig
        .registry
        .register(config("lpass"), InstanceParts::new(ops.clone()))
        .unwrap();

    inst.boot().unwrap();
    let first = inst.region();
    assert!(first.allocated);
    inst.shutdown().unwrap();

    let before = rig.hyp.calls().len();
    inst.boot().unwrap();
    assert_eq!(inst.region(), first);
    let calls = rig.hyp.calls();
    // The processor still owns the window, so the host takes it back first.
    assert_eq!(calls[before].src, vec![VMID]);
    assert_eq!(calls[before].dest, vec![VMID_HLOS]);
    assert_eq!(calls[before + 1].dest, vec![VMID_HLOS, VMID]);
    inst.shutdown().unwrap();

    stage(&rig.fw, "lpass", 3);
    let votes = ops.count("proxy_vote");
    match inst.boot().unwrap_err() {
        PilError::RegionTooSmall { have, need } => {
            assert_eq!(have, 0x1000);
            assert_eq!(need, 0x3000);
        }
        other => panic!("unexpected error {other:?}"),
    }
    assert_eq!(ops.count("proxy_vote"), votes);
    assert!(!inst.region().allocated);
}

#[test]
fn failed_shutdown_forces_host_return() {
    let rig = rig();
    stage(&rig.fw, "lpass", 1);
    let ops = Arc::new(MockOps::full());
    let inst = rig
        .registry
        .register(config("lpass"), InstanceParts::new(ops.clone()))
        .unwrap();

    inst.boot().unwrap();
    ops.fail("shutdown", -5);
    assert!(inst.shutdown().is_err());
    assert!(inst.shutdown_failed());
    ops.clear("shutdown");

    let before = rig.hyp.calls().len();
    inst.boot().unwrap();
    let calls = rig.hyp.calls();
    assert_eq!(calls[before].src, vec![VMID]);
    assert_eq!(calls[before].dest, vec![VMID_HLOS]);
    assert_eq!(calls[before + 1].dest, vec![VMID_HLOS, VMID]);
    assert!(!inst.shutdown_failed());
    assert_eq!(rig.hyp.owners(inst.region().range()), vec![VMID]);
}

#[test]
fn freed_region_is_not_returned_twice_after_failed_shutdown() {
    let rig = rig();
    stage(&rig.fw, "lpass", 1);
    let ops = Arc::new(MockOps::full());
    let inst = rig
        .registry
        .register(config("lpass"), InstanceParts::new(ops.clone()))
        .unwrap();

    inst.boot().unwrap();
    ops.fail("shutdown", -5);
    assert!(inst.shutdown().is_err());
    ops.clear("shutdown");

    inst.free_memory();
    assert_eq!(rig.hyp.owners(inst.region().range()), vec![VMID_HLOS]);
    let before = rig.hyp.calls().len();
    inst.boot().unwrap();
    let calls = rig.hyp.calls();
    assert_eq!(calls[before].src, vec![VMID_HLOS]);
    assert_eq!(calls[before].dest, vec![VMID_HLOS, VMID]);
    assert_eq!(rig.hyp.calls_to(VMID_HLOS).len(), 1);
}

#[test]
fn unwound_boot_after_failed_shutdown_leaves_host_owner() {
    let rig = rig();
    stage(&rig.fw, "lpass", 1);
    let ops = Arc::new(MockOps::full());
    let inst = rig
        .registry
        .register(config("lpass"), InstanceParts::new(ops.clone()))
        .unwrap();

    inst.boot().unwrap();
    let range = inst.region().range();
    ops.fail("shutdown", -5);
    assert!(inst.shutdown().is_err());
    ops.clear("shutdown");

    rig.fw.remove("lpass.b00");
    assert!(inst.boot().is_err());
    assert!(inst.shutdown_failed());
    assert_eq!(rig.hyp.owners(range), vec![VMID_HLOS]);

    stage(&rig.fw, "lpass", 1);
    let before = rig.hyp.calls().len();
    inst.boot().unwrap();
    let calls = rig.hyp.calls();
    assert_eq!(calls.len(), before + 2);
    assert_eq!(calls[before].src, vec![VMID_HLOS]);
    assert_eq!(calls[before + 1].dest, vec![VMID]);
    assert_eq!(rig.hyp.owners(range), vec![VMID]);
}

#[test]
fn clean_shutdown_skips_host_return() {
    let rig = rig();
    stage(&rig.fw, "lpass", 1);
    let inst = rig
        .registry
        .register(config("lpass"), InstanceParts::new(Arc::new(MockOps::full())))
        .unwrap();

    inst.boot().unwrap();
    inst.shutdown().unwrap();
    inst.free_memory();
    let before = rig.hyp.calls().len();
    inst.boot().unwrap();
    assert_eq!(rig.hyp.calls()[before].dest, vec![VMID_HLOS, VMID]);
}

#[test]
fn free_memory_returns_region_once() {
    let rig = rig();
    stage(&rig.fw, "lpass", 1);
    let inst = rig
        .registry
        .register(config("lpass"), InstanceParts::new(Arc::new(MockOps::full())))
        .unwrap();

    inst.boot().unwrap();
    inst.shutdown().unwrap();
    let before = rig.hyp.calls().len();
    inst.free_memory();
    assert!(!inst.region().allocated);
    let calls = rig.hyp.calls();
    assert_eq!(calls.len(), before + 1);
    assert_eq!(calls[before].src, vec![VMID]);
    inst.free_memory();
    assert_eq!(rig.hyp.calls().len(), before + 1);
}

#[test]
fn load_state_messages_bracket_the_run() {
    let rig = rig();
    stage(&rig.fw, "lpass", 1);
    let inst = rig
        .registry
        .register(config("lpass"), InstanceParts::new(Arc::new(MockOps::full())))
        .unwrap();

    inst.boot().unwrap();
    inst.shutdown().unwrap();
    assert_eq!(
        rig.mailbox.messages(),
        vec![
            "{class: image, res: load_state, name: lpass, val: on}".to_string(),
            "{class: image, res: load_state, name: lpass, val: off}".to_string(),
        ]
    );
}

#[test]
fn notify_timeout_forces_restart() {
    let rig = rig();
    stage(&rig.fw, "lpass", 1);
    rig.mailbox.fail_with(NotifyError::Timeout);
    let ops = Arc::new(MockOps::full());
    let inst = rig
        .registry
        .register(config("lpass"), InstanceParts::new(ops.clone()))
        .unwrap();

    let err = inst.boot().unwrap_err();
    assert!(matches!(err, PilError::Notify(NotifyError::Timeout)));
    assert_eq!(rig.restart.count(), 1);
    assert!(ops.calls().is_empty());
    assert_eq!(inst.phase(), BootPhase::Idle);
}

#[test]
fn image_info_tracks_region() {
    const IMEM: u64 = 0x146b_f000;
    let size = IMAGE_INFO_SIZE * PIL_NUM_DESC;
    let cfg = LoaderConfig {
        imem_info: Some(Window {
            base: IMEM,
            size: size as u64,
        }),
        ..LoaderConfig::default()
    };
    let rig = rig_with_banks(cfg, &[(IMEM, size)]);
    stage(&rig.fw, "lpass", 1);
    let table = rig.registry.image_info().unwrap();
    let inst = rig
        .registry
        .register(config("lpass"), InstanceParts::new(Arc::new(MockOps::full())))
        .unwrap();
    assert_eq!(table.read(inst.id()).unwrap().name, "lpass");

    inst.boot().unwrap();
    let info = table.read(inst.id()).unwrap();
    assert_eq!(info.start, BASE);
    assert_eq!(info.size, 0x1000);

    inst.shutdown().unwrap();
    rig.fw.remove("lpass.b00");
    assert!(inst.boot().is_err());
    let info = table.read(inst.id()).unwrap();
    assert_eq!((info.name.as_str(), info.start, info.size), ("lpass", 0, 0));
}

#[test]
fn suspend_blocks_firmware_fetches() {
    let rig = rig();
    stage(&rig.fw, "lpass", 1);
    let ops = Arc::new(MockOps::full());
    let inst = Arc::new(
        rig.registry
            .register(config("lpass"), InstanceParts::new(ops.clone()))
            .unwrap(),
    );

    rig.registry.suspend_prepare();
    let booting = {
        let inst = Arc::clone(&inst);
        thread::spawn(move || inst.boot())
    };
    thread::sleep(Duration::from_millis(100));
    assert!(ops.calls().is_empty());
    assert!(!booting.is_finished());

    rig.registry.post_suspend();
    booting.join().unwrap().unwrap();
    assert_eq!(inst.phase(), BootPhase::Running);
}
