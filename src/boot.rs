// CLASSIFICATION: COMMUNITY
// Filename: boot.rs v0.3
// Author: Lukas Bower
// Date Modified: 2027-09-02

//! Boot orchestrator.
//!
//! Drives one boot attempt from the power-on notification to reset:
//!
//! 1. notify observers the processor is powering on
//! 2. drop the previous attempt's segment list
//! 3. fetch and validate `<fw_name>.mdt`
//! 4. plan region and segments
//! 5. take the proxy vote
//! 6. `init_image`
//! 7. `mem_setup`
//! 8. return memory to the host if needed, then grant host + processor
//! 9. load every segment
//! 10. reclaim the range to the processor alone
//! 11. `auth_and_reset`
//!
//! Any failure after step 1 runs the unwind, which undoes exactly what the
//! attempt did and leaves the instance idle.

use log::{error, info, warn};

use crate::error::PilError;
use crate::image::ImageDescriptor;
use crate::instance::{lock, BootPhase, LoaderInstance};
use crate::notify::LoadState;
use crate::ops::Capabilities;
use crate::region;
use crate::secure::VMID_HLOS;

/// What the current attempt has done so far.
#[derive(Debug, Default)]
struct Attempt {
    voted: bool,
    image_initialized: bool,
    mem_setup_done: bool,
    dual_granted: bool,
    reclaimed: bool,
    returned_to_host: bool,
    reset_attempted: bool,
}

impl LoaderInstance {
    /// Load and boot the firmware image.
    pub fn boot(&self) -> Result<(), PilError> {
        let _op = lock(&self.op_lock);
        let name = &*self.name;

        info!("{name}: Sending ON message to AOP ...");
        if let Err(e) = self.notifier.notify(name, LoadState::On) {
            let err = PilError::from(e);
            error!("{name}: Failed to send ON message to AOP rc:{}", err.errno());
            return Err(err);
        }
        self.set_phase(BootPhase::NotifyOn);

        let mut attempt = Attempt::default();
        match self.boot_attempt(&mut attempt) {
            Ok(()) => {
                info!("{name}: Brought out of reset");
                let mut st = lock(&self.state);
                st.shutdown_failed = false;
                st.phase = BootPhase::Running;
                Ok(())
            }
            Err(err) => {
                self.unwind(&attempt, &err);
                Err(err)
            }
        }
    }

    fn boot_attempt(&self, attempt: &mut Attempt) -> Result<(), PilError> {
        let name = &*self.name;
        let shutdown_failed = lock(&self.state).shutdown_failed;
        if shutdown_failed {
            error!("{name}: Subsystem shutdown failed previously!");
        }

        self.release_mmap();

        let mdt_name = format!("{}.mdt", self.config.fw_name);
        let mdt = {
            let _fetch = self.registry.barrier.read();
            self.registry.platform.firmware.request(&mdt_name)
        }
        .map_err(|source| {
            let err = PilError::Blob {
                name: mdt_name.clone(),
                source,
            };
            error!("{name}: Failed to locate {mdt_name}(rc:{})", err.errno());
            err
        })?;
        let image = ImageDescriptor::parse(&mdt).map_err(|e| {
            error!("{name}: {e} (rc:{})", e.errno());
            e
        })?;

        let current = lock(&self.state).region;
        let layout = region::plan(
            name,
            &image,
            &current,
            self.config.memory_region,
            self.config.skip_entry_check,
        )?;
        region::log_segments(name, &layout.segments);
        let range = layout.region.range();
        {
            let mut st = lock(&self.state);
            st.region = layout.region;
            st.segments = layout.segments.clone();
            st.entry_addr = layout.entry;
            st.phase = BootPhase::RegionPlanned;
        }
        if let Some(imem) = &self.registry.imem {
            if let Err(e) = imem.set_region(self.id, range.addr, range.size) {
                warn!("{name}: failed to record image-info: {e}");
            }
        }

        self.proxy.vote().map_err(|e| {
            error!("{name}: Failed to proxy vote(rc:{})", e.errno());
            e
        })?;
        attempt.voted = true;
        self.set_phase(BootPhase::SecuredForInit);

        if self.caps.contains(Capabilities::INIT_IMAGE) {
            self.ops.init_image(&mdt).map_err(|e| {
                error!("{name}: Initializing image failed({e})");
                PilError::CallbackFailed {
                    op: "init_image",
                    rc: e.0,
                }
            })?;
        }
        attempt.image_initialized = true;
        self.set_phase(BootPhase::Initialized);

        if self.caps.contains(Capabilities::MEM_SETUP) {
            self.ops.mem_setup(range).map_err(|e| {
                error!("{name}: Memory setup error({e})");
                PilError::CallbackFailed {
                    op: "mem_setup",
                    rc: e.0,
                }
            })?;
        }
        attempt.mem_setup_done = true;
        self.set_phase(BootPhase::MemorySetup);

        let domain = self.domain();
        if let Some(xfer) = &domain {
            // A failed shutdown leaves the range with the processor, so
            // ownership alone decides. The range may have been handed back
            // since by an unwind or `free_memory`.
            let owned_by_subsystem = lock(&self.state).subsystem_owns_region;
            if owned_by_subsystem {
                xfer.to_host(range);
                lock(&self.state).subsystem_owns_region = false;
            } else if shutdown_failed {
                info!("{name}: region already returned to host since failed shutdown");
            }
            xfer.to_subsystem_and_host(range)?;
            attempt.dual_granted = true;
            self.set_phase(BootPhase::DomainTransferred);
        }

        let sequential = self.config.sequential_loading;
        let wq = self.registry.wq.as_ref().filter(|_| !sequential);
        self.loader.load_all(&layout.segments, wq)?;
        self.set_phase(BootPhase::SegmentsLoaded);

        if let Some(xfer) = &domain {
            xfer.reclaim(range, xfer.vmid());
            attempt.reclaimed = true;
            lock(&self.state).subsystem_owns_region = true;
            self.set_phase(BootPhase::Reclaimed);
        }

        attempt.reset_attempted = true;
        if let Err(e) = self.ops.auth_and_reset() {
            error!("{name}: Failed to bring out of reset({e})");
            if let Some(xfer) = &domain {
                xfer.to_host(range);
                attempt.returned_to_host = true;
                lock(&self.state).subsystem_owns_region = false;
            }
            return Err(PilError::CallbackFailed {
                op: "auth_and_reset",
                rc: e.0,
            });
        }
        self.set_phase(BootPhase::Reset);
        self.proxy.release(false);
        Ok(())
    }

    /// Best-effort cleanup after a failed attempt. Never short-circuits.
    fn unwind(&self, attempt: &Attempt, err: &PilError) {
        let name = &*self.name;
        warn!("{name}: boot failed, unwinding (rc:{})", err.errno());
        self.set_phase(BootPhase::ErrorUnwind);

        if attempt.image_initialized && self.caps.contains(Capabilities::DEINIT_IMAGE) {
            if let Err(e) = self.ops.deinit_image() {
                error!("{name}: deinit_image failed({e})");
            }
        }
        if attempt.voted {
            self.proxy.release_after_failure(attempt.reset_attempted);
        }

        let region = lock(&self.state).region;
        if attempt.dual_granted && !attempt.reclaimed && !attempt.returned_to_host {
            if let Some(xfer) = self.domain() {
                xfer.reclaim(region.range(), VMID_HLOS);
            }
        }
        if region.allocated {
            if attempt.mem_setup_done && region.start != 0 {
                self.clear_region(region.range());
            }
            lock(&self.state).region.allocated = false;
        }

        self.release_mmap();
        self.notify_off();
        self.set_phase(BootPhase::Idle);
    }
}
