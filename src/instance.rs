// CLASSIFICATION: COMMUNITY
// Filename: instance.rs v0.3
// Author: Lukas Bower
// Date Modified: 2027-09-02

//! Loader instance: one auxiliary processor's state across its lifetime.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use log::{error, info, warn};

use crate::config::InstanceConfig;
use crate::error::PilError;
use crate::memory::{MapAttrs, MemoryMapper, PhysRange};
use crate::notify::{LoadState, LoadStateNotifier};
use crate::ops::{effective_capabilities, Capabilities, DomainOps};
use crate::proxy::{IrqLine, ModuleOwner, ProxyVoter, ReleasePolicy};
use crate::region::{RegionPlan, Segment};
use crate::registry::LoaderRegistry;
use crate::loader::SegmentLoader;
use crate::secure::DomainTransfer;

/// Where a boot attempt currently stands.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum BootPhase {
    #[default]
    Idle,
    NotifyOn,
    RegionPlanned,
    /// Proxy vote held, image not yet handed to the authenticator.
    SecuredForInit,
    Initialized,
    MemorySetup,
    DomainTransferred,
    SegmentsLoaded,
    Reclaimed,
    Reset,
    Running,
    ErrorUnwind,
}

impl fmt::Display for BootPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Default)]
pub(crate) struct InstanceState {
    pub(crate) phase: BootPhase,
    pub(crate) region: RegionPlan,
    pub(crate) segments: Vec<Segment>,
    pub(crate) entry_addr: u64,
    pub(crate) shutdown_failed: bool,
    /// The region was last left with the processor's domain alone.
    pub(crate) subsystem_owns_region: bool,
}

/// Driver-supplied pieces of an instance.
pub struct InstanceParts {
    pub ops: Arc<dyn DomainOps>,
    pub irq: Option<Arc<dyn IrqLine>>,
    pub mapper: Option<Arc<dyn MemoryMapper>>,
    pub owner: Option<Arc<ModuleOwner>>,
}

impl InstanceParts {
    pub fn new(ops: Arc<dyn DomainOps>) -> Self {
        Self {
            ops,
            irq: None,
            mapper: None,
            owner: None,
        }
    }

    pub fn with_irq(mut self, irq: Arc<dyn IrqLine>) -> Self {
        self.irq = Some(irq);
        self
    }

    pub fn with_mapper(mut self, mapper: Arc<dyn MemoryMapper>) -> Self {
        self.mapper = Some(mapper);
        self
    }

    pub fn with_owner(mut self, owner: Arc<ModuleOwner>) -> Self {
        self.owner = Some(owner);
        self
    }
}

/// Minidump table entries this instance reads from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct MinidumpIds {
    pub(crate) primary: u32,
    pub(crate) aux: Vec<u32>,
}

pub struct LoaderInstance {
    pub(crate) id: usize,
    pub(crate) name: Arc<str>,
    pub(crate) config: InstanceConfig,
    pub(crate) registry: Arc<LoaderRegistry>,
    pub(crate) ops: Arc<dyn DomainOps>,
    pub(crate) caps: Capabilities,
    pub(crate) mapper: Arc<dyn MemoryMapper>,
    pub(crate) loader: SegmentLoader,
    pub(crate) proxy: ProxyVoter,
    pub(crate) notifier: LoadStateNotifier,
    pub(crate) minidump: Option<MinidumpIds>,
    /// Serialises boot, shutdown, dump and free.
    pub(crate) op_lock: Mutex<()>,
    pub(crate) state: Mutex<InstanceState>,
}

pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl LoaderInstance {
    pub(crate) fn new(
        registry: Arc<LoaderRegistry>,
        id: usize,
        config: InstanceConfig,
        parts: InstanceParts,
    ) -> Result<Self, PilError> {
        let name: Arc<str> = config.name.as_str().into();
        let caps = effective_capabilities(&name, parts.ops.capabilities());

        let irq = match (config.proxy_unvote_irq, parts.irq) {
            (true, None) => {
                return Err(PilError::Config(format!(
                    "{name}: proxy_unvote_irq set without an interrupt line"
                )))
            }
            (true, irq) => irq,
            (false, _) => None,
        };
        if caps.contains(Capabilities::PROXY_UNVOTE) && irq.is_none() && config.proxy_timeout_ms == 0 {
            warn!("{name}: Invalid proxy unvote callback or a proxy timeout of 0 was specified or no proxy unvote IRQ was specified.");
        }

        let mapper = parts
            .mapper
            .unwrap_or_else(|| Arc::clone(&registry.platform.memory));
        let loader = SegmentLoader::new(
            &name,
            &config.fw_name,
            Arc::clone(&registry.platform.firmware),
            Arc::clone(&registry.barrier),
            Arc::clone(&mapper),
            Arc::clone(&parts.ops),
            caps,
            MapAttrs::WRITE_COMBINE,
        );
        let proxy = ProxyVoter::new(
            &name,
            Arc::clone(&parts.ops),
            caps,
            irq,
            parts.owner.unwrap_or_else(ModuleOwner::new),
            ReleasePolicy::resolve(registry.proxy_timeout_ms, config.proxy_timeout_ms),
        );
        let notifier = if config.signal_aop {
            LoadStateNotifier::new(registry.platform.mailbox.clone(), registry.platform.restart.clone())
        } else {
            LoadStateNotifier::disabled()
        };

        let minidump = match (registry.minidump, config.minidump_id) {
            (Some(toc), Some(primary)) => {
                let usable = |id: &u32| {
                    let ok = toc.subsystem_addr(*id).is_some();
                    if !ok {
                        warn!("{name}: minidump id {id} out of range, ignored");
                    }
                    ok
                };
                usable(&primary).then(|| MinidumpIds {
                    primary,
                    aux: config.aux_minidump_ids.iter().copied().filter(usable).collect(),
                })
            }
            _ => None,
        };

        if let Some(imem) = &registry.imem {
            if let Err(e) = imem.set_name(id, &name) {
                warn!("{name}: image-info slot unavailable: {e}");
            }
        }

        info!("{name}: registered as id {id}");
        Ok(Self {
            id,
            name,
            config,
            ops: parts.ops,
            caps,
            mapper,
            loader,
            proxy,
            notifier,
            minidump,
            registry,
            op_lock: Mutex::new(()),
            state: Mutex::new(InstanceState::default()),
        })
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &InstanceConfig {
        &self.config
    }

    pub fn capabilities(&self) -> Capabilities {
        self.caps
    }

    pub fn phase(&self) -> BootPhase {
        lock(&self.state).phase
    }

    /// Relocated entry point of the loaded image, or 0.
    pub fn entry_addr(&self) -> u64 {
        lock(&self.state).entry_addr
    }

    pub fn region(&self) -> RegionPlan {
        lock(&self.state).region
    }

    pub fn segments(&self) -> Vec<Segment> {
        lock(&self.state).segments.clone()
    }

    pub fn shutdown_failed(&self) -> bool {
        lock(&self.state).shutdown_failed
    }

    pub fn proxy(&self) -> &ProxyVoter {
        &self.proxy
    }

    pub(crate) fn set_phase(&self, phase: BootPhase) {
        lock(&self.state).phase = phase;
    }

    pub(crate) fn domain(&self) -> Option<DomainTransfer<'_>> {
        self.config
            .vmid()
            .map(|vmid| DomainTransfer::new(&*self.registry.platform.hypervisor, &self.name, vmid))
    }

    /// Drop the segment list and image-info record of the last attempt.
    pub(crate) fn release_mmap(&self) {
        let mut st = lock(&self.state);
        st.segments.clear();
        st.entry_addr = 0;
        drop(st);
        if let Some(imem) = &self.registry.imem {
            if let Err(e) = imem.clear_region(self.id) {
                warn!("{}: failed to clear image-info: {e}", self.name);
            }
        }
    }

    pub(crate) fn notify_off(&self) {
        if let Err(e) = self.notifier.notify(&self.name, LoadState::Off) {
            warn!(
                "{}: failed to send OFF message to AOP rc:{}",
                self.name,
                PilError::from(e).errno()
            );
        }
    }

    /// Take a running image down on purpose.
    pub fn shutdown(&self) -> Result<(), PilError> {
        let _op = lock(&self.op_lock);
        let name = &*self.name;
        let mut result = Ok(());
        if self.caps.contains(Capabilities::SHUTDOWN) {
            let failed = match self.ops.shutdown() {
                Ok(()) => false,
                Err(e) => {
                    error!("{name}: shutdown failed ({e})");
                    result = Err(PilError::CallbackFailed {
                        op: "shutdown",
                        rc: e.0,
                    });
                    true
                }
            };
            lock(&self.state).shutdown_failed = failed;
        }
        self.proxy.release_for_shutdown();
        self.notify_off();
        self.set_phase(BootPhase::Idle);
        info!("{name}: shut down");
        result
    }

    /// Give an allocated region back to the host and forget it.
    pub fn free_memory(&self) {
        let _op = lock(&self.op_lock);
        let mut st = lock(&self.state);
        if !st.region.allocated {
            return;
        }
        if st.subsystem_owns_region {
            if let Some(xfer) = self.domain() {
                xfer.to_host(st.region.range());
            }
            st.subsystem_owns_region = false;
        }
        st.region.allocated = false;
        info!("{}: memory region released", self.name);
    }

    /// Entry point for the proxy-unvote acknowledgment interrupt.
    pub fn handle_proxy_unvote_irq(&self) -> bool {
        self.proxy.on_ack_interrupt()
    }

    /// Zero the planned region.
    pub(crate) fn clear_region(&self, range: PhysRange) {
        if let Err(e) = crate::loader::zero_range(&*self.mapper, range, MapAttrs::WRITE_COMBINE) {
            error!("{}: failed to clear firmware region rc:{}", self.name, e.errno());
        }
    }
}

impl Drop for LoaderInstance {
    fn drop(&mut self) {
        self.proxy.flush();
        self.registry.release_id(self.id);
    }
}

impl fmt::Debug for LoaderInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoaderInstance")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("phase", &self.phase())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LoaderConfig;
    use crate::firmware::MemFirmware;
    use crate::memory::RamMemory;
    use crate::registry::Platform;
    use crate::testing::{MockHypervisor, MockIrq, MockOps};

    fn registry() -> Arc<LoaderRegistry> {
        LoaderRegistry::new(
            &LoaderConfig::default(),
            Platform {
                firmware: Arc::new(MemFirmware::new()),
                memory: Arc::new(RamMemory::new()),
                hypervisor: Arc::new(MockHypervisor::new()),
                mailbox: None,
                restart: None,
            },
        )
        .unwrap()
    }

    #[test]
    fn irq_flag_requires_line() {
        let reg = registry();
        let mut cfg = InstanceConfig::new("venus");
        cfg.proxy_unvote_irq = true;
        let err = reg
            .register(cfg.clone(), InstanceParts::new(Arc::new(MockOps::new())))
            .unwrap_err();
        assert!(matches!(err, PilError::Config(_)));
        assert_eq!(reg.ids_in_use(), 0);

        let inst = reg
            .register(
                cfg,
                InstanceParts::new(Arc::new(MockOps::new())).with_irq(Arc::new(MockIrq::new())),
            )
            .unwrap();
        assert!(inst.proxy().has_irq());
    }

    #[test]
    fn unvote_without_vote_is_stripped() {
        let reg = registry();
        let ops = Arc::new(MockOps::new().with_caps(Capabilities::PROXY_UNVOTE));
        let inst = reg
            .register(InstanceConfig::new("venus"), InstanceParts::new(ops))
            .unwrap();
        assert!(!inst.capabilities().contains(Capabilities::PROXY_UNVOTE));
    }

    #[test]
    fn fresh_instance_is_idle() {
        let inst = registry()
            .register(InstanceConfig::new("spss"), InstanceParts::new(Arc::new(MockOps::new())))
            .unwrap();
        assert_eq!(inst.phase(), BootPhase::Idle);
        assert_eq!(inst.entry_addr(), 0);
        assert!(inst.segments().is_empty());
        assert!(!inst.shutdown_failed());
        inst.free_memory();
    }
}
