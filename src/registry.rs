// CLASSIFICATION: COMMUNITY
// Filename: registry.rs v0.2
// Author: Lukas Bower
// Date Modified: 2027-09-02

//! Loader registry.
//!
//! Owns everything shared by the loader instances of one host: the instance
//! id pool, the segment worker pool, the suspend barrier, and the locations
//! of the shared minidump and image-info tables. Built once at start-up and
//! handed to every instance it registers.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use log::{debug, info, warn};

use crate::config::{InstanceConfig, LoaderConfig};
use crate::error::PilError;
use crate::firmware::{FirmwareSource, SuspendBarrier};
use crate::imem::ImageInfoTable;
use crate::instance::{InstanceParts, LoaderInstance};
use crate::memory::{FieldReader, MapAttrs, MemoryMapper};
use crate::minidump::MinidumpToc;
use crate::notify::{Mailbox, RestartHook};
use crate::secure::Hypervisor;
use crate::workqueue::WorkQueue;

/// Number of instance ids.
pub const PIL_NUM_DESC: usize = 16;
/// Value of the disable-timeout word that turns timeouts off.
pub const DISABLE_TIMEOUT_MAGIC: u32 = 0x5344_4247;

/// Host services shared by every instance.
#[derive(Clone)]
pub struct Platform {
    pub firmware: Arc<dyn FirmwareSource>,
    /// Default mapper; instances may bring their own.
    pub memory: Arc<dyn MemoryMapper>,
    pub hypervisor: Arc<dyn Hypervisor>,
    pub mailbox: Option<Arc<dyn Mailbox>>,
    pub restart: Option<Arc<dyn RestartHook>>,
}

pub struct LoaderRegistry {
    pub(crate) platform: Platform,
    pub(crate) barrier: Arc<SuspendBarrier>,
    pub(crate) wq: Option<WorkQueue>,
    pub(crate) minidump: Option<MinidumpToc>,
    pub(crate) imem: Option<ImageInfoTable>,
    pub(crate) proxy_timeout_ms: i64,
    ids: Mutex<u16>,
    timeouts_disabled: bool,
}

impl LoaderRegistry {
    pub fn new(config: &LoaderConfig, platform: Platform) -> Result<Arc<Self>, PilError> {
        let wq = match config.workers {
            0 => None,
            n => WorkQueue::new("pil_workqueue", n)
                .map_err(|e| warn!("pil: no worker pool: {e}"))
                .ok(),
        };
        if wq.is_none() {
            warn!("pil: Defaulting to sequential firmware loading");
        }

        let minidump = match config.minidump_toc {
            Some(base) => {
                let toc = MinidumpToc::new(base);
                match toc.read_global(&*platform.memory) {
                    Ok(g) if g.is_initialized() => Some(toc),
                    Ok(_) => {
                        info!("pil: minidump table not initialised");
                        None
                    }
                    Err(e) => {
                        warn!("pil: minidump table unreadable: {e}");
                        None
                    }
                }
            }
            None => None,
        };

        let imem = config
            .imem_info
            .map(|w| ImageInfoTable::new(w, platform.memory.clone()))
            .transpose()?;

        let timeouts_disabled = config.disable_timeouts
            || config
                .imem_disable_timeout
                .and_then(|addr| read_word(&*platform.memory, addr))
                == Some(DISABLE_TIMEOUT_MAGIC);
        if timeouts_disabled {
            info!("pil: timeouts disabled");
        }

        Ok(Arc::new(Self {
            platform,
            barrier: Arc::new(SuspendBarrier::new()),
            wq,
            minidump,
            imem,
            proxy_timeout_ms: config.proxy_timeout_ms,
            ids: Mutex::new(0),
            timeouts_disabled,
        }))
    }

    /// Create a loader instance for one processor.
    pub fn register(
        self: &Arc<Self>,
        config: InstanceConfig,
        parts: InstanceParts,
    ) -> Result<LoaderInstance, PilError> {
        if config.name.is_empty() || config.fw_name.is_empty() {
            return Err(PilError::Config("instance needs name and fw_name".into()));
        }
        let id = self.alloc_id()?;
        match LoaderInstance::new(Arc::clone(self), id, config, parts) {
            Ok(inst) => Ok(inst),
            Err(e) => {
                self.release_id(id);
                Err(e)
            }
        }
    }

    fn ids(&self) -> MutexGuard<'_, u16> {
        self.ids.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn alloc_id(&self) -> Result<usize, PilError> {
        let mut ids = self.ids();
        let id = (0..PIL_NUM_DESC)
            .find(|i| *ids & (1 << i) == 0)
            .ok_or(PilError::IdsExhausted)?;
        *ids |= 1 << id;
        debug!("pil: allocated id {id}");
        Ok(id)
    }

    pub(crate) fn release_id(&self, id: usize) {
        *self.ids() &= !(1 << id);
    }

    pub fn ids_in_use(&self) -> usize {
        self.ids().count_ones() as usize
    }

    pub fn timeouts_disabled(&self) -> bool {
        self.timeouts_disabled
    }

    /// True when segments can be loaded in parallel.
    pub fn has_worker_pool(&self) -> bool {
        self.wq.is_some()
    }

    pub fn image_info(&self) -> Option<&ImageInfoTable> {
        self.imem.as_ref()
    }

    pub fn minidump_toc(&self) -> Option<MinidumpToc> {
        self.minidump
    }

    /// Block firmware fetches ahead of a system suspend.
    pub fn suspend_prepare(&self) {
        self.barrier.suspend_prepare();
    }

    pub fn post_suspend(&self) {
        self.barrier.post_suspend();
    }
}

fn read_word(mapper: &dyn MemoryMapper, addr: u64) -> Option<u32> {
    let view = mapper.map(addr, 4, MapAttrs::empty()).ok()?;
    FieldReader::new(view.as_slice()).u32(0)
}
