// CLASSIFICATION: COMMUNITY
// Filename: proxy.rs v0.2
// Author: Lukas Bower
// Date Modified: 2027-09-02

//! Proxy power voting.
//!
//! The host holds a power/clock vote for the processor while it boots. The
//! vote is dropped either when the processor raises its "power/clock ready"
//! interrupt or when a deferred timer expires. A latch makes sure the driver's
//! unvote runs once per vote whichever path gets there first.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use log::{debug, info, warn};

use crate::error::PilError;
use crate::ops::{Capabilities, DomainOps};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Acknowledgment interrupt wired to the interrupt controller.
pub trait IrqLine: Send + Sync {
    fn enable(&self);
    fn disable(&self);
}

/// Keeps the host from suspending while a vote is held.
#[derive(Debug, Default)]
pub struct WakeLock {
    held: AtomicUsize,
}

impl WakeLock {
    pub fn stay_awake(&self) {
        self.held.fetch_add(1, Ordering::SeqCst);
    }

    pub fn relax(&self) {
        let _ = self
            .held
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
    }

    pub fn is_active(&self) -> bool {
        self.held.load(Ordering::SeqCst) > 0
    }
}

/// Reference count on the code that owns the driver operations.
///
/// A pending unvote pins the owner so its callbacks stay callable.
#[derive(Debug, Default)]
pub struct ModuleOwner {
    refs: AtomicUsize,
    unloading: AtomicBool,
}

/// One pin on a [`ModuleOwner`], dropped when the unvote has run.
pub struct OwnerPin {
    owner: Arc<ModuleOwner>,
}

impl ModuleOwner {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn try_get(self: &Arc<Self>) -> Option<OwnerPin> {
        if self.unloading.load(Ordering::SeqCst) {
            return None;
        }
        self.refs.fetch_add(1, Ordering::SeqCst);
        Some(OwnerPin {
            owner: Arc::clone(self),
        })
    }

    /// Refuse new pins from now on.
    pub fn begin_unload(&self) {
        self.unloading.store(true, Ordering::SeqCst);
    }

    pub fn refs(&self) -> usize {
        self.refs.load(Ordering::SeqCst)
    }
}

impl Drop for OwnerPin {
    fn drop(&mut self) {
        self.owner.refs.fetch_sub(1, Ordering::SeqCst);
    }
}

/// How long a successful boot keeps its vote.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReleasePolicy {
    /// Keep the vote until shutdown.
    Hold,
    /// Release after this many milliseconds.
    After(u64),
}

impl ReleasePolicy {
    /// Combine the global override with the instance timeout.
    ///
    /// `-1` keeps the instance value, `0` holds, anything else replaces it.
    pub fn resolve(override_ms: i64, instance_ms: u64) -> Self {
        match override_ms {
            0 => ReleasePolicy::Hold,
            ms if ms > 0 => ReleasePolicy::After(ms as u64),
            _ => ReleasePolicy::After(instance_ms),
        }
    }
}

struct VoteState {
    name: Arc<str>,
    ops: Arc<dyn DomainOps>,
    caps: Capabilities,
    wake: WakeLock,
    unvoted: AtomicBool,
    unvotes: AtomicUsize,
}

impl VoteState {
    fn unvote(&self, pin: Option<OwnerPin>) -> bool {
        if self.unvoted.swap(true, Ordering::SeqCst) {
            return false;
        }
        if self.caps.contains(Capabilities::PROXY_UNVOTE) {
            self.ops.proxy_unvote();
        }
        self.wake.relax();
        drop(pin);
        self.unvotes.fetch_add(1, Ordering::SeqCst);
        debug!("{}: proxy votes removed", self.name);
        true
    }
}

struct PendingUnvote {
    fire_now: Sender<()>,
    worker: JoinHandle<()>,
}

impl PendingUnvote {
    fn flush(self) {
        let _ = self.fire_now.send(());
        let _ = self.worker.join();
    }

    fn cancel(self) {
        drop(self.fire_now);
        let _ = self.worker.join();
    }
}

/// Proxy vote holder for one loader instance.
pub struct ProxyVoter {
    state: Arc<VoteState>,
    irq: Option<Arc<dyn IrqLine>>,
    owner: Arc<ModuleOwner>,
    policy: ReleasePolicy,
    pending: Mutex<Option<PendingUnvote>>,
    irq_pin: Mutex<Option<OwnerPin>>,
}

impl ProxyVoter {
    pub fn new(
        name: &str,
        ops: Arc<dyn DomainOps>,
        caps: Capabilities,
        irq: Option<Arc<dyn IrqLine>>,
        owner: Arc<ModuleOwner>,
        policy: ReleasePolicy,
    ) -> Self {
        Self {
            state: Arc::new(VoteState {
                name: name.into(),
                ops,
                caps,
                wake: WakeLock::default(),
                unvoted: AtomicBool::new(true),
                unvotes: AtomicUsize::new(0),
            }),
            irq,
            owner,
            policy,
            pending: Mutex::new(None),
            irq_pin: Mutex::new(None),
        }
    }

    pub fn policy(&self) -> ReleasePolicy {
        self.policy
    }

    pub fn has_irq(&self) -> bool {
        self.irq.is_some()
    }

    /// True while a vote is held.
    pub fn is_voted(&self) -> bool {
        !self.state.unvoted.load(Ordering::SeqCst)
    }

    pub fn wake_lock_active(&self) -> bool {
        self.state.wake.is_active()
    }

    /// Number of votes released so far.
    pub fn unvotes(&self) -> usize {
        self.state.unvotes.load(Ordering::SeqCst)
    }

    pub fn has_pending_timer(&self) -> bool {
        lock(&self.pending).is_some()
    }

    /// Take the vote for a boot attempt.
    pub fn vote(&self) -> Result<(), PilError> {
        // Settle the previous attempt's release before starting a new one.
        self.flush();
        lock(&self.irq_pin).take();
        self.state.unvoted.store(false, Ordering::SeqCst);
        if self.state.caps.contains(Capabilities::PROXY_VOTE) {
            self.state.wake.stay_awake();
            if let Err(e) = self.state.ops.proxy_vote() {
                self.state.wake.relax();
                self.state.unvoted.store(true, Ordering::SeqCst);
                return Err(PilError::CallbackFailed {
                    op: "proxy_vote",
                    rc: e.0,
                });
            }
        }
        Ok(())
    }

    /// Release the vote. `immediate` skips both the timer and the interrupt.
    pub fn release(&self, immediate: bool) {
        let name = &*self.state.name;
        let delay = match (self.policy, immediate) {
            (ReleasePolicy::Hold, false) => {
                debug!("{name}: holding proxy votes until shutdown");
                return;
            }
            (_, true) => 0,
            (ReleasePolicy::After(ms), false) => ms,
        };
        if self.state.unvoted.load(Ordering::SeqCst) {
            return;
        }
        if !self.state.caps.contains(Capabilities::PROXY_UNVOTE) {
            self.state.unvote(None);
            return;
        }
        let Some(pin) = self.owner.try_get() else {
            warn!("{name}: owner is unloading, proxy vote kept");
            return;
        };
        match &self.irq {
            Some(irq) if !immediate => {
                *lock(&self.irq_pin) = Some(pin);
                irq.enable();
            }
            _ => self.schedule(pin, delay),
        }
    }

    /// Release after a failed boot. The interrupt path is never used.
    pub fn release_after_failure(&self, reset_attempted: bool) {
        if let Some(irq) = &self.irq {
            irq.disable();
        }
        self.release(!reset_attempted || self.irq.is_some());
    }

    fn schedule(&self, pin: OwnerPin, delay_ms: u64) {
        if let Some(old) = lock(&self.pending).take() {
            old.flush();
        }
        if delay_ms == 0 {
            self.state.unvote(Some(pin));
            return;
        }
        let (fire_now, rx) = bounded::<()>(1);
        let state = Arc::clone(&self.state);
        let delay = Duration::from_millis(delay_ms);
        let spawned = thread::Builder::new()
            .name(format!("{}-proxy", self.state.name))
            .spawn(move || match rx.recv_timeout(delay) {
                Ok(()) | Err(RecvTimeoutError::Timeout) => {
                    state.unvote(Some(pin));
                }
                Err(RecvTimeoutError::Disconnected) => {
                    debug!("{}: proxy unvote cancelled", state.name);
                }
            });
        match spawned {
            Ok(worker) => *lock(&self.pending) = Some(PendingUnvote { fire_now, worker }),
            Err(e) => {
                warn!("{}: no timer thread ({e}), unvoting now", self.state.name);
                self.state.unvote(None);
            }
        }
    }

    /// Acknowledgment interrupt handler. Returns true if it dropped the vote.
    pub fn on_ack_interrupt(&self) -> bool {
        info!("{}: Power/Clock ready interrupt received", self.state.name);
        if let Some(pending) = lock(&self.pending).take() {
            pending.cancel();
        }
        let pin = lock(&self.irq_pin).take();
        let fired = self.state.unvote(pin);
        if let Some(irq) = &self.irq {
            irq.disable();
        }
        fired
    }

    /// Release on intentional shutdown.
    pub fn release_for_shutdown(&self) {
        if let Some(irq) = &self.irq {
            irq.disable();
            lock(&self.irq_pin).take();
            if self.is_voted() {
                self.release(true);
            }
        } else if self.policy == ReleasePolicy::Hold {
            self.release(true);
        } else {
            self.flush();
        }
    }

    /// Run a pending timed unvote now and wait for it.
    pub fn flush(&self) {
        let pending = lock(&self.pending).take();
        if let Some(pending) = pending {
            pending.flush();
        }
    }
}

impl Drop for ProxyVoter {
    fn drop(&mut self) {
        self.flush();
    }
}
