// CLASSIFICATION: COMMUNITY
// Filename: notify.rs v0.1
// Author: Lukas Bower
// Date Modified: 2027-09-02

//! Load-state announcements to the always-on power controller.

use std::fmt;
use std::sync::Arc;

use log::{debug, error};
use thiserror::Error;

const MAX_LEN: usize = 96;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum NotifyError {
    #[error("mailbox send timed out")]
    Timeout,
    #[error("mailbox send failed (rc:{0})")]
    Failed(i32),
}

/// Mailbox-style message transport.
pub trait Mailbox: Send + Sync {
    fn send(&self, msg: &str) -> Result<(), NotifyError>;
}

/// Platform-level forced restart, used when the power controller stops
/// answering.
pub trait RestartHook: Send + Sync {
    fn force_restart(&self, reason: &str);
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoadState {
    On,
    Off,
}

impl fmt::Display for LoadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LoadState::On => "on",
            LoadState::Off => "off",
        })
    }
}

/// Message announcing `name` entering `state`, capped at the mailbox length.
pub fn load_state_message(name: &str, state: LoadState) -> String {
    let mut msg = format!("{{class: image, res: load_state, name: {name}, val: {state}}}");
    if msg.len() > MAX_LEN {
        let mut cut = MAX_LEN;
        while !msg.is_char_boundary(cut) {
            cut -= 1;
        }
        msg.truncate(cut);
    }
    msg
}

/// Sends load-state messages for one instance.
#[derive(Clone)]
pub struct LoadStateNotifier {
    mailbox: Option<Arc<dyn Mailbox>>,
    restart: Option<Arc<dyn RestartHook>>,
}

impl LoadStateNotifier {
    pub fn new(mailbox: Option<Arc<dyn Mailbox>>, restart: Option<Arc<dyn RestartHook>>) -> Self {
        Self { mailbox, restart }
    }

    /// Silent notifier for processors that do not signal the controller.
    pub fn disabled() -> Self {
        Self::new(None, None)
    }

    pub fn notify(&self, name: &str, state: LoadState) -> Result<(), NotifyError> {
        let Some(mailbox) = &self.mailbox else {
            return Ok(());
        };
        let msg = load_state_message(name, state);
        debug!("{name}: sending {msg}");
        let res = mailbox.send(&msg);
        if let (Err(NotifyError::Timeout), LoadState::On) = (&res, state) {
            if let Some(hook) = &self.restart {
                error!("{name}: power controller timed out, forcing restart");
                hook.force_restart("load state notification timed out");
            }
        }
        res
    }
}
