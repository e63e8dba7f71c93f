//! Process-wide reply activation gate.
//!
//! Single writer: only the authenticated operator command handler calls
//! `set`. The orchestrator reads it once per inbound message to choose
//! between a generated reply and the canned identity sentence. The state
//! is deliberately not persisted; a restart starts INACTIVE unless the
//! config says otherwise.

use std::sync::atomic::{AtomicBool, Ordering};

pub struct ActivationGate {
    active: AtomicBool,
}

impl ActivationGate {
    pub fn new(active_on_start: bool) -> Self {
        Self {
            active: AtomicBool::new(active_on_start),
        }
    }

    pub fn set(&self, active: bool) {
        self.active.store(active, Ordering::SeqCst);
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }
}
