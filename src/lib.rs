//! Signal delivery and VFS dispatch core for a user-space guest ABI layer.
//!
//! This crate is the process-wide state an emulator needs for two foreign
//! syscall families — signals and the filesystem — factored out from a
//! concrete translator and memory subsystem, which are external
//! collaborators reached only through the [`signal::GuestControl`] and
//! [`memory::GuestMemory`] traits.
//!
//! There is no module-level global: everything lives on [`EmulatorContext`],
//! constructed once at emulator start-up and re-derived via
//! [`EmulatorContext::after_fork`] rather than reinitialized in place.

pub mod config;
pub mod error;
pub mod memory;
pub mod signal;
pub mod vfs;

use std::sync::Arc;

pub use config::Limits;
pub use error::{Errno, Result};
pub use memory::GuestMemory;

use signal::{GuestControl, SignalController, Watcher};
use vfs::VfsDispatcher;

/// The emulator-context object the Design Notes call for: signal and VFS
/// state bundled behind one explicit, passed-by-reference handle rather
/// than module-level mutables.
pub struct EmulatorContext {
    pub signals: SignalController,
    pub watcher: Watcher,
    pub vfs: VfsDispatcher,
}

impl EmulatorContext {
    /// Construct a fresh context. `guest` is the binary translator's
    /// `GuestControl` hook; `limits` tunes signal/descriptor capacity.
    pub fn new(guest: Arc<dyn GuestControl>, limits: Limits) -> Self {
        let signals = SignalController::new(guest, limits);
        let watcher = Watcher::new(signals.clone());
        let vfs = VfsDispatcher::new(limits);
        Self {
            signals,
            watcher,
            vfs,
        }
    }

    /// Re-derive post-`fork()` state in place: a fresh signal worker and
    /// watcher (the child's single thread has no pending signals or
    /// watched children of its own; the old worker thread did not survive
    /// the fork at all). The VFS descriptor table, mount table, and CWD
    /// are left untouched — copying them is a memory-subsystem concern,
    /// not this crate's.
    pub fn after_fork(&mut self) {
        self.signals = self.signals.after_fork();
        self.watcher = Watcher::new(self.signals.clone());
    }

    /// Stop the signal worker thread. Call once, at emulator shutdown.
    pub fn shutdown(&self) {
        self.signals.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use signal::hook::test_double::RecordingControl;

    #[test]
    fn context_wires_signals_and_vfs_together() {
        let guest = Arc::new(RecordingControl::new());
        let ctx = EmulatorContext::new(guest, Limits::default());
        assert_eq!(ctx.watcher.len(), 0);
        ctx.shutdown();
    }
}
