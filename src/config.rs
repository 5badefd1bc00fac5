//! Tunable limits for the core.
//!
//! There is no external config file or environment surface for this core;
//! every constant a complete emulator would want to adjust lives on one
//! plain-data struct instead of being scattered across modules as literals.

/// Limits governing the signal and VFS subsystems.
#[derive(Debug, Clone, Copy)]
pub struct Limits {
    /// Highest valid signal number (signals are numbered `1..=nsig`).
    pub nsig: u32,
    /// Bound on symbolic-link expansions per pathname operation.
    pub max_symlink_level: u32,
    /// Descriptor table capacity.
    pub max_fd: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            nsig: 64,
            max_symlink_level: 40,
            max_fd: 1024,
        }
    }
}

impl Limits {
    /// Construct limits with every field at its documented default.
    pub fn new() -> Self {
        Self::default()
    }
}
