//! Signal Controller: disposition table, blocked/pending state, the
//! delivery worker thread, and the Child-Process Watcher that feeds it
//! synthetic `SIGCHLD` arrivals.

pub mod controller;
pub mod frame;
pub mod hook;
pub mod types;
pub mod watcher;

pub use controller::{SignalController, WaitOutcome};
pub use frame::{FpuState, MachineContext, SignalFrame, UContext};
pub use hook::GuestControl;
pub use types::{
    Disposition, Handler, MaskHow, SigInfo, SigNum, SigSet, SIGCHLD, SIGKILL, SIGSTOP,
    TERMINATING_BY_DEFAULT, UNBLOCKABLE,
};
pub use watcher::Watcher;
