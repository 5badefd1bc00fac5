//! The dynamic-translation hook.
//!
//! Delivering a signal requires bringing the guest thread to a safe point in
//! translated code before its register context is rewritten, and symmetrically
//! restoring it on `sigreturn`. That translation is owned by the binary
//! translator, not this crate; `GuestControl` is the seam between them.

use super::frame::{MachineContext, SignalFrame};

/// Suspend/inspect/rewrite/resume access to the single guest thread, plus
/// the two safe-point hooks the binary translator must provide.
///
/// All methods are called only from the signal worker thread, and only
/// while holding the controller's mutex, except `suspend`/`resume`
/// themselves which bracket the critical section that does the context
/// rewrite (see [`super::controller::SignalController`]).
pub trait GuestControl: Send + Sync {
    /// Suspend the guest thread. Must not return until it is stopped.
    fn suspend(&self);

    /// Read the suspended guest thread's register context.
    fn get_context(&self) -> MachineContext;

    /// Overwrite the suspended guest thread's register context.
    fn set_context(&self, context: &MachineContext);

    /// Resume the guest thread.
    fn resume(&self);

    /// Adjust `context` so that resuming the guest lands at a safe point in
    /// translated code from which handler setup can run. Called while the
    /// guest thread is suspended, before `set_context`.
    fn deliver_signal(&self, context: &mut MachineContext);

    /// Write the just-built frame into guest memory at `frame_addr`, ahead
    /// of `set_context` pointing the guest's stack pointer at it. Left to
    /// the translator/embedder since only it knows how `SignalFrame`'s
    /// logical fields map onto the guest's on-stack byte layout.
    fn write_frame(&self, frame_addr: u32, frame: &SignalFrame);

    /// The symmetric operation to `deliver_signal`, called from the
    /// `sigreturn` path to hand control back to the translator at the
    /// point the signal originally interrupted.
    fn sigreturn(&self, context: &MachineContext);
}

#[cfg(any(test, feature = "testing"))]
pub mod test_double {
    use super::*;
    use std::sync::Mutex;

    /// An in-process `GuestControl` for tests: no real suspension, just a
    /// context slot and a counter of how many times each hook fired.
    pub struct RecordingControl {
        context: Mutex<MachineContext>,
        pub suspend_count: Mutex<u32>,
        pub resume_count: Mutex<u32>,
        pub deliver_count: Mutex<u32>,
        pub sigreturn_count: Mutex<u32>,
        pub last_frame: Mutex<Option<(u32, SignalFrame)>>,
    }

    impl RecordingControl {
        pub fn new() -> Self {
            Self {
                context: Mutex::new(MachineContext::default()),
                suspend_count: Mutex::new(0),
                resume_count: Mutex::new(0),
                deliver_count: Mutex::new(0),
                sigreturn_count: Mutex::new(0),
                last_frame: Mutex::new(None),
            }
        }
    }

    impl GuestControl for RecordingControl {
        fn suspend(&self) {
            *self.suspend_count.lock().unwrap() += 1;
        }

        fn get_context(&self) -> MachineContext {
            *self.context.lock().unwrap()
        }

        fn set_context(&self, context: &MachineContext) {
            *self.context.lock().unwrap() = *context;
        }

        fn resume(&self) {
            *self.resume_count.lock().unwrap() += 1;
        }

        fn deliver_signal(&self, _context: &mut MachineContext) {
            *self.deliver_count.lock().unwrap() += 1;
        }

        fn write_frame(&self, frame_addr: u32, frame: &SignalFrame) {
            *self.last_frame.lock().unwrap() = Some((frame_addr, *frame));
        }

        fn sigreturn(&self, _context: &MachineContext) {
            *self.sigreturn_count.lock().unwrap() += 1;
        }
    }
}
