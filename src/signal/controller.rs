//! The Signal Controller: disposition table, mask, pending set, and the
//! worker thread that actually performs delivery.
//!
//! Mutations to disposition/mask/pending state happen in exactly two
//! places: a guest syscall handler calling one of the public methods below
//! (under the controller's mutex), or the worker thread servicing a message
//! from the channel (also under the mutex). No other thread ever touches
//! this state directly, which is what makes the coalescing and rearm rules
//! in the module docs hold.

use std::sync::mpsc;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use crate::config::Limits;
use crate::error::{Errno, Result};

use super::frame::{self, MachineContext, SignalFrame};
use super::hook::GuestControl;
use super::types::{Disposition, Handler, MaskHow, SigInfo, SigNum, SigSet, TERMINATING_BY_DEFAULT};

/// Messages the worker thread consumes, in arrival order.
pub(super) enum Message {
    /// A signal arrived (from a guest `kill`, a watcher, or a rearm check).
    Kill(SigInfo),
    /// Re-evaluate the pending set against the current mask; carries no
    /// payload since the state it reads is already in `Inner`.
    Deliver,
    /// A watched child terminated; carries enough to build the `SIGCHLD`
    /// `SigInfo` and to let the watcher mark its record before this runs.
    ChildTerminated(u32),
    Shutdown,
}

struct Inner {
    dispositions: Vec<Disposition>,
    mask: SigSet,
    pending: SigSet,
    info: Vec<SigInfo>,
    can_accept_signal: bool,
}

impl Inner {
    fn new(nsig: usize) -> Self {
        Self {
            dispositions: vec![Disposition::default(); nsig + 1],
            mask: SigSet::EMPTY,
            pending: SigSet::EMPTY,
            info: vec![SigInfo::default(); nsig + 1],
            can_accept_signal: true,
        }
    }
}

/// A manual-reset-event analogue used to wake callers blocked in
/// [`SignalController::wait_interruptible`] or
/// [`SignalController::suspend`] as soon as a signal becomes deliverable.
struct WaitEvent {
    generation: Mutex<u64>,
    condvar: Condvar,
}

impl WaitEvent {
    fn new() -> Self {
        Self {
            generation: Mutex::new(0),
            condvar: Condvar::new(),
        }
    }

    fn bump(&self) {
        let mut generation = self.generation.lock().unwrap();
        *generation = generation.wrapping_add(1);
        self.condvar.notify_all();
    }
}

/// The result of [`SignalController::wait_interruptible`]: either the
/// caller's readiness predicate fired, the timeout elapsed, or a signal
/// became deliverable and interrupted the wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Ready,
    TimedOut,
    Interrupted,
}

/// Disposition/mask/pending state, the delivery worker thread, and the
/// handle used to reach the guest's translation layer.
///
/// Cheap to clone: every field is an `Arc` or a plain value, so a clone
/// shares the same underlying controller (used to hand a reference to the
/// Child-Process Watcher's per-child threads).
#[derive(Clone)]
pub struct SignalController {
    inner: Arc<Mutex<Inner>>,
    sender: mpsc::Sender<Message>,
    worker: Arc<Mutex<Option<JoinHandle<()>>>>,
    guest: Arc<dyn GuestControl>,
    wait: Arc<WaitEvent>,
    limits: Limits,
}

impl SignalController {
    /// Create a controller and start its worker thread.
    pub fn new(guest: Arc<dyn GuestControl>, limits: Limits) -> Self {
        let inner = Arc::new(Mutex::new(Inner::new(limits.nsig as usize)));
        let wait = Arc::new(WaitEvent::new());
        let (sender, receiver) = mpsc::channel();

        let worker_inner = inner.clone();
        let worker_guest = guest.clone();
        let worker_wait = wait.clone();
        let handle = std::thread::spawn(move || {
            worker_loop(worker_inner, worker_guest, worker_wait, receiver);
        });

        Self {
            inner,
            sender,
            worker: Arc::new(Mutex::new(Some(handle))),
            guest,
            wait,
            limits,
        }
    }

    /// Build the post-fork controller: a fresh worker thread and empty
    /// mask/pending set, but the disposition table is inherited verbatim
    /// (dispositions, unlike pending signals, survive `fork`).
    pub fn after_fork(&self) -> Self {
        let old = self.inner.lock().unwrap();
        let dispositions = old.dispositions.clone();
        drop(old);

        let fresh = Self::new(self.guest.clone(), self.limits);
        let mut inner = fresh.inner.lock().unwrap();
        inner.dispositions = dispositions;
        drop(inner);
        fresh
    }

    /// Stop the worker thread and wait for it to exit. Idempotent.
    pub fn shutdown(&self) {
        log::debug!("signal worker shutdown requested");
        if self.sender.send(Message::Shutdown).is_err() {
            log::error!("signal worker already gone; channel send failed during shutdown");
        }
        if let Some(handle) = self.worker.lock().unwrap().take() {
            let _ = handle.join();
        }
    }

    fn check_signo(&self, signo: SigNum) -> Result<()> {
        if signo == 0 || signo > self.limits.nsig {
            return Err(Errno::Invalid);
        }
        Ok(())
    }

    /// `rt_sigaction`: install `new` for `signo`, returning the disposition
    /// it replaces. `SIGKILL`/`SIGSTOP` may be queried but never changed.
    pub fn set_disposition(
        &self,
        signo: SigNum,
        new: Option<Disposition>,
    ) -> Result<Disposition> {
        self.check_signo(signo)?;
        let mut inner = self.inner.lock().unwrap();
        let old = inner.dispositions[signo as usize];
        if let Some(new) = new {
            if super::types::UNBLOCKABLE.contains(&signo) {
                return Err(Errno::Invalid);
            }
            log::debug!("signal {signo}: disposition {old:?} -> {new:?}");
            inner.dispositions[signo as usize] = new;
        }
        Ok(old)
    }

    /// `rt_sigprocmask`: apply `how`/`set` to the blocked mask, returning
    /// the mask in force beforehand. A rearm check runs before returning,
    /// since unblocking a signal that's already pending must deliver it.
    pub fn set_mask(&self, how: MaskHow, set: Option<SigSet>) -> Result<SigSet> {
        let mut inner = self.inner.lock().unwrap();
        let old = inner.mask;
        if let Some(set) = set {
            let set = set.sanitized();
            inner.mask = match how {
                MaskHow::Block => {
                    let mut m = old;
                    m.union_with(set);
                    m
                }
                MaskHow::Unblock => {
                    let mut m = old;
                    m.subtract(set);
                    m
                }
                MaskHow::SetMask => set,
            };
            log::debug!("mask change ({how:?}): {:#x} -> {:#x}", old.bits(), inner.mask.bits());
        }
        self.maybe_rearm(&inner);
        Ok(old)
    }

    /// `kill`: raise `info.signo` against `target`. Only self-directed
    /// kills are supported; anything else is `ESRCH` per the Design Notes.
    pub fn kill(&self, target: u32, info: SigInfo) -> Result<()> {
        self.check_signo(info.signo)?;
        if target != std::process::id() {
            return Err(Errno::NoSuchProcess);
        }
        self.send(Message::Kill(info))
    }

    pub(super) fn notify_child_terminated(&self, child_id: u32) -> Result<()> {
        self.send(Message::ChildTerminated(child_id))
    }

    /// Post `message` to the worker, logging and downgrading a send
    /// failure (the worker thread is gone) to `Errno::Internal` rather
    /// than panicking: a dead worker degrades this subsystem, it never
    /// crashes the rest of the emulator.
    fn send(&self, message: Message) -> Result<()> {
        self.sender.send(message).map_err(|e| {
            log::error!("signal worker unreachable: {e}");
            Errno::Internal(e.to_string())
        })
    }

    /// `rt_sigsuspend`: atomically apply `temp_mask`, block until a signal
    /// is delivered, then restore the previous mask. Always returns
    /// `EINTR` on return, matching the real syscall's contract.
    pub fn suspend(&self, temp_mask: SigSet) -> Errno {
        let previous = {
            let mut inner = self.inner.lock().unwrap();
            let previous = inner.mask;
            inner.mask = temp_mask.sanitized();
            self.maybe_rearm(&inner);
            previous
        };

        let guard = self.wait.generation.lock().unwrap();
        let generation = *guard;
        let _unused = self
            .wait
            .condvar
            .wait_while(guard, |g| *g == generation)
            .unwrap();

        let mut inner = self.inner.lock().unwrap();
        inner.mask = previous;
        Errno::Interrupted
    }

    /// Block until `ready` reports a handle index, `timeout` elapses, or a
    /// signal becomes deliverable. Used by the VFS Dispatcher's `poll`/
    /// `select` implementation to make blocking I/O interruptible.
    pub fn wait_interruptible(
        &self,
        mut ready: impl FnMut() -> bool,
        timeout: Option<std::time::Duration>,
    ) -> WaitOutcome {
        if ready() {
            return WaitOutcome::Ready;
        }
        let start_generation = *self.wait.generation.lock().unwrap();
        let deadline = timeout.map(|t| std::time::Instant::now() + t);
        let poll_interval = std::time::Duration::from_millis(5);

        loop {
            if ready() {
                return WaitOutcome::Ready;
            }
            if *self.wait.generation.lock().unwrap() != start_generation {
                return WaitOutcome::Interrupted;
            }
            if let Some(deadline) = deadline {
                if std::time::Instant::now() >= deadline {
                    return WaitOutcome::TimedOut;
                }
            }
            std::thread::sleep(poll_interval);
        }
    }

    /// `rt_sigreturn`: restore the mask saved in `frame` and hand the
    /// machine context back to the translator.
    pub fn sigreturn(&self, frame: &SignalFrame) -> MachineContext {
        let (mask, context) = frame::restore_frame(frame);
        {
            let mut inner = self.inner.lock().unwrap();
            inner.mask = mask;
            self.maybe_rearm(&inner);
        }
        self.guest.sigreturn(&context);
        context
    }

    /// If any pending, unmasked signal exists, wake the worker to
    /// (re-)attempt delivery. Called while holding `inner`'s lock so the
    /// pending/mask read is consistent with whatever just changed it.
    fn maybe_rearm(&self, inner: &Inner) {
        if !inner.pending.unmasked_by(inner.mask).is_empty() {
            let _ = self.sender.send(Message::Deliver);
        }
    }
}

fn worker_loop(
    inner: Arc<Mutex<Inner>>,
    guest: Arc<dyn GuestControl>,
    wait: Arc<WaitEvent>,
    receiver: mpsc::Receiver<Message>,
) {
    while let Ok(message) = receiver.recv() {
        match message {
            Message::Shutdown => return,
            Message::Kill(info) => handle_arrival(&inner, &guest, &wait, info),
            Message::Deliver => attempt_pending_delivery(&inner, &guest, &wait),
            Message::ChildTerminated(child_id) => {
                handle_arrival(
                    &inner,
                    &guest,
                    &wait,
                    SigInfo {
                        signo: super::types::SIGCHLD,
                        code: 0,
                        errno: child_id as i32,
                    },
                );
            }
        }
    }
}

/// A fresh arrival: queue it in `pending`/`info`, then attempt delivery if
/// it isn't currently masked. Mirrors `signal_thread_handle_kill`.
fn handle_arrival(
    inner: &Arc<Mutex<Inner>>,
    guest: &Arc<dyn GuestControl>,
    wait: &Arc<WaitEvent>,
    info: SigInfo,
) {
    let mut guard = inner.lock().unwrap();
    let signo = info.signo;
    if signo as usize >= guard.info.len() {
        return;
    }

    // Disposition is consulted at delivery time, not here: whether a
    // signal is queued depends only on "already pending" (the caller's
    // coalescing check) and masked/armed state, never on `Handler::Ignore`.
    // A `sigaction(IGN)` installed now and replaced with a real handler
    // before the mask unblocks must still see the earlier arrival.
    guard.pending.insert(signo);
    guard.info[signo as usize] = info;
    try_deliver_locked(&mut guard, guest, wait);
}

fn attempt_pending_delivery(
    inner: &Arc<Mutex<Inner>>,
    guest: &Arc<dyn GuestControl>,
    wait: &Arc<WaitEvent>,
) {
    let mut guard = inner.lock().unwrap();
    try_deliver_locked(&mut guard, guest, wait);
}

/// Pick the lowest-numbered pending, unmasked signal and either run it to
/// completion (default terminate, ignore, or full context-rewrite
/// delivery) or leave it queued if `can_accept_signal` is false.
fn try_deliver_locked(guard: &mut Inner, guest: &Arc<dyn GuestControl>, wait: &Arc<WaitEvent>) {
    if !guard.can_accept_signal {
        return;
    }
    let deliverable = guard.pending.unmasked_by(guard.mask);
    let Some(signo) = deliverable.iter().next() else {
        return;
    };

    guard.pending.remove(signo);
    let info = guard.info[signo as usize];
    let disposition = guard.dispositions[signo as usize];

    match disposition.handler {
        Handler::Ignore => {}
        Handler::Default => {
            if TERMINATING_BY_DEFAULT.contains(&signo) {
                log::warn!("guest terminated by default action of signal {signo}");
                std::process::exit(128 + signo as i32);
            }
        }
        Handler::User(entry) => {
            deliver_to_handler(guard, guest, wait, signo, info, entry, disposition);
        }
    }
}

/// Run the full suspend/rewrite/resume sequence for a caught signal,
/// folding in the frame-construction step a real guest thread would
/// perform itself on reaching the safe point (see the module docs on
/// `setup_handler` for why this crate does that inline instead).
fn deliver_to_handler(
    guard: &mut Inner,
    guest: &Arc<dyn GuestControl>,
    wait: &Arc<WaitEvent>,
    signo: SigNum,
    info: SigInfo,
    entry: u64,
    disposition: Disposition,
) {
    guard.can_accept_signal = false;
    guest.suspend();
    let mut context = guest.get_context();
    guest.deliver_signal(&mut context);

    let pre_mask = guard.mask;
    let fpu_area = frame::fpu_area_address(context.esp);
    let frame_size = std::mem::size_of::<SignalFrame>() as u32;
    let frame_addr = frame::frame_address(fpu_area, frame_size);
    let restorer = if disposition.restorer != 0 {
        disposition.restorer
    } else {
        entry
    };
    let frame = frame::build_frame(info, &context, pre_mask, restorer, fpu_area);
    guest.write_frame(frame_addr, &frame);

    let mut new_mask = pre_mask;
    new_mask.insert(signo);
    new_mask.union_with(disposition.mask);
    guard.mask = new_mask;
    guard.can_accept_signal = true;

    let mut entry_context = context;
    entry_context.eip = entry as u32;
    entry_context.esp = frame_addr;
    entry_context.eax = signo;

    guest.set_context(&entry_context);
    wait.bump();
    guest.resume();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal::hook::test_double::RecordingControl;
    use std::time::Duration;

    fn controller() -> (SignalController, Arc<RecordingControl>) {
        let guest = Arc::new(RecordingControl::new());
        let controller = SignalController::new(guest.clone(), Limits::default());
        (controller, guest)
    }

    fn wait_for(mut predicate: impl FnMut() -> bool) {
        for _ in 0..200 {
            if predicate() {
                return;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        panic!("condition never became true");
    }

    #[test]
    fn default_ignore_drops_signal_silently() {
        let (controller, guest) = controller();
        controller
            .set_disposition(
                10,
                Some(Disposition {
                    handler: Handler::Ignore,
                    ..Default::default()
                }),
            )
            .unwrap();
        controller.kill(std::process::id(), SigInfo::simple(10)).unwrap();
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(*guest.suspend_count.lock().unwrap(), 0);
        controller.shutdown();
    }

    #[test]
    fn user_handler_drives_suspend_resume_once() {
        let (controller, guest) = controller();
        controller
            .set_disposition(
                10,
                Some(Disposition {
                    handler: Handler::User(0x4000),
                    ..Default::default()
                }),
            )
            .unwrap();
        controller.kill(std::process::id(), SigInfo::simple(10)).unwrap();
        wait_for(|| *guest.suspend_count.lock().unwrap() == 1);
        assert_eq!(*guest.resume_count.lock().unwrap(), 1);
        assert_eq!(*guest.deliver_count.lock().unwrap(), 1);
        controller.shutdown();
    }

    #[test]
    fn masked_signal_stays_pending_until_unblocked() {
        let (controller, guest) = controller();
        controller
            .set_disposition(
                10,
                Some(Disposition {
                    handler: Handler::User(0x4000),
                    ..Default::default()
                }),
            )
            .unwrap();
        let mut mask = SigSet::EMPTY;
        mask.insert(10);
        controller.set_mask(MaskHow::Block, Some(mask)).unwrap();
        controller.kill(std::process::id(), SigInfo::simple(10)).unwrap();
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(*guest.suspend_count.lock().unwrap(), 0);

        controller.set_mask(MaskHow::Unblock, Some(mask)).unwrap();
        wait_for(|| *guest.suspend_count.lock().unwrap() == 1);
        controller.shutdown();
    }

    #[test]
    fn repeated_kills_while_masked_coalesce_to_one_delivery() {
        let (controller, guest) = controller();
        controller
            .set_disposition(
                10,
                Some(Disposition {
                    handler: Handler::User(0x4000),
                    ..Default::default()
                }),
            )
            .unwrap();
        let mut mask = SigSet::EMPTY;
        mask.insert(10);
        controller.set_mask(MaskHow::Block, Some(mask)).unwrap();
        for _ in 0..5 {
            controller.kill(std::process::id(), SigInfo::simple(10)).unwrap();
        }
        controller.set_mask(MaskHow::Unblock, Some(mask)).unwrap();
        wait_for(|| *guest.suspend_count.lock().unwrap() == 1);
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(*guest.suspend_count.lock().unwrap(), 1);
        controller.shutdown();
    }

    #[test]
    fn set_disposition_rejects_sigkill() {
        let (controller, _guest) = controller();
        let result = controller.set_disposition(
            super::super::types::SIGKILL,
            Some(Disposition::default()),
        );
        assert_eq!(result, Err(Errno::Invalid));
        controller.shutdown();
    }

    #[test]
    fn after_fork_inherits_dispositions_but_not_mask() {
        let (controller, _guest) = controller();
        controller
            .set_disposition(
                10,
                Some(Disposition {
                    handler: Handler::User(0x4000),
                    ..Default::default()
                }),
            )
            .unwrap();
        let mut mask = SigSet::EMPTY;
        mask.insert(10);
        controller.set_mask(MaskHow::SetMask, Some(mask)).unwrap();

        let child = controller.after_fork();
        let old = child.set_disposition(10, None).unwrap();
        assert_eq!(old.handler, Handler::User(0x4000));
        let child_mask = child.set_mask(MaskHow::Block, Some(SigSet::EMPTY)).unwrap();
        assert!(child_mask.is_empty());

        controller.shutdown();
        child.shutdown();
    }

    #[test]
    fn wait_interruptible_times_out_without_signal() {
        let (controller, _guest) = controller();
        let outcome = controller.wait_interruptible(|| false, Some(Duration::from_millis(20)));
        assert_eq!(outcome, WaitOutcome::TimedOut);
        controller.shutdown();
    }

    #[test]
    fn wait_interruptible_reports_ready_immediately() {
        let (controller, _guest) = controller();
        let outcome = controller.wait_interruptible(|| true, Some(Duration::from_millis(20)));
        assert_eq!(outcome, WaitOutcome::Ready);
        controller.shutdown();
    }
}
