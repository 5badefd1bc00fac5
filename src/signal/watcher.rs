//! The Child-Process Watcher.
//!
//! One thread per watched child, blocking in [`std::process::Child::wait`].
//! On exit it records the status, releases the process-wait semaphore any
//! blocked `wait4`/`waitpid` call is parked on, and raises a synthetic
//! `SIGCHLD` through the ordinary signal-arrival path so a handler
//! installed for it runs exactly like any other caught signal.

use std::collections::HashMap;
use std::process::{Child, ExitStatus};
use std::sync::{Arc, Condvar, Mutex};

use crate::error::{Errno, Result};

use super::controller::SignalController;
use super::types::SIGCHLD;

struct ChildRecord {
    status: Option<ExitStatus>,
}

struct Shared {
    children: Mutex<HashMap<u32, ChildRecord>>,
    /// Released once per termination; `wait4` blocks on this rather than
    /// busy-polling the map.
    semaphore: Condvar,
    semaphore_count: Mutex<u32>,
}

/// Tracks every child spawned through [`Watcher::watch`] and turns their
/// termination into a `SIGCHLD` delivery plus a wakeup for `wait4`.
#[derive(Clone)]
pub struct Watcher {
    shared: Arc<Shared>,
    controller: SignalController,
}

impl Watcher {
    pub fn new(controller: SignalController) -> Self {
        Self {
            shared: Arc::new(Shared {
                children: Mutex::new(HashMap::new()),
                semaphore: Condvar::new(),
                semaphore_count: Mutex::new(0),
            }),
            controller,
        }
    }

    /// Take ownership of `child` and spawn a watcher thread for it.
    /// Returns the child's pid, the key used by [`Watcher::reap`].
    pub fn watch(&self, mut child: Child) -> u32 {
        let pid = child.id();
        log::debug!("watching child pid {pid}");
        self.shared
            .children
            .lock()
            .unwrap()
            .insert(pid, ChildRecord { status: None });

        let shared = self.shared.clone();
        let controller = self.controller.clone();
        std::thread::spawn(move || {
            let status = child.wait().ok();
            {
                let mut children = shared.children.lock().unwrap();
                if let Some(record) = children.get_mut(&pid) {
                    record.status = status;
                }
            }
            log::debug!("child pid {pid} terminated");
            *shared.semaphore_count.lock().unwrap() += 1;
            shared.semaphore.notify_all();

            // `notify_child_terminated` is the single path that raises
            // SIGCHLD for this exit (see `Message::ChildTerminated` in
            // controller.rs) — do not also call `raise` here, or the
            // signal would be queued/delivered twice for one child death.
            if controller.notify_child_terminated(pid).is_err() {
                log::error!("failed to notify signal worker of child {pid} termination");
            }
        });
        pid
    }

    /// `wait4`-style reap: block until `pid` has an exit status recorded,
    /// then remove and return it. `None` for `pid` reaps whichever tracked
    /// child finishes first.
    pub fn reap(&self, pid: Option<u32>) -> Result<(u32, ExitStatus)> {
        loop {
            {
                let mut children = self.shared.children.lock().unwrap();
                let found = match pid {
                    Some(pid) => children
                        .get(&pid)
                        .and_then(|r| r.status.map(|s| (pid, s))),
                    None => children
                        .iter()
                        .find_map(|(&pid, r)| r.status.map(|s| (pid, s))),
                };
                if let Some((pid, status)) = found {
                    children.remove(&pid);
                    return Ok((pid, status));
                }
                if pid.is_some() && !children.contains_key(&pid.unwrap()) {
                    return Err(Errno::NoSuchProcess);
                }
            }
            let guard = self.shared.semaphore_count.lock().unwrap();
            let count = *guard;
            let _ = self
                .shared
                .semaphore
                .wait_while(guard, |c| *c == count)
                .unwrap();
        }
    }

    /// Number of children still being tracked (exited or not).
    pub fn len(&self) -> usize {
        self.shared.children.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Limits;
    use crate::signal::hook::test_double::RecordingControl;
    use crate::signal::types::{Disposition, Handler};
    use std::process::Command;
    use std::time::Duration;

    fn controller() -> (SignalController, Arc<RecordingControl>) {
        let guest = Arc::new(RecordingControl::new());
        let controller = SignalController::new(guest.clone(), Limits::default());
        (controller, guest)
    }

    #[test]
    fn watching_a_child_eventually_reaps_its_status() {
        let (controller, _guest) = controller();
        let watcher = Watcher::new(controller.clone());
        let child = Command::new("true")
            .spawn()
            .expect("spawning /usr/bin/true must succeed in the test environment");
        let pid = watcher.watch(child);

        let (reaped_pid, status) = watcher.reap(Some(pid)).unwrap();
        assert_eq!(reaped_pid, pid);
        assert!(status.success());
        controller.shutdown();
    }

    #[test]
    fn child_termination_delivers_sigchld_to_a_caught_handler() {
        let (controller, guest) = controller();
        controller
            .set_disposition(
                SIGCHLD,
                Some(Disposition {
                    handler: Handler::User(0x5000),
                    ..Default::default()
                }),
            )
            .unwrap();
        let watcher = Watcher::new(controller.clone());
        let child = Command::new("true")
            .spawn()
            .expect("spawning /usr/bin/true must succeed in the test environment");
        watcher.watch(child);

        for _ in 0..200 {
            if *guest.suspend_count.lock().unwrap() == 1 {
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(*guest.suspend_count.lock().unwrap(), 1);
        controller.shutdown();
    }

    #[test]
    fn reap_unknown_pid_is_esrch() {
        let (controller, _guest) = controller();
        let watcher = Watcher::new(controller.clone());
        assert_eq!(watcher.reap(Some(999_999)), Err(Errno::NoSuchProcess));
        controller.shutdown();
    }
}
