//! The VFS Dispatcher: a stateless translator from guest-visible syscall
//! shape to file- or filesystem-level operations.
//!
//! "Stateless" describes the dispatch logic, not the crate: descriptors,
//! the mount table, and the current working directory are owned here
//! because something has to own them, but every method is a pure function
//! of its arguments and that owned state — no hidden per-call state.

use std::sync::Mutex;
use std::time::Duration;

use crate::config::Limits;
use crate::error::{Errno, Result};
use crate::memory::GuestMemory;
use crate::signal::{SignalController, WaitOutcome};

use super::descriptor::Descriptors;
use super::file::{DirEntry, File, OpenFlags, PollStatus, SeekFrom, Stat, StatFs};
use super::mount::{FilesystemBackend, MountTable};
use super::path::{self, OpenOutcome};

use std::sync::Arc;

/// `fcntl` command subset this core supports; everything else is `EINVAL`.
#[derive(Debug, Clone, Copy)]
pub enum FcntlCmd {
    DupFd { min_fd: i32 },
    GetFd,
    SetFd { cloexec: bool },
    GetFl,
}

/// One `poll`-equivalent request: a descriptor plus the events it cares
/// about (reusing [`PollStatus`] as the "interested in" bitmask too).
#[derive(Debug, Clone, Copy)]
pub struct PollRequest {
    pub fd: i32,
    pub interest: PollStatus,
}

pub struct VfsDispatcher {
    pub descriptors: Descriptors,
    pub mounts: MountTable,
    cwd: Mutex<String>,
    limits: Limits,
}

impl VfsDispatcher {
    pub fn new(limits: Limits) -> Self {
        Self {
            descriptors: Descriptors::new(limits.max_fd),
            mounts: MountTable::new(),
            cwd: Mutex::new(String::from("/")),
            limits,
        }
    }

    pub fn mount_root(&self, backend: Arc<dyn FilesystemBackend>) {
        self.mounts.mount("/", backend);
    }

    pub fn mount(&self, prefix: impl Into<String>, backend: Arc<dyn FilesystemBackend>) {
        self.mounts.mount(prefix, backend);
    }

    fn cwd(&self) -> String {
        self.cwd.lock().unwrap().clone()
    }

    /// `chdir`: normalize into the CWD buffer, stripping a trailing `/.`
    /// except when the whole path is `/`.
    pub fn chdir(&self, path: &str) -> Result<()> {
        let mut normalized = path::normalize(&self.cwd(), path);
        if normalized != "/" {
            normalized = normalized.trim_end_matches("/.").to_string();
        }
        *self.cwd.lock().unwrap() = normalized;
        Ok(())
    }

    fn absolute(&self, path: &str) -> String {
        path::normalize(&self.cwd(), path)
    }

    // ---- open / close -------------------------------------------------

    pub fn open(&self, path: &str, flags: OpenFlags) -> Result<i32> {
        let absolute = self.absolute(path);
        let file = path::open_with_symlink_handling(
            &self.mounts,
            &self.limits,
            &absolute,
            |fs, subpath| -> Result<OpenOutcome<Arc<File>>> { fs.open(subpath, flags) },
        )?;
        self.descriptors.store(file, flags.cloexec)
    }

    pub fn close(&self, fd: i32) -> Result<()> {
        self.descriptors.close(fd)
    }

    // ---- read / write family -------------------------------------------

    pub fn read(&self, fd: i32, mem: &dyn GuestMemory, addr: usize, len: usize) -> Result<usize> {
        let file = self.descriptors.get(fd).ok_or(Errno::BadFd)?;
        if !mem.check_write(addr, len) {
            return Err(Errno::Fault);
        }
        let mut buf = vec![0u8; len];
        let n = file.read(&mut buf)?;
        mem.copy_to_guest(addr, &buf[..n]);
        Ok(n)
    }

    pub fn pread(
        &self,
        fd: i32,
        mem: &dyn GuestMemory,
        addr: usize,
        len: usize,
        offset: u64,
    ) -> Result<usize> {
        let file = self.descriptors.get(fd).ok_or(Errno::BadFd)?;
        if !mem.check_write(addr, len) {
            return Err(Errno::Fault);
        }
        let mut buf = vec![0u8; len];
        let n = file.pread(offset, &mut buf)?;
        mem.copy_to_guest(addr, &buf[..n]);
        Ok(n)
    }

    /// `readv`: iterate the scatter vector, short-circuiting on the first
    /// short read (one that reads less than its buffer asked for).
    pub fn readv(&self, fd: i32, mem: &dyn GuestMemory, vec: &[(usize, usize)]) -> Result<usize> {
        let mut total = 0;
        for &(addr, len) in vec {
            let n = self.read(fd, mem, addr, len)?;
            total += n;
            if n < len {
                break;
            }
        }
        Ok(total)
    }

    pub fn write(&self, fd: i32, mem: &dyn GuestMemory, addr: usize, len: usize) -> Result<usize> {
        let file = self.descriptors.get(fd).ok_or(Errno::BadFd)?;
        if !mem.check_read(addr, len) {
            return Err(Errno::Fault);
        }
        let buf = mem.copy_from_guest(addr, len);
        file.write(&buf)
    }

    pub fn pwrite(
        &self,
        fd: i32,
        mem: &dyn GuestMemory,
        addr: usize,
        len: usize,
        offset: u64,
    ) -> Result<usize> {
        let file = self.descriptors.get(fd).ok_or(Errno::BadFd)?;
        if !mem.check_read(addr, len) {
            return Err(Errno::Fault);
        }
        let buf = mem.copy_from_guest(addr, len);
        file.pwrite(offset, &buf)
    }

    pub fn writev(&self, fd: i32, mem: &dyn GuestMemory, vec: &[(usize, usize)]) -> Result<usize> {
        let mut total = 0;
        for &(addr, len) in vec {
            total += self.write(fd, mem, addr, len)?;
        }
        Ok(total)
    }

    // ---- seek -----------------------------------------------------------

    /// `lseek`: reports `EOVERFLOW` if the 64-bit result doesn't fit the
    /// 32-bit return the original ABI uses.
    pub fn lseek(&self, fd: i32, from: SeekFrom) -> Result<u32> {
        let pos = self.llseek(fd, from)?;
        u32::try_from(pos).map_err(|_| Errno::Overflow)
    }

    /// `_llseek`: full-width result via the return value rather than an
    /// out-parameter, since this is a Rust API rather than the raw ABI.
    pub fn llseek(&self, fd: i32, from: SeekFrom) -> Result<u64> {
        let file = self.descriptors.get(fd).ok_or(Errno::BadFd)?;
        file.seek(from)
    }

    // ---- directory listing ----------------------------------------------

    pub fn getdents(&self, fd: i32, mem: &dyn GuestMemory, addr: usize, len: usize) -> Result<usize> {
        self.getdents_impl(fd, mem, addr, len, true)
    }

    pub fn getdents64(
        &self,
        fd: i32,
        mem: &dyn GuestMemory,
        addr: usize,
        len: usize,
    ) -> Result<usize> {
        self.getdents_impl(fd, mem, addr, len, false)
    }

    fn getdents_impl(
        &self,
        fd: i32,
        mem: &dyn GuestMemory,
        addr: usize,
        len: usize,
        narrow: bool,
    ) -> Result<usize> {
        let file = self.descriptors.get(fd).ok_or(Errno::BadFd)?;
        if !mem.check_write(addr, len) {
            return Err(Errno::Fault);
        }
        let mut out = Vec::new();
        let mut error = None;
        let start = file.tell();
        let next = file.ops.getdents(start, &mut |entry: DirEntry| {
            match encode_dirent(&entry, narrow) {
                Ok(bytes) => {
                    if out.len() + bytes.len() > len {
                        false
                    } else {
                        out.extend_from_slice(&bytes);
                        true
                    }
                }
                Err(e) => {
                    error = Some(e);
                    false
                }
            }
        })?;
        if let Some(e) = error {
            return Err(e);
        }
        mem.copy_to_guest(addr, &out);
        file.seek(SeekFrom::Start(next))?;
        Ok(out.len())
    }

    // ---- stat family ------------------------------------------------------

    pub fn fstat(&self, fd: i32) -> Result<Stat> {
        let file = self.descriptors.get(fd).ok_or(Errno::BadFd)?;
        file.ops.stat()
    }

    pub fn stat(&self, path: &str) -> Result<Stat> {
        self.stat_path(path, true)
    }

    pub fn lstat(&self, path: &str) -> Result<Stat> {
        self.stat_path(path, false)
    }

    fn stat_path(&self, path: &str, follow: bool) -> Result<Stat> {
        let absolute = self.absolute(path);
        let flags = OpenFlags {
            read: true,
            nofollow: !follow,
            ..Default::default()
        };
        let file = path::open_with_symlink_handling(
            &self.mounts,
            &self.limits,
            &absolute,
            |fs, subpath| -> Result<OpenOutcome<Arc<File>>> { fs.open(subpath, flags) },
        )?;
        file.ops.stat()
    }

    // ---- pathname operations ------------------------------------------

    pub fn link(&self, old: &str, new: &str) -> Result<()> {
        let old = self.absolute(old);
        let new = self.absolute(new);
        self.cross_backend_pathname_op(&old, &new, |fs, old_sub, new_sub| fs.link(old_sub, new_sub))
    }

    pub fn rename(&self, old: &str, new: &str) -> Result<()> {
        let old = self.absolute(old);
        let new = self.absolute(new);
        self.cross_backend_pathname_op(&old, &new, |fs, old_sub, new_sub| {
            fs.rename(old_sub, new_sub)
        })
    }

    fn cross_backend_pathname_op(
        &self,
        old: &str,
        new: &str,
        op: impl Fn(&dyn FilesystemBackend, &str, &str) -> Result<()>,
    ) -> Result<()> {
        let (old_fs, old_sub) = path::find_filesystem(&self.mounts, old)?;
        let (new_fs, new_sub) = path::find_filesystem(&self.mounts, new)?;
        if !Arc::ptr_eq(&old_fs, &new_fs) {
            return Err(Errno::NotPermitted);
        }
        path::resolve_and(&self.mounts, &self.limits, old, |fs, subpath| {
            let _ = subpath;
            op(fs, &old_sub, &new_sub)
        })
    }

    pub fn unlink(&self, path: &str) -> Result<()> {
        let absolute = self.absolute(path);
        path::resolve_and(&self.mounts, &self.limits, &absolute, |fs, subpath| {
            fs.unlink(subpath)
        })
    }

    pub fn symlink(&self, target: &str, link_path: &str) -> Result<()> {
        let absolute = self.absolute(link_path);
        path::resolve_and(&self.mounts, &self.limits, &absolute, |fs, subpath| {
            fs.symlink(target, subpath)
        })
    }

    pub fn readlink(&self, path: &str) -> Result<String> {
        let absolute = self.absolute(path);
        path::resolve_and(&self.mounts, &self.limits, &absolute, |fs, subpath| {
            fs.readlink(subpath)
        })
    }

    pub fn mkdir(&self, path: &str, mode: u32) -> Result<()> {
        let absolute = self.absolute(path);
        path::resolve_and(&self.mounts, &self.limits, &absolute, |fs, subpath| {
            fs.mkdir(subpath, mode)
        })
    }

    pub fn rmdir(&self, path: &str) -> Result<()> {
        let absolute = self.absolute(path);
        path::resolve_and(&self.mounts, &self.limits, &absolute, |fs, subpath| {
            fs.rmdir(subpath)
        })
    }

    // ---- fcntl ----------------------------------------------------------

    pub fn fcntl(&self, fd: i32, cmd: FcntlCmd) -> Result<i32> {
        match cmd {
            FcntlCmd::DupFd { min_fd } => {
                self.descriptors.get(fd).ok_or(Errno::BadFd)?;
                let mut next = min_fd;
                loop {
                    if self.descriptors.get(next).is_none() {
                        return self.descriptors.dup(fd, next, false);
                    }
                    next += 1;
                    if next as usize >= self.limits.max_fd {
                        return Err(Errno::TooManyFiles);
                    }
                }
            }
            FcntlCmd::GetFd => Ok(self.descriptors.cloexec(fd)? as i32),
            FcntlCmd::SetFd { cloexec } => {
                self.descriptors.set_cloexec(fd, cloexec)?;
                Ok(0)
            }
            FcntlCmd::GetFl => {
                let file = self.descriptors.get(fd).ok_or(Errno::BadFd)?;
                let mut bits = 0;
                if file.flags.read && file.flags.write {
                    bits |= 0x0002;
                } else if file.flags.write {
                    bits |= 0x0001;
                }
                if file.flags.append {
                    bits |= 0x0400;
                }
                Ok(bits)
            }
        }
    }

    // ---- supplemental operations -----------------------------------------

    pub fn ioctl(&self, fd: i32, request: u32, arg: u64) -> Result<i64> {
        let file = self.descriptors.get(fd).ok_or(Errno::BadFd)?;
        file.ops.ioctl(request, arg)
    }

    pub fn utimens(&self, fd: i32, atime: i64, mtime: i64) -> Result<()> {
        let file = self.descriptors.get(fd).ok_or(Errno::BadFd)?;
        file.ops.utimens(atime, mtime)
    }

    pub fn fstatfs(&self, fd: i32) -> Result<StatFs> {
        let file = self.descriptors.get(fd).ok_or(Errno::BadFd)?;
        file.ops.statfs()
    }

    pub fn statfs(&self, path: &str) -> Result<StatFs> {
        let absolute = self.absolute(path);
        let (fs, _) = path::find_filesystem(&self.mounts, &absolute)?;
        fs.statfs()
    }

    /// `access`/`faccessat`: implemented as a stat-and-check rather than a
    /// new backend operation, matching how `openat`/`fstatat` delegate to
    /// their non-`at` forms for the "current directory" case.
    pub fn access(&self, path: &str, _mode: u32) -> Result<()> {
        self.stat(path).map(|_| ())
    }

    // ---- poll / select ---------------------------------------------------

    /// Poll `requests`, consulting each file's [`FileOps::poll_status`]
    /// first to short-circuit already-ready descriptors, then blocking
    /// (interruptibly, via the signal controller's wait primitive) until
    /// one becomes ready or `timeout` elapses.
    pub fn poll(
        &self,
        requests: &[PollRequest],
        timeout: Option<Duration>,
        signals: &SignalController,
    ) -> Result<Vec<(i32, PollStatus)>> {
        let check = || -> Vec<(i32, PollStatus)> {
            requests
                .iter()
                .filter_map(|req| {
                    let file = self.descriptors.get(req.fd)?;
                    // `None` means this file never has anything meaningful
                    // to report (no poll handle) — skip it entirely rather
                    // than guessing readiness, matching the original's
                    // `sys_poll`, which only considers fds with a poll
                    // handle at all.
                    let status = file.ops.poll_status()?;
                    let hit = status & req.interest;
                    (!hit.is_empty()).then_some((req.fd, hit))
                })
                .collect()
        };

        let mut ready = check();
        if !ready.is_empty() {
            return Ok(ready);
        }

        match signals.wait_interruptible(
            || {
                ready = check();
                !ready.is_empty()
            },
            timeout,
        ) {
            WaitOutcome::Ready => Ok(ready),
            WaitOutcome::TimedOut => Ok(Vec::new()),
            WaitOutcome::Interrupted => Err(Errno::Interrupted),
        }
    }

    /// `select`: a thin adapter over [`poll`](Self::poll) — build a poll
    /// vector from the three bitsets, translate the result back into
    /// freshly-zeroed output sets.
    pub fn select(
        &self,
        read_fds: &[i32],
        write_fds: &[i32],
        except_fds: &[i32],
        timeout: Option<Duration>,
        signals: &SignalController,
    ) -> Result<(Vec<i32>, Vec<i32>, Vec<i32>)> {
        let mut requests = Vec::new();
        for &fd in read_fds {
            requests.push(PollRequest {
                fd,
                interest: PollStatus::READABLE,
            });
        }
        for &fd in write_fds {
            requests.push(PollRequest {
                fd,
                interest: PollStatus::WRITABLE,
            });
        }
        for &fd in except_fds {
            requests.push(PollRequest {
                fd,
                interest: PollStatus::ERROR,
            });
        }

        let ready = self.poll(&requests, timeout, signals)?;
        let mut out_read = Vec::new();
        let mut out_write = Vec::new();
        let mut out_except = Vec::new();
        for (fd, status) in ready {
            if status.contains(PollStatus::READABLE) && read_fds.contains(&fd) {
                out_read.push(fd);
            }
            if status.contains(PollStatus::WRITABLE) && write_fds.contains(&fd) {
                out_write.push(fd);
            }
            if status.contains(PollStatus::ERROR) && except_fds.contains(&fd) {
                out_except.push(fd);
            }
        }
        Ok((out_read, out_write, out_except))
    }
}

fn encode_dirent(entry: &DirEntry, narrow: bool) -> Result<Vec<u8>> {
    let name_bytes = entry.name.as_bytes();
    let header_len = if narrow { 4 + 4 + 2 + 1 } else { 8 + 8 + 2 + 1 };
    let unpadded = header_len + name_bytes.len() + 1;
    let reclen = unpadded.div_ceil(8) * 8;

    let mut buf = Vec::with_capacity(reclen);
    if narrow {
        let ino: u32 = entry.ino.try_into().map_err(|_| Errno::Overflow)?;
        let offset: u32 = entry.offset.try_into().map_err(|_| Errno::Overflow)?;
        buf.extend_from_slice(&ino.to_le_bytes());
        buf.extend_from_slice(&offset.to_le_bytes());
    } else {
        buf.extend_from_slice(&entry.ino.to_le_bytes());
        buf.extend_from_slice(&entry.offset.to_le_bytes());
    }
    buf.extend_from_slice(&(reclen as u16).to_le_bytes());
    buf.push(if entry.is_dir { 4 } else { 8 });
    buf.extend_from_slice(name_bytes);
    buf.resize(reclen, 0);
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::FlatMemory;
    use crate::signal::hook::test_double::RecordingControl;
    use crate::vfs::mount::test_double::MemFs;

    fn dispatcher() -> VfsDispatcher {
        let d = VfsDispatcher::new(Limits::default());
        d.mount_root(MemFs::new());
        d
    }

    #[test]
    fn open_write_read_round_trip() {
        let d = dispatcher();
        let mem = FlatMemory::new(64);
        let fd = d
            .open(
                "/file.txt",
                OpenFlags {
                    write: true,
                    create: true,
                    ..Default::default()
                },
            )
            .unwrap();
        mem.copy_to_guest(0, b"hello");
        d.write(fd, &mem, 0, 5).unwrap();
        d.close(fd).unwrap();

        let fd = d.open("/file.txt", OpenFlags::from_bits(0x0000)).unwrap();
        let n = d.read(fd, &mem, 8, 16).unwrap();
        assert_eq!(n, 5);
        assert_eq!(mem.copy_from_guest(8, 5), b"hello");
    }

    #[test]
    fn open_missing_without_create_is_not_found() {
        let d = dispatcher();
        assert_eq!(
            d.open("/missing", OpenFlags::from_bits(0x0000)),
            Err(Errno::NotFound)
        );
    }

    #[test]
    fn open_nofollow_on_symlink_reports_invalid() {
        let d = dispatcher();
        d.symlink("/target", "/link").unwrap();
        let result = d.open(
            "/link",
            OpenFlags {
                read: true,
                nofollow: true,
                ..Default::default()
            },
        );
        assert_eq!(result, Err(Errno::Invalid));
    }

    #[test]
    fn lseek_overflow_on_huge_offset() {
        let d = dispatcher();
        let fd = d
            .open(
                "/big.txt",
                OpenFlags {
                    write: true,
                    create: true,
                    ..Default::default()
                },
            )
            .unwrap();
        let result = d.lseek(fd, SeekFrom::Start(u64::from(u32::MAX) + 1));
        assert_eq!(result, Err(Errno::Overflow));
    }

    #[test]
    fn rename_across_backends_is_not_permitted() {
        let d = dispatcher();
        d.mount("/other", MemFs::new());
        d.open(
            "/a.txt",
            OpenFlags {
                write: true,
                create: true,
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(d.rename("/a.txt", "/other/b.txt"), Err(Errno::NotPermitted));
    }

    #[test]
    fn chdir_strips_trailing_dot() {
        let d = dispatcher();
        d.chdir("/a/.").unwrap();
        assert_eq!(d.cwd(), "/a");
    }

    #[test]
    fn poll_times_out_when_nothing_ready() {
        let d = dispatcher();
        let guest = Arc::new(RecordingControl::new());
        let signals = SignalController::new(guest, Limits::default());
        let result = d
            .poll(&[], Some(Duration::from_millis(10)), &signals)
            .unwrap();
        assert!(result.is_empty());
        signals.shutdown();
    }

    #[test]
    fn dup_via_fcntl_picks_lowest_above_min() {
        let d = dispatcher();
        let fd = d
            .open(
                "/f.txt",
                OpenFlags {
                    write: true,
                    create: true,
                    ..Default::default()
                },
            )
            .unwrap();
        let dupped = d.fcntl(fd, FcntlCmd::DupFd { min_fd: 10 }).unwrap();
        assert!(dupped >= 10);
    }
}
