//! Error taxonomy shared by the signal and VFS subsystems.
//!
//! The foreign ABI surfaces errors as small negative integers. [`Errno`] is
//! the one flat type every fallible entry point in this crate returns
//! (wrapped in `Result`); callers that need the raw integer for a syscall
//! return value call [`Errno::raw`].

use thiserror::Error;

/// A guest-facing error code, or an internal host failure that degrades the
/// affected subsystem without surfacing anything more specific to the guest.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Errno {
    /// `EFAULT` — a guest pointer failed the read/write-ability check.
    #[error("EFAULT: invalid guest pointer")]
    Fault,
    /// `EBADF` — the file descriptor does not name an open file.
    #[error("EBADF: bad file descriptor")]
    BadFd,
    /// `EMFILE` — the descriptor table has no free slot.
    #[error("EMFILE: too many open files")]
    TooManyFiles,
    /// `EINVAL` — an argument violates the operation's precondition.
    #[error("EINVAL: invalid argument")]
    Invalid,
    /// `ENOENT` — a path component does not exist.
    #[error("ENOENT: no such file or directory")]
    NotFound,
    /// `ELOOP` — symlink resolution exceeded `MAX_SYMLINK_LEVEL`.
    #[error("ELOOP: too many levels of symbolic links")]
    LoopLimit,
    /// `EPERM` — cross-backend link/rename, or another disallowed operation.
    #[error("EPERM: operation not permitted")]
    NotPermitted,
    /// `EOVERFLOW` — a 64-bit quantity does not fit the caller's narrow view.
    #[error("EOVERFLOW: value too large for destination type")]
    Overflow,
    /// `ENOSYS` — the syscall is a deliberate stub.
    #[error("ENOSYS: function not implemented")]
    NotImplemented,
    /// `ESRCH` — the target process does not exist (or is unsupported).
    #[error("ESRCH: no such process")]
    NoSuchProcess,
    /// `ENOTTY` — `ioctl` request not supported by this file's capability set.
    #[error("ENOTTY: inappropriate ioctl for device")]
    NotATty,
    /// `EEXIST` — the target of a create-like operation already exists.
    #[error("EEXIST: file exists")]
    Exists,
    /// `ENOTDIR` — a non-directory was used where a directory was required.
    #[error("ENOTDIR: not a directory")]
    NotADirectory,
    /// `EISDIR` — a directory was used where a non-directory was required.
    #[error("EISDIR: is a directory")]
    IsADirectory,
    /// `EIO` — the backing file or filesystem object reported an I/O error.
    #[error("EIO: {0}")]
    Io(String),
    /// `EINTR` — a signal interrupted a blocking wait before it completed.
    #[error("EINTR: interrupted system call")]
    Interrupted,
    /// Not a guest-visible errno: an internal host failure (channel send to
    /// a dead worker, a poisoned mutex). Logged by the caller; never
    /// produced by guest-supplied bad input alone.
    #[error("internal failure: {0}")]
    Internal(String),
}

impl Errno {
    /// The raw negative value a syscall entry point returns to the guest,
    /// matching the foreign ABI's errno numbering (Linux i386 values).
    pub fn raw(&self) -> i32 {
        match self {
            Errno::Fault => -14,
            Errno::BadFd => -9,
            Errno::TooManyFiles => -24,
            Errno::Invalid => -22,
            Errno::NotFound => -2,
            Errno::LoopLimit => -40,
            Errno::NotPermitted => -1,
            Errno::Overflow => -75,
            Errno::NotImplemented => -38,
            Errno::NoSuchProcess => -3,
            Errno::NotATty => -25,
            Errno::Exists => -17,
            Errno::NotADirectory => -20,
            Errno::IsADirectory => -21,
            Errno::Io(_) => -5,
            Errno::Interrupted => -4,
            // Internal failures are never supposed to reach the guest
            // directly, but if one does leak through a dispatch boundary
            // that forgot to log-and-downgrade it, report it as EIO rather
            // than panicking.
            Errno::Internal(_) => -5,
        }
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = core::result::Result<T, Errno>;
