//! File objects and their capability record.
//!
//! A [`File`] is opaque storage (an `Arc<dyn FileOps>` plus the bookkeeping
//! the dispatcher needs: open flags, current position, a path for `*at`
//! resolution). What a given file supports is discovered by calling the
//! corresponding `FileOps` method and checking its `Result`, not by probing
//! a separate capability bitmask — unsupported operations have a documented
//! default return in the trait itself.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::{Errno, Result};

/// Open-mode flags, decoded from the foreign ABI's `O_*` bits.
#[derive(Debug, Clone, Copy, Default)]
pub struct OpenFlags {
    pub read: bool,
    pub write: bool,
    pub append: bool,
    pub create: bool,
    pub truncate: bool,
    pub exclusive: bool,
    pub directory: bool,
    pub nofollow: bool,
    pub cloexec: bool,
}

impl OpenFlags {
    const O_RDONLY: u32 = 0x0000;
    const O_WRONLY: u32 = 0x0001;
    const O_RDWR: u32 = 0x0002;
    const O_ACCMODE: u32 = 0x0003;
    const O_CREAT: u32 = 0x0040;
    const O_EXCL: u32 = 0x0080;
    const O_TRUNC: u32 = 0x0200;
    const O_APPEND: u32 = 0x0400;
    const O_DIRECTORY: u32 = 0x1_0000;
    const O_NOFOLLOW: u32 = 0x2_0000;
    const O_CLOEXEC: u32 = 0x8_0000;

    /// Decode the foreign ABI's `O_*` bitmask (Linux i386 numbering, which
    /// is what the guest program was compiled against).
    pub fn from_bits(bits: u32) -> Self {
        let access = bits & Self::O_ACCMODE;
        Self {
            read: access == Self::O_RDONLY || access == Self::O_RDWR,
            write: access == Self::O_WRONLY || access == Self::O_RDWR,
            append: bits & Self::O_APPEND != 0,
            create: bits & Self::O_CREAT != 0,
            truncate: bits & Self::O_TRUNC != 0,
            exclusive: bits & Self::O_EXCL != 0,
            directory: bits & Self::O_DIRECTORY != 0,
            nofollow: bits & Self::O_NOFOLLOW != 0,
            cloexec: bits & Self::O_CLOEXEC != 0,
        }
    }
}

/// Position reference for `lseek`/`llseek`.
#[derive(Debug, Clone, Copy)]
pub enum SeekFrom {
    Start(u64),
    Current(i64),
    End(i64),
}

/// The wide stat view every backend reports through; the dispatcher narrows
/// this into whichever `stat`/`stat64`/`statx`-shaped struct the guest asked
/// for, reporting `EOVERFLOW` when narrowing loses information.
#[derive(Debug, Clone, Copy, Default)]
pub struct Stat {
    pub dev: u64,
    pub ino: u64,
    pub mode: u32,
    pub nlink: u64,
    pub uid: u32,
    pub gid: u32,
    pub rdev: u64,
    pub size: u64,
    pub blksize: u64,
    pub blocks: u64,
    pub atime: i64,
    pub mtime: i64,
    pub ctime: i64,
}

/// Filesystem-level metadata for `statfs`/`fstatfs`.
#[derive(Debug, Clone, Copy, Default)]
pub struct StatFs {
    pub block_size: u64,
    pub name_max: u64,
    pub blocks: u64,
    pub blocks_free: u64,
    pub blocks_available: u64,
    pub files: u64,
    pub files_free: u64,
}

/// One directory entry, as handed to the `getdents` fill callback.
#[derive(Debug, Clone)]
pub struct DirEntry {
    pub ino: u64,
    pub offset: u64,
    pub name: String,
    pub is_dir: bool,
}

bitflags::bitflags! {
    /// Readiness bits a backend can report through [`FileOps::poll_status`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PollStatus: u32 {
        const READABLE = 0b0001;
        const WRITABLE = 0b0010;
        const ERROR    = 0b0100;
        const HANGUP   = 0b1000;
    }
}

/// The per-file capability record. Every method has a default "unsupported"
/// return so a backend only overrides what it actually provides; the
/// dispatcher treats the default return the same as an explicit refusal.
pub trait FileOps: Send + Sync {
    fn read(&self, _offset: u64, _buf: &mut [u8]) -> Result<usize> {
        Err(Errno::BadFd)
    }

    fn write(&self, _offset: u64, _buf: &[u8]) -> Result<usize> {
        Err(Errno::BadFd)
    }

    fn stat(&self) -> Result<Stat>;

    fn statfs(&self) -> Result<StatFs> {
        Err(Errno::NotImplemented)
    }

    /// Fill directory entries starting at `offset` into `sink`, stopping
    /// when `sink` returns `false` (its buffer is full) or entries run out.
    /// Returns the offset to resume from on the next call.
    fn getdents(&self, _offset: u64, _sink: &mut dyn FnMut(DirEntry) -> bool) -> Result<u64> {
        Err(Errno::NotADirectory)
    }

    fn ioctl(&self, _request: u32, _arg: u64) -> Result<i64> {
        Err(Errno::NotATty)
    }

    fn utimens(&self, _atime: i64, _mtime: i64) -> Result<()> {
        Err(Errno::NotImplemented)
    }

    /// `None` means this file never has anything meaningful to report
    /// (poll on it always reports readable-for-write-style pass-through,
    /// per the dispatcher's fallback rule).
    fn poll_status(&self) -> Option<PollStatus> {
        None
    }

    fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// An open file: the backend's capability object plus the bookkeeping the
/// dispatcher and descriptor table need. Reference-counted by `Arc` sharing
/// (cloning a `File` and installing both clones under different descriptors
/// is how `dup` is implemented), so there is no separate manual refcount.
pub struct File {
    pub ops: Arc<dyn FileOps>,
    pub flags: OpenFlags,
    position: AtomicU64,
    pub path: Mutex<Option<String>>,
}

impl File {
    pub fn new(ops: Arc<dyn FileOps>, flags: OpenFlags) -> Arc<Self> {
        Arc::new(Self {
            ops,
            flags,
            position: AtomicU64::new(0),
            path: Mutex::new(None),
        })
    }

    pub fn with_path(ops: Arc<dyn FileOps>, flags: OpenFlags, path: String) -> Arc<Self> {
        let file = Self::new(ops, flags);
        *file.path.lock().unwrap() = Some(path);
        file
    }

    pub fn read(&self, buf: &mut [u8]) -> Result<usize> {
        if !self.flags.read {
            return Err(Errno::BadFd);
        }
        let pos = self.position.load(Ordering::Relaxed);
        let n = self.ops.read(pos, buf)?;
        self.position.fetch_add(n as u64, Ordering::Relaxed);
        Ok(n)
    }

    pub fn pread(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        if !self.flags.read {
            return Err(Errno::BadFd);
        }
        self.ops.read(offset, buf)
    }

    pub fn write(&self, buf: &[u8]) -> Result<usize> {
        if !self.flags.write {
            return Err(Errno::BadFd);
        }
        let pos = if self.flags.append {
            self.ops.stat()?.size
        } else {
            self.position.load(Ordering::Relaxed)
        };
        let n = self.ops.write(pos, buf)?;
        self.position.store(pos + n as u64, Ordering::Relaxed);
        Ok(n)
    }

    pub fn pwrite(&self, offset: u64, buf: &[u8]) -> Result<usize> {
        if !self.flags.write {
            return Err(Errno::BadFd);
        }
        self.ops.write(offset, buf)
    }

    pub fn seek(&self, from: SeekFrom) -> Result<u64> {
        let current = self.position.load(Ordering::Relaxed);
        let new_pos = match from {
            SeekFrom::Start(offset) => offset,
            SeekFrom::Current(delta) => offset_by(current, delta)?,
            SeekFrom::End(delta) => {
                let size = self.ops.stat()?.size;
                offset_by(size, delta)?
            }
        };
        self.position.store(new_pos, Ordering::Relaxed);
        Ok(new_pos)
    }

    pub fn tell(&self) -> u64 {
        self.position.load(Ordering::Relaxed)
    }
}

fn offset_by(base: u64, delta: i64) -> Result<u64> {
    if delta < 0 {
        base.checked_sub((-delta) as u64).ok_or(Errno::Invalid)
    } else {
        base.checked_add(delta as u64).ok_or(Errno::Overflow)
    }
}

#[cfg(any(test, feature = "testing"))]
pub mod test_double {
    use super::*;
    use std::sync::Mutex as StdMutex;

    /// An in-memory `FileOps` backed by a growable byte buffer, used by
    /// both unit and integration tests in place of a real backend.
    pub struct MemFile {
        pub bytes: StdMutex<Vec<u8>>,
    }

    impl MemFile {
        pub fn new(initial: Vec<u8>) -> Arc<Self> {
            Arc::new(Self {
                bytes: StdMutex::new(initial),
            })
        }
    }

    impl FileOps for MemFile {
        fn read(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
            let bytes = self.bytes.lock().unwrap();
            let offset = offset as usize;
            if offset >= bytes.len() {
                return Ok(0);
            }
            let n = buf.len().min(bytes.len() - offset);
            buf[..n].copy_from_slice(&bytes[offset..offset + n]);
            Ok(n)
        }

        fn write(&self, offset: u64, data: &[u8]) -> Result<usize> {
            let mut bytes = self.bytes.lock().unwrap();
            let offset = offset as usize;
            if bytes.len() < offset + data.len() {
                bytes.resize(offset + data.len(), 0);
            }
            bytes[offset..offset + data.len()].copy_from_slice(data);
            Ok(data.len())
        }

        fn stat(&self) -> Result<Stat> {
            Ok(Stat {
                size: self.bytes.lock().unwrap().len() as u64,
                mode: 0o100644,
                nlink: 1,
                ..Default::default()
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_double::MemFile;
    use super::*;

    #[test]
    fn read_and_write_advance_position() {
        let file = File::new(MemFile::new(vec![]), OpenFlags::from_bits(0x0002));
        assert_eq!(file.write(b"hello").unwrap(), 5);
        assert_eq!(file.tell(), 5);
        file.seek(SeekFrom::Start(0)).unwrap();
        let mut buf = [0u8; 5];
        assert_eq!(file.read(&mut buf).unwrap(), 5);
        assert_eq!(&buf, b"hello");
    }

    #[test]
    fn read_on_write_only_file_is_ebadf() {
        let file = File::new(MemFile::new(vec![1, 2, 3]), OpenFlags::from_bits(0x0001));
        let mut buf = [0u8; 3];
        assert_eq!(file.read(&mut buf), Err(Errno::BadFd));
    }

    #[test]
    fn append_always_writes_at_end() {
        let file = File::new(
            MemFile::new(b"abc".to_vec()),
            OpenFlags {
                write: true,
                append: true,
                ..Default::default()
            },
        );
        file.write(b"def").unwrap();
        let mut buf = [0u8; 6];
        file.pread(0, &mut buf).unwrap();
        assert_eq!(&buf, b"abcdef");
    }

    #[test]
    fn seek_before_start_is_invalid() {
        let file = File::new(MemFile::new(vec![1, 2, 3]), OpenFlags::from_bits(0x0000));
        assert_eq!(file.seek(SeekFrom::Current(-1)), Err(Errno::Invalid));
    }
}
