//! The Descriptor Table.
//!
//! Fixed-capacity, ordered array of optional file references plus a
//! parallel close-on-exec bitset. Accessed only by the guest thread under
//! the single-guest-thread assumption (see the module docs in
//! [`crate::vfs`]), but kept behind a lock anyway so it can later gain
//! real concurrent access without changing its public shape.

use std::sync::{Arc, Mutex};

use crate::error::{Errno, Result};

use super::file::File;

struct Slot {
    file: Arc<File>,
    cloexec: bool,
}

struct Table {
    slots: Vec<Option<Slot>>,
}

/// `fd`-indexed storage for open files, with the lowest-free-slot
/// allocation policy `store`/`dup` both rely on.
pub struct Descriptors {
    inner: Mutex<Table>,
    max_fd: usize,
}

impl Descriptors {
    pub fn new(max_fd: usize) -> Self {
        Self {
            inner: Mutex::new(Table { slots: Vec::new() }),
            max_fd,
        }
    }

    /// Install `file` at the lowest free index, or `EMFILE` if the table
    /// is at capacity.
    pub fn store(&self, file: Arc<File>, cloexec: bool) -> Result<i32> {
        let mut table = self.inner.lock().unwrap();
        let slot = Slot { file, cloexec };
        if let Some(index) = table.slots.iter().position(Option::is_none) {
            table.slots[index] = Some(slot);
            return Ok(index as i32);
        }
        if table.slots.len() >= self.max_fd {
            return Err(Errno::TooManyFiles);
        }
        table.slots.push(Some(slot));
        Ok((table.slots.len() - 1) as i32)
    }

    /// Look up `fd`, returning `None` on an out-of-range or empty slot.
    pub fn get(&self, fd: i32) -> Option<Arc<File>> {
        let table = self.inner.lock().unwrap();
        let index = usize::try_from(fd).ok()?;
        table.slots.get(index)?.as_ref().map(|s| s.file.clone())
    }

    /// Remove `fd`, invoking the file's close operation if this was the
    /// last reference (judged by `Arc` strong count, since a `dup`'d file
    /// is simply the same `Arc` installed under two slots).
    pub fn close(&self, fd: i32) -> Result<()> {
        let mut table = self.inner.lock().unwrap();
        let index = usize::try_from(fd).map_err(|_| Errno::BadFd)?;
        let slot = table
            .slots
            .get_mut(index)
            .ok_or(Errno::BadFd)?
            .take()
            .ok_or(Errno::BadFd)?;
        if Arc::strong_count(&slot.file) == 1 {
            slot.file.ops.close()?;
        }
        Ok(())
    }

    /// `dup2`-shaped duplication. `newfd == -1` means "lowest free slot";
    /// `newfd == fd` is `EINVAL`; otherwise any existing occupant of
    /// `newfd` is closed first.
    pub fn dup(&self, fd: i32, newfd: i32, cloexec: bool) -> Result<i32> {
        let file = self.get(fd).ok_or(Errno::BadFd)?;
        if newfd == -1 {
            return self.store(file, cloexec);
        }
        if newfd == fd {
            return Err(Errno::Invalid);
        }
        let index = usize::try_from(newfd).map_err(|_| Errno::Invalid)?;
        if index >= self.max_fd {
            return Err(Errno::Invalid);
        }

        let mut table = self.inner.lock().unwrap();
        if index >= table.slots.len() {
            table.slots.resize_with(index + 1, || None);
        }
        if let Some(old) = table.slots[index].take() {
            if Arc::strong_count(&old.file) == 1 {
                let _ = old.file.ops.close();
            }
        }
        table.slots[index] = Some(Slot { file, cloexec });
        Ok(newfd)
    }

    /// Set or query the close-on-exec bit for `fd`.
    pub fn set_cloexec(&self, fd: i32, cloexec: bool) -> Result<()> {
        let mut table = self.inner.lock().unwrap();
        let index = usize::try_from(fd).map_err(|_| Errno::BadFd)?;
        let slot = table.slots.get_mut(index).ok_or(Errno::BadFd)?.as_mut().ok_or(Errno::BadFd)?;
        slot.cloexec = cloexec;
        Ok(())
    }

    pub fn cloexec(&self, fd: i32) -> Result<bool> {
        let table = self.inner.lock().unwrap();
        let index = usize::try_from(fd).map_err(|_| Errno::BadFd)?;
        let slot = table.slots.get(index).ok_or(Errno::BadFd)?.as_ref().ok_or(Errno::BadFd)?;
        Ok(slot.cloexec)
    }

    /// Close every slot with `cloexec` set. Called at `execve` time,
    /// alongside resetting the umask to its configured default.
    pub fn exec_close_cloexec(&self) {
        let mut table = self.inner.lock().unwrap();
        for slot in table.slots.iter_mut() {
            if slot.as_ref().is_some_and(|s| s.cloexec) {
                if let Some(s) = slot.take() {
                    if Arc::strong_count(&s.file) == 1 {
                        let _ = s.file.ops.close();
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vfs::file::{test_double::MemFile, OpenFlags};

    fn open_file() -> Arc<File> {
        File::new(MemFile::new(vec![1, 2, 3]), OpenFlags::from_bits(0x0000))
    }

    #[test]
    fn store_allocates_lowest_free_slot() {
        let table = Descriptors::new(8);
        let a = table.store(open_file(), false).unwrap();
        let b = table.store(open_file(), false).unwrap();
        assert_eq!(a, 0);
        assert_eq!(b, 1);
        table.close(a).unwrap();
        let c = table.store(open_file(), false).unwrap();
        assert_eq!(c, 0);
    }

    #[test]
    fn dup_self_is_einval() {
        let table = Descriptors::new(8);
        let fd = table.store(open_file(), false).unwrap();
        assert_eq!(table.dup(fd, fd, false), Err(Errno::Invalid));
    }

    #[test]
    fn dup_shares_identity_until_last_close() {
        let table = Descriptors::new(8);
        let fd = table.store(open_file(), false).unwrap();
        let dup_fd = table.dup(fd, -1, false).unwrap();

        let a = table.get(fd).unwrap();
        let b = table.get(dup_fd).unwrap();
        assert!(Arc::ptr_eq(&a, &b));

        table.close(fd).unwrap();
        assert!(table.get(dup_fd).is_some());
    }

    #[test]
    fn store_reports_emfile_at_capacity() {
        let table = Descriptors::new(2);
        table.store(open_file(), false).unwrap();
        table.store(open_file(), false).unwrap();
        assert_eq!(table.store(open_file(), false), Err(Errno::TooManyFiles));
    }

    #[test]
    fn exec_close_cloexec_only_touches_flagged_slots() {
        let table = Descriptors::new(8);
        let kept = table.store(open_file(), false).unwrap();
        let closed = table.store(open_file(), true).unwrap();
        table.exec_close_cloexec();
        assert!(table.get(kept).is_some());
        assert!(table.get(closed).is_none());
    }

    #[test]
    fn get_out_of_range_is_none() {
        let table = Descriptors::new(8);
        assert!(table.get(99).is_none());
        assert!(table.get(-1).is_none());
    }
}
