//! The mount table and the filesystem-level backend contract.

use std::sync::{Arc, RwLock};

use crate::error::Result;

use super::file::{File, OpenFlags, StatFs};
use super::path::OpenOutcome;

/// Filesystem-level operations a backend must provide. Per-file operations
/// (read, write, stat, ...) live on [`super::file::FileOps`], obtained by
/// opening; this trait covers everything that happens before a file object
/// exists, plus filesystem-wide metadata.
///
/// Backends are external collaborators: they must honor the "open returns
/// `IsSymlink(target)` if the final component is itself a symlink" contract
/// for [`super::path::open_with_symlink_handling`] to work.
pub trait FilesystemBackend: Send + Sync {
    fn open(&self, path: &str, flags: OpenFlags) -> Result<OpenOutcome<Arc<File>>>;
    fn readlink(&self, path: &str) -> Result<String>;
    fn link(&self, old: &str, new: &str) -> Result<()>;
    fn unlink(&self, path: &str) -> Result<()>;
    fn symlink(&self, target: &str, link_path: &str) -> Result<()>;
    fn mkdir(&self, path: &str, mode: u32) -> Result<()>;
    fn rmdir(&self, path: &str) -> Result<()>;
    fn rename(&self, old: &str, new: &str) -> Result<()>;
    fn statfs(&self) -> Result<StatFs>;

    /// Identity used to check that `link`/`rename` source and destination
    /// share a backend (cross-backend is `EPERM`). Default: pointer
    /// identity is assumed distinct per `Arc`, so callers should compare
    /// `Arc::ptr_eq` on the trait object rather than this method — kept
    /// here only as a documented hook for backends that alias.
    fn name(&self) -> &str;
}

struct Mount {
    prefix: String,
    backend: Arc<dyn FilesystemBackend>,
}

/// Ordered list of mounted filesystems. Lookup is longest-prefix by
/// character match over the normalized path, scanning in insertion order
/// among ties (matching the distilled spec's "first whose prefix matches").
pub struct MountTable {
    mounts: RwLock<Vec<Mount>>,
}

impl MountTable {
    pub fn new() -> Self {
        Self {
            mounts: RwLock::new(Vec::new()),
        }
    }

    /// Mount `backend` at `prefix` (must be an already-normalized absolute
    /// path, `/` for the root filesystem).
    pub fn mount(&self, prefix: impl Into<String>, backend: Arc<dyn FilesystemBackend>) {
        let prefix = prefix.into();
        let mut mounts = self.mounts.write().unwrap();
        let insert_at = mounts
            .iter()
            .position(|m| m.prefix.len() < prefix.len())
            .unwrap_or(mounts.len());
        mounts.insert(insert_at, Mount { prefix, backend });
    }

    /// Find the backend whose mount prefix is the longest match for
    /// `path`, returning it (as a cloned `Arc`, so the caller can use it
    /// after the table's internal lock is released) alongside the
    /// filesystem-relative subpath.
    pub fn longest_prefix(&self, path: &str) -> Option<(Arc<dyn FilesystemBackend>, String)> {
        let mounts = self.mounts.read().unwrap();
        let hit = mounts.iter().find(|m| {
            if m.prefix == "/" {
                true
            } else {
                path == m.prefix || path.starts_with(&format!("{}/", m.prefix))
            }
        })?;
        let remainder = path[hit.prefix.len()..].trim_start_matches('/').to_string();
        Some((hit.backend.clone(), remainder))
    }
}

impl Default for MountTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(any(test, feature = "testing"))]
pub mod test_double {
    use super::*;
    use crate::error::Errno;
    use crate::vfs::file::test_double::MemFile;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// A trivial in-memory filesystem backend: a flat map from path to
    /// bytes, with a separate symlink map. Enough to exercise the
    /// resolution envelope and the dispatcher end to end.
    pub struct MemFs {
        files: Mutex<HashMap<String, Arc<File>>>,
        symlinks: Mutex<HashMap<String, String>>,
        dirs: Mutex<std::collections::HashSet<String>>,
    }

    impl MemFs {
        pub fn new() -> Arc<Self> {
            let mut dirs = std::collections::HashSet::new();
            dirs.insert(String::from(""));
            Arc::new(Self {
                files: Mutex::new(HashMap::new()),
                symlinks: Mutex::new(HashMap::new()),
                dirs: Mutex::new(dirs),
            })
        }

        fn key(path: &str) -> String {
            path.trim_start_matches('/').to_string()
        }
    }

    impl FilesystemBackend for MemFs {
        fn open(&self, path: &str, flags: OpenFlags) -> Result<OpenOutcome<Arc<File>>> {
            let key = Self::key(path);
            if let Some(target) = self.symlinks.lock().unwrap().get(&key) {
                if flags.nofollow {
                    return Err(Errno::Invalid);
                }
                return Ok(OpenOutcome::IsSymlink(target.clone()));
            }
            let mut files = self.files.lock().unwrap();
            if let Some(existing) = files.get(&key) {
                if flags.exclusive && flags.create {
                    return Err(Errno::Exists);
                }
                return Ok(OpenOutcome::Opened(File::with_path(
                    existing.ops.clone(),
                    flags,
                    path.to_string(),
                )));
            }
            if !flags.create {
                return Err(Errno::NotFound);
            }
            let ops = MemFile::new(vec![]);
            let file = File::with_path(ops, flags, path.to_string());
            files.insert(key, file.clone());
            Ok(OpenOutcome::Opened(file))
        }

        fn readlink(&self, path: &str) -> Result<String> {
            self.symlinks
                .lock()
                .unwrap()
                .get(&Self::key(path))
                .cloned()
                .ok_or(Errno::NotFound)
        }

        fn link(&self, old: &str, new: &str) -> Result<()> {
            let mut files = self.files.lock().unwrap();
            let file = files.get(&Self::key(old)).cloned().ok_or(Errno::NotFound)?;
            files.insert(Self::key(new), file);
            Ok(())
        }

        fn unlink(&self, path: &str) -> Result<()> {
            let key = Self::key(path);
            if self.files.lock().unwrap().remove(&key).is_some()
                || self.symlinks.lock().unwrap().remove(&key).is_some()
            {
                Ok(())
            } else {
                Err(Errno::NotFound)
            }
        }

        fn symlink(&self, target: &str, link_path: &str) -> Result<()> {
            let key = Self::key(link_path);
            if self.files.lock().unwrap().contains_key(&key) {
                return Err(Errno::Exists);
            }
            self.symlinks.lock().unwrap().insert(key, target.to_string());
            Ok(())
        }

        fn mkdir(&self, path: &str, _mode: u32) -> Result<()> {
            let key = Self::key(path);
            let mut dirs = self.dirs.lock().unwrap();
            if dirs.contains(&key) {
                return Err(Errno::Exists);
            }
            dirs.insert(key);
            Ok(())
        }

        fn rmdir(&self, path: &str) -> Result<()> {
            let key = Self::key(path);
            if self.dirs.lock().unwrap().remove(&key) {
                Ok(())
            } else {
                Err(Errno::NotFound)
            }
        }

        fn rename(&self, old: &str, new: &str) -> Result<()> {
            let mut files = self.files.lock().unwrap();
            let file = files.remove(&Self::key(old)).ok_or(Errno::NotFound)?;
            files.insert(Self::key(new), file);
            Ok(())
        }

        fn statfs(&self) -> Result<StatFs> {
            Ok(StatFs {
                block_size: 4096,
                name_max: 255,
                blocks: 1 << 20,
                blocks_free: 1 << 19,
                blocks_available: 1 << 19,
                files: 1 << 16,
                files_free: 1 << 15,
            })
        }

        fn name(&self) -> &str {
            "memfs"
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_double::MemFs;
    use super::*;

    #[test]
    fn longest_prefix_prefers_more_specific_mount() {
        let table = MountTable::new();
        table.mount("/", MemFs::new());
        table.mount("/mnt/data", MemFs::new());

        let (_backend, subpath) = table.longest_prefix("/mnt/data/file.txt").unwrap();
        assert_eq!(subpath, "file.txt");
    }

    #[test]
    fn root_mount_matches_everything_else() {
        let table = MountTable::new();
        table.mount("/", MemFs::new());
        let (_backend, subpath) = table.longest_prefix("/etc/passwd").unwrap();
        assert_eq!(subpath, "etc/passwd");
    }

    #[test]
    fn no_mount_matches_is_not_found() {
        let table = MountTable::new();
        assert!(table.longest_prefix("/anything").is_none());
    }
}
