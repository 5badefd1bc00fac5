//! VFS Dispatcher: path resolution, mount table, descriptor table, and the
//! syscall-shaped operations built on top of them.

pub mod descriptor;
pub mod dispatcher;
pub mod file;
pub mod mount;
pub mod path;

pub use descriptor::Descriptors;
pub use dispatcher::{FcntlCmd, PollRequest, VfsDispatcher};
pub use file::{DirEntry, File, FileOps, OpenFlags, PollStatus, SeekFrom, Stat, StatFs};
pub use mount::{FilesystemBackend, MountTable};
