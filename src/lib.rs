//! A read/write, user-space driver for the ext2 filesystem.
//!
//! `ext2fs` mounts a disk image (or any random-access backing file) and
//! exposes it through a [`File`] object model: directories, regular
//! files, and symlinks, backed by the same on-disk structures the kernel
//! driver uses — superblock, block group descriptor table, inode table,
//! and block/inode allocation bitmaps.
//!
//! Access is single-threaded and cooperative (see [`Ext2Fs`]): there is
//! no internal locking, and callers must not share a mounted filesystem
//! across threads.
//!
//! ```no_run
//! use ext2fs::Ext2Fs;
//!
//! let fs = Ext2Fs::mount("disk.img")?;
//! let root = fs.root_dir()?;
//! for entry in root.files()? {
//!     let entry = entry?;
//!     println!("{}", entry.name());
//! }
//! # Ok::<(), ext2fs::Error>(())
//! ```

mod bgdt;
mod bitmap;
mod device;
mod dirent;
mod error;
mod file;
mod fs;
mod inode;
mod superblock;
mod util;

pub use device::Device;
pub use error::{Error, Result};
pub use file::{BlockIter, File};
pub use fs::{Ext2Fs, IntegrityReport, ScanReport};
pub use inode::ROOT_INODE;
pub use superblock::{CreatorOs, ErrorAction, State};
pub use util::ByteSize;
