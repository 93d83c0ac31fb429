//! The random-access byte-addressable backing store (spec.md §4.1).
//!
//! Hides whether the backing is a plain disk image, a loop device, or a
//! raw block device: from here down it is just a path opened read/write.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// A mounted (or not-yet-mounted) backing store.
///
/// All positional I/O on a given `Device` is expected to be issued by a
/// single owning thread (spec.md §5) — the type itself does nothing to
/// enforce that beyond requiring `&mut self` for every operation.
pub struct Device {
    path: PathBuf,
    file: Option<File>,
}

impl Device {
    /// Creates a device bound to `path`, not yet mounted.
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            file: None,
        }
    }

    /// Returns whether the device is currently mounted.
    pub fn is_mounted(&self) -> bool {
        self.file.is_some()
    }

    /// Opens the backing file for reading and writing.
    pub fn mount(&mut self) -> Result<()> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&self.path)?;
        self.file = Some(file);
        Ok(())
    }

    /// Flushes and fsyncs the backing file, then closes it.
    pub fn unmount(&mut self) -> Result<()> {
        if let Some(file) = self.file.take() {
            file.sync_all()?;
        }
        Ok(())
    }

    /// Reads exactly `size` bytes starting at `offset`.
    ///
    /// Fails with [`Error::IoShort`] if fewer bytes are available.
    pub fn read(&mut self, offset: u64, size: usize) -> Result<Vec<u8>> {
        let file = self.file.as_mut().ok_or_else(not_mounted)?;
        file.seek(SeekFrom::Start(offset))?;
        let mut buf = vec![0u8; size];
        let mut total = 0;
        loop {
            match file.read(&mut buf[total..]) {
                Ok(0) => break,
                Ok(n) => total += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
            if total == size {
                break;
            }
        }
        if total < size {
            log::trace!("short read at offset {offset}: wanted {size}, got {total}");
            return Err(Error::IoShort {
                expected: size,
                actual: total,
            });
        }
        log::trace!("read {size} bytes at offset {offset}");
        Ok(buf)
    }

    /// Writes `bytes` starting at `offset`.
    ///
    /// Fails with [`Error::IoShort`] if fewer bytes than `bytes.len()` could
    /// be written.
    pub fn write(&mut self, offset: u64, bytes: &[u8]) -> Result<()> {
        let file = self.file.as_mut().ok_or_else(not_mounted)?;
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(bytes).map_err(|e| {
            if e.kind() == std::io::ErrorKind::WriteZero {
                Error::IoShort {
                    expected: bytes.len(),
                    actual: 0,
                }
            } else {
                e.into()
            }
        })?;
        log::trace!("wrote {} bytes at offset {offset}", bytes.len());
        Ok(())
    }
}

fn not_mounted() -> Error {
    Error::BadImage("device is not mounted".to_string())
}
