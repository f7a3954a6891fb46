//! Whole-file shared memory mappings.
//!
//! The bootloader maps exactly two files: its own image (read-only, to find
//! the embedded archive) and the extracted user program (read-write, so the
//! patcher's in-place writes reach disk on unmap). Both are always mapped in
//! full; dropping a map unmaps the region and closes the descriptor.

use std::fs::{File, OpenOptions};
use std::ops::{Deref, DerefMut};
use std::path::Path;

use memmap2::{Mmap, MmapMut};

use crate::error::Error;

/// A read-only shared mapping of an entire file.
pub struct FileMap {
    map: Mmap,
}

impl FileMap {
    /// Open `path` and map its full length read-only.
    ///
    /// `/proc/self/exe` is the only path the bootloader opens through this:
    /// it yields the packaged executable's own on-disk image.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, Error> {
        let file = File::open(path)?;
        // Safety: the mapping is private to this invocation and read-only;
        // the packaged executable does not rewrite itself while running.
        let map = unsafe { Mmap::map(&file)? };
        Ok(Self { map })
    }
}

impl Deref for FileMap {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.map
    }
}

/// A read-write shared mapping of an entire file.
///
/// Writes through the mapping land in the page cache immediately and are
/// forced out by [`FileMapMut::flush`]; the patcher flushes before the
/// child process ever opens the file.
pub struct FileMapMut {
    map: MmapMut,
}

impl FileMapMut {
    /// Open `path` read-write and map its full length shared.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, Error> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        // Safety: the file lives under this invocation's unique bundle
        // directory, so no other process maps or truncates it.
        let map = unsafe { MmapMut::map_mut(&file)? };
        Ok(Self { map })
    }

    /// Write all dirty pages back to the file.
    pub fn flush(&self) -> Result<(), Error> {
        self.map.flush()?;
        Ok(())
    }
}

impl Deref for FileMapMut {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.map
    }
}

impl DerefMut for FileMapMut {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.map
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn rw_map_writes_back() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(b"before!").unwrap();
        f.flush().unwrap();

        {
            let mut map = FileMapMut::open(f.path()).unwrap();
            map[..6].copy_from_slice(b"after:");
            map.flush().unwrap();
        }

        assert_eq!(std::fs::read(f.path()).unwrap(), b"after:!");
    }

    #[test]
    fn ro_map_sees_contents() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(b"mapped bytes").unwrap();
        f.flush().unwrap();

        let map = FileMap::open(f.path()).unwrap();
        assert_eq!(&map[..], b"mapped bytes");
    }
}
