use std::ffi::OsStr;
use std::fs::{self, OpenOptions};
use std::io::{self, Read, Write};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs as unix_fs;
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};

use nix::sys::stat::{makedev, mknod, Mode, SFlag};
use nix::unistd::mkfifo;
use tracing::{debug, warn};

use super::header::{HeaderRecord, TypeFlag, BLOCK_SIZE};
use crate::error::{ArchiveError, Error};

/// Permission bits an entry mode can carry (rwx for all, setuid/setgid,
/// sticky).
const MODE_BITS: u32 = 0o7777;

/// Streaming extractor: reads entries strictly forward from `reader` and
/// recreates them under `dest`.
///
/// Paths come out of the archive as-is and are only prefixed with the
/// destination; the archive is trusted packager output, not arbitrary user
/// input. Ownership and timestamps are deliberately not restored.
pub struct Extractor<R> {
    reader: R,
    dest: PathBuf,
}

#[derive(Clone, Copy, PartialEq)]
enum Kind {
    Regular,
    Directory,
    Symlink,
    HardLink,
    CharDevice,
    BlockDevice,
    Fifo,
}

impl<R: Read> Extractor<R> {
    /// New extractor writing entries under `dest`.
    pub fn new(reader: R, dest: impl Into<PathBuf>) -> Self {
        Self {
            reader,
            dest: dest.into(),
        }
    }

    /// Extract every entry up to the end-of-archive marker.
    pub fn unpack_all(mut self) -> Result<(), Error> {
        let mut long_name: Option<Vec<u8>> = None;
        let mut long_link: Option<Vec<u8>> = None;

        loop {
            let mut block = [0u8; BLOCK_SIZE];
            self.read_full(&mut block)?;
            if block.iter().all(|&b| b == 0) {
                debug!("end-of-archive marker");
                return Ok(());
            }

            let header = HeaderRecord::parser(&mut &block[..])
                .map_err(|_| ArchiveError::InvalidHeader)?;

            match header.typeflag() {
                TypeFlag::GnuLongName => {
                    long_name = Some(self.read_string_content(&header)?);
                    continue;
                }
                TypeFlag::GnuLongLink => {
                    long_link = Some(self.read_string_content(&header)?);
                    continue;
                }
                _ => {}
            }

            let path = long_name.take().unwrap_or_else(|| header.path_bytes());
            let link = long_link.take().unwrap_or_else(|| header.link_bytes());
            self.extract_entry(&header, &path, &link)?;
        }
    }

    fn extract_entry(&mut self, header: &HeaderRecord, path: &[u8], link: &[u8]) -> Result<(), Error> {
        let out = join_under(&self.dest, path);
        if let Some(parent) = out.parent() {
            fs::create_dir_all(parent)?;
        }

        let mode = header.mode()?;
        let kind = kind_of(header.typeflag(), path);
        debug!(
            path = %out.display(),
            typeflag = ?header.typeflag(),
            mode = format_args!("{mode:04o}"),
            "extracting"
        );

        match kind {
            Kind::Regular => {
                let data = self.read_content(header.size()?)?;
                let mut file = OpenOptions::new()
                    .write(true)
                    .create(true)
                    .truncate(true)
                    .mode(mode & MODE_BITS)
                    .open(&out)?;
                file.write_all(&data)?;
            }
            Kind::Directory => match fs::DirBuilder::new().mode(mode & MODE_BITS).create(&out) {
                Ok(()) => {}
                // collision with an existing directory: adopt the archive's
                // mode via the chmod below
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
                Err(e) => return Err(e.into()),
            },
            Kind::Symlink => {
                match fs::remove_file(&out) {
                    Ok(()) => {}
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                }
                unix_fs::symlink(OsStr::from_bytes(link), &out)?;
            }
            Kind::HardLink => {
                let target = join_under(&self.dest, link);
                fs::hard_link(target, &out)?;
            }
            Kind::CharDevice | Kind::BlockDevice => {
                let sflag = if kind == Kind::CharDevice {
                    SFlag::S_IFCHR
                } else {
                    SFlag::S_IFBLK
                };
                let dev = makedev(header.dev_major()?, header.dev_minor()?);
                mknod(&out, sflag, Mode::from_bits_truncate(mode), dev)?;
            }
            Kind::Fifo => {
                mkfifo(&out, Mode::from_bits_truncate(mode))?;
            }
        }

        // set the archive's permission bits explicitly: open/mkdir just ran
        // under the umask (symlinks carry no mode of their own)
        if kind != Kind::Symlink {
            fs::set_permissions(&out, fs::Permissions::from_mode(mode & MODE_BITS))?;
        }

        Ok(())
    }

    /// Read an entry's content in one pass: `size` bytes plus block padding.
    fn read_content(&mut self, size: u64) -> Result<Vec<u8>, Error> {
        let padded = size.div_ceil(BLOCK_SIZE as u64) * BLOCK_SIZE as u64;
        let padded = usize::try_from(padded).map_err(|_| ArchiveError::EntryTooLarge(size))?;
        let mut buf = vec![0u8; padded];
        self.read_full(&mut buf)?;
        buf.truncate(size as usize);
        Ok(buf)
    }

    /// Long-name content: a NUL-terminated path in the content blocks.
    fn read_string_content(&mut self, header: &HeaderRecord) -> Result<Vec<u8>, Error> {
        let mut data = self.read_content(header.size()?)?;
        if let Some(n) = data.iter().position(|&b| b == 0) {
            data.truncate(n);
        }
        Ok(data)
    }

    fn read_full(&mut self, buf: &mut [u8]) -> Result<(), Error> {
        let mut filled = 0;
        while filled < buf.len() {
            let n = self.reader.read(&mut buf[filled..])?;
            if n == 0 {
                return Err(ArchiveError::ShortRead {
                    expected: buf.len(),
                    actual: filled,
                }
                .into());
            }
            filled += n;
        }
        Ok(())
    }
}

/// `dest + "/" + path`, as one string: an archive path with a leading slash
/// lands under the destination like any other, it cannot replace it.
fn join_under(dest: &Path, path: &[u8]) -> PathBuf {
    let mut relative = path;
    while let Some(rest) = relative.strip_prefix(b"/") {
        relative = rest;
    }
    dest.join(Path::new(OsStr::from_bytes(relative)))
}

fn kind_of(typeflag: TypeFlag, path: &[u8]) -> Kind {
    match typeflag {
        TypeFlag::Directory => Kind::Directory,
        TypeFlag::Symlink => Kind::Symlink,
        TypeFlag::HardLink => Kind::HardLink,
        TypeFlag::CharDevice => Kind::CharDevice,
        TypeFlag::BlockDevice => Kind::BlockDevice,
        TypeFlag::Fifo => Kind::Fifo,
        TypeFlag::Regular | TypeFlag::OldRegular | TypeFlag::Contiguous => {
            // pre-POSIX archives mark directories with a trailing slash
            if path.ends_with(b"/") {
                Kind::Directory
            } else {
                Kind::Regular
            }
        }
        TypeFlag::GnuLongName | TypeFlag::GnuLongLink => {
            unreachable!("long-name records are consumed before dispatch")
        }
        TypeFlag::Unknown(flag) => {
            warn!(flag, "unknown type flag, extracting as a regular file");
            Kind::Regular
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncated_stream_is_a_short_read() {
        // one valid-looking header block, then nothing
        let mut block = [0u8; BLOCK_SIZE];
        block[..3].copy_from_slice(b"app");
        block[100..104].copy_from_slice(b"0644");
        block[124..128].copy_from_slice(b"1000"); // 512 bytes of content owed
        block[156] = b'0';

        let dir = tempfile::tempdir().unwrap();
        let err = Extractor::new(&block[..], dir.path()).unpack_all().unwrap_err();
        assert!(matches!(
            err,
            Error::Archive(ArchiveError::ShortRead { .. })
        ));
    }

    #[test]
    fn empty_stream_is_a_short_read_too() {
        let dir = tempfile::tempdir().unwrap();
        let err = Extractor::new(&b""[..], dir.path()).unpack_all().unwrap_err();
        assert!(matches!(err, Error::Archive(ArchiveError::ShortRead { .. })));
    }

    #[test]
    fn join_under_never_replaces_the_destination() {
        assert_eq!(join_under(Path::new("/b"), b"x/y"), Path::new("/b/x/y"));
        assert_eq!(join_under(Path::new("/b"), b"/x/y"), Path::new("/b/x/y"));
        assert_eq!(join_under(Path::new("/b"), b"//x"), Path::new("/b/x"));
    }

    #[test]
    fn absolute_entry_paths_stay_under_the_destination() {
        let mut archive = Vec::new();

        let mut block = [0u8; BLOCK_SIZE];
        block[..9].copy_from_slice(b"/abs/file");
        block[100..104].copy_from_slice(b"0644");
        block[124..128].copy_from_slice(b"0004");
        block[156] = b'0';
        archive.extend_from_slice(&block);

        let mut content = [0u8; BLOCK_SIZE];
        content[..4].copy_from_slice(b"data");
        archive.extend_from_slice(&content);
        archive.extend_from_slice(&[0u8; BLOCK_SIZE]);

        let dir = tempfile::tempdir().unwrap();
        Extractor::new(&archive[..], dir.path()).unpack_all().unwrap();

        assert_eq!(fs::read(dir.path().join("abs/file")).unwrap(), b"data");
        assert!(!Path::new("/abs/file").exists());
    }

    #[test]
    fn zero_block_ends_the_archive() {
        let blocks = vec![0u8; BLOCK_SIZE * 2];
        let dir = tempfile::tempdir().unwrap();
        Extractor::new(&blocks[..], dir.path()).unpack_all().unwrap();
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }
}
