use num_enum::FromPrimitive;
use winnow::token::{any, take};
use winnow::{PResult, Parser};

use crate::error::{ArchiveError, Error};

/// Size of one archive block. Headers fill exactly one block; content is
/// padded up to a multiple.
pub const BLOCK_SIZE: usize = 512;

/// The type-flag byte of a header block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive)]
#[repr(u8)]
pub enum TypeFlag {
    /// regular file, pre-POSIX spelling
    OldRegular = 0,

    /// regular file
    Regular = b'0',

    /// hard link to an earlier entry
    HardLink = b'1',

    /// symbolic link
    Symlink = b'2',

    /// character device
    CharDevice = b'3',

    /// block device
    BlockDevice = b'4',

    /// directory
    Directory = b'5',

    /// named pipe
    Fifo = b'6',

    /// contiguous file, treated as regular
    Contiguous = b'7',

    /// GNU extension: content is the next entry's path
    GnuLongName = b'L',

    /// GNU extension: content is the next entry's link target
    GnuLongLink = b'K',

    /// anything else; handled as a regular file, the traditional fallback
    #[num_enum(catch_all)]
    Unknown(u8) = 255,
}

/// One parsed 512-byte header block.
///
/// Numeric fields are kept raw and decoded on access: a field that an entry
/// never uses (device numbers on a regular file, say) is allowed to hold
/// garbage, which real archives exploit.
#[derive(Debug)]
pub struct HeaderRecord {
    name: Vec<u8>,
    mode: Vec<u8>,
    size: Vec<u8>,
    typeflag: TypeFlag,
    linkname: Vec<u8>,
    devmajor: Vec<u8>,
    devminor: Vec<u8>,
    prefix: Vec<u8>,
}

impl HeaderRecord {
    /// Parser for one header block.
    ///
    /// Ownership and timestamp fields are skipped outright: the extractor
    /// never restores them. Checksum and magic are not enforced; the archive
    /// is trusted packager output.
    pub fn parser(i: &mut &[u8]) -> PResult<Self> {
        let name = field(100).parse_next(i)?;
        let mode = field(8).parse_next(i)?;
        let _uid = take(8usize).parse_next(i)?;
        let _gid = take(8usize).parse_next(i)?;
        let size = field(12).parse_next(i)?;
        let _mtime = take(12usize).parse_next(i)?;
        let _chksum = take(8usize).parse_next(i)?;
        let typeflag = any.parse_next(i).map(|b: u8| TypeFlag::from(b))?;
        let linkname = field(100).parse_next(i)?;
        let _magic = take(6usize).parse_next(i)?;
        let _version = take(2usize).parse_next(i)?;
        let _uname = take(32usize).parse_next(i)?;
        let _gname = take(32usize).parse_next(i)?;
        let devmajor = field(8).parse_next(i)?;
        let devminor = field(8).parse_next(i)?;
        let prefix = field(155).parse_next(i)?;

        Ok(Self {
            name,
            mode,
            size,
            typeflag,
            linkname,
            devmajor,
            devminor,
            prefix,
        })
    }

    /// The entry's type.
    pub fn typeflag(&self) -> TypeFlag {
        self.typeflag
    }

    /// The entry's path, joining the ustar `prefix` field when present.
    pub fn path_bytes(&self) -> Vec<u8> {
        let name = trim_field(&self.name);
        let prefix = trim_field(&self.prefix);
        if prefix.is_empty() {
            name.to_vec()
        } else {
            let mut path = prefix.to_vec();
            path.push(b'/');
            path.extend_from_slice(name);
            path
        }
    }

    /// The recorded link target, for symlink and hardlink entries.
    pub fn link_bytes(&self) -> Vec<u8> {
        trim_field(&self.linkname).to_vec()
    }

    /// The entry's mode field.
    pub fn mode(&self) -> Result<u32, Error> {
        octal(&self.mode).map(|v| v as u32)
    }

    /// Content size in bytes.
    pub fn size(&self) -> Result<u64, Error> {
        octal(&self.size)
    }

    /// Device major number, for device entries.
    pub fn dev_major(&self) -> Result<u64, Error> {
        octal(&self.devmajor)
    }

    /// Device minor number, for device entries.
    pub fn dev_minor(&self) -> Result<u64, Error> {
        octal(&self.devminor)
    }
}

fn field<'a>(count: usize) -> impl FnMut(&mut &'a [u8]) -> PResult<Vec<u8>> {
    move |i| take(count).map(|slice: &[u8]| slice.to_vec()).parse_next(i)
}

/// Everything up to the first NUL; the whole field if none.
fn trim_field(field: &[u8]) -> &[u8] {
    match field.iter().position(|&b| b == 0) {
        Some(n) => &field[..n],
        None => field,
    }
}

/// Decode an ASCII-octal header field. Leading blanks are skipped, a space
/// or NUL ends the number, and an all-padding field is zero.
fn octal(field: &[u8]) -> Result<u64, Error> {
    let mut value = 0u64;
    let mut seen_digit = false;
    for &b in field {
        match b {
            b'0'..=b'7' => {
                value = value * 8 + u64::from(b - b'0');
                seen_digit = true;
            }
            b' ' | 0 if !seen_digit => continue,
            b' ' | 0 => break,
            _ => {
                return Err(ArchiveError::InvalidOctal(
                    String::from_utf8_lossy(field).into_owned(),
                )
                .into())
            }
        }
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_block(name: &[u8], typeflag: u8, size: &[u8], prefix: &[u8]) -> [u8; BLOCK_SIZE] {
        let mut block = [0u8; BLOCK_SIZE];
        block[..name.len()].copy_from_slice(name);
        block[100..100 + 7].copy_from_slice(b"0000644");
        block[124..124 + size.len()].copy_from_slice(size);
        block[156] = typeflag;
        block[257..262].copy_from_slice(b"ustar");
        block[345..345 + prefix.len()].copy_from_slice(prefix);
        block
    }

    #[test]
    fn parses_a_regular_entry() {
        let block = sample_block(b"bin/app", b'0', b"00000000010\0", b"");
        let header = HeaderRecord::parser(&mut &block[..]).unwrap();
        assert_eq!(header.typeflag(), TypeFlag::Regular);
        assert_eq!(header.path_bytes(), b"bin/app");
        assert_eq!(header.mode().unwrap(), 0o644);
        assert_eq!(header.size().unwrap(), 8);
    }

    #[test]
    fn joins_the_ustar_prefix() {
        let block = sample_block(b"app", b'0', b"0\0", b"deeply/nested");
        let header = HeaderRecord::parser(&mut &block[..]).unwrap();
        assert_eq!(header.path_bytes(), b"deeply/nested/app");
    }

    #[test]
    fn octal_handles_padding_styles() {
        assert_eq!(octal(b"0000644\0").unwrap(), 0o644);
        assert_eq!(octal(b"  644 \0 ").unwrap(), 0o644);
        assert_eq!(octal(b"\0\0\0\0").unwrap(), 0);
        assert!(octal(b"12x4").is_err());
    }

    #[test]
    fn unknown_flags_are_preserved() {
        assert_eq!(TypeFlag::from(b'x'), TypeFlag::Unknown(b'x'));
        assert_eq!(TypeFlag::from(b'5'), TypeFlag::Directory);
    }
}
