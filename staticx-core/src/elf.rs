//! By-hand inspection of ELF images.
//!
//! The bootloader is statically linked and must navigate its own executable
//! (and the extracted user program) without any loader conveniences, so the
//! handful of structures it needs are parsed directly from the mapped bytes:
//! the file header, the section table (resolved against the section-name
//! string table), the program-header table, and the dynamic table.
//!
//! The word size is fixed at build time to the host pointer width; a 64-bit
//! bootloader only ever deals with 64-bit images. Field widths and record
//! sizes follow from that, and an image disagreeing with the build-time
//! record size is rejected rather than reinterpreted.

use tracing::trace;
use winnow::binary::{self, Endianness};
use winnow::token::{tag, take};
use winnow::{PResult, Parser};

use crate::error::{Error, FormatError};

const NATIVE: Endianness = Endianness::Native;

/// The four identification bytes opening every ELF image.
pub const ELF_MAGIC: [u8; 4] = [0x7f, b'E', b'L', b'F'];

/// Program-header type of the interpreter segment.
pub const PT_INTERP: u32 = 3;

/// Dynamic-table terminator tag.
pub const DT_NULL: i64 = 0;
/// Dynamic-table tag for the library search path (old spelling).
pub const DT_RPATH: i64 = 15;
/// Dynamic-table tag for the library search path.
pub const DT_RUNPATH: i64 = 29;

#[cfg(target_pointer_width = "64")]
mod layout {
    pub const EHDR_SIZE: usize = 64;
    pub const SHDR_SIZE: u16 = 64;
    pub const PHDR_SIZE: u16 = 56;
    pub const DYN_SIZE: usize = 16;
}

#[cfg(target_pointer_width = "32")]
mod layout {
    pub const EHDR_SIZE: usize = 52;
    pub const SHDR_SIZE: u16 = 40;
    pub const PHDR_SIZE: u16 = 32;
    pub const DYN_SIZE: usize = 8;
}

/// Parse one address-sized field, widened to `u64` on 32-bit hosts.
fn word(i: &mut &[u8]) -> PResult<u64> {
    #[cfg(target_pointer_width = "64")]
    {
        binary::u64(NATIVE).parse_next(i)
    }
    #[cfg(target_pointer_width = "32")]
    {
        binary::u32(NATIVE).parse_next(i).map(u64::from)
    }
}

/// Parse one signed address-sized field, widened to `i64` on 32-bit hosts.
fn sword(i: &mut &[u8]) -> PResult<i64> {
    #[cfg(target_pointer_width = "64")]
    {
        binary::i64(NATIVE).parse_next(i)
    }
    #[cfg(target_pointer_width = "32")]
    {
        binary::i32(NATIVE).parse_next(i).map(i64::from)
    }
}

/// The ELF file header, reduced to the fields the bootloader navigates by.
#[derive(Debug)]
pub struct ElfHeader {
    /// object file type
    pub e_type: u16,

    /// target machine
    pub e_machine: u16,

    /// file offset of the program-header table
    pub e_phoff: u64,

    /// file offset of the section-header table
    pub e_shoff: u64,

    /// size of one program-header record
    pub e_phentsize: u16,

    /// number of program-header records
    pub e_phnum: u16,

    /// size of one section-header record
    pub e_shentsize: u16,

    /// number of section-header records
    pub e_shnum: u16,

    /// table index of the section-name string table
    pub e_shstrndx: u16,
}

impl ElfHeader {
    /// Parser for the file header.
    pub fn parser(i: &mut &[u8]) -> PResult<Self> {
        let _ = tag(&ELF_MAGIC[..]).parse_next(i)?;
        // class, data, version, ABI and padding; the build-time word size
        // already commits us to one class.
        let _ident_rest = take(12usize).parse_next(i)?;

        let e_type = binary::u16(NATIVE).parse_next(i)?;
        let e_machine = binary::u16(NATIVE).parse_next(i)?;
        let _e_version = binary::u32(NATIVE).parse_next(i)?;
        let _e_entry = word(i)?;
        let e_phoff = word(i)?;
        let e_shoff = word(i)?;
        let _e_flags = binary::u32(NATIVE).parse_next(i)?;
        let _e_ehsize = binary::u16(NATIVE).parse_next(i)?;
        let e_phentsize = binary::u16(NATIVE).parse_next(i)?;
        let e_phnum = binary::u16(NATIVE).parse_next(i)?;
        let e_shentsize = binary::u16(NATIVE).parse_next(i)?;
        let e_shnum = binary::u16(NATIVE).parse_next(i)?;
        let e_shstrndx = binary::u16(NATIVE).parse_next(i)?;

        Ok(Self {
            e_type,
            e_machine,
            e_phoff,
            e_shoff,
            e_phentsize,
            e_phnum,
            e_shentsize,
            e_shnum,
            e_shstrndx,
        })
    }
}

/// One record of the section-header table.
#[derive(Debug, Clone)]
pub struct SectionHeader {
    /// offset of the section's name in the section-name string table
    pub sh_name: u32,

    /// section type
    pub sh_type: u32,

    /// file offset of the section's contents
    pub sh_offset: u64,

    /// size of the section's contents in bytes
    pub sh_size: u64,
}

impl SectionHeader {
    /// Parser for one section-header record.
    pub fn parser(i: &mut &[u8]) -> PResult<Self> {
        let sh_name = binary::u32(NATIVE).parse_next(i)?;
        let sh_type = binary::u32(NATIVE).parse_next(i)?;
        let _sh_flags = word(i)?;
        let _sh_addr = word(i)?;
        let sh_offset = word(i)?;
        let sh_size = word(i)?;
        let _sh_link = binary::u32(NATIVE).parse_next(i)?;
        let _sh_info = binary::u32(NATIVE).parse_next(i)?;
        let _sh_addralign = word(i)?;
        let _sh_entsize = word(i)?;

        Ok(Self {
            sh_name,
            sh_type,
            sh_offset,
            sh_size,
        })
    }
}

/// One record of the program-header table.
#[derive(Debug, Clone)]
pub struct ProgramHeader {
    /// segment type
    pub p_type: u32,

    /// file offset of the segment's contents
    pub p_offset: u64,

    /// size of the segment's on-disk contents in bytes
    pub p_filesz: u64,
}

impl ProgramHeader {
    /// Parser for one program-header record.
    #[cfg(target_pointer_width = "64")]
    pub fn parser(i: &mut &[u8]) -> PResult<Self> {
        let p_type = binary::u32(NATIVE).parse_next(i)?;
        let _p_flags = binary::u32(NATIVE).parse_next(i)?;
        let p_offset = word(i)?;
        let _p_vaddr = word(i)?;
        let _p_paddr = word(i)?;
        let p_filesz = word(i)?;
        let _p_memsz = word(i)?;
        let _p_align = word(i)?;

        Ok(Self {
            p_type,
            p_offset,
            p_filesz,
        })
    }

    /// Parser for one program-header record (32-bit field order).
    #[cfg(target_pointer_width = "32")]
    pub fn parser(i: &mut &[u8]) -> PResult<Self> {
        let p_type = binary::u32(NATIVE).parse_next(i)?;
        let p_offset = word(i)?;
        let _p_vaddr = word(i)?;
        let _p_paddr = word(i)?;
        let p_filesz = word(i)?;
        let _p_memsz = word(i)?;
        let _p_flags = binary::u32(NATIVE).parse_next(i)?;
        let _p_align = word(i)?;

        Ok(Self {
            p_type,
            p_offset,
            p_filesz,
        })
    }
}

/// One record of the dynamic table.
#[derive(Debug, Clone, Copy)]
pub struct DynEntry {
    /// entry tag (`DT_*`)
    pub d_tag: i64,

    /// entry value; for the run-path tags, an offset into `.dynstr`
    pub d_val: u64,
}

impl DynEntry {
    /// Parser for one dynamic-table record.
    pub fn parser(i: &mut &[u8]) -> PResult<Self> {
        let d_tag = sword(i)?;
        let d_val = word(i)?;
        Ok(Self { d_tag, d_val })
    }
}

/// A parsed view over a mapped ELF image.
///
/// Construction validates the magic and the header; the table lookups below
/// additionally validate the record sizes the image claims against the ones
/// this build was compiled for.
#[derive(Debug)]
pub struct ElfImage<'a> {
    data: &'a [u8],
    header: ElfHeader,
}

impl<'a> ElfImage<'a> {
    /// Validate the header and build a view over `data`.
    pub fn parse(data: &'a [u8]) -> Result<Self, Error> {
        if data.len() < ELF_MAGIC.len() || data[..ELF_MAGIC.len()] != ELF_MAGIC {
            return Err(FormatError::BadMagic.into());
        }
        let mut i = data.get(..layout::EHDR_SIZE).ok_or(FormatError::Truncated)?;
        let header = ElfHeader::parser(&mut i).map_err(|_| FormatError::Truncated)?;
        Ok(Self { data, header })
    }

    /// The parsed file header.
    pub fn header(&self) -> &ElfHeader {
        &self.header
    }

    fn slice_at(&self, offset: u64, len: u64) -> Result<&'a [u8], Error> {
        let start = usize::try_from(offset).map_err(|_| FormatError::Truncated)?;
        let len = usize::try_from(len).map_err(|_| FormatError::Truncated)?;
        let end = start.checked_add(len).ok_or(FormatError::Truncated)?;
        Ok(self.data.get(start..end).ok_or(FormatError::Truncated)?)
    }

    fn section_at(&self, index: usize) -> Result<SectionHeader, Error> {
        let entsize = self.header.e_shentsize;
        if entsize != layout::SHDR_SIZE {
            return Err(FormatError::SectionEntrySize {
                actual: entsize,
                expected: layout::SHDR_SIZE,
            }
            .into());
        }
        let offset = self.header.e_shoff + index as u64 * u64::from(entsize);
        let mut i = self.slice_at(offset, u64::from(entsize))?;
        SectionHeader::parser(&mut i).map_err(|_| Error::from(FormatError::Truncated))
    }

    /// Walk the section table for a section named `name`.
    pub fn section_by_name(&self, name: &[u8]) -> Result<Option<SectionHeader>, Error> {
        if self.header.e_shnum == 0 {
            return Ok(None);
        }
        let strtab_hdr = self.section_at(usize::from(self.header.e_shstrndx))?;
        let strtab = self.slice_at(strtab_hdr.sh_offset, strtab_hdr.sh_size)?;

        for index in 0..usize::from(self.header.e_shnum) {
            let sh = self.section_at(index)?;
            if cstr_at(strtab, sh.sh_name as usize) == Some(name) {
                trace!(
                    name = %String::from_utf8_lossy(name),
                    offset = sh.sh_offset,
                    size = sh.sh_size,
                    "found section"
                );
                return Ok(Some(sh));
            }
        }
        Ok(None)
    }

    /// Walk the program-header table for the first record of type `p_type`.
    pub fn program_header_by_type(&self, p_type: u32) -> Result<Option<ProgramHeader>, Error> {
        let entsize = self.header.e_phentsize;
        if entsize != layout::PHDR_SIZE {
            return Err(FormatError::ProgramEntrySize {
                actual: entsize,
                expected: layout::PHDR_SIZE,
            }
            .into());
        }

        for index in 0..usize::from(self.header.e_phnum) {
            let offset = self.header.e_phoff + index as u64 * u64::from(entsize);
            let mut i = self.slice_at(offset, u64::from(entsize))?;
            let ph = ProgramHeader::parser(&mut i).map_err(|_| FormatError::Truncated)?;
            if ph.p_type == p_type {
                trace!(p_type, offset = ph.p_offset, filesz = ph.p_filesz, "found program header");
                return Ok(Some(ph));
            }
        }
        Ok(None)
    }

    /// The raw bytes a section header points at.
    pub fn section_data(&self, sh: &SectionHeader) -> Result<&'a [u8], Error> {
        self.slice_at(sh.sh_offset, sh.sh_size)
    }

    /// Parse dynamic-table records up to (not including) the `DT_NULL`
    /// terminator.
    pub fn dynamic_entries(&self, dynamic: &SectionHeader) -> Result<Vec<DynEntry>, Error> {
        let data = self.section_data(dynamic)?;
        let mut entries = Vec::new();
        let mut i = data;
        while i.len() >= layout::DYN_SIZE {
            let entry = DynEntry::parser(&mut i).map_err(|_| FormatError::Truncated)?;
            if entry.d_tag == DT_NULL {
                break;
            }
            entries.push(entry);
        }
        Ok(entries)
    }
}

/// The NUL-terminated byte string starting at `offset` in a string table.
fn cstr_at(table: &[u8], offset: usize) -> Option<&[u8]> {
    let rest = table.get(offset..)?;
    let end = rest.iter().position(|&b| b == 0)?;
    Some(&rest[..end])
}
