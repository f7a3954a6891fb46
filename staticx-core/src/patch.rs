//! In-place patching of the extracted user program.
//!
//! Two strings inside the program's on-disk image are rewritten so that it
//! resolves its dynamic loader and shared libraries from the bundle
//! directory: the interpreter path inside the `PT_INTERP` segment, and the
//! run path inside `.dynstr` that the `DT_RPATH`/`DT_RUNPATH` tag points at.
//!
//! Both live in fixed-capacity slots, so the rewrites never move a byte of
//! the surrounding file: a replacement that does not fit is an error, and
//! the two slots measure capacity differently on purpose. The interpreter
//! slot admits `p_filesz - 1` payload bytes; the run path only as many bytes
//! as the string it replaces, since the string table cannot grow.

use std::os::unix::ffi::OsStrExt;
use std::path::Path;

use tracing::debug;

use crate::elf::{ElfImage, DT_RPATH, DT_RUNPATH, PT_INTERP};
use crate::error::{Error, FormatError, SlotError};
use crate::mmap::FileMapMut;

/// Map `path` read-write, rewrite both slots, and flush.
///
/// `path` must be the real program file (the bundle's `.staticx.prog`
/// symlink already resolved), so the program still sees its own name in
/// `/proc/self/exe`. The mapping is written back before this returns; the
/// child only ever opens the patched bytes.
pub fn patch_program(path: &Path, interpreter: &Path, run_path: &Path) -> Result<(), Error> {
    debug!(
        path = %path.display(),
        interpreter = %interpreter.display(),
        run_path = %run_path.display(),
        "patching program"
    );

    let mut map = FileMapMut::open(path)?;
    patch_interpreter(&mut map, interpreter.as_os_str().as_bytes())?;
    patch_run_path(&mut map, run_path.as_os_str().as_bytes())?;
    map.flush()?;
    Ok(())
}

/// Overwrite the interpreter string inside the `PT_INTERP` segment.
pub fn patch_interpreter(image: &mut [u8], new_interp: &[u8]) -> Result<(), Error> {
    let (offset, filesz) = {
        let elf = ElfImage::parse(image)?;
        let ph = elf
            .program_header_by_type(PT_INTERP)?
            .ok_or(FormatError::MissingInterpreter)?;
        (ph.p_offset as usize, ph.p_filesz as usize)
    };

    let slot = image
        .get_mut(offset..offset + filesz)
        .ok_or(FormatError::Truncated)?;

    // the existing string must terminate inside the slot
    if !slot.contains(&0) {
        return Err(FormatError::UnterminatedInterpreter.into());
    }
    if new_interp.len() + 1 > filesz {
        return Err(SlotError::InterpreterTooLong {
            required: new_interp.len() + 1,
            capacity: filesz,
        }
        .into());
    }

    slot[..new_interp.len()].copy_from_slice(new_interp);
    slot[new_interp.len()..].fill(0);
    debug!(
        interpreter = %String::from_utf8_lossy(new_interp),
        capacity = filesz,
        "interpreter updated"
    );
    Ok(())
}

/// Overwrite the run-path string inside `.dynstr`.
pub fn patch_run_path(image: &mut [u8], new_path: &[u8]) -> Result<(), Error> {
    let (offset, capacity) = {
        let elf = ElfImage::parse(image)?;
        let dynamic = elf
            .section_by_name(b".dynamic")?
            .ok_or(FormatError::MissingSection(".dynamic"))?;
        let dynstr = elf
            .section_by_name(b".dynstr")?
            .ok_or(FormatError::MissingSection(".dynstr"))?;

        let tag = elf
            .dynamic_entries(&dynamic)?
            .into_iter()
            .find(|e| e.d_tag == DT_RPATH || e.d_tag == DT_RUNPATH)
            .ok_or(FormatError::MissingRunPath)?;

        if tag.d_val >= dynstr.sh_size {
            return Err(FormatError::RunPathOutOfRange {
                offset: tag.d_val,
                table_size: dynstr.sh_size,
            }
            .into());
        }

        let strtab = elf.section_data(&dynstr)?;
        let existing = &strtab[tag.d_val as usize..];
        let existing_len = existing
            .iter()
            .position(|&b| b == 0)
            .ok_or(FormatError::UnterminatedRunPath)?;

        ((dynstr.sh_offset + tag.d_val) as usize, existing_len)
    };

    // the string table cannot grow, so the replacement may not outsize the
    // string it replaces
    if new_path.len() > capacity {
        return Err(SlotError::RunPathTooLong {
            required: new_path.len(),
            capacity,
        }
        .into());
    }

    let slot = image
        .get_mut(offset..offset + capacity + 1)
        .ok_or(FormatError::Truncated)?;
    slot[..new_path.len()].copy_from_slice(new_path);
    slot[new_path.len()] = 0;
    debug!(
        run_path = %String::from_utf8_lossy(new_path),
        capacity,
        "run path updated"
    );
    Ok(())
}

#[cfg(all(test, target_pointer_width = "64"))]
mod tests {
    use super::*;
    use crate::testutil::ElfBuilder;

    const DYNSTR: &[u8] = b"\0libc.so.6\0/original/run/path\0";
    const RPATH_OFFSET: u64 = 11; // start of "/original/run/path"

    fn program_image(interp: &[u8]) -> Vec<u8> {
        let mut b = ElfBuilder::new();
        let interp_section = b.add_section(".interp", interp.to_vec());
        b.add_program_header(PT_INTERP, interp_section);

        let mut dynamic = Vec::new();
        for (tag, val) in [(1i64, 1u64), (DT_RUNPATH, RPATH_OFFSET), (0, 0)] {
            dynamic.extend_from_slice(&tag.to_ne_bytes());
            dynamic.extend_from_slice(&val.to_ne_bytes());
        }
        b.add_section(".dynamic", dynamic);
        b.add_section(".dynstr", DYNSTR.to_vec());
        b.build()
    }

    fn interp_slot(image: &[u8]) -> &[u8] {
        let elf = ElfImage::parse(image).unwrap();
        let ph = elf.program_header_by_type(PT_INTERP).unwrap().unwrap();
        &image[ph.p_offset as usize..(ph.p_offset + ph.p_filesz) as usize]
    }

    #[test]
    fn rewrites_interpreter_and_pads_with_nul() {
        let mut image = program_image(b"/lib64/ld-linux-x86-64.so.2\0");
        patch_interpreter(&mut image, b"/tmp/s/.staticx.interp").unwrap();

        let slot = interp_slot(&image);
        assert_eq!(&slot[..22], b"/tmp/s/.staticx.interp");
        assert!(slot[22..].iter().all(|&b| b == 0));
    }

    #[test]
    fn interpreter_slot_admits_filesz_minus_one() {
        let mut image = program_image(b"/123456789\0");
        // exactly filesz - 1 payload bytes
        patch_interpreter(&mut image, b"/abcdefghi").unwrap();
        assert_eq!(interp_slot(&image), b"/abcdefghi\0");

        let mut image = program_image(b"/123456789\0");
        let err = patch_interpreter(&mut image, b"/abcdefghij").unwrap_err();
        assert!(matches!(
            err,
            Error::Slot(SlotError::InterpreterTooLong {
                required: 12,
                capacity: 11,
            })
        ));
    }

    #[test]
    fn unterminated_interpreter_is_rejected() {
        let mut image = program_image(b"/lib/ld-full-slot-no-nul");
        let err = patch_interpreter(&mut image, b"/x").unwrap_err();
        assert!(matches!(
            err,
            Error::Format(FormatError::UnterminatedInterpreter)
        ));
    }

    #[test]
    fn rewrites_run_path_leaving_trailing_bytes() {
        let mut image = program_image(b"/lib/ld.so\0");
        patch_run_path(&mut image, b"/tmp/bundle").unwrap();

        let elf = ElfImage::parse(&image).unwrap();
        let dynstr = elf.section_by_name(b".dynstr").unwrap().unwrap();
        let strtab = elf.section_data(&dynstr).unwrap();
        assert_eq!(&strtab[..11], b"\0libc.so.6\0");
        assert_eq!(&strtab[11..23], b"/tmp/bundle\0");
        // bytes past the new terminator keep their old values
        assert_eq!(&strtab[23..30], b"n/path\0");
    }

    #[test]
    fn run_path_capacity_is_the_existing_string_length() {
        // same length as the original: fine
        let mut image = program_image(b"/lib/ld.so\0");
        patch_run_path(&mut image, b"/123456789/1234567").unwrap();

        // one byte longer: rejected
        let mut image = program_image(b"/lib/ld.so\0");
        let err = patch_run_path(&mut image, b"/123456789/12345678").unwrap_err();
        assert!(matches!(
            err,
            Error::Slot(SlotError::RunPathTooLong {
                required: 19,
                capacity: 18,
            })
        ));
    }

    #[test]
    fn missing_pieces_are_fatal() {
        // no PT_INTERP at all
        let mut b = ElfBuilder::new();
        b.add_section(".text", vec![0x90; 4]);
        let mut image = b.build();
        assert!(matches!(
            patch_interpreter(&mut image, b"/x").unwrap_err(),
            Error::Format(FormatError::MissingInterpreter)
        ));
        assert!(matches!(
            patch_run_path(&mut image, b"/x").unwrap_err(),
            Error::Format(FormatError::MissingSection(".dynamic"))
        ));

        // dynamic table without a run-path tag
        let mut b = ElfBuilder::new();
        let mut dynamic = Vec::new();
        for (tag, val) in [(1i64, 1u64), (0, 0)] {
            dynamic.extend_from_slice(&tag.to_ne_bytes());
            dynamic.extend_from_slice(&val.to_ne_bytes());
        }
        b.add_section(".dynamic", dynamic);
        b.add_section(".dynstr", DYNSTR.to_vec());
        let mut image = b.build();
        assert!(matches!(
            patch_run_path(&mut image, b"/x").unwrap_err(),
            Error::Format(FormatError::MissingRunPath)
        ));
    }

    #[test]
    fn patch_program_round_trips_through_a_file() {
        let image = program_image(b"/lib64/ld-linux-x86-64.so.2\0");
        let file = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(file.path(), &image).unwrap();

        patch_program(
            file.path(),
            Path::new("/tmp/b/.staticx.interp"),
            Path::new("/tmp/b"),
        )
        .unwrap();

        let patched = std::fs::read(file.path()).unwrap();
        assert_eq!(patched.len(), image.len());
        assert_eq!(&interp_slot(&patched)[..22], b"/tmp/b/.staticx.interp");
    }
}
