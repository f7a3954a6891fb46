//! The bootloader that runs inside every packaged executable.
//!
//! One straight-line pipeline per invocation: map our own image, find the
//! embedded archive section, extract it into a fresh bundle directory,
//! rewrite the user program's interpreter and run path so it loads from the
//! bundle, hand it our arguments, and mirror its fate — its exit code, or
//! the signal that killed it.

use std::env;
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::process;

use tracing::debug;
use tracing_subscriber::EnvFilter;

use staticx_core::elf::ElfImage;
use staticx_core::error::FormatError;
use staticx_core::mmap::FileMap;
use staticx_core::patch;
use staticx_core::payload::PayloadReader;
use staticx_core::tar::Extractor;
use staticx_core::Error;

mod bundle;
mod child;

use bundle::BundleDir;
use child::ChildStatus;

/// Name of the ELF section carrying the embedded archive.
const ARCHIVE_SECTION: &str = ".staticx.archive";

/// Bundle file name of the dynamic loader.
const INTERP_FILENAME: &str = ".staticx.interp";

/// Bundle symlink pointing at the user program.
const PROG_FILENAME: &str = ".staticx.prog";

const SELF_EXE: &str = "/proc/self/exe";

fn main() {
    if env::var_os("STATICX_BOOTLOADER_IDENTIFY").is_some() {
        println!("staticx-bootloader {}", env!("CARGO_PKG_VERSION"));
        return;
    }

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    match run() {
        Ok(ChildStatus::Exited(code)) => process::exit(code),
        Ok(ChildStatus::Signaled(signal)) => child::die_with_signal(signal),
        Err(err) => {
            eprintln!("{}: {}", program_name(), err);
            process::exit(2);
        }
    }
}

fn run() -> Result<ChildStatus, Error> {
    // resolve the packaged executable's real path now, while /proc/self/exe
    // still names it; the child will see the patched program there instead
    let packaged_exe = fs::canonicalize(SELF_EXE)?;
    debug!(path = %packaged_exe.display(), "packaged executable");

    let bundle = BundleDir::create()?;
    debug!(path = %bundle.path().display(), "bundle directory");

    {
        let image = FileMap::open(SELF_EXE)?;
        let elf = ElfImage::parse(&image)?;
        let section = elf
            .section_by_name(ARCHIVE_SECTION.as_bytes())?
            .ok_or(FormatError::MissingSection(ARCHIVE_SECTION))?;
        let payload = elf.section_data(&section)?;
        Extractor::new(PayloadReader::new(payload), bundle.path()).unpack_all()?;
        // the self-image unmaps here; everything the child needs is on disk
    }

    let prog = resolve_program(bundle.path())?;
    let interp = bundle.path().join(INTERP_FILENAME);
    patch::patch_program(&prog, &interp, bundle.path())?;

    env::set_var("STATICX_BUNDLE_DIR", bundle.path());
    env::set_var("STATICX_PROG_PATH", &packaged_exe);

    let args: Vec<OsString> = env::args_os().skip(1).collect();
    let status = child::run(&prog, &args)?;

    bundle.finish();
    Ok(status)
}

/// The real program file behind the bundle's `.staticx.prog` symlink.
///
/// Both the patcher and the exec use the resolved name, so the program sees
/// its own original file name in `/proc/self/exe`.
fn resolve_program(bundle: &Path) -> Result<PathBuf, Error> {
    let link = bundle.join(PROG_FILENAME);
    let target = fs::read_link(&link)?;
    Ok(bundle.join(target))
}

/// Our base name, for error messages.
fn program_name() -> String {
    let argv0 = env::args().next().unwrap_or_default();
    Path::new(&argv0)
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "staticx-bootloader".to_owned())
}
