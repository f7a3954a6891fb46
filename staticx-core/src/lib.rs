#![warn(missing_docs)]

//! staticx-core is the runtime half of a single-file application packager.
//!
//! A packaged executable carries a tar archive (optionally xz-compressed) in
//! one of its own ELF sections. At run time the embedded bootloader maps its
//! own image, locates that section, extracts the archive into a private
//! bundle directory, rewrites the user program's interpreter and run-path
//! slots in place so it loads from the bundle, and finally runs it.
//!
//! This crate holds everything in that pipeline that does not need a child
//! process:
//!
//!   * [`mmap`] — whole-file shared mappings of the self-image and the
//!     patch target
//!   * [`elf`] — by-hand ELF inspection (sections by name, program headers
//!     by type, the dynamic table)
//!   * [`payload`] — detecting the xz magic and reading the payload as one
//!     forward-only byte stream
//!   * [`tar`] — the streaming archive extractor
//!   * [`patch`] — in-place rewrites of the interpreter and run-path slots
//!
//! The `staticx-bootloader` binary sequences these and supervises the child.

pub mod elf;
pub mod error;
#[cfg(all(test, target_pointer_width = "64"))]
pub(crate) mod testutil;
pub mod mmap;
pub mod patch;
pub mod payload;
pub mod tar;

pub use error::Error;
