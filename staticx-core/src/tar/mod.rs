//! The streaming tape-archive layer.
//!
//! The embedded archive is read strictly forward: 512-byte header blocks,
//! content padded to whole blocks, GNU long-name records applied to the
//! entry that follows them, and a block of zeros marking the end. There is
//! no seeking and no second pass, which is what lets the same code run over
//! the raw section bytes and over the xz decoder.

mod extract;
mod header;

pub use extract::Extractor;
pub use header::{HeaderRecord, TypeFlag, BLOCK_SIZE};
