//! All error types used in this crate

/// Any bootloader-runtime error, from malformed images to slot overflows.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The mapped executable is not in the expected format.
    #[error("format: {0}")]
    Format(#[from] FormatError),

    /// The embedded archive stream could not be read.
    #[error("archive: {0}")]
    Archive(#[from] ArchiveError),

    /// A replacement string does not fit its fixed on-disk slot.
    #[error("slot: {0}")]
    Slot(#[from] SlotError),

    /// I/O-related error
    #[error("io: {0}")]
    IO(#[from] std::io::Error),

    /// Decompression-related error
    #[error("xz decompression error: {msg}")]
    Decompression {
        /// Additional information
        msg: String,
    },
}

/// Structural problems with an ELF image.
///
/// These mostly indicate a corrupted packaged executable, but can also stem
/// from a packaging-side bug.
#[derive(Debug, thiserror::Error)]
pub enum FormatError {
    /// The first four identification bytes are not `\x7fELF`.
    #[error("invalid ELF magic")]
    BadMagic,

    /// A header, table, or string ran past the end of the mapped file.
    #[error("structure extends past end of image")]
    Truncated,

    /// The image's section-header entry size disagrees with the build-time
    /// layout, so walking the table would misinterpret every record.
    #[error("section header size mismatch: image says {actual}, expected {expected}")]
    SectionEntrySize {
        /// entry size from `e_shentsize`
        actual: u16,
        /// entry size this build was compiled for
        expected: u16,
    },

    /// The image's program-header entry size disagrees with the build-time
    /// layout.
    #[error("program header size mismatch: image says {actual}, expected {expected}")]
    ProgramEntrySize {
        /// entry size from `e_phentsize`
        actual: u16,
        /// entry size this build was compiled for
        expected: u16,
    },

    /// A section that the pipeline cannot proceed without was not found.
    #[error("missing section {0}")]
    MissingSection(&'static str),

    /// The program has no `PT_INTERP` header, so there is no interpreter
    /// slot to rewrite.
    #[error("no interpreter program header")]
    MissingInterpreter,

    /// The dynamic table holds neither `DT_RPATH` nor `DT_RUNPATH`.
    #[error("no run-path entry in dynamic table")]
    MissingRunPath,

    /// A run-path tag points outside the dynamic string table.
    #[error("run-path offset {offset} outside string table of {table_size} bytes")]
    RunPathOutOfRange {
        /// value of the run-path tag
        offset: u64,
        /// size of `.dynstr`
        table_size: u64,
    },

    /// The interpreter slot holds no NUL within its recorded size.
    #[error("interpreter slot is not NUL-terminated")]
    UnterminatedInterpreter,

    /// The run-path string holds no NUL within the string table.
    #[error("run-path string is not NUL-terminated")]
    UnterminatedRunPath,
}

/// Problems in the embedded tar stream.
#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    /// A 512-byte header block could not be parsed.
    #[error("invalid header block")]
    InvalidHeader,

    /// A numeric header field held something other than octal digits.
    #[error("invalid octal field {0:?}")]
    InvalidOctal(String),

    /// The stream ended before an entry's recorded content did.
    #[error("short read: wanted {expected} bytes, stream gave {actual}")]
    ShortRead {
        /// bytes the entry still owed
        expected: usize,
        /// bytes the stream produced
        actual: usize,
    },

    /// An entry's content is larger than this build can buffer.
    #[error("entry of {0} bytes is too large")]
    EntryTooLarge(u64),
}

/// A replacement string exceeds the capacity of its fixed slot.
///
/// The two slots deliberately measure capacity differently: the interpreter
/// slot admits `filesz - 1` payload bytes, the run path only as many bytes
/// as the string it replaces.
#[derive(Debug, thiserror::Error)]
pub enum SlotError {
    /// The new interpreter path (plus terminator) exceeds `p_filesz`.
    #[error("interpreter path of {required} bytes exceeds slot of {capacity}")]
    InterpreterTooLong {
        /// bytes needed, including the terminator
        required: usize,
        /// `p_filesz` of the interpreter segment
        capacity: usize,
    },

    /// The new run path is longer than the string it would replace.
    #[error("run path of {required} bytes exceeds existing string of {capacity}")]
    RunPathTooLong {
        /// bytes needed, excluding the terminator
        required: usize,
        /// length of the current run-path string
        capacity: usize,
    },
}

impl From<Error> for std::io::Error {
    fn from(e: Error) -> Self {
        match e {
            Error::IO(e) => e,
            e => std::io::Error::other(e),
        }
    }
}

impl From<nix::Error> for Error {
    fn from(e: nix::Error) -> Self {
        Error::IO(std::io::Error::from_raw_os_error(e as i32))
    }
}
