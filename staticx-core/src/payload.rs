//! Reading the embedded archive payload.
//!
//! The archive section holds either raw tar bytes or an xz stream, told
//! apart by the fixed six-byte magic. Both cases are exposed behind the same
//! forward-only [`io::Read`] so the extractor never knows the difference:
//! the raw variant copies out of the mapped section, the xz variant drives a
//! streaming decoder over it. Neither seeks, and end of input (respectively
//! end of stream) is a 0-length read.

use std::cmp;
use std::io;

use tracing::{debug, trace};
use xz2::stream::{Action, Status, Stream};

use crate::error::Error;

/// Magic prefix of an xz stream.
/// <https://tukaani.org/xz/xz-file-format.txt>
pub const XZ_MAGIC: [u8; 6] = [0xfd, b'7', b'z', b'X', b'Z', 0x00];

/// Decoder memory ceiling, which bounds the dictionary size. 8 MiB
const XZ_DICT_MAX: u64 = 8 << 20;

/// Whether `data` starts with the xz magic.
pub fn is_xz(data: &[u8]) -> bool {
    data.len() >= XZ_MAGIC.len() && data[..XZ_MAGIC.len()] == XZ_MAGIC
}

/// A forward-only reader over the archive payload.
pub enum PayloadReader<'a> {
    /// The payload is raw tar bytes, copied through.
    Raw(RawReader<'a>),

    /// The payload is an xz stream, decompressed on the fly.
    Xz(Box<XzReader<'a>>),
}

impl<'a> PayloadReader<'a> {
    /// Sniff the payload's magic and pick the matching variant.
    pub fn new(data: &'a [u8]) -> Self {
        let xz = is_xz(data);
        debug!(
            len = data.len(),
            "payload {} xz-compressed",
            if xz { "is" } else { "is not" }
        );
        if xz {
            Self::Xz(Box::new(XzReader::new(data)))
        } else {
            Self::Raw(RawReader::new(data))
        }
    }
}

impl io::Read for PayloadReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Self::Raw(rd) => rd.read(buf),
            Self::Xz(rd) => rd.read(buf),
        }
    }
}

/// Copy-through reader over an uncompressed payload.
pub struct RawReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> RawReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }
}

impl io::Read for RawReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = cmp::min(buf.len(), self.data.len() - self.pos);
        buf[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

/// Streaming xz decoder over a compressed payload.
///
/// The decoder itself is allocated on first read. Every call fills the
/// caller's buffer completely unless the stream ends first; after the end of
/// the stream all reads return 0.
pub struct XzReader<'a> {
    data: &'a [u8],
    pos: usize,
    stream: Option<Stream>,
    end_of_stream: bool,
}

impl<'a> XzReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            pos: 0,
            stream: None,
            end_of_stream: false,
        }
    }

    fn stream(&mut self) -> io::Result<&mut Stream> {
        if self.stream.is_none() {
            let stream = Stream::new_stream_decoder(XZ_DICT_MAX, 0).map_err(|e| {
                io::Error::from(Error::Decompression {
                    msg: format!("failed to initialize decoder: {e}"),
                })
            })?;
            self.stream = Some(stream);
        }
        Ok(self.stream.as_mut().expect("just initialized"))
    }
}

impl io::Read for XzReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.end_of_stream || buf.is_empty() {
            return Ok(0);
        }

        let data = self.data;
        let mut pos = self.pos;
        let mut written = 0;
        let mut end_of_stream = false;
        let stream = self.stream()?;

        // Always attempt to fill the whole output buffer; tar reads in
        // block multiples and the stream ends on a block boundary.
        while written < buf.len() {
            let in_before = stream.total_in() as usize;
            let out_before = stream.total_out() as usize;

            let status = stream
                .process(&data[pos..], &mut buf[written..], Action::Run)
                .map_err(|e| {
                    io::Error::from(Error::Decompression {
                        msg: format!("decoder failed: {e}"),
                    })
                })?;

            let consumed = stream.total_in() as usize - in_before;
            let produced = stream.total_out() as usize - out_before;
            pos += consumed;
            written += produced;
            trace!(consumed, produced, ?status, "decoder step");

            match status {
                Status::StreamEnd => {
                    end_of_stream = true;
                    break;
                }
                Status::Ok if consumed == 0 && produced == 0 => {
                    // no progress and no end-of-stream marker: the
                    // compressed payload was cut short
                    return Err(io::Error::from(Error::Decompression {
                        msg: "stream truncated".to_owned(),
                    }));
                }
                Status::Ok => {}
                other => {
                    return Err(io::Error::from(Error::Decompression {
                        msg: format!("decoder returned {other:?}"),
                    }));
                }
            }
        }

        self.pos = pos;
        self.end_of_stream = end_of_stream;
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    fn xz_compress(data: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        xz2::read::XzEncoder::new(data, 6)
            .read_to_end(&mut out)
            .unwrap();
        out
    }

    #[test]
    fn detects_magic() {
        assert!(is_xz(&xz_compress(b"hello")));
        assert!(!is_xz(b"hello there, long enough"));
        assert!(!is_xz(b"\xfd7z"));
    }

    #[test]
    fn raw_reads_through_and_hits_eof() {
        let mut rd = PayloadReader::new(b"abcdef");
        let mut buf = [0u8; 4];
        assert_eq!(rd.read(&mut buf).unwrap(), 4);
        assert_eq!(&buf, b"abcd");
        assert_eq!(rd.read(&mut buf).unwrap(), 2);
        assert_eq!(&buf[..2], b"ef");
        assert_eq!(rd.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn xz_round_trips_across_many_small_reads() {
        let payload: Vec<u8> = (0..=255u8).cycle().take(64 * 1024).collect();
        let compressed = xz_compress(&payload);

        let mut rd = PayloadReader::new(&compressed);
        let mut out = Vec::new();
        let mut buf = [0u8; 512];
        loop {
            let n = rd.read(&mut buf).unwrap();
            if n == 0 {
                break;
            }
            out.extend_from_slice(&buf[..n]);
        }
        assert_eq!(out, payload);
        // stays at end of stream
        assert_eq!(rd.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn xz_truncated_stream_is_an_error() {
        let compressed = xz_compress(&[7u8; 8192]);
        let cut = &compressed[..compressed.len() / 2];

        let mut rd = PayloadReader::new(cut);
        let mut out = vec![0u8; 16 * 1024];
        let mut filled = 0;
        let err = loop {
            match rd.read(&mut out[filled..]) {
                Ok(0) => panic!("truncated stream reported clean EOF"),
                Ok(n) => filled += n,
                Err(e) => break e,
            }
        };
        let msg = err.to_string();
        assert!(msg.contains("truncated") || msg.contains("decoder"), "{msg}");
    }
}
