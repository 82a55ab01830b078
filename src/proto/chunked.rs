//! `Transfer-Encoding: chunked` codec.
//!
//! The decoder is a byte-at-a-time state machine over a refillable block
//! buffer. It only ever buffers ahead of itself; once the terminating chunk
//! has been consumed, whatever is left in the buffer belongs to the next
//! pipelined request and is handed back to the underlying stream.

use std::fmt;
use std::io::{self, Read, Write};

use bytes::BytesMut;

use crate::error::{Error, Section};
use crate::net::pushback::Rewind;
use crate::proto::chars::{hex_value, MAX_CHUNK_SIZE};

#[derive(Debug, PartialEq, Clone, Copy)]
enum ChunkedState {
    Start,
    Size,
    SizeLws,
    Extension,
    SizeLf,
    Body,
    BodyCr,
    BodyLf,
    Trailer,
    TrailerLf,
    EndCr,
    EndLf,
    End,
}

pub(crate) struct ChunkedDecoder<R> {
    inner: R,
    state: ChunkedState,
    size: u64,
    remaining: u64,
    buf: Vec<u8>,
    head: usize,
    tail: usize,
    rewound: bool,
}

impl<R> ChunkedDecoder<R> {
    pub(crate) fn is_complete(&self) -> bool {
        self.state == ChunkedState::End
    }
}

impl<R: Rewind> ChunkedDecoder<R> {
    pub(crate) fn new(inner: R, buffer_size: usize) -> ChunkedDecoder<R> {
        ChunkedDecoder {
            inner,
            state: ChunkedState::Start,
            size: 0,
            remaining: 0,
            buf: vec![0; buffer_size.max(16)],
            head: 0,
            tail: 0,
            rewound: false,
        }
    }

    /// Refills the block buffer. Errors on EOF; the chunked framing always
    /// tells us when the body is over, so running dry mid-stream means the
    /// peer hung up early.
    fn fill(&mut self) -> io::Result<()> {
        debug_assert_eq!(self.head, self.tail);
        let n = self.inner.read(&mut self.buf)?;
        if n == 0 {
            return Err(
                Error::new_incomplete_parse(Section::Chunk, self.state.name()).into_io(),
            );
        }
        self.head = 0;
        self.tail = n;
        Ok(())
    }

    fn next_byte(&mut self) -> io::Result<u8> {
        if self.head == self.tail {
            self.fill()?;
        }
        let b = self.buf[self.head];
        self.head += 1;
        Ok(b)
    }

    fn invalid(&self, byte: u8) -> io::Error {
        Error::new_parse(Section::Chunk, byte, self.state.name()).into_io()
    }

    /// Consumes one control byte and advances the state machine.
    fn step(&mut self) -> io::Result<()> {
        use self::ChunkedState::*;

        let b = self.next_byte()?;
        self.state = match self.state {
            Start => match hex_value(b) {
                Some(v) => {
                    self.size = v as u64;
                    Size
                }
                None => return Err(self.invalid(b)),
            },
            Size => match b {
                b'\r' => SizeLf,
                b';' => Extension,
                b'\t' | b' ' => SizeLws,
                _ => match hex_value(b) {
                    Some(v) => {
                        self.size = self.size * 16 + v as u64;
                        if self.size > MAX_CHUNK_SIZE {
                            return Err(self.invalid(b));
                        }
                        Size
                    }
                    None => return Err(self.invalid(b)),
                },
            },
            SizeLws => match b {
                b'\t' | b' ' => SizeLws,
                b';' => Extension,
                b'\r' => SizeLf,
                _ => return Err(self.invalid(b)),
            },
            // Extension content is consumed and discarded.
            Extension => match b {
                b'\r' => SizeLf,
                b'\n' => return Err(self.invalid(b)),
                _ => Extension,
            },
            SizeLf => match b {
                b'\n' if self.size == 0 => EndCr,
                b'\n' => {
                    trace!("incoming chunk, size={}", self.size);
                    self.remaining = self.size;
                    Body
                }
                _ => return Err(self.invalid(b)),
            },
            BodyCr => match b {
                b'\r' => BodyLf,
                _ => return Err(self.invalid(b)),
            },
            BodyLf => match b {
                b'\n' => {
                    self.size = 0;
                    Start
                }
                _ => return Err(self.invalid(b)),
            },
            // Trailer fields are tolerated and thrown away.
            EndCr => match b {
                b'\r' => EndLf,
                _ => Trailer,
            },
            Trailer => match b {
                b'\r' => TrailerLf,
                _ => Trailer,
            },
            TrailerLf => match b {
                b'\n' => EndCr,
                _ => return Err(self.invalid(b)),
            },
            EndLf => match b {
                b'\n' => End,
                _ => return Err(self.invalid(b)),
            },
            Body | End => unreachable!("step called in state {:?}", self.state),
        };
        Ok(())
    }

    /// Delivers as much of the current chunk as fits, first from the block
    /// buffer and then straight from the underlying stream.
    fn read_body(&mut self, out: &mut [u8]) -> io::Result<usize> {
        let want = (self.remaining.min(out.len() as u64)) as usize;
        let buffered = self.tail - self.head;
        let n = if buffered > 0 {
            let n = want.min(buffered);
            out[..n].copy_from_slice(&self.buf[self.head..self.head + n]);
            self.head += n;
            n
        } else {
            let n = self.inner.read(&mut out[..want])?;
            if n == 0 {
                return Err(
                    Error::new_incomplete_parse(Section::Chunk, self.state.name()).into_io(),
                );
            }
            n
        };
        self.remaining -= n as u64;
        if self.remaining == 0 {
            self.state = ChunkedState::BodyCr;
        }
        Ok(n)
    }
}

impl<R: Rewind> Read for ChunkedDecoder<R> {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        if out.is_empty() {
            return Ok(0);
        }
        loop {
            match self.state {
                ChunkedState::End => {
                    if !self.rewound {
                        self.rewound = true;
                        let leftover = &self.buf[self.head..self.tail];
                        trace!("end of chunked, {} bytes pushed back", leftover.len());
                        self.inner.rewind(leftover);
                        self.head = 0;
                        self.tail = 0;
                    }
                    return Ok(0);
                }
                ChunkedState::Body => return self.read_body(out),
                _ => self.step()?,
            }
        }
    }
}

impl<R> fmt::Debug for ChunkedDecoder<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChunkedDecoder")
            .field("state", &self.state)
            .field("remaining", &self.remaining)
            .field("complete", &self.is_complete())
            .finish()
    }
}

impl ChunkedState {
    fn name(&self) -> &'static str {
        match self {
            ChunkedState::Start => "Start",
            ChunkedState::Size => "Size",
            ChunkedState::SizeLws => "SizeLws",
            ChunkedState::Extension => "Extension",
            ChunkedState::SizeLf => "SizeLf",
            ChunkedState::Body => "Body",
            ChunkedState::BodyCr => "BodyCr",
            ChunkedState::BodyLf => "BodyLf",
            ChunkedState::Trailer => "Trailer",
            ChunkedState::TrailerLf => "TrailerLf",
            ChunkedState::EndCr => "EndCr",
            ChunkedState::EndLf => "EndLf",
            ChunkedState::End => "End",
        }
    }
}

/// Buffers response body writes and frames them as chunks.
///
/// A chunk is emitted whenever the buffer reaches the configured size or the
/// stream is flushed. `finish` writes the zero-size terminator exactly once.
pub(crate) struct ChunkedEncoder<W> {
    inner: W,
    buf: BytesMut,
    max: usize,
    finished: bool,
}

impl<W: Write> ChunkedEncoder<W> {
    pub(crate) fn new(inner: W, max_chunk: usize) -> ChunkedEncoder<W> {
        let max = max_chunk.max(1);
        ChunkedEncoder {
            inner,
            buf: BytesMut::with_capacity(max),
            max,
            finished: false,
        }
    }

    fn emit_chunk(&mut self) -> io::Result<()> {
        if self.buf.is_empty() {
            return Ok(());
        }
        trace!("chunked write, size={}", self.buf.len());
        write!(self.inner, "{:X}\r\n", self.buf.len())?;
        self.inner.write_all(&self.buf)?;
        self.inner.write_all(b"\r\n")?;
        self.buf.clear();
        Ok(())
    }

    /// Flushes pending bytes and writes the terminating `0\r\n\r\n`.
    pub(crate) fn finish(&mut self) -> io::Result<()> {
        if self.finished {
            return Ok(());
        }
        self.emit_chunk()?;
        self.inner.write_all(b"0\r\n\r\n")?;
        self.finished = true;
        self.inner.flush()
    }
}

impl<W: Write> Write for ChunkedEncoder<W> {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        if self.finished {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                "write after chunked terminator",
            ));
        }
        self.buf.extend_from_slice(data);
        while self.buf.len() >= self.max {
            let full = self.buf.split_to(self.max);
            trace!("chunked write, size={}", full.len());
            write!(self.inner, "{:X}\r\n", full.len())?;
            self.inner.write_all(&full)?;
            self.inner.write_all(b"\r\n")?;
        }
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.emit_chunk()?;
        self.inner.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::pushback::PushbackReader;

    fn decoder(input: &[u8]) -> ChunkedDecoder<PushbackReader<&[u8]>> {
        ChunkedDecoder::new(PushbackReader::new(input), 64)
    }

    fn decode_all(input: &[u8]) -> io::Result<Vec<u8>> {
        let mut out = Vec::new();
        decoder(input).read_to_end(&mut out)?;
        Ok(out)
    }

    #[test]
    fn simple_body() {
        assert_eq!(
            decode_all(b"4\r\nWiki\r\n7\r\npedia i\r\n0\r\n\r\n").unwrap(),
            b"Wikipedia i"
        );
    }

    #[test]
    fn empty_body() {
        assert_eq!(decode_all(b"0\r\n\r\n").unwrap(), b"");
    }

    #[test]
    fn extensions_are_discarded() {
        assert_eq!(
            decode_all(b"4;name=value;other\r\nWiki\r\n0\r\n\r\n").unwrap(),
            b"Wiki"
        );
        assert_eq!(decode_all(b"4  ; ext\r\nWiki\r\n0\r\n\r\n").unwrap(), b"Wiki");
    }

    #[test]
    fn trailers_are_discarded() {
        assert_eq!(
            decode_all(b"4\r\nWiki\r\n0\r\nExpires: never\r\nX-T: 1\r\n\r\n").unwrap(),
            b"Wiki"
        );
    }

    #[test]
    fn pipelined_bytes_are_pushed_back() {
        let input = &b"5\r\nhello\r\n0\r\n\r\nGET /next HTTP/1.1\r\n"[..];
        let mut dec = ChunkedDecoder::new(PushbackReader::new(input), 64);
        let mut body = Vec::new();
        dec.read_to_end(&mut body).unwrap();
        assert_eq!(body, b"hello");
        assert!(dec.is_complete());

        let mut rest = Vec::new();
        let mut inner = dec.inner;
        inner.read_to_end(&mut rest).unwrap();
        assert_eq!(rest, b"GET /next HTTP/1.1\r\n");
    }

    #[test]
    fn bounded_reads_per_call() {
        let mut dec = decoder(b"A\r\n0123456789\r\n0\r\n\r\n");
        let mut out = [0u8; 4];
        assert_eq!(dec.read(&mut out).unwrap(), 4);
        assert_eq!(&out, b"0123");
        assert_eq!(dec.read(&mut out).unwrap(), 4);
        assert_eq!(&out, b"4567");
        assert_eq!(dec.read(&mut out).unwrap(), 2);
        assert_eq!(&out[..2], b"89");
        assert_eq!(dec.read(&mut out).unwrap(), 0);
    }

    #[test]
    fn missing_size_digit_fails() {
        let err = decode_all(b"\r\nWiki\r\n0\r\n\r\n").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn invalid_hex_fails() {
        assert!(decode_all(b"X\r\n\r\n0\r\n\r\n").is_err());
        assert!(decode_all(b"1X\r\na\r\n0\r\n\r\n").is_err());
    }

    #[test]
    fn oversized_chunk_fails() {
        // one past 2^31 - 2
        assert!(decode_all(b"7FFFFFFF\r\n").is_err());
    }

    #[test]
    fn bare_lf_fails() {
        assert!(decode_all(b"4\nWiki\r\n0\r\n\r\n").is_err());
    }

    #[test]
    fn missing_chunk_crlf_fails() {
        assert!(decode_all(b"4\r\nWikipedia\r\n0\r\n\r\n").is_err());
    }

    #[test]
    fn truncated_stream_fails() {
        let err = decode_all(b"4\r\nWi").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn encode_writes_chunks_on_flush() {
        let mut enc = ChunkedEncoder::new(Vec::new(), 1024);
        enc.write_all(b"foo bar").unwrap();
        enc.write_all(b"baz quux herp").unwrap();
        enc.finish().unwrap();
        assert_eq!(
            enc.inner,
            b"14\r\nfoo barbaz quux herp\r\n0\r\n\r\n"
        );
    }

    #[test]
    fn encode_splits_at_max_chunk_size() {
        let mut enc = ChunkedEncoder::new(Vec::new(), 4);
        enc.write_all(b"abcdefghij").unwrap();
        enc.finish().unwrap();
        assert_eq!(
            enc.inner,
            b"4\r\nabcd\r\n4\r\nefgh\r\n2\r\nij\r\n0\r\n\r\n"
        );
    }

    #[test]
    fn finish_is_idempotent() {
        let mut enc = ChunkedEncoder::new(Vec::new(), 8);
        enc.write_all(b"hi").unwrap();
        enc.finish().unwrap();
        enc.finish().unwrap();
        assert_eq!(enc.inner, b"2\r\nhi\r\n0\r\n\r\n");
    }

    #[test]
    fn round_trip() {
        let payload = b"The quick brown fox jumps over the lazy dog";
        for max in [1usize, 3, 7, 64] {
            let mut enc = ChunkedEncoder::new(Vec::new(), max);
            enc.write_all(payload).unwrap();
            enc.finish().unwrap();
            let encoded = enc.inner.clone();
            assert_eq!(decode_all(&encoded).unwrap(), payload, "max={}", max);
        }
    }
}
