//! A reader that lets parsers over-read and hand the excess back.
//!
//! The preamble parser and the chunked decoder both read in blocks, so the
//! tail of one request's bytes can land in their buffers together with the
//! head of the next pipelined request. Those bytes are pushed back here and
//! re-served before anything is read from the socket again.

use std::io::{self, Read};

pub(crate) struct PushbackReader<R> {
    inner: R,
    pushed: Vec<u8>,
    pos: usize,
}

/// A reader that accepts bytes back after they were read.
pub(crate) trait Rewind: Read {
    /// Records bytes to be re-served by the next reads, front first.
    ///
    /// At most one outstanding push is allowed; pushing while un-served
    /// bytes remain is a caller bug.
    fn rewind(&mut self, bytes: &[u8]);
}

impl<R: Read> PushbackReader<R> {
    pub(crate) fn new(inner: R) -> PushbackReader<R> {
        PushbackReader {
            inner,
            pushed: Vec::new(),
            pos: 0,
        }
    }

    /// Bytes pushed back and not yet re-served.
    pub(crate) fn pending(&self) -> usize {
        self.pushed.len() - self.pos
    }
}

impl<R: Read> Read for PushbackReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.pos < self.pushed.len() {
            let n = (&self.pushed[self.pos..]).read(buf)?;
            self.pos += n;
            if self.pos == self.pushed.len() {
                self.pushed.clear();
                self.pos = 0;
            }
            return Ok(n);
        }
        self.inner.read(buf)
    }
}

impl<R: Read> Rewind for PushbackReader<R> {
    fn rewind(&mut self, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }
        assert!(
            self.pending() == 0,
            "pushback while previous push not consumed"
        );
        self.pushed.clear();
        self.pushed.extend_from_slice(bytes);
        self.pos = 0;
    }
}

impl<T: Rewind + ?Sized> Rewind for &mut T {
    fn rewind(&mut self, bytes: &[u8]) {
        (**self).rewind(bytes)
    }
}

impl<T: Rewind + ?Sized> Rewind for Box<T> {
    fn rewind(&mut self, bytes: &[u8]) {
        (**self).rewind(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serves_pushed_bytes_first() {
        let mut rdr = PushbackReader::new(&b"world"[..]);
        rdr.rewind(b"hello ");
        let mut out = String::new();
        rdr.read_to_string(&mut out).unwrap();
        assert_eq!(out, "hello world");
    }

    #[test]
    fn split_read_conserves_stream() {
        let data = b"GET / HTTP/1.1\r\n\r\nGET /next";
        let mut rdr = PushbackReader::new(&data[..]);
        let mut head = [0u8; 10];
        rdr.read_exact(&mut head).unwrap();
        rdr.rewind(&head);
        let mut out = Vec::new();
        rdr.read_to_end(&mut out).unwrap();
        assert_eq!(out, data);
    }

    #[test]
    fn partial_consumption_then_underlying() {
        let mut rdr = PushbackReader::new(&b"cd"[..]);
        rdr.rewind(b"ab");
        let mut one = [0u8; 1];
        rdr.read_exact(&mut one).unwrap();
        assert_eq!(&one, b"a");
        assert_eq!(rdr.pending(), 1);
        let mut rest = Vec::new();
        rdr.read_to_end(&mut rest).unwrap();
        assert_eq!(rest, b"bcd");
        assert_eq!(rdr.pending(), 0);
    }

    #[test]
    fn empty_push_is_noop() {
        let mut rdr = PushbackReader::new(&b"x"[..]);
        rdr.rewind(b"");
        assert_eq!(rdr.pending(), 0);
    }

    #[test]
    #[should_panic(expected = "pushback while previous push not consumed")]
    fn double_push_panics() {
        let mut rdr = PushbackReader::new(&b""[..]);
        rdr.rewind(b"ab");
        rdr.rewind(b"cd");
    }
}
