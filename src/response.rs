//! Server responses.
//!
//! A `Response` collects status, headers and cookies until the first body
//! byte (or the end of the handler) commits it. Committing picks the body
//! framing and compression, renders the preamble into a scratch buffer, and
//! writes it in one shot; after that the head is frozen and writes stream
//! through the composed pipeline.

use std::io::{self, Write};

use bytes::BytesMut;
use flate2::write::{GzEncoder, ZlibEncoder};
use flate2::Compression;
use http::{StatusCode, Version};

use crate::error::Error;
use crate::header::{Cookie, HeaderMap};
use crate::proto::chunked::ChunkedEncoder;
use crate::proto::{date, encode};

/// How the committed response delimits its body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Framing {
    /// `Content-Length` was emitted.
    Length,
    /// `Transfer-Encoding: chunked` was emitted.
    Chunked,
    /// Neither; the body runs until the connection closes. Only happens for
    /// HTTP/1.0 clients that never sent a length.
    CloseDelimited,
}

enum Out<'a> {
    Pending(&'a mut dyn Write),
    Streaming(Payload<'a>),
    Closed,
    // transient state while commit rebuilds the pipeline
    Poisoned,
}

enum Framer<'a> {
    Identity(&'a mut dyn Write),
    Chunked(ChunkedEncoder<&'a mut dyn Write>),
}

enum Payload<'a> {
    Plain(Framer<'a>),
    Gzip(GzEncoder<Framer<'a>>),
    Deflate(ZlibEncoder<Framer<'a>>),
}

/// An outgoing response, as given to a `Handler`.
///
/// The default status is `200 OK`. Implements `io::Write`; the first byte
/// written commits the response.
pub struct Response<'a> {
    status: StatusCode,
    reason: Option<String>,
    headers: HeaderMap,
    cookies: Vec<Cookie>,
    compress: bool,
    accept_encodings: Vec<String>,
    request_version: Version,
    chunked_buffer_size: usize,
    framing: Option<Framing>,
    wrote_body: bool,
    out: Out<'a>,
}

impl<'a> Response<'a> {
    pub(crate) fn new(
        out: &'a mut dyn Write,
        request_version: Version,
        accept_encodings: Vec<String>,
        compress_by_default: bool,
        chunked_buffer_size: usize,
    ) -> Response<'a> {
        Response {
            status: StatusCode::OK,
            reason: None,
            headers: HeaderMap::new(),
            cookies: Vec::new(),
            compress: compress_by_default,
            accept_encodings,
            request_version,
            chunked_buffer_size,
            framing: None,
            wrote_body: false,
            out: Out::Pending(out),
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// Sets the status code. Fails once the response is committed.
    pub fn set_status(&mut self, status: StatusCode) -> crate::Result<()> {
        self.check_uncommitted("status change")?;
        self.status = status;
        Ok(())
    }

    /// Overrides the reason phrase looked up from the status table.
    pub fn set_reason(&mut self, reason: impl Into<String>) -> crate::Result<()> {
        self.check_uncommitted("reason change")?;
        self.reason = Some(reason.into());
        Ok(())
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Replaces a header. Fails once the response is committed.
    pub fn set_header(
        &mut self,
        name: impl Into<String>,
        value: impl Into<String>,
    ) -> crate::Result<()> {
        self.check_uncommitted("header change")?;
        self.headers.set(name, value);
        Ok(())
    }

    /// Appends a header value. Fails once the response is committed.
    pub fn add_header(
        &mut self,
        name: impl Into<String>,
        value: impl Into<String>,
    ) -> crate::Result<()> {
        self.check_uncommitted("header change")?;
        self.headers.add(name, value);
        Ok(())
    }

    pub fn remove_header(&mut self, name: &str) -> crate::Result<()> {
        self.check_uncommitted("header change")?;
        self.headers.remove(name);
        Ok(())
    }

    /// Adds a cookie, replacing any existing cookie with the same name and
    /// path (path defaulting to `/`).
    pub fn add_cookie(&mut self, cookie: Cookie) -> crate::Result<()> {
        self.check_uncommitted("cookie change")?;
        let key = |c: &Cookie| (c.path().unwrap_or("/").to_owned(), c.name().to_owned());
        let new_key = key(&cookie);
        match self.cookies.iter_mut().find(|c| key(c) == new_key) {
            Some(existing) => *existing = cookie,
            None => self.cookies.push(cookie),
        }
        Ok(())
    }

    pub fn cookies(&self) -> &[Cookie] {
        &self.cookies
    }

    /// Opts this response in or out of compression. Whether compression
    /// actually happens also depends on the request's `Accept-Encoding`.
    pub fn set_compress(&mut self, compress: bool) -> crate::Result<()> {
        self.check_uncommitted("compression change")?;
        self.compress = compress;
        Ok(())
    }

    pub fn compress(&self) -> bool {
        self.compress
    }

    /// The `charset` parameter of the `Content-Type` header, resolved when
    /// asked for.
    pub fn character_encoding(&self) -> Option<String> {
        self.headers
            .get("content-type")
            .and_then(|ct| crate::header::param(ct, "charset"))
    }

    /// True once the preamble has been written to the wire.
    pub fn is_committed(&self) -> bool {
        !matches!(self.out, Out::Pending(_))
    }

    pub(crate) fn framing(&self) -> Option<Framing> {
        self.framing
    }

    /// Whether this response's headers let the connection be reused.
    pub(crate) fn allows_keep_alive(&self) -> bool {
        if self.headers.contains_token("connection", "close") {
            return false;
        }
        !matches!(self.framing, Some(Framing::CloseDelimited))
    }

    fn check_uncommitted(&self, what: &'static str) -> crate::Result<()> {
        if self.is_committed() {
            return Err(Error::new_illegal_state(what));
        }
        Ok(())
    }

    /// Picks framing and compression, renders the preamble, and swaps the
    /// writer for the streaming pipeline.
    fn commit(&mut self) -> io::Result<()> {
        let out = match std::mem::replace(&mut self.out, Out::Poisoned) {
            Out::Pending(out) => out,
            other => {
                self.out = other;
                return Ok(());
            }
        };

        let compression = if self.compress {
            self.pick_compression()
        } else {
            None
        };

        let content_length = self.headers.get("content-length").is_some();
        let framing = if compression.is_some() || !content_length {
            if self.request_version == Version::HTTP_10 {
                Framing::CloseDelimited
            } else {
                Framing::Chunked
            }
        } else {
            Framing::Length
        };

        match framing {
            Framing::Chunked => {
                // a compressed payload has a new, unknown length
                self.headers.remove("content-length");
                self.headers.set("Transfer-Encoding", "chunked");
            }
            Framing::CloseDelimited => {
                self.headers.remove("content-length");
                self.headers.set("Connection", "close");
            }
            Framing::Length => {}
        }

        if let Some(algorithm) = compression {
            self.headers.set("Content-Encoding", algorithm);
            if !self.headers.contains_token("vary", "accept-encoding") {
                self.headers.add("Vary", "Accept-Encoding");
            }
        }

        if !self.headers.contains("date") {
            let mut value = Vec::with_capacity(date::DATE_VALUE_LENGTH);
            date::extend(&mut value);
            self.headers
                .set("Date", String::from_utf8_lossy(&value).into_owned());
        }

        debug!(
            "committing response: {} framing={:?} compression={:?}",
            self.status, framing, compression
        );

        let mut preamble = BytesMut::with_capacity(256);
        encode::write_preamble(
            &mut preamble,
            self.status,
            self.reason.as_deref(),
            &self.headers,
            &self.cookies,
        );
        out.write_all(&preamble)?;

        let framer = match framing {
            Framing::Chunked => Framer::Chunked(ChunkedEncoder::new(out, self.chunked_buffer_size)),
            Framing::Length | Framing::CloseDelimited => Framer::Identity(out),
        };
        let payload = match compression {
            Some("gzip") => Payload::Gzip(GzEncoder::new(framer, Compression::default())),
            Some("deflate") => Payload::Deflate(ZlibEncoder::new(framer, Compression::default())),
            _ => Payload::Plain(framer),
        };
        self.framing = Some(framing);
        self.out = Out::Streaming(payload);
        Ok(())
    }

    // gzip wins over deflate when the client accepts both
    fn pick_compression(&self) -> Option<&'static str> {
        for algorithm in ["gzip", "deflate"] {
            if self
                .accept_encodings
                .iter()
                .any(|enc| enc == algorithm || (algorithm == "gzip" && enc == "x-gzip"))
            {
                return Some(algorithm);
            }
        }
        None
    }

    /// Commits if needed, flushes every layer and writes the chunked
    /// terminator. The underlying socket writer stays open; connection
    /// lifetime belongs to the worker.
    pub(crate) fn finish(&mut self) -> crate::Result<()> {
        if let Out::Pending(_) = self.out {
            if !self.wrote_body && self.headers.get("content-length").is_none() {
                // an empty uncompressed response has a known length
                self.compress = false;
                self.headers.set("Content-Length", "0");
            }
            self.commit().map_err(Error::from_io)?;
        }

        match std::mem::replace(&mut self.out, Out::Closed) {
            Out::Streaming(payload) => {
                let mut framer = match payload {
                    Payload::Plain(framer) => framer,
                    Payload::Gzip(enc) => enc.finish().map_err(Error::from_io)?,
                    Payload::Deflate(enc) => enc.finish().map_err(Error::from_io)?,
                };
                if let Framer::Chunked(ref mut enc) = framer {
                    enc.finish().map_err(Error::from_io)?;
                }
                framer.flush().map_err(Error::from_io)?;
                Ok(())
            }
            Out::Closed | Out::Poisoned => Ok(()),
            Out::Pending(_) => unreachable!("finish after commit"),
        }
    }
}

impl std::fmt::Debug for Response<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Response")
            .field("status", &self.status)
            .field("committed", &self.is_committed())
            .finish()
    }
}

impl Write for Response<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if let Out::Pending(_) = self.out {
            self.commit()?;
        }
        self.wrote_body = true;
        match &mut self.out {
            Out::Streaming(payload) => payload.write(buf),
            Out::Closed => Err(io::Error::new(
                io::ErrorKind::Other,
                "response already finished",
            )),
            Out::Poisoned => Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "response pipeline failed",
            )),
            Out::Pending(_) => unreachable!("write before commit"),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match &mut self.out {
            Out::Streaming(payload) => payload.flush(),
            _ => Ok(()),
        }
    }
}

impl Write for Framer<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Framer::Identity(out) => out.write(buf),
            Framer::Chunked(enc) => enc.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Framer::Identity(out) => out.flush(),
            Framer::Chunked(enc) => enc.flush(),
        }
    }
}

impl Write for Payload<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Payload::Plain(framer) => framer.write(buf),
            Payload::Gzip(enc) => enc.write(buf),
            Payload::Deflate(enc) => enc.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Payload::Plain(framer) => framer.flush(),
            Payload::Gzip(enc) => enc.flush(),
            Payload::Deflate(enc) => enc.flush(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::read::GzDecoder;
    use std::io::Read;

    fn response<'a>(out: &'a mut Vec<u8>, accept: &[&str], compress: bool) -> Response<'a> {
        Response::new(
            out,
            Version::HTTP_11,
            accept.iter().map(|s| s.to_string()).collect(),
            compress,
            1024,
        )
    }

    fn text(bytes: &[u8]) -> String {
        String::from_utf8_lossy(bytes).into_owned()
    }

    #[test]
    fn sized_body_passes_through() {
        let mut out = Vec::new();
        let mut res = response(&mut out, &[], false);
        res.set_header("Content-Length", "11").unwrap();
        res.write_all(b"Hello world").unwrap();
        res.finish().unwrap();
        drop(res);
        let text = text(&out);
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains("Content-Length: 11\r\n"));
        assert!(!text.contains("Transfer-Encoding"));
        assert!(text.ends_with("\r\n\r\nHello world"));
    }

    #[test]
    fn no_length_means_chunked() {
        let mut out = Vec::new();
        let mut res = response(&mut out, &[], false);
        res.write_all(b"Hello").unwrap();
        res.finish().unwrap();
        drop(res);
        let text = text(&out);
        assert!(text.contains("Transfer-Encoding: chunked\r\n"));
        assert!(text.ends_with("\r\n\r\n5\r\nHello\r\n0\r\n\r\n"));
    }

    #[test]
    fn empty_body_gets_length_zero() {
        let mut out = Vec::new();
        let mut res = response(&mut out, &[], false);
        res.finish().unwrap();
        drop(res);
        let text = text(&out);
        assert!(text.contains("Content-Length: 0\r\n"));
        assert!(!text.contains("Transfer-Encoding"));
    }

    #[test]
    fn mutation_after_commit_fails() {
        let mut out = Vec::new();
        let mut res = response(&mut out, &[], false);
        res.write_all(b"x").unwrap();
        assert!(res.set_status(StatusCode::NOT_FOUND).is_err());
        assert!(res.set_header("X-Late", "1").is_err());
        assert!(res.set_compress(true).is_err());
        assert!(res.add_cookie(Cookie::new("a", "b")).is_err());
        res.finish().unwrap();
    }

    #[test]
    fn gzip_compression_round_trips() {
        let mut out = Vec::new();
        let mut res = response(&mut out, &["gzip", "deflate"], true);
        res.write_all(b"payload payload payload").unwrap();
        res.finish().unwrap();
        drop(res);
        let text_head = text(&out);
        assert!(text_head.contains("Content-Encoding: gzip\r\n"));
        assert!(text_head.contains("Vary: Accept-Encoding\r\n"));
        assert!(text_head.contains("Transfer-Encoding: chunked\r\n"));

        // un-chunk then gunzip
        let body_at = out.windows(4).position(|w| w == b"\r\n\r\n").unwrap() + 4;
        let mut dechunked = Vec::new();
        let mut rdr =
            crate::proto::chunked::ChunkedDecoder::new(
                crate::net::pushback::PushbackReader::new(&out[body_at..]),
                64,
            );
        rdr.read_to_end(&mut dechunked).unwrap();
        let mut plain = Vec::new();
        GzDecoder::new(&dechunked[..]).read_to_end(&mut plain).unwrap();
        assert_eq!(plain, b"payload payload payload");
    }

    #[test]
    fn compression_needs_accept_encoding() {
        let mut out = Vec::new();
        let mut res = response(&mut out, &[], true);
        res.write_all(b"plain").unwrap();
        res.finish().unwrap();
        drop(res);
        assert!(!text(&out).contains("Content-Encoding"));
    }

    #[test]
    fn deflate_when_gzip_not_accepted() {
        let mut out = Vec::new();
        let mut res = response(&mut out, &["deflate"], true);
        res.write_all(b"x").unwrap();
        res.finish().unwrap();
        drop(res);
        assert!(text(&out).contains("Content-Encoding: deflate\r\n"));
    }

    #[test]
    fn compression_overrides_content_length() {
        let mut out = Vec::new();
        let mut res = response(&mut out, &["gzip"], true);
        res.set_header("Content-Length", "5").unwrap();
        res.write_all(b"xxxxx").unwrap();
        res.finish().unwrap();
        drop(res);
        let text = text(&out);
        assert!(!text.contains("Content-Length"));
        assert!(text.contains("Transfer-Encoding: chunked\r\n"));
    }

    #[test]
    fn http10_without_length_closes() {
        let mut out = Vec::new();
        let mut res = Response::new(&mut out, Version::HTTP_10, Vec::new(), false, 1024);
        res.write_all(b"old client").unwrap();
        res.finish().unwrap();
        assert!(!res.allows_keep_alive());
        drop(res);
        let text = text(&out);
        assert!(text.contains("Connection: close\r\n"));
        assert!(text.ends_with("\r\n\r\nold client"));
    }

    #[test]
    fn cookies_replace_by_path_and_name() {
        let mut out = Vec::new();
        let mut res = response(&mut out, &[], false);
        res.add_cookie(Cookie::new("sid", "1")).unwrap();
        res.add_cookie(Cookie::new("sid", "2")).unwrap();
        let mut scoped = Cookie::new("sid", "3");
        scoped.set_path("/other");
        res.add_cookie(scoped).unwrap();
        assert_eq!(res.cookies().len(), 2);
        res.finish().unwrap();
        drop(res);
        let text = text(&out);
        assert!(text.contains("Set-Cookie: sid=2\r\n"));
        assert!(text.contains("Set-Cookie: sid=3; Path=/other\r\n"));
    }

    #[test]
    fn finish_is_idempotent() {
        let mut out = Vec::new();
        let mut res = response(&mut out, &[], false);
        res.write_all(b"x").unwrap();
        res.finish().unwrap();
        res.finish().unwrap();
        drop(res);
        // exactly one terminator
        assert_eq!(text(&out).matches("0\r\n\r\n").count(), 1);
    }

    #[test]
    fn date_header_is_added() {
        let mut out = Vec::new();
        let mut res = response(&mut out, &[], false);
        res.finish().unwrap();
        drop(res);
        assert!(text(&out).contains("Date: "));
    }
}
