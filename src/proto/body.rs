//! The request body pipeline.
//!
//! Built lazily per request: a framing layer (none, `Content-Length`, or
//! chunked) under a stack of inflaters mirroring the `Content-Encoding`
//! list, with a delivered-byte limiter on top. Composed by value; each layer
//! is a plain `Read`.

use std::io::{self, Read};

use flate2::read::{GzDecoder, ZlibDecoder};

use crate::error::Error;
use crate::net::pushback::Rewind;
use crate::proto::chunked::ChunkedDecoder;

/// The transport framing a request declared for its body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BodyFraming {
    None,
    Sized(u64),
    Chunked,
}

pub(crate) type BodySource<'a> = Box<dyn Rewind + Send + 'a>;

/// A request body stream handed to the handler.
///
/// Reading past the configured size limit fails the request; bytes the
/// handler leaves behind are drained by the worker between requests.
pub struct Body<'a> {
    decode: Decode<'a>,
    limit: u64,
    delivered: u64,
    drained: bool,
}

enum Framing<'a> {
    Empty,
    Sized {
        inner: BodySource<'a>,
        remaining: u64,
    },
    Chunked(ChunkedDecoder<BodySource<'a>>),
}

enum Decode<'a> {
    Raw(Framing<'a>),
    Gzip(Box<GzDecoder<Decode<'a>>>),
    Deflate(Box<ZlibDecoder<Decode<'a>>>),
}

impl<'a> Body<'a> {
    /// A body with nothing in it.
    pub(crate) fn empty() -> Body<'a> {
        Body {
            decode: Decode::Raw(Framing::Empty),
            limit: u64::MAX,
            delivered: 0,
            drained: true,
        }
    }

    /// Builds the pipeline. `encodings` is the request's `Content-Encoding`
    /// token list in header order; it is applied in reverse, outermost
    /// encoding first. Unknown encodings stop the stack so the caller sees
    /// the still-encoded bytes.
    pub(crate) fn new(
        source: BodySource<'a>,
        framing: BodyFraming,
        encodings: &[String],
        chunked_buffer_size: usize,
        limit: u64,
    ) -> crate::Result<Body<'a>> {
        if let BodyFraming::Sized(len) = framing {
            if len > limit {
                return Err(Error::new_content_too_large(limit));
            }
        }
        let framing = match framing {
            BodyFraming::None => Framing::Empty,
            BodyFraming::Sized(0) => Framing::Empty,
            BodyFraming::Sized(len) => Framing::Sized {
                inner: source,
                remaining: len,
            },
            BodyFraming::Chunked => {
                Framing::Chunked(ChunkedDecoder::new(source, chunked_buffer_size))
            }
        };

        let mut decode = Decode::Raw(framing);
        for encoding in encodings.iter().rev() {
            decode = match encoding.as_str() {
                "gzip" | "x-gzip" => Decode::Gzip(Box::new(GzDecoder::new(decode))),
                "deflate" => Decode::Deflate(Box::new(ZlibDecoder::new(decode))),
                "identity" => decode,
                other => {
                    trace!("unknown content-encoding {:?}, passing through", other);
                    break;
                }
            };
        }

        Ok(Body {
            decode,
            limit,
            delivered: 0,
            drained: false,
        })
    }

    /// Reads and discards whatever the handler left unread, up to `max`
    /// bytes. A second call never touches the stream again.
    pub(crate) fn drain(&mut self, max: u64) -> crate::Result<()> {
        if self.drained {
            return Ok(());
        }
        self.drained = true;
        let mut buf = [0u8; 8 * 1024];
        let mut drained: u64 = 0;
        loop {
            let n = self
                .decode
                .read(&mut buf)
                .map_err(Error::from_io)?;
            if n == 0 {
                trace!("drained {} unread body bytes", drained);
                return Ok(());
            }
            drained += n as u64;
            if drained > max {
                return Err(Error::new_too_many_bytes_to_drain(drained, max));
            }
        }
    }
}

impl std::fmt::Debug for Body<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Body")
            .field("limit", &self.limit)
            .field("delivered", &self.delivered)
            .finish()
    }
}

impl Read for Body<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.decode.read(buf)?;
        self.delivered += n as u64;
        if self.delivered > self.limit {
            return Err(Error::new_content_too_large(self.limit).into_io());
        }
        Ok(n)
    }
}

impl Read for Framing<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Framing::Empty => Ok(0),
            Framing::Sized { inner, remaining } => {
                if *remaining == 0 {
                    return Ok(0);
                }
                let want = (*remaining).min(buf.len() as u64) as usize;
                let n = inner.read(&mut buf[..want])?;
                if n == 0 {
                    return Err(Error::new_incomplete().into_io());
                }
                *remaining -= n as u64;
                Ok(n)
            }
            Framing::Chunked(decoder) => decoder.read(buf),
        }
    }
}

impl Read for Decode<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Decode::Raw(framing) => framing.read(buf),
            Decode::Gzip(decoder) => decoder.read(buf),
            Decode::Deflate(decoder) => decoder.read(buf),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::pushback::PushbackReader;
    use flate2::write::{GzEncoder, ZlibEncoder};
    use flate2::Compression;
    use std::io::Write;

    fn source(bytes: &[u8]) -> BodySource<'_> {
        Box::new(PushbackReader::new(bytes))
    }

    fn read_all(mut body: Body<'_>) -> io::Result<Vec<u8>> {
        let mut out = Vec::new();
        body.read_to_end(&mut out)?;
        Ok(out)
    }

    fn gzip(data: &[u8]) -> Vec<u8> {
        let mut enc = GzEncoder::new(Vec::new(), Compression::default());
        enc.write_all(data).unwrap();
        enc.finish().unwrap()
    }

    fn deflate(data: &[u8]) -> Vec<u8> {
        let mut enc = ZlibEncoder::new(Vec::new(), Compression::default());
        enc.write_all(data).unwrap();
        enc.finish().unwrap()
    }

    #[test]
    fn empty_framing_reads_nothing() {
        let body = Body::new(source(b"leftover"), BodyFraming::None, &[], 64, 1024).unwrap();
        assert_eq!(read_all(body).unwrap(), b"");
    }

    #[test]
    fn sized_framing_stops_at_length() {
        let body =
            Body::new(source(b"0123456789next"), BodyFraming::Sized(10), &[], 64, 1024).unwrap();
        assert_eq!(read_all(body).unwrap(), b"0123456789");
    }

    #[test]
    fn sized_framing_eof_early_fails() {
        let body = Body::new(source(b"0123"), BodyFraming::Sized(10), &[], 64, 1024).unwrap();
        assert!(read_all(body).is_err());
    }

    #[test]
    fn chunked_framing() {
        let body = Body::new(
            source(b"4\r\nWiki\r\n0\r\n\r\n"),
            BodyFraming::Chunked,
            &[],
            64,
            1024,
        )
        .unwrap();
        assert_eq!(read_all(body).unwrap(), b"Wiki");
    }

    #[test]
    fn gzip_decoding() {
        let payload = gzip(b"ping");
        let len = payload.len() as u64;
        let body = Body::new(
            source(&payload),
            BodyFraming::Sized(len),
            &["gzip".to_owned()],
            64,
            1024,
        )
        .unwrap();
        assert_eq!(read_all(body).unwrap(), b"ping");
    }

    #[test]
    fn stacked_encodings_decode_in_reverse() {
        // Content-Encoding: gzip, deflate => wire bytes are deflate(gzip(data))
        let payload = deflate(&gzip(b"ping"));
        let len = payload.len() as u64;
        let body = Body::new(
            source(&payload),
            BodyFraming::Sized(len),
            &["gzip".to_owned(), "deflate".to_owned()],
            64,
            1024,
        )
        .unwrap();
        assert_eq!(read_all(body).unwrap(), b"ping");
    }

    #[test]
    fn unknown_encoding_passes_raw_bytes() {
        let body = Body::new(
            source(b"opaque"),
            BodyFraming::Sized(6),
            &["br".to_owned()],
            64,
            1024,
        )
        .unwrap();
        assert_eq!(read_all(body).unwrap(), b"opaque");
    }

    #[test]
    fn declared_length_over_limit_fails_at_build() {
        let err = Body::new(source(b""), BodyFraming::Sized(2048), &[], 64, 1024).unwrap_err();
        assert_eq!(err.status_hint(), Some(http::StatusCode::PAYLOAD_TOO_LARGE));
    }

    #[test]
    fn delivered_bytes_over_limit_fail() {
        // chunked framing declares nothing up front, so the limiter has to
        // catch it on the way through
        let body = Body::new(
            source(b"8\r\nabcdefgh\r\n8\r\nijklmnop\r\n0\r\n\r\n"),
            BodyFraming::Chunked,
            &[],
            64,
            10,
        )
        .unwrap();
        let err = read_all(body).unwrap_err();
        let err = Error::from_io(err);
        assert_eq!(err.status_hint(), Some(http::StatusCode::PAYLOAD_TOO_LARGE));
    }

    #[test]
    fn drain_discards_and_caps() {
        let mut body =
            Body::new(source(b"0123456789"), BodyFraming::Sized(10), &[], 64, 1024).unwrap();
        body.drain(4).unwrap_err();

        let mut body =
            Body::new(source(b"0123456789"), BodyFraming::Sized(10), &[], 64, 1024).unwrap();
        body.drain(64).unwrap();
    }

    #[test]
    fn drain_is_idempotent() {
        let data = b"0123456789";
        let mut body = Body::new(source(data), BodyFraming::Sized(10), &[], 64, 1024).unwrap();
        body.drain(64).unwrap();
        // a second drain must not read again: it would fail loudly if it did,
        // because the sized framing has already consumed its full length
        body.drain(0).unwrap();
    }
}
