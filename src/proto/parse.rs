//! Request preamble parsing.
//!
//! A byte-at-a-time state machine runs until it has seen the blank line that
//! ends the header section. Bytes read past that point belong to the request
//! body (or the next pipelined request) and are pushed back onto the stream.

use std::io::Read;

use encoding_rs::Encoding;

use crate::error::{Error, Section};
use crate::header::HeaderMap;
use crate::net::pushback::{PushbackReader, Rewind};
use crate::proto::chars;
use crate::request::Params;

/// A parsed request line plus headers.
#[derive(Debug)]
pub(crate) struct Preamble {
    pub(crate) method: http::Method,
    pub(crate) path: String,
    pub(crate) query: Option<String>,
    pub(crate) version: http::Version,
    pub(crate) headers: HeaderMap,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum State {
    MethodStart,
    Method,
    MethodSp,
    Target,
    TargetSp,
    Version,
    VersionCr,
    HeaderLineStart,
    HeaderName,
    HeaderValueStart,
    HeaderValue,
    HeaderCr,
    FinalCr,
    Complete,
}

pub(crate) struct PreambleParser {
    state: State,
    method: Vec<u8>,
    target: Vec<u8>,
    version: Vec<u8>,
    name: Vec<u8>,
    value: Vec<u8>,
    headers: HeaderMap,
    total: usize,
    max_bytes: usize,
}

impl PreambleParser {
    pub(crate) fn new(max_bytes: usize) -> PreambleParser {
        PreambleParser {
            state: State::MethodStart,
            method: Vec::new(),
            target: Vec::new(),
            version: Vec::new(),
            name: Vec::new(),
            value: Vec::new(),
            headers: HeaderMap::new(),
            total: 0,
            max_bytes,
        }
    }

    /// A parser that starts directly at the header section, for multipart
    /// part headers.
    pub(crate) fn headers_only(max_bytes: usize) -> PreambleParser {
        let mut parser = PreambleParser::new(max_bytes);
        parser.state = State::HeaderLineStart;
        parser
    }

    pub(crate) fn is_complete(&self) -> bool {
        self.state == State::Complete
    }

    /// True once any byte beyond leading blank lines has been consumed.
    pub(crate) fn has_started(&self) -> bool {
        self.state != State::MethodStart || self.total > 0
    }

    /// Feeds a block of bytes. Returns how many were consumed once the
    /// preamble is complete; the rest belong to whatever follows.
    pub(crate) fn advance(&mut self, chunk: &[u8]) -> crate::Result<Option<usize>> {
        for (i, &b) in chunk.iter().enumerate() {
            self.total += 1;
            if self.total > self.max_bytes {
                return Err(self.over_budget());
            }
            self.step(b)?;
            if self.state == State::Complete {
                return Ok(Some(i + 1));
            }
        }
        Ok(None)
    }

    fn over_budget(&self) -> Error {
        match self.state {
            State::Target | State::TargetSp => Error::new_uri_too_long(self.max_bytes),
            _ => Error::new_request_too_large(self.max_bytes),
        }
    }

    fn invalid(&self, byte: u8) -> Error {
        Error::new_parse(Section::Preamble, byte, self.state.name())
    }

    fn step(&mut self, b: u8) -> crate::Result<()> {
        use self::State::*;

        self.state = match self.state {
            // Tolerate blank lines ahead of the request line.
            MethodStart => match b {
                b'\r' | b'\n' => MethodStart,
                _ if chars::is_token_char(b) => {
                    self.method.push(b);
                    Method
                }
                _ => return Err(self.invalid(b)),
            },
            Method => match b {
                b' ' => MethodSp,
                _ if chars::is_token_char(b) => {
                    self.method.push(b);
                    Method
                }
                _ => return Err(self.invalid(b)),
            },
            MethodSp => match b {
                b' ' => MethodSp,
                _ if chars::is_target_char(b) => {
                    self.target.push(b);
                    Target
                }
                _ => return Err(self.invalid(b)),
            },
            Target => match b {
                b' ' => TargetSp,
                _ if chars::is_target_char(b) => {
                    self.target.push(b);
                    Target
                }
                _ => return Err(self.invalid(b)),
            },
            TargetSp => match b {
                b' ' => TargetSp,
                _ if chars::is_target_char(b) => {
                    self.version.push(b);
                    Version
                }
                _ => return Err(self.invalid(b)),
            },
            Version => match b {
                b'\r' => VersionCr,
                _ if chars::is_target_char(b) => {
                    self.version.push(b);
                    Version
                }
                _ => return Err(self.invalid(b)),
            },
            VersionCr => match b {
                b'\n' => HeaderLineStart,
                _ => return Err(self.invalid(b)),
            },
            HeaderLineStart => match b {
                b'\r' => FinalCr,
                _ if chars::is_token_char(b) => {
                    self.name.push(b);
                    HeaderName
                }
                _ => return Err(self.invalid(b)),
            },
            HeaderName => match b {
                b':' => HeaderValueStart,
                _ if chars::is_token_char(b) => {
                    self.name.push(b);
                    HeaderName
                }
                _ => return Err(self.invalid(b)),
            },
            HeaderValueStart => match b {
                _ if chars::is_whitespace(b) => HeaderValueStart,
                b'\r' => {
                    self.commit_header();
                    HeaderCr
                }
                _ if chars::is_value_char(b) => {
                    self.value.push(b);
                    HeaderValue
                }
                _ => return Err(self.invalid(b)),
            },
            HeaderValue => match b {
                b'\r' => {
                    self.commit_header();
                    HeaderCr
                }
                // inner whitespace is part of the value, trailing is trimmed
                _ if chars::is_value_char(b) || chars::is_whitespace(b) => {
                    self.value.push(b);
                    HeaderValue
                }
                _ => return Err(self.invalid(b)),
            },
            HeaderCr => match b {
                b'\n' => HeaderLineStart,
                _ => return Err(self.invalid(b)),
            },
            FinalCr => match b {
                b'\n' => Complete,
                _ => return Err(self.invalid(b)),
            },
            Complete => return Err(self.invalid(b)),
        };
        Ok(())
    }

    fn commit_header(&mut self) {
        let name = latin1(&self.name);
        while matches!(self.value.last(), Some(b) if chars::is_whitespace(*b)) {
            self.value.pop();
        }
        let value = latin1(&self.value);
        self.headers.add(name, value);
        self.name.clear();
        self.value.clear();
    }

    pub(crate) fn finish(self) -> crate::Result<Preamble> {
        debug_assert!(self.is_complete());
        let method = http::Method::from_bytes(&self.method)
            .map_err(|_| Error::new_incomplete_parse(Section::Preamble, "Method"))?;
        let version = match &self.version[..] {
            b"HTTP/1.1" => http::Version::HTTP_11,
            b"HTTP/1.0" => http::Version::HTTP_10,
            _ => return Err(Error::new_incomplete_parse(Section::Preamble, "Version")),
        };
        let target = latin1(&self.target);
        let (path, query) = match target.find('?') {
            Some(i) => (target[..i].to_owned(), Some(target[i + 1..].to_owned())),
            None => (target, None),
        };
        debug!("request line: {:?} {:?} {:?}", method, path, version);
        Ok(Preamble {
            method,
            path,
            query,
            version,
            headers: self.headers,
        })
    }

    pub(crate) fn finish_headers(self) -> HeaderMap {
        debug_assert!(self.is_complete());
        self.headers
    }
}

impl State {
    fn name(&self) -> &'static str {
        match self {
            State::MethodStart => "MethodStart",
            State::Method => "Method",
            State::MethodSp => "MethodSp",
            State::Target => "Target",
            State::TargetSp => "TargetSp",
            State::Version => "Version",
            State::VersionCr => "VersionCr",
            State::HeaderLineStart => "HeaderLineStart",
            State::HeaderName => "HeaderName",
            State::HeaderValueStart => "HeaderValueStart",
            State::HeaderValue => "HeaderValue",
            State::HeaderCr => "HeaderCr",
            State::FinalCr => "FinalCr",
            State::Complete => "Complete",
        }
    }
}

/// Reads one preamble off the stream, pushing over-read bytes back.
///
/// Returns `Ok(None)` when the peer closed before sending anything, which is
/// the clean end of a keep-alive connection.
pub(crate) fn read_preamble<R: Read>(
    rdr: &mut PushbackReader<R>,
    buf: &mut [u8],
    max_bytes: usize,
) -> crate::Result<Option<Preamble>> {
    let mut parser = PreambleParser::new(max_bytes);
    loop {
        let n = rdr.read(buf).map_err(Error::from_io)?;
        if n == 0 {
            if parser.has_started() {
                return Err(Error::new_incomplete());
            }
            return Ok(None);
        }
        if let Some(consumed) = parser.advance(&buf[..n])? {
            rdr.rewind(&buf[consumed..n]);
            return parser.finish().map(Some);
        }
    }
}

fn latin1(bytes: &[u8]) -> String {
    bytes.iter().map(|&b| b as char).collect()
}

/// Decodes one percent-encoded form component. `+` means space; a malformed
/// escape rejects the whole component.
fn decode_component(raw: &[u8], encoding: &'static Encoding) -> Option<String> {
    let mut bytes = Vec::with_capacity(raw.len());
    let mut i = 0;
    while i < raw.len() {
        match raw[i] {
            b'+' => bytes.push(b' '),
            b'%' => {
                let hi = chars::hex_value(*raw.get(i + 1)?)?;
                let lo = chars::hex_value(*raw.get(i + 2)?)?;
                bytes.push(hi << 4 | lo);
                i += 2;
            }
            b => bytes.push(b),
        }
        i += 1;
    }
    let (decoded, _, _) = encoding.decode(&bytes);
    Some(decoded.into_owned())
}

/// Parses `name=value&name=value` pairs into the parameter map. Pairs with
/// malformed escapes are skipped; everything that decodes is kept.
pub(crate) fn parse_form(raw: &[u8], encoding: &'static Encoding, params: &mut Params) {
    for pair in raw.split(|&b| b == b'&') {
        if pair.is_empty() {
            continue;
        }
        let eq = pair.iter().position(|&b| b == b'=');
        let (name, value) = match eq {
            Some(i) => (&pair[..i], &pair[i + 1..]),
            None => (pair, &[][..]),
        };
        let name = match decode_component(name, encoding) {
            Some(name) if !name.is_empty() => name,
            _ => continue,
        };
        let value = match decode_component(value, encoding) {
            Some(value) => value,
            None => continue,
        };
        params.add(name, value);
    }
}
