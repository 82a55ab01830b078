//! `multipart/form-data` parsing and the file-upload policy.
//!
//! Parts are pulled off the body stream one at a time: the caller asks for
//! the next part's headers, then reads that part's bytes until they run out.
//! What happens to the bytes (a parameter value, a staged file, the floor)
//! is decided outside the parser.
//!
//! Delimiter scanning is Knuth-Morris-Pratt over a fixed window. The window
//! always retains one pattern-length of tail bytes between refills so a
//! delimiter can never hide across a read boundary.

use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use encoding_rs::Encoding;

use crate::error::{Error, Section};
use crate::header::{self, HeaderMap};
use crate::proto::parse::PreambleParser;
use crate::request::Params;

const MAX_PART_HEADER_BYTES: usize = 8 * 1024;

/// What to do with a part that carries a `filename`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadPolicy {
    /// Fail the request.
    Reject,
    /// Consume and discard the part's bytes.
    Ignore,
    /// Stage the part into a temporary file.
    Allow,
}

/// A file staged from a multipart upload.
#[derive(Debug, Clone)]
pub struct FileInfo {
    name: String,
    file_name: Option<String>,
    content_type: Option<String>,
    path: PathBuf,
}

impl FileInfo {
    /// The part's `name` parameter.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The filename the client reported, verbatim.
    pub fn file_name(&self) -> Option<&str> {
        self.file_name.as_deref()
    }

    pub fn content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }

    /// Where the bytes were staged.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Creates uniquely named staging files and deletes them when the request is
/// over, if the configuration says staged files do not outlive requests.
pub(crate) struct FileManager {
    temp_dir: PathBuf,
    prefix: String,
    suffix: String,
    delete_on_cleanup: bool,
    staged: Vec<PathBuf>,
}

impl FileManager {
    pub(crate) fn new(
        temp_dir: PathBuf,
        prefix: String,
        suffix: String,
        delete_on_cleanup: bool,
    ) -> FileManager {
        FileManager {
            temp_dir,
            prefix,
            suffix,
            delete_on_cleanup,
            staged: Vec::new(),
        }
    }

    fn stage(&mut self) -> io::Result<(File, PathBuf)> {
        fs::create_dir_all(&self.temp_dir)?;
        let file = tempfile::Builder::new()
            .prefix(self.prefix.as_str())
            .suffix(self.suffix.as_str())
            .tempfile_in(&self.temp_dir)?;
        let (file, path) = file.keep().map_err(|e| e.error)?;
        if self.delete_on_cleanup {
            self.staged.push(path.clone());
        }
        Ok((file, path))
    }

    pub(crate) fn cleanup(&mut self) {
        for path in self.staged.drain(..) {
            if let Err(err) = fs::remove_file(&path) {
                warn!("failed to remove staged file {:?}: {}", path, err);
            }
        }
    }
}

impl Drop for FileManager {
    fn drop(&mut self) {
        self.cleanup();
    }
}

/// Per-request multipart tunables, resolved from the server configuration.
#[derive(Debug, Clone)]
pub(crate) struct Limits {
    pub(crate) policy: UploadPolicy,
    pub(crate) max_file_size: u64,
    pub(crate) max_request_size: u64,
    pub(crate) max_field_size: u64,
    pub(crate) buffer_size: usize,
}

/// Headers and interpreted fields of one part.
#[derive(Debug)]
pub(crate) struct PartHead {
    pub(crate) headers: HeaderMap,
    pub(crate) name: Option<String>,
    pub(crate) file_name: Option<String>,
    pub(crate) content_type: Option<String>,
}

#[derive(Debug, PartialEq, Clone, Copy)]
enum State {
    /// Before the first delimiter; bytes are discarded.
    Preamble,
    /// Inside a part's content.
    PartData,
    /// A delimiter was consumed and another part follows.
    PartBoundary,
    /// The closing `--` delimiter was consumed.
    Finished,
}

pub(crate) struct MultipartParser<R> {
    inner: R,
    /// `\r\n--<boundary>`
    pattern: Vec<u8>,
    lps: Vec<usize>,
    buf: Vec<u8>,
    head: usize,
    tail: usize,
    state: State,
    eof: bool,
}

impl<R: Read> MultipartParser<R> {
    pub(crate) fn new(inner: R, boundary: &str, buffer_size: usize) -> MultipartParser<R> {
        let mut pattern = Vec::with_capacity(boundary.len() + 4);
        pattern.extend_from_slice(b"\r\n--");
        pattern.extend_from_slice(boundary.as_bytes());
        let lps = failure_table(&pattern);
        let capacity = buffer_size.max(2 * pattern.len() + 4);
        MultipartParser {
            inner,
            pattern,
            lps,
            buf: vec![0; capacity],
            head: 0,
            tail: 0,
            state: State::Preamble,
            eof: false,
        }
    }

    /// Advances to the next part and parses its headers. `None` once the
    /// terminator has been seen.
    pub(crate) fn next_part(&mut self) -> crate::Result<Option<PartHead>> {
        match self.state {
            State::Preamble => self.read_first_delimiter()?,
            State::PartBoundary => {}
            State::Finished => return Ok(None),
            State::PartData => {
                // the caller is expected to consume each part fully
                let mut sink = [0u8; 512];
                while self.read_data(&mut sink)? > 0 {}
                if self.state == State::Finished {
                    return Ok(None);
                }
            }
        }
        if self.state == State::Finished {
            return Ok(None);
        }

        let headers = self.read_part_headers()?;
        let disposition = headers.get("content-disposition").unwrap_or("");
        let name = header::param(disposition, "name");
        let file_name = header::param(disposition, "filename");
        let content_type = headers.get("content-type").map(str::to_owned);
        self.state = State::PartData;
        Ok(Some(PartHead {
            headers,
            name,
            file_name,
            content_type,
        }))
    }

    /// Reads content bytes of the current part. `Ok(0)` means the part is
    /// over and the trailing delimiter has been consumed.
    pub(crate) fn read_data(&mut self, out: &mut [u8]) -> crate::Result<usize> {
        if self.state != State::PartData {
            return Ok(0);
        }
        loop {
            if let Some(at) = self.find_pattern() {
                if at > self.head {
                    let n = (at - self.head).min(out.len());
                    out[..n].copy_from_slice(&self.buf[self.head..self.head + n]);
                    self.head += n;
                    return Ok(n);
                }
                // delimiter reached: consume it and the two bytes after
                self.head += self.pattern.len();
                self.read_delimiter_tail()?;
                return Ok(0);
            }

            // no match in the window: everything but a pattern-length tail is
            // safe to hand out
            let keep = self.pattern.len().min(self.tail - self.head);
            let safe = self.tail - self.head - keep;
            if safe > 0 {
                let n = safe.min(out.len());
                out[..n].copy_from_slice(&self.buf[self.head..self.head + n]);
                self.head += n;
                return Ok(n);
            }

            if self.fill()? == 0 {
                return Err(Error::new_incomplete_parse(Section::Multipart, "PartData"));
            }
        }
    }

    /// Discards everything before the first delimiter. The first delimiter
    /// may omit the leading CRLF, so a one-shot check for `--<boundary>` at
    /// the very start of the stream runs before normal scanning.
    fn read_first_delimiter(&mut self) -> crate::Result<()> {
        while self.tail - self.head < self.pattern.len() && !self.eof {
            self.fill()?;
        }
        let short = &self.pattern[2..];
        if self.tail - self.head >= short.len() && &self.buf[self.head..self.head + short.len()] == short {
            self.head += short.len();
            return self.read_delimiter_tail();
        }

        loop {
            if let Some(at) = self.find_pattern() {
                self.head = at + self.pattern.len();
                return self.read_delimiter_tail();
            }
            let keep = self.pattern.len().min(self.tail - self.head);
            self.head = self.tail - keep;
            if self.fill()? == 0 {
                return Err(Error::new_incomplete_parse(Section::Multipart, "Preamble"));
            }
        }
    }

    /// After a delimiter: `\r\n` opens another part, `--` closes the body.
    fn read_delimiter_tail(&mut self) -> crate::Result<()> {
        let a = self.next_byte("DelimiterTail")?;
        let b = self.next_byte("DelimiterTail")?;
        match (a, b) {
            (b'\r', b'\n') => {
                self.state = State::PartBoundary;
                Ok(())
            }
            (b'-', b'-') => {
                trace!("multipart terminator");
                self.state = State::Finished;
                Ok(())
            }
            _ => Err(Error::new_parse(Section::Multipart, b, "DelimiterTail")),
        }
    }

    /// Part headers use the same state machine as the request preamble's
    /// header section.
    fn read_part_headers(&mut self) -> crate::Result<HeaderMap> {
        let mut parser = PreambleParser::headers_only(MAX_PART_HEADER_BYTES);
        loop {
            let b = self.next_byte("PartHeaders")?;
            parser.advance(&[b])?;
            if parser.is_complete() {
                return Ok(parser.finish_headers());
            }
        }
    }

    fn next_byte(&mut self, state: &'static str) -> crate::Result<u8> {
        if self.head == self.tail && self.fill()? == 0 {
            return Err(Error::new_incomplete_parse(Section::Multipart, state));
        }
        let b = self.buf[self.head];
        self.head += 1;
        Ok(b)
    }

    /// Compacts the window and reads more. Returns the bytes added.
    fn fill(&mut self) -> crate::Result<usize> {
        if self.eof {
            return Ok(0);
        }
        if self.head > 0 {
            self.buf.copy_within(self.head..self.tail, 0);
            self.tail -= self.head;
            self.head = 0;
        }
        let n = self
            .inner
            .read(&mut self.buf[self.tail..])
            .map_err(Error::from_io)?;
        if n == 0 {
            self.eof = true;
        }
        self.tail += n;
        Ok(n)
    }

    /// KMP scan for the delimiter pattern over the buffered window.
    fn find_pattern(&self) -> Option<usize> {
        let window = &self.buf[self.head..self.tail];
        let mut j = 0;
        for (i, &c) in window.iter().enumerate() {
            while j > 0 && self.pattern[j] != c {
                j = self.lps[j - 1];
            }
            if self.pattern[j] == c {
                j += 1;
                if j == self.pattern.len() {
                    return Some(self.head + i + 1 - j);
                }
            }
        }
        None
    }
}

fn failure_table(pattern: &[u8]) -> Vec<usize> {
    let mut lps = vec![0; pattern.len()];
    let mut len = 0;
    for i in 1..pattern.len() {
        while len > 0 && pattern[i] != pattern[len] {
            len = lps[len - 1];
        }
        if pattern[i] == pattern[len] {
            len += 1;
            lps[i] = len;
        }
    }
    lps
}

/// Consumes a multipart body, routing each part into the parameter map or a
/// staged file per the upload policy and size limits.
pub(crate) fn process<R: Read>(
    body: R,
    boundary: &str,
    limits: &Limits,
    default_charset: &'static Encoding,
    manager: &mut FileManager,
    params: &mut Params,
    files: &mut Vec<FileInfo>,
) -> crate::Result<()> {
    let mut parser = MultipartParser::new(body, boundary, limits.buffer_size);
    let mut total: u64 = 0;
    let mut chunk = vec![0u8; limits.buffer_size.max(512)];

    while let Some(part) = parser.next_part()? {
        match (part.name, part.file_name) {
            (Some(name), None) => {
                let value = read_field(
                    &mut parser,
                    &mut chunk,
                    limits.max_field_size,
                    &mut total,
                    limits.max_request_size,
                )?;
                // a part that names a charset we cannot decode is a hard
                // failure; only an absent charset falls back to the default
                let charset = match part
                    .content_type
                    .as_deref()
                    .and_then(|ct| header::param(ct, "charset"))
                {
                    Some(label) => Encoding::for_label(label.as_bytes())
                        .ok_or_else(|| Error::new_unsupported_encoding(&label))?,
                    None => default_charset,
                };
                let (decoded, _, _) = charset.decode(&value);
                params.add(name, decoded.into_owned());
            }
            (name, Some(file_name)) => match limits.policy {
                UploadPolicy::Reject => {
                    debug!("rejecting file upload {:?}", file_name);
                    return Err(Error::new_unsupported_media());
                }
                UploadPolicy::Ignore => {
                    debug!("ignoring file upload {:?}", file_name);
                    discard_part(&mut parser, &mut chunk, &mut total, limits.max_request_size)?;
                }
                UploadPolicy::Allow => {
                    let (mut file, path) = manager.stage().map_err(Error::new_io)?;
                    let mut written: u64 = 0;
                    loop {
                        let n = parser.read_data(&mut chunk)?;
                        if n == 0 {
                            break;
                        }
                        written += n as u64;
                        if written > limits.max_file_size {
                            return Err(Error::new_content_too_large(limits.max_file_size));
                        }
                        total += n as u64;
                        if total > limits.max_request_size {
                            return Err(Error::new_content_too_large(limits.max_request_size));
                        }
                        file.write_all(&chunk[..n]).map_err(Error::new_io)?;
                    }
                    file.flush().map_err(Error::new_io)?;
                    debug!("staged {} byte upload at {:?}", written, path);
                    files.push(FileInfo {
                        name: name.unwrap_or_default(),
                        file_name: Some(file_name),
                        content_type: part.content_type,
                        path,
                    });
                }
            },
            (None, None) => {
                // no disposition name at all: consume and move on
                discard_part(&mut parser, &mut chunk, &mut total, limits.max_request_size)?;
            }
        }
    }
    Ok(())
}

fn read_field<R: Read>(
    parser: &mut MultipartParser<R>,
    chunk: &mut [u8],
    max_field: u64,
    total: &mut u64,
    max_request: u64,
) -> crate::Result<Vec<u8>> {
    let mut value = Vec::new();
    loop {
        let n = parser.read_data(chunk)?;
        if n == 0 {
            return Ok(value);
        }
        *total += n as u64;
        if *total > max_request {
            return Err(Error::new_content_too_large(max_request));
        }
        if (value.len() + n) as u64 > max_field {
            return Err(Error::new_content_too_large(max_field));
        }
        value.extend_from_slice(&chunk[..n]);
    }
}

fn discard_part<R: Read>(
    parser: &mut MultipartParser<R>,
    chunk: &mut [u8],
    total: &mut u64,
    max_request: u64,
) -> crate::Result<()> {
    loop {
        let n = parser.read_data(chunk)?;
        if n == 0 {
            return Ok(());
        }
        *total += n as u64;
        if *total > max_request {
            return Err(Error::new_content_too_large(max_request));
        }
    }
}
