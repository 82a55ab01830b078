//! Headers container and header-value helpers.

pub(crate) mod cookie;

pub use self::cookie::{Cookie, SameSite};

use std::fmt;
use std::slice;

use unicase::UniCase;

/// An ordered multimap of header names to values.
///
/// Lookup is case-insensitive; iteration yields names in their original
/// case, in the order each name was first seen. Values for one name keep
/// insertion order.
#[derive(Clone, Default)]
pub struct HeaderMap {
    entries: Vec<Entry>,
}

#[derive(Clone, Debug)]
struct Entry {
    name: HeaderName,
    values: Vec<String>,
}

/// A header name that remembers how it was spelled but compares
/// case-insensitively.
#[derive(Clone, Debug)]
struct HeaderName(UniCase<String>);

impl HeaderName {
    fn new(name: String) -> HeaderName {
        HeaderName(UniCase::new(name))
    }
}

impl AsRef<str> for HeaderName {
    fn as_ref(&self) -> &str {
        self.0.as_ref()
    }
}

impl PartialEq<str> for HeaderName {
    fn eq(&self, other: &str) -> bool {
        self.0 == UniCase::new(other)
    }
}

impl HeaderMap {
    pub fn new() -> HeaderMap {
        HeaderMap::default()
    }

    /// Number of distinct header names.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entry(name).is_some()
    }

    /// First value recorded for `name`.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entry(name)
            .and_then(|e| e.values.first())
            .map(String::as_str)
    }

    /// All values recorded for `name`, in insertion order.
    pub fn get_all(&self, name: &str) -> &[String] {
        self.entry(name).map(|e| &e.values[..]).unwrap_or(&[])
    }

    /// Replaces all values of `name` with one value.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        match self.entry_mut(&name) {
            Some(entry) => {
                entry.values.clear();
                entry.values.push(value);
            }
            None => self.entries.push(Entry {
                name: HeaderName::new(name),
                values: vec![value],
            }),
        }
    }

    /// Appends a value, keeping the name's first-seen spelling.
    pub fn add(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        match self.entry_mut(&name) {
            Some(entry) => entry.values.push(value),
            None => self.entries.push(Entry {
                name: HeaderName::new(name),
                values: vec![value],
            }),
        }
    }

    /// Removes every value of `name`. Returns whether anything was removed.
    pub fn remove(&mut self, name: &str) -> bool {
        let before = self.entries.len();
        self.entries.retain(|e| e.name != *name);
        self.entries.len() != before
    }

    /// Iterates `(name, value)` pairs, names in first-seen order and original
    /// case, multi-valued names repeated once per value.
    pub fn iter(&self) -> Iter<'_> {
        Iter {
            entries: self.entries.iter(),
            current: None,
        }
    }

    /// Header names in first-seen order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|e| e.name.as_ref())
    }

    /// Splits every value of `name` on commas into trimmed, lowercased
    /// tokens. The shape `Accept-Encoding`, `Content-Encoding`,
    /// `Transfer-Encoding` and `Connection` all share.
    pub(crate) fn token_list(&self, name: &str) -> Vec<String> {
        let mut tokens = Vec::new();
        for value in self.get_all(name) {
            for token in value.split(',') {
                let token = token.trim();
                if !token.is_empty() {
                    tokens.push(token.to_ascii_lowercase());
                }
            }
        }
        tokens
    }

    pub(crate) fn contains_token(&self, name: &str, token: &str) -> bool {
        self.token_list(name).iter().any(|t| t == token)
    }

    fn entry(&self, name: &str) -> Option<&Entry> {
        self.entries.iter().find(|e| e.name == *name)
    }

    fn entry_mut(&mut self, name: &str) -> Option<&mut Entry> {
        self.entries.iter_mut().find(|e| e.name == *name)
    }
}

#[derive(Debug)]
pub struct Iter<'a> {
    entries: slice::Iter<'a, Entry>,
    current: Option<(&'a str, slice::Iter<'a, String>)>,
}

impl<'a> Iterator for Iter<'a> {
    type Item = (&'a str, &'a str);

    fn next(&mut self) -> Option<(&'a str, &'a str)> {
        loop {
            if let Some((name, ref mut values)) = self.current {
                if let Some(value) = values.next() {
                    return Some((name, value));
                }
            }
            let entry = self.entries.next()?;
            self.current = Some((entry.name.as_ref(), entry.values.iter()));
        }
    }
}

impl fmt::Debug for HeaderMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.entries.iter().map(|e| (e.name.as_ref(), &e.values)))
            .finish()
    }
}

/// The media type of a `Content-Type`-shaped value: the part before any `;`,
/// trimmed and lowercased.
pub(crate) fn media_type(value: &str) -> String {
    value
        .split(';')
        .next()
        .unwrap_or("")
        .trim()
        .to_ascii_lowercase()
}

/// Extracts a `;`-separated parameter from a `Content-Type`- or
/// `Content-Disposition`-shaped value, unquoting `"..."` per RFC 6265/7578.
pub(crate) fn param<'a>(value: &'a str, name: &str) -> Option<String> {
    for piece in value.split(';').skip(1) {
        let mut split = piece.splitn(2, '=');
        let key = split.next()?.trim();
        if UniCase::new(key) != UniCase::new(name) {
            continue;
        }
        let raw = split.next().unwrap_or("").trim();
        return Some(unquote(raw).to_owned());
    }
    None
}

pub(crate) fn unquote(raw: &str) -> &str {
    if raw.len() >= 2 && raw.starts_with('"') && raw.ends_with('"') {
        &raw[1..raw.len() - 1]
    } else {
        raw
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_is_case_insensitive() {
        let mut headers = HeaderMap::new();
        headers.add("Content-Type", "text/plain");
        assert_eq!(headers.get("content-type"), Some("text/plain"));
        assert_eq!(headers.get("CONTENT-TYPE"), Some("text/plain"));
        assert!(headers.contains("cOnTeNt-TyPe"));
        assert_eq!(headers.get("content-length"), None);
    }

    #[test]
    fn iteration_keeps_original_case_and_order() {
        let mut headers = HeaderMap::new();
        headers.add("Host", "example.com");
        headers.add("X-Custom", "1");
        headers.add("x-custom", "2");
        headers.add("Accept", "*/*");

        let pairs: Vec<_> = headers.iter().collect();
        assert_eq!(
            pairs,
            vec![
                ("Host", "example.com"),
                ("X-Custom", "1"),
                ("X-Custom", "2"),
                ("Accept", "*/*"),
            ]
        );
    }

    #[test]
    fn set_replaces_add_appends() {
        let mut headers = HeaderMap::new();
        headers.add("Accept", "text/html");
        headers.add("Accept", "text/plain");
        assert_eq!(headers.get_all("accept").len(), 2);
        headers.set("accept", "*/*");
        assert_eq!(headers.get_all("Accept"), &["*/*".to_owned()]);
    }

    #[test]
    fn remove() {
        let mut headers = HeaderMap::new();
        headers.add("X-A", "1");
        assert!(headers.remove("x-a"));
        assert!(!headers.remove("x-a"));
        assert!(headers.is_empty());
    }

    #[test]
    fn token_lists_split_and_fold() {
        let mut headers = HeaderMap::new();
        headers.add("Accept-Encoding", "GZip, deflate");
        headers.add("accept-encoding", "br");
        assert_eq!(
            headers.token_list("Accept-Encoding"),
            vec!["gzip", "deflate", "br"]
        );
        assert!(headers.contains_token("accept-encoding", "gzip"));
        assert!(!headers.contains_token("accept-encoding", "zstd"));
    }

    #[test]
    fn media_type_and_params() {
        let value = "multipart/form-data; boundary=\"----xyz\"; charset=UTF-8";
        assert_eq!(media_type(value), "multipart/form-data");
        assert_eq!(param(value, "boundary").as_deref(), Some("----xyz"));
        assert_eq!(param(value, "charset").as_deref(), Some("UTF-8"));
        assert_eq!(param(value, "missing"), None);
        assert_eq!(media_type("TEXT/Plain"), "text/plain");
    }
}
