//! Server requests.
//!
//! A `Request` bundles the parsed preamble, the derived parameter and cookie
//! collections, any staged uploads, and the body stream, and is handed to
//! the `Handler` together with a `Response`.

use std::net::SocketAddr;

use http::{Method, Version};

use crate::header::{Cookie, HeaderMap};
use crate::proto::body::Body;
use crate::proto::multipart::FileInfo;

/// An ordered map of parameter names to value lists.
///
/// Query-string, form-body and multipart fields all merge here; duplicates
/// keep insertion order.
#[derive(Debug, Default, Clone)]
pub struct Params {
    entries: Vec<(String, Vec<String>)>,
}

impl Params {
    pub fn new() -> Params {
        Params::default()
    }

    /// First value recorded for `name`.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(n, _)| n == name)
            .and_then(|(_, values)| values.first())
            .map(String::as_str)
    }

    pub fn get_all(&self, name: &str) -> &[String] {
        self.entries
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, values)| &values[..])
            .unwrap_or(&[])
    }

    pub fn add(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(n, _)| *n == name) {
            Some((_, values)) => values.push(value),
            None => self.entries.push((name, vec![value])),
        }
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(n, _)| n.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// An incoming request, as given to a `Handler`.
pub struct Request<'a> {
    method: Method,
    path: String,
    query: Option<String>,
    version: Version,
    headers: HeaderMap,
    params: Params,
    cookies: Vec<Cookie>,
    files: Vec<FileInfo>,
    remote_addr: Option<SocketAddr>,
    local_addr: Option<SocketAddr>,
    encrypted: bool,
    body: Body<'a>,
}

impl<'a> Request<'a> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        method: Method,
        path: String,
        query: Option<String>,
        version: Version,
        headers: HeaderMap,
        params: Params,
        remote_addr: Option<SocketAddr>,
        local_addr: Option<SocketAddr>,
        encrypted: bool,
        body: Body<'a>,
    ) -> Request<'a> {
        let cookies = headers
            .get_all("cookie")
            .iter()
            .flat_map(|value| Cookie::parse_request_header(value))
            .collect();
        Request {
            method,
            path,
            query,
            version,
            headers,
            params,
            cookies,
            files: Vec::new(),
            remote_addr,
            local_addr,
            encrypted,
            body,
        }
    }

    /// The request method, e.g. `GET`.
    pub fn method(&self) -> &Method {
        &self.method
    }

    /// The decoded request path, without the query string.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// The raw query string, if the target had one.
    pub fn query(&self) -> Option<&str> {
        self.query.as_deref()
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Query, form and multipart parameters merged together.
    pub fn params(&self) -> &Params {
        &self.params
    }

    pub(crate) fn params_mut(&mut self) -> &mut Params {
        &mut self.params
    }

    /// All request cookies, in header order.
    pub fn cookies(&self) -> &[Cookie] {
        &self.cookies
    }

    /// The named cookie. When a client repeats a name, the last one wins.
    pub fn cookie(&self, name: &str) -> Option<&Cookie> {
        self.cookies.iter().rev().find(|c| c.name() == name)
    }

    /// Files staged from a multipart body.
    pub fn files(&self) -> &[FileInfo] {
        &self.files
    }

    pub(crate) fn files_mut(&mut self) -> &mut Vec<FileInfo> {
        &mut self.files
    }

    /// The client address, honoring `X-Forwarded-For` (first entry) when a
    /// proxy added one.
    pub fn ip_address(&self) -> Option<String> {
        if let Some(forwarded) = self.headers.get("x-forwarded-for") {
            if let Some(first) = forwarded.split(',').next() {
                let first = first.trim();
                if !first.is_empty() {
                    return Some(first.to_owned());
                }
            }
        }
        self.remote_addr.map(|addr| addr.ip().to_string())
    }

    /// The socket address of the peer, before any proxy headers.
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    /// The host the client asked for: `X-Forwarded-Host`, else the `Host`
    /// header without its port.
    pub fn host(&self) -> Option<String> {
        if let Some(host) = self.headers.get("x-forwarded-host") {
            return Some(host.trim().to_owned());
        }
        self.headers
            .get("host")
            .map(|h| h.split(':').next().unwrap_or(h).trim().to_owned())
    }

    /// The port the client connected to: `X-Forwarded-Port`, else the `Host`
    /// header's port, else the local socket's.
    pub fn port(&self) -> Option<u16> {
        if let Some(port) = self.headers.get("x-forwarded-port") {
            return port.trim().parse().ok();
        }
        if let Some(host) = self.headers.get("host") {
            let mut pieces = host.splitn(2, ':');
            pieces.next();
            if let Some(port) = pieces.next() {
                return port.trim().parse().ok();
            }
        }
        self.local_addr.map(|addr| addr.port())
    }

    /// `https` or `http`, with `X-Forwarded-Proto` taking precedence.
    pub fn scheme(&self) -> String {
        if let Some(proto) = self.headers.get("x-forwarded-proto") {
            return proto.trim().to_ascii_lowercase();
        }
        if self.encrypted {
            "https".to_owned()
        } else {
            "http".to_owned()
        }
    }

    /// The full `Content-Type` header value.
    pub fn content_type(&self) -> Option<&str> {
        self.headers.get("content-type")
    }

    /// The `charset` parameter of the `Content-Type`, if declared.
    pub fn character_encoding(&self) -> Option<String> {
        self.content_type()
            .and_then(|ct| crate::header::param(ct, "charset"))
    }

    pub fn content_length(&self) -> Option<u64> {
        self.headers
            .get("content-length")
            .and_then(|v| v.trim().parse().ok())
    }

    /// Whether the body arrived with `Transfer-Encoding: chunked`.
    pub fn is_chunked(&self) -> bool {
        self.headers.contains_token("transfer-encoding", "chunked")
    }

    pub fn is_multipart(&self) -> bool {
        self.content_type()
            .map(|ct| crate::header::media_type(ct).starts_with("multipart/"))
            .unwrap_or(false)
    }

    /// The multipart boundary, unquoted, when the request is multipart.
    pub fn multipart_boundary(&self) -> Option<String> {
        if !self.is_multipart() {
            return None;
        }
        self.content_type()
            .and_then(|ct| crate::header::param(ct, "boundary"))
            .filter(|b| !b.is_empty())
    }

    /// `Accept-Encoding` tokens in header order, lowercased, quality weights
    /// stripped.
    pub fn accept_encodings(&self) -> Vec<String> {
        self.headers
            .token_list("accept-encoding")
            .into_iter()
            .map(|t| t.split(';').next().unwrap_or("").trim().to_owned())
            .filter(|t| !t.is_empty())
            .collect()
    }

    /// `Content-Encoding` tokens in header order.
    pub fn content_encodings(&self) -> Vec<String> {
        self.headers.token_list("content-encoding")
    }

    /// `Accept-Language` tags ordered by quality, ties keeping header order,
    /// entries that do not parse skipped.
    pub fn locales(&self) -> Vec<String> {
        let mut weighted: Vec<(f32, String)> = Vec::new();
        for value in self.headers.get_all("accept-language") {
            for piece in value.split(',') {
                let mut parts = piece.split(';');
                let tag = parts.next().unwrap_or("").trim();
                if tag.is_empty() || tag == "*" {
                    continue;
                }
                let mut q = 1.0f32;
                let mut bad = false;
                for param in parts {
                    let param = param.trim();
                    if let Some(raw) = param.strip_prefix("q=") {
                        match raw.trim().parse::<f32>() {
                            Ok(v) if (0.0..=1.0).contains(&v) => q = v,
                            _ => bad = true,
                        }
                    }
                }
                if !bad {
                    weighted.push((q, tag.to_owned()));
                }
            }
        }
        weighted.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        weighted.into_iter().map(|(_, tag)| tag).collect()
    }

    /// The request body stream.
    pub fn body(&mut self) -> &mut Body<'a> {
        &mut self.body
    }

    pub(crate) fn body_mut(&mut self) -> &mut Body<'a> {
        &mut self.body
    }
}

impl std::fmt::Debug for Request<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Request")
            .field("method", &self.method)
            .field("path", &self.path)
            .field("version", &self.version)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(headers: HeaderMap) -> Request<'static> {
        Request::new(
            Method::GET,
            "/".to_owned(),
            None,
            Version::HTTP_11,
            headers,
            Params::new(),
            Some("10.1.2.3:4321".parse().unwrap()),
            Some("127.0.0.1:8080".parse().unwrap()),
            false,
            Body::empty(),
        )
    }

    #[test]
    fn params_keep_order_and_duplicates() {
        let mut params = Params::new();
        params.add("a", "1");
        params.add("b", "2");
        params.add("a", "3");
        assert_eq!(params.get("a"), Some("1"));
        assert_eq!(params.get_all("a"), &["1", "3"]);
        let names: Vec<_> = params.names().collect();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[test]
    fn forwarded_headers_win() {
        let mut headers = HeaderMap::new();
        headers.add("Host", "internal:8080");
        headers.add("X-Forwarded-For", "203.0.113.9, 10.0.0.1");
        headers.add("X-Forwarded-Host", "example.com");
        headers.add("X-Forwarded-Proto", "HTTPS");
        headers.add("X-Forwarded-Port", "443");
        let req = request(headers);
        assert_eq!(req.ip_address().as_deref(), Some("203.0.113.9"));
        assert_eq!(req.host().as_deref(), Some("example.com"));
        assert_eq!(req.scheme(), "https");
        assert_eq!(req.port(), Some(443));
    }

    #[test]
    fn direct_connection_fallbacks() {
        let mut headers = HeaderMap::new();
        headers.add("Host", "example.com:8443");
        let req = request(headers);
        assert_eq!(req.ip_address().as_deref(), Some("10.1.2.3"));
        assert_eq!(req.host().as_deref(), Some("example.com"));
        assert_eq!(req.port(), Some(8443));
        assert_eq!(req.scheme(), "http");
    }

    #[test]
    fn port_falls_back_to_local_addr() {
        let mut headers = HeaderMap::new();
        headers.add("Host", "example.com");
        let req = request(headers);
        assert_eq!(req.port(), Some(8080));
    }

    #[test]
    fn cookie_last_wins() {
        let mut headers = HeaderMap::new();
        headers.add("Cookie", "a=1; a=2; b=3");
        let req = request(headers);
        assert_eq!(req.cookie("a").unwrap().value(), "2");
        assert_eq!(req.cookies().len(), 3);
    }

    #[test]
    fn content_type_helpers() {
        let mut headers = HeaderMap::new();
        headers.add(
            "Content-Type",
            "multipart/form-data; boundary=\"xyz\"; charset=utf-8",
        );
        headers.add("Transfer-Encoding", "chunked");
        let req = request(headers);
        assert!(req.is_multipart());
        assert!(req.is_chunked());
        assert_eq!(req.multipart_boundary().as_deref(), Some("xyz"));
        assert_eq!(req.character_encoding().as_deref(), Some("utf-8"));
    }

    #[test]
    fn locales_ordered_by_quality() {
        let mut headers = HeaderMap::new();
        headers.add("Accept-Language", "fr-CH, fr;q=0.9, en;q=0.8, de;q=bad, *;q=0.5");
        let req = request(headers);
        assert_eq!(req.locales(), vec!["fr-CH", "fr", "en"]);
    }

    #[test]
    fn accept_encodings_strip_weights() {
        let mut headers = HeaderMap::new();
        headers.add("Accept-Encoding", "gzip;q=1.0, deflate;q=0.5");
        let req = request(headers);
        assert_eq!(req.accept_encodings(), vec!["gzip", "deflate"]);
    }
}
