//! Cookie parsing and formatting per RFC 6265.

use std::fmt;
use std::time::SystemTime;

use crate::header::unquote;
use crate::proto::date;

/// The `SameSite` cookie attribute.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SameSite {
    Lax,
    None,
    Strict,
}

impl SameSite {
    fn as_str(&self) -> &'static str {
        match self {
            SameSite::Lax => "Lax",
            SameSite::None => "None",
            SameSite::Strict => "Strict",
        }
    }

    fn parse(value: &str) -> Option<SameSite> {
        if value.eq_ignore_ascii_case("lax") {
            Some(SameSite::Lax)
        } else if value.eq_ignore_ascii_case("none") {
            Some(SameSite::None)
        } else if value.eq_ignore_ascii_case("strict") {
            Some(SameSite::Strict)
        } else {
            None
        }
    }
}

/// An HTTP cookie.
///
/// Known attributes are typed fields; anything else a `Set-Cookie` line
/// carried is retained in a free-form attribute list (flag-only attributes
/// map to an empty string) but is not re-emitted when formatting.
#[derive(Clone, Debug, Default)]
pub struct Cookie {
    name: String,
    value: String,
    domain: Option<String>,
    path: Option<String>,
    expires: Option<SystemTime>,
    max_age: Option<i64>,
    same_site: Option<SameSite>,
    secure: bool,
    http_only: bool,
    attributes: Vec<(String, String)>,
}

impl Cookie {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Cookie {
        Cookie {
            name: name.into(),
            value: value.into(),
            ..Cookie::default()
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    pub fn set_value(&mut self, value: impl Into<String>) {
        self.value = value.into();
    }

    pub fn domain(&self) -> Option<&str> {
        self.domain.as_deref()
    }

    pub fn set_domain(&mut self, domain: impl Into<String>) {
        self.domain = Some(domain.into());
    }

    pub fn path(&self) -> Option<&str> {
        self.path.as_deref()
    }

    pub fn set_path(&mut self, path: impl Into<String>) {
        self.path = Some(path.into());
    }

    pub fn expires(&self) -> Option<SystemTime> {
        self.expires
    }

    pub fn set_expires(&mut self, expires: SystemTime) {
        self.expires = Some(expires);
    }

    pub fn max_age(&self) -> Option<i64> {
        self.max_age
    }

    pub fn set_max_age(&mut self, seconds: i64) {
        self.max_age = Some(seconds);
    }

    pub fn same_site(&self) -> Option<SameSite> {
        self.same_site
    }

    pub fn set_same_site(&mut self, same_site: SameSite) {
        self.same_site = Some(same_site);
    }

    pub fn secure(&self) -> bool {
        self.secure
    }

    pub fn set_secure(&mut self, secure: bool) {
        self.secure = secure;
    }

    pub fn http_only(&self) -> bool {
        self.http_only
    }

    pub fn set_http_only(&mut self, http_only: bool) {
        self.http_only = http_only;
    }

    /// A free-form attribute recorded from a parsed `Set-Cookie` line.
    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn attributes(&self) -> impl Iterator<Item = (&str, &str)> {
        self.attributes.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    /// Parses a request `Cookie` header, which may carry many cookies
    /// separated by `;` or `,`. Malformed pairs are skipped.
    pub fn parse_request_header(value: &str) -> Vec<Cookie> {
        let mut cookies = Vec::new();
        for piece in value.split(|c| c == ';' || c == ',') {
            let piece = piece.trim();
            if piece.is_empty() {
                continue;
            }
            let mut split = piece.splitn(2, '=');
            let name = split.next().unwrap_or("").trim();
            if name.is_empty() {
                continue;
            }
            let value = split.next().map(str::trim).unwrap_or("");
            cookies.push(Cookie::new(name, unquote(value)));
        }
        cookies
    }

    /// Parses one `Set-Cookie` header line.
    pub fn parse_set_cookie(value: &str) -> Option<Cookie> {
        let mut pieces = value.split(';');
        let first = pieces.next()?.trim();
        let mut split = first.splitn(2, '=');
        let name = split.next()?.trim();
        if name.is_empty() {
            return None;
        }
        let raw_value = split.next().map(str::trim).unwrap_or("");
        let mut cookie = Cookie::new(name, unquote(raw_value));

        for piece in pieces {
            let piece = piece.trim();
            if piece.is_empty() {
                continue;
            }
            let mut split = piece.splitn(2, '=');
            let attr = split.next().unwrap_or("").trim();
            let attr_value = split.next().map(str::trim).map(unquote);
            cookie.add_attribute(attr, attr_value);
        }
        Some(cookie)
    }

    fn add_attribute(&mut self, name: &str, value: Option<&str>) {
        if name.eq_ignore_ascii_case("domain") {
            self.domain = value.map(str::to_owned);
        } else if name.eq_ignore_ascii_case("path") {
            self.path = value.map(str::to_owned);
        } else if name.eq_ignore_ascii_case("expires") {
            self.expires = value.and_then(date::parse);
        } else if name.eq_ignore_ascii_case("max-age") {
            self.max_age = value.and_then(|v| v.parse().ok());
        } else if name.eq_ignore_ascii_case("samesite") {
            self.same_site = value.and_then(SameSite::parse);
        } else if name.eq_ignore_ascii_case("secure") {
            self.secure = true;
        } else if name.eq_ignore_ascii_case("httponly") {
            self.http_only = true;
        } else {
            self.attributes
                .push((name.to_owned(), value.unwrap_or("").to_owned()));
        }
    }

    /// Formats as a `Set-Cookie` header value. Known attributes come out in a
    /// fixed order: Domain, Expires, HttpOnly, Max-Age, Path, SameSite,
    /// Secure.
    pub fn to_header_value(&self) -> String {
        let mut out = String::with_capacity(self.name.len() + self.value.len() + 16);
        out.push_str(&self.name);
        out.push('=');
        out.push_str(&self.value);
        if let Some(ref domain) = self.domain {
            out.push_str("; Domain=");
            out.push_str(domain);
        }
        if let Some(expires) = self.expires {
            out.push_str("; Expires=");
            out.push_str(&date::format(expires));
        }
        if self.http_only {
            out.push_str("; HttpOnly");
        }
        if let Some(max_age) = self.max_age {
            out.push_str("; Max-Age=");
            let mut buf = itoa::Buffer::new();
            out.push_str(buf.format(max_age));
        }
        if let Some(ref path) = self.path {
            out.push_str("; Path=");
            out.push_str(path);
        }
        if let Some(same_site) = self.same_site {
            out.push_str("; SameSite=");
            out.push_str(same_site.as_str());
        }
        if self.secure {
            out.push_str("; Secure");
        }
        out
    }
}

impl fmt::Display for Cookie {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_header_value())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn parse_request_cookies() {
        let cookies = Cookie::parse_request_header("a=1; b=2, c = 3 ;d=\"q\"");
        let pairs: Vec<_> = cookies
            .iter()
            .map(|c| (c.name(), c.value()))
            .collect();
        assert_eq!(pairs, vec![("a", "1"), ("b", "2"), ("c", "3"), ("d", "q")]);
    }

    #[test]
    fn parse_request_skips_malformed() {
        let cookies = Cookie::parse_request_header("; =x; ok=1");
        assert_eq!(cookies.len(), 2);
        assert_eq!(cookies[1].name(), "ok");
    }

    #[test]
    fn parse_set_cookie_known_attributes() {
        let cookie = Cookie::parse_set_cookie(
            "sid=abc123; Domain=example.com; Path=/app; Max-Age=3600; \
             Expires=Sun, 06 Nov 1994 08:49:37 GMT; Secure; HttpOnly; SameSite=Strict",
        )
        .unwrap();
        assert_eq!(cookie.name(), "sid");
        assert_eq!(cookie.value(), "abc123");
        assert_eq!(cookie.domain(), Some("example.com"));
        assert_eq!(cookie.path(), Some("/app"));
        assert_eq!(cookie.max_age(), Some(3600));
        assert_eq!(
            cookie.expires(),
            Some(SystemTime::UNIX_EPOCH + Duration::from_secs(784111777))
        );
        assert!(cookie.secure());
        assert!(cookie.http_only());
        assert_eq!(cookie.same_site(), Some(SameSite::Strict));
        // secure sets the flag only, it is not doubled into the attribute list
        assert_eq!(cookie.attribute("secure"), None);
    }

    #[test]
    fn parse_set_cookie_unknown_attributes() {
        let cookie = Cookie::parse_set_cookie("n=v; Partitioned; Priority=High").unwrap();
        assert_eq!(cookie.attribute("partitioned"), Some(""));
        assert_eq!(cookie.attribute("priority"), Some("High"));
    }

    #[test]
    fn format_attribute_order_is_fixed() {
        let mut cookie = Cookie::new("sid", "abc");
        cookie.set_secure(true);
        cookie.set_path("/");
        cookie.set_same_site(SameSite::Lax);
        cookie.set_max_age(60);
        cookie.set_http_only(true);
        cookie.set_domain("example.com");
        assert_eq!(
            cookie.to_header_value(),
            "sid=abc; Domain=example.com; HttpOnly; Max-Age=60; Path=/; SameSite=Lax; Secure"
        );
    }

    #[test]
    fn set_cookie_round_trip() {
        let mut cookie = Cookie::new("token", "xyz");
        cookie.set_expires(SystemTime::UNIX_EPOCH + Duration::from_secs(784111777));
        cookie.set_path("/p");
        let parsed = Cookie::parse_set_cookie(&cookie.to_header_value()).unwrap();
        assert_eq!(parsed.value(), "xyz");
        assert_eq!(parsed.expires(), cookie.expires());
        assert_eq!(parsed.path(), Some("/p"));
    }
}
