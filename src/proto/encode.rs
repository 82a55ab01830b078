//! Response preamble serialization.

use bytes::{BufMut, BytesMut};
use http::StatusCode;

use crate::header::{Cookie, HeaderMap};

/// Renders the status line, headers, `Set-Cookie` lines and the blank line
/// into `dst`. The caller writes the buffer to the socket in one shot so the
/// preamble never interleaves with body bytes.
pub(crate) fn write_preamble(
    dst: &mut BytesMut,
    status: StatusCode,
    reason: Option<&str>,
    headers: &HeaderMap,
    cookies: &[Cookie],
) {
    let mut itoa_buf = itoa::Buffer::new();

    dst.extend_from_slice(b"HTTP/1.1 ");
    dst.extend_from_slice(itoa_buf.format(status.as_u16()).as_bytes());
    dst.put_u8(b' ');
    let reason = reason.or_else(|| status.canonical_reason()).unwrap_or("");
    dst.extend_from_slice(reason.as_bytes());
    dst.extend_from_slice(b"\r\n");

    for (name, value) in headers.iter() {
        dst.extend_from_slice(name.as_bytes());
        dst.extend_from_slice(b": ");
        extend_latin1(dst, value);
        dst.extend_from_slice(b"\r\n");
    }

    for cookie in cookies {
        dst.extend_from_slice(b"Set-Cookie: ");
        extend_latin1(dst, &cookie.to_header_value());
        dst.extend_from_slice(b"\r\n");
    }

    dst.extend_from_slice(b"\r\n");
}

// Header values round-trip as ISO-8859-1: one char per byte.
fn extend_latin1(dst: &mut BytesMut, value: &str) {
    for c in value.chars() {
        dst.put_u8(if (c as u32) < 0x100 { c as u8 } else { b'?' });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_line_and_headers() {
        let mut headers = HeaderMap::new();
        headers.set("Content-Length", "11");
        headers.set("Content-Type", "text/plain");

        let mut out = BytesMut::new();
        write_preamble(&mut out, StatusCode::OK, None, &headers, &[]);
        assert_eq!(
            &out[..],
            &b"HTTP/1.1 200 OK\r\nContent-Length: 11\r\nContent-Type: text/plain\r\n\r\n"[..]
        );
    }

    #[test]
    fn custom_reason_wins() {
        let mut out = BytesMut::new();
        write_preamble(&mut out, StatusCode::OK, Some("Fine"), &HeaderMap::new(), &[]);
        assert!(out.starts_with(b"HTTP/1.1 200 Fine\r\n"));
    }

    #[test]
    fn multi_valued_headers_get_one_line_each() {
        let mut headers = HeaderMap::new();
        headers.add("Vary", "Accept-Encoding");
        headers.add("Vary", "Origin");
        let mut out = BytesMut::new();
        write_preamble(&mut out, StatusCode::OK, None, &headers, &[]);
        let text = String::from_utf8(out.to_vec()).unwrap();
        assert_eq!(text.matches("Vary: ").count(), 2);
    }

    #[test]
    fn cookies_become_set_cookie_lines() {
        let mut cookie = Cookie::new("sid", "1");
        cookie.set_path("/");
        let other = Cookie::new("theme", "dark");
        let mut out = BytesMut::new();
        write_preamble(&mut out, StatusCode::OK, None, &HeaderMap::new(), &[cookie, other]);
        let text = String::from_utf8(out.to_vec()).unwrap();
        assert!(text.contains("Set-Cookie: sid=1; Path=/\r\n"));
        assert!(text.contains("Set-Cookie: theme=dark\r\n"));
    }

    #[test]
    fn parse_then_write_round_trips() {
        // a response-flavored restatement of what the request parser
        // guarantees: names keep their case, values their inner whitespace
        let mut headers = HeaderMap::new();
        headers.add("X-Odd-CASING", "a  b");
        let mut out = BytesMut::new();
        write_preamble(&mut out, StatusCode::NOT_FOUND, None, &headers, &[]);
        assert_eq!(
            &out[..],
            &b"HTTP/1.1 404 Not Found\r\nX-Odd-CASING: a  b\r\n\r\n"[..]
        );
    }
}
