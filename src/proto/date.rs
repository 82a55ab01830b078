//! HTTP date formatting and parsing.
//!
//! Formatting always produces RFC 1123 (`Sun, 06 Nov 1994 08:49:37 GMT`);
//! parsing additionally tolerates the RFC 850 and asctime legacy shapes,
//! which `httpdate` handles for us.

use std::cell::RefCell;
use std::time::{Duration, SystemTime};

use httpdate::HttpDate;

// "Sun, 06 Nov 1994 08:49:37 GMT".len()
pub(crate) const DATE_VALUE_LENGTH: usize = 29;

/// Formats a timestamp as an RFC 1123 date string.
pub(crate) fn format(time: SystemTime) -> String {
    HttpDate::from(time).to_string()
}

/// Parses any of the three date shapes HTTP allows.
pub(crate) fn parse(value: &str) -> Option<SystemTime> {
    value.parse::<HttpDate>().ok().map(SystemTime::from)
}

/// Appends the current date, cached per thread and re-rendered at most once
/// a second, for the response `Date` header.
pub(crate) fn extend(dst: &mut Vec<u8>) {
    CACHED.with(|cache| {
        let mut cache = cache.borrow_mut();
        cache.check();
        dst.extend_from_slice(cache.buffer());
    })
}

struct CachedDate {
    rendered: String,
    next_update: SystemTime,
}

thread_local!(static CACHED: RefCell<CachedDate> = RefCell::new(CachedDate::new()));

impl CachedDate {
    fn new() -> CachedDate {
        let mut cache = CachedDate {
            rendered: String::new(),
            next_update: SystemTime::UNIX_EPOCH,
        };
        cache.update(SystemTime::now());
        cache
    }

    fn buffer(&self) -> &[u8] {
        self.rendered.as_bytes()
    }

    fn check(&mut self) {
        let now = SystemTime::now();
        if now > self.next_update {
            self.update(now);
        }
    }

    fn update(&mut self, now: SystemTime) {
        self.rendered = format(now);
        debug_assert_eq!(self.rendered.len(), DATE_VALUE_LENGTH);
        self.next_update = now + Duration::from_secs(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn format_rfc1123() {
        let time = SystemTime::UNIX_EPOCH + Duration::from_secs(784111777);
        assert_eq!(format(time), "Sun, 06 Nov 1994 08:49:37 GMT");
    }

    #[test]
    fn parse_all_three_shapes() {
        let expected = SystemTime::UNIX_EPOCH + Duration::from_secs(784111777);
        assert_eq!(parse("Sun, 06 Nov 1994 08:49:37 GMT"), Some(expected));
        assert_eq!(parse("Sunday, 06-Nov-94 08:49:37 GMT"), Some(expected));
        assert_eq!(parse("Sun Nov  6 08:49:37 1994"), Some(expected));
        assert_eq!(parse("six in the morning"), None);
    }

    #[test]
    fn cached_date_has_fixed_length() {
        let mut buf = Vec::new();
        extend(&mut buf);
        assert_eq!(buf.len(), DATE_VALUE_LENGTH);
    }
}
