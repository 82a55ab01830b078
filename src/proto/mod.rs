//! Wire-level pieces of the HTTP/1.1 implementation.

pub(crate) mod body;
pub(crate) mod chars;
pub(crate) mod chunked;
pub(crate) mod date;
pub(crate) mod encode;
pub(crate) mod multipart;
pub(crate) mod parse;
