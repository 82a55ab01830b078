//! # hearth
//!
//! An embeddable, blocking HTTP/1.1 server library.
//!
//! hearth is a framing and connection-lifecycle engine, not a web framework:
//! you hand it listener addresses and a [`Handler`], and it accepts
//! connections, parses requests, and streams responses, managing keep-alive,
//! timeouts, slow-client enforcement and shutdown. There is no routing, no
//! async runtime, and no HTTP/2; each connection is owned by one thread from
//! a bounded pool doing plain blocking I/O.
//!
//! ```no_run
//! use std::io::Write;
//!
//! use hearth::{Server, Request, Response, HandlerError};
//!
//! fn hello(_req: &mut Request<'_>, res: &mut Response<'_>) -> Result<(), HandlerError> {
//!     res.set_header("Content-Type", "text/plain")?;
//!     res.write_all(b"Hello world")?;
//!     Ok(())
//! }
//!
//! fn main() -> hearth::Result<()> {
//!     let mut server = Server::builder()
//!         .bind("127.0.0.1:8080".parse().unwrap())
//!         .handler(hello)
//!         .spawn()?;
//!     // ... later:
//!     server.shutdown();
//!     Ok(())
//! }
//! ```
//!
//! ## Features at a glance
//!
//! - Chunked transfer decoding and encoding, with pushback so pipelined
//!   requests are never swallowed.
//! - Request body decompression (`gzip`, `deflate`) and opt-in response
//!   compression negotiated from `Accept-Encoding`.
//! - `multipart/form-data` parsing with a configurable file-upload policy
//!   and staged temporary files.
//! - TLS via rustls, with SNI-based certificate selection from in-memory
//!   PEM material.
//! - A throughput meter that disconnects clients transferring below a
//!   configured minimum rate.

#![deny(missing_debug_implementations)]

#[macro_use]
extern crate log;

pub mod error;
pub mod header;
pub mod instrument;

mod net;
mod proto;
mod request;
mod response;
mod server;

pub use crate::error::{Error, Result};
pub use crate::header::{Cookie, HeaderMap, SameSite};
pub use crate::instrument::Instrumenter;
pub use crate::net::tls::{TlsConfig, TlsConfigBuilder};
pub use crate::proto::body::Body;
pub use crate::proto::multipart::{FileInfo, UploadPolicy};
pub use crate::request::{Params, Request};
pub use crate::response::Response;
pub use crate::server::{Builder, Handler, HandlerError, Server};

pub use http::{Method, StatusCode, Version};
