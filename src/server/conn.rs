//! The per-connection worker.
//!
//! One worker thread owns one accepted socket and loops: read a preamble,
//! validate framing, build the request and response, run the handler, flush
//! the response, drain the leftover body, then either wait for the next
//! request or close. All I/O is blocking, bounded by socket timeouts and the
//! throughput meter.

use std::io::{Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use http::{Method, StatusCode, Version};

use crate::error::{Error, Kind, Phase};
use crate::header::HeaderMap;
use crate::net::pushback::PushbackReader;
use crate::net::tls::TlsStream;
use crate::net::{MeteredReader, MeteredWriter, RateLimits, Stream};
use crate::proto::body::{Body, BodyFraming};
use crate::proto::multipart::{self, FileManager};
use crate::proto::{encode, parse};
use crate::request::{Params, Request};
use crate::response::{Framing, Response};
use crate::server::Shared;

/// An accepted socket waiting for a worker.
pub(crate) struct Job {
    pub(crate) sock: TcpStream,
    pub(crate) tls: Option<Arc<rustls::ServerConfig>>,
}

type ConnReader = PushbackReader<MeteredReader>;

/// Runs a connection to completion.
pub(crate) fn serve(job: Job, shared: &Arc<Shared>) {
    shared.instrumenter.accepted_connection();
    let remote_addr = job.sock.peer_addr().ok();
    let local_addr = job.sock.local_addr().ok();
    debug!("connection from {:?}", remote_addr);

    if let Err(err) = serve_inner(job, shared, remote_addr, local_addr) {
        debug!("connection from {:?} ended: {}", remote_addr, err);
    }
    shared.instrumenter.connection_closed();
}

fn serve_inner(
    job: Job,
    shared: &Arc<Shared>,
    remote_addr: Option<SocketAddr>,
    local_addr: Option<SocketAddr>,
) -> crate::Result<()> {
    let config = &shared.config;
    let ctrl = job.sock.try_clone().map_err(Error::new_io)?;
    let _registration = shared.register(ctrl.try_clone().map_err(Error::new_io)?);

    let encrypted = job.tls.is_some();
    let stream = match job.tls {
        Some(tls_config) => {
            // bound the handshake like the first read
            set_timeouts(&ctrl, config.initial_read_timeout, config.keep_alive_timeout);
            match TlsStream::accept(tls_config, job.sock) {
                Ok(stream) => Stream::Tls(stream),
                Err(err) => {
                    warn!("TLS handshake with {:?} failed: {}", remote_addr, err);
                    let _ = ctrl.shutdown(Shutdown::Both);
                    return Err(err);
                }
            }
        }
        None => Stream::Plain(job.sock),
    };

    let (read_half, write_half) = stream.split().map_err(Error::new_io)?;
    let meter = Arc::new(super::meter::Meter::new());
    let limits = RateLimits {
        min_read_throughput: config.min_read_throughput,
        min_write_throughput: config.min_write_throughput,
        read_warmup: config.read_throughput_warmup,
        write_warmup: config.write_throughput_warmup,
    };
    let mut reader = PushbackReader::new(MeteredReader::new(
        read_half,
        meter.clone(),
        shared.instrumenter.clone(),
        limits,
    ));
    let mut writer = MeteredWriter::new(
        write_half,
        meter.clone(),
        shared.instrumenter.clone(),
        limits,
    );
    let mut buf = vec![0u8; config.request_buffer_size];
    let mut served: u64 = 0;

    loop {
        if shared.is_shutdown() {
            break;
        }
        let await_timeout = if served == 0 {
            config.initial_read_timeout
        } else {
            config.keep_alive_timeout
        };
        set_timeouts(&ctrl, await_timeout, config.keep_alive_timeout);
        meter.reset();

        let preamble = match parse::read_preamble(&mut reader, &mut buf, config.max_preamble_bytes)
        {
            Ok(None) => break,
            Ok(Some(preamble)) => preamble,
            Err(err) => {
                let phase = if served == 0 {
                    Phase::InitialRead
                } else {
                    Phase::KeepAlive
                };
                handle_failure(err, &mut reader, &mut writer, &ctrl, shared, phase);
                break;
            }
        };

        shared.instrumenter.started_request();
        served += 1;

        let keep_alive =
            match handle_request(preamble, &mut reader, &mut writer, shared, remote_addr, local_addr, encrypted)
            {
                Ok(keep_alive) => keep_alive,
                Err(err) => {
                    handle_failure(err, &mut reader, &mut writer, &ctrl, shared, Phase::RequestBody);
                    false
                }
            };

        if !keep_alive {
            break;
        }
        if let Some(budget) = config.max_keep_alive_requests {
            if served >= budget {
                debug!("keep-alive budget of {} requests spent", budget);
                break;
            }
        }
    }

    writer.close();
    let _ = ctrl.shutdown(Shutdown::Both);
    debug!(
        "connection from {:?} done: {} requests, {} bytes in, {} bytes out",
        remote_addr,
        served,
        meter.bytes_read(),
        meter.bytes_written()
    );
    Ok(())
}

/// One request/response exchange. Returns whether the connection can be
/// reused.
#[allow(clippy::too_many_arguments)]
fn handle_request(
    preamble: parse::Preamble,
    reader: &mut ConnReader,
    writer: &mut MeteredWriter,
    shared: &Arc<Shared>,
    remote_addr: Option<SocketAddr>,
    local_addr: Option<SocketAddr>,
    encrypted: bool,
) -> crate::Result<bool> {
    let config = &shared.config;
    let parse::Preamble {
        method,
        path,
        query,
        version,
        mut headers,
    } = preamble;

    // -- validate framing ---------------------------------------------------

    for encoding in headers.token_list("transfer-encoding") {
        if encoding != "chunked" {
            return Err(Error::new_unsupported_transfer_encoding(&encoding));
        }
    }
    let chunked = headers.contains_token("transfer-encoding", "chunked");
    let content_length = match headers.get("content-length") {
        Some(value) => {
            // stricter than str::parse, which tolerates a leading `+`
            let raw = value.trim();
            let valid = !raw.is_empty() && raw.bytes().all(crate::proto::chars::is_digit);
            match raw.parse::<u64>() {
                Ok(len) if valid => Some(len),
                _ => {
                    let byte = raw.bytes().next().unwrap_or(b' ');
                    return Err(Error::new_parse(
                        crate::error::Section::Preamble,
                        byte,
                        "ContentLength",
                    ));
                }
            }
        }
        None => None,
    };

    let framing = if chunked {
        // overlapping framing: chunked wins, the length is dropped
        if content_length.is_some() {
            debug!("request sent both content-length and chunked; dropping length");
            headers.remove("content-length");
        }
        shared.instrumenter.chunked_request();
        BodyFraming::Chunked
    } else {
        match content_length {
            Some(0) | None => {
                if method_expects_body(&method) && headers.contains("content-type") && content_length.is_none() {
                    return Err(Error::new_length_required());
                }
                BodyFraming::None
            }
            Some(len) => BodyFraming::Sized(len),
        }
    };

    let content_type = headers.get("content-type").map(str::to_owned);
    let body_limit = config.max_body_size(content_type.as_deref());

    // -- interim response ---------------------------------------------------

    if framing != BodyFraming::None
        && headers
            .get("expect")
            .map(|v| v.eq_ignore_ascii_case("100-continue"))
            .unwrap_or(false)
    {
        trace!("sending 100 Continue");
        writer
            .write_all(b"HTTP/1.1 100 Continue\r\n\r\n")
            .and_then(|_| writer.flush())
            .map_err(Error::from_io)?;
    }

    // -- build the body pipeline and pre-parse form content -----------------

    let content_encodings = headers.token_list("content-encoding");
    let mut body = Body::new(
        Box::new(&mut *reader),
        framing,
        &content_encodings,
        config.chunked_buffer_size,
        body_limit,
    )?;

    let mut params = Params::new();
    if let Some(ref query) = query {
        parse::parse_form(query.as_bytes(), config.default_charset, &mut params);
    }

    let charset = content_type
        .as_deref()
        .and_then(|ct| crate::header::param(ct, "charset"))
        .and_then(|label| encoding_rs::Encoding::for_label(label.as_bytes()))
        .unwrap_or(config.default_charset);

    let mut files = Vec::new();
    let mut file_manager: Option<FileManager> = None;
    let media_type = content_type
        .as_deref()
        .map(crate::header::media_type)
        .unwrap_or_default();

    if framing != BodyFraming::None {
        if media_type == "application/x-www-form-urlencoded" && method_expects_body(&method) {
            let mut raw = Vec::new();
            std::io::Read::read_to_end(&mut body, &mut raw).map_err(Error::from_io)?;
            parse::parse_form(&raw, charset, &mut params);
        } else if media_type.starts_with("multipart/") && config.multipart.enabled {
            let boundary = content_type
                .as_deref()
                .and_then(|ct| crate::header::param(ct, "boundary"))
                .filter(|b| !b.is_empty())
                .ok_or_else(|| {
                    Error::new_incomplete_parse(crate::error::Section::Multipart, "Boundary")
                })?;
            let mut manager = FileManager::new(
                config.multipart.temp_dir.clone(),
                config.multipart.filename_prefix.clone(),
                config.multipart.filename_suffix.clone(),
                config.multipart.delete_temporary_files,
            );
            multipart::process(
                &mut body,
                &boundary,
                &config.multipart.limits(),
                config.default_charset,
                &mut manager,
                &mut params,
                &mut files,
            )?;
            file_manager = Some(manager);
        }
    }

    // -- run the handler ----------------------------------------------------

    let accept_encodings = headers.token_list("accept-encoding");
    let request_allows_keep_alive = wants_keep_alive(version, &headers);

    let mut request = Request::new(
        method, path, query, version, headers, params, remote_addr, local_addr, encrypted, body,
    );
    *request.files_mut() = files;

    let mut response = Response::new(
        writer,
        version,
        accept_encodings
            .into_iter()
            .map(|t| t.split(';').next().unwrap_or("").trim().to_owned())
            .collect(),
        shared.config.compress_by_default,
        shared.config.chunked_buffer_size,
    );

    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        shared.handler.handle(&mut request, &mut response)
    }));

    let handler_error = match outcome {
        Ok(Ok(())) => None,
        Ok(Err(err)) => Some(Error::new_handler(err.status(), err.message().map(str::to_owned))),
        Err(_) => {
            error!("handler panicked");
            Some(Error::new_handler(None, Some("internal error".to_owned())))
        }
    };

    if let Some(err) = handler_error {
        if response.is_committed() {
            // committed bytes cannot be retracted; cut the connection
            debug!("handler failed after commit: {}", err);
            return Ok(false);
        }
        let status = err.status_hint().unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let message = err.into_cause().map(|c| c.to_string()).unwrap_or_default();
        let _ = response.set_status(status);
        let _ = response.remove_header("content-length");
        let _ = response.set_header("Content-Length", message.len().to_string());
        response
            .write_all(message.as_bytes())
            .map_err(Error::from_io)?;
    }

    response.finish()?;
    if response.framing() == Some(Framing::Chunked) {
        shared.instrumenter.chunked_response();
    }
    let response_allows_keep_alive = response.allows_keep_alive();
    drop(response);

    // -- drain whatever the handler did not read ----------------------------

    if request
        .body_mut()
        .drain(shared.config.max_bytes_to_drain)
        .is_err()
    {
        debug!("unread body over the drain cap; connection not reusable");
        drop(file_manager);
        return Ok(false);
    }
    drop(file_manager);

    Ok(request_allows_keep_alive && response_allows_keep_alive && !shared.is_shutdown())
}

/// Writes an error response when the failure kind maps to a status and the
/// preamble never committed, then lets the connection close.
fn handle_failure(
    err: Error,
    reader: &mut ConnReader,
    writer: &mut MeteredWriter,
    ctrl: &TcpStream,
    shared: &Arc<Shared>,
    phase: Phase,
) {
    if err.is_timeout() || err.would_block() {
        debug!("closing connection: {}", Error::new_timeout(phase));
        return;
    }
    if err.is_slow_client() {
        info!("closing connection: {}", err);
        return;
    }
    match err.status_hint() {
        Some(status) => {
            debug!("rejecting request: {}", err);
            if matches!(err.kind(), Kind::Parse(_)) {
                shared.instrumenter.bad_request();
            }
            if write_plain_response(writer, status, &err.message().to_string()).is_ok() {
                linger_drain(reader, ctrl);
            }
        }
        None => {
            if !err.is_incomplete_message() && !err.is_io() {
                debug!("closing connection: {}", err);
            }
        }
    }
}

/// Consumes request bytes the client already put on the wire so closing the
/// socket sends a clean FIN instead of a reset that could destroy the error
/// response in flight.
fn linger_drain(reader: &mut ConnReader, ctrl: &TcpStream) {
    let _ = ctrl.set_read_timeout(Some(Duration::from_millis(50)));
    let mut scratch = [0u8; 8 * 1024];
    let mut total: u64 = 0;
    while total < 256 * 1024 {
        match reader.read(&mut scratch) {
            Ok(0) | Err(_) => break,
            Ok(n) => total += n as u64,
        }
    }
}

/// A minimal, self-contained response for protocol failures.
fn write_plain_response(
    writer: &mut MeteredWriter,
    status: StatusCode,
    message: &str,
) -> std::io::Result<()> {
    let mut headers = HeaderMap::new();
    headers.set("Content-Length", message.len().to_string());
    headers.set("Content-Type", "text/plain; charset=utf-8");
    headers.set("Connection", "close");
    let mut out = bytes::BytesMut::with_capacity(128 + message.len());
    encode::write_preamble(&mut out, status, None, &headers, &[]);
    out.extend_from_slice(message.as_bytes());
    writer.write_all(&out)?;
    writer.flush()
}

fn method_expects_body(method: &Method) -> bool {
    *method == Method::POST
        || *method == Method::PUT
        || *method == Method::PATCH
        || *method == Method::DELETE
}

/// HTTP/1.1 defaults to keep-alive, HTTP/1.0 to close.
fn wants_keep_alive(version: Version, headers: &HeaderMap) -> bool {
    if headers.contains_token("connection", "close") {
        return false;
    }
    match version {
        Version::HTTP_11 => true,
        Version::HTTP_10 => headers.contains_token("connection", "keep-alive"),
        _ => false,
    }
}

fn set_timeouts(sock: &TcpStream, read: Duration, write: Duration) {
    let _ = sock.set_read_timeout(Some(read));
    let _ = sock.set_write_timeout(Some(write));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keep_alive_defaults_by_version() {
        let headers = HeaderMap::new();
        assert!(wants_keep_alive(Version::HTTP_11, &headers));
        assert!(!wants_keep_alive(Version::HTTP_10, &headers));

        let mut headers = HeaderMap::new();
        headers.add("Connection", "keep-alive");
        assert!(wants_keep_alive(Version::HTTP_10, &headers));

        let mut headers = HeaderMap::new();
        headers.add("Connection", "close");
        assert!(!wants_keep_alive(Version::HTTP_11, &headers));
    }

    #[test]
    fn body_expecting_methods() {
        assert!(method_expects_body(&Method::POST));
        assert!(method_expects_body(&Method::PUT));
        assert!(!method_expects_body(&Method::GET));
        assert!(!method_expects_body(&Method::HEAD));
    }
}
