//! The server: configuration, listeners, the worker pool and shutdown.

pub(crate) mod conn;
pub(crate) mod listener;
pub(crate) mod meter;

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, SyncSender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use encoding_rs::Encoding;
use http::StatusCode;

use crate::error::Error;
use crate::instrument::{Instrumenter, NoopInstrumenter};
use crate::net::tls::TlsConfig;
use crate::proto::multipart::{Limits, UploadPolicy};
use crate::request::Request;
use crate::response::Response;

/// A request handler.
///
/// Called once per request from a worker thread; implementations are shared
/// across workers and must be thread-safe. Failures that escape the handler
/// become an error response when nothing has been committed yet, and close
/// the connection otherwise.
pub trait Handler: Send + Sync + 'static {
    fn handle(
        &self,
        request: &mut Request<'_>,
        response: &mut Response<'_>,
    ) -> Result<(), HandlerError>;
}

impl<F> Handler for F
where
    F: Fn(&mut Request<'_>, &mut Response<'_>) -> Result<(), HandlerError>
        + Send
        + Sync
        + 'static,
{
    fn handle(
        &self,
        request: &mut Request<'_>,
        response: &mut Response<'_>,
    ) -> Result<(), HandlerError> {
        (self)(request, response)
    }
}

/// A failure a handler hands back to the server.
#[derive(Debug)]
pub struct HandlerError {
    status: Option<StatusCode>,
    message: Option<String>,
}

impl HandlerError {
    /// A plain failure; answered with 500 when nothing was committed.
    pub fn new(message: impl Into<String>) -> HandlerError {
        HandlerError {
            status: None,
            message: Some(message.into()),
        }
    }

    /// A failure with a suggested response status.
    pub fn with_status(status: StatusCode, message: impl Into<String>) -> HandlerError {
        HandlerError {
            status: Some(status),
            message: Some(message.into()),
        }
    }

    pub fn status(&self) -> Option<StatusCode> {
        self.status
    }

    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }
}

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.status, self.message.as_deref()) {
            (Some(status), Some(message)) => write!(f, "{}: {}", status, message),
            (Some(status), None) => write!(f, "{}", status),
            (None, Some(message)) => f.write_str(message),
            (None, None) => f.write_str("handler error"),
        }
    }
}

impl std::error::Error for HandlerError {}

impl From<io::Error> for HandlerError {
    fn from(err: io::Error) -> HandlerError {
        // limit and parse failures smuggled through the body stream keep
        // their suggested status instead of collapsing to 500
        let err = Error::from_io(err);
        HandlerError {
            status: err.status_hint(),
            message: Some(err.to_string()),
        }
    }
}

impl From<crate::Error> for HandlerError {
    fn from(err: crate::Error) -> HandlerError {
        HandlerError::new(err.to_string())
    }
}

impl From<String> for HandlerError {
    fn from(message: String) -> HandlerError {
        HandlerError::new(message)
    }
}

impl From<&str> for HandlerError {
    fn from(message: &str) -> HandlerError {
        HandlerError::new(message)
    }
}

/// Multipart handling options.
#[derive(Debug, Clone)]
pub(crate) struct MultipartConfig {
    pub(crate) enabled: bool,
    pub(crate) policy: UploadPolicy,
    pub(crate) max_file_size: u64,
    pub(crate) max_request_size: u64,
    pub(crate) max_field_size: u64,
    pub(crate) buffer_size: usize,
    pub(crate) temp_dir: PathBuf,
    pub(crate) filename_prefix: String,
    pub(crate) filename_suffix: String,
    pub(crate) delete_temporary_files: bool,
}

impl MultipartConfig {
    pub(crate) fn limits(&self) -> Limits {
        Limits {
            policy: self.policy,
            max_file_size: self.max_file_size,
            max_request_size: self.max_request_size,
            max_field_size: self.max_field_size,
            buffer_size: self.buffer_size,
        }
    }
}

impl Default for MultipartConfig {
    fn default() -> MultipartConfig {
        MultipartConfig {
            enabled: true,
            policy: UploadPolicy::Allow,
            max_file_size: 1024 * 1024,
            max_request_size: 10 * 1024 * 1024,
            max_field_size: 1024 * 1024,
            buffer_size: 16 * 1024,
            temp_dir: std::env::temp_dir(),
            filename_prefix: "hearth-".to_owned(),
            filename_suffix: ".upload".to_owned(),
            delete_temporary_files: true,
        }
    }
}

/// All server tunables, with the defaults the builder starts from.
pub(crate) struct Config {
    pub(crate) num_worker_threads: usize,
    pub(crate) queue_bound: usize,
    pub(crate) backlog: u32,
    pub(crate) shutdown_duration: Duration,
    pub(crate) request_buffer_size: usize,
    pub(crate) max_preamble_bytes: usize,
    pub(crate) max_bytes_to_drain: u64,
    pub(crate) chunked_buffer_size: usize,
    pub(crate) body_limits: Vec<(String, u64)>,
    pub(crate) initial_read_timeout: Duration,
    pub(crate) keep_alive_timeout: Duration,
    pub(crate) read_throughput_warmup: Duration,
    pub(crate) write_throughput_warmup: Duration,
    pub(crate) min_read_throughput: u64,
    pub(crate) min_write_throughput: u64,
    pub(crate) max_keep_alive_requests: Option<u64>,
    pub(crate) compress_by_default: bool,
    pub(crate) default_charset: &'static Encoding,
    pub(crate) multipart: MultipartConfig,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            num_worker_threads: 64,
            queue_bound: 128,
            backlog: 128,
            shutdown_duration: Duration::from_secs(10),
            request_buffer_size: 16 * 1024,
            max_preamble_bytes: 128 * 1024,
            max_bytes_to_drain: 256 * 1024,
            chunked_buffer_size: 8 * 1024,
            body_limits: vec![("*".to_owned(), 128 * 1024 * 1024)],
            initial_read_timeout: Duration::from_secs(20),
            keep_alive_timeout: Duration::from_secs(20),
            read_throughput_warmup: Duration::from_secs(5),
            write_throughput_warmup: Duration::from_secs(5),
            min_read_throughput: 0,
            min_write_throughput: 0,
            max_keep_alive_requests: None,
            compress_by_default: false,
            default_charset: encoding_rs::UTF_8,
            multipart: MultipartConfig::default(),
        }
    }
}

impl Config {
    /// Resolves the body size cap for a content type. An exact pattern wins,
    /// then the `type/*` family, then the `*` fallback.
    pub(crate) fn max_body_size(&self, content_type: Option<&str>) -> u64 {
        let media = content_type
            .map(crate::header::media_type)
            .unwrap_or_default();
        let family = media
            .split('/')
            .next()
            .map(|t| format!("{}/*", t))
            .unwrap_or_default();

        let mut fallback = None;
        let mut family_match = None;
        for (pattern, size) in &self.body_limits {
            if *pattern == media {
                return *size;
            } else if *pattern == family {
                family_match = Some(*size);
            } else if pattern == "*" {
                fallback = Some(*size);
            }
        }
        family_match.or(fallback).unwrap_or(u64::MAX)
    }
}

/// State shared by every listener and worker thread.
pub(crate) struct Shared {
    pub(crate) config: Config,
    pub(crate) handler: Arc<dyn Handler>,
    pub(crate) instrumenter: Arc<dyn Instrumenter>,
    shutdown: AtomicBool,
    active: Mutex<HashMap<u64, TcpStream>>,
    next_conn_id: AtomicU64,
}

impl Shared {
    pub(crate) fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    fn begin_shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
    }

    /// Tracks a live connection so shutdown can cut it after the grace
    /// period. The guard deregisters on drop.
    pub(crate) fn register(&self, sock: TcpStream) -> ConnGuard<'_> {
        let id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut active) = self.active.lock() {
            active.insert(id, sock);
        }
        ConnGuard { shared: self, id }
    }

    fn close_active(&self) {
        if let Ok(mut active) = self.active.lock() {
            for (_, sock) in active.drain() {
                let _ = sock.shutdown(Shutdown::Both);
            }
        }
    }
}

pub(crate) struct ConnGuard<'a> {
    shared: &'a Shared,
    id: u64,
}

impl Drop for ConnGuard<'_> {
    fn drop(&mut self) {
        if let Ok(mut active) = self.shared.active.lock() {
            active.remove(&self.id);
        }
    }
}

/// A running server.
///
/// Dropping the server shuts it down gracefully.
pub struct Server {
    shared: Arc<Shared>,
    acceptors: Vec<JoinHandle<()>>,
    workers: Vec<JoinHandle<()>>,
    addrs: Vec<SocketAddr>,
    tx: Option<SyncSender<conn::Job>>,
}

impl Server {
    pub fn builder() -> Builder {
        Builder {
            listeners: Vec::new(),
            config: Config::default(),
            handler: None,
            instrumenter: Arc::new(NoopInstrumenter),
        }
    }

    /// The addresses the listeners actually bound, with ephemeral ports
    /// resolved.
    pub fn local_addrs(&self) -> &[SocketAddr] {
        &self.addrs
    }

    /// Stops accepting immediately, lets in-flight requests finish within
    /// the configured grace period, then cuts whatever is left. Safe to call
    /// more than once.
    pub fn shutdown(&mut self) {
        self.shared.begin_shutdown();

        // unblock accept calls so the acceptor threads can observe the flag
        for addr in &self.addrs {
            let _ = TcpStream::connect_timeout(addr, Duration::from_millis(100));
        }
        for acceptor in self.acceptors.drain(..) {
            let _ = acceptor.join();
        }
        // all senders gone: the queue drains and then disconnects
        self.tx = None;

        let deadline = Instant::now() + self.shared.config.shutdown_duration;
        while Instant::now() < deadline && self.workers.iter().any(|w| !w.is_finished()) {
            std::thread::sleep(Duration::from_millis(10));
        }

        if self.workers.iter().any(|w| !w.is_finished()) {
            info!("shutdown grace period expired; closing remaining connections");
        }
        self.shared.close_active();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
        debug!("server stopped");
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server").field("addrs", &self.addrs).finish()
    }
}

/// Configures and starts a `Server`.
#[must_use = "a Builder does nothing until spawn() is called"]
pub struct Builder {
    listeners: Vec<(SocketAddr, Option<TlsConfig>)>,
    config: Config,
    handler: Option<Arc<dyn Handler>>,
    instrumenter: Arc<dyn Instrumenter>,
}

impl fmt::Debug for Builder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Builder")
            .field("listeners", &self.listeners)
            .finish()
    }
}

impl Builder {
    /// Adds a plaintext listener.
    pub fn bind(mut self, addr: SocketAddr) -> Self {
        self.listeners.push((addr, None));
        self
    }

    /// Adds a TLS listener.
    pub fn bind_tls(mut self, addr: SocketAddr, tls: TlsConfig) -> Self {
        self.listeners.push((addr, Some(tls)));
        self
    }

    /// The request handler. Required.
    pub fn handler(mut self, handler: impl Handler) -> Self {
        self.handler = Some(Arc::new(handler));
        self
    }

    /// Metric event callbacks.
    pub fn instrumenter(mut self, instrumenter: impl Instrumenter) -> Self {
        self.instrumenter = Arc::new(instrumenter);
        self
    }

    pub fn num_worker_threads(mut self, count: usize) -> Self {
        self.config.num_worker_threads = count;
        self
    }

    /// Bound on sockets queued between accept and the worker pool.
    pub fn pending_connection_queue(mut self, bound: usize) -> Self {
        self.config.queue_bound = bound.max(1);
        self
    }

    pub fn backlog(mut self, backlog: u32) -> Self {
        self.config.backlog = backlog;
        self
    }

    pub fn shutdown_duration(mut self, duration: Duration) -> Self {
        self.config.shutdown_duration = duration;
        self
    }

    pub fn request_buffer_size(mut self, bytes: usize) -> Self {
        self.config.request_buffer_size = bytes.max(256);
        self
    }

    /// Cap on the request line plus headers.
    pub fn max_preamble_bytes(mut self, bytes: usize) -> Self {
        self.config.max_preamble_bytes = bytes;
        self
    }

    /// Cap on unread body bytes discarded between keep-alive requests.
    pub fn max_bytes_to_drain(mut self, bytes: u64) -> Self {
        self.config.max_bytes_to_drain = bytes;
        self
    }

    pub fn chunked_buffer_size(mut self, bytes: usize) -> Self {
        self.config.chunked_buffer_size = bytes.max(16);
        self
    }

    /// Caps request bodies whose content type matches `pattern`. Patterns
    /// are an exact `type/subtype`, a `type/*` family, or `*`.
    pub fn max_request_body_size(mut self, pattern: impl Into<String>, bytes: u64) -> Self {
        let pattern = pattern.into().to_ascii_lowercase();
        self.config.body_limits.retain(|(p, _)| *p != pattern);
        self.config.body_limits.push((pattern, bytes));
        self
    }

    pub fn initial_read_timeout(mut self, timeout: Duration) -> Self {
        self.config.initial_read_timeout = timeout;
        self
    }

    pub fn keep_alive_timeout(mut self, timeout: Duration) -> Self {
        self.config.keep_alive_timeout = timeout;
        self
    }

    pub fn read_throughput_warmup(mut self, warmup: Duration) -> Self {
        self.config.read_throughput_warmup = warmup;
        self
    }

    pub fn write_throughput_warmup(mut self, warmup: Duration) -> Self {
        self.config.write_throughput_warmup = warmup;
        self
    }

    /// Minimum acceptable client upload rate in bytes/second; zero disables
    /// the check.
    pub fn min_read_throughput(mut self, bytes_per_second: u64) -> Self {
        self.config.min_read_throughput = bytes_per_second;
        self
    }

    pub fn min_write_throughput(mut self, bytes_per_second: u64) -> Self {
        self.config.min_write_throughput = bytes_per_second;
        self
    }

    /// Cap on requests served per connection; `None` means unlimited.
    pub fn max_keep_alive_requests(mut self, budget: Option<u64>) -> Self {
        self.config.max_keep_alive_requests = budget;
        self
    }

    /// Whether responses compress without the handler opting in.
    pub fn compress_by_default(mut self, compress: bool) -> Self {
        self.config.compress_by_default = compress;
        self
    }

    /// Charset for form decoding when a request does not declare one.
    /// Unknown labels are ignored.
    pub fn default_charset(mut self, label: &str) -> Self {
        if let Some(encoding) = Encoding::for_label(label.as_bytes()) {
            self.config.default_charset = encoding;
        }
        self
    }

    pub fn multipart_enabled(mut self, enabled: bool) -> Self {
        self.config.multipart.enabled = enabled;
        self
    }

    pub fn file_upload_policy(mut self, policy: UploadPolicy) -> Self {
        self.config.multipart.policy = policy;
        self
    }

    pub fn multipart_max_file_size(mut self, bytes: u64) -> Self {
        self.config.multipart.max_file_size = bytes;
        self
    }

    /// Total multipart body cap. Clamped to at least the per-file cap.
    pub fn multipart_max_request_size(mut self, bytes: u64) -> Self {
        self.config.multipart.max_request_size = bytes;
        self
    }

    pub fn multipart_max_field_size(mut self, bytes: u64) -> Self {
        self.config.multipart.max_field_size = bytes;
        self
    }

    pub fn multipart_buffer_size(mut self, bytes: usize) -> Self {
        self.config.multipart.buffer_size = bytes.max(64);
        self
    }

    pub fn multipart_temp_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.multipart.temp_dir = dir.into();
        self
    }

    pub fn multipart_filename_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.config.multipart.filename_prefix = prefix.into();
        self
    }

    pub fn multipart_filename_suffix(mut self, suffix: impl Into<String>) -> Self {
        self.config.multipart.filename_suffix = suffix.into();
        self
    }

    /// Whether staged upload files are deleted when their request completes.
    pub fn delete_temporary_files(mut self, delete: bool) -> Self {
        self.config.multipart.delete_temporary_files = delete;
        self
    }

    /// Binds every listener, starts the pool, and returns the running
    /// server.
    pub fn spawn(mut self) -> crate::Result<Server> {
        let handler = self
            .handler
            .take()
            .ok_or_else(|| Error::new(crate::error::Kind::Listen).with("no handler configured"))?;
        if self.listeners.is_empty() {
            return Err(Error::new(crate::error::Kind::Listen).with("no listeners configured"));
        }
        // the request cap must leave room for at least one full file
        self.config.multipart.max_request_size = self
            .config
            .multipart
            .max_request_size
            .max(self.config.multipart.max_file_size);

        let mut bound = Vec::with_capacity(self.listeners.len());
        let mut addrs = Vec::with_capacity(self.listeners.len());
        for (addr, tls) in self.listeners {
            let listener = listener::bind(addr, self.config.backlog).map_err(Error::new_listen)?;
            let local = listener.local_addr().map_err(Error::new_listen)?;
            info!(
                "listening on {}{}",
                local,
                if tls.is_some() { " (tls)" } else { "" }
            );
            addrs.push(local);
            bound.push((listener, tls));
        }

        let shared = Arc::new(Shared {
            handler,
            instrumenter: self.instrumenter,
            config: self.config,
            shutdown: AtomicBool::new(false),
            active: Mutex::new(HashMap::new()),
            next_conn_id: AtomicU64::new(0),
        });

        let (tx, rx) = mpsc::sync_channel(shared.config.queue_bound);
        let rx = Arc::new(Mutex::new(rx));
        let workers = listener::spawn_workers(
            shared.config.num_worker_threads,
            rx,
            shared.clone(),
        );
        let acceptors = bound
            .into_iter()
            .map(|(listener, tls)| {
                listener::spawn_acceptor(
                    listener,
                    tls.map(|t| t.server_config()),
                    tx.clone(),
                    shared.clone(),
                )
            })
            .collect();

        Ok(Server {
            shared,
            acceptors,
            workers,
            addrs,
            tx: Some(tx),
        })
    }
}
