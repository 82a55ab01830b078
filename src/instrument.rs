//! Instrumentation hooks.

/// Fire-and-forget callbacks for server events.
///
/// Every method has a no-op default, so an implementation only picks the
/// events it cares about. Implementations are called from worker threads
/// concurrently and must be thread-safe.
pub trait Instrumenter: Send + Sync + 'static {
    /// A listener accepted a connection.
    fn accepted_connection(&self) {}

    /// A request failed to parse or validate.
    fn bad_request(&self) {}

    /// A request preamble was parsed and a request is being served.
    fn started_request(&self) {}

    /// A request body arrived chunked.
    fn chunked_request(&self) {}

    /// A response body was sent chunked.
    fn chunked_response(&self) {}

    /// Bytes were written to a client socket.
    fn wrote_to_client(&self, _bytes: u64) {}

    /// Bytes were read from a client socket.
    fn read_from_client(&self, _bytes: u64) {}

    /// A connection was closed.
    fn connection_closed(&self) {}
}

/// The default instrumenter: does nothing.
pub(crate) struct NoopInstrumenter;

impl Instrumenter for NoopInstrumenter {}
