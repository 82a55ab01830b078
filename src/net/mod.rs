//! Connection streams: plaintext and TLS, split into read and write halves,
//! with byte accounting on every transfer.

pub(crate) mod pushback;
pub(crate) mod tls;

use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::sync::{Arc, Mutex};

use crate::error::{Direction, Error};
use crate::instrument::Instrumenter;
use crate::server::meter::Meter;

use self::tls::TlsStream;

/// An accepted connection's byte stream, before splitting.
pub(crate) enum Stream {
    Plain(TcpStream),
    Tls(TlsStream),
}

impl Stream {
    /// Splits into independently usable read and write halves.
    ///
    /// Plaintext halves are `try_clone`d socket handles. A TLS session cannot
    /// be cloned, so both halves share it behind a mutex; the worker never
    /// reads and writes concurrently, so the lock is uncontended.
    pub(crate) fn split(self) -> io::Result<(ReadHalf, WriteHalf)> {
        match self {
            Stream::Plain(sock) => {
                let write = sock.try_clone()?;
                Ok((ReadHalf::Plain(sock), WriteHalf::Plain(write)))
            }
            Stream::Tls(tls) => {
                let shared = Arc::new(Mutex::new(tls));
                Ok((
                    ReadHalf::Tls(shared.clone()),
                    WriteHalf::Tls(shared),
                ))
            }
        }
    }
}

pub(crate) enum ReadHalf {
    Plain(TcpStream),
    Tls(Arc<Mutex<TlsStream>>),
}

pub(crate) enum WriteHalf {
    Plain(TcpStream),
    Tls(Arc<Mutex<TlsStream>>),
}

impl Read for ReadHalf {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            ReadHalf::Plain(sock) => sock.read(buf),
            ReadHalf::Tls(shared) => lock(shared)?.read(buf),
        }
    }
}

impl Write for WriteHalf {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            WriteHalf::Plain(sock) => sock.write(buf),
            WriteHalf::Tls(shared) => lock(shared)?.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            WriteHalf::Plain(sock) => sock.flush(),
            WriteHalf::Tls(shared) => lock(shared)?.flush(),
        }
    }
}

impl WriteHalf {
    /// Sends the TLS `close_notify` if this is an encrypted stream. Plaintext
    /// teardown is the socket shutdown the worker performs.
    pub(crate) fn close(&mut self) {
        if let WriteHalf::Tls(shared) = self {
            if let Ok(mut tls) = shared.lock() {
                tls.send_close_notify();
            }
        }
    }
}

fn lock(shared: &Arc<Mutex<TlsStream>>) -> io::Result<std::sync::MutexGuard<'_, TlsStream>> {
    shared
        .lock()
        .map_err(|_| io::Error::new(io::ErrorKind::Other, "TLS stream poisoned"))
}

/// Rate limits a slow peer is held to, baked into the metered halves so every
/// read and write call site enforces them.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RateLimits {
    pub(crate) min_read_throughput: u64,
    pub(crate) min_write_throughput: u64,
    pub(crate) read_warmup: std::time::Duration,
    pub(crate) write_warmup: std::time::Duration,
}

/// The read half with meter updates and instrumentation on every transfer.
pub(crate) struct MeteredReader {
    inner: ReadHalf,
    meter: Arc<Meter>,
    instrumenter: Arc<dyn Instrumenter>,
    limits: RateLimits,
}

impl MeteredReader {
    pub(crate) fn new(
        inner: ReadHalf,
        meter: Arc<Meter>,
        instrumenter: Arc<dyn Instrumenter>,
        limits: RateLimits,
    ) -> MeteredReader {
        MeteredReader {
            inner,
            meter,
            instrumenter,
            limits,
        }
    }
}

impl Read for MeteredReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        if n > 0 {
            self.meter.record_read(n as u64);
            self.instrumenter.read_from_client(n as u64);
        }
        if self.limits.min_read_throughput > 0 {
            let rate = self.meter.read_throughput(self.limits.read_warmup);
            if rate < self.limits.min_read_throughput {
                trace!("read throughput {} under minimum, dropping client", rate);
                return Err(Error::new_slow_client(Direction::Read, rate).into_io());
            }
        }
        Ok(n)
    }
}

/// The write half with meter updates and instrumentation on every transfer.
pub(crate) struct MeteredWriter {
    inner: WriteHalf,
    meter: Arc<Meter>,
    instrumenter: Arc<dyn Instrumenter>,
    limits: RateLimits,
}

impl MeteredWriter {
    pub(crate) fn new(
        inner: WriteHalf,
        meter: Arc<Meter>,
        instrumenter: Arc<dyn Instrumenter>,
        limits: RateLimits,
    ) -> MeteredWriter {
        MeteredWriter {
            inner,
            meter,
            instrumenter,
            limits,
        }
    }

    pub(crate) fn close(&mut self) {
        self.inner.close();
    }
}

impl Write for MeteredWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        if n > 0 {
            self.meter.record_write(n as u64);
            self.instrumenter.wrote_to_client(n as u64);
        }
        if self.limits.min_write_throughput > 0 {
            let rate = self.meter.write_throughput(self.limits.write_warmup);
            if rate < self.limits.min_write_throughput {
                trace!("write throughput {} under minimum, dropping client", rate);
                return Err(Error::new_slow_client(Direction::Write, rate).into_io());
            }
        }
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

