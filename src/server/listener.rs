//! Listener sockets, accept threads and the worker pool.

use std::io;
use std::net::{SocketAddr, TcpListener};
use std::sync::mpsc::{Receiver, SyncSender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use socket2::{Domain, Socket, Type};

use crate::server::conn::{self, Job};
use crate::server::Shared;

/// Binds a listening socket with an explicit backlog.
pub(crate) fn bind(addr: SocketAddr, backlog: u32) -> io::Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, None)?;
    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog as i32)?;
    Ok(socket.into())
}

/// One accept thread per listener: take sockets, hand them to the pool.
///
/// `tx.send` blocks when the queue is full, which is the backpressure the
/// configuration asks for.
pub(crate) fn spawn_acceptor(
    listener: TcpListener,
    tls: Option<Arc<rustls::ServerConfig>>,
    tx: SyncSender<Job>,
    shared: Arc<Shared>,
) -> JoinHandle<()> {
    let addr = listener.local_addr().ok();
    thread::Builder::new()
        .name(format!(
            "hearth-accept-{}",
            addr.map(|a| a.to_string()).unwrap_or_default()
        ))
        .spawn(move || loop {
            match listener.accept() {
                Ok((sock, peer)) => {
                    if shared.is_shutdown() {
                        break;
                    }
                    trace!("accepted connection from {}", peer);
                    let _ = sock.set_nodelay(true);
                    if tx.send(Job { sock, tls: tls.clone() }).is_err() {
                        break;
                    }
                }
                Err(err) => {
                    if shared.is_shutdown() {
                        break;
                    }
                    warn!("{}", crate::error::Error::new_accept(err));
                }
            }
        })
        .expect("failed to spawn acceptor thread")
}

/// The fixed pool of connection workers, shared across all listeners.
pub(crate) fn spawn_workers(
    count: usize,
    rx: Arc<Mutex<Receiver<Job>>>,
    shared: Arc<Shared>,
) -> Vec<JoinHandle<()>> {
    (0..count.max(1))
        .map(|i| {
            let rx = rx.clone();
            let shared = shared.clone();
            thread::Builder::new()
                .name(format!("hearth-worker-{}", i))
                .spawn(move || loop {
                    // the pool winds down when every sender is gone and the
                    // queue of already-accepted sockets has drained
                    let job = {
                        let guard = match rx.lock() {
                            Ok(guard) => guard,
                            Err(_) => return,
                        };
                        guard.recv()
                    };
                    match job {
                        Ok(job) => conn::serve(job, &shared),
                        Err(_) => return,
                    }
                })
                .expect("failed to spawn worker thread")
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_ephemeral_port() {
        let listener = bind("127.0.0.1:0".parse().unwrap(), 16).unwrap();
        let addr = listener.local_addr().unwrap();
        assert_ne!(addr.port(), 0);
    }

    #[test]
    fn bound_socket_accepts() {
        let listener = bind("127.0.0.1:0".parse().unwrap(), 16).unwrap();
        let addr = listener.local_addr().unwrap();
        let client = std::net::TcpStream::connect(addr).unwrap();
        let (sock, peer) = listener.accept().unwrap();
        assert_eq!(peer, client.local_addr().unwrap());
        drop(sock);
    }
}
