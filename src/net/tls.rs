//! TLS support.
//!
//! Certificate material arrives as in-memory PEM strings. Each TLS listener
//! owns a `TlsConfig` with a default identity plus optional per-hostname
//! identities picked by SNI at handshake time. `TlsStream` adapts a rustls
//! session onto a blocking socket: the handshake is driven to completion at
//! accept time, and every read and write pumps TLS records as needed.

use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::sync::Arc;

use rustls::crypto::aws_lc_rs::sign::any_supported_type;
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::{ServerConfig, ServerConnection};
use rustls_pki_types::{CertificateDer, PrivateKeyDer};

use crate::error::Error;

/// TLS settings for one listener.
#[derive(Clone)]
pub struct TlsConfig {
    config: Arc<ServerConfig>,
}

impl TlsConfig {
    /// Builds a config with a single certificate chain (end-entity first)
    /// and private key, both PEM.
    pub fn new(cert_chain_pem: &str, key_pem: &str) -> crate::Result<TlsConfig> {
        TlsConfig::builder().identity(cert_chain_pem, key_pem)?.build()
    }

    pub fn builder() -> TlsConfigBuilder {
        TlsConfigBuilder {
            default: None,
            by_name: HashMap::new(),
        }
    }

    pub(crate) fn server_config(&self) -> Arc<ServerConfig> {
        self.config.clone()
    }
}

impl std::fmt::Debug for TlsConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("TlsConfig")
    }
}

pub struct TlsConfigBuilder {
    default: Option<Arc<CertifiedKey>>,
    by_name: HashMap<String, Arc<CertifiedKey>>,
}

impl std::fmt::Debug for TlsConfigBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsConfigBuilder")
            .field("sni_hosts", &self.by_name.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl TlsConfigBuilder {
    /// The identity presented when no SNI hostname matches.
    pub fn identity(mut self, cert_chain_pem: &str, key_pem: &str) -> crate::Result<Self> {
        self.default = Some(certified_key(cert_chain_pem, key_pem)?);
        Ok(self)
    }

    /// An identity presented to clients that ask for `hostname`.
    pub fn sni_identity(
        mut self,
        hostname: impl Into<String>,
        cert_chain_pem: &str,
        key_pem: &str,
    ) -> crate::Result<Self> {
        self.by_name
            .insert(hostname.into().to_ascii_lowercase(), certified_key(cert_chain_pem, key_pem)?);
        Ok(self)
    }

    pub fn build(self) -> crate::Result<TlsConfig> {
        let default = match self.default {
            Some(default) => default,
            None => return Err(Error::new_tls("no default identity configured".to_owned())),
        };
        let resolver = SniResolver {
            default,
            by_name: self.by_name,
        };
        let mut config = ServerConfig::builder()
            .with_no_client_auth()
            .with_cert_resolver(Arc::new(resolver));
        config.alpn_protocols = vec![b"http/1.1".to_vec()];
        Ok(TlsConfig {
            config: Arc::new(config),
        })
    }
}

fn certified_key(cert_chain_pem: &str, key_pem: &str) -> crate::Result<Arc<CertifiedKey>> {
    let chain: Vec<CertificateDer<'static>> =
        rustls_pemfile::certs(&mut cert_chain_pem.as_bytes())
            .collect::<Result<_, _>>()
            .map_err(Error::new_tls)?;
    if chain.is_empty() {
        return Err(Error::new_tls("no certificates in PEM".to_owned()));
    }
    let key: PrivateKeyDer<'static> = rustls_pemfile::private_key(&mut key_pem.as_bytes())
        .map_err(Error::new_tls)?
        .ok_or_else(|| Error::new_tls("no private key in PEM".to_owned()))?;
    let signing_key = any_supported_type(&key).map_err(Error::new_tls)?;
    Ok(Arc::new(CertifiedKey::new(chain, signing_key)))
}

#[derive(Debug)]
struct SniResolver {
    default: Arc<CertifiedKey>,
    by_name: HashMap<String, Arc<CertifiedKey>>,
}

impl ResolvesServerCert for SniResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let picked = client_hello
            .server_name()
            .and_then(|name| self.by_name.get(&name.to_ascii_lowercase()));
        Some(picked.unwrap_or(&self.default).clone())
    }
}

/// A rustls session over a blocking socket, exposed as plain `Read`/`Write`.
pub(crate) struct TlsStream {
    conn: ServerConnection,
    sock: TcpStream,
}

impl TlsStream {
    /// Runs the handshake to completion before the stream is handed to the
    /// worker. Failures close the socket.
    pub(crate) fn accept(config: Arc<ServerConfig>, sock: TcpStream) -> crate::Result<TlsStream> {
        let conn = ServerConnection::new(config).map_err(Error::new_tls)?;
        let mut stream = TlsStream { conn, sock };
        while stream.conn.is_handshaking() {
            stream
                .conn
                .complete_io(&mut stream.sock)
                .map_err(Error::new_tls)?;
        }
        trace!("TLS handshake complete");
        Ok(stream)
    }

    /// Queues `close_notify` and pushes it onto the wire.
    pub(crate) fn send_close_notify(&mut self) {
        self.conn.send_close_notify();
        let _ = self.write_records();
        let _ = self.sock.flush();
    }

    fn write_records(&mut self) -> io::Result<()> {
        while self.conn.wants_write() {
            self.conn.write_tls(&mut self.sock)?;
        }
        Ok(())
    }
}

impl Read for TlsStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            match self.conn.reader().read(buf) {
                Ok(n) => return Ok(n),
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    // no decrypted bytes ready; pull more records
                    if self.conn.read_tls(&mut self.sock)? == 0 {
                        // peer vanished without close_notify
                        return Ok(0);
                    }
                    self.conn
                        .process_new_packets()
                        .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
                    self.write_records()?;
                }
                Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => return Ok(0),
                Err(err) => return Err(err),
            }
        }
    }
}

impl Write for TlsStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.conn.writer().write(buf)?;
        self.write_records()?;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.write_records()?;
        self.sock.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::thread;

    fn self_signed(names: &[&str]) -> (String, String, CertificateDer<'static>) {
        let key = rcgen::generate_simple_self_signed(
            names.iter().map(|n| n.to_string()).collect::<Vec<_>>(),
        )
        .unwrap();
        (
            key.cert.pem(),
            key.key_pair.serialize_pem(),
            key.cert.der().clone(),
        )
    }

    fn client_config(trusted: &CertificateDer<'static>) -> Arc<rustls::ClientConfig> {
        let mut roots = rustls::RootCertStore::empty();
        roots.add(trusted.clone()).unwrap();
        Arc::new(
            rustls::ClientConfig::builder()
                .with_root_certificates(roots)
                .with_no_client_auth(),
        )
    }

    fn echo_once(tls: TlsConfig, client: Arc<rustls::ClientConfig>, sni: &'static str) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let client_thread = thread::spawn(move || {
            let sock = TcpStream::connect(addr).unwrap();
            let name = rustls_pki_types::ServerName::try_from(sni).unwrap();
            let conn = rustls::ClientConnection::new(client, name).unwrap();
            let mut stream = rustls::StreamOwned::new(conn, sock);
            stream.write_all(b"ping").unwrap();
            let mut reply = [0u8; 4];
            stream.read_exact(&mut reply).unwrap();
            assert_eq!(&reply, b"pong");
        });

        let (sock, _) = listener.accept().unwrap();
        let mut stream = TlsStream::accept(tls.server_config(), sock).unwrap();
        let mut request = [0u8; 4];
        stream.read_exact(&mut request).unwrap();
        assert_eq!(&request, b"ping");
        stream.write_all(b"pong").unwrap();
        stream.flush().unwrap();
        client_thread.join().unwrap();
    }

    #[test]
    fn handshake_and_round_trip() {
        let (cert, key, der) = self_signed(&["localhost"]);
        let tls = TlsConfig::new(&cert, &key).unwrap();
        echo_once(tls, client_config(&der), "localhost");
    }

    #[test]
    fn sni_selects_per_hostname_identity() {
        let (default_cert, default_key, _) = self_signed(&["localhost"]);
        let (alt_cert, alt_key, alt_der) = self_signed(&["alt.example"]);
        let tls = TlsConfig::builder()
            .identity(&default_cert, &default_key)
            .unwrap()
            .sni_identity("alt.example", &alt_cert, &alt_key)
            .unwrap()
            .build()
            .unwrap();
        // the client only trusts the alt certificate, so the handshake can
        // only succeed if the resolver picked it for the alt hostname
        echo_once(tls, client_config(&alt_der), "alt.example");
    }

    #[test]
    fn bad_pem_is_rejected() {
        assert!(TlsConfig::new("not a cert", "not a key").unwrap_err().is_tls());
        let (cert, _, _) = self_signed(&["localhost"]);
        assert!(TlsConfig::new(&cert, "garbage").unwrap_err().is_tls());
    }

    #[test]
    fn builder_requires_default_identity() {
        assert!(TlsConfig::builder().build().is_err());
    }
}
