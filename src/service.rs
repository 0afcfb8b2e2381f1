//! The public entry point: bind one port, optionally speak TLS on it, and dispatch
//! each connection to whichever registered detector recognizes its opening bytes.
//!
//! Grounded in the teacher's top-level `Server`/`Listener` wiring
//! (`examples/ryanseipp-rask-old/src/lib.rs`, `src/listener.rs`): a constructor that takes a
//! socket address and TLS configuration, and a `run`/`serve_forever` method that owns the
//! reactor thread. Detector registration itself follows
//! `examples/original_source/vdsm/protocoldetector.py`'s `MultiProtocolAcceptor`, which
//! collects `(detector, required_size)` pairs before the socket is ever bound.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use rustls::ServerConfig;

use crate::acceptor::{bind_reuseaddr, AcceptorConfig, AcceptorHandle};
use crate::detector::Detector;
use crate::reactor::{Reactor, Stopper};

/// Default time a connection is given to complete a TLS handshake and then present a
/// recognizable prefix, combined, before it is dropped.
const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// A single-port listener that sniffs each connection's opening bytes (after an
/// optional TLS handshake) and routes it to the first registered detector that
/// recognizes them.
///
/// Detectors must be registered with [`add_detector`](Self::add_detector) before
/// [`serve_forever`](Self::serve_forever) is called; the acceptor has no way to add one
/// once the reactor is running.
pub struct MultiProtocolAcceptor {
    host: String,
    port: u16,
    tls: Option<Arc<ServerConfig>>,
    handshake_timeout: Duration,
    detectors: Vec<Box<dyn Detector>>,
}

impl MultiProtocolAcceptor {
    /// Creates an acceptor for `host:port`. If `tls` is `Some`, every connection must
    /// complete a TLS handshake before detection; if `None`, connections are sniffed in
    /// plaintext.
    pub fn new(host: impl Into<String>, port: u16, tls: Option<Arc<ServerConfig>>) -> Self {
        Self {
            host: host.into(),
            port,
            tls,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            detectors: Vec::new(),
        }
    }

    /// Overrides the combined handshake-plus-detection deadline (default 10s).
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Registers a detector. Detectors are tried in registration order; the first
    /// whose `matches` returns true wins.
    pub fn add_detector(&mut self, detector: Box<dyn Detector>) {
        self.detectors.push(detector);
    }

    /// Resolves `host:port` to a single socket address, preferring the first result
    /// the way the teacher's server construction does.
    fn resolve(&self) -> io::Result<SocketAddr> {
        use std::net::ToSocketAddrs;
        (self.host.as_str(), self.port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "no addresses resolved"))
    }

    /// Binds the listening socket, drives the reactor until [`Stopper::stop`] is
    /// called, and blocks the calling thread for as long as the service runs.
    pub fn serve_forever(self) -> io::Result<()> {
        let addr = self.resolve()?;
        let required_peek_size = self
            .detectors
            .iter()
            .map(|d| d.required_bytes())
            .max()
            .unwrap_or(0);

        if required_peek_size == 0 {
            log::warn!("no detectors registered; every connection will be dropped");
        }

        let listener = bind_reuseaddr(addr)?;
        log::info!("listening on {}", listener.local_addr()?);

        let config = AcceptorConfig {
            tls: self.tls,
            handshake_timeout: self.handshake_timeout,
            detectors: Arc::new(self.detectors),
            required_peek_size,
        };

        let mut reactor = Reactor::new()?;
        let acceptor: AcceptorHandle<mio::net::TcpListener, mio::net::TcpStream> =
            AcceptorHandle::new(listener, config);
        reactor.register(Box::new(acceptor))?;
        reactor.run()
    }

    /// Same as [`serve_forever`](Self::serve_forever), but runs the reactor on a
    /// background thread and returns immediately with a handle that can stop it. Useful
    /// for embedding the acceptor inside a larger application or a test harness.
    pub fn spawn(self) -> io::Result<ServiceHandle> {
        let addr = self.resolve()?;
        let required_peek_size = self
            .detectors
            .iter()
            .map(|d| d.required_bytes())
            .max()
            .unwrap_or(0);

        let listener = bind_reuseaddr(addr)?;
        let local_addr = listener.local_addr()?;
        log::info!("listening on {local_addr}");

        let config = AcceptorConfig {
            tls: self.tls,
            handshake_timeout: self.handshake_timeout,
            detectors: Arc::new(self.detectors),
            required_peek_size,
        };

        let mut reactor = Reactor::new()?;
        let stopper = reactor.stopper();
        let acceptor: AcceptorHandle<mio::net::TcpListener, mio::net::TcpStream> =
            AcceptorHandle::new(listener, config);
        reactor.register(Box::new(acceptor))?;

        let join_handle = std::thread::Builder::new()
            .name("portcullis-acceptor".into())
            .spawn(move || reactor.run())?;

        Ok(ServiceHandle {
            local_addr,
            stopper,
            join_handle: Some(join_handle),
        })
    }
}

/// A running [`MultiProtocolAcceptor`] driven on a background thread.
pub struct ServiceHandle {
    local_addr: SocketAddr,
    stopper: Stopper,
    join_handle: Option<std::thread::JoinHandle<io::Result<()>>>,
}

impl ServiceHandle {
    /// The address actually bound, useful when the service was asked to bind port 0.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stops the reactor and waits for its thread to exit.
    pub fn stop(mut self) -> io::Result<()> {
        self.stopper.stop();
        match self.join_handle.take() {
            Some(join_handle) => join_handle
                .join()
                .unwrap_or_else(|_| Err(io::Error::new(io::ErrorKind::Other, "acceptor thread panicked"))),
            None => Ok(()),
        }
    }
}

impl Drop for ServiceHandle {
    fn drop(&mut self) {
        if self.join_handle.is_some() {
            self.stopper.stop();
        }
    }
}
