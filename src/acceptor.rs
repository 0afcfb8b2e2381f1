//! The listening-socket handle: accepts connections and spawns
//! [`ConnectionHandle`](crate::connection::ConnectionHandle)s for the reactor to drive.
//!
//! Grounded in the teacher's `Listener::accept` (`examples/ryanseipp-rask-old/src/listener.rs`):
//! loop `accept()` until `WouldBlock`, registering one connection per iteration. Socket
//! construction (`SO_REUSEADDR`, a bounded backlog, close-on-exec) uses `socket2`, the
//! same crate `examples/hlieu5402-collab-spark2026`'s transport crates reach for when a
//! listener needs options `std`/`mio` don't expose directly.

use std::io::{self, ErrorKind, Read, Write};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use mio::event::Source;
use rustls::{ServerConfig, ServerConnection};
use socket2::{Domain, Socket, Type};

use crate::connection::ConnectionHandle;
use crate::deadline::Deadline;
use crate::detector::Detector;
use crate::net::tcp_listener::TcpListener;
use crate::net::tcp_stream::TcpStream;
use crate::reactor::{Handle, HandleResult};

/// Backlog depth for the listening socket.
const LISTEN_BACKLOG: i32 = 5;

/// Binds a `mio::net::TcpListener` with `SO_REUSEADDR` set and a bounded backlog, using
/// `socket2` for the options the standard constructors don't expose. `socket2` sockets
/// are created with close-on-exec set by the platform by default.
pub fn bind_reuseaddr(addr: SocketAddr) -> io::Result<mio::net::TcpListener> {
    let domain = if addr.is_ipv6() { Domain::IPV6 } else { Domain::IPV4 };
    let socket = Socket::new(domain, Type::STREAM, None)?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;
    mio::net::TcpListener::from_std(socket.into())
}

/// Per-socket parameters shared by every connection the acceptor spawns.
pub struct AcceptorConfig {
    pub tls: Option<Arc<ServerConfig>>,
    pub handshake_timeout: Duration,
    pub detectors: Arc<Vec<Box<dyn Detector>>>,
    pub required_peek_size: usize,
}

/// The reactor [`Handle`] for the listening socket.
pub struct AcceptorHandle<T, S> {
    listener: T,
    config: AcceptorConfig,
    _marker: std::marker::PhantomData<S>,
}

impl<T, S> AcceptorHandle<T, S>
where
    T: TcpListener<S> + Source + Send,
    S: TcpStream + Read + Write + Source + Send + 'static,
{
    pub fn new(listener: T, config: AcceptorConfig) -> Self {
        Self {
            listener,
            config,
            _marker: std::marker::PhantomData,
        }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }
}

impl<T, S> Handle for AcceptorHandle<T, S>
where
    T: TcpListener<S> + Source + Send,
    S: TcpStream + Read + Write + Source + Send + 'static,
{
    fn readable(&self) -> bool {
        true
    }

    fn source(&mut self) -> &mut dyn Source {
        &mut self.listener
    }

    fn handle_read(&mut self) -> HandleResult {
        let mut spawned: Vec<Box<dyn Handle>> = Vec::new();

        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    let deadline = Deadline::after(self.config.handshake_timeout);
                    let handle: Box<dyn Handle> = match &self.config.tls {
                        Some(tls_config) => {
                            match ServerConnection::new(tls_config.clone()) {
                                Ok(tls) => Box::new(ConnectionHandle::tls(
                                    stream,
                                    peer,
                                    tls,
                                    self.config.detectors.clone(),
                                    self.config.required_peek_size,
                                    deadline,
                                )),
                                Err(e) => {
                                    log::warn!("failed to start TLS session for {peer}: {e}");
                                    continue;
                                }
                            }
                        }
                        None => Box::new(ConnectionHandle::plain(
                            stream,
                            peer,
                            self.config.detectors.clone(),
                            self.config.required_peek_size,
                            deadline,
                        )),
                    };
                    spawned.push(handle);
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) => {
                    log::warn!("accept() failed: {e}");
                    break;
                }
            }
        }

        HandleResult::spawning(spawned)
    }

    fn handle_error(&mut self) -> HandleResult {
        log::warn!("listening socket reported an error");
        HandleResult::close()
    }
}
