//! The per-connection handle: `Accepted → (Handshaking) → Detecting → HandedOff | Closed`.
//!
//! Grounded in the teacher's `ConnectionType<S>` / `TlsConnection<S>`
//! (`examples/ryanseipp-rask-old/src/connection.rs`) for the TLS read/write pumping, and in
//! `examples/original_source/vdsm/protocoldetector.py`'s `_ProtocolDetector.handle_read` for the
//! detection control flow. Per the design notes, the behavioral transition from
//! handshaking to detecting is modeled as a tagged variant with a `switch_to_detecting`
//! operation, not as a swapped trait object: the same `ConnectionHandle`, socket, and
//! reactor registration persist across the transition.

use std::io::{self, Cursor, ErrorKind, Read, Write};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use mio::event::Source;
use rustls::ServerConnection;

use crate::deadline::Deadline;
use crate::detector::Detector;
use crate::error::{AcceptorError, HexPreview};
use crate::net::tcp_stream::TcpStream;
use crate::reactor::{Handle, HandleResult};

/// Pumps ciphertext from the socket into the TLS state machine without blocking.
/// Mirrors the teacher's `TlsConnection::read_tls`.
fn pump_tls_read<S: Read>(tls: &mut ServerConnection, stream: &mut S) -> io::Result<usize> {
    let mut total = 0;
    loop {
        match tls.read_tls(stream) {
            Ok(0) => return Ok(total),
            Ok(n) => total += n,
            Err(e) => match e.kind() {
                ErrorKind::WouldBlock => {
                    if total == 0 {
                        return Err(e);
                    }
                    return Ok(total);
                }
                ErrorKind::Interrupted => {}
                _ => return Err(e),
            },
        }
    }
}

/// A connection handed off to a detector's protocol handler, after a TLS handshake.
///
/// Because TLS application data is encrypted on the wire, the detector cannot use
/// `MSG_PEEK` to sniff it the way it can a plaintext connection. Instead, the
/// already-decrypted prefix bytes read during detection are buffered here and
/// replayed first; the handler still sees the connection's plaintext starting at
/// offset 0, it's just backed by a small in-memory prefix instead of the socket.
struct SniffedTlsStream<S> {
    prefix: Cursor<Vec<u8>>,
    tls: Box<ServerConnection>,
    stream: S,
}

impl<S: Read + Write> Read for SniffedTlsStream<S> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if (self.prefix.position() as usize) < self.prefix.get_ref().len() {
            let n = self.prefix.read(buf)?;
            if n > 0 {
                return Ok(n);
            }
        }
        loop {
            match self.tls.reader().read(buf) {
                Ok(0) => match pump_tls_read(&mut self.tls, &mut self.stream) {
                    Ok(0) => return Ok(0),
                    Ok(_) => {
                        self.tls
                            .process_new_packets()
                            .map_err(|e| io::Error::new(ErrorKind::InvalidData, e))?;
                    }
                    Err(e) => return Err(e),
                },
                other => return other,
            }
        }
    }
}

impl<S: Read + Write> Write for SniffedTlsStream<S> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.tls.writer().write(buf)?;
        self.tls.write_tls(&mut self.stream)?;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.tls.write_tls(&mut self.stream)?;
        Ok(())
    }
}

enum Phase<S> {
    Handshaking {
        stream: S,
        tls: Box<ServerConnection>,
        deadline: Deadline,
    },
    Detecting {
        stream: S,
        tls: Option<Box<ServerConnection>>,
        /// Decrypted bytes already drained from the TLS layer while probing for a
        /// match. Empty and unused on plaintext connections, which peek the raw
        /// socket instead and never consume anything.
        decrypted_prefix: Vec<u8>,
        deadline: Deadline,
    },
}

/// One accepted connection, progressing through the handshake/detection state
/// machine described in the data model.
pub struct ConnectionHandle<S> {
    peer: SocketAddr,
    phase: Option<Phase<S>>,
    detectors: Arc<Vec<Box<dyn Detector>>>,
    required_peek_size: usize,
}

impl<S> ConnectionHandle<S>
where
    S: TcpStream + Read + Write + Source + Send + 'static,
{
    /// Starts a plaintext connection directly in the detecting phase.
    pub fn plain(
        stream: S,
        peer: SocketAddr,
        detectors: Arc<Vec<Box<dyn Detector>>>,
        required_peek_size: usize,
        deadline: Deadline,
    ) -> Self {
        Self {
            peer,
            phase: Some(Phase::Detecting {
                stream,
                tls: None,
                decrypted_prefix: Vec::new(),
                deadline,
            }),
            detectors,
            required_peek_size,
        }
    }

    /// Starts a connection that must complete a TLS handshake before detection.
    pub fn tls(
        stream: S,
        peer: SocketAddr,
        tls: ServerConnection,
        detectors: Arc<Vec<Box<dyn Detector>>>,
        required_peek_size: usize,
        deadline: Deadline,
    ) -> Self {
        Self {
            peer,
            phase: Some(Phase::Handshaking {
                stream,
                tls: Box::new(tls),
                deadline,
            }),
            detectors,
            required_peek_size,
        }
    }

    fn phase_mut(&mut self) -> &mut Phase<S> {
        self.phase.as_mut().expect("phase is always present between calls")
    }

    fn deadline(&self) -> Deadline {
        match self.phase.as_ref().expect("phase is always present between calls") {
            Phase::Handshaking { deadline, .. } | Phase::Detecting { deadline, .. } => *deadline,
        }
    }

    /// Replaces the handshake phase with the detecting phase, keeping the same
    /// socket and deadline, the `switch_implementation` from the design notes.
    fn switch_to_detecting(&mut self) {
        let old = self.phase.take().expect("phase is always present between calls");
        self.phase = Some(match old {
            Phase::Handshaking { stream, tls, deadline } => Phase::Detecting {
                stream,
                tls: Some(tls),
                decrypted_prefix: Vec::with_capacity(self.required_peek_size),
                deadline,
            },
            detecting => detecting,
        });
    }

    fn handshake_step(&mut self) -> HandleResult {
        let Phase::Handshaking { stream, tls, .. } = self.phase_mut() else {
            unreachable!("handshake_step called outside handshaking phase")
        };

        match pump_tls_read(tls, stream) {
            Ok(0) => {
                log::warn!("connection closed mid-handshake from {}", self.peer);
                return HandleResult::close();
            }
            Ok(_) => {}
            Err(e) if e.kind() == ErrorKind::WouldBlock => return HandleResult::continue_(),
            Err(e) => {
                log::warn!(
                    "{}",
                    AcceptorError::Io {
                        peer: Some(self.peer),
                        source: e
                    }
                );
                return HandleResult::close();
            }
        }

        if let Err(e) = tls.process_new_packets() {
            log::warn!(
                "{}",
                AcceptorError::Tls {
                    peer: Some(self.peer),
                    source: e
                }
            );
            return HandleResult::close();
        }

        if tls.is_handshaking() {
            return HandleResult::continue_();
        }

        self.switch_to_detecting();
        self.detect_step()
    }

    fn detect_step(&mut self) -> HandleResult {
        let required = self.required_peek_size;
        let prefix: Vec<u8> = {
            let Phase::Detecting {
                stream,
                tls,
                decrypted_prefix,
                ..
            } = self.phase_mut()
            else {
                unreachable!("detect_step called outside detecting phase")
            };

            match tls {
                None => {
                    let mut buf = vec![0u8; required];
                    match stream.peek(&mut buf) {
                        Ok(n) if n >= required => buf,
                        Ok(_) => return HandleResult::continue_(),
                        Err(e) if e.kind() == ErrorKind::WouldBlock => {
                            return HandleResult::continue_()
                        }
                        Err(e) => {
                            log::warn!("socket error while peeking from {}: {e}", self.peer);
                            return HandleResult::close();
                        }
                    }
                }
                Some(tls_conn) => {
                    match pump_tls_read(tls_conn, stream) {
                        Ok(_) => {}
                        Err(e) if e.kind() == ErrorKind::WouldBlock => {}
                        Err(e) => {
                            log::warn!("socket error while detecting from {}: {e}", self.peer);
                            return HandleResult::close();
                        }
                    }
                    if let Err(e) = tls_conn.process_new_packets() {
                        log::warn!("TLS error while detecting from {}: {e}", self.peer);
                        return HandleResult::close();
                    }
                    if decrypted_prefix.len() < required {
                        let want = required - decrypted_prefix.len();
                        let mut buf = vec![0u8; want];
                        match tls_conn.reader().read(&mut buf) {
                            Ok(n) => decrypted_prefix.extend_from_slice(&buf[..n]),
                            Err(e) if e.kind() == ErrorKind::WouldBlock => {}
                            Err(e) => {
                                log::warn!(
                                    "error reading decrypted data from {}: {e}",
                                    self.peer
                                );
                                return HandleResult::close();
                            }
                        }
                    }
                    if decrypted_prefix.len() < required {
                        return HandleResult::continue_();
                    }
                    decrypted_prefix.clone()
                }
            }
        };

        let winner = self
            .detectors
            .iter()
            .find(|d| prefix.len() >= d.required_bytes() && d.matches(&prefix[..d.required_bytes()]));

        let Some(detector) = winner else {
            log::warn!(
                "{}",
                AcceptorError::NoMatch {
                    peer: Some(self.peer),
                    preview: HexPreview(&prefix).to_string(),
                }
            );
            return HandleResult::close();
        };

        log::info!("detected protocol {} from {}", detector.name(), self.peer);

        let Phase::Detecting {
            stream,
            tls,
            decrypted_prefix,
            ..
        } = self.phase.take().expect("phase is always present between calls")
        else {
            unreachable!()
        };

        match tls {
            None => detector.handoff(Box::new(stream), self.peer),
            Some(tls_conn) => detector.handoff(
                Box::new(SniffedTlsStream {
                    prefix: Cursor::new(decrypted_prefix),
                    tls: tls_conn,
                    stream,
                }),
                self.peer,
            ),
        }

        HandleResult::handed_off()
    }
}

impl<S> Handle for ConnectionHandle<S>
where
    S: TcpStream + Read + Write + Source + Send + 'static,
{
    fn readable(&self) -> bool {
        true
    }

    fn writable(&self) -> bool {
        match self.phase.as_ref() {
            Some(Phase::Handshaking { tls, .. }) => tls.wants_write(),
            Some(Phase::Detecting { tls: Some(tls), .. }) => tls.wants_write(),
            _ => false,
        }
    }

    fn next_check_interval(&self) -> Option<Duration> {
        Some(self.deadline().remaining())
    }

    fn source(&mut self) -> &mut dyn Source {
        match self.phase_mut() {
            Phase::Handshaking { stream, .. } | Phase::Detecting { stream, .. } => stream,
        }
    }

    fn handle_read(&mut self) -> HandleResult {
        match self.phase.as_ref() {
            Some(Phase::Handshaking { .. }) => self.handshake_step(),
            Some(Phase::Detecting { .. }) => self.detect_step(),
            None => HandleResult::close(),
        }
    }

    fn handle_write(&mut self) -> HandleResult {
        match self.phase_mut() {
            Phase::Handshaking { stream, tls, .. } => match tls.write_tls(stream) {
                Ok(_) => HandleResult::continue_(),
                Err(e) if e.kind() == ErrorKind::WouldBlock => HandleResult::continue_(),
                Err(e) => {
                    log::warn!("socket error writing handshake bytes from {}: {e}", self.peer);
                    HandleResult::close()
                }
            },
            Phase::Detecting {
                stream,
                tls: Some(tls),
                ..
            } => match tls.write_tls(stream) {
                Ok(_) => HandleResult::continue_(),
                Err(e) if e.kind() == ErrorKind::WouldBlock => HandleResult::continue_(),
                Err(e) => {
                    log::warn!("socket error flushing TLS alert to {}: {e}", self.peer);
                    HandleResult::close()
                }
            },
            Phase::Detecting { tls: None, .. } => HandleResult::continue_(),
        }
    }

    fn handle_error(&mut self) -> HandleResult {
        log::warn!("socket error reported by reactor for {}", self.peer);
        HandleResult::close()
    }

    fn check_deadline(&mut self) -> HandleResult {
        if self.phase.is_none() || !self.deadline().has_elapsed() {
            return HandleResult::continue_();
        }
        log::debug!(
            "{}",
            AcceptorError::Timeout {
                peer: Some(self.peer)
            }
        );
        HandleResult::close()
    }
}
