//! The protocol plug-in contract.
//!
//! Grounded in `examples/original_source/vdsm/protocoldetector.py`'s detector
//! interface (`NAME`, `REQUIRED_SIZE`, `detect`, `handle_dispatcher`), translated to a
//! trait so registered detectors are `Box<dyn Detector>` the way the teacher expresses
//! its own handler contracts as traits (`Connection`, `TcpStream`, `TcpListener`)
//! rather than loose closures.

use std::io::{Read, Write};
use std::net::SocketAddr;

/// A connection handed off to a detector: whatever was accepted, possibly after a TLS
/// handshake, with its internal plaintext-vs-ciphertext machinery erased. The
/// detector and its downstream handler only need to read and write bytes.
pub trait ReadWrite: Read + Write + Send {}
impl<T: Read + Write + Send> ReadWrite for T {}

/// A registered protocol recognizer.
///
/// `matches` must be a pure function of the prefix: it must not depend on external
/// state, and it sees exactly `required_bytes()` bytes, no more, no less. The first
/// registered detector whose `matches` returns true wins; this is a strict
/// first-match contract, not longest-match or scoring.
pub trait Detector: Send + Sync {
    /// Identifier used in logs.
    fn name(&self) -> &str;

    /// How many initial bytes this detector needs to recognize its protocol.
    fn required_bytes(&self) -> usize;

    /// Tests whether `prefix` (exactly `required_bytes()` long) matches this
    /// protocol.
    fn matches(&self, prefix: &[u8]) -> bool;

    /// Takes ownership of the connection. The bytes read so far by the detector
    /// (including the matched prefix) are still readable from `connection` starting
    /// at offset 0; nothing was consumed. The detector is responsible for the
    /// connection's eventual close.
    fn handoff(&self, connection: Box<dyn ReadWrite>, peer: SocketAddr);
}
