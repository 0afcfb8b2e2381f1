//! Error taxonomy for the crate.
//!
//! Programmer errors on the [`RwLock`](crate::rwlock::RwLock) are distinguished from the
//! I/O-flavored errors the acceptor side produces, matching the error table in the
//! design notes: the former are caller bugs and propagate unchanged, the latter only
//! ever terminate a single connection.

use std::fmt;
use std::net::SocketAddr;

use thiserror::Error;

/// Programmer errors raised by [`RwLock`](crate::rwlock::RwLock).
///
/// Both variants indicate a bug in the calling code, not a transient condition. They
/// are never retried and never silently ignored.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RwLockError {
    /// A shared holder asked for the exclusive lock. Promotion would deadlock in the
    /// presence of other shared holders, so it is refused instead.
    #[error("cannot promote a shared hold to exclusive on the same thread")]
    PromotionForbidden,

    /// `release` was called by a thread that does not currently hold the lock.
    #[error("release called by a thread that does not hold the lock")]
    NotHeld,
}

/// A bounded, loggable preview of bytes that failed to match any detector.
///
/// Keeps `Debug`/`Display` output short even for a misbehaving client that sends
/// binary garbage.
pub struct HexPreview<'a>(pub &'a [u8]);

impl fmt::Display for HexPreview<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const MAX: usize = 32;
        for byte in self.0.iter().take(MAX) {
            write!(f, "{byte:02x}")?;
        }
        if self.0.len() > MAX {
            write!(f, "...")?;
        }
        Ok(())
    }
}

/// Per-connection outcomes on the acceptor side.
///
/// These never propagate out of the reactor; they only ever terminate the one
/// connection that produced them. They exist as a typed record for logging, not as a
/// control-flow error callers are expected to match on.
#[derive(Debug, Error)]
pub enum AcceptorError {
    /// A hard socket error occurred during accept, handshake, or peek.
    #[error("socket error from {peer:?}: {source}")]
    Io {
        peer: Option<SocketAddr>,
        #[source]
        source: std::io::Error,
    },

    /// The handshake or detection deadline elapsed before completion.
    #[error("deadline exceeded from {peer:?}")]
    Timeout { peer: Option<SocketAddr> },

    /// A full `required_peek_size` peek matched no registered detector.
    #[error("no detector matched prefix from {peer:?}: {preview}")]
    NoMatch { peer: Option<SocketAddr>, preview: String },

    /// The TLS handshake failed.
    #[error("TLS handshake failed from {peer:?}: {source}")]
    Tls {
        peer: Option<SocketAddr>,
        #[source]
        source: rustls::Error,
    },
}
