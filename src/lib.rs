//! `portcullis` provides two pieces of network-service infrastructure that are useful
//! together but independent:
//!
//! - [`rwlock`]: a fair, recursive, demotable readers-writer lock, for state that is
//!   read far more often than it's written and where writer starvation is not
//!   acceptable.
//! - [`service`]: a single-port TCP acceptor that optionally terminates TLS, then
//!   sniffs each connection's opening bytes to decide which of several registered
//!   protocol handlers should own it.
//!
//! The acceptor is built on a single-threaded, `mio`-driven cooperative reactor
//! ([`reactor`]) in the same style as the teacher's own listener: one thread, one
//! `Poll`, a `Slab` of registered handles, no async runtime.

pub mod acceptor;
pub mod connection;
pub mod deadline;
pub mod detector;
pub mod error;
pub mod net;
pub mod reactor;
pub mod rwlock;
pub mod service;

pub use detector::Detector;
pub use error::{AcceptorError, RwLockError};
pub use rwlock::RwLock;
pub use service::{MultiProtocolAcceptor, ServiceHandle};
