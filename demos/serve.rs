//! A small demonstration wiring the acceptor and the lock together: two toy
//! protocols sharing one `RwLock`-protected counter, dispatched off one port.
//!
//! Grounded in the teacher's `examples/example_server.rs` (bind, spawn, join), adapted
//! to the single reactor thread this crate's acceptor owns internally.

use std::io::{Read, Write};
use std::net::SocketAddr;
use std::sync::Arc;

use portcullis::detector::{Detector, ReadWrite};
use portcullis::service::MultiProtocolAcceptor;
use portcullis::RwLock;

/// Answers `PING\n` with `PONG\n`, bumping a shared hit counter under the shared lock.
struct PingDetector {
    hits: Arc<RwLock>,
    count: Arc<std::sync::atomic::AtomicUsize>,
}

impl Detector for PingDetector {
    fn name(&self) -> &str {
        "ping"
    }

    fn required_bytes(&self) -> usize {
        5
    }

    fn matches(&self, prefix: &[u8]) -> bool {
        prefix == b"PING\n"
    }

    fn handoff(&self, mut connection: Box<dyn ReadWrite>, peer: SocketAddr) {
        let hits = self.hits.clone();
        let count = self.count.clone();
        std::thread::spawn(move || {
            let mut buf = [0u8; 64];
            if connection.read(&mut buf).is_ok() {
                hits.with_shared(|| {
                    count.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                });
                let _ = connection.write_all(b"PONG\n");
            }
            log::info!("ping handler done for {peer}");
        });
    }
}

/// Answers `STATS\n` with the current hit count, read under the shared lock.
struct StatsDetector {
    hits: Arc<RwLock>,
    count: Arc<std::sync::atomic::AtomicUsize>,
}

impl Detector for StatsDetector {
    fn name(&self) -> &str {
        "stats"
    }

    fn required_bytes(&self) -> usize {
        6
    }

    fn matches(&self, prefix: &[u8]) -> bool {
        prefix == b"STATS\n"
    }

    fn handoff(&self, mut connection: Box<dyn ReadWrite>, peer: SocketAddr) {
        let hits = self.hits.clone();
        let count = self.count.clone();
        std::thread::spawn(move || {
            let mut buf = [0u8; 64];
            if connection.read(&mut buf).is_ok() {
                let snapshot =
                    hits.with_shared(|| count.load(std::sync::atomic::Ordering::Relaxed));
                let _ = connection.write_all(format!("{snapshot}\n").as_bytes());
            }
            log::info!("stats handler done for {peer}");
        });
    }
}

fn main() -> std::io::Result<()> {
    env_logger::init();

    let hits = Arc::new(RwLock::new());
    let count = Arc::new(std::sync::atomic::AtomicUsize::new(0));

    let mut acceptor = MultiProtocolAcceptor::new("127.0.0.1", 8080, None);
    acceptor.add_detector(Box::new(PingDetector {
        hits: hits.clone(),
        count: count.clone(),
    }));
    acceptor.add_detector(Box::new(StatsDetector { hits, count }));

    acceptor.serve_forever()
}
