//! Integration tests for [`MultiProtocolAcceptor`], driven against real loopback
//! sockets the way the teacher's `TcpListener`/`TcpStream` trait split was built to
//! support (see `src/net/*.rs`): scenarios S5 and S6 from the design notes.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use portcullis::detector::{Detector, ReadWrite};
use portcullis::service::MultiProtocolAcceptor;

struct RecordingDetector {
    label: &'static str,
    required: usize,
    prefix: &'static [u8],
    handed_off: Arc<Mutex<Vec<(&'static str, Vec<u8>)>>>,
}

impl Detector for RecordingDetector {
    fn name(&self) -> &str {
        self.label
    }

    fn required_bytes(&self) -> usize {
        self.required
    }

    fn matches(&self, prefix: &[u8]) -> bool {
        prefix == self.prefix
    }

    fn handoff(&self, mut connection: Box<dyn ReadWrite>, _peer: SocketAddr) {
        let handed_off = self.handed_off.clone();
        let label = self.label;
        std::thread::spawn(move || {
            let deadline = Instant::now() + Duration::from_secs(2);
            let mut buf = Vec::new();
            let mut chunk = [0u8; 256];
            while Instant::now() < deadline {
                match connection.read(&mut chunk) {
                    Ok(0) => break,
                    Ok(n) => {
                        buf.extend_from_slice(&chunk[..n]);
                        break;
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                        std::thread::sleep(Duration::from_millis(10));
                    }
                    Err(_) => break,
                }
            }
            handed_off.lock().unwrap().push((label, buf));
        });
    }
}

#[test]
fn protocol_sniff_plaintext_dispatches_to_matching_detector() {
    let handed_off = Arc::new(Mutex::new(Vec::new()));

    let mut acceptor = MultiProtocolAcceptor::new("127.0.0.1", 0, None)
        .with_handshake_timeout(Duration::from_secs(2));
    acceptor.add_detector(Box::new(RecordingDetector {
        label: "ping",
        required: 4,
        prefix: b"PING",
        handed_off: handed_off.clone(),
    }));
    acceptor.add_detector(Box::new(RecordingDetector {
        label: "xhttp",
        required: 6,
        prefix: b"XHTTP\n",
        handed_off: handed_off.clone(),
    }));

    let service = acceptor.spawn().expect("spawn acceptor");
    let addr = service.local_addr();

    let mut client = TcpStream::connect(addr).expect("connect");
    client.write_all(b"PING hello").expect("write");
    client.flush().expect("flush");

    let deadline = Instant::now() + Duration::from_secs(2);
    loop {
        if !handed_off.lock().unwrap().is_empty() {
            break;
        }
        assert!(Instant::now() < deadline, "detector never received the connection");
        std::thread::sleep(Duration::from_millis(10));
    }

    let results = handed_off.lock().unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].0, "ping");
    assert_eq!(&results[0].1, b"PING hello");

    drop(client);
    service.stop().expect("stop acceptor");
}

#[test]
fn no_match_before_timeout_closes_without_handoff() {
    let handed_off = Arc::new(Mutex::new(Vec::new()));

    let mut acceptor = MultiProtocolAcceptor::new("127.0.0.1", 0, None)
        .with_handshake_timeout(Duration::from_millis(200));
    acceptor.add_detector(Box::new(RecordingDetector {
        label: "ping",
        required: 4,
        prefix: b"PING",
        handed_off: handed_off.clone(),
    }));

    let service = acceptor.spawn().expect("spawn acceptor");
    let addr = service.local_addr();

    let client = TcpStream::connect(addr).expect("connect");

    std::thread::sleep(Duration::from_millis(500));

    assert!(handed_off.lock().unwrap().is_empty());
    drop(client);
    service.stop().expect("stop acceptor");
}
