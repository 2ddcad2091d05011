//! Shared fixtures for the pool integration tests.

#![allow(dead_code)]

use std::io::{Read, Write};
use std::net::TcpListener;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;

use nodepool::{ConnectionFactory, DialError, Transport};

static TRACING_INIT: Once = Once::new();

/// Route pool logs to the test output, filtered by `RUST_LOG`.
pub fn init_tracing() {
    TRACING_INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init()
            .ok();
    });
}

/// In-memory socket. `open` flips to false when the pool closes it.
#[derive(Debug)]
pub struct FakeSocket {
    open: Arc<AtomicBool>,
}

impl Transport for FakeSocket {
    fn send(&mut self, data: &[u8]) -> std::io::Result<usize> {
        Ok(data.len())
    }

    fn recv(&mut self, _max_bytes: usize) -> std::io::Result<Vec<u8>> {
        Ok(Vec::new())
    }

    fn close(&mut self) -> std::io::Result<()> {
        self.open.store(false, Ordering::SeqCst);
        Ok(())
    }
}

/// Factory handing out [`FakeSocket`]s and remembering each one's open flag.
#[derive(Debug, Default)]
pub struct FakeFactory {
    dials: AtomicU64,
    sockets: Mutex<Vec<Arc<AtomicBool>>>,
}

impl FakeFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn dials(&self) -> u64 {
        self.dials.load(Ordering::SeqCst)
    }

    pub fn open_sockets(&self) -> usize {
        self.sockets
            .lock()
            .unwrap()
            .iter()
            .filter(|open| open.load(Ordering::SeqCst))
            .count()
    }
}

impl ConnectionFactory for FakeFactory {
    fn dial(&self, _address: &str, _timeout: Duration) -> Result<Box<dyn Transport>, DialError> {
        self.dials.fetch_add(1, Ordering::SeqCst);
        let open = Arc::new(AtomicBool::new(true));
        self.sockets.lock().unwrap().push(Arc::clone(&open));
        Ok(Box::new(FakeSocket { open }))
    }
}

/// Start a TCP echo server in a background thread. Returns its address.
pub fn start_echo_server() -> std::net::SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind to random port");
    let addr = listener.local_addr().expect("local addr");
    std::thread::spawn(move || {
        while let Ok((mut stream, _)) = listener.accept() {
            std::thread::spawn(move || {
                let mut buf = [0u8; 4096];
                loop {
                    match stream.read(&mut buf) {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if stream.write_all(&buf[..n]).is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }
    });
    addr
}
