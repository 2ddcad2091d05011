//! Mock transport and factory shared by the unit tests.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;

use crate::connection::{ConnectionFactory, Transport};
use crate::error::DialError;

/// Observable state of one mock socket, kept by the test after the transport moves.
#[derive(Debug, Default)]
pub struct MockState {
    closed: AtomicBool,
    close_calls: AtomicUsize,
    fail_io: AtomicBool,
    fail_close: AtomicBool,
}

impl MockState {
    pub fn is_open(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
    }

    pub fn close_calls(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }

    pub fn fail_io(&self) {
        self.fail_io.store(true, Ordering::SeqCst);
    }

    pub fn fail_close(&self) {
        self.fail_close.store(true, Ordering::SeqCst);
    }
}

#[derive(Debug)]
pub struct MockTransport {
    state: Arc<MockState>,
    last_sent: Vec<u8>,
}

impl MockTransport {
    pub fn new() -> (Self, Arc<MockState>) {
        let state = Arc::new(MockState::default());
        (
            Self {
                state: Arc::clone(&state),
                last_sent: Vec::new(),
            },
            state,
        )
    }
}

impl Transport for MockTransport {
    fn send(&mut self, data: &[u8]) -> std::io::Result<usize> {
        if self.state.fail_io.load(Ordering::SeqCst) {
            return Err(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "broken pipe"));
        }
        self.last_sent = data.to_vec();
        Ok(data.len())
    }

    fn recv(&mut self, max_bytes: usize) -> std::io::Result<Vec<u8>> {
        if self.state.fail_io.load(Ordering::SeqCst) {
            return Err(std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset"));
        }
        let n = self.last_sent.len().min(max_bytes);
        Ok(self.last_sent[..n].to_vec())
    }

    fn close(&mut self) -> std::io::Result<()> {
        self.state.closed.store(true, Ordering::SeqCst);
        self.state.close_calls.fetch_add(1, Ordering::SeqCst);
        if self.state.fail_close.load(Ordering::SeqCst) {
            return Err(std::io::Error::new(std::io::ErrorKind::NotConnected, "not connected"));
        }
        Ok(())
    }
}

/// Factory that records every transport it hands out.
#[derive(Debug, Default)]
pub struct MockFactory {
    dials: AtomicU64,
    should_fail: AtomicBool,
    latency_ms: AtomicU64,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    created: Mutex<Vec<Arc<MockState>>>,
}

impl MockFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn dials(&self) -> u64 {
        self.dials.load(Ordering::SeqCst)
    }

    pub fn set_fail(&self, fail: bool) {
        self.should_fail.store(fail, Ordering::SeqCst);
    }

    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    /// Sockets dialed so far, in dial order.
    pub fn created(&self) -> Vec<Arc<MockState>> {
        self.created.lock().clone()
    }

    /// Most dials that were ever running at the same time.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn open_count(&self) -> usize {
        self.created.lock().iter().filter(|s| s.is_open()).count()
    }
}

impl ConnectionFactory for MockFactory {
    fn dial(&self, _address: &str, _timeout: Duration) -> Result<Box<dyn Transport>, DialError> {
        let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(running, Ordering::SeqCst);
        let latency = self.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            std::thread::sleep(Duration::from_millis(latency));
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        if self.should_fail.load(Ordering::SeqCst) {
            return Err(DialError::Connect {
                address: "mock".to_string(),
                source: std::io::Error::new(
                    std::io::ErrorKind::ConnectionRefused,
                    "connection refused",
                ),
            });
        }
        self.dials.fetch_add(1, Ordering::SeqCst);
        let (transport, state) = MockTransport::new();
        self.created.lock().push(state);
        Ok(Box::new(transport))
    }
}
