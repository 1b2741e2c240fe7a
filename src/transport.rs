//! Abstract bidirectional byte transport and its two backends.
//!
//! The protocol engine only ever talks to the [`ByteTransport`]
//! trait; everything it needs to know about a real serial port or a
//! test fixture is behind this seam.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use log::*;

use crate::error::{Error, Result};

/// Default baud rate for a Davis Vantage console.
pub const DEFAULT_BAUD_RATE: u32 = 19200;

/// A cross-thread "abandon the current wait" signal, independent of the
/// transport's own open/closed state. A [`crate::realtime::RealtimeContainer`]
/// keeps one of these per supervised device and flips it from the
/// caller's thread when `close()` is invoked, so a blocked
/// `wait_for_buffer` call wakes up promptly instead of running out its
/// full deadline.
#[derive(Debug, Default, Clone)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Signal any in-flight or future `wait_for_buffer` call on this
    /// token to abandon its wait.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Abstraction of a serial port. Single-owner: concurrent writes from
/// two threads are undefined behavior at the protocol level (the
/// console cannot multiplex), even though implementations are `Send`.
pub trait ByteTransport: Send {
    /// Open the underlying connection. Idempotent.
    fn open(&mut self) -> Result<()>;

    /// Close the underlying connection. Idempotent; closing an
    /// already-closed transport is a no-op.
    fn close(&mut self);

    fn is_open(&self) -> bool;

    /// Write `bytes` to the transport.
    fn write(&mut self, bytes: &[u8]) -> Result<()>;

    /// Return whatever bytes are currently buffered. May be empty.
    fn read(&mut self) -> Vec<u8>;

    /// Block until at least one byte is available, `deadline` elapses,
    /// or `cancel` is signaled.
    fn wait_for_buffer(&mut self, deadline: Duration, cancel: &CancelToken) -> Result<Vec<u8>> {
        let start = Instant::now();
        loop {
            let buf = self.read();
            if !buf.is_empty() {
                return Ok(buf);
            }
            if !self.is_open() || cancel.is_cancelled() {
                return Err(Error::ClosedConnection);
            }
            if start.elapsed() >= deadline {
                return Err(Error::Timeout);
            }
            std::thread::sleep(Duration::from_millis(5));
        }
    }
}

/// In-memory transport used by the test harness and property tests.
/// Bytes "arrive" via [`MockTransport::push_inbound`] from the test
/// driving thread; no actual I/O occurs.
///
/// Cloning shares the same underlying queues (`Arc`-backed), so a test
/// can keep a handle after moving one clone into a [`crate::device::Device`]
/// that is in turn handed off to a background thread (e.g. a
/// [`crate::realtime::RealtimeContainer`]), and keep feeding it bytes
/// from the driving thread.
#[derive(Debug, Default, Clone)]
pub struct MockTransport {
    open: Arc<AtomicBool>,
    inbound: Arc<Mutex<VecDeque<u8>>>,
    written: Arc<Mutex<Vec<Vec<u8>>>>,
    fail_writes: Arc<AtomicBool>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue bytes to be returned by the next `read()`/`wait_for_buffer`.
    pub fn push_inbound(&self, bytes: &[u8]) {
        self.inbound.lock().unwrap().extend(bytes.iter().copied());
    }

    /// Make the next `write()` call fail with `FailedToWrite`, as if the
    /// OS serial port had gone away.
    pub fn fail_next_write(&self) {
        self.fail_writes.store(true, Ordering::SeqCst);
    }

    /// Snapshot of everything written so far.
    pub fn written(&self) -> Vec<Vec<u8>> {
        self.written.lock().unwrap().clone()
    }
}

impl ByteTransport for MockTransport {
    fn open(&mut self) -> Result<()> {
        self.open.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn close(&mut self) {
        self.open.store(false, Ordering::SeqCst);
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn write(&mut self, bytes: &[u8]) -> Result<()> {
        if !self.is_open() {
            return Err(Error::ClosedConnection);
        }
        if self.fail_writes.swap(false, Ordering::SeqCst) {
            return Err(Error::FailedToWrite(std::io::Error::other("mock write failure")));
        }
        trace!("mock transport write: {bytes:02x?}");
        self.written.lock().unwrap().push(bytes.to_vec());
        Ok(())
    }

    fn read(&mut self) -> Vec<u8> {
        let mut inbound = self.inbound.lock().unwrap();
        if inbound.is_empty() {
            return Vec::new();
        }
        inbound.drain(..).collect()
    }
}

/// Real serial-port backed transport, behind the `serial` feature since
/// the concrete OS serial driver is an external collaborator; this is a
/// thin adapter over the `serialport` crate.
#[cfg(feature = "serial")]
pub struct SerialTransport {
    path: String,
    baud_rate: u32,
    port: Option<Box<dyn serialport::SerialPort>>,
}

#[cfg(feature = "serial")]
impl SerialTransport {
    pub fn new(path: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            path: path.into(),
            baud_rate,
            port: None,
        }
    }
}

#[cfg(feature = "serial")]
impl ByteTransport for SerialTransport {
    fn open(&mut self) -> Result<()> {
        if self.port.is_some() {
            return Ok(());
        }
        info!("opening serial port {} at {} baud", self.path, self.baud_rate);
        let port = serialport::new(&self.path, self.baud_rate)
            .timeout(Duration::from_millis(50))
            .open()
            .map_err(|e| Error::SerialConnectionError(std::io::Error::other(e)))?;
        self.port = Some(port);
        Ok(())
    }

    fn close(&mut self) {
        if self.port.take().is_some() {
            info!("closed serial port {}", self.path);
        }
    }

    fn is_open(&self) -> bool {
        self.port.is_some()
    }

    fn write(&mut self, bytes: &[u8]) -> Result<()> {
        let port = self.port.as_mut().ok_or(Error::ClosedConnection)?;
        trace!("serial write: {bytes:02x?}");
        std::io::Write::write_all(port, bytes).map_err(Error::FailedToWrite)
    }

    fn read(&mut self) -> Vec<u8> {
        let Some(port) = self.port.as_mut() else {
            return Vec::new();
        };
        let available = port.bytes_to_read().unwrap_or(0) as usize;
        if available == 0 {
            return Vec::new();
        }
        let mut buf = vec![0u8; available];
        match std::io::Read::read(port, &mut buf) {
            Ok(n) => {
                buf.truncate(n);
                trace!("serial read: {buf:02x?}");
                buf
            }
            Err(_) => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mock_transport_queues_inbound_bytes() {
        let mut t = MockTransport::new();
        t.open().unwrap();
        t.push_inbound(&[0x0A, 0x0D]);
        assert_eq!(t.read(), vec![0x0A, 0x0D]);
        assert_eq!(t.read(), Vec::<u8>::new());
    }

    #[test]
    fn write_fails_when_closed() {
        let mut t = MockTransport::new();
        assert!(matches!(t.write(b"x"), Err(Error::ClosedConnection)));
    }

    #[test]
    fn wait_for_buffer_times_out() {
        let mut t = MockTransport::new();
        t.open().unwrap();
        let result = t.wait_for_buffer(Duration::from_millis(20), &CancelToken::new());
        assert!(matches!(result, Err(Error::Timeout)));
    }

    #[test]
    fn wait_for_buffer_returns_inbound() {
        let mut t = MockTransport::new();
        t.open().unwrap();
        t.push_inbound(b"hi");
        let result = t.wait_for_buffer(Duration::from_millis(20), &CancelToken::new()).unwrap();
        assert_eq!(result, b"hi");
    }

    #[test]
    fn wait_for_buffer_observes_cancellation_before_deadline() {
        let mut t = MockTransport::new();
        t.open().unwrap();
        let cancel = CancelToken::new();
        cancel.cancel();
        let start = Instant::now();
        let result = t.wait_for_buffer(Duration::from_secs(5), &cancel);
        assert!(matches!(result, Err(Error::ClosedConnection)));
        assert!(start.elapsed() < Duration::from_millis(500));
    }

    #[test]
    fn close_is_idempotent() {
        let mut t = MockTransport::new();
        t.close();
        t.close();
        assert!(!t.is_open());
    }
}
