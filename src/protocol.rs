//! Command/response exchange layer on top of [`ByteTransport`] and
//! [`crate::crc`].
//!
//! One outstanding command per device at a time: every public operation
//! here takes `&mut self`, which structurally rules out overlapping
//! writes to the half-duplex console link.

use std::time::Duration;

use chrono::NaiveDate;
use log::*;

use crate::crc;
use crate::error::{Error, Result};
use crate::transport::{ByteTransport, CancelToken};

/// Byte the console sends to positively acknowledge a command.
pub const ACK: u8 = 0x06;
/// Byte the console sends to negatively acknowledge a command.
pub const NAK: u8 = 0x15;
/// Byte the console sends to cancel an in-progress exchange.
pub const CANCEL: u8 = 0x18;

/// The console's firmware gained LOOP2 support on this date; consoles
/// with a firmware date after it answer `LPS 2 1`.
const LOOP2_CUTOFF: (i32, u32, u32) = (2002, 4, 24);

const WAKE_RETRIES: usize = 3;
const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(2);

/// Stateless request/response engine. Generic over the transport so
/// tests can drive it with [`crate::transport::MockTransport`] and
/// production code with [`crate::transport::SerialTransport`].
pub struct ProtocolEngine<T: ByteTransport> {
    transport: T,
    read_timeout: Duration,
    cancel: CancelToken,
}

impl<T: ByteTransport> ProtocolEngine<T> {
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            read_timeout: DEFAULT_READ_TIMEOUT,
            cancel: CancelToken::new(),
        }
    }

    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// A clone of this engine's cancellation signal. A caller that is
    /// about to hand the engine off to a background thread can keep
    /// this clone and call [`CancelToken::cancel`] on it to interrupt
    /// an in-flight read wait from outside that thread.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn open(&mut self) -> Result<()> {
        self.transport.open()
    }

    pub fn close(&mut self) {
        self.transport.close();
    }

    pub fn is_open(&self) -> bool {
        self.transport.is_open()
    }

    fn guard_open(&self) -> Result<()> {
        if !self.transport.is_open() {
            return Err(Error::ClosedConnection);
        }
        Ok(())
    }

    fn send(&mut self, command: &str) -> Result<()> {
        self.guard_open()?;
        debug!("-> {}", command.trim_end());
        self.transport.write(command.as_bytes())
    }

    /// Send `"\n"` and wait for the sleepy-wake sentinel `0x0A 0x0D`,
    /// retrying up to `WAKE_RETRIES` times.
    pub fn wake_up(&mut self) -> Result<()> {
        self.guard_open()?;
        for attempt in 1..=WAKE_RETRIES {
            debug!("wake-up attempt {attempt}/{WAKE_RETRIES}");
            self.transport.write(b"\n")?;
            match self.transport.wait_for_buffer(self.read_timeout, &self.cancel) {
                Ok(buf) if buf == [0x0A, 0x0D] => {
                    info!("console woke up after {attempt} attempt(s)");
                    return Ok(());
                }
                Ok(other) => {
                    warn!("unexpected wake-up reply: {other:02x?}");
                }
                Err(Error::Timeout) => {
                    warn!("wake-up attempt {attempt} timed out");
                }
                Err(e) => return Err(e),
            }
            std::thread::sleep(Duration::from_millis(100));
        }
        error!("console did not wake after {WAKE_RETRIES} attempts");
        Err(Error::FailedToSendCommand("wake-up sentinel not received".into()))
    }

    pub fn validate_connection(&mut self) -> Result<()> {
        self.send("TEST\n")?;
        let reply = self.transport.wait_for_buffer(self.read_timeout, &self.cancel)?;
        if reply.len() >= 6 && &reply[2..6] == b"TEST" {
            Ok(())
        } else {
            Err(Error::FailedToSendCommand(format!(
                "unexpected TEST reply: {reply:02x?}"
            )))
        }
    }

    fn text_after_ok(&mut self, command: &str) -> Result<String> {
        self.send(command)?;
        let reply = self.transport.wait_for_buffer(self.read_timeout, &self.cancel)?;
        let text = String::from_utf8_lossy(&reply);
        let after = text
            .find("OK")
            .map(|idx| &text[idx + 2..])
            .ok_or_else(|| Error::MalformedData(format!("no OK marker in reply: {text:?}")))?;
        Ok(after.trim().to_string())
    }

    pub fn firmware_date_code(&mut self) -> Result<String> {
        self.text_after_ok("VER\n")
    }

    pub fn firmware_version(&mut self) -> Result<String> {
        self.text_after_ok("NVER\n").map(|v| format!("v{v}"))
    }

    /// Parse [`Self::firmware_date_code`] and compare against the LOOP2
    /// cutoff date.
    pub fn supports_loop2(&mut self) -> Result<bool> {
        let raw = self.firmware_date_code()?;
        let date = parse_firmware_date(&raw)
            .ok_or_else(|| Error::MalformedData(format!("unparseable firmware date: {raw:?}")))?;
        let (y, m, d) = LOOP2_CUTOFF;
        Ok(date > NaiveDate::from_ymd_opt(y, m, d).unwrap())
    }

    /// Read one ACK-framed, CRC-checked payload. Strips the leading ACK
    /// and trailing CRC16 before returning.
    fn read_framed(&mut self, first_chunk: Vec<u8>) -> Result<Vec<u8>> {
        if first_chunk.is_empty() {
            return Err(Error::FailedToSendCommand("empty response".into()));
        }
        match first_chunk[0] {
            ACK => {}
            NAK => return Err(Error::FailedToSendCommand("console replied NAK".into())),
            CANCEL => return Err(Error::FailedToSendCommand("console replied CANCEL".into())),
            other => {
                return Err(Error::FailedToSendCommand(format!(
                    "unexpected leading byte 0x{other:02x}"
                )))
            }
        }
        if first_chunk.len() < 3 {
            return Err(Error::MalformedData("frame too short for CRC".into()));
        }
        let body = &first_chunk[1..];
        let (payload, crc_bytes) = body.split_at(body.len() - 2);
        let expected = u16::from_be_bytes([crc_bytes[0], crc_bytes[1]]);
        if !crc::verify(payload, expected) {
            return Err(Error::MalformedData("CRC mismatch".into()));
        }
        Ok(payload.to_vec())
    }

    fn framed_command(&mut self, command: &str) -> Result<Vec<u8>> {
        self.send(command)?;
        let reply = self.transport.wait_for_buffer(self.read_timeout, &self.cancel)?;
        trace!("<- {reply:02x?}");
        self.read_framed(reply)
    }

    /// `HILOWS\n`: highs-and-lows summary.
    pub fn highs_and_lows(&mut self) -> Result<Vec<u8>> {
        self.framed_command("HILOWS\n")
    }

    /// `LPS 1 1\n`: the LOOP1 realtime packet. Validates
    /// `payload[4] == 0` to confirm the console answered with a LOOP1
    /// (not LOOP2) shape.
    pub fn loop1(&mut self) -> Result<Vec<u8>> {
        let payload = self.framed_command("LPS 1 1\n")?;
        match payload.get(4) {
            Some(0) => Ok(payload),
            Some(other) => Err(Error::MalformedData(format!(
                "expected LOOP1 package type 0, got {other}"
            ))),
            None => Err(Error::MalformedData("LOOP1 payload too short".into())),
        }
    }

    /// `LPS 2 1\n`: the LOOP2 realtime packet, reassembled from two
    /// serial bursts. Validates `payload[4] != 0`.
    pub fn loop2(&mut self) -> Result<Vec<u8>> {
        self.send("LPS 2 1\n")?;
        let first = self.transport.wait_for_buffer(self.read_timeout, &self.cancel)?;
        let second = self.transport.wait_for_buffer(self.read_timeout, &self.cancel)?;
        let mut combined = first;
        combined.extend(second);
        trace!("<- (combined) {combined:02x?}");
        let payload = self.read_framed(combined)?;
        match payload.get(4) {
            Some(0) => Err(Error::MalformedData(
                "expected LOOP2 package type != 0, got 0".into(),
            )),
            Some(_) => Ok(payload),
            None => Err(Error::MalformedData("LOOP2 payload too short".into())),
        }
    }
}

/// Davis firmware date codes look like `"Oct 14 2008"` or similar
/// `"%b %d %Y"`-ish text; be lenient about surrounding whitespace.
fn parse_firmware_date(raw: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(raw.trim(), "%b %d %Y").ok()
}
