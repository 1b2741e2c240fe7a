//! Closed error taxonomy surfaced by the transport, parser, protocol and
//! realtime-container layers.

use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// A structured failure kind produced anywhere in this crate.
///
/// Every variant here is reachable from the public API documented in the
/// component design; callers are expected to match on the kind rather than
/// treat this as an opaque error (hence no blanket `anyhow`-style wrapper).
#[derive(Error, Debug)]
pub enum Error {
    /// A public operation was attempted while the transport was closed.
    #[error("operation attempted on a closed connection")]
    ClosedConnection,

    /// The console replied with something other than ACK (0x06), or never
    /// replied to a command within its retry budget.
    #[error("failed to send command: {0}")]
    FailedToSendCommand(String),

    /// Writing to the underlying transport failed.
    #[error("failed to write to transport")]
    FailedToWrite(#[source] io::Error),

    /// A CRC-framed payload failed CRC verification, or a response did not
    /// match its expected fixed shape.
    #[error("malformed data: {0}")]
    MalformedData(String),

    /// The binary parser encountered a lower-level fault while decoding a
    /// schema against a buffer.
    #[error("parser error: {context}")]
    ParserError {
        context: String,
        #[source]
        source: Box<Error>,
    },

    /// A schema references a sibling (`copyof`/`dependsOn`) that does not
    /// exist at the same nesting level. Always a programmer bug.
    #[error("invalid schema: {0}")]
    InvalidSchema(String),

    /// The underlying serial connection itself failed (open/I/O at the OS
    /// level), as opposed to a protocol-level fault.
    #[error("serial connection error")]
    SerialConnectionError(#[source] io::Error),

    /// The requested operation is not implemented by the selected device
    /// model (e.g. LOOP2 on a Vantage Pro).
    #[error("unsupported device model: {0}")]
    UnsupportedDeviceModel(String),

    /// `RealtimeConfig`/`DeviceConfig` was constructed without a serial
    /// device path.
    #[error("missing device path")]
    MissingDevicePath,

    /// A blocking wait (wake-up sentinel, frame read, LOOP2 second burst)
    /// exceeded its deadline.
    #[error("operation timed out")]
    Timeout,
}

impl Error {
    /// Wrap a lower-level fault with additional context describing which
    /// field or schema node was being decoded.
    pub fn parser_context(context: impl Into<String>, source: Error) -> Self {
        Error::ParserError {
            context: context.into(),
            source: Box::new(source),
        }
    }
}
