use std::io::Error as IoError;
use std::time::Duration;
use thiserror::Error;

/// A GT06 Result, conveniently wrapping the [Gt06Error]
pub type Result<T> = std::result::Result<T, Gt06Error>;

#[derive(Error, Debug)]
/// Error types which can occur while encoding frames, parsing bytes
/// or talking to the tracking server.
pub enum Gt06Error {
    #[error("I/O error during frame transfer")]
    Io(#[from] IoError),
    #[error("Frame sentinels are missing or malformed.")]
    BadSentinel,
    #[error("Frame length disagrees with declared length. Declared {declared} != Actual {actual}.")]
    BadLength { declared: usize, actual: usize },
    #[error("Frame CRCs do not match. Expected {expected:#X} != Computed {computed:#X}.")]
    BadCrc { expected: u16, computed: u16 },
    #[error("Payload of {0} bytes does not fit the one-byte frame length.")]
    PayloadTooLong(usize),
    #[error("Field {field} is out of range: {value}.")]
    FieldOutOfRange { field: &'static str, value: String },
    #[error("Socket is not connected.")]
    NotConnected,
    #[error("No acknowledgement from the server within {0:?}.")]
    AckTimeout(Duration),
    #[error("Connect failed after {0} attempts.")]
    ConnectFailed(u32),
    #[error("Server command received but no callback is registered.")]
    CallbackMissing,
}

impl Gt06Error {
    /// Shorthand used by the field codecs to reject a value that
    /// violates its documented bounds.
    pub(crate) fn out_of_range<T: std::fmt::Display>(field: &'static str, value: T) -> Self {
        Self::FieldOutOfRange {
            field,
            value: value.to_string(),
        }
    }
}
