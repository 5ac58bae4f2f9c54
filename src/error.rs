//! # Voltage Poller Error Handling
//!
//! Error taxonomy for the polling engine: frame codec failures, device-reported
//! exceptions, transport deadlines, authentication and catalog problems.
//!
//! ## Error Categories
//!
//! ### Fatal (terminate the owning session)
//! - **RequestTimeout**: transport deadline exceeded after the retry budget ran out
//! - **Exception**: device-reported fault, unless the code is configured as benign
//! - **AuthenticationFailed**: unknown device id / secret pair
//! - **AddressNotBundled**: a descriptor lies outside every computed bundle
//! - **Connection / Io**: the peer closed the stream or the socket failed
//!
//! ### Recoverable (value unavailable this cycle)
//! - **Crc**: corrupt response, discarded
//! - **InsufficientData**: a bundle read returned fewer words than requested
//! - **InvalidData**: raw words could not be decoded for the declared type
//! - **Frame**: response too short to interpret
//!
//! ## Usage
//!
//! ```rust
//! use voltage_poller::{PollerError, PollerResult};
//!
//! fn handle(result: PollerResult<Vec<u16>>) {
//!     match result {
//!         Ok(words) => println!("{} words", words.len()),
//!         Err(error) if error.is_recoverable() => {
//!             println!("skipping this cycle: {}", error);
//!         }
//!         Err(error) => {
//!             println!("session must terminate: {}", error);
//!         }
//!     }
//! }
//! ```

use thiserror::Error;

/// Result type alias for poller operations
pub type PollerResult<T> = Result<T, PollerError>;

/// Poller error types
///
/// Each variant carries enough context (addresses, function codes, device ids)
/// to be logged on its own when a session is torn down.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PollerError {
    /// I/O related errors on the device stream
    #[error("I/O error: {message}")]
    Io { message: String },

    /// Connection errors
    ///
    /// # Examples
    /// - Peer closed the stream (zero-length read)
    /// - Listener could not bind
    #[error("Connection error: {message}")]
    Connection { message: String },

    /// Transport deadline exceeded after exhausting retries
    #[error("Request timed out after {attempts} attempt(s) of {timeout_ms}ms: {operation}")]
    RequestTimeout {
        operation: String,
        timeout_ms: u64,
        attempts: u32,
    },

    /// Invalid argument passed to the frame codec
    ///
    /// # Examples
    /// - Encoding a request with function code 5
    #[error("Invalid argument: {message}")]
    InvalidArgument { message: String },

    /// Frame parsing errors
    #[error("Frame error: {message}")]
    Frame { message: String },

    /// CRC validation failure, the response is discarded
    #[error("CRC validation failed: expected={expected:04X}, actual={actual:04X}")]
    Crc { expected: u16, actual: u16 },

    /// Modbus exception reported by the device
    ///
    /// # Standard Exception Codes
    /// - 0x01: Illegal Function
    /// - 0x02: Illegal Data Address
    /// - 0x03: Illegal Data Value
    /// - 0x04: Slave Device Failure
    /// - 0x05: Acknowledge
    /// - 0x06: Slave Device Busy
    #[error("Modbus exception: function={function:02X}, code={code:02X} at address {address:#06X} ({message})")]
    Exception {
        function: u8,
        code: u8,
        address: u16,
        message: String,
    },

    /// Device id / secret pair unknown to the registry
    #[error("Authentication failed for device {device_id}")]
    AuthenticationFailed { device_id: u64 },

    /// Descriptor outside every computed bundle (catalog inconsistency)
    #[error("Address {address:#06X} (function {function}) is not covered by any bundle")]
    AddressNotBundled { address: u16, function: u8 },

    /// A read returned fewer words than the span requires
    #[error("Insufficient data at {address:#06X}: expected {expected} words, got {actual}")]
    InsufficientData {
        address: u16,
        expected: usize,
        actual: usize,
    },

    /// Raw words cannot be decoded as the declared type
    #[error("Invalid data: {message}")]
    InvalidData { message: String },

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// Parameter catalog errors (missing file, unknown type tag, bad address)
    #[error("Catalog error: {message}")]
    Catalog { message: String },

    /// Telemetry sink failures
    #[error("Sink error: {message}")]
    Sink { message: String },

    /// Internal errors (should not occur in normal operation)
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl PollerError {
    /// Create a new I/O error
    pub fn io<S: Into<String>>(message: S) -> Self {
        Self::Io { message: message.into() }
    }

    /// Create a new connection error
    pub fn connection<S: Into<String>>(message: S) -> Self {
        Self::Connection { message: message.into() }
    }

    /// Create a request timeout error
    ///
    /// # Arguments
    ///
    /// * `operation` - Description of the request that timed out
    /// * `timeout_ms` - Per-attempt deadline in milliseconds
    /// * `attempts` - Number of attempts made, including the first
    pub fn request_timeout<S: Into<String>>(operation: S, timeout_ms: u64, attempts: u32) -> Self {
        Self::RequestTimeout {
            operation: operation.into(),
            timeout_ms,
            attempts,
        }
    }

    /// Create an invalid argument error
    pub fn invalid_argument<S: Into<String>>(message: S) -> Self {
        Self::InvalidArgument { message: message.into() }
    }

    /// Create a frame error
    pub fn frame<S: Into<String>>(message: S) -> Self {
        Self::Frame { message: message.into() }
    }

    /// Create a CRC mismatch error
    pub fn crc(expected: u16, actual: u16) -> Self {
        Self::Crc { expected, actual }
    }

    /// Create a Modbus exception error
    ///
    /// Maps standard exception codes to human-readable messages.
    ///
    /// # Arguments
    ///
    /// * `function` - Function code of the failed request
    /// * `code` - Exception code reported by the device
    /// * `address` - Start address of the failed request
    pub fn exception(function: u8, code: u8, address: u16) -> Self {
        let message = match code {
            0x01 => "Illegal Function",
            0x02 => "Illegal Data Address",
            0x03 => "Illegal Data Value",
            0x04 => "Slave Device Failure",
            0x05 => "Acknowledge",
            0x06 => "Slave Device Busy",
            0x08 => "Memory Parity Error",
            0x0A => "Gateway Path Unavailable",
            0x0B => "Gateway Target Device Failed to Respond",
            _ => "Unknown Exception",
        }
        .to_string();

        Self::Exception {
            function,
            code,
            address,
            message,
        }
    }

    /// Create an authentication failure
    pub fn authentication_failed(device_id: u64) -> Self {
        Self::AuthenticationFailed { device_id }
    }

    /// Create an address-not-bundled error
    pub fn address_not_bundled(address: u16, function: u8) -> Self {
        Self::AddressNotBundled { address, function }
    }

    /// Create an insufficient data error
    pub fn insufficient_data(address: u16, expected: usize, actual: usize) -> Self {
        Self::InsufficientData {
            address,
            expected,
            actual,
        }
    }

    /// Create an invalid data error
    pub fn invalid_data<S: Into<String>>(message: S) -> Self {
        Self::InvalidData { message: message.into() }
    }

    /// Create a configuration error
    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration { message: message.into() }
    }

    /// Create a catalog error
    pub fn catalog<S: Into<String>>(message: S) -> Self {
        Self::Catalog { message: message.into() }
    }

    /// Create a sink error
    pub fn sink<S: Into<String>>(message: S) -> Self {
        Self::Sink { message: message.into() }
    }

    /// Create an internal error
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal { message: message.into() }
    }

    /// Check if the error only makes a value unavailable for this cycle
    ///
    /// Recoverable errors are logged and the affected parameter is retried on
    /// the next cycle; everything else terminates the session.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use voltage_poller::PollerError;
    ///
    /// assert!(PollerError::crc(0x1234, 0x4321).is_recoverable());
    /// assert!(!PollerError::request_timeout("read", 3000, 3).is_recoverable());
    /// ```
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Crc { .. } | Self::InsufficientData { .. } | Self::InvalidData { .. } | Self::Frame { .. }
        )
    }

    /// Check if the error must terminate the owning session
    pub fn is_fatal(&self) -> bool {
        !self.is_recoverable()
    }

    /// Check if the error is a network/transport issue
    pub fn is_transport_error(&self) -> bool {
        matches!(
            self,
            Self::Io { .. } | Self::Connection { .. } | Self::RequestTimeout { .. }
        )
    }

    /// Check if the error is a protocol issue
    pub fn is_protocol_error(&self) -> bool {
        matches!(
            self,
            Self::Frame { .. } | Self::Crc { .. } | Self::Exception { .. } | Self::InvalidArgument { .. }
        )
    }
}

/// Convert from std::io::Error
impl From<std::io::Error> for PollerError {
    fn from(err: std::io::Error) -> Self {
        Self::io(err.to_string())
    }
}

/// Convert from tokio timeout errors
///
/// The deadline is not known here; transports build `RequestTimeout` themselves
/// when they have the context.
impl From<tokio::time::error::Elapsed> for PollerError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        Self::request_timeout("operation", 0, 1)
    }
}

/// Convert from serde JSON errors
impl From<serde_json::Error> for PollerError {
    fn from(err: serde_json::Error) -> Self {
        Self::configuration(format!("JSON error: {}", err))
    }
}

/// Convert from serde YAML errors
impl From<serde_yaml::Error> for PollerError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::configuration(format!("YAML error: {}", err))
    }
}
