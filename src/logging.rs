//! Logging setup and packet dumps
//!
//! Everything in the crate logs through the `log` facade. Binaries call [`init`]
//! once; `RUST_LOG` takes precedence over the configured level. Wire traffic is
//! dumped by [`PacketLogger`] at debug level when packet logging is switched on.

use log::{debug, LevelFilter};
use serde::{Deserialize, Serialize};

use crate::config::LoggingConfig;

/// Configured log level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    /// Convert log level to string
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Error => "ERROR",
            LogLevel::Warn => "WARN",
            LogLevel::Info => "INFO",
            LogLevel::Debug => "DEBUG",
            LogLevel::Trace => "TRACE",
        }
    }

    pub fn to_level_filter(self) -> LevelFilter {
        match self {
            LogLevel::Error => LevelFilter::Error,
            LogLevel::Warn => LevelFilter::Warn,
            LogLevel::Info => LevelFilter::Info,
            LogLevel::Debug => LevelFilter::Debug,
            LogLevel::Trace => LevelFilter::Trace,
        }
    }
}

/// How packets are rendered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoggingMode {
    /// Hex bytes only
    Raw,
    /// Decoded header fields
    #[default]
    Interpreted,
    /// Decoded header followed by the hex bytes
    Both,
}

/// Initialise `env_logger` from the configuration
///
/// Safe to call more than once; later calls are ignored.
pub fn init(config: &LoggingConfig) {
    let mut builder = env_logger::Builder::new();
    builder.filter_level(config.level.to_level_filter());
    builder.parse_default_env();
    let _ = builder.try_init();
}

/// Logger for unit and integration tests
pub fn init_test_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Dumps frames exchanged with one peer
#[derive(Debug, Clone)]
pub struct PacketLogger {
    peer: String,
    enabled: bool,
    mode: LoggingMode,
}

impl PacketLogger {
    pub fn new(peer: impl Into<String>, enabled: bool, mode: LoggingMode) -> Self {
        Self {
            peer: peer.into(),
            enabled,
            mode,
        }
    }

    /// Logger that never prints
    pub fn disabled() -> Self {
        Self::new("", false, LoggingMode::Raw)
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Log an outgoing frame
    pub fn log_request(&self, frame: &[u8]) {
        self.log_frame("->", frame, describe_request);
    }

    /// Log an incoming buffer as it was read from the stream
    pub fn log_response(&self, frame: &[u8]) {
        self.log_frame("<-", frame, describe_response);
    }

    fn log_frame(&self, direction: &str, frame: &[u8], describe: fn(&[u8]) -> String) {
        if !self.enabled {
            return;
        }
        match self.mode {
            LoggingMode::Raw => debug!("[{}] {} {}", self.peer, direction, format_hex(frame)),
            LoggingMode::Interpreted => debug!("[{}] {} {}", self.peer, direction, describe(frame)),
            LoggingMode::Both => {
                debug!("[{}] {} {}", self.peer, direction, describe(frame));
                debug!("[{}] {} {}", self.peer, direction, format_hex(frame));
            }
        }
    }
}

/// Upper-case hex bytes separated by spaces
pub fn format_hex(data: &[u8]) -> String {
    let encoded = hex::encode_upper(data);
    encoded
        .as_bytes()
        .chunks(2)
        .map(|pair| String::from_utf8_lossy(pair))
        .collect::<Vec<_>>()
        .join(" ")
}

fn describe_request(frame: &[u8]) -> String {
    if frame.len() < 6 {
        return format!("short request ({} bytes)", frame.len());
    }
    format!(
        "unit {} fc {:#04X} address {:#06X} count {}",
        frame[0],
        frame[1],
        u16::from_be_bytes([frame[2], frame[3]]),
        u16::from_be_bytes([frame[4], frame[5]])
    )
}

fn describe_response(frame: &[u8]) -> String {
    if frame.len() < 3 {
        return format!("short response ({} bytes)", frame.len());
    }
    if frame[1] & 0x80 != 0 {
        format!("unit {} fc {:#04X} exception {:#04X}", frame[0], frame[1], frame[2])
    } else {
        format!(
            "unit {} fc {:#04X} byte count {} ({} bytes read)",
            frame[0],
            frame[1],
            frame[2],
            frame.len()
        )
    }
}
