//! # Voltage Poller - Modbus Polling Server for Machine Controllers
//!
//! Industrial controllers dial in over TCP and speak a Modbus RTU-style dialect
//! (unit id, function code, payload, CRC16) on the raw stream. The poller
//! authenticates each controller, loads the register catalog for its series and
//! firmware, and polls it on a schedule, turning register words into named
//! telemetry values handed to a sink.
//!
//! ## Features
//!
//! - **🔐 Device handshake**: four-word identity block checked against a registry
//! - **📦 Register bundling**: nearby registers are read in one request and cached
//! - **🔁 Failure recovery**: deadline per exchange, bounded retry budget,
//!   duplicate-frame stripping after timeouts
//! - **🔤 Typed decoding**: integers, floats, booleans, legacy 8-bit strings, bit flags
//! - **📊 Monitoring**: per-session cycle metrics and transport counters
//!
//! ## Supported Function Codes
//!
//! | Code | Function |
//! |------|----------|
//! | 0x01 | Read Coils |
//! | 0x03 | Read Holding Registers |
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use voltage_poller::{
//!     ConsoleSink, DeviceRegistry, JsonCatalogProvider, PollerConfig, PollerServer, SessionContext,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = PollerConfig::load("poller.yaml")?;
//!     let context = SessionContext {
//!         authenticator: Arc::new(DeviceRegistry::load(&config.registry.path).await?),
//!         catalog: Arc::new(JsonCatalogProvider::new(&config.catalog.directory)),
//!         sink: Arc::new(ConsoleSink),
//!     };
//!
//!     let mut server = PollerServer::new(config, context);
//!     server.start().await?;
//!     tokio::signal::ctrl_c().await?;
//!     server.stop();
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────┐     ┌──────────────────────────────┐
//! │  PollerServer   │────►│ DeviceSession (one per conn) │──► TelemetrySink
//! │  (accept loop)  │     └──────────────────────────────┘
//! └─────────────────┘        │          │           │
//!                            ▼          ▼           ▼
//!                     Authenticator  BundleCache  ValueType::decode
//!                     CatalogProvider    │
//!                                        ▼
//!                              ┌───────────────────┐
//!                              │  StreamTransport  │◄──► controller
//!                              │  (frame codec)    │
//!                              └───────────────────┘
//! ```

/// Core error types and result handling
pub mod error;

/// Frame codec: requests, responses, CRC16
pub mod protocol;

/// Typed decoding of register words
pub mod value;

/// Register descriptors and catalog providers
pub mod catalog;

/// Device identities and the device registry
pub mod device;

/// Register bundling and caching
pub mod bundle;

/// Request/response exchange over a byte stream
pub mod transport;

/// Telemetry snapshots
pub mod snapshot;

/// Snapshot destinations
pub mod sink;

/// Per-device session state machine
pub mod session;

/// TCP accept loop
pub mod server;

/// Controller simulator for tests and demos
pub mod simulator;

/// Configuration file model
pub mod config;

/// Logging setup and packet dumps
pub mod logging;

/// Cycle metrics and formatting helpers
pub mod utils;

// Re-export main types for convenience
pub use bundle::{Bundle, BundleCache};
pub use catalog::{CatalogProvider, JsonCatalogProvider, RegisterDescriptor, StaticCatalog};
pub use config::PollerConfig;
pub use device::{Authenticator, DeviceIdentity, DeviceRecord, DeviceRegistry};
pub use error::{PollerError, PollerResult};
pub use protocol::{ModbusFunction, RequestFrame, ResponseFrame};
pub use server::{PollerServer, ServerStats};
pub use session::{DeviceSession, SessionContext, SessionState};
pub use simulator::{DeviceSimulator, RegisterBank};
pub use sink::{ConsoleSink, FileSink, MemorySink, TelemetrySink};
pub use snapshot::{TelemetryEntry, TelemetrySnapshot};
pub use transport::{ModbusTransport, RetryBudget, StreamTransport, TransportStats};
pub use utils::{OperationTimer, PerformanceMetrics};
pub use value::ValueType;

/// Maximum number of coils that can be read in a single request
pub const MAX_COILS_PER_REQUEST: u16 = 2000;

/// Maximum number of registers that can be read in a single request
pub const MAX_REGISTERS_PER_REQUEST: u16 = 125;

/// Port controllers dial by default
pub const DEFAULT_LISTEN_PORT: u16 = 8899;

/// First register of the identity block read during the handshake
pub const IDENTITY_REGISTER: u16 = 0x1400;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Get library information
pub fn info() -> String {
    format!("Voltage Poller v{} - Modbus polling server for machine controllers", VERSION)
}
