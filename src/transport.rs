//! # Transport I/O
//!
//! A controller connection is a plain byte stream with no message delimiters:
//! one request is written, then whatever arrives in a single read is taken as
//! the response. [`StreamTransport`] implements that exchange over any tokio
//! stream (a `TcpStream` in production, an in-memory duplex in tests).
//!
//! ## Failure policy
//!
//! - Each exchange (write + read) runs under one deadline.
//! - A timed-out exchange is retried while the request still has attempts left
//!   and the connection-wide [`RetryBudget`] allows it. The budget is topped up
//!   after every successful poll cycle.
//! - A late answer to a timed-out request can arrive glued to the next genuine
//!   response. [`strip_duplicates`] recognises buffers that repeat themselves
//!   and keeps one copy.
//! - A decoded response carrying a non-zero exception code becomes
//!   [`PollerError::Exception`].
//!
//! ## Usage
//!
//! ```rust,no_run
//! use voltage_poller::protocol::{ModbusFunction, RequestFrame};
//! use voltage_poller::transport::{ModbusTransport, StreamTransport};
//! use std::time::Duration;
//! use tokio::net::TcpListener;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let listener = TcpListener::bind("0.0.0.0:8899").await?;
//!     let (stream, peer) = listener.accept().await?;
//!     let mut transport = StreamTransport::new(stream, peer.to_string(), Duration::from_secs(3));
//!
//!     let request = RequestFrame::new(1, ModbusFunction::ReadHoldingRegisters, 0x1400, 4);
//!     let response = transport.send_receive(&request).await?;
//!     println!("identity block: {:?}", response.words());
//!     Ok(())
//! }
//! ```

use async_trait::async_trait;
use log::{debug, warn};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;

use crate::error::{PollerError, PollerResult};
use crate::logging::{LoggingMode, PacketLogger};
use crate::protocol::{RequestFrame, ResponseFrame, MIN_RESPONSE_LEN};

/// Read buffer size; large enough for a full response repeated four times
const READ_BUFFER_SIZE: usize = 1024;

/// Repetition factors checked by [`strip_duplicates`], in priority order
const DUPLICATE_FACTORS: [usize; 3] = [4, 2, 3];

/// Request/response exchange with one device
///
/// At most one request is in flight per transport; callers hold `&mut self`
/// for the whole exchange.
#[async_trait]
pub trait ModbusTransport: Send {
    /// Send a request and return its decoded, CRC-checked response
    ///
    /// # Errors
    ///
    /// - `RequestTimeout` once retries are exhausted
    /// - `Crc` / `Frame` for corrupt or truncated responses
    /// - `Exception` when the device reports a fault
    /// - `Connection` / `Io` when the stream is gone
    async fn send_receive(&mut self, request: &RequestFrame) -> PollerResult<ResponseFrame>;

    /// Top up the retry budget after a successful poll cycle
    fn replenish_retries(&mut self) {}

    /// Shut the stream down
    async fn close(&mut self) -> PollerResult<()>;

    /// Counters since the transport was created
    fn get_stats(&self) -> TransportStats;
}

/// Transport layer statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransportStats {
    pub requests_sent: u64,
    pub responses_received: u64,
    pub timeouts: u64,
    pub retries: u64,
    pub crc_errors: u64,
    pub exceptions: u64,
    pub duplicates_stripped: u64,
    pub errors: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

impl std::fmt::Display for TransportStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "requests={} responses={} timeouts={} retries={} crc_errors={} exceptions={} \
             duplicates_stripped={} errors={} tx={}B rx={}B",
            self.requests_sent,
            self.responses_received,
            self.timeouts,
            self.retries,
            self.crc_errors,
            self.exceptions,
            self.duplicates_stripped,
            self.errors,
            self.bytes_sent,
            self.bytes_received
        )
    }
}

/// Connection-wide allowance of timeout retries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryBudget {
    available: u32,
    max: u32,
    replenish: u32,
}

impl RetryBudget {
    /// `initial` is clamped to `max`
    pub fn new(initial: u32, max: u32, replenish: u32) -> Self {
        Self {
            available: initial.min(max),
            max,
            replenish,
        }
    }

    /// Take one retry, returns false when none is left
    pub fn try_consume(&mut self) -> bool {
        if self.available == 0 {
            return false;
        }
        self.available -= 1;
        true
    }

    /// Add the replenish amount, capped at the maximum
    pub fn replenish(&mut self) {
        self.available = (self.available + self.replenish).min(self.max);
    }

    pub fn available(&self) -> u32 {
        self.available
    }
}

impl Default for RetryBudget {
    fn default() -> Self {
        Self::new(3, 5, 1)
    }
}

/// Keep one copy of a buffer that repeats itself 4, 2 or 3 times
///
/// The buffer is split into `k` equal parts for each factor in turn; when the
/// first part equals the last one only the first part is kept. Buffers that do
/// not split into parts of at least a minimal response are returned unchanged.
///
/// ```rust
/// use voltage_poller::transport::strip_duplicates;
///
/// let frame = [1u8, 3, 2, 0, 7, 0xF9, 0x86];
/// let doubled = [frame, frame].concat();
/// assert_eq!(strip_duplicates(&doubled), &frame[..]);
/// ```
pub fn strip_duplicates(buffer: &[u8]) -> &[u8] {
    let len = buffer.len();
    for k in DUPLICATE_FACTORS {
        if len % k != 0 {
            continue;
        }
        let part = len / k;
        if part < MIN_RESPONSE_LEN {
            continue;
        }
        if buffer[..part] == buffer[len - part..] {
            return &buffer[..part];
        }
    }
    buffer
}

/// Outcome of one write + read under the deadline
enum Exchange {
    Received(usize),
    TimedOut,
}

/// Transport over a connected byte stream
pub struct StreamTransport<S> {
    stream: S,
    peer: String,
    timeout: Duration,
    max_retries: u32,
    budget: RetryBudget,
    packets: PacketLogger,
    stats: TransportStats,
    buffer: Vec<u8>,
}

impl<S> StreamTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Create a transport with two retries per request and the default budget
    pub fn new(stream: S, peer: impl Into<String>, timeout: Duration) -> Self {
        let peer = peer.into();
        Self {
            stream,
            packets: PacketLogger::new(peer.clone(), false, LoggingMode::Raw),
            peer,
            timeout,
            max_retries: 2,
            budget: RetryBudget::default(),
            stats: TransportStats::default(),
            buffer: vec![0u8; READ_BUFFER_SIZE],
        }
    }

    /// Set the per-request retry limit and the connection-wide budget
    pub fn with_retries(mut self, max_retries: u32, budget: RetryBudget) -> Self {
        self.max_retries = max_retries;
        self.budget = budget;
        self
    }

    /// Enable or disable packet logging
    pub fn with_packet_logging(mut self, enabled: bool, mode: LoggingMode) -> Self {
        self.packets = PacketLogger::new(self.peer.clone(), enabled, mode);
        self
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn retry_budget(&self) -> RetryBudget {
        self.budget
    }

    /// Write the request and read once, both under the deadline
    async fn exchange(&mut self, frame: &[u8]) -> PollerResult<Exchange> {
        let stream = &mut self.stream;
        let buffer = &mut self.buffer;
        let io = async {
            stream.write_all(frame).await?;
            stream.flush().await?;
            stream.read(buffer).await
        };

        match timeout(self.timeout, io).await {
            Ok(Ok(0)) => Err(PollerError::connection(format!(
                "{} closed the connection",
                self.peer
            ))),
            Ok(Ok(n)) => Ok(Exchange::Received(n)),
            Ok(Err(e)) => Err(PollerError::io(format!("{}: {}", self.peer, e))),
            Err(_) => Ok(Exchange::TimedOut),
        }
    }

    /// Strip duplicates, validate and check the exception code
    fn interpret(&mut self, request: &RequestFrame, received: usize) -> PollerResult<ResponseFrame> {
        let raw = &self.buffer[..received];
        self.packets.log_response(raw);

        let frame = strip_duplicates(raw);
        if frame.len() < raw.len() {
            self.stats.duplicates_stripped += 1;
            debug!(
                "[{}] stripped duplicated response: {} -> {} bytes",
                self.peer,
                raw.len(),
                frame.len()
            );
        }

        let response = match ResponseFrame::decode(frame) {
            Ok(response) => response,
            Err(e) => {
                if matches!(e, PollerError::Crc { .. }) {
                    self.stats.crc_errors += 1;
                }
                self.stats.errors += 1;
                return Err(e);
            }
        };

        let code = response.exception_code();
        if code != 0 {
            self.stats.exceptions += 1;
            return Err(PollerError::exception(
                request.function.to_u8(),
                code,
                request.address,
            ));
        }
        Ok(response)
    }
}

#[async_trait]
impl<S> ModbusTransport for StreamTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn send_receive(&mut self, request: &RequestFrame) -> PollerResult<ResponseFrame> {
        let frame = request.encode();
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            self.stats.requests_sent += 1;
            self.stats.bytes_sent += frame.len() as u64;
            self.packets.log_request(&frame);

            let outcome = match self.exchange(&frame).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    self.stats.errors += 1;
                    return Err(e);
                }
            };

            match outcome {
                Exchange::Received(n) => {
                    self.stats.responses_received += 1;
                    self.stats.bytes_received += n as u64;
                    return self.interpret(request, n);
                }
                Exchange::TimedOut => {
                    self.stats.timeouts += 1;
                    if attempts <= self.max_retries && self.budget.try_consume() {
                        self.stats.retries += 1;
                        warn!(
                            "[{}] no answer to {} within {:?}, retrying ({} retries left in budget)",
                            self.peer,
                            request,
                            self.timeout,
                            self.budget.available()
                        );
                        continue;
                    }
                    self.stats.errors += 1;
                    return Err(PollerError::request_timeout(
                        request.to_string(),
                        self.timeout.as_millis() as u64,
                        attempts,
                    ));
                }
            }
        }
    }

    fn replenish_retries(&mut self) {
        self.budget.replenish();
    }

    async fn close(&mut self) -> PollerResult<()> {
        self.stream.shutdown().await?;
        Ok(())
    }

    fn get_stats(&self) -> TransportStats {
        self.stats.clone()
    }
}
