//! # Device Session
//!
//! One session owns one controller connection for its whole life:
//!
//! ```text
//! Unauthenticated ──> Authenticating ──┬──> Active ──(cycle, sink, sleep)──┐
//!                                      │      ^                            │
//!                                      │      └────────────────────────────┘
//!                                      ├──> Idle (device inactive, parked)
//!                                      └──> Terminated (auth failure, after cooldown)
//! ```
//!
//! Any fatal error or cancellation ends in `Terminated`, which closes the
//! stream. Work inside a session is strictly sequential, so at most one request
//! is ever in flight on the connection.
//!
//! ## Cycle error policy
//!
//! | Error | Effect |
//! |-------|--------|
//! | CRC, frame, short read, undecodable words | value skipped this cycle |
//! | exception with a configured benign code | value skipped this cycle |
//! | timeout after retries, other exceptions, unbundled address, closed stream | session ends |

use chrono::Utc;
use log::{debug, error, info, warn};
use std::fmt;
use std::sync::Arc;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;

use crate::bundle::BundleCache;
use crate::catalog::{CatalogProvider, RegisterDescriptor};
use crate::config::{BundlingConfig, SessionConfig};
use crate::device::{Authenticator, DeviceIdentity};
use crate::error::{PollerError, PollerResult};
use crate::protocol::{ModbusFunction, RequestFrame};
use crate::sink::TelemetrySink;
use crate::snapshot::{TelemetryEntry, TelemetrySnapshot};
use crate::transport::ModbusTransport;
use crate::utils::{OperationTimer, PerformanceMetrics};

/// Words in the identity block: series, id, secret, PLC version
pub const IDENTITY_WORDS: u16 = 4;

/// Lifecycle state of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Unauthenticated,
    Authenticating,
    Active,
    Idle,
    Terminated,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Unauthenticated => "unauthenticated",
            SessionState::Authenticating => "authenticating",
            SessionState::Active => "active",
            SessionState::Idle => "idle",
            SessionState::Terminated => "terminated",
        };
        f.write_str(name)
    }
}

/// External collaborators shared by all sessions
#[derive(Clone)]
pub struct SessionContext {
    pub authenticator: Arc<dyn Authenticator>,
    pub catalog: Arc<dyn CatalogProvider>,
    pub sink: Arc<dyn TelemetrySink>,
}

/// Outcome of one sweep over the due descriptors
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub polled: usize,
    pub skipped: usize,
}

/// Polling session of one device
pub struct DeviceSession<T: ModbusTransport> {
    transport: T,
    peer: String,
    config: SessionConfig,
    bundling: BundlingConfig,
    context: SessionContext,
    state: SessionState,
    identity: Option<DeviceIdentity>,
    descriptors: Vec<RegisterDescriptor>,
    bundles: Option<BundleCache>,
    snapshot: TelemetrySnapshot,
    metrics: PerformanceMetrics,
}

impl<T: ModbusTransport> DeviceSession<T> {
    pub fn new(
        transport: T,
        peer: impl Into<String>,
        config: SessionConfig,
        bundling: BundlingConfig,
        context: SessionContext,
    ) -> Self {
        Self {
            transport,
            peer: peer.into(),
            config,
            bundling,
            context,
            state: SessionState::Unauthenticated,
            identity: None,
            descriptors: Vec::new(),
            bundles: None,
            snapshot: TelemetrySnapshot::default(),
            metrics: PerformanceMetrics::new(),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn identity(&self) -> Option<&DeviceIdentity> {
        self.identity.as_ref()
    }

    pub fn descriptors(&self) -> &[RegisterDescriptor] {
        &self.descriptors
    }

    pub fn bundles(&self) -> Option<&BundleCache> {
        self.bundles.as_ref()
    }

    pub fn snapshot(&self) -> &TelemetrySnapshot {
        &self.snapshot
    }

    pub fn metrics(&self) -> &PerformanceMetrics {
        &self.metrics
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Read the identity block and look the device up
    ///
    /// On success the discovered PLC version is merged into the identity, and
    /// the catalog for the device's series and version is loaded and bundled.
    /// The session ends up `Active`, or `Idle` for an inactive device.
    ///
    /// # Errors
    ///
    /// - `Frame` if the identity block is not exactly four words
    /// - `AuthenticationFailed` for an unknown id / secret pair
    /// - catalog and transport errors, unchanged
    pub async fn authenticate(&mut self) -> PollerResult<DeviceIdentity> {
        self.state = SessionState::Authenticating;

        let request = RequestFrame::new(
            self.config.unit_id,
            ModbusFunction::ReadHoldingRegisters,
            self.config.identity_register,
            IDENTITY_WORDS,
        );
        let words = self.transport.send_receive(&request).await?.words();
        if words.len() != IDENTITY_WORDS as usize {
            return Err(PollerError::frame(format!(
                "Identity block must be {} words, got {}",
                IDENTITY_WORDS,
                words.len()
            )));
        }

        let device_id = DeviceIdentity::compose_id(words[0], words[1]);
        let secret = words[2];
        let mut identity = self
            .context
            .authenticator
            .authenticate_device(device_id, secret)
            .await
            .ok_or_else(|| PollerError::authentication_failed(device_id))?;
        identity.plc_version = words[3];

        let descriptors = self
            .context
            .catalog
            .get_descriptors(identity.series_id, identity.plc_version as u32)
            .await?;
        let bundles = BundleCache::build(&descriptors, self.bundling.max_gap, self.bundling.ttl());
        info!(
            "🔐 [{}] device {} ({}) authenticated: series {}, PLC v{}, {} parameter(s) in {} bundle(s)",
            self.peer,
            identity.device_id,
            identity.name,
            identity.series_id,
            identity.plc_version,
            descriptors.len(),
            bundles.bundles().len()
        );

        self.descriptors = descriptors;
        self.bundles = Some(bundles);
        self.snapshot = TelemetrySnapshot::new(identity.device_id, identity.name.clone());
        self.state = if identity.active {
            SessionState::Active
        } else {
            SessionState::Idle
        };
        self.identity = Some(identity.clone());
        Ok(identity)
    }

    /// Sweep every due descriptor once
    ///
    /// Each read value is upserted into the snapshot and its descriptor stamped;
    /// unavailable values are skipped and retried next cycle. The snapshot's
    /// program and step names are refreshed at the end of the sweep.
    pub async fn poll_cycle(&mut self) -> PollerResult<CycleReport> {
        let timer = OperationTimer::start(format!("[{}] poll cycle", self.peer));
        let result = self.sweep().await;
        let duration = timer.stop();

        match &result {
            Ok(report) => self.metrics.record_cycle(duration, report.polled, report.skipped),
            Err(_) => self.metrics.record_failure(duration),
        }
        result
    }

    async fn sweep(&mut self) -> PollerResult<CycleReport> {
        let bundles = self
            .bundles
            .as_mut()
            .ok_or_else(|| PollerError::internal("poll cycle before authentication"))?;
        bundles.begin_sweep();
        let mut report = CycleReport::default();

        for index in 0..self.descriptors.len() {
            if !self.descriptors[index].is_due(Instant::now()) {
                continue;
            }
            let descriptor = &self.descriptors[index];

            let read = bundles
                .get_data(&mut self.transport, self.config.unit_id, descriptor)
                .await
                .and_then(|words| descriptor.value_type.decode(&words, descriptor.multiplier));

            match read {
                Ok(value) => {
                    self.snapshot.upsert(TelemetryEntry {
                        name: descriptor.name.clone(),
                        codename: descriptor.codename.clone(),
                        value,
                        timestamp: Utc::now(),
                    });
                    self.descriptors[index].last_poll = Some(Instant::now());
                    report.polled += 1;
                }
                Err(e) if e.is_recoverable() => {
                    warn!("[{}] {} unavailable this cycle: {}", self.peer, descriptor.codename, e);
                    report.skipped += 1;
                }
                Err(PollerError::Exception { code, .. }) if self.config.is_benign_exception(code) => {
                    warn!(
                        "[{}] {} answered with benign exception {:#04X}, skipped",
                        self.peer, descriptor.codename, code
                    );
                    report.skipped += 1;
                }
                Err(e) => return Err(e),
            }
        }

        self.snapshot.derive_names();
        debug!(
            "[{}] cycle done: {} polled, {} skipped",
            self.peer, report.polled, report.skipped
        );
        Ok(report)
    }

    /// Drive the session until cancellation or a fatal error, then close the stream
    pub async fn run(mut self, cancel: CancellationToken) -> PollerResult<()> {
        let result = self.drive(&cancel).await;
        self.state = SessionState::Terminated;

        match &result {
            Ok(()) => info!("⏹️  [{}] session stopped", self.peer),
            Err(e) => {
                let device = self
                    .identity
                    .as_ref()
                    .map_or("unidentified".to_string(), |i| format!("{} ({})", i.device_id, i.name));
                error!(
                    "💥 [{}] session for device {} terminated: {}\nLast snapshot:\n{}",
                    self.peer, device, e, self.snapshot
                );
            }
        }

        if let Err(e) = self.transport.close().await {
            debug!("[{}] close failed: {}", self.peer, e);
        }
        info!(
            "📊 [{}] {}\nTransport: {}",
            self.peer,
            self.metrics,
            self.transport.get_stats()
        );
        result
    }

    async fn drive(&mut self, cancel: &CancellationToken) -> PollerResult<()> {
        let authenticated = tokio::select! {
            _ = cancel.cancelled() => None,
            result = self.authenticate() => Some(result),
        };
        let identity = match authenticated {
            None => return Ok(()),
            Some(Ok(identity)) => identity,
            Some(Err(e @ PollerError::AuthenticationFailed { .. })) => {
                warn!(
                    "🚫 [{}] {}, dropping connection in {:?}",
                    self.peer,
                    e,
                    self.config.auth_cooldown()
                );
                tokio::select! {
                    _ = cancel.cancelled() => {}
                    _ = sleep(self.config.auth_cooldown()) => {}
                }
                return Err(e);
            }
            Some(Err(e)) => return Err(e),
        };

        if !identity.active {
            info!("💤 [{}] device {} is inactive, parking", self.peer, identity.device_id);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return Ok(()),
                    _ = sleep(self.config.idle_check_interval()) => {}
                }
            }
        }

        loop {
            if cancel.is_cancelled() {
                return Ok(());
            }

            let cycle = tokio::select! {
                _ = cancel.cancelled() => None,
                result = self.poll_cycle() => Some(result),
            };
            match cycle {
                None => return Ok(()),
                Some(result) => {
                    result?;
                }
            }

            if let Err(e) = self.context.sink.save_snapshot(&self.snapshot).await {
                warn!("[{}] failed to save snapshot: {}", self.peer, e);
            }
            self.transport.replenish_retries();

            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = sleep(self.config.cycle_interval()) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::StaticCatalog;
    use crate::device::{DeviceRecord, DeviceRegistry};
    use crate::protocol::ResponseFrame;
    use crate::sink::MemorySink;
    use crate::simulator::DeviceSimulator;
    use crate::transport::{StreamTransport, TransportStats};
    use crate::value::ValueType;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::io::DuplexStream;

    const SERIES: u16 = 2;
    const ID: u16 = 7;
    const SECRET: u16 = 0x5A5A;
    const PLC_VERSION: u16 = 3;

    fn registry(active: bool) -> DeviceRegistry {
        DeviceRegistry::new(vec![DeviceRecord {
            device_id: DeviceIdentity::compose_id(SERIES, ID),
            code: SECRET,
            series_id: SERIES as u32,
            name: "Washer 7".to_string(),
            active,
        }])
    }

    fn catalog() -> StaticCatalog {
        StaticCatalog::new().with_series(
            SERIES as u32,
            vec![
                RegisterDescriptor::new(0x10, ModbusFunction::ReadHoldingRegisters, ValueType::UInt16, "speed")
                    .with_multiplier(2.0),
                RegisterDescriptor::new(0x12, ModbusFunction::ReadHoldingRegisters, ValueType::Int32, "counter"),
            ],
        )
    }

    fn spawn_device(simulator: DeviceSimulator) -> (DuplexStream, CancellationToken) {
        let (poller_side, device_side) = tokio::io::duplex(1024);
        let cancel = CancellationToken::new();
        let device_cancel = cancel.clone();
        tokio::spawn(async move { simulator.serve(device_side, device_cancel).await });
        (poller_side, cancel)
    }

    fn session(
        stream: DuplexStream,
        active: bool,
        sink: MemorySink,
    ) -> DeviceSession<StreamTransport<DuplexStream>> {
        let config = SessionConfig {
            cycle_interval_ms: 100,
            auth_cooldown_ms: 200,
            ..Default::default()
        };
        let transport = StreamTransport::new(stream, "test", config.request_timeout());
        let context = SessionContext {
            authenticator: Arc::new(registry(active)),
            catalog: Arc::new(catalog()),
            sink: Arc::new(sink),
        };
        DeviceSession::new(transport, "test", config, BundlingConfig::default(), context)
    }

    fn device(secret: u16) -> DeviceSimulator {
        let simulator =
            DeviceSimulator::new(1).with_identity(crate::IDENTITY_REGISTER, SERIES, ID, secret, PLC_VERSION);
        simulator.bank().write_holding_registers(0x10, &[21]).unwrap();
        simulator.bank().write_u32(0x12, 1).unwrap();
        simulator
    }

    #[tokio::test]
    async fn test_unknown_device_fails_authentication() {
        let (stream, device_cancel) = spawn_device(device(0x1111));
        let mut session = session(stream, true, MemorySink::new());

        let err = session.authenticate().await.unwrap_err();
        assert_eq!(
            err,
            PollerError::authentication_failed(DeviceIdentity::compose_id(SERIES, ID))
        );
        assert!(session.identity().is_none());
        device_cancel.cancel();
    }

    #[tokio::test]
    async fn test_known_device_merges_plc_version() {
        let (stream, device_cancel) = spawn_device(device(SECRET));
        let mut session = session(stream, true, MemorySink::new());

        let identity = session.authenticate().await.unwrap();
        assert_eq!(identity.plc_version, PLC_VERSION);
        assert_eq!(identity.device_id, 0x0002_0007);
        assert_eq!(session.state(), SessionState::Active);
        assert_eq!(session.descriptors().len(), 2);
        assert_eq!(session.bundles().unwrap().bundles().len(), 1);
        device_cancel.cancel();
    }

    #[tokio::test]
    async fn test_cycle_twice_within_ttl_reads_once() {
        let (stream, device_cancel) = spawn_device(device(SECRET));
        let mut session = session(stream, true, MemorySink::new());
        session.authenticate().await.unwrap();

        let sweep_start = Utc::now();
        let requests_before = session.transport().get_stats().requests_sent;
        let report = session.poll_cycle().await.unwrap();

        assert_eq!(report, CycleReport { polled: 2, skipped: 0 });
        let snapshot = session.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert!(snapshot.entries.iter().all(|e| e.timestamp >= sweep_start));
        assert_eq!(snapshot.get("speed").unwrap().value, "42");
        assert_eq!(snapshot.get("counter").unwrap().value, "1");
        let requests_after_first = session.transport().get_stats().requests_sent;
        assert_eq!(requests_after_first - requests_before, 1);

        session.poll_cycle().await.unwrap();
        assert_eq!(session.transport().get_stats().requests_sent, requests_after_first);
        assert_eq!(session.snapshot().len(), 2);
        assert_eq!(session.metrics().successful_cycles, 2);
        device_cancel.cancel();
    }

    #[tokio::test]
    async fn test_poll_before_authentication_is_internal_error() {
        let (stream, device_cancel) = spawn_device(device(SECRET));
        let mut session = session(stream, true, MemorySink::new());
        assert!(matches!(
            session.poll_cycle().await,
            Err(PollerError::Internal { .. })
        ));
        device_cancel.cancel();
    }

    #[tokio::test]
    async fn test_run_delivers_snapshots_until_cancelled() {
        let (stream, device_cancel) = spawn_device(device(SECRET));
        let sink = MemorySink::new();
        let session = session(stream, true, sink.clone());

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(session.run(cancel.clone()));

        tokio::time::timeout(Duration::from_secs(5), async {
            while sink.len().await < 2 {
                sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap();

        cancel.cancel();
        assert!(handle.await.unwrap().is_ok());
        let snapshots = sink.snapshots().await;
        assert_eq!(snapshots[0].device_id, 0x0002_0007);
        assert_eq!(snapshots[0].entries.len(), 2);
        device_cancel.cancel();
    }

    #[tokio::test]
    async fn test_inactive_device_parks_until_cancelled() {
        let (stream, device_cancel) = spawn_device(device(SECRET));
        let sink = MemorySink::new();
        let session = session(stream, false, sink.clone());

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(session.run(cancel.clone()));
        sleep(Duration::from_millis(300)).await;
        assert!(!handle.is_finished());

        cancel.cancel();
        assert!(handle.await.unwrap().is_ok());
        assert!(sink.is_empty().await);
        device_cancel.cancel();
    }

    #[tokio::test]
    async fn test_run_ends_with_authentication_failure_after_cooldown() {
        let (stream, device_cancel) = spawn_device(device(0x1111));
        let session = session(stream, true, MemorySink::new());

        let started = Instant::now();
        let result = session.run(CancellationToken::new()).await;
        assert!(matches!(result, Err(PollerError::AuthenticationFailed { .. })));
        assert!(started.elapsed() >= Duration::from_millis(200));
        device_cancel.cancel();
    }

    /// In-memory device whose reads outside the identity block fail with the
    /// injected error while one is set
    struct FaultyTransport {
        simulator: DeviceSimulator,
        fault: Arc<Mutex<Option<PollerError>>>,
        stats: TransportStats,
    }

    #[async_trait]
    impl ModbusTransport for FaultyTransport {
        async fn send_receive(&mut self, request: &RequestFrame) -> PollerResult<ResponseFrame> {
            self.stats.requests_sent += 1;
            let fault = self.fault.lock().unwrap().clone();
            if let Some(fault) = fault {
                if request.address != crate::IDENTITY_REGISTER {
                    return Err(fault);
                }
            }
            let reply = self
                .simulator
                .handle_frame(&request.encode())
                .ok_or_else(|| PollerError::frame("no reply"))?;
            ResponseFrame::decode(&reply)
        }

        async fn close(&mut self) -> PollerResult<()> {
            Ok(())
        }

        fn get_stats(&self) -> TransportStats {
            self.stats.clone()
        }
    }

    type FaultHandle = Arc<Mutex<Option<PollerError>>>;

    fn faulty_session(
        config: SessionConfig,
        bundling: BundlingConfig,
        sink: MemorySink,
    ) -> (DeviceSession<FaultyTransport>, FaultHandle, DeviceSimulator) {
        crate::logging::init_test_logger();
        let simulator = device(SECRET);
        let fault: FaultHandle = Arc::new(Mutex::new(None));
        let transport = FaultyTransport {
            simulator: simulator.clone(),
            fault: fault.clone(),
            stats: TransportStats::default(),
        };
        let context = SessionContext {
            authenticator: Arc::new(registry(true)),
            catalog: Arc::new(catalog()),
            sink: Arc::new(sink),
        };
        let session = DeviceSession::new(transport, "faulty", config, bundling, context);
        (session, fault, simulator)
    }

    #[tokio::test]
    async fn test_fatal_cycle_error_ends_run_without_saving() {
        for fault in [
            PollerError::exception(3, 0x04, 0x10),
            PollerError::request_timeout("read 0x0010 x6", 3000, 3),
        ] {
            let sink = MemorySink::new();
            let (session, injected, _device) =
                faulty_session(SessionConfig::default(), BundlingConfig::default(), sink.clone());
            *injected.lock().unwrap() = Some(fault.clone());

            let result = tokio::time::timeout(Duration::from_secs(5), session.run(CancellationToken::new()))
                .await
                .unwrap();
            assert_eq!(result, Err(fault));
            assert!(sink.is_empty().await);
        }
    }

    #[tokio::test]
    async fn test_benign_exception_is_skipped() {
        let config = SessionConfig {
            benign_exception_codes: vec![0x02],
            ..Default::default()
        };
        let (mut session, injected, _device) =
            faulty_session(config, BundlingConfig::default(), MemorySink::new());
        session.authenticate().await.unwrap();

        *injected.lock().unwrap() = Some(PollerError::exception(3, 0x02, 0x10));
        let report = session.poll_cycle().await.unwrap();
        assert_eq!(report, CycleReport { polled: 0, skipped: 2 });
        assert_eq!(session.state(), SessionState::Active);
        assert!(session.snapshot().is_empty());
        // handshake plus a single attempt on the shared bundle
        assert_eq!(session.transport().get_stats().requests_sent, 2);

        *injected.lock().unwrap() = None;
        let report = session.poll_cycle().await.unwrap();
        assert_eq!(report, CycleReport { polled: 2, skipped: 0 });
        assert_eq!(session.metrics().successful_cycles, 2);
    }

    #[tokio::test]
    async fn test_recoverable_failure_keeps_previous_value() {
        let bundling = BundlingConfig {
            ttl_ms: 1,
            ..Default::default()
        };
        let (mut session, injected, device) =
            faulty_session(SessionConfig::default(), bundling, MemorySink::new());
        session.authenticate().await.unwrap();
        session.poll_cycle().await.unwrap();
        assert_eq!(session.snapshot().get("speed").unwrap().value, "42");

        sleep(Duration::from_millis(5)).await;
        *injected.lock().unwrap() = Some(PollerError::crc(0x1234, 0x4321));
        let report = session.poll_cycle().await.unwrap();
        assert_eq!(report, CycleReport { polled: 0, skipped: 2 });
        assert_eq!(session.snapshot().get("speed").unwrap().value, "42");

        *injected.lock().unwrap() = None;
        device.bank().write_holding_registers(0x10, &[30]).unwrap();
        sleep(Duration::from_millis(5)).await;
        let report = session.poll_cycle().await.unwrap();
        assert_eq!(report, CycleReport { polled: 2, skipped: 0 });
        assert_eq!(session.snapshot().get("speed").unwrap().value, "60");
    }
}
