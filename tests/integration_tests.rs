//! Integration tests for the poller
//!
//! Each test starts a real `PollerServer` on an ephemeral port and lets one or
//! more simulated controllers dial in over TCP.

use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use voltage_poller::*;

const SERIES: u16 = 4;
const ID: u16 = 21;
const SECRET: u16 = 0x0BAD;
const PLC_VERSION: u16 = 2;

fn registry() -> DeviceRegistry {
    DeviceRegistry::new(vec![DeviceRecord {
        device_id: DeviceIdentity::compose_id(SERIES, ID),
        code: SECRET,
        series_id: SERIES as u32,
        name: "Dryer 21".to_string(),
        active: true,
    }])
}

fn catalog() -> StaticCatalog {
    StaticCatalog::new().with_series(
        SERIES as u32,
        vec![
            RegisterDescriptor::new(0x20, ModbusFunction::ReadHoldingRegisters, ValueType::Int16, "drum_temp")
                .with_name("Drum temperature")
                .with_multiplier(0.5),
            RegisterDescriptor::new(0x22, ModbusFunction::ReadHoldingRegisters, ValueType::UInt32, "runtime"),
            RegisterDescriptor::new(
                0x1B58,
                ModbusFunction::ReadHoldingRegisters,
                ValueType::String { len: 8 },
                "program_name",
            ),
            RegisterDescriptor::new(0x05, ModbusFunction::ReadCoils, ValueType::Bool, "door_open"),
        ],
    )
}

fn config() -> PollerConfig {
    let mut config = PollerConfig::default();
    config.server.bind_address = "127.0.0.1:0".to_string();
    config.session.cycle_interval_ms = 50;
    config.session.request_timeout_ms = 500;
    config.session.auth_cooldown_ms = 100;
    config
}

fn device(secret: u16) -> DeviceSimulator {
    let simulator = DeviceSimulator::new(1).with_identity(IDENTITY_REGISTER, SERIES, ID, secret, PLC_VERSION);
    let bank = simulator.bank();
    bank.write_holding_registers(0x20, &[(-40i16) as u16]).unwrap();
    bank.write_u32(0x22, 70_000).unwrap();
    bank.write_string(0x1B58, "COTTON", 8).unwrap();
    bank.write_coils(0x05, &[true]).unwrap();
    simulator
}

/// Dial the server and answer its requests in the background
async fn connect_device(addr: std::net::SocketAddr, simulator: DeviceSimulator) -> CancellationToken {
    let stream = TcpStream::connect(addr).await.unwrap();
    let cancel = CancellationToken::new();
    let device_cancel = cancel.clone();
    tokio::spawn(async move { simulator.serve(stream, device_cancel).await });
    cancel
}

async fn wait_for<F, Fut>(mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    timeout(Duration::from_secs(5), async {
        while !condition().await {
            sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test]
async fn test_controller_is_polled_into_sink() {
    let sink = MemorySink::new();
    let context = SessionContext {
        authenticator: Arc::new(registry()),
        catalog: Arc::new(catalog()),
        sink: Arc::new(sink.clone()),
    };
    let mut server = PollerServer::new(config(), context);
    let addr = server.start().await.unwrap();

    let device_cancel = connect_device(addr, device(SECRET)).await;
    wait_for(|| {
        let sink = sink.clone();
        async move { sink.len().await >= 2 }
    })
    .await;

    let snapshots = sink.snapshots().await;
    let latest = snapshots.last().unwrap();
    assert_eq!(latest.device_id, DeviceIdentity::compose_id(SERIES, ID));
    assert_eq!(latest.device_name, "Dryer 21");
    assert_eq!(latest.get("drum_temp").unwrap().value, "-20");
    assert_eq!(latest.get("drum_temp").unwrap().name, "Drum temperature");
    assert_eq!(latest.get("runtime").unwrap().value, "70000");
    assert_eq!(latest.get("door_open").unwrap().value, "1");
    assert_eq!(latest.program_name.as_deref(), Some("COTTON"));

    let stats = server.get_stats().await;
    assert_eq!(stats.connections_accepted, 1);
    assert_eq!(stats.active_sessions, 1);

    device_cancel.cancel();
    server.stop();
}

#[tokio::test]
async fn test_rejected_secret_ends_session() {
    let sink = MemorySink::new();
    let context = SessionContext {
        authenticator: Arc::new(registry()),
        catalog: Arc::new(catalog()),
        sink: Arc::new(sink.clone()),
    };
    let mut server = PollerServer::new(config(), context);
    let addr = server.start().await.unwrap();

    let device_cancel = connect_device(addr, device(0x0000)).await;
    wait_for(|| {
        let server = &server;
        async move { server.get_stats().await.failed_sessions == 1 }
    })
    .await;

    let stats = server.get_stats().await;
    assert_eq!(stats.active_sessions, 0);
    assert_eq!(stats.finished_sessions, 1);
    assert!(sink.is_empty().await);

    device_cancel.cancel();
    server.stop();
}

#[tokio::test]
async fn test_connections_over_limit_are_rejected() {
    let mut config = config();
    config.server.max_connections = 1;
    let context = SessionContext {
        authenticator: Arc::new(registry()),
        catalog: Arc::new(catalog()),
        sink: Arc::new(MemorySink::new()),
    };
    let mut server = PollerServer::new(config, context);
    let addr = server.start().await.unwrap();

    let first = connect_device(addr, device(SECRET)).await;
    wait_for(|| {
        let server = &server;
        async move { server.get_stats().await.connections_accepted == 1 }
    })
    .await;

    let second = connect_device(addr, device(SECRET)).await;
    wait_for(|| {
        let server = &server;
        async move { server.get_stats().await.connections_rejected == 1 }
    })
    .await;
    assert_eq!(server.get_stats().await.active_sessions, 1);

    first.cancel();
    second.cancel();
    server.stop();
}

#[tokio::test]
async fn test_file_catalog_and_file_sink() {
    let dir = tempfile::tempdir().unwrap();
    let catalog_json = r#"{
        "parameters": [
            {"address": "20", "read_function": 3, "name": "Drum temperature",
             "codename": "drum_temp", "type": "int16", "multiplier": 0.5},
            {"address": "20", "read_function": 3, "name": "Drum temperature",
             "codename": "drum_temp", "type": "int16", "multiplier": 1.0, "version": 2},
            {"address": "30", "read_function": 3, "name": "Unused", "poll": false}
        ]
    }"#;
    std::fs::write(dir.path().join(format!("{}.json", SERIES)), catalog_json).unwrap();
    let output = dir.path().join("telemetry.jsonl");

    let context = SessionContext {
        authenticator: Arc::new(registry()),
        catalog: Arc::new(JsonCatalogProvider::new(dir.path())),
        sink: Arc::new(FileSink::new(&output)),
    };
    let mut server = PollerServer::new(config(), context);
    let addr = server.start().await.unwrap();

    let device_cancel = connect_device(addr, device(SECRET)).await;
    wait_for(|| {
        let output = output.clone();
        async move {
            tokio::fs::read_to_string(&output)
                .await
                .map(|text| text.contains('\n'))
                .unwrap_or(false)
        }
    })
    .await;
    device_cancel.cancel();
    server.stop();

    let text = std::fs::read_to_string(&output).unwrap();
    let first_line = text.lines().next().unwrap();
    let snapshot: TelemetrySnapshot = serde_json::from_str(first_line).unwrap();
    assert_eq!(snapshot.len(), 1);
    // PLC version 2 selects the unscaled entry
    assert_eq!(snapshot.get("drum_temp").unwrap().value, "-40");
}
