/// Controller simulator
///
/// Dials a running poller and answers its requests like a machine controller.
///
/// Usage: `device_simulator [ADDRESS] [SERIES] [ID] [SECRET]`
/// (defaults: `127.0.0.1:8899 2 7 23130`).

use anyhow::{Context, Result};
use log::{info, warn};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;

use voltage_poller::config::LoggingConfig;
use voltage_poller::{logging, DeviceSimulator, IDENTITY_REGISTER};

/// Registers that wander a little between polls
const LIVE_REGISTERS: [u16; 4] = [0x0010, 0x0011, 0x0012, 0x0013];

fn arg<T: std::str::FromStr>(index: usize, default: T) -> T {
    std::env::args()
        .nth(index)
        .and_then(|value| value.parse().ok())
        .unwrap_or(default)
}

#[tokio::main]
async fn main() -> Result<()> {
    logging::init(&LoggingConfig::default());

    let address: String = arg(1, format!("127.0.0.1:{}", voltage_poller::DEFAULT_LISTEN_PORT));
    let series: u16 = arg(2, 2);
    let id: u16 = arg(3, 7);
    let secret: u16 = arg(4, 0x5A5A);

    let simulator = DeviceSimulator::new(1)
        .with_identity(IDENTITY_REGISTER, series, id, secret, 1)
        .with_response_delay(Duration::from_millis(20));
    let bank = simulator.bank();
    bank.write_holding_registers(0x0010, &[220, 231, 18, 1500])?;
    bank.write_u32(0x0014, 123_456)?;
    bank.write_string(0x1B58, "COTTON 60", 16)?;
    bank.write_string(0x1B68, "WASH", 16)?;
    bank.write_coils(0x0000, &[true, false, true, true])?;

    let stream = TcpStream::connect(address.as_str())
        .await
        .with_context(|| format!("connecting to {}", address))?;
    info!("📡 Connected to {} as device {}:{}", address, series, id);

    let cancel = CancellationToken::new();
    let drifter = {
        let simulator = simulator.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let mut tick = interval(Duration::from_secs(1));
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tick.tick() => {
                        if let Err(e) = simulator.drift(&LIVE_REGISTERS) {
                            warn!("drift failed: {}", e);
                        }
                    }
                }
            }
        })
    };

    tokio::select! {
        result = simulator.serve(stream, cancel.clone()) => result?,
        _ = tokio::signal::ctrl_c() => info!("🛑 Interrupted"),
    }

    cancel.cancel();
    drifter.await?;
    Ok(())
}
