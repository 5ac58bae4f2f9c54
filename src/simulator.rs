//! Controller simulator
//!
//! An in-process stand-in for a machine controller: a [`RegisterBank`] holding
//! coils and holding registers, and a [`DeviceSimulator`] answering function 1
//! and 3 requests from it over any byte stream. Used by the integration tests
//! and the `device_simulator` binary.

use log::{debug, info, warn};
use rand::Rng;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

use crate::error::{PollerError, PollerResult};
use crate::protocol::{
    encode_coil_response, encode_exception_response, encode_register_response, ModbusFunction,
    RequestFrame, UnitId,
};

/// Exception code for function codes other than 1 and 3
pub const ILLEGAL_FUNCTION: u8 = 0x01;

/// Exception code for a zero or oversized quantity
pub const ILLEGAL_DATA_VALUE: u8 = 0x03;

/// Exception code used for injected faults
pub const SERVER_DEVICE_FAILURE: u8 = 0x04;

/// Thread-safe storage for coils and holding registers
///
/// Unset addresses read as 0 / false. Clones share the same storage.
#[derive(Debug, Clone, Default)]
pub struct RegisterBank {
    coils: Arc<RwLock<HashMap<u16, bool>>>,
    holding_registers: Arc<RwLock<HashMap<u16, u16>>>,
}

impl RegisterBank {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read coils starting at address (function code 0x01)
    pub fn read_coils(&self, address: u16, quantity: u16) -> PollerResult<Vec<bool>> {
        let coils = self
            .coils
            .read()
            .map_err(|_| PollerError::internal("Failed to lock coils"))?;
        Ok((0..quantity)
            .map(|i| coils.get(&address.wrapping_add(i)).copied().unwrap_or(false))
            .collect())
    }

    pub fn write_coils(&self, address: u16, values: &[bool]) -> PollerResult<()> {
        let mut coils = self
            .coils
            .write()
            .map_err(|_| PollerError::internal("Failed to lock coils"))?;
        for (i, &value) in values.iter().enumerate() {
            coils.insert(address.wrapping_add(i as u16), value);
        }
        Ok(())
    }

    /// Read holding registers starting at address (function code 0x03)
    pub fn read_holding_registers(&self, address: u16, quantity: u16) -> PollerResult<Vec<u16>> {
        let registers = self
            .holding_registers
            .read()
            .map_err(|_| PollerError::internal("Failed to lock holding registers"))?;
        Ok((0..quantity)
            .map(|i| registers.get(&address.wrapping_add(i)).copied().unwrap_or(0))
            .collect())
    }

    pub fn write_holding_registers(&self, address: u16, values: &[u16]) -> PollerResult<()> {
        let mut registers = self
            .holding_registers
            .write()
            .map_err(|_| PollerError::internal("Failed to lock holding registers"))?;
        for (i, &value) in values.iter().enumerate() {
            registers.insert(address.wrapping_add(i as u16), value);
        }
        Ok(())
    }

    /// Store `text` two bytes per word, low byte first, zero padded to `words`
    ///
    /// Characters outside Latin-1 are written as `?`.
    pub fn write_string(&self, address: u16, text: &str, words: u16) -> PollerResult<()> {
        let mut bytes: Vec<u8> = text
            .chars()
            .map(|c| u8::try_from(c as u32).unwrap_or(b'?'))
            .collect();
        bytes.resize(words as usize * 2, 0);
        let packed: Vec<u16> = bytes
            .chunks_exact(2)
            .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
            .collect();
        self.write_holding_registers(address, &packed)
    }

    /// Store a 32-bit value low word first
    pub fn write_u32(&self, address: u16, value: u32) -> PollerResult<()> {
        self.write_holding_registers(address, &[value as u16, (value >> 16) as u16])
    }

    pub fn get_stats(&self) -> RegisterBankStats {
        RegisterBankStats {
            coils_count: self.coils.read().map(|c| c.len()).unwrap_or(0),
            holding_registers_count: self.holding_registers.read().map(|r| r.len()).unwrap_or(0),
        }
    }
}

/// Register bank statistics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterBankStats {
    pub coils_count: usize,
    pub holding_registers_count: usize,
}

/// Simulated controller
#[derive(Debug, Clone)]
pub struct DeviceSimulator {
    unit_id: UnitId,
    bank: RegisterBank,
    response_delay: Duration,
    /// Probability (0.0 to 1.0) of answering with a device failure
    error_rate: f32,
}

impl DeviceSimulator {
    pub fn new(unit_id: UnitId) -> Self {
        Self {
            unit_id,
            bank: RegisterBank::new(),
            response_delay: Duration::ZERO,
            error_rate: 0.0,
        }
    }

    /// Write the four-word identity block: series, id, secret, PLC version
    pub fn with_identity(self, register: u16, series: u16, id: u16, secret: u16, plc_version: u16) -> Self {
        // a fresh bank cannot be poisoned
        let _ = self
            .bank
            .write_holding_registers(register, &[series, id, secret, plc_version]);
        self
    }

    pub fn with_response_delay(mut self, delay: Duration) -> Self {
        self.response_delay = delay;
        self
    }

    pub fn with_error_rate(mut self, error_rate: f32) -> Self {
        self.error_rate = error_rate.clamp(0.0, 1.0);
        self
    }

    pub fn bank(&self) -> &RegisterBank {
        &self.bank
    }

    /// Answer one request frame
    ///
    /// Returns `None` for frames that must go unanswered: too short, corrupt or
    /// addressed to another unit.
    pub fn handle_frame(&self, frame: &[u8]) -> Option<Vec<u8>> {
        let request = match RequestFrame::decode(frame) {
            Ok(request) => request,
            Err(PollerError::InvalidArgument { .. }) => {
                if frame[0] != self.unit_id {
                    return None;
                }
                debug!("Unsupported function {:#04X}", frame[1]);
                return Some(encode_exception_response(self.unit_id, frame[1], ILLEGAL_FUNCTION));
            }
            Err(e) => {
                warn!("Ignoring request: {}", e);
                return None;
            }
        };

        if request.unit_id != self.unit_id {
            return None;
        }
        let code = request.function.to_u8();
        if request.quantity == 0 || request.quantity > request.function.max_quantity() {
            return Some(encode_exception_response(self.unit_id, code, ILLEGAL_DATA_VALUE));
        }
        if self.error_rate > 0.0 && rand::thread_rng().gen::<f32>() < self.error_rate {
            return Some(encode_exception_response(self.unit_id, code, SERVER_DEVICE_FAILURE));
        }

        let response = match request.function {
            ModbusFunction::ReadCoils => self
                .bank
                .read_coils(request.address, request.quantity)
                .map(|coils| encode_coil_response(self.unit_id, &coils)),
            ModbusFunction::ReadHoldingRegisters => self
                .bank
                .read_holding_registers(request.address, request.quantity)
                .map(|registers| encode_register_response(self.unit_id, &registers)),
        };
        Some(response.unwrap_or_else(|_| {
            encode_exception_response(self.unit_id, code, SERVER_DEVICE_FAILURE)
        }))
    }

    /// Nudge each listed register by -1, 0 or +1
    pub fn drift(&self, addresses: &[u16]) -> PollerResult<()> {
        let mut rng = rand::thread_rng();
        for &address in addresses {
            let current = self.bank.read_holding_registers(address, 1)?[0];
            let step: i32 = rng.gen_range(-1..=1);
            let next = (current as i32 + step).clamp(0, u16::MAX as i32) as u16;
            self.bank.write_holding_registers(address, &[next])?;
        }
        Ok(())
    }

    /// Answer requests on `stream` until the peer leaves or `cancel` fires
    pub async fn serve<S>(&self, mut stream: S, cancel: CancellationToken) -> PollerResult<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let mut buffer = vec![0u8; 256];
        loop {
            let read = tokio::select! {
                _ = cancel.cancelled() => break,
                read = stream.read(&mut buffer) => read?,
            };
            if read == 0 {
                info!("🔌 Poller closed the connection");
                break;
            }

            let Some(response) = self.handle_frame(&buffer[..read]) else {
                continue;
            };
            if !self.response_delay.is_zero() {
                tokio::time::sleep(self.response_delay).await;
            }
            stream.write_all(&response).await?;
            stream.flush().await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{decode_response, encode_request};

    #[test]
    fn test_register_bank() {
        let bank = RegisterBank::new();
        bank.write_holding_registers(100, &[100, 200, 300]).unwrap();
        assert_eq!(bank.read_holding_registers(99, 4).unwrap(), vec![0, 100, 200, 300]);

        bank.write_coils(20, &[true, false, true]).unwrap();
        assert_eq!(bank.read_coils(20, 3).unwrap(), vec![true, false, true]);

        bank.write_string(0x10, "AB", 2).unwrap();
        assert_eq!(bank.read_holding_registers(0x10, 2).unwrap(), vec![0x4241, 0]);

        let stats = bank.get_stats();
        assert_eq!(stats.coils_count, 3);
        assert_eq!(stats.holding_registers_count, 5);
    }

    #[test]
    fn test_identity_block() {
        let simulator = DeviceSimulator::new(1).with_identity(0x1400, 2, 7, 0x5A5A, 3);
        let response = simulator
            .handle_frame(&encode_request(1, 3, 0x1400, 4).unwrap())
            .unwrap();
        assert_eq!(decode_response(&response).unwrap().words(), vec![2, 7, 0x5A5A, 3]);
    }

    #[test]
    fn test_coil_read() {
        let simulator = DeviceSimulator::new(1);
        simulator.bank().write_coils(5, &[true, true]).unwrap();
        let response = simulator.handle_frame(&encode_request(1, 1, 4, 3).unwrap()).unwrap();
        assert_eq!(&decode_response(&response).unwrap().words()[..3], &[0, 1, 1]);
    }

    #[test]
    fn test_rejected_frames() {
        let simulator = DeviceSimulator::new(1);

        let mut corrupt = encode_request(1, 3, 0, 1).unwrap();
        corrupt[7] ^= 0xFF;
        assert!(simulator.handle_frame(&corrupt).is_none());
        assert!(simulator.handle_frame(&encode_request(2, 3, 0, 1).unwrap()).is_none());
        assert!(simulator.handle_frame(&[0x01, 0x03]).is_none());

        // function 4 with a valid CRC
        let mut body = vec![0x01, 0x04, 0x00, 0x00, 0x00, 0x01];
        let crc = crate::protocol::crc16(&body);
        body.extend_from_slice(&crc.to_le_bytes());
        let response = decode_response(&simulator.handle_frame(&body).unwrap()).unwrap();
        assert_eq!(response.function_code(), 0x84);
        assert_eq!(response.exception_code(), ILLEGAL_FUNCTION);

        let response = simulator.handle_frame(&encode_request(1, 3, 0, 200).unwrap()).unwrap();
        assert_eq!(decode_response(&response).unwrap().exception_code(), ILLEGAL_DATA_VALUE);
    }

    #[test]
    fn test_full_error_rate() {
        let simulator = DeviceSimulator::new(1).with_error_rate(1.0);
        let response = simulator.handle_frame(&encode_request(1, 3, 0, 1).unwrap()).unwrap();
        assert_eq!(decode_response(&response).unwrap().exception_code(), SERVER_DEVICE_FAILURE);
    }

    #[test]
    fn test_drift_stays_close() {
        let simulator = DeviceSimulator::new(1);
        simulator.bank().write_holding_registers(0, &[100]).unwrap();
        for _ in 0..10 {
            simulator.drift(&[0]).unwrap();
        }
        let value = simulator.bank().read_holding_registers(0, 1).unwrap()[0];
        assert!((90..=110).contains(&value));
    }

    #[tokio::test]
    async fn test_serve_over_duplex() {
        let (mut poller, device) = tokio::io::duplex(256);
        let simulator = DeviceSimulator::new(1);
        simulator.bank().write_holding_registers(0x20, &[0xBEEF]).unwrap();

        let cancel = CancellationToken::new();
        let task = {
            let simulator = simulator.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { simulator.serve(device, cancel).await })
        };

        poller.write_all(&encode_request(1, 3, 0x20, 1).unwrap()).await.unwrap();
        let mut buffer = [0u8; 64];
        let n = poller.read(&mut buffer).await.unwrap();
        assert_eq!(decode_response(&buffer[..n]).unwrap().words(), vec![0xBEEF]);

        cancel.cancel();
        task.await.unwrap().unwrap();
    }
}
