/// Frame codec for the controller dialect
///
/// Requests and responses are raw Modbus RTU-style frames carried over a plain
/// byte stream: unit id, function code, payload, CRC16 (low byte first).
/// Only function codes 1 (read coils) and 3 (read holding registers) are spoken.
/// Nothing in this module performs I/O.

use bytes::{BufMut, BytesMut};
use crc::{Crc, CRC_16_MODBUS};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{PollerError, PollerResult};

/// Modbus unit identifier
pub type UnitId = u8;

/// Request frame length: unit id + function + address (2) + count (2) + CRC (2)
pub const REQUEST_FRAME_LEN: usize = 8;

/// Smallest response: unit id + function + byte count or exception code + CRC
pub const MIN_RESPONSE_LEN: usize = 5;

/// Bit marking an exception response in the function code byte
pub const EXCEPTION_FLAG: u8 = 0x80;

/// CRC16 (reflected polynomial 0xA001, seed 0xFFFF); the table is built at compile time
const CRC_MODBUS: Crc<u16> = Crc::<u16>::new(&CRC_16_MODBUS);

/// Compute the Modbus CRC16 of `data`
pub fn crc16(data: &[u8]) -> u16 {
    CRC_MODBUS.checksum(data)
}

/// Check that the trailing two bytes of `frame` are the CRC16 of the rest
pub fn validate_crc(frame: &[u8]) -> bool {
    if frame.len() < 2 {
        return false;
    }
    let split = frame.len() - 2;
    crc16(&frame[..split]) == u16::from_le_bytes([frame[split], frame[split + 1]])
}

/// Read function codes spoken by the poller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
#[repr(u8)]
pub enum ModbusFunction {
    /// Read Coils (0x01)
    ReadCoils = 0x01,
    /// Read Holding Registers (0x03)
    ReadHoldingRegisters = 0x03,
}

impl ModbusFunction {
    /// Convert from u8 to ModbusFunction
    pub fn from_u8(value: u8) -> PollerResult<Self> {
        match value {
            0x01 => Ok(ModbusFunction::ReadCoils),
            0x03 => Ok(ModbusFunction::ReadHoldingRegisters),
            _ => Err(PollerError::invalid_argument(format!(
                "Function code must be 1 or 3, got {}",
                value
            ))),
        }
    }

    /// Convert to u8
    pub fn to_u8(self) -> u8 {
        self as u8
    }

    /// Largest quantity a single request may ask for
    pub fn max_quantity(self) -> u16 {
        match self {
            ModbusFunction::ReadCoils => crate::MAX_COILS_PER_REQUEST,
            ModbusFunction::ReadHoldingRegisters => crate::MAX_REGISTERS_PER_REQUEST,
        }
    }
}

impl TryFrom<u8> for ModbusFunction {
    type Error = PollerError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::from_u8(value)
    }
}

impl From<ModbusFunction> for u8 {
    fn from(function: ModbusFunction) -> Self {
        function.to_u8()
    }
}

impl fmt::Display for ModbusFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ModbusFunction::ReadCoils => "Read Coils",
            ModbusFunction::ReadHoldingRegisters => "Read Holding Registers",
        };
        write!(f, "{} (0x{:02X})", name, *self as u8)
    }
}

/// Encode a read request
///
/// Layout: unit id, function code, start address (big-endian), word count
/// (big-endian), CRC16 of the preceding six bytes (little-endian).
///
/// # Errors
///
/// `InvalidArgument` when `function_code` is not 1 or 3.
///
/// # Examples
///
/// ```rust
/// use voltage_poller::protocol::encode_request;
///
/// let frame = encode_request(1, 3, 0x0000, 2).unwrap();
/// assert_eq!(frame, vec![0x01, 0x03, 0x00, 0x00, 0x00, 0x02, 0xC4, 0x0B]);
/// assert!(encode_request(1, 5, 0, 1).is_err());
/// ```
pub fn encode_request(
    unit_id: UnitId,
    function_code: u8,
    start_address: u16,
    word_count: u16,
) -> PollerResult<Vec<u8>> {
    let function = ModbusFunction::from_u8(function_code)?;
    Ok(RequestFrame::new(unit_id, function, start_address, word_count).encode())
}

/// Decode a response frame, validating its CRC
///
/// # Errors
///
/// `Frame` when the buffer is too short, `Crc` when the trailing bytes do not
/// match the checksum of the rest of the frame.
pub fn decode_response(bytes: &[u8]) -> PollerResult<ResponseFrame> {
    ResponseFrame::decode(bytes)
}

/// Read request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestFrame {
    pub unit_id: UnitId,
    pub function: ModbusFunction,
    pub address: u16,
    pub quantity: u16,
}

impl RequestFrame {
    /// Create a new read request
    pub fn new(unit_id: UnitId, function: ModbusFunction, address: u16, quantity: u16) -> Self {
        Self {
            unit_id,
            function,
            address,
            quantity,
        }
    }

    /// Encode to wire bytes
    pub fn encode(&self) -> Vec<u8> {
        let mut frame = BytesMut::with_capacity(REQUEST_FRAME_LEN);
        frame.put_u8(self.unit_id);
        frame.put_u8(self.function.to_u8());
        frame.put_u16(self.address);
        frame.put_u16(self.quantity);
        let crc = crc16(&frame);
        frame.put_u16_le(crc);
        frame.to_vec()
    }

    /// Parse a request frame (used by the device simulator)
    pub fn decode(bytes: &[u8]) -> PollerResult<Self> {
        if bytes.len() < REQUEST_FRAME_LEN {
            return Err(PollerError::frame(format!(
                "Request frame too short: {} bytes",
                bytes.len()
            )));
        }
        let frame = &bytes[..REQUEST_FRAME_LEN];
        if !validate_crc(frame) {
            let expected = crc16(&frame[..6]);
            let actual = u16::from_le_bytes([frame[6], frame[7]]);
            return Err(PollerError::crc(expected, actual));
        }
        Ok(Self {
            unit_id: frame[0],
            function: ModbusFunction::from_u8(frame[1])?,
            address: u16::from_be_bytes([frame[2], frame[3]]),
            quantity: u16::from_be_bytes([frame[4], frame[5]]),
        })
    }
}

impl fmt::Display for RequestFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "unit {} {} @ {:#06X} x{}",
            self.unit_id, self.function, self.address, self.quantity
        )
    }
}

/// Response frame with a validated CRC
///
/// Header fields are read straight from the raw bytes; the payload word array is
/// only materialised when [`ResponseFrame::words`] is called.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseFrame {
    raw: Vec<u8>,
}

impl ResponseFrame {
    /// Validate the CRC and wrap the frame
    pub fn decode(bytes: &[u8]) -> PollerResult<Self> {
        if bytes.len() < MIN_RESPONSE_LEN {
            return Err(PollerError::frame(format!(
                "Response frame too short: {} bytes",
                bytes.len()
            )));
        }

        let split = bytes.len() - 2;
        let expected = crc16(&bytes[..split]);
        let actual = u16::from_le_bytes([bytes[split], bytes[split + 1]]);
        if expected != actual {
            return Err(PollerError::crc(expected, actual));
        }

        Ok(Self { raw: bytes.to_vec() })
    }

    /// Unit id (byte 0)
    pub fn unit_id(&self) -> UnitId {
        self.raw[0]
    }

    /// Raw function code (byte 1), exception flag included
    pub fn function_code(&self) -> u8 {
        self.raw[1]
    }

    /// Exception code, 0 unless the function code carries the exception flag
    pub fn exception_code(&self) -> u8 {
        if self.function_code() >= 0x81 {
            self.raw[2]
        } else {
            0
        }
    }

    /// Check if this is an exception response
    pub fn is_exception(&self) -> bool {
        self.exception_code() != 0
    }

    /// Declared payload byte count, 0 for exception responses
    pub fn byte_count(&self) -> u8 {
        if self.exception_code() == 0 {
            self.raw[2]
        } else {
            0
        }
    }

    /// Payload bytes actually present between the byte count and the CRC
    fn payload(&self) -> &[u8] {
        let end = self.raw.len() - 2;
        if end <= 3 {
            return &[];
        }
        let declared = self.byte_count() as usize;
        &self.raw[3..end.min(3 + declared)]
    }

    /// Payload as 16-bit words
    ///
    /// Function 3: each big-endian byte pair is one word.
    /// Function 1: each byte expands to 8 words holding its bits, LSB first.
    /// A declared byte count larger than the payload is truncated to what arrived.
    pub fn words(&self) -> Vec<u16> {
        if self.byte_count() == 0 {
            return Vec::new();
        }

        let payload = self.payload();
        match self.function_code() {
            0x03 => payload
                .chunks_exact(2)
                .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
                .collect(),
            0x01 => payload
                .iter()
                .flat_map(|&byte| (0..8).map(move |bit| ((byte >> bit) & 1) as u16))
                .collect(),
            _ => Vec::new(),
        }
    }

    /// Wire bytes of the frame
    pub fn as_bytes(&self) -> &[u8] {
        &self.raw
    }

    /// Frame length in bytes
    pub fn len(&self) -> usize {
        self.raw.len()
    }

    /// Always false, decoded frames carry at least a header and CRC
    pub fn is_empty(&self) -> bool {
        self.raw.is_empty()
    }
}

/// Append the CRC to a frame body
fn seal(mut frame: BytesMut) -> Vec<u8> {
    let crc = crc16(&frame);
    frame.put_u16_le(crc);
    frame.to_vec()
}

/// Encode a function 3 response carrying `registers`
pub fn encode_register_response(unit_id: UnitId, registers: &[u16]) -> Vec<u8> {
    let mut frame = BytesMut::with_capacity(5 + registers.len() * 2);
    frame.put_u8(unit_id);
    frame.put_u8(ModbusFunction::ReadHoldingRegisters.to_u8());
    frame.put_u8((registers.len() * 2) as u8);
    for &register in registers {
        frame.put_u16(register);
    }
    seal(frame)
}

/// Encode a function 1 response packing `coils` LSB first
pub fn encode_coil_response(unit_id: UnitId, coils: &[bool]) -> Vec<u8> {
    let byte_count = (coils.len() + 7) / 8;
    let mut packed = vec![0u8; byte_count];
    for (i, &coil) in coils.iter().enumerate() {
        if coil {
            packed[i / 8] |= 1 << (i % 8);
        }
    }

    let mut frame = BytesMut::with_capacity(5 + byte_count);
    frame.put_u8(unit_id);
    frame.put_u8(ModbusFunction::ReadCoils.to_u8());
    frame.put_u8(byte_count as u8);
    frame.put_slice(&packed);
    seal(frame)
}

/// Encode an exception response for `function_code`
pub fn encode_exception_response(unit_id: UnitId, function_code: u8, exception_code: u8) -> Vec<u8> {
    let mut frame = BytesMut::with_capacity(5);
    frame.put_u8(unit_id);
    frame.put_u8(function_code | EXCEPTION_FLAG);
    frame.put_u8(exception_code);
    seal(frame)
}
