//! Typed value decoding
//!
//! Turns the raw register words of one parameter into its display string.
//! Type tags (`uint16`, `int32`, `string[16]`, `bitflags[2]`, ...) are resolved
//! into [`ValueType`] once, when the catalog is loaded.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{PollerError, PollerResult};

/// Upper bound of words a string value is read from
pub const MAX_STRING_WORDS: usize = 16;

/// First byte of the legacy 8-bit Cyrillic range
const LEGACY_RANGE_START: u8 = 0xA1;

/// Last byte of the legacy 8-bit Cyrillic range
const LEGACY_RANGE_END: u8 = 0xF1;

/// Offset from a legacy byte to its Unicode code point
const LEGACY_CODEPOINT_OFFSET: u32 = 0x360;

/// Fractional digits kept when formatting floats
const FLOAT_FRACTION_DIGITS: usize = 5;

/// Declared type of a polled quantity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ValueType {
    UInt16,
    Int16,
    UInt32,
    Int32,
    Float,
    Bool,
    /// Legacy 8-bit string packed two bytes per word
    String { len: u16 },
    /// Bit-flag blob spanning `len` words
    BitFlags { len: u16 },
}

impl ValueType {
    /// Number of registers the value occupies
    pub fn word_len(&self) -> u16 {
        match self {
            ValueType::UInt16 | ValueType::Int16 | ValueType::Bool => 1,
            ValueType::UInt32 | ValueType::Int32 | ValueType::Float => 2,
            ValueType::String { len } | ValueType::BitFlags { len } => *len,
        }
    }

    /// Decode `words` into a display string
    ///
    /// `multiplier` scales the integer types only. Formatting is locale independent
    /// (dot decimal separator).
    ///
    /// # Errors
    ///
    /// `InvalidData` when fewer than [`ValueType::word_len`] words are supplied.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use voltage_poller::ValueType;
    ///
    /// assert_eq!(ValueType::UInt16.decode(&[0x0001], 2.0).unwrap(), "2");
    /// assert_eq!(ValueType::Int32.decode(&[0x0001, 0x0000], 1.0).unwrap(), "1");
    /// assert_eq!(ValueType::String { len: 1 }.decode(&[0x4241], 1.0).unwrap(), "AB");
    /// ```
    pub fn decode(&self, words: &[u16], multiplier: f64) -> PollerResult<String> {
        let needed = self.word_len() as usize;
        if words.len() < needed {
            return Err(PollerError::invalid_data(format!(
                "{} needs {} word(s), got {}",
                self,
                needed,
                words.len()
            )));
        }

        let value = match self {
            ValueType::UInt16 => format_number(words[0] as f64 * multiplier),
            ValueType::Int16 => format_number(words[0] as i16 as f64 * multiplier),
            ValueType::UInt32 => format_number(combine_words(words[1], words[0]) as f64 * multiplier),
            ValueType::Int32 => {
                format_number(combine_words(words[1], words[0]) as i32 as f64 * multiplier)
            }
            // Same word order as the 32-bit integers: low word first.
            ValueType::Float => format_float(f32::from_bits(combine_words(words[1], words[0]))),
            ValueType::Bool => (words[0] & 1).to_string(),
            ValueType::String { len } => decode_legacy_string(&words[..*len as usize]),
            ValueType::BitFlags { len } => decode_bitflags(&words[..*len as usize]),
        };
        Ok(value)
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValueType::UInt16 => write!(f, "uint16"),
            ValueType::Int16 => write!(f, "int16"),
            ValueType::UInt32 => write!(f, "uint32"),
            ValueType::Int32 => write!(f, "int32"),
            ValueType::Float => write!(f, "float"),
            ValueType::Bool => write!(f, "bool"),
            ValueType::String { len } => write!(f, "string[{}]", len),
            ValueType::BitFlags { len } => write!(f, "bitflags[{}]", len),
        }
    }
}

impl FromStr for ValueType {
    type Err = PollerError;

    fn from_str(tag: &str) -> Result<Self, Self::Err> {
        let tag = tag.trim();
        if let Some(len) = parse_sized_tag(tag, "string")? {
            return Ok(ValueType::String { len });
        }
        if let Some(len) = parse_sized_tag(tag, "bitflags")? {
            return Ok(ValueType::BitFlags { len });
        }

        match tag {
            "uint16" => Ok(ValueType::UInt16),
            "int16" => Ok(ValueType::Int16),
            "uint32" => Ok(ValueType::UInt32),
            "int32" => Ok(ValueType::Int32),
            "float" => Ok(ValueType::Float),
            "bool" => Ok(ValueType::Bool),
            other => Err(PollerError::catalog(format!("Unknown type tag: {:?}", other))),
        }
    }
}

impl TryFrom<String> for ValueType {
    type Error = PollerError;

    fn try_from(tag: String) -> Result<Self, Self::Error> {
        tag.parse()
    }
}

impl From<ValueType> for String {
    fn from(value_type: ValueType) -> Self {
        value_type.to_string()
    }
}

/// Parse `name[N]`, returning `None` when the tag has a different name
fn parse_sized_tag(tag: &str, name: &str) -> PollerResult<Option<u16>> {
    let Some(rest) = tag.strip_prefix(name) else {
        return Ok(None);
    };
    let len = rest
        .strip_prefix('[')
        .and_then(|r| r.strip_suffix(']'))
        .and_then(|n| n.trim().parse::<u16>().ok())
        .filter(|&n| n > 0)
        .ok_or_else(|| PollerError::catalog(format!("Malformed type tag: {:?}", tag)))?;
    Ok(Some(len))
}

/// Combine two registers into 32 bits
pub fn combine_words(high: u16, low: u16) -> u32 {
    ((high as u32) << 16) | low as u32
}

/// Invariant-culture number formatting: shortest round-trip, no exponent
fn format_number(value: f64) -> String {
    format!("{}", value)
}

/// Up to five fractional digits, trailing zeros dropped
fn format_float(value: f32) -> String {
    if !value.is_finite() {
        return value.to_string();
    }
    let fixed = format!("{:.*}", FLOAT_FRACTION_DIGITS, value as f64);
    let trimmed = fixed.trim_end_matches('0').trim_end_matches('.');
    if trimmed == "-0" {
        "0".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Split up to 16 words into bytes (low byte first) and read until the first zero
///
/// Bytes in the legacy Cyrillic range are shifted into the Unicode Cyrillic block;
/// every other byte is taken as its Latin-1 code point.
pub fn decode_legacy_string(words: &[u16]) -> String {
    words
        .iter()
        .take(MAX_STRING_WORDS)
        .flat_map(|word| word.to_le_bytes())
        .take_while(|&byte| byte != 0)
        .map(legacy_byte_to_char)
        .collect()
}

fn legacy_byte_to_char(byte: u8) -> char {
    if (LEGACY_RANGE_START..=LEGACY_RANGE_END).contains(&byte) {
        let code_point = (byte as u32 + LEGACY_CODEPOINT_OFFSET) % 0x10000;
        char::from_u32(code_point).unwrap_or(char::REPLACEMENT_CHARACTER)
    } else {
        byte as char
    }
}

/// Reverse the words and concatenate the decimal digits of each one's low byte
fn decode_bitflags(words: &[u16]) -> String {
    words
        .iter()
        .rev()
        .map(|&word| (word as u8).to_string())
        .collect()
}
