//! Parameter catalog
//!
//! A catalog lists, per device series, every register worth polling. Entries may
//! be specialised per firmware version; [`select_for_version`] picks the most
//! specific entry per codename and falls back to the version-0 default.

use async_trait::async_trait;
use log::debug;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use tokio::time::Instant;

use crate::error::{PollerError, PollerResult};
use crate::protocol::ModbusFunction;
use crate::value::ValueType;

/// One polled quantity
#[derive(Debug, Clone, PartialEq)]
pub struct RegisterDescriptor {
    /// Register number, relative to the function code
    pub address: u16,
    pub function: ModbusFunction,
    pub value_type: ValueType,
    pub multiplier: f64,
    pub name: String,
    /// Stable key of the telemetry value
    pub codename: String,
    /// Minimum time between two reads
    pub poll_interval: Duration,
    /// Firmware version this entry applies to, 0 for the default
    pub version: u32,
    /// Set by the session after each successful read
    pub last_poll: Option<Instant>,
}

impl RegisterDescriptor {
    /// Create a descriptor with multiplier 1 and no poll history
    pub fn new(
        address: u16,
        function: ModbusFunction,
        value_type: ValueType,
        codename: impl Into<String>,
    ) -> Self {
        let codename = codename.into();
        Self {
            address,
            function,
            value_type,
            multiplier: 1.0,
            name: codename.clone(),
            codename,
            poll_interval: Duration::ZERO,
            version: 0,
            last_poll: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }

    /// Registers occupied by the value
    pub fn word_len(&self) -> u16 {
        self.value_type.word_len()
    }

    /// First address past the value
    pub fn end_address(&self) -> u32 {
        self.address as u32 + self.word_len() as u32
    }

    /// Check whether the poll interval has elapsed at `now`
    pub fn is_due(&self, now: Instant) -> bool {
        match self.last_poll {
            None => true,
            Some(last) => now.saturating_duration_since(last) >= self.poll_interval,
        }
    }
}

/// Source of register descriptors for a device series and firmware version
#[async_trait]
pub trait CatalogProvider: Send + Sync {
    /// Descriptors for `series`, resolved for firmware `version`
    async fn get_descriptors(&self, series: u32, version: u32) -> PollerResult<Vec<RegisterDescriptor>>;
}

/// Pick, per codename, the entry for `version`, else the version-0 entry
///
/// Codenames keep the order of their first appearance. A codename with neither
/// a matching nor a default entry is dropped.
pub fn select_for_version(entries: &[RegisterDescriptor], version: u32) -> Vec<RegisterDescriptor> {
    let mut order: Vec<&str> = Vec::new();
    let mut chosen: HashMap<&str, &RegisterDescriptor> = HashMap::new();

    for entry in entries {
        let key = entry.codename.as_str();
        if !order.contains(&key) {
            order.push(key);
        }

        let better = match chosen.get(key) {
            None => entry.version == version || entry.version == 0,
            Some(current) => entry.version == version && current.version != version,
        };
        if better {
            chosen.insert(key, entry);
        }
    }

    order
        .into_iter()
        .filter_map(|key| chosen.get(key).map(|&entry| entry.clone()))
        .collect()
}

/// Catalog file layout
#[derive(Debug, Deserialize)]
struct CatalogFile {
    #[serde(default)]
    parameters: Vec<CatalogEntry>,
}

#[derive(Debug, Deserialize)]
struct CatalogEntry {
    address: String,
    read_function: u8,
    #[serde(default)]
    interval: u64,
    #[serde(default = "default_multiplier")]
    multiplier: f64,
    name: String,
    #[serde(default)]
    codename: Option<String>,
    #[serde(rename = "type", default = "default_type_tag")]
    type_tag: String,
    #[serde(default)]
    version: u32,
    #[serde(default = "default_poll")]
    poll: bool,
}

fn default_multiplier() -> f64 {
    1.0
}

fn default_type_tag() -> String {
    "uint16".to_string()
}

fn default_poll() -> bool {
    true
}

/// Parse a register address written in hex, with or without `0x`
pub fn parse_hex_address(text: &str) -> PollerResult<u16> {
    let trimmed = text.trim();
    let digits = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);
    u16::from_str_radix(digits, 16)
        .map_err(|e| PollerError::catalog(format!("Invalid register address {:?}: {}", text, e)))
}

impl CatalogEntry {
    fn into_descriptor(self) -> PollerResult<RegisterDescriptor> {
        let address = parse_hex_address(&self.address)?;
        let function = ModbusFunction::from_u8(self.read_function).map_err(|_| {
            PollerError::catalog(format!(
                "Parameter {:?} uses unsupported read function {}",
                self.name, self.read_function
            ))
        })?;
        let value_type: ValueType = self.type_tag.parse()?;
        let codename = self.codename.unwrap_or_else(|| self.name.clone());

        Ok(RegisterDescriptor {
            address,
            function,
            value_type,
            multiplier: self.multiplier,
            name: self.name,
            codename,
            poll_interval: Duration::from_secs(self.interval),
            version: self.version,
            last_poll: None,
        })
    }
}

/// Parse a JSON catalog document, skipping entries marked `"poll": false`
pub fn parse_catalog(json: &str) -> PollerResult<Vec<RegisterDescriptor>> {
    let file: CatalogFile = serde_json::from_str(json)
        .map_err(|e| PollerError::catalog(format!("Malformed catalog: {}", e)))?;
    file.parameters
        .into_iter()
        .filter(|entry| entry.poll)
        .map(CatalogEntry::into_descriptor)
        .collect()
}

/// Catalog read from `<directory>/<series>.json`
#[derive(Debug, Clone)]
pub struct JsonCatalogProvider {
    directory: PathBuf,
}

impl JsonCatalogProvider {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
        }
    }

    fn path_for(&self, series: u32) -> PathBuf {
        self.directory.join(format!("{}.json", series))
    }
}

#[async_trait]
impl CatalogProvider for JsonCatalogProvider {
    async fn get_descriptors(&self, series: u32, version: u32) -> PollerResult<Vec<RegisterDescriptor>> {
        let path = self.path_for(series);
        let text = tokio::fs::read_to_string(&path).await.map_err(|e| {
            PollerError::catalog(format!("Cannot read catalog {}: {}", path.display(), e))
        })?;
        let entries = parse_catalog(&text)?;
        let selected = select_for_version(&entries, version);
        debug!(
            "Catalog {} v{}: {} of {} entries selected",
            series,
            version,
            selected.len(),
            entries.len()
        );
        Ok(selected)
    }
}

/// In-memory catalog keyed by series
#[derive(Debug, Clone, Default)]
pub struct StaticCatalog {
    series: HashMap<u32, Vec<RegisterDescriptor>>,
}

impl StaticCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the entries of one series
    pub fn with_series(mut self, series: u32, entries: Vec<RegisterDescriptor>) -> Self {
        self.series.insert(series, entries);
        self
    }
}

#[async_trait]
impl CatalogProvider for StaticCatalog {
    async fn get_descriptors(&self, series: u32, version: u32) -> PollerResult<Vec<RegisterDescriptor>> {
        let entries = self
            .series
            .get(&series)
            .ok_or_else(|| PollerError::catalog(format!("No catalog for series {}", series)))?;
        Ok(select_for_version(entries, version))
    }
}
