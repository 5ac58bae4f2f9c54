//! Telemetry snapshots
//!
//! A session keeps one snapshot for its whole life and upserts every decoded
//! value into it by codename before handing it to the sink.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Codename whose value names the running program
pub const PROGRAM_NAME_CODENAME: &str = "program_name";

/// Codename whose value names the current program step
pub const STEP_NAME_CODENAME: &str = "step_name";

/// One decoded value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryEntry {
    pub name: String,
    pub codename: String,
    pub value: String,
    pub timestamp: DateTime<Utc>,
}

/// Codename-keyed collection of the latest values of one device
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TelemetrySnapshot {
    pub device_id: u64,
    pub device_name: String,
    pub program_name: Option<String>,
    pub step_name: Option<String>,
    pub entries: Vec<TelemetryEntry>,
}

impl TelemetrySnapshot {
    pub fn new(device_id: u64, device_name: impl Into<String>) -> Self {
        Self {
            device_id,
            device_name: device_name.into(),
            ..Default::default()
        }
    }

    /// Replace the entry with the same codename, or append a new one
    pub fn upsert(&mut self, entry: TelemetryEntry) {
        match self.entries.iter_mut().find(|e| e.codename == entry.codename) {
            Some(existing) => *existing = entry,
            None => self.entries.push(entry),
        }
    }

    pub fn get(&self, codename: &str) -> Option<&TelemetryEntry> {
        self.entries.iter().find(|e| e.codename == codename)
    }

    /// Refresh `program_name` and `step_name` from their codenames
    pub fn derive_names(&mut self) {
        self.program_name = self.get(PROGRAM_NAME_CODENAME).map(|e| e.value.clone());
        self.step_name = self.get(STEP_NAME_CODENAME).map(|e| e.value.clone());
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl fmt::Display for TelemetrySnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Device {} ({})", self.device_id, self.device_name)?;
        if let Some(program) = &self.program_name {
            writeln!(f, "  program: {}", program)?;
        }
        if let Some(step) = &self.step_name {
            writeln!(f, "  step:    {}", step)?;
        }
        for entry in &self.entries {
            writeln!(
                f,
                "  {:<32} {:<24} {}",
                entry.name,
                entry.value,
                entry.timestamp.format("%H:%M:%S")
            )?;
        }
        Ok(())
    }
}
