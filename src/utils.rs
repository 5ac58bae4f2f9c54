/// Poll cycle metrics and formatting helpers

use log::debug;
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;

/// Timing and outcome counters over a session's poll cycles
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PerformanceMetrics {
    pub cycles: u64,
    pub successful_cycles: u64,
    pub failed_cycles: u64,
    /// Values decoded and stored across all cycles
    pub values_polled: u64,
    /// Values skipped because they were unavailable in their cycle
    pub values_skipped: u64,
    pub total_duration: Duration,
    pub min_duration: Option<Duration>,
    pub max_duration: Option<Duration>,
    pub avg_duration: Duration,
}

impl PerformanceMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a completed sweep
    pub fn record_cycle(&mut self, duration: Duration, polled: usize, skipped: usize) {
        self.successful_cycles += 1;
        self.values_polled += polled as u64;
        self.values_skipped += skipped as u64;
        self.record_duration(duration);
    }

    /// Record a sweep that ended the session
    pub fn record_failure(&mut self, duration: Duration) {
        self.failed_cycles += 1;
        self.record_duration(duration);
    }

    fn record_duration(&mut self, duration: Duration) {
        self.cycles += 1;
        self.total_duration += duration;
        self.min_duration = Some(self.min_duration.map_or(duration, |min| min.min(duration)));
        self.max_duration = Some(self.max_duration.map_or(duration, |max| max.max(duration)));
        self.avg_duration = self.total_duration / self.cycles.min(u32::MAX as u64) as u32;
    }

    /// Completed sweeps as a percentage of all sweeps
    pub fn success_rate(&self) -> f64 {
        if self.cycles == 0 {
            return 0.0;
        }
        (self.successful_cycles as f64 / self.cycles as f64) * 100.0
    }
}

impl fmt::Display for PerformanceMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Poll cycles:\n\
             ├─ Total: {}\n\
             ├─ Completed: {} ({:.1}%)\n\
             ├─ Failed: {}\n\
             ├─ Values polled / skipped: {} / {}\n\
             ├─ Average duration: {}\n\
             ├─ Min duration: {}\n\
             └─ Max duration: {}",
            self.cycles,
            self.successful_cycles,
            self.success_rate(),
            self.failed_cycles,
            self.values_polled,
            self.values_skipped,
            format::format_duration(self.avg_duration),
            self.min_duration.map_or("N/A".to_string(), format::format_duration),
            self.max_duration.map_or("N/A".to_string(), format::format_duration),
        )
    }
}

/// Measures one operation on the tokio clock
pub struct OperationTimer {
    start: Instant,
    operation_name: String,
}

impl OperationTimer {
    pub fn start(operation_name: impl Into<String>) -> Self {
        Self {
            start: Instant::now(),
            operation_name: operation_name.into(),
        }
    }

    /// Stop the timer and return the elapsed time
    pub fn stop(self) -> Duration {
        let duration = self.start.elapsed();
        debug!("{} took {}", self.operation_name, format::format_duration(duration));
        duration
    }
}

/// Formatting and display utilities
pub mod format {
    use std::time::Duration;

    /// Format register values as hex
    pub fn registers_to_hex(registers: &[u16]) -> String {
        registers
            .iter()
            .map(|r| format!("{:04X}", r))
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Format duration in a human-readable way
    pub fn format_duration(duration: Duration) -> String {
        let millis = duration.as_millis();
        if millis < 1000 {
            format!("{}ms", millis)
        } else if millis < 60_000 {
            format!("{:.2}s", duration.as_secs_f64())
        } else {
            let mins = millis / 60_000;
            let secs = (millis % 60_000) as f64 / 1000.0;
            format!("{}m {:.1}s", mins, secs)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycle_metrics() {
        let mut metrics = PerformanceMetrics::new();
        metrics.record_cycle(Duration::from_millis(100), 10, 0);
        metrics.record_cycle(Duration::from_millis(300), 8, 2);
        metrics.record_failure(Duration::from_millis(200));

        assert_eq!(metrics.cycles, 3);
        assert_eq!(metrics.successful_cycles, 2);
        assert_eq!(metrics.values_polled, 18);
        assert_eq!(metrics.values_skipped, 2);
        assert_eq!(metrics.min_duration, Some(Duration::from_millis(100)));
        assert_eq!(metrics.max_duration, Some(Duration::from_millis(300)));
        assert_eq!(metrics.avg_duration, Duration::from_millis(200));
        assert!((metrics.success_rate() - 66.67).abs() < 0.1);
        assert!(metrics.to_string().contains("Failed: 1"));
    }

    #[test]
    fn test_formatting() {
        assert_eq!(format::registers_to_hex(&[0x1234, 0x5678]), "1234 5678");
        assert_eq!(format::format_duration(Duration::from_millis(1500)), "1.50s");
        assert_eq!(format::format_duration(Duration::from_millis(42)), "42ms");
        assert_eq!(format::format_duration(Duration::from_secs(90)), "1m 30.0s");
    }
}
