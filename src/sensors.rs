// src/sensors.rs
//! Telemetry line format and the per-chamber latest-reading cache.
//!
//! Wire format (comma-space separated):
//! `##PRESSURE, <chamber>, <pascal>` / `##READING, <chamber>, <value>` /
//! `##ALERT, <chamber>, <message>`.
//!
//! The cache is written only by sensor ingestion and read (never written) by
//! the scheduler, which always takes the most recently stored value at the
//! instant it polls.

use std::collections::HashMap;

use tokio::sync::RwLock;
use tracing::{debug, warn};

/// A parsed telemetry record. Pressure is converted to `f64` here, at the
/// parse boundary, so comparison sites never see string-typed readings.
#[derive(Debug, Clone, PartialEq)]
pub enum TelemetryRecord {
    Pressure { chamber: String, value: f64 },
    Reading { chamber: String, value: String },
    Alert { chamber: String, message: String },
}

/// Parses one serial line. Returns `None` for anything that is not a
/// recognized record; callers skip those lines rather than failing.
pub fn parse_line(line: &str) -> Option<TelemetryRecord> {
    let cols: Vec<&str> = line.trim().split(", ").collect();
    if cols.len() < 3 {
        return None;
    }

    match cols[0] {
        "##PRESSURE" => {
            let value: f64 = match cols[2].trim().parse() {
                Ok(v) => v,
                Err(_) => {
                    warn!(
                        "Dropping non-numeric pressure reading for chamber \"{}\": {:?}",
                        cols[1], cols[2]
                    );
                    return None;
                }
            };
            Some(TelemetryRecord::Pressure {
                chamber: cols[1].to_string(),
                value,
            })
        }
        "##READING" => Some(TelemetryRecord::Reading {
            chamber: cols[1].to_string(),
            value: cols[2..].join(", "),
        }),
        "##ALERT" => Some(TelemetryRecord::Alert {
            chamber: cols[1].to_string(),
            message: cols[2..].join(", "),
        }),
        _ => None,
    }
}

#[derive(Debug, Clone, Default)]
pub struct LatestReading {
    pub pressure: Option<f64>,
    pub raw_reading: Option<String>,
    pub last_alert: Option<String>,
    /// Set while the chamber is being purged; the next `##READING` row is a
    /// mid-purge sample and gets dropped instead of cached or logged.
    ignore_next_reading: bool,
}

/// Outcome of a `##READING` write, so the caller knows whether to append the
/// row to the chamber's durable log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadingOutcome {
    Stored,
    Ignored,
    Unregistered,
}

/// Per-chamber latest-reading cache. Entries are created at chamber
/// registration and never removed.
#[derive(Debug, Default)]
pub struct SensorCache {
    readings: RwLock<HashMap<String, LatestReading>>,
}

impl SensorCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, chamber: &str) {
        self.readings
            .write()
            .await
            .entry(chamber.to_string())
            .or_default();
    }

    pub async fn is_registered(&self, chamber: &str) -> bool {
        self.readings.read().await.contains_key(chamber)
    }

    /// Returns false (and stores nothing) for unregistered chambers.
    pub async fn record_pressure(&self, chamber: &str, value: f64) -> bool {
        let mut readings = self.readings.write().await;
        match readings.get_mut(chamber) {
            Some(entry) => {
                entry.pressure = Some(value);
                true
            }
            None => false,
        }
    }

    pub async fn record_reading(&self, chamber: &str, value: &str) -> ReadingOutcome {
        let mut readings = self.readings.write().await;
        match readings.get_mut(chamber) {
            Some(entry) => {
                if entry.ignore_next_reading {
                    entry.ignore_next_reading = false;
                    debug!("Dropped mid-purge reading for chamber \"{}\"", chamber);
                    ReadingOutcome::Ignored
                } else {
                    entry.raw_reading = Some(value.to_string());
                    ReadingOutcome::Stored
                }
            }
            None => ReadingOutcome::Unregistered,
        }
    }

    pub async fn record_alert(&self, chamber: &str, message: &str) -> bool {
        let mut readings = self.readings.write().await;
        match readings.get_mut(chamber) {
            Some(entry) => {
                entry.last_alert = Some(message.to_string());
                true
            }
            None => false,
        }
    }

    pub async fn pressure(&self, chamber: &str) -> Option<f64> {
        self.readings.read().await.get(chamber)?.pressure
    }

    pub async fn snapshot(&self, chamber: &str) -> Option<LatestReading> {
        self.readings.read().await.get(chamber).cloned()
    }

    /// Flags chambers about to be purged so their next steady-state sample
    /// is discarded. Pressure records are never suppressed.
    pub async fn ignore_next_reading(&self, chambers: &[String]) {
        let mut readings = self.readings.write().await;
        for chamber in chambers {
            if let Some(entry) = readings.get_mut(chamber) {
                entry.ignore_next_reading = true;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_pressure_record() {
        assert_eq!(
            parse_line("##PRESSURE, chamber3, 4000"),
            Some(TelemetryRecord::Pressure {
                chamber: "chamber3".to_string(),
                value: 4000.0
            })
        );
    }

    #[test]
    fn parses_reading_and_alert_with_commas_in_value() {
        assert_eq!(
            parse_line("##READING, c1, 123"),
            Some(TelemetryRecord::Reading {
                chamber: "c1".to_string(),
                value: "123".to_string()
            })
        );
        assert_eq!(
            parse_line("##ALERT, c1, seal leak, check gasket"),
            Some(TelemetryRecord::Alert {
                chamber: "c1".to_string(),
                message: "seal leak, check gasket".to_string()
            })
        );
    }

    #[test]
    fn rejects_garbage_and_non_numeric_pressure() {
        assert_eq!(parse_line(""), None);
        assert_eq!(parse_line("OK"), None);
        assert_eq!(parse_line("#4, purging"), None);
        assert_eq!(parse_line("##PRESSURE, c1, abc"), None);
        assert_eq!(parse_line("##PRESSURE, c1"), None);
    }

    #[tokio::test]
    async fn unregistered_chamber_records_are_dropped() {
        let cache = SensorCache::new();
        assert!(!cache.record_pressure("ghost", 100.0).await);
        assert_eq!(
            cache.record_reading("ghost", "1").await,
            ReadingOutcome::Unregistered
        );
        assert!(cache.snapshot("ghost").await.is_none());
    }

    #[tokio::test]
    async fn latest_pressure_wins() {
        let cache = SensorCache::new();
        cache.register("c1").await;
        cache.record_pressure("c1", 9000.0).await;
        cache.record_pressure("c1", 4000.0).await;
        assert_eq!(cache.pressure("c1").await, Some(4000.0));
    }

    #[tokio::test]
    async fn ignore_flag_drops_exactly_one_reading() {
        let cache = SensorCache::new();
        cache.register("c1").await;
        cache
            .ignore_next_reading(std::slice::from_ref(&"c1".to_string()))
            .await;

        assert_eq!(
            cache.record_reading("c1", "stale").await,
            ReadingOutcome::Ignored
        );
        assert_eq!(
            cache.record_reading("c1", "fresh").await,
            ReadingOutcome::Stored
        );
        assert_eq!(
            cache.snapshot("c1").await.unwrap().raw_reading.as_deref(),
            Some("fresh")
        );
    }

    #[tokio::test]
    async fn ignore_flag_does_not_suppress_pressure() {
        let cache = SensorCache::new();
        cache.register("c1").await;
        cache
            .ignore_next_reading(std::slice::from_ref(&"c1".to_string()))
            .await;

        assert!(cache.record_pressure("c1", 4000.0).await);
        assert_eq!(cache.pressure("c1").await, Some(4000.0));
    }
}
