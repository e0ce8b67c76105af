// src/config.rs
//! Configuration split in two pieces:
//!
//! - [`Settings`] is read once at startup and never mutated afterwards;
//!   components receive a shared handle instead of reaching into a global.
//! - [`ScheduleStore`] is the persisted mutable state (group purge schedule
//!   and disabled slots). The scheduler is its only writer and saves it
//!   explicitly after every change.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::Result;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChamberSpec {
    pub name: String,
    pub group: String,
    pub slot: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Width of the valve shift register; two channels per chamber slot.
    #[serde(default = "default_valve_channels")]
    pub valve_channels: usize,

    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,

    /// Serial port rescan interval for the discovery loop.
    #[serde(default = "default_monitor_interval_s")]
    pub monitor_interval_s: u64,

    /// Vacuum phase target in pascal; met when cached pressure drops below it.
    #[serde(default = "default_vacuum_pressure")]
    pub vacuum_pressure: f64,

    #[serde(default = "default_vacuum_timeout_s")]
    pub vacuum_timeout_s: u64,

    /// Gas phase target in pascal; met when cached pressure rises above it.
    #[serde(default = "default_gas_pressure")]
    pub gas_pressure: f64,

    #[serde(default = "default_gas_timeout_s")]
    pub gas_timeout_s: u64,

    /// Pressure-wait poll tick.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Pause between closing vacuum valves and opening gas valves.
    #[serde(default = "default_settle_delay_ms")]
    pub settle_delay_ms: u64,

    /// How many evacuate-and-flood passes a due group gets per cycle.
    #[serde(default = "default_purge_passes")]
    pub purge_passes: u32,

    /// Alert webhook; alerts are skipped entirely when unset.
    #[serde(default)]
    pub webhook_url: Option<String>,

    /// Where the schedule store and chamber reading logs live.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Group name -> purge interval in seconds. Last-purge bookkeeping lives
    /// in the schedule store.
    #[serde(default)]
    pub chamber_groups: BTreeMap<String, u64>,

    #[serde(default)]
    pub chambers: Vec<ChamberSpec>,

    #[serde(default = "default_fan_on_temp")]
    pub fan_on_temp: f64,

    #[serde(default = "default_fan_off_temp")]
    pub fan_off_temp: f64,

    #[serde(default = "default_fan_poll_s")]
    pub fan_poll_s: u64,

    #[serde(default = "default_breath_period_s")]
    pub breath_period_s: f64,

    /// Waveform resolution: PWM updates per breathing period.
    #[serde(default = "default_breath_steps")]
    pub breath_steps: u32,

    #[serde(default = "default_breath_max_duty")]
    pub breath_max_duty: f64,
}

fn default_valve_channels() -> usize {
    16
}
fn default_baud_rate() -> u32 {
    115_200
}
fn default_monitor_interval_s() -> u64 {
    2
}
fn default_vacuum_pressure() -> f64 {
    // Roughly 1/25 atm in pascal.
    101_000.0 / 25.0
}
fn default_vacuum_timeout_s() -> u64 {
    5
}
fn default_gas_pressure() -> f64 {
    101_000.0
}
fn default_gas_timeout_s() -> u64 {
    5
}
fn default_poll_interval_ms() -> u64 {
    10
}
fn default_settle_delay_ms() -> u64 {
    1_000
}
fn default_purge_passes() -> u32 {
    2
}
fn default_data_dir() -> PathBuf {
    PathBuf::from(".")
}
fn default_fan_on_temp() -> f64 {
    65.0
}
fn default_fan_off_temp() -> f64 {
    55.0
}
fn default_fan_poll_s() -> u64 {
    1
}
fn default_breath_period_s() -> f64 {
    5.0
}
fn default_breath_steps() -> u32 {
    100
}
fn default_breath_max_duty() -> f64 {
    100.0
}

impl Default for Settings {
    fn default() -> Self {
        serde_json::from_str("{}").expect("empty settings object must deserialize")
    }
}

impl Settings {
    /// Loads settings, falling back to defaults when the file is missing so a
    /// bare checkout still starts.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            warn!("Settings file {:?} not found, using defaults", path);
            return Ok(Self::default());
        }
        let settings: Settings = serde_json::from_str(&std::fs::read_to_string(path)?)?;
        info!("Loaded settings from {:?}", path);
        Ok(settings)
    }

    pub fn vacuum_timeout(&self) -> Duration {
        Duration::from_secs(self.vacuum_timeout_s)
    }

    pub fn gas_timeout(&self) -> Duration {
        Duration::from_secs(self.gas_timeout_s)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_secs(self.monitor_interval_s)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupSchedule {
    /// Unix timestamp of the last completed purge, 0 for never.
    pub last_purge: u64,
    pub purge_interval_s: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct ScheduleState {
    chamber_groups: BTreeMap<String, GroupSchedule>,
    disabled_chambers: BTreeSet<u8>,
}

/// Persisted scheduler state. Loaded at startup, rewritten through explicit
/// [`ScheduleStore::save`] calls after every purge or disablement so
/// schedules and the disabled set survive restarts.
#[derive(Debug)]
pub struct ScheduleStore {
    path: PathBuf,
    state: ScheduleState,
}

impl ScheduleStore {
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let state = if path.exists() {
            serde_json::from_str(&std::fs::read_to_string(&path)?)?
        } else {
            info!("Schedule store {:?} not found, starting empty", path);
            ScheduleState::default()
        };
        Ok(Self { path, state })
    }

    pub fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, serde_json::to_string_pretty(&self.state)?)?;
        Ok(())
    }

    /// `BTreeMap` iteration order is what makes group tie-breaking
    /// deterministic; keep it that way.
    pub fn groups(&self) -> &BTreeMap<String, GroupSchedule> {
        &self.state.chamber_groups
    }

    /// Seeds a group from configuration. The configured interval always wins;
    /// last-purge bookkeeping is preserved across restarts.
    pub fn ensure_group(&mut self, name: &str, purge_interval_s: u64) {
        self.state
            .chamber_groups
            .entry(name.to_string())
            .and_modify(|g| g.purge_interval_s = purge_interval_s)
            .or_insert(GroupSchedule {
                last_purge: 0,
                purge_interval_s,
            });
    }

    pub fn set_last_purge(&mut self, group: &str, timestamp: u64) {
        if let Some(schedule) = self.state.chamber_groups.get_mut(group) {
            schedule.last_purge = timestamp;
        }
    }

    pub fn is_disabled(&self, slot: u8) -> bool {
        self.state.disabled_chambers.contains(&slot)
    }

    /// Returns true when the slot was newly added to the disabled set.
    pub fn mark_disabled(&mut self, slot: u8) -> bool {
        self.state.disabled_chambers.insert(slot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn settings_default_when_file_missing() {
        let dir = TempDir::new().unwrap();
        let settings = Settings::load(dir.path().join("nope.json")).unwrap();
        assert_eq!(settings.valve_channels, 16);
        assert_eq!(settings.baud_rate, 115_200);
        assert_eq!(settings.purge_passes, 2);
        assert!(settings.webhook_url.is_none());
    }

    #[test]
    fn settings_partial_file_fills_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{"vacuum_pressure": 5000.0, "chamber_groups": {"a": 60}}"#,
        )
        .unwrap();

        let settings = Settings::load(&path).unwrap();
        assert_eq!(settings.vacuum_pressure, 5000.0);
        assert_eq!(settings.chamber_groups.get("a"), Some(&60));
        assert_eq!(settings.gas_timeout_s, 5);
    }

    #[test]
    fn schedule_store_round_trips() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("schedule.json");

        let mut store = ScheduleStore::load(&path).unwrap();
        store.ensure_group("a", 60);
        store.set_last_purge("a", 1234);
        assert!(store.mark_disabled(3));
        assert!(!store.mark_disabled(3));
        store.save().unwrap();

        let reloaded = ScheduleStore::load(&path).unwrap();
        assert_eq!(reloaded.groups().get("a").unwrap().last_purge, 1234);
        assert_eq!(reloaded.groups().get("a").unwrap().purge_interval_s, 60);
        assert!(reloaded.is_disabled(3));
        assert!(!reloaded.is_disabled(4));
    }

    #[test]
    fn ensure_group_keeps_last_purge_on_interval_change() {
        let dir = TempDir::new().unwrap();
        let mut store = ScheduleStore::load(dir.path().join("s.json")).unwrap();
        store.ensure_group("a", 60);
        store.set_last_purge("a", 99);
        store.ensure_group("a", 120);

        let schedule = store.groups().get("a").unwrap();
        assert_eq!(schedule.last_purge, 99);
        assert_eq!(schedule.purge_interval_s, 120);
    }
}
