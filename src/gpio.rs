// src/gpio.rs
//! Hardware port traits - the boundary between the control logic and the
//! physical output lines.
//!
//! The controller never touches pin registers directly. Drivers consume these
//! traits and adapters implement them, so the same control loop runs against
//! real GPIO on the bench hardware or against the simulated lines below.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use crate::error::{ControlError, Result};

/// A single digital output line (valve driver pins, pump relay, fan).
pub trait OutputLine: Send {
    fn set_level(&mut self, high: bool) -> Result<()>;

    fn set_high(&mut self) -> Result<()> {
        self.set_level(true)
    }

    fn set_low(&mut self) -> Result<()> {
        self.set_level(false)
    }
}

/// A proportional output line (LED strip PWM).
pub trait PwmLine: Send {
    /// Set the duty cycle in percent, 0.0..=100.0.
    fn set_duty(&mut self, percent: f64) -> Result<()>;
}

/// A temperature source for the fan hysteresis loop.
pub trait TempProbe: Send {
    fn read_celsius(&mut self) -> Result<f64>;
}

/// Reads the SoC temperature from the kernel thermal zone.
pub struct CpuThermalZone {
    path: PathBuf,
}

impl CpuThermalZone {
    pub fn new() -> Self {
        Self {
            path: PathBuf::from("/sys/class/thermal/thermal_zone0/temp"),
        }
    }

    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl Default for CpuThermalZone {
    fn default() -> Self {
        Self::new()
    }
}

impl TempProbe for CpuThermalZone {
    fn read_celsius(&mut self) -> Result<f64> {
        let raw = std::fs::read_to_string(&self.path)?;
        let millis: i64 = raw
            .trim()
            .parse()
            .map_err(|e| ControlError::HardwareError(format!("Bad thermal zone value: {}", e)))?;
        Ok(millis as f64 / 1000.0)
    }
}

/// Ordered record of every level transition across a set of simulated lines.
/// Lets tests replay the exact shift/latch sequence a driver produced.
pub type LineJournal = Arc<Mutex<Vec<(String, bool)>>>;

#[derive(Debug, Default)]
struct LineState {
    level: bool,
    history: Vec<bool>,
}

/// Shared read-side handle for inspecting a [`SimulatedLine`].
#[derive(Clone, Default)]
pub struct LineProbe(Arc<Mutex<LineState>>);

impl LineProbe {
    pub fn level(&self) -> bool {
        self.0.lock().map(|s| s.level).unwrap_or(false)
    }

    pub fn history(&self) -> Vec<bool> {
        self.0.lock().map(|s| s.history.clone()).unwrap_or_default()
    }
}

/// In-memory output line for bench dry-runs and tests. Records every write.
pub struct SimulatedLine {
    label: String,
    probe: LineProbe,
    journal: Option<LineJournal>,
}

impl SimulatedLine {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            probe: LineProbe::default(),
            journal: None,
        }
    }

    /// Wire the line into a shared journal so transitions across several
    /// lines keep their relative order.
    pub fn wired(label: impl Into<String>, journal: LineJournal) -> Self {
        Self {
            label: label.into(),
            probe: LineProbe::default(),
            journal: Some(journal),
        }
    }

    pub fn probe(&self) -> LineProbe {
        self.probe.clone()
    }
}

impl OutputLine for SimulatedLine {
    fn set_level(&mut self, high: bool) -> Result<()> {
        if let Ok(mut state) = self.probe.0.lock() {
            state.level = high;
            state.history.push(high);
        }
        if let Some(journal) = &self.journal {
            if let Ok(mut j) = journal.lock() {
                j.push((self.label.clone(), high));
            }
        }
        Ok(())
    }
}

/// In-memory PWM line; exposes the last duty cycle written.
#[derive(Default)]
pub struct SimulatedPwm {
    duty: Arc<Mutex<f64>>,
}

impl SimulatedPwm {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn duty_handle(&self) -> Arc<Mutex<f64>> {
        self.duty.clone()
    }
}

impl PwmLine for SimulatedPwm {
    fn set_duty(&mut self, percent: f64) -> Result<()> {
        if let Ok(mut duty) = self.duty.lock() {
            *duty = percent.clamp(0.0, 100.0);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simulated_line_tracks_level_and_history() {
        let mut line = SimulatedLine::new("test");
        let probe = line.probe();

        line.set_high().unwrap();
        line.set_low().unwrap();
        line.set_high().unwrap();

        assert!(probe.level());
        assert_eq!(probe.history(), vec![true, false, true]);
    }

    #[test]
    fn journal_preserves_cross_line_ordering() {
        let journal: LineJournal = LineJournal::default();
        let mut a = SimulatedLine::wired("a", journal.clone());
        let mut b = SimulatedLine::wired("b", journal.clone());

        a.set_high().unwrap();
        b.set_high().unwrap();
        a.set_low().unwrap();

        let events = journal.lock().unwrap().clone();
        assert_eq!(
            events,
            vec![
                ("a".to_string(), true),
                ("b".to_string(), true),
                ("a".to_string(), false),
            ]
        );
    }

    #[test]
    fn simulated_pwm_clamps_duty() {
        let mut pwm = SimulatedPwm::new();
        let duty = pwm.duty_handle();

        pwm.set_duty(150.0).unwrap();
        assert_eq!(*duty.lock().unwrap(), 100.0);

        pwm.set_duty(-3.0).unwrap();
        assert_eq!(*duty.lock().unwrap(), 0.0);
    }
}
