// src/lib.rs
//! Supervisory controller for sealed environmental test chambers.
//!
//! The scheduler purges chamber groups on timed intervals: evacuate through
//! the shared vacuum pump, settle, flood with gas, and disable any chamber
//! that misses a pressure deadline. Telemetry arrives over serial, valves go
//! out through a shift register, and alerts leave over a webhook.

pub mod alerts;
pub mod breather;
pub mod chamber;
pub mod config;
pub mod control;
pub mod error;
pub mod fan;
pub mod gpio;
pub mod sensors;
pub mod serial_monitor;
pub mod shift_register;

pub use alerts::AlertSink;
pub use chamber::{Chamber, ChamberStatus};
pub use config::{ScheduleStore, Settings};
pub use control::{ControlSystem, PressureTarget};
pub use error::{ControlError, Result};
pub use sensors::SensorCache;
pub use serial_monitor::SerialMonitor;
pub use shift_register::{ShiftRegister, ShiftRegisterPins, ValveBank};
