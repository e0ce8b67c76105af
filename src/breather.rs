// src/breather.rs
//! Status LED "breathing" waveform: a rectified cosine swept over the PWM
//! duty cycle so the enclosure light pulses while the controller is alive.

use std::f64::consts::PI;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::config::Settings;
use crate::gpio::PwmLine;

/// Duty for a given phase angle. `|cos|` keeps the output non-negative and
/// gives two pulses per full revolution; the 0.7 factor keeps the peak
/// comfortably below full brightness.
pub fn breathing_duty(angle: f64, max_duty: f64) -> f64 {
    (angle.cos().abs() * max_duty * 0.7).clamp(0.0, 100.0)
}

pub struct LedBreather {
    line: Box<dyn PwmLine>,
    period: Duration,
    steps: u32,
    max_duty: f64,
}

impl LedBreather {
    pub fn new(line: Box<dyn PwmLine>, settings: &Settings) -> Self {
        Self {
            line,
            period: Duration::from_secs_f64(settings.breath_period_s.max(0.1)),
            steps: settings.breath_steps.max(1),
            max_duty: settings.breath_max_duty,
        }
    }

    /// Sweeps the waveform until shutdown, then blanks the LED.
    pub fn run(mut self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let step_angle = 2.0 * PI / self.steps as f64;
            let step_delay = self.period / self.steps;
            let mut angle: f64 = 0.0;

            loop {
                if *shutdown.borrow() {
                    break;
                }
                if let Err(e) = self.line.set_duty(breathing_duty(angle, self.max_duty)) {
                    error!("Failed to update LED duty: {}", e);
                    break;
                }
                angle = (angle + step_angle) % (2.0 * PI);
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = tokio::time::sleep(step_delay) => {}
                }
            }
            if let Err(e) = self.line.set_duty(0.0) {
                error!("Failed to blank LED on shutdown: {}", e);
            }
            info!("LED breather stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpio::SimulatedPwm;

    #[test]
    fn duty_peaks_at_cosine_extremes_and_nulls_at_quarters() {
        assert!((breathing_duty(0.0, 100.0) - 70.0).abs() < 1e-9);
        assert!((breathing_duty(PI, 100.0) - 70.0).abs() < 1e-9);
        assert!(breathing_duty(PI / 2.0, 100.0) < 1e-9);
    }

    #[test]
    fn duty_stays_within_pwm_range() {
        let mut angle = 0.0;
        while angle < 2.0 * PI {
            let duty = breathing_duty(angle, 100.0);
            assert!((0.0..=100.0).contains(&duty));
            angle += 0.01;
        }
    }

    #[tokio::test]
    async fn run_loop_blanks_led_on_shutdown() {
        let pwm = SimulatedPwm::new();
        let duty = pwm.duty_handle();
        let mut settings = Settings::default();
        settings.breath_period_s = 0.1;
        settings.breath_steps = 10;

        let (tx, rx) = watch::channel(false);
        let handle = LedBreather::new(Box::new(pwm), &settings).run(rx);

        tokio::time::sleep(Duration::from_millis(30)).await;
        tx.send(true).unwrap();
        handle.await.unwrap();

        assert_eq!(*duty.lock().unwrap(), 0.0);
    }
}
