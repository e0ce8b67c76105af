// src/fan.rs
//! Enclosure fan with temperature hysteresis: on at or above `on_temp`, off
//! at or below `off_temp`, unchanged in between so the fan never chatters
//! around a single threshold.

use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::config::Settings;
use crate::error::Result;
use crate::gpio::{OutputLine, TempProbe};

pub struct FanController {
    line: Box<dyn OutputLine>,
    probe: Box<dyn TempProbe>,
    on_temp: f64,
    off_temp: f64,
    poll: Duration,
    running: bool,
}

impl FanController {
    pub fn new(line: Box<dyn OutputLine>, probe: Box<dyn TempProbe>, settings: &Settings) -> Self {
        Self {
            line,
            probe,
            on_temp: settings.fan_on_temp,
            off_temp: settings.fan_off_temp,
            poll: Duration::from_secs(settings.fan_poll_s),
            running: false,
        }
    }

    /// One hysteresis step. Returns the sampled temperature and whether the
    /// fan is running after the step.
    pub fn update(&mut self) -> Result<(f64, bool)> {
        let celsius = self.probe.read_celsius()?;
        if !self.running && celsius >= self.on_temp {
            self.line.set_high()?;
            self.running = true;
            info!("Fan turned ON at {:.1} C", celsius);
        } else if self.running && celsius <= self.off_temp {
            self.line.set_low()?;
            self.running = false;
            info!("Fan turned OFF at {:.1} C", celsius);
        }
        Ok((celsius, self.running))
    }

    /// Runs the poll loop until shutdown, then leaves the fan off.
    pub fn run(mut self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                if *shutdown.borrow() {
                    break;
                }
                match self.update() {
                    Ok((celsius, running)) => {
                        debug!("Enclosure at {:.1} C, fan {}", celsius, if running { "on" } else { "off" });
                    }
                    Err(e) => error!("Fan temperature poll failed: {}", e),
                }
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = tokio::time::sleep(self.poll) => {}
                }
            }
            if let Err(e) = self.line.set_low() {
                error!("Failed to stop fan on shutdown: {}", e);
            }
            info!("Fan controller stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpio::SimulatedLine;

    struct ScriptedProbe {
        temps: Vec<f64>,
        at: usize,
    }

    impl TempProbe for ScriptedProbe {
        fn read_celsius(&mut self) -> Result<f64> {
            let t = self.temps[self.at.min(self.temps.len() - 1)];
            self.at += 1;
            Ok(t)
        }
    }

    fn controller(temps: Vec<f64>) -> (FanController, crate::gpio::LineProbe) {
        let line = SimulatedLine::new("fan");
        let probe = line.probe();
        let fan = FanController::new(
            Box::new(line),
            Box::new(ScriptedProbe { temps, at: 0 }),
            &Settings::default(),
        );
        (fan, probe)
    }

    #[test]
    fn fan_starts_above_on_threshold() {
        let (mut fan, line) = controller(vec![60.0, 66.0]);

        assert_eq!(fan.update().unwrap(), (60.0, false));
        assert!(!line.level());
        assert_eq!(fan.update().unwrap(), (66.0, true));
        assert!(line.level());
    }

    #[test]
    fn thresholds_are_inclusive() {
        // Defaults: on at 65, off at 55. Exact hits must switch.
        let (mut fan, line) = controller(vec![65.0, 60.0, 55.0]);

        assert_eq!(fan.update().unwrap(), (65.0, true));
        assert!(line.level());
        assert_eq!(fan.update().unwrap(), (60.0, true));
        assert_eq!(fan.update().unwrap(), (55.0, false));
        assert!(!line.level());
    }

    #[test]
    fn fan_holds_state_inside_the_band() {
        // Between off (55) and on (65) the previous state sticks.
        let (mut fan, line) = controller(vec![66.0, 60.0, 60.0, 54.0, 60.0]);

        fan.update().unwrap();
        assert!(line.level());
        assert_eq!(fan.update().unwrap(), (60.0, true));
        assert_eq!(fan.update().unwrap(), (60.0, true));
        assert_eq!(fan.update().unwrap(), (54.0, false));
        assert!(!line.level());
        assert_eq!(fan.update().unwrap(), (60.0, false));
    }

    #[tokio::test]
    async fn run_loop_stops_fan_on_shutdown() {
        let (fan, line) = controller(vec![70.0]);
        let (tx, rx) = watch::channel(false);

        let handle = fan.run(rx);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(line.level());

        tx.send(true).unwrap();
        handle.await.unwrap();
        assert!(!line.level());
    }
}
