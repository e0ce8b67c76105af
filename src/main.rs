use std::sync::Arc;

use tokio::sync::watch;
use tracing::{info, warn};

use chamber_control::alerts::AlertSink;
use chamber_control::breather::LedBreather;
use chamber_control::config::{ScheduleStore, Settings};
use chamber_control::control::ControlSystem;
use chamber_control::fan::FanController;
use chamber_control::gpio::{CpuThermalZone, SimulatedLine, SimulatedPwm};
use chamber_control::sensors::SensorCache;
use chamber_control::serial_monitor::SerialMonitor;
use chamber_control::shift_register::{ShiftRegisterPins, ValveBank};

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    tracing_subscriber::fmt::init();
    color_eyre::install()?;

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config.json".to_string());
    let settings = Arc::new(Settings::load(&config_path)?);
    let store = ScheduleStore::load(settings.data_dir.join("schedule.json"))?;

    // Output lines for the bench dry-run build. Swapping in a real GPIO
    // adapter is a wiring change here, nothing below this block cares.
    let pins = ShiftRegisterPins {
        ser: Box::new(SimulatedLine::new("ser")),
        srclk: Box::new(SimulatedLine::new("srclk")),
        rclk: Box::new(SimulatedLine::new("rclk")),
        oe: Some(Box::new(SimulatedLine::new("oe"))),
        srclr: Some(Box::new(SimulatedLine::new("srclr"))),
    };
    let valves = ValveBank::new(settings.valve_channels, pins)?;
    let pump = Box::new(SimulatedLine::new("pump"));
    let fan_line = Box::new(SimulatedLine::new("fan"));
    let led = Box::new(SimulatedPwm::new());

    let cache = Arc::new(SensorCache::new());
    let alerts = AlertSink::new(settings.webhook_url.clone());
    let monitor = SerialMonitor::new(cache.clone(), alerts.clone(), &settings);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let fan = FanController::new(fan_line, Box::new(CpuThermalZone::new()), &settings);
    let fan_task = fan.run(shutdown_rx.clone());
    let led_task = LedBreather::new(led, &settings).run(shutdown_rx.clone());

    let mut system = ControlSystem::new(
        settings.clone(),
        store,
        valves,
        pump,
        monitor,
        cache,
        alerts,
        shutdown_rx,
    );
    system.register_from_settings().await;
    if system.chamber_count() == 0 {
        warn!("No chambers configured; the scheduler will idle.");
    }

    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for ctrl-c: {}", e);
            return;
        }
        info!("Shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    system.run().await?;
    let _ = fan_task.await;
    let _ = led_task.await;
    info!("Controller exited cleanly");
    Ok(())
}
