// src/serial_monitor.rs
//! Serial ingestion: discovers serial interfaces, keeps one reader task per
//! live port, parses telemetry lines into the sensor cache, and appends
//! `##READING` rows to each chamber's durable log.
//!
//! Readers deregister themselves from the supervisor map when their port
//! disappears or errors, so the discovery loop can pick the port up again
//! later. Shutdown joins the discovery loop and every live reader.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tokio_serial::{ClearBuffer, SerialPort, SerialPortBuilderExt};
use tracing::{debug, info, warn};

use crate::alerts::AlertSink;
use crate::config::Settings;
use crate::error::Result;
use crate::sensors::{parse_line, ReadingOutcome, SensorCache, TelemetryRecord};

/// Everything a reader task needs, cloneable so each port owns its own copy.
#[derive(Clone)]
struct ReaderContext {
    cache: Arc<SensorCache>,
    alerts: AlertSink,
    baud_rate: u32,
    data_dir: PathBuf,
}

impl ReaderContext {
    async fn dispatch(&self, record: TelemetryRecord) {
        match record {
            TelemetryRecord::Pressure { chamber, value } => {
                if !self.cache.record_pressure(&chamber, value).await {
                    warn!(
                        "Pressure reading received for chamber \"{}\" but chamber is uninitialized",
                        chamber
                    );
                }
            }
            TelemetryRecord::Reading { chamber, value } => {
                match self.cache.record_reading(&chamber, &value).await {
                    ReadingOutcome::Stored => {
                        if let Err(e) = self.append_reading_log(&chamber, &value) {
                            warn!(
                                "Could not append reading log for chamber \"{}\": {}",
                                chamber, e
                            );
                        }
                    }
                    ReadingOutcome::Ignored => {}
                    ReadingOutcome::Unregistered => {
                        warn!(
                            "Sensor reading received for chamber \"{}\" but chamber is uninitialized",
                            chamber
                        );
                    }
                }
            }
            TelemetryRecord::Alert { chamber, message } => {
                if self.cache.record_alert(&chamber, &message).await {
                    self.alerts.notify_detached(chamber, message);
                } else {
                    warn!(
                        "Alert received for chamber \"{}\" but chamber is uninitialized: {}",
                        chamber, message
                    );
                }
            }
        }
    }

    fn append_reading_log(&self, chamber: &str, value: &str) -> Result<()> {
        // Kept local so the blocking `Write` never shadows `AsyncWriteExt`
        // on the serial streams.
        use std::io::Write;

        let path = self
            .data_dir
            .join(format!("chamber_{}_readings.csv", chamber));
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)?;
        writeln!(
            file,
            "##READING,{},{},{}",
            chamber,
            value,
            chrono::Utc::now().to_rfc3339()
        )?;
        debug!("Data appended to {:?}", path);
        Ok(())
    }
}

pub struct SerialMonitor {
    context: ReaderContext,
    shutdown: watch::Sender<bool>,
    readers: Arc<RwLock<HashMap<String, JoinHandle<()>>>>,
    discovery: Option<JoinHandle<()>>,
}

impl SerialMonitor {
    pub fn new(cache: Arc<SensorCache>, alerts: AlertSink, settings: &Settings) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            context: ReaderContext {
                cache,
                alerts,
                baud_rate: settings.baud_rate,
                data_dir: settings.data_dir.clone(),
            },
            shutdown,
            readers: Arc::new(RwLock::new(HashMap::new())),
            discovery: None,
        }
    }

    /// Spawns the discovery loop. Each newly seen interface gets a dedicated
    /// reader task; the port is claimed in the supervisor map before the
    /// reader starts so a rescan never double-spawns.
    pub fn start(&mut self, interval: Duration) {
        if self.discovery.is_some() {
            return;
        }
        info!("Starting serial monitor");
        let ctx = self.context.clone();
        let readers = self.readers.clone();
        let mut shutdown = self.shutdown.subscribe();

        self.discovery = Some(tokio::spawn(async move {
            loop {
                if *shutdown.borrow() {
                    break;
                }
                let ports = detect_serial_ports();
                {
                    let mut active = readers.write().await;
                    for port in ports {
                        if active.contains_key(&port) {
                            continue;
                        }
                        let handle = tokio::spawn(read_from_port(
                            ctx.clone(),
                            port.clone(),
                            shutdown.clone(),
                            readers.clone(),
                        ));
                        active.insert(port, handle);
                    }
                }
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
            }
            info!("Serial discovery loop stopped");
        }));
    }

    /// Signals every loop to stop and joins the discovery task plus all live
    /// readers before returning.
    pub async fn stop(&mut self) {
        let _ = self.shutdown.send(true);
        if let Some(handle) = self.discovery.take() {
            let _ = handle.await;
        }
        let handles: Vec<(String, JoinHandle<()>)> =
            self.readers.write().await.drain().collect();
        for (port, handle) in handles {
            let _ = handle.await;
            debug!("Joined reader for {}", port);
        }
        info!("Serial monitor stopped");
    }

    /// Transiently opens each currently enumerable port and writes `message`.
    /// Best-effort: one port failing does not block the others.
    pub async fn send_to_all(&self, message: &str) {
        for port_name in detect_serial_ports() {
            match tokio_serial::new(&port_name, self.context.baud_rate).open_native_async() {
                Ok(mut port) => {
                    if let Err(e) = port.write_all(message.as_bytes()).await {
                        warn!("Failed to send to {}: {}", port_name, e);
                        continue;
                    }
                    let _ = port.flush().await;
                    debug!("Sent to {}", port_name);
                }
                Err(e) => {
                    warn!("Failed to open {} for send: {}", port_name, e);
                }
            }
        }
        debug!("Sent \"{}\" to all serial ports", message);
    }
}

async fn read_from_port(
    ctx: ReaderContext,
    port_name: String,
    mut shutdown: watch::Receiver<bool>,
    readers: Arc<RwLock<HashMap<String, JoinHandle<()>>>>,
) {
    if let Err(e) = run_reader(&ctx, &port_name, &mut shutdown).await {
        warn!("Error on {}: {}", port_name, e);
    }
    readers.write().await.remove(&port_name);
    info!("Stopped listening on {}", port_name);
}

async fn run_reader(
    ctx: &ReaderContext,
    port_name: &str,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<()> {
    let port = tokio_serial::new(port_name, ctx.baud_rate).open_native_async()?;
    // Discard whatever accumulated in the buffer before we attached.
    let _ = port.clear(ClearBuffer::Input);
    info!("Started listening on {}", port_name);

    let reader = BufReader::new(port);
    let mut lines = reader.lines();

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            line = lines.next_line() => {
                match line? {
                    Some(line) => {
                        let trimmed = line.trim();
                        if trimmed.is_empty() {
                            continue;
                        }
                        match parse_line(trimmed) {
                            Some(record) => ctx.dispatch(record).await,
                            None => debug!("Skipping unrecognized line on {}: {}", port_name, trimmed),
                        }
                    }
                    // Port closed.
                    None => break,
                }
            }
        }
    }
    Ok(())
}

/// Enumerates serial interfaces by scanning /dev (Linux ttyUSB*/ttyACM*,
/// macOS cu.*).
pub fn detect_serial_ports() -> Vec<String> {
    let mut ports = Vec::new();

    #[cfg(target_os = "linux")]
    {
        if let Ok(entries) = std::fs::read_dir("/dev") {
            for entry in entries.flatten() {
                if let Some(name) = entry.file_name().to_str() {
                    if name.starts_with("ttyUSB") || name.starts_with("ttyACM") {
                        ports.push(format!("/dev/{}", name));
                    }
                }
            }
        }
    }

    #[cfg(target_os = "macos")]
    {
        if let Ok(entries) = std::fs::read_dir("/dev") {
            for entry in entries.flatten() {
                if let Some(name) = entry.file_name().to_str() {
                    if name.starts_with("cu.") {
                        ports.push(format!("/dev/{}", name));
                    }
                }
            }
        }
    }

    ports.sort();
    ports.dedup();
    ports
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn context(dir: &TempDir) -> (ReaderContext, Arc<SensorCache>) {
        let cache = Arc::new(SensorCache::new());
        let ctx = ReaderContext {
            cache: cache.clone(),
            alerts: AlertSink::new(None),
            baud_rate: 115_200,
            data_dir: dir.path().to_path_buf(),
        };
        (ctx, cache)
    }

    #[tokio::test]
    async fn reading_record_is_cached_and_logged() {
        let dir = TempDir::new().unwrap();
        let (ctx, cache) = context(&dir);
        cache.register("c1").await;

        ctx.dispatch(parse_line("##READING, c1, 123").unwrap()).await;

        let snapshot = cache.snapshot("c1").await.unwrap();
        assert_eq!(snapshot.raw_reading.as_deref(), Some("123"));

        let log = std::fs::read_to_string(dir.path().join("chamber_c1_readings.csv")).unwrap();
        assert!(log.starts_with("##READING,c1,123,"));
    }

    #[tokio::test]
    async fn unregistered_reading_leaves_no_trace() {
        let dir = TempDir::new().unwrap();
        let (ctx, cache) = context(&dir);

        ctx.dispatch(parse_line("##READING, chamberX, 123").unwrap())
            .await;

        assert!(cache.snapshot("chamberX").await.is_none());
        assert!(!dir.path().join("chamber_chamberX_readings.csv").exists());
    }

    #[tokio::test]
    async fn ignored_reading_is_not_logged() {
        let dir = TempDir::new().unwrap();
        let (ctx, cache) = context(&dir);
        cache.register("c1").await;
        cache
            .ignore_next_reading(std::slice::from_ref(&"c1".to_string()))
            .await;

        ctx.dispatch(parse_line("##READING, c1, 55").unwrap()).await;

        assert!(!dir.path().join("chamber_c1_readings.csv").exists());
        assert!(cache.snapshot("c1").await.unwrap().raw_reading.is_none());
    }

    #[tokio::test]
    async fn alert_record_updates_cache() {
        let dir = TempDir::new().unwrap();
        let (ctx, cache) = context(&dir);
        cache.register("c1").await;

        ctx.dispatch(parse_line("##ALERT, c1, seal leak").unwrap())
            .await;

        assert_eq!(
            cache.snapshot("c1").await.unwrap().last_alert.as_deref(),
            Some("seal leak")
        );
    }

    #[tokio::test]
    async fn stop_with_nothing_running_completes() {
        let dir = TempDir::new().unwrap();
        let (ctx, _cache) = context(&dir);
        let mut monitor = SerialMonitor {
            context: ctx,
            shutdown: watch::channel(false).0,
            readers: Arc::new(RwLock::new(HashMap::new())),
            discovery: None,
        };
        monitor.stop().await;
    }

    #[tokio::test]
    async fn send_to_all_is_best_effort() {
        let dir = TempDir::new().unwrap();
        let (ctx, _cache) = context(&dir);
        let monitor = SerialMonitor {
            context: ctx,
            shutdown: watch::channel(false).0,
            readers: Arc::new(RwLock::new(HashMap::new())),
            discovery: None,
        };
        // Ports may be absent or unopenable; the broadcast still completes.
        monitor.send_to_all("#1, purging").await;
    }
}
