// src/control.rs
//! The control scheduler: owns the chamber registry, decides which group is
//! due for a purge, and drives the purge state machine against the valve
//! bank, the vacuum pump, and the sensor cache.
//!
//! Single-writer rules: this is the only component that mutates chamber
//! status or the schedule store. Sensor ingestion only ever writes the
//! reading cache.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::alerts::AlertSink;
use crate::chamber::Chamber;
use crate::config::{ScheduleStore, Settings};
use crate::error::Result;
use crate::gpio::OutputLine;
use crate::sensors::SensorCache;
use crate::serial_monitor::SerialMonitor;
use crate::shift_register::ValveBank;

/// Which side of the threshold ends a pressure wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PressureTarget {
    /// Vacuum phase: met when cached pressure drops below the level.
    Below,
    /// Gas phase: met when cached pressure rises above the level.
    Above,
}

pub struct ControlSystem {
    settings: Arc<Settings>,
    chambers: HashMap<String, Chamber>,
    store: ScheduleStore,
    valves: ValveBank,
    pump: Box<dyn OutputLine>,
    monitor: SerialMonitor,
    cache: Arc<SensorCache>,
    alerts: AlertSink,
    shutdown: watch::Receiver<bool>,
}

fn unix_now() -> u64 {
    chrono::Utc::now().timestamp().max(0) as u64
}

impl ControlSystem {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        settings: Arc<Settings>,
        store: ScheduleStore,
        valves: ValveBank,
        pump: Box<dyn OutputLine>,
        monitor: SerialMonitor,
        cache: Arc<SensorCache>,
        alerts: AlertSink,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            settings,
            chambers: HashMap::new(),
            store,
            valves,
            pump,
            monitor,
            cache,
            alerts,
            shutdown,
        }
    }

    /// Seeds groups and registers every configured chamber.
    pub async fn register_from_settings(&mut self) {
        let groups = self.settings.chamber_groups.clone();
        for (group, interval) in groups {
            self.store.ensure_group(&group, interval);
        }
        let specs = self.settings.chambers.clone();
        for spec in specs {
            self.add_chamber(&spec.name, &spec.group, spec.slot).await;
        }
    }

    /// Registers a chamber. Slot and name collisions are configuration
    /// errors: logged, and the registry is left unchanged. A slot found in
    /// the persisted disabled set comes up DISABLED and gets no cache entry,
    /// so it is never purged or polled.
    pub async fn add_chamber(&mut self, name: &str, group: &str, slot: u8) {
        // Checked before Chamber::new, whose slot assertion would abort the
        // process instead of rejecting the entry.
        if slot == 0 {
            warn!(
                "Tried to add chamber \"{}\" to slot 0, but slots are 1-based.",
                name
            );
            return;
        }
        let mut chamber = Chamber::new(name, group, slot);

        if chamber.vacuum_bit() >= self.settings.valve_channels {
            warn!(
                "Tried to add chamber \"{}\" to slot {}, but the slot does not map onto the {}-channel valve driver.",
                name, slot, self.settings.valve_channels
            );
            return;
        }
        for existing in self.chambers.values() {
            if existing.slot == slot {
                warn!(
                    "Tried to add chamber \"{}\" to slot {}, but a chamber is configured for that slot.",
                    name, slot
                );
                return;
            }
            if existing.name == name {
                warn!(
                    "Tried to add chamber \"{}\" to slot {}, but a chamber with the same name is already configured.",
                    name, slot
                );
                return;
            }
        }
        if !self.store.groups().contains_key(group) {
            warn!(
                "Chamber \"{}\" references unknown group \"{}\"; it will never be scheduled.",
                name, group
            );
        }

        debug!("Adding chamber \"{}\" to slot {}", name, slot);
        if self.store.is_disabled(slot) {
            chamber.disable();
        } else {
            self.cache.register(name).await;
        }
        self.chambers.insert(name.to_string(), chamber);
    }

    pub fn chamber(&self, name: &str) -> Option<&Chamber> {
        self.chambers.get(name)
    }

    pub fn chamber_count(&self) -> usize {
        self.chambers.len()
    }

    /// The group with the smallest `last_purge + interval` among groups that
    /// have at least one member chamber. Ties resolve to the first group in
    /// `BTreeMap` order, so selection is deterministic per run.
    pub fn next_due_group(&self) -> Option<(String, u64)> {
        let mut next: Option<(String, u64)> = None;
        for (group, schedule) in self.store.groups() {
            if !self.chambers.values().any(|c| &c.group == group) {
                continue;
            }
            let due = schedule.last_purge + schedule.purge_interval_s;
            match &next {
                Some((_, best)) if due >= *best => {}
                _ => next = Some((group.clone(), due)),
            }
        }
        next
    }

    fn shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Main scheduling loop. Runs until the shutdown signal or a fatal
    /// hardware error; either way the hardware is reset and the serial
    /// monitor joined before returning.
    pub async fn run(&mut self) -> Result<()> {
        self.monitor.start(self.settings.monitor_interval());
        let result = self.run_loop().await;
        self.shut_down().await;
        result
    }

    async fn run_loop(&mut self) -> Result<()> {
        loop {
            if self.shutting_down() {
                break;
            }
            match self.next_due_group() {
                None => {
                    // Nothing registered yet; idle until something is.
                    if self.sleep_interruptible(Duration::from_secs(1)).await {
                        break;
                    }
                }
                Some((group, due)) => {
                    let now = unix_now();
                    if now < due {
                        // Bounded wait, re-evaluated on wake.
                        if self
                            .sleep_interruptible(Duration::from_secs(due - now))
                            .await
                        {
                            break;
                        }
                        continue;
                    }
                    let started = unix_now();
                    for pass in 0..self.settings.purge_passes {
                        debug!("Purge pass {} for group \"{}\"", pass + 1, group);
                        self.purge_group(&group).await?;
                        if self.shutting_down() {
                            break;
                        }
                    }
                    self.store.set_last_purge(&group, started);
                    if let Err(e) = self.store.save() {
                        error!("Failed to persist group schedule: {}", e);
                    }
                }
            }
        }
        Ok(())
    }

    /// Sleeps for `duration`, returning true if shutdown arrived first.
    async fn sleep_interruptible(&mut self, duration: Duration) -> bool {
        tokio::select! {
            _ = self.shutdown.changed() => true,
            _ = tokio::time::sleep(duration) => false,
        }
    }

    pub async fn purge_group(&mut self, group: &str) -> Result<()> {
        let members: Vec<String> = self
            .chambers
            .values()
            .filter(|c| c.group == group)
            .map(|c| c.name.clone())
            .collect();
        self.purge_chambers(members).await
    }

    /// The purge state machine: evacuate every NORMAL chamber in the set,
    /// then flood with gas, disabling and alerting any chamber that misses a
    /// pressure deadline.
    ///
    /// A chamber's gas and vacuum valve are never commanded open at the same
    /// time, but only because of the ordering below; there is no runtime
    /// guard enforcing it. Latent hazard if this sequence is ever reordered.
    pub async fn purge_chambers(&mut self, chambers: Vec<String>) -> Result<()> {
        let targets: Vec<String> = chambers
            .iter()
            .filter(|name| {
                self.chambers
                    .get(name.as_str())
                    .is_some_and(|c| c.is_normal())
            })
            .cloned()
            .collect();
        let skipped: Vec<u8> = chambers
            .iter()
            .filter_map(|name| self.chambers.get(name.as_str()))
            .filter(|c| !c.is_normal())
            .map(|c| c.slot)
            .collect();

        if !skipped.is_empty() {
            info!("Skipping disabled chambers in slots {:?}", skipped);
        }
        if targets.is_empty() {
            warn!("Tried to purge chambers but none were in NORMAL state.");
            return Ok(());
        }
        debug!(
            "Purging chambers in slots {:?}",
            self.slots_of(&targets)
        );

        // Steady-state samples taken mid-purge would be garbage; flag them
        // for the cache to drop.
        self.cache.ignore_next_reading(&targets).await;

        // Evacuate: tell each chamber it is being purged, open its vacuum
        // valve, then energize the shared pump.
        for name in &targets {
            let (slot, vacuum_bit) = match self.chambers.get(name) {
                Some(c) => (c.slot, c.vacuum_bit()),
                None => continue,
            };
            self.monitor
                .send_to_all(&format!("#{}, purging", slot))
                .await;
            tokio::time::sleep(Duration::from_millis(10)).await;
            self.valves.write_bit(vacuum_bit, true).await?;
        }
        self.pump.set_high()?;
        info!("Vacuum pump turned ON");

        let vacuum_unmet = self
            .wait_for_pressure(
                &targets,
                self.settings.vacuum_pressure,
                PressureTarget::Below,
                self.settings.vacuum_timeout(),
            )
            .await;

        // Vacuum valves close for every originally-targeted chamber before
        // the pump stops, met or not.
        for name in &targets {
            if let Some(bit) = self.chambers.get(name).map(|c| c.vacuum_bit()) {
                self.valves.write_bit(bit, false).await?;
            }
        }
        self.pump.set_low()?;
        info!("Vacuum pump turned OFF");

        if self.shutting_down() {
            return Ok(());
        }
        for name in &vacuum_unmet {
            self.disable_chamber(name, "Vacuum pressure not met!").await?;
        }

        let survivors: Vec<String> = targets
            .iter()
            .filter(|name| {
                self.chambers
                    .get(name.as_str())
                    .is_some_and(|c| c.is_normal())
            })
            .cloned()
            .collect();
        if survivors.is_empty() {
            return Ok(());
        }

        // Settle before cross-connecting anything to the gas manifold.
        tokio::time::sleep(self.settings.settle_delay()).await;

        for name in &survivors {
            if let Some(bit) = self.chambers.get(name).map(|c| c.gas_bit()) {
                self.valves.write_bit(bit, true).await?;
            }
        }

        let gas_unmet = self
            .wait_for_pressure(
                &survivors,
                self.settings.gas_pressure,
                PressureTarget::Above,
                self.settings.gas_timeout(),
            )
            .await;

        if self.shutting_down() {
            return Ok(());
        }
        for name in &gas_unmet {
            self.disable_chamber(name, "Gas pressure not met!").await?;
        }

        for name in &survivors {
            if let Some(chamber) = self.chambers.get(name) {
                if chamber.is_normal() {
                    self.valves.write_bit(chamber.gas_bit(), false).await?;
                }
            }
        }

        debug!(
            "Finished purging chambers {:?}",
            survivors
                .iter()
                .filter(|n| self.chambers.get(n.as_str()).is_some_and(|c| c.is_normal()))
                .collect::<Vec<_>>()
        );
        Ok(())
    }

    /// Polls the cached pressure for each pending chamber until every target
    /// is met or the timeout elapses, whichever comes first. Returns the
    /// chambers still unmet at the deadline.
    ///
    /// A chamber with no cached reading is never counted as met. A chamber
    /// whose status left NORMAL during the wait is dropped from the pending
    /// set without landing in the unmet result.
    pub async fn wait_for_pressure(
        &self,
        chambers: &[String],
        pressure_level: f64,
        target: PressureTarget,
        timeout: Duration,
    ) -> Vec<String> {
        debug!(
            "Waiting for {} pressure",
            if target == PressureTarget::Below { "low" } else { "high" }
        );
        let deadline = Instant::now() + timeout;
        let poll = self.settings.poll_interval();
        let mut pending: Vec<String> = chambers.to_vec();

        while Instant::now() < deadline {
            if self.shutting_down() {
                break;
            }
            let mut still_pending = Vec::with_capacity(pending.len());
            for name in pending {
                let Some(chamber) = self.chambers.get(&name) else {
                    continue;
                };
                if !chamber.is_normal() {
                    debug!(
                        "Chamber \"{}\" left NORMAL during pressure wait, dropping it",
                        name
                    );
                    continue;
                }
                match self.cache.pressure(&name).await {
                    None => {
                        debug!("No pressure reading yet for chamber \"{}\"", name);
                        still_pending.push(name);
                    }
                    Some(pressure) => {
                        let met = match target {
                            PressureTarget::Below => pressure < pressure_level,
                            PressureTarget::Above => pressure > pressure_level,
                        };
                        if met {
                            debug!("Pressure met for chamber \"{}\"", name);
                            // Seal the chamber the moment it hits target.
                            if let Err(e) = self.close_both_valves(chamber).await {
                                error!("Failed to close valves for \"{}\": {}", name, e);
                            }
                        } else {
                            still_pending.push(name);
                        }
                    }
                }
            }
            pending = still_pending;
            if pending.is_empty() {
                return Vec::new();
            }
            let next_tick = Instant::now() + poll;
            tokio::time::sleep_until(next_tick.min(deadline)).await;
        }
        debug!("Pressure wait finished with {} chamber(s) unmet", pending.len());
        pending
    }

    async fn close_both_valves(&self, chamber: &Chamber) -> Result<()> {
        self.valves.write_bit(chamber.vacuum_bit(), false).await?;
        self.valves.write_bit(chamber.gas_bit(), false).await?;
        Ok(())
    }

    /// Forces both valves closed, transitions the chamber to DISABLED,
    /// persists the slot if newly disabled, and dispatches alerts. The
    /// transition is one-way; recovery is an administrative action outside
    /// this process.
    pub async fn disable_chamber(&mut self, name: &str, reason: &str) -> Result<()> {
        let Some((slot, gas_bit, vacuum_bit)) = self
            .chambers
            .get(name)
            .map(|c| (c.slot, c.gas_bit(), c.vacuum_bit()))
        else {
            return Ok(());
        };

        self.alerts.notify_detached(name.to_string(), "DISABLED");
        self.alerts.notify_detached(slot.to_string(), reason.to_string());

        self.valves.write_bit(gas_bit, false).await?;
        self.valves.write_bit(vacuum_bit, false).await?;

        if let Some(chamber) = self.chambers.get_mut(name) {
            chamber.disable();
        }
        if self.store.mark_disabled(slot) {
            if let Err(e) = self.store.save() {
                error!("Failed to persist disabled set: {}", e);
            }
        }
        warn!("Disabled chamber {} (slot {}): {}", name, slot, reason);
        Ok(())
    }

    /// Final cleanup: every valve closed, pump off, serial monitor joined.
    pub async fn shut_down(&mut self) {
        info!("Shutting control system down");
        if let Err(e) = self.valves.set_all_low().await {
            error!("Failed to reset valve register: {}", e);
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
        if let Err(e) = self.pump.set_low() {
            error!("Failed to de-energize vacuum pump: {}", e);
        }
        self.monitor.stop().await;
        info!("Control system stopped");
    }

    fn slots_of(&self, names: &[String]) -> Vec<u8> {
        names
            .iter()
            .filter_map(|n| self.chambers.get(n).map(|c| c.slot))
            .collect()
    }
}
