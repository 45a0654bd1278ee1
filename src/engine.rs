//! The flow engine: shared state plus the two background loops.
//!
//! ```text
//!  PulseSource ──1 Hz──▶ poll loop ──▶ RateSmoother (display)
//!                            │       └▶ pulse total
//!                            ▼
//!                     current FlowWindow ──anomalies──▶ NotificationGate
//!                            ▲
//!  scheduler ──ValveNotice──▶ drain loop (FIFO, 250 ms debounce)
//!                            │
//!                            └─ closed window ──▶ usage log + baselines
//! ```
//!
//! Both loops hold an `Arc<FlowEngine>` and run until the shared running
//! flag is cleared or the process exits.

use crate::config::{Config, ConfigError};
use crate::core::smoother::RateSmoother;
use crate::core::valves::{SharedStationBoard, ValveNotice, ValveStateTracker};
use crate::core::window::{pulses_to_volume, FlowWindow, MEASURE_SECS, SETTLE_SECS};
use crate::notify::{Notification, NotificationGate};
use crate::sensor::{PulseAccumulator, PulseSource, SensorError, SENTINEL_RATE};
use crate::settings::FlowSettings;
use crate::store::export::{log_csv, rates_csv};
use crate::store::{
    aggregate, BaselineMap, BaselineStore, EventLogStore, HistoricalRate, LogEntry, LogWriter,
    StoreError, WriteOutcome,
};
use chrono::{Local, NaiveDateTime};
use crossbeam_channel::{unbounded, Receiver, Sender};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Pause after taking a valve notice off the queue, so that a burst of
/// per-station changes from the scheduler settles into one transition.
pub const VALVE_DEBOUNCE: Duration = Duration::from_millis(250);

/// Result of processing one valve notice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Open valve set did not change
    Unchanged,
    /// Flow started from all-closed
    Started,
    /// Open set changed while flow continued; previous window logged
    Rotated(WriteOutcome),
    /// All valves closed; window logged
    Stopped(WriteOutcome),
}

/// Live values for display polling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowStatus {
    pub pulse_rate: i64,
    pub total_pulses: u64,
    pub flow_rate: String,
    pub flow_rate_raw: String,
    pub volume_measure: String,
    pub water_use: String,
    pub valve_status: String,
}

/// Runtime facts about the engine and its collaborators.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeInfo {
    pub sensor: String,
    pub sensor_connected: bool,
    /// Channels with a registered notifier and the notifier name
    pub notification_channels: Vec<(String, String)>,
    /// Settling period plus one sub-window, in seconds
    pub valve_measure_time: i64,
}

/// Engine context shared by the poll and drain loops.
pub struct FlowEngine {
    config: Config,
    board: SharedStationBoard,
    settings: RwLock<Arc<FlowSettings>>,
    smoother: Mutex<RateSmoother>,
    pulse_rate: AtomicI64,
    total_pulses: AtomicU64,
    sensor_ok: AtomicBool,
    sensor_description: RwLock<String>,
    window: Mutex<FlowWindow>,
    log: LogWriter,
    baseline_store: BaselineStore,
    baselines: Mutex<BaselineMap>,
    gate: NotificationGate,
    notice_tx: Sender<ValveNotice>,
    notice_rx: Receiver<ValveNotice>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn local_now() -> NaiveDateTime {
    Local::now().naive_local()
}

impl FlowEngine {
    /// Build the engine, loading settings and baselines from `config.data_path`.
    ///
    /// Missing or unreadable files fall back to defaults; construction
    /// never fails.
    pub fn new(config: Config, board: SharedStationBoard, gate: NotificationGate) -> Self {
        if let Err(e) = config.ensure_directories() {
            tracing::warn!("Could not create data directory {:?}: {}", config.data_path, e);
        }

        let settings = Arc::new(FlowSettings::load(&config.settings_path()));
        let baseline_store = BaselineStore::new(config.baseline_path());
        let baselines = baseline_store.load();

        let snapshot = ValveStateTracker::snapshot_shared(&board);
        let baseline = aggregate(&baselines, &snapshot.open);
        let window = FlowWindow::open(snapshot, local_now(), 0, baseline, settings.clone());

        let (notice_tx, notice_rx) = unbounded();

        tracing::info!(
            "Flow engine ready: {} baselines, logging {}",
            baselines.len(),
            if settings.enable_logging { "on" } else { "off" }
        );

        Self {
            smoother: Mutex::new(RateSmoother::new(config.smoother_size)),
            log: LogWriter::new(EventLogStore::new(config.log_path())),
            config,
            board,
            settings: RwLock::new(settings),
            pulse_rate: AtomicI64::new(0),
            total_pulses: AtomicU64::new(0),
            sensor_ok: AtomicBool::new(true),
            sensor_description: RwLock::new("not started".to_string()),
            window: Mutex::new(window),
            baseline_store,
            baselines: Mutex::new(baselines),
            gate,
            notice_tx,
            notice_rx,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn board(&self) -> &SharedStationBoard {
        &self.board
    }

    pub fn gate(&self) -> &NotificationGate {
        &self.gate
    }

    /// Current settings snapshot.
    pub fn settings(&self) -> Arc<FlowSettings> {
        self.settings
            .read()
            .map(|s| s.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }

    /// Re-read the settings file. Windows opened from now on use the new values.
    pub fn reload_settings(&self) -> Arc<FlowSettings> {
        let settings = Arc::new(FlowSettings::load(&self.config.settings_path()));
        match self.settings.write() {
            Ok(mut current) => *current = settings.clone(),
            Err(poisoned) => *poisoned.into_inner() = settings.clone(),
        }
        tracing::info!("Flow settings reloaded");
        settings
    }

    /// Persist new settings and load them back through validation.
    pub fn save_settings(&self, settings: &FlowSettings) -> Result<Arc<FlowSettings>, ConfigError> {
        settings.save(&self.config.settings_path())?;
        Ok(self.reload_settings())
    }

    /// Total pulses counted since start.
    pub fn total_pulses(&self) -> u64 {
        self.total_pulses.load(Ordering::Relaxed)
    }

    /// Queue handle for valve-change notices.
    pub fn notice_sender(&self) -> Sender<ValveNotice> {
        self.notice_tx.clone()
    }

    /// Signal from the scheduler that its valve vector changed.
    pub fn notify_zone_change(&self) {
        let notice = ValveNotice::new(local_now(), self.total_pulses());
        if self.notice_tx.send(notice).is_err() {
            tracing::warn!("Valve notice queue closed, change dropped");
        }
    }

    /// Copy of the current window.
    pub fn window_snapshot(&self) -> FlowWindow {
        lock(&self.window).clone()
    }

    /// Apply one valve notice to the window state machine.
    pub fn handle_valve_notice(&self, notice: ValveNotice) -> Transition {
        let snapshot = ValveStateTracker::snapshot_shared(&self.board);
        let settings = self.settings();

        let (mut previous, transition) = {
            let mut window = lock(&self.window);
            if window.open_valves() == snapshot.open.as_slice() {
                return Transition::Unchanged;
            }
            let was_open = window.valve_open();
            let now_open = snapshot.any_open();
            tracing::info!("Valves changed: {}", snapshot.status_str());

            let baseline = aggregate(&lock(&self.baselines), &snapshot.open);
            let next = FlowWindow::open(
                snapshot,
                notice.switch_time,
                notice.pulse_count,
                baseline,
                settings.clone(),
            );
            let previous = std::mem::replace(&mut *window, next);
            (previous, (was_open, now_open))
        };

        match transition {
            (false, true) => Transition::Started,
            (true, now_open) => {
                previous.close(notice.switch_time, notice.pulse_count);
                let outcome = self.finish_window(&previous, &settings);
                if now_open {
                    Transition::Rotated(outcome)
                } else {
                    Transition::Stopped(outcome)
                }
            }
            (false, false) => Transition::Unchanged,
        }
    }

    /// Log a closed window and update its station's baseline.
    fn finish_window(&self, window: &FlowWindow, settings: &FlowSettings) -> WriteOutcome {
        let outcome = self.log.try_write(
            &window.log_entry(),
            settings.enable_logging,
            settings.max_log_entries,
        );
        self.update_baseline(window);
        outcome
    }

    fn update_baseline(&self, window: &FlowWindow) {
        let rate = window.window_measured_rate();
        let [station] = window.open_valves() else {
            return;
        };
        if rate <= 0.0 {
            return;
        }

        let mut baselines = lock(&self.baselines);
        baselines.insert(
            *station,
            HistoricalRate {
                rate,
                time: window.end_time.unwrap_or(window.start_time),
            },
        );
        tracing::info!("Baseline for station {} is now {:.1} pulses/hr", station, rate);
        if let Err(e) = self.baseline_store.save(&baselines) {
            tracing::warn!("Could not save flow baselines: {}", e);
        }
    }

    /// Process one sensor reading taken `elapsed` after the last good one.
    pub fn record_reading(
        &self,
        reading: Result<u32, SensorError>,
        accumulator: &mut PulseAccumulator,
        elapsed: Duration,
        now: NaiveDateTime,
    ) -> Vec<Notification> {
        match reading {
            Ok(rate) => {
                if !self.sensor_ok.swap(true, Ordering::Relaxed) {
                    tracing::info!("Flow sensor reading again");
                }
                let total = accumulator.add(rate, elapsed);
                self.apply_pulse_sample(i64::from(rate), total, now)
            }
            Err(e) => {
                if self.sensor_ok.swap(false, Ordering::Relaxed) {
                    tracing::warn!("Flow sensor read failed: {}", e);
                } else {
                    tracing::debug!("Flow sensor still failing: {}", e);
                }
                self.apply_pulse_sample(SENTINEL_RATE, accumulator.total(), now)
            }
        }
    }

    /// Feed a rate (pulses/second, negative = unreadable) and pulse total.
    pub fn apply_pulse_sample(&self, rate: i64, total_pulses: u64, now: NaiveDateTime) -> Vec<Notification> {
        self.pulse_rate.store(rate, Ordering::Relaxed);
        self.total_pulses.fetch_max(total_pulses, Ordering::Relaxed);
        lock(&self.smoother).add_reading(rate as f64);

        if rate < 0 {
            return Vec::new();
        }
        let anomalies = lock(&self.window).set_pulse_values(rate as f64, self.total_pulses(), now);
        self.gate.dispatch(&anomalies, &self.settings())
    }

    /// Start the poll and drain threads.
    pub fn spawn(
        self: &Arc<Self>,
        source: Box<dyn PulseSource>,
        running: Arc<AtomicBool>,
    ) -> std::io::Result<Vec<JoinHandle<()>>> {
        if let Ok(mut description) = self.sensor_description.write() {
            *description = source.describe();
        }

        let poll = {
            let engine = Arc::clone(self);
            let running = Arc::clone(&running);
            thread::Builder::new()
                .name("flow-poll".into())
                .spawn(move || engine.poll_loop(source, &running))?
        };
        let drain = {
            let engine = Arc::clone(self);
            thread::Builder::new()
                .name("valve-drain".into())
                .spawn(move || engine.drain_loop(&running))?
        };
        Ok(vec![poll, drain])
    }

    fn poll_loop(&self, mut source: Box<dyn PulseSource>, running: &AtomicBool) {
        tracing::info!("Flow poll loop started ({})", source.describe());
        let mut accumulator = PulseAccumulator::new();
        let mut last_good = Instant::now();

        while running.load(Ordering::SeqCst) {
            let reading = source.read_rate();
            let taken = Instant::now();
            let elapsed = taken.duration_since(last_good);
            if reading.is_ok() {
                last_good = taken;
            }
            self.record_reading(reading, &mut accumulator, elapsed, local_now());
            thread::sleep(self.config.poll_interval);
        }
        tracing::info!("Flow poll loop stopped");
    }

    fn drain_loop(&self, running: &AtomicBool) {
        tracing::info!("Valve change loop started");
        while running.load(Ordering::SeqCst) {
            while let Ok(notice) = self.notice_rx.try_recv() {
                // Let the scheduler finish updating every station first.
                thread::sleep(VALVE_DEBOUNCE);
                self.handle_valve_notice(notice);
            }
            thread::sleep(self.config.drain_interval);
        }
        tracing::info!("Valve change loop stopped");
    }

    /// Live values for display.
    pub fn status(&self) -> FlowStatus {
        let settings = self.settings();
        let (average, last) = {
            let smoother = lock(&self.smoother);
            (smoother.ave_reading(), smoother.last_reading())
        };
        let total = self.total_pulses();
        let window_start = lock(&self.window).start_pulses;

        let (flow_rate, flow_rate_raw) = if !settings.calibrated() {
            ("0".to_string(), "0".to_string())
        } else if last >= 0.0 {
            let per_hour = 3600.0 / settings.pulses_per_measure;
            (
                group_thousands(average * per_hour, 1),
                group_thousands(last * per_hour, 1),
            )
        } else {
            ("N/A".to_string(), "N/A".to_string())
        };

        let water_use = pulses_to_volume(
            total.saturating_sub(window_start),
            settings.pulses_per_measure,
        );

        FlowStatus {
            pulse_rate: self.pulse_rate.load(Ordering::Relaxed),
            total_pulses: total,
            flow_rate,
            flow_rate_raw,
            volume_measure: format!("{}/hr", settings.volume_measure),
            water_use: format!("{:.1} {}", water_use, settings.volume_measure),
            valve_status: lock(&self.window).valves().status_str(),
        }
    }

    pub fn runtime_info(&self) -> RuntimeInfo {
        RuntimeInfo {
            sensor: self
                .sensor_description
                .read()
                .map(|s| s.clone())
                .unwrap_or_default(),
            sensor_connected: self.pulse_rate.load(Ordering::Relaxed) >= 0,
            notification_channels: self
                .gate
                .online()
                .into_iter()
                .map(|(channel, name)| (channel.to_string(), name))
                .collect(),
            valve_measure_time: SETTLE_SECS + MEASURE_SECS,
        }
    }

    /// Usage log, most recent first.
    pub fn log_entries(&self) -> Vec<LogEntry> {
        self.log.store().read().collect()
    }

    pub fn clear_log(&self) -> Result<(), StoreError> {
        self.log.clear()?;
        tracing::info!("Flow log cleared");
        Ok(())
    }

    pub fn export_log_csv(&self) -> Result<String, StoreError> {
        log_csv(&self.log_entries())
    }

    /// Current per-station baselines.
    pub fn baseline_rates(&self) -> BaselineMap {
        lock(&self.baselines).clone()
    }

    pub fn export_rates_csv(&self) -> Result<String, StoreError> {
        let board = self
            .board
            .read()
            .map(|b| b.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone());
        rates_csv(&self.baseline_rates(), |i| board.station_name(i), &self.settings())
    }
}

/// Format with `decimals` places and comma thousands separators.
pub fn group_thousands(value: f64, decimals: usize) -> String {
    let formatted = format!("{:.*}", decimals, value.abs());
    let (int_part, frac_part) = match formatted.split_once('.') {
        Some((i, f)) => (i, Some(f)),
        None => (formatted.as_str(), None),
    };

    let mut grouped = String::with_capacity(formatted.len() + int_part.len() / 3);
    for (i, digit) in int_part.chars().enumerate() {
        if i > 0 && (int_part.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(digit);
    }
    if let Some(frac) = frac_part {
        grouped.push('.');
        grouped.push_str(frac);
    }
    if value < 0.0 && grouped.chars().any(|c| c.is_ascii_digit() && c != '0') {
        grouped.insert(0, '-');
    }
    grouped
}
