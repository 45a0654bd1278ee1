//! Flow windows: the unit of flow measurement and logging.
//!
//! A window spans an interval during which the set of open valves is
//! constant. The engine always holds exactly one current window; when no
//! valve is open it is an idle window, which is never logged but is
//! where unexpected flow is detected.
//!
//! While a window is open the pulse poll feeds it once per second:
//!
//! ```text
//!  start        +15s (settled)      +45s            +75s
//!    │ ignored     │  sub-window 1    │  sub-window 2  │ ...
//!    └─────────────┴──────────────────┴────────────────┘
//!                        measure ─────┘       measure ─┘
//! ```
//!
//! Each completed sub-window yields `window_measured_rate` in pulses per
//! hour and runs the anomaly checks. Every check reports at most once per
//! window (per channel for the rate checks).

use crate::core::anomaly::{Anomaly, AnomalyKind, Baseline, Channel, ChannelFlags};
use crate::core::valves::ValveSnapshot;
use crate::settings::FlowSettings;
use crate::store::log::LogEntry;
use chrono::{Duration, NaiveDateTime};
use std::sync::Arc;

/// Initial part of a window excluded from measurement (seconds).
pub const SETTLE_SECS: i64 = 15;

/// Length of one measurement sub-window (seconds).
pub const MEASURE_SECS: i64 = 30;

/// Time after all valves close before flow counts as unexpected (seconds).
pub const UNEXPECTED_FLOW_GRACE_SECS: i64 = 3;

/// Instantaneous rate (pulses/second) above which idle flow is unexpected.
pub const UNEXPECTED_FLOW_THRESHOLD: f64 = 3.0;

/// Which anomalies have already been raised in this window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WarningFlags {
    pub unexpected_flow: bool,
    pub no_flow: bool,
    pub rate_high: ChannelFlags,
    pub rate_low: ChannelFlags,
}

/// Start of the sub-window currently accumulating.
#[derive(Debug, Clone, Copy)]
struct SubWindow {
    start_time: NaiveDateTime,
    start_pulses: u64,
}

/// One contiguous interval of (possibly no) valve activity.
#[derive(Debug, Clone)]
pub struct FlowWindow {
    settings: Arc<FlowSettings>,
    pub start_time: NaiveDateTime,
    pub end_time: Option<NaiveDateTime>,
    pub start_pulses: u64,
    pub end_pulses: u64,
    valves: ValveSnapshot,
    baseline: Option<Baseline>,
    window_measured_rate: f64,
    sub_window: Option<SubWindow>,
    warnings: WarningFlags,
}

impl FlowWindow {
    /// Open a window for `valves` at the given switch time and pulse count.
    ///
    /// `baseline` is the aggregate historical rate of the open valves, or
    /// `None` when it is unknown.
    pub fn open(
        valves: ValveSnapshot,
        start_time: NaiveDateTime,
        start_pulses: u64,
        baseline: Option<Baseline>,
        settings: Arc<FlowSettings>,
    ) -> Self {
        Self {
            settings,
            start_time,
            end_time: None,
            start_pulses,
            end_pulses: start_pulses,
            valves,
            baseline: baseline.filter(|b| b.rate > 0.0),
            window_measured_rate: 0.0,
            sub_window: None,
            warnings: WarningFlags::default(),
        }
    }

    /// Feed one pulse-poll tick. Returns the anomalies raised by this tick.
    ///
    /// `rate` is the instantaneous pulses/second (negative when the sensor
    /// could not be read) and `pulse_count` the running pulse total.
    pub fn set_pulse_values(
        &mut self,
        rate: f64,
        pulse_count: u64,
        now: NaiveDateTime,
    ) -> Vec<Anomaly> {
        let mut anomalies = Vec::new();
        if rate < 0.0 || self.end_time.is_some() {
            return anomalies;
        }
        self.end_pulses = self.end_pulses.max(pulse_count);
        let elapsed = now - self.start_time;

        if !self.valve_open() {
            if !self.warnings.unexpected_flow
                && elapsed >= Duration::seconds(UNEXPECTED_FLOW_GRACE_SECS)
                && rate > UNEXPECTED_FLOW_THRESHOLD
            {
                self.warnings.unexpected_flow = true;
                anomalies.push(self.anomaly(AnomalyKind::UnexpectedFlow, None, rate * 3600.0, now));
            }
            return anomalies;
        }

        if elapsed < Duration::seconds(SETTLE_SECS) {
            return anomalies;
        }

        let sub = match self.sub_window {
            Some(sub) => sub,
            None => {
                self.sub_window = Some(SubWindow {
                    start_time: now,
                    start_pulses: pulse_count,
                });
                return anomalies;
            }
        };

        let sub_elapsed = now - sub.start_time;
        if sub_elapsed < Duration::seconds(MEASURE_SECS) {
            return anomalies;
        }

        let secs = sub_elapsed.num_milliseconds() as f64 / 1000.0;
        let delta = pulse_count.saturating_sub(sub.start_pulses) as f64;
        self.window_measured_rate = delta / secs * 3600.0;
        self.sub_window = Some(SubWindow {
            start_time: now,
            start_pulses: pulse_count,
        });

        self.check_measurement(now, &mut anomalies);
        anomalies
    }

    /// Anomaly checks for a freshly completed sub-window.
    fn check_measurement(&mut self, now: NaiveDateTime, anomalies: &mut Vec<Anomaly>) {
        let measured = self.window_measured_rate;

        if measured == 0.0 && !self.warnings.no_flow {
            self.warnings.no_flow = true;
            anomalies.push(self.anomaly(AnomalyKind::NoFlow, None, measured, now));
        }

        let Some(baseline) = self.baseline else {
            return;
        };
        let ratio = measured / baseline.rate;

        for channel in Channel::ALL {
            let variance = self.settings.variance(channel);
            if ratio >= 1.0 + variance && !self.warnings.rate_high.get(channel) {
                self.warnings.rate_high.set(channel);
                anomalies.push(self.anomaly(AnomalyKind::RateHigh, Some(channel), measured, now));
            }
            if measured > 0.0 && ratio <= 1.0 - variance && !self.warnings.rate_low.get(channel) {
                self.warnings.rate_low.set(channel);
                anomalies.push(self.anomaly(AnomalyKind::RateLow, Some(channel), measured, now));
            }
        }
    }

    fn anomaly(
        &self,
        kind: AnomalyKind,
        channel: Option<Channel>,
        measured_rate: f64,
        now: NaiveDateTime,
    ) -> Anomaly {
        Anomaly {
            kind,
            channel,
            stations: self.valves.names.clone(),
            measured_rate,
            baseline: self.baseline,
            detected_at: now,
        }
    }

    /// Close the window at the given switch time and pulse count.
    pub fn close(&mut self, end_time: NaiveDateTime, end_pulses: u64) {
        self.end_time = Some(end_time.max(self.start_time));
        self.end_pulses = end_pulses.max(self.start_pulses);
    }

    /// Whether any (non-master) valve is open in this window.
    pub fn valve_open(&self) -> bool {
        self.valves.any_open()
    }

    pub fn open_valves(&self) -> &[usize] {
        &self.valves.open
    }

    pub fn open_valve_names(&self) -> &[String] {
        &self.valves.names
    }

    pub fn valves(&self) -> &ValveSnapshot {
        &self.valves
    }

    pub fn settings(&self) -> &FlowSettings {
        &self.settings
    }

    /// Historical rate the window compares against, if known.
    pub fn historical_average_rate(&self) -> Option<Baseline> {
        self.baseline
    }

    /// Rate of the most recent completed sub-window (pulses/hour), 0 if none.
    pub fn window_measured_rate(&self) -> f64 {
        self.window_measured_rate
    }

    pub fn warnings(&self) -> &WarningFlags {
        &self.warnings
    }

    /// Water used in the window, to 0.1 of the volume unit.
    pub fn usage(&self) -> f64 {
        pulses_to_volume(
            self.end_pulses.saturating_sub(self.start_pulses),
            self.settings.pulses_per_measure,
        )
    }

    /// Whole seconds between start and end (0 while the window is open).
    pub fn duration_secs(&self) -> i64 {
        self.end_time
            .map(|end| (end - self.start_time).num_seconds())
            .unwrap_or(0)
    }

    /// Log record describing this window.
    pub fn log_entry(&self) -> LogEntry {
        LogEntry {
            valves: self
                .valves
                .open
                .iter()
                .map(|v| v.to_string())
                .collect::<Vec<_>>()
                .join(","),
            stations: self.valves.names.join(","),
            usage: self.usage(),
            measure: self.settings.volume_measure.clone(),
            duration: format_duration(self.duration_secs()),
            date: self.start_time.format("%Y-%m-%d").to_string(),
            start: self.start_time.format("%H:%M:%S").to_string(),
        }
    }
}

/// Convert a pulse count to volume, rounded to 0.1; 0 when uncalibrated.
pub fn pulses_to_volume(pulses: u64, pulses_per_measure: f64) -> f64 {
    if pulses_per_measure > 0.0 {
        (pulses as f64 / pulses_per_measure * 10.0).round() / 10.0
    } else {
        0.0
    }
}

/// Format seconds as `mm:ss` (minutes are not wrapped into hours).
pub fn format_duration(secs: i64) -> String {
    let secs = secs.max(0);
    format!("{:02}:{:02}", secs / 60, secs % 60)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::anomaly::EventList;
    use chrono::NaiveDate;

    fn t0() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 6, 1)
            .unwrap()
            .and_hms_opt(6, 0, 0)
            .unwrap()
    }

    fn at(secs: i64) -> NaiveDateTime {
        t0() + Duration::seconds(secs)
    }

    fn settings() -> Arc<FlowSettings> {
        Arc::new(FlowSettings {
            pulses_per_measure: 10.0,
            volume_measure: "gal".into(),
            enable_logging: true,
            email_variance: 0.5,
            sms_variance: 0.5,
            voice_variance: 0.5,
            email_events: EventList::parse("1,2,3"),
            ..FlowSettings::default()
        })
    }

    fn valves(open: &[usize]) -> ValveSnapshot {
        ValveSnapshot {
            open: open.to_vec(),
            names: open.iter().map(|v| format!("S{v}")).collect(),
        }
    }

    fn baseline(rate: f64) -> Option<Baseline> {
        Some(Baseline {
            rate,
            recorded: t0() - Duration::days(1),
        })
    }

    /// Drive a window at `pulses_per_sec` for `secs` ticks; returns all anomalies.
    fn run(window: &mut FlowWindow, from: i64, secs: i64, pulses_per_sec: u64) -> Vec<Anomaly> {
        let mut out = Vec::new();
        for s in from..=from + secs {
            let pulses = window.start_pulses + s as u64 * pulses_per_sec;
            out.extend(window.set_pulse_values(pulses_per_sec as f64, pulses, at(s)));
        }
        out
    }

    #[test]
    fn test_settling_period_ignored() {
        let mut w = FlowWindow::open(valves(&[2]), t0(), 0, baseline(100.0), settings());
        let anomalies = run(&mut w, 1, 14, 0);
        assert!(anomalies.is_empty());
        assert_eq!(w.window_measured_rate(), 0.0);
        w.close(at(14), 0);
        assert_eq!(w.duration_secs(), 14);
    }

    #[test]
    fn test_sub_window_rate() {
        let mut w = FlowWindow::open(valves(&[2]), t0(), 0, None, settings());
        run(&mut w, 1, 45, 2);
        // 60 pulses over the 30 s sub-window, 2 pulses/s = 7200 pulses/hr
        assert!((w.window_measured_rate() - 7200.0).abs() < 1e-6);
    }

    #[test]
    fn test_no_flow_reported_once() {
        let mut w = FlowWindow::open(valves(&[1]), t0(), 0, None, settings());
        let anomalies = run(&mut w, 1, 120, 0);
        assert_eq!(anomalies.len(), 1);
        assert_eq!(anomalies[0].kind, AnomalyKind::NoFlow);
        assert!(anomalies[0].channel.is_none());
        assert!(w.warnings().no_flow);
    }

    #[test]
    fn test_rate_high_once_per_channel() {
        let mut w = FlowWindow::open(valves(&[3]), t0(), 0, baseline(3600.0), settings());
        // 2 pulses/s = 7200 pulses/hr, ratio 2.0
        let anomalies = run(&mut w, 1, 120, 2);
        let high: Vec<_> = anomalies
            .iter()
            .filter(|a| a.kind == AnomalyKind::RateHigh)
            .collect();
        assert_eq!(high.len(), 3);
        assert!(high.iter().any(|a| a.channel == Some(Channel::Email)));
        assert!(w.warnings().rate_high.get(Channel::Voice));
    }

    #[test]
    fn test_rate_low_requires_flow() {
        let mut w = FlowWindow::open(valves(&[3]), t0(), 0, baseline(72000.0), settings());
        // 2 pulses/s = 7200 pulses/hr, ratio 0.1
        let anomalies = run(&mut w, 1, 50, 2);
        assert!(anomalies.iter().all(|a| a.kind == AnomalyKind::RateLow));
        assert_eq!(anomalies.len(), 3);

        let mut dry = FlowWindow::open(valves(&[3]), t0(), 0, baseline(72000.0), settings());
        let anomalies = run(&mut dry, 1, 50, 0);
        assert_eq!(anomalies.len(), 1);
        assert_eq!(anomalies[0].kind, AnomalyKind::NoFlow);
    }

    #[test]
    fn test_within_variance_is_quiet() {
        let mut w = FlowWindow::open(valves(&[3]), t0(), 0, baseline(7200.0), settings());
        assert!(run(&mut w, 1, 200, 2).is_empty());
    }

    #[test]
    fn test_unexpected_flow_on_idle_window() {
        let mut idle = FlowWindow::open(valves(&[]), t0(), 0, None, settings());
        assert!(idle.set_pulse_values(10.0, 10, at(2)).is_empty());
        let anomalies = idle.set_pulse_values(10.0, 20, at(3));
        assert_eq!(anomalies.len(), 1);
        assert_eq!(anomalies[0].kind, AnomalyKind::UnexpectedFlow);
        assert!(idle.set_pulse_values(10.0, 30, at(4)).is_empty());

        let mut trickle = FlowWindow::open(valves(&[]), t0(), 0, None, settings());
        assert!(trickle.set_pulse_values(3.0, 3, at(10)).is_empty());
    }

    #[test]
    fn test_sentinel_rate_ignored() {
        let mut idle = FlowWindow::open(valves(&[]), t0(), 0, None, settings());
        assert!(idle.set_pulse_values(-1.0, 0, at(10)).is_empty());
        assert!(!idle.warnings().unexpected_flow);
    }

    #[test]
    fn test_log_entry_fields() {
        let mut w = FlowWindow::open(valves(&[0, 2]), t0(), 1000, None, settings());
        w.close(at(75), 1153);
        let entry = w.log_entry();
        assert_eq!(entry.valves, "0,2");
        assert_eq!(entry.stations, "S0,S2");
        assert_eq!(entry.usage, 15.3);
        assert_eq!(entry.measure, "gal");
        assert_eq!(entry.duration, "01:15");
        assert_eq!(entry.date, "2024-06-01");
        assert_eq!(entry.start, "06:00:00");
    }

    #[test]
    fn test_usage_uncalibrated() {
        assert_eq!(pulses_to_volume(500, 0.0), 0.0);
        assert_eq!(pulses_to_volume(155, 10.0), 15.5);
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(0), "00:00");
        assert_eq!(format_duration(61), "01:01");
        assert_eq!(format_duration(6000), "100:00");
    }
}
