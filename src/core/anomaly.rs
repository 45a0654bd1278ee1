//! Anomaly conditions raised by a flow window.

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

/// Notification channel an anomaly can be routed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Email,
    Sms,
    Voice,
}

impl Channel {
    pub const ALL: [Channel; 3] = [Channel::Email, Channel::Sms, Channel::Voice];

    fn slot(self) -> usize {
        match self {
            Channel::Email => 0,
            Channel::Sms => 1,
            Channel::Voice => 2,
        }
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Channel::Email => write!(f, "email"),
            Channel::Sms => write!(f, "sms"),
            Channel::Voice => write!(f, "voice"),
        }
    }
}

/// The four conditions the engine watches for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyKind {
    /// A valve is open but a full sub-window measured no flow
    NoFlow,
    /// Water is flowing with every valve closed
    UnexpectedFlow,
    /// Measured rate is above the baseline by more than the channel variance
    RateHigh,
    /// Measured rate is below the baseline by more than the channel variance
    RateLow,
}

impl AnomalyKind {
    /// Event code used in the per-channel event lists.
    pub fn code(self) -> &'static str {
        match self {
            AnomalyKind::NoFlow => "1",
            AnomalyKind::UnexpectedFlow => "2",
            AnomalyKind::RateHigh => "3a",
            AnomalyKind::RateLow => "3b",
        }
    }
}

/// Comma separated list of event codes a channel should report.
///
/// `3` selects both rate codes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventList(Vec<String>);

impl EventList {
    /// Parse and normalise: whitespace removed, empties dropped, sorted, unique.
    pub fn parse(raw: &str) -> Self {
        let mut codes: Vec<String> = raw
            .replace(' ', "")
            .split(',')
            .filter(|c| !c.is_empty())
            .map(|c| c.to_lowercase())
            .collect();
        codes.sort();
        codes.dedup();
        Self(codes)
    }

    /// Whether anomalies of `kind` should be sent.
    pub fn contains(&self, kind: AnomalyKind) -> bool {
        let code = kind.code();
        self.0.iter().any(|c| {
            c == code
                || (c == "3" && matches!(kind, AnomalyKind::RateHigh | AnomalyKind::RateLow))
        })
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn codes(&self) -> &[String] {
        &self.0
    }
}

impl std::fmt::Display for EventList {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.join(","))
    }
}

/// One boolean per channel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChannelFlags([bool; 3]);

impl ChannelFlags {
    pub fn get(&self, channel: Channel) -> bool {
        self.0[channel.slot()]
    }

    pub fn set(&mut self, channel: Channel) {
        self.0[channel.slot()] = true;
    }
}

/// Historical rate a measurement is compared against.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Baseline {
    /// Pulses per hour
    pub rate: f64,
    /// When the (oldest contributing) rate was recorded
    pub recorded: NaiveDateTime,
}

/// A detected anomaly, before channel routing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Anomaly {
    pub kind: AnomalyKind,
    /// Channel this anomaly is restricted to; `None` means every channel
    pub channel: Option<Channel>,
    /// Names of the open stations
    pub stations: Vec<String>,
    /// Measured rate in pulses per hour
    pub measured_rate: f64,
    pub baseline: Option<Baseline>,
    pub detected_at: NaiveDateTime,
}

impl Anomaly {
    /// Measured rate relative to the baseline, as a signed percentage.
    pub fn deviation_pct(&self) -> Option<f64> {
        self.baseline
            .filter(|b| b.rate > 0.0)
            .map(|b| (self.measured_rate / b.rate - 1.0) * 100.0)
    }

    /// Whether exactly one station is involved.
    pub fn single_station(&self) -> bool {
        self.stations.len() == 1
    }
}
