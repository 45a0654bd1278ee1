//! User-facing flow settings.
//!
//! Settings are stored as a flat JSON object. Each field is validated on
//! its own when loaded: a missing, malformed or out-of-range value falls
//! back to that field's default and never fails the load.

use crate::config::ConfigError;
use crate::core::anomaly::{Channel, EventList};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::Path;

/// Variance used when a channel's variance is unset or invalid.
pub const DEFAULT_VARIANCE: f64 = 0.25;

/// Rate display precision used when unset or invalid.
pub const DEFAULT_RATE_DECIMALS: u32 = 1;

const MAX_RATE_DECIMALS: u32 = 3;

/// Flow settings as validated at load time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowSettings {
    /// Sensor pulses per unit of volume (0 = not calibrated)
    pub pulses_per_measure: f64,
    /// Volume unit label, e.g. "gal" or "L"
    pub volume_measure: String,
    /// Whether closed windows are written to the usage log
    pub enable_logging: bool,
    /// Usage log bound (0 = unbounded)
    pub max_log_entries: usize,
    pub email_events: EventList,
    pub sms_events: EventList,
    pub voice_events: EventList,
    pub email_variance: f64,
    pub sms_variance: f64,
    pub voice_variance: f64,
    /// Decimal places for rates in notifications
    pub rate_decimals: u32,
}

impl Default for FlowSettings {
    fn default() -> Self {
        Self {
            pulses_per_measure: 0.0,
            volume_measure: "?".to_string(),
            enable_logging: false,
            max_log_entries: 0,
            email_events: EventList::default(),
            sms_events: EventList::default(),
            voice_events: EventList::default(),
            email_variance: DEFAULT_VARIANCE,
            sms_variance: DEFAULT_VARIANCE,
            voice_variance: DEFAULT_VARIANCE,
            rate_decimals: DEFAULT_RATE_DECIMALS,
        }
    }
}

impl FlowSettings {
    /// Load settings from `path`, substituting defaults for anything unusable.
    pub fn load(path: &Path) -> Self {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) => {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!("Could not read flow settings {:?}: {}", path, e);
                }
                return Self::default();
            }
        };
        match serde_json::from_str::<Value>(&content) {
            Ok(Value::Object(map)) => Self::from_map(&map),
            Ok(_) | Err(_) => {
                tracing::warn!("Flow settings {:?} are not a JSON object, using defaults", path);
                Self::default()
            }
        }
    }

    /// Build settings from a JSON object, field by field.
    pub fn from_map(map: &Map<String, Value>) -> Self {
        let defaults = Self::default();
        Self {
            pulses_per_measure: number(map, "pulses_per_measure")
                .filter(|v| *v >= 0.0)
                .unwrap_or(defaults.pulses_per_measure),
            volume_measure: map
                .get("volume_measure")
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .unwrap_or(defaults.volume_measure),
            enable_logging: flag(map, "enable_logging").unwrap_or(defaults.enable_logging),
            max_log_entries: number(map, "max_log_entries")
                .filter(|v| *v >= 0.0 && v.fract() == 0.0)
                .map(|v| v as usize)
                .unwrap_or(defaults.max_log_entries),
            email_events: events(map, "email_events"),
            sms_events: events(map, "sms_events"),
            voice_events: events(map, "voice_events"),
            email_variance: variance(map, "email_variance"),
            sms_variance: variance(map, "sms_variance"),
            voice_variance: variance(map, "voice_variance"),
            rate_decimals: number(map, "rate_decimals")
                .filter(|v| *v >= 0.0 && v.fract() == 0.0 && *v <= f64::from(MAX_RATE_DECIMALS))
                .map(|v| v as u32)
                .unwrap_or(defaults.rate_decimals),
        }
    }

    /// Persist settings to `path`.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(self)?;
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, content)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    /// Fractional variance configured for `channel`.
    pub fn variance(&self, channel: Channel) -> f64 {
        match channel {
            Channel::Email => self.email_variance,
            Channel::Sms => self.sms_variance,
            Channel::Voice => self.voice_variance,
        }
    }

    /// Event codes `channel` should report.
    pub fn events(&self, channel: Channel) -> &EventList {
        match channel {
            Channel::Email => &self.email_events,
            Channel::Sms => &self.sms_events,
            Channel::Voice => &self.voice_events,
        }
    }

    /// Whether a volume calibration is configured.
    pub fn calibrated(&self) -> bool {
        self.pulses_per_measure > 0.0
    }
}

/// Numeric field given either as a JSON number or a numeric string.
fn number(map: &Map<String, Value>, key: &str) -> Option<f64> {
    let value = match map.get(key)? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }?;
    value.is_finite().then_some(value)
}

/// Boolean field; checkbox-style values ("on", "1") count as true.
fn flag(map: &Map<String, Value>, key: &str) -> Option<bool> {
    match map.get(key)? {
        Value::Bool(b) => Some(*b),
        Value::String(s) => Some(matches!(s.trim(), "on" | "true" | "1" | "yes")),
        Value::Number(n) => Some(n.as_f64().unwrap_or(0.0) != 0.0),
        _ => None,
    }
}

fn events(map: &Map<String, Value>, key: &str) -> EventList {
    match map.get(key) {
        Some(Value::String(s)) => EventList::parse(s),
        Some(Value::Array(items)) => {
            let joined: Vec<String> = items
                .iter()
                .filter_map(|v| match v {
                    Value::String(s) => Some(s.clone()),
                    Value::Number(n) => Some(n.to_string()),
                    _ => None,
                })
                .collect();
            EventList::parse(&joined.join(","))
        }
        _ => EventList::default(),
    }
}

fn variance(map: &Map<String, Value>, key: &str) -> f64 {
    number(map, key)
        .filter(|v| *v > 0.0)
        .unwrap_or(DEFAULT_VARIANCE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::anomaly::AnomalyKind;
    use serde_json::json;

    fn settings(value: Value) -> FlowSettings {
        match value {
            Value::Object(map) => FlowSettings::from_map(&map),
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_valid_fields() {
        let s = settings(json!({
            "pulses_per_measure": "10.5",
            "volume_measure": "gal",
            "enable_logging": "on",
            "max_log_entries": 50,
            "email_events": "3, 1",
            "sms_variance": 0.4,
        }));
        assert_eq!(s.pulses_per_measure, 10.5);
        assert_eq!(s.volume_measure, "gal");
        assert!(s.enable_logging);
        assert_eq!(s.max_log_entries, 50);
        assert!(s.email_events.contains(AnomalyKind::RateLow));
        assert_eq!(s.email_events.to_string(), "1,3");
        assert_eq!(s.variance(Channel::Sms), 0.4);
        assert_eq!(s.variance(Channel::Voice), DEFAULT_VARIANCE);
    }

    #[test]
    fn test_invalid_fields_fall_back() {
        let s = settings(json!({
            "pulses_per_measure": "ten",
            "volume_measure": "   ",
            "max_log_entries": -3,
            "email_variance": -1,
            "voice_variance": "x",
            "rate_decimals": 9,
        }));
        assert_eq!(s, FlowSettings::default());
        assert!(!s.calibrated());
    }

    #[test]
    fn test_missing_and_corrupt_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("flow.json");
        assert_eq!(FlowSettings::load(&path), FlowSettings::default());

        std::fs::write(&path, "{not json").unwrap();
        assert_eq!(FlowSettings::load(&path), FlowSettings::default());
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data").join("flow.json");
        let mut s = FlowSettings::default();
        s.pulses_per_measure = 10.0;
        s.enable_logging = true;
        s.voice_events = EventList::parse("2");
        s.save(&path).unwrap();

        let loaded = FlowSettings::load(&path);
        assert_eq!(loaded, s);
    }
}
