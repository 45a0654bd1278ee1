//! Routing of anomalies to notification channels.

use crate::core::anomaly::{Anomaly, AnomalyKind, Channel};
use crate::notify::{Notification, Notifier};
use crate::settings::FlowSettings;
use crate::store::export::rate_unit;
use std::collections::BTreeMap;
use std::sync::RwLock;

/// Sends anomalies to the registered notifiers.
///
/// An anomaly restricted to a channel (the rate checks, whose variance is
/// per channel) goes only there; any other anomaly goes to every channel.
/// In both cases a channel only fires when its event list contains the
/// anomaly's code and a notifier has checked in for it.
#[derive(Default)]
pub struct NotificationGate {
    notifiers: RwLock<BTreeMap<Channel, Box<dyn Notifier>>>,
}

impl NotificationGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the notifier for `channel`.
    pub fn register(&self, channel: Channel, notifier: Box<dyn Notifier>) {
        tracing::info!("Flow alerts for {} go to {}", channel, notifier.name());
        if let Ok(mut notifiers) = self.notifiers.write() {
            notifiers.insert(channel, notifier);
        }
    }

    /// Channels with a notifier, with the notifier's name.
    pub fn online(&self) -> Vec<(Channel, String)> {
        self.notifiers
            .read()
            .map(|n| n.iter().map(|(c, n)| (*c, n.name().to_string())).collect())
            .unwrap_or_default()
    }

    /// Deliver `anomalies`, returning the notifications that were sent.
    pub fn dispatch(&self, anomalies: &[Anomaly], settings: &FlowSettings) -> Vec<Notification> {
        let mut sent = Vec::new();
        if anomalies.is_empty() {
            return sent;
        }
        let Ok(notifiers) = self.notifiers.read() else {
            return sent;
        };

        for anomaly in anomalies {
            tracing::info!(
                code = anomaly.kind.code(),
                stations = %anomaly.stations.join(", "),
                "Flow anomaly detected: {:?}",
                anomaly.kind
            );
            let channels: Vec<Channel> = match anomaly.channel {
                Some(channel) => vec![channel],
                None => Channel::ALL.to_vec(),
            };
            for channel in channels {
                if !settings.events(channel).contains(anomaly.kind) {
                    continue;
                }
                let Some(notifier) = notifiers.get(&channel) else {
                    continue;
                };
                let notification = compose(anomaly, channel, settings);
                match notifier.send(&notification) {
                    Ok(()) => sent.push(notification),
                    Err(e) => tracing::warn!("Could not send {} flow alert: {}", channel, e),
                }
            }
        }
        sent
    }
}

/// Compose the text of `anomaly` for `channel`.
pub fn compose(anomaly: &Anomaly, channel: Channel, settings: &FlowSettings) -> Notification {
    let unit = rate_unit(settings);
    let rate = |pulses_per_hour: f64| {
        let value = if settings.calibrated() {
            pulses_per_hour / settings.pulses_per_measure
        } else {
            pulses_per_hour
        };
        format!("{:.*} {}", settings.rate_decimals as usize, value, unit)
    };
    let stations = if anomaly.single_station() {
        format!("station {}", anomaly.stations.join(", "))
    } else {
        format!("stations {}", anomaly.stations.join(", "))
    };
    let when = anomaly.detected_at.format("%Y-%m-%d %H:%M:%S");

    let (subject, message) = match anomaly.kind {
        AnomalyKind::NoFlow => (
            "SIP flow alert: no flow detected".to_string(),
            format!("No water flow detected through {stations} at {when}."),
        ),
        AnomalyKind::UnexpectedFlow => (
            "SIP flow alert: unexpected flow".to_string(),
            format!(
                "Water is flowing at {} with all valves closed ({when}).",
                rate(anomaly.measured_rate)
            ),
        ),
        AnomalyKind::RateHigh | AnomalyKind::RateLow => {
            let direction = if anomaly.kind == AnomalyKind::RateHigh {
                "higher"
            } else {
                "lower"
            };
            let (lead, possessive) = if anomaly.single_station() {
                ("Flow rate for", "its")
            } else {
                ("Combined flow rate for", "their")
            };
            let (baseline, recorded) = anomaly
                .baseline
                .map(|b| (rate(b.rate), b.recorded.format("%Y-%m-%d %H:%M:%S").to_string()))
                .unwrap_or_else(|| ("unknown".to_string(), "never".to_string()));
            let pct = anomaly.deviation_pct().unwrap_or(0.0).abs();
            (
                format!("SIP flow alert: flow rate {direction} than expected"),
                format!(
                    "{lead} {stations} is {}, {pct:.0}% {direction} than {possessive} \
                     recorded rate of {baseline} (recorded {recorded}). Measured at {when}.",
                    rate(anomaly.measured_rate)
                ),
            )
        }
    };

    Notification {
        channel,
        kind: anomaly.kind,
        subject: (channel == Channel::Email).then_some(subject),
        message,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::anomaly::{Baseline, EventList};
    use crate::notify::ChannelNotifier;
    use chrono::NaiveDate;

    fn settings() -> FlowSettings {
        FlowSettings {
            pulses_per_measure: 10.0,
            volume_measure: "gal".into(),
            email_events: EventList::parse("1,3"),
            sms_events: EventList::parse("1"),
            ..FlowSettings::default()
        }
    }

    fn anomaly(kind: AnomalyKind, channel: Option<Channel>, stations: &[&str]) -> Anomaly {
        let at = NaiveDate::from_ymd_opt(2024, 6, 1)
            .unwrap()
            .and_hms_opt(6, 1, 0)
            .unwrap();
        Anomaly {
            kind,
            channel,
            stations: stations.iter().map(|s| s.to_string()).collect(),
            measured_rate: 160.0,
            baseline: Some(Baseline {
                rate: 100.0,
                recorded: at - chrono::Duration::days(2),
            }),
            detected_at: at,
        }
    }

    #[test]
    fn test_routes_by_event_list() {
        let gate = NotificationGate::new();
        let (tx, rx) = crossbeam_channel::unbounded();
        gate.register(Channel::Email, Box::new(ChannelNotifier::new("email", tx.clone())));
        gate.register(Channel::Sms, Box::new(ChannelNotifier::new("sms", tx)));

        let sent = gate.dispatch(&[anomaly(AnomalyKind::NoFlow, None, &["Back"])], &settings());
        assert_eq!(sent.len(), 2);
        assert_eq!(rx.try_iter().count(), 2);

        let sent = gate.dispatch(
            &[anomaly(AnomalyKind::RateHigh, Some(Channel::Sms), &["Back"])],
            &settings(),
        );
        assert!(sent.is_empty());

        let sent = gate.dispatch(
            &[anomaly(AnomalyKind::RateHigh, Some(Channel::Email), &["Back"])],
            &settings(),
        );
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].channel, Channel::Email);
    }

    #[test]
    fn test_unregistered_channel_is_skipped() {
        let gate = NotificationGate::new();
        let mut s = settings();
        s.voice_events = EventList::parse("1");
        assert!(gate
            .dispatch(&[anomaly(AnomalyKind::NoFlow, None, &["Back"])], &s)
            .is_empty());
        assert!(gate.online().is_empty());
    }

    #[test]
    fn test_rate_high_text() {
        let n = compose(
            &anomaly(AnomalyKind::RateHigh, Some(Channel::Email), &["Back"]),
            Channel::Email,
            &settings(),
        );
        assert!(n.subject.unwrap().contains("higher"));
        assert!(n.message.contains("Flow rate for station Back is 16.0 gal/hr"));
        assert!(n.message.contains("60% higher than its recorded rate of 10.0 gal/hr"));
        assert!(n.message.contains("recorded 2024-05-30 06:01:00"));
    }

    #[test]
    fn test_plural_text_and_sms_has_no_subject() {
        let mut low = anomaly(AnomalyKind::RateLow, Some(Channel::Sms), &["Front", "Back"]);
        low.measured_rate = 40.0;
        let n = compose(&low, Channel::Sms, &settings());
        assert!(n.subject.is_none());
        assert!(n.message.starts_with("Combined flow rate for stations Front, Back"));
        assert!(n.message.contains("60% lower than their recorded rate"));
    }
}
