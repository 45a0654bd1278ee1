//! Anomaly notifications.
//!
//! The engine never talks to a mail server or SMS provider itself.
//! Delivery plugins register a [`Notifier`] per channel with the
//! [`NotificationGate`], which decides which channels an anomaly goes to
//! and composes the text.

pub mod gate;

pub use gate::{compose, NotificationGate};

use crate::core::anomaly::{AnomalyKind, Channel};
use crossbeam_channel::Sender;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A message ready for one channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub channel: Channel,
    pub kind: AnomalyKind,
    /// Subject line (email only)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    pub message: String,
}

/// Errors reported by notification delivery.
#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("notifier for {0} is disconnected")]
    Disconnected(Channel),
}

/// Delivery plugin for one channel.
pub trait Notifier: Send + Sync {
    /// Name shown in status output.
    fn name(&self) -> &str;

    fn send(&self, notification: &Notification) -> Result<(), NotifyError>;
}

/// Notifier that writes notifications to the log.
#[derive(Debug, Clone)]
pub struct TracingNotifier {
    name: String,
}

impl TracingNotifier {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl Notifier for TracingNotifier {
    fn name(&self) -> &str {
        &self.name
    }

    fn send(&self, notification: &Notification) -> Result<(), NotifyError> {
        tracing::warn!(
            channel = %notification.channel,
            code = notification.kind.code(),
            "{}{}",
            notification
                .subject
                .as_deref()
                .map(|s| format!("{s}: "))
                .unwrap_or_default(),
            notification.message
        );
        Ok(())
    }
}

/// Notifier forwarding notifications over a channel to another thread.
#[derive(Debug, Clone)]
pub struct ChannelNotifier {
    name: String,
    sender: Sender<Notification>,
}

impl ChannelNotifier {
    pub fn new(name: impl Into<String>, sender: Sender<Notification>) -> Self {
        Self {
            name: name.into(),
            sender,
        }
    }
}

impl Notifier for ChannelNotifier {
    fn name(&self) -> &str {
        &self.name
    }

    fn send(&self, notification: &Notification) -> Result<(), NotifyError> {
        self.sender
            .send(notification.clone())
            .map_err(|_| NotifyError::Disconnected(notification.channel))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::unbounded;

    fn notification() -> Notification {
        Notification {
            channel: Channel::Sms,
            kind: AnomalyKind::NoFlow,
            subject: None,
            message: "No flow on Front".into(),
        }
    }

    #[test]
    fn test_channel_notifier_forwards() {
        let (tx, rx) = unbounded();
        let notifier = ChannelNotifier::new("sms queue", tx);
        notifier.send(&notification()).unwrap();
        assert_eq!(rx.try_recv().unwrap().message, "No flow on Front");
        assert_eq!(notifier.name(), "sms queue");
    }

    #[test]
    fn test_channel_notifier_reports_dropped_receiver() {
        let (tx, rx) = unbounded();
        drop(rx);
        let notifier = ChannelNotifier::new("sms queue", tx);
        let err = notifier.send(&notification()).unwrap_err();
        assert!(matches!(err, NotifyError::Disconnected(Channel::Sms)));
        assert_eq!(err.to_string(), "notifier for sms is disconnected");
    }
}
