//! User-visible alert surface.
//!
//! The sink performs no deduplication; every call is already deduplicated
//! by [`DedupNotifier`](crate::telemetry::DedupNotifier).

use tokio::sync::broadcast;
use tracing::info;

/// A user-visible notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Alert {
    /// Somebody was detected.
    Presence {
        /// Text such as "Bob detected near your SensePi".
        message: String,
    },
    /// Battery entered or moved within a low band.
    Battery {
        /// Charge in percent.
        percent: u8,
        /// State label, empty if unknown.
        state: String,
        /// Whether the charge is critical.
        critical: bool,
    },
    /// Ambient link status line ("Connecting to …", "Connected").
    Status {
        /// Whether a link is up.
        connected: bool,
        /// Status text.
        text: String,
    },
}

impl Alert {
    /// Notification title.
    pub fn title(&self) -> &'static str {
        match self {
            Self::Presence { .. } => "Sense presence",
            Self::Battery { critical: true, .. } => "Sense battery critical",
            Self::Battery { critical: false, .. } => "Sense battery low",
            Self::Status {
                connected: true, ..
            } => "Sense connected",
            Self::Status {
                connected: false, ..
            } => "Sense connecting…",
        }
    }

    /// Notification body.
    pub fn body(&self) -> String {
        match self {
            Self::Presence { message } => message.clone(),
            Self::Battery { percent, state, .. } => format!("{}% ({})", percent, state),
            Self::Status { text, .. } => text.clone(),
        }
    }
}

/// Presentation surface for alerts. Calls are fire-and-forget.
#[cfg_attr(test, mockall::automock)]
pub trait AlertSink: Send + Sync {
    /// Present a presence alert.
    fn presence_alert(&self, message: &str);

    /// Present a battery alert.
    fn battery_alert(&self, percent: u8, state: &str, critical: bool);

    /// Update the ambient connection status line.
    fn status_changed(&self, _connected: bool, _text: &str) {}
}

/// Sink that only logs.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAlertSink;

impl AlertSink for TracingAlertSink {
    fn presence_alert(&self, message: &str) {
        info!("[presence] {}", message);
    }

    fn battery_alert(&self, percent: u8, state: &str, critical: bool) {
        let alert = Alert::Battery {
            percent,
            state: state.to_string(),
            critical,
        };
        info!("[battery] {}: {}", alert.title(), alert.body());
    }

    fn status_changed(&self, connected: bool, text: &str) {
        info!("[status] connected={} {}", connected, text);
    }
}

/// Sink that fans alerts out to any number of subscribers.
#[derive(Debug, Clone)]
pub struct BroadcastAlertSink {
    tx: broadcast::Sender<Alert>,
}

impl BroadcastAlertSink {
    /// Create a sink buffering up to `capacity` alerts per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Subscribe to alerts.
    pub fn subscribe(&self) -> broadcast::Receiver<Alert> {
        self.tx.subscribe()
    }

    fn emit(&self, alert: Alert) {
        // No subscribers is fine.
        let _ = self.tx.send(alert);
    }
}

impl Default for BroadcastAlertSink {
    fn default() -> Self {
        Self::new(32)
    }
}

impl AlertSink for BroadcastAlertSink {
    fn presence_alert(&self, message: &str) {
        self.emit(Alert::Presence {
            message: message.to_string(),
        });
    }

    fn battery_alert(&self, percent: u8, state: &str, critical: bool) {
        self.emit(Alert::Battery {
            percent,
            state: state.to_string(),
            critical,
        });
    }

    fn status_changed(&self, connected: bool, text: &str) {
        self.emit(Alert::Status {
            connected,
            text: text.to_string(),
        });
    }
}
