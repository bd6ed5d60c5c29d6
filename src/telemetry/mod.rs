//! Telemetry ingestion.
//!
//! Turns INFO payloads into persisted state and deduplicated alerts.

pub mod codec;
pub mod dedup;

pub use codec::{parse, TelemetryFact};
pub use dedup::{BatteryAlert, BatteryBucket, Decision, DedupNotifier};

use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::alerts::AlertSink;
use crate::store::StateStore;

/// Payload persisted when the link is lost and presence becomes unknown.
pub const ABSENT_PAYLOAD: &str = r#"{"present":false,"user":null,"since":0}"#;

/// Persistence, dedup and alerting for one payload at a time.
pub struct TelemetryPipeline {
    dedup: DedupNotifier,
    store: Arc<dyn StateStore>,
    alerts: Arc<dyn AlertSink>,
}

impl TelemetryPipeline {
    /// Create a pipeline writing to `store` and alerting through `alerts`.
    pub fn new(store: Arc<dyn StateStore>, alerts: Arc<dyn AlertSink>) -> Self {
        Self {
            dedup: DedupNotifier::new(),
            store,
            alerts,
        }
    }

    /// Current dedup state.
    pub fn dedup(&self) -> &DedupNotifier {
        &self.dedup
    }

    /// Forget the presence signature (fresh link or link loss).
    pub fn clear_presence(&mut self) {
        self.dedup.clear_presence();
    }

    /// Ingest one raw INFO payload.
    pub fn ingest(&mut self, payload: &[u8]) -> TelemetryFact {
        let text = codec::decode_text(payload);
        let now = Utc::now();

        // Full payload first so the UI sees it even if nothing parses.
        if let Err(e) = self.store.put_info_json(&text, now) {
            warn!("Failed to persist INFO payload: {}", e);
        }

        let fact = codec::parse_str(&text);
        debug!("Telemetry: {:?}", fact);

        if let Err(e) = self
            .store
            .put_presence(&fact.presence_json(), fact.present, now)
        {
            warn!("Failed to persist presence: {}", e);
        }

        let decision = self.dedup.observe(&fact);

        if let Some(percent) = fact.battery_percent {
            if let Err(e) = self.store.put_battery_pct(percent) {
                warn!("Failed to persist battery percent: {}", e);
            }
        }

        if let Some(message) = decision.presence_alert {
            self.alerts.presence_alert(&message);
        }

        if let Some(battery) = decision.battery_alert {
            self.alerts
                .battery_alert(battery.percent, &battery.state, battery.critical);
        }

        fact
    }

    /// Record that the link is gone: presence is now unknown.
    pub fn link_lost(&mut self) -> TelemetryFact {
        self.dedup.clear_presence();
        self.ingest(ABSENT_PAYLOAD.as_bytes())
    }
}
