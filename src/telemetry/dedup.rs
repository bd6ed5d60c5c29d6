//! Alert deduplication.
//!
//! Presence alerts fire once per distinct `user@place` appearance. Battery
//! alerts fire when the charge enters the LOW or CRITICAL band, and again
//! inside those bands whenever the band or the state label changes.

use std::fmt;

use crate::telemetry::codec::TelemetryFact;

/// Coarse battery band used to throttle alerts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum BatteryBucket {
    /// 0..=10 %.
    Critical,
    /// 11..=30 %.
    Low,
    /// 31..=50 %.
    Medium,
    /// 51..=80 %.
    High,
    /// 81..=100 %.
    Full,
}

impl BatteryBucket {
    /// Band containing `percent`.
    pub fn from_percent(percent: u8) -> Self {
        match percent {
            0..=10 => Self::Critical,
            11..=30 => Self::Low,
            31..=50 => Self::Medium,
            51..=80 => Self::High,
            _ => Self::Full,
        }
    }

    /// Whether entering this band warrants an alert.
    pub fn is_alerting(&self) -> bool {
        matches!(self, Self::Critical | Self::Low)
    }
}

impl fmt::Display for BatteryBucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Critical => write!(f, "CRITICAL"),
            Self::Low => write!(f, "LOW"),
            Self::Medium => write!(f, "MED"),
            Self::High => write!(f, "HIGH"),
            Self::Full => write!(f, "FULL"),
        }
    }
}

/// A battery alert to present.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatteryAlert {
    /// Charge in percent.
    pub percent: u8,
    /// State label, empty if unknown.
    pub state: String,
    /// Whether the charge is in the critical band.
    pub critical: bool,
}

/// Alerts produced by one observed fact.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Decision {
    /// Presence alert message, if one should fire.
    pub presence_alert: Option<String>,
    /// Battery alert, if one should fire.
    pub battery_alert: Option<BatteryAlert>,
}

/// Dedup state carried across payloads and reconnects.
#[derive(Debug, Clone, Default)]
pub struct DedupNotifier {
    presence_signature: Option<String>,
    battery_bucket: Option<BatteryBucket>,
    battery_state: Option<String>,
}

impl DedupNotifier {
    /// Create a notifier with no history.
    pub fn new() -> Self {
        Self::default()
    }

    /// Forget the presence signature so the next appearance alerts again.
    pub fn clear_presence(&mut self) {
        self.presence_signature = None;
    }

    /// The stored presence signature.
    pub fn presence_signature(&self) -> Option<&str> {
        self.presence_signature.as_deref()
    }

    /// The stored battery band.
    pub fn battery_bucket(&self) -> Option<BatteryBucket> {
        self.battery_bucket
    }

    /// Fold a fact into the dedup state and decide which alerts fire.
    pub fn observe(&mut self, fact: &TelemetryFact) -> Decision {
        Decision {
            presence_alert: self.observe_presence(fact),
            battery_alert: self.observe_battery(fact),
        }
    }

    fn observe_presence(&mut self, fact: &TelemetryFact) -> Option<String> {
        if !fact.present {
            self.presence_signature = None;
            return None;
        }

        let signature = format!("{}@{}", fact.display_user(), fact.display_place());
        if self.presence_signature.as_deref() == Some(signature.as_str()) {
            return None;
        }

        self.presence_signature = Some(signature);
        Some(format!(
            "{} detected {}",
            fact.display_user(),
            fact.display_place()
        ))
    }

    fn observe_battery(&mut self, fact: &TelemetryFact) -> Option<BatteryAlert> {
        let percent = fact.battery_percent?;
        let bucket = BatteryBucket::from_percent(percent);

        // An unknown label leaves the stored one untouched.
        let state = fact
            .battery_state
            .clone()
            .or_else(|| self.battery_state.clone());

        if self.battery_bucket == Some(bucket) && self.battery_state == state {
            return None;
        }

        self.battery_bucket = Some(bucket);
        self.battery_state = state.clone();

        bucket.is_alerting().then(|| BatteryAlert {
            percent,
            state: state.unwrap_or_default(),
            critical: bucket == BatteryBucket::Critical,
        })
    }
}
