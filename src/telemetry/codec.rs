//! INFO payload parsing.
//!
//! The sensor firmware has shipped several payload shapes over time. Parsing
//! is a structured JSON parse followed by tolerant lookups covering all of
//! them; it never fails. Anything that cannot be found is `None`.
//!
//! Known shapes:
//! - `{"present":true,"user":"Alice","place":"kitchen","battery_pct":80,"battery_state":"ok"}`
//! - `{"presence":{"present":true}, "battery":{"pct":30,"state":"charging"}}`
//! - `{"presence":{"state":"sitting"}, "battery":{"percent":30}}`
//! - `{"battery":{"soc_pct":30}}`

use serde_json::{json, Map, Value};

/// User shown when the payload names nobody.
pub const DEFAULT_USER: &str = "Someone";
/// Place shown when the payload names none.
pub const DEFAULT_PLACE: &str = "near your SensePi";

/// Structured facts extracted from one INFO payload.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TelemetryFact {
    /// Whether somebody is present.
    pub present: bool,
    /// Who is present, as reported.
    pub user: Option<String>,
    /// Where, as reported.
    pub place: Option<String>,
    /// Battery charge, clamped to 0..=100.
    pub battery_percent: Option<u8>,
    /// Opaque battery state label (e.g. "charging").
    pub battery_state: Option<String>,
}

impl TelemetryFact {
    /// A fact saying nobody is present and nothing else is known.
    pub fn absent() -> Self {
        Self::default()
    }

    /// Reported user, or [`DEFAULT_USER`].
    pub fn display_user(&self) -> &str {
        self.user.as_deref().unwrap_or(DEFAULT_USER)
    }

    /// Reported place, or [`DEFAULT_PLACE`].
    pub fn display_place(&self) -> &str {
        self.place.as_deref().unwrap_or(DEFAULT_PLACE)
    }

    /// Presence-only JSON mirror handed to the UI.
    pub fn presence_json(&self) -> String {
        if self.present {
            json!({
                "present": true,
                "user": self.display_user(),
                "place": self.display_place(),
            })
            .to_string()
        } else {
            json!({ "present": false }).to_string()
        }
    }
}

/// Decode raw characteristic bytes into text. Invalid UTF-8 becomes `"{}"`.
pub fn decode_text(payload: &[u8]) -> String {
    match std::str::from_utf8(payload) {
        Ok(text) => text.to_string(),
        Err(_) => "{}".to_string(),
    }
}

/// Parse an INFO payload.
pub fn parse(payload: &[u8]) -> TelemetryFact {
    parse_str(&decode_text(payload))
}

/// Parse an INFO payload that is already text.
pub fn parse_str(text: &str) -> TelemetryFact {
    let root = match serde_json::from_str::<Value>(text) {
        Ok(Value::Object(map)) => map,
        _ => Map::new(),
    };

    let presence = root.get("presence").and_then(Value::as_object);
    let battery = root.get("battery").and_then(Value::as_object);

    let present = parse_present(&root, presence);

    let user = string_field(&root, "user")
        .or_else(|| presence.and_then(|p| string_field(p, "user")));
    let place = string_field(&root, "place")
        .or_else(|| presence.and_then(|p| string_field(p, "place")));

    let battery_percent = percent_field(&root, "battery_pct").or_else(|| {
        battery.and_then(|b| {
            ["pct", "percent", "soc_pct"]
                .iter()
                .find_map(|key| percent_field(b, key))
        })
    });

    let battery_state = string_field(&root, "battery_state")
        .or_else(|| battery.and_then(|b| string_field(b, "state")));

    TelemetryFact {
        present,
        user,
        place,
        battery_percent,
        battery_state,
    }
}

fn parse_present(root: &Map<String, Value>, presence: Option<&Map<String, Value>>) -> bool {
    if root.get("present").and_then(Value::as_bool) == Some(true) {
        return true;
    }

    let Some(presence) = presence else {
        return false;
    };

    if presence.get("present").and_then(Value::as_bool) == Some(true) {
        return true;
    }

    match presence.get("state").and_then(Value::as_str) {
        Some(state) => state_means_present(state),
        None => false,
    }
}

/// Legacy presence heuristics on a free-form state label.
fn state_means_present(state: &str) -> bool {
    let state = state.trim().to_lowercase();
    state.contains("sit")
        || state.contains("occup")
        || state.contains("present")
        || state == "1"
        || state == "true"
}

fn string_field(map: &Map<String, Value>, key: &str) -> Option<String> {
    map.get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn percent_field(map: &Map<String, Value>, key: &str) -> Option<u8> {
    let value = map.get(key)?;
    let number = value
        .as_i64()
        // Fractions are cut, not rounded: 30.6 still reads as 30.
        .or_else(|| value.as_f64().map(|f| f.trunc() as i64))?;
    Some(number.clamp(0, 100) as u8)
}
