//! Persisted state handed to the companion UI.
//!
//! The connection manager only writes here, apart from reading the last
//! device id once at startup. Key names match what the UI layer reads.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Everything the UI can read back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistedSnapshot {
    /// Address of the last sensor a link was established with.
    pub last_device_id: Option<String>,
    /// Latest full INFO payload.
    pub info_json: String,
    /// Presence-only mirror of the latest payload.
    pub presence_json: String,
    /// Presence boolean mirror.
    pub presence_present: bool,
    /// Latest battery percent, -1 when never seen.
    pub battery_pct_cached: i32,
    /// Milliseconds since the epoch of the last telemetry write.
    pub presence_mtime: i64,
}

impl Default for PersistedSnapshot {
    fn default() -> Self {
        Self {
            last_device_id: None,
            info_json: "{}".to_string(),
            presence_json: r#"{"present":false}"#.to_string(),
            presence_present: false,
            battery_pct_cached: -1,
            presence_mtime: 0,
        }
    }
}

/// Durable key-value store shared with the UI layer.
#[cfg_attr(test, mockall::automock)]
pub trait StateStore: Send + Sync {
    /// Last device id, if one was ever stored.
    fn last_device_id(&self) -> Option<String>;

    /// Remember `id` as the sensor to resume with.
    fn set_last_device_id(&self, id: &str) -> Result<()>;

    /// Store the full INFO payload.
    fn put_info_json(&self, json: &str, updated_at: DateTime<Utc>) -> Result<()>;

    /// Store the presence mirror JSON and boolean.
    fn put_presence(&self, json: &str, present: bool, updated_at: DateTime<Utc>) -> Result<()>;

    /// Store the latest battery percent.
    fn put_battery_pct(&self, percent: u8) -> Result<()>;

    /// Copy of everything stored.
    fn snapshot(&self) -> PersistedSnapshot;
}

fn apply_info(snapshot: &mut PersistedSnapshot, json: &str, updated_at: DateTime<Utc>) {
    snapshot.info_json = json.to_string();
    snapshot.presence_mtime = updated_at.timestamp_millis();
}

fn apply_presence(
    snapshot: &mut PersistedSnapshot,
    json: &str,
    present: bool,
    updated_at: DateTime<Utc>,
) {
    snapshot.presence_json = json.to_string();
    snapshot.presence_present = present;
    snapshot.presence_mtime = updated_at.timestamp_millis();
}

/// In-memory store. Nothing survives the process.
#[derive(Debug, Default)]
pub struct MemoryStore {
    snapshot: RwLock<PersistedSnapshot>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store that already knows a device.
    pub fn with_last_device_id(id: impl Into<String>) -> Self {
        let store = Self::default();
        store.snapshot.write().last_device_id = Some(id.into());
        store
    }
}

impl StateStore for MemoryStore {
    fn last_device_id(&self) -> Option<String> {
        self.snapshot.read().last_device_id.clone()
    }

    fn set_last_device_id(&self, id: &str) -> Result<()> {
        self.snapshot.write().last_device_id = Some(id.to_string());
        Ok(())
    }

    fn put_info_json(&self, json: &str, updated_at: DateTime<Utc>) -> Result<()> {
        apply_info(&mut self.snapshot.write(), json, updated_at);
        Ok(())
    }

    fn put_presence(&self, json: &str, present: bool, updated_at: DateTime<Utc>) -> Result<()> {
        apply_presence(&mut self.snapshot.write(), json, present, updated_at);
        Ok(())
    }

    fn put_battery_pct(&self, percent: u8) -> Result<()> {
        self.snapshot.write().battery_pct_cached = i32::from(percent);
        Ok(())
    }

    fn snapshot(&self) -> PersistedSnapshot {
        self.snapshot.read().clone()
    }
}

/// Store backed by a single JSON file, rewritten on every change.
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    snapshot: RwLock<PersistedSnapshot>,
}

impl JsonFileStore {
    /// Open the store at `path`. A missing file starts empty; an unreadable
    /// one is logged and replaced on the next write.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let snapshot = match std::fs::read_to_string(&path) {
            Ok(contents) => serde_json::from_str(&contents).unwrap_or_else(|e| {
                warn!("Ignoring unreadable state file {}: {}", path.display(), e);
                PersistedSnapshot::default()
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No state file at {}, starting empty", path.display());
                PersistedSnapshot::default()
            }
            Err(e) => return Err(Error::Io(e)),
        };

        Ok(Self {
            path,
            snapshot: RwLock::new(snapshot),
        })
    }

    /// Location of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn update(&self, f: impl FnOnce(&mut PersistedSnapshot)) -> Result<()> {
        let mut snapshot = self.snapshot.write();
        f(&mut snapshot);

        let contents = serde_json::to_string_pretty(&*snapshot)?;
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, contents).map_err(|e| Error::Storage {
            reason: format!("writing {}: {}", tmp.display(), e),
        })?;
        std::fs::rename(&tmp, &self.path).map_err(|e| Error::Storage {
            reason: format!("replacing {}: {}", self.path.display(), e),
        })
    }
}

impl StateStore for JsonFileStore {
    fn last_device_id(&self) -> Option<String> {
        self.snapshot.read().last_device_id.clone()
    }

    fn set_last_device_id(&self, id: &str) -> Result<()> {
        self.update(|s| s.last_device_id = Some(id.to_string()))
    }

    fn put_info_json(&self, json: &str, updated_at: DateTime<Utc>) -> Result<()> {
        self.update(|s| apply_info(s, json, updated_at))
    }

    fn put_presence(&self, json: &str, present: bool, updated_at: DateTime<Utc>) -> Result<()> {
        self.update(|s| apply_presence(s, json, present, updated_at))
    }

    fn put_battery_pct(&self, percent: u8) -> Result<()> {
        self.update(|s| s.battery_pct_cached = i32::from(percent))
    }

    fn snapshot(&self) -> PersistedSnapshot {
        self.snapshot.read().clone()
    }
}
