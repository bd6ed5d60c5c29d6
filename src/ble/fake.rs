//! In-process doubles for the radio, the scheduler and the alert surface.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

use crate::alerts::{Alert, AlertSink};
use crate::ble::radio::{CharacteristicHandle, DeviceId, RadioLink, SessionId};
use crate::ble::timer::{Scheduler, Timer, TimerKind};
use crate::error::{Error, Result};

/// A request the manager made of the radio.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RadioRequest {
    Connect {
        session: SessionId,
        device: String,
        auto_reconnect: bool,
    },
    Disconnect,
    DiscoverServices {
        session: SessionId,
    },
    Read {
        session: SessionId,
    },
    Subscribe {
        session: SessionId,
    },
    RefreshCache,
    StartScan {
        device: String,
        duration: Duration,
    },
    StopScan,
    RequestMtu(u16),
    RequestHighPriority,
}

#[derive(Debug, Default)]
struct FakeRadioState {
    requests: Vec<RadioRequest>,
    reject_connect: bool,
    reject_scan: bool,
}

/// Radio that records requests and never emits events on its own.
#[derive(Debug, Clone, Default)]
pub struct FakeRadio {
    state: Arc<Mutex<FakeRadioState>>,
}

impl FakeRadio {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn requests(&self) -> Vec<RadioRequest> {
        self.state.lock().requests.clone()
    }

    /// Drain recorded requests.
    pub fn take(&self) -> Vec<RadioRequest> {
        std::mem::take(&mut self.state.lock().requests)
    }

    pub fn count(&self, pred: impl Fn(&RadioRequest) -> bool) -> usize {
        self.state.lock().requests.iter().filter(|r| pred(r)).count()
    }

    pub fn last_connect(&self) -> Option<RadioRequest> {
        self.state
            .lock()
            .requests
            .iter()
            .rev()
            .find(|r| matches!(r, RadioRequest::Connect { .. }))
            .cloned()
    }

    pub fn set_reject_connect(&self, reject: bool) {
        self.state.lock().reject_connect = reject;
    }

    pub fn set_reject_scan(&self, reject: bool) {
        self.state.lock().reject_scan = reject;
    }

    fn record(&self, request: RadioRequest) {
        self.state.lock().requests.push(request);
    }
}

impl RadioLink for FakeRadio {
    fn connect(
        &mut self,
        session: SessionId,
        device: &DeviceId,
        auto_reconnect: bool,
    ) -> Result<()> {
        self.record(RadioRequest::Connect {
            session,
            device: device.to_string(),
            auto_reconnect,
        });
        if self.state.lock().reject_connect {
            return Err(Error::BluetoothUnavailable);
        }
        Ok(())
    }

    fn disconnect(&mut self) -> Result<()> {
        self.record(RadioRequest::Disconnect);
        Ok(())
    }

    fn discover_services(&mut self, session: SessionId) -> Result<()> {
        self.record(RadioRequest::DiscoverServices { session });
        Ok(())
    }

    fn read_characteristic(&mut self, handle: &CharacteristicHandle) -> Result<()> {
        self.record(RadioRequest::Read {
            session: handle.session,
        });
        Ok(())
    }

    fn subscribe(&mut self, handle: &CharacteristicHandle) -> Result<()> {
        self.record(RadioRequest::Subscribe {
            session: handle.session,
        });
        Ok(())
    }

    fn refresh_service_cache(&mut self) -> bool {
        self.record(RadioRequest::RefreshCache);
        true
    }

    fn start_scan(&mut self, device: &DeviceId, duration: Duration) -> Result<()> {
        self.record(RadioRequest::StartScan {
            device: device.to_string(),
            duration,
        });
        if self.state.lock().reject_scan {
            return Err(Error::NotSupported {
                operation: "scan".to_string(),
            });
        }
        Ok(())
    }

    fn stop_scan(&mut self) -> Result<()> {
        self.record(RadioRequest::StopScan);
        Ok(())
    }

    fn request_mtu(&mut self, mtu: u16) -> Result<()> {
        self.record(RadioRequest::RequestMtu(mtu));
        Err(Error::NotSupported {
            operation: "request_mtu".to_string(),
        })
    }

    fn request_high_priority(&mut self) -> Result<()> {
        self.record(RadioRequest::RequestHighPriority);
        Ok(())
    }
}

/// Scheduler that only records; tests deliver timers by hand.
#[derive(Debug, Clone, Default)]
pub struct ManualScheduler {
    pending: Arc<Mutex<Vec<(Timer, Duration)>>>,
}

impl ManualScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Most recently scheduled pending timer of `kind`.
    pub fn pending(&self, kind: TimerKind) -> Option<(Timer, Duration)> {
        self.pending
            .lock()
            .iter()
            .rev()
            .find(|(t, _)| t.kind == kind)
            .copied()
    }

    /// Remove and return the pending timer of `kind`.
    pub fn take(&self, kind: TimerKind) -> Option<Timer> {
        let mut pending = self.pending.lock();
        let index = pending.iter().rposition(|(t, _)| t.kind == kind)?;
        Some(pending.remove(index).0)
    }

    pub fn pending_kinds(&self) -> Vec<TimerKind> {
        self.pending.lock().iter().map(|(t, _)| t.kind).collect()
    }
}

impl Scheduler for ManualScheduler {
    fn schedule(&mut self, timer: Timer, delay: Duration) {
        self.pending.lock().push((timer, delay));
    }

    fn cancel(&mut self, timer: Timer) {
        self.pending.lock().retain(|(t, _)| *t != timer);
    }
}

/// Alert sink that keeps everything it is given.
#[derive(Debug, Default)]
pub struct RecordingAlerts {
    alerts: Mutex<Vec<Alert>>,
}

impl RecordingAlerts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn all(&self) -> Vec<Alert> {
        self.alerts.lock().clone()
    }

    pub fn presence(&self) -> Vec<String> {
        self.all()
            .into_iter()
            .filter_map(|a| match a {
                Alert::Presence { message } => Some(message),
                _ => None,
            })
            .collect()
    }

    pub fn battery(&self) -> Vec<Alert> {
        self.all()
            .into_iter()
            .filter(|a| matches!(a, Alert::Battery { .. }))
            .collect()
    }

    pub fn last_status(&self) -> Option<(bool, String)> {
        self.all().into_iter().rev().find_map(|a| match a {
            Alert::Status { connected, text } => Some((connected, text)),
            _ => None,
        })
    }
}

impl AlertSink for RecordingAlerts {
    fn presence_alert(&self, message: &str) {
        self.alerts.lock().push(Alert::Presence {
            message: message.to_string(),
        });
    }

    fn battery_alert(&self, percent: u8, state: &str, critical: bool) {
        self.alerts.lock().push(Alert::Battery {
            percent,
            state: state.to_string(),
            critical,
        });
    }

    fn status_changed(&self, connected: bool, text: &str) {
        self.alerts.lock().push(Alert::Status {
            connected,
            text: text.to_string(),
        });
    }
}
