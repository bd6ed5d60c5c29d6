//! Wake-scan cycle.
//!
//! Some stacks never re-attach a held connection after the sensor power
//! cycles. While no link is up, a short passive scan filtered to the
//! sensor's address runs once per period; seeing the sensor advertise is
//! enough to trigger a fresh connect.

use tracing::{debug, warn};

use crate::ble::radio::{DeviceId, RadioLink};
use crate::ble::timer::{TimerKind, TimerQueue};
use crate::config::LinkConfig;

/// State of the wake-scan cycle.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct WakeScanCycle {
    running: bool,
    scanning: bool,
}

impl WakeScanCycle {
    /// Create a stopped cycle.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the periodic cycle is active.
    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Whether a scan is currently running.
    pub fn is_scanning(&self) -> bool {
        self.scanning
    }

    /// Start the cycle. The first tick runs immediately. No-op if running.
    pub fn start(
        &mut self,
        timers: &mut TimerQueue,
        radio: &mut dyn RadioLink,
        target: Option<&DeviceId>,
        link_up: bool,
        config: &LinkConfig,
    ) {
        if self.running {
            return;
        }
        debug!("Wake-scan cycle started");
        self.running = true;
        self.tick(timers, radio, target, link_up, config);
    }

    /// One period of the cycle: scan if there is nothing to hold on to.
    pub fn tick(
        &mut self,
        timers: &mut TimerQueue,
        radio: &mut dyn RadioLink,
        target: Option<&DeviceId>,
        link_up: bool,
        config: &LinkConfig,
    ) {
        if !self.running {
            return;
        }

        if let (false, Some(target)) = (link_up, target) {
            self.start_scan(timers, radio, target, config);
        }

        timers.arm(TimerKind::WakeScanCycle, config.wake_scan_period);
    }

    /// One-off scan for `target`, independent of the cycle and of the link.
    ///
    /// Lets stacks that only connect to peripherals they have already seen
    /// pick the sensor up while the first connect is in flight.
    pub fn nudge(
        &mut self,
        timers: &mut TimerQueue,
        radio: &mut dyn RadioLink,
        target: &DeviceId,
        config: &LinkConfig,
    ) {
        self.start_scan(timers, radio, target, config);
    }

    fn start_scan(
        &mut self,
        timers: &mut TimerQueue,
        radio: &mut dyn RadioLink,
        target: &DeviceId,
        config: &LinkConfig,
    ) {
        if self.scanning {
            return;
        }

        match radio.start_scan(target, config.wake_scan_duration) {
            Ok(()) => {
                debug!("Wake scan for {} started", target);
                self.scanning = true;
                timers.arm(TimerKind::WakeScanStop, config.wake_scan_duration);
            }
            Err(e) => warn!("Wake scan start failed: {}", e),
        }
    }

    /// Stop the running scan, if any. The cycle keeps going.
    pub fn stop_scan(&mut self, timers: &mut TimerQueue, radio: &mut dyn RadioLink) {
        timers.disarm(TimerKind::WakeScanStop);
        if !self.scanning {
            return;
        }
        self.scanning = false;
        match radio.stop_scan() {
            Ok(()) => debug!("Wake scan stopped"),
            Err(e) => debug!("Ignoring wake scan stop failure: {}", e),
        }
    }

    /// Stop the cycle and any running scan.
    pub fn stop(&mut self, timers: &mut TimerQueue, radio: &mut dyn RadioLink) {
        if self.running {
            debug!("Wake-scan cycle stopped");
        }
        self.running = false;
        timers.disarm(TimerKind::WakeScanCycle);
        self.stop_scan(timers, radio);
    }
}
