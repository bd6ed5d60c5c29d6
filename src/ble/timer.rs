//! Deferred re-entry into the connection manager.
//!
//! Timers never call back into the manager directly. A [`Scheduler`] delivers
//! the [`Timer`] value back to the manager's input queue once its delay has
//! elapsed, and the manager applies it only if [`TimerSlots`] still considers
//! that token current. Removing a timer from the scheduler is best-effort;
//! the token check is what makes cancellation deterministic.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use tracing::trace;

/// What a timer is for. At most one timer of each kind is current.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    /// Backoff delay before the next connect attempt.
    Reconnect,
    /// Delay before retrying service discovery in place.
    Rediscover,
    /// Periodic INFO read while the link is ready.
    Poll,
    /// Next tick of the wake-scan cycle.
    WakeScanCycle,
    /// End of a running wake scan.
    WakeScanStop,
}

impl fmt::Display for TimerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Reconnect => write!(f, "reconnect"),
            Self::Rediscover => write!(f, "rediscover"),
            Self::Poll => write!(f, "poll"),
            Self::WakeScanCycle => write!(f, "wake-scan-cycle"),
            Self::WakeScanStop => write!(f, "wake-scan-stop"),
        }
    }
}

/// Unique generation of an armed timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerToken(pub u64);

/// An armed timer as handed to the scheduler and returned when it fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Timer {
    /// Purpose of the timer.
    pub kind: TimerKind,
    /// Generation of the timer.
    pub token: TimerToken,
}

/// Delivers timers back to the manager after a delay.
pub trait Scheduler: Send {
    /// Deliver `timer` after `delay`.
    fn schedule(&mut self, timer: Timer, delay: Duration);

    /// Try to drop a pending timer. It may still be delivered.
    fn cancel(&mut self, timer: Timer);
}

/// Bookkeeping of which timer generation is current per kind.
#[derive(Debug, Default)]
pub struct TimerSlots {
    next_token: u64,
    current: HashMap<TimerKind, TimerToken>,
}

impl TimerSlots {
    /// Create an empty set of slots.
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm a fresh timer of `kind`. Returns the new timer and the one it
    /// superseded, if any.
    pub fn arm(&mut self, kind: TimerKind) -> (Timer, Option<Timer>) {
        self.next_token += 1;
        let token = TimerToken(self.next_token);
        let previous = self
            .current
            .insert(kind, token)
            .map(|token| Timer { kind, token });
        (Timer { kind, token }, previous)
    }

    /// Disarm the current timer of `kind`.
    pub fn disarm(&mut self, kind: TimerKind) -> Option<Timer> {
        self.current
            .remove(&kind)
            .map(|token| Timer { kind, token })
    }

    /// Disarm every timer.
    pub fn disarm_all(&mut self) -> Vec<Timer> {
        self.current
            .drain()
            .map(|(kind, token)| Timer { kind, token })
            .collect()
    }

    /// Whether a timer of `kind` is armed.
    pub fn is_armed(&self, kind: TimerKind) -> bool {
        self.current.contains_key(&kind)
    }

    /// Consume a fired timer. Returns `false` for stale or cancelled timers.
    pub fn fire(&mut self, timer: Timer) -> bool {
        if self.current.get(&timer.kind) == Some(&timer.token) {
            self.current.remove(&timer.kind);
            true
        } else {
            false
        }
    }
}

/// [`TimerSlots`] paired with the [`Scheduler`] that delivers them.
pub struct TimerQueue {
    slots: TimerSlots,
    scheduler: Box<dyn Scheduler>,
}

impl TimerQueue {
    /// Create a queue on top of `scheduler`.
    pub fn new(scheduler: Box<dyn Scheduler>) -> Self {
        Self {
            slots: TimerSlots::new(),
            scheduler,
        }
    }

    /// Arm `kind` to fire after `delay`, superseding any pending timer of that kind.
    pub fn arm(&mut self, kind: TimerKind, delay: Duration) {
        let (timer, previous) = self.slots.arm(kind);
        if let Some(previous) = previous {
            self.scheduler.cancel(previous);
        }
        trace!("Arming {} timer in {:?}", kind, delay);
        self.scheduler.schedule(timer, delay);
    }

    /// Disarm `kind`. A delivery already in flight will be ignored.
    pub fn disarm(&mut self, kind: TimerKind) {
        if let Some(timer) = self.slots.disarm(kind) {
            self.scheduler.cancel(timer);
        }
    }

    /// Disarm every timer.
    pub fn disarm_all(&mut self) {
        for timer in self.slots.disarm_all() {
            self.scheduler.cancel(timer);
        }
    }

    /// Whether `kind` is armed.
    pub fn is_armed(&self, kind: TimerKind) -> bool {
        self.slots.is_armed(kind)
    }

    /// Accept a delivered timer if it is still current.
    pub fn fire(&mut self, timer: Timer) -> bool {
        self.slots.fire(timer)
    }
}
