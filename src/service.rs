//! Host-facing service.
//!
//! [`SenseService`] runs the [`ConnectionManager`] on a single tokio task.
//! Host commands, radio events and fired timers are funnelled into that task
//! and applied one at a time, so the manager itself needs no locking.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace};

use crate::alerts::AlertSink;
use crate::ble::connection::{ConnectionManager, LinkState, ManagerInput};
use crate::ble::platform::{default_adapter, BtleplugRadio};
use crate::ble::radio::{RadioEvent, RadioLink};
use crate::ble::timer::{Scheduler, Timer};
use crate::config::LinkConfig;
use crate::error::{Error, Result};
use crate::store::{PersistedSnapshot, StateStore};

/// [`Scheduler`] backed by tokio sleeps that post back to the service task.
pub struct TokioScheduler {
    loopback: mpsc::UnboundedSender<Timer>,
    tasks: HashMap<Timer, JoinHandle<()>>,
}

impl TokioScheduler {
    /// Deliver fired timers on `loopback`.
    pub fn new(loopback: mpsc::UnboundedSender<Timer>) -> Self {
        Self {
            loopback,
            tasks: HashMap::new(),
        }
    }
}

impl Scheduler for TokioScheduler {
    fn schedule(&mut self, timer: Timer, delay: Duration) {
        self.tasks.retain(|_, task| !task.is_finished());

        let loopback = self.loopback.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = loopback.send(timer);
        });
        self.tasks.insert(timer, task);
    }

    fn cancel(&mut self, timer: Timer) {
        if let Some(task) = self.tasks.remove(&timer) {
            task.abort();
        }
    }
}

impl Drop for TokioScheduler {
    fn drop(&mut self) {
        for (_, task) in self.tasks.drain() {
            task.abort();
        }
    }
}

enum Command {
    Input(ManagerInput),
    LinkState(oneshot::Sender<LinkState>),
    Shutdown(oneshot::Sender<()>),
}

/// Handle to the running link service.
///
/// Cloning the handle is cheap; all clones talk to the same service task.
#[derive(Clone)]
pub struct SenseService {
    inbox: mpsc::Sender<Command>,
    store: Arc<dyn StateStore>,
}

impl SenseService {
    /// Spawn the service task on the current tokio runtime.
    ///
    /// `radio_events` must be the event channel belonging to `radio`.
    pub fn spawn<R>(
        radio: R,
        radio_events: mpsc::UnboundedReceiver<RadioEvent>,
        store: Arc<dyn StateStore>,
        alerts: Arc<dyn AlertSink>,
        config: LinkConfig,
    ) -> Self
    where
        R: RadioLink + 'static,
    {
        let (inbox, commands) = mpsc::channel(32);
        let (loopback_tx, timers) = mpsc::unbounded_channel();

        let manager = ConnectionManager::new(
            radio,
            Box::new(TokioScheduler::new(loopback_tx)),
            store.clone(),
            alerts,
            config,
        );

        let actor = ServiceActor {
            manager,
            commands,
            radio_events,
            timers,
        };
        tokio::spawn(actor.run());

        Self { inbox, store }
    }

    /// Spawn the service on the system's default Bluetooth adapter.
    ///
    /// # Errors
    ///
    /// Returns an error if no Bluetooth adapter is available.
    pub async fn with_default_adapter(
        store: Arc<dyn StateStore>,
        alerts: Arc<dyn AlertSink>,
        config: LinkConfig,
    ) -> Result<Self> {
        let adapter = default_adapter().await?;
        let (radio, radio_events) = BtleplugRadio::new(adapter).await?;
        Ok(Self::spawn(radio, radio_events, store, alerts, config))
    }

    /// Start maintaining the link, to `identity` or the last-known device.
    pub async fn start(&self, identity: Option<&str>) -> Result<()> {
        self.send(ManagerInput::Start(identity.map(str::to_string)))
            .await
    }

    /// Stop the link. The service stays alive and can be started again.
    pub async fn stop(&self) -> Result<()> {
        self.send(ManagerInput::Stop).await
    }

    /// Forward an adapter power change observed by the host.
    pub async fn adapter_power_changed(&self, on: bool) -> Result<()> {
        self.send(ManagerInput::AdapterPower(on)).await
    }

    /// Current link state.
    pub async fn link_state(&self) -> Result<LinkState> {
        let (tx, rx) = oneshot::channel();
        self.inbox
            .send(Command::LinkState(tx))
            .await
            .map_err(|_| Error::ServiceStopped)?;
        rx.await.map_err(|_| Error::ServiceStopped)
    }

    /// Everything persisted for the UI.
    pub fn snapshot(&self) -> PersistedSnapshot {
        self.store.snapshot()
    }

    /// Latest full telemetry JSON, `"{}"` if nothing was received yet.
    pub fn battery_info(&self) -> String {
        let info = self.store.snapshot().info_json;
        if info.is_empty() {
            "{}".to_string()
        } else {
            info
        }
    }

    /// Whether somebody is currently present.
    pub fn presence(&self) -> bool {
        self.store.snapshot().presence_present
    }

    /// Cached battery percent, -1 if unknown.
    pub fn battery_pct(&self) -> i32 {
        self.store.snapshot().battery_pct_cached
    }

    /// Stop the link and end the service task.
    pub async fn shutdown(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.inbox
            .send(Command::Shutdown(tx))
            .await
            .map_err(|_| Error::ServiceStopped)?;
        rx.await.map_err(|_| Error::ServiceStopped)
    }

    async fn send(&self, input: ManagerInput) -> Result<()> {
        self.inbox
            .send(Command::Input(input))
            .await
            .map_err(|_| Error::ServiceStopped)
    }
}

struct ServiceActor<R: RadioLink> {
    manager: ConnectionManager<R>,
    commands: mpsc::Receiver<Command>,
    radio_events: mpsc::UnboundedReceiver<RadioEvent>,
    timers: mpsc::UnboundedReceiver<Timer>,
}

impl<R: RadioLink> ServiceActor<R> {
    async fn run(mut self) {
        info!("Sense service starting");

        let mut shutdown_reply = None;

        loop {
            tokio::select! {
                // Drain what already happened before taking new commands.
                biased;

                Some(timer) = self.timers.recv() => {
                    trace!("Timer {} delivered", timer.kind);
                    self.manager.on_timer(timer);
                }
                Some(event) = self.radio_events.recv() => {
                    self.manager.on_radio_event(event);
                }
                cmd = self.commands.recv() => {
                    let Some(cmd) = cmd else {
                        debug!("All service handles dropped");
                        break;
                    };
                    if let Some(reply) = self.handle_command(cmd) {
                        shutdown_reply = Some(reply);
                        break;
                    }
                }
            }
        }

        self.manager.stop();
        info!("Sense service stopped");
        if let Some(reply) = shutdown_reply {
            let _ = reply.send(());
        }
    }

    /// Apply one command. Returns the reply channel once shutdown is requested.
    fn handle_command(&mut self, cmd: Command) -> Option<oneshot::Sender<()>> {
        match cmd {
            Command::Input(input) => self.manager.handle_input(input),
            Command::LinkState(reply) => {
                let _ = reply.send(self.manager.state());
            }
            Command::Shutdown(reply) => return Some(reply),
        }
        None
    }
}
