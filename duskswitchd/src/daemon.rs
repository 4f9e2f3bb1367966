//! The daemon's single control task
//!
//! [`Daemon`] owns the keyboard registrations, the toggle state machine and
//! both timers. Key events and the shutdown signal arrive on channels and are
//! handled one at a time by [`Daemon::run`].

use duskswitch_common::tracing;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::config::DaemonConfig;
use crate::debounce::DebounceTimer;
use crate::fleet::DeviceFleet;
use crate::gate::{ActivationGate, Clock};
use crate::input::{KeyEvent, KeyboardHub, KeyboardMonitor};
use crate::toggle::{ToggleMachine, Transition};

/// How the startup sync was carried out
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitialSync {
    /// The gate was already open; every device was commanded on
    Immediate,
    /// Devices will be commanded on once the gate opens
    Scheduled(Duration),
}

pub struct Daemon {
    gate: ActivationGate,
    clock: Arc<dyn Clock>,
    hub: KeyboardHub,
    toggle: ToggleMachine,
    fleet: DeviceFleet,
    initial_sync: DebounceTimer,
    monitor: Option<KeyboardMonitor>,
    shut_down: bool,
}

impl Daemon {
    pub fn new(
        config: &DaemonConfig,
        gate: ActivationGate,
        clock: Arc<dyn Clock>,
        fleet: DeviceFleet,
    ) -> Self {
        let mut hub = KeyboardHub::new();
        let toggle = ToggleMachine::new(config.turn_off_combo(), config.delay(), &mut hub);
        info!("Turn-off hotkey is {}", config.turn_off_combo());

        Self {
            gate,
            clock,
            hub,
            toggle,
            fleet,
            initial_sync: DebounceTimer::new(),
            monitor: None,
            shut_down: false,
        }
    }

    /// Keyboard readers to stop at shutdown
    pub fn attach_monitor(&mut self, monitor: KeyboardMonitor) {
        self.monitor = Some(monitor);
    }

    /// Turn every device on now if the gate is open, otherwise once it opens
    pub fn sync_initial_state(&mut self) -> InitialSync {
        let now = self.clock.now();
        match self.gate.remaining(now) {
            None => {
                info!("Past activation time, turning everything on");
                self.fleet.switch_all(true);
                InitialSync::Immediate
            }
            Some(wait) => {
                info!(
                    "Waiting until {} to turn everything on",
                    self.gate.threshold().format("%H:%M:%S")
                );
                let fleet = self.fleet.clone();
                self.initial_sync.schedule(wait, move || async move {
                    fleet.switch_all(true);
                });
                InitialSync::Scheduled(wait)
            }
        }
    }

    /// Route one raw key event through the hub and the state machine
    pub fn handle_key_event(&mut self, event: KeyEvent) -> Option<Transition> {
        let trigger = self.hub.process(event)?;
        debug!("Trigger: {:?}", trigger);

        let now = self.clock.now();
        let transition = self
            .toggle
            .handle(&trigger, &self.gate, now, &mut self.hub, &self.fleet);
        Some(transition)
    }

    /// Process key events until shutdown is requested, then clean up
    pub async fn run(
        &mut self,
        mut keys: mpsc::Receiver<KeyEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut keys_open = true;

        loop {
            tokio::select! {
                event = keys.recv(), if keys_open => match event {
                    Some(event) => {
                        self.handle_key_event(event);
                    }
                    None => {
                        warn!("Keyboard event stream ended");
                        keys_open = false;
                    }
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Shutdown requested");
                        break;
                    }
                }
            }
        }

        self.shutdown().await;
    }

    /// Release every resource. Runs once; later calls do nothing.
    pub async fn shutdown(&mut self) {
        if self.shut_down {
            return;
        }
        self.shut_down = true;
        info!("Starting cleanup...");

        self.initial_sync.cancel();
        if self.toggle.cancel_pending() {
            info!("Dropped pending turn-off");
        }

        self.fleet.disconnect_all().await;

        self.hub.remove_all_listeners();
        self.hub.unregister_all_hotkeys();

        if let Some(monitor) = self.monitor.take() {
            monitor.stop();
        }
    }

    pub fn gate(&self) -> &ActivationGate {
        &self.gate
    }

    pub fn toggle(&self) -> &ToggleMachine {
        &self.toggle
    }

    pub fn hub(&self) -> &KeyboardHub {
        &self.hub
    }

    pub fn fleet(&self) -> &DeviceFleet {
        &self.fleet
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down
    }
}
