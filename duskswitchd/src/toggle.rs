//! Keyboard-driven toggle state machine
//!
//! `ArmedOff` listens for the turn-off hotkey. The hotkey schedules a delayed
//! turn-off of every device and arms a catch-all key-down listener instead
//! (`ArmedOn`). The next key press cancels a turn-off that has not run yet,
//! turns every device back on, and re-arms the hotkey.

use chrono::{DateTime, Local};
use duskswitch_common::{tracing, KeyCombo};
use std::time::Duration;
use tracing::{debug, info};

use crate::debounce::DebounceTimer;
use crate::fleet::DeviceFleet;
use crate::gate::ActivationGate;
use crate::input::{KeyboardHub, Trigger};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToggleState {
    /// Waiting for the turn-off hotkey
    ArmedOff,
    /// Devices are off or about to be; waiting for any key
    ArmedOn,
}

/// What a trigger did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    TurnOffScheduled,
    TurnedOn,
    Ignored,
}

pub struct ToggleMachine {
    state: ToggleState,
    turn_off_combo: KeyCombo,
    delay: Duration,
    debounce: DebounceTimer,
}

impl ToggleMachine {
    /// Start in `ArmedOff` with the turn-off hotkey registered on `hub`
    pub fn new(turn_off_combo: KeyCombo, delay: Duration, hub: &mut KeyboardHub) -> Self {
        hub.register_hotkey(turn_off_combo.clone());
        Self {
            state: ToggleState::ArmedOff,
            turn_off_combo,
            delay,
            debounce: DebounceTimer::new(),
        }
    }

    pub fn state(&self) -> ToggleState {
        self.state
    }

    pub fn is_locked(&self) -> bool {
        self.state == ToggleState::ArmedOn
    }

    pub fn has_pending_turn_off(&self) -> bool {
        self.debounce.is_pending()
    }

    pub fn handle(
        &mut self,
        trigger: &Trigger,
        gate: &ActivationGate,
        now: DateTime<Local>,
        hub: &mut KeyboardHub,
        fleet: &DeviceFleet,
    ) -> Transition {
        match trigger {
            Trigger::Hotkey(combo) if *combo == self.turn_off_combo => {
                self.turn_off(gate, now, hub, fleet)
            }
            Trigger::Hotkey(combo) => {
                debug!("Ignoring unknown hotkey {}", combo);
                Transition::Ignored
            }
            Trigger::KeyDown(_) => self.turn_on(gate, now, hub, fleet),
        }
    }

    fn turn_off(
        &mut self,
        gate: &ActivationGate,
        now: DateTime<Local>,
        hub: &mut KeyboardHub,
        fleet: &DeviceFleet,
    ) -> Transition {
        if !gate.is_open(now) || self.is_locked() {
            debug!("Turn-off hotkey ignored");
            return Transition::Ignored;
        }

        info!("Turning off in {} seconds", self.delay.as_secs_f32());
        let fleet = fleet.clone();
        self.debounce.schedule(self.delay, move || async move {
            fleet.switch_all(false);
        });

        self.state = ToggleState::ArmedOn;
        hub.unregister_all_hotkeys();
        hub.on_key_down();
        Transition::TurnOffScheduled
    }

    fn turn_on(
        &mut self,
        gate: &ActivationGate,
        now: DateTime<Local>,
        hub: &mut KeyboardHub,
        fleet: &DeviceFleet,
    ) -> Transition {
        // any key activity stops a turn-off that has not started yet
        if self.debounce.cancel() {
            info!("Cancelled pending turn-off");
        }

        if !gate.is_open(now) || !self.is_locked() {
            debug!("Key-down ignored");
            return Transition::Ignored;
        }

        info!("Turning on");
        fleet.switch_all(true);

        self.state = ToggleState::ArmedOff;
        hub.remove_all_listeners();
        hub.register_hotkey(self.turn_off_combo.clone());
        Transition::TurnedOn
    }

    /// Drop a scheduled turn-off. Returns true if one was pending.
    pub fn cancel_pending(&mut self) -> bool {
        self.debounce.cancel()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::mock::{self, MockCalls, MockDevice};
    use crate::input::KeyEvent;
    use chrono::Duration as ChronoDuration;
    use std::sync::Arc;
    use tokio::sync::mpsc;

    const DELAY: Duration = Duration::from_secs(10);

    fn ctrl_alt_l() -> KeyCombo {
        KeyCombo::new(vec![29, 56, 38])
    }

    struct Rig {
        machine: ToggleMachine,
        hub: KeyboardHub,
        fleet: DeviceFleet,
        calls: Vec<Arc<MockCalls>>,
        open: ActivationGate,
        now: DateTime<Local>,
    }

    fn rig() -> Rig {
        let (tx, _rx) = mpsc::unbounded_channel();
        let (a, a_calls) = mock::handle("a", MockDevice::new());
        let (b, b_calls) = mock::handle("b", MockDevice::new());
        let fleet = DeviceFleet::new(vec![a, b], tx);

        let mut hub = KeyboardHub::new();
        let machine = ToggleMachine::new(ctrl_alt_l(), DELAY, &mut hub);
        let now = Local::now();

        Rig {
            machine,
            hub,
            fleet,
            calls: vec![a_calls, b_calls],
            open: ActivationGate::testing(now),
            now,
        }
    }

    impl Rig {
        fn fire(&mut self, trigger: Trigger, gate: ActivationGate) -> Transition {
            self.machine
                .handle(&trigger, &gate, self.now, &mut self.hub, &self.fleet)
        }

        fn sets(&self) -> usize {
            self.calls.iter().map(|c| MockCalls::count(&c.set)).sum()
        }

        fn powers(&self) -> Vec<Option<bool>> {
            self.calls
                .iter()
                .map(|c| *c.last_power.lock().unwrap())
                .collect()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_hotkey_before_activation_is_ignored() {
        let mut rig = rig();
        let closed = ActivationGate::at(rig.now + ChronoDuration::minutes(30));

        assert_eq!(rig.fire(Trigger::Hotkey(ctrl_alt_l()), closed), Transition::Ignored);
        assert_eq!(rig.machine.state(), ToggleState::ArmedOff);
        assert!(!rig.machine.has_pending_turn_off());
        assert_eq!(rig.hub.hotkeys(), &[ctrl_alt_l()]);
        assert!(!rig.hub.is_key_down_armed());

        tokio::time::sleep(DELAY * 2).await;
        assert_eq!(rig.sets(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hotkey_turns_everything_off_after_delay() {
        let mut rig = rig();
        let open = rig.open;

        assert_eq!(
            rig.fire(Trigger::Hotkey(ctrl_alt_l()), open),
            Transition::TurnOffScheduled
        );
        assert!(rig.machine.is_locked());
        assert!(rig.hub.hotkeys().is_empty());
        assert!(rig.hub.is_key_down_armed());

        tokio::time::sleep(DELAY - Duration::from_millis(1)).await;
        assert_eq!(rig.sets(), 0);

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(rig.sets(), 2);
        assert_eq!(rig.powers(), vec![Some(false), Some(false)]);
        assert!(rig.fleet.table().read().await.all(false));
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_hotkey_while_locked_is_ignored() {
        let mut rig = rig();
        let open = rig.open;
        rig.fire(Trigger::Hotkey(ctrl_alt_l()), open);
        assert_eq!(rig.fire(Trigger::Hotkey(ctrl_alt_l()), open), Transition::Ignored);

        tokio::time::sleep(DELAY * 2).await;
        // one batch only
        assert_eq!(rig.sets(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_key_activity_cancels_pending_turn_off() {
        let mut rig = rig();
        let open = rig.open;
        rig.fire(Trigger::Hotkey(ctrl_alt_l()), open);

        tokio::time::sleep(DELAY / 2).await;
        assert_eq!(rig.fire(Trigger::KeyDown(30), open), Transition::TurnedOn);
        assert!(!rig.machine.has_pending_turn_off());

        tokio::time::sleep(DELAY * 2).await;
        // only the turn-on batch reached the devices
        assert_eq!(rig.sets(), 2);
        assert_eq!(rig.powers(), vec![Some(true), Some(true)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_key_down_turns_on_and_rearms_hotkey() {
        let mut rig = rig();
        let open = rig.open;
        rig.fire(Trigger::Hotkey(ctrl_alt_l()), open);
        tokio::time::sleep(DELAY + Duration::from_secs(1)).await;
        assert!(rig.fleet.table().read().await.all(false));

        assert_eq!(rig.fire(Trigger::KeyDown(57), open), Transition::TurnedOn);
        tokio::time::sleep(Duration::from_millis(1)).await;

        assert_eq!(rig.machine.state(), ToggleState::ArmedOff);
        assert!(rig.fleet.table().read().await.all(true));
        assert!(!rig.hub.is_key_down_armed());
        assert_eq!(rig.hub.hotkeys(), &[ctrl_alt_l()]);

        // the hub now routes the combo back to the hotkey
        for code in [29, 56] {
            assert_eq!(rig.hub.process(KeyEvent::press(code)), None);
        }
        assert_eq!(
            rig.hub.process(KeyEvent::press(38)),
            Some(Trigger::Hotkey(ctrl_alt_l()))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_key_down_when_unlocked_is_ignored() {
        let mut rig = rig();
        let open = rig.open;
        assert_eq!(rig.fire(Trigger::KeyDown(30), open), Transition::Ignored);
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(rig.sets(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_key_down_before_activation_still_cancels() {
        let mut rig = rig();
        let open = rig.open;
        rig.fire(Trigger::Hotkey(ctrl_alt_l()), open);

        let closed = ActivationGate::at(rig.now + ChronoDuration::minutes(30));
        assert_eq!(rig.fire(Trigger::KeyDown(30), closed), Transition::Ignored);
        assert!(!rig.machine.has_pending_turn_off());
        // still locked, the next key down can turn things on
        assert!(rig.machine.is_locked());

        tokio::time::sleep(DELAY * 2).await;
        assert_eq!(rig.sets(), 0);
    }
}
