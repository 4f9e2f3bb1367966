//! Keyboard input
//!
//! [`KeyboardMonitor`] reads key events from every keyboard under
//! `/dev/input` without grabbing them. [`KeyboardHub`] turns the raw events
//! into triggers for whichever listener is currently registered: the
//! turn-off hotkey, or the catch-all key-down listener.

use duskswitch_common::{tracing, KeyCombo};
use evdev::{Device as EvdevDevice, InputEventKind, Key};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Default directory holding evdev nodes
pub const INPUT_DIR: &str = "/dev/input";

/// A key press or release from any keyboard
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyEvent {
    pub code: u16,
    pub pressed: bool,
}

impl KeyEvent {
    pub fn press(code: u16) -> Self {
        Self { code, pressed: true }
    }

    pub fn release(code: u16) -> Self {
        Self {
            code,
            pressed: false,
        }
    }
}

/// What a registered listener observed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Trigger {
    Hotkey(KeyCombo),
    KeyDown(u16),
}

/// Tracks held keys and the active registrations
#[derive(Debug, Default)]
pub struct KeyboardHub {
    held: HashSet<u16>,
    hotkeys: Vec<KeyCombo>,
    key_down: bool,
}

impl KeyboardHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_hotkey(&mut self, combo: KeyCombo) {
        if !self.hotkeys.contains(&combo) {
            self.hotkeys.push(combo);
        }
    }

    pub fn on_key_down(&mut self) {
        self.key_down = true;
    }

    pub fn unregister_all_hotkeys(&mut self) {
        self.hotkeys.clear();
    }

    pub fn remove_all_listeners(&mut self) {
        self.key_down = false;
    }

    pub fn hotkeys(&self) -> &[KeyCombo] {
        &self.hotkeys
    }

    pub fn is_key_down_armed(&self) -> bool {
        self.key_down
    }

    /// Feed one raw event, returning the trigger it fires, if any.
    ///
    /// Only the press that completes a combo fires a hotkey; repeats of an
    /// already held key fire nothing.
    pub fn process(&mut self, event: KeyEvent) -> Option<Trigger> {
        if !event.pressed {
            self.held.remove(&event.code);
            return None;
        }

        if !self.held.insert(event.code) {
            return None;
        }

        if self.key_down {
            return Some(Trigger::KeyDown(event.code));
        }

        self.hotkeys
            .iter()
            .find(|combo| combo.keys.contains(&event.code) && combo.is_held(&self.held))
            .map(|combo| Trigger::Hotkey(combo.clone()))
    }
}

/// Reads key events from all keyboards and forwards them on a channel
pub struct KeyboardMonitor {
    input_dir: PathBuf,
    keyboards: Vec<PathBuf>,
    event_sender: mpsc::Sender<KeyEvent>,
    event_receiver: Option<mpsc::Receiver<KeyEvent>>,
    stop: Arc<AtomicBool>,
}

impl KeyboardMonitor {
    pub fn new<P: AsRef<Path>>(input_dir: P) -> Self {
        let (event_sender, event_receiver) = mpsc::channel(1000);
        Self {
            input_dir: input_dir.as_ref().to_path_buf(),
            keyboards: Vec::new(),
            event_sender,
            event_receiver: Some(event_receiver),
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Find every event node that reports letter keys
    pub fn discover(&mut self) -> std::io::Result<usize> {
        info!("Scanning {} for keyboards", self.input_dir.display());
        self.keyboards.clear();

        let mut paths: Vec<PathBuf> = fs::read_dir(&self.input_dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| {
                path.file_name()
                    .and_then(|s| s.to_str())
                    .map_or(false, |name| name.starts_with("event"))
            })
            .collect();
        paths.sort();

        for path in paths {
            match EvdevDevice::open(&path) {
                Ok(device) => {
                    let is_keyboard = device
                        .supported_keys()
                        .map_or(false, |keys| keys.contains(Key::KEY_A));
                    if is_keyboard {
                        info!(
                            "Found keyboard: {} at {}",
                            device.name().unwrap_or("Unknown Device"),
                            path.display()
                        );
                        self.keyboards.push(path);
                    }
                }
                Err(e) => debug!("Skipping {}: {}", path.display(), e),
            }
        }

        Ok(self.keyboards.len())
    }

    pub fn keyboards(&self) -> &[PathBuf] {
        &self.keyboards
    }

    /// Take the receiving end of the event channel
    pub fn take_receiver(&mut self) -> Option<mpsc::Receiver<KeyEvent>> {
        self.event_receiver.take()
    }

    /// Start one blocking reader per keyboard
    pub fn start(&self) {
        for path in &self.keyboards {
            let path = path.clone();
            let sender = self.event_sender.clone();
            let stop = Arc::clone(&self.stop);

            // evdev reads block, so each keyboard gets its own blocking task
            tokio::task::spawn_blocking(move || {
                let mut device = match EvdevDevice::open(&path) {
                    Ok(d) => d,
                    Err(e) => {
                        error!("Failed to open {} for reading: {}", path.display(), e);
                        return;
                    }
                };
                debug!("Reading key events from {}", path.display());

                while !stop.load(Ordering::Relaxed) {
                    let events = match device.fetch_events() {
                        Ok(events) => events,
                        Err(e) => {
                            warn!("Error reading from {}: {}", path.display(), e);
                            break;
                        }
                    };

                    for event in events {
                        if let InputEventKind::Key(key) = event.kind() {
                            // 0 = release, 1 = press, 2 = autorepeat
                            let key_event = match event.value() {
                                0 => KeyEvent::release(key.code()),
                                1 => KeyEvent::press(key.code()),
                                _ => continue,
                            };
                            if sender.blocking_send(key_event).is_err() {
                                return;
                            }
                        }
                    }
                }

                debug!("Stopped reading {}", path.display());
            });
        }
    }

    /// Ask the readers to stop after their next event
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Relaxed);
    }
}
