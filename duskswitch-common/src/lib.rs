use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

// Re-export common dependencies
pub use serde;
pub use serde_json;
pub use tokio;
pub use tracing;

pub mod error;
pub mod tuya;

pub use error::{DeviceError, ProtocolError};

/// A controllable device as described in the configuration file
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeviceDescriptor {
    pub id: String,
    pub key: String,
    pub name: String,
    /// Known LAN address; skips broadcast discovery when set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
}

impl fmt::Display for DeviceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.id)
    }
}

/// Coordinates used for the sunset lookup
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Location {
    pub latitude: f64,
    pub longitude: f64,
}

/// A set of evdev key codes that must all be held together
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct KeyCombo {
    pub keys: Vec<u16>,
}

impl KeyCombo {
    pub fn new(keys: Vec<u16>) -> Self {
        Self { keys }
    }

    /// True when every key of the combo is in `held`
    pub fn is_held(&self, held: &HashSet<u16>) -> bool {
        !self.keys.is_empty() && self.keys.iter().all(|k| held.contains(k))
    }
}

impl fmt::Display for KeyCombo {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let codes: Vec<String> = self.keys.iter().map(|k| k.to_string()).collect();
        write!(f, "[{}]", codes.join("+"))
    }
}

/// Last known power state of one device
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeviceStateEntry {
    pub id: String,
    pub state: bool,
}

/// Human readable power state
pub fn power_label(state: bool) -> &'static str {
    if state {
        "on"
    } else {
        "off"
    }
}
