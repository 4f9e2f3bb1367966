//! duskswitch daemon library
//!
//! Turns a set of Tuya devices off a short while after a hotkey and back on
//! at the next key press, but only once the evening activation time has
//! passed.

pub mod config;
pub mod daemon;
pub mod debounce;
pub mod device;
pub mod discovery;
pub mod fleet;
pub mod gate;
pub mod input;
pub mod state_table;
pub mod sunset;
pub mod toggle;
pub mod tuya_client;

pub use duskswitch_common::{DeviceDescriptor, DeviceError, KeyCombo, Location};
