//! Shared listener for Tuya discovery broadcasts
//!
//! Devices announce themselves every few seconds on two UDP ports, one plain
//! and one encrypted. A single listener binds both ports for the whole fleet
//! and keeps the last address announced by each gateway id, so every client
//! can wait on it at the same time.

use duskswitch_common::tuya::{self, BROADCAST_PORT, DEVICE_PORT, ENCRYPTED_BROADCAST_PORT};
use duskswitch_common::{tracing, DeviceError};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace};

use crate::config::NetworkSettings;

type KnownDevices = HashMap<String, SocketAddr>;

pub struct Discovery {
    plain_port: u16,
    encrypted_port: u16,
    device_port: u16,
    known: Arc<watch::Sender<KnownDevices>>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl Discovery {
    pub fn new(plain_port: u16, encrypted_port: u16, device_port: u16) -> Self {
        let (known, _) = watch::channel(KnownDevices::new());
        Self {
            plain_port,
            encrypted_port,
            device_port,
            known: Arc::new(known),
            listener: Mutex::new(None),
        }
    }

    pub fn from_settings(settings: &NetworkSettings) -> Self {
        Self::new(
            settings.discovery_port,
            settings.encrypted_discovery_port,
            settings.device_port,
        )
    }

    /// Last address announced by `id`, if any
    pub fn known(&self, id: &str) -> Option<SocketAddr> {
        self.known.borrow().get(id).copied()
    }

    /// Wait until `id` has announced itself. Returns at once when it already has.
    ///
    /// The wait is unbounded; callers put their own deadline on it.
    pub async fn find(&self, id: &str) -> Result<SocketAddr, DeviceError> {
        let mut known = self.known.subscribe();
        self.ensure_listening().await?;

        let devices = known
            .wait_for(|devices| devices.contains_key(id))
            .await
            .map_err(|_| DeviceError::NotFound(id.to_string()))?;
        devices
            .get(id)
            .copied()
            .ok_or_else(|| DeviceError::NotFound(id.to_string()))
    }

    async fn ensure_listening(&self) -> Result<(), DeviceError> {
        let mut listener = self.listener.lock().await;
        if listener.as_ref().is_some_and(|task| !task.is_finished()) {
            return Ok(());
        }

        let plain = UdpSocket::bind(("0.0.0.0", self.plain_port)).await?;
        let encrypted = UdpSocket::bind(("0.0.0.0", self.encrypted_port)).await?;
        info!(
            "Listening for device broadcasts on ports {} and {}",
            self.plain_port, self.encrypted_port
        );

        *listener = Some(tokio::spawn(listen(
            plain,
            encrypted,
            self.device_port,
            Arc::clone(&self.known),
        )));
        Ok(())
    }
}

impl Default for Discovery {
    fn default() -> Self {
        Self::new(BROADCAST_PORT, ENCRYPTED_BROADCAST_PORT, DEVICE_PORT)
    }
}

impl Drop for Discovery {
    fn drop(&mut self) {
        if let Some(listener) = self.listener.get_mut().take() {
            listener.abort();
        }
    }
}

async fn listen(
    plain: UdpSocket,
    encrypted: UdpSocket,
    device_port: u16,
    known: Arc<watch::Sender<KnownDevices>>,
) {
    let mut plain_buf = vec![0u8; 1024];
    let mut encrypted_buf = vec![0u8; 1024];

    loop {
        let received = tokio::select! {
            received = plain.recv_from(&mut plain_buf) => {
                received.map(|(len, _)| &plain_buf[..len])
            }
            received = encrypted.recv_from(&mut encrypted_buf) => {
                received.map(|(len, _)| &encrypted_buf[..len])
            }
        };
        let datagram = match received {
            Ok(datagram) => datagram,
            Err(e) => {
                debug!("Broadcast receive failed: {}", e);
                continue;
            }
        };

        let broadcast = match tuya::parse_broadcast(datagram) {
            Ok(broadcast) => broadcast,
            Err(e) => {
                trace!("Ignoring unreadable broadcast: {}", e);
                continue;
            }
        };
        let Ok(ip) = broadcast.ip.parse::<IpAddr>() else {
            trace!("Ignoring broadcast from {} with address {}", broadcast.gw_id, broadcast.ip);
            continue;
        };

        let address = SocketAddr::new(ip, device_port);
        known.send_if_modified(|devices| {
            let changed = devices.get(&broadcast.gw_id) != Some(&address);
            if changed {
                debug!("{} announced itself at {}", broadcast.gw_id, address);
                devices.insert(broadcast.gw_id.clone(), address);
            }
            changed
        });
    }
}


#[cfg(test)]
mod tests {
    use super::announce;
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_find_waits_for_matching_broadcast() {
        let ports = announce::free_ports();
        let discovery = Discovery::new(ports.0, ports.1, 6668);
        let announcer = announce::spawn(
            ports,
            vec![
                announce::broadcast("someone-else", "192.168.1.99"),
                announce::broadcast("bf01", "192.168.1.40"),
            ],
        );

        let found = tokio::time::timeout(Duration::from_secs(5), discovery.find("bf01"))
            .await
            .unwrap()
            .unwrap();
        announcer.abort();

        assert_eq!(found, "192.168.1.40:6668".parse().unwrap());
        assert_eq!(
            discovery.known("someone-else"),
            Some("192.168.1.99:6668".parse().unwrap())
        );
    }

    #[tokio::test]
    async fn test_known_device_is_found_without_new_broadcasts() {
        let ports = announce::free_ports();
        let discovery = Discovery::new(ports.0, ports.1, 7000);
        let announcer = announce::spawn(ports, vec![announce::broadcast("bf01", "10.0.0.5")]);

        tokio::time::timeout(Duration::from_secs(5), discovery.find("bf01"))
            .await
            .unwrap()
            .unwrap();
        announcer.abort();

        let again = tokio::time::timeout(Duration::from_millis(100), discovery.find("bf01"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(again, "10.0.0.5:7000".parse().unwrap());
    }

    #[tokio::test]
    async fn test_silent_device_is_not_found() {
        let ports = announce::free_ports();
        let discovery = Discovery::new(ports.0, ports.1, 6668);

        let result = tokio::time::timeout(Duration::from_millis(200), discovery.find("bf01")).await;
        assert!(result.is_err());
        assert_eq!(discovery.known("bf01"), None);
    }

    #[tokio::test]
    async fn test_unusable_ports_are_reported() {
        let taken = std::net::UdpSocket::bind("0.0.0.0:0").unwrap();
        let port = taken.local_addr().unwrap().port();
        let discovery = Discovery::new(port, port, 6668);

        assert!(matches!(
            discovery.find("bf01").await,
            Err(DeviceError::Io(_))
        ));
    }
}
