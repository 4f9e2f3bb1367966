//! In-process stand-in for a Tuya device on 127.0.0.1
//!
//! Speaks enough of protocol 3.3 for the daemon: decrypts control commands,
//! pushes a status report and acknowledges. It can also be told to reject
//! every command, and announce itself the way a device on the LAN does.

use duskswitch_common::tuya::{self, command, Broadcast, Cipher, DpsMessage, Frame, POWER_DPS};
use duskswitch_common::{tracing, DeviceDescriptor};
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::task::JoinHandle;
use tracing::{debug, error};

#[derive(Debug, Default)]
struct FakeState {
    power: Mutex<Option<bool>>,
    connections: AtomicUsize,
    commands: AtomicUsize,
    rejecting: AtomicBool,
}

pub struct FakeTuyaDevice {
    id: String,
    key: String,
    address: SocketAddr,
    state: Arc<FakeState>,
    server: JoinHandle<()>,
}

impl FakeTuyaDevice {
    pub async fn spawn(id: &str, key: &str) -> io::Result<Self> {
        Self::spawn_on(id, key, SocketAddr::from(([127, 0, 0, 1], 0))).await
    }

    /// Listen on a specific address, e.g. another loopback IP sharing a port
    pub async fn spawn_on(id: &str, key: &str, bind: SocketAddr) -> io::Result<Self> {
        let listener = TcpListener::bind(bind).await?;
        let address = listener.local_addr()?;
        let state = Arc::new(FakeState::default());
        let cipher = Arc::new(
            Cipher::new(key.as_bytes())
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e.to_string()))?,
        );

        let server_state = Arc::clone(&state);
        let server = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, _)) => {
                        server_state.connections.fetch_add(1, Ordering::SeqCst);
                        let state = Arc::clone(&server_state);
                        let cipher = Arc::clone(&cipher);
                        tokio::spawn(async move {
                            if let Err(e) = serve(stream, &cipher, &state).await {
                                debug!("Fake device connection ended: {}", e);
                            }
                        });
                    }
                    Err(e) => {
                        error!("Fake device accept failed: {}", e);
                        return;
                    }
                }
            }
        });

        Ok(Self {
            id: id.to_string(),
            key: key.to_string(),
            address,
            state,
            server,
        })
    }

    /// Descriptor pointing the daemon straight at this device
    pub fn descriptor(&self, name: &str) -> DeviceDescriptor {
        DeviceDescriptor {
            id: self.id.clone(),
            key: self.key.clone(),
            name: name.to_string(),
            address: Some(self.address.to_string()),
        }
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    /// The announcement this device sends on the discovery ports
    pub fn broadcast(&self) -> Broadcast {
        Broadcast {
            gw_id: self.id.clone(),
            ip: self.address.ip().to_string(),
            version: Some("3.3".to_string()),
        }
    }

    pub fn power(&self) -> Option<bool> {
        *self.state.power.lock().unwrap()
    }

    pub fn connections(&self) -> usize {
        self.state.connections.load(Ordering::SeqCst)
    }

    pub fn commands(&self) -> usize {
        self.state.commands.load(Ordering::SeqCst)
    }

    pub fn set_rejecting(&self, rejecting: bool) {
        self.state.rejecting.store(rejecting, Ordering::SeqCst);
    }
}

/// Send every device's announcement to the loopback discovery ports until
/// the returned task is aborted: plain on the first port, encrypted on the
/// second.
pub fn announce(ports: (u16, u16), devices: &[&FakeTuyaDevice]) -> JoinHandle<()> {
    let broadcasts: Vec<Broadcast> = devices.iter().map(|d| d.broadcast()).collect();
    tokio::spawn(async move {
        let socket = match UdpSocket::bind("127.0.0.1:0").await {
            Ok(socket) => socket,
            Err(e) => {
                error!("Announcer could not bind: {}", e);
                return;
            }
        };
        loop {
            for broadcast in &broadcasts {
                for (port, encrypted) in [(ports.0, false), (ports.1, true)] {
                    if let Ok(datagram) = broadcast.to_datagram(encrypted) {
                        let _ = socket.send_to(&datagram, ("127.0.0.1", port)).await;
                    }
                }
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
}

impl Drop for FakeTuyaDevice {
    fn drop(&mut self) {
        self.server.abort();
    }
}

async fn serve(mut stream: TcpStream, cipher: &Cipher, state: &FakeState) -> io::Result<()> {
    loop {
        let request = match tuya::read_frame(&mut stream).await {
            Ok(frame) => frame,
            // the daemon closes the connection after every operation
            Err(_) => return Ok(()),
        };

        match request.command {
            command::CONTROL => {
                state.commands.fetch_add(1, Ordering::SeqCst);

                if state.rejecting.load(Ordering::SeqCst) {
                    let nack =
                        Frame::new(request.seq, command::CONTROL, Vec::new()).with_return_code(1);
                    stream.write_all(&nack.encode()).await?;
                    continue;
                }

                let wanted = tuya::open(cipher, &request)
                    .ok()
                    .flatten()
                    .and_then(|message| message.bool_dps(POWER_DPS));
                let Some(on) = wanted else {
                    let nack =
                        Frame::new(request.seq, command::CONTROL, Vec::new()).with_return_code(2);
                    stream.write_all(&nack.encode()).await?;
                    continue;
                };
                *state.power.lock().unwrap() = Some(on);

                let report = DpsMessage::set_bool("fake", POWER_DPS, on, 0);
                let status = tuya::seal(cipher, 0, command::STATUS, &report)
                    .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?
                    .with_return_code(0);
                stream.write_all(&status.encode()).await?;

                let ack = Frame::new(request.seq, command::CONTROL, Vec::new()).with_return_code(0);
                stream.write_all(&ack.encode()).await?;
            }
            command::HEART_BEAT => {
                let beat =
                    Frame::new(request.seq, command::HEART_BEAT, Vec::new()).with_return_code(0);
                stream.write_all(&beat.encode()).await?;
            }
            other => debug!("Fake device ignoring command {:#x}", other),
        }
    }
}
