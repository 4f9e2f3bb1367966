//! [`DeviceClient`] speaking the Tuya 3.3 local protocol over the LAN

use duskswitch_common::tuya::{self, command, Cipher, DpsMessage, DEVICE_PORT};
use duskswitch_common::{tracing, DeviceDescriptor, DeviceError, ProtocolError};
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::device::DeviceClient;
use crate::discovery::Discovery;

pub struct TuyaClient {
    id: String,
    cipher: Cipher,
    configured_address: Option<SocketAddr>,
    /// Address from the last successful find, until a connect to it fails
    address: Option<SocketAddr>,
    discovery: Arc<Discovery>,
    stream: Option<TcpStream>,
    seq: u32,
    errors: mpsc::UnboundedSender<DeviceError>,
    error_receiver: Option<mpsc::UnboundedReceiver<DeviceError>>,
}

impl TuyaClient {
    /// Devices without a configured address are looked up through `discovery`,
    /// which is shared by every client of the fleet.
    pub fn new(
        descriptor: &DeviceDescriptor,
        discovery: Arc<Discovery>,
    ) -> Result<Self, DeviceError> {
        let cipher = Cipher::new(descriptor.key.as_bytes())?;
        let configured_address = descriptor
            .address
            .as_deref()
            .map(parse_address)
            .transpose()?;
        let (errors, error_receiver) = mpsc::unbounded_channel();

        Ok(Self {
            id: descriptor.id.clone(),
            cipher,
            configured_address,
            address: None,
            discovery,
            stream: None,
            seq: 0,
            errors,
            error_receiver: Some(error_receiver),
        })
    }

    fn next_seq(&mut self) -> u32 {
        self.seq = self.seq.wrapping_add(1);
        self.seq
    }
}

#[async_trait::async_trait]
impl DeviceClient for TuyaClient {
    async fn discover(&mut self) -> Result<SocketAddr, DeviceError> {
        if let Some(address) = self.address {
            return Ok(address);
        }
        let address = match self.configured_address {
            Some(address) => address,
            None => self.discovery.find(&self.id).await?,
        };
        self.address = Some(address);
        Ok(address)
    }

    async fn connect(&mut self) -> Result<(), DeviceError> {
        // taken until the connect succeeds, so a failed or cancelled attempt
        // makes the next find look the device up again
        let address = self
            .address
            .take()
            .ok_or_else(|| DeviceError::NotFound(self.id.clone()))?;

        let stream = TcpStream::connect(address).await?;
        stream.set_nodelay(true)?;
        debug!("Connected to {} at {}", self.id, address);

        self.address = Some(address);
        self.stream = Some(stream);
        Ok(())
    }

    async fn set_power(&mut self, dps: u8, on: bool) -> Result<(), DeviceError> {
        let seq = self.next_seq();
        let message = DpsMessage::set_bool(&self.id, dps, on, chrono::Utc::now().timestamp());
        let frame = tuya::seal(&self.cipher, seq, command::CONTROL, &message)?;

        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| DeviceError::NotConnected(self.id.clone()))?;
        stream.write_all(&frame.encode()).await?;

        loop {
            let reply = match tuya::read_frame(stream).await {
                Ok(reply) => reply,
                Err(ProtocolError::Io(e)) if e.kind() == io::ErrorKind::UnexpectedEof => {
                    return Err(DeviceError::ConnectionClosed);
                }
                Err(e) => return Err(e.into()),
            };

            match reply.command {
                command::CONTROL => {
                    return match reply.return_code {
                        None | Some(0) => Ok(()),
                        Some(code) => Err(DeviceError::Rejected(code)),
                    };
                }
                command::STATUS => match tuya::open(&self.cipher, &reply) {
                    Ok(Some(status)) => debug!("{} reported {:?}", self.id, status.dps),
                    Ok(None) => {}
                    Err(e) => {
                        let _ = self.errors.send(e.into());
                    }
                },
                other => trace!("Ignoring command {:#x} from {}", other, self.id),
            }
        }
    }

    async fn disconnect(&mut self) -> Result<(), DeviceError> {
        if let Some(mut stream) = self.stream.take() {
            if let Err(e) = stream.shutdown().await {
                debug!("Shutdown of {} connection failed: {}", self.id, e);
            }
            debug!("Disconnected from {}", self.id);
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    fn take_error_receiver(&mut self) -> Option<mpsc::UnboundedReceiver<DeviceError>> {
        self.error_receiver.take()
    }
}

/// Accepts a bare IP (default device port) or `ip:port`
fn parse_address(address: &str) -> Result<SocketAddr, DeviceError> {
    if let Ok(ip) = address.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, DEVICE_PORT));
    }
    address
        .parse()
        .map_err(|_| DeviceError::InvalidAddress(address.to_string()))
}
