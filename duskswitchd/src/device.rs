use duskswitch_common::tuya::POWER_DPS;
use duskswitch_common::{power_label, tracing, DeviceDescriptor, DeviceError};
use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::state_table::DeviceStateTable;

/// Connection primitives for one networked device
#[async_trait::async_trait]
pub trait DeviceClient: Send + Sync {
    /// Locate the device on the network
    async fn discover(&mut self) -> Result<SocketAddr, DeviceError>;
    async fn connect(&mut self) -> Result<(), DeviceError>;
    async fn set_power(&mut self, dps: u8, on: bool) -> Result<(), DeviceError>;
    /// Close the session. Must succeed when nothing is connected.
    async fn disconnect(&mut self) -> Result<(), DeviceError>;
    fn is_connected(&self) -> bool;
    /// Errors the client notices outside of a call. Can be taken once.
    fn take_error_receiver(&mut self) -> Option<mpsc::UnboundedReceiver<DeviceError>>;
}

/// One configured device and its client.
///
/// Switch operations on the same handle run one at a time.
pub struct DeviceHandle {
    descriptor: DeviceDescriptor,
    client: Mutex<Box<dyn DeviceClient>>,
    step_timeout: Duration,
    error_listener: Option<JoinHandle<()>>,
}

impl DeviceHandle {
    /// Wrap a client. The client's error channel is subscribed here, once.
    pub fn new(
        descriptor: DeviceDescriptor,
        mut client: Box<dyn DeviceClient>,
        step_timeout: Duration,
    ) -> Self {
        let error_listener = client.take_error_receiver().map(|mut errors| {
            let name = descriptor.name.clone();
            tokio::spawn(async move {
                while let Some(e) = errors.recv().await {
                    warn!("Device {} reported an error: {}", name, e);
                }
            })
        });

        Self {
            descriptor,
            client: Mutex::new(client),
            step_timeout,
            error_listener,
        }
    }

    pub fn id(&self) -> &str {
        &self.descriptor.id
    }

    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    pub fn descriptor(&self) -> &DeviceDescriptor {
        &self.descriptor
    }

    /// Drive the device to `state`: find, connect, set, record, disconnect.
    ///
    /// Runs at most once and never retries. On failure the table keeps its
    /// previous value and a best-effort disconnect is attempted.
    pub async fn switch(
        &self,
        state: bool,
        table: &RwLock<DeviceStateTable>,
    ) -> Result<(), DeviceError> {
        let mut client = self.client.lock().await;

        let result = async {
            let address = self.step("find", client.discover()).await?;
            debug!("Found {} at {}", self.descriptor, address);

            self.step("connect", client.connect()).await?;
            info!("Changing: {} to {}", self.descriptor.name, power_label(state));
            self.step("set", client.set_power(POWER_DPS, state)).await?;

            if !table.write().await.record(&self.descriptor.id, state) {
                warn!("{} has no entry in the state table, not recorded", self.descriptor);
            }
            self.step("disconnect", client.disconnect()).await
        }
        .await;

        if result.is_err() && client.is_connected() {
            if let Err(e) = self.step("disconnect", client.disconnect()).await {
                debug!("Cleanup disconnect of {} failed: {}", self.descriptor, e);
            }
        }
        result
    }

    /// Close any open session
    pub async fn disconnect(&self) -> Result<(), DeviceError> {
        let mut client = self.client.lock().await;
        self.step("disconnect", client.disconnect()).await
    }

    async fn step<T, F>(&self, step: &'static str, fut: F) -> Result<T, DeviceError>
    where
        F: Future<Output = Result<T, DeviceError>>,
    {
        tokio::time::timeout(self.step_timeout, fut)
            .await
            .map_err(|_| DeviceError::Timeout {
                step,
                after_ms: self.step_timeout.as_millis() as u64,
            })?
    }
}

impl Drop for DeviceHandle {
    fn drop(&mut self) {
        if let Some(listener) = self.error_listener.take() {
            listener.abort();
        }
    }
}
