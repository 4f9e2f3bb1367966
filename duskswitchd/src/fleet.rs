use duskswitch_common::{power_label, tracing, DeviceError};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::device::DeviceHandle;
use crate::state_table::DeviceStateTable;

/// Result of one device's switch operation
#[derive(Debug)]
pub struct SwitchOutcome {
    pub device_id: String,
    pub name: String,
    pub state: bool,
    pub result: Result<(), DeviceError>,
}

/// All configured devices and their shared state table
#[derive(Clone)]
pub struct DeviceFleet {
    handles: Arc<Vec<Arc<DeviceHandle>>>,
    table: Arc<RwLock<DeviceStateTable>>,
    outcomes: mpsc::UnboundedSender<SwitchOutcome>,
}

impl DeviceFleet {
    pub fn new(handles: Vec<DeviceHandle>, outcomes: mpsc::UnboundedSender<SwitchOutcome>) -> Self {
        let table = DeviceStateTable::new(handles.iter().map(|h| h.id().to_string()));
        Self {
            handles: Arc::new(handles.into_iter().map(Arc::new).collect()),
            table: Arc::new(RwLock::new(table)),
            outcomes,
        }
    }

    /// Start one switch operation per device, in configuration order.
    ///
    /// Returns once the operations are started. Each finishes independently
    /// and reports to the outcome channel.
    pub fn switch_all(&self, state: bool) -> Vec<JoinHandle<()>> {
        info!("Switching {} devices {}", self.handles.len(), power_label(state));

        self.handles
            .iter()
            .map(|handle| {
                let handle = Arc::clone(handle);
                let table = Arc::clone(&self.table);
                let outcomes = self.outcomes.clone();

                tokio::spawn(async move {
                    let result = handle.switch(state, &table).await;
                    let outcome = SwitchOutcome {
                        device_id: handle.id().to_string(),
                        name: handle.name().to_string(),
                        state,
                        result,
                    };
                    if outcomes.send(outcome).is_err() {
                        debug!("Outcome receiver gone");
                    }
                })
            })
            .collect()
    }

    /// Close every device session, waiting for all of them
    pub async fn disconnect_all(&self) {
        for handle in self.handles.iter() {
            match handle.disconnect().await {
                Ok(()) => debug!("Disconnected {}", handle.descriptor()),
                Err(e) => warn!("Failed to disconnect {}: {}", handle.descriptor(), e),
            }
        }
    }

    pub fn table(&self) -> &Arc<RwLock<DeviceStateTable>> {
        &self.table
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }
}

/// Log every switch outcome until all fleets are dropped
pub fn spawn_supervisor(mut outcomes: mpsc::UnboundedReceiver<SwitchOutcome>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(outcome) = outcomes.recv().await {
            match outcome.result {
                Ok(()) => debug!(
                    "{} ({}) is now {}",
                    outcome.name,
                    outcome.device_id,
                    power_label(outcome.state)
                ),
                Err(e) => error!(
                    "Failed to turn {} {} ({}): {}",
                    power_label(outcome.state),
                    outcome.name,
                    outcome.device_id,
                    e
                ),
            }
        }
    })
}
