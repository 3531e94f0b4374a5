use crate::iodev::DeviceId;
use crate::iodev::list::DeviceList;
use std::sync::Arc;
use tokio::sync::mpsc::{Receiver, Sender, channel};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceEvent {
    Enabled(DeviceId),
    Disabled(DeviceId),
    /// The device's transport started (`true`) or stopped.
    Started(DeviceId, bool),
}

async fn pump(list: Arc<DeviceList>, mut rx: Receiver<DeviceEvent>) {
    while let Some(event) = rx.recv().await {
        debug!("device event {event:?}");
        match event {
            DeviceEvent::Enabled(id) => {
                if !list.enable(id) {
                    warn!("enable of unknown device {id} ignored");
                }
            }
            DeviceEvent::Disabled(id) => {
                list.disable(id);
            }
            DeviceEvent::Started(id, started) => list.set_device_started(id, started),
        }
    }
    debug!("device event pump stopped");
}

/// Applies device events to `list` from a tokio task. The task ends once
/// every sender is dropped.
pub fn spawn_event_pump(list: Arc<DeviceList>) -> (Sender<DeviceEvent>, JoinHandle<()>) {
    let (tx, rx) = channel::<DeviceEvent>(32);
    let handle = tokio::spawn(pump(list, rx));
    (tx, handle)
}
