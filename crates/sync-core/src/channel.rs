use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{broadcast, mpsc};

use crate::{
    error::{SyncError, SyncErrorCategory},
    store::{ChangeCallback, StoreSnapshot},
    types::{SyncCommand, SyncEvent},
};

/// Broadcast event stream type used by frontend subscribers.
pub type EventStream = broadcast::Receiver<SyncEvent>;

/// Errors returned by sync channel operations.
#[derive(Debug, Error)]
pub enum SyncChannelError {
    /// The command receiver side is closed.
    #[error("command channel is closed")]
    CommandChannelClosed,
}

impl From<SyncChannelError> for SyncError {
    fn from(err: SyncChannelError) -> Self {
        SyncError::new(SyncErrorCategory::Internal, "runtime_stopped", err.to_string())
    }
}

/// Command/event channel pair shared by the runtime and its callers.
#[derive(Clone, Debug)]
pub struct SyncChannels {
    command_tx: mpsc::Sender<SyncCommand>,
    event_tx: broadcast::Sender<SyncEvent>,
}

impl SyncChannels {
    /// Create a new channel set and return it with the command receiver.
    pub fn new(command_buffer: usize, event_buffer: usize) -> (Self, mpsc::Receiver<SyncCommand>) {
        let (command_tx, command_rx) = mpsc::channel(command_buffer.max(1));
        let (event_tx, _) = broadcast::channel(event_buffer.max(1));

        (
            Self {
                command_tx,
                event_tx,
            },
            command_rx,
        )
    }

    pub fn subscribe(&self) -> EventStream {
        self.event_tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.event_tx.receiver_count()
    }

    pub async fn send_command(&self, command: SyncCommand) -> Result<(), SyncChannelError> {
        self.command_tx
            .send(command)
            .await
            .map_err(|_| SyncChannelError::CommandChannelClosed)
    }

    /// Emit an event to all subscribers.
    ///
    /// Emission is best-effort; lagged subscribers are handled by `broadcast`.
    pub fn emit(&self, event: SyncEvent) {
        let _ = self.event_tx.send(event);
    }

    /// Store observer that forwards every snapshot as `StoreChanged`.
    pub fn store_observer(&self) -> ChangeCallback {
        let event_tx = self.event_tx.clone();
        Arc::new(move |snapshot: &StoreSnapshot| {
            let _ = event_tx.send(SyncEvent::StoreChanged(snapshot.clone()));
        })
    }
}
