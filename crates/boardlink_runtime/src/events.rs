use serde::Serialize;
use tokio::sync::mpsc;

/// Lifecycle notifications of a single board.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoardEvent {
    Connected,
    Ready,
    Released,
}

/// Notifications delivered to the host runtime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HostEvent {
    PeripheralConnected {
        name: String,
        path: String,
    },
    PeripheralDisconnected {
        name: String,
        path: String,
    },
    PeripheralConnectionLostError {
        message: String,
        #[serde(rename = "extensionId")]
        extension_id: String,
    },
}

/// Outbound side of the host event channel.
#[derive(Debug, Clone, Default)]
pub struct HostNotifier {
    tx: Option<mpsc::UnboundedSender<HostEvent>>,
}

impl HostNotifier {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<HostEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx: Some(tx) }, rx)
    }

    /// A notifier that drops every event.
    pub fn detached() -> Self {
        Self { tx: None }
    }

    pub fn notify(&self, event: HostEvent) {
        let Some(tx) = &self.tx else {
            return;
        };
        if let Err(err) = tx.send(event) {
            log::debug!("host is no longer listening, dropped {:?}", err.0);
        }
    }
}
