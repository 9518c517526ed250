//! One-way asynchronous message channel between two endpoints.
//!
//! Each direction is an unbounded, order-preserving tokio queue of JSON
//! values. Nothing else is shared between the endpoints.

use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("channel closed")]
    Closed,
    #[error("message is not JSON-compatible: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Sending half. Cheap to clone.
#[derive(Debug, Clone)]
pub struct Outbox {
    tx: mpsc::UnboundedSender<Value>,
}

impl Outbox {
    pub fn send<M: Serialize>(&self, message: &M) -> Result<(), ChannelError> {
        let value = serde_json::to_value(message)?;
        self.send_value(value)
    }

    pub fn send_value(&self, value: Value) -> Result<(), ChannelError> {
        self.tx.send(value).map_err(|_| ChannelError::Closed)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Receiving half.
#[derive(Debug)]
pub struct Inbox {
    rx: mpsc::UnboundedReceiver<Value>,
}

impl Inbox {
    /// Next message, or `None` once every matching [`Outbox`] is dropped.
    pub async fn recv(&mut self) -> Option<Value> {
        self.rx.recv().await
    }
}

/// One side of the channel.
#[derive(Debug)]
pub struct Endpoint {
    pub outbox: Outbox,
    pub inbox: Inbox,
}

/// Create a connected pair: what one endpoint sends, the other receives.
pub fn pair() -> (Endpoint, Endpoint) {
    let (a_tx, a_rx) = mpsc::unbounded_channel();
    let (b_tx, b_rx) = mpsc::unbounded_channel();
    (
        Endpoint { outbox: Outbox { tx: a_tx }, inbox: Inbox { rx: b_rx } },
        Endpoint { outbox: Outbox { tx: b_tx }, inbox: Inbox { rx: a_rx } },
    )
}
