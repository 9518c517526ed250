//! Executor half of the input suspension sub-protocol.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::debug;

use crate::protocol::{ExecutorMessage, Outbox};
use crate::runtime::{InputError, InputPort};

/// Holds the sender of the one outstanding input request.
///
/// Running code awaits [`InputPort::request_input`]; the message loop calls
/// [`InputBridge::resolve`] when the matching `input_response` arrives.
#[derive(Clone)]
pub struct InputBridge {
    outbox: Outbox,
    pending: Arc<Mutex<Option<oneshot::Sender<String>>>>,
}

impl InputBridge {
    pub fn new(outbox: Outbox) -> Self {
        Self { outbox, pending: Arc::new(Mutex::new(None)) }
    }

    pub fn is_pending(&self) -> bool {
        self.pending.lock().as_ref().is_some_and(|tx| !tx.is_closed())
    }

    /// Hand `input` to the suspended code. Returns false when nothing was
    /// waiting for it.
    pub fn resolve(&self, input: String) -> bool {
        match self.pending.lock().take() {
            Some(tx) => tx.send(input).is_ok(),
            None => false,
        }
    }

    /// Drop any outstanding request; its awaiter sees `Cancelled`.
    pub fn cancel(&self) {
        self.pending.lock().take();
    }
}

#[async_trait]
impl InputPort for InputBridge {
    async fn request_input(&self, prompt: &str) -> Result<String, InputError> {
        let rx = {
            let mut slot = self.pending.lock();
            if slot.as_ref().is_some_and(|tx| !tx.is_closed()) {
                return Err(InputError::AlreadyPending);
            }
            let (tx, rx) = oneshot::channel();
            *slot = Some(tx);
            rx
        };
        debug!(prompt, "suspending for input");
        let request = ExecutorMessage::InputRequired { prompt: prompt.to_string() };
        if self.outbox.send(&request).is_err() {
            self.cancel();
            return Err(InputError::Cancelled);
        }
        rx.await.map_err(|_| InputError::Cancelled)
    }
}
