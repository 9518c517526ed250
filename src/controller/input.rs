//! Controller half of the input suspension sub-protocol.
//!
//! When running code asks for input, the request is answered from the
//! pre-queued values first, then by the registered callback. With neither,
//! an empty string is sent so the code never hangs on a missing answer.

use std::sync::{Arc, Weak};

use tracing::{debug, warn};

use super::{Controller, Inner, PendingOperation};
use crate::error::{Error, Result};
use crate::protocol::ControllerMessage;

/// Invoked on the controller's dispatcher task; must not block. Answer
/// through [`InputRequest::respond`], possibly from another task.
pub type InputCallback = Arc<dyn Fn(InputRequest) + Send + Sync>;

/// One outstanding request for input.
pub struct InputRequest {
    pub prompt: String,
    responder: InputResponder,
}

impl InputRequest {
    pub fn respond(self, value: impl Into<String>) -> Result<()> {
        self.responder.respond(value)
    }

    pub fn into_responder(self) -> InputResponder {
        self.responder
    }
}

/// Sends the answer for a pending input request.
pub struct InputResponder {
    inner: Weak<Inner>,
}

impl InputResponder {
    pub fn respond(self, value: impl Into<String>) -> Result<()> {
        let inner = self.inner.upgrade().ok_or(Error::Destroyed)?;
        inner.provide_input(value.into())
    }
}

impl Inner {
    pub(super) fn on_input_required(self: &Arc<Self>, prompt: String) {
        enum Answer {
            Queued(String),
            Callback(InputCallback),
            Empty,
        }
        let answer = {
            let mut state = self.state.lock();
            if state.pending == PendingOperation::Executing {
                state.pending = PendingOperation::AwaitingInput;
            }
            state.input_prompt = Some(prompt.clone());
            if let Some(value) = state.input_queue.pop_front() {
                Answer::Queued(value)
            } else if let Some(callback) = &state.input_callback {
                Answer::Callback(Arc::clone(callback))
            } else {
                Answer::Empty
            }
        };

        let outcome = match answer {
            Answer::Queued(value) => {
                debug!(%prompt, "answering input request from queue");
                self.provide_input(value)
            }
            Answer::Callback(callback) => {
                let responder = InputResponder { inner: Arc::downgrade(self) };
                callback(InputRequest { prompt, responder });
                Ok(())
            }
            Answer::Empty => {
                warn!(%prompt, "input requested but no queued value or callback; sending empty string");
                self.provide_input(String::new())
            }
        };
        if let Err(err) = outcome {
            warn!(error = %err, "failed to answer input request");
        }
    }

    pub(super) fn provide_input(&self, value: String) -> Result<()> {
        {
            let mut state = self.state.lock();
            if state.input_prompt.is_none() {
                return Err(Error::NoPendingInput);
            }
            state.input_prompt = None;
            if state.pending == PendingOperation::AwaitingInput {
                state.pending = PendingOperation::Executing;
            }
        }
        self.send(&ControllerMessage::InputResponse { input: value })
    }
}

impl Controller {
    /// Answer the pending input request.
    pub fn provide_input(&self, value: impl Into<String>) -> Result<()> {
        self.inner.provide_input(value.into())
    }

    /// Queue a value that answers a future input request automatically.
    /// Queued values are consumed first-in, first-out, ahead of the callback.
    pub fn queue_input(&self, value: impl Into<String>) {
        self.inner.state.lock().input_queue.push_back(value.into());
    }

    pub fn queued_inputs(&self) -> usize {
        self.inner.state.lock().input_queue.len()
    }

    pub fn set_input_callback<F>(&self, callback: F)
    where
        F: Fn(InputRequest) + Send + Sync + 'static,
    {
        self.inner.state.lock().input_callback = Some(Arc::new(callback));
    }

    pub fn clear_input_callback(&self) {
        self.inner.state.lock().input_callback = None;
    }

    pub fn is_waiting_for_input(&self) -> bool {
        self.inner.state.lock().input_prompt.is_some()
    }

    pub fn current_prompt(&self) -> Option<String> {
        self.inner.state.lock().input_prompt.clone()
    }
}
