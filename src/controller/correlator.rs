//! Turns "send, eventually receive" into one awaitable call.
//!
//! The dispatcher always runs the controller's base handler first. Terminal
//! messages are then offered to the single interceptor slot, which claims a
//! reply only when both its sub-protocol and its request id match. A plain
//! `error` reply is claimed by either sub-protocol. Whatever
//! is not claimed (late replies after a timeout, fire-and-forget results) is
//! handed back to the dispatcher.

use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::error::Error;
use crate::execution::ExecutionResult;
use crate::protocol::FsOutcome;

/// Sub-protocol a correlated call waits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Terminal {
    Execution,
    Filesystem,
}

/// Terminal message in the form the waiting call consumes.
#[derive(Debug)]
pub(crate) enum Reply {
    Executed(ExecutionResult),
    Rejected(String),
    Fs(FsOutcome),
    FsFailed(String),
}

impl Reply {
    pub(crate) fn terminal(&self) -> Terminal {
        match self {
            Reply::Executed(_) | Reply::Rejected(_) => Terminal::Execution,
            Reply::Fs(_) | Reply::FsFailed(_) => Terminal::Filesystem,
        }
    }
}

struct Interceptor {
    request_id: u64,
    terminal: Terminal,
    tx: oneshot::Sender<Reply>,
}

impl Interceptor {
    /// A plain `error` reply ends a call of either sub-protocol.
    fn accepts(&self, reply: &Reply) -> bool {
        matches!(reply, Reply::Rejected(_)) || reply.terminal() == self.terminal
    }
}

#[derive(Default)]
pub(crate) struct Correlator {
    slot: Mutex<Option<Interceptor>>,
}

impl Correlator {
    /// Claim the slot for `request_id`.
    pub(crate) fn install(&self, request_id: u64, terminal: Terminal) -> Result<Waiter<'_>, Error> {
        let mut slot = self.slot.lock();
        if let Some(current) = slot.as_ref() {
            return Err(Error::Busy {
                pending: match current.terminal {
                    Terminal::Execution => "execution",
                    Terminal::Filesystem => "filesystem",
                },
            });
        }
        let (tx, rx) = oneshot::channel();
        *slot = Some(Interceptor { request_id, terminal, tx });
        Ok(Waiter { correlator: self, request_id, rx })
    }

    /// Deliver `reply` to the interceptor if it belongs to it. Unclaimed
    /// replies are returned.
    pub(crate) fn offer(&self, request_id: Option<u64>, reply: Reply) -> Option<Reply> {
        let interceptor = {
            let mut slot = self.slot.lock();
            let claims = slot
                .as_ref()
                .is_some_and(|i| i.accepts(&reply) && request_id == Some(i.request_id));
            if !claims {
                return Some(reply);
            }
            slot.take()
        };
        match interceptor {
            Some(interceptor) => interceptor.tx.send(reply).err(),
            None => Some(reply),
        }
    }

    /// Remove the interceptor for `request_id`, if it is still installed.
    pub(crate) fn release(&self, request_id: u64) -> bool {
        let mut slot = self.slot.lock();
        if slot.as_ref().is_some_and(|i| i.request_id == request_id) {
            slot.take();
            true
        } else {
            false
        }
    }

    /// Drop any interceptor; its waiter fails with `ChannelClosed`.
    pub(crate) fn clear(&self) {
        self.slot.lock().take();
    }

    #[cfg(test)]
    pub(crate) fn is_idle(&self) -> bool {
        self.slot.lock().is_none()
    }
}

/// Pending side of a correlated call. Dropping it releases the slot.
pub(crate) struct Waiter<'a> {
    correlator: &'a Correlator,
    request_id: u64,
    rx: oneshot::Receiver<Reply>,
}

impl Waiter<'_> {
    pub(crate) async fn wait(mut self, limit: Duration, operation: &'static str) -> Result<Reply, Error> {
        match tokio::time::timeout(limit, &mut self.rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(Error::ChannelClosed),
            Err(_) => {
                self.correlator.release(self.request_id);
                // The reply may have landed between the deadline and the release.
                self.rx
                    .try_recv()
                    .map_err(|_| Error::Timeout { operation, after: limit })
            }
        }
    }
}

impl Drop for Waiter<'_> {
    fn drop(&mut self) {
        self.correlator.release(self.request_id);
    }
}
