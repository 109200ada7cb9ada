//! Matching of inbound replies to the one call a client has outstanding.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::oneshot;
use uuid::Uuid;

use crate::error::CallError;

/// What the registry did with an inbound reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyMatch {
    /// Handed to the waiting caller.
    Delivered,
    /// No outstanding call with this correlation id; dropped.
    Mismatched,
    /// The outstanding call already received its reply; dropped.
    Duplicate,
}

struct ActiveCall {
    correlation_id: String,
    reply: Option<oneshot::Sender<Vec<u8>>>,
}

type Slot = Arc<Mutex<Option<ActiveCall>>>;

fn lock(slot: &Slot) -> MutexGuard<'_, Option<ActiveCall>> {
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Tracks the single outstanding call of one client.
///
/// Cloning yields a handle to the same slot, so the reply receiver task and
/// the calling side share one registry.
#[derive(Clone, Default)]
pub struct CorrelationRegistry {
    slot: Slot,
}

impl CorrelationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens a call under a fresh correlation id.
    ///
    /// Fails with [`CallError::CallInProgress`] while another call is pending.
    pub fn begin_call(&self) -> Result<PendingCall, CallError> {
        let mut active = lock(&self.slot);
        if let Some(call) = active.as_ref() {
            return Err(CallError::CallInProgress(call.correlation_id.clone()));
        }

        let correlation_id = Uuid::new_v4().to_string();
        let (sender, receiver) = oneshot::channel();
        *active = Some(ActiveCall {
            correlation_id: correlation_id.clone(),
            reply: Some(sender),
        });

        Ok(PendingCall {
            correlation_id,
            reply: receiver,
            slot: Arc::clone(&self.slot),
        })
    }

    /// Offers a reply body to the pending call.
    ///
    /// Never blocks. The pending record itself is cleared by the waiter.
    pub fn on_message(&self, correlation_id: Option<&str>, body: Vec<u8>) -> ReplyMatch {
        let mut active = lock(&self.slot);
        let call = match active.as_mut() {
            Some(call) if Some(call.correlation_id.as_str()) == correlation_id => call,
            other => {
                log::warn!(
                    "Discarding reply with mismatched correlation id: expected {:?}, got {:?}",
                    other.map(|call| call.correlation_id.as_str()),
                    correlation_id
                );
                return ReplyMatch::Mismatched;
            }
        };

        match call.reply.take() {
            Some(sender) => {
                if sender.send(body).is_err() {
                    // Waiter gave up between our check and the send
                    log::debug!(
                        "Reply for {} arrived as its caller stopped waiting",
                        call.correlation_id
                    );
                }
                ReplyMatch::Delivered
            }
            None => {
                log::warn!("Discarding duplicate reply for {}", call.correlation_id);
                ReplyMatch::Duplicate
            }
        }
    }

    /// Correlation id of the outstanding call, if any.
    pub fn pending(&self) -> Option<String> {
        lock(&self.slot)
            .as_ref()
            .map(|call| call.correlation_id.clone())
    }
}

/// One outstanding call. Dropping it releases the registry for the next call.
pub struct PendingCall {
    correlation_id: String,
    reply: oneshot::Receiver<Vec<u8>>,
    slot: Slot,
}

impl PendingCall {
    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    /// Waits for the matching reply body.
    ///
    /// On timeout the call is cleared, so a late reply for it counts as a
    /// mismatch rather than landing in a later call.
    pub async fn await_reply(mut self, timeout: Duration) -> Result<Vec<u8>, CallError> {
        match tokio::time::timeout(timeout, &mut self.reply).await {
            Ok(Ok(body)) => Ok(body),
            Ok(Err(_)) => Err(CallError::ReplyChannelClosed),
            Err(_) => Err(CallError::TimedOut(timeout)),
        }
    }
}

impl Drop for PendingCall {
    fn drop(&mut self) {
        let mut active = lock(&self.slot);
        if active
            .as_ref()
            .is_some_and(|call| call.correlation_id == self.correlation_id)
        {
            *active = None;
        }
    }
}
