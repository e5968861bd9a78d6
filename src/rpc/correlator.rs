use std::collections::BTreeMap;
use std::fmt::{Debug, Formatter};
use std::sync::Arc;

use bytes::Bytes;
use rustc_hash::FxHashMap;
use tokio::sync::oneshot;
use tracing::debug;

use crate::codec::envelope::MessageId;
use crate::config::EngineConfig;
use crate::error::{RpcFailure, RpcResult};
use crate::rpc::RpcOutcome;

/// Identifies a call across retries, i.e. independently of the message id it is currently sent
///  under
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct CallId(pub u64);

pub type Completion = oneshot::Sender<RpcResult<RpcOutcome>>;

/// A call that was submitted and not yet answered
pub struct PendingCall {
    pub call_id: CallId,
    pub body: Bytes,
    pub internal_retries: u32,
    completion: Completion,
}

impl Debug for PendingCall {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "PendingCall{{{:?} len={}}}", self.call_id, self.body.len())
    }
}

impl PendingCall {
    pub fn new(call_id: CallId, body: Bytes, completion: Completion) -> PendingCall {
        PendingCall {
            call_id,
            body,
            internal_retries: 0,
            completion,
        }
    }

    /// A caller that gave up waiting is not an error
    pub fn complete(self, result: RpcResult<RpcOutcome>) {
        let _ = self.completion.send(result);
    }
}

/// Records that a message id is void: replies to it are discarded. If the request was re-sent,
///  `replacement` holds the new id and sequence number.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct DropResponseContext {
    pub drop_message_id: MessageId,
    pub replacement: Option<(MessageId, i32)>,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ResolveOutcome {
    Resolved,
    /// the reply refers to a message id that was dropped or superseded by a retry
    Stale,
    Unknown,
}

/// Maps outstanding requests' message ids to their callers. Every call is completed at most
///  once: resolving removes it.
pub struct RpcCorrelator {
    config: Arc<EngineConfig>,
    pending: FxHashMap<MessageId, PendingCall>,
    by_call: FxHashMap<CallId, MessageId>,
    dropped: BTreeMap<MessageId, DropResponseContext>,
    /// ids of our own `rpc_drop_answer` requests, mapped to the request whose answer they drop.
    ///  The server's answers to them are consumed.
    drop_requests: BTreeMap<MessageId, MessageId>,
}

impl RpcCorrelator {
    pub fn new(config: Arc<EngineConfig>) -> RpcCorrelator {
        RpcCorrelator {
            config,
            pending: Default::default(),
            by_call: Default::default(),
            dropped: Default::default(),
            drop_requests: Default::default(),
        }
    }

    pub fn register(&mut self, message_id: MessageId, call: PendingCall) {
        self.by_call.insert(call.call_id, message_id);
        self.pending.insert(message_id, call);
    }

    pub fn num_pending(&self) -> usize {
        self.pending.len()
    }

    pub fn is_pending(&self, message_id: MessageId) -> bool {
        self.pending.contains_key(&message_id)
    }

    pub fn message_id_of(&self, call_id: CallId) -> Option<MessageId> {
        self.by_call.get(&call_id).copied()
    }

    /// Removes a call without completing it, e.g. to retry it later
    pub fn take(&mut self, message_id: MessageId) -> Option<PendingCall> {
        let call = self.pending.remove(&message_id)?;
        self.by_call.remove(&call.call_id);
        Some(call)
    }

    pub fn resolve(&mut self, message_id: MessageId, result: RpcResult<RpcOutcome>) -> ResolveOutcome {
        match self.take(message_id) {
            Some(call) => {
                call.complete(result);
                ResolveOutcome::Resolved
            }
            None if self.dropped.contains_key(&message_id) => {
                debug!(msg_id = ?message_id, "discarding reply for dropped request");
                ResolveOutcome::Stale
            }
            None => {
                debug!(msg_id = ?message_id, "reply for unknown request - ignoring");
                ResolveOutcome::Unknown
            }
        }
    }

    pub fn record_drop(&mut self, context: DropResponseContext) {
        debug!(msg_id = ?context.drop_message_id, replacement = ?context.replacement, "dropping response context");
        self.dropped.insert(context.drop_message_id, context);
        while self.dropped.len() > self.config.max_pending_messages {
            self.dropped.pop_first();
        }
    }

    pub fn drop_context(&self, message_id: MessageId) -> Option<&DropResponseContext> {
        self.dropped.get(&message_id)
    }

    /// Moves a call that is re-sent under a new id. A late reply to the old id is discarded.
    pub fn rebind(&mut self, old_id: MessageId, new_id: MessageId, new_seq_no: i32, call: PendingCall) {
        self.record_drop(DropResponseContext {
            drop_message_id: old_id,
            replacement: Some((new_id, new_seq_no)),
        });
        self.register(new_id, call);
    }

    /// Removes a cancelled call, returning the message id it was sent under
    pub fn cancel(&mut self, call_id: CallId) -> Option<(MessageId, PendingCall)> {
        let message_id = self.message_id_of(call_id)?;
        let call = self.take(message_id)?;
        self.record_drop(DropResponseContext {
            drop_message_id: message_id,
            replacement: None,
        });
        Some((message_id, call))
    }

    pub fn register_drop_request(&mut self, message_id: MessageId, request_message_id: MessageId) {
        self.drop_requests.insert(message_id, request_message_id);
        while self.drop_requests.len() > self.config.max_pending_messages {
            self.drop_requests.pop_first();
        }
    }

    /// true (once) if the id is that of one of our `rpc_drop_answer` requests
    pub fn take_drop_request(&mut self, message_id: MessageId) -> bool {
        self.drop_requests.remove(&message_id).is_some()
    }

    /// The request a pending `rpc_drop_answer` refers to, if `message_id` is one of ours
    pub fn drop_request_target(&self, message_id: MessageId) -> Option<MessageId> {
        self.drop_requests.get(&message_id).copied()
    }

    /// Fails all outstanding calls, e.g. on session reset
    pub fn fail_all(&mut self, failure: RpcFailure) {
        self.by_call.clear();
        for (_, call) in self.pending.drain() {
            call.complete(Err(failure.clone()));
        }
    }
}
