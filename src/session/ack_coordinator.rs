use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use rustc_hash::FxHashMap;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::codec::envelope::{MessageEnvelope, MessageId};
use crate::config::EngineConfig;

/// Lifecycle of a content-related message we sent: `Pending -> Acked`,
///  `Pending -> Resent -> Acked` or `Pending -> Dropped`. Terminal states are reported to the
///  caller and then forgotten.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum DeliveryState {
    Pending,
    Resent,
    Acked,
    Dropped,
}

struct OutgoingMessage {
    envelope: MessageEnvelope,
    state: DeliveryState,
    /// messages that are pointless to repeat on a new connection (e.g. pings) are discarded
    ///  instead of being resent after a reconnect
    resend_after_reconnect: bool,
}

#[derive(Debug, Eq, PartialEq)]
pub struct PendingLimitExceeded;

/// Tracks both directions of acknowledgement for a session: our messages that the peer has not
///  confirmed yet (for resending), and the peer's messages we still owe an ack for.
pub struct AckCoordinator {
    config: Arc<EngineConfig>,
    pending: BTreeMap<MessageId, OutgoingMessage>,
    /// container id -> ids of the messages it carried, for notifications referring to a container
    containers: FxHashMap<MessageId, Vec<MessageId>>,
    ack_debt: BTreeSet<MessageId>,
    ack_debt_since: Option<Instant>,
}

impl AckCoordinator {
    pub fn new(config: Arc<EngineConfig>) -> AckCoordinator {
        AckCoordinator {
            config,
            pending: Default::default(),
            containers: Default::default(),
            ack_debt: Default::default(),
            ack_debt_since: None,
        }
    }

    /// Registers a message that was just sent. Only content-related messages are tracked.
    pub fn on_sent(&mut self, envelope: &MessageEnvelope, resend_after_reconnect: bool) -> Result<(), PendingLimitExceeded> {
        if !envelope.is_content_related() {
            return Ok(());
        }
        self.pending.insert(envelope.message_id, OutgoingMessage {
            envelope: envelope.clone(),
            state: DeliveryState::Pending,
            resend_after_reconnect,
        });
        if self.pending.len() > self.config.max_pending_messages {
            return Err(PendingLimitExceeded);
        }
        Ok(())
    }

    pub fn on_container_sent(&mut self, container_id: MessageId, inner: Vec<MessageId>) {
        self.containers.insert(container_id, inner);
        if self.containers.len() > self.config.max_pending_messages {
            let pending = &self.pending;
            self.containers.retain(|_, ids| ids.iter().any(|id| pending.contains_key(id)));
        }
    }

    /// the ids of the messages carried by a container, or the id itself if it is not a container
    pub fn expand_container(&self, message_id: MessageId) -> Vec<MessageId> {
        self.containers.get(&message_id)
            .cloned()
            .unwrap_or_else(|| vec![message_id])
    }

    pub fn state_of(&self, message_id: MessageId) -> Option<DeliveryState> {
        self.pending.get(&message_id)
            .map(|m| m.state)
    }

    pub fn num_pending(&self) -> usize {
        self.pending.len()
    }

    /// Returns the ids that transitioned to [DeliveryState::Acked]. Acks for unknown or already
    ///  acknowledged ids are ignored.
    pub fn on_ack(&mut self, message_ids: &[MessageId]) -> Vec<MessageId> {
        let mut result = Vec::new();
        for id in message_ids {
            if self.pending.remove(id).is_some() {
                trace!(msg_id = ?id, "acked");
                result.push(*id);
            }
        }
        result
    }

    /// Returns the envelopes to retransmit verbatim for the requested ids that are still
    ///  pending, marking them as resent.
    pub fn on_resend_request(&mut self, message_ids: &[MessageId]) -> Vec<MessageEnvelope> {
        let mut result = Vec::new();
        for id in message_ids {
            match self.pending.get_mut(id) {
                Some(msg) => {
                    msg.state = DeliveryState::Resent;
                    result.push(msg.envelope.clone());
                }
                None => debug!(msg_id = ?id, "resend requested for message that is not pending - ignoring"),
            }
        }
        result
    }

    /// Removes a message from the pending set without it having been acknowledged. Returns
    ///  true if it was pending.
    pub fn drop_message(&mut self, message_id: MessageId) -> bool {
        match self.pending.remove(&message_id) {
            Some(_) => {
                debug!(msg_id = ?message_id, state = ?DeliveryState::Dropped, "dropped pending message");
                true
            }
            None => false,
        }
    }

    /// Removes a pending message so it can be re-sent under a new id
    pub fn take(&mut self, message_id: MessageId) -> Option<MessageEnvelope> {
        self.pending.remove(&message_id)
            .map(|m| m.envelope)
    }

    /// ids of all pending messages older than the given id
    pub fn pending_before(&self, message_id: MessageId) -> Vec<MessageId> {
        self.pending.range(..message_id)
            .map(|(id, _)| *id)
            .collect()
    }

    /// Called when a new connection is established for the session: everything still pending
    ///  is sent again verbatim, except for messages that make no sense to repeat.
    pub fn on_reconnect(&mut self) -> Vec<MessageEnvelope> {
        self.pending.retain(|_, m| m.resend_after_reconnect);
        self.pending.values_mut()
            .map(|m| {
                m.state = DeliveryState::Resent;
                m.envelope.clone()
            })
            .collect()
    }

    pub fn add_ack_debt(&mut self, message_id: MessageId, now: Instant) {
        if self.ack_debt.insert(message_id) && self.ack_debt_since.is_none() {
            self.ack_debt_since = Some(now);
        }
    }

    pub fn has_ack_debt(&self) -> bool {
        !self.ack_debt.is_empty()
    }

    pub fn should_flush_acks_now(&self) -> bool {
        self.ack_debt.len() >= self.config.ack_flush_threshold
    }

    /// when the debounce delay for the oldest unacknowledged incoming message expires
    pub fn ack_flush_deadline(&self) -> Option<Instant> {
        self.ack_debt_since
            .map(|since| since + self.config.ack_debounce_delay)
    }

    pub fn take_ack_debt(&mut self) -> Vec<MessageId> {
        self.ack_debt_since = None;
        std::mem::take(&mut self.ack_debt)
            .into_iter()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;
    use bytes::Bytes;
    use rstest::rstest;
    use super::*;

    fn envelope(id: i64, seq_no: i32) -> MessageEnvelope {
        MessageEnvelope {
            message_id: MessageId(id),
            seq_no,
            body: Bytes::from(id.to_le_bytes().to_vec()),
        }
    }

    fn coordinator() -> AckCoordinator {
        let mut config = EngineConfig::new();
        config.max_pending_messages = 4;
        config.ack_flush_threshold = 3;
        config.ack_debounce_delay = Duration::from_millis(150);
        AckCoordinator::new(Arc::new(config))
    }

    fn ids(raw: &[i64]) -> Vec<MessageId> {
        raw.iter().map(|&id| MessageId(id)).collect()
    }

    #[test]
    fn test_only_content_related_is_pending() {
        let mut acks = coordinator();
        acks.on_sent(&envelope(100, 1), true).unwrap();
        acks.on_sent(&envelope(104, 2), true).unwrap();
        assert_eq!(acks.state_of(MessageId(100)), Some(DeliveryState::Pending));
        assert_eq!(acks.state_of(MessageId(104)), None);
    }

    #[test]
    fn test_resend_exactly_requested() {
        let mut acks = coordinator();
        acks.on_sent(&envelope(100, 1), true).unwrap();
        acks.on_sent(&envelope(105, 3), true).unwrap();

        let resent = acks.on_resend_request(&ids(&[100]));
        assert_eq!(resent, vec![envelope(100, 1)]);
        assert_eq!(acks.state_of(MessageId(100)), Some(DeliveryState::Resent));
        assert_eq!(acks.state_of(MessageId(105)), Some(DeliveryState::Pending));
    }

    #[test]
    fn test_resend_of_acked_is_noop() {
        let mut acks = coordinator();
        acks.on_sent(&envelope(100, 1), true).unwrap();
        assert_eq!(acks.on_ack(&ids(&[100])), ids(&[100]));
        assert!(acks.on_resend_request(&ids(&[100])).is_empty());
        assert!(acks.on_ack(&ids(&[100])).is_empty());
    }

    #[rstest]
    #[case::pending(false)]
    #[case::resent(true)]
    fn test_ack_is_terminal(#[case] resend_first: bool) {
        let mut acks = coordinator();
        acks.on_sent(&envelope(100, 1), true).unwrap();
        if resend_first {
            acks.on_resend_request(&ids(&[100]));
        }
        assert_eq!(acks.on_ack(&ids(&[100, 200])), ids(&[100]));
        assert_eq!(acks.state_of(MessageId(100)), None);
        assert_eq!(acks.num_pending(), 0);
    }

    #[test]
    fn test_drop() {
        let mut acks = coordinator();
        acks.on_sent(&envelope(100, 1), true).unwrap();
        assert!(acks.drop_message(MessageId(100)));
        assert!(!acks.drop_message(MessageId(100)));
        assert!(acks.on_ack(&ids(&[100])).is_empty());
    }

    #[test]
    fn test_pending_limit() {
        let mut acks = coordinator();
        for i in 0..4 {
            acks.on_sent(&envelope(100 + 4 * i, 2 * i as i32 + 1), true).unwrap();
        }
        assert_eq!(acks.on_sent(&envelope(200, 9), true), Err(PendingLimitExceeded));
    }

    #[test]
    fn test_on_reconnect() {
        let mut acks = coordinator();
        acks.on_sent(&envelope(100, 1), true).unwrap();
        acks.on_sent(&envelope(104, 3), false).unwrap();
        acks.on_sent(&envelope(108, 5), true).unwrap();

        assert_eq!(acks.on_reconnect(), vec![envelope(100, 1), envelope(108, 5)]);
        assert_eq!(acks.state_of(MessageId(104)), None);
        assert_eq!(acks.state_of(MessageId(108)), Some(DeliveryState::Resent));
    }

    #[test]
    fn test_containers() {
        let mut acks = coordinator();
        acks.on_container_sent(MessageId(200), ids(&[100, 104]));
        assert_eq!(acks.expand_container(MessageId(200)), ids(&[100, 104]));
        assert_eq!(acks.expand_container(MessageId(100)), ids(&[100]));
    }

    #[test]
    fn test_pending_before() {
        let mut acks = coordinator();
        acks.on_sent(&envelope(100, 1), true).unwrap();
        acks.on_sent(&envelope(104, 3), true).unwrap();
        acks.on_sent(&envelope(108, 5), true).unwrap();
        assert_eq!(acks.pending_before(MessageId(105)), ids(&[100, 104]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ack_debt_debounce() {
        let mut acks = coordinator();
        assert_eq!(acks.ack_flush_deadline(), None);

        let start = Instant::now();
        acks.add_ack_debt(MessageId(1), start);
        tokio::time::advance(Duration::from_millis(100)).await;
        acks.add_ack_debt(MessageId(5), Instant::now());

        assert_eq!(acks.ack_flush_deadline(), Some(start + Duration::from_millis(150)));
        assert!(!acks.should_flush_acks_now());

        assert_eq!(acks.take_ack_debt(), ids(&[1, 5]));
        assert!(!acks.has_ack_debt());
        assert_eq!(acks.ack_flush_deadline(), None);
    }

    #[test]
    fn test_ack_debt_threshold() {
        let mut acks = coordinator();
        let now = Instant::now();
        acks.add_ack_debt(MessageId(1), now);
        acks.add_ack_debt(MessageId(1), now);
        acks.add_ack_debt(MessageId(5), now);
        assert!(!acks.should_flush_acks_now());
        acks.add_ack_debt(MessageId(9), now);
        assert!(acks.should_flush_acks_now());
    }
}
