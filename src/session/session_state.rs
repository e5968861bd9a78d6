use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::codec::envelope::MessageId;
use crate::config::EngineConfig;
use crate::session::message_id::{MessageIdGenerator, SeqNoGenerator, WallClock};

/// What to do with a received message id
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum IncomingCheck {
    Accept,
    /// seen before (or too old to tell): ignore, but acknowledge again if content-related
    Duplicate,
    /// the peer's clock and ours diverge too far for this session to continue
    Reset(String),
}

/// Per-session identity, id / sequence number generation and duplicate / skew detection.
///  Replaced as a whole when the session is reset.
pub struct SessionState {
    config: Arc<EngineConfig>,
    session_id: i64,
    server_salt: i64,
    ids: MessageIdGenerator,
    seq_nos: SeqNoGenerator,
    received: BTreeSet<MessageId>,
    /// set when salt or time offset changed and should be persisted
    material_changed: bool,
}

impl SessionState {
    pub fn new(config: Arc<EngineConfig>, clock: Arc<dyn WallClock>, session_id: i64, server_salt: i64, time_offset_millis: i64) -> SessionState {
        SessionState {
            config,
            session_id,
            server_salt,
            ids: MessageIdGenerator::new(clock, time_offset_millis),
            seq_nos: SeqNoGenerator::default(),
            received: BTreeSet::new(),
            material_changed: false,
        }
    }

    pub fn session_id(&self) -> i64 {
        self.session_id
    }

    pub fn server_salt(&self) -> i64 {
        self.server_salt
    }

    pub fn time_offset_millis(&self) -> i64 {
        self.ids.time_offset_millis()
    }

    pub fn set_server_salt(&mut self, server_salt: i64) {
        if server_salt != self.server_salt {
            debug!("server salt changed");
            self.server_salt = server_salt;
            self.material_changed = true;
        }
    }

    pub fn resync_time(&mut self, server_message_id: MessageId) {
        self.ids.resync(server_message_id);
        self.material_changed = true;
    }

    /// returns true once after salt or time offset changed
    pub fn take_material_changed(&mut self) -> bool {
        std::mem::take(&mut self.material_changed)
    }

    pub fn next_message(&mut self, content_related: bool) -> (MessageId, i32) {
        (self.ids.next(), self.seq_nos.next(content_related))
    }

    /// Checks a received message id against the clock skew tolerance and the window of recently
    ///  received ids, registering it if it is accepted.
    ///
    /// The first id received in a session calibrates the clock offset instead of being checked
    ///  for skew: a fresh session has no other way of learning the server's time.
    pub fn check_incoming(&mut self, message_id: MessageId) -> IncomingCheck {
        if self.received.is_empty() {
            let skew = message_id.unix_seconds() - self.ids.corrected_unix_seconds();
            if skew.unsigned_abs() > 1 {
                self.resync_time(message_id);
            }
        }
        else {
            let now = self.ids.corrected_unix_seconds();
            let id_seconds = message_id.unix_seconds();
            if id_seconds < now - self.config.max_past_skew.as_secs() as i64 {
                warn!(msg_id = ?message_id, "received message id is {}s in the past", now - id_seconds);
                return IncomingCheck::Reset(format!("message id {:?} too far in the past", message_id));
            }
            if id_seconds > now + self.config.max_future_skew.as_secs() as i64 {
                warn!(msg_id = ?message_id, "received message id is {}s in the future", id_seconds - now);
                return IncomingCheck::Reset(format!("message id {:?} too far in the future", message_id));
            }
        }

        if self.received.contains(&message_id) {
            return IncomingCheck::Duplicate;
        }
        if self.received.len() >= self.config.duplicate_window {
            if let Some(&oldest) = self.received.first() {
                if message_id < oldest {
                    return IncomingCheck::Duplicate;
                }
            }
        }

        self.received.insert(message_id);
        while self.received.len() > self.config.duplicate_window {
            self.received.pop_first();
        }
        IncomingCheck::Accept
    }
}
