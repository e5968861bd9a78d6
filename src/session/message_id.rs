use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tracing::debug;

use crate::codec::envelope::MessageId;

const NANOS_PER_SEC: i128 = 1_000_000_000;

/// Wall-clock time as seconds since the epoch. Message ids are tied to the wall clock, so this
///  is deliberately separate from tokio's (monotonic, pausable) time.
pub trait WallClock: Send + Sync {
    fn unix_time(&self) -> Duration;
}

pub struct SystemClock;
impl WallClock for SystemClock {
    fn unix_time(&self) -> Duration {
        SystemTime::now().duration_since(UNIX_EPOCH)
            .unwrap_or_default()
    }
}

/// Generates strictly increasing message ids from the wall clock, corrected by the offset to the
///  server's clock that was learned so far.
pub struct MessageIdGenerator {
    clock: Arc<dyn WallClock>,
    time_offset_millis: i64,
    last_id: i64,
}

impl MessageIdGenerator {
    pub fn new(clock: Arc<dyn WallClock>, time_offset_millis: i64) -> MessageIdGenerator {
        MessageIdGenerator {
            clock,
            time_offset_millis,
            last_id: 0,
        }
    }

    fn corrected_now_nanos(&self) -> i128 {
        self.clock.unix_time().as_nanos() as i128 + self.time_offset_millis as i128 * 1_000_000
    }

    /// corrected local time in whole seconds, the unit the peer's message ids are compared in
    pub fn corrected_unix_seconds(&self) -> i64 {
        (self.corrected_now_nanos() / NANOS_PER_SEC) as i64
    }

    pub fn next(&mut self) -> MessageId {
        let nanos = self.corrected_now_nanos();
        let seconds = (nanos / NANOS_PER_SEC) as i64;
        let fraction = (((nanos % NANOS_PER_SEC) << 32) / NANOS_PER_SEC) as i64;

        // the two low bits are reserved: client originated ids have them cleared
        let mut id = ((seconds << 32) | fraction) & !3;
        if id <= self.last_id {
            id = self.last_id + 4;
        }
        self.last_id = id;
        MessageId(id)
    }

    /// Adjusts the time offset so that local ids correspond to the clock of the server that
    ///  generated `server_message_id`.
    pub fn resync(&mut self, server_message_id: MessageId) {
        let raw = server_message_id.0;
        let server_millis = (raw >> 32) * 1000 + (((raw & 0xffff_ffff) * 1000) >> 32);
        let local_millis = self.clock.unix_time().as_millis() as i64;

        self.time_offset_millis = server_millis - local_millis;
        debug!(time_offset_millis = self.time_offset_millis, "resynchronized clock offset");
    }

    pub fn time_offset_millis(&self) -> i64 {
        self.time_offset_millis
    }
}


/// Content-related messages get odd sequence numbers and increment the counter, all others
///  reuse the current even number.
#[derive(Default)]
pub struct SeqNoGenerator {
    content_messages: i32,
}

impl SeqNoGenerator {
    pub fn next(&mut self, content_related: bool) -> i32 {
        if content_related {
            let result = 2 * self.content_messages + 1;
            self.content_messages += 1;
            result
        }
        else {
            2 * self.content_messages
        }
    }
}
