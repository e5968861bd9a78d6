use std::marker::PhantomData;
use std::sync::Arc;

use rustc_hash::FxHashMap;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::EngineConfig;
use crate::util::random::{Random, RngRandom};

#[derive(Debug, Default, Eq, PartialEq)]
pub struct KeepaliveTick {
    /// a ping with this id should be sent now
    pub ping_id: Option<i64>,
    /// at least one ping went unanswered: the connection should be replaced
    pub reconnect: bool,
}

/// Decides when to ping an idle connection and when to give up on it. Correlation is strictly
///  by ping id, so several pings can be in flight and answered in any order.
pub struct KeepaliveController<R: Random> {
    config: Arc<EngineConfig>,
    in_flight: FxHashMap<i64, Instant>,
    last_activity: Instant,
    last_ping: Option<Instant>,
    _random: PhantomData<R>,
}

impl KeepaliveController<RngRandom> {
    pub fn new(config: Arc<EngineConfig>, now: Instant) -> KeepaliveController<RngRandom> {
        KeepaliveController::new_with_random(config, now)
    }
}

impl <R: Random> KeepaliveController<R> {
    pub fn new_with_random(config: Arc<EngineConfig>, now: Instant) -> KeepaliveController<R> {
        KeepaliveController {
            config,
            in_flight: Default::default(),
            last_activity: now,
            last_ping: None,
            _random: PhantomData,
        }
    }

    /// for a new connection: pings sent on a previous one can not be answered anymore
    pub fn reset(&mut self, now: Instant) {
        self.in_flight.clear();
        self.last_activity = now;
        self.last_ping = None;
    }

    /// anything received from the peer proves the connection is alive
    pub fn on_activity(&mut self, now: Instant) {
        self.last_activity = now;
    }

    /// Returns true if the pong matched a ping that was still in flight. Pongs for unknown or
    ///  timed out pings are ignored.
    pub fn on_pong(&mut self, ping_id: i64) -> bool {
        match self.in_flight.remove(&ping_id) {
            Some(_) => true,
            None => {
                debug!(ping_id, "pong for unknown or expired ping - ignoring");
                false
            }
        }
    }

    pub fn num_in_flight(&self) -> usize {
        self.in_flight.len()
    }

    fn next_ping_due(&self) -> Instant {
        let idle_since = match self.last_ping {
            Some(last_ping) => last_ping.max(self.last_activity),
            None => self.last_activity,
        };
        idle_since + self.config.ping_interval
    }

    /// when [KeepaliveController::on_tick] should be called next
    pub fn next_deadline(&self) -> Instant {
        let next_timeout = self.in_flight.values().min().copied();
        match next_timeout {
            Some(timeout) => timeout.min(self.next_ping_due()),
            None => self.next_ping_due(),
        }
    }

    pub fn on_tick(&mut self, now: Instant) -> KeepaliveTick {
        let mut result = KeepaliveTick::default();

        let before = self.in_flight.len();
        self.in_flight.retain(|_, deadline| *deadline > now);
        let num_expired = before - self.in_flight.len();
        if num_expired > 0 {
            warn!("{} ping(s) not answered in time", num_expired);
            result.reconnect = true;
            return result;
        }

        if now >= self.next_ping_due() {
            let ping_id = R::next_i64();
            self.in_flight.insert(ping_id, now + self.config.ping_timeout);
            self.last_ping = Some(now);
            result.ping_id = Some(ping_id);
        }
        result
    }
}
