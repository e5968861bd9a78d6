use std::sync::Arc;

use tokio::select;
use tokio::task::JoinSet;
use tokio::time::{sleep_until, timeout, Instant};
use tracing::{debug, info};

use crate::config::EngineConfig;
use crate::datacenter::address::{ConnectionCandidate, DatacenterId};
use crate::datacenter::connector::{TransportConnection, TransportConnector};
use crate::session::auth_key::AuthKey;

/// Connects to all candidates concurrently. The first completed connection opens a grace window;
///  among all connections completed by the end of that window, the one with the lowest
///  candidate index wins. Everything else is aborted and dropped. Returns `None` if no
///  candidate could be connected.
pub async fn race_candidates(
    config: &EngineConfig,
    connector: Arc<dyn TransportConnector>,
    dc: DatacenterId,
    candidates: Vec<ConnectionCandidate>,
    auth_key: &AuthKey,
) -> Option<TransportConnection> {
    let mut attempts = JoinSet::new();
    for candidate in candidates {
        let connector = connector.clone();
        let auth_key = auth_key.clone();
        let connect_timeout = config.connect_timeout;
        attempts.spawn(async move {
            let result = match timeout(connect_timeout, connector.connect(dc, &candidate, &auth_key)).await {
                Ok(result) => result,
                Err(_) => Err(anyhow::anyhow!("timed out after {:?}", connect_timeout)),
            };
            (candidate, result)
        });
    }

    let mut best: Option<TransportConnection> = None;
    let mut grace_deadline: Option<Instant> = None;

    loop {
        let next = match grace_deadline {
            None => attempts.join_next().await,
            Some(deadline) => select! {
                next = attempts.join_next() => next,
                _ = sleep_until(deadline) => break,
            },
        };

        let Some(joined) = next else {
            break;
        };
        let (candidate, result) = match joined {
            Ok(r) => r,
            Err(e) => {
                debug!("connection attempt task failed: {}", e);
                continue;
            }
        };

        match result {
            Ok(connection) => {
                debug!(?dc, index = candidate.index, addr = ?candidate.socket_addr, "connection attempt succeeded");
                if grace_deadline.is_none() {
                    grace_deadline = Some(Instant::now() + config.race_grace_period);
                }
                let is_better = best.as_ref()
                    .map(|b| candidate.index < b.candidate.index)
                    .unwrap_or(true);
                if is_better {
                    best = Some(connection);
                }
            }
            Err(e) => {
                debug!(?dc, index = candidate.index, addr = ?candidate.socket_addr, "connection attempt failed: {}", e);
            }
        }
    }

    attempts.abort_all();
    if let Some(winner) = &best {
        info!(?dc, index = winner.candidate.index, addr = ?winner.candidate.socket_addr, proxy = winner.candidate.proxy.is_some(), "connected");
    }
    best
}
