use std::iter::once;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use rustc_hash::{FxHashMap, FxHashSet};
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::datacenter::address::{ConnectionCandidate, DatacenterAddress, DatacenterAddressSet, DatacenterId};
use crate::datacenter::connector::{TransportConnection, TransportConnector};
use crate::datacenter::discovery::BackupAddressDiscovery;
use crate::datacenter::race::race_candidates;
use crate::datacenter::resolver::HostResolver;
use crate::error::{RpcFailure, RpcResult};
use crate::persistence::{get_or_unavailable, set_logged, KeyValueStore};
use crate::session::auth_key::AuthKey;
use crate::util::atomic_box::AtomicBox;

pub mod address;
pub mod connector;
pub mod discovery;
pub mod race;
pub mod resolver;

/// Knows how to reach each datacenter: holds the address sets (persisting changes), expands them
///  into connection candidates and races those, falling back to address discovery.
pub struct DatacenterAddressResolver {
    config: Arc<EngineConfig>,
    store: Arc<dyn KeyValueStore>,
    connector: Arc<dyn TransportConnector>,
    host_resolvers: Vec<Arc<dyn HostResolver>>,
    discovery: Arc<dyn BackupAddressDiscovery>,
    defaults: FxHashMap<DatacenterId, DatacenterAddressSet>,
    /// cache of the current address sets, loaded lazily from the store
    known: AtomicBox<FxHashMap<DatacenterId, DatacenterAddressSet>>,
}

impl DatacenterAddressResolver {
    pub fn new(
        config: Arc<EngineConfig>,
        store: Arc<dyn KeyValueStore>,
        connector: Arc<dyn TransportConnector>,
        host_resolvers: Vec<Arc<dyn HostResolver>>,
        discovery: Arc<dyn BackupAddressDiscovery>,
        defaults: FxHashMap<DatacenterId, DatacenterAddressSet>,
    ) -> DatacenterAddressResolver {
        DatacenterAddressResolver {
            config,
            store,
            connector,
            host_resolvers,
            discovery,
            defaults,
            known: Default::default(),
        }
    }

    fn store_key(dc: DatacenterId) -> Vec<u8> {
        format!("dc.addresses.{}", dc.0).into_bytes()
    }

    /// The current address set: cached, else persisted, else the bundled defaults
    pub async fn address_set(&self, dc: DatacenterId) -> DatacenterAddressSet {
        if let Some(set) = self.known.with(|known| known.get(&dc).cloned()) {
            return set;
        }

        let defaults = || self.defaults.get(&dc).cloned().unwrap_or_default();
        let set = match get_or_unavailable(self.store.as_ref(), &Self::store_key(dc)).await {
            None => defaults(),
            Some(raw) => match DatacenterAddressSet::try_from_bytes(&raw) {
                Ok(set) if !set.is_empty() => set,
                Ok(_) => defaults(),
                Err(e) => {
                    warn!(?dc, "persisted address set is unreadable - falling back to defaults: {}", e);
                    defaults()
                }
            },
        };

        self.known.modify(|known| known.insert(dc, set.clone()));
        set
    }

    pub async fn update_address_set(&self, dc: DatacenterId, set: DatacenterAddressSet) {
        let bytes = set.to_bytes();
        self.known.modify(|known| known.insert(dc, set));
        set_logged(self.store.as_ref(), &Self::store_key(dc), bytes).await;
    }

    async fn resolve(&self, address: &DatacenterAddress) -> Vec<SocketAddr> {
        if let Ok(ip) = address.host.parse::<IpAddr>() {
            return vec![SocketAddr::new(ip, address.port)];
        }

        let mut lookups = JoinSet::new();
        for (resolver_index, resolver) in self.host_resolvers.iter().enumerate() {
            let resolver = resolver.clone();
            let host = address.host.clone();
            let port = address.port;
            let resolve_timeout = self.config.connect_timeout;
            lookups.spawn(async move {
                (resolver_index, timeout(resolve_timeout, resolver.resolve(&host, port)).await)
            });
        }

        let mut per_resolver = Vec::new();
        while let Some(joined) = lookups.join_next().await {
            match joined {
                Ok((resolver_index, Ok(Ok(addrs)))) => per_resolver.push((resolver_index, addrs)),
                Ok((resolver_index, Ok(Err(e)))) => debug!(host = address.host, resolver_index, "resolution failed: {}", e),
                Ok((resolver_index, Err(_))) => debug!(host = address.host, resolver_index, "resolution timed out"),
                Err(e) => debug!("resolution task failed: {}", e),
            }
        }
        per_resolver.sort_by_key(|(resolver_index, _)| *resolver_index);

        let mut result = Vec::new();
        for addr in per_resolver.into_iter().flat_map(|(_, addrs)| addrs) {
            if !result.contains(&addr) {
                result.push(addr);
            }
        }
        result
    }

    /// Every resolved address of every usable entry, directly and through every configured
    ///  proxy, in order of preference
    pub async fn candidates(&self, set: &DatacenterAddressSet) -> Vec<ConnectionCandidate> {
        let mut result = Vec::new();
        for address in set.addresses().iter().filter(|a| a.is_usable_for_sessions()) {
            for socket_addr in self.resolve(address).await {
                for proxy in once(None).chain(self.config.proxies.iter().cloned().map(Some)) {
                    result.push(ConnectionCandidate {
                        index: result.len(),
                        address: address.clone(),
                        socket_addr,
                        proxy,
                    });
                }
            }
        }
        result
    }

    /// Reorders candidates by probed round trip time, failed probes last. The order among equally
    ///  fast candidates is preserved.
    async fn rank_by_probe(&self, candidates: Vec<ConnectionCandidate>) -> Vec<ConnectionCandidate> {
        let mut probes = JoinSet::new();
        for candidate in &candidates {
            let connector = self.connector.clone();
            let candidate = candidate.clone();
            let probe_timeout = self.config.probe_timeout;
            probes.spawn(async move {
                let rtt = match timeout(probe_timeout, connector.probe(&candidate)).await {
                    Ok(Ok(rtt)) => Some(rtt),
                    _ => None,
                };
                (candidate.index, rtt)
            });
        }

        let mut rtts: FxHashMap<usize, Duration> = FxHashMap::default();
        while let Some(joined) = probes.join_next().await {
            if let Ok((index, Some(rtt))) = joined {
                rtts.insert(index, rtt);
            }
        }

        let mut ranked = candidates;
        ranked.sort_by_key(|c| match rtts.get(&c.index) {
            Some(rtt) => (false, *rtt),
            None => (true, Duration::ZERO),
        });
        for (index, candidate) in ranked.iter_mut().enumerate() {
            candidate.index = index;
        }
        ranked
    }

    /// Connects to a datacenter, racing all candidates of the known address set. If none of them
    ///  work, fresh addresses are discovered (excluding those that already failed) for a bounded
    ///  number of rounds.
    #[tracing::instrument(skip(self, auth_key))]
    pub async fn connect(&self, dc: DatacenterId, auth_key: &AuthKey) -> RpcResult<TransportConnection> {
        let mut set = self.address_set(dc).await;
        let mut failed = FxHashSet::default();
        let mut round = 0;

        loop {
            let mut candidates = self.candidates(&set).await;
            if self.config.probe_candidates && candidates.len() > 1 {
                candidates = self.rank_by_probe(candidates).await;
            }

            if let Some(connection) = race_candidates(&self.config, self.connector.clone(), dc, candidates, auth_key).await {
                if set.prefer(&connection.candidate.address) {
                    self.update_address_set(dc, set).await;
                }
                return Ok(connection);
            }

            failed.extend(set.addresses().iter().map(|a| a.endpoint()));
            if round >= self.config.max_discovery_rounds {
                break;
            }
            round += 1;

            info!(round, "no known address is reachable - discovering backup addresses");
            set = match self.discovery.discover(dc).await {
                Ok(discovered) => discovered.without(&failed),
                Err(e) => {
                    warn!("address discovery failed: {}", e);
                    DatacenterAddressSet::default()
                }
            };
            if set.is_empty() {
                warn!("discovery yielded no untried addresses");
            }
            else {
                self.update_address_set(dc, set.clone()).await;
            }
        }

        warn!(rounds = round, "datacenter is unreachable");
        Err(RpcFailure::ConnectivityUnavailable { dc, rounds: round })
    }
}
