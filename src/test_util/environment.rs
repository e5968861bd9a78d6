use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use rustc_hash::FxHashMap;
use tokio::sync::mpsc;

use crate::config::EngineConfig;
use crate::datacenter::address::{DatacenterAddress, DatacenterAddressSet, DatacenterId};
use crate::datacenter::discovery::{BackupAddressDiscovery, StaticAddressDiscovery};
use crate::datacenter::DatacenterAddressResolver;
use crate::persistence::{InMemoryCredentialStore, InMemoryStore, SessionMaterialStore};
use crate::session::auth_key::AuthKey;
use crate::session::driver::SessionContext;
use crate::test_util::clock::ManualClock;
use crate::test_util::transport::{ChannelConnector, ServerConnection};

/// wall clock time at the start of every test environment
pub const TEST_NOW: Duration = Duration::from_secs(1_700_000_000);

/// Everything a session needs, wired to in-memory stores and a [ChannelConnector]
pub struct TestEnvironment {
    pub clock: Arc<ManualClock>,
    pub connector: Arc<ChannelConnector>,
    pub connections: mpsc::UnboundedReceiver<ServerConnection>,
    pub store: Arc<InMemoryStore>,
    pub credentials: Arc<InMemoryCredentialStore>,
    pub context: SessionContext,
}

impl TestEnvironment {
    /// Every datacenter gets an auth key and the single address `10.0.0.<id>:443`
    pub async fn new(config: EngineConfig, dcs: &[DatacenterId]) -> anyhow::Result<TestEnvironment> {
        let addresses = dcs.iter()
            .map(|dc| (*dc, DatacenterAddressSet::new(vec![DatacenterAddress::new(format!("10.0.0.{}", dc.0), 443)])))
            .collect();
        Self::with_addresses(config, addresses, Arc::new(StaticAddressDiscovery::new(Default::default()))).await
    }

    pub async fn with_addresses(
        config: EngineConfig,
        addresses: FxHashMap<DatacenterId, DatacenterAddressSet>,
        discovery: Arc<dyn BackupAddressDiscovery>,
    ) -> anyhow::Result<TestEnvironment> {
        config.validate()?;
        let config = Arc::new(config);

        let clock = Arc::new(ManualClock::new(TEST_NOW));
        let (connector, connections) = ChannelConnector::new(clock.clone());
        let connector = Arc::new(connector);
        let store = Arc::new(InMemoryStore::default());
        let credentials = Arc::new(InMemoryCredentialStore::default());

        let materials = Arc::new(SessionMaterialStore::new(store.clone(), credentials.clone()));
        for dc in addresses.keys() {
            materials.store_auth_key(*dc, &Self::auth_key(*dc)).await?;
        }

        let resolver = Arc::new(DatacenterAddressResolver::new(
            config.clone(),
            store.clone(),
            connector.clone(),
            vec![],
            discovery,
            addresses,
        ));

        Ok(TestEnvironment {
            context: SessionContext {
                config,
                resolver,
                materials,
                clock: clock.clone(),
            },
            clock,
            connector,
            connections,
            store,
            credentials,
        })
    }

    pub fn auth_key(dc: DatacenterId) -> AuthKey {
        AuthKey::new(Bytes::from(format!("test auth key for dc {}", dc.0)))
    }

    /// waits for the next connection any session makes
    pub async fn accept(&mut self) -> Option<ServerConnection> {
        self.connections.recv().await
    }
}
