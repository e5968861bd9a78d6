use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use rustc_hash::FxHashMap;

use crate::datacenter::address::{DatacenterAddressSet, DatacenterId};

/// Out-of-band lookup of fresh addresses for a datacenter, used when none of the known addresses
///  work anymore
#[cfg_attr(test, automock)]
#[async_trait]
pub trait BackupAddressDiscovery: Send + Sync + 'static {
    async fn discover(&self, dc: DatacenterId) -> anyhow::Result<DatacenterAddressSet>;
}

/// Discovery from a fixed table, e.g. addresses shipped with a configuration update
pub struct StaticAddressDiscovery {
    addresses: FxHashMap<DatacenterId, DatacenterAddressSet>,
}

impl StaticAddressDiscovery {
    pub fn new(addresses: FxHashMap<DatacenterId, DatacenterAddressSet>) -> StaticAddressDiscovery {
        StaticAddressDiscovery { addresses }
    }
}

#[async_trait]
impl BackupAddressDiscovery for StaticAddressDiscovery {
    async fn discover(&self, dc: DatacenterId) -> anyhow::Result<DatacenterAddressSet> {
        match self.addresses.get(&dc) {
            Some(set) => Ok(set.clone()),
            None => anyhow::bail!("no backup addresses for {:?}", dc),
        }
    }
}
