use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
#[cfg(test)] use mockall::automock;
use rustc_hash::FxHashMap;
use tracing::{debug, warn};

use crate::datacenter::address::DatacenterId;
use crate::error::{RpcFailure, RpcResult};
use crate::session::auth_key::AuthKey;
use crate::util::atomic_box::AtomicBox;

/// The narrow interface to whatever storage engine the application uses
#[cfg_attr(test, automock)]
#[async_trait]
pub trait KeyValueStore: Send + Sync + 'static {
    async fn get(&self, key: &[u8]) -> anyhow::Result<Option<Bytes>>;
    async fn set(&self, key: &[u8], value: Bytes) -> anyhow::Result<()>;
}

/// Storage for secrets, e.g. backed by the platform's keychain. Entries are organized in groups
///  that can be dropped as a whole.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait CredentialStore: Send + Sync + 'static {
    async fn set(&self, key: &str, group: &str, value: Bytes) -> anyhow::Result<()>;
    async fn get(&self, key: &str, group: &str) -> anyhow::Result<Option<Bytes>>;
    async fn remove(&self, key: &str, group: &str) -> anyhow::Result<()>;
    async fn drop_group(&self, group: &str) -> anyhow::Result<()>;
}

/// Reads a value, treating storage failures like an absent value
pub async fn get_or_unavailable(store: &dyn KeyValueStore, key: &[u8]) -> Option<Bytes> {
    match store.get(key).await {
        Ok(value) => value,
        Err(e) => {
            warn!("error reading {:?} from persistent store - treating as unavailable: {}", String::from_utf8_lossy(key), e);
            None
        }
    }
}

/// Writes a value, logging failures: nothing the engine persists is lost for good if a write
///  fails, it is only learned again.
pub async fn set_logged(store: &dyn KeyValueStore, key: &[u8], value: Bytes) {
    if let Err(e) = store.set(key, value).await {
        warn!("error writing {:?} to persistent store: {}", String::from_utf8_lossy(key), e);
    }
}


#[derive(Default)]
pub struct InMemoryStore {
    data: AtomicBox<FxHashMap<Vec<u8>, Bytes>>,
}

#[async_trait]
impl KeyValueStore for InMemoryStore {
    async fn get(&self, key: &[u8]) -> anyhow::Result<Option<Bytes>> {
        Ok(self.data.with(|d| d.get(key).cloned()))
    }

    async fn set(&self, key: &[u8], value: Bytes) -> anyhow::Result<()> {
        self.data.modify(|d| d.insert(key.to_vec(), value));
        Ok(())
    }
}

#[derive(Default)]
pub struct InMemoryCredentialStore {
    groups: AtomicBox<FxHashMap<String, FxHashMap<String, Bytes>>>,
}

#[async_trait]
impl CredentialStore for InMemoryCredentialStore {
    async fn set(&self, key: &str, group: &str, value: Bytes) -> anyhow::Result<()> {
        self.groups.modify(|g| g.entry(group.to_string()).or_default().insert(key.to_string(), value));
        Ok(())
    }

    async fn get(&self, key: &str, group: &str) -> anyhow::Result<Option<Bytes>> {
        Ok(self.groups.with(|g| g.get(group).and_then(|entries| entries.get(key)).cloned()))
    }

    async fn remove(&self, key: &str, group: &str) -> anyhow::Result<()> {
        self.groups.modify(|g| {
            if let Some(entries) = g.get_mut(group) {
                entries.remove(key);
            }
        });
        Ok(())
    }

    async fn drop_group(&self, group: &str) -> anyhow::Result<()> {
        self.groups.modify(|g| g.remove(group));
        Ok(())
    }
}


const AUTH_KEY: &str = "auth_key";

/// Persisted per-datacenter session material: the auth key lives in the credential store, salt
///  and clock offset in the key / value store.
pub struct SessionMaterialStore {
    store: Arc<dyn KeyValueStore>,
    credentials: Arc<dyn CredentialStore>,
}

impl SessionMaterialStore {
    pub fn new(store: Arc<dyn KeyValueStore>, credentials: Arc<dyn CredentialStore>) -> SessionMaterialStore {
        SessionMaterialStore { store, credentials }
    }

    fn group(dc: DatacenterId) -> String {
        format!("dc{}", dc.0)
    }

    fn salt_key(dc: DatacenterId) -> Vec<u8> {
        format!("dc.salt.{}", dc.0).into_bytes()
    }

    fn time_offset_key(dc: DatacenterId) -> Vec<u8> {
        format!("dc.time_offset.{}", dc.0).into_bytes()
    }

    /// The auth key is security critical: unlike other persisted values, its absence (or a
    ///  failure to read it) is surfaced rather than papered over.
    pub async fn load_auth_key(&self, dc: DatacenterId) -> RpcResult<AuthKey> {
        match self.credentials.get(AUTH_KEY, &Self::group(dc)).await {
            Ok(Some(data)) if !data.is_empty() => Ok(AuthKey::new(data)),
            Ok(_) => {
                debug!(?dc, "no auth key");
                Err(RpcFailure::AuthenticationRequired)
            }
            Err(e) => {
                warn!(?dc, "error reading auth key: {}", e);
                Err(RpcFailure::AuthenticationRequired)
            }
        }
    }

    pub async fn store_auth_key(&self, dc: DatacenterId, key: &AuthKey) -> anyhow::Result<()> {
        self.credentials.set(AUTH_KEY, &Self::group(dc), key.data().clone()).await
    }

    /// Forgets everything secret about a datacenter, e.g. on logout
    pub async fn forget(&self, dc: DatacenterId) -> anyhow::Result<()> {
        self.credentials.drop_group(&Self::group(dc)).await
    }

    pub async fn load_server_salt(&self, dc: DatacenterId) -> i64 {
        Self::decode_i64(get_or_unavailable(self.store.as_ref(), &Self::salt_key(dc)).await)
    }

    pub async fn load_time_offset_millis(&self, dc: DatacenterId) -> i64 {
        Self::decode_i64(get_or_unavailable(self.store.as_ref(), &Self::time_offset_key(dc)).await)
    }

    pub async fn store_session_material(&self, dc: DatacenterId, server_salt: i64, time_offset_millis: i64) {
        set_logged(self.store.as_ref(), &Self::salt_key(dc), Bytes::copy_from_slice(&server_salt.to_le_bytes())).await;
        set_logged(self.store.as_ref(), &Self::time_offset_key(dc), Bytes::copy_from_slice(&time_offset_millis.to_le_bytes())).await;
    }

    fn decode_i64(raw: Option<Bytes>) -> i64 {
        raw.and_then(|b| <[u8; 8]>::try_from(b.as_ref()).ok())
            .map(i64::from_le_bytes)
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn material_store(credentials: Arc<dyn CredentialStore>) -> SessionMaterialStore {
        SessionMaterialStore::new(Arc::new(InMemoryStore::default()), credentials)
    }

    #[tokio::test]
    async fn test_in_memory_store() {
        let store = InMemoryStore::default();
        assert_eq!(store.get(b"a").await.unwrap(), None);
        store.set(b"a", Bytes::from_static(b"1")).await.unwrap();
        store.set(b"a", Bytes::from_static(b"2")).await.unwrap();
        assert_eq!(store.get(b"a").await.unwrap(), Some(Bytes::from_static(b"2")));
    }

    #[tokio::test]
    async fn test_in_memory_credential_store() {
        let store = InMemoryCredentialStore::default();
        store.set("k", "g1", Bytes::from_static(b"v1")).await.unwrap();
        store.set("k", "g2", Bytes::from_static(b"v2")).await.unwrap();
        store.set("other", "g1", Bytes::from_static(b"v3")).await.unwrap();

        assert_eq!(store.get("k", "g1").await.unwrap(), Some(Bytes::from_static(b"v1")));
        store.remove("k", "g1").await.unwrap();
        assert_eq!(store.get("k", "g1").await.unwrap(), None);
        assert_eq!(store.get("other", "g1").await.unwrap(), Some(Bytes::from_static(b"v3")));

        store.drop_group("g1").await.unwrap();
        assert_eq!(store.get("other", "g1").await.unwrap(), None);
        assert_eq!(store.get("k", "g2").await.unwrap(), Some(Bytes::from_static(b"v2")));
    }

    #[tokio::test]
    async fn test_get_failure_is_unavailable() {
        let mut store = MockKeyValueStore::new();
        store.expect_get()
            .returning(|_| Err(anyhow::anyhow!("disk on fire")));
        assert_eq!(get_or_unavailable(&store, b"x").await, None);
    }

    #[tokio::test]
    async fn test_auth_key_roundtrip() {
        let material = material_store(Arc::new(InMemoryCredentialStore::default()));
        let dc = DatacenterId(2);
        assert_eq!(material.load_auth_key(dc).await, Err(RpcFailure::AuthenticationRequired));

        let key = AuthKey::new(Bytes::from_static(b"0123456789"));
        material.store_auth_key(dc, &key).await.unwrap();
        assert_eq!(material.load_auth_key(dc).await, Ok(key));
        assert_eq!(material.load_auth_key(DatacenterId(3)).await, Err(RpcFailure::AuthenticationRequired));

        material.forget(dc).await.unwrap();
        assert_eq!(material.load_auth_key(dc).await, Err(RpcFailure::AuthenticationRequired));
    }

    #[tokio::test]
    async fn test_auth_key_read_failure() {
        let mut credentials = MockCredentialStore::new();
        credentials.expect_get()
            .returning(|_, _| Err(anyhow::anyhow!("keychain locked")));
        let material = material_store(Arc::new(credentials));
        assert_eq!(material.load_auth_key(DatacenterId(1)).await, Err(RpcFailure::AuthenticationRequired));
    }

    #[tokio::test]
    async fn test_session_material() {
        let material = material_store(Arc::new(InMemoryCredentialStore::default()));
        let dc = DatacenterId(1);
        assert_eq!(material.load_server_salt(dc).await, 0);

        material.store_session_material(dc, -5, 1234).await;
        assert_eq!(material.load_server_salt(dc).await, -5);
        assert_eq!(material.load_time_offset_millis(dc).await, 1234);
        assert_eq!(material.load_server_salt(DatacenterId(2)).await, 0);
    }
}
