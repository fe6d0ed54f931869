// Cache client abstraction
//
// The driver talks to the distributed cache only through these traits. A
// remote client implements them over the network; MemoryCacheClient keeps
// everything in process for embedded use and tests.

pub mod memory;

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use crate::models::properties::SaslMechanism;

pub use memory::MemoryCacheClient;

/// Errors reported by a cache client
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CacheClientError {
    #[error("Cache '{0}' does not exist")]
    CacheNotFound(String),

    #[error("Cache '{0}' already exists")]
    CacheExists(String),

    #[error("Script '{0}' not found")]
    ScriptNotFound(String),

    #[error("Script '{name}' failed: {reason}")]
    ScriptFailed { name: String, reason: String },

    #[error("Cache server unavailable: {0}")]
    Unavailable(String),

    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Codec error: {0}")]
    Codec(String),

    #[error("Cache operation failed: {0}")]
    Operation(String),
}

/// Lifetime of a cache created through the admin interface
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AdminFlag {
    /// Lives until the cluster restarts
    Volatile,
    /// Persisted in the cluster configuration
    Permanent,
}

/// Value format a cache manager exchanges with the server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Marshalling {
    /// Structured values in `WrappedMessage` envelopes
    #[default]
    Protostream,
    /// Plain text, used for stored scripts
    Text,
}

/// Raw byte-level access to one named cache
#[async_trait]
pub trait RemoteCache: Send + Sync {
    fn name(&self) -> &str;

    async fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, CacheClientError>;

    /// Store a value, returning the previous one
    async fn put(&self, key: Vec<u8>, value: Vec<u8>) -> Result<Option<Vec<u8>>, CacheClientError>;

    /// Store a value only if the key is absent; returns the existing value otherwise
    async fn put_if_absent(
        &self,
        key: Vec<u8>,
        value: Vec<u8>,
    ) -> Result<Option<Vec<u8>>, CacheClientError>;

    async fn remove(&self, key: &[u8]) -> Result<Option<Vec<u8>>, CacheClientError>;

    async fn contains_key(&self, key: &[u8]) -> Result<bool, CacheClientError>;

    /// Snapshot of every entry
    async fn entries(&self) -> Result<Vec<(Vec<u8>, Vec<u8>)>, CacheClientError>;

    async fn size(&self) -> Result<usize, CacheClientError>;
}

/// Cache administration
#[async_trait]
pub trait CacheAdmin: Send + Sync {
    /// Create a cache from a server-side template
    async fn create_cache(
        &self,
        name: &str,
        template: Option<&str>,
        flag: AdminFlag,
    ) -> Result<(), CacheClientError>;
}

/// Server-side script execution
#[async_trait]
pub trait ScriptExecutor: Send + Sync {
    async fn execute(
        &self,
        name: &str,
        params: &HashMap<String, Value>,
    ) -> Result<Value, CacheClientError>;
}

/// A connected client: hands out caches, admin and script access
#[async_trait]
pub trait RemoteCacheManager: Send + Sync {
    /// Resolve a cache by name; `None` if the cluster does not define it
    async fn cache(&self, name: &str) -> Result<Option<Arc<dyn RemoteCache>>, CacheClientError>;

    fn administration(&self) -> Arc<dyn CacheAdmin>;

    fn scripts(&self) -> Arc<dyn ScriptExecutor>;
}

/// Entry point for a cache client implementation
#[async_trait]
pub trait CacheClient: Send + Sync {
    async fn connect(
        &self,
        settings: &ClientSettings,
    ) -> Result<Arc<dyn RemoteCacheManager>, CacheClientError>;
}

/// Client connection settings derived from connection properties
#[derive(Clone, Default)]
pub struct ClientSettings {
    /// `host:port` entries
    pub servers: Vec<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub sasl_mechanism: Option<SaslMechanism>,
    pub authentication_realm: Option<String>,
    pub authentication_server_name: Option<String>,
    pub marshalling: Marshalling,
    /// Unrecognized connection properties, passed through untouched
    pub properties: BTreeMap<String, String>,
}

impl ClientSettings {
    /// Same settings, different value format
    pub fn with_marshalling(&self, marshalling: Marshalling) -> Self {
        Self {
            marshalling,
            ..self.clone()
        }
    }

    pub fn has_credentials(&self) -> bool {
        self.username.is_some()
    }
}

impl fmt::Debug for ClientSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientSettings")
            .field("servers", &self.servers)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("sasl_mechanism", &self.sasl_mechanism)
            .field("authentication_realm", &self.authentication_realm)
            .field("authentication_server_name", &self.authentication_server_name)
            .field("marshalling", &self.marshalling)
            .field("properties", &self.properties)
            .finish()
    }
}

/// Typed view over a [`RemoteCache`]
///
/// Keys and values are encoded as JSON on the way in and decoded on the way
/// out.
pub struct CacheHandle<K, V> {
    inner: Arc<dyn RemoteCache>,
    _types: PhantomData<fn() -> (K, V)>,
}

impl<K, V> Clone for CacheHandle<K, V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            _types: PhantomData,
        }
    }
}

impl<K, V> fmt::Debug for CacheHandle<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheHandle").field("name", &self.inner.name()).finish()
    }
}

impl<K, V> CacheHandle<K, V>
where
    K: Serialize + DeserializeOwned,
    V: Serialize + DeserializeOwned,
{
    pub fn new(inner: Arc<dyn RemoteCache>) -> Self {
        Self {
            inner,
            _types: PhantomData,
        }
    }

    pub fn name(&self) -> &str {
        self.inner.name()
    }

    /// The untyped cache underneath
    pub fn raw(&self) -> &Arc<dyn RemoteCache> {
        &self.inner
    }

    pub async fn get(&self, key: &K) -> Result<Option<V>, CacheClientError> {
        let key = encode(key)?;
        match self.inner.get(&key).await? {
            Some(bytes) => decode(&bytes).map(Some),
            None => Ok(None),
        }
    }

    pub async fn put(&self, key: &K, value: &V) -> Result<Option<V>, CacheClientError> {
        let previous = self.inner.put(encode(key)?, encode(value)?).await?;
        previous.map(|bytes| decode(&bytes)).transpose()
    }

    /// Returns the value already stored, or `None` if this call inserted
    pub async fn put_if_absent(&self, key: &K, value: &V) -> Result<Option<V>, CacheClientError> {
        let existing = self.inner.put_if_absent(encode(key)?, encode(value)?).await?;
        existing.map(|bytes| decode(&bytes)).transpose()
    }

    pub async fn remove(&self, key: &K) -> Result<Option<V>, CacheClientError> {
        let previous = self.inner.remove(&encode(key)?).await?;
        previous.map(|bytes| decode(&bytes)).transpose()
    }

    pub async fn contains_key(&self, key: &K) -> Result<bool, CacheClientError> {
        self.inner.contains_key(&encode(key)?).await
    }

    pub async fn entries(&self) -> Result<Vec<(K, V)>, CacheClientError> {
        self.inner
            .entries()
            .await?
            .iter()
            .map(|(k, v)| Ok((decode(k)?, decode(v)?)))
            .collect()
    }

    pub async fn size(&self) -> Result<usize, CacheClientError> {
        self.inner.size().await
    }
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, CacheClientError> {
    serde_json::to_vec(value).map_err(|e| CacheClientError::Codec(e.to_string()))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, CacheClientError> {
    serde_json::from_slice(bytes).map_err(|e| CacheClientError::Codec(e.to_string()))
}
