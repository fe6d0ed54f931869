// Cache connection
//
// Runtime object bound to one data source. Holds the default cache, the
// script manager and this connection's view into the shared marshaller
// registry. Closing a connection releases the view only: the client
// managers belong to the factory and stay connected.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

use crate::error::{DriverError, Result};
use crate::models::{Document, ProtobufResource};
use crate::services::cache::{CacheClientError, CacheHandle, RemoteCache, RemoteCacheManager};
use crate::services::connection_factory::{resolve_cache, CacheConnectionFactory, Managers};
use crate::services::marshaller::{
    JsonMarshaller, Marshaller, MarshallerProvider, SerializationContext, WrappedMessage,
};

pub struct CacheConnection {
    id: Uuid,
    cache_name: String,
    default_cache: Arc<dyn RemoteCache>,
    manager: Arc<dyn RemoteCacheManager>,
    script_manager: Arc<dyn RemoteCacheManager>,
    ctx: Arc<SerializationContext>,
    provider: MarshallerProvider,
    factory: Arc<CacheConnectionFactory>,
    closed: AtomicBool,
}

impl CacheConnection {
    pub(crate) async fn new(factory: Arc<CacheConnectionFactory>, managers: Managers) -> Result<Self> {
        let cache_name = factory.cache_name().to_string();

        let default_cache = match managers.data.cache(&cache_name).await {
            Ok(Some(cache)) => cache,
            Ok(None) => {
                return Err(DriverError::ConnectionInit {
                    source: CacheClientError::CacheNotFound(cache_name.clone()),
                    cache: cache_name,
                })
            }
            Err(source) => {
                return Err(DriverError::ConnectionInit {
                    cache: cache_name,
                    source,
                })
            }
        };

        let ctx = Arc::clone(factory.serialization_context());
        let provider = ctx.register_marshaller_provider();
        let id = Uuid::new_v4();
        tracing::debug!("Opened cache connection {} on '{}'", id, cache_name);

        Ok(Self {
            id,
            cache_name,
            default_cache,
            manager: managers.data,
            script_manager: managers.scripts,
            ctx,
            provider,
            factory,
            closed: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn cache_name(&self) -> &str {
        &self.cache_name
    }

    /// The factory of the data source this connection belongs to
    pub fn factory(&self) -> &Arc<CacheConnectionFactory> {
        &self.factory
    }

    /// The default cache this connection was opened on
    pub fn cache<K, V>(&self) -> CacheHandle<K, V>
    where
        K: Serialize + DeserializeOwned,
        V: Serialize + DeserializeOwned,
    {
        CacheHandle::new(Arc::clone(&self.default_cache))
    }

    /// A named cache, created on demand when `create` is true
    pub async fn get_cache<K, V>(&self, name: &str, create: bool) -> Result<CacheHandle<K, V>>
    where
        K: Serialize + DeserializeOwned,
        V: Serialize + DeserializeOwned,
    {
        let cache = resolve_cache(self.manager.as_ref(), name, self.factory.cache_template(), create).await?;
        Ok(CacheHandle::new(cache))
    }

    /// # Errors
    /// `DuplicateMarshaller` if any connection of this data source already
    /// registered a marshaller for the same type name.
    pub fn register_marshaller(&self, marshaller: Arc<dyn Marshaller>) -> Result<()> {
        self.provider.register(marshaller)?;
        Ok(())
    }

    pub fn unregister_marshaller(&self, marshaller: &Arc<dyn Marshaller>) -> bool {
        self.provider.unregister(marshaller)
    }

    /// Marshaller for a type name, falling back to plain JSON
    pub fn marshaller(&self, type_name: &str) -> Arc<dyn Marshaller> {
        self.provider
            .marshaller(type_name)
            .unwrap_or_else(|| Arc::new(JsonMarshaller::new(type_name)))
    }

    pub fn serialization_context(&self) -> &Arc<SerializationContext> {
        &self.ctx
    }

    /// Run a stored server-side script
    ///
    /// A missing script surfaces as `Cache(ScriptNotFound)`.
    pub async fn execute<T: DeserializeOwned>(
        &self,
        script_name: &str,
        params: &HashMap<String, Value>,
    ) -> Result<T> {
        let value = self.script_manager.scripts().execute(script_name, params).await?;
        serde_json::from_value(value).map_err(|e| {
            DriverError::Cache(CacheClientError::Codec(format!(
                "result of script '{}': {}",
                script_name, e
            )))
        })
    }

    /// Store a script unless one is already stored under the name
    ///
    /// Returns true if this call stored it.
    pub async fn register_script(&self, script_name: &str, source: &str) -> Result<bool> {
        let script_cache = &self.factory.cache_settings().script_cache;
        let scripts: CacheHandle<String, String> = CacheHandle::new(
            resolve_cache(self.script_manager.as_ref(), script_cache, None, false).await?,
        );

        let stored = scripts
            .put_if_absent(&script_name.to_string(), &source.to_string())
            .await?
            .is_none();
        if stored {
            tracing::info!("Registered script '{}'", script_name);
        } else {
            tracing::debug!("Script '{}' already registered, keeping stored version", script_name);
        }
        Ok(stored)
    }

    pub async fn register_protobuf_file(&self, resource: &ProtobufResource) -> Result<bool> {
        self.factory.register_protobuf_file(resource).await
    }

    /// Encode a document with its type's marshaller and store it in the default cache
    pub async fn put_document(&self, key: &str, document: &Document) -> Result<()> {
        let marshaller = self.marshaller(document.type_name());
        let message = WrappedMessage::wrap(marshaller.as_ref(), document)?;
        self.cache::<String, WrappedMessage>()
            .put(&key.to_string(), &message)
            .await?;
        Ok(())
    }

    /// Every entry of the default cache holding a document of `type_name`
    ///
    /// Entries that are not wrapped messages are skipped.
    pub async fn documents(&self, type_name: &str) -> Result<Vec<(String, Document)>> {
        let marshaller = self.marshaller(type_name);
        let mut documents = Vec::new();

        for (key, value) in self.default_cache.entries().await? {
            let message = match serde_json::from_slice::<WrappedMessage>(&value) {
                Ok(message) if message.type_name == type_name => message,
                Ok(_) => continue,
                Err(_) => {
                    tracing::debug!("Skipping non-message entry in '{}'", self.cache_name);
                    continue;
                }
            };
            let key = serde_json::from_slice::<String>(&key)
                .unwrap_or_else(|_| String::from_utf8_lossy(&key).into_owned());
            documents.push((key, marshaller.decode(&message.payload)?));
        }

        Ok(documents)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Release this connection's marshaller registrations
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.ctx.unregister_marshaller_provider(&self.provider);
        tracing::debug!("Closed cache connection {} on '{}'", self.id, self.cache_name);
    }
}

impl Drop for CacheConnection {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for CacheConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheConnection")
            .field("id", &self.id)
            .field("cache_name", &self.cache_name)
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheSettings;
    use crate::models::ConnectionProperties;
    use crate::services::cache::MemoryCacheClient;
    use crate::services::marshaller::MarshallerError;
    use serde_json::json;

    fn factory(client: &MemoryCacheClient) -> Arc<CacheConnectionFactory> {
        let props = ConnectionProperties::new()
            .with("host", "localhost")
            .with("port", "11222")
            .with("cache", "addressbook");
        Arc::new(
            CacheConnectionFactory::from_properties(
                &props,
                &CacheSettings::default(),
                Arc::new(client.clone()),
            )
            .unwrap(),
        )
    }

    async fn connection(client: &MemoryCacheClient) -> CacheConnection {
        client.create_cache("addressbook");
        factory(client).create_connection().await.unwrap()
    }

    fn json(type_name: &str) -> Arc<dyn Marshaller> {
        Arc::new(JsonMarshaller::new(type_name))
    }

    #[tokio::test]
    async fn test_missing_default_cache_fails_construction() {
        let client = MemoryCacheClient::new();
        let result = factory(&client).create_connection().await;
        assert!(matches!(
            result,
            Err(DriverError::ConnectionInit {
                source: CacheClientError::CacheNotFound(_),
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_default_cache_roundtrip() {
        let client = MemoryCacheClient::new();
        let conn = connection(&client).await;

        let cache = conn.cache::<String, String>();
        assert_eq!(cache.name(), "addressbook");
        cache.put(&"k".to_string(), &"v".to_string()).await.unwrap();
        assert_eq!(cache.get(&"k".to_string()).await.unwrap().as_deref(), Some("v"));
    }

    #[tokio::test]
    async fn test_get_cache_creates_on_demand() {
        let client = MemoryCacheClient::new();
        let conn = connection(&client).await;

        let handle = conn.get_cache::<String, i64>("counters", true).await.unwrap();
        assert_eq!(handle.name(), "counters");
        assert_eq!(client.admin_calls().len(), 2);
    }

    #[tokio::test]
    async fn test_duplicate_marshaller_across_connections() {
        let client = MemoryCacheClient::new();
        client.create_cache("addressbook");
        let factory = factory(&client);
        let a = factory.create_connection().await.unwrap();
        let b = factory.create_connection().await.unwrap();

        a.register_marshaller(json("quickstart.Person")).unwrap();
        let err = b.register_marshaller(json("quickstart.Person")).unwrap_err();
        assert!(matches!(err, DriverError::DuplicateMarshaller(ref t) if t == "quickstart.Person"));

        // Closing the owner frees the type name
        a.close();
        assert!(b.register_marshaller(json("quickstart.Person")).is_ok());
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let client = MemoryCacheClient::new();
        let conn = connection(&client).await;
        conn.register_marshaller(json("quickstart.Person")).unwrap();

        conn.close();
        conn.close();
        assert!(conn.is_closed());
        assert!(conn.serialization_context().registered_types().is_empty());
        // Managers stay usable after close
        assert!(conn.get_cache::<String, String>("addressbook", false).await.is_ok());
    }

    #[tokio::test]
    async fn test_drop_releases_marshallers() {
        let client = MemoryCacheClient::new();
        client.create_cache("addressbook");
        let factory = factory(&client);
        {
            let conn = factory.create_connection().await.unwrap();
            conn.register_marshaller(json("quickstart.Person")).unwrap();
        }
        assert!(factory.serialization_context().registered_types().is_empty());
    }

    #[tokio::test]
    async fn test_register_script_first_writer_wins() {
        let client = MemoryCacheClient::new();
        let conn = connection(&client).await;

        assert!(conn.register_script("summary.js", "first").await.unwrap());
        assert!(!conn.register_script("summary.js", "second").await.unwrap());

        let scripts = conn
            .get_cache::<String, String>("___script_cache", false)
            .await
            .unwrap();
        assert_eq!(
            scripts.get(&"summary.js".to_string()).await.unwrap().as_deref(),
            Some("first")
        );
    }

    #[tokio::test]
    async fn test_execute_script() {
        let client = MemoryCacheClient::new();
        client.register_task("count", |params| {
            Ok(json!(params.len()))
        });
        let conn = connection(&client).await;

        let params = HashMap::from([("a".to_string(), json!(1)), ("b".to_string(), json!(2))]);
        let count: usize = conn.execute("count", &params).await.unwrap();
        assert_eq!(count, 2);

        let missing = conn.execute::<Value>("nope", &params).await.unwrap_err();
        assert!(matches!(
            missing,
            DriverError::Cache(CacheClientError::ScriptNotFound(ref name)) if name == "nope"
        ));
    }

    #[tokio::test]
    async fn test_documents_roundtrip() {
        let client = MemoryCacheClient::new();
        let conn = connection(&client).await;

        let alice = Document::new("quickstart.Person")
            .with_field("id", 1)
            .with_field("name", "Alice");
        let address = Document::new("quickstart.Address").with_field("street", "Main");
        conn.put_document("p1", &alice).await.unwrap();
        conn.put_document("a1", &address).await.unwrap();
        conn.cache::<String, String>()
            .put(&"raw".to_string(), &"plain value".to_string())
            .await
            .unwrap();

        let people = conn.documents("quickstart.Person").await.unwrap();
        assert_eq!(people, vec![("p1".to_string(), alice)]);
    }

    #[tokio::test]
    async fn test_documents_propagate_decode_errors() {
        let client = MemoryCacheClient::new();
        let conn = connection(&client).await;

        let broken = WrappedMessage {
            type_name: "quickstart.Person".to_string(),
            payload: b"[]".to_vec(),
        };
        conn.cache::<String, WrappedMessage>()
            .put(&"p1".to_string(), &broken)
            .await
            .unwrap();

        let err = conn.documents("quickstart.Person").await.unwrap_err();
        assert!(matches!(err, DriverError::Marshalling(MarshallerError::Decode { .. })));
    }
}
