// Cache connection factory
//
// One factory per registered data source. It turns connection properties into
// client settings, connects the data and script managers on first use, and
// hands out CacheConnections that share one SerializationContext.

use std::fmt;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::OnceCell;

use crate::config::CacheSettings;
use crate::error::{DriverError, Result};
use crate::models::properties::{ConnectionProperties, SaslMechanism};
use crate::models::ProtobufResource;
use crate::services::cache::{
    AdminFlag, CacheClient, CacheClientError, CacheHandle, ClientSettings, Marshalling,
    RemoteCache, RemoteCacheManager,
};
use crate::services::connection::CacheConnection;
use crate::services::marshaller::SerializationContext;

/// The two client managers a data source talks through
#[derive(Clone)]
pub(crate) struct Managers {
    pub data: Arc<dyn RemoteCacheManager>,
    /// Text marshalling, used for stored scripts
    pub scripts: Arc<dyn RemoteCacheManager>,
}

pub struct CacheConnectionFactory {
    cache_name: String,
    cache_template: Option<String>,
    settings: ClientSettings,
    cache_settings: CacheSettings,
    client: Arc<dyn CacheClient>,
    managers: OnceCell<Managers>,
    ctx: Arc<SerializationContext>,
}

impl CacheConnectionFactory {
    /// Build a factory from parsed connection properties
    ///
    /// # Errors
    /// `InvalidProperty` when `cache` or `host` is missing, or when
    /// `saslMechanism` names an unsupported mechanism.
    pub fn from_properties(
        props: &ConnectionProperties,
        cache_settings: &CacheSettings,
        client: Arc<dyn CacheClient>,
    ) -> Result<Self> {
        let cache_name = props
            .cache()
            .ok_or_else(|| DriverError::InvalidProperty("'cache' is required".to_string()))?
            .to_string();
        let servers = props
            .server_address()
            .ok_or_else(|| DriverError::InvalidProperty("'host' is required".to_string()))?;
        let sasl_mechanism = props
            .sasl_mechanism()
            .map(str::parse::<SaslMechanism>)
            .transpose()?;

        let settings = ClientSettings {
            servers: vec![servers],
            username: props.username().map(str::to_string),
            password: props.password().map(str::to_string),
            sasl_mechanism,
            authentication_realm: props.authentication_realm().map(str::to_string),
            authentication_server_name: props.authentication_server_name().map(str::to_string),
            marshalling: Marshalling::Protostream,
            properties: props.extensions(),
        };

        let cache_template = props
            .cache_template()
            .map(str::to_string)
            .or_else(|| cache_settings.cache_template.clone());

        tracing::debug!("Cache connection factory for '{}': {:?}", cache_name, settings);

        Ok(Self {
            cache_name,
            cache_template,
            settings,
            cache_settings: cache_settings.clone(),
            client,
            managers: OnceCell::new(),
            ctx: Arc::new(SerializationContext::new()),
        })
    }

    pub fn cache_name(&self) -> &str {
        &self.cache_name
    }

    pub fn cache_template(&self) -> Option<&str> {
        self.cache_template.as_deref()
    }

    pub fn settings(&self) -> &ClientSettings {
        &self.settings
    }

    pub fn cache_settings(&self) -> &CacheSettings {
        &self.cache_settings
    }

    /// Serialization context shared by every connection of this data source
    pub fn serialization_context(&self) -> &Arc<SerializationContext> {
        &self.ctx
    }

    /// Connect both managers on first use
    pub(crate) async fn managers(&self) -> Result<&Managers> {
        self.managers
            .get_or_try_init(|| async {
                let data = self.client.connect(&self.settings).await?;
                let scripts = self
                    .client
                    .connect(&self.settings.with_marshalling(Marshalling::Text))
                    .await?;
                tracing::info!(
                    "Connected cache managers for '{}' ({})",
                    self.cache_name,
                    self.settings.servers.join(",")
                );
                Ok::<_, CacheClientError>(Managers { data, scripts })
            })
            .await
            .map_err(|source| DriverError::ConnectionInit {
                cache: self.cache_name.clone(),
                source,
            })
    }

    /// Open a new connection on this data source
    pub async fn create_connection(self: &Arc<Self>) -> Result<CacheConnection> {
        let managers = self.managers().await?.clone();
        CacheConnection::new(Arc::clone(self), managers).await
    }

    /// Typed handle to a named cache
    ///
    /// # Errors
    /// `Cache(CacheNotFound)` if the cache is missing and `create` is false;
    /// `CacheProvision` if it could not be created.
    pub async fn get_cache<K, V>(&self, name: &str, create: bool) -> Result<CacheHandle<K, V>>
    where
        K: Serialize + DeserializeOwned,
        V: Serialize + DeserializeOwned,
    {
        let managers = self.managers().await?;
        let cache = resolve_cache(managers.data.as_ref(), name, self.cache_template(), create).await?;
        Ok(CacheHandle::new(cache))
    }

    /// Store a schema resource in the protobuf metadata cache
    ///
    /// Returns false if a resource with the same identifier was already there;
    /// the stored resource is kept.
    pub async fn register_protobuf_file(&self, resource: &ProtobufResource) -> Result<bool> {
        let metadata: CacheHandle<String, String> = self
            .get_cache(&self.cache_settings.protobuf_metadata_cache, false)
            .await?;
        let existing = metadata
            .put_if_absent(&resource.identifier, &resource.contents)
            .await?;
        let registered = existing.is_none();
        if registered {
            tracing::info!("Registered schema resource '{}'", resource.identifier);
        } else {
            tracing::debug!("Schema resource '{}' already registered", resource.identifier);
        }
        Ok(registered)
    }
}

impl fmt::Debug for CacheConnectionFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheConnectionFactory")
            .field("cache_name", &self.cache_name)
            .field("cache_template", &self.cache_template)
            .field("settings", &self.settings)
            .field("connected", &self.managers.initialized())
            .finish()
    }
}

/// Resolve `name`, creating it on demand
///
/// An existing cache is returned without any admin call. Otherwise a volatile
/// and then a permanent create are attempted before resolving again.
pub(crate) async fn resolve_cache(
    manager: &dyn RemoteCacheManager,
    name: &str,
    template: Option<&str>,
    create: bool,
) -> Result<Arc<dyn RemoteCache>> {
    if let Some(cache) = manager.cache(name).await? {
        return Ok(cache);
    }
    if !create {
        return Err(CacheClientError::CacheNotFound(name.to_string()).into());
    }

    let admin = manager.administration();
    let volatile = admin.create_cache(name, template, AdminFlag::Volatile).await;
    let permanent = admin.create_cache(name, template, AdminFlag::Permanent).await;

    if let (Err(_), Err(source)) = (&volatile, permanent) {
        tracing::error!("Failed to create cache '{}': {}", name, source);
        return Err(DriverError::CacheProvision {
            cache: name.to_string(),
            source,
        });
    }
    if let Err(e) = volatile {
        tracing::warn!("Volatile create of '{}' failed, permanent create succeeded: {}", name, e);
    }

    match manager.cache(name).await? {
        Some(cache) => {
            tracing::info!("Created cache '{}' (template: {:?})", name, template);
            Ok(cache)
        }
        None => Err(DriverError::CacheProvision {
            cache: name.to_string(),
            source: CacheClientError::CacheNotFound(name.to_string()),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::cache::MemoryCacheClient;

    fn props(url_cache: &str) -> ConnectionProperties {
        ConnectionProperties::new()
            .with("host", "localhost")
            .with("port", "11222")
            .with("cache", url_cache)
    }

    fn factory(client: &MemoryCacheClient, props: &ConnectionProperties) -> Arc<CacheConnectionFactory> {
        Arc::new(
            CacheConnectionFactory::from_properties(
                props,
                &CacheSettings::default(),
                Arc::new(client.clone()),
            )
            .unwrap(),
        )
    }

    #[test]
    fn test_from_properties() {
        let client = MemoryCacheClient::new();
        let props = props("addressbook")
            .with("username", "admin")
            .with("password", "pw")
            .with("saslMechanism", "digest-md5")
            .with("custom.flag", "on");
        let factory = factory(&client, &props);

        assert_eq!(factory.cache_name(), "addressbook");
        assert_eq!(factory.cache_template(), Some("org.infinispan.DIST_SYNC"));
        let settings = factory.settings();
        assert_eq!(settings.servers, vec!["localhost:11222".to_string()]);
        assert_eq!(settings.sasl_mechanism, Some(SaslMechanism::DigestMd5));
        assert_eq!(settings.properties.get("custom.flag").map(String::as_str), Some("on"));
        assert!(!settings.properties.contains_key("password"));
    }

    #[test]
    fn test_invalid_properties() {
        let client: Arc<dyn CacheClient> = Arc::new(MemoryCacheClient::new());
        let settings = CacheSettings::default();

        let no_cache = ConnectionProperties::new().with("host", "localhost");
        assert!(matches!(
            CacheConnectionFactory::from_properties(&no_cache, &settings, Arc::clone(&client)),
            Err(DriverError::InvalidProperty(_))
        ));

        let bad_sasl = props("c").with("saslMechanism", "KERBEROS");
        assert!(matches!(
            CacheConnectionFactory::from_properties(&bad_sasl, &settings, client),
            Err(DriverError::InvalidProperty(_))
        ));
    }

    #[tokio::test]
    async fn test_existing_cache_needs_no_create() {
        let client = MemoryCacheClient::new();
        client.create_cache("existing");
        let factory = factory(&client, &props("existing"));

        let handle: CacheHandle<String, String> = factory.get_cache("existing", true).await.unwrap();
        assert_eq!(handle.name(), "existing");
        assert!(client.admin_calls().is_empty());
    }

    #[tokio::test]
    async fn test_missing_cache_is_created_volatile_then_permanent() {
        let client = MemoryCacheClient::new();
        let factory = factory(&client, &props("c"));

        let handle: CacheHandle<String, String> = factory.get_cache("newcache", true).await.unwrap();
        assert_eq!(handle.name(), "newcache");

        let calls = client.admin_calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].flag, AdminFlag::Volatile);
        assert_eq!(calls[1].flag, AdminFlag::Permanent);
        assert_eq!(calls[1].template.as_deref(), Some("org.infinispan.DIST_SYNC"));
        assert_eq!(client.cache_flag("newcache"), Some(AdminFlag::Permanent));
    }

    #[tokio::test]
    async fn test_missing_cache_without_create() {
        let client = MemoryCacheClient::new();
        let factory = factory(&client, &props("c"));

        let result = factory.get_cache::<String, String>("absent", false).await;
        assert!(matches!(
            result,
            Err(DriverError::Cache(CacheClientError::CacheNotFound(ref name))) if name == "absent"
        ));
        assert!(client.admin_calls().is_empty());
    }

    #[tokio::test]
    async fn test_one_failed_create_is_tolerated() {
        let client = MemoryCacheClient::new();
        client.fail_creates(AdminFlag::Volatile);
        let factory = factory(&client, &props("c"));

        let result = factory.get_cache::<String, String>("newcache", true).await;
        assert!(result.is_ok());
        assert_eq!(client.admin_calls().len(), 2);
    }

    #[tokio::test]
    async fn test_both_creates_failing_is_provision_error() {
        let client = MemoryCacheClient::new();
        client.fail_creates(AdminFlag::Volatile);
        client.fail_creates(AdminFlag::Permanent);
        let factory = factory(&client, &props("c"));

        let result = factory.get_cache::<String, String>("newcache", true).await;
        assert!(matches!(result, Err(DriverError::CacheProvision { ref cache, .. }) if cache == "newcache"));
    }

    #[tokio::test]
    async fn test_unreachable_cluster_is_connection_init_error() {
        let client = MemoryCacheClient::new();
        client.set_reachable(false);
        let factory = factory(&client, &props("c"));

        let result = factory.create_connection().await;
        assert!(matches!(result, Err(DriverError::ConnectionInit { ref cache, .. }) if cache == "c"));
    }

    #[tokio::test]
    async fn test_managers_connect_once() {
        let client = MemoryCacheClient::new();
        client.create_cache("c");
        let factory = factory(&client, &props("c"));

        factory.get_cache::<String, String>("c", false).await.unwrap();
        factory.get_cache::<String, String>("c", false).await.unwrap();
        // data manager plus script manager
        assert_eq!(client.connect_count(), 2);
    }

    #[tokio::test]
    async fn test_register_protobuf_file_first_writer_wins() {
        let client = MemoryCacheClient::new();
        let factory = factory(&client, &props("c"));

        let first = ProtobufResource::new("/a.proto", "message A {}");
        let second = ProtobufResource::new("/a.proto", "message B {}");
        assert!(factory.register_protobuf_file(&first).await.unwrap());
        assert!(!factory.register_protobuf_file(&second).await.unwrap());

        let metadata: CacheHandle<String, String> =
            factory.get_cache("___protobuf_metadata", false).await.unwrap();
        assert_eq!(
            metadata.get(&"/a.proto".to_string()).await.unwrap().as_deref(),
            Some("message A {}")
        );
    }
}
