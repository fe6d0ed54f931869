// Driver entry point
//
// Accepts `infinispan:` URLs, turns them into connection properties and hands
// them to the bootstrap, which returns a SQL connection on the cache's schema.

use std::sync::Arc;

use crate::config::Config;
use crate::error::Result;
use crate::models::properties::{keys, ConnectionProperties, DriverPropertyInfo, SaslMechanism};
use crate::services::bootstrap::EngineBootstrap;
use crate::services::cache::CacheClient;
use crate::services::engine::SqlConnection;
use crate::services::url_parser::{accepts_url, mask_credentials, parse_url};

pub const DRIVER_NAME: &str = "Infinispan SQL Driver";

pub struct Driver {
    bootstrap: Arc<EngineBootstrap>,
}

impl Driver {
    pub fn new(bootstrap: Arc<EngineBootstrap>) -> Self {
        Self { bootstrap }
    }

    /// Driver over `client` with default settings
    pub fn with_client(client: Arc<dyn CacheClient>) -> Self {
        Self::from_config(&Config::default(), client)
    }

    pub fn from_config(config: &Config, client: Arc<dyn CacheClient>) -> Self {
        Self::new(Arc::new(EngineBootstrap::from_config(config, client)))
    }

    pub fn bootstrap(&self) -> &Arc<EngineBootstrap> {
        &self.bootstrap
    }

    /// Open a SQL connection for `url`
    ///
    /// Returns `Ok(None)` when the URL is not an `infinispan:` URL, so callers
    /// probing several drivers can move on. `base` is never modified.
    pub async fn connect(&self, url: &str, base: Option<&ConnectionProperties>) -> Result<Option<SqlConnection>> {
        if !self.accepts_url(url) {
            return Ok(None);
        }

        let props = parse_url(url, base.cloned().unwrap_or_default())?;
        tracing::info!("Connecting to {}", mask_credentials(url));

        let connection = self.bootstrap.connect(&props).await?;
        tracing::info!(
            "Connected to schema '{}' ({} tables)",
            connection.schema_name(),
            connection.tables().len()
        );
        Ok(Some(connection))
    }

    pub fn accepts_url(&self, url: &str) -> bool {
        accepts_url(url)
    }

    /// Properties the driver understands, with their values from `url` and `base`
    pub fn property_info(&self, url: &str, base: Option<&ConnectionProperties>) -> Result<Vec<DriverPropertyInfo>> {
        let props = parse_url(url, base.cloned().unwrap_or_default())?;
        let sasl_choices: Vec<&str> = SaslMechanism::ALL.iter().map(SaslMechanism::as_str).collect();

        Ok(vec![
            DriverPropertyInfo::new(
                keys::PROTOBUF,
                props.protobuf(),
                "Name of the protobuf schema resource describing the cache's entries",
            )
            .required(),
            DriverPropertyInfo::new(keys::USERNAME, props.username(), "User name for cache authentication"),
            DriverPropertyInfo::new(
                keys::PASSWORD,
                props.password().map(|_| "***"),
                "Password for cache authentication",
            ),
            DriverPropertyInfo::new(
                keys::SASL_MECHANISM,
                props.sasl_mechanism(),
                "SASL mechanism used to authenticate",
            )
            .with_choices(&sasl_choices),
            DriverPropertyInfo::new(
                keys::AUTHENTICATION_SERVER_NAME,
                props.authentication_server_name(),
                "Server name presented during SASL authentication",
            ),
            DriverPropertyInfo::new(
                keys::AUTHENTICATION_REALM,
                props.authentication_realm(),
                "Realm used during SASL authentication",
            ),
        ])
    }

    pub fn driver_name(&self) -> &'static str {
        DRIVER_NAME
    }

    pub fn major_version(&self) -> u32 {
        env!("CARGO_PKG_VERSION_MAJOR").parse().unwrap_or(0)
    }

    pub fn minor_version(&self) -> u32 {
        env!("CARGO_PKG_VERSION_MINOR").parse().unwrap_or(0)
    }

    /// The driver does not implement the full SQL surface
    pub fn is_compliant(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheSettings;
    use crate::error::DriverError;
    use crate::models::{Document, ProtobufResource};
    use crate::services::cache::MemoryCacheClient;
    use crate::services::connection_factory::CacheConnectionFactory;
    use serde_json::json;
    use tokio_test::assert_ok;

    const PROTO: &str = r#"
        package shop;
        message Purchase {
            required int64 id = 1;
            optional string customer = 2;
            optional double total = 3;
        }
    "#;

    async fn seeded_client() -> MemoryCacheClient {
        let client = MemoryCacheClient::new();
        client.create_cache("orders");
        let factory = Arc::new(
            CacheConnectionFactory::from_properties(
                &ConnectionProperties::new().with("host", "localhost").with("cache", "orders"),
                &CacheSettings::default(),
                Arc::new(client.clone()),
            )
            .unwrap(),
        );
        let conn = factory.create_connection().await.unwrap();
        conn.register_protobuf_file(&ProtobufResource::new("shop.proto", PROTO))
            .await
            .unwrap();
        for (id, customer, total) in [(1, "acme", 10.0), (2, "globex", 25.5), (3, "acme", 4.5)] {
            let doc = Document::new("shop.Purchase")
                .with_field("id", id)
                .with_field("customer", customer)
                .with_field("total", total);
            conn.put_document(&format!("purchase:{}", id), &doc).await.unwrap();
        }
        client
    }

    #[tokio::test]
    async fn test_connect_end_to_end() {
        let client = seeded_client().await;
        let driver = Driver::with_client(Arc::new(client));

        let conn = driver
            .connect("infinispan://localhost:11222/orders;protobuf=shop.proto", None)
            .await
            .unwrap()
            .unwrap();
        let result = conn
            .query("SELECT customer, SUM(total) AS spent FROM purchase GROUP BY customer ORDER BY customer")
            .await
            .unwrap();
        assert_eq!(
            result.rows,
            vec![
                vec![json!("acme"), json!(14.5)],
                vec![json!("globex"), json!(25.5)],
            ]
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_connects_bootstrap_once() {
        let client = seeded_client().await;
        let seeded_connects = client.connect_count();
        let driver = Arc::new(Driver::with_client(Arc::new(client.clone())));

        let tasks: Vec<_> = (0..16)
            .map(|_| {
                let driver = Arc::clone(&driver);
                tokio::spawn(async move {
                    driver
                        .connect("infinispan://localhost/orders;protobuf=shop.proto", None)
                        .await
                })
            })
            .collect();
        for task in tasks {
            let conn = task.await.unwrap().unwrap().unwrap();
            assert_eq!(conn.schema_name(), "orders");
        }

        let engine = driver.bootstrap().engine().await.unwrap();
        assert_eq!(engine.deployed().await.len(), 1);
        assert!(engine.has_data_source("orders").await);
        assert_eq!(client.connect_count() - seeded_connects, 2);
    }

    #[tokio::test]
    async fn test_unsigned_values_beyond_signed_range() {
        let client = MemoryCacheClient::new();
        client.create_cache("metrics");
        let factory = Arc::new(
            CacheConnectionFactory::from_properties(
                &ConnectionProperties::new().with("host", "localhost").with("cache", "metrics"),
                &CacheSettings::default(),
                Arc::new(client.clone()),
            )
            .unwrap(),
        );
        let conn = factory.create_connection().await.unwrap();
        conn.register_protobuf_file(&ProtobufResource::new(
            "metrics.proto",
            "package metrics; message Counter { required string name = 1; optional uint64 hits = 2; }",
        ))
        .await
        .unwrap();
        for (name, hits) in [("max", u64::MAX), ("one", 1)] {
            let doc = Document::new("metrics.Counter").with_field("name", name).with_field("hits", hits);
            conn.put_document(name, &doc).await.unwrap();
        }

        let driver = Driver::with_client(Arc::new(client));
        let sql = driver
            .connect("infinispan://localhost/metrics;protobuf=metrics.proto", None)
            .await
            .unwrap()
            .unwrap();
        let result = sql.query("SELECT name, hits FROM counter ORDER BY hits DESC").await.unwrap();
        assert_eq!(
            result.rows,
            vec![vec![json!("max"), json!(u64::MAX)], vec![json!("one"), json!(1)]]
        );
    }

    #[tokio::test]
    async fn test_base_properties_are_not_mutated() {
        let client = seeded_client().await;
        let driver = Driver::with_client(Arc::new(client));
        let base = ConnectionProperties::new().with("protobuf", "shop.proto");
        let snapshot = base.clone();

        let conn = assert_ok!(driver.connect("infinispan://localhost/orders", Some(&base)).await);
        assert!(conn.is_some());
        assert_eq!(base, snapshot);
    }

    #[tokio::test]
    async fn test_foreign_url_returns_none() {
        let driver = Driver::with_client(Arc::new(MemoryCacheClient::new()));
        assert!(driver.connect("jdbc:postgresql://localhost/db", None).await.unwrap().is_none());
        assert!(!driver.bootstrap().is_started().await);
    }

    #[tokio::test]
    async fn test_missing_cache_is_reported() {
        let client = MemoryCacheClient::new();
        let driver = Driver::with_client(Arc::new(client));
        let err = driver
            .connect("infinispan://localhost/nowhere;protobuf=shop.proto", None)
            .await
            .unwrap_err();
        assert!(matches!(err, DriverError::SchemaDeployment { .. }));
    }

    #[test]
    fn test_property_info() {
        let driver = Driver::with_client(Arc::new(MemoryCacheClient::new()));
        let info = driver
            .property_info(
                "infinispan://localhost/orders;protobuf=shop.proto;password=secret;saslMechanism=PLAIN",
                None,
            )
            .unwrap();

        let names: Vec<&str> = info.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "protobuf",
                "username",
                "password",
                "saslMechanism",
                "authenticationServerName",
                "authenticationRealm"
            ]
        );
        assert!(info[0].required);
        assert_eq!(info[0].value.as_deref(), Some("shop.proto"));
        assert_eq!(info[2].value.as_deref(), Some("***"));
        assert_eq!(info[3].choices, vec!["CRAM-MD5", "DIGEST-MD5", "PLAIN"]);
    }

    #[test]
    fn test_metadata() {
        let driver = Driver::with_client(Arc::new(MemoryCacheClient::new()));
        assert_eq!(driver.driver_name(), DRIVER_NAME);
        assert_eq!(driver.major_version(), 0);
        assert_eq!(driver.minor_version(), 1);
        assert!(!driver.is_compliant());
        assert!(driver.accepts_url("infinispan:"));
        assert!(!driver.accepts_url("mysql://localhost"));
    }
}
