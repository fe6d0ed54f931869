// Embedded engine
//
// Holds the registries the driver deploys into: translators by name, data
// sources by name and deployed schemas by (name, version). Each deployed
// schema owns a DataFusion session with one table provider per imported table.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use datafusion::error::DataFusionError;
use datafusion::logical_expr::LogicalPlan;
use datafusion::prelude::SessionContext;
use thiserror::Error;
use tokio::sync::RwLock;

use super::catalog::proto_type_to_arrow_type;
use super::executor::SqlConnection;
use super::local_cache::{LocalCache, LocalCacheFactory};
use super::session::EngineSessionFactory;
use super::translator::{CacheTranslator, Translator, TranslatorError};
use crate::config::EngineSettings;
use crate::error::{DriverError, Result};
use crate::models::descriptor::{DescriptorKey, SchemaDescriptor};
use crate::models::metadata::Table;
use crate::services::connection_factory::CacheConnectionFactory;

/// Name of the engine-internal cache holding parsed logical plans
pub const PLAN_CACHE_NAME: &str = "preparedplan";

/// Why a schema descriptor could not be deployed
#[derive(Debug, Error)]
pub enum DeploymentError {
    #[error("Malformed schema descriptor: {0}")]
    Malformed(#[source] serde_json::Error),

    #[error("Invalid schema descriptor: {0}")]
    Invalid(String),

    #[error("Translator '{0}' is not registered")]
    TranslatorNotFound(String),

    #[error("Data source '{0}' is not registered")]
    DataSourceNotFound(String),

    #[error("Schema '{0}' is already deployed")]
    AlreadyDeployed(DescriptorKey),

    #[error("Failed to connect to data source '{name}': {source}")]
    Connection {
        name: String,
        #[source]
        source: Box<DriverError>,
    },

    #[error("Metadata import failed: {0}")]
    Import(#[from] TranslatorError),

    #[error("Failed to register table '{table}': {source}")]
    Registration {
        table: String,
        #[source]
        source: DataFusionError,
    },
}

/// A descriptor deployed into the engine, ready to answer SQL
pub struct DeployedSchema {
    descriptor: SchemaDescriptor,
    tables: Vec<Table>,
    ctx: SessionContext,
    plans: Arc<LocalCache<String, LogicalPlan>>,
    deployed_at: DateTime<Utc>,
}

impl DeployedSchema {
    pub fn key(&self) -> DescriptorKey {
        self.descriptor.key()
    }

    pub fn descriptor(&self) -> &SchemaDescriptor {
        &self.descriptor
    }

    pub fn tables(&self) -> &[Table] {
        &self.tables
    }

    pub fn context(&self) -> &SessionContext {
        &self.ctx
    }

    pub fn plans(&self) -> &LocalCache<String, LogicalPlan> {
        &self.plans
    }

    pub fn deployed_at(&self) -> DateTime<Utc> {
        self.deployed_at
    }
}

impl fmt::Debug for DeployedSchema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeployedSchema")
            .field("key", &self.key().to_string())
            .field("tables", &self.tables.iter().map(|t| t.sql_name()).collect::<Vec<_>>())
            .field("deployed_at", &self.deployed_at)
            .finish()
    }
}

pub struct EmbeddedEngine {
    settings: EngineSettings,
    sessions: EngineSessionFactory,
    local_caches: LocalCacheFactory,
    translators: RwLock<HashMap<String, Arc<dyn Translator>>>,
    data_sources: RwLock<HashMap<String, Arc<CacheConnectionFactory>>>,
    schemas: RwLock<HashMap<DescriptorKey, Arc<DeployedSchema>>>,
    started_at: DateTime<Utc>,
}

impl EmbeddedEngine {
    /// Start an engine with the cache translator registered
    pub fn start(settings: EngineSettings) -> Result<Self> {
        let sessions = EngineSessionFactory::new(&settings)?;
        let local_caches = LocalCacheFactory::new(settings.internal_cache_capacity);

        let translator: Arc<dyn Translator> = Arc::new(CacheTranslator::new(settings.translator_name.clone()));
        let translators = HashMap::from([(translator.name().to_string(), translator)]);

        tracing::info!(
            "Embedded engine started (batch size {}, {} partitions, internal cache capacity {})",
            sessions.batch_size(),
            sessions.target_partitions(),
            local_caches.capacity()
        );

        Ok(Self {
            settings,
            sessions,
            local_caches,
            translators: RwLock::new(translators),
            data_sources: RwLock::new(HashMap::new()),
            schemas: RwLock::new(HashMap::new()),
            started_at: Utc::now(),
        })
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Register a translator, replacing any with the same name
    pub async fn add_translator(&self, translator: Arc<dyn Translator>) {
        let name = translator.name().to_string();
        if self.translators.write().await.insert(name.clone(), translator).is_some() {
            tracing::warn!("Replaced translator '{}'", name);
        }
    }

    pub async fn translator(&self, name: &str) -> Option<Arc<dyn Translator>> {
        self.translators.read().await.get(name).cloned()
    }

    pub async fn has_data_source(&self, name: &str) -> bool {
        self.data_sources.read().await.contains_key(name)
    }

    pub async fn add_data_source(&self, name: &str, factory: Arc<CacheConnectionFactory>) -> Result<()> {
        let mut sources = self.data_sources.write().await;
        if sources.contains_key(name) {
            return Err(DriverError::DuplicateDataSource(name.to_string()));
        }
        sources.insert(name.to_string(), factory);
        tracing::info!("Registered data source '{}'", name);
        Ok(())
    }

    pub async fn data_source(&self, name: &str) -> Option<Arc<CacheConnectionFactory>> {
        self.data_sources.read().await.get(name).cloned()
    }

    pub async fn descriptor(&self, name: &str, version: u32) -> Option<Arc<DeployedSchema>> {
        self.schemas.read().await.get(&DescriptorKey::new(name, version)).cloned()
    }

    pub async fn has_descriptor(&self, name: &str, version: u32) -> bool {
        self.schemas.read().await.contains_key(&DescriptorKey::new(name, version))
    }

    /// Keys of every deployed schema, sorted
    pub async fn deployed(&self) -> Vec<DescriptorKey> {
        let mut keys: Vec<_> = self.schemas.read().await.keys().cloned().collect();
        keys.sort_by(|a, b| a.name.cmp(&b.name).then(a.version.cmp(&b.version)));
        keys
    }

    /// Deploy a serialized schema descriptor
    ///
    /// The descriptor must bind exactly one model to one source. The source's
    /// translator imports the model's tables through a connection on the named
    /// data source, and each table is registered in a fresh session under its
    /// lower-cased name.
    pub async fn deploy_descriptor(&self, bytes: &[u8]) -> std::result::Result<Arc<DeployedSchema>, DeploymentError> {
        let descriptor = SchemaDescriptor::from_bytes(bytes).map_err(DeploymentError::Malformed)?;
        let key = descriptor.key();
        if self.has_descriptor(&key.name, key.version).await {
            return Err(DeploymentError::AlreadyDeployed(key));
        }

        let (model, source) = descriptor.single_source().ok_or_else(|| {
            DeploymentError::Invalid(format!(
                "schema '{}' must bind exactly one model to one source",
                key
            ))
        })?;

        let translator = self
            .translator(&source.translator_name)
            .await
            .ok_or_else(|| DeploymentError::TranslatorNotFound(source.translator_name.clone()))?;
        let factory = self
            .data_source(&source.connection_name)
            .await
            .ok_or_else(|| DeploymentError::DataSourceNotFound(source.connection_name.clone()))?;

        let connection = factory
            .create_connection()
            .await
            .map_err(|e| DeploymentError::Connection {
                name: source.connection_name.clone(),
                source: Box::new(e),
            })?;
        let imported = translator.import_metadata(&connection, &model.properties).await;
        connection.close();
        let tables = imported?;

        let ctx = self
            .sessions
            .create_session(&key.name.to_ascii_lowercase(), &model.name.to_ascii_lowercase());
        for table in &tables {
            let provider = translator.table_provider(table, Arc::clone(&factory));
            ctx.register_table(table.sql_name(), provider)
                .map_err(|source| DeploymentError::Registration {
                    table: table.sql_name(),
                    source,
                })?;
        }

        let deployed = Arc::new(DeployedSchema {
            tables,
            ctx,
            plans: self.local_caches.get(PLAN_CACHE_NAME),
            deployed_at: Utc::now(),
            descriptor,
        });

        let mut schemas = self.schemas.write().await;
        if schemas.contains_key(&key) {
            return Err(DeploymentError::AlreadyDeployed(key));
        }
        schemas.insert(key.clone(), Arc::clone(&deployed));
        tracing::info!("Deployed schema '{}' with {} tables", key, deployed.tables.len());

        Ok(deployed)
    }

    /// DDL of a deployed model, one `CREATE FOREIGN TABLE` per table
    pub async fn schema_ddl(&self, name: &str, version: u32, model: &str) -> Option<String> {
        let schema = self.descriptor(name, version).await?;
        if !schema
            .descriptor
            .models
            .iter()
            .any(|m| m.name.eq_ignore_ascii_case(model))
        {
            return None;
        }

        let statements: Vec<String> = schema.tables.iter().map(foreign_table_ddl).collect();
        Some(statements.join("\n\n"))
    }

    /// Open a SQL connection on a deployed schema
    pub async fn connect(&self, name: &str, version: u32) -> Result<SqlConnection> {
        let schema = self
            .descriptor(name, version)
            .await
            .ok_or_else(|| DriverError::UnknownSchema {
                name: name.to_string(),
                version,
            })?;
        Ok(SqlConnection::new(schema, self.settings.query_timeout()))
    }

    /// Drop every deployed schema and data source
    pub async fn shutdown(&self) {
        let schemas = {
            let mut schemas = self.schemas.write().await;
            let count = schemas.len();
            schemas.clear();
            count
        };
        let sources = {
            let mut sources = self.data_sources.write().await;
            let count = sources.len();
            sources.clear();
            count
        };
        tracing::info!(
            "Embedded engine stopped ({} schemas, {} data sources released)",
            schemas,
            sources
        );
    }
}

impl fmt::Debug for EmbeddedEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EmbeddedEngine")
            .field("settings", &self.settings)
            .field("started_at", &self.started_at)
            .finish_non_exhaustive()
    }
}

fn foreign_table_ddl(table: &Table) -> String {
    let columns: Vec<String> = table
        .columns
        .iter()
        .map(|column| {
            let sql_type = sql_type_name(&proto_type_to_arrow_type(&column.data_type, column.is_repeated));
            let mut line = format!("    \"{}\" {}", column.sql_name(), sql_type);
            if !column.is_nullable {
                line.push_str(" NOT NULL");
            }
            line.push_str(&format!(" OPTIONS (NAMEINSOURCE '{}', NATIVE_TYPE '{}'", column.name, column.data_type));
            if let Some(description) = &column.description {
                line.push_str(&format!(", ANNOTATION '{}'", description.replace('\'', "''")));
            }
            line.push(')');
            line
        })
        .collect();

    format!(
        "CREATE FOREIGN TABLE \"{}\" (\n{}\n) OPTIONS (NAMEINSOURCE '{}', UPDATABLE FALSE);",
        table.sql_name(),
        columns.join(",\n"),
        table.type_name
    )
}

fn sql_type_name(data_type: &datafusion::arrow::datatypes::DataType) -> &'static str {
    use datafusion::arrow::datatypes::DataType;
    match data_type {
        DataType::Boolean => "boolean",
        DataType::Int32 => "integer",
        DataType::Int64 | DataType::UInt32 => "long",
        DataType::UInt64 => "biginteger",
        DataType::Float32 => "float",
        DataType::Float64 => "double",
        DataType::Binary => "varbinary",
        _ => "string",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheSettings;
    use crate::models::descriptor::{MetadataType, ModelDescriptor, SourceBinding, PROTOBUF_IMPORT_PROPERTY};
    use crate::models::{ConnectionProperties, Document, ProtobufResource};
    use crate::services::cache::MemoryCacheClient;
    use std::collections::BTreeMap;

    const PROTO: &str = r#"
        package quickstart;
        message Person {
            required int32 id = 1;
            required string name = 2;
            optional string email = 3;
        }
    "#;

    async fn factory(client: &MemoryCacheClient) -> Arc<CacheConnectionFactory> {
        client.create_cache("addressbook");
        let props = ConnectionProperties::new()
            .with("host", "localhost")
            .with("cache", "addressbook");
        let factory = Arc::new(
            CacheConnectionFactory::from_properties(&props, &CacheSettings::default(), Arc::new(client.clone()))
                .unwrap(),
        );

        let conn = factory.create_connection().await.unwrap();
        conn.register_protobuf_file(&ProtobufResource::new("addressbook.proto", PROTO))
            .await
            .unwrap();
        for (id, name) in [(1, "Alice"), (2, "Bob")] {
            let doc = Document::new("quickstart.Person")
                .with_field("id", id)
                .with_field("name", name);
            conn.put_document(&format!("person:{}", id), &doc).await.unwrap();
        }
        conn.close();
        factory
    }

    fn descriptor(translator: &str, source: &str) -> SchemaDescriptor {
        SchemaDescriptor {
            name: "addressbook".to_string(),
            version: 1,
            models: vec![ModelDescriptor {
                name: "ispn".to_string(),
                properties: BTreeMap::from([(
                    PROTOBUF_IMPORT_PROPERTY.to_string(),
                    "addressbook.proto".to_string(),
                )]),
                sources: vec![SourceBinding {
                    name: source.to_string(),
                    translator_name: translator.to_string(),
                    connection_name: source.to_string(),
                }],
                metadata_type: MetadataType::Native,
            }],
        }
    }

    #[tokio::test]
    async fn test_deploy_and_query() {
        let client = MemoryCacheClient::new();
        let engine = EmbeddedEngine::start(EngineSettings::default()).unwrap();
        engine
            .add_data_source("addressbook", factory(&client).await)
            .await
            .unwrap();

        let bytes = descriptor("infinispan-hotrod", "addressbook").to_bytes().unwrap();
        let deployed = engine.deploy_descriptor(&bytes).await.unwrap();
        assert_eq!(deployed.tables().len(), 1);
        assert!(engine.has_descriptor("addressbook", 1).await);

        let conn = engine.connect("addressbook", 1).await.unwrap();
        let result = conn.query("SELECT id, name FROM person ORDER BY id").await.unwrap();
        assert_eq!(result.row_count, 2);
        assert_eq!(result.rows[1][1], serde_json::json!("Bob"));
    }

    #[tokio::test]
    async fn test_duplicate_data_source() {
        let client = MemoryCacheClient::new();
        let engine = EmbeddedEngine::start(EngineSettings::default()).unwrap();
        let factory = factory(&client).await;
        engine.add_data_source("addressbook", Arc::clone(&factory)).await.unwrap();

        let err = engine.add_data_source("addressbook", factory).await.unwrap_err();
        assert!(matches!(err, DriverError::DuplicateDataSource(ref n) if n == "addressbook"));
    }

    #[tokio::test]
    async fn test_deploy_failures() {
        let client = MemoryCacheClient::new();
        let engine = EmbeddedEngine::start(EngineSettings::default()).unwrap();
        engine
            .add_data_source("addressbook", factory(&client).await)
            .await
            .unwrap();

        let err = engine.deploy_descriptor(b"<vdb/>").await.unwrap_err();
        assert!(matches!(err, DeploymentError::Malformed(_)));

        let bytes = descriptor("odata", "addressbook").to_bytes().unwrap();
        let err = engine.deploy_descriptor(&bytes).await.unwrap_err();
        assert!(matches!(err, DeploymentError::TranslatorNotFound(ref t) if t == "odata"));

        let bytes = descriptor("infinispan-hotrod", "other").to_bytes().unwrap();
        let err = engine.deploy_descriptor(&bytes).await.unwrap_err();
        assert!(matches!(err, DeploymentError::DataSourceNotFound(ref s) if s == "other"));

        let mut unbound = descriptor("infinispan-hotrod", "addressbook");
        unbound.models[0].sources.clear();
        let err = engine.deploy_descriptor(&unbound.to_bytes().unwrap()).await.unwrap_err();
        assert!(matches!(err, DeploymentError::Invalid(_)));

        assert!(engine.deployed().await.is_empty());
    }

    #[tokio::test]
    async fn test_redeploy_is_rejected() {
        let client = MemoryCacheClient::new();
        let engine = EmbeddedEngine::start(EngineSettings::default()).unwrap();
        engine
            .add_data_source("addressbook", factory(&client).await)
            .await
            .unwrap();

        let bytes = descriptor("infinispan-hotrod", "addressbook").to_bytes().unwrap();
        engine.deploy_descriptor(&bytes).await.unwrap();
        let err = engine.deploy_descriptor(&bytes).await.unwrap_err();
        assert!(matches!(err, DeploymentError::AlreadyDeployed(ref k) if k.to_string() == "addressbook.1"));
    }

    #[tokio::test]
    async fn test_schema_ddl() {
        let client = MemoryCacheClient::new();
        let engine = EmbeddedEngine::start(EngineSettings::default()).unwrap();
        engine
            .add_data_source("addressbook", factory(&client).await)
            .await
            .unwrap();
        let bytes = descriptor("infinispan-hotrod", "addressbook").to_bytes().unwrap();
        engine.deploy_descriptor(&bytes).await.unwrap();

        let ddl = engine.schema_ddl("addressbook", 1, "ispn").await.unwrap();
        assert!(ddl.starts_with("CREATE FOREIGN TABLE \"person\""));
        assert!(ddl.contains("\"id\" integer NOT NULL"));
        assert!(ddl.contains("\"email\" string OPTIONS"));
        assert!(ddl.contains("NAMEINSOURCE 'quickstart.Person'"));

        assert!(engine.schema_ddl("addressbook", 1, "other").await.is_none());
        assert!(engine.schema_ddl("addressbook", 2, "ispn").await.is_none());
    }

    #[test]
    fn test_unsigned_ddl_types() {
        assert_eq!(sql_type_name(&proto_type_to_arrow_type("fixed32", false)), "long");
        assert_eq!(sql_type_name(&proto_type_to_arrow_type("uint64", false)), "biginteger");
        assert_eq!(sql_type_name(&proto_type_to_arrow_type("int64", false)), "long");
    }

    #[tokio::test]
    async fn test_connect_unknown_schema_and_shutdown() {
        let client = MemoryCacheClient::new();
        let engine = EmbeddedEngine::start(EngineSettings::default()).unwrap();
        let err = engine.connect("addressbook", 1).await.unwrap_err();
        assert!(matches!(err, DriverError::UnknownSchema { version: 1, .. }));

        engine
            .add_data_source("addressbook", factory(&client).await)
            .await
            .unwrap();
        engine.shutdown().await;
        assert!(!engine.has_data_source("addressbook").await);
    }
}
