// Cache translator
//
// The engine-side adapter for cache data sources: imports table metadata
// from the schema resource named in a model's properties and builds the
// table providers that read from the cache.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use datafusion::datasource::TableProvider;
use thiserror::Error;

use super::catalog::tables_from_schema;
use super::protobuf::parse_proto;
use super::table::CacheTable;
use crate::error::DriverError;
use crate::models::descriptor::PROTOBUF_IMPORT_PROPERTY;
use crate::models::metadata::Table;
use crate::services::cache::CacheHandle;
use crate::services::connection::CacheConnection;
use crate::services::connection_factory::CacheConnectionFactory;

/// Name the cache translator registers under by default
pub const CACHE_TRANSLATOR_NAME: &str = "infinispan-hotrod";

#[derive(Debug, Error)]
pub enum TranslatorError {
    #[error("Model property '{0}' is required")]
    MissingProperty(String),

    #[error("Schema resource '{0}' not found in the protobuf metadata cache")]
    ResourceNotFound(String),

    #[error("Schema resource '{resource}' is invalid: {source:#}")]
    InvalidSchema {
        resource: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("Cache access failed: {0}")]
    Cache(#[source] Box<DriverError>),
}

impl From<DriverError> for TranslatorError {
    fn from(err: DriverError) -> Self {
        TranslatorError::Cache(Box::new(err))
    }
}

#[async_trait]
pub trait Translator: Send + Sync {
    fn name(&self) -> &str;

    /// Tables described by the model's schema resource
    async fn import_metadata(
        &self,
        connection: &CacheConnection,
        properties: &BTreeMap<String, String>,
    ) -> Result<Vec<Table>, TranslatorError>;

    fn table_provider(&self, table: &Table, factory: Arc<CacheConnectionFactory>) -> Arc<dyn TableProvider>;
}

/// Read-only translator over protobuf-described cache entries
#[derive(Debug, Clone)]
pub struct CacheTranslator {
    name: String,
}

impl CacheTranslator {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl Default for CacheTranslator {
    fn default() -> Self {
        Self::new(CACHE_TRANSLATOR_NAME)
    }
}

#[async_trait]
impl Translator for CacheTranslator {
    fn name(&self) -> &str {
        &self.name
    }

    async fn import_metadata(
        &self,
        connection: &CacheConnection,
        properties: &BTreeMap<String, String>,
    ) -> Result<Vec<Table>, TranslatorError> {
        let resource = properties
            .get(PROTOBUF_IMPORT_PROPERTY)
            .ok_or_else(|| TranslatorError::MissingProperty(PROTOBUF_IMPORT_PROPERTY.to_string()))?;

        let metadata_cache = connection
            .get_cache::<String, String>(&protobuf_metadata_cache(connection), false)
            .await?;
        let contents = lookup_resource(&metadata_cache, resource)
            .await?
            .ok_or_else(|| TranslatorError::ResourceNotFound(resource.clone()))?;

        let schema = parse_proto(&contents).map_err(|source| TranslatorError::InvalidSchema {
            resource: resource.clone(),
            source,
        })?;
        let tables = tables_from_schema(&schema);
        if tables.is_empty() {
            tracing::warn!("Schema resource '{}' defines no messages", resource);
        }

        tracing::info!(
            "Imported {} tables from '{}' for cache '{}'",
            tables.len(),
            resource,
            connection.cache_name()
        );
        Ok(tables)
    }

    fn table_provider(&self, table: &Table, factory: Arc<CacheConnectionFactory>) -> Arc<dyn TableProvider> {
        Arc::new(CacheTable::new(table.clone(), factory))
    }
}

fn protobuf_metadata_cache(connection: &CacheConnection) -> String {
    connection.factory().cache_settings().protobuf_metadata_cache.clone()
}

/// Resource names are matched as given, then with or without a leading '/'
async fn lookup_resource(
    cache: &CacheHandle<String, String>,
    resource: &str,
) -> Result<Option<String>, DriverError> {
    let alternate = match resource.strip_prefix('/') {
        Some(stripped) => stripped.to_string(),
        None => format!("/{}", resource),
    };
    for candidate in [resource.to_string(), alternate] {
        if let Some(contents) = cache.get(&candidate).await? {
            return Ok(Some(contents));
        }
    }
    Ok(None)
}
