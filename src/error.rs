use std::time::Duration;

use datafusion::error::DataFusionError;
use thiserror::Error;

use crate::services::cache::CacheClientError;
use crate::services::engine::DeploymentError;
use crate::services::marshaller::MarshallerError;

/// Driver error types
///
/// Every failure surfaced by `connect` and by the cache-access layer is one of
/// these. Client input errors (`MalformedUrl`, `InvalidProperty`) are raised
/// before the engine is touched.
#[derive(Debug, Error)]
pub enum DriverError {
    #[error("Malformed URL: {0}")]
    MalformedUrl(String),

    #[error("Invalid connection property: {0}")]
    InvalidProperty(String),

    #[error("Failed to open cache '{cache}': {source}")]
    ConnectionInit {
        cache: String,
        #[source]
        source: CacheClientError,
    },

    #[error("Failed to provision cache '{cache}': {source}")]
    CacheProvision {
        cache: String,
        #[source]
        source: CacheClientError,
    },

    #[error("A marshaller for type '{0}' is already registered on this serialization context")]
    DuplicateMarshaller(String),

    #[error("Data source '{0}' is already registered")]
    DuplicateDataSource(String),

    #[error("No schema resource ('protobuf' property) supplied for cache '{0}'")]
    MissingSchemaResource(String),

    #[error("Failed to deploy schema '{name}': {source}")]
    SchemaDeployment {
        name: String,
        #[source]
        source: DeploymentError,
    },

    #[error("Schema '{name}' version {version} is not deployed")]
    UnknownSchema { name: String, version: u32 },

    #[error(transparent)]
    Cache(#[from] CacheClientError),

    #[error("Marshalling error: {0}")]
    Marshalling(MarshallerError),

    #[error("Invalid SQL: {0}")]
    InvalidSql(String),

    #[error("Query error: {0}")]
    Query(#[from] DataFusionError),

    #[error("Query timeout after {0:?}")]
    Timeout(Duration),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Duplicate registrations keep their own variant; everything else is a
/// marshalling failure.
impl From<MarshallerError> for DriverError {
    fn from(err: MarshallerError) -> Self {
        match err {
            MarshallerError::Duplicate(type_name) => DriverError::DuplicateMarshaller(type_name),
            other => DriverError::Marshalling(other),
        }
    }
}

/// Convert anyhow::Error to DriverError
impl From<anyhow::Error> for DriverError {
    fn from(err: anyhow::Error) -> Self {
        DriverError::Internal(format!("{:#}", err))
    }
}

/// Result type for driver operations
pub type Result<T> = std::result::Result<T, DriverError>;
