// Schema deployment
//
// Builds the descriptor that exposes a cache as a SQL schema and deploys it
// into the embedded engine once per (name, version).

use std::collections::BTreeMap;

use crate::error::{DriverError, Result};
use crate::models::descriptor::{
    MetadataType, ModelDescriptor, SchemaDescriptor, SourceBinding, DESCRIPTOR_VERSION, MODEL_NAME,
    PROTOBUF_IMPORT_PROPERTY,
};
use crate::models::properties::{keys, ConnectionProperties};
use crate::services::engine::{DeploymentError, EmbeddedEngine};

/// Build the descriptor for the cache named in `props`
///
/// The schema, its single source binding and the data source all carry the
/// cache name; the model imports its tables from the `protobuf` resource.
pub fn build_descriptor(props: &ConnectionProperties, translator_name: &str) -> Result<SchemaDescriptor> {
    let cache = props
        .cache()
        .ok_or_else(|| DriverError::InvalidProperty(format!("'{}' is required", keys::CACHE)))?;
    let protobuf = props
        .protobuf()
        .ok_or_else(|| DriverError::MissingSchemaResource(cache.to_string()))?;

    Ok(SchemaDescriptor {
        name: cache.to_string(),
        version: DESCRIPTOR_VERSION,
        models: vec![ModelDescriptor {
            name: MODEL_NAME.to_string(),
            properties: BTreeMap::from([(PROTOBUF_IMPORT_PROPERTY.to_string(), protobuf.to_string())]),
            sources: vec![SourceBinding {
                name: cache.to_string(),
                translator_name: translator_name.to_string(),
                connection_name: cache.to_string(),
            }],
            metadata_type: MetadataType::Native,
        }],
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeployOutcome {
    Deployed,
    AlreadyDeployed,
}

pub struct SchemaDeployer;

impl SchemaDeployer {
    /// Deploy `descriptor` unless a schema with its name and version is already active
    pub async fn deploy(descriptor: &SchemaDescriptor, engine: &EmbeddedEngine) -> Result<DeployOutcome> {
        let key = descriptor.key();
        if engine.has_descriptor(&key.name, key.version).await {
            tracing::debug!("Schema '{}' already deployed", key);
            return Ok(DeployOutcome::AlreadyDeployed);
        }

        let failed = |source: DeploymentError| DriverError::SchemaDeployment {
            name: key.to_string(),
            source,
        };
        let bytes = descriptor
            .to_bytes()
            .map_err(|e| failed(DeploymentError::Malformed(e)))?;

        match engine.deploy_descriptor(&bytes).await {
            Ok(_) => Ok(DeployOutcome::Deployed),
            Err(DeploymentError::AlreadyDeployed(_)) => Ok(DeployOutcome::AlreadyDeployed),
            Err(e) => {
                tracing::error!("Deployment of schema '{}' failed: {}", key, e);
                Err(failed(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CacheSettings, EngineSettings};
    use crate::models::ProtobufResource;
    use crate::services::cache::MemoryCacheClient;
    use crate::services::connection_factory::CacheConnectionFactory;
    use crate::services::engine::{TranslatorError, CACHE_TRANSLATOR_NAME};
    use std::sync::Arc;

    fn props() -> ConnectionProperties {
        ConnectionProperties::new()
            .with("host", "localhost")
            .with("port", "11222")
            .with("cache", "addressbook")
            .with("protobuf", "addressbook.proto")
    }

    #[test]
    fn test_build_descriptor() {
        let descriptor = build_descriptor(&props(), CACHE_TRANSLATOR_NAME).unwrap();
        assert_eq!(descriptor.name, "addressbook");
        assert_eq!(descriptor.version, DESCRIPTOR_VERSION);

        let (model, source) = descriptor.single_source().unwrap();
        assert_eq!(model.name, MODEL_NAME);
        assert_eq!(
            model.properties.get(PROTOBUF_IMPORT_PROPERTY).map(String::as_str),
            Some("addressbook.proto")
        );
        assert_eq!(source.translator_name, "infinispan-hotrod");
        assert_eq!(source.connection_name, "addressbook");
    }

    #[test]
    fn test_missing_schema_resource() {
        let props = ConnectionProperties::new().with("host", "localhost").with("cache", "addressbook");
        let err = build_descriptor(&props, CACHE_TRANSLATOR_NAME).unwrap_err();
        assert!(matches!(err, DriverError::MissingSchemaResource(ref c) if c == "addressbook"));
    }

    #[test]
    fn test_missing_cache() {
        let props = ConnectionProperties::new()
            .with("host", "localhost")
            .with("protobuf", "addressbook.proto");
        let err = build_descriptor(&props, CACHE_TRANSLATOR_NAME).unwrap_err();
        assert!(matches!(err, DriverError::InvalidProperty(_)));
    }

    async fn engine_with_source(client: &MemoryCacheClient) -> EmbeddedEngine {
        client.create_cache("addressbook");
        let factory = Arc::new(
            CacheConnectionFactory::from_properties(&props(), &CacheSettings::default(), Arc::new(client.clone()))
                .unwrap(),
        );
        let engine = EmbeddedEngine::start(EngineSettings::default()).unwrap();
        engine.add_data_source("addressbook", factory).await.unwrap();
        engine
    }

    #[tokio::test]
    async fn test_deploy_is_idempotent() {
        let client = MemoryCacheClient::new();
        let engine = engine_with_source(&client).await;
        let factory = engine.data_source("addressbook").await.unwrap();
        factory
            .register_protobuf_file(&ProtobufResource::new(
                "addressbook.proto",
                "message Person { required int32 id = 1; }",
            ))
            .await
            .unwrap();

        let descriptor = build_descriptor(&props(), CACHE_TRANSLATOR_NAME).unwrap();
        assert_eq!(
            SchemaDeployer::deploy(&descriptor, &engine).await.unwrap(),
            DeployOutcome::Deployed
        );
        assert_eq!(
            SchemaDeployer::deploy(&descriptor, &engine).await.unwrap(),
            DeployOutcome::AlreadyDeployed
        );
        assert_eq!(engine.deployed().await.len(), 1);
    }

    #[tokio::test]
    async fn test_unresolvable_resource() {
        let client = MemoryCacheClient::new();
        let engine = engine_with_source(&client).await;

        let descriptor = build_descriptor(&props(), CACHE_TRANSLATOR_NAME).unwrap();
        let err = SchemaDeployer::deploy(&descriptor, &engine).await.unwrap_err();
        match err {
            DriverError::SchemaDeployment { name, source } => {
                assert_eq!(name, "addressbook.1");
                assert!(matches!(
                    source,
                    DeploymentError::Import(TranslatorError::ResourceNotFound(_))
                ));
            }
            other => panic!("unexpected error: {:?}", other),
        }
        assert!(!engine.has_descriptor("addressbook", 1).await);
    }

    #[tokio::test]
    async fn test_unknown_translator_and_data_source() {
        let client = MemoryCacheClient::new();
        let engine = engine_with_source(&client).await;

        let descriptor = build_descriptor(&props(), "odata").unwrap();
        let err = SchemaDeployer::deploy(&descriptor, &engine).await.unwrap_err();
        assert!(matches!(
            err,
            DriverError::SchemaDeployment {
                source: DeploymentError::TranslatorNotFound(_),
                ..
            }
        ));

        let other = props().with("cache", "other");
        let descriptor = build_descriptor(&other, CACHE_TRANSLATOR_NAME).unwrap();
        let err = SchemaDeployer::deploy(&descriptor, &engine).await.unwrap_err();
        assert!(matches!(
            err,
            DriverError::SchemaDeployment {
                source: DeploymentError::DataSourceNotFound(_),
                ..
            }
        ));
    }
}
