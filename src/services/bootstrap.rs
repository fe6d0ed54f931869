// Engine bootstrap
//
// Owns the embedded engine and serializes the first-use steps that populate
// it: starting the engine, registering a cache as a data source and deploying
// the cache's schema.

use std::sync::Arc;

use tokio::sync::Mutex;

use crate::config::{CacheSettings, Config, EngineSettings};
use crate::error::{DriverError, Result};
use crate::models::descriptor::DESCRIPTOR_VERSION;
use crate::models::properties::ConnectionProperties;
use crate::services::cache::CacheClient;
use crate::services::connection_factory::CacheConnectionFactory;
use crate::services::deployment::{build_descriptor, DeployOutcome, SchemaDeployer};
use crate::services::engine::{EmbeddedEngine, SqlConnection};

pub struct EngineBootstrap {
    engine_settings: EngineSettings,
    cache_settings: CacheSettings,
    client: Arc<dyn CacheClient>,
    engine: Mutex<Option<Arc<EmbeddedEngine>>>,
}

impl EngineBootstrap {
    pub fn new(engine_settings: EngineSettings, cache_settings: CacheSettings, client: Arc<dyn CacheClient>) -> Self {
        Self {
            engine_settings,
            cache_settings,
            client,
            engine: Mutex::new(None),
        }
    }

    pub fn from_config(config: &Config, client: Arc<dyn CacheClient>) -> Self {
        Self::new(config.engine.clone(), config.cache.clone(), client)
    }

    /// The running engine, started on first call
    pub async fn engine(&self) -> Result<Arc<EmbeddedEngine>> {
        let mut guard = self.engine.lock().await;
        self.start_locked(&mut guard)
    }

    pub async fn is_started(&self) -> bool {
        self.engine.lock().await.is_some()
    }

    pub async fn has_data_source(&self, name: &str) -> bool {
        let engine = self.engine.lock().await.clone();
        match engine {
            Some(engine) => engine.has_data_source(name).await,
            None => false,
        }
    }

    pub async fn add_data_source(&self, name: &str, factory: Arc<CacheConnectionFactory>) -> Result<()> {
        self.engine().await?.add_data_source(name, factory).await
    }

    /// Make the cache named in `props` queryable
    ///
    /// Runs under the bootstrap lock so concurrent first connections to the
    /// same cache register one data source and deploy one schema.
    pub async fn prepare(&self, props: &ConnectionProperties) -> Result<Arc<EmbeddedEngine>> {
        let descriptor = build_descriptor(props, &self.engine_settings.translator_name)?;

        let mut guard = self.engine.lock().await;
        let engine = self.start_locked(&mut guard)?;

        if !engine.has_data_source(&descriptor.name).await {
            let factory = CacheConnectionFactory::from_properties(props, &self.cache_settings, Arc::clone(&self.client))?;
            engine.add_data_source(&descriptor.name, Arc::new(factory)).await?;
        }

        if SchemaDeployer::deploy(&descriptor, &engine).await? == DeployOutcome::Deployed {
            if let Some((model, _)) = descriptor.single_source() {
                if let Some(ddl) = engine.schema_ddl(&descriptor.name, descriptor.version, &model.name).await {
                    tracing::debug!("Schema '{}':\n{}", descriptor.key(), ddl);
                }
            }
        }

        Ok(engine)
    }

    /// Prepare the cache named in `props` and open a SQL connection on its schema
    pub async fn connect(&self, props: &ConnectionProperties) -> Result<SqlConnection> {
        let engine = self.prepare(props).await?;
        let cache = props
            .cache()
            .ok_or_else(|| DriverError::InvalidProperty("'cache' is required".to_string()))?;
        engine.connect(cache, DESCRIPTOR_VERSION).await
    }

    /// Stop the engine; the next use starts a fresh one
    pub async fn shutdown(&self) {
        let engine = self.engine.lock().await.take();
        if let Some(engine) = engine {
            engine.shutdown().await;
        }
    }

    fn start_locked(&self, slot: &mut Option<Arc<EmbeddedEngine>>) -> Result<Arc<EmbeddedEngine>> {
        if let Some(engine) = slot.as_ref() {
            return Ok(Arc::clone(engine));
        }
        let engine = Arc::new(EmbeddedEngine::start(self.engine_settings.clone())?);
        *slot = Some(Arc::clone(&engine));
        Ok(engine)
    }
}
