// Engine session factory
//
// Builds the DataFusion SessionContext each deployed schema queries through.

use std::sync::Arc;

use anyhow::{Context, Result};
use datafusion::execution::disk_manager::{DiskManagerBuilder, DiskManagerMode};
use datafusion::execution::runtime_env::{RuntimeEnv, RuntimeEnvBuilder};
use datafusion::execution::SessionStateBuilder;
use datafusion::prelude::{SessionConfig, SessionContext};

use crate::config::EngineSettings;

/// Creates sessions sharing one runtime environment
///
/// Spilling to disk is disabled: every intermediate result of a cache query
/// stays in memory.
pub struct EngineSessionFactory {
    batch_size: usize,
    target_partitions: usize,
    runtime: Arc<RuntimeEnv>,
}

impl EngineSessionFactory {
    pub fn new(settings: &EngineSettings) -> Result<Self> {
        let runtime = RuntimeEnvBuilder::new()
            .with_disk_manager_builder(DiskManagerBuilder::default().with_mode(DiskManagerMode::Disabled))
            .build_arc()
            .context("Failed to build engine runtime")?;

        Ok(Self {
            batch_size: settings.batch_size.max(1),
            target_partitions: settings.target_partitions.max(1),
            runtime,
        })
    }

    /// Create a session whose default catalog and schema are `catalog`.`schema`
    ///
    /// Unqualified table names resolve against that pair, so tables registered
    /// for a model are reachable by their bare names.
    pub fn create_session(&self, catalog: &str, schema: &str) -> SessionContext {
        let config = SessionConfig::new()
            .with_batch_size(self.batch_size)
            .with_target_partitions(self.target_partitions)
            .with_create_default_catalog_and_schema(true)
            .with_default_catalog_and_schema(catalog, schema)
            .with_information_schema(true);

        let state = SessionStateBuilder::new()
            .with_config(config)
            .with_runtime_env(Arc::clone(&self.runtime))
            .with_default_features()
            .build();

        SessionContext::new_with_state(state)
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn target_partitions(&self) -> usize {
        self.target_partitions
    }
}
