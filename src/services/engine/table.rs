// Cache-backed table provider
//
// Every scan opens a connection on the data source, reads the entries of the
// table's message type and hands them to an in-memory table for projection
// and limits.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use datafusion::arrow::datatypes::SchemaRef;
use datafusion::catalog::Session;
use datafusion::common::Result;
use datafusion::datasource::{MemTable, TableProvider, TableType};
use datafusion::error::DataFusionError;
use datafusion::logical_expr::Expr;
use datafusion::physical_plan::ExecutionPlan;

use super::catalog::{documents_to_batch, table_schema};
use crate::models::metadata::Table;
use crate::services::connection_factory::CacheConnectionFactory;

pub struct CacheTable {
    table: Table,
    schema: SchemaRef,
    factory: Arc<CacheConnectionFactory>,
}

impl CacheTable {
    pub fn new(table: Table, factory: Arc<CacheConnectionFactory>) -> Self {
        let schema = table_schema(&table);
        Self {
            table,
            schema,
            factory,
        }
    }

    pub fn table(&self) -> &Table {
        &self.table
    }
}

impl fmt::Debug for CacheTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheTable")
            .field("table", &self.table.name)
            .field("type_name", &self.table.type_name)
            .field("cache", &self.factory.cache_name())
            .finish()
    }
}

#[async_trait]
impl TableProvider for CacheTable {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn schema(&self) -> SchemaRef {
        Arc::clone(&self.schema)
    }

    fn table_type(&self) -> TableType {
        TableType::Base
    }

    async fn scan(
        &self,
        state: &dyn Session,
        projection: Option<&Vec<usize>>,
        filters: &[Expr],
        limit: Option<usize>,
    ) -> Result<Arc<dyn ExecutionPlan>> {
        let connection = self
            .factory
            .create_connection()
            .await
            .map_err(|e| DataFusionError::External(Box::new(e)))?;
        let documents = connection
            .documents(&self.table.type_name)
            .await
            .map_err(|e| DataFusionError::External(Box::new(e)))?;
        connection.close();

        tracing::debug!(
            "Scanning {} '{}' entries from cache '{}'",
            documents.len(),
            self.table.type_name,
            self.factory.cache_name()
        );

        let documents: Vec<_> = documents.into_iter().map(|(_, doc)| doc).collect();
        let batch = documents_to_batch(&self.table, Arc::clone(&self.schema), &documents)
            .map_err(|e| DataFusionError::External(e.into()))?;

        let mem = MemTable::try_new(Arc::clone(&self.schema), vec![vec![batch]])?;
        mem.scan(state, projection, filters, limit).await
    }
}
