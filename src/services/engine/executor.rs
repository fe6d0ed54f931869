// SQL connection on a deployed schema
//
// Validates, plans and executes SQL under the engine's query timeout.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use datafusion::arrow::array::RecordBatch;
use datafusion::arrow::datatypes::SchemaRef;
use datafusion::logical_expr::LogicalPlan;
use tokio::time::timeout;
use uuid::Uuid;

use super::converter::ResultConverter;
use super::embedded::DeployedSchema;
use crate::error::{DriverError, Result};
use crate::models::metadata::Table;
use crate::models::query::QueryResult;
use crate::validation::SqlValidator;

/// Query execution result containing record batches
#[derive(Debug)]
pub struct QueryExecutionResult {
    pub schema: SchemaRef,
    pub batches: Vec<RecordBatch>,
    pub row_count: usize,
    pub execution_time_ms: u128,
}

impl QueryExecutionResult {
    pub fn from_batches(schema: SchemaRef, batches: Vec<RecordBatch>, execution_time_ms: u128) -> Self {
        let row_count = batches.iter().map(|batch| batch.num_rows()).sum();

        Self {
            schema,
            batches,
            row_count,
            execution_time_ms,
        }
    }
}

/// Connection returned by the driver
///
/// Queries run against the tables of one deployed schema. Every statement is
/// checked by the read-only guard before it is planned; parsed plans are kept
/// in the schema's plan cache keyed by the trimmed SQL text.
pub struct SqlConnection {
    id: Uuid,
    schema: Arc<DeployedSchema>,
    timeout: Duration,
    connected_at: DateTime<Utc>,
}

impl SqlConnection {
    pub(crate) fn new(schema: Arc<DeployedSchema>, timeout: Duration) -> Self {
        let id = Uuid::new_v4();
        tracing::debug!("SQL connection {} opened on schema '{}'", id, schema.key());
        Self {
            id,
            schema,
            timeout,
            connected_at: Utc::now(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn schema_name(&self) -> &str {
        &self.schema.descriptor().name
    }

    pub fn schema_version(&self) -> u32 {
        self.schema.descriptor().version
    }

    pub fn tables(&self) -> &[Table] {
        self.schema.tables()
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Execute a read-only statement and collect its batches
    pub async fn execute(&self, sql: &str) -> Result<QueryExecutionResult> {
        SqlValidator::validate_read_only(sql)?;
        let start_time = Instant::now();

        let (schema, batches) = timeout(self.timeout, async {
            let plan = self.logical_plan(sql).await?;
            let df = self.schema.context().execute_logical_plan(plan).await?;
            let schema = Arc::clone(df.schema().inner());
            let batches = df.collect().await?;
            Ok::<_, DriverError>((schema, batches))
        })
        .await
        .map_err(|_| DriverError::Timeout(self.timeout))??;

        let result = QueryExecutionResult::from_batches(schema, batches, start_time.elapsed().as_millis());
        tracing::debug!(
            "Query on '{}' returned {} rows in {} ms",
            self.schema.key(),
            result.row_count,
            result.execution_time_ms
        );
        Ok(result)
    }

    /// Execute a read-only statement and convert the rows to JSON
    pub async fn query(&self, sql: &str) -> Result<QueryResult> {
        let result = self.execute(sql).await?;
        Ok(ResultConverter::convert_to_query_result(result.schema, &result.batches)?)
    }

    /// Logical and physical plan of a statement, one `plan_type: plan` block per stage
    pub async fn explain(&self, sql: &str) -> Result<String> {
        let explained = self.query(&format!("EXPLAIN {}", sql.trim().trim_end_matches(';'))).await?;
        let lines: Vec<String> = explained
            .rows
            .iter()
            .map(|row| {
                row.iter()
                    .map(|value| value.as_str().map(str::to_string).unwrap_or_else(|| value.to_string()))
                    .collect::<Vec<_>>()
                    .join(": ")
            })
            .collect();
        Ok(lines.join("\n"))
    }

    async fn logical_plan(&self, sql: &str) -> Result<LogicalPlan> {
        let key = sql.trim().to_string();
        let plans = self.schema.plans();
        if let Some(plan) = plans.get(&key) {
            tracing::trace!("Plan cache hit for '{}'", key);
            return Ok(plan);
        }

        let plan = self.schema.context().state().create_logical_plan(sql).await?;
        plans.put(key, plan.clone());
        Ok(plan)
    }
}

impl fmt::Debug for SqlConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SqlConnection")
            .field("id", &self.id)
            .field("schema", &self.schema.key().to_string())
            .field("timeout", &self.timeout)
            .field("connected_at", &self.connected_at)
            .finish()
    }
}
