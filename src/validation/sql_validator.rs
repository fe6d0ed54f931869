use sqlparser::ast::Statement;
use sqlparser::dialect::GenericDialect;
use sqlparser::parser::Parser;

use crate::error::{DriverError, Result};

/// Guards the read-only cache translator against statements it cannot run
pub struct SqlValidator;

impl SqlValidator {
    /// Accept exactly one query, EXPLAIN of a query, or catalog SHOW statement
    pub fn validate_read_only(sql: &str) -> Result<()> {
        let dialect = GenericDialect {};
        let statements = Parser::parse_sql(&dialect, sql)
            .map_err(|e| DriverError::InvalidSql(format!("SQL parsing error: {}", e)))?;

        match statements.as_slice() {
            [] => Err(DriverError::InvalidSql("Empty SQL query".to_string())),
            [statement] => Self::check_statement(statement),
            _ => Err(DriverError::InvalidSql(format!(
                "Expected a single statement, found {}",
                statements.len()
            ))),
        }
    }

    fn check_statement(statement: &Statement) -> Result<()> {
        match statement {
            Statement::Query(_) | Statement::ShowTables { .. } | Statement::ShowColumns { .. } => Ok(()),
            Statement::Explain { statement, .. } => Self::check_statement(statement),
            Statement::Insert { .. } => Err(read_only("INSERT")),
            Statement::Update { .. } => Err(read_only("UPDATE")),
            Statement::Delete { .. } => Err(read_only("DELETE")),
            Statement::Drop { .. } => Err(read_only("DROP")),
            Statement::CreateTable { .. } => Err(read_only("CREATE TABLE")),
            Statement::AlterTable { .. } => Err(read_only("ALTER TABLE")),
            other => Err(DriverError::InvalidSql(format!(
                "Only queries are permitted on cache tables. Found: {}",
                other
            ))),
        }
    }
}

fn read_only(kind: &str) -> DriverError {
    DriverError::InvalidSql(format!(
        "{} statements are not allowed. Cache tables are read-only.",
        kind
    ))
}
