use serde::{Deserialize, Serialize};

/// Foreign table imported from one protobuf message definition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Table {
    /// Simple message name, used as the SQL table name
    pub name: String,
    /// Fully qualified message name, matched against stored entries
    pub type_name: String,
    pub columns: Vec<Column>,
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    /// Protobuf type as written in the schema (`string`, `int32`, `Address`, ...)
    pub data_type: String,
    pub is_nullable: bool,
    pub is_repeated: bool,
    pub field_number: u32,
    pub description: Option<String>,
}

impl Table {
    /// SQL identifier the table is registered under
    pub fn sql_name(&self) -> String {
        self.name.to_ascii_lowercase()
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name.eq_ignore_ascii_case(name))
    }
}

impl Column {
    /// SQL identifier the column is exposed as
    pub fn sql_name(&self) -> String {
        self.name.to_ascii_lowercase()
    }
}
