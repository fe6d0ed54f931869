// Protobuf-backed catalog
//
// Turns protobuf message definitions into foreign tables and cache documents
// into Arrow record batches for those tables.

use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use datafusion::arrow::array::{
    ArrayRef, BinaryBuilder, BooleanBuilder, Float32Builder, Float64Builder, Int32Builder,
    Int64Builder, StringBuilder, UInt32Builder, UInt64Builder,
};
use datafusion::arrow::datatypes::{DataType, Field, Schema, SchemaRef};
use datafusion::arrow::record_batch::{RecordBatch, RecordBatchOptions};
use serde_json::Value;

use super::protobuf::{FieldLabel, ProtoSchema};
use crate::models::metadata::{Column, Table};
use crate::models::Document;

/// One table per top-level message; nested messages only appear as JSON columns
pub fn tables_from_schema(schema: &ProtoSchema) -> Vec<Table> {
    schema
        .messages
        .iter()
        .filter(|message| !message.nested)
        .map(|message| Table {
            name: message.name.clone(),
            type_name: message.full_name.clone(),
            columns: message
                .fields
                .iter()
                .map(|field| Column {
                    name: field.name.clone(),
                    data_type: field.type_name.clone(),
                    is_nullable: field.label != FieldLabel::Required,
                    is_repeated: field.label == FieldLabel::Repeated,
                    field_number: field.number,
                    description: column_description(schema, &field.type_name, field.is_map),
                })
                .collect(),
            description: None,
        })
        .collect()
}

fn column_description(schema: &ProtoSchema, type_name: &str, is_map: bool) -> Option<String> {
    if is_map {
        Some("map entries as JSON".to_string())
    } else if schema.is_enum(type_name) {
        Some(format!("enum {}", type_name))
    } else if schema.is_message(type_name) {
        Some(format!("message {} as JSON", type_name))
    } else {
        None
    }
}

/// Map a protobuf field type to the Arrow type of its column
///
/// Repeated, enum and message fields are exposed as JSON text.
pub fn proto_type_to_arrow_type(proto_type: &str, repeated: bool) -> DataType {
    if repeated {
        return DataType::Utf8;
    }
    match proto_type {
        "string" => DataType::Utf8,
        "int32" | "sint32" | "sfixed32" => DataType::Int32,
        "int64" | "sint64" | "sfixed64" => DataType::Int64,
        "uint32" | "fixed32" => DataType::UInt32,
        "uint64" | "fixed64" => DataType::UInt64,
        "double" => DataType::Float64,
        "float" => DataType::Float32,
        "bool" => DataType::Boolean,
        "bytes" => DataType::Binary,
        _ => DataType::Utf8,
    }
}

/// Arrow schema of a table; every column is nullable and lower-cased
pub fn table_schema(table: &Table) -> SchemaRef {
    let fields: Vec<Field> = table
        .columns
        .iter()
        .map(|column| {
            Field::new(
                column.sql_name(),
                proto_type_to_arrow_type(&column.data_type, column.is_repeated),
                true,
            )
        })
        .collect();
    Arc::new(Schema::new(fields))
}

/// Build one record batch holding `documents` as rows of `table`
pub fn documents_to_batch(table: &Table, schema: SchemaRef, documents: &[Document]) -> Result<RecordBatch> {
    let mut arrays: Vec<ArrayRef> = Vec::with_capacity(table.columns.len());

    for (column, field) in table.columns.iter().zip(schema.fields().iter()) {
        let values: Vec<Option<&Value>> = documents
            .iter()
            .map(|doc| field_value(doc, &column.name))
            .collect();
        let array = build_array(field.data_type(), &values)
            .with_context(|| format!("column '{}' of table '{}'", column.name, table.name))?;
        arrays.push(array);
    }

    let options = RecordBatchOptions::new().with_row_count(Some(documents.len()));
    RecordBatch::try_new_with_options(schema, arrays, &options)
        .with_context(|| format!("Failed to build record batch for table '{}'", table.name))
}

fn field_value<'a>(doc: &'a Document, name: &str) -> Option<&'a Value> {
    doc.get(name)
        .or_else(|| {
            doc.fields()
                .iter()
                .find(|(key, _)| key.eq_ignore_ascii_case(name))
                .map(|(_, value)| value)
        })
        .filter(|value| !value.is_null())
}

fn build_array(data_type: &DataType, values: &[Option<&Value>]) -> Result<ArrayRef> {
    let array: ArrayRef = match data_type {
        DataType::Utf8 => {
            let mut builder = StringBuilder::new();
            for value in values {
                match value {
                    Some(Value::String(s)) => builder.append_value(s),
                    Some(other) => builder.append_value(other.to_string()),
                    None => builder.append_null(),
                }
            }
            Arc::new(builder.finish())
        }
        DataType::Int32 => {
            let mut builder = Int32Builder::new();
            for value in values {
                match value {
                    Some(v) => {
                        let n = as_i64(v)?;
                        builder.append_value(
                            i32::try_from(n).map_err(|_| anyhow!("{} does not fit in int32", n))?,
                        );
                    }
                    None => builder.append_null(),
                }
            }
            Arc::new(builder.finish())
        }
        DataType::Int64 => {
            let mut builder = Int64Builder::new();
            for value in values {
                match value {
                    Some(v) => builder.append_value(as_i64(v)?),
                    None => builder.append_null(),
                }
            }
            Arc::new(builder.finish())
        }
        DataType::UInt32 => {
            let mut builder = UInt32Builder::new();
            for value in values {
                match value {
                    Some(v) => {
                        let n = as_u64(v)?;
                        builder.append_value(
                            u32::try_from(n).map_err(|_| anyhow!("{} does not fit in uint32", n))?,
                        );
                    }
                    None => builder.append_null(),
                }
            }
            Arc::new(builder.finish())
        }
        DataType::UInt64 => {
            let mut builder = UInt64Builder::new();
            for value in values {
                match value {
                    Some(v) => builder.append_value(as_u64(v)?),
                    None => builder.append_null(),
                }
            }
            Arc::new(builder.finish())
        }
        DataType::Float64 => {
            let mut builder = Float64Builder::new();
            for value in values {
                match value {
                    Some(v) => builder.append_value(as_f64(v)?),
                    None => builder.append_null(),
                }
            }
            Arc::new(builder.finish())
        }
        DataType::Float32 => {
            let mut builder = Float32Builder::new();
            for value in values {
                match value {
                    Some(v) => builder.append_value(as_f64(v)? as f32),
                    None => builder.append_null(),
                }
            }
            Arc::new(builder.finish())
        }
        DataType::Boolean => {
            let mut builder = BooleanBuilder::new();
            for value in values {
                match value {
                    Some(Value::Bool(b)) => builder.append_value(*b),
                    Some(Value::String(s)) if s.eq_ignore_ascii_case("true") => builder.append_value(true),
                    Some(Value::String(s)) if s.eq_ignore_ascii_case("false") => builder.append_value(false),
                    Some(other) => bail!("expected a boolean, found {}", other),
                    None => builder.append_null(),
                }
            }
            Arc::new(builder.finish())
        }
        DataType::Binary => {
            let mut builder = BinaryBuilder::new();
            for value in values {
                match value {
                    Some(v) => builder.append_value(as_bytes(v)?),
                    None => builder.append_null(),
                }
            }
            Arc::new(builder.finish())
        }
        other => bail!("unsupported column type {:?}", other),
    };
    Ok(array)
}

fn as_i64(value: &Value) -> Result<i64> {
    match value {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_u64().and_then(|u| i64::try_from(u).ok()))
            .ok_or_else(|| anyhow!("{} is not an integer in range", n)),
        Value::String(s) => s
            .trim()
            .parse::<i64>()
            .with_context(|| format!("'{}' is not an integer", s)),
        other => bail!("expected an integer, found {}", other),
    }
}

fn as_u64(value: &Value) -> Result<u64> {
    match value {
        Value::Number(n) => n
            .as_u64()
            .ok_or_else(|| anyhow!("{} is not an unsigned integer in range", n)),
        Value::String(s) => s
            .trim()
            .parse::<u64>()
            .with_context(|| format!("'{}' is not an unsigned integer", s)),
        other => bail!("expected an unsigned integer, found {}", other),
    }
}

fn as_f64(value: &Value) -> Result<f64> {
    match value {
        Value::Number(n) => n.as_f64().ok_or_else(|| anyhow!("{} is not a number", n)),
        Value::String(s) => s
            .trim()
            .parse::<f64>()
            .with_context(|| format!("'{}' is not a number", s)),
        other => bail!("expected a number, found {}", other),
    }
}

fn as_bytes(value: &Value) -> Result<Vec<u8>> {
    match value {
        Value::String(s) => Ok(s.as_bytes().to_vec()),
        Value::Array(items) => items
            .iter()
            .map(|item| {
                item.as_u64()
                    .and_then(|b| u8::try_from(b).ok())
                    .ok_or_else(|| anyhow!("{} is not a byte", item))
            })
            .collect(),
        other => bail!("expected bytes, found {}", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::engine::protobuf::parse_proto;
    use datafusion::arrow::array::{Array, Int32Array, StringArray, UInt32Array, UInt64Array};

    const SCHEMA: &str = r#"
        package quickstart;
        message Person {
            required int32 id = 1;
            required string name = 2;
            optional double score = 3;
            optional bool active = 4;
            repeated string tags = 5;
            optional Address address = 6;
            message Address { optional string street = 1; }
        }
    "#;

    fn person_table() -> Table {
        tables_from_schema(&parse_proto(SCHEMA).unwrap()).remove(0)
    }

    #[test]
    fn test_nested_messages_are_not_tables() {
        let tables = tables_from_schema(&parse_proto(SCHEMA).unwrap());
        assert_eq!(tables.len(), 1);
        assert_eq!(tables[0].name, "Person");
        assert_eq!(tables[0].type_name, "quickstart.Person");
    }

    #[test]
    fn test_type_mapping() {
        assert_eq!(proto_type_to_arrow_type("string", false), DataType::Utf8);
        assert_eq!(proto_type_to_arrow_type("sint32", false), DataType::Int32);
        assert_eq!(proto_type_to_arrow_type("sfixed64", false), DataType::Int64);
        assert_eq!(proto_type_to_arrow_type("uint32", false), DataType::UInt32);
        assert_eq!(proto_type_to_arrow_type("fixed32", false), DataType::UInt32);
        assert_eq!(proto_type_to_arrow_type("uint64", false), DataType::UInt64);
        assert_eq!(proto_type_to_arrow_type("fixed64", false), DataType::UInt64);
        assert_eq!(proto_type_to_arrow_type("float", false), DataType::Float32);
        assert_eq!(proto_type_to_arrow_type("bool", false), DataType::Boolean);
        assert_eq!(proto_type_to_arrow_type("bytes", false), DataType::Binary);
        assert_eq!(proto_type_to_arrow_type("int32", true), DataType::Utf8);
        assert_eq!(proto_type_to_arrow_type("Address", false), DataType::Utf8);
    }

    #[test]
    fn test_columns() {
        let table = person_table();
        let id = table.column("ID").unwrap();
        assert!(!id.is_nullable);
        assert_eq!(id.field_number, 1);
        assert!(table.column("tags").unwrap().is_repeated);
        assert_eq!(
            table.column("address").unwrap().description.as_deref(),
            Some("message Address as JSON")
        );

        let schema = table_schema(&table);
        assert_eq!(schema.field(0).name(), "id");
        assert!(schema.fields().iter().all(|f| f.is_nullable()));
    }

    #[test]
    fn test_documents_to_batch() {
        let table = person_table();
        let schema = table_schema(&table);
        let docs = vec![
            Document::new("quickstart.Person")
                .with_field("id", 1)
                .with_field("name", "Alice")
                .with_field("tags", serde_json::json!(["a", "b"])),
            Document::new("quickstart.Person")
                .with_field("id", "2")
                .with_field("NAME", "Bob")
                .with_field("active", true),
        ];

        let batch = documents_to_batch(&table, schema, &docs).unwrap();
        assert_eq!(batch.num_rows(), 2);

        let ids = batch.column(0).as_any().downcast_ref::<Int32Array>().unwrap();
        assert_eq!(ids.value(1), 2);
        let names = batch.column(1).as_any().downcast_ref::<StringArray>().unwrap();
        assert_eq!(names.value(1), "Bob");
        let tags = batch.column(4).as_any().downcast_ref::<StringArray>().unwrap();
        assert_eq!(tags.value(0), r#"["a","b"]"#);
        assert!(tags.is_null(1));
    }

    #[test]
    fn test_type_mismatch_names_column() {
        let table = person_table();
        let schema = table_schema(&table);
        let docs = vec![Document::new("quickstart.Person").with_field("id", "not a number")];

        let err = documents_to_batch(&table, schema, &docs).unwrap_err();
        assert!(format!("{:#}", err).contains("column 'id'"));
    }

    #[test]
    fn test_unsigned_columns_keep_full_range() {
        let schema = parse_proto(
            "package p; message Counter { optional string name = 1; optional uint64 hits = 2; optional fixed32 small = 3; }",
        )
        .unwrap();
        let table = tables_from_schema(&schema).remove(0);
        let docs = vec![
            Document::new("p.Counter")
                .with_field("name", "max")
                .with_field("hits", u64::MAX)
                .with_field("small", u32::MAX),
            Document::new("p.Counter").with_field("name", "text").with_field("hits", "42"),
        ];

        let batch = documents_to_batch(&table, table_schema(&table), &docs).unwrap();
        let hits = batch.column(1).as_any().downcast_ref::<UInt64Array>().unwrap();
        assert_eq!(hits.value(0), u64::MAX);
        assert_eq!(hits.value(1), 42);
        let small = batch.column(2).as_any().downcast_ref::<UInt32Array>().unwrap();
        assert_eq!(small.value(0), u32::MAX);
        assert!(small.is_null(1));

        let negative = vec![Document::new("p.Counter").with_field("hits", -1)];
        let err = documents_to_batch(&table, table_schema(&table), &negative).unwrap_err();
        assert!(format!("{:#}", err).contains("column 'hits'"));
    }

    #[test]
    fn test_empty_batch() {
        let table = person_table();
        let batch = documents_to_batch(&table, table_schema(&table), &[]).unwrap();
        assert_eq!(batch.num_rows(), 0);
    }
}
