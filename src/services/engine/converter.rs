// Result converter
//
// Converts Arrow record batches into the JSON QueryResult handed to callers.

use anyhow::{anyhow, Result};
use chrono::{DateTime, NaiveDate};
use datafusion::arrow::array::*;
use datafusion::arrow::datatypes::{DataType, SchemaRef, TimeUnit};
use datafusion::arrow::record_batch::RecordBatch;
use serde_json::{json, Value as JsonValue};

use crate::models::query::QueryResult;

/// Days between 0001-01-01 and 1970-01-01
const UNIX_EPOCH_DAYS_FROM_CE: i32 = 719_163;

macro_rules! downcast {
    ($array:expr, $ty:ty) => {
        $array
            .as_any()
            .downcast_ref::<$ty>()
            .ok_or_else(|| anyhow!(concat!("Failed to downcast to ", stringify!($ty))))?
    };
}

pub struct ResultConverter;

impl ResultConverter {
    /// Convert record batches into column names plus JSON rows
    pub fn convert_to_query_result(schema: SchemaRef, batches: &[RecordBatch]) -> Result<QueryResult> {
        let columns: Vec<String> = schema.fields().iter().map(|f| f.name().clone()).collect();

        let mut rows = Vec::new();
        for batch in batches {
            for row_idx in 0..batch.num_rows() {
                let row = batch
                    .columns()
                    .iter()
                    .map(|column| Self::array_value_to_json(column, row_idx))
                    .collect::<Result<Vec<_>>>()?;
                rows.push(row);
            }
        }

        let row_count = rows.len();
        Ok(QueryResult {
            columns,
            rows,
            row_count,
        })
    }

    fn array_value_to_json(array: &ArrayRef, row_idx: usize) -> Result<JsonValue> {
        if array.is_null(row_idx) {
            return Ok(JsonValue::Null);
        }

        let value = match array.data_type() {
            DataType::Boolean => json!(downcast!(array, BooleanArray).value(row_idx)),

            DataType::Int8 => json!(downcast!(array, Int8Array).value(row_idx)),
            DataType::Int16 => json!(downcast!(array, Int16Array).value(row_idx)),
            DataType::Int32 => json!(downcast!(array, Int32Array).value(row_idx)),
            DataType::Int64 => json!(downcast!(array, Int64Array).value(row_idx)),
            DataType::UInt8 => json!(downcast!(array, UInt8Array).value(row_idx)),
            DataType::UInt16 => json!(downcast!(array, UInt16Array).value(row_idx)),
            DataType::UInt32 => json!(downcast!(array, UInt32Array).value(row_idx)),
            DataType::UInt64 => json!(downcast!(array, UInt64Array).value(row_idx)),

            DataType::Float32 => json!(downcast!(array, Float32Array).value(row_idx)),
            DataType::Float64 => json!(downcast!(array, Float64Array).value(row_idx)),

            DataType::Decimal128(_, scale) => {
                let raw = downcast!(array, Decimal128Array).value(row_idx);
                json!(raw as f64 / 10_f64.powi(i32::from(*scale)))
            }

            DataType::Utf8 => json!(downcast!(array, StringArray).value(row_idx)),
            DataType::LargeUtf8 => json!(downcast!(array, LargeStringArray).value(row_idx)),
            DataType::Utf8View => json!(downcast!(array, StringViewArray).value(row_idx)),

            // Hex keeps binary columns printable
            DataType::Binary => json!(hex(downcast!(array, BinaryArray).value(row_idx))),
            DataType::LargeBinary => json!(hex(downcast!(array, LargeBinaryArray).value(row_idx))),

            DataType::Date32 => {
                let days = downcast!(array, Date32Array).value(row_idx);
                let date = NaiveDate::from_num_days_from_ce_opt(days + UNIX_EPOCH_DAYS_FROM_CE)
                    .ok_or_else(|| anyhow!("Invalid date value"))?;
                json!(date.format("%Y-%m-%d").to_string())
            }

            DataType::Timestamp(unit, _) => {
                let timestamp = match unit {
                    TimeUnit::Second => {
                        DateTime::from_timestamp(downcast!(array, TimestampSecondArray).value(row_idx), 0)
                    }
                    TimeUnit::Millisecond => DateTime::from_timestamp_millis(
                        downcast!(array, TimestampMillisecondArray).value(row_idx),
                    ),
                    TimeUnit::Microsecond => DateTime::from_timestamp_micros(
                        downcast!(array, TimestampMicrosecondArray).value(row_idx),
                    ),
                    TimeUnit::Nanosecond => Some(DateTime::from_timestamp_nanos(
                        downcast!(array, TimestampNanosecondArray).value(row_idx),
                    )),
                };
                let dt = timestamp.ok_or_else(|| anyhow!("Invalid timestamp value"))?;
                json!(dt.to_rfc3339())
            }

            other => {
                tracing::warn!("Unsupported Arrow data type: {:?}", other);
                json!(format!("UNSUPPORTED_TYPE_{:?}", other))
            }
        };

        Ok(value)
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}
