//! Conversions between rows and Arrow record batches.

use deltalake::arrow::array::{
    Array, ArrayRef, AsArray, BooleanArray, Date32Array, Float32Array, Float64Array, Int16Array,
    Int32Array, Int64Array, RecordBatch, StringArray, TimestampMicrosecondArray,
};
use deltalake::arrow::datatypes::{
    DataType as ArrowDataType, Date32Type, Field, Float32Type, Float64Type, Int16Type, Int32Type,
    Int64Type, Schema, SchemaRef, TimeUnit, TimestampMicrosecondType,
};
use deltalake::arrow::error::ArrowError;
use std::sync::Arc;

use crate::schema::{DataType, TableSchema};
use crate::value::{Row, Value};

const UTC: &str = "UTC";

fn arrow_type(data_type: DataType) -> ArrowDataType {
    match data_type {
        DataType::Boolean => ArrowDataType::Boolean,
        DataType::Int16 => ArrowDataType::Int16,
        DataType::Int32 => ArrowDataType::Int32,
        DataType::Int64 => ArrowDataType::Int64,
        DataType::Float32 => ArrowDataType::Float32,
        DataType::Float64 => ArrowDataType::Float64,
        DataType::Utf8 => ArrowDataType::Utf8,
        DataType::Date32 => ArrowDataType::Date32,
        DataType::Timestamp => ArrowDataType::Timestamp(TimeUnit::Microsecond, Some(UTC.into())),
    }
}

/// Arrow schema for a table schema. Key columns are non-nullable.
pub fn arrow_schema(schema: &TableSchema) -> SchemaRef {
    let fields: Vec<Field> = schema
        .columns()
        .iter()
        .enumerate()
        .map(|(index, column)| {
            Field::new(
                &column.name,
                arrow_type(column.data_type),
                !schema.is_key_column(index),
            )
        })
        .collect();
    Arc::new(Schema::new(fields))
}

macro_rules! primitive_column {
    ($rows:expr, $index:expr, $variant:ident, $array:ty) => {
        Arc::new(
            $rows
                .iter()
                .map(|row| match &row[$index] {
                    Value::$variant(v) => Some(*v),
                    _ => None,
                })
                .collect::<$array>(),
        ) as ArrayRef
    };
}

fn build_column(rows: &[Row], index: usize, data_type: DataType) -> ArrayRef {
    match data_type {
        DataType::Boolean => primitive_column!(rows, index, Boolean, BooleanArray),
        DataType::Int16 => primitive_column!(rows, index, Int16, Int16Array),
        DataType::Int32 => primitive_column!(rows, index, Int32, Int32Array),
        DataType::Int64 => primitive_column!(rows, index, Int64, Int64Array),
        DataType::Float32 => primitive_column!(rows, index, Float32, Float32Array),
        DataType::Float64 => primitive_column!(rows, index, Float64, Float64Array),
        DataType::Date32 => primitive_column!(rows, index, Date32, Date32Array),
        DataType::Utf8 => Arc::new(
            rows.iter()
                .map(|row| match &row[index] {
                    Value::Utf8(v) => Some(v.as_str()),
                    _ => None,
                })
                .collect::<StringArray>(),
        ),
        DataType::Timestamp => Arc::new(
            rows.iter()
                .map(|row| match &row[index] {
                    Value::Timestamp(v) => Some(*v),
                    _ => None,
                })
                .collect::<TimestampMicrosecondArray>()
                .with_timezone(UTC),
        ),
    }
}

/// Build a record batch from validated rows.
pub fn rows_to_batch(
    schema: &TableSchema,
    arrow_schema: &SchemaRef,
    rows: &[Row],
) -> Result<RecordBatch, ArrowError> {
    let columns = schema
        .columns()
        .iter()
        .enumerate()
        .map(|(index, column)| build_column(rows, index, column.data_type))
        .collect();
    RecordBatch::try_new(arrow_schema.clone(), columns)
}

fn column_values(array: &dyn Array, data_type: DataType) -> Option<Vec<Value>> {
    let len = array.len();
    let mut values = Vec::with_capacity(len);

    macro_rules! collect {
        ($typed:expr, $variant:ident) => {{
            let typed = $typed?;
            for i in 0..len {
                values.push(if typed.is_null(i) {
                    Value::Null
                } else {
                    Value::$variant(typed.value(i).to_owned())
                });
            }
        }};
    }

    match data_type {
        DataType::Boolean => collect!(array.as_boolean_opt(), Boolean),
        DataType::Int16 => collect!(array.as_primitive_opt::<Int16Type>(), Int16),
        DataType::Int32 => collect!(array.as_primitive_opt::<Int32Type>(), Int32),
        DataType::Int64 => collect!(array.as_primitive_opt::<Int64Type>(), Int64),
        DataType::Float32 => collect!(array.as_primitive_opt::<Float32Type>(), Float32),
        DataType::Float64 => collect!(array.as_primitive_opt::<Float64Type>(), Float64),
        DataType::Date32 => collect!(array.as_primitive_opt::<Date32Type>(), Date32),
        DataType::Timestamp => {
            collect!(array.as_primitive_opt::<TimestampMicrosecondType>(), Timestamp)
        }
        DataType::Utf8 => collect!(array.as_string_opt::<i32>(), Utf8),
    }
    Some(values)
}

/// Convert a record batch back into rows.
///
/// Columns are matched by name. Returns the name of the first column that is
/// missing or has an unexpected type.
pub fn batch_to_rows(schema: &TableSchema, batch: &RecordBatch) -> Result<Vec<Row>, String> {
    let columns = schema
        .columns()
        .iter()
        .map(|column| {
            batch
                .column_by_name(&column.name)
                .and_then(|array| column_values(array.as_ref(), column.data_type))
                .ok_or_else(|| column.name.clone())
        })
        .collect::<Result<Vec<_>, _>>()?;

    let mut rows: Vec<Row> = (0..batch.num_rows())
        .map(|_| Vec::with_capacity(columns.len()))
        .collect();
    for column in columns {
        for (row, value) in rows.iter_mut().zip(column) {
            row.push(value);
        }
    }
    Ok(rows)
}
