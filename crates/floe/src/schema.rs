//! Table schema: ordered typed columns plus the primary key.

use serde::{Deserialize, Serialize};
use snafu::prelude::*;
use std::collections::HashSet;
use std::fmt;

use crate::error::{
    AritySnafu, DuplicateColumnSnafu, EmptyPrimaryKeySnafu, NoColumnsSnafu, NullKeySnafu,
    RowError, SchemaError, UnknownKeyColumnSnafu,
};
use crate::value::{PrimaryKey, Row};

/// Column data types supported by the sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    Boolean,
    Int16,
    Int32,
    Int64,
    Float32,
    Float64,
    Utf8,
    Date32,
    Timestamp,
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DataType::Boolean => "boolean",
            DataType::Int16 => "int16",
            DataType::Int32 => "int32",
            DataType::Int64 => "int64",
            DataType::Float32 => "float32",
            DataType::Float64 => "float64",
            DataType::Utf8 => "utf8",
            DataType::Date32 => "date32",
            DataType::Timestamp => "timestamp",
        };
        f.write_str(name)
    }
}

/// A named, typed column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Column {
    pub name: String,
    #[serde(rename = "type")]
    pub data_type: DataType,
}

impl Column {
    pub fn new(name: impl Into<String>, data_type: DataType) -> Self {
        Self {
            name: name.into(),
            data_type,
        }
    }
}

#[derive(Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct SchemaDef {
    columns: Vec<Column>,
    primary_key: Vec<String>,
}

/// Ordered columns plus the ordered primary-key column subset.
///
/// Primary-key columns are non-nullable; every other column is nullable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "SchemaDef", into = "SchemaDef")]
pub struct TableSchema {
    columns: Vec<Column>,
    primary_key: Vec<String>,
    key_indices: Vec<usize>,
}

impl TryFrom<SchemaDef> for TableSchema {
    type Error = SchemaError;

    fn try_from(def: SchemaDef) -> Result<Self, Self::Error> {
        TableSchema::new(def.columns, def.primary_key)
    }
}

impl From<TableSchema> for SchemaDef {
    fn from(schema: TableSchema) -> Self {
        SchemaDef {
            columns: schema.columns,
            primary_key: schema.primary_key,
        }
    }
}

impl TableSchema {
    pub fn new(columns: Vec<Column>, primary_key: Vec<String>) -> Result<Self, SchemaError> {
        ensure!(!columns.is_empty(), NoColumnsSnafu);
        ensure!(!primary_key.is_empty(), EmptyPrimaryKeySnafu);

        let mut seen = HashSet::new();
        for column in &columns {
            ensure!(
                seen.insert(column.name.as_str()),
                DuplicateColumnSnafu {
                    name: column.name.clone()
                }
            );
        }

        let key_indices = primary_key
            .iter()
            .map(|name| {
                columns
                    .iter()
                    .position(|c| &c.name == name)
                    .context(UnknownKeyColumnSnafu { name: name.clone() })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let mut distinct = HashSet::new();
        for name in &primary_key {
            ensure!(
                distinct.insert(name.as_str()),
                DuplicateColumnSnafu { name: name.clone() }
            );
        }

        Ok(Self {
            columns,
            primary_key,
            key_indices,
        })
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn primary_key(&self) -> &[String] {
        &self.primary_key
    }

    /// Positions of the primary-key columns, in key order.
    pub fn key_indices(&self) -> &[usize] {
        &self.key_indices
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    pub fn is_key_column(&self, index: usize) -> bool {
        self.key_indices.contains(&index)
    }

    /// Schema of equality-delete files: the primary-key columns only.
    pub fn key_schema(&self) -> TableSchema {
        let columns: Vec<Column> = self
            .key_indices
            .iter()
            .map(|&i| self.columns[i].clone())
            .collect();
        let key_indices = (0..columns.len()).collect();
        TableSchema {
            columns,
            primary_key: self.primary_key.clone(),
            key_indices,
        }
    }

    /// Check arity, value types and key nullability of a row.
    pub fn validate_row(&self, row: &Row) -> Result<(), RowError> {
        ensure!(
            row.len() == self.columns.len(),
            AritySnafu {
                expected: self.columns.len(),
                actual: row.len(),
            }
        );

        for (column, value) in self.columns.iter().zip(row) {
            value.check_type(column.data_type, &column.name)?;
        }

        for &index in &self.key_indices {
            ensure!(
                !row[index].is_null(),
                NullKeySnafu {
                    column: self.columns[index].name.clone()
                }
            );
        }
        Ok(())
    }

    /// Project a row onto its primary key. The row must have been validated.
    pub fn key_of(&self, row: &Row) -> PrimaryKey {
        PrimaryKey::new(self.key_indices.iter().map(|&i| row[i].clone()).collect())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::value::Value;

    /// `id int32, name utf8, part utf8` keyed on `id`.
    pub(crate) fn demo_schema() -> TableSchema {
        TableSchema::new(
            vec![
                Column::new("id", DataType::Int32),
                Column::new("name", DataType::Utf8),
                Column::new("part", DataType::Utf8),
            ],
            vec!["id".to_string()],
        )
        .unwrap()
    }

    #[test]
    fn test_rejects_invalid_definitions() {
        let cols = || vec![Column::new("id", DataType::Int32)];
        assert!(matches!(
            TableSchema::new(vec![], vec!["id".into()]),
            Err(SchemaError::NoColumns)
        ));
        assert!(matches!(
            TableSchema::new(cols(), vec![]),
            Err(SchemaError::EmptyPrimaryKey)
        ));
        assert!(matches!(
            TableSchema::new(cols(), vec!["nope".into()]),
            Err(SchemaError::UnknownKeyColumn { .. })
        ));
        assert!(matches!(
            TableSchema::new(
                vec![
                    Column::new("id", DataType::Int32),
                    Column::new("id", DataType::Utf8)
                ],
                vec!["id".into()]
            ),
            Err(SchemaError::DuplicateColumn { .. })
        ));
    }

    #[test]
    fn test_validate_row() {
        let schema = demo_schema();
        let ok = vec![Value::Int32(1), Value::Null, Value::Utf8("aaa".into())];
        assert!(schema.validate_row(&ok).is_ok());

        let short = vec![Value::Int32(1)];
        assert!(matches!(
            schema.validate_row(&short),
            Err(RowError::Arity {
                expected: 3,
                actual: 1
            })
        ));

        let wrong_type = vec![
            Value::Int64(1),
            Value::Utf8("a".into()),
            Value::Utf8("b".into()),
        ];
        assert!(matches!(
            schema.validate_row(&wrong_type),
            Err(RowError::TypeMismatch { .. })
        ));

        let null_key = vec![Value::Null, Value::Utf8("a".into()), Value::Utf8("b".into())];
        assert!(matches!(
            schema.validate_row(&null_key),
            Err(RowError::NullKey { .. })
        ));
    }

    #[test]
    fn test_key_projection() {
        let schema = TableSchema::new(
            vec![
                Column::new("a", DataType::Utf8),
                Column::new("b", DataType::Int64),
                Column::new("c", DataType::Int32),
            ],
            vec!["c".into(), "a".into()],
        )
        .unwrap();
        let row = vec![Value::Utf8("x".into()), Value::Int64(2), Value::Int32(3)];
        assert_eq!(
            schema.key_of(&row),
            PrimaryKey::new(vec![Value::Int32(3), Value::Utf8("x".into())])
        );

        let key_schema = schema.key_schema();
        assert_eq!(key_schema.columns().len(), 2);
        assert_eq!(key_schema.columns()[0].name, "c");
        assert_eq!(key_schema.key_indices(), &[0, 1]);
    }

    #[test]
    fn test_yaml_round_trip_validates() {
        let yaml = "columns:\n  - { name: id, type: int32 }\n  - { name: name, type: utf8 }\nprimary_key: [id]\n";
        let schema: TableSchema = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(schema.key_indices(), &[0]);

        let bad = "columns:\n  - { name: id, type: int32 }\nprimary_key: [missing]\n";
        assert!(serde_yaml::from_str::<TableSchema>(bad).is_err());
    }
}
