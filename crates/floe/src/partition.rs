//! Identity partitioning and Hive-style partition paths.
//!
//! A [`PartitionSpec`] names the columns whose values route a row to a
//! partition. The resulting [`PartitionKey`] renders as `col=value/col2=value2`
//! and is used as the directory under `data/` for that partition's files.

use serde::{Deserialize, Serialize};
use snafu::prelude::*;
use std::collections::HashSet;
use std::fmt;

use crate::error::{DuplicatePartitionColumnSnafu, SchemaError, UnknownPartitionColumnSnafu};
use crate::schema::TableSchema;
use crate::value::{Row, Value};

/// Path segment used for null partition values.
pub const NULL_PARTITION_VALUE: &str = "__NULL__";

/// Ordered identity-partition columns. Empty means unpartitioned.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PartitionSpec {
    columns: Vec<String>,
}

impl PartitionSpec {
    pub fn new(columns: Vec<String>) -> Self {
        Self { columns }
    }

    pub fn unpartitioned() -> Self {
        Self::default()
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn is_unpartitioned(&self) -> bool {
        self.columns.is_empty()
    }

    /// Resolve the spec against a schema, returning column positions.
    pub fn bind(&self, schema: &TableSchema) -> Result<BoundPartitionSpec, SchemaError> {
        let mut seen = HashSet::new();
        let mut fields = Vec::with_capacity(self.columns.len());
        for name in &self.columns {
            ensure!(
                seen.insert(name.as_str()),
                DuplicatePartitionColumnSnafu { name: name.clone() }
            );
            let index = schema
                .column_index(name)
                .context(UnknownPartitionColumnSnafu { name: name.clone() })?;
            fields.push((name.clone(), index));
        }

        Ok(BoundPartitionSpec { fields })
    }
}

/// A partition spec resolved to column positions of a schema.
#[derive(Debug, Clone)]
pub struct BoundPartitionSpec {
    fields: Vec<(String, usize)>,
}

impl BoundPartitionSpec {
    /// Derive the partition key of a row.
    pub fn partition_key(&self, row: &Row) -> PartitionKey {
        PartitionKey {
            values: self
                .fields
                .iter()
                .map(|(name, index)| (name.clone(), row[*index].clone()))
                .collect(),
        }
    }
}

/// The partition a row belongs to: ordered `(column, value)` pairs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PartitionKey {
    values: Vec<(String, Value)>,
}

impl PartitionKey {
    pub fn unpartitioned() -> Self {
        Self::default()
    }

    pub fn values(&self) -> &[(String, Value)] {
        &self.values
    }

    pub fn is_unpartitioned(&self) -> bool {
        self.values.is_empty()
    }

    /// Relative directory for this partition, e.g. `part=aaa`.
    pub fn path(&self) -> String {
        self.values
            .iter()
            .map(|(name, value)| {
                let value = match value {
                    Value::Null => NULL_PARTITION_VALUE.to_string(),
                    value => escape_path_value(&value.to_string()),
                };
                format!("{}={}", escape_path_value(name), value)
            })
            .collect::<Vec<_>>()
            .join("/")
    }
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_unpartitioned() {
            f.write_str("<unpartitioned>")
        } else {
            f.write_str(&self.path())
        }
    }
}

/// Percent-escape the characters that carry meaning in a partition path.
fn escape_path_value(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '%' => escaped.push_str("%25"),
            '/' => escaped.push_str("%2F"),
            '=' => escaped.push_str("%3D"),
            c => escaped.push(c),
        }
    }
    escaped
}
