//! Change operations and their per-window reduction.

mod buffer;
mod state;

pub use buffer::{ChangeBuffer, DrainedWindow, PartitionWrites};
pub use state::{KeyState, reduce};

use serde::{Deserialize, Serialize};

use crate::error::RowError;
use crate::schema::TableSchema;
use crate::value::{Row, Value};

/// Kind of a change operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Op {
    Insert,
    Delete,
    UpdateDelete,
    UpdateInsert,
}

/// A row-level change. `UpdateDelete` precedes its paired `UpdateInsert`
/// for the same key, possibly separated by other keys' operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    Insert(Row),
    Delete(Row),
    UpdateDelete(Row),
    UpdateInsert(Row),
}

impl Operation {
    pub fn new(op: Op, row: Row) -> Self {
        match op {
            Op::Insert => Operation::Insert(row),
            Op::Delete => Operation::Delete(row),
            Op::UpdateDelete => Operation::UpdateDelete(row),
            Op::UpdateInsert => Operation::UpdateInsert(row),
        }
    }

    pub fn op(&self) -> Op {
        match self {
            Operation::Insert(_) => Op::Insert,
            Operation::Delete(_) => Op::Delete,
            Operation::UpdateDelete(_) => Op::UpdateDelete,
            Operation::UpdateInsert(_) => Op::UpdateInsert,
        }
    }

    pub fn row(&self) -> &Row {
        match self {
            Operation::Insert(row)
            | Operation::Delete(row)
            | Operation::UpdateDelete(row)
            | Operation::UpdateInsert(row) => row,
        }
    }
}

/// One line of a newline-delimited JSON change log:
/// `{"op": "update_insert", "row": [1, "Clare", "ccc"]}`.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ChangeRecord {
    pub op: Op,
    pub row: Vec<serde_json::Value>,
}

impl ChangeRecord {
    /// Convert the JSON row to typed values and validate it against the schema.
    pub fn into_operation(self, schema: &TableSchema) -> Result<Operation, RowError> {
        if self.row.len() != schema.columns().len() {
            return Err(RowError::Arity {
                expected: schema.columns().len(),
                actual: self.row.len(),
            });
        }
        let row = schema
            .columns()
            .iter()
            .zip(&self.row)
            .map(|(column, json)| Value::from_json(json, column.data_type, &column.name))
            .collect::<Result<Row, _>>()?;
        schema.validate_row(&row)?;
        Ok(Operation::new(self.op, row))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::tests::demo_schema;

    #[test]
    fn test_change_record_into_operation() {
        let record: ChangeRecord =
            serde_json::from_str(r#"{"op": "update_delete", "row": [1, "Alice", "aaa"]}"#)
                .unwrap();
        let op = record.into_operation(&demo_schema()).unwrap();
        assert_eq!(op.op(), Op::UpdateDelete);
        assert_eq!(
            op.row(),
            &vec![
                Value::Int32(1),
                Value::Utf8("Alice".into()),
                Value::Utf8("aaa".into())
            ]
        );
    }

    #[test]
    fn test_change_record_rejects_bad_rows() {
        let short: ChangeRecord = serde_json::from_str(r#"{"op": "insert", "row": [1]}"#).unwrap();
        assert!(matches!(
            short.into_operation(&demo_schema()),
            Err(RowError::Arity { .. })
        ));

        let null_key: ChangeRecord =
            serde_json::from_str(r#"{"op": "insert", "row": [null, "a", "b"]}"#).unwrap();
        assert!(matches!(
            null_key.into_operation(&demo_schema()),
            Err(RowError::NullKey { .. })
        ));

        assert!(serde_json::from_str::<ChangeRecord>(r#"{"op": "upsert", "row": []}"#).is_err());
    }
}
