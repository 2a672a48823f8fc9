//! The per-window change buffer.

use indexmap::IndexMap;
use std::sync::Arc;

use super::state::{KeyState, reduce};
use super::Operation;
use crate::error::RowError;
use crate::partition::{BoundPartitionSpec, PartitionKey};
use crate::schema::TableSchema;
use crate::value::{PrimaryKey, Row};

/// Accumulates the current window's operations, reduced per primary key.
///
/// Keys that net out to [`KeyState::Untouched`] are removed, so the buffer
/// only ever holds keys with a pending effect.
#[derive(Debug)]
pub struct ChangeBuffer {
    schema: Arc<TableSchema>,
    states: IndexMap<PrimaryKey, KeyState>,
}

impl ChangeBuffer {
    pub fn new(schema: Arc<TableSchema>) -> Self {
        Self {
            schema,
            states: IndexMap::new(),
        }
    }

    /// Number of keys with a pending effect.
    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    /// Absorb operations in arrival order.
    ///
    /// Every row is validated first; on error nothing is absorbed.
    pub fn absorb(&mut self, ops: Vec<Operation>) -> Result<usize, RowError> {
        for op in &ops {
            self.schema.validate_row(op.row())?;
        }
        let count = ops.len();
        for op in ops {
            self.apply(op);
        }
        Ok(count)
    }

    fn apply(&mut self, op: Operation) {
        let key = self.schema.key_of(op.row());
        let current = self
            .states
            .get_mut(&key)
            .map(std::mem::take)
            .unwrap_or_default();

        match reduce(current, op) {
            KeyState::Untouched => {
                self.states.swap_remove(&key);
            }
            next => {
                self.states.insert(key, next);
            }
        }
    }

    /// Take the window's net effect, leaving the buffer empty.
    pub fn drain(&mut self) -> DrainedWindow {
        DrainedWindow {
            states: std::mem::take(&mut self.states),
        }
    }

    /// Put a drained window back in front of whatever was absorbed since.
    ///
    /// Operations absorbed after the drain are replayed on top of the
    /// restored states, so the buffer ends up as if the drain never happened.
    pub fn restore(&mut self, window: DrainedWindow) {
        let later = std::mem::replace(&mut self.states, window.states);
        for (_, state) in later {
            for op in state.into_operations() {
                self.apply(op);
            }
        }
    }
}

/// Rows to insert and keys to equality-delete within one partition.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartitionWrites {
    pub inserts: Vec<Row>,
    /// Primary-key projections of the rows to delete.
    pub deletes: Vec<Row>,
}

/// The net effect of one window, as returned by [`ChangeBuffer::drain`].
#[derive(Debug, Clone, Default)]
pub struct DrainedWindow {
    states: IndexMap<PrimaryKey, KeyState>,
}

impl DrainedWindow {
    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn get(&self, key: &PrimaryKey) -> Option<&KeyState> {
        self.states.get(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&PrimaryKey, &KeyState)> {
        self.states.iter()
    }

    /// Inserted keys that do not already retract a committed row.
    pub fn unretracted_inserts(&self) -> impl Iterator<Item = (&PrimaryKey, &Row)> {
        self.states.iter().filter_map(|(key, state)| match state {
            KeyState::NetInsert {
                row,
                retracted: None,
            } => Some((key, row)),
            _ => None,
        })
    }

    /// Group the net effect by partition.
    ///
    /// Inserts route by the inserted row; deletes route by the retracted row,
    /// which may live in a different partition than its replacement.
    pub fn partitioned(&self, spec: &BoundPartitionSpec) -> IndexMap<PartitionKey, PartitionWrites> {
        let mut partitions: IndexMap<PartitionKey, PartitionWrites> = IndexMap::new();
        for (key, state) in &self.states {
            if let Some(retracted) = state.retracted() {
                partitions
                    .entry(spec.partition_key(retracted))
                    .or_default()
                    .deletes
                    .push(key.clone().into_row());
            }
            if let Some(row) = state.inserted() {
                partitions
                    .entry(spec.partition_key(row))
                    .or_default()
                    .inserts
                    .push(row.clone());
            }
        }
        partitions
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::partition::PartitionSpec;
    use crate::schema::tests::demo_schema;
    use crate::value::Value;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::collections::HashMap;

    fn row(id: i32, name: &str, part: &str) -> Row {
        vec![
            Value::Int32(id),
            Value::Utf8(name.into()),
            Value::Utf8(part.into()),
        ]
    }

    fn key(id: i32) -> PrimaryKey {
        PrimaryKey::new(vec![Value::Int32(id)])
    }

    fn buffer() -> ChangeBuffer {
        ChangeBuffer::new(Arc::new(demo_schema()))
    }

    fn part_spec() -> BoundPartitionSpec {
        PartitionSpec::new(vec!["part".into()])
            .bind(&demo_schema())
            .unwrap()
    }

    #[test]
    fn test_single_window_cancellation() {
        let mut buffer = buffer();
        buffer
            .absorb(vec![
                Operation::Insert(row(1, "Alice", "aaa")),
                Operation::Insert(row(2, "Bob", "bbb")),
                Operation::UpdateDelete(row(1, "Alice", "aaa")),
                Operation::UpdateInsert(row(1, "Clare", "ccc")),
                Operation::Delete(row(2, "Bob", "bbb")),
            ])
            .unwrap();

        let window = buffer.drain();
        assert!(buffer.is_empty());
        assert_eq!(window.len(), 1);

        let partitions = window.partitioned(&part_spec());
        assert_eq!(partitions.len(), 1);
        let (partition, writes) = partitions.first().unwrap();
        assert_eq!(partition.path(), "part=ccc");
        assert_eq!(writes.inserts, vec![row(1, "Clare", "ccc")]);
        assert!(writes.deletes.is_empty());
    }

    #[test]
    fn test_deletes_route_by_retracted_row() {
        let mut buffer = buffer();
        buffer
            .absorb(vec![
                Operation::UpdateDelete(row(1, "Clare", "ccc")),
                Operation::UpdateInsert(row(1, "Alice", "aaa")),
            ])
            .unwrap();

        let partitions = buffer.drain().partitioned(&part_spec());
        let by_path: HashMap<String, PartitionWrites> = partitions
            .into_iter()
            .map(|(k, w)| (k.path(), w))
            .collect();
        assert_eq!(by_path["part=ccc"].deletes, vec![vec![Value::Int32(1)]]);
        assert!(by_path["part=ccc"].inserts.is_empty());
        assert_eq!(by_path["part=aaa"].inserts, vec![row(1, "Alice", "aaa")]);
    }

    #[test]
    fn test_invalid_row_leaves_buffer_unchanged() {
        let mut buffer = buffer();
        buffer
            .absorb(vec![Operation::Insert(row(1, "Alice", "aaa"))])
            .unwrap();

        let err = buffer
            .absorb(vec![
                Operation::Delete(row(1, "Alice", "aaa")),
                Operation::Insert(vec![Value::Int32(2)]),
            ])
            .unwrap_err();
        assert!(matches!(err, RowError::Arity { .. }));
        assert_eq!(buffer.len(), 1);
        assert!(buffer.drain().get(&key(1)).unwrap().inserted().is_some());
    }

    #[test]
    fn test_restore_replays_later_operations() {
        let mut buffer = buffer();
        buffer
            .absorb(vec![
                Operation::Insert(row(1, "Alice", "aaa")),
                Operation::Delete(row(2, "Bob", "bbb")),
            ])
            .unwrap();
        let window = buffer.drain();

        buffer
            .absorb(vec![
                Operation::Delete(row(1, "Alice", "aaa")),
                Operation::Insert(row(3, "Dan", "ddd")),
            ])
            .unwrap();
        buffer.restore(window);

        let restored = buffer.drain();
        assert!(restored.get(&key(1)).is_none());
        assert_eq!(
            restored.get(&key(2)),
            Some(&KeyState::NetDelete {
                retracted: row(2, "Bob", "bbb")
            })
        );
        assert_eq!(restored.get(&key(3)).unwrap().inserted(), Some(&row(3, "Dan", "ddd")));
    }

    /// Generates valid change logs against a committed base and checks that
    /// applying the drained net effect to the base equals sequential apply.
    #[test]
    fn test_randomized_netting_matches_sequential_apply() {
        const KEYS: i32 = 6;
        let parts = ["aaa", "bbb", "ccc"];

        for seed in 0..200u64 {
            let mut rng = StdRng::seed_from_u64(seed);

            let mut base: HashMap<i32, Row> = HashMap::new();
            for id in 0..KEYS {
                if rng.random_bool(0.5) {
                    base.insert(id, row(id, "base", parts[rng.random_range(0..parts.len())]));
                }
            }

            let mut current = base.clone();
            let mut pending_updates: Vec<(i32, Row)> = Vec::new();
            let mut ops = Vec::new();
            let mut version = 0;

            for _ in 0..rng.random_range(1..30) {
                if !pending_updates.is_empty() && rng.random_bool(0.3) {
                    let (id, new_row) = pending_updates.remove(rng.random_range(0..pending_updates.len()));
                    current.insert(id, new_row.clone());
                    ops.push(Operation::UpdateInsert(new_row));
                    continue;
                }

                let id = rng.random_range(0..KEYS);
                if pending_updates.iter().any(|(pending, _)| *pending == id) {
                    continue;
                }
                version += 1;
                let fresh = row(id, &format!("v{version}"), parts[rng.random_range(0..parts.len())]);

                match current.get(&id).cloned() {
                    None => {
                        current.insert(id, fresh.clone());
                        ops.push(Operation::Insert(fresh));
                    }
                    Some(existing) if rng.random_bool(0.5) => {
                        current.remove(&id);
                        ops.push(Operation::Delete(existing));
                    }
                    Some(existing) => {
                        current.remove(&id);
                        ops.push(Operation::UpdateDelete(existing));
                        pending_updates.push((id, fresh));
                    }
                }
            }
            for (id, new_row) in pending_updates.drain(..) {
                current.insert(id, new_row.clone());
                ops.push(Operation::UpdateInsert(new_row));
            }

            let mut buffer = buffer();
            buffer.absorb(ops).unwrap();
            let window = buffer.drain();

            let mut result = base.clone();
            for (key, state) in window.iter() {
                let Value::Int32(id) = key.values()[0] else {
                    panic!("unexpected key {key}");
                };
                match state.retracted() {
                    Some(retracted) => {
                        assert_eq!(base.get(&id), Some(retracted), "seed {seed}: delete of uncommitted key");
                        result.remove(&id);
                    }
                    None => assert!(!base.contains_key(&id), "seed {seed}: missing retraction"),
                }
                if let Some(inserted) = state.inserted() {
                    result.insert(id, inserted.clone());
                }
            }
            assert_eq!(result, current, "seed {seed}");
        }
    }
}
