//! Per-key reduction of change operations within one window.

use crate::changelog::Operation;
use crate::value::Row;

/// Net effect of a window's operations on one primary key.
///
/// `retracted` remembers the committed row a window removed, so a later
/// re-insert of that key still retracts it and a subsequent delete does not
/// forget it.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum KeyState {
    /// Not seen in this window.
    #[default]
    Untouched,
    /// The key ends the window holding `row`.
    NetInsert { row: Row, retracted: Option<Row> },
    /// The key's committed row must be equality-deleted.
    NetDelete { retracted: Row },
}

impl KeyState {
    pub fn is_untouched(&self) -> bool {
        matches!(self, KeyState::Untouched)
    }

    /// The committed row this state deletes, if any.
    pub fn retracted(&self) -> Option<&Row> {
        match self {
            KeyState::Untouched => None,
            KeyState::NetInsert { retracted, .. } => retracted.as_ref(),
            KeyState::NetDelete { retracted } => Some(retracted),
        }
    }

    /// The row this state inserts, if any.
    pub fn inserted(&self) -> Option<&Row> {
        match self {
            KeyState::NetInsert { row, .. } => Some(row),
            _ => None,
        }
    }

    /// A minimal operation sequence that reduces from `Untouched` to this state.
    pub(crate) fn into_operations(self) -> Vec<Operation> {
        match self {
            KeyState::Untouched => Vec::new(),
            KeyState::NetInsert {
                row,
                retracted: None,
            } => vec![Operation::Insert(row)],
            KeyState::NetInsert {
                row,
                retracted: Some(old),
            } => vec![Operation::Delete(old), Operation::Insert(row)],
            KeyState::NetDelete { retracted } => vec![Operation::Delete(retracted)],
        }
    }
}

/// Apply one operation to a key's window state.
pub fn reduce(state: KeyState, op: Operation) -> KeyState {
    match op {
        Operation::Insert(row) | Operation::UpdateInsert(row) => match state {
            KeyState::Untouched => KeyState::NetInsert {
                row,
                retracted: None,
            },
            KeyState::NetInsert { retracted, .. } => KeyState::NetInsert { row, retracted },
            KeyState::NetDelete { retracted } => KeyState::NetInsert {
                row,
                retracted: Some(retracted),
            },
        },
        Operation::Delete(row) | Operation::UpdateDelete(row) => match state {
            KeyState::Untouched => KeyState::NetDelete { retracted: row },
            // The insert only ever lived in this window
            KeyState::NetInsert {
                retracted: None, ..
            } => KeyState::Untouched,
            KeyState::NetInsert {
                retracted: Some(retracted),
                ..
            } => KeyState::NetDelete { retracted },
            KeyState::NetDelete { retracted } => KeyState::NetDelete { retracted },
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;

    fn row(id: i32, name: &str) -> Row {
        vec![Value::Int32(id), Value::Utf8(name.into())]
    }

    fn fold(ops: Vec<Operation>) -> KeyState {
        ops.into_iter().fold(KeyState::Untouched, reduce)
    }

    #[test]
    fn test_insert_transitions() {
        let a = row(1, "a");
        let b = row(1, "b");
        assert_eq!(
            fold(vec![Operation::Insert(a.clone())]),
            KeyState::NetInsert {
                row: a.clone(),
                retracted: None
            }
        );
        assert_eq!(
            fold(vec![Operation::Insert(a.clone()), Operation::Insert(b.clone())]),
            KeyState::NetInsert {
                row: b.clone(),
                retracted: None
            }
        );
        assert_eq!(
            fold(vec![Operation::Delete(a.clone()), Operation::Insert(b.clone())]),
            KeyState::NetInsert {
                row: b,
                retracted: Some(a)
            }
        );
    }

    #[test]
    fn test_delete_transitions() {
        let a = row(1, "a");
        assert_eq!(
            fold(vec![Operation::Delete(a.clone())]),
            KeyState::NetDelete {
                retracted: a.clone()
            }
        );
        assert_eq!(
            fold(vec![Operation::Insert(a.clone()), Operation::Delete(a.clone())]),
            KeyState::Untouched
        );
        assert_eq!(
            fold(vec![
                Operation::Delete(a.clone()),
                Operation::UpdateDelete(a.clone())
            ]),
            KeyState::NetDelete { retracted: a }
        );
    }

    #[test]
    fn test_update_within_window_collapses_to_insert() {
        let alice = row(1, "Alice");
        let clare = row(1, "Clare");
        let state = fold(vec![
            Operation::Insert(alice.clone()),
            Operation::UpdateDelete(alice),
            Operation::UpdateInsert(clare.clone()),
        ]);
        assert_eq!(
            state,
            KeyState::NetInsert {
                row: clare,
                retracted: None
            }
        );
        assert!(state.retracted().is_none());
    }

    #[test]
    fn test_update_then_delete_of_committed_key_keeps_retraction() {
        let clare = row(1, "Clare");
        let alice = row(1, "Alice");
        let state = fold(vec![
            Operation::UpdateDelete(clare.clone()),
            Operation::UpdateInsert(alice.clone()),
            Operation::Delete(alice),
        ]);
        assert_eq!(state, KeyState::NetDelete { retracted: clare });
        assert!(state.inserted().is_none());
    }

    #[test]
    fn test_into_operations_reproduces_state() {
        let a = row(1, "a");
        let b = row(1, "b");
        for state in [
            KeyState::Untouched,
            KeyState::NetInsert {
                row: a.clone(),
                retracted: None,
            },
            KeyState::NetInsert {
                row: b.clone(),
                retracted: Some(a.clone()),
            },
            KeyState::NetDelete { retracted: a.clone() },
        ] {
            assert_eq!(fold(state.clone().into_operations()), state);
        }
    }
}
