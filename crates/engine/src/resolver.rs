//! Reconciles a new operation against the pending log.
//!
//! Rules, first match wins:
//!
//! 0. A cell edit on a row with a queued delete is rejected.
//! 1. A removal discards every pending operation on its target or anything
//!    nested under it, then goes to the end. Deleting a row whose insert is
//!    still queued cancels the insert instead and queues nothing.
//! 2. A cell edit on a row whose insert is still queued is folded into the
//!    insert.
//! 3. An operation whose slot is taken replaces the holder in place.
//! 4. Anything else is appended.
//!
//! A removal followed by an add reusing the same id is two operations; the
//! remote side still sees destroy-then-create.

use mutq_core::{Category, EntityRef, OpId, Operation, OperationPayload, RowKey};

use crate::error::EngineError;
use crate::log::OperationLog;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Appended,
    /// Took over the slot of `previous` at `position`.
    Replaced { position: usize, previous: OpId },
    /// A removal that discarded the listed operations on its subtree.
    Superseded { removed: Vec<OpId> },
    /// A cell edit folded into the queued insert `insert` at `position`.
    MergedIntoInsert { position: usize, insert: OpId },
    /// A delete of a never-saved row; the insert and its edits are gone.
    Cancelled { removed: Vec<OpId> },
}

#[derive(Debug, Clone)]
pub struct Resolved {
    pub log: OperationLog,
    pub outcome: Resolution,
    /// The operation now carrying the change, if any.
    pub op_id: Option<OpId>,
}

pub fn resolve(log: &OperationLog, op: Operation) -> Result<Resolved, EngineError> {
    reject_edit_of_deleted_row(log, &op)?;

    if op.payload().is_removal() {
        return Ok(supersede(log, op));
    }
    if let Some(resolved) = merge_into_insert(log, &op) {
        return Ok(resolved);
    }
    Ok(replace_or_append(log, op))
}

fn reject_edit_of_deleted_row(log: &OperationLog, op: &Operation) -> Result<(), EngineError> {
    if let OperationPayload::EditCell { table, row, .. } = op.payload() {
        let row_ref = EntityRef::Row {
            table: *table,
            row: row.clone(),
        };
        if log.find_slot(&row_ref, Category::Removal).is_some() {
            return Err(EngineError::OperationRejected(format!(
                "{row} is pending deletion"
            )));
        }
    }
    Ok(())
}

fn supersede(log: &OperationLog, op: Operation) -> Resolved {
    let target = op.target();
    let removed: Vec<OpId> = log.pending_for(&target).iter().map(|op| op.op_id()).collect();

    let unsaved_insert = matches!(
        op.payload(),
        OperationPayload::DeleteRow { row: RowKey::Pending(_), .. }
    ) && log.find_slot(&target, Category::Definition).is_some();
    if unsaved_insert {
        return Resolved {
            log: log.remove_by_entity(&target),
            outcome: Resolution::Cancelled { removed },
            op_id: None,
        };
    }

    let op_id = op.op_id();
    let outcome = if removed.is_empty() {
        Resolution::Appended
    } else {
        Resolution::Superseded { removed }
    };
    Resolved {
        log: log.remove_by_entity(&target).append(op),
        outcome,
        op_id: Some(op_id),
    }
}

fn merge_into_insert(log: &OperationLog, op: &Operation) -> Option<Resolved> {
    let OperationPayload::EditCell {
        table,
        row: row @ RowKey::Pending(_),
        column,
        new_value,
        ..
    } = op.payload()
    else {
        return None;
    };
    let row_ref = EntityRef::Row {
        table: *table,
        row: row.clone(),
    };
    let (position, insert) = log.find_slot(&row_ref, Category::Definition)?;
    let OperationPayload::AddRow { table, row, values } = insert.payload() else {
        return None;
    };

    let mut values = values.clone();
    match values.iter_mut().find(|(c, _)| c == column) {
        Some((_, value)) => *value = new_value.clone(),
        None => values.push((*column, new_value.clone())),
    }
    let merged = insert.revise(
        op.seq(),
        OperationPayload::AddRow {
            table: *table,
            row: *row,
            values,
        },
    );
    let op_id = merged.op_id();
    Some(Resolved {
        log: log.replace_at(position, merged),
        outcome: Resolution::MergedIntoInsert {
            position,
            insert: insert.op_id(),
        },
        op_id: Some(op_id),
    })
}

fn replace_or_append(log: &OperationLog, op: Operation) -> Resolved {
    let Some((position, previous)) = log.find_slot(&op.target(), op.payload().category()) else {
        let op_id = op.op_id();
        return Resolved {
            log: log.append(op),
            outcome: Resolution::Appended,
            op_id: Some(op_id),
        };
    };

    let op = keep_first_old_value(previous, op);
    let op_id = op.op_id();
    Resolved {
        log: log.append(op),
        outcome: Resolution::Replaced {
            position,
            previous: previous.op_id(),
        },
        op_id: Some(op_id),
    }
}

/// A chain of edits to one cell still reports the value from before the first.
fn keep_first_old_value(previous: &Operation, op: Operation) -> Operation {
    match (previous.payload(), op.payload()) {
        (
            OperationPayload::EditCell { old_value, .. },
            OperationPayload::EditCell {
                table,
                row,
                column,
                new_value,
                ..
            },
        ) => op.revise(
            op.seq(),
            OperationPayload::EditCell {
                table: *table,
                row: row.clone(),
                column: *column,
                old_value: old_value.clone(),
                new_value: new_value.clone(),
            },
        ),
        _ => op,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mutq_core::{ColumnDef, ColumnId, OperationKind, SeqClock, TableId, TempRowId, Value};
    use proptest::prelude::*;

    struct Session {
        clock: SeqClock,
        log: OperationLog,
    }

    impl Session {
        fn new() -> Self {
            Self {
                clock: SeqClock::new(),
                log: OperationLog::new(),
            }
        }

        fn enqueue(&mut self, payload: OperationPayload) -> Result<Resolution, EngineError> {
            let op = Operation::new(self.clock.tick(), payload);
            let resolved = resolve(&self.log, op)?;
            self.log = resolved.log;
            Ok(resolved.outcome)
        }

        fn kinds(&self) -> Vec<OperationKind> {
            self.log.iter().map(Operation::kind).collect()
        }
    }

    fn add_column(table: TableId, column: ColumnId) -> OperationPayload {
        OperationPayload::AddColumn {
            table,
            column,
            definition: ColumnDef::new("c", "text"),
        }
    }

    fn edit(table: TableId, row: RowKey, column: ColumnId, old: Value, new: Value) -> OperationPayload {
        OperationPayload::EditCell {
            table,
            row,
            column,
            old_value: old,
            new_value: new,
        }
    }

    #[test]
    fn alter_after_add_takes_the_add_position() -> Result<(), EngineError> {
        let mut s = Session::new();
        let (t1, c1) = (TableId::new(), ColumnId::new());
        s.enqueue(add_column(t1, c1))?;
        let outcome = s.enqueue(OperationPayload::AlterColumn {
            table: t1,
            column: c1,
            data_type: Some("int".into()),
            nullable: None,
            default: None,
        })?;

        assert!(matches!(outcome, Resolution::Replaced { position: 0, .. }));
        assert_eq!(s.kinds(), vec![OperationKind::AlterColumn]);
        Ok(())
    }

    #[test]
    fn drop_table_supersedes_column_work() -> Result<(), EngineError> {
        let mut s = Session::new();
        let t1 = TableId::new();
        s.enqueue(add_column(t1, ColumnId::new()))?;
        s.enqueue(add_column(t1, ColumnId::new()))?;
        let outcome = s.enqueue(OperationPayload::DropTable { table: t1 })?;

        assert!(matches!(outcome, Resolution::Superseded { ref removed } if removed.len() == 2));
        assert_eq!(s.kinds(), vec![OperationKind::DropTable]);
        Ok(())
    }

    #[test]
    fn drop_then_add_with_the_same_id_stays_literal() -> Result<(), EngineError> {
        let mut s = Session::new();
        let (t1, c1) = (TableId::new(), ColumnId::new());
        s.enqueue(OperationPayload::DropColumn { table: t1, column: c1 })?;
        s.enqueue(add_column(t1, c1))?;

        assert_eq!(s.kinds(), vec![OperationKind::DropColumn, OperationKind::AddColumn]);
        Ok(())
    }

    #[test]
    fn drop_column_leaves_sibling_columns_alone() -> Result<(), EngineError> {
        let mut s = Session::new();
        let t = TableId::new();
        let (c1, c2) = (ColumnId::new(), ColumnId::new());
        s.enqueue(add_column(t, c1))?;
        s.enqueue(add_column(t, c2))?;
        s.enqueue(edit(t, RowKey::existing("1"), c1, Value::Null, Value::from("x")))?;
        s.enqueue(OperationPayload::DropColumn { table: t, column: c1 })?;

        assert_eq!(s.kinds(), vec![OperationKind::AddColumn, OperationKind::DropColumn]);
        assert!(s.log.find_slot(&EntityRef::Column { table: t, column: c2 }, Category::Definition).is_some());
        Ok(())
    }

    #[test]
    fn edit_on_row_pending_deletion_is_rejected() -> Result<(), EngineError> {
        let mut s = Session::new();
        let (t, c) = (TableId::new(), ColumnId::new());
        s.enqueue(OperationPayload::DeleteRow {
            table: t,
            row: RowKey::existing("1"),
            original: vec![(c, Value::from("a"))],
        })?;

        let err = s
            .enqueue(edit(t, RowKey::existing("1"), c, Value::from("a"), Value::from("b")))
            .unwrap_err();
        assert!(matches!(err, EngineError::OperationRejected(ref m) if m.contains("pending deletion")));
        assert_eq!(s.log.len(), 1);

        // Other rows are still editable.
        s.enqueue(edit(t, RowKey::existing("2"), c, Value::from("a"), Value::from("b")))?;
        assert_eq!(s.log.len(), 2);
        Ok(())
    }

    #[test]
    fn edit_on_unsaved_row_merges_into_the_insert() -> Result<(), EngineError> {
        let mut s = Session::new();
        let (t, name, age) = (TableId::new(), ColumnId::new(), ColumnId::new());
        let temp = TempRowId::new();
        s.enqueue(add_column(t, ColumnId::new()))?;
        s.enqueue(OperationPayload::AddRow {
            table: t,
            row: temp,
            values: vec![(name, Value::from("original"))],
        })?;

        let outcome = s.enqueue(edit(t, RowKey::Pending(temp), name, Value::from("original"), Value::from("edited")))?;
        assert!(matches!(outcome, Resolution::MergedIntoInsert { position: 1, .. }));
        s.enqueue(edit(t, RowKey::Pending(temp), age, Value::Null, Value::Integer(30)))?;

        assert_eq!(s.kinds(), vec![OperationKind::AddColumn, OperationKind::AddRow]);
        let insert = &s.log.to_ordered_list()[1];
        assert_eq!(
            insert.payload(),
            &OperationPayload::AddRow {
                table: t,
                row: temp,
                values: vec![(name, Value::from("edited")), (age, Value::Integer(30))],
            }
        );
        Ok(())
    }

    #[test]
    fn deleting_an_unsaved_row_cancels_it() -> Result<(), EngineError> {
        let mut s = Session::new();
        let (t, c) = (TableId::new(), ColumnId::new());
        let temp = TempRowId::new();
        s.enqueue(OperationPayload::AddRow { table: t, row: temp, values: vec![] })?;
        s.enqueue(edit(t, RowKey::existing("9"), c, Value::Null, Value::from("keep")))?;

        let outcome = s.enqueue(OperationPayload::DeleteRow {
            table: t,
            row: RowKey::Pending(temp),
            original: vec![],
        })?;

        assert!(matches!(outcome, Resolution::Cancelled { ref removed } if removed.len() == 1));
        assert_eq!(s.kinds(), vec![OperationKind::EditCell]);
        Ok(())
    }

    #[test]
    fn deleting_a_saved_row_drops_its_edits_only() -> Result<(), EngineError> {
        let mut s = Session::new();
        let (t, c) = (TableId::new(), ColumnId::new());
        s.enqueue(edit(t, RowKey::existing("1"), c, Value::Null, Value::from("gone")))?;
        s.enqueue(edit(t, RowKey::existing("2"), c, Value::Null, Value::from("kept")))?;
        s.enqueue(OperationPayload::DeleteRow {
            table: t,
            row: RowKey::existing("1"),
            original: vec![],
        })?;

        assert_eq!(s.kinds(), vec![OperationKind::EditCell, OperationKind::DeleteRow]);
        assert_eq!(s.log.to_ordered_list()[0].target().row().map(|(_, r)| r.clone()), Some(RowKey::existing("2")));
        Ok(())
    }

    #[test]
    fn repeated_cell_edits_keep_the_first_old_value() -> Result<(), EngineError> {
        let mut s = Session::new();
        let (t, c) = (TableId::new(), ColumnId::new());
        let row = RowKey::existing("1");
        s.enqueue(edit(t, row.clone(), c, Value::from("very first value"), Value::from("second")))?;
        s.enqueue(edit(t, row.clone(), c, Value::from("second"), Value::from("final value")))?;

        let ops = s.log.to_ordered_list();
        assert_eq!(ops.len(), 1);
        assert_eq!(
            ops[0].payload(),
            &edit(t, row, c, Value::from("very first value"), Value::from("final value"))
        );
        Ok(())
    }

    #[test]
    fn resolve_is_deterministic_and_leaves_input_untouched() -> Result<(), EngineError> {
        let (t, c) = (TableId::new(), ColumnId::new());
        let mut clock = SeqClock::new();
        let log = OperationLog::new().append(Operation::new(clock.tick(), add_column(t, c)));
        let op = Operation::new(clock.tick(), OperationPayload::DropTable { table: t });

        let a = resolve(&log, op.clone())?;
        let b = resolve(&log, op)?;
        assert_eq!(a.log, b.log);
        assert_eq!(a.outcome, b.outcome);
        assert_eq!(log.len(), 1);
        Ok(())
    }

    // Targets: 6 columns of one table; kinds: alter, rename, edit row 1.
    fn scripted(table: TableId, columns: &[ColumnId], target: usize, kind: u8, step: i64) -> OperationPayload {
        let column = columns[target];
        match kind {
            0 => OperationPayload::AlterColumn {
                table,
                column,
                data_type: Some(format!("varchar({step})")),
                nullable: None,
                default: None,
            },
            1 => OperationPayload::RenameEntity {
                target: EntityRef::Column { table, column },
                new_name: format!("col_{step}"),
            },
            _ => edit(table, RowKey::existing("1"), column, Value::Null, Value::Integer(step)),
        }
    }

    proptest! {
        #[test]
        fn first_write_position_last_write_payload(
            script in prop::collection::vec((0usize..6, 0u8..3), 1..48)
        ) {
            let table = TableId::new();
            let columns: Vec<ColumnId> = (0..6).map(|_| ColumnId::new()).collect();
            let mut s = Session::new();
            let mut expected: Vec<((usize, u8), OperationPayload)> = Vec::new();

            for (step, (target, kind)) in script.into_iter().enumerate() {
                let payload = scripted(table, &columns, target, kind, step as i64);
                s.enqueue(payload.clone()).map_err(|e| TestCaseError::fail(e.to_string()))?;
                match expected.iter_mut().find(|(key, _)| *key == (target, kind)) {
                    Some((_, last)) => *last = payload,
                    None => expected.push(((target, kind), payload)),
                }
            }

            let actual: Vec<&OperationPayload> = s.log.iter().map(Operation::payload).collect();
            let expected: Vec<&OperationPayload> = expected.iter().map(|(_, p)| p).collect();
            prop_assert_eq!(actual, expected);
        }

        #[test]
        fn drop_table_leaves_only_itself_in_the_subtree(
            script in prop::collection::vec((any::<bool>(), 0u8..6), 0..32)
        ) {
            let (doomed, other) = (TableId::new(), TableId::new());
            let column = ColumnId::new();
            let temp = TempRowId::new();
            let mut s = Session::new();

            for (on_doomed, kind) in script {
                let table = if on_doomed { doomed } else { other };
                let payload = match kind {
                    0 => add_column(table, ColumnId::new()),
                    1 => OperationPayload::RenameEntity {
                        target: EntityRef::Table(table),
                        new_name: "renamed".into(),
                    },
                    2 => edit(table, RowKey::existing("1"), column, Value::Null, Value::Integer(1)),
                    3 => OperationPayload::AddRow { table, row: temp, values: vec![] },
                    4 => OperationPayload::DeleteRow {
                        table,
                        row: RowKey::existing("2"),
                        original: vec![],
                    },
                    _ => OperationPayload::DropColumn { table, column },
                };
                // Edits on rows pending deletion are rejected; that is fine here.
                let _ = s.enqueue(payload);
            }
            let others_before = s.log.pending_for(&EntityRef::Table(other)).len();

            s.enqueue(OperationPayload::DropTable { table: doomed })
                .map_err(|e| TestCaseError::fail(e.to_string()))?;

            let subtree = s.log.pending_for(&EntityRef::Table(doomed));
            prop_assert_eq!(subtree.len(), 1);
            prop_assert_eq!(subtree[0].kind(), OperationKind::DropTable);
            prop_assert_eq!(s.log.pending_for(&EntityRef::Table(other)).len(), others_before);
        }
    }
}
