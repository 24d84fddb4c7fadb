use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::ids::*;
use crate::seq::Seq;
use crate::value::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationKind {
    AddTable,
    DropTable,
    RenameEntity,
    AddColumn,
    AlterColumn,
    DropColumn,
    AddRow,
    EditCell,
    DeleteRow,
}

impl OperationKind {
    pub const ALL: [OperationKind; 9] = [
        Self::AddTable,
        Self::DropTable,
        Self::RenameEntity,
        Self::AddColumn,
        Self::AlterColumn,
        Self::DropColumn,
        Self::AddRow,
        Self::EditCell,
        Self::DeleteRow,
    ];

    /// Stable name used in journals and on the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AddTable => "add_table",
            Self::DropTable => "drop_table",
            Self::RenameEntity => "rename_entity",
            Self::AddColumn => "add_column",
            Self::AlterColumn => "alter_column",
            Self::DropColumn => "drop_column",
            Self::AddRow => "add_row",
            Self::EditCell => "edit_cell",
            Self::DeleteRow => "delete_row",
        }
    }

    pub fn parse(s: &str) -> Result<Self, CoreError> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| CoreError::InvalidOperationKind(s.to_string()))
    }

    pub fn category(&self) -> Category {
        match self {
            Self::AddTable
            | Self::AddColumn
            | Self::AlterColumn
            | Self::AddRow
            | Self::EditCell => Category::Definition,
            Self::RenameEntity => Category::Name,
            Self::DropTable | Self::DropColumn | Self::DeleteRow => Category::Removal,
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Mutually exclusive classes of change. A target holds at most one pending
/// operation per category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Category {
    /// The entity's current shape or contents.
    Definition,
    Name,
    Removal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDef {
    pub name: String,
    pub data_type: String,
    pub nullable: bool,
    pub default: Option<Value>,
    pub primary_key: bool,
}

impl ColumnDef {
    pub fn new(name: impl Into<String>, data_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data_type: data_type.into(),
            nullable: true,
            default: None,
            primary_key: false,
        }
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    pub fn primary_key(mut self) -> Self {
        self.primary_key = true;
        self.nullable = false;
        self
    }

    pub fn with_default(mut self, value: Value) -> Self {
        self.default = Some(value);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationPayload {
    AddTable {
        table: TableId,
        name: String,
        columns: Vec<(ColumnId, ColumnDef)>,
    },
    DropTable {
        table: TableId,
    },
    RenameEntity {
        target: EntityRef,
        new_name: String,
    },
    AddColumn {
        table: TableId,
        column: ColumnId,
        definition: ColumnDef,
    },
    AlterColumn {
        table: TableId,
        column: ColumnId,
        data_type: Option<String>,
        nullable: Option<bool>,
        default: Option<Value>,
    },
    DropColumn {
        table: TableId,
        column: ColumnId,
    },
    AddRow {
        table: TableId,
        row: TempRowId,
        values: Vec<(ColumnId, Value)>,
    },
    EditCell {
        table: TableId,
        row: RowKey,
        column: ColumnId,
        old_value: Value,
        new_value: Value,
    },
    DeleteRow {
        table: TableId,
        row: RowKey,
        original: Vec<(ColumnId, Value)>,
    },
}

impl OperationPayload {
    pub fn kind(&self) -> OperationKind {
        match self {
            Self::AddTable { .. } => OperationKind::AddTable,
            Self::DropTable { .. } => OperationKind::DropTable,
            Self::RenameEntity { .. } => OperationKind::RenameEntity,
            Self::AddColumn { .. } => OperationKind::AddColumn,
            Self::AlterColumn { .. } => OperationKind::AlterColumn,
            Self::DropColumn { .. } => OperationKind::DropColumn,
            Self::AddRow { .. } => OperationKind::AddRow,
            Self::EditCell { .. } => OperationKind::EditCell,
            Self::DeleteRow { .. } => OperationKind::DeleteRow,
        }
    }

    pub fn category(&self) -> Category {
        self.kind().category()
    }

    pub fn is_removal(&self) -> bool {
        self.category() == Category::Removal
    }

    /// The entity this operation mutates.
    pub fn target(&self) -> EntityRef {
        match self {
            Self::AddTable { table, .. } | Self::DropTable { table } => EntityRef::Table(*table),
            Self::RenameEntity { target, .. } => target.clone(),
            Self::AddColumn { table, column, .. }
            | Self::AlterColumn { table, column, .. }
            | Self::DropColumn { table, column } => EntityRef::Column {
                table: *table,
                column: *column,
            },
            Self::AddRow { table, row, .. } => EntityRef::Row {
                table: *table,
                row: RowKey::Pending(*row),
            },
            Self::EditCell {
                table, row, column, ..
            } => EntityRef::Cell {
                table: *table,
                row: row.clone(),
                column: *column,
            },
            Self::DeleteRow { table, row, .. } => EntityRef::Row {
                table: *table,
                row: row.clone(),
            },
        }
    }

    pub fn to_msgpack(&self) -> Result<Vec<u8>, CoreError> {
        rmp_serde::to_vec(self).map_err(|e| CoreError::Serialization(e.to_string()))
    }

    pub fn from_msgpack(bytes: &[u8]) -> Result<Self, CoreError> {
        rmp_serde::from_slice(bytes).map_err(|e| CoreError::Serialization(e.to_string()))
    }
}

/// One user-authored change awaiting submission. Immutable: a revision is a
/// new `Operation` with a new id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operation {
    op_id: OpId,
    seq: Seq,
    payload: OperationPayload,
}

impl Operation {
    pub fn new(seq: Seq, payload: OperationPayload) -> Self {
        Self {
            op_id: OpId::new(),
            seq,
            payload,
        }
    }

    /// A replacement for `self` carrying `payload`.
    pub fn revise(&self, seq: Seq, payload: OperationPayload) -> Self {
        debug_assert!(seq >= self.seq, "revision must not predate the original");
        Self::new(seq, payload)
    }

    pub fn op_id(&self) -> OpId {
        self.op_id
    }

    pub fn seq(&self) -> Seq {
        self.seq
    }

    pub fn payload(&self) -> &OperationPayload {
        &self.payload
    }

    pub fn kind(&self) -> OperationKind {
        self.payload.kind()
    }

    pub fn target(&self) -> EntityRef {
        self.payload.target()
    }

    /// The `(target, category)` pair that at most one pending operation may hold.
    pub fn slot(&self) -> (EntityRef, Category) {
        (self.payload.target(), self.payload.category())
    }

    /// One-line description for a pending-changes panel.
    pub fn summary(&self) -> String {
        match &self.payload {
            OperationPayload::AddTable { name, columns, .. } => {
                format!("Create table \"{name}\" with {} column(s)", columns.len())
            }
            OperationPayload::DropTable { table } => format!("Drop table {table:?}"),
            OperationPayload::RenameEntity { target, new_name } => {
                format!("Rename {target} to \"{new_name}\"")
            }
            OperationPayload::AddColumn {
                table, definition, ..
            } => format!(
                "Add column \"{}\" ({}) to table {table:?}",
                definition.name, definition.data_type
            ),
            OperationPayload::AlterColumn {
                table,
                column,
                data_type,
                ..
            } => match data_type {
                Some(ty) => format!("Change type of column {column:?} in table {table:?} to {ty}"),
                None => format!("Alter column {column:?} in table {table:?}"),
            },
            OperationPayload::DropColumn { table, column } => {
                format!("Drop column {column:?} from table {table:?}")
            }
            OperationPayload::AddRow { table, values, .. } => {
                format!("Insert row with {} value(s) into table {table:?}", values.len())
            }
            OperationPayload::EditCell {
                row,
                column,
                old_value,
                new_value,
                ..
            } => format!("Update {column:?} of {row}: {old_value} -> {new_value}"),
            OperationPayload::DeleteRow { table, row, .. } => {
                format!("Delete {row} from table {table:?}")
            }
        }
    }

    pub fn to_msgpack(&self) -> Result<Vec<u8>, CoreError> {
        rmp_serde::to_vec(self).map_err(|e| CoreError::Serialization(e.to_string()))
    }

    pub fn from_msgpack(bytes: &[u8]) -> Result<Self, CoreError> {
        rmp_serde::from_slice(bytes).map_err(|e| CoreError::Serialization(e.to_string()))
    }
}

impl Ord for Operation {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.seq.cmp(&other.seq).then(self.op_id.cmp(&other.op_id))
    }
}

impl PartialOrd for Operation {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
