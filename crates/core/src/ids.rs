use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

macro_rules! uuid_id {
    ($name:ident) => {
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub struct $name(Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::now_v7())
            }

            pub fn from_bytes(bytes: [u8; 16]) -> Self {
                Self(Uuid::from_bytes(bytes))
            }

            pub fn as_bytes(&self) -> &[u8; 16] {
                self.0.as_bytes()
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), &self.0.to_string()[..8])
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

uuid_id!(OpId);
uuid_id!(BatchId);
uuid_id!(TableId);
uuid_id!(ColumnId);
uuid_id!(TempRowId);

/// Identifies a row independently of its current contents.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RowKey {
    /// Created in the queue; has no remote identity until saved.
    Pending(TempRowId),
    /// Already present remotely, addressed by its canonical primary-key text.
    Existing(String),
}

impl RowKey {
    pub fn existing(key: impl Into<String>) -> Self {
        Self::Existing(key.into())
    }
}

impl fmt::Display for RowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending(temp) => write!(f, "new row {}", &temp.to_string()[..8]),
            Self::Existing(key) => write!(f, "row {key}"),
        }
    }
}

/// The stable target of an operation. Never a current name: names can change
/// while operations are still queued.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntityRef {
    Table(TableId),
    Column { table: TableId, column: ColumnId },
    Row { table: TableId, row: RowKey },
    Cell { table: TableId, row: RowKey, column: ColumnId },
}

impl EntityRef {
    pub fn table_id(&self) -> TableId {
        match self {
            Self::Table(table)
            | Self::Column { table, .. }
            | Self::Row { table, .. }
            | Self::Cell { table, .. } => *table,
        }
    }

    /// True when `self` equals `ancestor` or is nested under it.
    pub fn is_within(&self, ancestor: &EntityRef) -> bool {
        if self == ancestor {
            return true;
        }
        match (ancestor, self) {
            (Self::Table(t), other) => other.table_id() == *t,
            (
                Self::Column { table, column },
                Self::Cell { table: t, column: c, .. },
            ) => table == t && column == c,
            (Self::Row { table, row }, Self::Cell { table: t, row: r, .. }) => {
                table == t && row == r
            }
            _ => false,
        }
    }

    /// The row this ref addresses, for row and cell refs.
    pub fn row(&self) -> Option<(TableId, &RowKey)> {
        match self {
            Self::Row { table, row } | Self::Cell { table, row, .. } => Some((*table, row)),
            _ => None,
        }
    }
}

impl fmt::Display for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Table(table) => write!(f, "table {table:?}"),
            Self::Column { table, column } => write!(f, "column {column:?} of table {table:?}"),
            Self::Row { table, row } => write!(f, "{row} of table {table:?}"),
            Self::Cell { table, row, column } => {
                write!(f, "cell {column:?} of {row} in table {table:?}")
            }
        }
    }
}
