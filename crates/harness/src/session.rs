use std::sync::Arc;

use tempfile::TempDir;

use mutq_core::{ColumnDef, ColumnId, OperationPayload, RowKey, TableId, TempRowId, Value};
use mutq_engine::{EngineError, QueueConfig, QueueStore, SaveResult};
use mutq_remote::{CommitMode, RemoteError, SqliteEndpoint};

/// A queue wired to a real SQLite endpoint.
pub struct TestSession {
    pub store: QueueStore<Arc<SqliteEndpoint>>,
    pub remote: Arc<SqliteEndpoint>,
    _dir: Option<TempDir>,
}

impl TestSession {
    pub fn new() -> Result<Self, RemoteError> {
        Self::with_mode(CommitMode::default())
    }

    pub fn with_mode(mode: CommitMode) -> Result<Self, RemoteError> {
        let remote = Arc::new(SqliteEndpoint::open_in_memory()?.with_mode(mode));
        Ok(Self::wire(remote, None))
    }

    /// Backed by a database file in a fresh temp dir.
    pub fn on_disk() -> Result<Self, Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("remote.db");
        let path = path.to_str().ok_or("temp path is not UTF-8")?;
        let remote = Arc::new(SqliteEndpoint::open(path)?);
        Ok(Self::wire(remote, Some(dir)))
    }

    fn wire(remote: Arc<SqliteEndpoint>, dir: Option<TempDir>) -> Self {
        Self {
            store: QueueStore::with_config(Arc::clone(&remote), QueueConfig::default()),
            remote,
            _dir: dir,
        }
    }

    /// Queue a new table; returns its id and the ids of `columns` in order.
    pub fn create_table(
        &self,
        name: &str,
        columns: &[(&str, &str)],
    ) -> Result<(TableId, Vec<ColumnId>), EngineError> {
        let table = TableId::new();
        let columns: Vec<(ColumnId, ColumnDef)> = columns
            .iter()
            .map(|(name, ty)| (ColumnId::new(), ColumnDef::new(*name, *ty)))
            .collect();
        let ids = columns.iter().map(|(id, _)| *id).collect();
        self.store.enqueue(OperationPayload::AddTable {
            table,
            name: name.to_string(),
            columns,
        })?;
        Ok((table, ids))
    }

    pub fn insert_row(
        &self,
        table: TableId,
        values: Vec<(ColumnId, Value)>,
    ) -> Result<TempRowId, EngineError> {
        let row = TempRowId::new();
        self.store
            .enqueue(OperationPayload::AddRow { table, row, values })?;
        Ok(row)
    }

    pub fn edit_cell(
        &self,
        table: TableId,
        row: RowKey,
        column: ColumnId,
        old_value: Value,
        new_value: Value,
    ) -> Result<(), EngineError> {
        self.store.enqueue(OperationPayload::EditCell {
            table,
            row,
            column,
            old_value,
            new_value,
        })?;
        Ok(())
    }

    pub async fn save(&self) -> Result<SaveResult, EngineError> {
        self.store.save().await
    }
}
