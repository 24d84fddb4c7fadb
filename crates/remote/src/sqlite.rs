use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use rusqlite::types::Value as SqlValue;
use rusqlite::{Connection, OptionalExtension};
use tracing::{debug, warn};

use mutq_core::{
    ids::*,
    operations::{ColumnDef, Operation, OperationKind, OperationPayload},
    value::Value,
};

use crate::error::RemoteError;
use crate::traits::{RemoteEndpoint, SaveRequest, SaveResponse};

/// How a batch is committed when one of its operations fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CommitMode {
    /// Nothing is kept unless everything applies.
    Atomic,
    /// Each operation runs in its own savepoint; the prefix before the first
    /// failure is committed.
    #[default]
    StatementBoundary,
}

/// A remote endpoint that applies batches to a SQLite database.
///
/// Tables and columns are addressed by stable ids through a catalog kept in
/// `_mutq_tables` / `_mutq_columns`, so renames never invalidate queued
/// operations. `RowKey::Existing` keys are SQLite rowids.
pub struct SqliteEndpoint {
    conn: Mutex<Connection>,
    mode: CommitMode,
}

impl SqliteEndpoint {
    pub fn open(path: &str) -> Result<Self, RemoteError> {
        let conn = Connection::open(path)?;
        crate::schema::init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            mode: CommitMode::default(),
        })
    }

    pub fn open_in_memory() -> Result<Self, RemoteError> {
        let conn = Connection::open_in_memory()?;
        crate::schema::init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            mode: CommitMode::default(),
        })
    }

    pub fn with_mode(mut self, mode: CommitMode) -> Self {
        self.mode = mode;
        self
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        // Every write path either commits or rolls back before releasing the
        // guard, so a poisoned connection is still consistent.
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run raw SQL outside the queue, e.g. to seed pre-existing tables.
    pub fn execute_sql(&self, sql: &str) -> Result<(), RemoteError> {
        self.conn().execute_batch(sql)?;
        Ok(())
    }

    /// Register a table created outside the queue so operations can address
    /// it and its columns by id.
    pub fn adopt_table(
        &self,
        table: TableId,
        name: &str,
        columns: &[(ColumnId, &str)],
    ) -> Result<(), RemoteError> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;

        let mut stmt = tx.prepare(&format!("PRAGMA table_info({})", quote_ident(name)))?;
        let existing: Vec<(String, String, bool)> = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, i64>(3)? != 0,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        drop(stmt);
        if existing.is_empty() {
            return Err(RemoteError::UnknownTable(name.to_string()));
        }

        tx.execute(
            "INSERT INTO _mutq_tables (table_id, name) VALUES (?1, ?2)",
            rusqlite::params![table.as_bytes().as_slice(), name],
        )?;
        for (position, (column_id, column_name)) in columns.iter().enumerate() {
            let (_, data_type, not_null) = existing
                .iter()
                .find(|(n, _, _)| n == column_name)
                .ok_or_else(|| RemoteError::UnknownColumn(format!("{name}.{column_name}")))?;
            tx.execute(
                "INSERT INTO _mutq_columns (column_id, table_id, name, data_type, nullable, default_value, position) VALUES (?1, ?2, ?3, ?4, ?5, NULL, ?6)",
                rusqlite::params![
                    column_id.as_bytes().as_slice(),
                    table.as_bytes().as_slice(),
                    column_name,
                    data_type,
                    !*not_null,
                    position as i64,
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Current names of catalogued tables, sorted.
    pub fn table_names(&self) -> Result<Vec<String>, RemoteError> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT name FROM _mutq_tables ORDER BY name")?;
        let names = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(names)
    }

    /// Current column names of a table in creation order.
    pub fn column_names(&self, table: TableId) -> Result<Vec<String>, RemoteError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT name FROM _mutq_columns WHERE table_id = ?1 ORDER BY position, rowid",
        )?;
        let names = stmt
            .query_map(rusqlite::params![table.as_bytes().as_slice()], |row| {
                row.get::<_, String>(0)
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(names)
    }

    /// Declared type of a column as recorded in the catalog.
    pub fn column_type(&self, table: TableId, column: ColumnId) -> Result<String, RemoteError> {
        let conn = self.conn();
        let ty = conn
            .query_row(
                "SELECT data_type FROM _mutq_columns WHERE table_id = ?1 AND column_id = ?2",
                rusqlite::params![table.as_bytes().as_slice(), column.as_bytes().as_slice()],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        ty.ok_or_else(|| RemoteError::UnknownColumn(column.to_string()))
    }

    pub fn row_count(&self, table: TableId) -> Result<u64, RemoteError> {
        let conn = self.conn();
        let name = table_name(&conn, table)?;
        let count: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM {}", quote_ident(&name)),
            [],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    /// Read one cell. `None` when the row does not exist.
    pub fn read_cell(
        &self,
        table: TableId,
        row: &RowKey,
        column: ColumnId,
    ) -> Result<Option<Value>, RemoteError> {
        let conn = self.conn();
        let name = table_name(&conn, table)?;
        let column_name = column_name(&conn, table, column)?;
        let rowid = match resolve_rowid(&conn, table, row) {
            Ok(rowid) => rowid,
            Err(RemoteError::UnknownRow(_)) => return Ok(None),
            Err(e) => return Err(e),
        };
        let value = conn
            .query_row(
                &format!(
                    "SELECT {} FROM {} WHERE rowid = ?1",
                    quote_ident(&column_name),
                    quote_ident(&name)
                ),
                rusqlite::params![rowid],
                |row| row.get::<_, SqlValue>(0),
            )
            .optional()?;
        Ok(value.map(from_sql_value))
    }

    /// The rowid a queued insert received, once applied.
    pub fn rowid_for(&self, temp_row: TempRowId) -> Result<Option<i64>, RemoteError> {
        let conn = self.conn();
        let rowid = conn
            .query_row(
                "SELECT row_id FROM _mutq_rows WHERE temp_row_id = ?1",
                rusqlite::params![temp_row.as_bytes().as_slice()],
                |row| row.get::<_, i64>(0),
            )
            .optional()?;
        Ok(rowid)
    }

    /// Journaled batches as `(batch_id, op_count, applied_count)`, oldest first.
    pub fn applied_batches(&self) -> Result<Vec<(BatchId, u64, u64)>, RemoteError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT batch_id, op_count, applied_count FROM _mutq_batches ORDER BY received_at, rowid",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, Vec<u8>>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, i64>(2)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter()
            .map(|(id, ops, applied)| {
                Ok((
                    BatchId::from_bytes(to_array::<16>(id, "batch_id")?),
                    ops as u64,
                    applied as u64,
                ))
            })
            .collect()
    }

    /// Kinds of the operations a batch applied, in application order.
    pub fn applied_kinds(&self, batch_id: BatchId) -> Result<Vec<OperationKind>, RemoteError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT op_type FROM _mutq_applied_ops WHERE batch_id = ?1 ORDER BY position",
        )?;
        let names = stmt
            .query_map(rusqlite::params![batch_id.as_bytes().as_slice()], |row| {
                row.get::<_, String>(0)
            })?
            .collect::<Result<Vec<_>, _>>()?;
        names
            .iter()
            .map(|name| OperationKind::parse(name).map_err(RemoteError::from))
            .collect()
    }

    #[tracing::instrument(level = "debug", skip(self, request), fields(batch = %request.batch_id, ops = request.len()))]
    fn run_batch(&self, request: &SaveRequest) -> Result<SaveResponse, RemoteError> {
        request.verify_checksum()?;

        let mut conn = self.conn();
        let seen: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM _mutq_batches WHERE batch_id = ?1",
                rusqlite::params![request.batch_id.as_bytes().as_slice()],
                |row| row.get(0),
            )
            .optional()?;
        if seen.is_some() {
            return Err(RemoteError::DuplicateBatch(request.batch_id.to_string()));
        }

        let mut tx = conn.transaction()?;
        let mut applied = 0usize;
        let mut failure: Option<(OpId, String)> = None;

        for (position, op) in request.operations.iter().enumerate() {
            let outcome = match self.mode {
                CommitMode::Atomic => apply_op(&tx, request.batch_id, position, op),
                CommitMode::StatementBoundary => {
                    let sp = tx.savepoint()?;
                    let result = apply_op(&sp, request.batch_id, position, op);
                    if result.is_ok() {
                        sp.commit()?;
                    }
                    result
                }
            };
            match outcome {
                Ok(()) => applied += 1,
                Err(e) => {
                    debug!(op = %op.op_id(), kind = %op.kind(), error = %e, "operation failed");
                    failure = Some((op.op_id(), e.to_string()));
                    break;
                }
            }
        }

        if let Some((failed_op, reason)) = failure {
            if self.mode == CommitMode::Atomic {
                // Dropping the transaction rolls back every statement.
                drop(tx);
                warn!(batch = %request.batch_id, %failed_op, "atomic batch rolled back");
                return Ok(SaveResponse::Partial {
                    applied: 0,
                    failed_op,
                    reason,
                });
            }
            record_batch(&tx, request, applied)?;
            tx.commit()?;
            warn!(batch = %request.batch_id, applied, %failed_op, "batch partially applied");
            return Ok(SaveResponse::Partial {
                applied,
                failed_op,
                reason,
            });
        }

        record_batch(&tx, request, applied)?;
        tx.commit()?;
        debug!(batch = %request.batch_id, applied, "batch applied");
        Ok(SaveResponse::Applied { count: applied })
    }
}

#[async_trait]
impl RemoteEndpoint for SqliteEndpoint {
    async fn execute(&self, request: SaveRequest) -> Result<SaveResponse, RemoteError> {
        self.run_batch(&request)
    }
}

fn record_batch(
    conn: &Connection,
    request: &SaveRequest,
    applied: usize,
) -> Result<(), RemoteError> {
    conn.execute(
        "INSERT INTO _mutq_batches (batch_id, checksum, op_count, applied_count) VALUES (?1, ?2, ?3, ?4)",
        rusqlite::params![
            request.batch_id.as_bytes().as_slice(),
            &request.checksum[..],
            request.len() as i64,
            applied as i64,
        ],
    )?;
    Ok(())
}

fn apply_op(
    conn: &Connection,
    batch_id: BatchId,
    position: usize,
    op: &Operation,
) -> Result<(), RemoteError> {
    let already: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM _mutq_applied_ops WHERE op_id = ?1",
            rusqlite::params![op.op_id().as_bytes().as_slice()],
            |row| row.get(0),
        )
        .optional()?;
    if already.is_some() {
        return Err(RemoteError::Rejected(format!(
            "operation {} was already applied",
            op.op_id()
        )));
    }

    materialize_op(conn, op)?;

    conn.execute(
        "INSERT INTO _mutq_applied_ops (op_id, batch_id, position, op_type, seq) VALUES (?1, ?2, ?3, ?4, ?5)",
        rusqlite::params![
            op.op_id().as_bytes().as_slice(),
            batch_id.as_bytes().as_slice(),
            position as i64,
            op.kind().as_str(),
            &op.seq().to_bytes()[..],
        ],
    )?;
    Ok(())
}

fn materialize_op(conn: &Connection, op: &Operation) -> Result<(), RemoteError> {
    match op.payload() {
        OperationPayload::AddTable {
            table,
            name,
            columns,
        } => {
            if columns.is_empty() {
                return Err(RemoteError::Rejected(format!(
                    "table \"{name}\" must have at least one column"
                )));
            }
            let defs: Vec<String> = columns.iter().map(|(_, def)| column_sql(def)).collect();
            conn.execute(
                &format!("CREATE TABLE {} ({})", quote_ident(name), defs.join(", ")),
                [],
            )?;
            conn.execute(
                "INSERT INTO _mutq_tables (table_id, name) VALUES (?1, ?2)",
                rusqlite::params![table.as_bytes().as_slice(), name],
            )?;
            for (position, (column, def)) in columns.iter().enumerate() {
                insert_column(conn, *table, *column, def, position)?;
            }
        }

        OperationPayload::DropTable { table } => {
            let name = table_name(conn, *table)?;
            conn.execute(&format!("DROP TABLE {}", quote_ident(&name)), [])?;
            for sql in [
                "DELETE FROM _mutq_tables WHERE table_id = ?1",
                "DELETE FROM _mutq_columns WHERE table_id = ?1",
                "DELETE FROM _mutq_rows WHERE table_id = ?1",
            ] {
                conn.execute(sql, rusqlite::params![table.as_bytes().as_slice()])?;
            }
        }

        OperationPayload::RenameEntity { target, new_name } => match target {
            EntityRef::Table(table) => {
                let name = table_name(conn, *table)?;
                conn.execute(
                    &format!(
                        "ALTER TABLE {} RENAME TO {}",
                        quote_ident(&name),
                        quote_ident(new_name)
                    ),
                    [],
                )?;
                conn.execute(
                    "UPDATE _mutq_tables SET name = ?1 WHERE table_id = ?2",
                    rusqlite::params![new_name, table.as_bytes().as_slice()],
                )?;
            }
            EntityRef::Column { table, column } => {
                let name = table_name(conn, *table)?;
                let old = column_name(conn, *table, *column)?;
                conn.execute(
                    &format!(
                        "ALTER TABLE {} RENAME COLUMN {} TO {}",
                        quote_ident(&name),
                        quote_ident(&old),
                        quote_ident(new_name)
                    ),
                    [],
                )?;
                conn.execute(
                    "UPDATE _mutq_columns SET name = ?1 WHERE column_id = ?2",
                    rusqlite::params![new_name, column.as_bytes().as_slice()],
                )?;
            }
            other => {
                return Err(RemoteError::Rejected(format!("{other} cannot be renamed")));
            }
        },

        OperationPayload::AddColumn {
            table,
            column,
            definition,
        } => {
            let name = table_name(conn, *table)?;
            conn.execute(
                &format!(
                    "ALTER TABLE {} ADD COLUMN {}",
                    quote_ident(&name),
                    column_sql(definition)
                ),
                [],
            )?;
            let position: i64 = conn.query_row(
                "SELECT COUNT(*) FROM _mutq_columns WHERE table_id = ?1",
                rusqlite::params![table.as_bytes().as_slice()],
                |row| row.get(0),
            )?;
            insert_column(conn, *table, *column, definition, position as usize)?;
        }

        OperationPayload::AlterColumn {
            table,
            column,
            data_type,
            nullable,
            default,
        } => {
            // Column affinity is advisory in SQLite; the declared shape lives
            // in the catalog.
            column_name(conn, *table, *column)?;
            if let Some(ty) = data_type {
                conn.execute(
                    "UPDATE _mutq_columns SET data_type = ?1 WHERE column_id = ?2",
                    rusqlite::params![ty, column.as_bytes().as_slice()],
                )?;
            }
            if let Some(nullable) = nullable {
                conn.execute(
                    "UPDATE _mutq_columns SET nullable = ?1 WHERE column_id = ?2",
                    rusqlite::params![nullable, column.as_bytes().as_slice()],
                )?;
            }
            if let Some(default) = default {
                let bytes = rmp_serde::to_vec(default)
                    .map_err(|e| RemoteError::Serialization(e.to_string()))?;
                conn.execute(
                    "UPDATE _mutq_columns SET default_value = ?1 WHERE column_id = ?2",
                    rusqlite::params![bytes, column.as_bytes().as_slice()],
                )?;
            }
        }

        OperationPayload::DropColumn { table, column } => {
            let name = table_name(conn, *table)?;
            let col = column_name(conn, *table, *column)?;
            conn.execute(
                &format!(
                    "ALTER TABLE {} DROP COLUMN {}",
                    quote_ident(&name),
                    quote_ident(&col)
                ),
                [],
            )?;
            conn.execute(
                "DELETE FROM _mutq_columns WHERE column_id = ?1",
                rusqlite::params![column.as_bytes().as_slice()],
            )?;
        }

        OperationPayload::AddRow { table, row, values } => {
            let name = table_name(conn, *table)?;
            if values.is_empty() {
                conn.execute(
                    &format!("INSERT INTO {} DEFAULT VALUES", quote_ident(&name)),
                    [],
                )?;
            } else {
                let mut columns = Vec::with_capacity(values.len());
                for (column, _) in values {
                    columns.push(quote_ident(&column_name(conn, *table, *column)?));
                }
                let placeholders: Vec<String> =
                    (1..=values.len()).map(|i| format!("?{i}")).collect();
                conn.execute(
                    &format!(
                        "INSERT INTO {} ({}) VALUES ({})",
                        quote_ident(&name),
                        columns.join(", "),
                        placeholders.join(", ")
                    ),
                    rusqlite::params_from_iter(values.iter().map(|(_, v)| to_sql_value(v))),
                )?;
            }
            conn.execute(
                "INSERT INTO _mutq_rows (temp_row_id, table_id, row_id) VALUES (?1, ?2, ?3)",
                rusqlite::params![
                    row.as_bytes().as_slice(),
                    table.as_bytes().as_slice(),
                    conn.last_insert_rowid(),
                ],
            )?;
        }

        OperationPayload::EditCell {
            table,
            row,
            column,
            new_value,
            ..
        } => {
            let name = table_name(conn, *table)?;
            let col = column_name(conn, *table, *column)?;
            let rowid = resolve_rowid(conn, *table, row)?;
            let changed = conn.execute(
                &format!(
                    "UPDATE {} SET {} = ?1 WHERE rowid = ?2",
                    quote_ident(&name),
                    quote_ident(&col)
                ),
                rusqlite::params![to_sql_value(new_value), rowid],
            )?;
            if changed == 0 {
                return Err(RemoteError::UnknownRow(row.to_string()));
            }
        }

        OperationPayload::DeleteRow { table, row, .. } => {
            let name = table_name(conn, *table)?;
            let rowid = resolve_rowid(conn, *table, row)?;
            let changed = conn.execute(
                &format!("DELETE FROM {} WHERE rowid = ?1", quote_ident(&name)),
                rusqlite::params![rowid],
            )?;
            if changed == 0 {
                return Err(RemoteError::UnknownRow(row.to_string()));
            }
        }
    }
    Ok(())
}

fn insert_column(
    conn: &Connection,
    table: TableId,
    column: ColumnId,
    def: &ColumnDef,
    position: usize,
) -> Result<(), RemoteError> {
    let default = def
        .default
        .as_ref()
        .map(|v| rmp_serde::to_vec(v).map_err(|e| RemoteError::Serialization(e.to_string())))
        .transpose()?;
    conn.execute(
        "INSERT INTO _mutq_columns (column_id, table_id, name, data_type, nullable, default_value, position) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        rusqlite::params![
            column.as_bytes().as_slice(),
            table.as_bytes().as_slice(),
            def.name,
            def.data_type,
            def.nullable,
            default,
            position as i64,
        ],
    )?;
    Ok(())
}

fn table_name(conn: &Connection, table: TableId) -> Result<String, RemoteError> {
    conn.query_row(
        "SELECT name FROM _mutq_tables WHERE table_id = ?1",
        rusqlite::params![table.as_bytes().as_slice()],
        |row| row.get::<_, String>(0),
    )
    .optional()?
    .ok_or_else(|| RemoteError::UnknownTable(table.to_string()))
}

fn column_name(conn: &Connection, table: TableId, column: ColumnId) -> Result<String, RemoteError> {
    conn.query_row(
        "SELECT name FROM _mutq_columns WHERE table_id = ?1 AND column_id = ?2",
        rusqlite::params![table.as_bytes().as_slice(), column.as_bytes().as_slice()],
        |row| row.get::<_, String>(0),
    )
    .optional()?
    .ok_or_else(|| RemoteError::UnknownColumn(column.to_string()))
}

fn resolve_rowid(conn: &Connection, table: TableId, row: &RowKey) -> Result<i64, RemoteError> {
    match row {
        RowKey::Existing(key) => key
            .parse::<i64>()
            .map_err(|_| RemoteError::UnknownRow(format!("row key {key:?} is not a rowid"))),
        RowKey::Pending(temp) => conn
            .query_row(
                "SELECT row_id FROM _mutq_rows WHERE temp_row_id = ?1 AND table_id = ?2",
                rusqlite::params![temp.as_bytes().as_slice(), table.as_bytes().as_slice()],
                |r| r.get::<_, i64>(0),
            )
            .optional()?
            .ok_or_else(|| RemoteError::UnknownRow(row.to_string())),
    }
}

fn column_sql(def: &ColumnDef) -> String {
    let mut sql = format!("{} {}", quote_ident(&def.name), def.data_type);
    if def.primary_key {
        sql.push_str(" PRIMARY KEY");
    }
    if !def.nullable {
        sql.push_str(" NOT NULL");
    }
    if let Some(default) = &def.default {
        sql.push_str(" DEFAULT ");
        sql.push_str(&sql_literal(default));
    }
    sql
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn sql_literal(value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::Text(s) | Value::Json(s) => format!("'{}'", s.replace('\'', "''")),
        Value::Integer(n) => n.to_string(),
        Value::Real(r) if r.is_finite() => format!("{r:?}"),
        Value::Real(_) => "NULL".to_string(),
        Value::Boolean(b) => if *b { "1" } else { "0" }.to_string(),
        Value::Bytes(bytes) => {
            let hex: String = bytes.iter().map(|b| format!("{b:02x}")).collect();
            format!("X'{hex}'")
        }
    }
}

fn to_sql_value(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Text(s) | Value::Json(s) => SqlValue::Text(s.clone()),
        Value::Integer(n) => SqlValue::Integer(*n),
        Value::Real(r) => SqlValue::Real(*r),
        Value::Boolean(b) => SqlValue::Integer(i64::from(*b)),
        Value::Bytes(b) => SqlValue::Blob(b.clone()),
    }
}

fn from_sql_value(value: SqlValue) -> Value {
    match value {
        SqlValue::Null => Value::Null,
        SqlValue::Integer(n) => Value::Integer(n),
        SqlValue::Real(r) => Value::Real(r),
        SqlValue::Text(s) => Value::Text(s),
        SqlValue::Blob(b) => Value::Bytes(b),
    }
}

fn to_array<const N: usize>(v: Vec<u8>, label: &str) -> Result<[u8; N], RemoteError> {
    v.try_into()
        .map_err(|_| RemoteError::Serialization(format!("invalid {label} length")))
}
