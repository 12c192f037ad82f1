//! SQLite-backed [`RelayStore`].
//!
//! Several coordinator processes may open the same database file; status
//! changes run inside `BEGIN IMMEDIATE` transactions and the `UPDATE` is
//! additionally guarded on the expected status, so at most one writer wins
//! each transition.

use relay_core::{
    ClientRecord, Command, CommandFilter, CommandStatus, RelayError, RelayResult, RelayStore,
    Transition,
};
use rusqlite::types::Type;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row, TransactionBehavior};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use tracing::info;

pub const RELAY_SCHEMA_VERSION: i64 = 1;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const CLIENT_COLUMNS: &str =
    "client_id, hostname, client_type, ip_address, last_seen_ms, last_command_id, registered_at_ms";

const COMMAND_COLUMNS: &str = "command_id, client_id, command, params_json, status, timeout_secs, \
     created_at_ms, updated_at_ms, claimed_by, claimed_at_ms, exit_code, result_json, stdout, stderr";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("unsupported schema version {found}, max supported {supported}")]
    UnsupportedSchemaVersion { found: i64, supported: i64 },
    #[error("connection lock poisoned")]
    LockPoisoned,
    #[error(transparent)]
    Relay(#[from] RelayError),
}

impl From<StorageError> for RelayError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::Relay(err) => err,
            other => RelayError::Store(other.to_string()),
        }
    }
}

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Opens (creating if needed) the database file and its parent directory.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self, StorageError> {
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        let _journal_mode: String =
            conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.migrate()?;
        Ok(store)
    }

    pub fn schema_version(&self) -> Result<i64, StorageError> {
        let conn = self.lock()?;
        Ok(conn.query_row("PRAGMA user_version", [], |row| row.get(0))?)
    }

    pub fn migrate(&self) -> Result<(), StorageError> {
        let current = self.schema_version()?;
        if current > RELAY_SCHEMA_VERSION {
            return Err(StorageError::UnsupportedSchemaVersion {
                found: current,
                supported: RELAY_SCHEMA_VERSION,
            });
        }

        if current < 1 {
            let conn = self.lock()?;
            let sql = include_str!("../migrations/0001_relay_schema.sql");
            conn.execute_batch(sql)?;
            conn.execute("PRAGMA user_version = 1", []).map(|_| ())?;
            info!(event = "relay_schema_migrated", version = 1);
        }

        Ok(())
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StorageError> {
        self.conn.lock().map_err(|_| StorageError::LockPoisoned)
    }
}

fn conversion_error(column: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(column, Type::Text, message.into())
}

fn json_column(row: &Row<'_>, column: usize) -> rusqlite::Result<Option<serde_json::Value>> {
    let raw: Option<String> = row.get(column)?;
    raw.map(|text| serde_json::from_str(&text).map_err(|err| conversion_error(column, err.to_string())))
        .transpose()
}

fn client_from_row(row: &Row<'_>) -> rusqlite::Result<ClientRecord> {
    Ok(ClientRecord {
        client_id: row.get(0)?,
        hostname: row.get(1)?,
        client_type: row.get(2)?,
        ip_address: row.get(3)?,
        last_seen_ms: row.get(4)?,
        last_command_id: row.get(5)?,
        registered_at_ms: row.get(6)?,
    })
}

fn command_from_row(row: &Row<'_>) -> rusqlite::Result<Command> {
    let status: String = row.get(4)?;
    let status = status
        .parse::<CommandStatus>()
        .map_err(|err| conversion_error(4, err))?;
    let params = json_column(row, 3)?.unwrap_or_default();
    let timeout_secs: Option<i64> = row.get(5)?;

    Ok(Command {
        command_id: row.get(0)?,
        client_id: row.get(1)?,
        command: row.get(2)?,
        params,
        status,
        timeout_secs: timeout_secs.map(|value| value.max(0) as u64),
        created_at_ms: row.get(6)?,
        updated_at_ms: row.get(7)?,
        claimed_by: row.get(8)?,
        claimed_at_ms: row.get(9)?,
        exit_code: row.get(10)?,
        result: json_column(row, 11)?,
        stdout: row.get(12)?,
        stderr: row.get(13)?,
    })
}

fn to_json(value: &serde_json::Value) -> Result<String, StorageError> {
    serde_json::to_string(value).map_err(|err| StorageError::Serialization(err.to_string()))
}

fn select_client(conn: &Connection, client_id: &str) -> Result<Option<ClientRecord>, StorageError> {
    let sql = format!("SELECT {CLIENT_COLUMNS} FROM clients WHERE client_id = ?1");
    Ok(conn
        .query_row(&sql, [client_id], client_from_row)
        .optional()?)
}

fn select_command(conn: &Connection, command_id: &str) -> Result<Option<Command>, StorageError> {
    let sql = format!("SELECT {COMMAND_COLUMNS} FROM commands WHERE command_id = ?1");
    Ok(conn
        .query_row(&sql, [command_id], command_from_row)
        .optional()?)
}

fn write_client(conn: &Connection, record: &ClientRecord) -> Result<(), StorageError> {
    conn.execute(
        "
        INSERT INTO clients (
            client_id,
            hostname,
            client_type,
            ip_address,
            last_seen_ms,
            last_command_id,
            registered_at_ms
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
        ON CONFLICT(client_id) DO UPDATE SET
            hostname=excluded.hostname,
            client_type=excluded.client_type,
            ip_address=excluded.ip_address,
            last_seen_ms=excluded.last_seen_ms,
            last_command_id=excluded.last_command_id
        ",
        params![
            record.client_id,
            record.hostname,
            record.client_type,
            record.ip_address,
            record.last_seen_ms,
            record.last_command_id,
            record.registered_at_ms,
        ],
    )?;
    Ok(())
}

impl RelayStore for SqliteStore {
    fn upsert_client(&self, record: ClientRecord) -> RelayResult<ClientRecord> {
        let mut conn = self.lock()?;
        let run = || -> Result<ClientRecord, StorageError> {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let stored = match select_client(&tx, &record.client_id)? {
                Some(existing) => existing.merge(record),
                None => record,
            };
            write_client(&tx, &stored)?;
            tx.commit()?;
            Ok(stored)
        };
        Ok(run()?)
    }

    fn touch_client(
        &self,
        client_id: &str,
        seen_at_ms: i64,
        last_command_id: Option<&str>,
    ) -> RelayResult<ClientRecord> {
        let mut conn = self.lock()?;
        let mut run = || -> Result<ClientRecord, StorageError> {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let Some(mut record) = select_client(&tx, client_id)? else {
                return Err(RelayError::client_not_found(client_id).into());
            };
            record.observe(seen_at_ms, last_command_id);
            tx.execute(
                "UPDATE clients SET last_seen_ms = ?2, last_command_id = ?3 WHERE client_id = ?1",
                params![record.client_id, record.last_seen_ms, record.last_command_id],
            )?;
            tx.commit()?;
            Ok(record)
        };
        Ok(run()?)
    }

    fn get_client(&self, client_id: &str) -> RelayResult<Option<ClientRecord>> {
        let conn = self.lock()?;
        Ok(select_client(&conn, client_id)?)
    }

    fn list_clients(&self) -> RelayResult<Vec<ClientRecord>> {
        let conn = self.lock()?;
        let run = || -> Result<Vec<ClientRecord>, StorageError> {
            let sql = format!("SELECT {CLIENT_COLUMNS} FROM clients ORDER BY client_id");
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map([], client_from_row)?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        };
        Ok(run()?)
    }

    fn insert_command(&self, command: &Command) -> RelayResult<()> {
        let conn = self.lock()?;
        let run = || -> Result<(), StorageError> {
            let params_json = to_json(&command.params)?;
            let result_json = command.result.as_ref().map(to_json).transpose()?;
            conn.execute(
                "
                INSERT INTO commands (
                    command_id,
                    client_id,
                    command,
                    params_json,
                    status,
                    timeout_secs,
                    created_at_ms,
                    updated_at_ms,
                    claimed_by,
                    claimed_at_ms,
                    exit_code,
                    result_json,
                    stdout,
                    stderr
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
                ",
                params![
                    command.command_id,
                    command.client_id,
                    command.command,
                    params_json,
                    command.status.as_str(),
                    command
                        .timeout_secs
                        .map(|value| i64::try_from(value).unwrap_or(i64::MAX)),
                    command.created_at_ms,
                    command.updated_at_ms,
                    command.claimed_by,
                    command.claimed_at_ms,
                    command.exit_code,
                    result_json,
                    command.stdout,
                    command.stderr,
                ],
            )?;
            Ok(())
        };
        Ok(run()?)
    }

    fn get_command(&self, command_id: &str) -> RelayResult<Option<Command>> {
        let conn = self.lock()?;
        Ok(select_command(&conn, command_id)?)
    }

    fn list_commands(&self, filter: &CommandFilter) -> RelayResult<Vec<Command>> {
        let conn = self.lock()?;
        let run = || -> Result<Vec<Command>, StorageError> {
            let mut clauses = Vec::new();
            let mut values: Vec<String> = Vec::new();
            if let Some(client_id) = &filter.client_id {
                values.push(client_id.clone());
                clauses.push(format!("client_id = ?{}", values.len()));
            }
            if let Some(status) = filter.status {
                values.push(status.as_str().to_string());
                clauses.push(format!("status = ?{}", values.len()));
            }

            let mut sql = format!("SELECT {COMMAND_COLUMNS} FROM commands");
            if !clauses.is_empty() {
                sql.push_str(" WHERE ");
                sql.push_str(&clauses.join(" AND "));
            }
            sql.push_str(" ORDER BY created_at_ms DESC, rowid DESC");
            if let Some(limit) = filter.limit {
                sql.push_str(&format!(" LIMIT {}", i64::try_from(limit).unwrap_or(i64::MAX)));
            }

            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params_from_iter(values), command_from_row)?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        };
        Ok(run()?)
    }

    fn compare_and_transition(
        &self,
        command_id: &str,
        expected: CommandStatus,
        transition: Transition,
    ) -> RelayResult<Command> {
        let mut conn = self.lock()?;
        let run = || -> Result<Command, StorageError> {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let Some(mut command) = select_command(&tx, command_id)? else {
                return Err(RelayError::command_not_found(command_id).into());
            };
            command.apply_transition(expected, transition)?;

            let result_json = command.result.as_ref().map(to_json).transpose()?;
            let changed = tx.execute(
                "
                UPDATE commands SET
                    status = ?2,
                    updated_at_ms = ?3,
                    claimed_by = ?4,
                    claimed_at_ms = ?5,
                    exit_code = ?6,
                    result_json = ?7,
                    stdout = ?8,
                    stderr = ?9
                WHERE command_id = ?1 AND status = ?10
                ",
                params![
                    command.command_id,
                    command.status.as_str(),
                    command.updated_at_ms,
                    command.claimed_by,
                    command.claimed_at_ms,
                    command.exit_code,
                    result_json,
                    command.stdout,
                    command.stderr,
                    expected.as_str(),
                ],
            )?;
            if changed == 0 {
                let actual = select_command(&tx, command_id)?
                    .map(|current| current.status)
                    .unwrap_or(expected);
                return Err(RelayError::Conflict {
                    command_id: command_id.to_string(),
                    expected,
                    actual,
                }
                .into());
            }
            tx.commit()?;
            Ok(command)
        };
        Ok(run()?)
    }
}
