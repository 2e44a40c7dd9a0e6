use std::path::Path;

use rusqlite::config::DbConfig;
use rusqlite::types::Value;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use sb2_backup_core::{
    ConvertError, KeyLookup, LookupMiss, OptionalKey, RawCommand, SourceSnapshot, SUPPORTED_SCHEMA,
};

const SELECT_KEY_VALUE_SQL: &str = "SELECT value FROM DBKeyValue WHERE key = ?1";
const SELECT_COMMANDS_SQL: &str = "SELECT data FROM DBCommand ORDER BY Id";

const SCHEMA_KEY: &str = "schema";
const LOCAL_VERSION_KEY: &str = "local_version";

/// Read-only view over a Smart Budget 2 `.db3` file.
pub struct SourceDatabase {
    conn: Connection,
}

/// Version string of the linked SQLite library.
#[must_use]
pub fn sqlite_version() -> &'static str {
    rusqlite::version()
}

impl SourceDatabase {
    /// Open an existing database file without creating or modifying it.
    ///
    /// # Errors
    /// Returns [`ConvertError::NotFound`] when the path does not exist and
    /// [`ConvertError::Open`] when the file is not a readable SQLite database.
    pub fn open(path: &Path) -> Result<Self, ConvertError> {
        if !path.exists() {
            return Err(ConvertError::NotFound(format!("no such file: {}", path.display())));
        }

        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(|err| ConvertError::Open(format!("{}: {err}", path.display())))?;

        // A pending WAL must stay beside the source, never folded into it.
        conn.set_db_config(DbConfig::SQLITE_DBCONFIG_NO_CKPT_ON_CLOSE, true)
            .map_err(|err| ConvertError::Open(format!("{}: {err}", path.display())))?;

        // SQLite opens lazily; touching the catalog is what rejects non-database files.
        conn.query_row("SELECT COUNT(*) FROM sqlite_master", [], |row| row.get::<_, i64>(0))
            .map_err(|err| ConvertError::Open(format!("{}: {err}", path.display())))?;

        Ok(Self { conn })
    }

    /// Extract the schema markers, optional settings and command log.
    ///
    /// # Errors
    /// Returns an error when a required key is missing, the schema marker is not
    /// supported, or the command log cannot be read in full.
    pub fn read_snapshot(&self) -> Result<SourceSnapshot, ConvertError> {
        let schema = self
            .lookup_integer(SCHEMA_KEY)
            .map_err(|miss| ConvertError::MissingSchema(miss.to_string()))?;
        // Required to exist, never range-checked.
        let local_version = self
            .lookup_integer(LOCAL_VERSION_KEY)
            .map_err(|miss| ConvertError::MissingLocalVersion(miss.to_string()))?;
        if schema != SUPPORTED_SCHEMA {
            return Err(ConvertError::UnsupportedSchema { found: schema });
        }

        Ok(SourceSnapshot {
            schema,
            local_version,
            a_token: self.lookup_text(OptionalKey::AToken.as_str()),
            e_key_b64: self.lookup_text(OptionalKey::EKeyB64.as_str()),
            cypher: self.lookup_text(OptionalKey::Cypher.as_str()),
            selected_sheet: self.lookup_text(OptionalKey::SelectedSheet.as_str()),
            last_change_id: self.lookup_integer(OptionalKey::LastChangeId.as_str()),
            last_change_commands_size: self
                .lookup_integer(OptionalKey::LastChangeCommandsSize.as_str()),
            commands: self.read_commands()?,
        })
    }

    /// Read every `DBCommand.data` value in ascending `Id` order.
    ///
    /// # Errors
    /// Returns [`ConvertError::CommandQuery`] when the statement cannot run and
    /// [`ConvertError::CommandScan`] when any row is not a JSON text value.
    pub fn read_commands(&self) -> Result<Vec<RawCommand>, ConvertError> {
        let mut stmt = self
            .conn
            .prepare(SELECT_COMMANDS_SQL)
            .map_err(|err| ConvertError::CommandQuery(err.to_string()))?;
        let mut rows = stmt.query([]).map_err(|err| ConvertError::CommandQuery(err.to_string()))?;

        let mut commands = Vec::new();
        let mut index = 0_usize;
        while let Some(row) =
            rows.next().map_err(|err| ConvertError::CommandScan(err.to_string()))?
        {
            let data: String = row
                .get(0)
                .map_err(|err| ConvertError::CommandScan(format!("row {index}: {err}")))?;
            let command = RawCommand::parse(data).map_err(|err| {
                ConvertError::CommandScan(format!("row {index} is not a JSON value: {err}"))
            })?;
            commands.push(command);
            index += 1;
        }

        Ok(commands)
    }

    fn lookup(&self, key: &str) -> KeyLookup<Value> {
        self.conn
            .query_row(SELECT_KEY_VALUE_SQL, params![key], |row| row.get::<_, Value>(0))
            .optional()
            .map_err(|err| LookupMiss::Query { key: key.to_string(), reason: err.to_string() })?
            .ok_or_else(|| LookupMiss::Absent(key.to_string()))
    }

    fn lookup_text(&self, key: &str) -> KeyLookup<String> {
        let value = self.lookup(key)?;
        value_as_text(value).ok_or_else(|| LookupMiss::Unreadable {
            key: key.to_string(),
            reason: "value is NULL".to_string(),
        })
    }

    fn lookup_integer(&self, key: &str) -> KeyLookup<i64> {
        let value = self.lookup(key)?;
        let rendered = describe_value(&value);
        value_as_integer(value).ok_or_else(|| LookupMiss::Unreadable {
            key: key.to_string(),
            reason: format!("{rendered} is not an integer"),
        })
    }
}

fn value_as_text(value: Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::Integer(number) => Some(number.to_string()),
        Value::Real(number) => Some(number.to_string()),
        Value::Text(text) => Some(text),
        Value::Blob(bytes) => Some(String::from_utf8_lossy(&bytes).into_owned()),
    }
}

#[allow(clippy::cast_possible_truncation)]
fn value_as_integer(value: Value) -> Option<i64> {
    match value {
        Value::Integer(number) => Some(number),
        Value::Real(number) if number.fract() == 0.0 && number.abs() < 9.0e18 => {
            Some(number as i64)
        }
        Value::Text(text) => text.parse().ok(),
        Value::Blob(bytes) => std::str::from_utf8(&bytes).ok()?.parse().ok(),
        Value::Null | Value::Real(_) => None,
    }
}

fn describe_value(value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::Integer(number) => number.to_string(),
        Value::Real(number) => number.to_string(),
        Value::Text(text) => format!("'{text}'"),
        Value::Blob(bytes) => format!("blob of {} bytes", bytes.len()),
    }
}
