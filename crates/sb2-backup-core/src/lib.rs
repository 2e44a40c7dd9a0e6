use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;

/// Output format version written into every backup, unrelated to the source schema.
pub const BACKUP_DB_VERSION: i64 = 20;
/// The only `DBKeyValue.schema` marker this converter understands.
pub const SUPPORTED_SCHEMA: i64 = 1;
pub const BACKUP_FILE_EXTENSION: &str = "sb2backup";

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum ConvertError {
    #[error("database doesn't exist, {0}")]
    NotFound(String),
    #[error("sqlite3 could not open input file, {0}")]
    Open(String),
    #[error("DBKeyValue contains no schema, {0}")]
    MissingSchema(String),
    #[error("DBKeyValue contains no local_version, {0}")]
    MissingLocalVersion(String),
    #[error("Unknown schema {found}, must be 1")]
    UnsupportedSchema { found: i64 },
    #[error("Cannot query DBCommand table, {0}")]
    CommandQuery(String),
    #[error("Error scanning DBCommands, {0}")]
    CommandScan(String),
    #[error("Error encoding json, {0}")]
    Encode(String),
}

/// Why a `DBKeyValue` lookup produced no usable value.
#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum LookupMiss {
    #[error("no row with key '{0}'")]
    Absent(String),
    #[error("value of '{key}' is unreadable: {reason}")]
    Unreadable { key: String, reason: String },
    #[error("lookup of '{key}' failed: {reason}")]
    Query { key: String, reason: String },
}

pub type KeyLookup<T> = Result<T, LookupMiss>;

#[derive(Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum OptionalKey {
    AToken,
    EKeyB64,
    Cypher,
    SelectedSheet,
    LastChangeId,
    LastChangeCommandsSize,
}

impl OptionalKey {
    pub const ALL: [Self; 6] = [
        Self::AToken,
        Self::EKeyB64,
        Self::Cypher,
        Self::SelectedSheet,
        Self::LastChangeId,
        Self::LastChangeCommandsSize,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AToken => "a_token",
            Self::EKeyB64 => "e_key_b64",
            Self::Cypher => "cypher",
            Self::SelectedSheet => "selected_sheet",
            Self::LastChangeId => "last_change_id",
            Self::LastChangeCommandsSize => "last_change_commands_size",
        }
    }

    /// What the restored application loses when this key is missing.
    #[must_use]
    pub fn missing_consequence(self) -> &'static str {
        match self {
            Self::SelectedSheet => "selected sheet will not be restored",
            _ => "no cloud sync set up",
        }
    }
}

impl Display for OptionalKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One `DBCommand.data` value, carried as an already-encoded JSON value.
///
/// Serializing a `RawCommand` writes the stored text as-is instead of quoting it
/// as a string literal, which is what the importing application expects.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RawCommand(Box<RawValue>);

impl RawCommand {
    /// Wrap a stored command fragment.
    ///
    /// # Errors
    /// Returns an error when `data` is not a single JSON value. Surrounding
    /// whitespace is dropped; everything inside the value is kept byte-for-byte.
    pub fn parse(data: String) -> Result<Self, serde_json::Error> {
        RawValue::from_string(data).map(Self)
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        self.0.get()
    }
}

impl PartialEq for RawCommand {
    fn eq(&self, other: &Self) -> bool {
        self.as_str() == other.as_str()
    }
}

impl Eq for RawCommand {}

impl Display for RawCommand {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything the Source Reader extracted from one database file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceSnapshot {
    pub schema: i64,
    pub local_version: i64,
    pub a_token: KeyLookup<String>,
    pub e_key_b64: KeyLookup<String>,
    pub cypher: KeyLookup<String>,
    pub selected_sheet: KeyLookup<String>,
    pub last_change_id: KeyLookup<i64>,
    pub last_change_commands_size: KeyLookup<i64>,
    pub commands: Vec<RawCommand>,
}

impl SourceSnapshot {
    /// Optional keys that were absent or unreadable, in output field order.
    #[must_use]
    pub fn misses(&self) -> Vec<(OptionalKey, &LookupMiss)> {
        OptionalKey::ALL
            .into_iter()
            .filter_map(|key| self.miss_for(key).map(|miss| (key, miss)))
            .collect()
    }

    fn miss_for(&self, key: OptionalKey) -> Option<&LookupMiss> {
        match key {
            OptionalKey::AToken => self.a_token.as_ref().err(),
            OptionalKey::EKeyB64 => self.e_key_b64.as_ref().err(),
            OptionalKey::Cypher => self.cypher.as_ref().err(),
            OptionalKey::SelectedSheet => self.selected_sheet.as_ref().err(),
            OptionalKey::LastChangeId => self.last_change_id.as_ref().err(),
            OptionalKey::LastChangeCommandsSize => self.last_change_commands_size.as_ref().err(),
        }
    }
}

/// The `.sb2backup` document. Field order is the on-disk order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BackupDocument {
    pub db_version: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub a_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub e_key_b64: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cypher: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub selected_sheet: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_change_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_change_commands_size: Option<i64>,
    pub app_version_info: String,
    pub commands: Vec<RawCommand>,
}

impl BackupDocument {
    /// Map an extracted snapshot onto the backup shape.
    ///
    /// Missed lookups are omitted. Zero counters are omitted as well since the
    /// importer cannot tell them apart from an absent key.
    #[must_use]
    pub fn assemble(snapshot: SourceSnapshot) -> Self {
        Self {
            db_version: BACKUP_DB_VERSION,
            a_token: snapshot.a_token.ok(),
            e_key_b64: snapshot.e_key_b64.ok(),
            cypher: snapshot.cypher.ok(),
            selected_sheet: snapshot.selected_sheet.ok(),
            last_change_id: nonzero_counter(snapshot.last_change_id),
            last_change_commands_size: nonzero_counter(snapshot.last_change_commands_size),
            app_version_info: String::new(),
            commands: snapshot.commands,
        }
    }

    #[must_use]
    pub fn last_command(&self) -> Option<&RawCommand> {
        self.commands.last()
    }
}

fn nonzero_counter(lookup: KeyLookup<i64>) -> Option<i64> {
    lookup.ok().filter(|value| *value != 0)
}

/// Render a backup document as newline-terminated JSON.
///
/// # Errors
/// Returns [`ConvertError::Encode`] when the JSON writer fails.
pub fn encode_backup(document: &BackupDocument) -> Result<Vec<u8>, ConvertError> {
    let mut bytes = Vec::new();
    serde_json::to_writer(&mut bytes, document)
        .map_err(|err| ConvertError::Encode(err.to_string()))?;
    bytes.push(b'\n');
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use anyhow::Result;
    use proptest::prelude::*;

    use super::*;

    fn absent<T>(key: OptionalKey) -> KeyLookup<T> {
        Err(LookupMiss::Absent(key.as_str().to_string()))
    }

    fn bare_snapshot(commands: Vec<RawCommand>) -> SourceSnapshot {
        SourceSnapshot {
            schema: SUPPORTED_SCHEMA,
            local_version: 1,
            a_token: absent(OptionalKey::AToken),
            e_key_b64: absent(OptionalKey::EKeyB64),
            cypher: absent(OptionalKey::Cypher),
            selected_sheet: absent(OptionalKey::SelectedSheet),
            last_change_id: absent(OptionalKey::LastChangeId),
            last_change_commands_size: absent(OptionalKey::LastChangeCommandsSize),
            commands,
        }
    }

    fn encode_to_string(document: &BackupDocument) -> Result<String> {
        Ok(String::from_utf8(encode_backup(document)?)?)
    }

    #[test]
    fn bare_snapshot_encodes_to_minimal_document() -> Result<()> {
        let document = BackupDocument::assemble(bare_snapshot(Vec::new()));
        assert_eq!(
            encode_to_string(&document)?,
            "{\"db_version\":20,\"app_version_info\":\"\",\"commands\":[]}\n"
        );
        Ok(())
    }

    #[test]
    fn db_version_ignores_source_versions() {
        let mut snapshot = bare_snapshot(Vec::new());
        snapshot.local_version = 77;
        let document = BackupDocument::assemble(snapshot);
        assert_eq!(document.db_version, BACKUP_DB_VERSION);
    }

    #[test]
    fn commands_are_embedded_as_json_values() -> Result<()> {
        let command = RawCommand::parse(r#"{"type":"add","amount":5}"#.to_string())?;
        let document = BackupDocument::assemble(bare_snapshot(vec![command]));
        let encoded = encode_to_string(&document)?;

        assert!(encoded.contains(r#""commands":[{"type":"add","amount":5}]"#));
        assert!(!encoded.contains(r#"\"type\""#));

        let value: serde_json::Value = serde_json::from_str(&encoded)?;
        assert_eq!(value["commands"][0]["amount"], serde_json::json!(5));
        Ok(())
    }

    #[test]
    fn present_fields_follow_declared_order() -> Result<()> {
        let snapshot = SourceSnapshot {
            a_token: Ok("tok".to_string()),
            e_key_b64: Ok("a2V5".to_string()),
            cypher: Ok("aes".to_string()),
            selected_sheet: Ok("Home".to_string()),
            last_change_id: Ok(12),
            last_change_commands_size: Ok(3),
            ..bare_snapshot(vec![RawCommand::parse("[1,2]".to_string())?])
        };
        let encoded = encode_to_string(&BackupDocument::assemble(snapshot))?;
        assert_eq!(
            encoded,
            concat!(
                r#"{"db_version":20,"a_token":"tok","e_key_b64":"a2V5","cypher":"aes","#,
                r#""selected_sheet":"Home","last_change_id":12,"last_change_commands_size":3,"#,
                r#""app_version_info":"","commands":[[1,2]]}"#,
                "\n"
            )
        );
        Ok(())
    }

    #[test]
    fn zero_counters_and_misses_are_omitted_but_empty_strings_are_kept() -> Result<()> {
        let snapshot = SourceSnapshot {
            selected_sheet: Ok(String::new()),
            last_change_id: Ok(0),
            last_change_commands_size: Err(LookupMiss::Unreadable {
                key: "last_change_commands_size".to_string(),
                reason: "not an integer".to_string(),
            }),
            ..bare_snapshot(Vec::new())
        };
        let value: serde_json::Value =
            serde_json::from_slice(&encode_backup(&BackupDocument::assemble(snapshot))?)?;
        let object = value.as_object().ok_or_else(|| anyhow::anyhow!("not an object: {value}"))?;

        assert_eq!(object.get("selected_sheet"), Some(&serde_json::json!("")));
        assert!(!object.contains_key("last_change_id"));
        assert!(!object.contains_key("last_change_commands_size"));
        assert!(!object.contains_key("a_token"));
        assert!(object.values().all(|field| !field.is_null()));
        Ok(())
    }

    #[test]
    fn misses_report_every_absent_key_in_field_order() {
        let snapshot =
            SourceSnapshot { cypher: Ok("aes".to_string()), ..bare_snapshot(Vec::new()) };
        let keys = snapshot.misses().into_iter().map(|(key, _)| key).collect::<Vec<_>>();
        assert_eq!(
            keys,
            vec![
                OptionalKey::AToken,
                OptionalKey::EKeyB64,
                OptionalKey::SelectedSheet,
                OptionalKey::LastChangeId,
                OptionalKey::LastChangeCommandsSize,
            ]
        );
    }

    #[test]
    fn raw_command_rejects_non_json() {
        assert!(RawCommand::parse("{not json".to_string()).is_err());
        assert!(RawCommand::parse(String::new()).is_err());
    }

    #[test]
    fn decoded_document_reproduces_source_text() -> Result<()> {
        let source = r#"{"type":"edit", "note":"a \"quoted\" word","ids":[1, 2]}"#;
        let document =
            BackupDocument::assemble(bare_snapshot(vec![RawCommand::parse(source.to_string())?]));
        let decoded: BackupDocument = serde_json::from_slice(&encode_backup(&document)?)?;

        assert_eq!(decoded.commands.len(), 1);
        assert_eq!(decoded.commands[0].as_str(), source);
        assert_eq!(decoded, document);
        Ok(())
    }

    proptest! {
        #[test]
        fn property_encoded_commands_keep_source_order(values in prop::collection::vec(any::<i32>(), 0..40)) {
            let commands = values
                .iter()
                .map(|value| RawCommand::parse(format!("{{\"seq\":{value}}}")))
                .collect::<Result<Vec<_>, _>>()
                .map_err(|err| TestCaseError::fail(err.to_string()))?;
            let document = BackupDocument::assemble(bare_snapshot(commands));
            let bytes = encode_backup(&document).map_err(|err| TestCaseError::fail(err.to_string()))?;
            let decoded: serde_json::Value = serde_json::from_slice(&bytes)
                .map_err(|err| TestCaseError::fail(err.to_string()))?;

            let seqs = decoded["commands"]
                .as_array()
                .map(|items| items.iter().filter_map(|item| item["seq"].as_i64()).collect::<Vec<_>>())
                .unwrap_or_default();
            prop_assert_eq!(seqs, values.iter().map(|value| i64::from(*value)).collect::<Vec<_>>());
            prop_assert_eq!(document.last_command().is_some(), !values.is_empty());
        }
    }
}
