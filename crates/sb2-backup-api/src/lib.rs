use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use sb2_backup_core::{encode_backup, BackupDocument, ConvertError, RawCommand};
use sb2_backup_store_sqlite::SourceDatabase;

pub use sb2_backup_core::BACKUP_FILE_EXTENSION;

#[cfg(unix)]
const BACKUP_FILE_MODE: u32 = 0o644;

/// Per-invocation settings for the conversion pipeline.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConvertConfig {
    /// Log every optional key that could not be read.
    pub verbose: bool,
}

/// A finished conversion: the assembled document and its encoded bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conversion {
    pub document: BackupDocument,
    pub bytes: Vec<u8>,
}

impl Conversion {
    #[must_use]
    pub fn command_count(&self) -> usize {
        self.document.commands.len()
    }

    #[must_use]
    pub fn last_command(&self) -> Option<&RawCommand> {
        self.document.last_command()
    }
}

/// Run the Source Reader, Backup Assembler and Serializer over one file.
///
/// # Errors
/// Returns the first fatal [`ConvertError`]; nothing is produced on failure.
pub fn convert_file(input: &Path, config: &ConvertConfig) -> Result<Conversion, ConvertError> {
    let snapshot = {
        let database = SourceDatabase::open(input)?;
        database.read_snapshot()?
    };

    if config.verbose {
        for (key, miss) in snapshot.misses() {
            tracing::info!(
                key = key.as_str(),
                reason = %miss,
                "DBKeyValue contains no {key} - {}",
                key.missing_consequence()
            );
        }
    }

    let document = BackupDocument::assemble(snapshot);
    let bytes = encode_backup(&document)?;
    Ok(Conversion { document, bytes })
}

/// `<input>.sb2backup`, next to the input file.
#[must_use]
pub fn default_output_path(input: &Path) -> PathBuf {
    let mut name = input.as_os_str().to_os_string();
    name.push(".");
    name.push(BACKUP_FILE_EXTENSION);
    PathBuf::from(name)
}

/// Write the encoded backup, replacing `output` only once every byte is on disk.
///
/// # Errors
/// Returns an error when the temporary file cannot be written or moved into place.
pub fn write_backup_file(conversion: &Conversion, output: &Path) -> Result<()> {
    let parent = match output.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let mut staged = tempfile::Builder::new()
        .prefix(".sb2backup-")
        .tempfile_in(parent)
        .with_context(|| format!("failed to create staging file in {}", parent.display()))?;
    staged
        .write_all(&conversion.bytes)
        .and_then(|()| staged.as_file().sync_all())
        .with_context(|| format!("failed to write staging file {}", staged.path().display()))?;
    publish_permissions(staged.as_file())
        .with_context(|| format!("failed to set permissions on {}", staged.path().display()))?;
    staged
        .persist(output)
        .map_err(|err| err.error)
        .with_context(|| format!("Error saving file {}", output.display()))?;
    Ok(())
}

/// Staging files are created owner-only; the finished backup is world-readable.
#[cfg(unix)]
fn publish_permissions(file: &std::fs::File) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    file.set_permissions(std::fs::Permissions::from_mode(BACKUP_FILE_MODE))
}

#[cfg(not(unix))]
#[allow(clippy::unnecessary_wraps)]
fn publish_permissions(_file: &std::fs::File) -> std::io::Result<()> {
    Ok(())
}
