use std::io::Write;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::multipart::{MultipartError, MultipartRejection};
use axum::extract::{DefaultBodyLimit, Multipart, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use sb2_backup_api::{convert_file, Conversion, ConvertConfig, BACKUP_FILE_EXTENSION};
use sb2_backup_core::ConvertError;

pub const UPLOAD_FIELD: &str = "db3File";
pub const MAX_UPLOAD_BYTES: usize = 50 << 20;

const INDEX_HTML: &str = include_str!("index.html");
const UPLOAD_PREFIX: &str = "upload-";
const UPLOAD_SUFFIX: &str = ".db3";

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub bind: SocketAddr,
    /// Private directory for in-flight uploads; each file lives only for its request.
    pub upload_dir: PathBuf,
    pub max_upload_bytes: usize,
}

#[derive(Debug, Clone)]
struct ServiceState {
    upload_dir: Arc<PathBuf>,
    convert: ConvertConfig,
}

#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error("Not a multipart form, {0}")]
    MultipartParse(String),
    #[error("Error Retrieving the File, {0}")]
    FileRetrieval(String),
    #[error("File is too large, {0}")]
    TooLarge(String),
    #[error("Cannot create tmp file, {0}")]
    TempFile(String),
    #[error("Error saving tmp file, {0}")]
    Copy(String),
    #[error("Error converting file {0}")]
    Convert(#[from] ConvertError),
    #[error("Conversion worker failed, {0}")]
    Worker(String),
}

impl UploadError {
    fn status(&self) -> StatusCode {
        match self {
            Self::MultipartParse(_) | Self::FileRetrieval(_) => StatusCode::BAD_REQUEST,
            Self::TooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            Self::Convert(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Self::TempFile(_) | Self::Copy(_) | Self::Worker(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for UploadError {
    fn into_response(self) -> Response {
        tracing::warn!(error = %self, "upload failed");
        (
            self.status(),
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            self.to_string(),
        )
            .into_response()
    }
}

struct UploadedFile {
    file_name: String,
    bytes: axum::body::Bytes,
}

pub fn app(config: &ServiceConfig) -> Router {
    let state = ServiceState {
        upload_dir: Arc::new(config.upload_dir.clone()),
        convert: ConvertConfig { verbose: false },
    };
    Router::new()
        .route("/", get(index))
        .route("/index.html", get(index))
        .route(
            "/upload.html",
            post(upload).layer(DefaultBodyLimit::max(config.max_upload_bytes)),
        )
        .with_state(state)
}

/// Bind and serve until the listener fails.
///
/// # Errors
/// Returns an error when the upload directory is unusable or the address cannot be bound.
pub async fn serve(config: ServiceConfig) -> Result<()> {
    ensure_upload_dir(&config.upload_dir)?;
    let listener = tokio::net::TcpListener::bind(config.bind)
        .await
        .with_context(|| format!("Cannot listen on {}", config.bind))?;
    tracing::info!(bind = %config.bind, upload_dir = %config.upload_dir.display(), "Start");
    axum::serve(listener, app(&config)).await.context("server stopped")?;
    Ok(())
}

/// Fail fast when uploads could not be staged, instead of on the first request.
///
/// # Errors
/// Returns an error when no temporary file can be created in `upload_dir`.
pub fn ensure_upload_dir(upload_dir: &Path) -> Result<()> {
    let scratch = staging_file(upload_dir).with_context(|| {
        format!(
            "Cannot create tmp file, folder '{}' should exist and be writable",
            upload_dir.display()
        )
    })?;
    scratch.close().context("failed to remove upload directory scratch file")?;
    Ok(())
}

async fn index() -> Html<&'static str> {
    Html(INDEX_HTML)
}

async fn upload(
    State(state): State<ServiceState>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Response, UploadError> {
    let multipart = multipart.map_err(|err| UploadError::MultipartParse(err.to_string()))?;
    let uploaded = read_upload_field(multipart).await?;
    tracing::info!(file_name = %uploaded.file_name, size = uploaded.bytes.len(), "Uploaded file");

    let upload_dir = Arc::clone(&state.upload_dir);
    let convert = state.convert;
    let bytes = uploaded.bytes;
    let conversion =
        tokio::task::spawn_blocking(move || convert_upload(&upload_dir, &bytes, &convert))
            .await
            .map_err(|err| UploadError::Worker(err.to_string()))??;

    tracing::info!(
        file_name = %uploaded.file_name,
        size = conversion.bytes.len(),
        commands = conversion.command_count(),
        has_cypher = conversion.document.cypher.is_some(),
        "Converted file"
    );

    Ok((
        [
            (header::CONTENT_TYPE, HeaderValue::from_static("application/octet-stream")),
            (header::CONTENT_DISPOSITION, attachment_disposition(&uploaded.file_name)),
        ],
        conversion.bytes,
    )
        .into_response())
}

async fn read_upload_field(mut multipart: Multipart) -> Result<UploadedFile, UploadError> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|err| body_error(&err, UploadError::MultipartParse))?
    {
        if field.name() != Some(UPLOAD_FIELD) {
            continue;
        }
        let file_name = field.file_name().unwrap_or(UPLOAD_FIELD).to_string();
        let bytes = field.bytes().await.map_err(|err| body_error(&err, UploadError::FileRetrieval))?;
        return Ok(UploadedFile { file_name, bytes });
    }
    Err(UploadError::FileRetrieval(format!("no '{UPLOAD_FIELD}' field in form")))
}

fn body_error(err: &MultipartError, otherwise: fn(String) -> UploadError) -> UploadError {
    if err.status() == StatusCode::PAYLOAD_TOO_LARGE {
        UploadError::TooLarge(err.body_text())
    } else {
        otherwise(err.body_text())
    }
}

/// Stage the upload on disk for SQLite and convert it; the staged copy is removed
/// on every return path when the `NamedTempFile` drops.
fn convert_upload(
    upload_dir: &Path,
    bytes: &[u8],
    config: &ConvertConfig,
) -> Result<Conversion, UploadError> {
    let mut staged =
        staging_file(upload_dir).map_err(|err| UploadError::TempFile(err.to_string()))?;
    staged
        .write_all(bytes)
        .and_then(|()| staged.flush())
        .map_err(|err| UploadError::Copy(err.to_string()))?;

    let result = convert_file(staged.path(), config);
    remove_sqlite_sidecars(staged.path());
    if let Err(err) = staged.close() {
        tracing::warn!(error = %err, "failed to remove staged upload");
    }
    result.map_err(UploadError::from)
}

/// A WAL-mode upload can leave `-wal`/`-shm` files beside the staged copy.
fn remove_sqlite_sidecars(staged: &Path) {
    for suffix in ["-wal", "-shm", "-journal"] {
        let mut sidecar = staged.as_os_str().to_os_string();
        sidecar.push(suffix);
        match std::fs::remove_file(&sidecar) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => {
                tracing::warn!(error = %err, path = ?sidecar, "failed to remove sqlite sidecar");
            }
        }
    }
}

fn staging_file(upload_dir: &Path) -> std::io::Result<tempfile::NamedTempFile> {
    tempfile::Builder::new().prefix(UPLOAD_PREFIX).suffix(UPLOAD_SUFFIX).tempfile_in(upload_dir)
}

/// Quoted UTF-8 file name; only quotes and backslashes are escaped and control
/// characters, which a header cannot carry, become `_`.
fn attachment_disposition(file_name: &str) -> HeaderValue {
    let base = Path::new(file_name)
        .file_name()
        .and_then(|name| name.to_str())
        .filter(|name| !name.is_empty())
        .unwrap_or(UPLOAD_FIELD);
    let escaped = base
        .chars()
        .map(|ch| match ch {
            '"' | '\\' => format!("\\{ch}"),
            ch if ch.is_control() => "_".to_string(),
            ch => ch.to_string(),
        })
        .collect::<String>();
    let value = format!("attachment; filename=\"{escaped}.{BACKUP_FILE_EXTENSION}\"");
    HeaderValue::from_bytes(value.as_bytes())
        .unwrap_or_else(|_| HeaderValue::from_static("attachment; filename=\"upload.sb2backup\""))
}
