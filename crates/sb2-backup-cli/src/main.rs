use std::ffi::OsString;
use std::io::IsTerminal;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use sb2_backup_api::{convert_file, default_output_path, write_backup_file, ConvertConfig};
use sb2_backup_service::{serve, ServiceConfig, MAX_UPLOAD_BYTES};
use sb2_backup_store_sqlite::sqlite_version;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "db32sb2backup")]
#[command(about = "Convert a Smart Budget 2 internal database into an .sb2backup file")]
struct Cli {
    /// Input database file to process.
    #[arg(short = 'i', long = "input")]
    input: Option<PathBuf>,
    /// Output file to write, defaults to `<input>.sb2backup`.
    #[arg(short = 'o', long = "output")]
    output: Option<PathBuf>,
    /// Run the web converter on this port instead of converting a file; 0 keeps CLI mode.
    #[arg(long)]
    port: Option<u16>,
    #[arg(long, default_value = "0.0.0.0")]
    host: IpAddr,
    #[arg(long, default_value = "tmp")]
    upload_dir: PathBuf,
    #[arg(long, default_value = "log.txt")]
    log_file: PathBuf,
    /// Do not report settings missing from the database.
    #[arg(short = 'q', long, default_value_t = false)]
    quiet: bool,
}

fn main() -> ExitCode {
    let cli = Cli::parse_from(normalize_legacy_flags(std::env::args_os()));
    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("Error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: &Cli) -> Result<()> {
    match cli.port.filter(|port| *port != 0) {
        Some(port) => run_server(cli, port),
        None => run_convert(cli),
    }
}

fn run_convert(cli: &Cli) -> Result<()> {
    init_console_logging();
    tracing::debug!(sqlite_version = sqlite_version(), "sqlite library loaded");

    let input = cli.input.as_deref().ok_or_else(|| anyhow!("-i flag is mandatory"))?;
    let output = cli.output.clone().unwrap_or_else(|| default_output_path(input));
    println!("Converting {} -> {}", input.display(), output.display());

    let conversion = convert_file(input, &ConvertConfig { verbose: !cli.quiet })?;
    write_backup_file(&conversion, &output)?;

    println!("Successfully exported {} commands", conversion.command_count());
    if let Some(last) = conversion.last_command() {
        println!("Last command is {last}");
    }
    Ok(())
}

fn run_server(cli: &Cli, port: u16) -> Result<()> {
    let _log_guard = init_server_logging(&cli.log_file)?;
    tracing::info!(sqlite_version = sqlite_version(), "sqlite library loaded");

    let config = ServiceConfig {
        bind: SocketAddr::new(cli.host, port),
        upload_dir: cli.upload_dir.clone(),
        max_upload_bytes: MAX_UPLOAD_BYTES,
    };
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start async runtime")?;
    runtime.block_on(serve(config))
}

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

fn init_console_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(env_filter())
        .with_writer(std::io::stderr)
        .with_ansi(std::io::stderr().is_terminal())
        .init();
}

/// Log to stdout and append to `log_file`; the guard flushes the file writer on drop.
fn init_server_logging(log_file: &Path) -> Result<WorkerGuard> {
    let directory = match log_file.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let file_name = log_file
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| anyhow!("log file path has no file name: {}", log_file.display()))?;
    let appender = RollingFileAppender::builder()
        .rotation(Rotation::NEVER)
        .filename_prefix(file_name)
        .build(directory)
        .with_context(|| format!("Error opening log file {}", log_file.display()))?;
    let (file_writer, guard) = tracing_appender::non_blocking(appender);

    tracing_subscriber::registry()
        .with(env_filter())
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::fmt::layer().with_ansi(false).with_writer(file_writer))
        .init();
    Ok(guard)
}

/// Accept the single-dash `-port` spelling used by earlier releases.
fn normalize_legacy_flags<I>(args: I) -> Vec<OsString>
where
    I: IntoIterator<Item = OsString>,
{
    args.into_iter()
        .map(|arg| match arg.to_str() {
            Some("-port") => OsString::from("--port"),
            Some(flag) if flag.starts_with("-port=") => OsString::from(format!("-{flag}")),
            _ => arg,
        })
        .collect()
}
