//! editorlink - drive a running editor host from the command line.
//!
//! Results are printed as JSON on stdout; logs go to stderr.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use tracing::{debug, error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use editorlink::message::into_params;
use editorlink::{
    BatchCall, BatchOptions, BatchProgress, BatchResult, EditorClient, LinkConfig, Notification,
    SidecarClient,
};

/// editorlink - remote-control a running editor host
#[derive(Debug, Parser)]
#[command(name = "editorlink")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Editor host
    #[arg(long, global = true, env = "EDITORLINK_HOST")]
    host: Option<String>,

    /// Editor command port
    #[arg(long, global = true, env = "EDITORLINK_PORT")]
    port: Option<u16>,

    /// Per-call timeout in milliseconds
    #[arg(long, global = true, env = "EDITORLINK_TIMEOUT_MS")]
    timeout_ms: Option<u64>,

    /// Batch timeout in milliseconds
    #[arg(long, global = true, env = "EDITORLINK_BATCH_TIMEOUT_MS")]
    batch_timeout_ms: Option<u64>,

    /// Path to the sidecar executable
    #[arg(long, global = true, env = "EDITORLINK_SIDECAR")]
    sidecar: Option<PathBuf>,

    /// Go through the sidecar instead of the editor socket
    #[arg(long, global = true)]
    via_sidecar: bool,

    /// Enable debug output
    #[arg(long, short = 'v', global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Check that the editor answers
    Ping,
    /// Probe the editor socket without sending a command
    Status,
    /// Send one editor command
    Send {
        /// Command type, e.g. get_actors_in_level
        command: String,
        /// Command parameters as a JSON object
        #[arg(long, default_value = "{}")]
        params: String,
    },
    /// List the sidecar's tools
    Tools,
    /// Run a batch of calls from a JSON file
    Batch {
        /// File holding `[{"name", "arguments"}]` or `{"calls": [...]}`
        file: PathBuf,
        /// Keep going after a failed call
        #[arg(long)]
        continue_on_error: bool,
        /// Ask the sidecar for per-call progress notifications
        #[arg(long)]
        notify: bool,
        /// Send the batch straight to the editor socket
        #[arg(long)]
        direct: bool,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.debug);

    match run(cli).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(debug: bool) {
    let default = if debug {
        "editorlink=debug"
    } else {
        "editorlink=info"
    };
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| default.into()),
        ))
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();
}

fn load_config(cli: &Cli) -> Result<LinkConfig> {
    let mut config = LinkConfig::from_env().context("Invalid environment configuration")?;
    if let Some(host) = &cli.host {
        config.host = host.clone();
    }
    if let Some(port) = cli.port {
        config.port = port;
    }
    if let Some(ms) = cli.timeout_ms {
        config.timeout = Duration::from_millis(ms);
    }
    if let Some(ms) = cli.batch_timeout_ms {
        config.batch_timeout = Duration::from_millis(ms);
    }
    if let Some(path) = &cli.sidecar {
        config.sidecar_path = path.clone();
    }
    config.validate().context("Invalid configuration")?;
    Ok(config)
}

/// Returns whether the command succeeded.
async fn run(cli: Cli) -> Result<bool> {
    let config = load_config(&cli)?;
    debug!("Using {:?}", config);

    match cli.command {
        Command::Ping if cli.via_sidecar => {
            let sidecar = start_sidecar(&config).await?;
            let outcome = sidecar.ping().await;
            finish_sidecar(sidecar).await;
            report_ping(outcome.context("Ping through sidecar failed")?)
        }
        Command::Ping => {
            let alive = EditorClient::from_config(&config)
                .ping()
                .await
                .context("Ping failed")?;
            report_ping(alive)
        }
        Command::Status => {
            let status = EditorClient::from_config(&config).check_connection().await;
            print_json(&serde_json::to_value(&status)?)?;
            Ok(status.error.is_none())
        }
        Command::Send { command, params } => {
            let params: Value =
                serde_json::from_str(&params).context("--params is not valid JSON")?;
            let params = into_params(params)?;

            let result = if cli.via_sidecar {
                let sidecar = start_sidecar(&config).await?;
                let outcome = sidecar.send_command(&command, params).await;
                finish_sidecar(sidecar).await;
                outcome
            } else {
                EditorClient::from_config(&config)
                    .call(&command, params, config.timeout)
                    .await
            };
            let result = result.with_context(|| format!("Command {} failed", command))?;
            print_json(&result)?;
            Ok(true)
        }
        Command::Tools => {
            let sidecar = start_sidecar(&config).await?;
            let outcome = sidecar.list_tools().await;
            finish_sidecar(sidecar).await;
            let tools = outcome.context("tools/list failed")?;
            print_json(&serde_json::to_value(&tools)?)?;
            Ok(true)
        }
        Command::Batch {
            file,
            continue_on_error,
            notify,
            direct,
        } => {
            let calls = read_calls(&file)?;
            if calls.is_empty() {
                bail!("{} holds no calls", file.display());
            }
            let stop_on_error = !continue_on_error;

            let result = if direct {
                EditorClient::from_config(&config)
                    .batch(&calls, stop_on_error)
                    .await
            } else {
                let sidecar = start_sidecar(&config).await?;
                let options = BatchOptions {
                    stop_on_error,
                    notify,
                    ..BatchOptions::default()
                };
                let outcome = sidecar.batch(&calls, options, log_progress).await;
                finish_sidecar(sidecar).await;
                outcome
            };
            let result = result.context("Batch failed")?;

            print_json(&batch_json(&result))?;
            Ok(result.is_success())
        }
    }
}

async fn start_sidecar(config: &LinkConfig) -> Result<SidecarClient> {
    let mut sidecar = SidecarClient::spawn(&config.sidecar_spec(), config)
        .await
        .context("Failed to start the sidecar")?;
    if let Err(e) = sidecar.initialize().await {
        finish_sidecar(sidecar).await;
        return Err(e).context("Sidecar handshake failed");
    }
    Ok(sidecar)
}

async fn finish_sidecar(sidecar: SidecarClient) {
    let stderr = sidecar.close().await;
    if !stderr.trim().is_empty() {
        debug!("Sidecar stderr:\n{}", stderr.trim_end());
    }
}

fn report_ping(alive: bool) -> Result<bool> {
    print_json(&json!({ "alive": alive }))?;
    Ok(alive)
}

fn read_calls(path: &Path) -> Result<Vec<BatchCall>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let value: Value = serde_json::from_str(&text)
        .with_context(|| format!("{} is not valid JSON", path.display()))?;
    let calls = match value {
        Value::Object(mut obj) => obj.remove("calls").unwrap_or(Value::Null),
        other => other,
    };
    serde_json::from_value(calls)
        .with_context(|| format!("{} does not hold a list of calls", path.display()))
}

fn log_progress(notification: &Notification) {
    match BatchProgress::from_notification(notification) {
        Some(progress) if progress.is_error() => warn!(
            "[{}/{}] {}: {}",
            progress.current, progress.total, progress.step, progress.message
        ),
        Some(progress) => info!(
            "[{}/{}] {}% {}",
            progress.current, progress.total, progress.percent, progress.step
        ),
        None => info!(
            "{}",
            notification
                .params
                .get("message")
                .and_then(serde_json::Value::as_str)
                .unwrap_or(notification.method.as_str())
        ),
    }
}

fn batch_json(result: &BatchResult) -> Value {
    let entries: Vec<Value> = result
        .entries
        .iter()
        .map(|entry| match &entry.outcome {
            Ok(value) => json!({
                "index": entry.index,
                "name": entry.name,
                "ok": true,
                "result": value,
            }),
            Err(failure) => json!({
                "index": entry.index,
                "name": entry.name,
                "ok": false,
                "error": failure,
            }),
        })
        .collect();
    json!({ "summary": result.summary, "entries": entries })
}

fn print_json(value: &Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
