//! Warden CLI entry point.
//!
//! Provides `selfcheck`, `scan`, and `serve` subcommands for exercising a
//! kernel once, reporting on a module directory, or serving bridge
//! commands as JSON lines over stdio.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{debug, info};

use warden::bridge::transport::INVALID_ENVELOPE;
use warden::bridge::{
    CommandMeta, KernelRequestEnvelope, KernelResponseEnvelope, KernelTransport,
    TransportResponse,
};
use warden::config::{load_config, load_default_config, KernelConfig};
use warden::host::HostAdapter;
use warden::kernel::loader::RegistrationRequest;
use warden::kernel::clock::Clock;
use warden::kernel::Kernel;
use warden::logging;
use warden::modules::{builtin_catalog, ticker_manifest, TickerModule, TICKER_ID};

/// Warden: in-process plugin kernel.
#[derive(Parser)]
#[command(name = "warden", version, about)]
struct Cli {
    /// Subcommand to execute.
    #[command(subcommand)]
    command: Command,
}

/// Available CLI subcommands.
#[derive(Subcommand)]
enum Command {
    /// Boot a kernel, run the ticker module through its lifecycle and print
    /// the snapshot.
    Selfcheck {
        /// Config file (default: ~/.warden/config.toml).
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Scan a directory for module manifests and print the report.
    Scan {
        /// Directory holding `<module>/manifest.json` entries (default:
        /// `host.modules_dir` from the config).
        dir: Option<PathBuf>,
        /// Config file (default: ~/.warden/config.toml).
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Serve bridge commands as JSON lines on stdin/stdout.
    Serve {
        /// Config file (default: ~/.warden/config.toml).
        #[arg(long)]
        config: Option<PathBuf>,
        /// Also write JSON logs to this directory.
        #[arg(long)]
        log_dir: Option<PathBuf>,
    },
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Selfcheck { config } => {
            logging::init_cli();
            handle_selfcheck(resolve_config(config.as_deref())?).await
        }
        Command::Scan { dir, config } => {
            logging::init_cli();
            let config = resolve_config(config.as_deref())?;
            let dir = dir
                .or_else(|| config.host.modules_dir.clone())
                .context("no directory given and host.modules_dir is not configured")?;
            handle_scan(config, &dir).await
        }
        Command::Serve { config, log_dir } => {
            let _logging_guard = match log_dir {
                Some(dir) => Some(logging::init_production(&dir)?),
                None => {
                    logging::init_cli();
                    None
                }
            };
            handle_serve(resolve_config(config.as_deref())?).await
        }
    }
}

fn resolve_config(path: Option<&Path>) -> anyhow::Result<KernelConfig> {
    match path {
        Some(path) => load_config(path),
        None => load_default_config().context("failed to load default config"),
    }
}

fn build_kernel(config: KernelConfig, host: HostAdapter) -> anyhow::Result<Kernel> {
    Kernel::builder(config)
        .host(host)
        .catalog(Rc::new(builtin_catalog()))
        .build()
        .context("failed to wire kernel")
}

/// Run the ticker through register, start, tick and stop, then print the
/// snapshot.
async fn handle_selfcheck(config: KernelConfig) -> anyhow::Result<()> {
    let max_keys = config.host.store_max_keys;
    let kernel = build_kernel(config, HostAdapter::memory(max_keys))?;

    kernel
        .loader()
        .register(RegistrationRequest::declared(ticker_manifest(), TickerModule::new()))?;
    kernel.loader().start(TICKER_ID)?;
    kernel.bus().emit("kernel.tick", json!({ "ok": true }), "kernel")?;
    kernel.drive().await;
    kernel.loader().stop(TICKER_ID, "selfcheck", None)?;
    kernel.drive().await;

    let stopped = kernel
        .bus()
        .history()
        .into_iter()
        .any(|record| record.name == "ticker.stopped" && record.source == TICKER_ID);
    anyhow::ensure!(stopped, "ticker did not report its stop");

    let response = kernel
        .transport()
        .request("kernel.snapshot.get", Value::Null, &CommandMeta::kernel())
        .await;
    print_response(&response)?;
    info!("selfcheck passed");
    Ok(())
}

/// Scan `dir` through the transport with the local filesystem host.
async fn handle_scan(config: KernelConfig, dir: &Path) -> anyhow::Result<()> {
    let max_keys = config.host.store_max_keys;
    let kernel = build_kernel(config, HostAdapter::local(max_keys))?;
    let base_dir = dir.to_string_lossy().into_owned();

    let response = kernel
        .transport()
        .request(
            "host.modules.scan",
            json!({ "baseDir": base_dir }),
            &CommandMeta::kernel(),
        )
        .await;
    print_response(&response)
}

fn print_response(response: &TransportResponse) -> anyhow::Result<()> {
    if let Some(error) = &response.error {
        anyhow::bail!("{}: {}", error.code, error.message);
    }
    let result = response.result.clone().unwrap_or(Value::Null);
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

/// Answer one envelope per stdin line until stdin closes, running deferred
/// kernel work between requests.
async fn handle_serve(config: KernelConfig) -> anyhow::Result<()> {
    let host = HostAdapter::local(config.host.store_max_keys);
    let kernel = build_kernel(config, host)?;
    info!("serving kernel commands on stdio");
    kernel.run_until(serve_loop(&kernel)).await
}

async fn serve_loop(kernel: &Kernel) -> anyhow::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();
    let clock = kernel.bus().clock();

    loop {
        kernel.run_pending();
        let wait = kernel
            .scheduler()
            .next_deadline()
            .map(|due| due.saturating_sub(clock.now_ms()));
        let deadline = async {
            match wait {
                Some(ms) => tokio::time::sleep(Duration::from_millis(ms)).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line.context("failed to read stdin")? else {
                    break;
                };
                if line.trim().is_empty() {
                    continue;
                }
                let response = answer(kernel, &line).await;
                let mut encoded = serde_json::to_string(&response)?;
                encoded.push('\n');
                stdout.write_all(encoded.as_bytes()).await?;
                stdout.flush().await?;
            }
            () = deadline => {
                debug!("scheduler deadline reached");
            }
        }
    }

    info!("stdin closed, shutting down");
    Ok(())
}

async fn answer(kernel: &Kernel, line: &str) -> KernelResponseEnvelope {
    let raw: Value = match serde_json::from_str(line) {
        Ok(raw) => raw,
        Err(e) => {
            return KernelResponseEnvelope::new(
                "",
                TransportResponse::failure(INVALID_ENVELOPE, format!("request is not JSON: {e}")),
            )
        }
    };
    let id = raw
        .get("id")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_owned();
    match serde_json::from_value::<KernelRequestEnvelope>(raw) {
        Ok(envelope) => kernel.transport().request_envelope(envelope).await,
        Err(e) => KernelResponseEnvelope::new(
            id,
            TransportResponse::failure(INVALID_ENVELOPE, format!("malformed envelope: {e}")),
        ),
    }
}
