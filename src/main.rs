use std::fs::File;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::broadcast::error::RecvError;
use tracing::warn;

use shadow_scan::config::{EvaluatorKind, ScanConfig};
use shadow_scan::logging;
use shadow_scan::ports::PortPreset;
use shadow_scan::scheduler::ScanOutcome;
use shadow_scan::server::{self, AppState};
use shadow_scan::session::ScanEngine;
use shadow_scan::types::{ScanEvent, ScanRequest, ScanSession};

/// shadow-scan: batch-paced port scanner streaming findings and a scan log as it goes.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "shadow-scan",
    version,
    about = "Batch-paced port scanner streaming findings and a scan log as it goes.",
    long_about = None
)]
struct Cli {
    /// Host name or IP address to scan. Required unless --serve-ui is given.
    #[arg(long)]
    target: Option<String>,

    /// Ports as an inclusive range (1-1000) or a comma-separated list (22,80,443).
    #[arg(long, default_value = "1-1000")]
    ports: String,

    /// Named port selection; replaces --ports when given.
    #[arg(long, value_enum)]
    preset: Option<PortPreset>,

    /// TOML file with engine settings; flags below override it.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Ports per batch.
    #[arg(long = "batch-size")]
    batch_size: Option<usize>,

    /// Pause between batches in milliseconds.
    #[arg(long = "delay-ms")]
    delay_ms: Option<u64>,

    /// Max probes in flight within one batch.
    #[arg(long)]
    concurrency: Option<usize>,

    /// Port evaluator to use.
    #[arg(long, value_enum)]
    evaluator: Option<EvaluatorKind>,

    /// Seed for the simulated evaluator (repeatable scans).
    #[arg(long)]
    seed: Option<u64>,

    /// Socket connect timeout in milliseconds (connect evaluator).
    #[arg(long = "timeout-ms")]
    timeout_ms: Option<u64>,

    /// Write the final session as pretty JSON to this path (optional).
    #[arg(long)]
    output: Option<PathBuf>,

    /// Serve the scan API over HTTP instead of running a single scan.
    #[arg(long = "serve-ui", default_value_t = false)]
    serve_ui: bool,

    /// Address for the HTTP API.
    #[arg(long)]
    bind: Option<String>,

    /// Bearer token required by the HTTP API.
    #[arg(long = "api-token", env = "SHADOW_SCAN_API_TOKEN")]
    api_token: Option<String>,
}

impl Cli {
    fn port_range(&self) -> &str {
        match self.preset {
            Some(preset) => preset.port_range(),
            None => &self.ports,
        }
    }

    fn scan_config(&self) -> Result<ScanConfig> {
        let mut cfg = match &self.config {
            Some(path) => ScanConfig::load(path)?,
            None => ScanConfig::default(),
        };
        if let Some(v) = self.batch_size {
            cfg.batch_size = v;
        }
        if let Some(v) = self.delay_ms {
            cfg.inter_batch_delay_ms = v;
        }
        if let Some(v) = self.concurrency {
            cfg.concurrency = v;
        }
        if let Some(v) = self.evaluator {
            cfg.evaluator = v;
        }
        if self.seed.is_some() {
            cfg.seed = self.seed;
        }
        if let Some(v) = self.timeout_ms {
            cfg.timeout_ms = v;
        }
        if let Some(v) = &self.bind {
            cfg.server.bind = v.clone();
        }
        if self.api_token.is_some() {
            cfg.server.api_token = self.api_token.clone();
        }
        Ok(cfg)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init()?;
    let cfg = cli.scan_config()?;

    println!("shadow-scan configuration:");
    println!("  target       : {}", cli.target.as_deref().unwrap_or("<none>"));
    println!("  ports        : {}", cli.port_range());
    println!("  evaluator    : {:?}", cfg.evaluator);
    println!("  batch_size   : {}", cfg.batch_size);
    println!("  delay_ms     : {}", cfg.inter_batch_delay_ms);
    println!("  concurrency  : {}", cfg.concurrency);
    println!("  serve_ui     : {}", cli.serve_ui);

    let engine = cfg.build_engine();

    if cli.serve_ui {
        let state = AppState::new(engine, cfg.server.api_token.clone());
        println!("API listening on http://{} (Ctrl+C to stop)", cfg.server.bind);
        tokio::select! {
            res = server::spawn_server(&cfg.server.bind, state) => res?,
            _ = tokio::signal::ctrl_c() => println!("shutting down"),
        }
        return Ok(());
    }

    let target = cli
        .target
        .as_deref()
        .context("--target is required unless --serve-ui is given")?;
    let request = ScanRequest::new(target, cli.port_range())?;
    let outcome = run_scan(&engine, request).await?;

    let session = engine.snapshot().await;
    print_results_table(&session);
    if let ScanOutcome::Cancelled { processed } = outcome {
        println!("Scan cancelled after {} of {} ports.", processed, session.total);
    }
    if let Some(path) = cli.output.as_deref() {
        if let Err(e) = write_session_json(path, &session) {
            eprintln!("Failed to write JSON to {}: {}", path.display(), e);
        } else {
            println!("Wrote JSON results to {}", path.display());
        }
    }
    Ok(())
}

/// Run one scan, echoing log lines as they are published. Ctrl-C cancels.
async fn run_scan(engine: &ScanEngine, request: ScanRequest) -> Result<ScanOutcome> {
    let mut events = engine.subscribe();
    engine.start(request).await?;

    let cancel_engine = engine.clone();
    let ctrl_c = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = cancel_engine.cancel().await;
        }
    });

    let outcome = loop {
        match events.recv().await {
            Ok(ScanEvent::Log(line)) => println!("{line}"),
            Ok(ScanEvent::Completed { open, processed }) => {
                break ScanOutcome::Completed { open, processed };
            }
            Ok(ScanEvent::Cancelled { processed }) => break ScanOutcome::Cancelled { processed },
            Ok(_) => {}
            Err(RecvError::Lagged(skipped)) => warn!(skipped, "event stream lagged"),
            Err(RecvError::Closed) => {
                break engine.wait().await.context("scan task ended unexpectedly")?;
            }
        }
    };
    ctrl_c.abort();
    Ok(outcome)
}

fn print_results_table(session: &ScanSession) {
    let port_w = 5usize;
    let status_w = "filtered".len();
    let mut service_w = "service".len();
    for r in &session.results {
        service_w = service_w.max(r.service.len());
    }

    println!(
        "\nFindings: {} ({} open, {} filtered, scanned: {}/{})",
        session.results.len(),
        session.open_count(),
        session.filtered_count(),
        session.processed,
        session.total
    );
    println!(
        "{:>port_w$}  {:<status_w$}  {:<service_w$}  {}",
        "port",
        "status",
        "service",
        "version",
        port_w = port_w,
        status_w = status_w,
        service_w = service_w
    );
    println!(
        "{:-<port_w$}  {:-<status_w$}  {:-<service_w$}  {:-<7}",
        "",
        "",
        "",
        "",
        port_w = port_w,
        status_w = status_w,
        service_w = service_w
    );
    for r in &session.results {
        let version: String =
            r.version.as_deref().unwrap_or_default().chars().take(60).collect();
        println!(
            "{:>port_w$}  {:<status_w$}  {:<service_w$}  {}",
            r.port,
            r.status.as_str(),
            r.service,
            version,
            port_w = port_w,
            status_w = status_w,
            service_w = service_w
        );
    }
}

fn write_session_json(path: &std::path::Path, session: &ScanSession) -> anyhow::Result<()> {
    let file = File::create(path)?;
    serde_json::to_writer_pretty(file, session)?;
    Ok(())
}
