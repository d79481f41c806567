use std::path::PathBuf;

use anyhow::{Context, Result};
use aya::include_bytes_aligned;
use clap::Parser;
use fntrace::{FnTraceEngine, settings::Settings, telemetry};
use log::warn;

/// Measure entry-to-return latency of a user-space function with uprobes.
#[derive(Debug, Parser)]
#[command(version)]
struct Opt {
    /// Verbose output
    #[clap(short, long)]
    verbose: bool,

    /// YAML settings file; environment variables override it
    #[clap(short, long, env = "FNTRACE_CONFIG")]
    config: Option<PathBuf>,

    /// Binary containing the function
    #[clap(long)]
    binary: Option<String>,

    /// Symbol or demangled Rust path of the function
    #[clap(short, long)]
    function: Option<String>,

    /// Only trace this process; also locates the binary when --binary is omitted
    #[clap(short, long)]
    pid: Option<u32>,

    /// Ring buffer size in bytes (power of two, page multiple)
    #[clap(long)]
    ringbuf_bytes: Option<u32>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let opt = Opt::parse();

    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(if opt.verbose { "info" } else { "warn" }),
    )
    .init();

    let mut settings =
        Settings::load(opt.config.as_deref()).context("Failed to load settings")?;
    settings.apply_overrides(opt.binary, opt.function, opt.pid, opt.ringbuf_bytes);
    settings.validate()?;

    if let Err(e) = telemetry::init_metrics(settings.otlp_endpoint()) {
        warn!("Metrics export disabled: {:#}", e);
    }

    let engine = FnTraceEngine::new(
        settings,
        include_bytes_aligned!(concat!(env!("OUT_DIR"), "/fntrace")),
    )?;
    let stats = engine.run().await?;

    println!(
        "calls={} orphaned_entries={} unmatched_exits={} invalid={}",
        stats.calls, stats.orphaned_entries, stats.unmatched_exits, stats.invalid
    );
    Ok(())
}
