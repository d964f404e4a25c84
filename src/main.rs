use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Context;
use git_version::git_version;
use slog::*;
use structopt::StructOpt;

mod adapters;
mod config;
mod event_store;
mod firewall;
mod line_parser;
mod log_tailer;
mod policy;

use event_store::EventStore;
use firewall::FirewallController;
use policy::{PolicyEngine, Thresholds};

#[derive(Debug, StructOpt)]
#[structopt(
    name = "dumpster",
    about = "Watches kernel packet-filter drop logs and blocks repeat offenders via nftables."
)]
struct Opt {
    /// Path to the TOML configuration file.
    config: std::path::PathBuf,

    /// Show debug log information.
    #[structopt(short = "v", long = "verbose")]
    verbose: bool,
}

fn build_logger(verbose: bool, build_version: &'static str) -> slog::Logger {
    // Term and journald drains are each fused to Ok=()/Err=Never before
    // being duplicated, matching the type Duplicate requires of its pair.
    let term_decorator = slog_term::TermDecorator::new().build();
    let term_drain = slog_term::CompactFormat::new(term_decorator).build().fuse();
    let journald_drain = slog_journald::JournaldDrain.fuse();
    let drain = slog::Duplicate::new(term_drain, journald_drain).fuse();

    let level = if verbose { Level::Debug } else { Level::Info };
    let drain = slog::LevelFilter::new(drain, level).fuse();
    let drain = slog_async::Async::new(drain).build().fuse();

    slog::Logger::root(
        drain,
        slog::o!(
            "build" => build_version,
            "pkg-version" => env!("CARGO_PKG_VERSION"),
        ),
    )
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    const GIT_VERSION: &str = git_version!(
        args = ["--long", "--all", "--always", "--dirty=-modified"],
        fallback = "unknown"
    );

    let opt = Opt::from_args();
    let root_log = build_logger(opt.verbose, GIT_VERSION);
    slog::info!(root_log, "starting"; "build" => GIT_VERSION, "config" => opt.config.display().to_string());

    let cfg = config::load(&opt.config).with_context(|| {
        format!("failed to load configuration from {}", opt.config.display())
    })?;

    for (label, path) in cfg.log_files.iter() {
        log_tailer::ensure_log_file(path)
            .with_context(|| format!("log file {:?} ({}) is unavailable at startup", label, path.display()))?;
    }

    let protocols: Arc<HashMap<String, String>> = Arc::new(adapters::protocols::protocols().clone());

    let store = EventStore::open(&cfg.db_file, &root_log)
        .await
        .with_context(|| format!("failed to open event store {}", cfg.db_file))?;

    let firewall = Arc::new(
        FirewallController::new(root_log.new(o!("subsystem" => "firewall")))
            .await
            .context("failed to initialize the nftables table/chain/sets")?,
    );

    let thresholds = Thresholds {
        repeat_period: cfg.repeat_period,
        repeat_count: cfg.repeat_count,
        timeout: cfg.timeout,
        bad_ip_threshold: cfg.bad_ip_threshold,
        scan_directions: cfg.scan_directions,
    };

    let engine = PolicyEngine::new(
        store,
        firewall,
        thresholds,
        root_log.new(o!("subsystem" => "policy")),
    );
    engine
        .replay_bad_ips()
        .await
        .context("failed to replay permanently-blocked addresses at boot")?;

    let mut tailers = Vec::new();
    for (label, path) in cfg.log_files.into_iter() {
        let (queues, _handle) = log_tailer::spawn(
            label.clone(),
            path,
            Some(protocols.clone()),
            root_log.new(o!("subsystem" => "tailer", "log" => label)),
        );
        tailers.push(queues);
    }

    engine.run(tailers).await;
    Ok(())
}
