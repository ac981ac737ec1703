//! Exposes the command line application.
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::io;
use std::path::{Path, PathBuf};
use std::process;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use workcache_service::caching::{self, CacheLayout, MarkerFileSoftDeleter, SoftDeleter};
use workcache_service::config::{Config, Granularity};
use workcache_service::locking::{LockOwner, read_owner};
use workcache_service::metrics;
use workcache_service::workspace::{
    CacheBasedWorkspaceProvider, FineGrainedWorkspaceProvider, ProviderOptions, WorkspaceKey,
    WorkspaceProvider,
};

use crate::logging;

/// The variable telling a command which workspace it runs in.
const WORKSPACE_ENV: &str = "WORKCACHE_WORKSPACE";

/// Workcache commands.
#[derive(Debug, Subcommand)]
enum Command {
    /// Run a command inside the workspace of KEY.
    ///
    /// The workspace is created if needed and locked while the command runs. Its exit code is
    /// passed through.
    Run {
        /// The workspace key.
        key: WorkspaceKey,

        /// The command and its arguments, after `--`.
        #[arg(last = true, required = true, value_name = "COMMAND")]
        command: Vec<String>,
    },

    /// Mark unused workspaces and remove the ones marked before.
    Cleanup {
        /// Only report what would be removed.
        #[arg(long)]
        dry_run: bool,
    },

    /// List the workspaces in the cache directory.
    Status,
}

/// Command line interface parser.
#[derive(Debug, Parser)]
#[command(bin_name = "workcache", version, about)]
struct Cli {
    /// Path to your configuration file.
    #[arg(long, short, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Overrides the configured cache directory.
    #[arg(long, global = true, value_name = "DIR")]
    cache_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

/// Runs the main application, returning the process exit code.
pub fn execute() -> Result<i32> {
    let cli = Cli::parse();
    let mut config = Config::get(cli.config.as_deref()).context("failed loading config")?;
    if let Some(cache_dir) = cli.cache_dir {
        config.cache_dir = Some(cache_dir);
    }

    let _sentry = sentry::init(sentry::ClientOptions {
        dsn: config.sentry_dsn.clone(),
        release: sentry::release_name!(),
        ..Default::default()
    });

    // SAFETY: this is single-threaded code at the beginning of the application.
    unsafe { logging::init_logging(&config) };

    if let Some(ref statsd) = config.metrics.statsd {
        let mut tags = config.metrics.custom_tags.clone();
        if let Some(tag) = config.metrics.hostname_tag.clone() {
            if let Some(name) = hostname::get().ok().and_then(|s| s.into_string().ok()) {
                tags.insert(tag, name);
            }
        }
        if let Err(e) = metrics::configure_statsd(&config.metrics.prefix, statsd, tags) {
            tracing::warn!(
                error = &e as &dyn std::error::Error,
                "Failed to configure statsd, metrics are disabled",
            );
        }
    }

    match cli.command {
        Command::Run { key, command } => run(&config, &key, &command),
        Command::Cleanup { dry_run } => {
            let stats =
                caching::cleanup(&config, dry_run).context("failed to clean up workspaces")?;
            if dry_run {
                serde_json::to_writer_pretty(io::stdout().lock(), &stats)?;
                println!();
            }
            Ok(0)
        }
        Command::Status => {
            let base_dir = require_cache_dir(&config)?;
            print!("{}", render_status(&config, base_dir)?);
            Ok(0)
        }
    }
}

fn require_cache_dir(config: &Config) -> Result<&Path> {
    config
        .cache_dir
        .as_deref()
        .context("no cache_dir configured, pass --cache-dir or set it in the config file")
}

fn run(config: &Config, key: &WorkspaceKey, command: &[String]) -> Result<i32> {
    let options = ProviderOptions::from_config(config)
        .context("no cache_dir configured, pass --cache-dir or set it in the config file")?;

    match config.granularity {
        Granularity::Coarse => {
            let provider = CacheBasedWorkspaceProvider::open(options)?;
            run_in(&provider, key, command)
        }
        Granularity::FineGrained => {
            let provider = FineGrainedWorkspaceProvider::open(options)?;
            run_in(&provider, key, command)
        }
    }
}

fn run_in<P>(provider: &P, key: &WorkspaceKey, command: &[String]) -> Result<i32>
where
    P: WorkspaceProvider,
{
    let (program, args) = command.split_first().context("no command given")?;

    let result = provider.with_workspace(key, |dir, _history| {
        tracing::info!(%key, dir = %dir.display(), "Running {program}");
        let status = process::Command::new(program)
            .args(args)
            .current_dir(dir)
            .env(WORKSPACE_ENV, dir)
            .status()
            .with_context(|| format!("failed to spawn {program}"))?;
        // a command killed by a signal has no exit code
        anyhow::Ok(status.code().unwrap_or(1))
    });

    // the cache has to be closed even if the command failed
    let closed = provider.close().context("failed to close workspace cache");
    let code = result?;
    closed?;
    Ok(code)
}

/// Renders one line per workspace with its soft-delete mark and current lock holder.
fn render_status(config: &Config, base_dir: &Path) -> Result<String> {
    let layout = CacheLayout::new(base_dir);
    let soft_deleter = MarkerFileSoftDeleter::new(layout.soft_delete_dir());
    let keys = layout
        .workspace_keys()
        .with_context(|| format!("failed to list {}", base_dir.display()))?;

    let cache_owner = match config.granularity {
        Granularity::Coarse => read_owner(&layout.cache_lock_file()),
        Granularity::FineGrained => None,
    };

    let mut output = String::new();
    writeln!(output, "{} ({} workspaces)", base_dir.display(), keys.len())?;
    if let Some(owner) = &cache_owner {
        writeln!(output, "cache locked by {owner}")?;
    }

    let mut owners: BTreeMap<&WorkspaceKey, LockOwner> = BTreeMap::new();
    if config.granularity == Granularity::FineGrained {
        for key in &keys {
            if let Some(owner) = read_owner(&layout.key_lock_file(key)) {
                owners.insert(key, owner);
            }
        }
    }

    for key in &keys {
        write!(output, "  {key}")?;
        if soft_deleter.is_soft_deleted(key)? {
            write!(output, " [soft-deleted]")?;
        }
        if let Some(owner) = owners.get(key) {
            write!(output, " [locked by {owner}]")?;
        }
        writeln!(output)?;
    }
    Ok(output)
}
