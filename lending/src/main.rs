//! Lending inventory maintenance CLI.
//!
//! Works on the snapshot named in `lending.toml`: scaffolds config and an
//! empty inventory, audits stored invariants, and prints the authors report.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use serde::Serialize;

use lending::context::LendingContext;
use lending::exit_codes;
use lending::io::config::{LendingConfig, load_config, write_config};
use lending::io::snapshot::{Snapshot, write_snapshot};
use lending::logging;

const DEFAULT_SNAPSHOT: &str = "lending-state/inventory.json";

#[derive(Parser)]
#[command(name = "lending", version, about = "Lending inventory maintenance")]
struct Cli {
    /// Path to the TOML configuration.
    #[arg(long, global = true, default_value = "lending.toml")]
    config: PathBuf,

    /// Log engine activity to stderr (overridden by `RUST_LOG`).
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Write a default config and an empty inventory snapshot if missing.
    Init {
        /// Overwrite existing files.
        #[arg(short, long)]
        force: bool,
    },
    /// Audit the stored inventory against every lending invariant.
    Validate,
    /// Print authors linked to more than five books, as JSON.
    Report,
}

fn main() {
    let cli = Cli::parse();
    logging::init(if cli.verbose {
        logging::VERBOSE
    } else {
        logging::QUIET
    });
    match run(cli) {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{:#}", err);
            std::process::exit(exit_codes::INVALID);
        }
    }
}

fn run(cli: Cli) -> Result<i32> {
    match cli.command {
        Command::Init { force } => cmd_init(&cli.config, force),
        Command::Validate => cmd_validate(&cli.config),
        Command::Report => cmd_report(&cli.config),
    }
}

fn cmd_init(config_path: &Path, force: bool) -> Result<i32> {
    if config_path.exists() && !force {
        bail!(
            "{} already exists (use --force to overwrite)",
            config_path.display()
        );
    }
    let base = config_path.parent().unwrap_or_else(|| Path::new(""));
    let cfg = LendingConfig {
        snapshot_path: Some(base.join(DEFAULT_SNAPSHOT)),
        ..LendingConfig::default()
    };
    write_config(config_path, &cfg)?;

    if let Some(snapshot_path) = &cfg.snapshot_path {
        if force || !snapshot_path.exists() {
            write_snapshot(snapshot_path, &Snapshot::default())
                .context("write empty snapshot")?;
        }
    }
    println!("{}", config_path.display());
    Ok(exit_codes::OK)
}

fn cmd_validate(config_path: &Path) -> Result<i32> {
    let ctx = open_context(config_path)?;
    let errors = ctx.engine().audit().context("audit inventory")?;
    if errors.is_empty() {
        println!("ok");
        return Ok(exit_codes::OK);
    }
    println!("invariant violations:\n- {}", errors.join("\n- "));
    Ok(exit_codes::DRIFT)
}

fn cmd_report(config_path: &Path) -> Result<i32> {
    let ctx = open_context(config_path)?;
    let authors = ctx
        .engine()
        .authors_exceeding_limit()
        .context("compute authors report")?;
    print_json(&authors)?;
    Ok(exit_codes::OK)
}

fn open_context(config_path: &Path) -> Result<LendingContext> {
    let cfg = load_config(config_path)?;
    LendingContext::open(cfg).context("open lending context")
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let payload = serde_json::to_string_pretty(value).context("serialize json")?;
    println!("{}", payload);
    Ok(())
}
