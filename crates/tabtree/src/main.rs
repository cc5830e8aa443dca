//! tt: inspect, clean up and replay persistent browser tab trees.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tabtree_core::config::{LogFormat, TabTreeConfig};
use tabtree_core::logging::init_logging;

mod commands;

/// tt - persistent parent/child tab trees
#[derive(Debug, Parser)]
#[command(name = "tt")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Configuration file (TOML)
    #[arg(long, global = true, value_name = "PATH", env = "TABTREE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Directory holding the durable `<key>.json` files
    #[arg(long, global = true, value_name = "DIR", env = "TABTREE_STORE_DIR")]
    pub store_dir: Option<PathBuf>,

    /// Log level or filter directive (overrides the config file)
    #[arg(long, global = true, value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Log output format
    #[arg(long, global = true, value_name = "FORMAT")]
    pub log_format: Option<LogFormat>,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Print the durable relation log
    Log {
        /// Emit JSON instead of one line per relation
        #[arg(long)]
        json: bool,
    },

    /// Purge expired relations, pins and scroll positions
    Cleanup,

    /// Replay a JSONL script of browser events and UI requests against an
    /// in-memory browser, then print the resulting tab tree
    Replay {
        /// Script with one event (`"type"`) or request (`"action"`) per line
        script: PathBuf,

        /// Read and write the store directory instead of a scratch store
        #[arg(long)]
        persist: bool,

        #[arg(long)]
        json: bool,
    },

    /// Print the effective configuration
    Config {
        /// Print built-in defaults, ignoring any config file
        #[arg(long)]
        default: bool,
    },
}

fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("tabtree").join("config.toml"))
}

fn default_store_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("tabtree")
}

fn load_config(cli: &Cli) -> anyhow::Result<TabTreeConfig> {
    let mut config = match &cli.config {
        Some(path) => TabTreeConfig::load(path)
            .map_err(tabtree_core::Error::from)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => match default_config_path() {
            Some(path) => TabTreeConfig::load_or_default(&path).map_err(tabtree_core::Error::from)?,
            None => TabTreeConfig::default(),
        },
    };
    if let Some(level) = &cli.log_level {
        config.logging.level.clone_from(level);
    }
    if let Some(format) = cli.log_format {
        config.logging.format = format;
    }
    Ok(config)
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    if let Commands::Config { default: true } = cli.command {
        print!("{}", TabTreeConfig::default().to_toml_string()?);
        return Ok(());
    }

    let config = load_config(&cli)?;
    init_logging(&config.logging).context("failed to initialize logging")?;
    let store_dir = cli.store_dir.clone().unwrap_or_else(default_store_dir);

    match cli.command {
        Commands::Log { json } => commands::log(&store_dir, json).await,
        Commands::Cleanup => commands::cleanup(config, &store_dir).await,
        Commands::Replay {
            script,
            persist,
            json,
        } => {
            let store_dir = persist.then_some(store_dir.as_path());
            commands::replay(config, &script, store_dir, json).await
        }
        Commands::Config { .. } => {
            print!("{}", config.to_toml_string()?);
            Ok(())
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("error: failed to start runtime: {err}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(cli)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err:#}");
            if let Some(remediation) = err
                .chain()
                .find_map(|cause| cause.downcast_ref::<tabtree_core::Error>())
                .and_then(tabtree_core::Error::remediation)
            {
                eprintln!("{}", remediation.render_plain());
            }
            ExitCode::FAILURE
        }
    }
}
