// ============================================================================
// VIGIL COMMAND LINE INTERFACE
// ============================================================================
// - `run`: collection loop until SIGINT/SIGTERM
// - `collect`: one cycle, JSON report on stdout
// - configuration validation and generation
// ============================================================================

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result as AnyhowResult};
use chrono::{Duration as ChronoDuration, Utc};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use vigil_engine::config::VigilConfig;
use vigil_engine::engine::Engine;
use vigil_engine::error::{VigilError, VigilResult};
use vigil_engine::logging::init_logging;
use vigil_engine::orchestrator::CollectOptions;
use vigil_engine::{ENGINE_FULL_NAME, ENGINE_VERSION};

// ----------------------------------------------------------------------------
// CLI Argument Parser
// ----------------------------------------------------------------------------

/// Vigil CLI
#[derive(Parser, Debug)]
#[command(
    name = "vigil",
    author = "AIOps Team",
    version,
    about = "Event collection and correlation for managed network appliances",
    long_about = "Vigil collects events from a network controller over its realtime \
                  stream, its HTTP API and the appliance shell, correlates them into \
                  deduplicated findings and summarizes IDS/IPS activity."
)]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "vigil.toml", env = "VIGIL_CONFIG")]
    pub config: PathBuf,

    /// Log level override
    #[arg(short, long, env = "VIGIL_LOG_LEVEL")]
    pub log_level: Option<String>,

    /// Enable debug mode
    #[arg(short, long, env = "VIGIL_DEBUG")]
    pub debug: bool,

    /// Subcommand to run
    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run collection cycles until interrupted
    Run,

    /// Run a single cycle and print the report as JSON
    Collect {
        /// Only keep realtime and shell events from the last N minutes
        #[arg(short, long)]
        since_minutes: Option<i64>,

        /// Do not poll the controller API
        #[arg(long)]
        skip_polling: bool,
    },

    /// Validate configuration file
    Validate {
        /// Show full parsed configuration
        #[arg(short, long)]
        verbose: bool,
    },

    /// Generate default configuration file
    GenerateConfig {
        /// Output path (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Show version and build info
    Version,
}

// ----------------------------------------------------------------------------
// CLI Handler Functions
// ----------------------------------------------------------------------------

/// Handle the validate subcommand
fn handle_validate(config_path: &Path, verbose: bool) -> VigilResult<()> {
    println!("Validating configuration file: {}", config_path.display());

    match VigilConfig::load(config_path) {
        Ok(config) => {
            println!("✅ Configuration is valid!");

            if verbose {
                println!("\n📋 Parsed configuration:");
                println!("{}", "=".repeat(60));
                match toml::to_string_pretty(&config) {
                    Ok(s) => println!("{}", s),
                    Err(e) => println!("Failed to serialize: {}", e),
                }
            }

            println!("\n📊 Configuration Summary:");
            println!("  • Controller: {} (site '{}')", config.controller.base_url, config.controller.site);
            println!("  • Collection interval: {}s", config.collection.interval.as_secs());
            println!("  • Minimum events before fallback: {}", config.collection.min_events);
            println!("  • Sources enabled:");
            if config.realtime.enabled { println!("    - Realtime stream"); }
            println!("    - Controller polling");
            if config.collection.shell_fallback { println!("    - Shell fallback"); }
            if config.threats.enabled && config.shell.is_some() { println!("    - IDS/IPS store query"); }

            Ok(())
        }
        Err(e) => {
            println!("❌ Configuration validation failed!");
            println!("Error: {}", e);
            Err(VigilError::Config(e))
        }
    }
}

/// Handle the generate-config subcommand
fn handle_generate_config(output: Option<&Path>) -> VigilResult<()> {
    let config_str = VigilConfig::generate_default_config();

    match output {
        Some(path) => {
            fs::write(path, &config_str)?;
            println!("✅ Default configuration written to: {}", path.display());
        }
        None => {
            println!("{}", config_str);
        }
    }

    Ok(())
}

/// Handle the version subcommand
fn handle_version() {
    println!("{} v{}", ENGINE_FULL_NAME, ENGINE_VERSION);
    println!();
    println!("Build Information:");
    println!("  • Target: {}", std::env::consts::ARCH);
    println!("  • OS: {}", std::env::consts::OS);
    println!();
    println!("Features:");
    println!("  • Realtime stream: {}", cfg!(feature = "websocket"));
    println!("  • Controller polling with shell fallback");
    println!("  • Rule-based correlation with windowed deduplication");
    println!("  • IDS/IPS threat aggregation");
}

/// Handle the collect subcommand
async fn handle_collect(config: VigilConfig, since_minutes: Option<i64>, skip_polling: bool) -> AnyhowResult<()> {
    let mut engine = Engine::from_config(config).context("Failed to build engine")?;
    let options = CollectOptions {
        since: since_minutes.map(|m| Utc::now() - ChronoDuration::minutes(m)),
        skip_polling,
    };

    let report = engine.run_cycle(&options).await.context("Collection cycle failed")?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

// ============================================================================
// MAIN ENTRY POINT
// ============================================================================

#[tokio::main]
async fn main() -> AnyhowResult<()> {
    let cli = Cli::parse();

    // Subcommands that don't need logging or a loaded config
    match &cli.command {
        Some(Commands::Version) => {
            handle_version();
            return Ok(());
        }
        Some(Commands::GenerateConfig { output }) => {
            handle_generate_config(output.as_deref())?;
            return Ok(());
        }
        Some(Commands::Validate { verbose }) => {
            handle_validate(&cli.config, *verbose)?;
            return Ok(());
        }
        _ => {}
    }

    let config_exists = cli.config.exists();
    let config = if config_exists {
        VigilConfig::load(&cli.config)
            .with_context(|| format!("Failed to load config from {}", cli.config.display()))?
    } else {
        VigilConfig::default()
    };

    let mut logging_config = config.logging.clone();
    if let Some(level) = &cli.log_level {
        logging_config.level = level.clone();
    }
    if cli.debug {
        logging_config.level = "debug".into();
    }
    let _guard = init_logging(&logging_config)?;

    if !config_exists {
        warn!(target: "vigil::init", "Config file not found at {}, using defaults", cli.config.display());
    }
    info!(target: "vigil::init", "{} v{}", ENGINE_FULL_NAME, ENGINE_VERSION);

    match cli.command {
        Some(Commands::Collect { since_minutes, skip_polling }) => {
            handle_collect(config, since_minutes, skip_polling).await?;
        }
        Some(Commands::Run) | None => {
            let mut engine = Engine::from_config(config).context("Failed to build engine")?;
            engine.run(CancellationToken::new()).await?;
        }
        Some(Commands::Version) | Some(Commands::GenerateConfig { .. }) | Some(Commands::Validate { .. }) => {}
    }

    Ok(())
}
