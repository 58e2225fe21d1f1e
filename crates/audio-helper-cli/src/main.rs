use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::writer::BoxMakeWriter;

use audio_helper_core::config::{Config, LoggingConfig, MODULES_ENV};
use audio_helper_gateway::{AppState, FeatureModuleRegistry};

#[derive(Parser)]
#[command(name = "audio-helper", version, about = "ASR and TTS helper server")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to config file
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP server
    Serve {
        /// Bind address (overrides config)
        #[arg(long)]
        host: Option<String>,

        /// Port (overrides config)
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Inspect the configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// List the feature modules and which ones are enabled
    Modules,
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the effective configuration
    Show,
    /// Check the configuration for problems
    Validate,
}

fn init_logging(logging: Option<&LoggingConfig>, verbose: bool) -> anyhow::Result<()> {
    let default_level = if verbose {
        "debug"
    } else {
        logging.and_then(|l| l.level.as_deref()).unwrap_or("info")
    };

    let mut filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    for directive in logging.map(|l| l.filters.as_slice()).unwrap_or_default() {
        filter = filter.add_directive(directive.parse()?);
    }

    let writer = match logging.map(|l| l.output.as_str()) {
        Some("stdout") => BoxMakeWriter::new(std::io::stdout),
        _ => BoxMakeWriter::new(std::io::stderr),
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer);
    match logging.map(|l| l.format.as_str()) {
        Some("json") => builder.json().init(),
        _ => builder.init(),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_path = cli.config.map(PathBuf::from).unwrap_or_else(Config::config_dir);
    let mut config = Config::load(&config_path)?;

    init_logging(config.logging.as_ref(), cli.verbose)?;

    match cli.command {
        Commands::Serve { host, port } => {
            if host.is_some() || port.is_some() {
                let mut server = config.server();
                if let Some(host) = host {
                    server.host = host;
                }
                if let Some(port) = port {
                    server.port = port;
                }
                config.server = Some(server);
            }

            let (warnings, errors) = config.validate();
            for warning in &warnings {
                warn!("{warning}");
            }
            if !errors.is_empty() {
                anyhow::bail!("Invalid configuration:\n  {}", errors.join("\n  "));
            }

            info!(config = %config_path.display(), "Starting audio helper");
            let state = Arc::new(AppState::with_remote_engines(Arc::new(config)));
            audio_helper_gateway::start_server(state, &FeatureModuleRegistry::builtin()).await?;
        }
        Commands::Config { action } => match action {
            ConfigAction::Show => {
                println!("{}", serde_json::to_string_pretty(&config)?);
            }
            ConfigAction::Validate => {
                let (warnings, errors) = config.validate();
                for warning in &warnings {
                    println!("warning: {warning}");
                }
                for error in &errors {
                    println!("error: {error}");
                }
                if !errors.is_empty() {
                    anyhow::bail!("{} configuration error(s)", errors.len());
                }
                println!("Configuration OK ({})", config_path.display());
            }
        },
        Commands::Modules => {
            let enabled = config.enabled_modules();
            let source = if std::env::var(MODULES_ENV).is_ok() {
                MODULES_ENV
            } else {
                "config"
            };
            let registry = FeatureModuleRegistry::builtin();
            println!("Feature modules (enabled via {source}):");
            for key in registry.keys() {
                let mark = if enabled.iter().any(|k| k == key) { "x" } else { " " };
                println!("  [{mark}] {key}");
            }
            for key in enabled.iter().filter(|k| registry.get(k).is_none()) {
                println!("  [?] {key} (unknown, ignored)");
            }
        }
    }

    Ok(())
}
