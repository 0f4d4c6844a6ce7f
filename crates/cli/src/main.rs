//! `moltis` — CLI surface for the persistent memory + knowledge-base
//! subsystem (spec §6 "CLI surface").

mod doctor_commands;
mod kb_commands;

use {
    clap::{Parser, Subcommand},
    tracing::info,
    tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter},
};

#[derive(Parser)]
#[command(name = "moltis", about = "Persistent memory + knowledge base for AI coding agents")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Output logs as JSON instead of human-readable.
    #[arg(long, global = true, default_value_t = false)]
    json_logs: bool,

    /// Custom config directory (overrides default ~/.config/clawmem/).
    #[arg(long, global = true, env = "MOLTIS_CONFIG_DIR")]
    config_dir: Option<std::path::PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Ingest, search, and manage the knowledge base (§4.8).
    Kb {
        #[command(subcommand)]
        action: kb_commands::KbAction,
    },
    /// One-shot connectivity + capability + embedding-coverage diagnostic (§4.12).
    Doctor {
        /// Print the report as JSON instead of the human-readable form.
        #[arg(long, default_value_t = false)]
        json: bool,
    },
}

fn init_telemetry(cli: &Cli) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    let registry = tracing_subscriber::registry().with(filter);

    if cli.json_logs {
        registry.with(fmt::layer().json().with_target(true).with_thread_ids(false)).init();
    } else {
        registry
            .with(fmt::layer().with_target(false).with_thread_ids(false).with_ansi(true))
            .init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_telemetry(&cli);

    if let Some(ref dir) = cli.config_dir {
        moltis_config::set_config_dir(dir.clone());
    }

    info!(version = env!("CARGO_PKG_VERSION"), "moltis starting");

    let result = match cli.command {
        Commands::Kb { action } => kb_commands::handle_kb(action).await,
        Commands::Doctor { json } => doctor_commands::handle_doctor(json).await,
    };

    if let Err(ref e) = result {
        eprintln!("error: {e}");
        std::process::exit(1);
    }

    Ok(())
}
