use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use colored::Colorize;
use shellgate_core::{Reaper, ShellgateConfig};
use shellgate_server::{router, AppState};
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser)]
#[command(name = "shellgate")]
#[command(version = VERSION)]
#[command(about = "Shellgate - browser terminal sessions for a server console")]
#[command(long_about = r#"
Shellgate gives a browser client an interactive shell on this host, either
through in-process PTY sessions streamed over WebSocket or through a helper
terminal server (ttyd) started on a loopback port with a one-time password.

Configuration is read from config/default.toml, shellgate.toml and
~/.config/shellgate/config.toml, then SHELLGATE_* environment variables.
"#)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Run the HTTP and WebSocket server (default)")]
    Serve {
        #[arg(short, long, help = "Address to listen on, overrides server.bind")]
        bind: Option<String>,
    },

    #[command(about = "Validate configuration and report helper availability")]
    Check,

    #[command(about = "Show version information")]
    Version,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match run(cli).await {
        Ok(_) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}: {:#}", "Error".red().bold(), e);
            ExitCode::FAILURE
        }
    }
}

fn init_logging(config: &ShellgateConfig, verbose: bool) {
    let filter = if verbose {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"))
    } else {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(config.log_level()))
    };

    if config.logging.json_format {
        tracing_subscriber::registry()
            .with(fmt::layer().json().with_target(false))
            .with(filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer().with_target(false))
            .with(filter)
            .init();
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    match cli.command.unwrap_or(Commands::Serve { bind: None }) {
        Commands::Serve { bind } => cmd_serve(bind, cli.verbose).await,
        Commands::Check => cmd_check(),
        Commands::Version => {
            println!("shellgate {}", VERSION);
            Ok(())
        }
    }
}

async fn cmd_serve(bind: Option<String>, verbose: bool) -> anyhow::Result<()> {
    let mut config = ShellgateConfig::load().context("Failed to load configuration")?;
    if let Some(bind) = bind {
        config.server.bind = bind;
    }
    init_logging(&config, verbose);

    let state = AppState::new(&config);
    let pty = Arc::clone(&state.pty);
    let helper = Arc::clone(&state.helper);
    let reaper = Reaper::new(Arc::clone(&pty), &config.reaper).spawn();

    let listener = tokio::net::TcpListener::bind(&config.server.bind)
        .await
        .with_context(|| format!("Failed to bind {}", config.server.bind))?;
    info!(
        "Shellgate {} listening on {} (auth {})",
        VERSION,
        config.server.bind,
        if state.auth_token.is_some() { "on" } else { "off" }
    );

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown signal received");
        })
        .await
        .context("Server error")?;

    reaper.shutdown().await;
    pty.shutdown();
    helper.shutdown();
    Ok(())
}

fn cmd_check() -> anyhow::Result<()> {
    println!("{}", "Checking Shellgate configuration...".cyan().bold());
    println!();

    let config = ShellgateConfig::load()?;
    println!("  {} Configuration is valid", "✓".green());
    println!("  {} Listen address: {}", "→".blue(), config.server.bind);
    println!(
        "  {} Auth token: {}",
        "→".blue(),
        if config.server.auth_token.is_some() {
            "configured"
        } else {
            "not set"
        }
    );
    println!(
        "  {} Default shell: {} ({}x{})",
        "→".blue(),
        config.terminal.shell(),
        config.terminal.default_cols,
        config.terminal.default_rows
    );
    println!(
        "  {} Helper ports: {}-{}",
        "→".blue(),
        config.helper.port_base,
        config.helper.port_last()
    );

    let helper = shellgate_core::HelperBroker::new(config.helper.clone());
    if helper.is_available() {
        println!("  {} Helper '{}' found", "✓".green(), config.helper.binary);
    } else {
        println!(
            "  {} Helper '{}' not found, helper sessions are unavailable",
            "!".yellow(),
            config.helper.binary
        );
    }

    Ok(())
}
