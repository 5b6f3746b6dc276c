//! Dbtunnel CLI
//!
//! Opens a local TCP port that forwards to a database behind an
//! HTTPS-fronted tunnel endpoint, so standard database tooling (psql,
//! migration runners, dump/restore) can connect to `localhost:<port>` as if
//! the database were local.
//!
//! The client authenticates with an API token presented as a bearer
//! credential on the connection upgrade.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use dbtunnel::config::FileConfig;
use dbtunnel::{TunnelClient, TunnelConfig};

#[derive(Parser, Debug)]
#[command(name = "dbtunnel")]
#[command(author, version, about = "Tunnel a remote database to a local port")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Remote tunnel endpoint URL (wss:// or https://)
    #[arg(short = 'u', long, global = true, env = "DBTUNNEL_URL")]
    url: Option<String>,

    /// API token for authentication
    #[arg(short = 'k', long, global = true, env = "DBTUNNEL_TOKEN")]
    token: Option<String>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Open the tunnel and keep it up until Ctrl+C
    Start(StartArgs),

    /// Save the endpoint URL and API token to the config file
    Login,
}

#[derive(Parser, Debug)]
struct StartArgs {
    /// Local port to listen on
    #[arg(short, long, default_value = "5432", env = "DBTUNNEL_PORT")]
    port: u16,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = FileConfig::load().unwrap_or_default();

    match cli.command {
        Commands::Start(args) => run_start(cli.url, cli.token, args, &config).await,
        Commands::Login => run_login(cli.url, cli.token).await,
    }
}

async fn run_start(
    cli_url: Option<String>,
    cli_token: Option<String>,
    args: StartArgs,
    config: &FileConfig,
) -> Result<()> {
    let url = cli_url
        .or_else(|| config.auth.remote_url.clone())
        .context("Remote URL required. Use --url or set DBTUNNEL_URL")?;

    let token = cli_token
        .or_else(|| config.auth.token.clone())
        .with_context(|| {
            format!(
                "API token required. Use --token, set DBTUNNEL_TOKEN, \
                 or add a token to the config file at {:?}",
                FileConfig::config_path().unwrap_or_default()
            )
        })?;

    let tunnel_config = TunnelConfig::new(&url, args.port, &token)?;
    let mut client = TunnelClient::new(tunnel_config);
    client.connect().await?;

    println!();
    println!(
        "Tunnel up: {} -> {}",
        client.local_addr().map(|a| a.to_string()).unwrap_or_default(),
        url
    );
    println!("Press Ctrl+C to stop.");
    println!();

    tokio::signal::ctrl_c().await?;
    println!("Shutting down...");

    let summary = client.disconnect().await;
    println!(
        "Closed. {} session(s), {} failed, {} forcibly closed.",
        summary.sessions, summary.failed, summary.aborted
    );

    Ok(())
}

async fn run_login(cli_url: Option<String>, cli_token: Option<String>) -> Result<()> {
    let url = match cli_url {
        Some(url) => url,
        None => prompt("Remote tunnel URL: ")?,
    };

    let token = match cli_token {
        Some(token) => token,
        None => prompt("API token: ")?,
    };

    if token.is_empty() {
        anyhow::bail!("No token provided");
    }

    // Validate before persisting
    TunnelConfig::new(&url, 0, &token)?;

    let mut config = FileConfig::load().unwrap_or_default();
    config.auth.token = Some(token);
    config.auth.remote_url = Some(url);
    config.save()?;

    println!();
    println!(
        "Credentials saved to {:?}",
        FileConfig::config_path().unwrap_or_default()
    );
    println!("You can now run: dbtunnel start -p <port>");

    Ok(())
}

fn prompt(label: &str) -> Result<String> {
    use std::io::{self, Write};

    print!("{}", label);
    io::stdout().flush()?;

    let mut line = String::new();
    io::stdin().read_line(&mut line)?;
    Ok(line.trim().to_string())
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}
