use clap::Parser;
use hostchat_agent::agent::Agent;
use hostchat_agent::config::{split_addresses, Config};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Hostchat Agent - chat bot for remote host inspection and control
#[derive(Parser, Debug)]
#[command(name = "hostchat-agent", version, about)]
struct Args {
    /// Path to TOML configuration file
    #[arg(short, long, env = "HOSTCHAT_CONFIG")]
    config: Option<PathBuf>,

    /// Bot login address (overrides config)
    #[arg(short, long)]
    login: Option<String>,

    /// Bot password (overrides config)
    #[arg(long, env = "HOSTCHAT_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// Chat server host (overrides config)
    #[arg(short, long)]
    server: Option<String>,

    /// Chat server port (overrides config)
    #[arg(short, long)]
    port: Option<u16>,

    /// Space-separated operator addresses (overrides config)
    #[arg(short, long)]
    report_users: Option<String>,
}

fn load_config(args: &Args) -> Result<Config, Box<dyn std::error::Error>> {
    let mut config = match &args.config {
        Some(path) => Config::from_file(path)?,
        None => {
            let login = args.login.clone().ok_or("--login is required without --config")?;
            let server = args
                .server
                .clone()
                .ok_or("--server is required without --config")?;
            let report_users = args
                .report_users
                .as_deref()
                .map(split_addresses)
                .ok_or("--report-users is required without --config")?;
            Config::default_for(login, server, report_users)
        }
    };

    if let Some(login) = &args.login {
        config.login = login.clone();
    }
    if let Some(password) = &args.password {
        config.password = password.clone();
    }
    if let Some(server) = &args.server {
        config.server = server.clone();
    }
    if let Some(port) = args.port {
        config.server_port = port;
    }
    if let Some(users) = &args.report_users {
        config.report_users = split_addresses(users);
    }

    config.validate()?;
    Ok(config)
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .with_level(true)
        .init();

    let args = Args::parse();
    let config = load_config(&args)?;

    info!(
        login = %config.login,
        server = %config.server,
        port = config.server_port,
        "hostchat agent starting"
    );

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for ctrl-c");
            return;
        }
        info!("interrupt received");
        signal.cancel();
    });

    Agent::from_config(config).run(shutdown).await;
    Ok(())
}
