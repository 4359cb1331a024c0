//! docwired entry point

use clap::Parser;
use colored::Colorize;
use docwire_server::{DatabaseServer, ServerConfig};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::filter::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "docwired", version, about = "In-memory legacy wire protocol document server")]
struct Args {
    /// JSON config file; flags override its values
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[arg(long)]
    host: Option<String>,

    #[arg(short, long)]
    port: Option<u16>,

    /// Also listen on this unix socket
    #[arg(long)]
    unix_socket: Option<PathBuf>,

    /// Replica set name to report
    #[arg(long)]
    set_name: Option<String>,

    /// Replica set member, as host:port (repeatable)
    #[arg(long = "host-member")]
    hosts: Vec<String>,

    /// Report as a secondary
    #[arg(long)]
    secondary: bool,

    #[arg(long)]
    batch_size: Option<usize>,
}

fn get_env_filter() -> EnvFilter {
    if std::env::var_os("RUST_LOG").is_some() {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    } else if cfg!(debug_assertions) {
        EnvFilter::new("docwired=debug,docwire_server=debug")
    } else {
        EnvFilter::new("docwired=info,docwire_server=info")
    }
}

fn build_config(args: Args) -> anyhow::Result<ServerConfig> {
    let mut config = match &args.config {
        Some(path) => ServerConfig::load_from_path(path)?,
        None => ServerConfig::default(),
    };
    if let Some(host) = args.host {
        config.host = host;
    }
    if let Some(port) = args.port {
        config.port = port;
    }
    if args.unix_socket.is_some() {
        config.unix_socket = args.unix_socket;
    }
    if args.set_name.is_some() {
        config.set_name = args.set_name;
    }
    if !args.hosts.is_empty() {
        config.hosts = args.hosts;
    }
    if args.secondary {
        config.primary = false;
    }
    if let Some(batch_size) = args.batch_size {
        config.batch_size = batch_size;
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(get_env_filter())
        .init();

    let config = build_config(Args::parse())?;
    print_banner();
    println!("Configuration:");
    println!("  Address: {}", config.address().bright_cyan());
    let role = if config.primary { "primary" } else { "secondary" };
    println!("  Role: {}", role.bright_cyan());
    if let Some(set_name) = &config.set_name {
        println!("  Replica Set: {}", set_name.bright_cyan());
    }
    println!(
        "  Max Connections: {}",
        config.max_connections.to_string().bright_cyan()
    );

    let server = Arc::new(DatabaseServer::new(config));
    let shutdown = Arc::clone(&server);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            println!("\n{}", "Received shutdown signal".bright_yellow());
            shutdown.shutdown();
        }
    });

    if let Err(e) = server.start().await {
        eprintln!("{} {}", "Server error:".bright_red(), e);
        return Err(e.into());
    }
    println!("{}", "docwired stopped".bright_green());
    Ok(())
}

fn print_banner() {
    let banner = r#"
     _                       _              _
  __| | ___   ___ __      __(_)_ __ ___  __| |
 / _` |/ _ \ / __|\ \ /\ / /| | '__/ _ \/ _` |
| (_| | (_) | (__  \ V  V / | | | |  __/ (_| |
 \__,_|\___/ \___|  \_/\_/  |_|_|  \___|\__,_|
"#;
    println!("{}", banner.bright_blue());
}
