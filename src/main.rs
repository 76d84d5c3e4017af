//! Tunnel client CLI: preview the tunnel configuration a pushed
//! directive set produces, without touching the platform.

use std::net::IpAddr;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::warn;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use tunclient::{
    configure_builder, BuilderCapture, ClientOptions, ClientState, DirectiveList, ErrorKind,
    SessionStats,
};

#[derive(Parser)]
#[command(name = "tunclient")]
#[command(about = "Preview the tunnel configuration produced by pushed directives")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    /// File containing pushed directives, one per line
    #[arg(short, long)]
    directives: String,

    /// Server endpoint address
    #[arg(short, long)]
    server: IpAddr,

    /// Client options file (JSON)
    #[arg(short, long)]
    config: Option<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let fallback = if cli.verbose { "debug" } else { "info" };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));
    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_target(true).without_time())
        .try_init()
        .ok();

    let opts = match &cli.config {
        Some(path) => ClientOptions::from_file(path)
            .with_context(|| format!("failed to load client options from {}", path))?,
        None => ClientOptions::default(),
    };

    let text = std::fs::read_to_string(&cli.directives)
        .with_context(|| format!("failed to read directives from {}", cli.directives))?;
    let directives = DirectiveList::parse(&text);

    let stats = SessionStats::new();
    let mut state = ClientState::default();
    let mut capture = BuilderCapture::new();
    configure_builder(
        &mut capture,
        Some(&mut state),
        Some(&stats),
        cli.server,
        &opts,
        &directives,
        false,
    )
    .context("tunnel configuration failed")?;

    println!("{}", capture.render());
    if let Some(ip) = state.vpn_ip4 {
        println!("VPN IPv4: {}", ip);
    }
    if let Some(ip) = state.vpn_ip6 {
        println!("VPN IPv6: {}", ip);
    }
    if stats.error_count(ErrorKind::RerouteGwNoDns) > 0 {
        warn!("gateway redirected with no pushed DNS and fallback disabled");
    }
    Ok(())
}
