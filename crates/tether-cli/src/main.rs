//! Tether CLI: key generation, identity display and running a peer.

mod cli;

use crate::cli::{Cli, Commands};
use clap::Parser;
use std::path::PathBuf;
use tether_kernel::config::load_config;
use tether_kernel::ServiceAdmin;
use tether_types::identity::Keypair;
use tracing::info;

fn main() {
    let cli = Cli::parse();
    init_tracing_stderr();

    match cli.command {
        Commands::Keygen => cmd_keygen(),
        Commands::Address => cmd_address(cli.config),
        Commands::Run => cmd_run(cli.config),
    }
}

fn init_tracing_stderr() {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();
}

fn cmd_keygen() {
    let keypair = Keypair::generate();
    let secret = keypair.secret_hex();
    println!("secret_key = \"{}\"", secret.as_str());
    println!("public_key = \"{}\"", hex::encode(keypair.public_key().to_bytes()));
    println!("address    = \"{}\"", keypair.address());
}

fn cmd_address(config: Option<PathBuf>) {
    let config = load_config(config.as_deref());
    if config.secret_key.is_empty() {
        fail("No secret_key configured. Run `tether keygen` and add it to your config.");
    }
    match Keypair::from_secret_hex(&config.secret_key) {
        Ok(keypair) => println!("{}", keypair.address()),
        Err(e) => fail(&format!("Invalid secret_key: {e}")),
    }
}

fn cmd_run(config: Option<PathBuf>) {
    let config = load_config(config.as_deref());
    let rt = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => fail(&format!("Failed to create Tokio runtime: {e}")),
    };

    rt.block_on(async {
        let admin = match ServiceAdmin::start(config).await {
            Ok(admin) => admin,
            Err(e) => fail(&format!("Failed to start peer: {e}")),
        };
        println!("Peer {} listening on {}", admin.address(), admin.local_addr());

        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl-C");
        }
        info!("Interrupted, shutting down");
        admin.shutdown();
    });
}

fn fail(message: &str) -> ! {
    eprintln!("Error: {message}");
    std::process::exit(1);
}
