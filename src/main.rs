use std::path::{Path, PathBuf};
use std::process;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use toolgate::{Gateway, GatewayConfig, ToolRegistry};

#[derive(Parser)]
#[command(name = "toolgate", version)]
#[command(about = "Execution gateway between untrusted agents and trusted services", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Path to the gateway configuration file (default: toolgate.toml,
    /// or TOOLGATE_CONFIG)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the gateway
    Run,

    /// Load and validate the configuration, then exit
    CheckConfig,
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::from_default_env().add_directive("info".parse().expect("valid log directive"))
    };

    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn config_path(cli: &Cli) -> PathBuf {
    cli.config
        .clone()
        .or_else(|| std::env::var("TOOLGATE_CONFIG").ok().map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from("toolgate.toml"))
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let path = config_path(&cli);
    let config = match GatewayConfig::load_from_file(&path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("configuration error: {:#}", e);
            process::exit(1);
        }
    };
    let config_dir = path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));

    let result = match cli.command {
        Commands::Run => run(config, config_dir).await,
        Commands::CheckConfig => check_config(&config, &config_dir),
    };

    if let Err(e) = result {
        eprintln!("error: {:#}", e);
        process::exit(1);
    }
}

async fn run(config: GatewayConfig, config_dir: PathBuf) -> Result<()> {
    let gateway = Gateway::builder()
        .config(config)
        .config_dir(config_dir)
        .build()?;

    let shutdown = gateway.shutdown_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received; shutting down");
            shutdown.cancel();
        }
    });

    gateway.serve().await?;
    gateway.shutdown().await;
    Ok(())
}

fn check_config(config: &GatewayConfig, config_dir: &Path) -> Result<()> {
    config.validate()?;

    let mut registry = ToolRegistry::new();
    for (name, service) in &config.services {
        let path = GatewayConfig::resolve_tools_path(config_dir, service);
        let count = registry.load_service_file(name, &path)?;
        println!("service {}: {} tools ({})", name, count, service.url);
    }

    println!(
        "policy: {} rules, {} defaults",
        config.policy.rules.len(),
        config.policy.defaults.len()
    );
    println!(
        "limits: {} pending approvals, {} auto-allowed per minute, {}s approval timeout",
        config.rate_limit.max_pending_approvals,
        config.rate_limit.max_requests_per_minute,
        config.approval_timeout_secs
    );
    println!("configuration OK");
    Ok(())
}
