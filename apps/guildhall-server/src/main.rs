use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use api_ingress::{ApiIngress, Request, Response, RouteOptions, Router};
use clap::{Parser, Subcommand};
use mimalloc::MiMalloc;
use modkit::{Application, ModuleDecl, ShutdownOptions};
use runtime::{AppConfig, AppConfigProvider, CliArgs};

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

// Adapter to make AppConfigProvider implement modkit::ConfigProvider
struct ModkitConfigAdapter(AppConfigProvider);

impl modkit::ConfigProvider for ModkitConfigAdapter {
    fn get_module_config(&self, module_name: &str) -> Option<&serde_json::Value> {
        self.0.get_module_config(module_name)
    }
}

/// Guildhall Server - community management backend
#[derive(Parser)]
#[command(name = "guildhall-server")]
#[command(about = "Guildhall Server - community management backend")]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Port for HTTP server (overrides config)
    #[arg(short, long)]
    port: Option<u16>,

    /// Print current configuration and exit
    #[arg(long)]
    print_config: bool,

    /// Log verbosity level (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the server
    Run,
    /// Check configuration
    Check,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let args = CliArgs {
        config: cli.config.as_ref().map(|p| p.to_string_lossy().to_string()),
        port: cli.port,
        print_config: cli.print_config,
        verbose: cli.verbose,
    };

    // Load configuration (normalized home_dir is applied inside)
    let mut config = AppConfig::load_or_default(cli.config.as_deref())?;
    config.apply_cli_overrides(&args);
    config.validate().context("invalid configuration")?;

    let logging_config = config.logging.clone().unwrap_or_default();
    runtime::logging::init_logging_from_config(&logging_config, Path::new(&config.server.home_dir));

    if cli.print_config {
        println!("{}", config.to_yaml()?);
        return Ok(());
    }

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run_server(config).await,
        Commands::Check => check_config(config),
    }
}

fn build_router() -> Result<Router> {
    let mut router = Router::new();
    router.register(
        http::Method::GET,
        "/health",
        |_req: Request| async {
            let mut res = Response::new();
            res.json(&serde_json::json!({ "status": "healthy" }));
            Ok::<_, anyhow::Error>(res)
        },
        RouteOptions::new().describe("Liveness probe").tag("system"),
    )?;
    Ok(router)
}

async fn run_server(config: AppConfig) -> Result<()> {
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "Guildhall Server starting");

    let ingress = ApiIngress::new(build_router()?)
        .with_default_bind_addr(config.bind_addr())
        .with_docs_info("Guildhall API", env!("CARGO_PKG_VERSION"));

    let shutdown_timeout = Duration::from_secs(config.server.shutdown_timeout_sec);
    let provider = Arc::new(ModkitConfigAdapter(AppConfigProvider::new(config)));

    let mut app = Application::new()
        .with_config_provider(provider)
        .with_shutdown_timeout(shutdown_timeout);
    app.register_module(
        ModuleDecl::new(api_ingress::MODULE_NAME).version(env!("CARGO_PKG_VERSION")),
        Arc::new(ingress),
    )?;

    match app.run(ShutdownOptions::Signals).await {
        Ok(()) => {
            tracing::info!("Guildhall Server stopped");
            Ok(())
        }
        Err(e) => {
            tracing::error!(error = format!("{e:#}"), "Guildhall Server failed");
            Err(e)
        }
    }
}

fn check_config(config: AppConfig) -> Result<()> {
    tracing::info!("Checking configuration...");
    if let Some(section) = config
        .modules
        .get(api_ingress::MODULE_NAME)
        .filter(|v| !v.is_null())
    {
        let ingress: api_ingress::ApiIngressConfig = serde_json::from_value(section.clone())
            .context("invalid modules.api_ingress section")?;
        ingress.validate()?;
    }
    println!("Configuration check passed");
    println!("{}", config.to_yaml()?);
    Ok(())
}
