use anyhow::Context;
use arataga::config::Config;
use arataga::server::ProxyServer;
use clap::Parser;
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[cfg(feature = "fast-allocator")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Parser, Debug)]
#[command(name = "arataga")]
#[command(about = "Multi-protocol forwarding proxy with per-user bandwidth quotas", long_about = None)]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Generate example configuration file
    #[arg(long, value_name = "FILE")]
    generate_config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Handle config generation
    if let Some(config_path) = args.generate_config {
        println!("Generating example configuration file: {:?}", config_path);
        Config::create_example(&config_path).context("config generation failed")?;
        println!("Example configuration file created successfully!");
        println!("Edit the file and run: arataga --config {:?}", config_path);
        return Ok(());
    }

    init_logging(&args.log_level)?;

    let config_path = args
        .config
        .context("a configuration file is required (see --generate-config)")?;
    info!("Loading configuration from: {:?}", config_path);
    let config = Config::from_file(&config_path).context("configuration rejected")?;

    let io_threads = config.effective_io_threads();
    info!(
        "arataga v{} starting with {} I/O workers",
        env!("CARGO_PKG_VERSION"),
        io_threads
    );

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(io_threads)
        .enable_all()
        .build()
        .context("failed to build the runtime")?;

    runtime.block_on(async move {
        let server = ProxyServer::new(config)
            .await
            .context("server initialization failed")?;

        info!("Server initialized, starting ACL listeners...");

        // Handle Ctrl+C for graceful shutdown
        let shutdown = tokio::spawn(async {
            tokio::signal::ctrl_c()
                .await
                .expect("Failed to listen for Ctrl+C");
            info!("Received Ctrl+C, shutting down gracefully...");
        });

        tokio::select! {
            result = server.run() => {
                if let Err(e) = result {
                    error!("Server error: {}", e);
                    return Err(e.into());
                }
            }
            _ = shutdown => {}
        }

        server.shutdown().await;

        Ok(())
    })
}

fn init_logging(level: &str) -> anyhow::Result<()> {
    let env_filter = EnvFilter::try_new(level).context("invalid log level")?;

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer())
        .init();

    Ok(())
}
