//! Clio CLI
//!
//! Imports a module into a worker pool and runs its entry point, or exposes
//! the pool over TCP.

#![warn(missing_docs)]
#![warn(clippy::all)]

mod demos;

use clap::{Parser, Subcommand};
use clio_cluster::RequestHandler;
use clio_cluster::transport::stream::serve_tcp;
use clio_runtime::{
    Builtins, LifecycleMonitor, ModuleLoader, RunOptions, RuntimeConfig, import_module,
};
use color_eyre::Result;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "clio")]
#[command(about = "Clio - run modules across a pool of workers", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Import a module into a worker pool and run its main
    Run {
        /// Module path
        module: String,
        /// Pool size
        #[arg(short, long)]
        workers: Option<usize>,
        /// JSON host config
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Arguments passed to main
        #[arg(last = true)]
        args: Vec<String>,
    },
    /// Serve a module's worker pool over TCP until interrupted
    Serve {
        /// Module path
        module: String,
        /// Bind address
        #[arg(short, long, default_value = "127.0.0.1:7700")]
        bind: String,
        /// Pool size
        #[arg(short, long)]
        workers: Option<usize>,
    },
    /// List bundled modules
    Modules,
}

fn load_config(path: Option<PathBuf>, workers: Option<usize>) -> Result<RuntimeConfig> {
    let config = match path {
        Some(path) => RuntimeConfig::from_file(path)?,
        None => RuntimeConfig::default(),
    };
    let mut config = config.apply_env()?;
    if let Some(workers) = workers {
        config.workers = Some(workers);
    }
    config.validate()?;
    Ok(config)
}

fn options(monitor: &Arc<LifecycleMonitor>) -> RunOptions {
    let mut builtins = Builtins::new();
    builtins.insert(
        "version".to_string(),
        serde_json::Value::String(env!("CARGO_PKG_VERSION").to_string()),
    );
    RunOptions::new()
        .with_monitor(Arc::clone(monitor))
        .with_builtins(builtins)
}

async fn run(
    module: String,
    workers: Option<usize>,
    config: Option<PathBuf>,
    args: Vec<String>,
) -> Result<()> {
    let config = load_config(config, workers)?;
    let monitor = LifecycleMonitor::global();
    let loader: Arc<dyn ModuleLoader> = Arc::new(demos::modules());

    let imported = import_module(&module, loader, &config, options(&monitor)).await?;
    let argv = match (&config.argv, args.is_empty()) {
        (Some(argv), true) => argv.clone(),
        _ => args,
    };
    let outcome = if config.no_main {
        None
    } else {
        Some(imported.main(argv).await)
    };

    monitor.freeze();
    imported.shutdown().await;

    if let Some(outcome) = outcome {
        let mut stdout = std::io::stdout();
        writeln!(stdout, "{}", serde_json::to_string_pretty(&outcome?)?)?;
        stdout.flush()?;
    }
    monitor.request_exit();
    Ok(())
}

async fn serve(module: String, bind: String, workers: Option<usize>) -> Result<()> {
    let config = load_config(None, workers)?;
    let monitor = LifecycleMonitor::global();
    let loader: Arc<dyn ModuleLoader> = Arc::new(demos::modules());

    let imported = import_module(&module, loader, &config, options(&monitor)).await?;
    let listener = TcpListener::bind(&bind).await?;
    info!(%bind, module = %module, "Serving worker pool");

    let handler: Arc<dyn RequestHandler> = imported.dispatcher().clone();
    tokio::select! {
        served = serve_tcp(listener, handler) => served?,
        signal = tokio::signal::ctrl_c() => {
            signal?;
            info!("Interrupted, shutting down");
        }
    }

    monitor.freeze();
    imported.shutdown().await;
    monitor.request_exit();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("clio=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Run {
            module,
            workers,
            config,
            args,
        } => run(module, workers, config, args).await,
        Commands::Serve {
            module,
            bind,
            workers,
        } => serve(module, bind, workers).await,
        Commands::Modules => {
            for path in demos::modules().paths() {
                println!("{path}");
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_run_with_trailing_args() {
        let cli = Cli::try_parse_from(["clio", "run", "fib.clio", "-w", "2", "--", "10", "20"])
            .unwrap();
        match cli.command {
            Commands::Run {
                module,
                workers,
                args,
                config,
            } => {
                assert_eq!(module, "fib.clio");
                assert_eq!(workers, Some(2));
                assert_eq!(args, vec!["10".to_string(), "20".to_string()]);
                assert!(config.is_none());
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn test_load_config_cli_overrides() {
        let config = load_config(None, Some(3)).unwrap();
        assert_eq!(config.workers, Some(3));
        assert!(load_config(None, Some(0)).is_err());
    }
}
