use std::path::PathBuf;
use std::sync::Arc;
use anyhow::Context;
use clap::{Parser, Subcommand};
use kvsfs::{Backends, CoreConfig, FsManager, MemoryKvs};
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser, Debug)]
#[command(author, version, about = "Manage filesystems stored in a key-value store", long_about = None)]
struct Args {
    /// JSON configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Store snapshot path (overrides the configuration)
    #[arg(short, long)]
    data: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Filesystem lifecycle
    Fs {
        #[command(subcommand)]
        action: FsAction,
    },
    /// Export (tenant) lifecycle
    Export {
        #[command(subcommand)]
        action: ExportAction,
    },
}

#[derive(Subcommand, Debug)]
enum FsAction {
    Create { name: String },
    Delete { name: String },
    List,
}

#[derive(Subcommand, Debug)]
enum ExportAction {
    Create {
        name: String,
        /// Endpoint options; defaults to the configured export options
        #[arg(short, long)]
        options: Option<String>,
    },
    Delete { name: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => CoreConfig::load(path)
            .with_context(|| format!("loading configuration {:?}", path))?,
        None => CoreConfig::default(),
    };
    if let Some(data) = args.data.clone() {
        config.data_path = data;
    }

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_filter));
    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_ansi(false)
        .init();

    info!("opening store {:?}", config.data_path);
    let kvs = Arc::new(MemoryKvs::open(&config.data_path).await?);
    let manager = FsManager::new(Backends::memory(kvs.clone()));
    manager.init().await?;
    manager.init_exports().await?;

    let outcome = run(&manager, &config, args.command).await;
    if let Err(e) = &outcome {
        error!("command failed: {}", e);
    }

    manager.teardown().await;
    kvs.persist().await?;
    outcome
}

async fn run(manager: &FsManager, config: &CoreConfig, command: Command) -> anyhow::Result<()> {
    match command {
        Command::Fs { action: FsAction::Create { name } } => {
            manager.create_filesystem(&name).await?;
            println!("created {}", name);
        }
        Command::Fs { action: FsAction::Delete { name } } => {
            manager.delete_filesystem(&name).await?;
            println!("deleted {}", name);
        }
        Command::Fs { action: FsAction::List } => {
            manager
                .scan_filesystems(|entry| {
                    match &entry.export {
                        Some(info) => println!("{}\tns={}\texport={}", entry.name, info.ns_id, info.options),
                        None => println!("{}\t-\t-", entry.name),
                    }
                    Ok(())
                })
                .await?;
        }
        Command::Export { action: ExportAction::Create { name, options } } => {
            let options = options.unwrap_or_else(|| config.export_options.clone());
            manager.create_export(&name, &options).await?;
            println!("exported {} ({})", name, options);
        }
        Command::Export { action: ExportAction::Delete { name } } => {
            manager.delete_export(&name).await?;
            println!("unexported {}", name);
        }
    }
    Ok(())
}
