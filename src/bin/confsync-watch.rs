//! Debugging tool for remote configuration sources.
//!
//! Reads backend connection settings from a TOML file, opens a source
//! against the chosen backend and runs one operation: get, set, or
//! watch keys and print every update until Ctrl-C.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use confsync::{
    BackendKind, ChannelDispatcher, DeploymentInfo, KvConfigSource, MapAccessor,
};

#[derive(Parser)]
#[command(name = "confsync-watch")]
#[command(about = "Inspect and watch a remote configuration source", long_about = None)]
struct Cli {
    /// TOML file holding connection settings (config.* keys).
    #[arg(short, long)]
    settings: Option<PathBuf>,

    #[arg(short, long, value_enum, default_value_t = Backend::Consul)]
    backend: Backend,

    /// Deployment environment the namespace is derived from.
    #[arg(long)]
    env: Option<String>,

    /// Service name, when configuration is scoped per service.
    #[arg(long)]
    service: Option<String>,

    /// Service version, used together with --service.
    #[arg(long, default_value = "1.0.0")]
    service_version: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum Backend {
    Consul,
    Etcd,
    Zookeeper,
}

impl From<Backend> for BackendKind {
    fn from(backend: Backend) -> Self {
        match backend {
            Backend::Consul => BackendKind::Consul,
            Backend::Etcd => BackendKind::Etcd,
            Backend::Zookeeper => BackendKind::Zookeeper,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Read one key.
    Get { key: String },
    /// Write one key.
    Set { key: String, value: String },
    /// Watch keys and print updates until Ctrl-C.
    Watch { keys: Vec<String> },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "confsync=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    let mut accessor = MapAccessor::new();
    if let Some(path) = &cli.settings {
        let raw = std::fs::read_to_string(path)?;
        let table: toml::Table = raw.parse()?;
        flatten_table(&mut accessor, "", &table);
    }

    let mut deployment = DeploymentInfo {
        environment: cli.env.clone(),
        service_name: cli.service.clone(),
        service_version: None,
    };
    if cli.service.is_some() {
        deployment.service_version = Some(cli.service_version.clone());
    }

    let (dispatcher, mut updates) = ChannelDispatcher::new();
    let source = KvConfigSource::init(
        cli.backend.into(),
        &deployment,
        Arc::new(accessor),
        Arc::new(dispatcher),
    )
    .await?;

    tracing::info!(namespace = source.namespace(), "Source initialized");

    match cli.command {
        Commands::Get { key } => match source.get(&key).await {
            Some(value) => println!("{key} = {value}"),
            None => println!("{key} is absent"),
        },
        Commands::Set { key, value } => {
            source.set(&key, &value).await;
            println!("wrote {key}");
        }
        Commands::Watch { keys } => {
            for key in &keys {
                source.watch(key);
            }
            loop {
                tokio::select! {
                    update = updates.recv() => match update {
                        Some(update) => println!("{} = {}", update.key, update.value),
                        None => break,
                    },
                    _ = tokio::signal::ctrl_c() => {
                        tracing::info!("Ctrl-C received, shutting down");
                        source.shutdown();
                        break;
                    }
                }
            }
        }
    }

    Ok(())
}

/// Flatten nested TOML tables into dot-separated keys; array elements
/// become `key[i]` entries.
fn flatten_table(accessor: &mut MapAccessor, prefix: &str, table: &toml::Table) {
    for (name, value) in table {
        let key = if prefix.is_empty() {
            name.clone()
        } else {
            format!("{prefix}.{name}")
        };
        flatten_value(accessor, &key, value);
    }
}

fn flatten_value(accessor: &mut MapAccessor, key: &str, value: &toml::Value) {
    match value {
        toml::Value::Table(table) => flatten_table(accessor, key, table),
        toml::Value::Array(items) => {
            for (i, item) in items.iter().enumerate() {
                flatten_value(accessor, &format!("{key}[{i}]"), item);
            }
        }
        toml::Value::String(s) => accessor.insert(key, s.clone()),
        other => accessor.insert(key, other.to_string()),
    }
}
