use anyhow::{Context, Result};
use clap::{value_parser, Arg, Command};
use config::{Config, Environment, File as ConfigFile};
use parking_lot::Mutex;
use permastore_ledger::Ledger;
use permastore_replication::{FilePeerRegistry, Registry, ReplicationConfig, Replicator};
use permastore_rpc::{start_server, AppState};
use permastore_store::ContentStore;
use serde::Deserialize;
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::AtomicUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Node configuration, layered from defaults, an optional TOML file and
/// `PERMASTORE_`-prefixed environment variables.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
struct NodeConfig {
    node_id: String,
    host: String,
    port: u16,
    data_dir: PathBuf,
    max_file_size: u64,
    retry_limit: usize,
    retry_delay_secs: u64,
    upload_timeout_secs: u64,
    status_timeout_secs: u64,
    pull_timeout_secs: u64,
    probe_timeout_secs: u64,
    log_level: String,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: "permastore-node".to_string(),
            host: "0.0.0.0".to_string(),
            port: 5000,
            data_dir: PathBuf::from("./data"),
            max_file_size: 100 * 1024 * 1024,
            retry_limit: 3,
            retry_delay_secs: 2,
            upload_timeout_secs: 30,
            status_timeout_secs: 10,
            pull_timeout_secs: 30,
            probe_timeout_secs: 5,
            log_level: "info".to_string(),
        }
    }
}

impl NodeConfig {
    fn upload_dir(&self) -> PathBuf {
        self.data_dir.join("uploads")
    }

    fn ledger_path(&self) -> PathBuf {
        self.data_dir.join("ledger.json")
    }

    fn peer_path(&self) -> PathBuf {
        self.data_dir.join("peers.txt")
    }

    fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    fn replication(&self) -> ReplicationConfig {
        ReplicationConfig {
            retry_limit: self.retry_limit,
            retry_delay: Duration::from_secs(self.retry_delay_secs),
            upload_timeout: Duration::from_secs(self.upload_timeout_secs),
            status_timeout: Duration::from_secs(self.status_timeout_secs),
            pull_timeout: Duration::from_secs(self.pull_timeout_secs),
        }
    }
}

fn load_config(config_path: Option<&String>) -> Result<NodeConfig> {
    let mut builder = Config::builder();
    if let Some(path) = config_path {
        builder = builder.add_source(ConfigFile::from(std::path::Path::new(path)));
    }
    builder = builder.add_source(Environment::with_prefix("PERMASTORE").try_parsing(true));

    builder
        .build()
        .context("failed to load configuration")?
        .try_deserialize()
        .context("failed to parse configuration")
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let matches = Command::new("permastore-node")
        .about("Decentralized content-addressed file storage node")
        .version(env!("CARGO_PKG_VERSION"))
        .arg(
            Arg::new("config")
                .long("config")
                .value_name("PATH")
                .help("Path to a TOML configuration file"),
        )
        .arg(
            Arg::new("host")
                .long("host")
                .value_name("ADDR")
                .help("Listen address override"),
        )
        .arg(
            Arg::new("port")
                .long("port")
                .value_name("PORT")
                .value_parser(value_parser!(u16))
                .help("Listen port override"),
        )
        .arg(
            Arg::new("data-dir")
                .long("data-dir")
                .value_name("DIR")
                .help("Data directory override"),
        )
        .arg(
            Arg::new("log-level")
                .long("log-level")
                .value_name("LEVEL")
                .help("Log level override"),
        )
        .get_matches();

    let mut config = load_config(matches.get_one::<String>("config"))?;
    if let Some(host) = matches.get_one::<String>("host") {
        config.host = host.clone();
    }
    if let Some(port) = matches.get_one::<u16>("port") {
        config.port = *port;
    }
    if let Some(data_dir) = matches.get_one::<String>("data-dir") {
        config.data_dir = PathBuf::from(data_dir);
    }
    if let Some(level) = matches.get_one::<String>("log-level") {
        config.log_level = level.clone();
    }

    init_tracing(&config.log_level);
    info!(
        "Starting PermaStore node {} on {}",
        config.node_id,
        config.listen_addr()
    );

    fs::create_dir_all(&config.data_dir)
        .with_context(|| format!("failed to create data directory {:?}", config.data_dir))?;

    let store = Arc::new(
        ContentStore::open(config.upload_dir()).context("failed to open content store")?,
    );
    let ledger = Arc::new(Mutex::new(Ledger::open(config.ledger_path())));
    let registry: Arc<dyn Registry> = Arc::new(
        FilePeerRegistry::open_with_probe_timeout(
            config.peer_path(),
            Duration::from_secs(config.probe_timeout_secs),
        )
        .context("failed to open peer registry")?,
    );
    let replicator = Arc::new(
        Replicator::new(registry.clone(), store.clone(), config.replication())
            .context("failed to build replicator")?,
    );

    let state = AppState {
        ledger,
        store,
        registry,
        replicator,
        node_id: config.node_id.clone(),
        max_file_size: config.max_file_size,
        start_time: Instant::now(),
        req_count: Arc::new(AtomicUsize::new(0)),
    };

    start_server(state, &config.listen_addr()).await
}
