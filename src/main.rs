//! Burrow CLI - reverse TCP tunnels
//!
//! Run `burrow server` on a reachable host and `burrow client` next to the
//! service you want to expose.

use anyhow::{Context, Result};
use burrow_client::{ClientConfig, TunnelClient};
use burrow_proto::ServerInfo;
use burrow_server::{ServerConfig, TunnelServer};
use burrow_transport_h2::H2Config;
use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const DEFAULT_LISTEN: &str = "0.0.0.0:7835";
const INITIAL_RECONNECT_DELAY: Duration = Duration::from_secs(1);
const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(60);

/// Burrow - expose services behind a firewall through a public server
#[derive(Parser, Debug)]
#[command(name = "burrow")]
#[command(version)]
struct Cli {
    /// Log level or filter directive (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "info", env = "BURROW_LOG")]
    log_level: String,

    /// Configuration file (YAML)
    #[arg(long, short = 'c', global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Accept tunnel clients and expose a shadow listener for each
    #[command(long_about = r#"
Accept tunnel clients and open a shadow listener for each one. Connections
to a shadow listener are forwarded through the client's tunnel.

EXAMPLES:
  burrow server --listen 0.0.0.0:7835 --token $BURROW_TOKEN

ENVIRONMENT VARIABLES:
  BURROW_LISTEN  Address to accept tunnel clients on
  BURROW_TOKEN   Shared secret clients must present
"#)]
    Server {
        /// Address to accept tunnel clients on
        #[arg(long, env = "BURROW_LISTEN")]
        listen: Option<String>,

        /// Shared secret clients must present
        #[arg(long, env = "BURROW_TOKEN", hide_env_values = true)]
        token: Option<String>,
    },

    /// Connect to a server and forward tunnel traffic to a local target
    #[command(long_about = r#"
Connect to a burrow server and forward every connection it relays to a
local target address.

EXAMPLES:
  # Expose local SSH on the server's port 2222
  burrow client --server tunnel.example.com:7835 \
    --token $BURROW_TOKEN \
    --target 127.0.0.1:22 \
    --shadow :2222 --reconnect

ENVIRONMENT VARIABLES:
  BURROW_SERVER  Server address
  BURROW_TOKEN   Shared secret
  BURROW_TARGET  Local address to forward to
  BURROW_SHADOW  Address to request on the server
  BURROW_NAME    Tunnel name
"#)]
    Client {
        /// Server address (e.g., tunnel.example.com:7835)
        #[arg(long, env = "BURROW_SERVER")]
        server: Option<String>,

        /// Shared secret
        #[arg(long, env = "BURROW_TOKEN", hide_env_values = true)]
        token: Option<String>,

        /// Local address to forward connections to (e.g., 127.0.0.1:22)
        #[arg(long, env = "BURROW_TARGET")]
        target: Option<String>,

        /// Address to request on the server; empty picks any free port
        #[arg(long, env = "BURROW_SHADOW")]
        shadow: Option<String>,

        /// Tunnel name (auto-generated if not specified)
        #[arg(long, env = "BURROW_NAME")]
        name: Option<String>,

        /// Reconnect with backoff when the session ends
        #[arg(long)]
        reconnect: bool,
    },
}

/// Configuration file format
#[derive(Debug, Default, Serialize, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    server: ServerSection,

    #[serde(default)]
    client: ClientSection,

    #[serde(default)]
    transport: TransportSection,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct ServerSection {
    #[serde(skip_serializing_if = "Option::is_none")]
    listen: Option<String>,

    /// Environment variable name for the token
    #[serde(skip_serializing_if = "Option::is_none")]
    token_env: Option<String>,

    /// Direct token (prefer using token_env)
    #[serde(skip_serializing_if = "Option::is_none")]
    token: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    handshake_timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct ClientSection {
    #[serde(skip_serializing_if = "Option::is_none")]
    server: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    token_env: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    token: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    target: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    shadow: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<String>,

    /// Bound on dialing the server and each target connection
    #[serde(skip_serializing_if = "Option::is_none")]
    connect_timeout_secs: Option<u64>,

    #[serde(default)]
    reconnect: bool,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct TransportSection {
    /// Seconds between keep-alive PINGs; 0 disables keep-alive
    #[serde(skip_serializing_if = "Option::is_none")]
    keep_alive_interval_secs: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    keep_alive_timeout_secs: Option<u64>,

    /// Per-stream flow-control window in bytes
    #[serde(skip_serializing_if = "Option::is_none")]
    stream_window_size: Option<u32>,

    /// Whole-connection flow-control window in bytes
    #[serde(skip_serializing_if = "Option::is_none")]
    connection_window_size: Option<u32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    max_concurrent_streams: Option<u32>,
}

impl TransportSection {
    fn h2_config(&self) -> H2Config {
        let mut config = H2Config::default();
        match self.keep_alive_interval_secs {
            Some(0) => config = config.without_keep_alive(),
            Some(secs) => config = config.with_keep_alive(Duration::from_secs(secs)),
            None => {}
        }
        if let Some(secs) = self.keep_alive_timeout_secs {
            config = config.with_keep_alive_timeout(Duration::from_secs(secs));
        }
        if self.stream_window_size.is_some() || self.connection_window_size.is_some() {
            let stream = self
                .stream_window_size
                .unwrap_or(config.initial_window_size);
            let connection = self
                .connection_window_size
                .unwrap_or(config.initial_connection_window_size);
            config = config.with_window_size(stream, connection);
        }
        if let Some(max) = self.max_concurrent_streams {
            config = config.with_max_concurrent_streams(max);
        }
        config
    }
}

/// Setup logging with the specified log level
fn setup_logging(log_level: &str) -> Result<()> {
    let filter = EnvFilter::try_new(log_level)
        .with_context(|| format!("Invalid log level: {}", log_level))?;

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();

    Ok(())
}

/// Load configuration from YAML file
fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: ConfigFile = serde_yaml::from_str(&contents)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

    Ok(config)
}

/// Token from the flag, then the file's env var, then the file itself
fn resolve_token(
    flag: Option<String>,
    token_env: Option<&str>,
    token: Option<String>,
) -> Result<String> {
    if let Some(token) = flag {
        return Ok(token);
    }
    if let Some(env_var) = token_env {
        return std::env::var(env_var)
            .with_context(|| format!("Environment variable {} not set", env_var));
    }
    token.ok_or_else(|| {
        anyhow::anyhow!("Token is required (use --token, BURROW_TOKEN, or config file)")
    })
}

/// Validate address format (should be host:port)
fn validate_address(addr: &str, addr_type: &str) -> Result<()> {
    let (host, port) = addr.rsplit_once(':').ok_or_else(|| {
        anyhow::anyhow!(
            "Invalid {} address format: '{}' (expected format: host:port)",
            addr_type,
            addr
        )
    })?;

    if host.is_empty() {
        anyhow::bail!(
            "Invalid {} address format: '{}' (host cannot be empty)",
            addr_type,
            addr
        );
    }

    port.parse::<u16>()
        .with_context(|| format!("Invalid port in {} address: {}", addr_type, addr))?;

    Ok(())
}

fn build_server_config(
    file: &ConfigFile,
    listen: Option<String>,
    token: Option<String>,
) -> Result<(SocketAddr, ServerConfig)> {
    let section = &file.server;
    let listen = listen
        .or_else(|| section.listen.clone())
        .unwrap_or_else(|| DEFAULT_LISTEN.to_string());
    let listen: SocketAddr = listen
        .parse()
        .with_context(|| format!("Invalid listen address: {}", listen))?;

    let token = resolve_token(token, section.token_env.as_deref(), section.token.clone())?;
    if token.is_empty() {
        anyhow::bail!("Token must not be empty");
    }

    let mut config = ServerConfig::new(token).with_h2_config(file.transport.h2_config());
    if let Some(secs) = section.handshake_timeout_secs {
        config = config.with_handshake_timeout(Duration::from_secs(secs));
    }

    Ok((listen, config))
}

struct ClientArgs {
    server: Option<String>,
    token: Option<String>,
    target: Option<String>,
    shadow: Option<String>,
    name: Option<String>,
    reconnect: bool,
}

/// Merge CLI args with config file, giving precedence to CLI args
fn build_client_config(file: &ConfigFile, args: ClientArgs) -> Result<(ClientConfig, bool)> {
    let section = &file.client;

    let server = args.server.or_else(|| section.server.clone()).ok_or_else(|| {
        anyhow::anyhow!("Server address is required (use --server or config file)")
    })?;
    let target = args.target.or_else(|| section.target.clone()).ok_or_else(|| {
        anyhow::anyhow!("Target address is required (use --target or config file)")
    })?;
    let token = resolve_token(args.token, section.token_env.as_deref(), section.token.clone())?;

    validate_address(&server, "server")?;
    validate_address(&target, "target")?;

    let mut config = ClientConfig::new(server, token, target)
        .with_h2_config(file.transport.h2_config());
    if let Some(shadow) = args.shadow.or_else(|| section.shadow.clone()) {
        config = config.with_shadow_addr(shadow);
    }
    if let Some(name) = args.name.or_else(|| section.name.clone()) {
        config = config.with_name(name);
    }
    if let Some(secs) = section.connect_timeout_secs {
        config = config.with_connect_timeout(Duration::from_secs(secs));
    }

    Ok((config, args.reconnect || section.reconnect))
}

async fn run_server(listen: SocketAddr, config: ServerConfig) -> Result<()> {
    let mut server = TunnelServer::new(config);
    server.register_handshake_callback(ServerInfo::new(env!("CARGO_PKG_VERSION")));

    let handle = server.listen(listen).await?;
    info!("Accepting tunnel clients on {}", handle.local_addr());

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl+C")?;
    info!("Received Ctrl+C, shutting down...");

    handle.close().await?;
    info!("Server stopped");
    Ok(())
}

/// Run one tunnel; returns once the session has ended
async fn run_tunnel(config: ClientConfig) -> Result<(), burrow_client::ClientError> {
    let client = TunnelClient::connect(config).await?;
    info!(
        "Tunnel {} exposed on {} (server-side)",
        client.name(),
        client.shadow_addr()
    );
    client.run().await
}

/// Keep a tunnel up, backing off between attempts
async fn run_client_with_reconnect(config: ClientConfig) -> Result<()> {
    let mut attempt: u32 = 0;
    let mut current_delay = INITIAL_RECONNECT_DELAY;

    loop {
        attempt += 1;
        info!("Connection attempt {}", attempt);

        match run_tunnel(config.clone()).await {
            Ok(()) => {
                warn!("Tunnel session ended");
                // A session that came up resets the backoff
                current_delay = INITIAL_RECONNECT_DELAY;
            }
            Err(e) if e.is_fatal() => {
                error!("Server refused the tunnel: {}", e);
                return Err(e.into());
            }
            Err(e) if e.is_closed() => warn!("Server closed the connection: {}", e),
            Err(e) => error!("Tunnel error: {}", e),
        }

        warn!(
            "Reconnecting in {} seconds... (attempt {})",
            current_delay.as_secs(),
            attempt + 1
        );
        tokio::time::sleep(current_delay).await;

        // Exponential backoff with max cap
        current_delay = std::cmp::min(current_delay * 2, MAX_RECONNECT_DELAY);
    }
}

async fn run_client(config: ClientConfig, reconnect: bool) -> Result<()> {
    info!("Server: {}", config.server_addr);
    info!("Target address: {}", config.target_addr);

    let task = async move {
        if reconnect {
            run_client_with_reconnect(config).await
        } else {
            run_tunnel(config).await.map_err(Into::into)
        }
    };

    tokio::select! {
        res = tokio::signal::ctrl_c() => {
            res.context("Failed to listen for Ctrl+C")?;
            info!("Received Ctrl+C, shutting down...");
            Ok(())
        }
        result = task => {
            if let Err(e) = &result {
                error!("Client stopped: {:#}", e);
            }
            result
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging first
    setup_logging(&cli.log_level)?;

    let file = match &cli.config {
        Some(path) => {
            info!("Loading configuration from: {}", path.display());
            load_config_file(path)?
        }
        None => ConfigFile::default(),
    };

    match cli.command {
        Commands::Server { listen, token } => {
            let (listen, config) = build_server_config(&file, listen, token)
                .context("Failed to build server configuration")?;
            run_server(listen, config).await
        }
        Commands::Client {
            server,
            token,
            target,
            shadow,
            name,
            reconnect,
        } => {
            let args = ClientArgs {
                server,
                token,
                target,
                shadow,
                name,
                reconnect,
            };
            let (config, reconnect) = build_client_config(&file, args)
                .context("Failed to build client configuration")?;
            run_client(config, reconnect).await
        }
    }
}
