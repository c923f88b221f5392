//! Command-line and environment configuration.

use crate::connection::HeartbeatConfig;
use crate::peer::ReconnectConfig;
use clap::Parser;
use registry_core::{SelfPreservationConfig, ServerId, ServerIdError};
use std::time::Duration;

#[derive(Parser, Debug, Clone)]
#[command(name = "registry-daemon")]
#[command(about = "Service registry server with peer replication")]
pub struct Args {
    /// Server ID (generated if not provided)
    #[arg(long, env = "REGISTRY_SERVER_ID")]
    pub server_id: Option<String>,

    /// Address to listen on for clients and peers
    #[arg(short, long, env = "REGISTRY_LISTEN", default_value = "0.0.0.0:8761")]
    pub listen: String,

    /// Address others should use to reach this server (defaults to the listen address)
    #[arg(long, env = "REGISTRY_ADVERTISE")]
    pub advertise: Option<String>,

    /// Peer registry server, e.g. ws://10.0.0.2:8761 (repeatable)
    #[arg(long = "peer", env = "REGISTRY_PEERS", value_delimiter = ',')]
    pub peers: Vec<String>,

    /// Application name this server registers itself under
    #[arg(long, env = "REGISTRY_APP_NAME", default_value = "registry")]
    pub app_name: String,

    /// Fraction of expected renewals below which eviction is suspended
    #[arg(long, env = "REGISTRY_RENEWAL_PERCENT_THRESHOLD", default_value_t = 0.85)]
    pub renewal_percent_threshold: f64,

    /// Evict expired leases even when renewals dry up
    #[arg(long, env = "REGISTRY_DISABLE_SELF_PRESERVATION")]
    pub disable_self_preservation: bool,

    /// Seconds between eviction runs
    #[arg(long, env = "REGISTRY_EVICTION_INTERVAL_SECS", default_value_t = 60)]
    pub eviction_interval_secs: u64,

    /// Seconds an instance whose connection dropped stays before eviction
    #[arg(long, env = "REGISTRY_EVICTION_DELAY_SECS", default_value_t = 90)]
    pub eviction_delay_secs: u64,

    /// Seconds to hold back reads when startup sync found nothing
    #[arg(long, env = "REGISTRY_WAIT_TIME_WHEN_SYNC_EMPTY_SECS", default_value_t = 300)]
    pub wait_time_when_sync_empty_secs: u64,

    /// Seconds between connection heartbeats
    #[arg(long, env = "REGISTRY_HEARTBEAT_INTERVAL_SECS", default_value_t = 30)]
    pub heartbeat_interval_secs: u64,

    /// Consecutive missed heartbeats before a connection is dropped
    #[arg(long, env = "REGISTRY_HEARTBEAT_MISSES", default_value_t = 3)]
    pub heartbeat_misses: u32,

    /// Timeout for a single peer request in milliseconds
    #[arg(long, env = "REGISTRY_PEER_TIMEOUT_MS", default_value_t = 5000)]
    pub peer_timeout_ms: u64,

    /// Attempts per peer during startup sync
    #[arg(long, env = "REGISTRY_PEER_RETRIES", default_value_t = 3)]
    pub peer_retries: u32,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid server id: {0}")]
    InvalidServerId(#[from] ServerIdError),
    #[error("Renewal percent threshold must be in (0, 1], got {0}")]
    InvalidThreshold(f64),
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
}

/// Validated server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub server_id: ServerId,
    pub listen: String,
    pub advertise: Option<String>,
    /// Peer URLs, normalized to `ws://` form
    pub peers: Vec<String>,
    pub app_name: String,
    pub self_preservation: SelfPreservationConfig,
    pub eviction_interval: Duration,
    pub eviction_delay: Duration,
    pub wait_time_when_sync_empty: Duration,
    pub heartbeat: HeartbeatConfig,
    pub peer_timeout: Duration,
    /// Backoff between startup sync attempts and peer reconnects
    pub peer_retry: ReconnectConfig,
}

impl ServerConfig {
    /// The address peers and clients should dial.
    pub fn advertised_address(&self) -> &str {
        self.advertise.as_deref().unwrap_or(&self.listen)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            server_id: ServerId::generate(),
            listen: "127.0.0.1:0".to_string(),
            advertise: None,
            peers: Vec::new(),
            app_name: "registry".to_string(),
            self_preservation: SelfPreservationConfig::default(),
            eviction_interval: Duration::from_secs(60),
            eviction_delay: Duration::from_secs(90),
            wait_time_when_sync_empty: Duration::from_secs(300),
            heartbeat: HeartbeatConfig::default(),
            peer_timeout: Duration::from_millis(5000),
            peer_retry: ReconnectConfig::with_attempts(3),
        }
    }
}

impl TryFrom<Args> for ServerConfig {
    type Error = ConfigError;

    fn try_from(args: Args) -> Result<Self, Self::Error> {
        let server_id = match args.server_id {
            Some(id) => id.parse()?,
            None => ServerId::generate(),
        };

        let threshold = args.renewal_percent_threshold;
        if !(threshold > 0.0 && threshold <= 1.0) {
            return Err(ConfigError::InvalidThreshold(threshold));
        }
        for (name, value) in [
            ("eviction-interval-secs", args.eviction_interval_secs),
            ("heartbeat-interval-secs", args.heartbeat_interval_secs),
            ("peer-timeout-ms", args.peer_timeout_ms),
        ] {
            if value == 0 {
                return Err(ConfigError::Zero(name));
            }
        }
        if args.heartbeat_misses == 0 {
            return Err(ConfigError::Zero("heartbeat-misses"));
        }
        if args.peer_retries == 0 {
            return Err(ConfigError::Zero("peer-retries"));
        }

        let advertise = args.advertise.map(|a| normalize_peer_url(&a));
        let peers = args
            .peers
            .iter()
            .filter(|p| !p.trim().is_empty())
            .map(|p| normalize_peer_url(p))
            .filter(|p| Some(p) != advertise.as_ref())
            .collect();

        Ok(Self {
            server_id,
            listen: args.listen,
            advertise,
            peers,
            app_name: args.app_name,
            self_preservation: SelfPreservationConfig {
                enabled: !args.disable_self_preservation,
                renewal_percent_threshold: threshold,
                ..Default::default()
            },
            eviction_interval: Duration::from_secs(args.eviction_interval_secs),
            eviction_delay: Duration::from_secs(args.eviction_delay_secs),
            wait_time_when_sync_empty: Duration::from_secs(args.wait_time_when_sync_empty_secs),
            heartbeat: HeartbeatConfig {
                interval: Duration::from_secs(args.heartbeat_interval_secs),
                max_misses: args.heartbeat_misses,
            },
            peer_timeout: Duration::from_millis(args.peer_timeout_ms),
            peer_retry: ReconnectConfig::with_attempts(args.peer_retries),
        })
    }
}

/// Add a `ws://` scheme to bare `host:port` peer addresses.
pub fn normalize_peer_url(addr: &str) -> String {
    let addr = addr.trim().trim_end_matches('/');
    if addr.starts_with("ws://") || addr.starts_with("wss://") {
        addr.to_string()
    } else {
        format!("ws://{}", addr)
    }
}
