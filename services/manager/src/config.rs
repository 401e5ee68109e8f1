use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use holdfast_id::NodeName;
use holdfast_reconcile::DEFAULT_RECONCILE_INTERVAL;

/// Default disk size advertised for the local node: 64 GiB.
const DEFAULT_DISK_CAPACITY: u64 = 64 << 30;

#[derive(Debug, Clone)]
pub struct Config {
    pub listen_addr: SocketAddr,
    pub node_id: NodeName,
    pub node_address: String,
    pub data_dir: PathBuf,
    pub disk_capacity: u64,
    pub reconcile_interval: Duration,
    pub log_level: String,
    pub backup_target: Option<String>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let listen_addr = std::env::var("HOLDFAST_LISTEN_ADDR")
            .unwrap_or_else(|_| "127.0.0.1:9500".to_string())
            .parse()
            .context("HOLDFAST_LISTEN_ADDR")?;

        let node_id = NodeName::parse(
            &std::env::var("HOLDFAST_NODE_ID").unwrap_or_else(|_| "node-1".to_string()),
        )
        .context("HOLDFAST_NODE_ID")?;

        let node_address =
            std::env::var("HOLDFAST_NODE_ADDRESS").unwrap_or_else(|_| "127.0.0.1".to_string());

        let data_dir = std::env::var("HOLDFAST_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/var/lib/holdfast"));

        let disk_capacity = match std::env::var("HOLDFAST_DISK_CAPACITY") {
            Ok(v) => v.parse().context("HOLDFAST_DISK_CAPACITY")?,
            Err(_) => DEFAULT_DISK_CAPACITY,
        };

        let reconcile_interval = match std::env::var("HOLDFAST_RECONCILE_INTERVAL_MS") {
            Ok(v) => {
                let ms: u64 = v.parse().context("HOLDFAST_RECONCILE_INTERVAL_MS")?;
                Duration::from_millis(ms.max(1))
            }
            Err(_) => DEFAULT_RECONCILE_INTERVAL,
        };

        let log_level = std::env::var("HOLDFAST_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        let backup_target = std::env::var("HOLDFAST_BACKUP_TARGET")
            .ok()
            .filter(|v| !v.is_empty());

        Ok(Self {
            listen_addr,
            node_id,
            node_address,
            data_dir,
            disk_capacity,
            reconcile_interval,
            log_level,
            backup_target,
        })
    }
}
