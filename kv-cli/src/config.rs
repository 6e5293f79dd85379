use std::path::PathBuf;

use serde_derive::{Deserialize, Serialize};

pub const DEFAULT_DATA_DIR: &str = "data/raftkv";

/// Node-bootstrap configuration. Loaded `confy`-style: try the configured
/// file path, fall back to [`ClusterConfig::default`] on any error, and log
/// which one happened.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    pub node_id: u64,

    /// directory the backend and raft log persist under.
    pub data_dir: Option<PathBuf>,

    /// `id=host:port` peers making up the initial voter set. Empty means a
    /// single-voter bootstrap node.
    pub peers: Vec<String>,

    pub election_tick: Option<usize>,
    pub heartbeat_tick: Option<usize>,

    /// number of applied entries between automatic compactions. `None`
    /// disables automatic compaction.
    pub snapshot_threshold: Option<u64>,

    /// serve linearizable reads from the leader's lease instead of a full
    /// ReadIndex round-trip once the lease is warm.
    pub lease_read_enabled: Option<bool>,

    /// join as a witness: replicates the log but never becomes a voter and
    /// never applies to its own backend for serving reads.
    pub witness: Option<bool>,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        ClusterConfig {
            node_id: 1,
            data_dir: Some(PathBuf::from(DEFAULT_DATA_DIR)),
            peers: Vec::new(),
            election_tick: Some(10),
            heartbeat_tick: Some(3),
            snapshot_threshold: Some(10_000),
            lease_read_enabled: Some(true),
            witness: Some(false),
        }
    }
}

impl ClusterConfig {
    pub fn load(path: &str) -> Self {
        match confy::load_path::<ClusterConfig>(path) {
            Ok(cfg) => cfg,
            Err(err) => {
                log::warn!("failed to load config at {path}: {err}, using defaults");
                ClusterConfig::default()
            }
        }
    }

    pub fn get_data_dir(&self) -> PathBuf {
        self.data_dir.clone().unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_DIR))
    }

    pub fn get_election_tick(&self) -> usize {
        self.election_tick.unwrap_or(10)
    }

    pub fn get_heartbeat_tick(&self) -> usize {
        self.heartbeat_tick.unwrap_or(3)
    }

    pub fn is_lease_read_enabled(&self) -> bool {
        self.lease_read_enabled.unwrap_or(true)
    }

    pub fn is_witness(&self) -> bool {
        self.witness.unwrap_or(false)
    }
}
