//! `raftkv-cli` bootstraps and runs a single `raftkv` cluster node: parse
//! flags, load [`config::ClusterConfig`], init logging, wire the backend,
//! Raft node, apply pipeline, lease sweeper and watch engine together, and
//! block until shutdown.

pub mod config;
pub mod trace;
