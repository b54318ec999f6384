//! Proxysync - keeps an HAProxy configuration in sync with discovered backends
//!
//! This library provides a reconciliation engine that:
//! - Discovers backend endpoints from sidecar-style link environment variables
//! - Expands cluster references through a remote membership API, pruning
//!   members that disappeared
//! - Merges the endpoints into a baseline configuration model
//! - Rewrites the on-disk configuration atomically, only when the model changed
//! - Hot-reloads the proxy process, handing off from the old instance to the new

pub mod cluster;
pub mod config;
pub mod discovery;
pub mod error;
pub mod fingerprint;
pub mod model;
pub mod reconcile;
pub mod render;
pub mod supervisor;
pub mod writer;
