//! Peer mesh networking module using Chitchat.
//!
//! Tally nodes gossip their share of every window counter to each other.
//! A node's view of a counter is the sum of the live shares it has heard
//! about, which makes the mesh store eventually consistent across nodes.

mod cluster;

pub use cluster::{chitchat_key, Cluster, ClusterConfig, ClusterError, CounterShare};
