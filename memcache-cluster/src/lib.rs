//! Client for clusters of memcached and Couchbase servers speaking the
//! memcached binary protocol.
//!
//! Requests are routed to nodes by a locator, each node keeps a small pool
//! of pipelined connections, and replicated requests report exactly one
//! answer according to their callback policy.
//!
//! - [`codec`] frames requests and responses (24-byte headers, big-endian).
//! - [`request`] holds the request variants and the replica aggregator.
//! - [`transport`] drives one TCP connection: pending FIFO, receive loop,
//!   authentication, reconnects.
//! - [`node`] pools transports behind a ready queue and tracks liveness.
//! - [`locator`] maps keys to nodes (round robin, Ketama, vBucket).
//! - [`cluster`] dispatches requests and applies membership changes.
//! - [`auth`] provides SASL authentication tokens.
//! - [`config`] loads JSON configuration.
//! - [`cli`] and [`commands`] implement the `memcache-cluster` probe binary.

pub mod auth;
pub mod cli;
pub mod cluster;
pub mod codec;
pub mod commands;
pub mod config;
pub mod error;
pub mod locator;
pub mod node;
pub mod request;
pub mod transport;

pub use cluster::Cluster;
pub use error::{Error, Result};
