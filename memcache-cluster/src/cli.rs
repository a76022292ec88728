use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::config::LocatorKind;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(flatten)]
    pub cluster: ClusterArgs,

    #[command(subcommand)]
    pub command: Command,
}

/// Options that shape the cluster. They override the JSON config file.
#[derive(Args, Debug, Clone)]
pub struct ClusterArgs {
    /// JSON configuration file.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Server address; repeat for several nodes.
    #[arg(long = "server", global = true)]
    pub servers: Vec<SocketAddr>,

    #[arg(long, global = true, value_enum)]
    pub locator: Option<LocatorKind>,

    /// Number of additional nodes each keyed request is sent to.
    #[arg(long, global = true)]
    pub replicas: Option<usize>,

    /// SASL PLAIN user, usually the bucket name.
    #[arg(long, global = true)]
    pub user: Option<String>,

    #[arg(long, global = true, requires = "user")]
    pub password: Option<String>,

    /// How long to wait for the nodes to come up before sending.
    #[arg(long, global = true, default_value_t = 2000)]
    pub wait_ms: u64,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Read a value.
    Get { key: String },
    /// Store a value unconditionally.
    Set(StoreArgs),
    /// Store a value only if the key does not exist.
    Add(StoreArgs),
    /// Store a value only if the key exists.
    Replace(StoreArgs),
    Delete { key: String },
    /// Increment a counter, creating it with `initial` if missing.
    Incr(CounterArgs),
    /// Decrement a counter, creating it with `initial` if missing.
    Decr(CounterArgs),
    /// Print server statistics of every node.
    Stats { group: Option<String> },
    /// Round trip a NoOp to every node.
    Ping,
}

#[derive(Args, Debug, Clone)]
pub struct StoreArgs {
    pub key: String,
    pub value: String,

    #[arg(long, default_value_t = 0)]
    pub flags: u32,

    /// Expiration in seconds; 0 never expires.
    #[arg(long, default_value_t = 0)]
    pub ttl: i64,
}

#[derive(Args, Debug, Clone)]
pub struct CounterArgs {
    pub key: String,

    #[arg(long, default_value_t = 1)]
    pub delta: u64,

    #[arg(long, default_value_t = 0)]
    pub initial: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn global_options_parse_after_the_subcommand() {
        let cli = Cli::try_parse_from([
            "memcache-cluster",
            "set",
            "greeting",
            "hello",
            "--ttl",
            "60",
            "--server",
            "127.0.0.1:11211",
            "--server",
            "127.0.0.1:11212",
            "--locator",
            "round-robin",
        ])
        .unwrap();

        assert_eq!(cli.cluster.servers.len(), 2);
        assert_eq!(cli.cluster.locator, Some(LocatorKind::RoundRobin));
        match cli.command {
            Command::Set(args) => {
                assert_eq!(args.key, "greeting");
                assert_eq!(args.ttl, 60);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn password_requires_user() {
        let parsed = Cli::try_parse_from(["memcache-cluster", "ping", "--password", "pw"]);
        assert!(parsed.is_err());
    }
}
