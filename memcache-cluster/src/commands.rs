//! Runs one CLI command against a cluster and prints the answers.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use tokio::sync::oneshot;
use tokio::time;
use tracing::warn;

use crate::auth::Credentials;
use crate::cli::{Cli, ClusterArgs, Command, CounterArgs, StoreArgs};
use crate::cluster::Cluster;
use crate::codec::Status;
use crate::config::{ClusterConfig, LocatorKind};
use crate::request::{
    ArithmeticRequest, DeleteRequest, Expiration, GetRequest, NoOpRequest, StatRequest,
    StoreMode, StoreRequest,
};

const ANSWER_TIMEOUT: Duration = Duration::from_secs(5);
const VBUCKETS: usize = 1024;

pub async fn run(cli: Cli) -> Result<()> {
    let config = cluster_config(&cli.cluster)?;
    let servers = config.servers.clone();
    let cluster = Cluster::connect(config).context("building cluster")?;

    if cluster.config().locator == LocatorKind::VBucket {
        let table = uniform_vbucket_table(servers.len(), cluster.config().replicas);
        cluster.update_vbucket_map(&servers, table)?;
    }
    if !cluster.wait_until_alive(Duration::from_millis(cli.cluster.wait_ms)).await {
        warn!(wait_ms = cli.cluster.wait_ms, "not every node came up in time");
    }

    let outcome = execute(&cluster, cli.command).await;
    cluster.shutdown().await;
    outcome
}

/// Loads the optional config file and applies command-line overrides.
pub fn cluster_config(args: &ClusterArgs) -> Result<ClusterConfig> {
    let mut config = match &args.config {
        Some(path) => ClusterConfig::from_file(path)?,
        None => ClusterConfig::default(),
    };

    if !args.servers.is_empty() {
        config.servers = args.servers.clone();
    }
    if let Some(locator) = args.locator {
        config.locator = locator;
    }
    if let Some(replicas) = args.replicas {
        config.replicas = replicas;
    }
    if let Some(user) = &args.user {
        config.credentials = Some(Credentials {
            zone: String::new(),
            user: user.clone(),
            password: args.password.clone().unwrap_or_default(),
        });
    }

    if config.servers.is_empty() {
        bail!("no servers configured; pass --server or --config");
    }
    config.validate()?;
    Ok(config)
}

/// A table spreading primaries evenly, replicas on the following servers.
pub fn uniform_vbucket_table(servers: usize, replicas: usize) -> Vec<Vec<i32>> {
    let copies = (replicas + 1).min(servers);
    (0..VBUCKETS)
        .map(|vbucket| {
            (0..copies)
                .map(|offset| ((vbucket + offset) % servers) as i32)
                .collect()
        })
        .collect()
}

async fn execute(cluster: &Cluster, command: Command) -> Result<()> {
    let replicas = cluster.config().replicas;
    let policy = cluster.config().callback_policy;

    match command {
        Command::Get { key } => {
            let (tx, rx) = oneshot::channel();
            let request = GetRequest::new(key, move |status, item| {
                let _ = tx.send((status, item));
            })
            .replicate(replicas, policy);
            cluster.send(Arc::new(request)).await?;

            let (status, item) = answer(rx).await?;
            check(status)?;
            let item = item.ok_or_else(|| anyhow!("server answered without an item"))?;
            println!("{}", String::from_utf8_lossy(&item.data));
        }
        Command::Set(args) => store(cluster, StoreMode::Set, args).await?,
        Command::Add(args) => store(cluster, StoreMode::Add, args).await?,
        Command::Replace(args) => store(cluster, StoreMode::Replace, args).await?,
        Command::Delete { key } => {
            let (tx, rx) = oneshot::channel();
            let request = DeleteRequest::new(key, move |status| {
                let _ = tx.send(status);
            })
            .replicate(replicas, policy);
            cluster.send(Arc::new(request)).await?;

            check(answer(rx).await?)?;
            println!("deleted");
        }
        Command::Incr(args) => counter(cluster, true, args).await?,
        Command::Decr(args) => counter(cluster, false, args).await?,
        Command::Stats { group } => {
            let timeout = cluster.config().send_timeout();
            let mut failures = 0;
            for node in cluster.nodes() {
                let (tx, rx) = oneshot::channel();
                let request = StatRequest::new(group.as_deref(), move |status, stats| {
                    let _ = tx.send((status, stats));
                });
                if let Err(err) = node.try_send(Arc::new(request), timeout).await {
                    println!("{} error: {err}", node.endpoint());
                    failures += 1;
                    continue;
                }
                let (status, stats) = answer(rx).await?;
                if !status.is_ok() {
                    println!("{} {status:?}", node.endpoint());
                    failures += 1;
                    continue;
                }
                for (name, value) in stats {
                    println!("{} {name} {value}", node.endpoint());
                }
            }
            if failures > 0 {
                bail!("{failures} node(s) did not answer");
            }
        }
        Command::Ping => {
            let timeout = cluster.config().send_timeout();
            let mut failures = 0;
            for node in cluster.nodes() {
                let (tx, rx) = oneshot::channel();
                let request = NoOpRequest::new(move |status| {
                    let _ = tx.send(status);
                });
                let outcome = match node.try_send(Arc::new(request), timeout).await {
                    Ok(()) => answer(rx).await,
                    Err(err) => Err(err.into()),
                };
                match outcome {
                    Ok(status) if status.is_ok() => println!("{} ok", node.endpoint()),
                    Ok(status) => {
                        println!("{} {status:?}", node.endpoint());
                        failures += 1;
                    }
                    Err(err) => {
                        println!("{} error: {err:#}", node.endpoint());
                        failures += 1;
                    }
                }
            }
            if failures > 0 {
                bail!("{failures} node(s) did not answer");
            }
        }
    }
    Ok(())
}

async fn store(cluster: &Cluster, mode: StoreMode, args: StoreArgs) -> Result<()> {
    let config = cluster.config();
    let (tx, rx) = oneshot::channel();
    let request = StoreRequest::new(mode, args.key, args.value, move |status| {
        let _ = tx.send(status);
    })
    .with_flags(args.flags)
    .with_expiration(Expiration::from_secs(args.ttl)?)
    .replicate(config.replicas, config.callback_policy);
    cluster.send(Arc::new(request)).await?;

    check(answer(rx).await?)?;
    println!("stored");
    Ok(())
}

async fn counter(cluster: &Cluster, increment: bool, args: CounterArgs) -> Result<()> {
    let config = cluster.config();
    let (tx, rx) = oneshot::channel();
    let callback = move |status: Status, value: u64| {
        let _ = tx.send((status, value));
    };
    let request = if increment {
        ArithmeticRequest::increment(args.key, args.delta, args.initial, callback)
    } else {
        ArithmeticRequest::decrement(args.key, args.delta, args.initial, callback)
    };
    let request = request.replicate(config.replicas, config.callback_policy);
    cluster.send(Arc::new(request)).await?;

    let (status, value) = answer(rx).await?;
    check(status)?;
    println!("{value}");
    Ok(())
}

async fn answer<T>(rx: oneshot::Receiver<T>) -> Result<T> {
    time::timeout(ANSWER_TIMEOUT, rx)
        .await
        .context("timed out waiting for the answer")?
        .context("request dropped without an answer")
}

fn check(status: Status) -> Result<()> {
    if status.is_ok() {
        Ok(())
    } else {
        bail!("server answered {status:?}")
    }
}
