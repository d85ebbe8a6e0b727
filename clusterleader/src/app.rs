use std::time::Duration;

use anyhow::{Error, Result};
use clusterleader_lock::{ConsulClient, Election, LockManager};
use tokio::{select, task::JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::{
    cli::{secs, Commands},
    initialize_stderr_logging, Cli,
};

pub struct App {
    cli: Cli,
}

impl App {
    pub fn new(cli: Cli) -> Result<App> {
        Ok(App { cli })
    }

    #[tracing::instrument(skip_all)]
    pub async fn run(&mut self) -> Result<()> {
        if self.cli.version() {
            println!("clusterleader {}", env!("CARGO_PKG_VERSION"));
            return Ok(());
        }

        initialize_stderr_logging(self.cli.ansi());

        let client = ConsulClient::new(self.cli.consul_config())?;
        info!(consul = client.config().base_url(), "using consul");

        let cancel = CancellationToken::new();
        let ctrl_c_cancel = cancel.clone();
        tokio::spawn(async move {
            select! {
                _ = ctrl_c_cancel.cancelled() => {}
                res = tokio::signal::ctrl_c() => {
                    if let Err(e) = res {
                        warn!(err = %e, "installing ctrl-c handler");
                    }
                    info!("interrupted, shutting down");
                    ctrl_c_cancel.cancel();
                }
            }
        });

        let res = match &self.cli.commands {
            Commands::Elect {
                key,
                node,
                wait_time_secs,
            } => {
                let wait_time = secs(*wait_time_secs, "wait time")?;
                run_election(client, key, node, wait_time, cancel.clone()).await
            }
            Commands::Lock {
                prefix,
                key,
                value,
                ttl_secs,
                wait_secs,
                hold_secs,
            } => {
                let ttl = secs(*ttl_secs, "ttl")?;
                let wait = secs(*wait_secs, "wait")?;
                let hold = hold_secs.map(Duration::from_secs);
                run_lock(client, prefix, key, value, ttl, wait, hold, cancel.clone()).await
            }
            Commands::Version => Ok(()),
        };
        cancel.cancel();
        if let Err(e) = &res {
            error!(err = %e);
        }
        res
    }
}

/// Contend for leadership until cancelled, logging each transition.
#[tracing::instrument(skip_all, fields(key = %key, node = %node), err)]
async fn run_election(
    client: ConsulClient,
    key: &str,
    node: &str,
    wait_time: Duration,
    cancel: CancellationToken,
) -> Result<()> {
    let election = Election::new(client, key, node, wait_time);
    let errors = election.errors();
    let notifications = election.election(cancel.clone())?;

    let mut tasks = JoinSet::new();
    tasks.spawn(async move {
        while let Ok(err) = errors.recv_async().await {
            warn!(%err, "election error");
        }
        Ok::<(), Error>(())
    });

    while let Ok(is_leader) = notifications.recv_async().await {
        if is_leader {
            info!("leader");
        } else {
            info!("not leader");
        }
    }

    election.terminated().await;
    while let Some(res) = tasks.join_next().await {
        res??;
    }
    Ok(())
}

/// Take a named lock, hold it until `hold` elapses, the lock is lost, or
/// the process is interrupted, then release it.
#[allow(clippy::too_many_arguments)]
#[tracing::instrument(skip_all, fields(prefix = %prefix, key = %key), err)]
async fn run_lock(
    client: ConsulClient,
    prefix: &str,
    key: &str,
    value: &str,
    ttl: Duration,
    wait: Duration,
    hold: Option<Duration>,
    cancel: CancellationToken,
) -> Result<()> {
    let locks = LockManager::new(client, prefix, ttl);
    let loss = locks.lock(key, value, wait).await?;
    info!(key, "lock held");

    let hold_elapsed = async {
        match hold {
            Some(hold) => tokio::time::sleep(hold).await,
            None => std::future::pending().await,
        }
    };
    select! {
        _ = cancel.cancelled() => {}
        _ = hold_elapsed => {}
        _ = loss.cancelled() => {
            warn!(key, "lock lost");
            return Err(Error::msg(format!("lock {} lost", key)));
        }
    }

    for (key, err) in locks.unlock_all().await {
        warn!(key, %err, "releasing lock");
    }
    Ok(())
}
