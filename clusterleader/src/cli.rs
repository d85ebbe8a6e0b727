use std::{io::IsTerminal, time::Duration};

use anyhow::{Error, Result};
use clap::{Parser, Subcommand};
use clusterleader_lock::ConsulConfig;

#[derive(Parser, Debug)]
#[command(name = "clusterleader")]
#[command(bin_name = "clusterleader")]
pub struct Cli {
    /// Consul agent address, optionally with an http:// or https:// prefix
    #[arg(long, env = "CONSUL_HTTP_ADDR")]
    pub consul_addr: Option<String>,

    /// Consul ACL token
    #[arg(long, env = "CONSUL_HTTP_TOKEN", hide_env_values = true)]
    pub consul_token: Option<String>,

    #[arg(long, env = "CONSUL_DATACENTER")]
    pub datacenter: Option<String>,

    #[arg(long, env)]
    pub no_ansi: bool,

    #[command(subcommand)]
    pub commands: Commands,
}

impl Cli {
    pub fn ansi(&self) -> bool {
        !self.no_ansi && std::io::stderr().is_terminal()
    }

    /// Consul settings from the environment, overridden by flags.
    pub fn consul_config(&self) -> ConsulConfig {
        let mut config = ConsulConfig::from_env();
        if let Some(addr) = &self.consul_addr {
            config.set_address(addr);
        }
        if let Some(token) = &self.consul_token {
            config.token = Some(token.to_owned());
        }
        if let Some(dc) = &self.datacenter {
            config.datacenter = Some(dc.to_owned());
        }
        config
    }

    pub fn version(&self) -> bool {
        matches!(self.commands, Commands::Version)
    }
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Contend for leadership on a key until interrupted
    Elect {
        #[arg(long, short = 'k')]
        key: String,

        /// Identity of this node, stored with the lock
        #[arg(long, short = 'n', env = "HOSTNAME")]
        node: String,

        /// Session TTL and delay between failed attempts
        #[arg(long = "wait-time-secs", default_value = "15")]
        wait_time_secs: u64,
    },

    /// Take a named lock once, hold it, then release it
    Lock {
        #[arg(long, short = 'p', default_value = "locks")]
        prefix: String,

        #[arg(long, short = 'k')]
        key: String,

        /// Identifies the holder, defaults to the hostname
        #[arg(long, short = 'v', env = "HOSTNAME")]
        value: String,

        #[arg(long = "ttl-secs", default_value = "30")]
        ttl_secs: u64,

        /// How long to wait for a current holder to let go
        #[arg(long = "wait-secs", default_value = "1")]
        wait_secs: u64,

        /// Hold the lock this long; until interrupted when omitted
        #[arg(long = "hold-secs")]
        hold_secs: Option<u64>,
    },
    Version,
}

pub(crate) fn secs(value: u64, name: &str) -> Result<Duration> {
    if value == 0 {
        return Err(Error::msg(format!("{} must be positive", name)));
    }
    Ok(Duration::from_secs(value))
}
