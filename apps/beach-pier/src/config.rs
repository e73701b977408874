use anyhow::{bail, Context, Result};
use std::net::SocketAddr;
use std::time::Duration;

use crate::cli::ServeArgs;
use crate::registry::DEFAULT_CONNECTION_BUFFER;
use crate::switchboard::SwitchboardConfig;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    pub connection_buffer: usize,
    pub switchboard: SwitchboardConfig,
    pub reap_interval: Duration,
    pub shutdown_grace: Duration,
}

impl TryFrom<ServeArgs> for ServerConfig {
    type Error = anyhow::Error;

    fn try_from(args: ServeArgs) -> Result<Self, Self::Error> {
        let listen_addr: SocketAddr = args
            .listen_addr
            .parse()
            .with_context(|| format!("invalid listen address: {}", args.listen_addr))?;
        if args.connection_buffer == 0 {
            bail!("connection buffer must be greater than zero");
        }
        if args.reap_interval_secs == 0 {
            bail!("reap interval must be greater than zero");
        }
        let queue_timeout = match args.queue_timeout_secs {
            Some(0) => bail!("queue timeout must be greater than zero when set"),
            Some(secs) => Some(Duration::from_secs(secs)),
            None => None,
        };

        Ok(ServerConfig {
            listen_addr,
            connection_buffer: args.connection_buffer,
            switchboard: SwitchboardConfig {
                notify_peer_left: args.notify_peer_left,
                queue_timeout,
            },
            reap_interval: Duration::from_secs(args.reap_interval_secs),
            shutdown_grace: Duration::from_secs(args.shutdown_grace_secs),
        })
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 4000)),
            connection_buffer: DEFAULT_CONNECTION_BUFFER,
            switchboard: SwitchboardConfig::default(),
            reap_interval: Duration::from_secs(30),
            shutdown_grace: Duration::from_secs(5),
        }
    }
}
