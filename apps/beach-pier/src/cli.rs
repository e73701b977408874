use clap::{Args, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(
    name = "beach-pier",
    author,
    version,
    about = "Pairs anonymous clients and relays their WebRTC signaling"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    #[command(flatten)]
    pub serve: ServeArgs,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Connect to a running pier, request a match and report the pairing
    Probe {
        /// WebSocket endpoint of the pier
        #[arg(short, long, default_value = "ws://127.0.0.1:4000/ws")]
        url: String,

        /// How long to wait for a partner before giving up
        #[arg(long, default_value_t = 30)]
        timeout_secs: u64,
    },
}

#[derive(Args, Debug, Clone)]
pub struct ServeArgs {
    /// Address to bind the HTTP and websocket listener to.
    #[arg(long, env = "BEACH_PIER_LISTEN_ADDR", default_value = "0.0.0.0:4000")]
    pub listen_addr: String,

    /// Outbound messages buffered per connection before new ones are dropped.
    #[arg(long, env = "BEACH_PIER_CONNECTION_BUFFER", default_value_t = 64)]
    pub connection_buffer: usize,

    /// Tell the remaining member of a session when its peer disconnects.
    #[arg(long, env = "BEACH_PIER_NOTIFY_PEER_LEFT", default_value_t = false)]
    pub notify_peer_left: bool,

    /// Evict clients that wait longer than this for a partner. Unset waits forever.
    #[arg(long, env = "BEACH_PIER_QUEUE_TIMEOUT_SECS")]
    pub queue_timeout_secs: Option<u64>,

    /// How often the queue reaper runs when a queue timeout is set.
    #[arg(long, env = "BEACH_PIER_REAP_INTERVAL_SECS", default_value_t = 30)]
    pub reap_interval_secs: u64,

    /// Grace period applied during shutdown.
    #[arg(long, env = "BEACH_PIER_SHUTDOWN_GRACE_SECS", default_value_t = 5)]
    pub shutdown_grace_secs: u64,
}
