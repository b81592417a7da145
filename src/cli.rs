use std::net::SocketAddrV4;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use udp_tunneler::{Result, TunnelConfig};

#[derive(Parser, Debug, Clone)]
#[command(name = "udptunneler")]
#[command(
    author,
    version,
    about = "Tunnel UDP multicast traffic over a TCP connection"
)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalArgs,

    #[command(subcommand)]
    pub command: Command,
}

/// Options shared by every subcommand.
#[derive(Args, Debug, Clone)]
pub struct GlobalArgs {
    /// JSON configuration file; flags below override its values
    #[arg(short = 'c', long = "config", global = true)]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error), used when RUST_LOG is unset
    #[arg(long = "log-level", default_value = "info", global = true)]
    pub log_level: String,

    /// Seconds of silence before the server drops a connection
    #[arg(long = "heartbeat-timeout", value_name = "SECS", global = true)]
    pub heartbeat_timeout: Option<u64>,

    /// Largest datagram captured or forwarded, in bytes
    #[arg(long = "max-datagram-size", value_name = "BYTES", global = true)]
    pub max_datagram_size: Option<usize>,

    /// Datagrams the client may queue while the connection is slow
    #[arg(long = "queue-capacity", global = true)]
    pub queue_capacity: Option<usize>,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Accept tunnel clients and re-emit their datagrams over UDP
    Server {
        /// Address to listen on
        #[arg(short = 'l', long = "listen", value_name = "ADDR")]
        listen: String,

        /// Send every datagram here instead of its original destination
        #[arg(long = "udp-override", value_name = "IP:PORT")]
        udp_override: Option<SocketAddrV4>,
    },

    /// Capture a multicast group and forward it to a tunnel server
    Client {
        /// Tunnel server address
        #[arg(short = 's', long = "server", value_name = "ADDR")]
        server: String,

        /// Multicast group to capture
        #[arg(short = 'g', long = "group", value_name = "IP:PORT")]
        group: SocketAddrV4,

        /// Interface to join the group on, by name (`eth0`) or IPv4 address
        #[arg(short = 'i', long = "interface", value_name = "NAME|IPV4")]
        interface: Option<String>,
    },

    /// Send numbered test messages to a UDP group
    Ping {
        /// Destination group
        #[arg(short = 'g', long = "group", value_name = "IP:PORT")]
        group: SocketAddrV4,

        /// Milliseconds between messages
        #[arg(
            long = "interval-ms",
            default_value_t = 1000,
            value_parser = clap::value_parser!(u64).range(1..)
        )]
        interval_ms: u64,
    },
}

impl Cli {
    /// Configuration from `--config` with flag overrides applied.
    pub fn tunnel_config(&self) -> Result<TunnelConfig> {
        let mut config = match &self.global.config {
            Some(path) => TunnelConfig::from_json_file(path)?,
            None => TunnelConfig::default(),
        };

        if let Some(secs) = self.global.heartbeat_timeout {
            config = config.heartbeat_timeout(Duration::from_secs(secs));
        }
        if let Some(size) = self.global.max_datagram_size {
            config = config.max_datagram_size(size);
        }
        if let Some(capacity) = self.global.queue_capacity {
            config = config.queue_capacity(capacity);
        }
        if let Command::Server {
            udp_override: Some(addr),
            ..
        } = &self.command
        {
            config = config.udp_override(Some(*addr));
        }

        config.validate()?;
        Ok(config)
    }
}
