mod cli;

use std::net::{Ipv4Addr, SocketAddrV4};
use std::time::Duration;

use clap::Parser;
use cli::{Cli, Command};
use tokio::net::UdpSocket;
use tracing::{error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use udp_tunneler::transport::{resolve_interface, run_capture, MulticastReceiver};
use udp_tunneler::{Client, Result, Server, TunnelConfig, TunnelError};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(&cli.global.log_level);

    if let Err(e) = run(cli).await {
        error!("Error: {}", e);
        std::process::exit(1);
    }
}

/// Install a stderr subscriber filtered by `RUST_LOG`, or by `level` when
/// it is unset.
fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
        .init();
}

async fn run(cli: Cli) -> Result<()> {
    let config = cli.tunnel_config()?;

    match cli.command {
        Command::Server { listen, .. } => run_server(&listen, config).await,
        Command::Client {
            server,
            group,
            interface,
        } => run_client(&server, group, interface, config).await,
        Command::Ping { group, interval_ms } => {
            run_ping(group, Duration::from_millis(interval_ms)).await
        }
    }
}

async fn run_server(listen: &str, config: TunnelConfig) -> Result<()> {
    let server = Server::bind(listen, config).await?;
    server.run().await
}

async fn run_client(
    server: &str,
    group: SocketAddrV4,
    interface: Option<String>,
    config: TunnelConfig,
) -> Result<()> {
    let interface = interface.as_deref().map(resolve_interface).transpose()?;
    let max_datagram_size = config.max_datagram_size;
    let client = Client::connect(server, config).await?;
    let receiver = MulticastReceiver::join(group, interface).await?;

    let sender = client.sender();
    let pool = client.pool().clone();
    let capture = tokio::spawn(async move {
        run_capture(&receiver, &pool, &sender, max_datagram_size).await
    });

    match client.wait_for_shutdown().await {
        // The multiplexer only stops cleanly once capture has dropped its sender.
        Ok(_) => match capture.await {
            Ok(Err(e)) => Err(e),
            _ => Err(TunnelError::ConnectionClosed),
        },
        Err(e) => {
            capture.abort();
            Err(e)
        }
    }
}

async fn run_ping(group: SocketAddrV4, interval: Duration) -> Result<()> {
    let socket = UdpSocket::bind(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0)).await?;
    socket.connect(group).await?;
    info!(%group, "Starting ping loop");

    let mut ticker = tokio::time::interval(interval);
    let mut count = 0u64;
    loop {
        ticker.tick().await;
        count += 1;
        info!("Sending ping [{}]", count);
        socket
            .send(format!("hello, world [{}]", count).as_bytes())
            .await?;
    }
}
