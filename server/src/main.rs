use clap::Parser;
use log::{info, warn};
use server::config::{
    ServerConfig, DEFAULT_BURST_READ_TIMEOUT, DEFAULT_IDLE_READ_TIMEOUT, DEFAULT_MAILBOX_CAPACITY,
    DEFAULT_SPAWN_EXTENT, DEFAULT_WRITE_TIMEOUT,
};
use server::network::Server;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Server IP address to bind to
    #[arg(short = 'H', long, default_value = "127.0.0.1")]
    host: String,

    /// Server port to listen on
    #[arg(short, long, default_value = "8080")]
    port: u16,

    /// Snapshot batches a client may have pending before it is dropped
    #[arg(long, default_value_t = DEFAULT_MAILBOX_CAPACITY)]
    mailbox_capacity: usize,

    /// Seconds a connection may stay silent between frames
    #[arg(long, default_value_t = DEFAULT_IDLE_READ_TIMEOUT.as_secs())]
    idle_timeout_secs: u64,

    /// Seconds allowed to finish a frame once its length prefix arrived
    #[arg(long, default_value_t = DEFAULT_BURST_READ_TIMEOUT.as_secs())]
    burst_timeout_secs: u64,

    /// Seconds allowed to write one snapshot frame
    #[arg(long, default_value_t = DEFAULT_WRITE_TIMEOUT.as_secs())]
    write_timeout_secs: u64,

    /// Initial positions are drawn from [0, extent) on both axes
    #[arg(long, default_value_t = DEFAULT_SPAWN_EXTENT)]
    spawn_extent: f64,
}

impl Args {
    fn to_config(&self) -> ServerConfig {
        ServerConfig {
            mailbox_capacity: self.mailbox_capacity,
            idle_read_timeout: Duration::from_secs(self.idle_timeout_secs),
            burst_read_timeout: Duration::from_secs(self.burst_timeout_secs),
            write_timeout: Duration::from_secs(self.write_timeout_secs),
            spawn_extent: self.spawn_extent,
            ..Default::default()
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();
    let address = format!("{}:{}", args.host, args.port);

    let server = Server::bind(&address, args.to_config()).await?;

    server
        .run_until(async {
            match tokio::signal::ctrl_c().await {
                Ok(()) => info!("Received Ctrl+C, shutting down"),
                Err(e) => {
                    warn!("Cannot listen for Ctrl+C ({}), running until killed", e);
                    std::future::pending::<()>().await;
                }
            }
        })
        .await?;

    Ok(())
}
