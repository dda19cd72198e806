//! codecast-server: WebSocket server for collaborative editing rooms.

use clap::Parser;

use codecast_collab::{ServerConfig, SyncServer};

#[derive(Parser)]
#[command(name = "codecast-server", about = "Room presence and buffer relay for a shared code editor")]
struct Args {
    /// Interface to bind.
    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    /// Port to listen on.
    #[arg(short, long, env = "PORT", default_value_t = 5000)]
    port: u16,

    /// Frames buffered per connection before new ones are dropped.
    #[arg(long, default_value_t = 256)]
    outbox_capacity: usize,

    /// Seconds between heartbeat pings (0 disables).
    #[arg(long, default_value_t = 25)]
    heartbeat_interval: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let config = ServerConfig {
        bind_addr: format!("{}:{}", args.host, args.port),
        outbox_capacity: args.outbox_capacity,
        heartbeat_interval_secs: args.heartbeat_interval,
    };

    SyncServer::new(config).run().await
}
