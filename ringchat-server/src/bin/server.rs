use clap::Parser;
use ringchat_server::{server, DEFAULT_PORT};
use tokio::signal;

#[derive(Parser, Debug)]
#[command(name = "ringchat-server", about = "A replicated group-chat server node")]
struct Args {
    /// Stable identity of this node, defaults to server-<port>
    #[arg(long)]
    id: Option<String>,

    /// TCP port for client and server-to-server connections
    #[arg(long, default_value_t = DEFAULT_PORT)]
    port: u16,
}

#[tokio::main]
pub async fn main() -> ringchat_server::Result<()> {
    tracing_subscriber::fmt::try_init()?;

    let args = Args::parse();
    let port = args.port;
    let id = args.id.unwrap_or_else(|| format!("server-{}", port));

    server::run(id, port, signal::ctrl_c()).await
}
