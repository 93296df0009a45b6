use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use rust_chord_kvs::config::NodeConfig;
use rust_chord_kvs::console::{self, Command};
use rust_chord_kvs::endpoints::{self, HttpPeerClient};
use rust_chord_kvs::{stabilizer, ChordNode};

/// One member of a Chord key/value ring.
#[derive(Parser, Debug)]
#[command(name = "rust_chord_kvs", version, about)]
struct Cli {
    /// Address to bind and advertise
    #[arg(long, env = "CHORD_HOST", default_value = "127.0.0.1")]
    host: String,

    #[arg(long, env = "CHORD_PORT", default_value_t = 50051)]
    port: u16,

    /// host:port of a ring member to join through
    #[arg(long, env = "CHORD_BOOTSTRAP")]
    bootstrap: Option<String>,

    #[arg(long, env = "CHORD_STABILIZE_INTERVAL_MS")]
    stabilize_interval_ms: Option<u64>,

    #[arg(long, env = "CHORD_RPC_TIMEOUT_MS")]
    rpc_timeout_ms: Option<u64>,

    /// Log filter, e.g. `info` or `rust_chord_kvs=debug`; RUST_LOG wins when set
    #[arg(long, env = "CHORD_LOG_LEVEL", default_value = "info")]
    log_level: String,
}

impl Cli {
    fn node_config(&self) -> NodeConfig {
        let mut config = NodeConfig::new(format!("{}:{}", self.host, self.port));
        config.bootstrap = self.bootstrap.clone();
        if let Some(ms) = self.stabilize_interval_ms {
            config.stabilize_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = self.rpc_timeout_ms {
            config.rpc_timeout = Duration::from_millis(ms);
        }
        config
    }
}

fn init_logging(default_filter: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_file(true)
        .with_line_number(true)
        .with_target(false)
        .init();
}

// reads operator commands from stdin until `quit`; a closed stdin leaves the
// node running headless
async fn run_console(node: Arc<ChordNode>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => return std::future::pending().await,
            Err(err) => {
                warn!(%err, "stdin unreadable, console disabled");
                return std::future::pending().await;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        let command = match line.parse::<Command>() {
            Ok(command) => command,
            Err(err) => {
                println!("{err}");
                continue;
            }
        };
        let quit = command == Command::Quit;
        match console::execute(&node, command).await {
            Ok(out) => println!("{out}"),
            Err(err) => println!("error: {err}"),
        }
        if quit {
            break;
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(&cli.log_level);

    let config = cli.node_config();
    let peers = match HttpPeerClient::new(config.rpc_timeout) {
        Ok(peers) => Arc::new(peers),
        Err(err) => {
            error!(%err, "could not build the peer client");
            std::process::exit(1);
        }
    };
    let node = ChordNode::new(config.clone(), peers);
    info!(node = %node.identity, "node started");

    let server = tokio::spawn({
        let node = Arc::clone(&node);
        let host = cli.host.clone();
        let port = cli.port;
        async move { endpoints::rest_api_server_start(node, &host, port).await }
    });
    tokio::spawn(stabilizer::stabilize_loop(Arc::clone(&node)));

    if let Some(bootstrap) = config.bootstrap.as_deref() {
        // give the server a moment to bind before peers call back
        tokio::time::sleep(Duration::from_millis(500)).await;
        if let Err(err) = node.join(bootstrap).await {
            warn!(%err, bootstrap, "join failed, running as a single node ring");
        }
    }

    tokio::select! {
        _ = run_console(Arc::clone(&node)) => {
            info!("console closed, shutting down");
        }
        res = server => {
            match res {
                Ok(Ok(())) => info!("rpc server stopped"),
                Ok(Err(err)) => error!(%err, "rpc server failed"),
                Err(err) => error!(%err, "rpc server task panicked"),
            }
        }
    }
}
