//! tsedge example: drives an [`EdgeConnection`] over the in-process link
//! simulator and prints what the reliability layer did.
//!
//! Run with:
//!   cargo run -p tsedge-example
//!   cargo run -p tsedge-example -- --manual-ack --points 20
//!   cargo run -p tsedge-example -- --log-level tsedge_client=debug
//!
//! [`EdgeConnection`]: tsedge_client::EdgeConnection

use std::time::Duration;

// ---

use clap::Parser;
use tracing_subscriber::EnvFilter;

// ---

use tsedge_client::ConnectionConfig;

mod link_sim_demo;

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[derive(Debug, Parser)]
#[command(
    name = "tsedge-example",
    about = "tsedge reliability demo against a simulated link"
)]
struct Config {
    // ---
    /// Connection name used in log lines.
    #[arg(long, default_value = tsedge_client::config::DEFAULT_NAME)]
    name: String,

    /// Server URL, `scheme://host:port`.
    #[arg(long, default_value = "https://edge.sim:443")]
    server_url: String,

    /// Node id of this client. Falls back to the token source's client id.
    #[arg(long)]
    node_id: Option<String>,

    /// Project the measurement is created under.
    #[arg(long)]
    project_id: Option<String>,

    /// Connect and ping timeout in seconds.
    #[arg(long, default_value_t = 60)]
    connect_timeout_secs: u64,

    /// Response timeout in seconds. 0 waits forever.
    #[arg(long, default_value_t = 120)]
    response_timeout_secs: u64,

    /// Log every sent data point at trace level.
    #[arg(long, default_value_t = false)]
    log_sent: bool,

    /// Log every received data point at trace level.
    #[arg(long, default_value_t = false)]
    log_received: bool,

    /// Points sent by the demo upstream.
    #[arg(long, default_value_t = 10)]
    points: u32,

    /// Acknowledge only half of the chunks so close ends the measurement
    /// instead of completing it.
    #[arg(long, default_value_t = false)]
    manual_ack: bool,

    /// `tracing` filter directive; `RUST_LOG` wins when set.
    #[arg(long, default_value = "info")]
    log_level: String,
}

// ---

impl Config {
    fn connection_config(&self) -> ConnectionConfig {
        // ---
        let mut cfg = ConnectionConfig::new(&self.server_url)
            .with_name(&self.name)
            .with_connect_timeout(Duration::from_secs(self.connect_timeout_secs))
            .with_response_timeout(Duration::from_secs(self.response_timeout_secs))
            .with_data_point_logging(self.log_sent, self.log_received);
        if let Some(node_id) = &self.node_id {
            cfg = cfg.with_node_id(node_id);
        }
        if let Some(project_id) = &self.project_id {
            cfg = cfg.with_project_id(project_id);
        }
        cfg
    }
}

// ---------------------------------------------------------------------------
// main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ---
    let cfg = Config::parse();

    let no_color = std::env::var("EMACS").is_ok()
        || std::env::var("NO_COLOR").is_ok()
        || std::env::var("CARGO_TERM_COLOR").as_deref() == Ok("never")
        || !std::io::IsTerminal::is_terminal(&std::io::stdout());

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&cfg.log_level))?;

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .without_time()
        .with_ansi(!no_color)
        .init();

    let demo = link_sim_demo::DemoOptions {
        points: cfg.points,
        manual_ack: cfg.manual_ack,
    };
    link_sim_demo::run(cfg.connection_config(), demo).await
}
