//! Autopolicy decider - main entry point

use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::filter::LevelFilter;

use autopolicy_decider::{api, Db, Decider, Resolver};

#[derive(Parser)]
#[command(name = "ap-decider")]
#[command(version)]
#[command(about = "Autopolicy decider: identity verification and profile resolution")]
struct Opts {
    /// Debugging level
    #[arg(long, default_value_t = 2)]
    dbg: u8,

    /// My identity, e.g. name of this host
    #[arg(long, default_value_t = default_me())]
    me: String,

    /// Listen on given HTTP endpoint
    #[arg(long, default_value = ":30000")]
    http: String,

    /// Path to filesystem database
    #[arg(long, default_value = "./db")]
    db: String,

    /// Automatically add first seen MAC on a port
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    auto: bool,

    /// Fix missing keys in identities (use old values)
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    fix: bool,
}

fn default_me() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "decider".into())
}

fn init_tracing(dbg: u8) {
    let level = match dbg {
        0 => LevelFilter::ERROR,
        1 => LevelFilter::WARN,
        2 => LevelFilter::INFO,
        3 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .init();
}

/// A bare `:port` endpoint listens on all interfaces.
fn listen_addr(endpoint: &str) -> String {
    if let Some(port) = endpoint.strip_prefix(':') {
        format!("0.0.0.0:{port}")
    } else {
        endpoint.to_string()
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let opts = Opts::parse();
    init_tracing(opts.dbg);

    tracing::info!("ap-decider {} starting on {}", env!("CARGO_PKG_VERSION"), opts.me);

    let db = Arc::new(Db::open(&opts.db, opts.auto, opts.fix)?);
    let resolver = Resolver::new(db.clone())?;
    let decider = Arc::new(Decider {
        me: opts.me,
        db,
        resolver,
    });

    let addr = listen_addr(&opts.http);
    tracing::info!("starting HTTP API at http://{addr}/");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, api::build_router(decider)).await?;

    Ok(())
}
