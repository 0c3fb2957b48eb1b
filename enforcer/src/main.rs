//! Autopolicy enforcer - main entry point

use std::sync::Arc;

use clap::Parser;
use tokio::sync::mpsc;
use tracing_subscriber::filter::LevelFilter;

use autopolicy_enforcer::http::HttpClient;
use autopolicy_enforcer::tc::TcDriver;
use autopolicy_enforcer::template::Template;
use autopolicy_enforcer::{run_loop, sniffer, Enforcer};

#[derive(Parser)]
#[command(name = "ap-enforcer")]
#[command(version)]
#[command(about = "Autopolicy enforcer: per-host network access control")]
struct Opts {
    /// Debugging level
    #[arg(long, default_value_t = 2)]
    dbg: u8,

    /// My identity, e.g. name of this host
    #[arg(long, default_value_t = default_me())]
    me: String,

    /// Authentication query (HTTP GET) used to fetch the identity
    #[arg(long, default_value = "http://<ip>/.autopolicy/identity.json")]
    query: String,

    /// Authorization query (HTTP POST) used to fetch the profile
    #[arg(long, default_value = "http://192.168.100.128:30000/v1/authorize")]
    authz: String,

    /// Interfaces to enforce
    #[arg(required = true)]
    ifaces: Vec<String>,
}

fn default_me() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "enforcer".into())
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

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let opts = Opts::parse();
    init_tracing(opts.dbg);

    tracing::info!("ap-enforcer {} starting on {}", env!("CARGO_PKG_VERSION"), opts.me);

    // compile the target templates, bracketing IPv6 host literals
    let auth_query = Template::parse(&Template::host_rewrite(&opts.query))
        .map_err(|err| format!("--query template invalid: {err}"))?;
    let authz_query = Template::parse(&Template::host_rewrite(&opts.authz))
        .map_err(|err| format!("--authz template invalid: {err}"))?;

    for iface in &opts.ifaces {
        if !sniffer::is_ethernet(iface) {
            return Err(format!("invalid link type on {iface}: not Ethernet").into());
        }
    }

    let tc = TcDriver::new(TcDriver::lookup()?);
    for iface in &opts.ifaces {
        let _ = tc.cleanup(iface).await;
        if let Err(err) = tc.init(iface).await {
            let _ = tc.cleanup(iface).await;
            return Err(format!("tc setup failed: {err}").into());
        }
    }

    let enf = Arc::new(Enforcer {
        me: opts.me,
        auth_query,
        authz_query,
        http: HttpClient::new()?,
        tc,
    });

    // SIGINT: tear down traffic control, then exit cleanly
    {
        let enf = Arc::clone(&enf);
        let ifaces = opts.ifaces.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("SIGINT received, cleanup and exit...");
                for iface in &ifaces {
                    let _ = enf.tc.cleanup(iface).await;
                }
                std::process::exit(0);
            }
        });
    }

    let (tx, rx) = mpsc::channel(sniffer::CHANNEL_DEPTH);
    for iface in opts.ifaces.clone() {
        tracing::info!("starting sniffer on {iface}");
        let tx = tx.clone();
        tokio::task::spawn_blocking(move || sniffer::run(iface, tx));
    }
    drop(tx);

    run_loop(enf, rx).await;
    Ok(())
}
