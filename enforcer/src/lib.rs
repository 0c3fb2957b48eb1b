//! Autopolicy enforcer, the per-host agent.
//!
//! Watches wired links for new devices, fetches each device's
//! identity description, asks the decider for a traffic profile and
//! installs kernel traffic-control rules accordingly.

pub mod device;
pub mod http;
pub mod lifecycle;
pub mod sniffer;
pub mod tc;
pub mod template;

use std::sync::Arc;

use tokio::sync::mpsc;

use device::DeviceTable;
use http::HttpClient;
use sniffer::SnifferMsg;
use tc::TcDriver;
use template::Template;

/// The enforcer's long-lived state, shared with lifecycle workers.
pub struct Enforcer {
    /// This host's identity, inserted as `@switch`.
    pub me: String,
    /// Identity URL template (HTTP GET).
    pub auth_query: Template,
    /// Authorization URL template (HTTP POST).
    pub authz_query: Template,
    pub http: HttpClient,
    pub tc: TcDriver,
}

/// The main loop: fan sniffer events into per-device lifecycle
/// workers. The device table is owned here; workers only ever hold
/// `Arc<Device>` handles.
pub async fn run_loop(enf: Arc<Enforcer>, mut events: mpsc::Receiver<SnifferMsg>) {
    let mut table = DeviceTable::new();

    while let Some(msg) = events.recv().await {
        tracing::trace!("sniffer: seen PORT/MAC/IP: {}/{}/{}", msg.iface, msg.mac, msg.ip);

        if let Some(dev) = table.note(&msg.iface, msg.mac, msg.ip, std::time::Instant::now()) {
            let enf = Arc::clone(&enf);
            tokio::spawn(lifecycle::run(enf, dev));
        }
    }
}
