//! Per-device state.
//!
//! The main loop owns a table keyed by `(iface, mac)`. Entries are
//! created on first sight and never removed; workers receive shared
//! handles and mutate only the status behind its lock.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;

use crate::sniffer::MacAddr;

/// How long a device may sit in NEEDS_AUTH before the scheduled
/// worker must have picked it up.
pub const NEEDS_AUTH_WINDOW: Duration = Duration::from_secs(5);

/// Lifecycle states. The numeric codes appear in log output and are
/// kept in this order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    Off = 0,
    NeedsAuth = 1,
    InAuth = 2,
    Authenticated = 3,
    InAuthz = 4,
    Authorized = 5,
    InProv = 6,
    On = 7,
}

impl DeviceState {
    pub fn code(self) -> u8 {
        self as u8
    }
}

/// The mutable half of a device entry.
#[derive(Debug, Clone)]
pub struct DeviceStatus {
    /// Last seen IP address.
    pub lastip: IpAddr,
    pub state: DeviceState,
    /// When the current state was entered.
    pub since: Instant,
    /// When the current state expires.
    pub timeout: Instant,
}

/// One `(iface, mac)` entry.
pub struct Device {
    pub iface: String,
    pub mac: MacAddr,
    /// Human-readable id for log lines.
    pub tag: String,
    /// Chain number reserved for this device in the TC back-end,
    /// unique for the process lifetime.
    pub tc_chain: u32,
    pub status: RwLock<DeviceStatus>,
}

impl Device {
    /// Snapshot `(state, timeout, lastip)` for use around external
    /// calls.
    pub fn snapshot(&self) -> (DeviceState, Instant, IpAddr) {
        let status = self.status.read();
        (status.state, status.timeout, status.lastip)
    }

    /// Commit a state transition: `(state, since=now, timeout=now+t)`.
    pub fn move_state(&self, state: DeviceState, timeout: Duration) {
        let now = Instant::now();
        let mut status = self.status.write();
        status.state = state;
        status.since = now;
        status.timeout = now + timeout;
        tracing::debug!("{}: state {}", self.tag, state.code());
    }
}

/// The device table, owned and mutated only by the main loop.
#[derive(Default)]
pub struct DeviceTable {
    devices: HashMap<(String, MacAddr), Arc<Device>>,
}

impl DeviceTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn get(&self, iface: &str, mac: MacAddr) -> Option<&Arc<Device>> {
        self.devices.get(&(iface.to_string(), mac))
    }

    /// Process one sniffer event.
    ///
    /// Creates the entry on first sight, updates `lastip`, and decides
    /// whether a new lifecycle attempt is due. Returns the device when
    /// the caller must spawn exactly one worker; `None` while the
    /// previous attempt's state is still within its timeout.
    pub fn note(
        &mut self,
        iface: &str,
        mac: MacAddr,
        ip: IpAddr,
        now: Instant,
    ) -> Option<Arc<Device>> {
        let key = (iface.to_string(), mac);

        if let Some(device) = self.devices.get(&key).cloned() {
            // the write lock spans the whole read-decide-write
            // sequence, so a racing worker cannot slip a transition
            // in between
            let mut status = device.status.write();

            if status.lastip != ip {
                tracing::info!(
                    "{}: updating IP address: {} -> {ip} (state {})",
                    device.tag,
                    status.lastip,
                    status.state.code()
                );
                status.lastip = ip;
            }

            // previous attempt still running or resting
            if now < status.timeout {
                return None;
            }
            tracing::debug!(
                "{}: state {} timeout after {}s",
                device.tag,
                status.state.code(),
                now.duration_since(status.since).as_secs()
            );

            status.state = DeviceState::NeedsAuth;
            status.since = now;
            status.timeout = now + NEEDS_AUTH_WINDOW;
            drop(status);
            return Some(device);
        }

        let tc_chain = (self.devices.len() + 1) as u32;
        let device = Arc::new(Device {
            iface: iface.to_string(),
            mac,
            tag: format!("[{iface}/{mac}]"),
            tc_chain,
            status: RwLock::new(DeviceStatus {
                lastip: ip,
                state: DeviceState::NeedsAuth,
                since: now,
                timeout: now + NEEDS_AUTH_WINDOW,
            }),
        });
        tracing::debug!("{}: new PORT/MAC using IP {ip}", device.tag);
        self.devices.insert(key, device.clone());
        Some(device)
    }
}
