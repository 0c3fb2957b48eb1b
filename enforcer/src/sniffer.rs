//! Passive link-layer sniffer.
//!
//! One capture thread per interface reads raw Ethernet frames and
//! emits `(iface, mac, ip)` events for inbound ARP and NDP Neighbor
//! Solicitation traffic. Emission is de-duplicated per interface and
//! pushed into a bounded channel consumed by the main loop.

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::mem;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::time::{Duration, Instant};

use tokio::sync::mpsc;

/// Channel depth between the sniffers and the main loop.
pub const CHANNEL_DEPTH: usize = 100;

/// A `(mac, ip)` pair is suppressed for this long after emission.
const DEDUP_TTL: Duration = Duration::from_secs(60);
/// Upper bound on the per-interface dedup table.
const DEDUP_MAX: usize = 1_000_000;
/// Backoff between capture-handle reopen attempts.
const REOPEN_DELAY: Duration = Duration::from_secs(1);

const ETHERTYPE_VLAN: u16 = 0x8100;
const ETHERTYPE_QINQ: u16 = 0x88a8;
const ETHERTYPE_ARP: u16 = 0x0806;
const ETHERTYPE_IPV6: u16 = 0x86dd;

/// A 6-byte Ethernet hardware address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MacAddr([u8; 6]);

impl MacAddr {
    pub const fn new(octets: [u8; 6]) -> Self {
        MacAddr(octets)
    }

    pub fn octets(&self) -> [u8; 6] {
        self.0
    }

    pub fn is_broadcast(&self) -> bool {
        self.0 == [0xff; 6]
    }

    /// The IPv4 multicast MAC prefix `01:00:5e`.
    pub fn is_ipv4_multicast(&self) -> bool {
        self.0[0] == 0x01 && self.0[1] == 0x00 && self.0[2] == 0x5e
    }

    /// The IPv6 multicast MAC prefix `33:33`.
    pub fn is_ipv6_multicast(&self) -> bool {
        self.0[0] == 0x33 && self.0[1] == 0x33
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let o = &self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            o[0], o[1], o[2], o[3], o[4], o[5]
        )
    }
}

/// One observed device appearance.
#[derive(Debug, Clone)]
pub struct SnifferMsg {
    pub iface: String,
    pub mac: MacAddr,
    pub ip: IpAddr,
}

/// An address usable as a device identity endpoint.
///
/// Mirrors the stdlib's unstable global checks: excludes unspecified,
/// loopback, link-local, multicast and (for IPv4) broadcast addresses.
pub(crate) fn is_global_unicast(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            !v4.is_unspecified()
                && !v4.is_loopback()
                && !v4.is_link_local()
                && !v4.is_multicast()
                && !v4.is_broadcast()
        }
        IpAddr::V6(v6) => {
            !v6.is_unspecified()
                && !v6.is_loopback()
                && !v6.is_multicast()
                && (v6.segments()[0] & 0xffc0) != 0xfe80
        }
    }
}

/// Inside `2000::/3`, the globally routed IPv6 space.
fn in_global_v6_range(v6: &Ipv6Addr) -> bool {
    (v6.segments()[0] & 0xe000) == 0x2000
}

/// Extract `(source mac, advertised ip)` from one Ethernet frame, or
/// `None` when the frame is not an ARP / NDP-NS advertisement.
fn parse_frame(pkt: &[u8]) -> Option<(MacAddr, IpAddr)> {
    if pkt.len() < 34 {
        return None;
    }

    let mut mac = [0u8; 6];
    mac.copy_from_slice(&pkt[6..12]);
    let mac = MacAddr::new(mac);

    let etype = u16::from_be_bytes([pkt[12], pkt[13]]);
    if etype == ETHERTYPE_VLAN || etype == ETHERTYPE_QINQ {
        return None; // tagged frames are not ours to inspect
    }
    if etype < 0x0600 {
        return None; // 802.3 length field
    }

    let ip = match etype {
        ETHERTYPE_ARP => {
            // sender protocol address of the ARP payload
            IpAddr::V4(Ipv4Addr::new(pkt[28], pkt[29], pkt[30], pkt[31]))
        }
        ETHERTYPE_IPV6 => {
            // only ICMPv6 Neighbor Solicitation frames count
            if pkt.len() < 55 || pkt[20] != 58 || pkt[54] != 135 {
                return None;
            }
            let mut oct = [0u8; 16];
            oct.copy_from_slice(&pkt[22..38]);
            IpAddr::V6(Ipv6Addr::from(oct))
        }
        _ => return None,
    };

    Some((mac, ip))
}

/// The per-interface short-term suppression table.
struct DedupTable {
    seen: HashMap<(MacAddr, IpAddr), Instant>,
}

impl DedupTable {
    fn new() -> Self {
        DedupTable {
            seen: HashMap::new(),
        }
    }

    /// Record an observation; `true` when it should be emitted.
    fn note(&mut self, mac: MacAddr, ip: IpAddr, now: Instant) -> bool {
        let key = (mac, ip);
        if let Some(&last) = self.seen.get(&key) {
            if now < last + DEDUP_TTL {
                return false;
            }
        } else if self.seen.len() >= DEDUP_MAX {
            // full: evict an arbitrary entry
            if let Some(&victim) = self.seen.keys().next() {
                self.seen.remove(&victim);
            }
        }
        self.seen.insert(key, now);
        true
    }
}

/// A raw `AF_PACKET` capture handle bound to one interface.
struct Capture {
    fd: OwnedFd,
}

impl Capture {
    fn open(iface: &str) -> io::Result<Capture> {
        let proto = (libc::ETH_P_ALL as u16).to_be();

        let raw = unsafe { libc::socket(libc::AF_PACKET, libc::SOCK_RAW, proto as i32) };
        if raw < 0 {
            return Err(io::Error::last_os_error());
        }
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };

        let index = nix::net::if_::if_nametoindex(iface)
            .map_err(|e| io::Error::from_raw_os_error(e as i32))?;

        let mut addr: libc::sockaddr_ll = unsafe { mem::zeroed() };
        addr.sll_family = libc::AF_PACKET as u16;
        addr.sll_protocol = proto;
        addr.sll_ifindex = index as i32;

        let rc = unsafe {
            libc::bind(
                fd.as_raw_fd(),
                &addr as *const libc::sockaddr_ll as *const libc::sockaddr,
                mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }

        // we only care about inbound traffic; not fatal on old kernels
        let one: libc::c_int = 1;
        let rc = unsafe {
            libc::setsockopt(
                fd.as_raw_fd(),
                libc::SOL_PACKET,
                libc::PACKET_IGNORE_OUTGOING,
                &one as *const libc::c_int as *const libc::c_void,
                mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            tracing::debug!("{iface}: PACKET_IGNORE_OUTGOING not supported");
        }

        Ok(Capture { fd })
    }

    fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        let n = unsafe {
            libc::recv(
                self.fd.as_raw_fd(),
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
                0,
            )
        };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(n as usize)
    }
}

/// Whether the interface is plain Ethernet (`ARPHRD_ETHER`).
pub fn is_ethernet(iface: &str) -> bool {
    std::fs::read_to_string(format!("/sys/class/net/{iface}/type"))
        .map(|t| t.trim() == "1")
        .unwrap_or(false)
}

/// Capture loop for one interface. Runs on a blocking thread until
/// the output channel closes; capture errors re-open the handle with
/// a short backoff.
pub fn run(iface: String, out: mpsc::Sender<SnifferMsg>) {
    let mut buf = [0u8; 2048];
    let mut reported_err = false;

    loop {
        let capture = match Capture::open(&iface) {
            Ok(capture) => {
                reported_err = false;
                capture
            }
            Err(err) => {
                if !reported_err {
                    tracing::warn!("{iface}: opening capture failed: {err}");
                    reported_err = true;
                }
                std::thread::sleep(REOPEN_DELAY);
                continue;
            }
        };

        // fresh suppression state for this handle
        let mut dedup = DedupTable::new();

        loop {
            let n = match capture.recv(&mut buf) {
                Ok(n) => n,
                Err(err) => {
                    tracing::warn!("{iface}: capture read failed: {err}");
                    break;
                }
            };

            let Some((mac, ip)) = parse_frame(&buf[..n]) else {
                continue;
            };

            if mac.is_broadcast() || mac.is_ipv4_multicast() || mac.is_ipv6_multicast() {
                continue;
            }
            if !is_global_unicast(&ip) {
                tracing::trace!("{iface}: MAC {mac}: ignoring IP {ip}");
                continue;
            }
            if let IpAddr::V6(v6) = ip {
                if !in_global_v6_range(&v6) {
                    tracing::trace!("{iface}: MAC {mac}: ignoring IP {ip}");
                    continue;
                }
            }

            if !dedup.note(mac, ip, Instant::now()) {
                continue;
            }

            let msg = SnifferMsg {
                iface: iface.clone(),
                mac,
                ip,
            };
            if out.blocking_send(msg).is_err() {
                return; // main loop is gone
            }
        }

        std::thread::sleep(REOPEN_DELAY);
    }
}
