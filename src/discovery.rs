//! UDP peer discovery.
//!
//! Before any TLS session exists, the device waiting to be found broadcasts
//! a plaintext datagram every 300 ms on a fixed port; the device looking for
//! peers binds the same port and surfaces each distinct sender. The payload
//! format `tcp://<ipv4>:<port>|<deviceName>` is shared with the QR pairing
//! path, so a discovered entry carries the raw datagram for a later connect.

use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::DISCOVERY_PORT;
use crate::error::TransferError;

const MAX_DATAGRAM: usize = 512;

/// A connectable peer surfaced by discovery or a scanned QR code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerAnnouncement {
    pub host: Ipv4Addr,
    pub port: u16,
    pub device_name: String,
    /// The full datagram/QR payload, kept so a connect action can replay it.
    pub raw: String,
}

impl PeerAnnouncement {
    pub fn new(host: Ipv4Addr, port: u16, device_name: &str) -> Self {
        Self {
            host,
            port,
            device_name: device_name.to_string(),
            raw: format!("tcp://{host}:{port}|{device_name}"),
        }
    }

    /// Parses `tcp://<ipv4>:<port>|<deviceName>`.
    pub fn parse(payload: &str) -> Result<Self, TransferError> {
        let invalid = || TransferError::InvalidPayload(payload.to_string());

        let rest = payload.strip_prefix("tcp://").ok_or_else(invalid)?;
        let (addr, device_name) = rest.split_once('|').ok_or_else(invalid)?;
        let (host, port) = addr.split_once(':').ok_or_else(invalid)?;

        if device_name.is_empty() {
            return Err(invalid());
        }
        Ok(Self {
            host: host.parse().map_err(|_| invalid())?,
            port: port.parse().map_err(|_| invalid())?,
            device_name: device_name.to_string(),
            raw: payload.to_string(),
        })
    }

    pub fn payload(&self) -> &str {
        &self.raw
    }
}

/// Best-effort local IPv4 via the UDP connect trick; no packet is sent.
pub async fn local_ip() -> Result<Ipv4Addr, TransferError> {
    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    socket.connect("8.8.8.8:80").await?;
    match socket.local_addr()?.ip() {
        IpAddr::V4(ip) => Ok(ip),
        IpAddr::V6(_) => Err(TransferError::ProtocolError(
            "no local IPv4 address".to_string(),
        )),
    }
}

/// Subnet broadcast address, assuming a /24 when the netmask is unknown;
/// falls back to the limited broadcast address.
fn broadcast_addr(local: Option<Ipv4Addr>) -> Ipv4Addr {
    match local {
        Some(ip) if ip.is_private() => {
            let [a, b, c, _] = ip.octets();
            Ipv4Addr::new(a, b, c, 255)
        }
        _ => Ipv4Addr::BROADCAST,
    }
}

/// Announces this device on the discovery port until dropped or stopped.
pub struct Broadcaster {
    task: JoinHandle<()>,
}

impl Broadcaster {
    /// Starts broadcasting `announcement` every `interval`.
    pub async fn start(
        announcement: PeerAnnouncement,
        interval: Duration,
    ) -> Result<Self, TransferError> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket.set_broadcast(true)?;

        let target = SocketAddr::new(
            IpAddr::V4(broadcast_addr(Some(announcement.host))),
            DISCOVERY_PORT,
        );
        info!(%target, payload = %announcement.payload(), "starting discovery broadcast");

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if let Err(e) = socket
                    .send_to(announcement.payload().as_bytes(), target)
                    .await
                {
                    warn!(error = %e, "discovery broadcast failed");
                }
            }
        });
        Ok(Self { task })
    }

    pub fn stop(self) {
        self.task.abort();
    }
}

impl Drop for Broadcaster {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Device-name deduplication: two datagrams announcing the same name
/// surface a single peer entry, however often they repeat.
#[derive(Debug, Default)]
struct Deduper {
    seen: HashSet<String>,
}

impl Deduper {
    fn first_sighting(&mut self, device_name: &str) -> bool {
        self.seen.insert(device_name.to_string())
    }
}

/// Listens on the discovery port and surfaces each distinct peer once.
pub struct Listener {
    task: JoinHandle<()>,
}

impl Listener {
    /// Binds the discovery port and forwards deduplicated announcements on
    /// the returned channel until dropped.
    pub async fn start() -> Result<(Self, mpsc::Receiver<PeerAnnouncement>), TransferError> {
        let socket = UdpSocket::bind(("0.0.0.0", DISCOVERY_PORT)).await?;
        info!(port = DISCOVERY_PORT, "listening for nearby devices");

        let (tx, rx) = mpsc::channel(16);
        let task = tokio::spawn(async move {
            let mut buf = [0u8; MAX_DATAGRAM];
            let mut deduper = Deduper::default();
            loop {
                let (len, from) = match socket.recv_from(&mut buf).await {
                    Ok(received) => received,
                    Err(e) => {
                        warn!(error = %e, "discovery receive failed");
                        continue;
                    }
                };
                let payload = String::from_utf8_lossy(&buf[..len]);
                let announcement = match PeerAnnouncement::parse(&payload) {
                    Ok(announcement) => announcement,
                    Err(e) => {
                        debug!(%from, error = %e, "ignoring malformed datagram");
                        continue;
                    }
                };
                if !deduper.first_sighting(&announcement.device_name) {
                    continue;
                }
                info!(device = %announcement.device_name, %from, "discovered peer");
                if tx.send(announcement).await.is_err() {
                    break;
                }
            }
        });
        Ok((Self { task }, rx))
    }

    pub fn stop(self) {
        self.task.abort();
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.task.abort();
    }
}
