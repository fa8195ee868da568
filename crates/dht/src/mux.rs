//! Shared UDP socket
//!
//! One bound socket carries both KRPC datagrams and µTP stream segments.
//! The first byte classifies: bencoded KRPC always starts with `d`, a µTP
//! header never does (type nibble ≤ 4, version nibble = 1). KRPC traffic is
//! delivered to the DHT node; µTP segments go to whatever stream layer has
//! attached itself, or are dropped.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use cachecraft_core::{Cancel, Error, Result};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::sync::Mutex;
use tracing::{debug, info, trace, warn};

/// Fallback port when neither settings nor the hint file produce one.
pub const DEFAULT_UDP_PORT: u16 = 28729;
/// Name of the port hint file under the repository root.
pub const LAST_USED_PORT_FILE: &str = "last_used_udp_port";

const MAX_DATAGRAM: usize = 64 * 1024;

/// A received datagram with its sender.
#[derive(Debug, Clone)]
pub struct Datagram {
    pub bytes: Vec<u8>,
    pub from: SocketAddr,
}

/// The shared UDP socket plus the channels it demultiplexes into.
pub struct UdpMultiplexer {
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
    utp_sink: Mutex<Option<mpsc::Sender<Datagram>>>,
}

impl UdpMultiplexer {
    /// Bind, trying in order: the settings port, the port recorded in the
    /// hint file under `repo_root`, the default port, and finally an
    /// ephemeral one. The bound port is written back to the hint file.
    pub async fn bind(repo_root: Option<&Path>, settings_port: Option<u16>) -> Result<Self> {
        let hint_path = repo_root.map(|r| r.join(LAST_USED_PORT_FILE));
        let mut attempts: Vec<(&str, u16)> = Vec::new();
        if let Some(port) = settings_port {
            attempts.push(("settings", port));
        }
        if let Some(port) = hint_path.as_deref().and_then(read_port_hint) {
            attempts.push(("last used", port));
        }
        attempts.push(("default", DEFAULT_UDP_PORT));
        attempts.push(("last resort", 0));

        let mut last_err = None;
        for (attempt, port) in attempts {
            let addr = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port));
            match UdpSocket::bind(addr).await {
                Ok(socket) => {
                    let local_addr = socket.local_addr()?;
                    info!(%attempt, port = local_addr.port(), "UDP multiplexer bound");
                    if let Some(path) = &hint_path {
                        write_port_hint(path, local_addr.port());
                    }
                    return Ok(Self {
                        socket: Arc::new(socket),
                        local_addr,
                        utp_sink: Mutex::new(None),
                    });
                }
                Err(err) => {
                    warn!(%attempt, port, %err, "failed to bind UDP multiplexer");
                    last_err = Some(err);
                }
            }
        }
        Err(last_err.map(Error::from).unwrap_or_else(|| Error::network("no bind attempts")))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn local_port(&self) -> u16 {
        self.local_addr.port()
    }

    pub async fn send_to(&self, bytes: &[u8], to: SocketAddr) -> Result<()> {
        self.socket.send_to(bytes, to).await?;
        Ok(())
    }

    /// Attach the stream layer's segment sink. At most one at a time;
    /// attaching replaces the previous sink.
    pub async fn attach_utp_sink(&self, sink: mpsc::Sender<Datagram>) {
        *self.utp_sink.lock().await = Some(sink);
    }

    /// Run the receive loop until cancelled, delivering KRPC datagrams into
    /// `krpc_sink`.
    pub async fn run(&self, krpc_sink: mpsc::Sender<Datagram>, cancel: Cancel) {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            let received = match cancel.run(self.socket.recv_from(&mut buf)).await {
                Err(_) => return,
                Ok(Err(err)) => {
                    debug!(%err, "UDP receive failed");
                    continue;
                }
                Ok(Ok(received)) => received,
            };
            let (len, from) = received;
            let datagram = Datagram { bytes: buf[..len].to_vec(), from };
            match classify(&datagram.bytes) {
                Channel::Krpc => {
                    if krpc_sink.send(datagram).await.is_err() {
                        return;
                    }
                }
                Channel::Utp => {
                    let sink = self.utp_sink.lock().await;
                    match &*sink {
                        Some(sink) => {
                            let _ = sink.try_send(datagram);
                        }
                        None => trace!(%from, "dropping µTP segment, no stream layer"),
                    }
                }
                Channel::Unknown => trace!(%from, len, "dropping unclassifiable datagram"),
            }
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Channel {
    Krpc,
    Utp,
    Unknown,
}

fn classify(bytes: &[u8]) -> Channel {
    let Some(&first) = bytes.first() else {
        return Channel::Unknown;
    };
    if first == b'd' {
        return Channel::Krpc;
    }
    // µTP header byte: type in the high nibble (0..=4), version 1 in the low.
    let packet_type = first >> 4;
    let version = first & 0x0f;
    if packet_type <= 4 && version == 1 && bytes.len() >= 20 {
        return Channel::Utp;
    }
    Channel::Unknown
}

fn read_port_hint(path: &Path) -> Option<u16> {
    let text = std::fs::read_to_string(path).ok()?;
    text.trim().parse().ok()
}

fn write_port_hint(path: &Path, port: u16) {
    if let Err(err) = std::fs::write(path, port.to_string()) {
        warn!(?path, %err, "failed to store UDP port for later reuse");
    }
}
