//! Local peer discovery
//!
//! UDP multicast on the LAN: a node advertises the endpoints it serves
//! cached content on and asks who else is around. ASCII datagrams of the
//! form `OUINET-LPD-V0:<peer-id>:<CMD>` followed (for QUERY/REPLY) by
//! `host:port;` endpoint tokens. Peers are tracked by their random 64-bit
//! id; BYE removes them, and we say BYE ourselves on shutdown.

use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::{Arc, Mutex};

use cachecraft_core::{Cancel, Error, Result};
use tokio::net::UdpSocket;
use tracing::{debug, info, trace, warn};

/// The multicast group; chosen not to clash with the IANA assignments.
pub const MULTICAST_GROUP: Ipv4Addr = Ipv4Addr::new(237, 176, 57, 49);
pub const MULTICAST_PORT: u16 = 37391;

const MSG_PREFIX: &str = "OUINET-LPD-V0:";
const CMD_QUERY: &str = "QUERY:";
const CMD_REPLY: &str = "REPLY:";
const CMD_BYE: &str = "BYE:";

/// Maximum accepted datagram.
const MAX_DATAGRAM: usize = 32 * 1024;

struct Peer {
    #[allow(dead_code)]
    discovery_ep: SocketAddr,
    advertised: HashSet<SocketAddr>,
}

struct Inner {
    socket: UdpSocket,
    id: u64,
    advertised: Vec<SocketAddr>,
    peers: Mutex<HashMap<u64, Peer>>,
    group_ep: SocketAddrV4,
}

/// Handle to the discovery endpoint; `peers()` snapshots what the LAN
/// currently advertises.
#[derive(Clone)]
pub struct LocalPeerDiscovery {
    inner: Arc<Inner>,
}

impl LocalPeerDiscovery {
    /// Join the multicast group on the default port and start answering
    /// queries. `advertised` is the endpoint list we offer to others.
    pub async fn start(advertised: Vec<SocketAddr>, cancel: &Cancel) -> Result<Self> {
        Self::start_on(MULTICAST_PORT, advertised, cancel).await
    }

    /// Like [`LocalPeerDiscovery::start`] with an explicit port (tests run
    /// several instances on one host).
    pub async fn start_on(
        port: u16,
        advertised: Vec<SocketAddr>,
        cancel: &Cancel,
    ) -> Result<Self> {
        let socket = bind_multicast(port)?;
        let inner = Arc::new(Inner {
            socket,
            id: rand::random(),
            advertised,
            peers: Mutex::new(HashMap::new()),
            group_ep: SocketAddrV4::new(MULTICAST_GROUP, port),
        });
        let lpd = Self { inner };

        let listen = lpd.clone();
        let listen_cancel = cancel.child();
        tokio::spawn(async move { listen.listen(listen_cancel).await });

        // Announce ourselves and ask who is around.
        let query = lpd.message(CMD_QUERY, true);
        if let Err(err) = lpd
            .inner
            .socket
            .send_to(query.as_bytes(), SocketAddr::V4(lpd.inner.group_ep))
            .await
        {
            warn!(%err, "failed to broadcast discovery query");
        }
        Ok(lpd)
    }

    /// Every endpoint currently advertised by known LAN peers.
    pub fn peers(&self) -> Vec<SocketAddr> {
        let peers = self.inner.peers.lock().unwrap();
        let mut out: Vec<SocketAddr> =
            peers.values().flat_map(|p| p.advertised.iter().copied()).collect();
        out.sort();
        out.dedup();
        out
    }

    /// Tell the group we are leaving. Best effort.
    pub async fn say_bye(&self) {
        let bye = self.message(CMD_BYE, false);
        let _ = self
            .inner
            .socket
            .send_to(bye.as_bytes(), SocketAddr::V4(self.inner.group_ep))
            .await;
    }

    fn message(&self, cmd: &str, with_endpoints: bool) -> String {
        let mut out = format!("{MSG_PREFIX}{}:{cmd}", self.inner.id);
        if with_endpoints {
            for ep in &self.inner.advertised {
                out.push_str(&format!("{ep};"));
            }
        }
        out
    }

    async fn listen(self, cancel: Cancel) {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            let (len, from) = match cancel.run(self.inner.socket.recv_from(&mut buf)).await {
                Err(_) => return,
                Ok(Err(err)) => {
                    debug!(%err, "discovery receive failed");
                    if cancel.sleep(std::time::Duration::from_secs(1)).await.is_err() {
                        return;
                    }
                    continue;
                }
                Ok(Ok(received)) => received,
            };
            let Ok(text) = std::str::from_utf8(&buf[..len]) else { continue };
            if let Err(err) = self.handle_datagram(text, from).await {
                trace!(%from, %err, "ignoring malformed discovery datagram");
            }
        }
    }

    async fn handle_datagram(&self, text: &str, from: SocketAddr) -> Result<()> {
        let rest = text
            .strip_prefix(MSG_PREFIX)
            .ok_or_else(|| Error::protocol("missing prefix"))?;
        let (id_text, rest) = rest
            .split_once(':')
            .ok_or_else(|| Error::protocol("missing peer id"))?;
        let peer_id: u64 = id_text.parse().map_err(|_| Error::protocol("bad peer id"))?;
        if peer_id == self.inner.id {
            return Ok(()); // our own multicast loopback
        }

        if let Some(eps) = rest.strip_prefix(CMD_QUERY) {
            self.add_peer(peer_id, from, parse_endpoints(eps, from.ip())?);
            // Replies go to the group as well: on hosts sharing the port
            // (SO_REUSEADDR) a unicast reply can land on the wrong socket.
            let reply = self.message(CMD_REPLY, true);
            let _ = self
                .inner
                .socket
                .send_to(reply.as_bytes(), SocketAddr::V4(self.inner.group_ep))
                .await;
        } else if let Some(eps) = rest.strip_prefix(CMD_REPLY) {
            self.add_peer(peer_id, from, parse_endpoints(eps, from.ip())?);
        } else if rest.starts_with(CMD_BYE) {
            let mut peers = self.inner.peers.lock().unwrap();
            if let Some(peer) = peers.remove(&peer_id) {
                info!(endpoints = ?peer.advertised, "Lost local peer(s)");
            }
        }
        Ok(())
    }

    fn add_peer(&self, peer_id: u64, from: SocketAddr, advertised: HashSet<SocketAddr>) {
        let mut peers = self.inner.peers.lock().unwrap();
        let known = peers
            .get(&peer_id)
            .map_or(false, |p| p.advertised == advertised);
        if !known {
            info!(endpoints = ?advertised, "Found local peer(s)");
        }
        peers.insert(peer_id, Peer { discovery_ep: from, advertised });
    }
}

/// Semicolon-terminated `host:port` tokens; an unspecified host means
/// "me", so it is replaced by the sender's source address.
fn parse_endpoints(text: &str, sender: IpAddr) -> Result<HashSet<SocketAddr>> {
    let mut out = HashSet::new();
    for token in text.split_terminator(';') {
        let mut ep: SocketAddr = token
            .trim()
            .parse()
            .map_err(|_| Error::protocol("bad endpoint token"))?;
        if ep.ip().is_unspecified() {
            ep.set_ip(sender);
        }
        out.insert(ep);
    }
    Ok(out)
}

fn bind_multicast(port: u16) -> Result<UdpSocket> {
    use socket2::{Domain, Protocol, Socket, Type};
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    let bind_addr: SocketAddr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port);
    socket.bind(&bind_addr.into())?;
    socket.join_multicast_v4(&MULTICAST_GROUP, &Ipv4Addr::UNSPECIFIED)?;
    socket.set_multicast_loop_v4(true)?;
    UdpSocket::from_std(socket.into()).map_err(Error::from)
}
