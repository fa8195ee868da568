//! CacheCraft client daemon
//!
//! Wires the core together: the shared UDP socket, the DHT node, the HTTP
//! store, the announcer, LAN discovery, the peer server and the multi-peer
//! reader. The HTTP front-end that talks to user agents is a separate
//! program; it consumes [`ClientService::reader`] and
//! [`ClientService::store`].

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use cachecraft_cache::{
    swarm_infohash, Announcer, FetchEvent, HttpStore, LocalPeerDiscovery, MultiPeerReader,
    PeerServer, VerifiedHead,
};
use cachecraft_core::{Cancel, Error, Result};
use cachecraft_crypto::{parse_key_tag, PublicKey};
use cachecraft_dht::{Dht, UdpMultiplexer};
use cachecraft_settings::Settings;
use tracing::{info, warn};

/// The running client core.
pub struct ClientService {
    repo: PathBuf,
    dht: Dht,
    store: Arc<HttpStore>,
    announcer: Announcer,
    reader: Option<MultiPeerReader>,
    lpd: Option<LocalPeerDiscovery>,
    peer_server: PeerServer,
    cache_key: Option<PublicKey>,
    cancel: Cancel,
}

impl ClientService {
    /// Bring every component up. Configuration problems surface as
    /// `Error::Config`, a damaged store as `Error::StoreCorruption`.
    pub async fn start(repo: &Path, settings: Settings, cancel: &Cancel) -> Result<ClientService> {
        let cancel = cancel.child();

        let store = Arc::new(
            HttpStore::open(repo, settings.cache_capacity)
                .map_err(|e| Error::StoreCorruption(e.to_string()))?,
        );

        let mux = Arc::new(UdpMultiplexer::bind(Some(repo), settings.udp_port).await?);
        let dht = Dht::start(mux, &cancel);
        {
            let dht = dht.clone();
            let bootstraps = settings.bootstrap.clone();
            let cancel = cancel.child();
            tokio::spawn(async move {
                loop {
                    match dht.bootstrap(&bootstraps, &cancel).await {
                        Ok(wan) => {
                            info!(%wan, "DHT ready");
                            return;
                        }
                        Err(err) if err.is_cancelled() => return,
                        Err(err) => warn!(%err, "DHT bootstrap failed, retrying"),
                    }
                    if cancel.sleep(std::time::Duration::from_secs(10)).await.is_err() {
                        return;
                    }
                }
            });
        }

        let peer_bind: SocketAddr = settings
            .peer_listen
            .parse()
            .map_err(|_| Error::Config(format!("bad peer_listen {}", settings.peer_listen)))?;
        let peer_server = PeerServer::start(store.clone(), peer_bind, &cancel).await?;

        let lpd = if settings.local_discovery {
            // Advertise with an unspecified host; receivers substitute our
            // source address.
            let advertised: SocketAddr =
                format!("0.0.0.0:{}", peer_server.local_addr().port()).parse().expect("static");
            match LocalPeerDiscovery::start(vec![advertised], &cancel).await {
                Ok(lpd) => Some(lpd),
                Err(err) => {
                    warn!(%err, "local peer discovery unavailable");
                    None
                }
            }
        } else {
            None
        };

        let cache_key = match &settings.cache_public_key {
            Some(tag) => Some(
                parse_key_tag(tag)
                    .map_err(|e| Error::Config(format!("bad cache_public_key: {e}")))?,
            ),
            None => {
                warn!("no cache public key configured; distributed fetch disabled");
                None
            }
        };

        let reader = cache_key.map(|key| {
            let lpd_handle = lpd.clone();
            MultiPeerReader::with_local_discovery(key, Some(dht.clone()), move || {
                lpd_handle.as_ref().map(|l| l.peers()).unwrap_or_default()
            })
        });

        let announcer = {
            let dht = dht.clone();
            let announce: cachecraft_cache::AnnounceFn = Arc::new(move |infohash, cancel| {
                let dht = dht.clone();
                Box::pin(async move {
                    dht.tracker_announce(infohash, None, &cancel).await.map(|_| ())
                })
            });
            Announcer::start(announce, settings.simultaneous_announcements, &cancel)
        };

        // Everything already on disk goes back into the announce loop.
        if let Some(key) = cache_key {
            for group in store.group_index().groups() {
                announcer.add(group.clone(), swarm_infohash(&key, &group));
            }
        }

        Ok(ClientService {
            repo: repo.to_path_buf(),
            dht,
            store,
            announcer,
            reader,
            lpd,
            peer_server,
            cache_key,
            cancel,
        })
    }

    pub fn repo(&self) -> &Path {
        &self.repo
    }

    pub fn dht(&self) -> &Dht {
        &self.dht
    }

    pub fn store(&self) -> &Arc<HttpStore> {
        &self.store
    }

    pub fn reader(&self) -> Option<&MultiPeerReader> {
        self.reader.as_ref()
    }

    pub fn peer_endpoint(&self) -> SocketAddr {
        self.peer_server.local_addr()
    }

    /// Fetch a response from the swarm, stream-verify it, persist it and
    /// hand back head and body. The new group joins the announce loop.
    pub async fn fetch_and_store(
        &self,
        url: &str,
        group: &str,
        extra_peers: &[SocketAddr],
        cancel: &Cancel,
    ) -> Result<(VerifiedHead, Vec<u8>)> {
        let reader = self
            .reader
            .as_ref()
            .ok_or_else(|| Error::Config("no cache public key configured".into()))?;
        let mut response = reader.fetch(url, group, extra_peers, cancel).await?;

        let mut writer = self.store.begin_write(url, group).await?;
        if let Some(w) = writer.as_mut() {
            w.write_head(&response.head.head)?;
        }

        let mut body = Vec::new();
        loop {
            let event = match response.events.recv().await {
                Some(Ok(event)) => event,
                Some(Err(err)) => return Err(err),
                None => return Err(Error::network("peer stream ended early")),
            };
            match event {
                FetchEvent::Block { data, receipt, .. } => {
                    if let Some(w) = writer.as_mut() {
                        w.append_block(&data, &receipt)?;
                    }
                    body.extend_from_slice(&data);
                }
                FetchEvent::Complete { trailers } => {
                    if let Some(w) = writer.take() {
                        w.commit(&trailers)?;
                    }
                    break;
                }
            }
        }

        if let Some(key) = self.cache_key {
            self.announcer.add(group.to_string(), swarm_infohash(&key, group));
        }
        Ok((response.head, body))
    }

    /// Clean shutdown: say goodbye on the LAN and fire the root cancel.
    pub async fn stop(&self) {
        if let Some(lpd) = &self.lpd {
            lpd.say_bye().await;
        }
        self.cancel.fire();
    }
}
