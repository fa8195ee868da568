//! Multi-peer response reader
//!
//! Given a url and its DHT group, race every peer that might hold the
//! signed response: LAN-discovered peers, swarm members from the DHT, and
//! recently successful peers. The first peer to produce a head that
//! verifies wins the race; its blocks flow to the consumer in strict index
//! order. When the current peer fails mid-body, another live peer takes
//! over at the exact block where it stopped. Blocks already delivered are
//! never re-emitted, and nothing unverified is ever delivered.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use cachecraft_core::{Cancel, Error, Result, WatchDog};
use cachecraft_crypto::PublicKey;
use cachecraft_dht::Dht;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::codec::{BlockReceipt, VerifiedHead, Verifier};
use crate::head::field;
use crate::session::{Part, Session};
use crate::store::swarm_infohash;

/// Concurrent in-flight peer sessions.
pub const MAX_CONCURRENT_PEERS: usize = 4;
/// How long a peer that served bad data is skipped for a key.
const SCORE_DOWN_PERIOD: Duration = Duration::from_secs(5 * 60);
/// Recently successful peers remembered across fetches.
const MAX_PINNED_PEERS: usize = 16;
/// Per-peer lookahead: verified blocks buffered beyond the consumer.
const BUFFER_WINDOW: u64 = 32;
/// A peer must produce its next part within this long.
const PEER_PART_TIMEOUT: Duration = Duration::from_secs(15);

/// Events delivered to the consumer after the head.
#[derive(Debug)]
pub enum FetchEvent {
    Block { index: u64, data: Vec<u8>, receipt: BlockReceipt },
    Complete { trailers: Vec<(String, String)> },
}

/// A winning, verified response stream.
pub struct PeerResponse {
    pub head: VerifiedHead,
    pub events: mpsc::Receiver<Result<FetchEvent>>,
}

struct Shared {
    cache_key: PublicKey,
    dht: Option<Dht>,
    local_peers: Box<dyn Fn() -> Vec<SocketAddr> + Send + Sync>,
    pinned: Mutex<VecDeque<SocketAddr>>,
    skip: Mutex<HashMap<(String, SocketAddr), Instant>>,
}

/// The reader facade; cheap to clone, state shared.
#[derive(Clone)]
pub struct MultiPeerReader {
    shared: Arc<Shared>,
}

impl MultiPeerReader {
    pub fn new(cache_key: PublicKey, dht: Option<Dht>) -> Self {
        Self {
            shared: Arc::new(Shared {
                cache_key,
                dht,
                local_peers: Box::new(Vec::new),
                pinned: Mutex::new(VecDeque::new()),
                skip: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Plug in a LAN-discovery snapshot source.
    pub fn with_local_discovery(
        cache_key: PublicKey,
        dht: Option<Dht>,
        local_peers: impl Fn() -> Vec<SocketAddr> + Send + Sync + 'static,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                cache_key,
                dht,
                local_peers: Box::new(local_peers),
                pinned: Mutex::new(VecDeque::new()),
                skip: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Fetch a verified response for `url`, discovering peers via `group`.
    /// `extra_peers` joins the candidate set first (used by tests and by
    /// callers that already know who to ask).
    pub async fn fetch(
        &self,
        url: &str,
        group: &str,
        extra_peers: &[SocketAddr],
        cancel: &Cancel,
    ) -> Result<PeerResponse> {
        let cancel = cancel.child();
        let shared = self.shared.clone();

        // Candidate feed: pinned and LAN peers immediately, DHT peers as
        // the swarm lookup returns.
        let (cand_tx, cand_rx) = mpsc::channel::<SocketAddr>(64);
        let mut seed: Vec<SocketAddr> = Vec::new();
        seed.extend(extra_peers.iter().copied());
        seed.extend(shared.pinned.lock().unwrap().iter().copied());
        seed.extend((shared.local_peers)());
        {
            let now = Instant::now();
            let mut skip = shared.skip.lock().unwrap();
            skip.retain(|_, until| *until > now);
            seed.retain(|ep| !skip.contains_key(&(url.to_string(), *ep)));
        }
        let mut seen: HashSet<SocketAddr> = HashSet::new();
        for ep in seed {
            if seen.insert(ep) {
                let _ = cand_tx.try_send(ep);
            }
        }
        if let Some(dht) = shared.dht.clone() {
            let infohash = swarm_infohash(&shared.cache_key, group);
            let cand_tx = cand_tx.clone();
            let lookup_cancel = cancel.child();
            tokio::spawn(async move {
                match dht.tracker_get_peers(infohash, &lookup_cancel).await {
                    Ok(peers) => {
                        for peer in peers {
                            let _ = cand_tx.send(SocketAddr::V4(peer)).await;
                        }
                    }
                    Err(err) if !err.is_cancelled() => {
                        debug!(%err, "swarm lookup produced no peers")
                    }
                    Err(_) => {}
                }
            });
        }
        drop(cand_tx);

        let (head_tx, head_rx) = oneshot::channel();
        let (event_tx, event_rx) = mpsc::channel(8);
        let engine_cancel = cancel.clone();
        let engine_url = url.to_string();
        tokio::spawn(async move {
            run_engine(shared, engine_url, cand_rx, head_tx, event_tx, engine_cancel).await;
        });

        let head = cancel
            .run(head_rx)
            .await?
            .map_err(|_| Error::Cancelled)??;
        Ok(PeerResponse { head, events: event_rx })
    }
}

enum PeerMsg {
    HeadOk { peer: usize, head: VerifiedHead },
    Block { peer: usize, index: u64, data: Vec<u8>, receipt: BlockReceipt },
    Done { peer: usize, blocks: u64, trailers: Vec<(String, String)> },
    Failed { peer: usize, error: Error },
}

struct PeerState {
    endpoint: SocketAddr,
    buffer: BTreeMap<u64, (Vec<u8>, BlockReceipt)>,
    finished: Option<(u64, Vec<(String, String)>)>,
    failed: bool,
}

#[allow(clippy::too_many_lines)]
async fn run_engine(
    shared: Arc<Shared>,
    url: String,
    mut cand_rx: mpsc::Receiver<SocketAddr>,
    head_tx: oneshot::Sender<Result<VerifiedHead>>,
    event_tx: mpsc::Sender<Result<FetchEvent>>,
    cancel: Cancel,
) {
    let (msg_tx, mut msg_rx) = mpsc::channel::<PeerMsg>(32);
    let mut peers: Vec<PeerState> = Vec::new();
    let mut active = 0usize;
    let mut candidates_open = true;
    let mut any_peer_seen = false;

    let mut head_tx = Some(head_tx);
    let mut winner: Option<usize> = None;
    let mut current: Option<usize> = None;
    let mut next_index = 0u64;

    let fail = |head_tx: &mut Option<oneshot::Sender<Result<VerifiedHead>>>, error: Error| {
        if let Some(tx) = head_tx.take() {
            let _ = tx.send(Err(error));
        }
    };

    loop {
        // Keep up to the cap of sessions in flight while candidates last.
        while active < MAX_CONCURRENT_PEERS && candidates_open {
            match cand_rx.try_recv() {
                Ok(endpoint) => {
                    if peers.iter().any(|p| p.endpoint == endpoint) {
                        continue;
                    }
                    any_peer_seen = true;
                    let peer = peers.len();
                    peers.push(PeerState {
                        endpoint,
                        buffer: BTreeMap::new(),
                        finished: None,
                        failed: false,
                    });
                    active += 1;
                    let msg_tx = msg_tx.clone();
                    let session_cancel = cancel.child();
                    let url = url.clone();
                    let key = shared.cache_key;
                    tokio::spawn(async move {
                        peer_session(key, endpoint, url, peer, msg_tx, session_cancel).await;
                    });
                }
                Err(mpsc::error::TryRecvError::Empty) => break,
                Err(mpsc::error::TryRecvError::Disconnected) => {
                    candidates_open = false;
                }
            }
        }

        if active == 0 {
            if candidates_open {
                // Wait for discovery to produce somebody.
                tokio::select! {
                    _ = cancel.fired_wait() => {
                        fail(&mut head_tx, Error::Cancelled);
                        return;
                    }
                    next = cand_rx.recv() => match next {
                        Some(endpoint) => {
                            // Push back through the same dedup path.
                            if !peers.iter().any(|p| p.endpoint == endpoint) {
                                any_peer_seen = true;
                                let peer = peers.len();
                                peers.push(PeerState {
                                    endpoint,
                                    buffer: BTreeMap::new(),
                                    finished: None,
                                    failed: false,
                                });
                                active += 1;
                                let msg_tx = msg_tx.clone();
                                let session_cancel = cancel.child();
                                let url = url.clone();
                                let key = shared.cache_key;
                                tokio::spawn(async move {
                                    peer_session(key, endpoint, url, peer, msg_tx, session_cancel)
                                        .await;
                                });
                            }
                            continue;
                        }
                        None => {
                            candidates_open = false;
                            continue;
                        }
                    },
                }
            }
            // Nobody left and nobody coming.
            let error = if any_peer_seen {
                Error::network("all peers failed")
            } else {
                Error::NotFound
            };
            match head_tx.take() {
                Some(tx) => {
                    let _ = tx.send(Err(error));
                }
                None => {
                    let _ = event_tx.send(Err(error)).await;
                }
            }
            return;
        }

        let msg = tokio::select! {
            _ = cancel.fired_wait() => {
                fail(&mut head_tx, Error::Cancelled);
                let _ = event_tx.try_send(Err(Error::Cancelled));
                return;
            }
            msg = msg_rx.recv() => match msg {
                Some(msg) => msg,
                None => return,
            },
        };

        match msg {
            PeerMsg::HeadOk { peer, head } => {
                if winner.is_none() {
                    winner = Some(peer);
                    current = Some(peer);
                    debug!(endpoint = %peers[peer].endpoint, "head race won");
                    if let Some(tx) = head_tx.take() {
                        if tx.send(Ok(head)).is_err() {
                            cancel.fire();
                            return;
                        }
                    }
                }
                // Losing heads are simply not forwarded; their sessions
                // stay warm as switch targets.
            }
            PeerMsg::Block { peer, index, data, receipt } => {
                if peers[peer].failed || index < next_index {
                    // Already delivered this far; drop the duplicate.
                } else if index >= next_index + BUFFER_WINDOW {
                    // Runaway peer; drop it rather than buffer without bound.
                    warn!(endpoint = %peers[peer].endpoint, "peer overran the buffer window");
                    peers[peer].failed = true;
                    active -= 1;
                } else {
                    peers[peer].buffer.insert(index, (data, receipt));
                }
            }
            PeerMsg::Done { peer, blocks, trailers } => {
                if !peers[peer].failed {
                    peers[peer].finished = Some((blocks, trailers));
                    active -= 1;
                }
            }
            PeerMsg::Failed { peer, error } => {
                trace!(endpoint = %peers[peer].endpoint, %error, "peer session failed");
                if !peers[peer].failed {
                    peers[peer].failed = true;
                    active -= 1;
                }
                peers[peer].buffer.clear();
                if matches!(error, Error::SignatureInvalid | Error::Protocol(_)) {
                    shared.skip.lock().unwrap().insert(
                        (url.clone(), peers[peer].endpoint),
                        Instant::now() + SCORE_DOWN_PERIOD,
                    );
                }
            }
        }

        // Deliver as far as the buffers allow, preferring the current peer
        // and switching only when it cannot supply the next block.
        if winner.is_some() {
            loop {
                let supplier = match current {
                    Some(p) if !peers[p].failed && peers[p].buffer.contains_key(&next_index) => {
                        Some(p)
                    }
                    _ => {
                        let fallback = peers
                            .iter()
                            .position(|p| !p.failed && p.buffer.contains_key(&next_index));
                        if let Some(p) = fallback {
                            if current != Some(p) {
                                debug!(endpoint = %peers[p].endpoint, "switching peers");
                            }
                            current = Some(p);
                        }
                        fallback
                    }
                };
                let Some(supplier) = supplier else { break };
                let (data, receipt) = peers[supplier]
                    .buffer
                    .remove(&next_index)
                    .expect("checked above");
                let event = FetchEvent::Block { index: next_index, data, receipt };
                if event_tx.send(Ok(event)).await.is_err() {
                    cancel.fire();
                    return;
                }
                next_index += 1;
                for peer in &mut peers {
                    peer.buffer = peer.buffer.split_off(&next_index);
                }
            }

            // Complete once any successfully finished peer confirms we
            // delivered its entire block count.
            let complete = peers
                .iter()
                .find(|p| !p.failed && matches!(&p.finished, Some((count, _)) if *count == next_index));
            if let Some(peer) = complete {
                let trailers = peer.finished.as_ref().expect("matched above").1.clone();
                let endpoint = peer.endpoint;
                let _ = event_tx.send(Ok(FetchEvent::Complete { trailers })).await;
                let mut pinned = shared.pinned.lock().unwrap();
                pinned.retain(|ep| *ep != endpoint);
                pinned.push_front(endpoint);
                pinned.truncate(MAX_PINNED_PEERS);
                cancel.fire(); // tear down the remaining sessions
                return;
            }
        }
    }
}

/// One peer's session: connect, request, verify incrementally, report.
async fn peer_session(
    cache_key: PublicKey,
    endpoint: SocketAddr,
    url: String,
    peer: usize,
    msg_tx: mpsc::Sender<PeerMsg>,
    cancel: Cancel,
) {
    let error = match drive_peer(cache_key, endpoint, &url, peer, &msg_tx, &cancel).await {
        Ok(()) => return,
        Err(error) => error,
    };
    let _ = msg_tx.send(PeerMsg::Failed { peer, error }).await;
}

async fn drive_peer(
    cache_key: PublicKey,
    endpoint: SocketAddr,
    url: &str,
    peer: usize,
    msg_tx: &mpsc::Sender<PeerMsg>,
    cancel: &Cancel,
) -> Result<()> {
    let dog = WatchDog::new(cancel, PEER_PART_TIMEOUT);
    let cancel = dog.watched().clone();

    let mut stream = cancel.run(TcpStream::connect(endpoint)).await??;
    let request = format!("GET {url} HTTP/1.1\r\nHost: cache\r\n\r\n");
    cancel.run(stream.write_all(request.as_bytes())).await??;

    let mut session = Session::from_stream(stream);
    let mut verifier = Verifier::new(cache_key);
    let mut pending_sig = None;
    let mut blocks = 0u64;

    loop {
        let part = match session.next_part(&cancel).await? {
            Some(part) => part,
            None => return Err(Error::protocol("stream ended before trailer")),
        };
        dog.rearm(PEER_PART_TIMEOUT);
        match part {
            Part::Head(head) => {
                if head.status == 404 {
                    return Err(Error::NotFound);
                }
                if head.header(field::SIG0).is_none() {
                    return Err(Error::protocol("response without signatures"));
                }
                let verified = verifier.verify_head(&head)?;
                let _ = msg_tx.send(PeerMsg::HeadOk { peer, head: verified }).await;
            }
            Part::ChunkHeader { size: 0, .. } => {
                // Final chunk; the trailer comes next.
            }
            Part::ChunkHeader { signature, .. } => {
                pending_sig = Some(
                    signature.ok_or_else(|| Error::protocol("chunk without ouisig"))?,
                );
            }
            Part::ChunkBody(data) => {
                let signature =
                    pending_sig.take().ok_or_else(|| Error::protocol("body without chunk header"))?;
                let receipt = verifier.verify_block(&data, &signature)?;
                blocks += 1;
                if msg_tx
                    .send(PeerMsg::Block { peer, index: receipt.index, data, receipt })
                    .await
                    .is_err()
                {
                    return Ok(()); // engine gone, fetch finished
                }
            }
            Part::Trailer(trailers) => {
                verifier.finish(&trailers)?;
                let _ = msg_tx.send(PeerMsg::Done { peer, blocks, trailers }).await;
                return Ok(());
            }
        }
    }
}
