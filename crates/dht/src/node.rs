//! The mainline DHT node
//!
//! Owns the routing table, the tracker/data store and the table of pending
//! transactions. Outgoing RPCs get a 2-byte wrapping transaction id and a
//! timeout of 4x the moving RTT estimate clamped to [2 s, 20 s]; repeated
//! timeouts evict the contact. Incoming queries are answered from the local
//! store, with write tokens required for announces and puts.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr, SocketAddrV4};
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use cachecraft_bencode::{encode, Value};
use cachecraft_core::{Cancel, Error, Result};
use cachecraft_crypto::TokenSecrets;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;
use tracing::{debug, info, trace, warn};

use crate::data::{mutable_target, ImmutableItem, MutableItem};
use crate::krpc::{error_code, Body, Message, Query, Reply, MAX_PUT_VALUE_LEN};
use crate::mux::{Datagram, UdpMultiplexer};
use crate::node_id::NodeId;
use crate::routing::{NodeContact, PingRequest, RoutingTable, BUCKET_SIZE};
use crate::storage::{DataStore, PutOutcome, SWEEP_PERIOD};

/// Parallel in-flight queries during an iterative lookup.
const ALPHA: usize = 3;
/// Result-set size; same K as the routing table.
pub const K: usize = BUCKET_SIZE;
/// Consecutive timeouts before a contact is evicted.
const EVICT_AFTER_TIMEOUTS: u32 = 3;

/// How often every bucket gets a keep-warm lookup.
const BUCKET_REFRESH_PERIOD: Duration = Duration::from_secs(15 * 60);

const MIN_RPC_TIMEOUT: Duration = Duration::from_secs(2);
const MAX_RPC_TIMEOUT: Duration = Duration::from_secs(20);
const RTT_MULTIPLIER: f64 = 4.0;
const INITIAL_RTT_MS: f64 = 500.0;

/// A successfully received reply and where it came from.
#[derive(Debug)]
struct QueryResponse {
    from: SocketAddr,
    reply: Reply,
    /// Our own address as the responder saw it (`ip` field).
    external: Option<SocketAddrV4>,
}

enum Delivered {
    Reply(QueryResponse),
    RemoteError { code: i64, message: String },
}

struct State {
    local_id: NodeId,
    routing: RoutingTable,
    store: DataStore,
    tokens: TokenSecrets,
    /// Votes on our WAN endpoint, as reported by responders.
    wan_votes: HashMap<SocketAddrV4, usize>,
    wan: Option<SocketAddrV4>,
    rtt_ms: f64,
    timeouts: HashMap<SocketAddr, u32>,
}

impl State {
    fn record_external(&mut self, addr: SocketAddrV4) {
        let votes = self.wan_votes.entry(addr).or_insert(0);
        *votes += 1;
        let best = *votes;
        if self.wan.map_or(true, |cur| {
            cur == addr || self.wan_votes.get(&cur).copied().unwrap_or(0) < best
        }) {
            self.wan = Some(addr);
        }
    }

    fn rpc_timeout(&self) -> Duration {
        let ms = (self.rtt_ms * RTT_MULTIPLIER) as u64;
        Duration::from_millis(ms).clamp(MIN_RPC_TIMEOUT, MAX_RPC_TIMEOUT)
    }

    fn record_rtt(&mut self, sample: Duration) {
        self.rtt_ms = self.rtt_ms * 0.8 + sample.as_secs_f64() * 1000.0 * 0.2;
    }
}

struct Inner {
    mux: Arc<UdpMultiplexer>,
    state: Mutex<State>,
    pending: Mutex<HashMap<u16, oneshot::Sender<Delivered>>>,
    next_tx: AtomicU16,
    cancel: Cancel,
}

/// Handle to a running DHT node. Cheap to clone.
#[derive(Clone)]
pub struct Dht {
    inner: Arc<Inner>,
}

impl Dht {
    /// Start the node on an already-bound multiplexer. Spawns the receive
    /// loop and the storage sweeper; both stop when `cancel` fires.
    pub fn start(mux: Arc<UdpMultiplexer>, cancel: &Cancel) -> Self {
        let cancel = cancel.child();
        let local_id = NodeId::random();
        let inner = Arc::new(Inner {
            mux: mux.clone(),
            state: Mutex::new(State {
                local_id,
                routing: RoutingTable::new(local_id),
                store: DataStore::new(),
                tokens: TokenSecrets::new(),
                wan_votes: HashMap::new(),
                wan: None,
                rtt_ms: INITIAL_RTT_MS,
                timeouts: HashMap::new(),
            }),
            pending: Mutex::new(HashMap::new()),
            next_tx: AtomicU16::new(rand::random()),
            cancel: cancel.clone(),
        });
        let dht = Self { inner };

        let (krpc_tx, krpc_rx) = mpsc::channel(256);
        let mux_cancel = cancel.clone();
        tokio::spawn(async move { mux.run(krpc_tx, mux_cancel).await });

        let recv = dht.clone();
        let recv_cancel = cancel.clone();
        tokio::spawn(async move { recv.receive_loop(krpc_rx, recv_cancel).await });

        let sweeper = dht.clone();
        let sweep_cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                if sweep_cancel.sleep(SWEEP_PERIOD).await.is_err() {
                    return;
                }
                sweeper.inner.state.lock().unwrap().store.sweep();
            }
        });

        let refresher = dht.clone();
        tokio::spawn(async move {
            loop {
                if cancel.sleep(BUCKET_REFRESH_PERIOD).await.is_err() {
                    return;
                }
                refresher.refresh_buckets(&cancel).await;
            }
        });

        dht
    }

    /// Keep buckets warm: look up a random id inside every bucket's prefix
    /// so distant parts of the table do not silently rot.
    async fn refresh_buckets(&self, cancel: &Cancel) {
        let targets: Vec<NodeId> = {
            let state = self.inner.state.lock().unwrap();
            state.routing.bucket_prefixes().map(|p| p.random_id()).collect()
        };
        for target in targets {
            if cancel.fired() {
                return;
            }
            let _ = self.iterative_lookup(target, LookupKind::FindNode, cancel).await;
        }
    }

    pub fn local_id(&self) -> NodeId {
        self.inner.state.lock().unwrap().local_id
    }

    pub fn local_port(&self) -> u16 {
        self.inner.mux.local_port()
    }

    /// Our WAN endpoint as observed during bootstrap, if known.
    pub fn wan_endpoint(&self) -> Option<SocketAddrV4> {
        self.inner.state.lock().unwrap().wan
    }

    pub fn routing_size(&self) -> usize {
        self.inner.state.lock().unwrap().routing.verified_count()
    }

    // ----------------------------------------------------------------
    // Bootstrap

    /// Resolve and contact the bootstrap list, learn our WAN endpoint,
    /// rederive the local id per BEP-42 if needed, then populate the table
    /// with an iterative lookup of our own id.
    pub async fn bootstrap(&self, bootstraps: &[String], cancel: &Cancel) -> Result<SocketAddrV4> {
        let cancel = cancel.child();
        let mut seeds: Vec<SocketAddr> = Vec::new();
        for entry in bootstraps {
            match cancel.run(tokio::net::lookup_host(entry.as_str())).await? {
                Ok(addrs) => seeds.extend(addrs.filter(|a| a.is_ipv4())),
                Err(err) => warn!(%entry, %err, "failed to resolve bootstrap node"),
            }
        }
        if seeds.is_empty() {
            return Err(Error::network("no bootstrap nodes resolved"));
        }

        // First round: a find_node for a random target to every seed, to
        // learn our external address and a first batch of contacts.
        let mut first_round = JoinSet::new();
        for seed in seeds {
            let dht = self.clone();
            let cancel = cancel.child();
            first_round.spawn(async move {
                dht.send_query(seed, Query::FindNode { target: NodeId::random() }, &cancel)
                    .await
            });
        }
        let mut contacts = Vec::new();
        while let Some(joined) = first_round.join_next().await {
            let Ok(Ok(response)) = joined else { continue };
            if let Some(external) = response.external {
                self.inner.state.lock().unwrap().record_external(external);
            }
            if let Some(id) = response.reply.id {
                contacts.push(NodeContact { id, endpoint: response.from });
            }
            contacts.extend(response.reply.nodes.iter().copied());
        }
        if cancel.fired() {
            return Err(Error::Cancelled);
        }

        let wan = self
            .inner
            .state
            .lock()
            .unwrap()
            .wan
            .ok_or_else(|| Error::network("no bootstrap node reported our endpoint"))?;

        // BEP-42: the local id must match the WAN address. Rederive and
        // rebuild when it does not.
        {
            let mut state = self.inner.state.lock().unwrap();
            if !state.local_id.matches_endpoint(IpAddr::V4(*wan.ip())) {
                let new_id = NodeId::generate(IpAddr::V4(*wan.ip()), None);
                info!(old = %state.local_id, new = %new_id, "rederiving local id for WAN endpoint");
                let known = state.routing.reset(new_id);
                state.local_id = new_id;
                contacts.extend(known);
            }
        }

        for contact in contacts {
            if sane_contact(&contact) {
                self.record_verified(contact);
            }
        }

        // Populate the buckets around our own id.
        let local_id = self.local_id();
        let _ = self.iterative_lookup(local_id, LookupKind::FindNode, &cancel).await?;

        if self.inner.state.lock().unwrap().routing.is_empty() {
            return Err(Error::network("bootstrap produced no verified contacts"));
        }
        info!(wan = %wan, contacts = self.routing_size(), "DHT bootstrapped");
        Ok(wan)
    }

    // ----------------------------------------------------------------
    // BEP-5 tracker operations

    /// Announce ourselves for `info_hash`. With `port_override` unset, the
    /// WAN port is announced with `implied_port` so NATed nodes work.
    /// Returns the endpoints that accepted the announce.
    pub async fn tracker_announce(
        &self,
        info_hash: NodeId,
        port_override: Option<u16>,
        cancel: &Cancel,
    ) -> Result<Vec<SocketAddr>> {
        let cancel = cancel.child();
        let lookup = self
            .iterative_lookup(info_hash, LookupKind::GetPeers(info_hash), &cancel)
            .await?;
        let (port, implied_port) = match port_override {
            Some(port) => (port, false),
            None => (
                self.wan_endpoint().map(|e| e.port()).unwrap_or(self.local_port()),
                true,
            ),
        };

        let mut announces = JoinSet::new();
        for (contact, token) in lookup.responders {
            let Some(token) = token else { continue };
            let dht = self.clone();
            let cancel = cancel.child();
            announces.spawn(async move {
                dht.send_query(
                    contact.endpoint,
                    Query::AnnouncePeer { info_hash, port, implied_port, token },
                    &cancel,
                )
                .await
                .map(|_| contact.endpoint)
            });
        }
        let mut accepted = Vec::new();
        while let Some(joined) = announces.join_next().await {
            if let Ok(Ok(endpoint)) = joined {
                accepted.push(endpoint);
            }
        }
        if cancel.fired() {
            return Err(Error::Cancelled);
        }
        if accepted.is_empty() {
            return Err(Error::network("no node accepted the announce"));
        }
        Ok(accepted)
    }

    /// Collect swarm peers for `info_hash`.
    pub async fn tracker_get_peers(
        &self,
        info_hash: NodeId,
        cancel: &Cancel,
    ) -> Result<Vec<SocketAddrV4>> {
        let lookup = self
            .iterative_lookup(info_hash, LookupKind::GetPeers(info_hash), cancel)
            .await?;
        let mut peers = lookup.peers;
        peers.sort();
        peers.dedup();
        if peers.is_empty() {
            return Err(Error::NotFound);
        }
        Ok(peers)
    }

    // ----------------------------------------------------------------
    // BEP-44 data operations

    /// Store a signed mutable item on the nodes closest to its target.
    /// Surfaces `Stale` when the swarm already holds a higher sequence.
    pub async fn data_put_mutable(&self, item: MutableItem, cancel: &Cancel) -> Result<usize> {
        if !item.verify() {
            return Err(Error::SignatureInvalid);
        }
        let target = item.target();
        let cancel = cancel.child();
        let lookup = self
            .iterative_lookup(target, LookupKind::GetData(target), &cancel)
            .await?;

        let mut puts = JoinSet::new();
        for (contact, token) in lookup.responders {
            let Some(token) = token else { continue };
            let dht = self.clone();
            let cancel = cancel.child();
            let item = item.clone();
            puts.spawn(async move {
                let query = Query::Put {
                    token,
                    value: item.value.clone(),
                    key: Some(item.key),
                    salt: item.salt.clone(),
                    seq: Some(item.seq),
                    signature: Some(item.signature),
                };
                dht.send_query(contact.endpoint, query, &cancel).await
            });
        }

        let mut accepted = 0usize;
        let mut newest_seen = item.seq;
        while let Some(joined) = puts.join_next().await {
            let Ok(Ok(response)) = joined else { continue };
            match response.reply.seq {
                Some(stored) if stored > item.seq => newest_seen = newest_seen.max(stored),
                _ => accepted += 1,
            }
        }
        if cancel.fired() {
            return Err(Error::Cancelled);
        }
        if newest_seen > item.seq {
            return Err(Error::Stale);
        }
        if accepted == 0 {
            return Err(Error::network("no node accepted the put"));
        }
        Ok(accepted)
    }

    /// Fetch the freshest verified mutable item for (key, salt).
    pub async fn data_get_mutable(
        &self,
        key: &cachecraft_crypto::PublicKey,
        salt: &[u8],
        cancel: &Cancel,
    ) -> Result<MutableItem> {
        let target = mutable_target(key, salt);
        let lookup = self
            .iterative_lookup(target, LookupKind::GetData(target), cancel)
            .await?;
        lookup
            .items
            .into_iter()
            .map(|mut item| {
                // The salt is implicit in the target and does not travel in
                // replies; restore it before checking the signature.
                item.salt = salt.to_vec();
                item
            })
            .filter(|item| item.key == *key && item.verify())
            .max_by_key(|item| item.seq)
            .ok_or(Error::NotFound)
    }

    /// Store an immutable item; returns the number of accepting nodes.
    pub async fn data_put_immutable(&self, item: ImmutableItem, cancel: &Cancel) -> Result<usize> {
        let target = item.target();
        let cancel = cancel.child();
        let lookup = self
            .iterative_lookup(target, LookupKind::GetData(target), &cancel)
            .await?;

        let mut puts = JoinSet::new();
        for (contact, token) in lookup.responders {
            let Some(token) = token else { continue };
            let dht = self.clone();
            let cancel = cancel.child();
            let value = item.value.clone();
            puts.spawn(async move {
                let query = Query::Put {
                    token,
                    value,
                    key: None,
                    salt: Vec::new(),
                    seq: None,
                    signature: None,
                };
                dht.send_query(contact.endpoint, query, &cancel).await
            });
        }
        let mut accepted = 0usize;
        while let Some(joined) = puts.join_next().await {
            if let Ok(Ok(_)) = joined {
                accepted += 1;
            }
        }
        if cancel.fired() {
            return Err(Error::Cancelled);
        }
        if accepted == 0 {
            return Err(Error::network("no node accepted the put"));
        }
        Ok(accepted)
    }

    /// Fetch an immutable item by target, re-deriving and checking the hash.
    pub async fn data_get_immutable(
        &self,
        target: NodeId,
        cancel: &Cancel,
    ) -> Result<ImmutableItem> {
        let lookup = self
            .iterative_lookup(target, LookupKind::GetData(target), cancel)
            .await?;
        lookup
            .immutables
            .into_iter()
            .map(ImmutableItem::new)
            .find(|item| item.target() == target)
            .ok_or(Error::NotFound)
    }

    /// Round-trip a ping; returns the responder's id.
    pub async fn ping(&self, endpoint: SocketAddr, cancel: &Cancel) -> Result<NodeId> {
        let response = self.send_query(endpoint, Query::Ping, cancel).await?;
        response.reply.id.ok_or_else(|| Error::protocol("ping reply without id"))
    }

    // ----------------------------------------------------------------
    // Iterative lookup

    async fn iterative_lookup(
        &self,
        target: NodeId,
        kind: LookupKind,
        cancel: &Cancel,
    ) -> Result<LookupOutput> {
        let cancel = cancel.child();
        let mut candidates: Vec<NodeContact> = {
            let state = self.inner.state.lock().unwrap();
            state.routing.find_closest(&target, 3 * K)
        };
        let mut queried: std::collections::HashSet<(NodeId, SocketAddr)> =
            std::collections::HashSet::new();
        let mut responded: Vec<(NodeContact, Option<Vec<u8>>)> = Vec::new();
        let mut output = LookupOutput::default();
        let mut in_flight: JoinSet<(NodeContact, Result<QueryResponse>)> = JoinSet::new();

        loop {
            candidates.sort_by(|a, b| target.distance_cmp(&a.id, &b.id));
            candidates.dedup_by_key(|c| (c.id, c.endpoint));

            // The lookup is done expanding when no unqueried candidate is
            // closer than the K-th responded node.
            let kth_best = responded
                .get(K - 1)
                .map(|(c, _)| c.id);
            while in_flight.len() < ALPHA {
                let next = candidates.iter().copied().find(|c| {
                    !queried.contains(&(c.id, c.endpoint))
                        && kth_best.map_or(true, |kth| target.closer_to(&c.id, &kth))
                });
                let Some(contact) = next else { break };
                queried.insert((contact.id, contact.endpoint));
                let dht = self.clone();
                let cancel = cancel.child();
                let query = kind.query(target);
                in_flight.spawn(async move {
                    let result = dht.send_query(contact.endpoint, query, &cancel).await;
                    (contact, result)
                });
            }

            let Some(joined) = in_flight.join_next().await else { break };
            if cancel.fired() {
                return Err(Error::Cancelled);
            }
            let Ok((contact, result)) = joined else { continue };
            let Ok(response) = result else { continue };

            // Dedup responders by (id, endpoint); a node may be seeded both
            // from the table and from another node's reply.
            let responder = NodeContact {
                id: response.reply.id.unwrap_or(contact.id),
                endpoint: response.from,
            };
            if !responded.iter().any(|(c, _)| c.id == responder.id && c.endpoint == responder.endpoint) {
                responded.push((responder, response.reply.token.clone()));
                responded.sort_by(|a, b| target.distance_cmp(&a.0.id, &b.0.id));
            }

            for node in &response.reply.nodes {
                if sane_contact(node) {
                    candidates.push(*node);
                }
            }
            output.peers.extend(response.reply.values.iter().copied());
            if let Some(item) = reply_to_mutable(&response.reply) {
                output.items.push(item);
            } else if let (Some(value), LookupKind::GetData(_)) = (&response.reply.value, kind) {
                output.immutables.push(value.clone());
            }
        }

        if cancel.fired() {
            return Err(Error::Cancelled);
        }
        responded.truncate(K);
        output.responders = responded;
        trace!(target = %target, responders = output.responders.len(), "lookup finished");
        Ok(output)
    }

    // ----------------------------------------------------------------
    // RPC plumbing

    async fn send_query(
        &self,
        to: SocketAddr,
        query: Query,
        cancel: &Cancel,
    ) -> Result<QueryResponse> {
        let tx = self.inner.next_tx.fetch_add(1, Ordering::Relaxed);
        let tx_bytes = tx.to_be_bytes().to_vec();
        let (reply_tx, reply_rx) = oneshot::channel();
        self.inner.pending.lock().unwrap().insert(tx, reply_tx);

        let (local_id, timeout) = {
            let state = self.inner.state.lock().unwrap();
            (state.local_id, state.rpc_timeout())
        };
        let message = Message::query(tx_bytes, local_id, query);
        let sent_at = Instant::now();
        if let Err(err) = self.inner.mux.send_to(&message.encode(), to).await {
            self.inner.pending.lock().unwrap().remove(&tx);
            return Err(err);
        }

        let outcome = tokio::select! {
            biased;
            _ = cancel.fired_wait() => Err(Error::Cancelled),
            _ = tokio::time::sleep(timeout) => Err(Error::Timeout),
            delivered = reply_rx => match delivered {
                Ok(Delivered::Reply(response)) => Ok(response),
                Ok(Delivered::RemoteError { code, message }) => {
                    Err(Error::protocol(format!("remote error {code}: {message}")))
                }
                Err(_) => Err(Error::Cancelled),
            },
        };

        match &outcome {
            Ok(_) => {
                let mut state = self.inner.state.lock().unwrap();
                state.record_rtt(sent_at.elapsed());
                state.timeouts.remove(&to);
            }
            Err(Error::Timeout) => {
                self.inner.pending.lock().unwrap().remove(&tx);
                self.penalize_timeout(to);
            }
            Err(_) => {
                self.inner.pending.lock().unwrap().remove(&tx);
            }
        }
        outcome
    }

    fn penalize_timeout(&self, endpoint: SocketAddr) {
        let mut state = self.inner.state.lock().unwrap();
        let strikes = state.timeouts.entry(endpoint).or_insert(0);
        *strikes += 1;
        if *strikes >= EVICT_AFTER_TIMEOUTS {
            state.timeouts.remove(&endpoint);
            state.routing.remove_by_endpoint(&endpoint);
            debug!(%endpoint, "evicted contact after repeated timeouts");
        }
    }

    /// A contact replied: refresh it and run any eviction ping that falls
    /// out of a full bucket.
    fn record_verified(&self, contact: NodeContact) {
        let ping = {
            let mut state = self.inner.state.lock().unwrap();
            state.routing.try_add_node(contact, true)
        };
        if let Some(request) = ping {
            self.spawn_eviction_ping(request);
        }
    }

    fn spawn_eviction_ping(&self, request: PingRequest) {
        let dht = self.clone();
        let cancel = self.inner.cancel.child();
        tokio::spawn(async move {
            let replied = dht.ping(request.stale.endpoint, &cancel).await.is_ok();
            let mut state = dht.inner.state.lock().unwrap();
            state.routing.ping_outcome(&request, replied);
        });
    }

    // ----------------------------------------------------------------
    // Incoming traffic

    async fn receive_loop(self, mut krpc_rx: mpsc::Receiver<Datagram>, cancel: Cancel) {
        loop {
            let datagram = tokio::select! {
                _ = cancel.fired_wait() => return,
                received = krpc_rx.recv() => match received {
                    Some(d) => d,
                    None => return,
                },
            };
            let message = match Message::decode(&datagram.bytes) {
                Ok(m) => m,
                Err(err) => {
                    trace!(from = %datagram.from, %err, "dropping malformed datagram");
                    continue;
                }
            };
            match message.body {
                Body::Reply(reply) => {
                    if let Some(external) = message.external_addr {
                        self.inner.state.lock().unwrap().record_external(external);
                    }
                    self.deliver(message.tx, Delivered::Reply(QueryResponse {
                        from: datagram.from,
                        reply: reply.clone(),
                        external: message.external_addr,
                    }));
                    if let Some(id) = reply.id {
                        self.record_verified(NodeContact { id, endpoint: datagram.from });
                    }
                }
                Body::Error { code, message: text } => {
                    self.deliver(message.tx, Delivered::RemoteError { code, message: text });
                }
                Body::Query { sender, query } => {
                    let response = self.handle_query(datagram.from, sender, &query);
                    let mut response = match response {
                        Ok(reply) => Message::reply(message.tx, reply),
                        Err((code, text)) => Message::error(message.tx, code, text),
                    };
                    if let SocketAddr::V4(v4) = datagram.from {
                        response.external_addr = Some(v4);
                    }
                    let _ = self.inner.mux.send_to(&response.encode(), datagram.from).await;
                }
            }
        }
    }

    fn deliver(&self, tx: Vec<u8>, delivered: Delivered) {
        let Ok(tx_bytes) = <[u8; 2]>::try_from(tx.as_slice()) else {
            return;
        };
        let tx = u16::from_be_bytes(tx_bytes);
        if let Some(waiter) = self.inner.pending.lock().unwrap().remove(&tx) {
            let _ = waiter.send(delivered);
        }
    }

    fn handle_query(
        &self,
        from: SocketAddr,
        sender: NodeId,
        query: &Query,
    ) -> std::result::Result<Reply, (i64, String)> {
        let SocketAddr::V4(from_v4) = from else {
            return Err((error_code::PROTOCOL, "ipv4 only".into()));
        };
        if !sender.matches_endpoint(from.ip()) {
            trace!(%sender, %from, "sender id fails the BEP-42 check");
        }

        let mut state = self.inner.state.lock().unwrap();
        let local_id = state.local_id;
        let reply = match query {
            Query::Ping => Reply { id: Some(local_id), ..Default::default() },
            Query::FindNode { target } => Reply {
                id: Some(local_id),
                nodes: state.routing.find_closest(target, K),
                ..Default::default()
            },
            Query::GetPeers { info_hash } => {
                let token = state.tokens.issue(from.ip(), sender.as_bytes());
                let values = state.store.peers(info_hash);
                let nodes = if values.is_empty() {
                    state.routing.find_closest(info_hash, K)
                } else {
                    Vec::new()
                };
                Reply {
                    id: Some(local_id),
                    values,
                    nodes,
                    token: Some(token),
                    ..Default::default()
                }
            }
            Query::AnnouncePeer { info_hash, port, implied_port, token } => {
                if !state.tokens.verify(from.ip(), sender.as_bytes(), token) {
                    return Err((error_code::PROTOCOL, "Bad token".into()));
                }
                let port = if *implied_port { from_v4.port() } else { *port };
                if port == 0 {
                    return Err((error_code::PROTOCOL, "Bad port".into()));
                }
                state.store.announce(*info_hash, SocketAddrV4::new(*from_v4.ip(), port));
                Reply { id: Some(local_id), ..Default::default() }
            }
            Query::Get { target, seq } => {
                let token = state.tokens.issue(from.ip(), sender.as_bytes());
                let mut reply = Reply {
                    id: Some(local_id),
                    token: Some(token),
                    nodes: state.routing.find_closest(target, K),
                    ..Default::default()
                };
                if let Some(stored) = state.store.get_mutable(target) {
                    reply.seq = Some(stored.seq);
                    // With a `seq` in the query, the value travels only when
                    // we hold something newer.
                    if seq.map_or(true, |have| stored.seq > have) {
                        reply.key = Some(stored.key);
                        reply.signature = Some(stored.signature);
                        reply.value = Some(stored.value);
                    }
                } else if let Some(stored) = state.store.get_immutable(target) {
                    reply.value = Some(stored.value);
                }
                reply
            }
            Query::Put { token, value, key, salt, seq, signature } => {
                if !state.tokens.verify(from.ip(), sender.as_bytes(), token) {
                    return Err((error_code::PROTOCOL, "Bad token".into()));
                }
                if encode(value).len() > MAX_PUT_VALUE_LEN {
                    return Err((error_code::PUT_TOO_BIG, "Message (v field) too big".into()));
                }
                match (key, seq, signature) {
                    (Some(key), Some(seq), Some(signature)) => {
                        if salt.len() > 64 {
                            return Err((error_code::PROTOCOL, "Salt too big".into()));
                        }
                        let item = MutableItem {
                            key: *key,
                            salt: salt.clone(),
                            value: value.clone(),
                            seq: *seq,
                            signature: *signature,
                        };
                        if !item.verify() {
                            return Err((
                                error_code::INVALID_SIGNATURE,
                                "Invalid signature".into(),
                            ));
                        }
                        // `cas` is not supported here; any incoming value for
                        // it is ignored rather than answered with 301.
                        let stored_seq = match state.store.put_mutable(item) {
                            PutOutcome::Stored { seq } => seq,
                            PutOutcome::Stale { stored_seq } => stored_seq,
                        };
                        Reply { id: Some(local_id), seq: Some(stored_seq), ..Default::default() }
                    }
                    (None, None, None) => {
                        state.store.put_immutable(ImmutableItem::new(value.clone()));
                        Reply { id: Some(local_id), ..Default::default() }
                    }
                    _ => {
                        return Err((
                            error_code::PROTOCOL,
                            "Mutable put needs k, seq and sig".into(),
                        ))
                    }
                }
            }
        };
        drop(state);

        // The sender is only hearsay until it answers a query of ours.
        let ping = {
            let mut state = self.inner.state.lock().unwrap();
            state
                .routing
                .try_add_node(NodeContact { id: sender, endpoint: from }, false)
        };
        if let Some(request) = ping {
            self.spawn_eviction_ping(request);
        }
        Ok(reply)
    }
}

#[derive(Clone, Copy)]
enum LookupKind {
    FindNode,
    GetPeers(NodeId),
    GetData(NodeId),
}

impl LookupKind {
    fn query(&self, target: NodeId) -> Query {
        match self {
            LookupKind::FindNode => Query::FindNode { target },
            LookupKind::GetPeers(info_hash) => Query::GetPeers { info_hash: *info_hash },
            LookupKind::GetData(data_target) => Query::Get { target: *data_target, seq: None },
        }
    }
}

#[derive(Default)]
struct LookupOutput {
    /// K closest responders, with their write tokens when sent.
    responders: Vec<(NodeContact, Option<Vec<u8>>)>,
    peers: Vec<SocketAddrV4>,
    items: Vec<MutableItem>,
    immutables: Vec<Value>,
}

fn reply_to_mutable(reply: &Reply) -> Option<MutableItem> {
    Some(MutableItem {
        key: reply.key?,
        salt: Vec::new(),
        value: reply.value.clone()?,
        seq: reply.seq?,
        signature: reply.signature?,
    })
}

/// Basic sanity for contacts learned from the wire.
fn sane_contact(contact: &NodeContact) -> bool {
    if contact.endpoint.port() == 0 {
        return false;
    }
    match contact.endpoint.ip() {
        IpAddr::V4(ip) => !ip.is_unspecified() && !ip.is_multicast() && !ip.is_broadcast(),
        IpAddr::V6(ip) => !ip.is_unspecified() && !ip.is_multicast(),
    }
}
