use crate::store::{content_id, BlockStore, StoredBlock};
use crate::transport::{
    AddFile, GetEntry, LsEntry, NodeInfo, ProgressFn, SwarmPeer, Transport, TransportLauncher,
    TransportOptions,
};
use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures::{stream::BoxStream, StreamExt};
use libp2p::{
    core::ConnectedPoint,
    dcutr, dns,
    gossipsub::{self, IdentTopic as Topic, MessageAuthenticity, TopicHash, ValidationMode},
    identify, identity, mdns,
    multiaddr::Protocol,
    noise, ping, relay,
    request_response::{
        self, Behaviour as RequestResponse, Codec as RequestResponseCodec,
        Event as RequestResponseEvent, Message as RequestResponseMessage, OutboundRequestId,
    },
    swarm::{
        behaviour::toggle::Toggle, dial_opts::DialOpts, ConnectionId, NetworkBehaviour, Swarm,
        SwarmEvent,
    },
    tcp, websocket, yamux, Multiaddr, PeerId, StreamProtocol, Transport as _,
};
use rand::seq::SliceRandom;
use retrieval_protocol::{BlockReply, BlockRequest, Envelope};
use std::{
    collections::{HashMap, HashSet},
    io,
    path::PathBuf,
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
    time::{interval, Instant, MissedTickBehavior},
};
use tracing::{debug, info, warn};

const BLOCK_PROTOCOL: &str = "/retrieval/block/1.0.0";
const SUBSCRIPTION_BUFFER: usize = 256;
const LISTEN_READY_TIMEOUT: Duration = Duration::from_secs(5);
/// How long a fetch waits for dials in flight when no connected peer has the block.
const FETCH_DIAL_WAIT: Duration = Duration::from_secs(10);
const RENDEZVOUS_REDIAL_DELAY: Duration = Duration::from_secs(5);
const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Clone, Default)]
pub struct BlockCodec;

#[async_trait]
impl RequestResponseCodec for BlockCodec {
    type Protocol = StreamProtocol;
    type Request = BlockRequest;
    type Response = BlockReply;

    async fn read_request<T>(&mut self, _: &StreamProtocol, io: &mut T) -> io::Result<Self::Request>
    where
        T: futures::AsyncRead + Unpin + Send,
    {
        let mut buf = Vec::new();
        futures::AsyncReadExt::read_to_end(io, &mut buf).await?;
        bincode::deserialize(&buf).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }

    async fn read_response<T>(
        &mut self,
        _: &StreamProtocol,
        io: &mut T,
    ) -> io::Result<Self::Response>
    where
        T: futures::AsyncRead + Unpin + Send,
    {
        let mut buf = Vec::new();
        futures::AsyncReadExt::read_to_end(io, &mut buf).await?;
        bincode::deserialize(&buf).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }

    async fn write_request<T>(
        &mut self,
        _: &StreamProtocol,
        io: &mut T,
        request: BlockRequest,
    ) -> io::Result<()>
    where
        T: futures::AsyncWrite + Unpin + Send,
    {
        let data = bincode::serialize(&request)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        futures::AsyncWriteExt::write_all(io, &data).await?;
        futures::AsyncWriteExt::close(io).await?;
        Ok(())
    }

    async fn write_response<T>(
        &mut self,
        _: &StreamProtocol,
        io: &mut T,
        response: BlockReply,
    ) -> io::Result<()>
    where
        T: futures::AsyncWrite + Unpin + Send,
    {
        let data = bincode::serialize(&response)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        futures::AsyncWriteExt::write_all(io, &data).await?;
        futures::AsyncWriteExt::close(io).await?;
        Ok(())
    }
}

#[derive(NetworkBehaviour)]
#[behaviour(to_swarm = "RetrievalEvent")]
pub struct RetrievalBehaviour {
    pub gossipsub: gossipsub::Behaviour,
    pub identify: identify::Behaviour,
    pub ping: ping::Behaviour,
    pub blocks: RequestResponse<BlockCodec>,
    pub relay: relay::client::Behaviour,
    pub dcutr: dcutr::Behaviour,
    pub mdns: Toggle<mdns::tokio::Behaviour>,
}

#[allow(dead_code)]
#[derive(Debug)]
pub enum RetrievalEvent {
    Gossipsub(gossipsub::Event),
    Identify(identify::Event),
    Ping(ping::Event),
    Blocks(RequestResponseEvent<BlockRequest, BlockReply>),
    Relay(relay::client::Event),
    Dcutr(dcutr::Event),
    Mdns(mdns::Event),
}

impl From<gossipsub::Event> for RetrievalEvent {
    fn from(v: gossipsub::Event) -> Self {
        Self::Gossipsub(v)
    }
}
impl From<identify::Event> for RetrievalEvent {
    fn from(v: identify::Event) -> Self {
        Self::Identify(v)
    }
}
impl From<ping::Event> for RetrievalEvent {
    fn from(v: ping::Event) -> Self {
        Self::Ping(v)
    }
}
impl From<RequestResponseEvent<BlockRequest, BlockReply>> for RetrievalEvent {
    fn from(v: RequestResponseEvent<BlockRequest, BlockReply>) -> Self {
        Self::Blocks(v)
    }
}
impl From<relay::client::Event> for RetrievalEvent {
    fn from(v: relay::client::Event) -> Self {
        Self::Relay(v)
    }
}
impl From<dcutr::Event> for RetrievalEvent {
    fn from(v: dcutr::Event) -> Self {
        Self::Dcutr(v)
    }
}
impl From<mdns::Event> for RetrievalEvent {
    fn from(v: mdns::Event) -> Self {
        Self::Mdns(v)
    }
}

pub fn build_swarm(
    keypair: &identity::Keypair,
    enable_mdns: bool,
) -> Result<Swarm<RetrievalBehaviour>> {
    let peer_id = PeerId::from(keypair.public());

    let noise_config =
        noise::Config::new(keypair).map_err(|e| anyhow!("Noise key generation failed: {e}"))?;

    let (relay_transport, relay_client) = relay::client::new(peer_id);
    let tcp_transport = || tcp::tokio::Transport::new(tcp::Config::default().nodelay(true));
    let ws_transport = websocket::WsConfig::new(dns::tokio::Transport::system(tcp_transport())?);
    let plain_transport = dns::tokio::Transport::system(tcp_transport())?;

    let transport = relay_transport
        .or_transport(ws_transport)
        .or_transport(plain_transport)
        .upgrade(libp2p::core::upgrade::Version::V1Lazy)
        .authenticate(noise_config)
        .multiplex(yamux::Config::default())
        .boxed();

    let cfg = gossipsub::ConfigBuilder::default()
        .validation_mode(ValidationMode::Strict)
        .build()
        .map_err(|e| anyhow!("gossipsub config: {e}"))?;
    let gossipsub = gossipsub::Behaviour::new(MessageAuthenticity::Signed(keypair.clone()), cfg)
        .map_err(|e| anyhow!("gossipsub init: {e}"))?;

    let identify = identify::Behaviour::new(identify::Config::new(
        "/retrieval/1.0.0".to_string(),
        keypair.public(),
    ));

    let ping = ping::Behaviour::new(ping::Config::new().with_interval(Duration::from_secs(20)));

    let blocks = RequestResponse::<BlockCodec>::new(
        std::iter::once((
            StreamProtocol::new(BLOCK_PROTOCOL),
            request_response::ProtocolSupport::Full,
        )),
        request_response::Config::default(),
    );

    let mdns = if enable_mdns {
        Some(mdns::tokio::Behaviour::new(mdns::Config::default(), peer_id)?)
    } else {
        None
    };

    let behaviour = RetrievalBehaviour {
        gossipsub,
        identify,
        ping,
        blocks,
        relay: relay_client,
        dcutr: dcutr::Behaviour::new(peer_id),
        mdns: Toggle::from(mdns),
    };

    Ok(Swarm::new(
        transport,
        behaviour,
        peer_id,
        libp2p::swarm::Config::with_tokio_executor()
            .with_idle_connection_timeout(Duration::from_secs(60)),
    ))
}

/// Starts [`Libp2pTransport`]s backed by a block store under `storage_path`.
pub struct Libp2pLauncher {
    pub keypair: identity::Keypair,
    pub storage_path: PathBuf,
    pub max_gb: u64,
    pub listen: Vec<Multiaddr>,
    pub enable_mdns: bool,
}

#[async_trait]
impl TransportLauncher for Libp2pLauncher {
    async fn launch(&self, options: TransportOptions) -> Result<Arc<dyn Transport>> {
        let store = Arc::new(BlockStore::open(self.storage_path.join("blocks"), self.max_gb)?);
        let swarm = build_swarm(&self.keypair, self.enable_mdns)?;
        let rendezvous = parse_multiaddrs(&options.swarm)?;
        let bootstrap = parse_multiaddrs(&options.bootstrap)?;
        let transport =
            Libp2pTransport::start(swarm, store, &self.listen, rendezvous, bootstrap).await?;
        Ok(Arc::new(transport))
    }
}

enum Command {
    Subscribe {
        topic: String,
        reply: oneshot::Sender<Result<mpsc::Receiver<Envelope>>>,
    },
    Publish {
        topic: String,
        data: Vec<u8>,
        reply: oneshot::Sender<Result<()>>,
    },
    ConnectedPeers(oneshot::Sender<Vec<SwarmPeer>>),
    ListenAddrs(oneshot::Sender<Vec<Multiaddr>>),
    FetchBlock {
        cid: String,
        reply: oneshot::Sender<Result<StoredBlock>>,
    },
    Shutdown,
}

pub struct Libp2pTransport {
    peer_id: PeerId,
    store: Arc<BlockStore>,
    commands: mpsc::Sender<Command>,
    event_loop: Mutex<Option<JoinHandle<()>>>,
}

impl Libp2pTransport {
    pub async fn start(
        mut swarm: Swarm<RetrievalBehaviour>,
        store: Arc<BlockStore>,
        listen: &[Multiaddr],
        rendezvous: Vec<Multiaddr>,
        bootstrap: Vec<Multiaddr>,
    ) -> Result<Self> {
        let peer_id = *swarm.local_peer_id();
        for addr in listen {
            swarm
                .listen_on(addr.clone())
                .with_context(|| format!("failed to listen on {addr}"))?;
        }

        let (commands, command_rx) = mpsc::channel(64);
        let (ready_tx, ready_rx) = oneshot::channel();
        let mut event_loop = EventLoop {
            swarm,
            store: store.clone(),
            commands: command_rx,
            rendezvous,
            relay_addr: None,
            listen_addrs: Vec::new(),
            ready: (!listen.is_empty()).then_some(ready_tx),
            subscribers: HashMap::new(),
            connected: Vec::new(),
            dials: HashMap::new(),
            fetches: HashMap::new(),
            parked: Vec::new(),
            redial_at: None,
        };
        event_loop.dial_rendezvous();
        for addr in bootstrap {
            info!(address = %addr, "Dialing bootstrap node");
            event_loop.dial(DialOpts::unknown_peer_id().address(addr).build(), Dial::Bootstrap);
        }
        let handle = tokio::spawn(event_loop.run());

        if !listen.is_empty()
            && tokio::time::timeout(LISTEN_READY_TIMEOUT, ready_rx)
                .await
                .is_err()
        {
            warn!("No listen address reported yet, continuing without one");
        }

        info!(peer_id = %peer_id, "Transport started");
        Ok(Self {
            peer_id,
            store,
            commands,
            event_loop: Mutex::new(Some(handle)),
        })
    }

    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(build(tx))
            .await
            .map_err(|_| anyhow!("transport is stopped"))?;
        rx.await.map_err(|_| anyhow!("transport is stopped"))
    }

    async fn with_store<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&BlockStore) -> Result<T> + Send + 'static,
    {
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || f(&store)).await?
    }

    /// Local block, or one fetched from a connected peer.
    async fn load_block(&self, cid: &str) -> Result<StoredBlock> {
        let key = cid.to_string();
        if let Some(block) = self.with_store(move |store| store.retrieve_block(&key)).await? {
            return Ok(block);
        }
        let cid = cid.to_string();
        self.request(|reply| Command::FetchBlock { cid, reply }).await?
    }
}

#[async_trait]
impl Transport for Libp2pTransport {
    async fn id(&self) -> Result<NodeInfo> {
        let addrs = self.request(Command::ListenAddrs).await?;
        let addresses = addrs
            .into_iter()
            .map(|addr| with_peer_id(addr, self.peer_id).to_string())
            .collect();
        Ok(NodeInfo {
            id: self.peer_id.to_string(),
            addresses,
        })
    }

    async fn subscribe(&self, topic: &str) -> Result<mpsc::Receiver<Envelope>> {
        let topic = topic.to_string();
        self.request(|reply| Command::Subscribe { topic, reply }).await?
    }

    async fn publish(&self, topic: &str, data: Vec<u8>) -> Result<()> {
        let topic = topic.to_string();
        self.request(|reply| Command::Publish { topic, data, reply })
            .await?
    }

    async fn pin_add(&self, cid: &str) -> Result<()> {
        let block = self.load_block(cid).await?;
        let cid = cid.to_string();
        self.with_store(move |store| {
            if !store.has_block(&cid)? && !store.save_block(&cid, &block.name, &block.data)? {
                bail!("storage full, cannot pin {cid}");
            }
            store.pin(&cid)
        })
        .await
    }

    async fn pin_rm(&self, cid: &str) -> Result<()> {
        let cid = cid.to_string();
        self.with_store(move |store| {
            if !store.unpin(&cid)? {
                bail!("{cid} is not pinned");
            }
            store.delete_block(&cid)?;
            Ok(())
        })
        .await
    }

    async fn pin_ls(&self) -> Result<Vec<String>> {
        self.with_store(|store| store.pins()).await
    }

    async fn ls(&self, cid: &str) -> Result<Vec<LsEntry>> {
        let key = cid.to_string();
        let meta = self
            .with_store(move |store| store.block_meta(&key))
            .await?
            .with_context(|| format!("{cid} is not available locally"))?;
        Ok(vec![LsEntry {
            name: meta.name,
            size: meta.size,
        }])
    }

    async fn add(&self, file: AddFile, progress: ProgressFn) -> Result<String> {
        let AddFile { path, mut content } = file;
        let mut data = Vec::new();
        while let Some(chunk) = content.next().await {
            data.extend_from_slice(&chunk?);
            progress(data.len() as u64);
        }

        let cid = content_id(&path, &data);
        let key = cid.clone();
        self.with_store(move |store| {
            if !store.save_block(&key, &path, &data)? {
                bail!("storage full, cannot add {path}");
            }
            store.pin(&key)
        })
        .await?;
        Ok(cid)
    }

    async fn get(&self, cid: &str) -> Result<BoxStream<'static, Result<GetEntry>>> {
        let block = self.load_block(cid).await?;
        let content =
            futures::stream::once(async move { Ok::<_, io::Error>(Bytes::from(block.data)) })
                .boxed();
        let entries = vec![
            Ok(GetEntry {
                path: cid.to_string(),
                content: None,
            }),
            Ok(GetEntry {
                path: format!("{cid}/{}", block.name),
                content: Some(content),
            }),
        ];
        Ok(futures::stream::iter(entries).boxed())
    }

    async fn swarm_peers(&self) -> Result<Vec<SwarmPeer>> {
        self.request(Command::ConnectedPeers).await
    }

    async fn stop(&self) -> Result<()> {
        let handle = self
            .event_loop
            .lock()
            .map_err(|_| anyhow!("transport state poisoned"))?
            .take();
        let Some(handle) = handle else {
            return Ok(());
        };
        let _ = self.commands.send(Command::Shutdown).await;
        handle.await.context("transport event loop panicked")?;
        self.with_store(|store| store.flush()).await?;
        info!(peer_id = %self.peer_id, "Transport stopped");
        Ok(())
    }
}

struct PendingFetch {
    cid: String,
    candidates: Vec<PeerId>,
    tried: HashSet<PeerId>,
    deadline: Instant,
    reply: oneshot::Sender<Result<StoredBlock>>,
}

impl PendingFetch {
    fn fail(self, reason: &str) {
        let _ = self.reply.send(Err(anyhow!("{reason} {}", self.cid)));
    }
}

/// Why an outgoing connection attempt was made.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Dial {
    Rendezvous,
    Bootstrap,
    Peer(PeerId),
}

struct EventLoop {
    swarm: Swarm<RetrievalBehaviour>,
    store: Arc<BlockStore>,
    commands: mpsc::Receiver<Command>,
    rendezvous: Vec<Multiaddr>,
    relay_addr: Option<Multiaddr>,
    listen_addrs: Vec<Multiaddr>,
    ready: Option<oneshot::Sender<()>>,
    subscribers: HashMap<TopicHash, Vec<mpsc::Sender<Envelope>>>,
    /// In connection order, oldest first.
    connected: Vec<(PeerId, Multiaddr)>,
    dials: HashMap<ConnectionId, Dial>,
    fetches: HashMap<OutboundRequestId, PendingFetch>,
    /// Fetches with no candidate left, waiting on dials still in flight.
    parked: Vec<PendingFetch>,
    redial_at: Option<Instant>,
}

impl EventLoop {
    async fn run(mut self) {
        let mut maintenance = interval(MAINTENANCE_INTERVAL);
        maintenance.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Shutdown) | None => {
                        info!("Shutdown requested, stopping swarm");
                        break;
                    }
                    Some(command) => self.handle_command(command),
                },
                event = self.swarm.select_next_some() => self.handle_swarm_event(event),
                _ = maintenance.tick() => self.maintain(Instant::now()),
            }
        }
        for fetch in self.parked.drain(..) {
            fetch.fail("transport stopped before a peer could provide");
        }
    }

    fn maintain(&mut self, now: Instant) {
        if self.redial_at.is_some_and(|at| at <= now) {
            self.redial_at = None;
            self.dial_rendezvous();
        }
        let (expired, waiting): (Vec<_>, Vec<_>) = std::mem::take(&mut self.parked)
            .into_iter()
            .partition(|fetch| fetch.deadline <= now);
        self.parked = waiting;
        for fetch in expired {
            debug!(cid = %fetch.cid, "Gave up waiting for a connection");
            fetch.fail("timed out waiting for a peer to provide");
        }
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Subscribe { topic, reply } => {
                let _ = reply.send(self.subscribe(&topic));
            }
            Command::Publish { topic, data, reply } => {
                let result = match self
                    .swarm
                    .behaviour_mut()
                    .gossipsub
                    .publish(Topic::new(topic.clone()), data)
                {
                    Ok(_) => Ok(()),
                    Err(gossipsub::PublishError::InsufficientPeers) => {
                        debug!(topic = %topic, "Published with no subscribed peers");
                        Ok(())
                    }
                    Err(e) => Err(anyhow!("publish to {topic} failed: {e}")),
                };
                let _ = reply.send(result);
            }
            Command::ConnectedPeers(reply) => {
                let peers = self
                    .connected
                    .iter()
                    .map(|(peer, addr)| SwarmPeer {
                        peer: peer.to_string(),
                        addr: Some(addr.to_string()),
                    })
                    .collect();
                let _ = reply.send(peers);
            }
            Command::ListenAddrs(reply) => {
                let _ = reply.send(self.listen_addrs.clone());
            }
            Command::FetchBlock { cid, reply } => {
                let mut candidates: Vec<PeerId> =
                    self.connected.iter().map(|(peer, _)| *peer).collect();
                candidates.shuffle(&mut rand::thread_rng());
                self.try_next_candidate(PendingFetch {
                    cid,
                    candidates,
                    tried: HashSet::new(),
                    deadline: Instant::now() + FETCH_DIAL_WAIT,
                    reply,
                });
            }
            Command::Shutdown => {}
        }
    }

    fn subscribe(&mut self, topic: &str) -> Result<mpsc::Receiver<Envelope>> {
        let topic = Topic::new(topic);
        self.swarm
            .behaviour_mut()
            .gossipsub
            .subscribe(&topic)
            .map_err(|e| anyhow!("subscribe to {topic} failed: {e}"))?;
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        self.subscribers.entry(topic.hash()).or_default().push(tx);
        info!(topic = %topic, "Subscribed");
        Ok(rx)
    }

    fn try_next_candidate(&mut self, mut fetch: PendingFetch) {
        let Some(peer) = fetch.candidates.pop() else {
            if self.dials.is_empty() || fetch.deadline <= Instant::now() {
                fetch.fail("no connected peer could provide");
            } else {
                debug!(cid = %fetch.cid, dials = self.dials.len(), "Waiting for a connection");
                self.parked.push(fetch);
            }
            return;
        };
        fetch.tried.insert(peer);
        debug!(cid = %fetch.cid, peer = %peer, "Requesting block");
        let request_id = self.swarm.behaviour_mut().blocks.send_request(
            &peer,
            BlockRequest {
                cid: fetch.cid.clone(),
            },
        );
        self.fetches.insert(request_id, fetch);
    }

    /// Retries parked fetches after a dial settled, offering `connected` to
    /// each of them when it is a peer they have not asked yet.
    fn resume_parked(&mut self, connected: Option<PeerId>) {
        for mut fetch in std::mem::take(&mut self.parked) {
            if let Some(peer) = connected {
                if !fetch.tried.contains(&peer) {
                    fetch.candidates.push(peer);
                }
            }
            self.try_next_candidate(fetch);
        }
    }

    fn handle_swarm_event(&mut self, event: SwarmEvent<RetrievalEvent>) {
        match event {
            SwarmEvent::Behaviour(RetrievalEvent::Gossipsub(gossipsub::Event::Message {
                propagation_source,
                message,
                ..
            })) => {
                let source = message.source.unwrap_or(propagation_source);
                self.dial_through_relay(source);
                self.deliver(&message.topic, Envelope::new(source.to_string(), message.data));
            }
            SwarmEvent::Behaviour(RetrievalEvent::Blocks(event)) => self.handle_block_event(event),
            SwarmEvent::Behaviour(RetrievalEvent::Identify(identify::Event::Received {
                peer_id,
                info,
                ..
            })) => {
                debug!(peer = %peer_id, agent = %info.agent_version, "Identified peer");
            }
            SwarmEvent::Behaviour(RetrievalEvent::Mdns(mdns::Event::Discovered(list))) => {
                for (peer_id, addr) in list {
                    if self.is_connected(&peer_id) {
                        continue;
                    }
                    if self.is_dialing(&peer_id) {
                        continue;
                    }
                    info!(source = "mdns", peer = %peer_id, address = %addr, "Peer discovered");
                    self.dial(
                        DialOpts::peer_id(peer_id).addresses(vec![addr]).build(),
                        Dial::Peer(peer_id),
                    );
                }
            }
            SwarmEvent::Behaviour(RetrievalEvent::Dcutr(event)) => {
                debug!(event = ?event, "Hole punch outcome");
            }
            SwarmEvent::NewListenAddr { address, .. } => {
                info!(address = %address, "Listening");
                if !self.listen_addrs.contains(&address) {
                    self.listen_addrs.push(address);
                }
                if let Some(ready) = self.ready.take() {
                    let _ = ready.send(());
                }
            }
            SwarmEvent::ExpiredListenAddr { address, .. } => {
                self.listen_addrs.retain(|a| a != &address);
            }
            SwarmEvent::ConnectionEstablished {
                peer_id,
                connection_id,
                endpoint,
                num_established,
                ..
            } => {
                info!(peer = %peer_id, endpoint = ?endpoint, "Connection established");
                let dial = self.dials.remove(&connection_id);
                if let ConnectedPoint::Dialer { address, .. } = &endpoint {
                    if self.relay_addr.is_none() && dial == Some(Dial::Rendezvous) {
                        self.redial_at = None;
                        self.listen_via_relay(peer_id, address.clone());
                    }
                }
                if num_established.get() == 1 {
                    self.connected
                        .push((peer_id, endpoint.get_remote_address().clone()));
                    self.resume_parked(Some(peer_id));
                } else {
                    self.resume_parked(None);
                }
            }
            SwarmEvent::ConnectionClosed {
                peer_id,
                cause,
                num_established,
                ..
            } => {
                info!(peer = %peer_id, cause = ?cause, "Connection closed");
                if num_established == 0 {
                    self.on_disconnected(peer_id);
                }
            }
            SwarmEvent::IncomingConnectionError { error, .. } => {
                warn!(error = ?error, "Incoming connection error");
            }
            SwarmEvent::OutgoingConnectionError {
                connection_id,
                peer_id,
                error,
                ..
            } => {
                let dial = self.dials.remove(&connection_id);
                warn!(peer = ?peer_id, dial = ?dial, error = ?error, "Outgoing connection error");
                if dial == Some(Dial::Rendezvous) && self.relay_addr.is_none() {
                    self.schedule_rendezvous_redial();
                }
                self.resume_parked(None);
            }
            _ => {}
        }
    }

    fn handle_block_event(&mut self, event: RequestResponseEvent<BlockRequest, BlockReply>) {
        match event {
            RequestResponseEvent::Message { peer, message, .. } => match message {
                RequestResponseMessage::Request {
                    request, channel, ..
                } => {
                    let reply = match self.store.retrieve_block(&request.cid) {
                        Ok(Some(block)) => BlockReply {
                            cid: request.cid,
                            found: true,
                            name: block.name,
                            data: block.data,
                        },
                        Ok(None) => BlockReply::missing(request.cid),
                        Err(e) => {
                            warn!(cid = %request.cid, error = %e, "Failed to read block");
                            BlockReply::missing(request.cid)
                        }
                    };
                    let _ = self
                        .swarm
                        .behaviour_mut()
                        .blocks
                        .send_response(channel, reply);
                    debug!(peer = %peer, "Served block request");
                }
                RequestResponseMessage::Response {
                    request_id,
                    response,
                } => {
                    let Some(fetch) = self.fetches.remove(&request_id) else {
                        return;
                    };
                    if response.found && content_id(&response.name, &response.data) == fetch.cid {
                        let _ = fetch.reply.send(Ok(StoredBlock {
                            name: response.name,
                            data: response.data,
                        }));
                    } else {
                        if response.found {
                            warn!(peer = %peer, cid = %fetch.cid, "Block does not match its CID");
                        }
                        self.try_next_candidate(fetch);
                    }
                }
            },
            RequestResponseEvent::OutboundFailure {
                peer,
                request_id,
                error,
                ..
            } => {
                warn!(peer = %peer, error = %error, "Block request failed");
                if let Some(fetch) = self.fetches.remove(&request_id) {
                    self.try_next_candidate(fetch);
                }
            }
            RequestResponseEvent::InboundFailure { peer, error, .. } => {
                warn!(peer = %peer, error = %error, "Block inbound failure");
            }
            RequestResponseEvent::ResponseSent { peer, .. } => {
                debug!(peer = %peer, "Block response sent");
            }
        }
    }

    fn deliver(&mut self, topic: &TopicHash, envelope: Envelope) {
        let Some(senders) = self.subscribers.get_mut(topic) else {
            return;
        };
        senders.retain(|tx| match tx.try_send(envelope.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(topic = %topic, "Subscriber lagging, dropping message");
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
    }

    fn is_connected(&self, peer_id: &PeerId) -> bool {
        self.connected.iter().any(|(peer, _)| peer == peer_id)
    }

    fn is_dialing(&self, peer_id: &PeerId) -> bool {
        self.dials.values().any(|dial| *dial == Dial::Peer(*peer_id))
    }

    fn dial(&mut self, opts: DialOpts, dial: Dial) {
        let connection_id = opts.connection_id();
        match self.swarm.dial(opts) {
            Ok(()) => {
                self.dials.insert(connection_id, dial);
            }
            Err(e) => warn!(dial = ?dial, error = %e, "Dial failed"),
        }
    }

    fn dial_rendezvous(&mut self) {
        if self.dials.values().any(|dial| *dial == Dial::Rendezvous) {
            return;
        }
        for addr in self.rendezvous.clone() {
            info!(address = %addr, "Dialing rendezvous node");
            self.dial(DialOpts::unknown_peer_id().address(addr).build(), Dial::Rendezvous);
        }
    }

    fn on_disconnected(&mut self, peer_id: PeerId) {
        self.connected.retain(|(peer, _)| peer != &peer_id);
        if self.relay_peer() == Some(peer_id) {
            warn!(peer = %peer_id, "Lost the rendezvous node, redialing");
            self.relay_addr = None;
            self.schedule_rendezvous_redial();
        }
    }

    fn schedule_rendezvous_redial(&mut self) {
        if self.rendezvous.is_empty() || self.redial_at.is_some() {
            return;
        }
        self.redial_at = Some(Instant::now() + RENDEZVOUS_REDIAL_DELAY);
    }

    fn relay_peer(&self) -> Option<PeerId> {
        match self.relay_addr.as_ref()?.iter().last() {
            Some(Protocol::P2p(peer)) => Some(peer),
            _ => None,
        }
    }

    /// Reserves a circuit on the rendezvous node so others can reach us
    /// through it.
    fn listen_via_relay(&mut self, relay: PeerId, address: Multiaddr) {
        let relay_addr = with_peer_id(address, relay);
        let circuit = relay_addr.clone().with(Protocol::P2pCircuit);
        match self.swarm.listen_on(circuit.clone()) {
            Ok(_) => info!(circuit = %circuit, "Listening through rendezvous relay"),
            Err(e) => warn!(circuit = %circuit, error = %e, "Failed to listen through relay"),
        }
        self.relay_addr = Some(relay_addr);
    }

    /// Peers we only hear from over gossip get dialed through the relay so
    /// block exchange can reach them.
    fn dial_through_relay(&mut self, peer: PeerId) {
        let Some(relay_addr) = &self.relay_addr else {
            return;
        };
        if peer == *self.swarm.local_peer_id()
            || self.is_connected(&peer)
            || self.is_dialing(&peer)
        {
            return;
        }
        let addr = relay_addr
            .clone()
            .with(Protocol::P2pCircuit)
            .with(Protocol::P2p(peer));
        debug!(address = %addr, "Dialing peer through relay");
        self.dial(
            DialOpts::peer_id(peer).addresses(vec![addr]).build(),
            Dial::Peer(peer),
        );
    }
}

fn with_peer_id(addr: Multiaddr, peer_id: PeerId) -> Multiaddr {
    if matches!(addr.iter().last(), Some(Protocol::P2p(_))) {
        addr
    } else {
        addr.with(Protocol::P2p(peer_id))
    }
}

pub fn parse_multiaddrs(addrs: &[String]) -> Result<Vec<Multiaddr>> {
    addrs
        .iter()
        .map(|addr| {
            addr.parse::<Multiaddr>()
                .map_err(|e| anyhow!("invalid multiaddr {addr}: {e}"))
        })
        .collect()
}

pub fn load_or_create_identity(storage_path: &std::path::Path) -> Result<identity::Keypair> {
    let key_path = storage_path.join("peer_identity.key");

    if key_path.exists() {
        let bytes = std::fs::read(&key_path)?;
        let keypair = identity::Keypair::from_protobuf_encoding(&bytes)?;
        return Ok(keypair);
    }

    let keypair = identity::Keypair::generate_ed25519();
    let encoded = keypair.to_protobuf_encoding()?;
    std::fs::write(&key_path, encoded)?;
    Ok(keypair)
}
