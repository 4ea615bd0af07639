#![allow(dead_code)]

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures::{stream::BoxStream, StreamExt};
use retrieval_peer::{
    bridge::{BridgeEvent, UiBridge},
    config::{PeerConfig, PriceSource, PriceTable, StaticPrices},
    error::PeerError,
    peer::{Collaborators, Peer},
    save::SaveTarget,
    store::content_id,
    transport::{
        AddFile, GetEntry, LsEntry, NodeInfo, ProgressFn, SwarmPeer, Transport,
        TransportLauncher, TransportOptions,
    },
};
use retrieval_protocol::{Envelope, Message, QueryResponse};
use std::{
    collections::{BTreeSet, HashMap, HashSet},
    path::PathBuf,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};
use tokio::sync::mpsc;

/// Shared pubsub medium and content library for in-memory transports.
#[derive(Default)]
pub struct Hub {
    subscribers: Mutex<HashMap<String, Vec<mpsc::Sender<Envelope>>>>,
    library: Mutex<HashMap<String, (String, Vec<u8>)>>,
    published: Mutex<Vec<Envelope>>,
}

impl Hub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Delivers to every subscriber of `topic`, the sender included.
    pub fn broadcast(&self, topic: &str, envelope: Envelope) {
        self.published.lock().unwrap().push(envelope.clone());
        let subscribers = self.subscribers.lock().unwrap();
        for tx in subscribers.get(topic).into_iter().flatten() {
            let _ = tx.try_send(envelope.clone());
        }
    }

    pub fn published(&self) -> Vec<(String, Message)> {
        self.published
            .lock()
            .unwrap()
            .iter()
            .filter_map(|e| e.message().ok().map(|m| (e.from.clone(), m)))
            .collect()
    }

    pub fn responses(&self) -> Vec<(String, QueryResponse)> {
        self.published()
            .into_iter()
            .filter_map(|(from, m)| match m {
                Message::QueryResponse(r) => Some((from, r)),
                _ => None,
            })
            .collect()
    }

    pub fn queries(&self) -> Vec<(String, String)> {
        self.published()
            .into_iter()
            .filter_map(|(from, m)| match m {
                Message::Query(q) => Some((from, q.cid)),
                _ => None,
            })
            .collect()
    }
}

pub struct MemoryTransport {
    id: String,
    hub: Arc<Hub>,
    pins: Mutex<BTreeSet<String>>,
    swarm: Mutex<Vec<SwarmPeer>>,
    failing: Mutex<HashSet<&'static str>>,
    pin_adds: Mutex<Vec<String>>,
    stops: AtomicUsize,
}

impl MemoryTransport {
    pub fn new(id: &str, hub: Arc<Hub>) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            hub,
            pins: Mutex::new(BTreeSet::new()),
            swarm: Mutex::new(Vec::new()),
            failing: Mutex::new(HashSet::new()),
            pin_adds: Mutex::new(Vec::new()),
            stops: AtomicUsize::new(0),
        })
    }

    pub fn address(&self) -> String {
        format!("/memory/{}", self.id)
    }

    /// Stores and pins content under an explicit CID.
    pub fn seed(&self, cid: &str, name: &str, data: Vec<u8>) {
        self.hub
            .library
            .lock()
            .unwrap()
            .insert(cid.to_string(), (name.to_string(), data));
        self.pins.lock().unwrap().insert(cid.to_string());
    }

    /// Makes content fetchable from the network without pinning it here.
    pub fn publish_content(&self, cid: &str, name: &str, data: Vec<u8>) {
        self.hub
            .library
            .lock()
            .unwrap()
            .insert(cid.to_string(), (name.to_string(), data));
    }

    pub fn fail(&self, operation: &'static str) {
        self.failing.lock().unwrap().insert(operation);
    }

    pub fn set_swarm(&self, peers: Vec<SwarmPeer>) {
        *self.swarm.lock().unwrap() = peers;
    }

    pub fn pinned(&self) -> Vec<String> {
        self.pins.lock().unwrap().iter().cloned().collect()
    }

    pub fn pin_adds(&self) -> Vec<String> {
        self.pin_adds.lock().unwrap().clone()
    }

    pub fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }

    fn check(&self, operation: &'static str) -> Result<()> {
        if self.failing.lock().unwrap().contains(operation) {
            bail!("{operation} unavailable");
        }
        Ok(())
    }

    fn block(&self, cid: &str) -> Result<(String, Vec<u8>)> {
        self.hub
            .library
            .lock()
            .unwrap()
            .get(cid)
            .cloned()
            .ok_or_else(|| anyhow!("{cid} not found"))
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn id(&self) -> Result<NodeInfo> {
        self.check("id")?;
        Ok(NodeInfo {
            id: self.id.clone(),
            addresses: vec![self.address()],
        })
    }

    async fn subscribe(&self, topic: &str) -> Result<mpsc::Receiver<Envelope>> {
        self.check("subscribe")?;
        let (tx, rx) = mpsc::channel(64);
        self.hub
            .subscribers
            .lock()
            .unwrap()
            .entry(topic.to_string())
            .or_default()
            .push(tx);
        Ok(rx)
    }

    async fn publish(&self, topic: &str, data: Vec<u8>) -> Result<()> {
        self.check("publish")?;
        self.hub.broadcast(topic, Envelope::new(self.id.clone(), data));
        Ok(())
    }

    async fn pin_add(&self, cid: &str) -> Result<()> {
        self.pin_adds.lock().unwrap().push(cid.to_string());
        self.check("pin_add")?;
        self.block(cid)?;
        self.pins.lock().unwrap().insert(cid.to_string());
        Ok(())
    }

    async fn pin_rm(&self, cid: &str) -> Result<()> {
        self.check("pin_rm")?;
        if !self.pins.lock().unwrap().remove(cid) {
            bail!("{cid} is not pinned");
        }
        Ok(())
    }

    async fn pin_ls(&self) -> Result<Vec<String>> {
        self.check("pin_ls")?;
        Ok(self.pinned())
    }

    async fn ls(&self, cid: &str) -> Result<Vec<LsEntry>> {
        self.check("ls")?;
        let (name, data) = self.block(cid)?;
        Ok(vec![LsEntry {
            name,
            size: data.len() as u64,
        }])
    }

    async fn add(&self, file: AddFile, progress: ProgressFn) -> Result<String> {
        self.check("add")?;
        let AddFile { path, mut content } = file;
        let mut data = Vec::new();
        while let Some(chunk) = content.next().await {
            data.extend_from_slice(&chunk?);
            progress(data.len() as u64);
        }
        let cid = content_id(&path, &data);
        self.seed(&cid, &path, data);
        Ok(cid)
    }

    async fn get(&self, cid: &str) -> Result<BoxStream<'static, Result<GetEntry>>> {
        self.check("get")?;
        let (name, data) = self.block(cid)?;
        let content =
            futures::stream::once(async move { Ok::<_, std::io::Error>(Bytes::from(data)) })
                .boxed();
        Ok(futures::stream::iter(vec![
            Ok(GetEntry {
                path: cid.to_string(),
                content: None,
            }),
            Ok(GetEntry {
                path: format!("{cid}/{name}"),
                content: Some(content),
            }),
        ])
        .boxed())
    }

    async fn swarm_peers(&self) -> Result<Vec<SwarmPeer>> {
        self.check("swarm_peers")?;
        Ok(self.swarm.lock().unwrap().clone())
    }

    async fn stop(&self) -> Result<()> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

pub struct MemoryLauncher {
    transport: Arc<MemoryTransport>,
    fail: bool,
    pub options: Mutex<Vec<TransportOptions>>,
}

impl MemoryLauncher {
    pub fn new(transport: Arc<MemoryTransport>) -> Self {
        Self {
            transport,
            fail: false,
            options: Mutex::new(Vec::new()),
        }
    }

    pub fn failing(transport: Arc<MemoryTransport>) -> Self {
        Self {
            fail: true,
            ..Self::new(transport)
        }
    }
}

#[async_trait]
impl TransportLauncher for MemoryLauncher {
    async fn launch(&self, options: TransportOptions) -> Result<Arc<dyn Transport>> {
        self.options.lock().unwrap().push(options);
        if self.fail {
            bail!("transport failed to start");
        }
        Ok(self.transport.clone())
    }
}

#[derive(Default)]
pub struct RecordingBridge {
    events: Mutex<Vec<BridgeEvent>>,
}

impl RecordingBridge {
    pub fn events(&self) -> Vec<BridgeEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn logs(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                BridgeEvent::Log { line } => Some(line),
                _ => None,
            })
            .collect()
    }

    pub fn has_log(&self, needle: &str) -> bool {
        self.logs().iter().any(|line| line.contains(needle))
    }

    pub fn progress(&self) -> Vec<f64> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                BridgeEvent::Progress { fraction } => Some(fraction),
                _ => None,
            })
            .collect()
    }

    pub fn last_pins(&self) -> Option<Vec<String>> {
        self.events().into_iter().rev().find_map(|e| match e {
            BridgeEvent::Pins { pins } => Some(pins),
            _ => None,
        })
    }

    pub fn peers(&self) -> Vec<Option<Vec<String>>> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                BridgeEvent::Peers { peers } => Some(peers),
                _ => None,
            })
            .collect()
    }

    pub fn multiaddrs(&self) -> Vec<Option<Vec<String>>> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                BridgeEvent::Multiaddrs { multiaddrs } => Some(multiaddrs),
                _ => None,
            })
            .collect()
    }
}

impl UiBridge for RecordingBridge {
    fn post(&self, event: BridgeEvent) -> Result<(), PeerError> {
        self.events.lock().unwrap().push(event);
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingSaver {
    pub saved: Mutex<Vec<(String, String, Bytes)>>,
}

#[async_trait]
impl SaveTarget for RecordingSaver {
    async fn save(&self, cid: &str, entry_path: &str, data: Bytes) -> Result<PathBuf> {
        self.saved
            .lock()
            .unwrap()
            .push((cid.to_string(), entry_path.to_string(), data));
        Ok(PathBuf::from(entry_path))
    }
}

/// One peer wired to in-memory collaborators.
pub struct Node {
    pub peer: Arc<Peer>,
    pub transport: Arc<MemoryTransport>,
    pub bridge: Arc<RecordingBridge>,
    pub saver: Arc<RecordingSaver>,
}

pub struct NodeBuilder {
    transport: Arc<MemoryTransport>,
    prices: Arc<dyn PriceSource>,
}

impl NodeBuilder {
    pub fn new(id: &str, hub: &Arc<Hub>) -> Self {
        Self {
            transport: MemoryTransport::new(id, hub.clone()),
            prices: Arc::new(StaticPrices(PriceTable::default())),
        }
    }

    pub fn prices(mut self, prices: PriceTable) -> Self {
        self.prices = Arc::new(StaticPrices(prices));
        self
    }

    pub fn price_source(mut self, prices: Arc<dyn PriceSource>) -> Self {
        self.prices = prices;
        self
    }

    pub fn seed(self, cid: &str, name: &str, data: Vec<u8>) -> Self {
        self.transport.seed(cid, name, data);
        self
    }

    pub fn transport(&self) -> &Arc<MemoryTransport> {
        &self.transport
    }

    pub async fn start(self) -> Node {
        let bridge = Arc::new(RecordingBridge::default());
        let saver = Arc::new(RecordingSaver::default());
        let collaborators = Collaborators {
            launcher: Arc::new(MemoryLauncher::new(self.transport.clone())),
            bridge: bridge.clone(),
            prices: self.prices,
            saver: saver.clone(),
        };
        let peer = Peer::create(PeerConfig::new("127.0.0.1", 9090), collaborators)
            .await
            .unwrap();
        Node {
            peer,
            transport: self.transport,
            bridge,
            saver,
        }
    }
}

/// Answers price lookups only after `delay`, keeping query handlers busy.
pub struct SlowPrices {
    pub delay: Duration,
    pub table: PriceTable,
}

#[async_trait]
impl PriceSource for SlowPrices {
    async fn prices_per_byte(&self) -> Result<PriceTable> {
        tokio::time::sleep(self.delay).await;
        Ok(self.table.clone())
    }
}

pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..300 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met in time");
}

/// Gives spawned handlers time to run when asserting that nothing happens.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(100)).await;
}
