use crate::address::{peer_addresses, rendezvous_multiaddr};
use crate::bridge::{UiBridge, UiCommand};
use crate::config::{PeerConfig, PriceSource};
use crate::error::{PeerError, PeerResult};
use crate::save::SaveTarget;
use crate::transport::{AddFile, ByteStream, Transport, TransportLauncher, TransportOptions};
use anyhow::Context;
use bytes::{Bytes, BytesMut};
use futures::{stream, StreamExt, TryStreamExt};
use retrieval_protocol::{Envelope, Message, Query, QueryResponse};
use std::{
    collections::{BTreeSet, HashSet},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard,
    },
    time::Duration,
};
use tokio::{
    sync::{mpsc, watch},
    task::{JoinHandle, JoinSet},
    time::{interval_at, Instant, MissedTickBehavior},
};
use tokio_util::io::ReaderStream;
use tracing::{debug, error, info, trace, warn};

pub const UPLOAD_CHUNK_SIZE: usize = 64 * 1024;

/// Everything the peer talks to but does not own the logic of.
#[derive(Clone)]
pub struct Collaborators {
    pub launcher: Arc<dyn TransportLauncher>,
    pub bridge: Arc<dyn UiBridge>,
    pub prices: Arc<dyn PriceSource>,
    pub saver: Arc<dyn SaveTarget>,
}

/// A file about to be added to the transport.
pub struct UploadFile {
    pub name: String,
    pub size: u64,
    pub content: ByteStream,
}

impl UploadFile {
    pub async fn open(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .with_context(|| format!("{} has no file name", path.display()))?;
        let file = tokio::fs::File::open(path)
            .await
            .with_context(|| format!("failed to open {}", path.display()))?;
        let size = file.metadata().await?.len();
        Ok(Self {
            name,
            size,
            content: ReaderStream::with_capacity(file, UPLOAD_CHUNK_SIZE).boxed(),
        })
    }

    pub fn from_bytes(name: impl Into<String>, data: impl Into<Bytes>) -> Self {
        let data: Bytes = data.into();
        let size = data.len() as u64;
        let chunks: Vec<std::io::Result<Bytes>> = (0..data.len())
            .step_by(UPLOAD_CHUNK_SIZE)
            .map(|start| Ok(data.slice(start..(start + UPLOAD_CHUNK_SIZE).min(data.len()))))
            .collect();
        Self {
            name: name.into(),
            size,
            content: stream::iter(chunks).boxed(),
        }
    }
}

#[derive(Default)]
struct PeerState {
    pins: BTreeSet<String>,
    queried: HashSet<String>,
}

/// A participant in the retrieval network.
///
/// Pinned and queried CIDs live behind one mutex. It is never held across
/// an await, so every state transition is atomic while slow network calls
/// from concurrent handlers interleave freely.
pub struct Peer {
    id: String,
    multiaddrs: Vec<String>,
    topic: String,
    transport: Arc<dyn Transport>,
    bridge: Arc<dyn UiBridge>,
    prices: Arc<dyn PriceSource>,
    saver: Arc<dyn SaveTarget>,
    state: Mutex<PeerState>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    stopped: AtomicBool,
}

impl Peer {
    /// Starts the transport and brings the peer online.
    ///
    /// Any failing step aborts creation; a transport that was already
    /// started is stopped again before the error is returned.
    pub async fn create(
        config: PeerConfig,
        collaborators: Collaborators,
    ) -> anyhow::Result<Arc<Self>> {
        let rendezvous = rendezvous_multiaddr(&config.rendezvous_host, config.rendezvous_port);
        let transport = collaborators
            .launcher
            .launch(TransportOptions {
                swarm: vec![rendezvous.clone()],
                bootstrap: Vec::new(),
            })
            .await
            .with_context(|| format!("failed to start transport via {rendezvous}"))?;

        match Self::initialize(config, collaborators, transport.clone()).await {
            Ok(peer) => Ok(peer),
            Err(e) => {
                if let Err(stop_err) = transport.stop().await {
                    warn!(error = %stop_err, "Failed to stop transport after failed init");
                }
                Err(e)
            }
        }
    }

    async fn initialize(
        config: PeerConfig,
        collaborators: Collaborators,
        transport: Arc<dyn Transport>,
    ) -> anyhow::Result<Arc<Self>> {
        let node = transport.id().await.context("failed to resolve peer identity")?;
        let existing_pins = transport.pin_ls().await.context("failed to list existing pins")?;
        let subscription = transport
            .subscribe(&config.topic)
            .await
            .with_context(|| format!("failed to subscribe to {}", config.topic))?;

        let (shutdown, _) = watch::channel(false);
        let peer = Arc::new(Self {
            id: node.id,
            multiaddrs: node.addresses,
            topic: config.topic,
            transport,
            bridge: collaborators.bridge,
            prices: collaborators.prices,
            saver: collaborators.saver,
            state: Mutex::new(PeerState {
                pins: existing_pins.into_iter().collect(),
                queried: HashSet::new(),
            }),
            shutdown,
            tasks: Mutex::new(Vec::new()),
            stopped: AtomicBool::new(false),
        });
        info!(peer_id = %peer.id, addresses = ?peer.multiaddrs, "Peer identity resolved");

        peer.post_multiaddrs();
        peer.post_pins();

        let pump = tokio::spawn(
            peer.clone().pump_messages(subscription, peer.shutdown.subscribe()),
        );
        let liveness = tokio::spawn(peer.clone().report_liveness(
            config.liveness_interval,
            peer.shutdown.subscribe(),
        ));
        lock(&peer.tasks).extend([pump, liveness]);

        Ok(peer)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn multiaddrs(&self) -> &[String] {
        &self.multiaddrs
    }

    pub fn pins(&self) -> Vec<String> {
        lock(&self.state).pins.iter().cloned().collect()
    }

    pub fn is_pinned(&self, cid: &str) -> bool {
        lock(&self.state).pins.contains(cid)
    }

    pub fn is_querying(&self, cid: &str) -> bool {
        lock(&self.state).queried.contains(cid)
    }

    async fn pump_messages(
        self: Arc<Self>,
        mut subscription: mpsc::Receiver<Envelope>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut handlers = JoinSet::new();
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                Some(joined) = handlers.join_next(), if !handlers.is_empty() => {
                    if let Err(e) = joined {
                        warn!(error = %e, "Message handler ended abnormally");
                    }
                }
                envelope = subscription.recv() => {
                    let Some(envelope) = envelope else {
                        warn!(topic = %self.topic, "Subscription closed by transport");
                        break;
                    };
                    let peer = self.clone();
                    handlers.spawn(async move { peer.handle_message(envelope).await });
                }
            }
        }
        // Handlers still in flight must not publish or post once stopped.
        handlers.shutdown().await;
    }

    async fn report_liveness(
        self: Arc<Self>,
        period: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => self.post_peers().await,
            }
        }
    }

    /// Dispatches one delivery from the retrieval topic.
    pub async fn handle_message(&self, envelope: Envelope) {
        if self.stopped.load(Ordering::SeqCst) {
            trace!(from = %envelope.from, "Peer stopped, dropping message");
            return;
        }
        if envelope.is_from(&self.id) {
            trace!("Dropping our own message");
            return;
        }

        let message = match envelope.message() {
            Ok(message) => message,
            Err(e) => {
                debug!(from = %envelope.from, error = %e, "Ignoring undecodable message");
                return;
            }
        };
        trace!(from = %envelope.from, cid = ?message.cid(), "Dispatching retrieval message");
        match message {
            Message::Query(query) => self.handle_query(query).await,
            Message::QueryResponse(response) => self.handle_query_response(response).await,
            Message::Unknown => debug!(from = %envelope.from, "Ignoring unknown message type"),
        }
    }

    /// Answers with price and size when we hold `query.cid`; stays silent
    /// otherwise.
    pub async fn handle_query(&self, query: Query) {
        let pinned = self.is_pinned(&query.cid);
        if !pinned {
            return;
        }

        self.log_info(format!("someone queried for a CID I have: {}", query.cid));
        if let Err(e) = self.respond_to_query(&query.cid).await {
            self.log_error("handle query", &e);
        }
    }

    async fn respond_to_query(&self, cid: &str) -> PeerResult<()> {
        let (prices, listing) =
            tokio::try_join!(self.prices.prices_per_byte(), self.transport.ls(cid))?;
        let size = listing
            .last()
            .ok_or_else(|| PeerError::EmptyListing { cid: cid.to_string() })?
            .size;
        let price_per_byte = prices
            .price_for(cid)
            .ok_or_else(|| PeerError::NoPrice { cid: cid.to_string() })?;
        let response = QueryResponse::new(cid, self.multiaddrs.clone(), size, price_per_byte)
            .ok_or_else(|| PeerError::PriceOverflow {
                cid: cid.to_string(),
                size,
                price_per_byte,
            })?;

        debug!(cid, size, price_per_byte, total = response.total, "Answering query");
        self.publish(&Message::QueryResponse(response)).await
    }

    /// Pins the content of a response to one of our open queries. The first
    /// response wins; later ones find the CID no longer queried.
    pub async fn handle_query_response(&self, response: QueryResponse) {
        let was_queried = lock(&self.state).queried.remove(&response.cid);
        if !was_queried {
            return;
        }

        self.log_info(format!(
            "this peer has the CID I asked for: {}",
            response.first_multiaddr().unwrap_or("<no address>")
        ));
        self.log_info(format!(
            "size: {}, price per byte: {}, total: {}",
            response.size, response.price_per_byte, response.total
        ));

        match self.transport.pin_add(&response.cid).await {
            Ok(()) => {
                lock(&self.state).pins.insert(response.cid.clone());
                self.post_pins();
                self.log_info(format!("received {}", response.cid));
            }
            Err(e) => self.log_error("handle query response", &e.into()),
        }
    }

    /// Broadcasts a query for `cid` and remembers it until answered.
    pub async fn query(&self, cid: &str) {
        lock(&self.state).queried.insert(cid.to_string());
        self.log_info(format!("querying for {cid}"));
        if let Err(e) = self.publish(&Message::query(cid)).await {
            self.log_error("publish to topic", &e);
        }
    }

    async fn publish(&self, message: &Message) -> PeerResult<()> {
        let data = message.encode()?;
        self.transport.publish(&self.topic, data).await?;
        Ok(())
    }

    /// Adds and pins each file in turn. A failure stops the remaining files.
    pub async fn upload_files(&self, files: Vec<UploadFile>) {
        for file in files {
            if let Err(e) = self.upload_one(file).await {
                self.log_error("upload", &e);
                return;
            }
        }
    }

    /// Like [`Self::upload_files`], opening each path just before its upload.
    pub async fn upload_paths(&self, paths: Vec<PathBuf>) {
        for path in paths {
            let result = match UploadFile::open(&path).await {
                Ok(file) => self.upload_one(file).await,
                Err(e) => Err(e.into()),
            };
            if let Err(e) = result {
                self.log_error("upload", &e);
                return;
            }
        }
    }

    async fn upload_one(&self, file: UploadFile) -> PeerResult<String> {
        let UploadFile {
            name,
            size,
            content,
        } = file;
        let bridge = self.bridge.clone();
        let progress = Box::new(move |loaded: u64| {
            let fraction = if size == 0 {
                1.0
            } else {
                (loaded as f64 / size as f64).min(1.0)
            };
            if let Err(e) = bridge.post_progress(fraction) {
                trace!(error = %e, "Dropped progress update");
            }
        });

        let cid = self
            .transport
            .add(
                AddFile {
                    path: name.clone(),
                    content,
                },
                progress,
            )
            .await?;

        lock(&self.state).pins.insert(cid.clone());
        info!(cid = %cid, name = %name, size, "Uploaded file");
        self.post_pins();
        if let Err(e) = self.bridge.post_progress(0.0) {
            trace!(error = %e, "Dropped progress reset");
        }
        Ok(cid)
    }

    /// Fetches `cid` and hands every file entry to the save target.
    pub async fn download_file(&self, cid: &str) {
        if let Err(e) = self.try_download(cid).await {
            self.log_error("download", &e);
        }
    }

    async fn try_download(&self, cid: &str) -> PeerResult<()> {
        let mut entries = self.transport.get(cid).await?;
        while let Some(entry) = entries.next().await {
            let entry = entry?;
            let Some(content) = entry.content else {
                continue;
            };
            let chunks: Vec<Bytes> = content.try_collect().await.map_err(anyhow::Error::from)?;
            let mut data = BytesMut::with_capacity(chunks.iter().map(Bytes::len).sum());
            for chunk in &chunks {
                data.extend_from_slice(chunk);
            }
            let saved = self.saver.save(cid, &entry.path, data.freeze()).await?;
            info!(cid, path = %saved.display(), "Saved download");
        }
        Ok(())
    }

    /// Unpins `cid`. Unpinning something not pinned is logged, not raised.
    pub async fn delete_file(&self, cid: &str) {
        match self.transport.pin_rm(cid).await {
            Ok(()) => {
                lock(&self.state).pins.remove(cid);
                self.post_pins();
            }
            Err(e) => self.log_error("delete", &e.into()),
        }
    }

    pub async fn dispatch(&self, command: UiCommand) {
        match command {
            UiCommand::Query { cid } => self.query(&cid).await,
            UiCommand::Upload { paths } => {
                self.upload_paths(paths.into_iter().map(PathBuf::from).collect())
                    .await
            }
            UiCommand::Download { cid } => self.download_file(&cid).await,
            UiCommand::Delete { cid } => self.delete_file(&cid).await,
            UiCommand::Unknown => debug!("Ignoring unknown ui command"),
        }
    }

    pub fn post_multiaddrs(&self) {
        if let Err(e) = self.bridge.post_multiaddrs(Some(self.multiaddrs.clone())) {
            self.log_error("post info", &e);
        }
    }

    pub fn post_pins(&self) {
        let pins = self.pins();
        if let Err(e) = self.bridge.post_pins(pins) {
            self.log_error("post pins", &e);
        }
    }

    /// Publishes the connected peers, most recent first.
    pub async fn post_peers(&self) {
        let result = match self.transport.swarm_peers().await {
            Ok(peers) => self.bridge.post_peers(Some(peer_addresses(peers))),
            Err(e) => Err(e.into()),
        };
        if let Err(e) = result {
            self.log_error("post peer list", &e);
        }
    }

    /// Stops the background tasks, clears the UI and shuts the transport
    /// down. Calls after the first are no-ops.
    pub async fn stop(&self) -> anyhow::Result<()> {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let _ = self.shutdown.send(true);
        let tasks = std::mem::take(&mut *lock(&self.tasks));
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Peer task ended abnormally");
            }
        }

        if let Err(e) = self.bridge.post_multiaddrs(None) {
            warn!(error = %e, "Failed to clear multiaddrs");
        }
        if let Err(e) = self.bridge.post_peers(None) {
            warn!(error = %e, "Failed to clear peer list");
        }

        self.transport.stop().await.context("failed to stop transport")?;
        info!(peer_id = %self.id, "Peer stopped");
        Ok(())
    }

    fn log_info(&self, line: String) {
        info!("{line}");
        if let Err(e) = self.bridge.post_log(format!("INFO: {line}")) {
            trace!(error = %e, "Dropped ui log line");
        }
    }

    fn log_error(&self, operation: &str, err: &PeerError) {
        error!(operation, error = %err, "Operation failed");
        if let Err(e) = self.bridge.post_log(format!("ERROR: {operation} failed: {err}")) {
            trace!(error = %e, "Dropped ui log line");
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
