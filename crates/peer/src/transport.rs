//! The storage/transport collaborator the peer runs on.
//!
//! [`Transport`] covers everything the peer asks of the network and the
//! local block store. [`crate::p2p::Libp2pLauncher`] provides the real
//! implementation; tests plug in an in-memory one.

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use retrieval_protocol::Envelope;
use std::sync::Arc;
use tokio::sync::mpsc;

pub type ByteStream = BoxStream<'static, std::io::Result<Bytes>>;

/// Called with the cumulative number of bytes consumed so far.
pub type ProgressFn = Box<dyn Fn(u64) + Send + Sync>;

/// Addresses handed to the transport when it starts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransportOptions {
    pub swarm: Vec<String>,
    pub bootstrap: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeInfo {
    pub id: String,
    pub addresses: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LsEntry {
    pub name: String,
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwarmPeer {
    pub peer: String,
    pub addr: Option<String>,
}

pub struct AddFile {
    pub path: String,
    pub content: ByteStream,
}

/// One entry yielded by [`Transport::get`]. Directory entries carry no
/// content.
pub struct GetEntry {
    pub path: String,
    pub content: Option<ByteStream>,
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn id(&self) -> Result<NodeInfo>;

    /// Subscribes to `topic`; every delivery, including our own publishes
    /// when the transport echoes them, arrives on the returned receiver.
    async fn subscribe(&self, topic: &str) -> Result<mpsc::Receiver<Envelope>>;

    async fn publish(&self, topic: &str, data: Vec<u8>) -> Result<()>;

    async fn pin_add(&self, cid: &str) -> Result<()>;

    async fn pin_rm(&self, cid: &str) -> Result<()>;

    async fn pin_ls(&self) -> Result<Vec<String>>;

    async fn ls(&self, cid: &str) -> Result<Vec<LsEntry>>;

    /// Stores the file under its name, pins it and returns the CID of that
    /// file record. `ls` and `get` on the returned CID list the file by name.
    async fn add(&self, file: AddFile, progress: ProgressFn) -> Result<String>;

    async fn get(&self, cid: &str) -> Result<BoxStream<'static, Result<GetEntry>>>;

    async fn swarm_peers(&self) -> Result<Vec<SwarmPeer>>;

    async fn stop(&self) -> Result<()>;
}

/// Starts a transport. Creating the peer calls this exactly once.
#[async_trait]
pub trait TransportLauncher: Send + Sync {
    async fn launch(&self, options: TransportOptions) -> Result<Arc<dyn Transport>>;
}
