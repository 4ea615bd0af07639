//! One-way state push towards whatever UI is attached to the peer.

use crate::error::PeerError;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum BridgeEvent {
    #[serde(rename = "log")]
    Log { line: String },
    #[serde(rename = "pins")]
    Pins { pins: Vec<String> },
    /// `None` tells the UI the peer is gone and its addresses are unknown.
    #[serde(rename = "multiaddrs")]
    Multiaddrs { multiaddrs: Option<Vec<String>> },
    #[serde(rename = "peers")]
    Peers { peers: Option<Vec<String>> },
    #[serde(rename = "progress")]
    Progress { fraction: f64 },
}

/// Commands a UI can send back to the peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum UiCommand {
    #[serde(rename = "query")]
    Query { cid: String },
    #[serde(rename = "upload")]
    Upload { paths: Vec<String> },
    #[serde(rename = "download")]
    Download { cid: String },
    #[serde(rename = "delete")]
    Delete { cid: String },
    #[serde(other)]
    Unknown,
}

impl UiCommand {
    /// Parses the line-oriented form used on stdin, e.g. `query bafy...`.
    pub fn parse_line(line: &str) -> Option<Self> {
        let mut words = line.split_whitespace();
        let verb = words.next()?;
        let mut args: Vec<String> = words.map(str::to_string).collect();
        if verb == "upload" {
            return (!args.is_empty()).then(|| Self::Upload { paths: args });
        }
        let cid = match args.len() {
            1 => args.remove(0),
            _ => return None,
        };
        match verb {
            "query" => Some(Self::Query { cid }),
            "download" => Some(Self::Download { cid }),
            "delete" => Some(Self::Delete { cid }),
            _ => None,
        }
    }
}

pub trait UiBridge: Send + Sync {
    fn post(&self, event: BridgeEvent) -> Result<(), PeerError>;

    fn post_log(&self, line: String) -> Result<(), PeerError> {
        self.post(BridgeEvent::Log { line })
    }

    fn post_pins(&self, pins: Vec<String>) -> Result<(), PeerError> {
        self.post(BridgeEvent::Pins { pins })
    }

    fn post_multiaddrs(&self, multiaddrs: Option<Vec<String>>) -> Result<(), PeerError> {
        self.post(BridgeEvent::Multiaddrs { multiaddrs })
    }

    fn post_peers(&self, peers: Option<Vec<String>>) -> Result<(), PeerError> {
        self.post(BridgeEvent::Peers { peers })
    }

    fn post_progress(&self, fraction: f64) -> Result<(), PeerError> {
        self.post(BridgeEvent::Progress { fraction })
    }
}

/// Forwards events over an unbounded channel to a single consumer.
#[derive(Clone)]
pub struct ChannelBridge {
    tx: mpsc::UnboundedSender<BridgeEvent>,
}

impl ChannelBridge {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<BridgeEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl UiBridge for ChannelBridge {
    fn post(&self, event: BridgeEvent) -> Result<(), PeerError> {
        self.tx.send(event).map_err(|_| PeerError::BridgeClosed)
    }
}
