use serde::{Deserialize, Serialize};

/// Pubsub topic shared by every peer taking part in retrieval.
pub const RETRIEVAL_TOPIC: &str = "filecoin-retrieval";

/// Price key used when a CID has no entry of its own.
pub const WILDCARD_PRICE_KEY: &str = "*";

/// A broadcast message as delivered by the transport.
///
/// `from` is filled in by the transport from the delivery metadata, never
/// from the payload, so it can be trusted for self-echo suppression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub from: String,
    pub data: Vec<u8>,
}

impl Envelope {
    pub fn new(from: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            from: from.into(),
            data,
        }
    }

    pub fn is_from(&self, peer_id: &str) -> bool {
        self.from == peer_id
    }

    pub fn message(&self) -> Result<Message, serde_json::Error> {
        Message::decode(&self.data)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Query {
    pub cid: String,
}

/// A seller's offer for a CID.
///
/// `size`, `pricePerByte` and `total` are whole numbers on the wire: prices
/// are quoted in the smallest currency unit. A response carrying a
/// fractional or negative amount is not a valid `QueryResponse` and fails to
/// decode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryResponse {
    pub cid: String,
    pub multiaddrs: Vec<String>,
    pub size: u64,
    pub price_per_byte: u64,
    pub total: u64,
}

impl QueryResponse {
    /// Builds a response with `total = size * price_per_byte`.
    ///
    /// Returns `None` when the total does not fit in a `u64`.
    pub fn new(
        cid: impl Into<String>,
        multiaddrs: Vec<String>,
        size: u64,
        price_per_byte: u64,
    ) -> Option<Self> {
        let total = size.checked_mul(price_per_byte)?;
        Some(Self {
            cid: cid.into(),
            multiaddrs,
            size,
            price_per_byte,
            total,
        })
    }

    pub fn first_multiaddr(&self) -> Option<&str> {
        self.multiaddrs.first().map(String::as_str)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "messageType")]
pub enum Message {
    #[serde(rename = "query")]
    Query(Query),
    #[serde(rename = "queryResponse")]
    QueryResponse(QueryResponse),
    #[serde(other)]
    Unknown,
}

impl Message {
    pub fn query(cid: impl Into<String>) -> Self {
        Self::Query(Query { cid: cid.into() })
    }

    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn decode(data: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(data)
    }

    pub fn cid(&self) -> Option<&str> {
        match self {
            Self::Query(query) => Some(&query.cid),
            Self::QueryResponse(response) => Some(&response.cid),
            Self::Unknown => None,
        }
    }
}

/// Block exchange request, sent peer-to-peer when a transport needs content
/// it does not hold locally.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockRequest {
    pub cid: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockReply {
    pub cid: String,
    pub found: bool,
    pub name: String,
    pub data: Vec<u8>,
}

impl BlockReply {
    pub fn missing(cid: impl Into<String>) -> Self {
        Self {
            cid: cid.into(),
            found: false,
            name: String::new(),
            data: Vec::new(),
        }
    }
}
