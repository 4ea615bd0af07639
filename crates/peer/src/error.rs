use thiserror::Error;

/// Failure of a single peer operation.
///
/// These never escape the peer: each operation logs its own error and the
/// peer keeps running.
#[derive(Debug, Error)]
pub enum PeerError {
    #[error("{0}")]
    Transport(#[from] anyhow::Error),

    #[error("message encoding failed: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("no price per byte configured for {cid} and no wildcard entry")]
    NoPrice { cid: String },

    #[error("total price for {cid} overflows ({size} bytes at {price_per_byte} per byte)")]
    PriceOverflow {
        cid: String,
        size: u64,
        price_per_byte: u64,
    },

    #[error("listing {cid} returned no entries")]
    EmptyListing { cid: String },

    #[error("ui bridge is closed")]
    BridgeClosed,
}

pub type PeerResult<T> = Result<T, PeerError>;
