pub mod address;
pub mod bridge;
pub mod config;
pub mod error;
pub mod p2p;
pub mod peer;
pub mod save;
pub mod store;
pub mod transport;
pub mod ws_bridge;

pub use bridge::{BridgeEvent, ChannelBridge, UiBridge, UiCommand};
pub use config::{PeerConfig, PriceSource, PriceTable};
pub use error::{PeerError, PeerResult};
pub use peer::{Collaborators, Peer, UploadFile};
pub use transport::{Transport, TransportLauncher, TransportOptions};
