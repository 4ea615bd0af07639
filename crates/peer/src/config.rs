use anyhow::{Context, Result};
use async_trait::async_trait;
use retrieval_protocol::WILDCARD_PRICE_KEY;
use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

pub const DEFAULT_PRICE_PER_BYTE: u64 = 1;
pub const DEFAULT_RENDEZVOUS_HOST: &str = "127.0.0.1";
pub const DEFAULT_RENDEZVOUS_PORT: u16 = 9090;
pub const PEER_LIVENESS_INTERVAL: Duration = Duration::from_secs(3);

/// What the peer needs to come up.
#[derive(Debug, Clone)]
pub struct PeerConfig {
    pub rendezvous_host: String,
    pub rendezvous_port: u16,
    pub topic: String,
    pub liveness_interval: Duration,
}

impl PeerConfig {
    pub fn new(rendezvous_host: impl Into<String>, rendezvous_port: u16) -> Self {
        Self {
            rendezvous_host: rendezvous_host.into(),
            rendezvous_port,
            topic: retrieval_protocol::RETRIEVAL_TOPIC.to_string(),
            liveness_interval: PEER_LIVENESS_INTERVAL,
        }
    }
}

/// Price per byte keyed by CID, with `"*"` as the fallback.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceTable(pub HashMap<String, u64>);

impl PriceTable {
    pub fn wildcard(price: u64) -> Self {
        Self(HashMap::from([(WILDCARD_PRICE_KEY.to_string(), price)]))
    }

    pub fn with_price(mut self, cid: impl Into<String>, price: u64) -> Self {
        self.0.insert(cid.into(), price);
        self
    }

    pub fn price_for(&self, cid: &str) -> Option<u64> {
        self.0
            .get(cid)
            .or_else(|| self.0.get(WILDCARD_PRICE_KEY))
            .copied()
    }
}

impl Default for PriceTable {
    fn default() -> Self {
        Self::wildcard(DEFAULT_PRICE_PER_BYTE)
    }
}

/// On-disk options document; only the price table is consumed.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Options {
    #[serde(default)]
    pub prices_per_byte: PriceTable,
}

#[async_trait]
pub trait PriceSource: Send + Sync {
    async fn prices_per_byte(&self) -> Result<PriceTable>;
}

/// A fixed table, for embedding and tests.
pub struct StaticPrices(pub PriceTable);

#[async_trait]
impl PriceSource for StaticPrices {
    async fn prices_per_byte(&self) -> Result<PriceTable> {
        Ok(self.0.clone())
    }
}

/// Reads the options file on every lookup so price edits apply at once.
pub struct FilePriceSource {
    path: PathBuf,
}

impl FilePriceSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl PriceSource for FilePriceSource {
    async fn prices_per_byte(&self) -> Result<PriceTable> {
        let raw = match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(PriceTable::default())
            }
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("failed to read options {}", self.path.display()))
            }
        };
        let options: Options = serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse options {}", self.path.display()))?;
        Ok(options.prices_per_byte)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct SetupConfig {
    pub storage_path: String,
    pub max_gb: u64,
    pub rendezvous_host: String,
    pub rendezvous_port: u16,
}

pub fn load_setup_config(config_path: &Path) -> Result<Option<SetupConfig>> {
    if !config_path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(config_path)
        .with_context(|| format!("failed to read setup config {}", config_path.display()))?;
    let cfg: SetupConfig = serde_json::from_str(&raw)
        .with_context(|| format!("failed to parse setup config {}", config_path.display()))?;
    Ok(Some(cfg))
}

pub fn save_setup_config(config_path: &Path, setup: &SetupConfig) -> Result<()> {
    if let Some(parent) = config_path.parent() {
        fs::create_dir_all(parent)?;
    }
    let raw = serde_json::to_string_pretty(setup)?;
    fs::write(config_path, raw)
        .with_context(|| format!("failed to write setup config {}", config_path.display()))?;
    Ok(())
}

pub fn default_setup_config_path() -> PathBuf {
    if cfg!(target_os = "windows") {
        if let Some(appdata) = std::env::var_os("APPDATA") {
            return PathBuf::from(appdata)
                .join("Retrieval")
                .join("peer-config.json");
        }
    }

    if let Some(xdg) = std::env::var_os("XDG_CONFIG_HOME") {
        return PathBuf::from(xdg).join("retrieval").join("peer-config.json");
    }
    if let Some(home) = std::env::var_os("HOME") {
        return PathBuf::from(home)
            .join(".config")
            .join("retrieval")
            .join("peer-config.json");
    }
    PathBuf::from("peer-config.json")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cid_price_wins_over_wildcard() {
        let table = PriceTable::wildcard(2).with_price("bafyHot", 9);
        assert_eq!(table.price_for("bafyHot"), Some(9));
        assert_eq!(table.price_for("bafyCold"), Some(2));
    }

    #[test]
    fn no_wildcard_means_no_price() {
        let table = PriceTable(HashMap::from([("bafyA".to_string(), 4)]));
        assert_eq!(table.price_for("bafyB"), None);
    }

    #[test]
    fn options_file_uses_camel_case() {
        let options: Options =
            serde_json::from_str(r#"{"pricesPerByte":{"*":2,"bafy1":5}}"#).unwrap();
        assert_eq!(options.prices_per_byte.price_for("bafy1"), Some(5));
        assert_eq!(options.prices_per_byte.price_for("other"), Some(2));
    }

    #[tokio::test]
    async fn missing_options_file_falls_back_to_default_table() {
        let dir = tempfile::tempdir().unwrap();
        let source = FilePriceSource::new(dir.path().join("options.json"));
        let table = source.prices_per_byte().await.unwrap();
        assert_eq!(table.price_for("anything"), Some(DEFAULT_PRICE_PER_BYTE));
    }

    #[tokio::test]
    async fn options_file_is_reread_on_each_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("options.json");
        let source = FilePriceSource::new(&path);

        fs::write(&path, r#"{"pricesPerByte":{"*":2}}"#).unwrap();
        assert_eq!(source.prices_per_byte().await.unwrap().price_for("x"), Some(2));

        fs::write(&path, r#"{"pricesPerByte":{"*":7}}"#).unwrap();
        assert_eq!(source.prices_per_byte().await.unwrap().price_for("x"), Some(7));
    }

    #[test]
    fn setup_config_survives_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("peer-config.json");
        let setup = SetupConfig {
            storage_path: "./peer-data".into(),
            max_gb: 5,
            rendezvous_host: "star.example.org".into(),
            rendezvous_port: 443,
        };
        save_setup_config(&path, &setup).unwrap();
        assert_eq!(load_setup_config(&path).unwrap(), Some(setup));
        assert_eq!(load_setup_config(&dir.path().join("absent.json")).unwrap(), None);
    }
}
