use aes_gcm::{
    aead::{Aead, KeyInit, OsRng},
    AeadCore, Aes256Gcm, Key, Nonce,
};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sled::Db;
use std::path::Path;
use tracing::info;

const USED_BYTES_KEY: &[u8] = b"__meta:used_bytes";
const ENCRYPTION_KEY: &[u8] = b"__meta:peer_encryption_key";
const BLOCK_PREFIX: &str = "c:";
const META_PREFIX: &str = "m:";
const PIN_PREFIX: &str = "p:";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockMeta {
    pub name: String,
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredBlock {
    pub name: String,
    pub data: Vec<u8>,
}

/// CID of a file wrapped in a directory entry called `name`.
pub fn content_id(name: &str, data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(name.as_bytes());
    hasher.update([0u8]);
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Encrypted-at-rest block store with a pin record per CID.
pub struct BlockStore {
    db: Db,
    max_bytes: u64,
    cipher: Aes256Gcm,
}

impl BlockStore {
    pub fn open(storage_path: impl AsRef<Path>, max_gb: u64) -> Result<Self> {
        let storage_path = storage_path.as_ref();
        let db = sled::open(storage_path)
            .with_context(|| format!("failed to open block store {}", storage_path.display()))?;
        let max_bytes = max_gb
            .saturating_mul(1024)
            .saturating_mul(1024)
            .saturating_mul(1024);
        let used_bytes = read_used_bytes(&db)?;

        let cipher = match db.get(ENCRYPTION_KEY)? {
            Some(bytes) if bytes.len() == 32 => {
                let key = Key::<Aes256Gcm>::from_slice(&bytes);
                Aes256Gcm::new(key)
            }
            _ => {
                let key = Aes256Gcm::generate_key(OsRng);
                db.insert(ENCRYPTION_KEY, key.as_slice())?;
                db.flush()?;
                Aes256Gcm::new(&key)
            }
        };

        info!(
            path = %storage_path.display(),
            max_gb,
            used_bytes,
            "Block store opened"
        );
        Ok(Self {
            db,
            max_bytes,
            cipher,
        })
    }

    /// Returns `false` when the block would exceed the configured capacity.
    pub fn save_block(&self, cid: &str, name: &str, raw_data: &[u8]) -> Result<bool> {
        let key = block_key(cid);
        let existing_len = self.db.get(&key)?.map(|v| v.len() as u64).unwrap_or(0);
        let used_bytes = read_used_bytes(&self.db)?;

        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let encrypted = self
            .cipher
            .encrypt(&nonce, raw_data)
            .map_err(|e| anyhow::anyhow!("block encryption failed: {e}"))?;
        let mut payload = nonce.to_vec();
        payload.extend_from_slice(&encrypted);

        let projected = used_bytes
            .saturating_sub(existing_len)
            .saturating_add(payload.len() as u64);
        if projected > self.max_bytes {
            return Ok(false);
        }

        let meta = BlockMeta {
            name: name.to_string(),
            size: raw_data.len() as u64,
        };
        self.db.insert(key, payload)?;
        self.db.insert(meta_key(cid), bincode::serialize(&meta)?)?;
        write_used_bytes(&self.db, projected)?;
        Ok(true)
    }

    pub fn retrieve_block(&self, cid: &str) -> Result<Option<StoredBlock>> {
        let Some(payload) = self.db.get(block_key(cid))? else {
            return Ok(None);
        };
        let Some(meta) = self.block_meta(cid)? else {
            return Ok(None);
        };
        if payload.len() < 12 {
            anyhow::bail!("block {cid} is truncated");
        }
        let nonce = Nonce::from_slice(&payload[0..12]);
        let data = self
            .cipher
            .decrypt(nonce, &payload[12..])
            .map_err(|e| anyhow::anyhow!("block {cid} failed to decrypt: {e}"))?;
        Ok(Some(StoredBlock {
            name: meta.name,
            data,
        }))
    }

    pub fn block_meta(&self, cid: &str) -> Result<Option<BlockMeta>> {
        let Some(raw) = self.db.get(meta_key(cid))? else {
            return Ok(None);
        };
        Ok(Some(bincode::deserialize(&raw)?))
    }

    pub fn has_block(&self, cid: &str) -> Result<bool> {
        Ok(self.db.contains_key(block_key(cid))?)
    }

    pub fn delete_block(&self, cid: &str) -> Result<bool> {
        self.db.remove(meta_key(cid))?;
        if let Some(v) = self.db.remove(block_key(cid))? {
            let used_bytes = read_used_bytes(&self.db)?;
            write_used_bytes(&self.db, used_bytes.saturating_sub(v.len() as u64))?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    pub fn pin(&self, cid: &str) -> Result<()> {
        self.db.insert(pin_key(cid), Vec::<u8>::new())?;
        Ok(())
    }

    /// Returns `false` when `cid` was not pinned.
    pub fn unpin(&self, cid: &str) -> Result<bool> {
        Ok(self.db.remove(pin_key(cid))?.is_some())
    }

    pub fn is_pinned(&self, cid: &str) -> Result<bool> {
        Ok(self.db.contains_key(pin_key(cid))?)
    }

    pub fn pins(&self) -> Result<Vec<String>> {
        self.db
            .scan_prefix(PIN_PREFIX)
            .keys()
            .map(|key| {
                let key = key?;
                Ok(String::from_utf8_lossy(&key[PIN_PREFIX.len()..]).into_owned())
            })
            .collect()
    }

    pub fn get_used_bytes(&self) -> u64 {
        read_used_bytes(&self.db).unwrap_or(0)
    }

    pub fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }
}

fn block_key(cid: &str) -> String {
    format!("{BLOCK_PREFIX}{cid}")
}

fn meta_key(cid: &str) -> String {
    format!("{META_PREFIX}{cid}")
}

fn pin_key(cid: &str) -> String {
    format!("{PIN_PREFIX}{cid}")
}

fn read_used_bytes(db: &Db) -> Result<u64, sled::Error> {
    let Some(v) = db.get(USED_BYTES_KEY)? else {
        return Ok(0);
    };
    if v.len() != 8 {
        return Ok(0);
    }
    let mut arr = [0u8; 8];
    arr.copy_from_slice(&v);
    Ok(u64::from_le_bytes(arr))
}

fn write_used_bytes(db: &Db, bytes: u64) -> Result<(), sled::Error> {
    db.insert(USED_BYTES_KEY, bytes.to_le_bytes().to_vec())?;
    Ok(())
}
