//! Header and match persistence
//!
//! `ChainStore` is the hook the node saves through. `FileStore` keeps an
//! append-only header file plus JSON metadata and matches under the data
//! directory; `MemoryStore` keeps nothing past the process.

use crate::core::{BlockHash, BlockHeader, Network, Txid};
use crate::encode::{deserialize, serialize};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::{self, BufReader, BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Consensus-encoded headers after genesis, 80 bytes each, in height order
pub const HEADERS_FILE: &str = "headers.dat";
pub const META_FILE: &str = "store.json";
pub const MATCHES_FILE: &str = "matches.json";

const HEADER_SIZE: usize = 80;

/// Storage errors
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("IO error: {0}")]
    IoError(#[from] io::Error),
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
    #[error("Invalid data: {0}")]
    InvalidData(String),
}

/// A transaction the node reported to the consumer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchRecord {
    pub txid: Txid,
    pub block_hash: Option<BlockHash>,
    pub height: Option<u32>,
    pub recorded_at: DateTime<Utc>,
}

impl MatchRecord {
    pub fn new(txid: Txid, block_hash: Option<BlockHash>, height: Option<u32>) -> Self {
        Self {
            txid,
            block_hash,
            height,
            recorded_at: Utc::now(),
        }
    }
}

/// Where the node keeps its headers and matches
pub trait ChainStore: Send + Sync {
    /// Active chain headers after genesis, in height order
    fn load_headers(&self) -> Result<Vec<BlockHeader>, StorageError>;

    /// Keep the stored headers up to `fork_height` and append `headers`
    /// after them. Genesis is never stored, so `fork_height` is also the
    /// number of headers kept.
    fn write_headers(&mut self, fork_height: u32, headers: &[BlockHeader])
        -> Result<(), StorageError>;

    fn record_match(&mut self, record: MatchRecord) -> Result<(), StorageError>;

    fn matches(&self) -> Vec<MatchRecord>;
}

/// Store that forgets everything on exit
#[derive(Debug, Default)]
pub struct MemoryStore {
    headers: Vec<BlockHeader>,
    matches: Vec<MatchRecord>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ChainStore for MemoryStore {
    fn load_headers(&self) -> Result<Vec<BlockHeader>, StorageError> {
        Ok(self.headers.clone())
    }

    fn write_headers(
        &mut self,
        fork_height: u32,
        headers: &[BlockHeader],
    ) -> Result<(), StorageError> {
        if fork_height as usize > self.headers.len() {
            return Err(StorageError::InvalidData(format!(
                "fork at height {} beyond {} stored headers",
                fork_height,
                self.headers.len()
            )));
        }
        self.headers.truncate(fork_height as usize);
        self.headers.extend_from_slice(headers);
        Ok(())
    }

    fn record_match(&mut self, record: MatchRecord) -> Result<(), StorageError> {
        self.matches.push(record);
        Ok(())
    }

    fn matches(&self) -> Vec<MatchRecord> {
        self.matches.clone()
    }
}

#[derive(Serialize, Deserialize)]
struct StoreMeta {
    network: Network,
}

/// Header, metadata and match files under a data directory
#[derive(Debug)]
pub struct FileStore {
    data_dir: PathBuf,
    network: Network,
    matches: Vec<MatchRecord>,
}

impl FileStore {
    /// Open (creating if needed) the store in `data_dir`
    pub fn open(data_dir: impl AsRef<Path>, network: Network) -> Result<Self, StorageError> {
        let data_dir = data_dir.as_ref().to_path_buf();
        fs::create_dir_all(&data_dir)?;

        let meta_path = data_dir.join(META_FILE);
        if !meta_path.exists() {
            let meta = StoreMeta { network };
            let writer = BufWriter::new(fs::File::create(&meta_path)?);
            serde_json::to_writer_pretty(writer, &meta)?;
        }

        let matches_path = data_dir.join(MATCHES_FILE);
        let matches = if matches_path.exists() {
            let reader = BufReader::new(fs::File::open(&matches_path)?);
            serde_json::from_reader(reader)?
        } else {
            Vec::new()
        };

        log::debug!("Opened file store at {}", data_dir.display());
        Ok(Self {
            data_dir,
            network,
            matches,
        })
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Write to a temporary file, then rename over the target
    fn write_atomic<T: Serialize>(&self, name: &str, value: &T) -> Result<(), StorageError> {
        let path = self.data_dir.join(name);
        let temp_path = self.data_dir.join(format!("{}.tmp", name));

        let file = fs::File::create(&temp_path)?;
        let writer = BufWriter::new(file);
        serde_json::to_writer_pretty(writer, value)?;

        fs::rename(&temp_path, &path)?;
        Ok(())
    }
}

impl ChainStore for FileStore {
    fn load_headers(&self) -> Result<Vec<BlockHeader>, StorageError> {
        let meta_path = self.data_dir.join(META_FILE);
        let reader = BufReader::new(fs::File::open(&meta_path)?);
        let meta: StoreMeta = serde_json::from_reader(reader)?;
        if meta.network != self.network {
            return Err(StorageError::InvalidData(format!(
                "{} holds {} headers, expected {}",
                self.data_dir.display(),
                meta.network,
                self.network
            )));
        }

        let path = self.data_dir.join(HEADERS_FILE);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let bytes = fs::read(&path)?;
        let chunks = bytes.chunks_exact(HEADER_SIZE);
        if !chunks.remainder().is_empty() {
            log::warn!(
                "Ignoring {} trailing bytes in {}",
                chunks.remainder().len(),
                path.display()
            );
        }
        chunks
            .map(|chunk| {
                deserialize(chunk).map_err(|e| StorageError::InvalidData(e.to_string()))
            })
            .collect()
    }

    fn write_headers(
        &mut self,
        fork_height: u32,
        headers: &[BlockHeader],
    ) -> Result<(), StorageError> {
        let path = self.data_dir.join(HEADERS_FILE);
        let mut file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)?;

        let keep = fork_height as u64 * HEADER_SIZE as u64;
        let len = file.metadata()?.len();
        if keep > len {
            return Err(StorageError::InvalidData(format!(
                "fork at height {} beyond {} stored headers",
                fork_height,
                len / HEADER_SIZE as u64
            )));
        }
        if keep < len {
            file.set_len(keep)?;
        }
        file.seek(SeekFrom::Start(keep))?;

        let mut writer = BufWriter::new(file);
        for header in headers {
            writer.write_all(&serialize(header))?;
        }
        writer.flush()?;
        Ok(())
    }

    fn record_match(&mut self, record: MatchRecord) -> Result<(), StorageError> {
        self.matches.push(record);
        self.write_atomic(MATCHES_FILE, &self.matches)
    }

    fn matches(&self) -> Vec<MatchRecord> {
        self.matches.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::chain::testing::child;
    use crate::core::NetworkParams;
    use crate::crypto::Hash256;
    use tempfile::tempdir;

    fn headers(n: usize) -> Vec<BlockHeader> {
        let mut out = Vec::new();
        let mut parent = NetworkParams::new(Network::Regtest).genesis_header();
        for i in 0..n {
            let header = child(&parent, i as u8);
            out.push(header);
            parent = header;
        }
        out
    }

    #[test]
    fn test_save_and_load_headers() {
        let dir = tempdir().unwrap();
        let mut store = FileStore::open(dir.path(), Network::Regtest).unwrap();
        assert!(store.load_headers().unwrap().is_empty());

        let chain = headers(3);
        store.write_headers(0, &chain).unwrap();
        assert_eq!(
            fs::metadata(dir.path().join(HEADERS_FILE)).unwrap().len(),
            3 * HEADER_SIZE as u64
        );

        let reopened = FileStore::open(dir.path(), Network::Regtest).unwrap();
        assert_eq!(reopened.load_headers().unwrap(), chain);
    }

    #[test]
    fn test_headers_appended_not_rewritten() {
        let dir = tempdir().unwrap();
        let mut store = FileStore::open(dir.path(), Network::Regtest).unwrap();
        let chain = headers(5);
        store.write_headers(0, &chain[..2]).unwrap();
        store.write_headers(2, &chain[2..]).unwrap();
        assert_eq!(store.load_headers().unwrap(), chain);

        // Reorg at height 3: two headers replaced by three
        let fork = child(&chain[2], 0xee);
        let branch = vec![fork, child(&fork, 1), child(&child(&fork, 1), 2)];
        store.write_headers(3, &branch).unwrap();
        let loaded = store.load_headers().unwrap();
        assert_eq!(loaded.len(), 6);
        assert_eq!(&loaded[..3], &chain[..3]);
        assert_eq!(&loaded[3..], &branch[..]);

        assert!(matches!(
            store.write_headers(7, &chain),
            Err(StorageError::InvalidData(_))
        ));
    }

    #[test]
    fn test_torn_write_ignored() {
        let dir = tempdir().unwrap();
        let mut store = FileStore::open(dir.path(), Network::Regtest).unwrap();
        store.write_headers(0, &headers(2)).unwrap();
        let mut file = OpenOptions::new()
            .append(true)
            .open(dir.path().join(HEADERS_FILE))
            .unwrap();
        file.write_all(&[0u8; 17]).unwrap();
        assert_eq!(store.load_headers().unwrap(), headers(2));
    }

    #[test]
    fn test_wrong_network_rejected() {
        let dir = tempdir().unwrap();
        let mut store = FileStore::open(dir.path(), Network::Regtest).unwrap();
        store.write_headers(0, &headers(1)).unwrap();

        let other = FileStore::open(dir.path(), Network::Testnet).unwrap();
        assert!(matches!(
            other.load_headers(),
            Err(StorageError::InvalidData(_))
        ));
    }

    #[test]
    fn test_matches_survive_reopen() {
        let dir = tempdir().unwrap();
        let mut store = FileStore::open(dir.path(), Network::Regtest).unwrap();
        let record = MatchRecord::new(Hash256::hash(b"tx"), Some(Hash256::hash(b"block")), Some(7));
        store.record_match(record.clone()).unwrap();

        let reopened = FileStore::open(dir.path(), Network::Regtest).unwrap();
        assert_eq!(reopened.matches(), vec![record]);
    }

    #[test]
    fn test_corrupt_file_is_an_error() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join(META_FILE), b"not json").unwrap();
        let store = FileStore::open(dir.path(), Network::Regtest).unwrap();
        assert!(matches!(
            store.load_headers(),
            Err(StorageError::SerializationError(_))
        ));
    }

    #[test]
    fn test_memory_store() {
        let mut store = MemoryStore::new();
        store.write_headers(0, &headers(3)).unwrap();
        store.write_headers(1, &headers(2)[1..]).unwrap();
        assert_eq!(store.load_headers().unwrap(), headers(2));
        store
            .record_match(MatchRecord::new(Hash256::hash(b"tx"), None, None))
            .unwrap();
        assert_eq!(store.matches().len(), 1);
    }
}
