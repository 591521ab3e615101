//! Storage module for header and match persistence

pub mod persistence;

pub use persistence::{
    ChainStore, FileStore, MatchRecord, MemoryStore, StorageError, HEADERS_FILE, MATCHES_FILE,
    META_FILE,
};
