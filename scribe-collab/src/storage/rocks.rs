//! RocksDB-backed document store.
//!
//! Column families:
//! - `documents` — `{version, lz4(content)}` per document, one record so a
//!   single point read returns a consistent pair
//! - `steps`     — LZ4-compressed steps keyed by `doc_id:16 ‖ version:8 BE`
//! - `metadata`  — [`DocumentMetadata`] per document
//!
//! Commits run in an optimistic transaction. The document record is read
//! with `get_for_update`, so two commits racing on the same document cannot
//! both pass validation; the loser surfaces as [`StoreError::Conflict`].

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamily, ColumnFamilyDescriptor, DBCompressionType,
    Direction, ErrorKind, IteratorMode, OptimisticTransactionDB, OptimisticTransactionOptions,
    Options, SingleThreaded, SliceTransform, WriteOptions,
};
use serde::{Deserialize, Serialize};

use scribe_core::{DocumentId, DocumentSnapshot, Step};

use super::{check_contiguous, DocumentMetadata, DocumentStore, StoreError};

const CF_DOCUMENTS: &str = "documents";
const CF_STEPS: &str = "steps";
const CF_METADATA: &str = "metadata";

const COLUMN_FAMILIES: &[&str] = &[CF_DOCUMENTS, CF_STEPS, CF_METADATA];

const DELETE_ATTEMPTS: u32 = 3;

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 256MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// Fsync every commit (default: false)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 512)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 64MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("scribe_data"),
            block_cache_size: 256 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 512,
            write_buffer_size: 64 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Small caches, caller-provided directory.
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024,
        }
    }
}

/// Value of the `documents` column family.
#[derive(Debug, Serialize, Deserialize)]
struct DocumentRecord {
    version: u64,
    /// `lz4_flex::compress_prepend_size` output
    content: Vec<u8>,
}

impl DocumentRecord {
    fn new(version: u64, content: &[u8]) -> Self {
        Self {
            version,
            content: lz4_flex::compress_prepend_size(content),
        }
    }

    fn content(&self) -> Result<Vec<u8>, StoreError> {
        lz4_flex::decompress_size_prepended(&self.content)
            .map_err(|e| StoreError::Compression(e.to_string()))
    }
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, StoreError> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| StoreError::Serialization(e.to_string()))
}

fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T, StoreError> {
    let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| StoreError::Serialization(e.to_string()))?;
    Ok(value)
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

/// RocksDB-backed document store.
pub struct RocksStore {
    db: OptimisticTransactionDB<SingleThreaded>,
    config: StoreConfig,
}

impl RocksStore {
    /// Open the store, creating the database and column families if needed.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.set_max_total_wal_size(128 * 1024 * 1024);
        db_opts.increase_parallelism(num_cpus());

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config)))
            .collect();

        let db = OptimisticTransactionDB::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;
        log::info!("Opened document store at {}", config.path.display());

        Ok(Self { db, config })
    }

    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        block_opts.set_block_size(16 * 1024);
        opts.set_block_based_table_factory(&block_opts);

        // Payloads are already LZ4-compressed by us.
        opts.set_compression_type(DBCompressionType::None);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            CF_DOCUMENTS | CF_METADATA => {
                opts.set_max_write_buffer_number(2);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            CF_STEPS => {
                // Many small appends, prefix-scanned by doc_id
                opts.set_max_write_buffer_number(4);
                opts.set_prefix_extractor(SliceTransform::create_fixed_prefix(16));
            }
            _ => {}
        }

        opts
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    // ─── Documents ────────────────────────────────────────────────────

    pub fn create(&self, document_id: DocumentId, initial_content: &[u8]) -> Result<(), StoreError> {
        let cf_docs = self.cf(CF_DOCUMENTS)?;
        let cf_meta = self.cf(CF_METADATA)?;
        let key = document_id.as_bytes();

        let txn = self.db.transaction_opt(&self.write_options(), &OptimisticTransactionOptions::default());
        if txn.get_for_update_cf(cf_docs, key, true)?.is_some() {
            return Err(StoreError::AlreadyExists(document_id));
        }
        let record = DocumentRecord::new(0, initial_content);
        let meta = DocumentMetadata::new(
            document_id,
            initial_content.len() as u64,
            record.content.len() as u64,
        );
        txn.put_cf(cf_docs, key, encode(&record)?)?;
        txn.put_cf(cf_meta, key, encode(&meta)?)?;
        txn.commit().map_err(|e| match e.kind() {
            ErrorKind::Busy | ErrorKind::TryAgain => StoreError::AlreadyExists(document_id),
            _ => e.into(),
        })?;

        log::debug!("Created document {document_id}");
        Ok(())
    }

    /// Delete a document with its metadata and steps. A delete that races a
    /// commit is retried; one that races another delete reports `NotFound`.
    pub fn delete(&self, document_id: DocumentId) -> Result<(), StoreError> {
        let mut attempt = 1;
        loop {
            match self.try_delete(document_id) {
                Err(StoreError::Contended(_)) if attempt < DELETE_ATTEMPTS => {
                    log::debug!("Delete of {document_id} raced a write, retrying");
                    attempt += 1;
                }
                result => return result,
            }
        }
    }

    fn try_delete(&self, document_id: DocumentId) -> Result<(), StoreError> {
        let cf_docs = self.cf(CF_DOCUMENTS)?;
        let cf_meta = self.cf(CF_METADATA)?;
        let cf_steps = self.cf(CF_STEPS)?;
        let key = document_id.as_bytes();

        let txn = self.db.transaction_opt(&self.write_options(), &OptimisticTransactionOptions::default());
        if txn.get_for_update_cf(cf_docs, key, true)?.is_none() {
            return Err(StoreError::NotFound(document_id));
        }
        txn.delete_cf(cf_docs, key)?;
        txn.delete_cf(cf_meta, key)?;

        let start_key = step_key(document_id, 0);
        let iter = self
            .db
            .iterator_cf(cf_steps, IteratorMode::From(&start_key, Direction::Forward));
        let mut removed = 0u64;
        for item in iter {
            let (k, _) = item?;
            if k.len() < 24 || &k[..16] != key {
                break;
            }
            txn.delete_cf(cf_steps, &k)?;
            removed += 1;
        }
        txn.commit().map_err(|e| match e.kind() {
            ErrorKind::Busy | ErrorKind::TryAgain => match self.load_record(document_id) {
                Err(StoreError::NotFound(_)) => StoreError::NotFound(document_id),
                _ => StoreError::Contended(document_id),
            },
            _ => e.into(),
        })?;

        log::debug!("Deleted document {document_id} and {removed} steps");
        Ok(())
    }

    pub fn current(&self, document_id: DocumentId) -> Result<DocumentSnapshot, StoreError> {
        let record = self.load_record(document_id)?;
        Ok(DocumentSnapshot::new(record.version, record.content()?))
    }

    /// Compare-and-commit `steps` and `new_content`.
    pub fn commit(
        &self,
        document_id: DocumentId,
        expected_base: u64,
        steps: &[Step],
        new_content: &[u8],
    ) -> Result<u64, StoreError> {
        check_contiguous(expected_base, steps)?;

        let cf_docs = self.cf(CF_DOCUMENTS)?;
        let cf_meta = self.cf(CF_METADATA)?;
        let cf_steps = self.cf(CF_STEPS)?;
        let key = document_id.as_bytes();

        let txn = self.db.transaction_opt(&self.write_options(), &OptimisticTransactionOptions::default());
        let stored: DocumentRecord = match txn.get_for_update_cf(cf_docs, key, true)? {
            Some(bytes) => decode(&bytes)?,
            None => return Err(StoreError::NotFound(document_id)),
        };
        if stored.version != expected_base {
            return Err(StoreError::Conflict {
                expected: expected_base,
                actual: stored.version,
            });
        }
        if steps.is_empty() {
            return Ok(stored.version);
        }

        let new_version = expected_base + steps.len() as u64;
        for step in steps {
            let value = lz4_flex::compress_prepend_size(&encode(step)?);
            txn.put_cf(cf_steps, step_key(document_id, step.version), value)?;
        }

        let record = DocumentRecord::new(new_version, new_content);
        let mut meta = match txn.get_cf(cf_meta, key)? {
            Some(bytes) => decode(&bytes)?,
            None => DocumentMetadata::new(document_id, 0, 0),
        };
        meta.record_commit(
            new_version,
            steps.len() as u64,
            new_content.len() as u64,
            record.content.len() as u64,
        );
        txn.put_cf(cf_docs, key, encode(&record)?)?;
        txn.put_cf(cf_meta, key, encode(&meta)?)?;

        match txn.commit() {
            Ok(()) => Ok(new_version),
            Err(e) if matches!(e.kind(), ErrorKind::Busy | ErrorKind::TryAgain) => {
                // Another commit on this document won the race.
                let actual = self.load_record(document_id)?.version;
                log::debug!("Commit on {document_id} lost a race at base {expected_base}");
                Err(StoreError::Conflict {
                    expected: expected_base,
                    actual,
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    // ─── Steps ────────────────────────────────────────────────────────

    /// Steps with `version > from_version`, in version order.
    pub fn steps_after(
        &self,
        document_id: DocumentId,
        from_version: u64,
    ) -> Result<Vec<Step>, StoreError> {
        let record = self.load_record(document_id)?;
        if from_version >= record.version {
            return Ok(Vec::new());
        }

        let cf = self.cf(CF_STEPS)?;
        let start_key = step_key(document_id, from_version.saturating_add(1));
        let iter = self
            .db
            .iterator_cf(cf, IteratorMode::From(&start_key, Direction::Forward));

        let mut steps = Vec::new();
        for item in iter {
            let (key, value) = item?;
            if key.len() < 24 || &key[..16] != document_id.as_bytes() {
                break;
            }
            let bytes = lz4_flex::decompress_size_prepended(&value)
                .map_err(|e| StoreError::Compression(e.to_string()))?;
            steps.push(decode::<Step>(&bytes)?);
        }
        Ok(steps)
    }

    // ─── Metadata ─────────────────────────────────────────────────────

    pub fn load_metadata(&self, document_id: DocumentId) -> Result<DocumentMetadata, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        match self.db.get_cf(cf, document_id.as_bytes())? {
            Some(bytes) => decode(&bytes),
            None => Err(StoreError::NotFound(document_id)),
        }
    }

    pub fn document_ids(&self) -> Result<Vec<DocumentId>, StoreError> {
        let cf = self.cf(CF_DOCUMENTS)?;
        let mut ids = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (key, _) = item?;
            let bytes: [u8; 16] = key
                .as_ref()
                .try_into()
                .map_err(|_| StoreError::Serialization("invalid document key".into()))?;
            ids.push(DocumentId::from_bytes(bytes));
        }
        Ok(ids)
    }

    /// Flush memtables to disk.
    pub fn flush(&self) -> Result<(), StoreError> {
        for name in COLUMN_FAMILIES {
            self.db.flush_cf(self.cf(name)?)?;
        }
        Ok(())
    }

    // ─── Helpers ──────────────────────────────────────────────────────

    fn load_record(&self, document_id: DocumentId) -> Result<DocumentRecord, StoreError> {
        let cf = self.cf(CF_DOCUMENTS)?;
        match self.db.get_cf(cf, document_id.as_bytes())? {
            Some(bytes) => decode(&bytes),
            None => Err(StoreError::NotFound(document_id)),
        }
    }

    fn write_options(&self) -> WriteOptions {
        let mut opts = WriteOptions::default();
        opts.set_sync(self.config.sync_writes);
        opts
    }

    fn cf(&self, name: &str) -> Result<&ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("column family '{name}' not found")))
    }
}

#[async_trait]
impl DocumentStore for RocksStore {
    async fn create_document(
        &self,
        document_id: DocumentId,
        initial_content: Vec<u8>,
    ) -> Result<(), StoreError> {
        self.create(document_id, &initial_content)
    }

    async fn delete_document(&self, document_id: DocumentId) -> Result<(), StoreError> {
        self.delete(document_id)
    }

    async fn read_current(&self, document_id: DocumentId) -> Result<DocumentSnapshot, StoreError> {
        self.current(document_id)
    }

    async fn commit_steps(
        &self,
        document_id: DocumentId,
        expected_base: u64,
        steps: Vec<Step>,
        new_content: Vec<u8>,
    ) -> Result<u64, StoreError> {
        self.commit(document_id, expected_base, &steps, &new_content)
    }

    async fn read_steps_after(
        &self,
        document_id: DocumentId,
        from_version: u64,
    ) -> Result<Vec<Step>, StoreError> {
        self.steps_after(document_id, from_version)
    }

    async fn metadata(&self, document_id: DocumentId) -> Result<DocumentMetadata, StoreError> {
        self.load_metadata(document_id)
    }

    async fn list_documents(&self) -> Result<Vec<DocumentId>, StoreError> {
        self.document_ids()
    }
}

/// Step key: doc_id (16 bytes) + version (8 bytes big-endian).
fn step_key(document_id: DocumentId, version: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(24);
    key.extend_from_slice(document_id.as_bytes());
    key.extend_from_slice(&version.to_be_bytes());
    key
}

fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}

#[cfg(test)]
mod tests {
    use super::*;
    use scribe_core::{ClientId, Operation};

    fn open(dir: &tempfile::TempDir) -> RocksStore {
        RocksStore::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap()
    }

    fn steps(range: std::ops::RangeInclusive<u64>) -> Vec<Step> {
        range
            .map(|v| {
                Step::new(
                    v,
                    Operation::from_bytes(format!("op-{v}").into_bytes()),
                    ClientId::new("tester"),
                )
            })
            .collect()
    }

    #[test]
    fn test_store_open() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&dir);
        assert!(store.path().exists());
        assert!(store.document_ids().unwrap().is_empty());
    }

    #[test]
    fn test_create_read() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&dir);
        let id = DocumentId::new_v4();

        store.create(id, b"initial").unwrap();
        let snap = store.current(id).unwrap();
        assert_eq!(snap.version, 0);
        assert_eq!(snap.content, b"initial");
        assert_eq!(store.create(id, b""), Err(StoreError::AlreadyExists(id)));
        let missing = DocumentId::new_v4();
        assert_eq!(store.current(missing), Err(StoreError::NotFound(missing)));
    }

    #[test]
    fn test_commit_and_steps_after() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&dir);
        let id = DocumentId::new_v4();
        store.create(id, b"").unwrap();

        assert_eq!(store.commit(id, 0, &steps(1..=3), b"abc").unwrap(), 3);
        assert_eq!(store.commit(id, 3, &steps(4..=5), b"abcde").unwrap(), 5);

        let all = store.steps_after(id, 0).unwrap();
        assert_eq!(all, steps(1..=5));
        let tail = store.steps_after(id, 3).unwrap();
        assert_eq!(tail.iter().map(|s| s.version).collect::<Vec<_>>(), vec![4, 5]);
        assert!(store.steps_after(id, 5).unwrap().is_empty());

        let snap = store.current(id).unwrap();
        assert_eq!(snap.version, 5);
        assert_eq!(snap.content, b"abcde");
    }

    #[test]
    fn test_conflict_leaves_state_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&dir);
        let id = DocumentId::new_v4();
        store.create(id, b"").unwrap();
        store.commit(id, 0, &steps(1..=2), b"ab").unwrap();

        let err = store.commit(id, 1, &steps(2..=2), b"zz").unwrap_err();
        assert_eq!(err, StoreError::Conflict { expected: 1, actual: 2 });
        assert_eq!(store.current(id).unwrap().content, b"ab");
        assert_eq!(store.steps_after(id, 0).unwrap(), steps(1..=2));
    }

    #[test]
    fn test_non_contiguous_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&dir);
        let id = DocumentId::new_v4();
        store.create(id, b"").unwrap();
        assert!(matches!(
            store.commit(id, 0, &steps(3..=3), b"x"),
            Err(StoreError::NonContiguous { expected: 1, found: 3 })
        ));
    }

    #[test]
    fn test_documents_isolated() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&dir);
        let a = DocumentId::new_v4();
        let b = DocumentId::new_v4();
        store.create(a, b"").unwrap();
        store.create(b, b"").unwrap();
        store.commit(a, 0, &steps(1..=4), b"aaaa").unwrap();
        store.commit(b, 0, &steps(1..=2), b"bb").unwrap();

        assert_eq!(store.steps_after(a, 0).unwrap().len(), 4);
        assert_eq!(store.steps_after(b, 0).unwrap().len(), 2);
        let mut ids = store.document_ids().unwrap();
        ids.sort();
        let mut expected = vec![a, b];
        expected.sort();
        assert_eq!(ids, expected);
    }

    #[test]
    fn test_delete_removes_steps() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&dir);
        let id = DocumentId::new_v4();
        store.create(id, b"").unwrap();
        store.commit(id, 0, &steps(1..=3), b"abc").unwrap();

        store.delete(id).unwrap();
        assert_eq!(store.current(id), Err(StoreError::NotFound(id)));
        assert_eq!(store.steps_after(id, 0), Err(StoreError::NotFound(id)));
        assert_eq!(store.load_metadata(id), Err(StoreError::NotFound(id)));
        assert_eq!(store.delete(id), Err(StoreError::NotFound(id)));
    }

    #[test]
    fn test_metadata_tracks_commits() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&dir);
        let id = DocumentId::new_v4();
        store.create(id, b"").unwrap();
        let content = "The quick brown fox jumps over the lazy dog. ".repeat(50);
        store.commit(id, 0, &steps(1..=1), content.as_bytes()).unwrap();

        let meta = store.load_metadata(id).unwrap();
        assert_eq!(meta.version, 1);
        assert_eq!(meta.step_count, 1);
        assert_eq!(meta.content_size, content.len() as u64);
        assert!(meta.compressed_size < meta.content_size);
    }

    #[test]
    fn test_store_config_default() {
        let config = StoreConfig::default();
        assert_eq!(config.block_cache_size, 256 * 1024 * 1024);
        assert_eq!(config.bloom_filter_bits, 10);
        assert!(!config.sync_writes);
    }
}
