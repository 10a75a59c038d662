//! Persistent store: the in-memory caches layered over RocksDB.
//!
//! Column families separate entity kinds. Writes go to the cache and the
//! database's WAL immediately; [`Store::flush`] syncs the WAL, making the
//! commit boundary the only fsync point.

use crate::{sort_topologically, InmemStore, Store, StoreError};
use filament_types::{
    Block, Event, Frame, Hash, KnownEvents, Peer, PeerSet, Root, RoundInfo,
};
use rocksdb::{ColumnFamily, ColumnFamilyDescriptor, Options, DB};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

/// On-disk name of the database directory inside the datadir. Pre-existing
/// databases are renamed `badger_db_<timestamp>` unless bootstrapping.
pub const DB_DIR_NAME: &str = "badger_db";

const CF_EVENTS: &str = "events";
const CF_PARTICIPANT: &str = "participant_events";
const CF_ROUNDS: &str = "rounds";
const CF_BLOCKS: &str = "blocks";
const CF_FRAMES: &str = "frames";
const CF_PEER_SETS: &str = "peer_sets";
const CF_ROOTS: &str = "roots";
const CF_META: &str = "meta";

const ALL_CFS: [&str; 8] = [
    CF_EVENTS,
    CF_PARTICIPANT,
    CF_ROUNDS,
    CF_BLOCKS,
    CF_FRAMES,
    CF_PEER_SETS,
    CF_ROOTS,
    CF_META,
];

const META_LAST_ROUND: &[u8] = b"last_round";
const META_LAST_CONSENSUS_ROUND: &[u8] = b"last_consensus_round";
const META_LAST_BLOCK: &[u8] = b"last_block";

/// RocksDB-backed store.
pub struct RocksStore {
    db: DB,
    cache: InmemStore,
    path: PathBuf,
}

/// Open the node's database under `datadir`.
///
/// When a database already exists and `bootstrap` is off, the old directory
/// is renamed with a timestamp suffix and a fresh one is created. With
/// `bootstrap` on, the existing database is opened read-write so the caller
/// can replay it into the hashgraph.
pub fn init_store(
    datadir: &Path,
    cache_size: usize,
    bootstrap: bool,
) -> Result<RocksStore, StoreError> {
    let db_path = datadir.join(DB_DIR_NAME);

    if db_path.exists() && !bootstrap {
        let ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or(0);
        let backup = datadir.join(format!("{DB_DIR_NAME}_{ts}"));
        info!(from = %db_path.display(), to = %backup.display(), "Backing up existing database");
        std::fs::rename(&db_path, &backup)?;
    }

    RocksStore::open(&db_path, cache_size)
}

impl RocksStore {
    /// Open or create a database at `path` and warm the caches from it.
    pub fn open(path: &Path, cache_size: usize) -> Result<Self, StoreError> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);

        let mut block_opts = rocksdb::BlockBasedOptions::default();
        let block_cache = rocksdb::Cache::new_lru_cache(64 * 1024 * 1024);
        block_opts.set_block_cache(&block_cache);
        block_opts.set_bloom_filter(10.0, false);
        opts.set_block_based_table_factory(&block_opts);

        let cf_descriptors: Vec<_> = ALL_CFS
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Options::default()))
            .collect();

        let db = DB::open_cf_descriptors(&opts, path, cf_descriptors)?;

        let mut store = RocksStore {
            db,
            cache: InmemStore::new(cache_size),
            path: path.to_path_buf(),
        };
        store.load_index()?;
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn cf(&self, name: &str) -> Result<&ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Db(format!("column family {name} not found")))
    }

    fn put<V: Serialize>(&mut self, cf: &str, key: &[u8], value: &V) -> Result<(), StoreError> {
        let bytes = bincode::serialize(value)?;
        let cf = self.cf(cf)?;
        self.db.put_cf(cf, key, bytes)?;
        Ok(())
    }

    fn get<V: DeserializeOwned>(&self, cf: &str, key: &[u8]) -> Result<Option<V>, StoreError> {
        let cf = self.cf(cf)?;
        match self.db.get_cf(cf, key)? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Rebuild the small always-resident indexes (membership, roots,
    /// participant chains, high-water marks) from disk.
    fn load_index(&mut self) -> Result<(), StoreError> {
        // Peer sets, ascending by activation round.
        let mut sets: Vec<(u64, PeerSet)> = Vec::new();
        let cf = self.cf(CF_PEER_SETS)?;
        for item in self.db.iterator_cf(cf, rocksdb::IteratorMode::Start) {
            let (key, value) = item?;
            if key.len() != 8 {
                warn!("skipping malformed peer-set key");
                continue;
            }
            let mut round_bytes = [0u8; 8];
            round_bytes.copy_from_slice(&key);
            sets.push((u64::from_be_bytes(round_bytes), bincode::deserialize(&value)?));
        }
        for (round, ps) in sets {
            self.cache.set_peer_set(round, &ps)?;
        }

        // Roots (overwrite the synthetic ones created above).
        let cf = self.cf(CF_ROOTS)?;
        let mut roots: Vec<(String, Root)> = Vec::new();
        for item in self.db.iterator_cf(cf, rocksdb::IteratorMode::Start) {
            let (key, value) = item?;
            let creator = String::from_utf8_lossy(&key).to_string();
            roots.push((creator, bincode::deserialize(&value)?));
        }
        for (creator, root) in roots {
            self.cache.set_root(&creator, &root)?;
        }

        // Participant chains: key = 66-char creator hex ++ 8-byte BE index.
        let cf = self.cf(CF_PARTICIPANT)?;
        let mut chains: Vec<(String, i64, Hash)> = Vec::new();
        for item in self.db.iterator_cf(cf, rocksdb::IteratorMode::Start) {
            let (key, value) = item?;
            if key.len() != 66 + 8 || value.len() != 32 {
                warn!("skipping malformed participant key");
                continue;
            }
            let creator = String::from_utf8_lossy(&key[..66]).to_string();
            let mut index_bytes = [0u8; 8];
            index_bytes.copy_from_slice(&key[66..]);
            let mut hash_bytes = [0u8; 32];
            hash_bytes.copy_from_slice(&value);
            chains.push((
                creator,
                u64::from_be_bytes(index_bytes) as i64,
                Hash::new(hash_bytes),
            ));
        }
        for (creator, index, hash) in chains {
            self.cache.load_participant(&creator, index, hash);
        }

        let last_round: Option<u64> = self.get(CF_META, META_LAST_ROUND)?;
        let last_consensus: Option<u64> = self.get(CF_META, META_LAST_CONSENSUS_ROUND)?;
        let last_block: Option<u64> = self.get(CF_META, META_LAST_BLOCK)?;
        self.cache.set_marks(last_round, last_consensus, last_block);

        debug!(
            last_round = ?last_round,
            last_block = ?last_block,
            "Loaded store index"
        );
        Ok(())
    }

    fn participant_key(creator: &str, index: i64) -> Vec<u8> {
        let mut key = Vec::with_capacity(creator.len() + 8);
        key.extend_from_slice(creator.as_bytes());
        key.extend_from_slice(&(index as u64).to_be_bytes());
        key
    }
}

impl Store for RocksStore {
    fn cache_size(&self) -> usize {
        self.cache.cache_size()
    }

    fn get_event(&mut self, hash: &Hash) -> Result<Event, StoreError> {
        match self.cache.get_event(hash) {
            Ok(event) => Ok(event),
            Err(e) if e.is_not_found() => {
                let event: Event = self
                    .get(CF_EVENTS, hash.as_bytes())?
                    .ok_or_else(|| StoreError::NotFound(format!("event {hash:?}")))?;
                self.cache.cache_event(*hash, event.clone());
                Ok(event)
            }
            Err(e) => Err(e),
        }
    }

    fn has_event(&mut self, hash: &Hash) -> bool {
        if self.cache.has_event(hash) {
            return true;
        }
        matches!(self.get::<Event>(CF_EVENTS, hash.as_bytes()), Ok(Some(_)))
    }

    fn set_event(&mut self, event: &Event) -> Result<(), StoreError> {
        let hash = event.hash().map_err(|e| StoreError::Db(e.to_string()))?;
        let creator = event.creator_hex();
        let before = self.cache.last_event_from(&creator)?;
        self.cache.set_event(event)?;
        let after = self.cache.last_event_from(&creator)?;

        self.put(CF_EVENTS, hash.as_bytes(), event)?;
        // Persist the index entry only when the primary chain advanced.
        if before != after {
            let key = Self::participant_key(&creator, event.body.index);
            let cf = self.cf(CF_PARTICIPANT)?;
            self.db.put_cf(cf, key, hash.as_bytes())?;
        }
        Ok(())
    }

    fn participant_event(&mut self, creator: &str, index: i64) -> Result<Hash, StoreError> {
        self.cache.participant_event(creator, index)
    }

    fn participant_events(&mut self, creator: &str, after: i64) -> Result<Vec<Hash>, StoreError> {
        self.cache.participant_events(creator, after)
    }

    fn last_event_from(&mut self, creator: &str) -> Result<Option<Hash>, StoreError> {
        self.cache.last_event_from(creator)
    }

    fn known_events(&mut self) -> KnownEvents {
        self.cache.known_events()
    }

    fn get_round(&mut self, index: u64) -> Result<RoundInfo, StoreError> {
        match self.cache.get_round(index) {
            Ok(round) => Ok(round),
            Err(e) if e.is_not_found() => {
                let round: RoundInfo = self
                    .get(CF_ROUNDS, &index.to_be_bytes())?
                    .ok_or_else(|| StoreError::NotFound(format!("round {index}")))?;
                self.cache.cache_round(index, round.clone());
                Ok(round)
            }
            Err(e) => Err(e),
        }
    }

    fn set_round(&mut self, index: u64, round: &RoundInfo) -> Result<(), StoreError> {
        self.cache.set_round(index, round)?;
        self.put(CF_ROUNDS, &index.to_be_bytes(), round)?;
        if let Some(last) = self.cache.last_round() {
            self.put(CF_META, META_LAST_ROUND, &last)?;
        }
        Ok(())
    }

    fn last_round(&self) -> Option<u64> {
        self.cache.last_round()
    }

    fn last_consensus_round(&self) -> Option<u64> {
        self.cache.last_consensus_round()
    }

    fn set_last_consensus_round(&mut self, round: u64) -> Result<(), StoreError> {
        self.cache.set_last_consensus_round(round)?;
        self.put(CF_META, META_LAST_CONSENSUS_ROUND, &round)?;
        Ok(())
    }

    fn get_frame(&mut self, round: u64) -> Result<Frame, StoreError> {
        match self.cache.get_frame(round) {
            Ok(frame) => Ok(frame),
            Err(e) if e.is_not_found() => {
                let frame: Frame = self
                    .get(CF_FRAMES, &round.to_be_bytes())?
                    .ok_or_else(|| StoreError::NotFound(format!("frame {round}")))?;
                self.cache.cache_frame(round, frame.clone());
                Ok(frame)
            }
            Err(e) => Err(e),
        }
    }

    fn set_frame(&mut self, frame: &Frame) -> Result<(), StoreError> {
        self.cache.set_frame(frame)?;
        self.put(CF_FRAMES, &frame.round.to_be_bytes(), frame)
    }

    fn get_block(&mut self, index: u64) -> Result<Block, StoreError> {
        match self.cache.get_block(index) {
            Ok(block) => Ok(block),
            Err(e) if e.is_not_found() => {
                let block: Block = self
                    .get(CF_BLOCKS, &index.to_be_bytes())?
                    .ok_or_else(|| StoreError::NotFound(format!("block {index}")))?;
                self.cache.cache_block(index, block.clone());
                Ok(block)
            }
            Err(e) => Err(e),
        }
    }

    fn set_block(&mut self, block: &Block) -> Result<(), StoreError> {
        self.cache.set_block(block)?;
        self.put(CF_BLOCKS, &block.index().to_be_bytes(), block)?;
        if let Some(last) = self.cache.last_block_index() {
            self.put(CF_META, META_LAST_BLOCK, &last)?;
        }
        Ok(())
    }

    fn last_block_index(&self) -> Option<u64> {
        self.cache.last_block_index()
    }

    fn get_peer_set(&mut self, round: u64) -> Result<PeerSet, StoreError> {
        self.cache.get_peer_set(round)
    }

    fn set_peer_set(&mut self, round: u64, peers: &PeerSet) -> Result<(), StoreError> {
        self.cache.set_peer_set(round, peers)?;
        self.put(CF_PEER_SETS, &round.to_be_bytes(), peers)?;
        // Persist any roots the cache synthesised for first-time members.
        for peer in peers.iter() {
            if let Ok(root) = self.cache.get_root(&peer.pub_key_hex) {
                self.put(CF_ROOTS, peer.pub_key_hex.as_bytes(), &root)?;
            }
        }
        Ok(())
    }

    fn peer_set_activation_rounds(&self) -> Vec<u64> {
        self.cache.peer_set_activation_rounds()
    }

    fn repertoire(&self) -> HashMap<String, Peer> {
        self.cache.repertoire()
    }

    fn get_root(&mut self, creator: &str) -> Result<Root, StoreError> {
        self.cache.get_root(creator)
    }

    fn set_root(&mut self, creator: &str, root: &Root) -> Result<(), StoreError> {
        self.cache.set_root(creator, root)?;
        self.put(CF_ROOTS, creator.as_bytes(), root)
    }

    fn flush(&mut self) -> Result<(), StoreError> {
        self.db.flush_wal(true)?;
        Ok(())
    }

    fn is_persistent(&self) -> bool {
        true
    }

    fn topological_events(&mut self) -> Result<Vec<Event>, StoreError> {
        let cf = self.cf(CF_EVENTS)?;
        let mut events = Vec::new();
        for item in self.db.iterator_cf(cf, rocksdb::IteratorMode::Start) {
            let (_, value) = item?;
            events.push(bincode::deserialize::<Event>(&value)?);
        }
        sort_topologically(events)
    }
}
