//! Shards and the per-shard durable store.
//!
//! A shard is one partition of a shard group, placed on one or more data
//! nodes. The store is a replayable append log: every write is appended
//! to the shard file and indexed in memory by `(series id, timestamp)`,
//! so reopening a shard replays its log into an identical index.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use common::time::UnixNano;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Catalog record of one shard: its id and the data nodes holding a
/// replica. The open store lives outside the catalog, keyed by shard id
/// on the owning node.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Shard {
    pub id: u64,
    #[serde(rename = "nodeIDs", default)]
    pub data_node_ids: Vec<u64>,
}

impl Shard {
    pub fn new(id: u64, data_node_ids: Vec<u64>) -> Shard {
        Shard { id, data_node_ids }
    }

    /// True if the given node holds a replica of this shard.
    pub fn has_data_node_id(&self, id: u64) -> bool {
        self.data_node_ids.contains(&id)
    }
}

// On-disk record framing: series id, timestamp, payload length, payload.
// All integers big-endian.
const RECORD_HEADER_SIZE: usize = 4 + 8 + 4;

struct StoreInner {
    file: File,
    index: BTreeMap<(u32, UnixNano), Vec<u8>>,
}

/// Durable map from `(series id, timestamp)` to an encoded field
/// payload, backed by an append log.
pub struct ShardStore {
    path: PathBuf,
    inner: Mutex<StoreInner>,
}

impl ShardStore {
    /// Opens (or creates) the store at `path`, replaying any existing
    /// log. A truncated trailing record is discarded.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<ShardStore> {
        let path = path.as_ref().to_path_buf();
        let mut file = OpenOptions::new()
            .read(true)
            .create(true)
            .append(true)
            .open(&path)?;

        let mut raw = Vec::new();
        file.read_to_end(&mut raw)?;

        let mut index = BTreeMap::new();
        let mut offset = 0usize;
        while raw.len() - offset >= RECORD_HEADER_SIZE {
            let series_id = u32::from_be_bytes(raw[offset..offset + 4].try_into().unwrap());
            let timestamp = i64::from_be_bytes(raw[offset + 4..offset + 12].try_into().unwrap());
            let len = u32::from_be_bytes(raw[offset + 12..offset + 16].try_into().unwrap()) as usize;
            if raw.len() - offset - RECORD_HEADER_SIZE < len {
                break;
            }
            let start = offset + RECORD_HEADER_SIZE;
            index.insert((series_id, timestamp), raw[start..start + len].to_vec());
            offset += RECORD_HEADER_SIZE + len;
        }
        if offset < raw.len() {
            log::warn!(
                "shard {}: discarding {} trailing bytes of partial record",
                path.display(),
                raw.len() - offset
            );
            file.set_len(offset as u64)?;
        }

        Ok(ShardStore {
            path,
            inner: Mutex::new(StoreInner { file, index }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Writes one sample. With `overwrite` false, an existing sample at
    /// the same key is left in place.
    pub fn write_series(
        &self,
        series_id: u32,
        timestamp: UnixNano,
        data: &[u8],
        overwrite: bool,
    ) -> Result<()> {
        let mut inner = self
            .inner
            .lock()
            .map_err(|_| Error::LockPoisoned("shard store"))?;
        if !overwrite && inner.index.contains_key(&(series_id, timestamp)) {
            return Ok(());
        }

        let mut record = Vec::with_capacity(RECORD_HEADER_SIZE + data.len());
        record.extend_from_slice(&series_id.to_be_bytes());
        record.extend_from_slice(&timestamp.to_be_bytes());
        record.extend_from_slice(&(data.len() as u32).to_be_bytes());
        record.extend_from_slice(data);
        inner.file.write_all(&record)?;
        inner.file.flush()?;

        inner.index.insert((series_id, timestamp), data.to_vec());
        Ok(())
    }

    /// Reads the sample at an exact `(series id, timestamp)` key.
    pub fn read_series(&self, series_id: u32, timestamp: UnixNano) -> Result<Option<Vec<u8>>> {
        let inner = self
            .inner
            .lock()
            .map_err(|_| Error::LockPoisoned("shard store"))?;
        Ok(inner.index.get(&(series_id, timestamp)).cloned())
    }

    /// Reads every sample of a series within `[start, end)`, ascending
    /// by timestamp.
    pub fn read_range(
        &self,
        series_id: u32,
        start: UnixNano,
        end: UnixNano,
    ) -> Result<Vec<(UnixNano, Vec<u8>)>> {
        let inner = self
            .inner
            .lock()
            .map_err(|_| Error::LockPoisoned("shard store"))?;
        Ok(inner
            .index
            .range((series_id, start)..(series_id, end))
            .map(|((_, ts), data)| (*ts, data.clone()))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn write_read_round_trip() {
        let tmp = TempDir::new().unwrap();
        let store = ShardStore::open(tmp.path().join("1")).unwrap();

        store.write_series(7, 1000, b"abc", true).unwrap();
        assert_eq!(store.read_series(7, 1000).unwrap().unwrap(), b"abc");
        assert!(store.read_series(7, 2000).unwrap().is_none());
        assert!(store.read_series(8, 1000).unwrap().is_none());
    }

    #[test]
    fn overwrite_semantics() {
        let tmp = TempDir::new().unwrap();
        let store = ShardStore::open(tmp.path().join("1")).unwrap();

        store.write_series(1, 10, b"old", true).unwrap();
        store.write_series(1, 10, b"kept", false).unwrap();
        assert_eq!(store.read_series(1, 10).unwrap().unwrap(), b"old");
        store.write_series(1, 10, b"new", true).unwrap();
        assert_eq!(store.read_series(1, 10).unwrap().unwrap(), b"new");
    }

    #[test]
    fn reopen_replays_log() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("1");
        {
            let store = ShardStore::open(&path).unwrap();
            store.write_series(1, 10, b"a", true).unwrap();
            store.write_series(2, 20, b"b", true).unwrap();
        }
        let store = ShardStore::open(&path).unwrap();
        assert_eq!(store.read_series(1, 10).unwrap().unwrap(), b"a");
        assert_eq!(store.read_series(2, 20).unwrap().unwrap(), b"b");
    }

    #[test]
    fn range_reads_are_ordered_and_bounded() {
        let tmp = TempDir::new().unwrap();
        let store = ShardStore::open(tmp.path().join("1")).unwrap();
        store.write_series(1, 30, b"c", true).unwrap();
        store.write_series(1, 10, b"a", true).unwrap();
        store.write_series(1, 20, b"b", true).unwrap();
        store.write_series(2, 15, b"x", true).unwrap();

        let rows = store.read_range(1, 10, 30).unwrap();
        assert_eq!(
            rows,
            vec![(10, b"a".to_vec()), (20, b"b".to_vec())],
        );
    }

    #[test]
    fn partial_trailing_record_is_discarded() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("1");
        {
            let store = ShardStore::open(&path).unwrap();
            store.write_series(1, 10, b"ok", true).unwrap();
        }
        // Simulate a crash mid-append.
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&[0xde, 0xad]).unwrap();
        }
        let store = ShardStore::open(&path).unwrap();
        assert_eq!(store.read_series(1, 10).unwrap().unwrap(), b"ok");
    }
}
