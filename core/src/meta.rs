//! File-backed metadata store.
//!
//! The store holds one JSON document: node identity, id sequences, data
//! nodes, databases and users. `view` reads a consistent snapshot under
//! the read lock; `update` runs against a copy and commits it by writing
//! a temp file and renaming over the live one, so a failed update leaves
//! both the file and the in-memory snapshot untouched.

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use serde::{Deserialize, Serialize};

use crate::catalog::{DataNode, DatabaseInfo, User};
use crate::error::{Error, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct MetaData {
    #[serde(default)]
    id: u64,
    next_data_node_id: u64,
    next_shard_group_id: u64,
    next_shard_id: u64,
    #[serde(default)]
    data_nodes: Vec<DataNode>,
    #[serde(default)]
    databases: HashMap<String, DatabaseInfo>,
    #[serde(default)]
    users: HashMap<String, User>,
}

impl Default for MetaData {
    fn default() -> MetaData {
        MetaData {
            id: 0,
            next_data_node_id: 1,
            next_shard_group_id: 1,
            next_shard_id: 1,
            data_nodes: Vec::new(),
            databases: HashMap::new(),
            users: HashMap::new(),
        }
    }
}

pub struct Metastore {
    path: PathBuf,
    state: RwLock<MetaData>,
}

impl Metastore {
    /// Opens the store at `path`, creating an empty document if none
    /// exists yet.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Metastore> {
        let path = path.as_ref().to_path_buf();
        let data = match fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                let data = MetaData::default();
                write_atomic(&path, &data)?;
                data
            }
            Err(err) => return Err(Error::Io(err)),
        };
        Ok(Metastore {
            path,
            state: RwLock::new(data),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Runs `f` against a consistent read snapshot.
    pub fn view<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&MetaView<'_>) -> Result<R>,
    {
        let data = self
            .state
            .read()
            .map_err(|_| Error::LockPoisoned("metastore read"))?;
        f(&MetaView { data: &data })
    }

    /// Runs `f` against a copy of the document; on success the copy is
    /// atomically persisted and becomes the live snapshot.
    pub fn update<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&mut MetaTx<'_>) -> Result<R>,
    {
        let mut state = self
            .state
            .write()
            .map_err(|_| Error::LockPoisoned("metastore write"))?;
        let mut copy = state.clone();
        let out = f(&mut MetaTx { data: &mut copy })?;
        write_atomic(&self.path, &copy)?;
        *state = copy;
        Ok(out)
    }

    /// Size in bytes of the persisted document.
    pub fn size(&self) -> Result<u64> {
        let _guard = self
            .state
            .read()
            .map_err(|_| Error::LockPoisoned("metastore read"))?;
        Ok(fs::metadata(&self.path)?.len())
    }

    /// Copies the persisted document to a writer, for cluster join.
    pub fn copy_to<W: Write>(&self, w: &mut W) -> Result<u64> {
        let _guard = self
            .state
            .read()
            .map_err(|_| Error::LockPoisoned("metastore read"))?;
        let bytes = fs::read(&self.path)?;
        w.write_all(&bytes)?;
        Ok(bytes.len() as u64)
    }
}

fn write_atomic(path: &Path, data: &MetaData) -> Result<()> {
    let tmp = path.with_extension("tmp");
    let bytes = serde_json::to_vec_pretty(data)?;
    fs::write(&tmp, bytes)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

/// Read access to a metastore snapshot.
pub struct MetaView<'a> {
    data: &'a MetaData,
}

impl MetaView<'_> {
    pub fn id(&self) -> u64 {
        self.data.id
    }

    pub fn data_nodes(&self) -> Vec<DataNode> {
        self.data.data_nodes.clone()
    }

    pub fn databases(&self) -> Vec<DatabaseInfo> {
        self.data.databases.values().cloned().collect()
    }

    pub fn users(&self) -> Vec<User> {
        self.data.users.values().cloned().collect()
    }
}

/// Read/write access within an `update`.
pub struct MetaTx<'a> {
    data: &'a mut MetaData,
}

impl MetaTx<'_> {
    pub fn id(&self) -> u64 {
        self.data.id
    }

    pub fn set_id(&mut self, id: u64) {
        self.data.id = id;
    }

    pub fn next_data_node_id(&mut self) -> u64 {
        let id = self.data.next_data_node_id;
        self.data.next_data_node_id += 1;
        id
    }

    pub fn next_shard_group_id(&mut self) -> u64 {
        let id = self.data.next_shard_group_id;
        self.data.next_shard_group_id += 1;
        id
    }

    pub fn next_shard_id(&mut self) -> u64 {
        let id = self.data.next_shard_id;
        self.data.next_shard_id += 1;
        id
    }

    pub fn save_data_node(&mut self, node: &DataNode) {
        self.data.data_nodes.retain(|n| n.id != node.id);
        self.data.data_nodes.push(node.clone());
        self.data.data_nodes.sort_by_key(|n| n.id);
    }

    pub fn delete_data_node(&mut self, id: u64) {
        self.data.data_nodes.retain(|n| n.id != id);
    }

    pub fn save_database(&mut self, db: &DatabaseInfo) {
        self.data.databases.insert(db.name.clone(), db.clone());
    }

    pub fn delete_database(&mut self, name: &str) {
        self.data.databases.remove(name);
    }

    pub fn save_user(&mut self, user: &User) {
        self.data.users.insert(user.name.clone(), user.clone());
    }

    pub fn delete_user(&mut self, name: &str) {
        self.data.users.remove(name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn update_persists_and_reopens() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("meta");
        {
            let meta = Metastore::open(&path).unwrap();
            meta.update(|tx| {
                let id = tx.next_data_node_id();
                tx.save_data_node(&DataNode {
                    id,
                    url: "http://localhost:8086".into(),
                });
                tx.set_id(id);
                Ok(())
            })
            .unwrap();
        }

        let meta = Metastore::open(&path).unwrap();
        meta.view(|v| {
            assert_eq!(v.id(), 1);
            assert_eq!(v.data_nodes().len(), 1);
            Ok(())
        })
        .unwrap();
        // The sequence advanced past the allocated id.
        meta.update(|tx| {
            assert_eq!(tx.next_data_node_id(), 2);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn failed_update_leaves_snapshot_unchanged() {
        let tmp = TempDir::new().unwrap();
        let meta = Metastore::open(tmp.path().join("meta")).unwrap();

        let err = meta.update(|tx| {
            tx.save_database(&DatabaseInfo::new("doomed"));
            Err::<(), _>(Error::DatabaseExists)
        });
        assert!(err.is_err());

        meta.view(|v| {
            assert!(v.databases().is_empty());
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn copy_matches_file_size() {
        let tmp = TempDir::new().unwrap();
        let meta = Metastore::open(tmp.path().join("meta")).unwrap();
        meta.update(|tx| {
            tx.save_database(&DatabaseInfo::new("db"));
            Ok(())
        })
        .unwrap();

        let mut out = Vec::new();
        let n = meta.copy_to(&mut out).unwrap();
        assert_eq!(n, meta.size().unwrap());
        assert_eq!(out.len() as u64, n);
    }
}
