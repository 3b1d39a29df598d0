//! Durable depot key store
//!
//! Persists one `config.vdf` per application under the depots root,
//! mapping depot ids to their hex-encoded decryption keys. Merges are
//! idempotent and commutative: the record is re-read, the entry set, the
//! whole mapping re-sorted and rewritten, so the file stays diff-stable
//! across runs regardless of fetch order.
//!
//! Concurrent tasks for different depots of the same application would
//! race on the same file; the read-merge-write sequence therefore runs
//! under a per-application mutex. Tasks for different applications never
//! contend.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::cdn::DepotKey;
use crate::vdf::{self, VdfNode};

/// Errors from reading or writing key-store records.
#[derive(Debug, thiserror::Error)]
pub enum KeyStoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed key store record: {0}")]
    Parse(#[from] vdf::VdfError),

    #[error("Malformed key store record: {0}")]
    Record(String),
}

/// The depot-to-key mapping for one application.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyStoreRecord {
    /// Depot id to hex-encoded decryption key, ascending by id.
    pub depots: BTreeMap<u32, String>,
}

impl KeyStoreRecord {
    /// Decode a record from VDF text.
    pub fn from_vdf(text: &str) -> Result<Self, KeyStoreError> {
        let (root, node) = vdf::parse(text)?;
        if root != "depots" {
            return Err(KeyStoreError::Record(format!(
                "expected root key \"depots\", got {:?}",
                root
            )));
        }
        let entries = node
            .entries()
            .ok_or_else(|| KeyStoreError::Record("\"depots\" is not a map".to_string()))?;
        let mut depots = BTreeMap::new();
        for (id, entry) in entries {
            let depot_id: u32 = id
                .parse()
                .map_err(|_| KeyStoreError::Record(format!("bad depot id {:?}", id)))?;
            let key = entry
                .get("DecryptionKey")
                .and_then(VdfNode::as_str)
                .ok_or_else(|| {
                    KeyStoreError::Record(format!("depot {} has no DecryptionKey", depot_id))
                })?;
            depots.insert(depot_id, key.to_string());
        }
        Ok(Self { depots })
    }

    /// Encode the record as pretty-printed VDF text, depots ascending.
    pub fn to_vdf(&self) -> String {
        let entries = self
            .depots
            .iter()
            .map(|(id, key)| {
                (
                    id.to_string(),
                    VdfNode::Map(vec![(
                        "DecryptionKey".to_string(),
                        VdfNode::Str(key.clone()),
                    )]),
                )
            })
            .collect();
        vdf::dump("depots", &VdfNode::Map(entries))
    }
}

/// Key store rooted at the depots output directory.
pub struct KeyStore {
    root: PathBuf,
    app_locks: Mutex<HashMap<u32, Arc<Mutex<()>>>>,
}

impl KeyStore {
    /// Create a key store over `root` (the `depots/` directory).
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            app_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Path of the record file for an application.
    pub fn record_path(&self, app_id: u32) -> PathBuf {
        self.root.join(app_id.to_string()).join("config.vdf")
    }

    /// Read an application's record, or an empty one if none exists yet.
    pub fn load(&self, app_id: u32) -> Result<KeyStoreRecord, KeyStoreError> {
        let path = self.record_path(app_id);
        if !path.exists() {
            return Ok(KeyStoreRecord::default());
        }
        let text = std::fs::read_to_string(&path)?;
        KeyStoreRecord::from_vdf(&text)
    }

    /// Merge one depot's key into the application's record.
    ///
    /// Read-merge-sort-write under the application's lock; the final write
    /// goes through a temp file and rename.
    pub async fn merge(
        &self,
        app_id: u32,
        depot_id: u32,
        key: &DepotKey,
    ) -> Result<(), KeyStoreError> {
        let lock = self.lock_for(app_id).await;
        let _guard = lock.lock().await;

        let mut record = self.load(app_id)?;
        record.depots.insert(depot_id, key.to_hex());
        self.write_record(app_id, &record)
    }

    fn write_record(&self, app_id: u32, record: &KeyStoreRecord) -> Result<(), KeyStoreError> {
        let path = self.record_path(app_id);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp_path = path.with_extension("vdf.tmp");
        std::fs::write(&tmp_path, record.to_vdf())?;
        std::fs::rename(&tmp_path, &path)?;
        Ok(())
    }

    async fn lock_for(&self, app_id: u32) -> Arc<Mutex<()>> {
        let mut locks = self.app_locks.lock().await;
        locks.entry(app_id).or_default().clone()
    }
}

impl std::fmt::Debug for KeyStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyStore").field("root", &self.root).finish()
    }
}
