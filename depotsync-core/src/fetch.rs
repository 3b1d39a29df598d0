//! Manifest acquisition pipeline
//!
//! Drives one depot generation from the delivery network to a finished
//! on-disk manifest file:
//!
//! 1. Cache check — an existing manifest file short-circuits the task.
//! 2. Acquire — access code, manifest body and depot key, requested as
//!    one unit and retried together on transient errors. Access denial
//!    ends the task as a skip.
//! 3. Decrypt filenames, drop the detached signature, canonicalize.
//! 4. Merge the depot key into the application's key store record.
//! 5. Two-pass write — serialize uncompressed, run the checksum tool
//!    against the file, patch the checksum into the metadata, rewrite.
//!
//! `fetch_all` fans out one task per depot generation and collects the
//! per-task outcomes; one failing task never affects its siblings.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;

use crate::cdn::{CdnError, ContentServer, DepotKey, DepotTask};
use crate::crc::{CrcError, CrcProvider};
use crate::keystore::{KeyStore, KeyStoreError};
use crate::manifest::{Manifest, ManifestError};

/// Terminal failure of one fetch task.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("Gave up after {attempts} attempts: {source}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        source: CdnError,
    },

    #[error("Manifest error: {0}")]
    Manifest(#[from] ManifestError),

    #[error("Checksum error: {0}")]
    Crc(#[from] CrcError),

    #[error("Key store error: {0}")]
    KeyStore(#[from] KeyStoreError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Worker task failed: {0}")]
    Worker(String),
}

/// Why a task ended without producing a new manifest file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// The manifest file already exists on disk; no network or disk work
    /// was performed.
    AlreadyPresent,
    /// The delivery network denied access to the depot; retrying cannot
    /// succeed.
    AccessDenied,
}

/// Terminal state of one fetch task.
#[derive(Debug)]
pub enum FetchOutcome {
    Completed,
    Skipped(SkipReason),
    Failed(FetchError),
}

/// Result of one fetch task, including retry observability.
#[derive(Debug)]
pub struct TaskReport {
    pub task: DepotTask,
    pub outcome: FetchOutcome,
    /// Number of acquire attempts made against the delivery network.
    pub attempts: u32,
    pub duration_ms: u64,
}

impl TaskReport {
    /// Whether the task ended in terminal failure.
    pub fn failed(&self) -> bool {
        matches!(self.outcome, FetchOutcome::Failed(_))
    }
}

/// Retry behavior for the acquire unit.
///
/// The default preserves the historical behavior: retry transient errors
/// forever, yielding the scheduling quantum between attempts so sibling
/// tasks keep making progress. Both the bound and the backoff are knobs.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Give up after this many attempts; `None` retries indefinitely.
    pub max_attempts: Option<u32>,
    /// Delay between attempts; zero yields instead of sleeping.
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: None,
            backoff: Duration::ZERO,
        }
    }
}

/// Fetches depot manifests into an on-disk depot tree.
///
/// Holds the collaborator capabilities explicitly; nothing here reaches
/// for ambient state, so tests drive the pipeline with fakes.
pub struct ManifestFetcher {
    server: Arc<dyn ContentServer>,
    crc: Arc<dyn CrcProvider>,
    keys: KeyStore,
    root: PathBuf,
    policy: RetryPolicy,
}

impl ManifestFetcher {
    /// Create a fetcher writing under `root` (the `depots/` directory).
    pub fn new(
        server: Arc<dyn ContentServer>,
        crc: Arc<dyn CrcProvider>,
        root: impl Into<PathBuf>,
    ) -> Self {
        let root = root.into();
        Self {
            server,
            crc,
            keys: KeyStore::new(&root),
            root,
            policy: RetryPolicy::default(),
        }
    }

    /// Override the retry policy.
    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// On-disk path of a task's manifest file. Its existence is the
    /// idempotency marker for the whole task.
    pub fn manifest_path(&self, task: &DepotTask) -> PathBuf {
        self.root
            .join(task.app_id.to_string())
            .join(format!("{}_{}.manifest", task.depot_id, task.manifest_gid))
    }

    /// Run one task to its terminal state.
    pub async fn fetch(&self, task: DepotTask) -> TaskReport {
        let started = Instant::now();
        let mut attempts = 0u32;
        let outcome = match self.run(task, &mut attempts).await {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::error!("{} failed: {}", task, e);
                FetchOutcome::Failed(e)
            }
        };
        TaskReport {
            task,
            outcome,
            attempts,
            duration_ms: started.elapsed().as_millis() as u64,
        }
    }

    async fn run(
        &self,
        task: DepotTask,
        attempts: &mut u32,
    ) -> Result<FetchOutcome, FetchError> {
        let path = self.manifest_path(&task);
        if path.exists() {
            tracing::debug!("{} already cached, skipping", task);
            return Ok(FetchOutcome::Skipped(SkipReason::AlreadyPresent));
        }

        let (mut manifest, key) = match self.acquire(&task, attempts).await? {
            Some(pair) => pair,
            None => return Ok(FetchOutcome::Skipped(SkipReason::AccessDenied)),
        };
        tracing::info!("{} DecryptionKey: {}", task, key.to_hex());

        manifest.decrypt_filenames(&key)?;
        // The detached signature covers the encrypted wire form and is
        // invalid after decryption and re-ordering.
        manifest.clear_signature();
        manifest.canonicalize();

        self.keys.merge(task.app_id, task.depot_id, &key).await?;

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, manifest.serialize(false)?).await?;

        // The checksum is defined over the file with crc_clear zeroed,
        // which is exactly what the first pass wrote.
        let crc = self.crc.crc_clear(&path).await?;
        manifest.metadata.crc_clear = crc;
        tokio::fs::write(&path, manifest.serialize(false)?).await?;

        tracing::info!(
            "{} manifest written ({} files, crc_clear {})",
            task,
            manifest.mappings.len(),
            crc
        );
        Ok(FetchOutcome::Completed)
    }

    /// Acquire code, manifest and key as one retryable unit.
    ///
    /// Returns `None` on access denial. Transient errors are logged and
    /// retried per the policy, yielding between attempts.
    async fn acquire(
        &self,
        task: &DepotTask,
        attempts: &mut u32,
    ) -> Result<Option<(Manifest, DepotKey)>, FetchError> {
        loop {
            *attempts += 1;
            match self.try_acquire(task).await {
                Ok(pair) => return Ok(Some(pair)),
                Err(CdnError::AccessDenied) => {
                    tracing::info!("{} error: access denied, skipping depot", task);
                    return Ok(None);
                }
                Err(e) => {
                    tracing::warn!("{} error: {} (attempt {})", task, e, *attempts);
                    if let Some(max) = self.policy.max_attempts {
                        if *attempts >= max {
                            return Err(FetchError::RetriesExhausted {
                                attempts: *attempts,
                                source: e,
                            });
                        }
                    }
                    if self.policy.backoff.is_zero() {
                        tokio::task::yield_now().await;
                    } else {
                        tokio::time::sleep(self.policy.backoff).await;
                    }
                }
            }
        }
    }

    async fn try_acquire(&self, task: &DepotTask) -> Result<(Manifest, DepotKey), CdnError> {
        let code = self
            .server
            .manifest_request_code(task.app_id, task.depot_id, task.manifest_gid)
            .await?;
        let manifest = self
            .server
            .fetch_manifest(task.app_id, task.depot_id, task.manifest_gid, code)
            .await?;
        let key = self.server.depot_key(task.app_id, task.depot_id).await?;
        Ok((manifest, key))
    }

    /// Fan out one concurrent fetch per task and wait for all of them.
    ///
    /// Failures are isolated per task; the batch result is the full set
    /// of per-task reports, in input order.
    pub async fn fetch_all(self: Arc<Self>, tasks: Vec<DepotTask>) -> Vec<TaskReport> {
        let handles: Vec<_> = tasks
            .iter()
            .map(|&task| {
                let fetcher = Arc::clone(&self);
                tokio::spawn(async move { fetcher.fetch(task).await })
            })
            .collect();

        let results = join_all(handles).await;
        tasks
            .into_iter()
            .zip(results)
            .map(|(task, result)| match result {
                Ok(report) => report,
                Err(e) => TaskReport {
                    task,
                    outcome: FetchOutcome::Failed(FetchError::Worker(e.to_string())),
                    attempts: 0,
                    duration_ms: 0,
                },
            })
            .collect()
    }
}

impl std::fmt::Debug for ManifestFetcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManifestFetcher")
            .field("root", &self.root)
            .field("policy", &self.policy)
            .finish()
    }
}
