//! Content-delivery collaborator boundary
//!
//! The fetch pipeline never talks to the delivery network directly; it is
//! handed a [`ContentServer`] capability object. Authentication, session
//! management and the network's own wire protocol live behind this trait,
//! which is what lets tests drive the pipeline with scripted fakes.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::manifest::Manifest;

/// Errors reported by the content-delivery collaborator.
///
/// The fetch loop switches on exactly this split: access denial is
/// terminal for a task, everything else is retried.
#[derive(Debug, thiserror::Error)]
pub enum CdnError {
    /// The account holds no entitlement for the requested depot. Retrying
    /// cannot succeed.
    #[error("Access denied")]
    AccessDenied,

    /// Any other service or network error; assumed to be recoverable.
    #[error("Transient delivery error: {0}")]
    Transient(String),
}

/// One unit of work: a single depot generation to mirror.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DepotTask {
    /// Owning application id.
    pub app_id: u32,
    /// Depot id within the application.
    pub depot_id: u32,
    /// Manifest generation id to fetch.
    pub manifest_gid: u64,
}

impl std::fmt::Display for DepotTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "app_id: {} depot_id: {} manifest_gid: {}",
            self.app_id, self.depot_id, self.manifest_gid
        )
    }
}

/// Per-depot decryption key, stable across manifest generations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepotKey([u8; 32]);

impl DepotKey {
    /// Create a key from raw bytes.
    pub fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Convert to hexadecimal string.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse from hexadecimal string.
    pub fn from_hex(hex_str: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(hex_str)?;
        if bytes.len() != 32 {
            return Err(hex::FromHexError::InvalidStringLength);
        }
        let mut arr = [0u8; 32];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }

    /// Get raw bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

/// Capability interface to the content-delivery service.
#[async_trait]
pub trait ContentServer: Send + Sync {
    /// Request a one-time access code for one manifest generation.
    async fn manifest_request_code(
        &self,
        app_id: u32,
        depot_id: u32,
        manifest_gid: u64,
    ) -> Result<u64, CdnError>;

    /// Download the manifest body (filenames still encrypted) using a
    /// previously obtained access code.
    async fn fetch_manifest(
        &self,
        app_id: u32,
        depot_id: u32,
        manifest_gid: u64,
        code: u64,
    ) -> Result<Manifest, CdnError>;

    /// Obtain the depot's decryption key.
    async fn depot_key(&self, app_id: u32, depot_id: u32) -> Result<DepotKey, CdnError>;
}
