//! Depot manifest model for DepotSync
//!
//! A manifest is the decrypted content index for one depot generation:
//! an ordered list of file mappings, each referencing content-addressed
//! chunks. Manifests arrive from the delivery network with encrypted
//! filenames and a detached signature; after decryption they are
//! canonicalized into a deterministic form so that re-fetching the same
//! generation reproduces byte-identical files on disk.

use aes_gcm::aead::{Aead, OsRng};
use aes_gcm::{AeadCore, Aes256Gcm, KeyInit, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};

use crate::cdn::DepotKey;

/// Magic bytes at the start of a zstd frame, used to sniff compressed
/// manifest bodies.
const ZSTD_MAGIC: [u8; 4] = [0x28, 0xb5, 0x2f, 0xfd];

/// Length of the AES-GCM nonce prepended to sealed filenames.
const NONCE_LEN: usize = 12;

/// Errors that can occur while decoding or transforming a manifest.
#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
    #[error("Serialization error: {0}")]
    Encode(#[from] bincode::Error),

    #[error("Compression error: {0}")]
    Compression(#[from] std::io::Error),

    #[error("Filename decryption failed: {0}")]
    Decrypt(String),
}

/// Content hash identifying one chunk (fixed-width, compared lexicographically).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ChunkSha([u8; 20]);

impl ChunkSha {
    /// Create a ChunkSha from raw bytes.
    pub fn new(bytes: [u8; 20]) -> Self {
        Self(bytes)
    }

    /// Compute the ChunkSha of a chunk's content.
    pub fn from_data(data: &[u8]) -> Self {
        let mut hasher = Sha1::new();
        hasher.update(data);
        Self(hasher.finalize().into())
    }

    /// Convert to hexadecimal string.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse from hexadecimal string.
    pub fn from_hex(hex_str: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(hex_str)?;
        if bytes.len() != 20 {
            return Err(hex::FromHexError::InvalidStringLength);
        }
        let mut arr = [0u8; 20];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }

    /// Get raw bytes.
    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }
}

impl std::fmt::Display for ChunkSha {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Reference to one content chunk within a file mapping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkRef {
    /// Content hash of the chunk.
    pub sha: ChunkSha,
    /// Byte offset of the chunk within the file.
    pub offset: u64,
    /// Uncompressed chunk size in bytes.
    pub size: u32,
}

/// One file entry in a manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileMapping {
    /// File path within the depot. While `filenames_encrypted` is set on
    /// the manifest metadata this holds base64 ciphertext; decrypted names
    /// may still carry trailing padding bytes from the wire format.
    pub filename: String,
    /// Total file size in bytes.
    pub size: u64,
    /// Wire-format flags for this entry.
    pub flags: u32,
    /// Chunks making up the file content.
    pub chunks: Vec<ChunkRef>,
}

/// Mutable manifest metadata.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ManifestMetadata {
    /// When this manifest generation was published (Unix seconds).
    pub creation_time: i64,
    /// Whether filenames are still encrypted with the depot key.
    pub filenames_encrypted: bool,
    /// Total uncompressed size of the depot contents.
    pub original_size: u64,
    /// Checksum of the manifest with this very field cleared; zero until
    /// the checksum finalizer patches it in.
    pub crc_clear: u32,
}

/// The content index for one depot generation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    /// Owning application id.
    pub app_id: u32,
    /// Owning depot id.
    pub depot_id: u32,
    /// Manifest generation id.
    pub gid: u64,
    /// File entries.
    pub mappings: Vec<FileMapping>,
    /// Mutable metadata.
    pub metadata: ManifestMetadata,
    /// Detached signature over the encrypted wire form. Invalidated by
    /// filename decryption and canonicalization, so it is cleared before
    /// the manifest is written to disk.
    pub signature: Vec<u8>,
}

impl Manifest {
    /// Serialize to binary form, optionally zstd-compressed.
    ///
    /// Disk artifacts are always written uncompressed; compression is only
    /// used on the wire.
    pub fn serialize(&self, compress: bool) -> Result<Vec<u8>, ManifestError> {
        let raw = bincode::serialize(self)?;
        if compress {
            Ok(zstd::encode_all(raw.as_slice(), 3)?)
        } else {
            Ok(raw)
        }
    }

    /// Deserialize from binary form, accepting either the plain or the
    /// zstd-compressed encoding.
    pub fn deserialize(data: &[u8]) -> Result<Self, ManifestError> {
        if data.len() >= 4 && data[..4] == ZSTD_MAGIC {
            let raw = zstd::decode_all(data)?;
            Ok(bincode::deserialize(&raw)?)
        } else {
            Ok(bincode::deserialize(data)?)
        }
    }

    /// Decrypt all filenames in place using the depot key.
    ///
    /// No-op when the metadata says filenames are already plaintext.
    pub fn decrypt_filenames(&mut self, key: &DepotKey) -> Result<(), ManifestError> {
        if !self.metadata.filenames_encrypted {
            return Ok(());
        }
        let cipher = Aes256Gcm::new_from_slice(key.as_bytes())
            .map_err(|e| ManifestError::Decrypt(e.to_string()))?;
        for mapping in &mut self.mappings {
            mapping.filename = unseal_filename(&cipher, &mapping.filename)?;
        }
        self.metadata.filenames_encrypted = false;
        Ok(())
    }

    /// Drop the detached signature.
    pub fn clear_signature(&mut self) {
        self.signature.clear();
    }

    /// Normalize the manifest into its canonical form.
    ///
    /// Strips trailing NUL/space/newline/tab padding from filenames, sorts
    /// each mapping's chunks ascending by sha, then sorts the mappings
    /// ascending by lower-cased filename. Both sorts are stable, so entries
    /// that compare equal keep their original relative order and the output
    /// is fully deterministic.
    pub fn canonicalize(&mut self) {
        for mapping in &mut self.mappings {
            let trimmed = mapping
                .filename
                .trim_end_matches(['\0', ' ', '\n', '\t'])
                .len();
            mapping.filename.truncate(trimmed);
            mapping.chunks.sort_by(|a, b| a.sha.cmp(&b.sha));
        }
        self.mappings
            .sort_by(|a, b| a.filename.to_lowercase().cmp(&b.filename.to_lowercase()));
    }
}

/// Decrypt one sealed filename: base64(nonce || ciphertext).
fn unseal_filename(cipher: &Aes256Gcm, sealed: &str) -> Result<String, ManifestError> {
    let blob = BASE64
        .decode(sealed)
        .map_err(|e| ManifestError::Decrypt(format!("invalid base64: {}", e)))?;
    if blob.len() < NONCE_LEN {
        return Err(ManifestError::Decrypt("sealed name too short".to_string()));
    }
    let (nonce, ciphertext) = blob.split_at(NONCE_LEN);
    let plain = cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| ManifestError::Decrypt("AEAD open failed".to_string()))?;
    String::from_utf8(plain)
        .map_err(|e| ManifestError::Decrypt(format!("decrypted name not UTF-8: {}", e)))
}

/// Encrypt one filename into the sealed wire form. Used by tests and by
/// relay emulation; the fetch pipeline only ever decrypts.
pub fn seal_filename(key: &DepotKey, filename: &str) -> Result<String, ManifestError> {
    let cipher = Aes256Gcm::new_from_slice(key.as_bytes())
        .map_err(|e| ManifestError::Decrypt(e.to_string()))?;
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
    let ciphertext = cipher
        .encrypt(&nonce, filename.as_bytes())
        .map_err(|_| ManifestError::Decrypt("AEAD seal failed".to_string()))?;
    let mut blob = nonce.to_vec();
    blob.extend_from_slice(&ciphertext);
    Ok(BASE64.encode(blob))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sha(byte: u8) -> ChunkSha {
        ChunkSha::new([byte; 20])
    }

    fn mapping(filename: &str, shas: &[u8]) -> FileMapping {
        FileMapping {
            filename: filename.to_string(),
            size: 0,
            flags: 0,
            chunks: shas
                .iter()
                .map(|&b| ChunkRef {
                    sha: sha(b),
                    offset: 0,
                    size: 0,
                })
                .collect(),
        }
    }

    fn manifest(mappings: Vec<FileMapping>) -> Manifest {
        Manifest {
            app_id: 10,
            depot_id: 11,
            gid: 12,
            mappings,
            metadata: ManifestMetadata::default(),
            signature: Vec::new(),
        }
    }

    #[test]
    fn test_chunk_sha_roundtrip() {
        let id = ChunkSha::new([42u8; 20]);
        let hex = id.to_hex();
        assert_eq!(hex.len(), 40);
        assert_eq!(ChunkSha::from_hex(&hex).unwrap(), id);
    }

    #[test]
    fn test_canonicalize_sorts_and_strips() {
        let mut m = manifest(vec![
            mapping("b\x00", &[2, 1]),
            mapping("A", &[3, 1]),
        ]);
        m.canonicalize();

        assert_eq!(m.mappings[0].filename, "A");
        assert_eq!(m.mappings[0].chunks[0].sha, sha(1));
        assert_eq!(m.mappings[0].chunks[1].sha, sha(3));
        assert_eq!(m.mappings[1].filename, "b");
        assert_eq!(m.mappings[1].chunks[0].sha, sha(1));
        assert_eq!(m.mappings[1].chunks[1].sha, sha(2));
    }

    #[test]
    fn test_canonicalize_strips_all_padding_kinds() {
        let mut m = manifest(vec![mapping("dir/file.dat\x00 \n\t", &[])]);
        m.canonicalize();
        assert_eq!(m.mappings[0].filename, "dir/file.dat");
    }

    #[test]
    fn test_canonicalize_case_insensitive_order() {
        let mut m = manifest(vec![
            mapping("Zebra.txt", &[]),
            mapping("apple.txt", &[]),
            mapping("Banana.txt", &[]),
        ]);
        m.canonicalize();
        let names: Vec<_> = m.mappings.iter().map(|f| f.filename.as_str()).collect();
        assert_eq!(names, vec!["apple.txt", "Banana.txt", "Zebra.txt"]);
    }

    #[test]
    fn test_canonicalize_ties_keep_input_order() {
        // "README" and "readme" compare equal case-insensitively; the
        // stable sort must keep their input order.
        let mut m = manifest(vec![
            mapping("zzz", &[]),
            mapping("README", &[1]),
            mapping("readme", &[2]),
        ]);
        m.canonicalize();
        assert_eq!(m.mappings[0].filename, "README");
        assert_eq!(m.mappings[1].filename, "readme");
        assert_eq!(m.mappings[2].filename, "zzz");
    }

    #[test]
    fn test_canonicalize_is_deterministic_across_input_orders() {
        let mut a = manifest(vec![mapping("b", &[2, 1]), mapping("A", &[3, 1])]);
        let mut b = manifest(vec![mapping("A", &[1, 3]), mapping("b", &[1, 2])]);
        a.canonicalize();
        b.canonicalize();
        assert_eq!(
            a.serialize(false).unwrap(),
            b.serialize(false).unwrap()
        );
    }

    #[test]
    fn test_serialize_roundtrip() {
        let m = manifest(vec![mapping("foo", &[1])]);
        let bytes = m.serialize(false).unwrap();
        let back = Manifest::deserialize(&bytes).unwrap();
        assert_eq!(back.app_id, 10);
        assert_eq!(back.mappings.len(), 1);
        assert_eq!(back.mappings[0].filename, "foo");
    }

    #[test]
    fn test_serialize_compressed_roundtrip() {
        let m = manifest(vec![mapping("foo", &[1, 2, 3])]);
        let compressed = m.serialize(true).unwrap();
        assert_eq!(compressed[..4], ZSTD_MAGIC);
        let back = Manifest::deserialize(&compressed).unwrap();
        assert_eq!(back.gid, 12);
    }

    #[test]
    fn test_decrypt_filenames_roundtrip() {
        let key = DepotKey::new([7u8; 32]);
        let sealed = seal_filename(&key, "bin/game.exe").unwrap();
        let mut m = manifest(vec![mapping(&sealed, &[])]);
        m.metadata.filenames_encrypted = true;

        m.decrypt_filenames(&key).unwrap();
        assert!(!m.metadata.filenames_encrypted);
        assert_eq!(m.mappings[0].filename, "bin/game.exe");

        // Second call is a no-op once the flag is cleared.
        m.decrypt_filenames(&key).unwrap();
        assert_eq!(m.mappings[0].filename, "bin/game.exe");
    }

    #[test]
    fn test_decrypt_filenames_wrong_key() {
        let key = DepotKey::new([7u8; 32]);
        let sealed = seal_filename(&key, "bin/game.exe").unwrap();
        let mut m = manifest(vec![mapping(&sealed, &[])]);
        m.metadata.filenames_encrypted = true;

        let wrong = DepotKey::new([8u8; 32]);
        assert!(m.decrypt_filenames(&wrong).is_err());
    }

    #[test]
    fn test_clear_signature() {
        let mut m = manifest(vec![]);
        m.signature = vec![1, 2, 3];
        m.clear_signature();
        assert!(m.signature.is_empty());
    }
}
