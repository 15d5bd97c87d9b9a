use serde::{Deserialize, Serialize};

/// Checksum algorithm used to verify a managed file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DigestAlgorithm {
    Md5,
    Sha256,
}

/// A concrete expected digest, hex-encoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Digest {
    pub algorithm: DigestAlgorithm,
    pub hex: String,
}

/// Control-plane metadata for a distributable file. At least one of `md5`
/// or `sha256` must be present for a download to be verifiable; when both
/// are, sha256 wins.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct FileMetadata {
    #[serde(default)]
    pub md5: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
    #[serde(default)]
    pub last_modified: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl FileMetadata {
    /// The digest to verify against, or `None` when the metadata carries no
    /// usable checksum.
    pub fn digest(&self) -> Option<Digest> {
        if let Some(sha256) = self.sha256.as_ref().filter(|s| !s.is_empty()) {
            return Some(Digest {
                algorithm: DigestAlgorithm::Sha256,
                hex: sha256.to_lowercase(),
            });
        }
        if !self.md5.is_empty() {
            return Some(Digest {
                algorithm: DigestAlgorithm::Md5,
                hex: self.md5.to_lowercase(),
            });
        }
        None
    }
}

/// Envelope returned by the file-metadata endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileMetadataResponse {
    #[serde(default)]
    pub status: String,
    pub data: FileMetadata,
}
