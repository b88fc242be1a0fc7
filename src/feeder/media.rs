//! Media storage for images referenced by feed items.
//!
//! Files are content-addressed and stored in a sharded directory structure:
//! ```text
//! {base_path}/
//! ├── 3f/
//! │   └── 3fa1...e9.png
//! ├── a0/
//! │   └── a07c...41.jpg
//! └── ...
//! ```
//! Identical bytes are stored once. The reference handed back to callers is
//! `{public_base_url}/{name}`.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;

use super::fetcher::Fetcher;

/// Media download and storage errors.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum MediaError {
    /// The download did not finish in time.
    #[error("download timed out")]
    Timeout,

    /// The payload exceeded the configured limit.
    #[error("media larger than {limit} bytes")]
    TooLarge { limit: u64 },

    /// The download failed for any other reason.
    #[error("download failed: {0}")]
    Download(String),

    /// Writing or reading stored media failed.
    #[error("storage failed: {0}")]
    Storage(String),

    /// No media stored under the reference.
    #[error("media not found: {0}")]
    NotFound(String),

    /// The reference was not issued by this storage.
    #[error("invalid media reference: {0}")]
    InvalidReference(String),
}

impl From<io::Error> for MediaError {
    fn from(e: io::Error) -> Self {
        MediaError::Storage(e.to_string())
    }
}

/// Durable blob storage capability.
#[async_trait]
pub trait MediaUploader: Send + Sync {
    /// Store bytes and return their public reference.
    async fn upload(&self, bytes: &[u8]) -> Result<String, MediaError>;

    /// Check whether a reference points at stored media.
    async fn exists(&self, reference: &str) -> Result<bool, MediaError>;

    /// Read stored media back.
    async fn download(&self, reference: &str) -> Result<Vec<u8>, MediaError>;
}

/// Stores a remote image and returns its stored location.
#[async_trait]
pub trait ImageUploader: Send + Sync {
    /// Download the image at `url` and store it.
    async fn upload_image(&self, url: &str) -> Result<String, MediaError>;
}

/// Filesystem-backed media storage.
#[derive(Debug, Clone)]
pub struct FsMediaStorage {
    base_path: PathBuf,
    public_base_url: String,
}

impl FsMediaStorage {
    /// Create storage rooted at `base_path`.
    ///
    /// The base directory will be created if it doesn't exist.
    pub fn new(
        base_path: impl Into<PathBuf>,
        public_base_url: impl Into<String>,
    ) -> crate::Result<Self> {
        let base_path = base_path.into();
        std::fs::create_dir_all(&base_path)?;

        Ok(Self {
            base_path,
            public_base_url: public_base_url.into().trim_end_matches('/').to_string(),
        })
    }

    /// Get the base path of this storage.
    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Content-addressed name for the given bytes.
    pub fn stored_name(bytes: &[u8]) -> String {
        let digest = Sha256::digest(bytes);
        let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
        format!("{hex}.{}", sniff_extension(bytes))
    }

    /// Get the full file path for a stored name.
    pub fn get_file_path(&self, stored_name: &str) -> PathBuf {
        let shard = stored_name.get(..2).unwrap_or(stored_name);
        self.base_path.join(shard).join(stored_name)
    }

    /// Public reference for a stored name.
    pub fn reference_for(&self, stored_name: &str) -> String {
        format!("{}/{}", self.public_base_url, stored_name)
    }

    /// Extract and validate the stored name from a reference.
    fn name_from_reference<'r>(&self, reference: &'r str) -> Result<&'r str, MediaError> {
        let name = reference
            .strip_prefix(self.public_base_url.as_str())
            .and_then(|rest| rest.strip_prefix('/'))
            .ok_or_else(|| MediaError::InvalidReference(reference.to_string()))?;

        if is_valid_stored_name(name) {
            Ok(name)
        } else {
            Err(MediaError::InvalidReference(reference.to_string()))
        }
    }
}

#[async_trait]
impl MediaUploader for FsMediaStorage {
    async fn upload(&self, bytes: &[u8]) -> Result<String, MediaError> {
        let name = Self::stored_name(bytes);
        let path = self.get_file_path(&name);

        if !fs::try_exists(&path).await? {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).await?;
            }
            // Write then rename so readers never see a partial file
            let tmp = path.with_extension(format!("tmp-{}", uuid::Uuid::now_v7()));
            fs::write(&tmp, bytes).await?;
            fs::rename(&tmp, &path).await?;
        }

        Ok(self.reference_for(&name))
    }

    async fn exists(&self, reference: &str) -> Result<bool, MediaError> {
        let name = self.name_from_reference(reference)?;
        Ok(fs::try_exists(self.get_file_path(name)).await?)
    }

    async fn download(&self, reference: &str) -> Result<Vec<u8>, MediaError> {
        let name = self.name_from_reference(reference)?;
        match fs::read(self.get_file_path(name)).await {
            Ok(content) => Ok(content),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(MediaError::NotFound(reference.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Image uploader that downloads through a `Fetcher` into a `MediaUploader`.
pub struct FetchingImageUploader {
    fetcher: Arc<dyn Fetcher>,
    storage: Arc<dyn MediaUploader>,
    max_image_bytes: u64,
}

impl FetchingImageUploader {
    /// Create a new uploader.
    pub fn new(
        fetcher: Arc<dyn Fetcher>,
        storage: Arc<dyn MediaUploader>,
        max_image_bytes: u64,
    ) -> Self {
        Self {
            fetcher,
            storage,
            max_image_bytes,
        }
    }
}

#[async_trait]
impl ImageUploader for FetchingImageUploader {
    async fn upload_image(&self, url: &str) -> Result<String, MediaError> {
        let bytes = self.fetcher.fetch_media(url, self.max_image_bytes).await?;
        if sniff_extension(&bytes) == "bin" {
            return Err(MediaError::Download(format!("not an image: {url}")));
        }
        self.storage.upload(&bytes).await
    }
}

/// Guess a file extension from magic bytes.
///
/// Returns "bin" for anything that is not a known raster image format.
fn sniff_extension(bytes: &[u8]) -> &'static str {
    if bytes.starts_with(&[0x89, b'P', b'N', b'G']) {
        "png"
    } else if bytes.starts_with(&[0xFF, 0xD8, 0xFF]) {
        "jpg"
    } else if bytes.starts_with(b"GIF87a") || bytes.starts_with(b"GIF89a") {
        "gif"
    } else if bytes.len() >= 12 && &bytes[..4] == b"RIFF" && &bytes[8..12] == b"WEBP" {
        "webp"
    } else if bytes.len() >= 12 && &bytes[4..8] == b"ftyp" && &bytes[8..12] == b"avif" {
        "avif"
    } else {
        "bin"
    }
}

/// A stored name is 64 lowercase hex characters, a dot, and an extension.
fn is_valid_stored_name(name: &str) -> bool {
    let Some((hash, ext)) = name.split_once('.') else {
        return false;
    };
    hash.len() == 64
        && hash.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
        && !ext.is_empty()
        && ext.bytes().all(|b| b.is_ascii_lowercase() || b.is_ascii_digit())
}
