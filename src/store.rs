//! On-disk block store.
//!
//! Every server persists stripe units under
//! `<storage_base>/serverid_<id>/<inum>/<stripe_id>/<version>`. Each leaf
//! is a regular file holding three contiguous sections: the block's
//! metadata, its data bytes, and a trailing 32-bit checksum over the
//! metadata. The largest version number present under a stripe directory
//! is always the current version; version `0` is reserved and never
//! written.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt, SeekFrom};
use tracing::{debug, instrument, warn};

use crate::error::{Error, Result};
use crate::geometry::StripeId;
use crate::parity;

/// Metadata stored alongside every persisted block.
///
/// `version_vector` has one entry per unit in the stripe's group,
/// including the parity slot at the final index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockMetadata {
    pub client_session_id: u64,
    pub sequence_number: u32,
    pub offset: u64,
    pub operation_length: u64,
    pub version_vector: Vec<u32>,
    pub data_length: u64,
}

impl BlockMetadata {
    fn encoded(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(Error::from)
    }
}

/// A fully materialized persisted block: metadata, payload, and the
/// checksum that was verified (or computed) for it.
#[derive(Debug, Clone)]
pub struct Block {
    pub metadata: BlockMetadata,
    pub data: Vec<u8>,
    pub checksum: u32,
}

impl Block {
    pub fn new(metadata: BlockMetadata, data: Vec<u8>) -> Self {
        let checksum = checksum_of(&metadata).unwrap_or(0);
        Self {
            metadata,
            data,
            checksum,
        }
    }
}

fn checksum_of(metadata: &BlockMetadata) -> Result<u32> {
    Ok(parity::checksum(&metadata.encoded()?))
}

/// Per-server on-disk block store rooted at
/// `<storage_base>/serverid_<server_id>`.
pub struct BlockStore {
    server_root: PathBuf,
    fsync: bool,
}

impl BlockStore {
    /// Opens (and creates if absent) the root directory for `server_id`
    /// under `storage_base`.
    pub async fn open(storage_base: &Path, server_id: u16, fsync: bool) -> Result<Self> {
        let server_root = storage_base.join(format!("serverid_{}", server_id));
        fs::create_dir_all(&server_root)
            .await
            .map_err(|source| Error::DiskIo {
                path: server_root.clone(),
                source,
            })?;
        Ok(Self { server_root, fsync })
    }

    fn stripe_dir(&self, inum: u64, stripe_id: StripeId) -> PathBuf {
        self.server_root
            .join(inum.to_string())
            .join(stripe_id.to_string())
    }

    fn version_path(&self, inum: u64, stripe_id: StripeId, version: u32) -> PathBuf {
        self.stripe_dir(inum, stripe_id).join(version.to_string())
    }

    /// Writes `block` as `version` for `(inum, stripe_id)`, creating the
    /// parent directories if absent. Layout on disk is metadata bytes,
    /// then data bytes, then the 4-byte little-endian checksum, written
    /// as a single contiguous buffer.
    #[instrument(skip(self, block), fields(inum, stripe_id, version))]
    pub async fn write_block(
        &self,
        inum: u64,
        stripe_id: StripeId,
        version: u32,
        block: &Block,
    ) -> Result<()> {
        debug_assert_ne!(version, 0, "version 0 is reserved");
        let dir = self.stripe_dir(inum, stripe_id);
        fs::create_dir_all(&dir)
            .await
            .map_err(|source| Error::DiskIo {
                path: dir.clone(),
                source,
            })?;

        let metadata_bytes = block.metadata.encoded()?;
        let mut buf = Vec::with_capacity(
            4 + metadata_bytes.len() + block.data.len() + 4,
        );
        buf.extend_from_slice(&(metadata_bytes.len() as u32).to_le_bytes());
        buf.extend_from_slice(&metadata_bytes);
        buf.extend_from_slice(&block.data);
        buf.extend_from_slice(&block.checksum.to_le_bytes());

        let path = self.version_path(inum, stripe_id, version);
        let mut file = fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .await
            .map_err(|source| Error::DiskIo {
                path: path.clone(),
                source,
            })?;
        file.write_all(&buf)
            .await
            .map_err(|source| Error::DiskIo {
                path: path.clone(),
                source,
            })?;
        if self.fsync {
            file.sync_all().await.map_err(|source| Error::DiskIo {
                path: path.clone(),
                source,
            })?;
        }
        debug!(path = %path.display(), bytes = buf.len(), "wrote block");
        Ok(())
    }

    /// Lists the numeric version filenames present under a stripe
    /// directory, ignoring anything that doesn't parse as a `u32`.
    async fn list_versions(&self, inum: u64, stripe_id: StripeId) -> Result<Vec<u32>> {
        let dir = self.stripe_dir(inum, stripe_id);
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(source) if source.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Vec::new())
            }
            Err(source) => {
                return Err(Error::DiskIo {
                    path: dir.clone(),
                    source,
                })
            }
        };
        let mut versions = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(|source| Error::DiskIo {
            path: dir.clone(),
            source,
        })? {
            if let Some(name) = entry.file_name().to_str() {
                if let Ok(v) = name.parse::<u32>() {
                    versions.push(v);
                }
            }
        }
        Ok(versions)
    }

    /// The highest version present for a stripe, or `None` if none
    /// exists yet.
    pub async fn max_version(&self, inum: u64, stripe_id: StripeId) -> Result<Option<u32>> {
        Ok(self.list_versions(inum, stripe_id).await?.into_iter().max())
    }

    /// Reads the newest persisted version for `(inum, stripe_id)`.
    pub async fn read_stripe_current(
        &self,
        inum: u64,
        stripe_id: StripeId,
    ) -> Result<Option<Block>> {
        match self.max_version(inum, stripe_id).await? {
            Some(version) => Ok(Some(self.read_stripe_max_version(inum, stripe_id, version).await?)),
            None => Ok(None),
        }
    }

    /// Reads a specific version of `(inum, stripe_id)`, verifying its
    /// checksum. A mismatch surfaces as [`Error::ChecksumMismatch`], to
    /// be treated by the caller as a read miss for that unit.
    #[instrument(skip(self), fields(inum, stripe_id, version))]
    pub async fn read_stripe_max_version(
        &self,
        inum: u64,
        stripe_id: StripeId,
        version: u32,
    ) -> Result<Block> {
        let path = self.version_path(inum, stripe_id, version);
        let mut file = fs::File::open(&path)
            .await
            .map_err(|source| Error::DiskIo {
                path: path.clone(),
                source,
            })?;

        let mut len_buf = [0u8; 4];
        file.read_exact(&mut len_buf)
            .await
            .map_err(|_| Error::MalformedBlock { path: path.clone() })?;
        let metadata_len = u32::from_le_bytes(len_buf) as usize;

        let mut metadata_buf = vec![0u8; metadata_len];
        file.read_exact(&mut metadata_buf)
            .await
            .map_err(|_| Error::MalformedBlock { path: path.clone() })?;
        let metadata: BlockMetadata =
            serde_json::from_slice(&metadata_buf).map_err(|_| Error::MalformedBlock {
                path: path.clone(),
            })?;

        let mut data = vec![0u8; metadata.data_length as usize];
        file.read_exact(&mut data)
            .await
            .map_err(|_| Error::MalformedBlock { path: path.clone() })?;

        let mut checksum_buf = [0u8; 4];
        file.read_exact(&mut checksum_buf)
            .await
            .map_err(|_| Error::MalformedBlock { path: path.clone() })?;
        let stored_checksum = u32::from_le_bytes(checksum_buf);

        let computed = checksum_of(&metadata)?;
        if computed != stored_checksum {
            warn!(inum, stripe_id, version, "checksum mismatch on read");
            return Err(Error::ChecksumMismatch {
                inum,
                stripe_id,
                version,
            });
        }

        Ok(Block {
            metadata,
            data,
            checksum: stored_checksum,
        })
    }

    /// Removes every version of `(inum, stripe_id)` strictly below
    /// `high_water_mark`. Used by the cache's garbage collection pass
    /// once a version is known to be superseded everywhere.
    pub async fn prune_below(
        &self,
        inum: u64,
        stripe_id: StripeId,
        high_water_mark: u32,
    ) -> Result<usize> {
        let versions = self.list_versions(inum, stripe_id).await?;
        let mut removed = 0usize;
        for version in versions {
            if version < high_water_mark {
                let path = self.version_path(inum, stripe_id, version);
                match fs::remove_file(&path).await {
                    Ok(()) => removed += 1,
                    Err(source) if source.kind() == std::io::ErrorKind::NotFound => {}
                    Err(source) => {
                        return Err(Error::DiskIo {
                            path,
                            source,
                        })
                    }
                }
            }
        }
        Ok(removed)
    }

    #[cfg(test)]
    pub(crate) async fn raw_len(&self, inum: u64, stripe_id: StripeId, version: u32) -> Result<u64> {
        let path = self.version_path(inum, stripe_id, version);
        let mut file = fs::File::open(&path).await.map_err(|source| Error::DiskIo {
            path: path.clone(),
            source,
        })?;
        Ok(file.seek(SeekFrom::End(0)).await.map_err(|source| Error::DiskIo { path, source })?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_block(data: Vec<u8>) -> Block {
        let metadata = BlockMetadata {
            client_session_id: 1,
            sequence_number: 7,
            offset: 0,
            operation_length: data.len() as u64,
            version_vector: vec![1, 0, 0, 0],
            data_length: data.len() as u64,
        };
        Block::new(metadata, data)
    }

    #[tokio::test]
    async fn write_then_read_roundtrips() {
        let dir = tempdir();
        let store = BlockStore::open(dir.path(), 3, false).await.unwrap();
        let block = sample_block(vec![1, 2, 3, 4, 5]);
        store.write_block(42, 0, 1, &block).await.unwrap();

        let read = store.read_stripe_current(42, 0).await.unwrap().unwrap();
        assert_eq!(read.data, block.data);
        assert_eq!(read.metadata, block.metadata);
    }

    #[tokio::test]
    async fn max_version_tracks_latest_write() {
        let dir = tempdir();
        let store = BlockStore::open(dir.path(), 3, false).await.unwrap();
        store.write_block(1, 0, 1, &sample_block(vec![1])).await.unwrap();
        store.write_block(1, 0, 2, &sample_block(vec![2])).await.unwrap();
        assert_eq!(store.max_version(1, 0).await.unwrap(), Some(2));
    }

    #[tokio::test]
    async fn corrupted_block_fails_checksum() {
        let dir = tempdir();
        let store = BlockStore::open(dir.path(), 3, false).await.unwrap();
        let block = sample_block(vec![9, 9, 9]);
        store.write_block(5, 2, 1, &block).await.unwrap();

        let path = store.version_path(5, 2, 1);
        let mut raw = fs::read(&path).await.unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 0xFF;
        fs::write(&path, raw).await.unwrap();

        let err = store.read_stripe_max_version(5, 2, 1).await.unwrap_err();
        assert!(matches!(err, Error::ChecksumMismatch { .. }));
    }

    #[tokio::test]
    async fn prune_below_removes_old_versions_only() {
        let dir = tempdir();
        let store = BlockStore::open(dir.path(), 3, false).await.unwrap();
        for v in 1..=4u32 {
            store.write_block(1, 0, v, &sample_block(vec![v as u8])).await.unwrap();
        }
        let removed = store.prune_below(1, 0, 3).await.unwrap();
        assert_eq!(removed, 2);
        assert_eq!(store.max_version(1, 0).await.unwrap(), Some(4));
        let mut remaining = store.list_versions(1, 0).await.unwrap();
        remaining.sort();
        assert_eq!(remaining, vec![3, 4]);
    }

    fn tempdir() -> tempfile::TempDir {
        tempfile::tempdir().expect("tempdir")
    }
}
