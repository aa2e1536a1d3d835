//! The storage-driver facade the registry talks to.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use tracing::{debug, error};

use crate::byte_stream::ByteStream;
use crate::cluster::{Cluster, ClusterStats, Role};
use crate::error::DriverError;
use crate::metadata;
use crate::storage::{generate_key, KvStorage};
use crate::writer::FileWriter;

pub const DRIVER_NAME: &str = "postgres";

/// Stat result for a single path.
#[derive(Debug, Clone)]
pub struct FileInfo {
    pub path: String,
    pub size: i64,
    pub modtime: DateTime<Utc>,
    pub is_dir: bool,
}

/// The host registry's storage-driver surface.
#[async_trait]
pub trait StorageDriver: Send + Sync {
    fn name(&self) -> &'static str;

    /// Get the full content stored at `path`. Primarily for small objects.
    async fn get_content(&self, path: &str) -> Result<Bytes, DriverError>;
    /// Store `content` at `path`, replacing whatever was there.
    async fn put_content(&self, path: &str, content: &[u8]) -> Result<(), DriverError>;

    /// Stream the content stored at `path`, starting at `offset`.
    async fn reader(&self, path: &str, offset: u64) -> Result<ByteStream, DriverError>;
    /// Open a streaming writer for `path`. `content_size` is the anticipated
    /// number of bytes, when the caller's request announces one.
    async fn writer(&self, path: &str, append: bool, content_size: Option<u64>) -> Result<FileWriter, DriverError>;

    async fn stat(&self, path: &str) -> Result<FileInfo, DriverError>;
    /// Direct descendants of `path`.
    async fn list(&self, path: &str) -> Result<Vec<String>, DriverError>;
    /// Move a file, removing the original. Directory moves are unsupported.
    async fn move_path(&self, source_path: &str, dest_path: &str) -> Result<(), DriverError>;
    /// Recursively delete `path` and everything below it.
    async fn delete(&self, path: &str) -> Result<(), DriverError>;
    /// A URL which may be used to retrieve the content directly.
    async fn url_for(&self, path: &str) -> Result<String, DriverError>;
}

/// Storage driver keeping the path tree in PostgreSQL and raw bytes in a
/// pluggable KV blob store.
pub struct PostgresDriver {
    cluster: Arc<Cluster>,
    storage: Arc<dyn KvStorage>,
    disable_urlfor: bool,
    owner: Option<String>,
}

impl std::fmt::Debug for PostgresDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresDriver")
            .field("cluster", &self.cluster)
            .field("disable_urlfor", &self.disable_urlfor)
            .field("owner", &self.owner)
            .finish_non_exhaustive()
    }
}

impl PostgresDriver {
    pub fn new(
        cluster: Arc<Cluster>,
        storage: Arc<dyn KvStorage>,
        disable_urlfor: bool,
        owner: Option<String>,
    ) -> PostgresDriver {
        PostgresDriver {
            cluster,
            storage,
            disable_urlfor,
            owner,
        }
    }

    /// Create the `mfs`/`mds` tables and indexes if they do not exist.
    pub async fn ensure_schema(&self) -> Result<(), DriverError> {
        metadata::ensure_schema(self.cluster.db(Role::Master)).await
    }

    pub fn cluster_stats(&self) -> ClusterStats {
        self.cluster.stats()
    }

    /// Close the underlying cluster.
    pub async fn close(&self) {
        self.cluster.close().await;
    }
}

#[async_trait]
impl StorageDriver for PostgresDriver {
    fn name(&self) -> &'static str {
        DRIVER_NAME
    }

    async fn get_content(&self, path: &str) -> Result<Bytes, DriverError> {
        let key = metadata::get_key(self.cluster.db(Role::Master), path).await?;

        let stream = self.storage.get(&key, 0).await?;
        Ok(stream.collect_bytes().await?)
    }

    async fn put_content(&self, path: &str, content: &[u8]) -> Result<(), DriverError> {
        let mut writer = self.writer(path, false, Some(content.len() as u64)).await?;

        if let Err(e) = writer.write(content).await {
            let _ = writer.cancel().await;
            let _ = writer.close().await;
            return Err(e);
        }

        writer.commit().await?;
        writer.close().await?;
        Ok(())
    }

    async fn reader(&self, path: &str, offset: u64) -> Result<ByteStream, DriverError> {
        let pool = self.cluster.db(Role::Master);
        let (size, key) = match metadata::lookup_size_and_key(pool, path).await? {
            Some((size, Some(key))) => (size, key),
            // No key means the path is a directory.
            Some((_, None)) | None => return Err(DriverError::path_not_found(path, DRIVER_NAME)),
        };

        if offset > size as u64 {
            return Err(DriverError::InvalidOffset {
                path: path.to_string(),
                offset,
            });
        }
        if offset == size as u64 {
            return Ok(ByteStream::empty());
        }

        self.storage.get(&key, offset).await
    }

    async fn writer(&self, path: &str, append: bool, content_size: Option<u64>) -> Result<FileWriter, DriverError> {
        let pool = self.cluster.db(Role::Master);

        // An append against a missing path degrades to a fresh write.
        let (append, initial_size, key) = if append {
            match metadata::lookup_size_and_key(pool, path).await? {
                Some((size, Some(key))) => (true, size as u64, key),
                Some((_, None)) => {
                    return Err(DriverError::RewriteDirectoryByFile(path.to_string()))
                }
                None => (false, 0, generate_key()),
            }
        } else {
            (false, 0, generate_key())
        };

        Ok(FileWriter::open(
            self.cluster.clone(),
            self.storage.clone(),
            path.to_string(),
            key,
            append,
            initial_size,
            content_size,
            self.owner.clone(),
        ))
    }

    async fn stat(&self, path: &str) -> Result<FileInfo, DriverError> {
        // NOTE: should size of a directory be evaluated as the total size of
        // its children?
        match metadata::stat(self.cluster.db(Role::Master), path).await? {
            Some((is_dir, size, modtime)) => Ok(FileInfo {
                path: path.to_string(),
                size,
                modtime,
                is_dir,
            }),
            None => Err(DriverError::path_not_found(path, DRIVER_NAME)),
        }
    }

    async fn list(&self, path: &str) -> Result<Vec<String>, DriverError> {
        let pool = self.cluster.db(Role::Master);

        if path != "/" && !metadata::exists(pool, path).await? {
            return Err(DriverError::path_not_found(path, DRIVER_NAME));
        }

        metadata::list(pool, path).await
    }

    async fn move_path(&self, source_path: &str, dest_path: &str) -> Result<(), DriverError> {
        metadata::move_file(
            self.cluster.db(Role::Master),
            source_path,
            dest_path,
            self.owner.as_deref(),
        )
        .await
    }

    async fn delete(&self, path: &str) -> Result<(), DriverError> {
        let deleted = metadata::delete_tree(self.cluster.db(Role::Master), path).await?;
        debug!(path, blobs = deleted.len(), "deleted subtree");

        // The metadata removal is authoritative; blob removal is best-effort
        // and failures only leave orphans behind.
        for key in deleted {
            if let Err(e) = self.storage.delete(&key).await {
                error!(key = %key, error = %e, "unable to delete blob for removed path");
            }
        }

        Ok(())
    }

    async fn url_for(&self, path: &str) -> Result<String, DriverError> {
        if self.disable_urlfor {
            return Err(DriverError::Unsupported { driver: DRIVER_NAME });
        }

        let key = metadata::get_key(self.cluster.db(Role::Master), path).await?;
        self.storage.url_for(&key).await
    }
}
