//! External object-store backend.
//!
//! Raw bytes live in the remote store; the `mds` table maps the driver's
//! logical keys to the store's own blob descriptors. Rows are soft-deleted so
//! that a resolve never races a half-finished remote removal.

pub mod client;

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::{stream, StreamExt};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::byte_stream::ByteStream;
use crate::cluster::{Cluster, Role};
use crate::driver::DRIVER_NAME;
use crate::error::DriverError;
use crate::metrics::DRIVER_METRICS;

use self::client::{GetRange, MdsClient, MdsClientConfig};
use super::{generate_key, KvStorage};

/// The blob descriptor persisted in `mds.mdsfileinfo`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct MetaInfo {
    pub key: String,
    pub size: i64,
    pub id: String,
}

/// Options for the external object-store backend.
#[derive(Debug, Clone, Deserialize)]
pub struct MdsOptions {
    #[serde(alias = "Host")]
    pub host: String,
    #[serde(alias = "UploadPort")]
    pub uploadport: u16,
    #[serde(alias = "ReadPort")]
    pub readport: u16,
    #[serde(default, alias = "AuthHeader")]
    pub authheader: String,
    #[serde(default, alias = "Namespace")]
    pub namespace: String,
}

pub struct MdsStorage {
    cluster: Arc<Cluster>,
    client: MdsClient,
    namespace: String,
}

impl MdsStorage {
    pub fn new(cluster: Arc<Cluster>, options: MdsOptions) -> Result<MdsStorage, DriverError> {
        let client = MdsClient::new(MdsClientConfig {
            host: options.host,
            upload_port: options.uploadport,
            read_port: options.readport,
            auth_header: options.authheader,
        })?;

        Ok(MdsStorage {
            cluster,
            client,
            namespace: options.namespace,
        })
    }

    pub fn client(&self) -> &MdsClient {
        &self.client
    }

    /// Resolve the non-deleted blob descriptor for a logical key.
    async fn metainfo(&self, key: &str) -> Result<MetaInfo, DriverError> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT mdsfileinfo FROM mds WHERE (key = $1 AND NOT deleted)")
                .bind(key)
                .fetch_optional(self.cluster.db(Role::Master))
                .await?;

        match row {
            Some((body,)) => Ok(serde_json::from_str(&body)?),
            None => Err(DriverError::path_not_found(key, DRIVER_NAME)),
        }
    }
}

#[async_trait]
impl KvStorage for MdsStorage {
    async fn store(&self, key: &str, data: ByteStream, size: Option<u64>) -> Result<u64, DriverError> {
        let uinfo = self.client.upload(&self.namespace, key, size, data).await?;

        let meta = MetaInfo {
            key: uinfo.key.clone(),
            size: uinfo.size as i64,
            id: uinfo.id,
        };
        let body = serde_json::to_string(&meta)?;

        let inserted = sqlx::query("INSERT INTO mds (key, mdsfileinfo) VALUES ($1, $2)")
            .bind(key)
            .bind(&body)
            .execute(self.cluster.db(Role::Master))
            .await;
        if let Err(e) = inserted {
            if let Err(mdserr) = self.client.delete(&self.namespace, &meta.key).await {
                error!(error = %mdserr, key = %meta.key, "can not clean mds after db error");
            }
            return Err(e.into());
        }

        Ok(meta.size as u64)
    }

    async fn append(&self, key: &str, data: ByteStream, size: Option<u64>) -> Result<u64, DriverError> {
        let metainfo = match self.metainfo(key).await {
            Ok(meta) => meta,
            Err(e) if e.is_path_not_found() => return self.store(key, data, size).await,
            Err(e) => return Err(e),
        };

        // Append is not expected to be common here: the store has no native
        // append, so the old blob is proxied through and re-uploaded.
        warn!(key, old_size = metainfo.size, "append via read and re-upload is ineffective in mds");

        let beginning = self
            .client
            .get(&self.namespace, &metainfo.key, None)
            .await
            .map_err(|e| {
                error!(key = %metainfo.key, error = %e, "unable to read mds file");
                e
            })?;

        // In case the caller did not announce a size.
        let total = size.map(|s| s + metainfo.size as u64);

        let started = Instant::now();
        let proxied = beginning.inspect(|chunk| {
            if let Ok(bytes) = chunk {
                DRIVER_METRICS.bytes_proxied_in_mds_append.mark(bytes.len() as u64);
            }
        });
        // A zero-length sentinel chunk marks the end of the proxied prefix.
        let tracer = stream::once(async move {
            info!("an appended key has been proxied for {:?}", started.elapsed());
            Ok(bytes::Bytes::new())
        });
        let combined = ByteStream::new(proxied.chain(tracer).chain(data));

        let new_key = generate_key();
        let uinfo = self.client.upload(&self.namespace, &new_key, total, combined).await?;

        let new_meta = MetaInfo {
            key: uinfo.key,
            size: uinfo.size as i64,
            id: uinfo.id,
        };
        let body = serde_json::to_string(&new_meta)?;

        // Point the old logical key at the freshly uploaded blob.
        let updated = sqlx::query("UPDATE mds SET mdsfileinfo = $1 WHERE (key = $2)")
            .bind(&body)
            .bind(key)
            .execute(self.cluster.db(Role::Master))
            .await;
        if let Err(e) = updated {
            error!(key, error = %e, "update metainfo of appended key failed");
            return Err(e.into());
        }

        if let Err(e) = self.client.delete(&self.namespace, &metainfo.key).await {
            error!(key = %metainfo.key, error = %e, "unable to delete replaced blob from mds");
        }

        Ok(new_meta.size as u64)
    }

    async fn get(&self, key: &str, offset: u64) -> Result<ByteStream, DriverError> {
        let metainfo = self.metainfo(key).await?;

        if offset >= metainfo.size as u64 {
            return Ok(ByteStream::empty());
        }

        let range = if offset == 0 { None } else { Some(GetRange::From(offset)) };
        self.client.get(&self.namespace, &metainfo.key, range).await
    }

    async fn delete(&self, key: &str) -> Result<(), DriverError> {
        let metainfo = self.metainfo(key).await?;

        self.client.delete(&self.namespace, &metainfo.key).await?;

        // Mark deleted.
        let marked = sqlx::query("UPDATE mds SET deleted = true WHERE (key = $1)")
            .bind(key)
            .execute(self.cluster.db(Role::Master))
            .await;
        if let Err(e) = marked {
            error!(key, error = %e, "update metainfo about deleted key failed");
            return Err(e.into());
        }

        Ok(())
    }

    async fn url_for(&self, key: &str) -> Result<String, DriverError> {
        let metainfo = self.metainfo(key).await?;

        let info = self.client.download_info(&self.namespace, &metainfo.key).await?;
        Ok(info.url())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metainfo_roundtrips_as_json() {
        let meta = MetaInfo {
            key: "221/namespace.filename".to_string(),
            size: 100,
            id: "81d8ba78".to_string(),
        };

        let body = serde_json::to_string(&meta).unwrap();
        let parsed: MetaInfo = serde_json::from_str(&body).unwrap();
        assert_eq!(parsed.key, meta.key);
        assert_eq!(parsed.size, 100);
        assert_eq!(parsed.id, meta.id);
    }

    #[test]
    fn options_decode_with_aliased_keys() {
        let raw = serde_json::json!({
            "host": "storage.example.net",
            "uploadport": 1111,
            "readport": 80,
            "authheader": "Basic dGVzdA==",
            "namespace": "docker-registry",
        });

        let options: MdsOptions = serde_json::from_value(raw).unwrap();
        assert_eq!(options.host, "storage.example.net");
        assert_eq!(options.uploadport, 1111);
        assert_eq!(options.namespace, "docker-registry");
    }
}
