use std::collections::HashMap;
use std::net::TcpListener;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::{routing, Router};
use futures::StreamExt;
use tracing::debug;

use crate::byte_stream::ByteStream;
use crate::error::DriverError;

use super::KvStorage;

const STORAGE_NAME: &str = "inmemory";

type Blobs = Arc<Mutex<HashMap<String, Vec<u8>>>>;

/// In-memory KV backend used by tests.
///
/// Also serves its blobs over a loopback HTTP listener so that `url_for`
/// returns a real, fetchable URL.
pub struct InMemoryStorage {
    data: Blobs,
    base_url: String,
}

impl InMemoryStorage {
    /// Create the store and start the loopback read endpoint. Must be called
    /// from within a tokio runtime.
    pub fn new() -> Result<InMemoryStorage, DriverError> {
        let data: Blobs = Arc::new(Mutex::new(HashMap::new()));

        let listener = TcpListener::bind(("127.0.0.1", 0))?;
        listener.set_nonblocking(true)?;
        let base_url = format!("http://{}", listener.local_addr()?);

        let app = Router::new()
            .route("/", routing::get(serve_blob))
            .with_state(data.clone());

        let server = axum::Server::from_tcp(listener)
            .map_err(|e| anyhow::anyhow!("failed to start in-memory blob endpoint: {e}"))?
            .serve(app.into_make_service());
        tokio::spawn(async move {
            // The listener lives for as long as the process; there is no
            // close hook on the storage interface to stop it sooner.
            let _ = server.await;
        });

        debug!("in-memory blob endpoint listening on {}", base_url);

        Ok(InMemoryStorage { data, base_url })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Vec<u8>>> {
        self.data.lock().unwrap_or_else(|e| e.into_inner())
    }
}

async fn serve_blob(
    State(data): State<Blobs>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Vec<u8>, StatusCode> {
    let key = params.get("key").ok_or(StatusCode::NOT_FOUND)?;

    let data = data.lock().unwrap_or_else(|e| e.into_inner());
    match data.get(key) {
        Some(body) => Ok(body.clone()),
        None => Err(StatusCode::NOT_FOUND),
    }
}

#[async_trait]
impl KvStorage for InMemoryStorage {
    async fn store(&self, key: &str, mut data: ByteStream, _size: Option<u64>) -> Result<u64, DriverError> {
        let mut buff = Vec::new();
        while let Some(bytes) = data.next().await {
            buff.extend_from_slice(&bytes?);
        }

        let len = buff.len() as u64;
        self.lock().insert(key.to_string(), buff);
        Ok(len)
    }

    async fn append(&self, key: &str, mut data: ByteStream, _size: Option<u64>) -> Result<u64, DriverError> {
        let mut buff = Vec::new();
        while let Some(bytes) = data.next().await {
            buff.extend_from_slice(&bytes?);
        }

        let mut blobs = self.lock();
        let body = blobs
            .get_mut(key)
            .ok_or_else(|| DriverError::path_not_found(key, STORAGE_NAME))?;
        body.extend_from_slice(&buff);
        Ok(body.len() as u64)
    }

    async fn get(&self, key: &str, offset: u64) -> Result<ByteStream, DriverError> {
        let blobs = self.lock();
        let body = blobs
            .get(key)
            .ok_or_else(|| DriverError::path_not_found(key, STORAGE_NAME))?;

        if offset > body.len() as u64 {
            return Err(DriverError::InvalidOffset {
                path: key.to_string(),
                offset,
            });
        }

        Ok(ByteStream::from(body[offset as usize..].to_vec()))
    }

    async fn delete(&self, key: &str) -> Result<(), DriverError> {
        self.lock().remove(key);
        Ok(())
    }

    async fn url_for(&self, key: &str) -> Result<String, DriverError> {
        Ok(format!("{}/?key={}", self.base_url, key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::generate_key;

    #[tokio::test]
    async fn store_then_get_roundtrips() {
        let storage = InMemoryStorage::new().unwrap();
        let key = generate_key();

        let written = storage
            .store(&key, ByteStream::from(b"hello world".to_vec()), None)
            .await
            .unwrap();
        assert_eq!(written, 11);

        let body = storage.get(&key, 0).await.unwrap().collect_bytes().await.unwrap();
        assert_eq!(&body[..], b"hello world");

        let tail = storage.get(&key, 6).await.unwrap().collect_bytes().await.unwrap();
        assert_eq!(&tail[..], b"world");

        let empty = storage.get(&key, 11).await.unwrap().collect_bytes().await.unwrap();
        assert!(empty.is_empty());
    }

    #[tokio::test]
    async fn get_rejects_offset_beyond_size() {
        let storage = InMemoryStorage::new().unwrap();
        let key = generate_key();
        storage
            .store(&key, ByteStream::from(b"abc".to_vec()), None)
            .await
            .unwrap();

        let err = storage.get(&key, 4).await.unwrap_err();
        assert!(matches!(err, DriverError::InvalidOffset { offset: 4, .. }));
    }

    #[tokio::test]
    async fn append_extends_existing_value() {
        let storage = InMemoryStorage::new().unwrap();
        let key = generate_key();
        storage
            .store(&key, ByteStream::from(b"01234".to_vec()), None)
            .await
            .unwrap();

        let total = storage
            .append(&key, ByteStream::from(b"56789".to_vec()), None)
            .await
            .unwrap();
        assert_eq!(total, 10);

        let body = storage.get(&key, 0).await.unwrap().collect_bytes().await.unwrap();
        assert_eq!(&body[..], b"0123456789");
    }

    #[tokio::test]
    async fn append_requires_existing_key() {
        let storage = InMemoryStorage::new().unwrap();
        let err = storage
            .append("missing", ByteStream::from(b"x".to_vec()), None)
            .await
            .unwrap_err();
        assert!(err.is_path_not_found());
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let storage = InMemoryStorage::new().unwrap();
        let key = generate_key();
        storage
            .store(&key, ByteStream::from(b"x".to_vec()), None)
            .await
            .unwrap();

        storage.delete(&key).await.unwrap();
        storage.delete(&key).await.unwrap();
        assert!(storage.get(&key, 0).await.unwrap_err().is_path_not_found());
    }

    #[tokio::test]
    async fn url_for_serves_fetchable_url() {
        let storage = InMemoryStorage::new().unwrap();
        let key = generate_key();
        storage
            .store(&key, ByteStream::from(b"over http".to_vec()), None)
            .await
            .unwrap();

        let url = storage.url_for(&key).await.unwrap();
        let resp = reqwest::get(&url).await.unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::OK);
        assert_eq!(&resp.bytes().await.unwrap()[..], b"over http");

        let missing = storage.url_for("no-such-key").await.unwrap();
        let resp = reqwest::get(&missing).await.unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::NOT_FOUND);
    }
}
