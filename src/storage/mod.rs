pub mod inmemory;
pub mod mds;

use async_trait::async_trait;

use crate::byte_stream::ByteStream;
use crate::error::DriverError;

/// Generate a fresh opaque blob key: 32 hex characters.
pub fn generate_key() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// A plain key-value store for raw blob bytes.
///
/// The driver keeps the path tree in PostgreSQL and only hands opaque keys to
/// the implementations of this trait. `append` and `url_for` are optional
/// capabilities; backends without them report
/// [`DriverError::AppendUnsupported`] / [`DriverError::Unsupported`].
#[async_trait]
pub trait KvStorage: Send + Sync {
    /// Consume `data` fully and persist it under `key`, returning the number
    /// of bytes written. `size` is the anticipated content size, used by
    /// backends that must announce the upload length up front.
    async fn store(&self, key: &str, data: ByteStream, size: Option<u64>) -> Result<u64, DriverError>;

    /// Extend the value stored under `key` with `data`, returning the new
    /// total size.
    async fn append(&self, key: &str, data: ByteStream, size: Option<u64>) -> Result<u64, DriverError>;

    /// Stream the value stored under `key`, starting at `offset`.
    async fn get(&self, key: &str, offset: u64) -> Result<ByteStream, DriverError>;

    /// Remove the value stored under `key`. Idempotent.
    async fn delete(&self, key: &str) -> Result<(), DriverError>;

    /// Resolve a direct-read URL for `key`.
    async fn url_for(&self, key: &str) -> Result<String, DriverError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_keys_are_opaque_hex() {
        let key = generate_key();
        assert_eq!(key.len(), 32);
        assert!(key.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(key, generate_key());
    }
}
