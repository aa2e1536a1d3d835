//! PostgreSQL-backed storage driver for a container image registry.
//!
//! The driver presents a hierarchical file namespace on top of a split
//! backend: PostgreSQL holds the path tree (`mfs`) and blob-key records
//! (`mds`), a pluggable KV blob store holds the raw bytes. Writes go through
//! a streaming [`FileWriter`] that couples an in-flight blob upload with a
//! deferred metadata commit.

pub mod byte_stream;
pub mod cluster;
pub mod config;
pub mod driver;
pub mod error;
mod metadata;
pub mod metrics;
mod paths;
pub mod storage;
pub mod writer;

pub use byte_stream::ByteStream;
pub use cluster::{Cluster, ClusterStats, PoolSettings, Role};
pub use config::{DriverConfig, Parameters, PostgresDriverFactory};
pub use driver::{FileInfo, PostgresDriver, StorageDriver, DRIVER_NAME};
pub use error::DriverError;
pub use writer::FileWriter;
