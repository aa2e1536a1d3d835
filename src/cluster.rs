//! Master tracking over a replicated PostgreSQL cluster.
//!
//! One pool per replica; the current primary is an atomic index into the
//! pool list. A background watcher re-elects every five seconds, and callers
//! can force an election after a connectivity error.

use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::PgPool;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::DriverError;

const ELECTION_INTERVAL: Duration = Duration::from_secs(5);

/// Which member of the cluster a caller wants to talk to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Master,
    /// Reads from the primary for now; the role exists so that refinement
    /// needs no API change.
    Slave,
}

/// Connection pool knobs applied to every replica.
#[derive(Debug, Clone, Default)]
pub struct PoolSettings {
    pub max_open_conns: u32,
    pub max_idle_conns: Option<u32>,
    pub max_conn_lifetime: Option<Duration>,
    pub connect_timeout: Option<Duration>,
}

/// Observable cluster state.
#[derive(Debug, Clone, Serialize)]
pub struct ClusterStats {
    pub primary: usize,
    pub last_election: i64,
}

/// A PostgreSQL cluster keeping track of the current master.
#[derive(Debug)]
pub struct Cluster {
    pools: Vec<PgPool>,
    current_master: AtomicUsize,
    last_election: AtomicI64,
    stop: CancellationToken,
    watcher: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl Cluster {
    /// Open one pool per connection string and elect an initial master.
    ///
    /// Pools connect lazily; construction fails only on empty or duplicated
    /// connection strings, or unparsable URLs.
    pub async fn connect(conn_strings: &[String], settings: PoolSettings) -> Result<Arc<Cluster>, DriverError> {
        if conn_strings.is_empty() {
            return Err(DriverError::ZeroDataSource);
        }

        let mut pools = Vec::with_capacity(conn_strings.len());
        for (idx, conn_str) in conn_strings.iter().enumerate() {
            if conn_strings[..idx].contains(conn_str) {
                close_all(&pools).await;
                return Err(DriverError::DuplicatedDataSource);
            }

            let options: PgConnectOptions = match conn_str.parse() {
                Ok(options) => options,
                Err(e) => {
                    close_all(&pools).await;
                    return Err(DriverError::Config(format!("invalid data source `{conn_str}`: {e}")));
                }
            };

            let mut pool_options = PgPoolOptions::new();
            if settings.max_open_conns != 0 {
                pool_options = pool_options.max_connections(settings.max_open_conns);
            }
            if let Some(max_idle) = settings.max_idle_conns {
                pool_options = pool_options.min_connections(max_idle);
            }
            if let Some(lifetime) = settings.max_conn_lifetime {
                pool_options = pool_options.max_lifetime(lifetime);
            }
            if let Some(timeout) = settings.connect_timeout {
                pool_options = pool_options.acquire_timeout(timeout);
            }

            pools.push(pool_options.connect_lazy_with(options));
        }

        let cluster = Arc::new(Cluster {
            pools,
            current_master: AtomicUsize::new(0),
            last_election: AtomicI64::new(0),
            stop: CancellationToken::new(),
            watcher: std::sync::Mutex::new(None),
        });

        cluster.re_elect().await;

        let watcher = spawn_watcher(&cluster);
        *cluster.watcher.lock().unwrap_or_else(|e| e.into_inner()) = Some(watcher);

        Ok(cluster)
    }

    /// The pool currently designated for `role`.
    pub fn db(&self, role: Role) -> &PgPool {
        match role {
            // Always set, even if there is no master at all.
            Role::Master | Role::Slave => &self.pools[self.current_master.load(Ordering::SeqCst)],
        }
    }

    /// Probe the current master and, if it lost its role, elect the first
    /// replica that reports itself writable. Keeps the previous designation
    /// when nothing qualifies.
    pub async fn re_elect(&self) {
        self.last_election.store(Utc::now().timestamp(), Ordering::SeqCst);

        let current = self.current_master.load(Ordering::SeqCst);
        if is_master(&self.pools[current]).await {
            return;
        }

        for (idx, pool) in self.pools.iter().enumerate() {
            if is_master(pool).await {
                debug!(primary = idx, "elected new cluster primary");
                self.current_master.store(idx, Ordering::SeqCst);
                return;
            }
        }
    }

    pub fn stats(&self) -> ClusterStats {
        ClusterStats {
            primary: self.current_master.load(Ordering::SeqCst),
            last_election: self.last_election.load(Ordering::SeqCst),
        }
    }

    /// Stop the watcher and close every pool.
    pub async fn close(&self) {
        self.stop.cancel();

        let watcher = self.watcher.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(watcher) = watcher {
            let _ = watcher.await;
        }

        for pool in &self.pools {
            pool.close().await;
        }
    }
}

async fn close_all(pools: &[PgPool]) {
    for pool in pools {
        pool.close().await;
    }
}

/// A node is the master if it is not in recovery. Probe errors demote it.
async fn is_master(pool: &PgPool) -> bool {
    match sqlx::query_scalar::<_, bool>("SELECT pg_is_in_recovery()")
        .fetch_one(pool)
        .await
    {
        Ok(in_recovery) => !in_recovery,
        Err(_) => false,
    }
}

fn spawn_watcher(cluster: &Arc<Cluster>) -> JoinHandle<()> {
    let weak = Arc::downgrade(cluster);
    let stop = cluster.stop.clone();

    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = stop.cancelled() => return,
                _ = tokio::time::sleep(ELECTION_INTERVAL) => {
                    let Some(cluster) = weak.upgrade() else { return };
                    cluster.re_elect().await;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn rejects_empty_data_sources() {
        let err = Cluster::connect(&[], PoolSettings::default()).await.unwrap_err();
        assert!(matches!(err, DriverError::ZeroDataSource));
    }

    #[tokio::test]
    async fn rejects_duplicated_data_sources() {
        let urls = vec![
            "postgres://user@localhost:5432/distribution".to_string(),
            "postgres://user@localhost:5432/distribution".to_string(),
        ];
        let err = Cluster::connect(&urls, PoolSettings::default()).await.unwrap_err();
        assert!(matches!(err, DriverError::DuplicatedDataSource));
    }

    #[tokio::test]
    async fn rejects_unparsable_urls() {
        let urls = vec!["not a url at all".to_string()];
        let err = Cluster::connect(&urls, PoolSettings::default()).await.unwrap_err();
        assert!(matches!(err, DriverError::Config(_)));
    }
}
