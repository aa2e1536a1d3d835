//! Driver configuration and construction.
//!
//! The host framework hands drivers a loosely typed key/value mapping, so
//! decoding is weakly typed: strings may fill numeric or boolean fields.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use figment::providers::Serialized;
use figment::Figment;
use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::cluster::{Cluster, PoolSettings, Role};
use crate::driver::PostgresDriver;
use crate::error::DriverError;
use crate::storage::inmemory::InMemoryStorage;
use crate::storage::mds::{MdsOptions, MdsStorage};
use crate::storage::KvStorage;

/// Loosely typed driver parameters, as passed by the host framework.
pub type Parameters = HashMap<String, serde_json::Value>;

#[derive(Debug, Clone, Deserialize)]
pub struct DriverConfig {
    #[serde(default, alias = "URLs", alias = "Urls")]
    pub urls: Vec<String>,
    #[serde(default, alias = "ConnectTimeout")]
    pub connecttimeout: Option<u64>,
    #[serde(default, alias = "MaxOpenConns")]
    pub maxopenconns: u32,
    // An Option keeps an explicit zero distinguishable from an unset value.
    #[serde(default, alias = "MaxIdleConns")]
    pub maxidleconns: Option<u32>,

    #[serde(default, alias = "DisableURLFor")]
    pub disableurlfor: bool,
    #[serde(default, alias = "Owner")]
    pub owner: Option<String>,

    #[serde(rename = "type", alias = "Type", default)]
    pub backend: String,
    #[serde(default, alias = "Options")]
    pub options: Parameters,
}

/// Decode a weakly typed parameter mapping into a config struct.
pub(crate) fn decode_config<T: DeserializeOwned>(parameters: &Parameters) -> Result<T, DriverError> {
    Figment::from(Serialized::defaults(parameters.clone()))
        .extract()
        .map_err(|e| DriverError::Config(e.to_string()))
}

/// Factory registered with the host framework under the `postgres` name.
pub struct PostgresDriverFactory;

impl PostgresDriverFactory {
    /// Decode `parameters` and build the driver.
    pub async fn create(parameters: &Parameters) -> Result<PostgresDriver, DriverError> {
        let config: DriverConfig = decode_config(parameters)?;
        driver_from_config(&config).await
    }
}

/// Build the driver: cluster first, then a reachability check on the
/// primary, then the KV backend (which may itself need the cluster), then
/// the facade. Everything opened so far is closed on a later failure.
pub async fn driver_from_config(config: &DriverConfig) -> Result<PostgresDriver, DriverError> {
    let settings = PoolSettings {
        max_open_conns: config.maxopenconns,
        max_idle_conns: config.maxidleconns,
        max_conn_lifetime: None,
        connect_timeout: config.connecttimeout.map(Duration::from_secs),
    };

    let cluster = Cluster::connect(&config.urls, settings).await?;

    if let Err(e) = sqlx::query("SELECT 1").execute(cluster.db(Role::Master)).await {
        cluster.close().await;
        return Err(e.into());
    }

    let storage: Arc<dyn KvStorage> = match config.backend.as_str() {
        "inmemory" => match InMemoryStorage::new() {
            Ok(storage) => Arc::new(storage),
            Err(e) => {
                cluster.close().await;
                return Err(e);
            }
        },
        "mds" => {
            let options: MdsOptions = match decode_config(&config.options) {
                Ok(options) => options,
                Err(e) => {
                    cluster.close().await;
                    return Err(e);
                }
            };
            match MdsStorage::new(cluster.clone(), options) {
                Ok(storage) => Arc::new(storage),
                Err(e) => {
                    cluster.close().await;
                    return Err(e);
                }
            }
        }
        other => {
            cluster.close().await;
            return Err(DriverError::Config(format!(
                "unsupported binary storage backend {other}"
            )));
        }
    };

    Ok(PostgresDriver::new(
        cluster,
        storage,
        config.disableurlfor,
        config.owner.clone(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decodes_typed_parameters() {
        let parameters: Parameters = HashMap::from([
            ("urls".to_string(), json!(["postgres://a", "postgres://b"])),
            ("maxopenconns".to_string(), json!(10)),
            ("maxidleconns".to_string(), json!(5)),
            ("disableurlfor".to_string(), json!(true)),
            ("type".to_string(), json!("inmemory")),
        ]);

        let config: DriverConfig = decode_config(&parameters).unwrap();
        assert_eq!(config.urls, vec!["postgres://a", "postgres://b"]);
        assert_eq!(config.maxopenconns, 10);
        assert_eq!(config.maxidleconns, Some(5));
        assert!(config.disableurlfor);
        assert_eq!(config.backend, "inmemory");
    }

    #[test]
    fn decodes_weakly_typed_parameters() {
        // Strings fill numeric and boolean fields.
        let parameters: Parameters = HashMap::from([
            ("urls".to_string(), json!(["postgres://a"])),
            ("maxopenconns".to_string(), json!("10")),
            ("maxidleconns".to_string(), json!("0")),
            ("connecttimeout".to_string(), json!("3")),
            ("type".to_string(), json!("mds")),
            (
                "options".to_string(),
                json!({
                    "host": "storage.example.net",
                    "uploadport": "1111",
                    "readport": "80",
                    "authheader": "Basic dGVzdA==",
                    "namespace": "docker-registry",
                }),
            ),
        ]);

        let config: DriverConfig = decode_config(&parameters).unwrap();
        assert_eq!(config.maxopenconns, 10);
        assert_eq!(config.maxidleconns, Some(0));
        assert_eq!(config.connecttimeout, Some(3));
        assert_eq!(config.backend, "mds");

        let options: MdsOptions = decode_config(&config.options).unwrap();
        assert_eq!(options.uploadport, 1111);
        assert_eq!(options.readport, 80);
    }

    #[test]
    fn unset_optionals_stay_unset() {
        let parameters: Parameters =
            HashMap::from([("urls".to_string(), json!(["postgres://a"]))]);

        let config: DriverConfig = decode_config(&parameters).unwrap();
        assert_eq!(config.maxopenconns, 0);
        assert_eq!(config.maxidleconns, None);
        assert_eq!(config.connecttimeout, None);
        assert!(!config.disableurlfor);
        assert!(config.backend.is_empty());
    }

    #[tokio::test]
    async fn unreachable_primary_fails_construction() {
        let parameters: Parameters = HashMap::from([
            ("urls".to_string(), json!(["postgres://user@localhost:1/db"])),
            ("type".to_string(), json!("inmemory")),
        ]);

        // The reachability check runs before the backend is built; nothing
        // is left running behind the error.
        let err = PostgresDriverFactory::create(&parameters).await.unwrap_err();
        assert!(matches!(err, DriverError::Sqlx(_)));
    }
}
