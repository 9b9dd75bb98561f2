use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::{Error, Result};

/// Name of the logical decoding output plugin the pipeline decodes.
pub const OUTPUT_PLUGIN: &str = "pgoutput";

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub source: SourceConfig,
    pub target: TargetConfig,
    pub replication: ReplicationConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SourceConfig {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub username: String,
    pub password: String,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_application_name")]
    pub application_name: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TargetConfig {
    /// tokio-postgres connection string, key/value or URL form.
    pub url: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ReplicationConfig {
    pub slot_name: String,
    pub publication: String,
    #[serde(default = "default_origin_name")]
    pub origin_name: String,
    #[serde(default = "default_temporary_slot")]
    pub temporary_slot: bool,
    #[serde(default = "default_proto_version")]
    pub proto_version: u32,
    #[serde(default = "default_streaming")]
    pub streaming: bool,
    #[serde(default = "default_messages")]
    pub messages: bool,
    #[serde(default = "default_standby_interval_secs")]
    pub standby_interval_secs: u64,
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path.as_ref()))
            .add_source(
                config::Environment::with_prefix("PG_APPLY")
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()
            .map_err(|e| Error::Config(e.to_string()))?;

        let config: Config = settings
            .try_deserialize()
            .map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let replication = &self.replication;
        if replication.slot_name.is_empty() {
            return Err(Error::Config("replication.slot_name must not be empty".to_string()));
        }
        if replication.publication.is_empty() {
            return Err(Error::Config("replication.publication must not be empty".to_string()));
        }
        if replication.origin_name.is_empty() {
            return Err(Error::Config("replication.origin_name must not be empty".to_string()));
        }
        if replication.standby_interval_secs == 0 {
            return Err(Error::Config("replication.standby_interval_secs must be positive".to_string()));
        }
        if replication.flush_interval_ms == 0 {
            return Err(Error::Config("replication.flush_interval_ms must be positive".to_string()));
        }
        if replication.queue_capacity == 0 {
            return Err(Error::Config("replication.queue_capacity must be positive".to_string()));
        }
        if !(1..=4).contains(&replication.proto_version) {
            return Err(Error::Config(format!(
                "unsupported pgoutput proto_version {}",
                replication.proto_version
            )));
        }
        // In-stream segmentation of large transactions arrived with protocol version 2.
        if replication.streaming && replication.proto_version < 2 {
            return Err(Error::Config(
                "replication.streaming requires proto_version 2 or later".to_string(),
            ));
        }
        Ok(())
    }

    /// Options passed to the output plugin in `START_REPLICATION`.
    pub fn plugin_args(&self) -> Vec<String> {
        let replication = &self.replication;
        let mut args = vec![
            format!("proto_version '{}'", replication.proto_version),
            format!(
                "publication_names {}",
                pg_escape::quote_literal(&replication.publication)
            ),
        ];
        if replication.messages {
            args.push("messages 'true'".to_string());
        }
        if replication.streaming {
            args.push("streaming 'true'".to_string());
        }
        args
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.source.connect_timeout_secs)
    }

    pub fn standby_interval(&self) -> Duration {
        Duration::from_secs(self.replication.standby_interval_secs)
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.replication.flush_interval_ms)
    }
}

fn default_connect_timeout() -> u64 {
    30
}

fn default_application_name() -> String {
    "pg_apply".to_string()
}

fn default_origin_name() -> String {
    "pg_apply".to_string()
}

fn default_temporary_slot() -> bool {
    true
}

fn default_proto_version() -> u32 {
    2
}

fn default_streaming() -> bool {
    true
}

fn default_messages() -> bool {
    true
}

fn default_standby_interval_secs() -> u64 {
    10
}

fn default_flush_interval_ms() -> u64 {
    2000
}

fn default_queue_capacity() -> usize {
    1024
}
