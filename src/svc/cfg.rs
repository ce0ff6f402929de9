//! # Configuration module
//!
//! This module provides utilities and helpers to interact with the resolved
//! integration configuration

use std::{convert::TryFrom, path::PathBuf, time::Duration};

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use tracing::warn;

// -----------------------------------------------------------------------------
// Constants

pub const PORT_BASE_URL: &str = "https://api.getport.io";
pub const HTTP_LISTEN: &str = "0.0.0.0:8000";
pub const RESOURCES_PATH: &str = ".port/resources/port-app-config.yml";
pub const ENVIRONMENT_PREFIX: &str = "OCEAN";
pub const ENVIRONMENT_SEPARATOR: &str = "__";

// -----------------------------------------------------------------------------
// Proxy structure

#[derive(Serialize, Deserialize, PartialEq, Eq, Clone, Debug, Default)]
pub struct Proxy {
    #[serde(rename = "http")]
    pub http: Option<String>,
    #[serde(rename = "https")]
    pub https: Option<String>,
    #[serde(rename = "no", default)]
    pub no: Vec<String>,
}

// -----------------------------------------------------------------------------
// Port structure

/// credentials and endpoint of the Port catalog api
#[derive(Serialize, Deserialize, PartialEq, Eq, Clone, Debug)]
pub struct Port {
    #[serde(rename = "client_id")]
    pub client_id: String,
    #[serde(rename = "client_secret")]
    pub client_secret: String,
    #[serde(rename = "base_url")]
    pub base_url: String,
}

// -----------------------------------------------------------------------------
// Integration structure

/// identity of this integration instance and the opaque parameters forwarded
/// to integration-specific code
#[derive(Serialize, Deserialize, PartialEq, Clone, Debug)]
pub struct Integration {
    #[serde(rename = "identifier")]
    pub identifier: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(rename = "config", default)]
    pub config: serde_json::Value,
}

// -----------------------------------------------------------------------------
// EventListener structures

#[derive(Serialize, Deserialize, PartialEq, Eq, Clone, Copy, Debug, Default)]
pub enum EventListenerKind {
    #[default]
    #[serde(rename = "POLLING")]
    Polling,
    #[serde(rename = "KAFKA")]
    Kafka,
    #[serde(rename = "WEBHOOKS_ONLY")]
    WebhooksOnly,
    #[serde(rename = "ONCE")]
    Once,
}

#[derive(Serialize, Deserialize, PartialEq, Eq, Clone, Debug, Default)]
pub struct EventListener {
    #[serde(rename = "type")]
    pub kind: EventListenerKind,
}

// -----------------------------------------------------------------------------
// Error enumeration

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to load configuration, {0}")]
    Build(ConfigError),
    #[error("failed to deserialize configuration, {0}")]
    Deserialize(ConfigError),
    #[error("failed to set default for key '{0}', {1}")]
    Default(String, ConfigError),
    #[error("configuration key '{0}' is invalid, {1}")]
    Invalid(&'static str, String),
}

// -----------------------------------------------------------------------------
// Configuration structure

#[derive(Serialize, Deserialize, PartialEq, Clone, Debug)]
pub struct Configuration {
    #[serde(rename = "port")]
    pub port: Port,
    #[serde(rename = "integration")]
    pub integration: Integration,
    #[serde(rename = "event_listener", default)]
    pub event_listener: EventListener,
    /// minutes between scheduled full resyncs, disabled when absent
    #[serde(rename = "scheduled_resync_interval", default)]
    pub scheduled_resync_interval: Option<u64>,
    #[serde(rename = "initialize_port_resources")]
    pub initialize_port_resources: bool,
    #[serde(rename = "create_missing_related_entities")]
    pub create_missing_related_entities: bool,
    #[serde(rename = "delete_dependent_entities")]
    pub delete_dependent_entities: bool,
    /// maximum fraction of attributed catalog entities a single resync may
    /// delete, see the delete phase guardrail
    #[serde(rename = "entity_deletion_threshold")]
    pub entity_deletion_threshold: f64,
    /// outstanding requests against the catalog, all operations included
    #[serde(rename = "max_concurrent_requests")]
    pub max_concurrent_requests: usize,
    /// outstanding upsert batches per integration instance
    #[serde(rename = "max_concurrent_upserts")]
    pub max_concurrent_upserts: usize,
    #[serde(rename = "upsert_batch_size")]
    pub upsert_batch_size: usize,
    /// retry attempts for transient catalog failures
    #[serde(rename = "max_retries")]
    pub max_retries: u32,
    /// retry attempts for a webhook processor before the event is dropped
    #[serde(rename = "event_max_retries")]
    pub event_max_retries: u32,
    #[serde(rename = "event_queue_high_watermark")]
    pub event_queue_high_watermark: usize,
    /// mapping worker tasks, clamped to [2, 16]; defaults to the machine
    /// parallelism when absent
    #[serde(rename = "mapping_workers", default)]
    pub mapping_workers: Option<usize>,
    #[serde(rename = "http_timeout_seconds")]
    pub http_timeout_seconds: u64,
    #[serde(rename = "verify_ssl")]
    pub verify_ssl: bool,
    #[serde(rename = "listen")]
    pub listen: String,
    /// local fallback for the mapping document when the catalog holds none
    #[serde(rename = "resources_path")]
    pub resources_path: String,
    #[serde(rename = "proxy", default)]
    pub proxy: Option<Proxy>,
}

impl TryFrom<PathBuf> for Configuration {
    type Error = Error;

    fn try_from(path: PathBuf) -> Result<Self, Self::Error> {
        defaults(Config::builder())?
            .add_source(File::from(path).required(true))
            .add_source(environment())
            .build()
            .map_err(Error::Build)?
            .try_deserialize::<Self>()
            .map_err(Error::Deserialize)?
            .validate()
    }
}

impl Configuration {
    pub fn try_default() -> Result<Self, Error> {
        defaults(Config::builder())?
            .add_source(
                File::from(PathBuf::from(format!(
                    "/etc/{}/config",
                    env!("CARGO_PKG_NAME")
                )))
                .required(false),
            )
            .add_source(File::from(PathBuf::from("config")).required(false))
            .add_source(environment())
            .build()
            .map_err(Error::Build)?
            .try_deserialize::<Self>()
            .map_err(Error::Deserialize)?
            .validate()
    }

    fn validate(self) -> Result<Self, Error> {
        if !(0.0..=1.0).contains(&self.entity_deletion_threshold) {
            return Err(Error::Invalid(
                "entity_deletion_threshold",
                format!(
                    "expected a fraction within [0, 1], got {}",
                    self.entity_deletion_threshold
                ),
            ));
        }

        if self.max_concurrent_requests == 0 {
            return Err(Error::Invalid(
                "max_concurrent_requests",
                "expected a strictly positive request budget".to_string(),
            ));
        }

        if self.upsert_batch_size == 0 {
            return Err(Error::Invalid(
                "upsert_batch_size",
                "expected a strictly positive batch size".to_string(),
            ));
        }

        Ok(self)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_seconds)
    }

    pub fn resync_interval(&self) -> Option<Duration> {
        self.scheduled_resync_interval
            .map(|minutes| Duration::from_secs(minutes * 60))
    }

    /// number of cooperative mapping workers, clamped to [2, 16]
    pub fn mapping_workers(&self) -> usize {
        let workers = self.mapping_workers.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|parallelism| parallelism.get())
                .unwrap_or(2)
        });

        workers.clamp(2, 16)
    }

    /// Prints a message about missing value for configuration key
    pub fn help(&self) {
        if self.port.client_id.is_empty() {
            warn!("Configuration key 'port.client_id' has an empty value");
        }

        if self.port.client_secret.is_empty() {
            warn!("Configuration key 'port.client_secret' has an empty value");
        }

        if self.integration.identifier.is_empty() {
            warn!("Configuration key 'integration.identifier' has an empty value");
        }

        if self.integration.kind.is_empty() {
            warn!("Configuration key 'integration.type' has an empty value");
        }
    }
}

// -----------------------------------------------------------------------------
// helpers

fn environment() -> Environment {
    Environment::with_prefix(ENVIRONMENT_PREFIX)
        .prefix_separator(ENVIRONMENT_SEPARATOR)
        .separator(ENVIRONMENT_SEPARATOR)
        .try_parsing(true)
}

fn defaults(
    builder: config::ConfigBuilder<config::builder::DefaultState>,
) -> Result<config::ConfigBuilder<config::builder::DefaultState>, Error> {
    let defaults: &[(&str, config::Value)] = &[
        ("port.client_id", "".into()),
        ("port.client_secret", "".into()),
        ("port.base_url", PORT_BASE_URL.into()),
        ("integration.identifier", "".into()),
        ("integration.type", "".into()),
        ("event_listener.type", "POLLING".into()),
        ("initialize_port_resources", false.into()),
        ("create_missing_related_entities", true.into()),
        ("delete_dependent_entities", true.into()),
        ("entity_deletion_threshold", 0.9.into()),
        ("max_concurrent_requests", 20i64.into()),
        ("max_concurrent_upserts", 10i64.into()),
        ("upsert_batch_size", 20i64.into()),
        ("max_retries", 5i64.into()),
        ("event_max_retries", 3i64.into()),
        ("event_queue_high_watermark", 1000i64.into()),
        ("http_timeout_seconds", 30i64.into()),
        ("verify_ssl", true.into()),
        ("listen", HTTP_LISTEN.into()),
        ("resources_path", RESOURCES_PATH.into()),
    ];

    let mut builder = builder;
    for (key, value) in defaults {
        builder = builder
            .set_default(*key, value.to_owned())
            .map_err(|err| Error::Default((*key).to_string(), err))?;
    }

    Ok(builder)
}

// -----------------------------------------------------------------------------
// Test support

#[cfg(test)]
pub mod tests_support {
    use super::{Configuration, EventListener, Integration, Port};

    /// returns a configuration with documented defaults and test credentials
    pub fn configuration() -> Configuration {
        Configuration {
            port: Port {
                client_id: "client-id".to_string(),
                client_secret: "client-secret".to_string(),
                base_url: super::PORT_BASE_URL.to_string(),
            },
            integration: Integration {
                identifier: "jira-test".to_string(),
                kind: "jira".to_string(),
                config: serde_json::Value::Null,
            },
            event_listener: EventListener::default(),
            scheduled_resync_interval: None,
            initialize_port_resources: false,
            create_missing_related_entities: true,
            delete_dependent_entities: true,
            entity_deletion_threshold: 0.9,
            max_concurrent_requests: 20,
            max_concurrent_upserts: 10,
            upsert_batch_size: 20,
            max_retries: 5,
            event_max_retries: 3,
            event_queue_high_watermark: 1000,
            mapping_workers: Some(2),
            http_timeout_seconds: 30,
            verify_ssl: true,
            listen: super::HTTP_LISTEN.to_string(),
            resources_path: super::RESOURCES_PATH.to_string(),
            proxy: None,
        }
    }
}

// -----------------------------------------------------------------------------
// Tests

#[cfg(test)]
mod tests {
    use std::{convert::TryFrom, io::Write, path::PathBuf};

    use super::{Configuration, EventListenerKind};

    fn write_config(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new()
            .suffix(".yaml")
            .tempfile()
            .expect("temporary file to be created");

        file.write_all(content.as_bytes())
            .expect("configuration to be written");

        file
    }

    #[test]
    fn defaults_should_match_documented_values() {
        let file = write_config(
            r#"
port:
  client_id: "id"
  client_secret: "secret"
integration:
  identifier: "jira-prod"
  type: "jira"
"#,
        );

        let config = Configuration::try_from(PathBuf::from(file.path()))
            .expect("configuration to be loaded");

        assert_eq!(config.port.base_url, super::PORT_BASE_URL);
        assert_eq!(config.event_listener.kind, EventListenerKind::Polling);
        assert_eq!(config.scheduled_resync_interval, None);
        assert!(config.create_missing_related_entities);
        assert!(config.delete_dependent_entities);
        assert!(!config.initialize_port_resources);
        assert_eq!(config.entity_deletion_threshold, 0.9);
        assert_eq!(config.max_concurrent_requests, 20);
        assert_eq!(config.max_concurrent_upserts, 10);
        assert_eq!(config.upsert_batch_size, 20);
        assert_eq!(config.max_retries, 5);
        assert_eq!(config.event_max_retries, 3);
        assert_eq!(config.http_timeout_seconds, 30);
        assert!(config.verify_ssl);
        assert_eq!(config.listen, super::HTTP_LISTEN);
        assert_eq!(config.resources_path, super::RESOURCES_PATH);
    }

    #[test]
    fn file_should_override_defaults() {
        let file = write_config(
            r#"
port:
  client_id: "id"
  client_secret: "secret"
  base_url: "https://api.eu.getport.io"
integration:
  identifier: "jira-prod"
  type: "jira"
  config:
    host: "https://jira.example.com"
event_listener:
  type: "ONCE"
scheduled_resync_interval: 120
entity_deletion_threshold: 0.5
upsert_batch_size: 50
"#,
        );

        let config = Configuration::try_from(PathBuf::from(file.path()))
            .expect("configuration to be loaded");

        assert_eq!(config.port.base_url, "https://api.eu.getport.io");
        assert_eq!(config.event_listener.kind, EventListenerKind::Once);
        assert_eq!(config.scheduled_resync_interval, Some(120));
        assert_eq!(config.entity_deletion_threshold, 0.5);
        assert_eq!(config.upsert_batch_size, 50);
        assert_eq!(
            config.integration.config["host"],
            serde_json::json!("https://jira.example.com")
        );
    }

    #[test]
    fn out_of_range_threshold_should_be_rejected() {
        let file = write_config(
            r#"
port:
  client_id: "id"
  client_secret: "secret"
integration:
  identifier: "jira-prod"
  type: "jira"
entity_deletion_threshold: 1.5
"#,
        );

        assert!(Configuration::try_from(PathBuf::from(file.path())).is_err());
    }

    #[test]
    fn mapping_workers_should_be_clamped() {
        let file = write_config(
            r#"
port:
  client_id: "id"
  client_secret: "secret"
integration:
  identifier: "jira-prod"
  type: "jira"
mapping_workers: 64
"#,
        );

        let config = Configuration::try_from(PathBuf::from(file.path()))
            .expect("configuration to be loaded");

        assert_eq!(config.mapping_workers(), 16);
    }
}
