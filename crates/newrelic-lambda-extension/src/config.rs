// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::collections::BTreeMap;
use std::env;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use tracing::warn;

use nr_telemetry::constants::{
    DEFAULT_DATA_COLLECTION_TIMEOUT, DEFAULT_RIPE_WINDOW, DEFAULT_ROT_WINDOW,
    MAX_COMPRESSED_PAYLOAD_LEN,
};
use nr_telemetry::flusher::FlusherConfig;
use nr_telemetry::license_key::LicenseKeyFactory;
use nr_telemetry::logs::parse_tags;

/// Deadlines at or below this are too short to deliver anything and are ignored.
const MIN_DATA_COLLECTION_TIMEOUT_MS: u64 = 400;
const DEFAULT_TAG_DELIMITER: &str = ";";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("NEW_RELIC_LICENSE_KEY environment variable is not set")]
    MissingLicenseKey,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub enabled: bool,
    pub license_key: String,
    pub telemetry_endpoint: Option<String>,
    pub log_endpoint: Option<String>,
    pub ripe_window: Duration,
    pub rot_window: Duration,
    /// Deadline of one buffer send, retries included.
    pub data_collection_timeout: Duration,
    pub collect_trace_id: bool,
    pub log_level: String,
    pub tags: BTreeMap<String, String>,
    pub max_payload_bytes: usize,
    pub https_proxy: Option<String>,
    pub function_name: String,
    /// `host:port` of the Lambda Extensions API.
    pub runtime_api: Option<String>,
}

impl Config {
    pub fn from_env() -> Result<Config, ConfigError> {
        let enabled = env::var("NEW_RELIC_LAMBDA_EXTENSION_ENABLED")
            .map(|val| val.to_lowercase() != "false")
            .unwrap_or(true);

        let license_key = non_empty_var("NEW_RELIC_LICENSE_KEY").unwrap_or_default();
        if enabled && license_key.is_empty() {
            return Err(ConfigError::MissingLicenseKey);
        }

        let ripe_window = Duration::from_millis(parse_var(
            "NEW_RELIC_HARVEST_RIPE_MILLIS",
            millis(DEFAULT_RIPE_WINDOW),
        ));
        let rot_window = Duration::from_millis(parse_var(
            "NEW_RELIC_HARVEST_ROT_MILLIS",
            millis(DEFAULT_ROT_WINDOW),
        ));
        if ripe_window >= rot_window {
            warn!(
                "Ripe window ({}ms) is not shorter than rot window ({}ms), invocations will only be harvested when rotten",
                ripe_window.as_millis(),
                rot_window.as_millis()
            );
        }

        let timeout_ms = parse_var(
            "NEW_RELIC_DATA_COLLECTION_TIMEOUT",
            millis(DEFAULT_DATA_COLLECTION_TIMEOUT),
        );
        let data_collection_timeout = if timeout_ms > MIN_DATA_COLLECTION_TIMEOUT_MS {
            Duration::from_millis(timeout_ms)
        } else {
            warn!(
                "NEW_RELIC_DATA_COLLECTION_TIMEOUT must be greater than {MIN_DATA_COLLECTION_TIMEOUT_MS}ms, using default"
            );
            DEFAULT_DATA_COLLECTION_TIMEOUT
        };

        let delimiter = non_empty_var("NEW_RELIC_ENV_DELIMITER")
            .unwrap_or_else(|| DEFAULT_TAG_DELIMITER.to_string());
        let tags = non_empty_var("NEW_RELIC_TAGS")
            .map(|raw| parse_tags(&raw, &delimiter))
            .unwrap_or_default();

        Ok(Config {
            enabled,
            license_key,
            telemetry_endpoint: non_empty_var("NEW_RELIC_TELEMETRY_ENDPOINT"),
            log_endpoint: non_empty_var("NEW_RELIC_LOG_ENDPOINT"),
            ripe_window,
            rot_window,
            data_collection_timeout,
            collect_trace_id: env::var("NEW_RELIC_COLLECT_TRACE_ID")
                .map(|val| val.to_lowercase() == "true")
                .unwrap_or(false),
            log_level: log_level(),
            tags,
            max_payload_bytes: parse_var("NEW_RELIC_MAX_PAYLOAD_BYTES", MAX_COMPRESSED_PAYLOAD_LEN),
            https_proxy: non_empty_var("HTTPS_PROXY"),
            function_name: non_empty_var("AWS_LAMBDA_FUNCTION_NAME")
                .unwrap_or_else(|| env!("CARGO_BIN_NAME").to_string()),
            runtime_api: non_empty_var("AWS_LAMBDA_RUNTIME_API"),
        })
    }

    #[must_use]
    pub fn flusher_config(&self) -> FlusherConfig {
        let mut config = FlusherConfig::new(
            Arc::new(LicenseKeyFactory::new_from_static_key(&self.license_key)),
            &self.function_name,
        );
        config.telemetry_endpoint_override = self.telemetry_endpoint.clone();
        config.log_endpoint_override = self.log_endpoint.clone();
        config.https_proxy = self.https_proxy.clone();
        config.deadline = self.data_collection_timeout;
        config.max_payload_size = self.max_payload_bytes;
        config.tags = self.tags.clone();
        config.collect_trace_id = self.collect_trace_id;
        config
    }
}

/// Log filter of the extension. Read on its own so logging is set up before the rest of
/// the configuration is parsed.
pub fn log_level() -> String {
    non_empty_var("NEW_RELIC_EXTENSION_LOG_LEVEL")
        .map(|val| val.trim().to_lowercase())
        .unwrap_or_else(|| "info".to_string())
}

fn non_empty_var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|val| !val.trim().is_empty())
}

fn parse_var<T: FromStr>(name: &str, default: T) -> T {
    match non_empty_var(name) {
        None => default,
        Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
            warn!("Unable to parse {name}={raw}, using default");
            default
        }),
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
