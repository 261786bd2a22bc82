// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Region routing of collector endpoints. License keys issued in the EU region start with
//! `eu`; an explicit override always wins.

pub const TELEMETRY_ENDPOINT_US: &str = "https://cloud-collector.newrelic.com/aws/lambda/v1";
pub const TELEMETRY_ENDPOINT_EU: &str = "https://cloud-collector.eu01.nr-data.net/aws/lambda/v1";
pub const LOG_ENDPOINT_US: &str = "https://log-api.newrelic.com/log/v1";
pub const LOG_ENDPOINT_EU: &str = "https://log-api.eu.newrelic.com/log/v1";

fn is_eu(license_key: &str) -> bool {
    license_key.starts_with("eu")
}

fn pick(override_url: Option<&str>, license_key: &str, us: &str, eu: &str) -> String {
    match override_url.filter(|url| !url.is_empty()) {
        Some(url) => url.to_string(),
        None if is_eu(license_key) => eu.to_string(),
        None => us.to_string(),
    }
}

#[must_use]
pub fn telemetry_endpoint(license_key: &str, override_url: Option<&str>) -> String {
    pick(
        override_url,
        license_key,
        TELEMETRY_ENDPOINT_US,
        TELEMETRY_ENDPOINT_EU,
    )
}

#[must_use]
pub fn log_endpoint(license_key: &str, override_url: Option<&str>) -> String {
    pick(override_url, license_key, LOG_ENDPOINT_US, LOG_ENDPOINT_EU)
}
