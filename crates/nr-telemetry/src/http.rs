// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::error::Error;
use std::time::Duration;

use reqwest::header::{
    HeaderMap, HeaderName, HeaderValue, CONTENT_ENCODING, CONTENT_TYPE, USER_AGENT,
};

use crate::constants::{EXTENSION_NAME, EXTENSION_VERSION};
use crate::errors::SendError;

pub const LICENSE_KEY_HEADER: &str = "X-License-Key";
pub const EVENT_SOURCE_HEADER: &str = "X-Event-Source";

/// Builds a reqwest client with optional proxy configuration and a per-request timeout.
pub fn build_client(
    proxy_url: Option<&str>,
    timeout: Duration,
) -> Result<reqwest::Client, Box<dyn Error>> {
    let mut builder = reqwest::Client::builder().timeout(timeout);
    if let Some(proxy) = proxy_url {
        builder = builder.proxy(reqwest::Proxy::https(proxy)?);
    }
    Ok(builder.build()?)
}

/// Headers shared by every collector request.
pub fn collector_headers(
    license_key: &str,
    event_source: Option<&str>,
) -> Result<HeaderMap, SendError> {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_ENCODING, HeaderValue::from_static("gzip"));
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    headers.insert(
        USER_AGENT,
        header_value("User-Agent", &format!("{EXTENSION_NAME}/{EXTENSION_VERSION}"))?,
    );
    headers.insert(
        HeaderName::from_static("x-license-key"),
        header_value(LICENSE_KEY_HEADER, license_key)?,
    );
    if let Some(source) = event_source {
        headers.insert(
            HeaderName::from_static("x-event-source"),
            header_value(EVENT_SOURCE_HEADER, source)?,
        );
    }
    Ok(headers)
}

fn header_value(name: &'static str, value: &str) -> Result<HeaderValue, SendError> {
    HeaderValue::from_str(value).map_err(|_| SendError::InvalidHeader { name })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collector_headers() {
        let headers = collector_headers("mock-license-key", None).unwrap();
        assert_eq!(headers.get(CONTENT_ENCODING).unwrap(), "gzip");
        assert_eq!(headers.get(CONTENT_TYPE).unwrap(), "application/json");
        assert_eq!(headers.get("x-license-key").unwrap(), "mock-license-key");
        assert!(headers
            .get(USER_AGENT)
            .unwrap()
            .to_str()
            .unwrap()
            .starts_with("newrelic-lambda-extension/"));
        assert!(headers.get("x-event-source").is_none());
    }

    #[test]
    fn test_event_source_header() {
        let headers = collector_headers("key", Some("logs")).unwrap();
        assert_eq!(headers.get("x-event-source").unwrap(), "logs");
    }

    #[test]
    fn test_invalid_license_key() {
        assert!(matches!(
            collector_headers("bad\nkey", None),
            Err(SendError::InvalidHeader {
                name: LICENSE_KEY_HEADER
            })
        ));
    }

    #[test]
    fn test_build_client_rejects_bad_proxy() {
        assert!(build_client(Some("not a url"), Duration::from_secs(1)).is_err());
        assert!(build_client(None, Duration::from_secs(1)).is_ok());
    }
}
