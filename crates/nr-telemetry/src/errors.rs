// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Error types for decoding agent payloads, building requests and opening the ingress pipe.

/// Failure to decode an agent envelope or to find a trace id in it.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("unable to base64 decode payload: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("unable to unmarshal payload data array: {0}")]
    Envelope(serde_json::Error),

    #[error("invalid payload structure, expected at least 3 elements, got {0}")]
    TooShort(usize),

    #[error("unable to parse protocol version")]
    InvalidVersion,

    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(serde_json::Number),

    #[error("compressed payload is not a string")]
    MissingCompressedPayload,

    #[error("unable to uncompress payload: {0}")]
    Gzip(std::io::Error),

    #[error("unable to unmarshal uncompressed payload: {0}")]
    Data(serde_json::Error),

    #[error("no trace id found in payload")]
    TraceIdNotFound,
}

/// Failure to build the requests for a send. Per-buffer transmission failures are counted,
/// not returned.
#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("failed to serialize payload: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("error compressing data: {0}")]
    Compress(std::io::Error),

    #[error("invalid header value for {name}")]
    InvalidHeader { name: &'static str },

    #[error("license key is not available")]
    MissingLicenseKey,

    #[error("unable to build HTTP client: {0}")]
    Client(reqwest::Error),
}

/// Failure to set up the named pipe the agent writes to.
#[derive(Debug, thiserror::Error)]
pub enum IngressError {
    #[error("failed to create telemetry pipe {path}: {source}")]
    Create {
        path: String,
        source: std::io::Error,
    },

    #[error("telemetry pipe {0} did not become visible")]
    NotVisible(String),

    #[error("failed to spawn telemetry reader: {0}")]
    Spawn(std::io::Error),

    #[error("named pipes are not supported on this platform")]
    Unsupported,
}
