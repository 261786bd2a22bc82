// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Collector request bodies.
//!
//! Agent fragments are forwarded to the collector as CloudWatch style log events, wrapped in
//! a request context and gzip compressed. Batches whose compressed size exceeds the
//! configured limit are split in halves until every buffer fits or holds a single event.

use std::io::Write;
use std::time::SystemTime;

use bytes::Bytes;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::Serialize;
use uuid::Uuid;

use crate::constants::EXTENSION_ID;
use crate::errors::SendError;
use crate::logs::unix_millis;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogsEvent {
    pub id: String,
    pub message: String,
    pub timestamp: i64,
}

impl LogsEvent {
    #[must_use]
    pub fn from_bytes(payload: &[u8]) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            message: String::from_utf8_lossy(payload).into_owned(),
            timestamp: unix_millis(SystemTime::now()),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct LogsEntry<'a> {
    log_events: &'a [LogsEvent],
    log_group: &'a str,
    log_stream: &'a str,
    message_type: &'a str,
    owner: &'a str,
}

/// Request context expected by the collector. The log group and stream only need to be
/// present.
#[derive(Debug, Serialize)]
struct RequestContext<'a> {
    function_name: &'a str,
    invoked_function_arn: &'a str,
    log_group_name: &'a str,
    log_stream_name: &'a str,
}

#[derive(Debug, Serialize)]
struct RequestData<'a> {
    context: RequestContext<'a>,
    entry: String,
}

pub fn compress(data: &[u8]) -> Result<Bytes, SendError> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data).map_err(SendError::Compress)?;
    encoder.finish().map(Bytes::from).map_err(SendError::Compress)
}

pub fn compressed_json_payload<T: Serialize + ?Sized>(payload: &T) -> Result<Bytes, SendError> {
    let uncompressed = serde_json::to_vec(payload)?;
    compress(&uncompressed)
}

/// Builds the compressed buffers for `events`, splitting recursively when a buffer exceeds
/// `max_len`. A single event that is still too large is returned as is.
pub fn compressed_payloads_for_log_events(
    events: &[LogsEvent],
    function_name: &str,
    invoked_function_arn: &str,
    max_len: usize,
) -> Result<Vec<Bytes>, SendError> {
    let log_group = format!("/aws/lambda/{function_name}");
    let entry = serde_json::to_string(&LogsEntry {
        log_events: events,
        log_group: &log_group,
        log_stream: "",
        message_type: "",
        owner: "",
    })?;
    let data = RequestData {
        context: RequestContext {
            function_name,
            invoked_function_arn,
            log_group_name: &log_group,
            log_stream_name: EXTENSION_ID,
        },
        entry,
    };

    let compressed = compressed_json_payload(&data)?;
    if compressed.len() <= max_len || events.len() <= 1 {
        return Ok(vec![compressed]);
    }

    let (left, right) = events.split_at(events.len() / 2);
    let mut buffers =
        compressed_payloads_for_log_events(left, function_name, invoked_function_arn, max_len)?;
    buffers.extend(compressed_payloads_for_log_events(
        right,
        function_name,
        invoked_function_arn,
        max_len,
    )?);
    Ok(buffers)
}
