// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Logs API payloads for function log lines.

use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;
use serde_json::{json, Map, Value};

use crate::constants::EXTENSION_ID;

/// One line of function output captured from the platform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogLine {
    pub time: SystemTime,
    pub request_id: String,
    pub content: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CommonLogAttributes {
    pub attributes: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FunctionLogMessage {
    pub message: String,
    pub timestamp: i64,
    pub attributes: Map<String, Value>,
}

impl FunctionLogMessage {
    #[must_use]
    pub fn new(timestamp: i64, request_id: &str, trace_id: Option<&str>, message: String) -> Self {
        let mut attributes = Map::new();
        attributes.insert("aws".to_string(), json!({ "lambda_request_id": request_id }));
        attributes.insert("faas.execution".to_string(), json!(request_id));
        if let Some(trace_id) = trace_id.filter(|id| !id.is_empty()) {
            attributes.insert("trace.id".to_string(), json!(trace_id));
        }
        Self {
            message,
            timestamp,
            attributes,
        }
    }
}

/// Top level element of a Logs API request body, which is an array of these.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DetailedFunctionLog {
    pub common: CommonLogAttributes,
    pub logs: Vec<FunctionLogMessage>,
}

/// Attributes shared by every line of a function log batch.
#[must_use]
pub fn common_attributes(
    invoked_function_arn: &str,
    function_name: &str,
    tags: &BTreeMap<String, String>,
) -> Map<String, Value> {
    let mut common = Map::new();
    common.insert("plugin".to_string(), json!(EXTENSION_ID));
    common.insert("faas.arn".to_string(), json!(invoked_function_arn));
    common.insert("faas.name".to_string(), json!(function_name));
    for (key, value) in tags {
        common.insert(key.clone(), json!(value));
    }
    common
}

/// Parses `key:value` pairs separated by `delimiter`. Malformed pairs are ignored.
#[must_use]
pub fn parse_tags(raw: &str, delimiter: &str) -> BTreeMap<String, String> {
    if delimiter.is_empty() {
        return BTreeMap::new();
    }
    raw.split(delimiter)
        .filter_map(|tag| {
            let mut parts = tag.split(':');
            match (parts.next(), parts.next(), parts.next()) {
                (Some(key), Some(value), None) if !key.trim().is_empty() => {
                    Some((key.trim().to_string(), value.trim().to_string()))
                }
                _ => None,
            }
        })
        .collect()
}

/// Milliseconds since the epoch, zero for times before it.
#[must_use]
pub fn unix_millis(time: SystemTime) -> i64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}
