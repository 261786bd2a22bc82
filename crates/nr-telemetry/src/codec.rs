// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Decoder for the envelope the New Relic agent writes to the telemetry pipe.
//!
//! The envelope is a JSON array, optionally base64 encoded as a whole:
//!
//! ```text
//! [protocol_version, "NR_LAMBDA_MONITORING", <metadata object>?, "<base64(gzip(json))>"]
//! ```
//!
//! The compressed segment is always the last element. For protocol version 1 it holds
//! `{"metadata": {...}, "data": {...}}`, for version 2 it holds the data object directly.
//! Decoding first parses the array into raw JSON values, branches on the version and only
//! then deserializes into the typed structures below.

use std::borrow::Cow;
use std::io::Read;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use flate2::read::GzDecoder;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::constants::LAMBDA_MONITORING_MARKER;
use crate::errors::DecodeError;

/// Execution environment descriptors sent alongside the data.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LambdaMetadata {
    pub metadata_version: i64,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub arn: String,
    pub protocol_version: i64,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub execution_environment: String,
    pub agent_version: String,
    pub agent_language: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub function_version: String,
}

/// Telemetry categories of one agent harvest. Each category keeps the agent's positional
/// records untouched; missing or null categories decode as empty.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LambdaData {
    #[serde(deserialize_with = "null_as_empty")]
    pub metric_data: Vec<Value>,
    #[serde(deserialize_with = "null_as_empty")]
    pub custom_event_data: Vec<Value>,
    #[serde(deserialize_with = "null_as_empty")]
    pub log_event_data: Vec<Value>,
    #[serde(deserialize_with = "null_as_empty")]
    pub analytic_event_data: Vec<Value>,
    #[serde(deserialize_with = "null_as_empty")]
    pub error_event_data: Vec<Value>,
    #[serde(deserialize_with = "null_as_empty")]
    pub error_data: Vec<Value>,
    #[serde(deserialize_with = "null_as_empty")]
    pub span_event_data: Vec<Value>,
    #[serde(deserialize_with = "null_as_empty")]
    pub update_loaded_modules: Vec<Value>,
    #[serde(deserialize_with = "null_as_empty")]
    pub transaction_sample_data: Vec<Value>,
}

fn null_as_empty<'de, D>(deserializer: D) -> Result<Vec<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<Vec<Value>>::deserialize(deserializer)?.unwrap_or_default())
}

/// Protocol version 1 wraps metadata and data in the compressed segment.
#[derive(Deserialize)]
struct WrappedPayload {
    #[serde(default)]
    metadata: Option<LambdaMetadata>,
    #[serde(default)]
    data: LambdaData,
}

/// Supported envelope layouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolVersion {
    V1,
    V2,
}

impl ProtocolVersion {
    fn from_value(value: &Value) -> Result<Self, DecodeError> {
        let Value::Number(version) = value else {
            return Err(DecodeError::InvalidVersion);
        };
        match version.as_i64() {
            Some(1) => Ok(Self::V1),
            Some(2) => Ok(Self::V2),
            _ => Err(DecodeError::UnsupportedVersion(version.clone())),
        }
    }

    #[must_use]
    pub fn as_u8(self) -> u8 {
        match self {
            Self::V1 => 1,
            Self::V2 => 2,
        }
    }
}

/// A fully decoded envelope.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedPayload {
    pub metadata: LambdaMetadata,
    pub data: LambdaData,
    pub protocol_version: ProtocolVersion,
}

/// Decodes an agent envelope, either as raw JSON or base64 encoded.
pub fn decode(raw: &[u8]) -> Result<DecodedPayload, DecodeError> {
    let envelope = envelope_bytes(raw)?;
    decode_envelope(&envelope)
}

/// Extracts the distributed tracing id carried by analytic or span events.
///
/// Returns `Ok(None)` without decoding when the payload is not an agent envelope.
/// [`DecodeError::TraceIdNotFound`] means the payload decoded but carries no id; callers
/// treat it like `None`.
pub fn extract_trace_id(raw: &[u8]) -> Result<Option<String>, DecodeError> {
    let envelope = envelope_bytes(raw)?;
    if !contains_marker(&envelope) {
        return Ok(None);
    }

    let decoded = decode_envelope(&envelope)?;
    trace_id_in_category(&decoded.data.analytic_event_data)
        .or_else(|| trace_id_in_category(&decoded.data.span_event_data))
        .map(Some)
        .ok_or(DecodeError::TraceIdNotFound)
}

/// Returns true when `raw` looks like an agent envelope.
#[must_use]
pub fn is_agent_payload(raw: &[u8]) -> bool {
    envelope_bytes(raw).is_ok_and(|envelope| contains_marker(&envelope))
}

fn envelope_bytes(raw: &[u8]) -> Result<Cow<'_, [u8]>, DecodeError> {
    let trimmed = raw.trim_ascii();
    if trimmed.first() == Some(&b'[') {
        return Ok(Cow::Borrowed(trimmed));
    }
    Ok(Cow::Owned(STANDARD.decode(trimmed)?))
}

fn contains_marker(envelope: &[u8]) -> bool {
    let marker = LAMBDA_MONITORING_MARKER.as_bytes();
    envelope.windows(marker.len()).any(|window| window == marker)
}

fn decode_envelope(envelope: &[u8]) -> Result<DecodedPayload, DecodeError> {
    let parts: Vec<Value> = serde_json::from_slice(envelope).map_err(DecodeError::Envelope)?;
    if parts.len() < 3 {
        return Err(DecodeError::TooShort(parts.len()));
    }

    let protocol_version = ProtocolVersion::from_value(&parts[0])?;
    let compressed = parts
        .last()
        .and_then(Value::as_str)
        .ok_or(DecodeError::MissingCompressedPayload)?;
    let uncompressed = decode_uncompress(compressed)?;

    // a metadata object may sit between the marker and the compressed segment
    let envelope_metadata = if parts.len() >= 4 && parts[2].is_object() {
        serde_json::from_value::<LambdaMetadata>(parts[2].clone()).ok()
    } else {
        None
    };

    let (metadata, data) = match protocol_version {
        ProtocolVersion::V1 => {
            let wrapped: WrappedPayload =
                serde_json::from_slice(&uncompressed).map_err(DecodeError::Data)?;
            (
                wrapped.metadata.or(envelope_metadata).unwrap_or_default(),
                wrapped.data,
            )
        }
        ProtocolVersion::V2 => {
            let data: LambdaData =
                serde_json::from_slice(&uncompressed).map_err(DecodeError::Data)?;
            (envelope_metadata.unwrap_or_default(), data)
        }
    };

    Ok(DecodedPayload {
        metadata,
        data,
        protocol_version,
    })
}

fn decode_uncompress(input: &str) -> Result<Vec<u8>, DecodeError> {
    let decoded = STANDARD.decode(input)?;
    let mut decoder = GzDecoder::new(decoded.as_slice());
    let mut out = Vec::new();
    decoder.read_to_end(&mut out).map_err(DecodeError::Gzip)?;
    Ok(out)
}

/// Event categories are `[run_id, reservoir, [[intrinsics, user, agent], ...]]`.
fn trace_id_in_category(category: &[Value]) -> Option<String> {
    if category.len() <= 2 {
        return None;
    }
    category[2]
        .as_array()?
        .iter()
        .flat_map(|event| match event {
            Value::Array(parts) => parts.iter().collect::<Vec<_>>(),
            other => vec![other],
        })
        .filter_map(|record| record.get("traceId").and_then(Value::as_str))
        .find(|trace_id| !trace_id.is_empty())
        .map(str::to_string)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use serde_json::json;
    use std::io::Write;

    /// Version 1 payload captured from a Node agent; analytic events carry a trace id.
    pub(crate) const AGENT_PAYLOAD_V1: &str = "H4sIAEUlq2cC/+VYa2/bNhT9K4Wwj7ZEUhIl+luatmiHFAvqZB0QBAItMY5WWVRJKqkb5L/vUrJjJ5Zdx3a7YIMhW+bj8PDecy8fd85EGJ5xw53BnVMpaWQqi+RGKJ3L0hngqOeIbyKtDfxNRHmTK1lORGmcgXP0eZic8Mko40k1Ndey9F1MnJ7Dx1C/gHAwcqmLHioKXo5reIWatputUbYhfA/4rR4UDeig1n3BtenjQUBpRGMWYhwHg6u6TC2bQdu7bxRPRZ71fUz6RkD796Io5GepiuzdrGmfi9uT0ft3H7/+dR3CcHOIJZK/nRydvR2eOfc9Z26NuoI3kRSSZyJLJjKrC6GdwYXzO1fa6V1cOEC25aryFGCJS+w87+4vexeOzidVIf7WzfzAMsz151WqLk0+EUla5NaSTzqW4laJogGcW+5xhXst5RftTgqgJIpEfymEtV/PefW0ZdKygyrkYjdeA5RKJcG/pdAJ19MyzWUX1qxxIcdjoRL7k5fjDQ3FNyNUyYvk2piqyEcPTS8vwd9QMTVAUNxYSbQWvyjroujdOUpooW5krhKdfweZYIIQqNC21IkWwsryHsx/54zrPAPfjfyUsiDjI0ZEcMUEDKW5tT5UGlWLHgg7lyo3U+jpEkbjgPacRjcfuvqno4xQGlJGKMFBSgHP+ksbALUh4UMFCwI/CGNQS624aTSEXESQlWgUMIp8EuEQOk4rq/QzxUvNG9EBWskntvAPcy3UUo0316u3u7SNNLw4yy1+B597cABYGHTrKvG1BsjGADxm4koI3icUX/WDKMX9OIuyPgmRCBDPGI2a+IVuraLcXxywSyPP0f5cCd1HzSCLZUPDlWkl0MpOV7zcSnKguDWSMwt3fVijvWcJaxuhthIaAvmFdg4glVn0+FEorhiiLESMjYK91J5CwhxLBfQdyPWiTYtLJnN/ovJL5YK71PRU5uXc6/9vucPSDh54JPWFO92AEAROXRSFLqEoApqN0GeeGtZVJZXho7wAWXqnzZy8owpSetoowfskxrk2rSy8N3N9gLJT2egWltQL3LNy8X2EKcIB6AwTvHcZQmEAMRJQEkNUBTiGOe9M/MgYMamMXiH+8NmEftIuh947qW65yuzrbEBR8pGN771gT2TKizcCFmogu8DOcn0A8I+NSvRhCfORKPSOPH9GclgV49PctWcZQgEKotCHkIoI8zEK6OZJ8aJ4ibzO5vuH/6TVH2b3EsjNc+Xr6TGIQSjvvPxSytty7e8LkcwuvBtHvATy3cvCJ5tbs+XwtFPTnmrKu3gjRGBNYjFBMcUxpgGihykOXAabsShkFPuxnYroo21Wtvdc3UBUzohfFeJbDjl3hbrvshiHDJEIVlKKWADw4QFKsRvGYHWKYSqIoSiIoJg94n18eu6dwz771boAfPp09vbODcz7+9pdxg9BhlMNS/3uJNr+e9NoUtHuLJrue5H4KCawU/dOr6cadkSrmcUPXUbCKMYk3OodE4ZcSnEUxrC1jENMNw33A+o4jkBCIWaUwbkkZPGeZcgPScCwj3Ho+5j6bCM39i8ao2PwX22ODyUc/spUQFq0iaa953lCaf7ZIjMdS1glUiOV13mj5v1Rm6o23usp7CpWDU/IowcjH07Fzxp1A77fw5SS9suiR74dATEcka1WjeZMOWyO8MqbHTF3PEJ0Y7bXA/tBLizRce222foUxY8enzI4aT1rzCd3LpvHs/ZffkI/jMnG8eytyFuL3mbE5lUP7Y3Nc/PhdsDNfe1ewC2St7TZeKsUGKqDNDoc9grvXbGPa23kRByU7xLm/jw7zuKHoNoJuwPbDpw3SlbVyvF4DdTl5f39P0toy3q2GQAA";
    pub(crate) const AGENT_PAYLOAD_V1_TRACE_ID: &str = "b3c694dab92e4f9ecbd26656926214c6";

    pub(crate) fn agent_envelope_v1() -> Vec<u8> {
        serde_json::to_vec(&json!([1, LAMBDA_MONITORING_MARKER, AGENT_PAYLOAD_V1]))
            .expect("failed to serialize envelope")
    }

    pub(crate) fn gzip_base64(value: &Value) -> String {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder
            .write_all(&serde_json::to_vec(value).expect("failed to serialize"))
            .expect("failed to compress");
        STANDARD.encode(encoder.finish().expect("failed to finish gzip"))
    }

    pub(crate) fn envelope_with_trace_id(trace_id: &str) -> Vec<u8> {
        let data = json!({
            "span_event_data": [null, {"events_seen": 1}, [[{"traceId": trace_id, "guid": "abc"}, {}, {}]]]
        });
        serde_json::to_vec(&json!([2, LAMBDA_MONITORING_MARKER, gzip_base64(&data)]))
            .expect("failed to serialize envelope")
    }

    fn sample_data() -> LambdaData {
        LambdaData {
            metric_data: vec![
                json!("run-id"),
                json!(1_700_000_000),
                json!(1_700_000_060),
                json!([[{"name": "Custom/Metric"}, [1, 2, 3, 4, 5, 6]]]),
            ],
            analytic_event_data: vec![
                json!("run-id"),
                json!({"reservoir_size": 10, "events_seen": 1}),
                json!([[{"type": "Transaction", "traceId": "abc123"}, {}, {}]]),
            ],
            ..Default::default()
        }
    }

    #[test]
    fn test_decode_v1_captured_payload() {
        let decoded = decode(&agent_envelope_v1()).unwrap();
        assert_eq!(decoded.protocol_version, ProtocolVersion::V1);
        assert!(!decoded.data.analytic_event_data.is_empty());
        assert!(!decoded.metadata.agent_language.is_empty());
    }

    #[test]
    fn test_decode_base64_wrapped_envelope() {
        let encoded = STANDARD.encode(agent_envelope_v1());
        let decoded = decode(encoded.as_bytes()).unwrap();
        assert_eq!(decoded.protocol_version, ProtocolVersion::V1);
    }

    #[test]
    fn test_round_trip_v1() {
        let data = sample_data();
        let metadata = LambdaMetadata {
            metadata_version: 2,
            arn: "arn:aws:lambda:us-east-1:123456789012:function:fn".to_string(),
            protocol_version: 17,
            agent_version: "11.0.0".to_string(),
            agent_language: "nodejs".to_string(),
            ..Default::default()
        };
        let wrapped = json!({"metadata": metadata, "data": data});
        let envelope =
            serde_json::to_vec(&json!([1, LAMBDA_MONITORING_MARKER, gzip_base64(&wrapped)]))
                .unwrap();

        let decoded = decode(&envelope).unwrap();
        assert_eq!(decoded.data, data);
        assert_eq!(decoded.metadata, metadata);
    }

    #[test]
    fn test_round_trip_v2_with_envelope_metadata() {
        let data = sample_data();
        let envelope = serde_json::to_vec(&json!([
            2,
            LAMBDA_MONITORING_MARKER,
            {"metadata_version": 2, "protocol_version": 17, "agent_version": "3.36.0", "agent_language": "go"},
            gzip_base64(&serde_json::to_value(&data).unwrap())
        ]))
        .unwrap();

        let decoded = decode(&envelope).unwrap();
        assert_eq!(decoded.protocol_version, ProtocolVersion::V2);
        assert_eq!(decoded.data, data);
        assert_eq!(decoded.metadata.agent_language, "go");
        assert_eq!(decoded.metadata.protocol_version, 17);
    }

    #[test]
    fn test_decode_v2_metric_only_payload() {
        let data = json!({"metric_data": ["run-id", 1, 2, [[{"name": "Errors/all"}, [1, 0, 0, 0, 0, 0]]]]});
        let envelope =
            serde_json::to_vec(&json!([2, LAMBDA_MONITORING_MARKER, gzip_base64(&data)])).unwrap();

        let decoded = decode(&envelope).unwrap();
        assert_eq!(decoded.data.metric_data.len(), 4);
        assert!(decoded.data.log_event_data.is_empty());
        assert!(decoded.data.span_event_data.is_empty());
    }

    #[test]
    fn test_decode_null_category_is_empty() {
        let data = json!({"span_event_data": null, "metric_data": []});
        let envelope =
            serde_json::to_vec(&json!([2, LAMBDA_MONITORING_MARKER, gzip_base64(&data)])).unwrap();
        let decoded = decode(&envelope).unwrap();
        assert!(decoded.data.span_event_data.is_empty());
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(matches!(decode(b""), Err(DecodeError::Envelope(_))));
        assert!(decode(b"not json at all").is_err());
        assert!(matches!(
            decode(b"[1, \"NR_LAMBDA_MONITORING\"]"),
            Err(DecodeError::TooShort(2))
        ));
        // valid base64, not gzip
        assert!(matches!(
            decode(b"[1, \"NR_LAMBDA_MONITORING\", \"Zm9vYmFy\"]"),
            Err(DecodeError::Gzip(_))
        ));
        assert!(matches!(
            decode(b"[1, \"NR_LAMBDA_MONITORING\", \"foobar!\"]"),
            Err(DecodeError::Base64(_))
        ));
        // gzip of a non-JSON string
        assert!(matches!(
            decode(b"[1, \"NR_LAMBDA_MONITORING\", \"H4sIAK6pdWIC/0vLz09KLAIAlR/2ngYAAAA=\"]"),
            Err(DecodeError::Data(_))
        ));
    }

    #[test]
    fn test_decode_unsupported_version() {
        let envelope =
            serde_json::to_vec(&json!([3, LAMBDA_MONITORING_MARKER, gzip_base64(&json!({}))]))
                .unwrap();
        assert!(matches!(
            decode(&envelope),
            Err(DecodeError::UnsupportedVersion(ref v)) if v.as_i64() == Some(3)
        ));
        for version in ["-1", "1.5", "0"] {
            let raw = format!("[{version}, \"NR_LAMBDA_MONITORING\", \"\"]");
            let err = decode(raw.as_bytes()).unwrap_err();
            assert!(matches!(err, DecodeError::UnsupportedVersion(_)), "{version}");
            assert_eq!(err.to_string(), format!("unsupported protocol version: {version}"));
        }
        assert!(matches!(
            decode(b"[\"one\", \"NR_LAMBDA_MONITORING\", \"\"]"),
            Err(DecodeError::InvalidVersion)
        ));
    }

    #[test]
    fn test_extract_trace_id_from_analytic_event() {
        let trace_id = extract_trace_id(&agent_envelope_v1()).unwrap();
        assert_eq!(trace_id.as_deref(), Some(AGENT_PAYLOAD_V1_TRACE_ID));

        let encoded = STANDARD.encode(agent_envelope_v1());
        let trace_id = extract_trace_id(encoded.as_bytes()).unwrap();
        assert_eq!(trace_id.as_deref(), Some(AGENT_PAYLOAD_V1_TRACE_ID));
    }

    #[test]
    fn test_extract_trace_id_from_span_event() {
        let trace_id = extract_trace_id(&envelope_with_trace_id("446cf2064d931f4e")).unwrap();
        assert_eq!(trace_id.as_deref(), Some("446cf2064d931f4e"));
    }

    #[test]
    fn test_extract_trace_id_prefers_analytic_events() {
        let data = json!({
            "analytic_event_data": [null, {}, [[{"traceId": "from-analytic"}, {}, {}]]],
            "span_event_data": [null, {}, [[{"traceId": "from-span"}, {}, {}]]]
        });
        let envelope =
            serde_json::to_vec(&json!([2, LAMBDA_MONITORING_MARKER, gzip_base64(&data)])).unwrap();
        assert_eq!(
            extract_trace_id(&envelope).unwrap().as_deref(),
            Some("from-analytic")
        );
    }

    #[test]
    fn test_extract_trace_id_skips_empty_ids() {
        let data = json!({
            "analytic_event_data": [null, {}, [[{"traceId": ""}, {}, {}]]],
            "span_event_data": [null, {}, [[{"guid": "x"}, {}, {}], [{"traceId": "second"}, {}, {}]]]
        });
        let envelope =
            serde_json::to_vec(&json!([2, LAMBDA_MONITORING_MARKER, gzip_base64(&data)])).unwrap();
        assert_eq!(
            extract_trace_id(&envelope).unwrap().as_deref(),
            Some("second")
        );
    }

    #[test]
    fn test_extract_trace_id_without_marker_short_circuits() {
        let encoded = STANDARD.encode("[foobar]");
        assert!(extract_trace_id(encoded.as_bytes()).unwrap().is_none());
        assert!(extract_trace_id(b"platform log line").is_err());
        assert!(extract_trace_id(b"[\"plain\", \"array\"]").unwrap().is_none());
    }

    #[test]
    fn test_extract_trace_id_not_found() {
        let data = json!({"metric_data": []});
        let envelope =
            serde_json::to_vec(&json!([2, LAMBDA_MONITORING_MARKER, gzip_base64(&data)])).unwrap();
        assert!(matches!(
            extract_trace_id(&envelope),
            Err(DecodeError::TraceIdNotFound)
        ));
    }

    #[test]
    fn test_is_agent_payload() {
        assert!(is_agent_payload(&agent_envelope_v1()));
        assert!(!is_agent_payload(b"[1, 2, 3]"));
        assert!(!is_agent_payload(b"%%%"));
    }
}
