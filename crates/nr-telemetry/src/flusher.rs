// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Delivery of harvested telemetry and function logs to the collector.
//!
//! Every compressed buffer is sent by its own attempt task, raced against the per-buffer
//! deadline:
//!
//! ```text
//!   buffer ──> attempt task ──> POST ──> timeout? ──> backoff ──> POST ...
//!                  ^                        │
//!   deadline ──────┘ cancel                 └──> response / fatal error
//! ```
//!
//! Only attempts that hit the HTTP client timeout are retried. Any other transport error
//! and any non-2xx response fail the buffer. When the deadline fires first the attempt task
//! is told to stop retrying; a request already on the wire still runs to completion and its
//! result is discarded.
//!
//! Per-buffer failures are logged and counted, never returned: the caller gets the number of
//! buffers the collector accepted. Only failing to build the requests is an error.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use reqwest::header::HeaderMap;
use reqwest::StatusCode;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::batch::InvocationStore;
use crate::constants::{
    DEFAULT_DATA_COLLECTION_TIMEOUT, DEFAULT_HTTP_CLIENT_TIMEOUT, MAX_COMPRESSED_PAYLOAD_LEN,
};
use crate::endpoints::{log_endpoint, telemetry_endpoint};
use crate::errors::SendError;
use crate::http::{build_client, collector_headers};
use crate::license_key::LicenseKeyFactory;
use crate::logs::{
    common_attributes, unix_millis, CommonLogAttributes, DetailedFunctionLog, FunctionLogMessage,
    LogLine,
};
use crate::payload::{compressed_json_payload, compressed_payloads_for_log_events, LogsEvent};
use crate::retry::RetryPolicy;

/// Outcome of sending one buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransmissionAttempt {
    /// The collector answered, with any status.
    Completed { status: StatusCode, body: String },
    /// Fatal transport error, or every retry timed out.
    Failed(String),
    /// The per-buffer deadline fired before the attempt finished.
    DeadlineExceeded,
    /// The caller cancelled the send.
    Cancelled,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct SendSummary {
    buffers: usize,
    successes: usize,
    sent_bytes: usize,
}

pub struct FlusherConfig {
    pub license_key_factory: Arc<LicenseKeyFactory>,
    pub function_name: String,
    pub telemetry_endpoint_override: Option<String>,
    pub log_endpoint_override: Option<String>,
    pub https_proxy: Option<String>,
    /// Timeout of a single HTTP attempt.
    pub http_timeout: Duration,
    /// Deadline of one buffer, retries included.
    pub deadline: Duration,
    pub retry_policy: RetryPolicy,
    pub max_payload_size: usize,
    /// Extra attributes attached to function logs.
    pub tags: BTreeMap<String, String>,
    /// Look trace ids up in the invocation store when shipping function logs.
    pub collect_trace_id: bool,
}

impl FlusherConfig {
    #[must_use]
    pub fn new(license_key_factory: Arc<LicenseKeyFactory>, function_name: &str) -> Self {
        Self {
            license_key_factory,
            function_name: function_name.to_string(),
            telemetry_endpoint_override: None,
            log_endpoint_override: None,
            https_proxy: None,
            http_timeout: DEFAULT_HTTP_CLIENT_TIMEOUT,
            deadline: DEFAULT_DATA_COLLECTION_TIMEOUT,
            retry_policy: RetryPolicy::default(),
            max_payload_size: MAX_COMPRESSED_PAYLOAD_LEN,
            tags: BTreeMap::new(),
            collect_trace_id: false,
        }
    }
}

#[derive(Clone)]
pub struct Flusher {
    license_key_factory: Arc<LicenseKeyFactory>,
    function_name: String,
    telemetry_endpoint_override: Option<String>,
    log_endpoint_override: Option<String>,
    deadline: Duration,
    retry_policy: RetryPolicy,
    max_payload_size: usize,
    tags: BTreeMap<String, String>,
    collect_trace_id: bool,
    client: reqwest::Client,
}

impl Flusher {
    /// Builds the HTTP client. An unusable proxy is logged and skipped; failing to build
    /// even a direct client is an error.
    pub fn new(config: FlusherConfig) -> Result<Self, SendError> {
        let client = match build_client(config.https_proxy.as_deref(), config.http_timeout) {
            Ok(client) => client,
            Err(e) => {
                error!("Unable to parse proxy configuration: {e}, no proxy will be used");
                reqwest::Client::builder()
                    .timeout(config.http_timeout)
                    .build()
                    .map_err(SendError::Client)?
            }
        };
        Ok(Flusher {
            license_key_factory: config.license_key_factory,
            function_name: config.function_name,
            telemetry_endpoint_override: config.telemetry_endpoint_override,
            log_endpoint_override: config.log_endpoint_override,
            deadline: config.deadline,
            retry_policy: config.retry_policy,
            max_payload_size: config.max_payload_size,
            tags: config.tags,
            collect_trace_id: config.collect_trace_id,
            client,
        })
    }

    async fn license_key(&self) -> Result<&str, SendError> {
        let license_key = self.license_key_factory.get_license_key().await;
        if license_key.is_empty() {
            return Err(SendError::MissingLicenseKey);
        }
        Ok(license_key)
    }

    /// Sends harvested agent fragments for the function identified by `invoked_function_arn`.
    ///
    /// Returns the number of buffers the collector accepted.
    pub async fn send_telemetry(
        &self,
        cancel: &CancellationToken,
        invoked_function_arn: &str,
        fragments: &[Bytes],
    ) -> Result<usize, SendError> {
        if fragments.is_empty() {
            return Ok(0);
        }
        let start = Instant::now();

        let events: Vec<LogsEvent> = fragments
            .iter()
            .map(|fragment| LogsEvent::from_bytes(fragment))
            .collect();
        let buffers = compressed_payloads_for_log_events(
            &events,
            &self.function_name,
            invoked_function_arn,
            self.max_payload_size,
        )?;

        let license_key = self.license_key().await?;
        let endpoint = telemetry_endpoint(license_key, self.telemetry_endpoint_override.as_deref());
        let headers = collector_headers(license_key, None)?;

        let transmit_start = Instant::now();
        let summary = self.send_buffers(cancel, &endpoint, headers, buffers).await;
        info!(
            "Sent {}/{} New Relic telemetry payload batches with {} log events successfully in {:.3}ms ({}ms to transmit {:.1}kB)",
            summary.successes,
            summary.buffers,
            fragments.len(),
            start.elapsed().as_secs_f64() * 1000.0,
            transmit_start.elapsed().as_millis(),
            kilobytes(summary.sent_bytes),
        );
        Ok(summary.successes)
    }

    /// Ships function log lines to the Logs API. Lines are tagged with the trace id of their
    /// invocation when trace collection is on and `store` knows it.
    pub async fn send_function_logs(
        &self,
        cancel: &CancellationToken,
        invoked_function_arn: &str,
        lines: &[LogLine],
        store: Option<&InvocationStore>,
    ) -> Result<usize, SendError> {
        if lines.is_empty() {
            debug!("send_function_logs invoked with 0 log lines, nothing to send");
            return Ok(0);
        }
        let start = Instant::now();

        let body = self.function_log_payload(invoked_function_arn, lines, store)?;
        let license_key = self.license_key().await?;
        let endpoint = log_endpoint(license_key, self.log_endpoint_override.as_deref());
        let headers = collector_headers(license_key, Some("logs"))?;

        let summary = self.send_buffers(cancel, &endpoint, headers, vec![body]).await;
        info!(
            "Sent {}/{} New Relic function log batches successfully in {:.3}ms ({:.1}kB)",
            summary.successes,
            summary.buffers,
            start.elapsed().as_secs_f64() * 1000.0,
            kilobytes(summary.sent_bytes),
        );
        Ok(summary.successes)
    }

    fn function_log_payload(
        &self,
        invoked_function_arn: &str,
        lines: &[LogLine],
        store: Option<&InvocationStore>,
    ) -> Result<Bytes, SendError> {
        let logs = lines
            .iter()
            .map(|line| {
                // the telemetry may not have arrived yet, in which case the line goes untagged
                let trace_id = store
                    .filter(|_| self.collect_trace_id)
                    .and_then(|store| store.retrieve_trace_id(&line.request_id));
                FunctionLogMessage::new(
                    unix_millis(line.time),
                    &line.request_id,
                    trace_id.as_deref(),
                    String::from_utf8_lossy(&line.content).into_owned(),
                )
            })
            .collect();
        let payload = [DetailedFunctionLog {
            common: CommonLogAttributes {
                attributes: common_attributes(invoked_function_arn, &self.function_name, &self.tags),
            },
            logs,
        }];
        compressed_json_payload(&payload)
    }

    async fn send_buffers(
        &self,
        cancel: &CancellationToken,
        endpoint: &str,
        headers: HeaderMap,
        buffers: Vec<Bytes>,
    ) -> SendSummary {
        let mut summary = SendSummary {
            buffers: buffers.len(),
            ..SendSummary::default()
        };
        let send_start = Instant::now();

        for buffer in buffers {
            if cancel.is_cancelled() {
                warn!("Send cancelled, dropping remaining telemetry buffers");
                break;
            }
            let payload_size = buffer.len();
            match self.send_buffer(cancel, endpoint, &headers, buffer).await {
                TransmissionAttempt::Completed { status, .. } if status.is_success() => {
                    summary.successes += 1;
                    summary.sent_bytes += payload_size;
                }
                TransmissionAttempt::Completed { status, body } => {
                    error!("Telemetry client response: [{status}] {body}");
                    summary.sent_bytes += payload_size;
                }
                TransmissionAttempt::Failed(message) => {
                    error!("Telemetry client error: {message}, payload size: {payload_size} bytes");
                }
                TransmissionAttempt::DeadlineExceeded => {
                    error!(
                        "Telemetry client error: failed to send data within user defined timeout period: {}ms, payload size: {payload_size} bytes",
                        self.deadline.as_millis()
                    );
                }
                TransmissionAttempt::Cancelled => {
                    warn!("Telemetry send cancelled, payload size: {payload_size} bytes");
                }
            }
        }

        debug!(
            "Took {}ms to finish sending all payloads",
            send_start.elapsed().as_millis()
        );
        summary
    }

    async fn send_buffer(
        &self,
        cancel: &CancellationToken,
        endpoint: &str,
        headers: &HeaderMap,
        body: Bytes,
    ) -> TransmissionAttempt {
        let attempt_cancel = cancel.child_token();
        let (tx, rx) = oneshot::channel();
        let client = self.client.clone();
        let endpoint = endpoint.to_string();
        let headers = headers.clone();
        let policy = self.retry_policy;
        let token = attempt_cancel.clone();

        tokio::spawn(async move {
            let attempt = attempt_send(client, endpoint, headers, body, policy, token).await;
            // the receiver is gone once the deadline fired
            let _ = tx.send(attempt);
        });

        tokio::select! {
            () = tokio::time::sleep(self.deadline) => {
                attempt_cancel.cancel();
                TransmissionAttempt::DeadlineExceeded
            }
            attempt = rx => attempt.unwrap_or_else(|_| {
                TransmissionAttempt::Failed("attempt task ended without a result".to_string())
            }),
        }
    }
}

async fn attempt_send(
    client: reqwest::Client,
    endpoint: String,
    headers: HeaderMap,
    body: Bytes,
    policy: RetryPolicy,
    cancel: CancellationToken,
) -> TransmissionAttempt {
    let mut backoff = policy.backoff();

    for attempt in 1..=policy.max_retries {
        if cancel.is_cancelled() {
            debug!("attempt_send: stopped by cancellation");
            return TransmissionAttempt::Cancelled;
        }

        let result = client
            .post(&endpoint)
            .headers(headers.clone())
            .body(body.clone())
            .send()
            .await;

        match result {
            Ok(response) => {
                let status = response.status();
                return match response.text().await {
                    Ok(body) => {
                        debug!("attempt_send: collector answered with {status}");
                        TransmissionAttempt::Completed { status, body }
                    }
                    Err(e) => TransmissionAttempt::Failed(e.to_string()),
                };
            }
            Err(e) if e.is_timeout() => {
                if attempt == policy.max_retries {
                    break;
                }
                let delay = backoff.next_delay();
                debug!(
                    "attempt_send: timeout error, retrying after {}ms: {e}",
                    delay.as_millis()
                );
                tokio::select! {
                    () = cancel.cancelled() => return TransmissionAttempt::Cancelled,
                    () = tokio::time::sleep(delay) => {}
                }
            }
            Err(e) => return TransmissionAttempt::Failed(e.to_string()),
        }
    }

    TransmissionAttempt::Failed(format!(
        "request timed out {} times, giving up",
        policy.max_retries
    ))
}

#[allow(clippy::cast_precision_loss)]
fn kilobytes(bytes: usize) -> f64 {
    bytes as f64 / 1024.0
}
