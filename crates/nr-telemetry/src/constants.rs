// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;

/// Name reported in the `User-Agent` header and in log attributes.
pub const EXTENSION_NAME: &str = "newrelic-lambda-extension";

/// Identifier used as the log stream name and the `plugin` log attribute.
pub const EXTENSION_ID: &str = "newrelic-lambda-extension";

pub const EXTENSION_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Literal present in every envelope emitted by the agent.
pub const LAMBDA_MONITORING_MARKER: &str = "NR_LAMBDA_MONITORING";

/// Well-known path of the FIFO the agent writes payloads to.
pub const TELEMETRY_PIPE_PATH: &str = "/tmp/newrelic-telemetry";

pub const DEFAULT_RIPE_WINDOW: Duration = Duration::from_millis(7_000);
pub const DEFAULT_ROT_WINDOW: Duration = Duration::from_millis(12_000);

/// Per-buffer deadline, raced against the retrying send.
pub const DEFAULT_DATA_COLLECTION_TIMEOUT: Duration = Duration::from_secs(10);

/// Timeout of a single HTTP attempt. Expiry is the only retryable failure.
pub const DEFAULT_HTTP_CLIENT_TIMEOUT: Duration = Duration::from_millis(2_400);

pub const SEND_TIMEOUT_RETRY_BASE: Duration = Duration::from_millis(200);
pub const SEND_TIMEOUT_MAX_RETRIES: u32 = 20;
pub const SEND_TIMEOUT_MAX_BACKOFF: Duration = Duration::from_secs(5);
pub const SEND_TIMEOUT_MAX_JITTER: Duration = Duration::from_millis(400);

/// Compressed size above which a batch of log events is split in halves.
pub const MAX_COMPRESSED_PAYLOAD_LEN: usize = 1000 * 1024;

pub const MAX_METRIC_NAME_LEN: usize = 255;

/// Number of fragments after which an invocation is considered ripe: the agent payload
/// plus the payload derived from platform logs.
pub const RIPE_FRAGMENT_COUNT: usize = 2;
