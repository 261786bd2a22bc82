// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Minimal client for the Lambda Extensions API: registration, the blocking next-event
//! poll and error reporting.

use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::debug;

const API_VERSION: &str = "2020-01-01";
const EXTENSION_NAME_HEADER: &str = "Lambda-Extension-Name";
const EXTENSION_ID_HEADER: &str = "Lambda-Extension-Identifier";
const FUNCTION_ERROR_TYPE_HEADER: &str = "Lambda-Extension-Function-Error-Type";

#[derive(Debug, thiserror::Error)]
pub enum ExtensionApiError {
    #[error("extensions API request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("extensions API answered {status}: {body}")]
    Status { status: StatusCode, body: String },

    #[error("registration response is missing the extension identifier")]
    MissingIdentifier,

    #[error("extension is not registered")]
    NotRegistered,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EventType {
    Invoke,
    Shutdown,
}

#[derive(Debug, Serialize)]
struct RegistrationRequest {
    events: [EventType; 2],
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RegistrationResponse {
    pub function_name: String,
    pub function_version: String,
    pub handler: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NextEventResponse {
    pub event_type: EventType,
    /// Milliseconds since the epoch at which the invocation times out.
    pub deadline_ms: i64,
    #[serde(default)]
    pub request_id: String,
    #[serde(default)]
    pub invoked_function_arn: String,
    #[serde(default)]
    pub shutdown_reason: Option<String>,
}

pub struct ExtensionClient {
    client: reqwest::Client,
    base_url: String,
    extension_id: Option<String>,
}

impl ExtensionClient {
    /// `runtime_api` is the `host:port` found in `AWS_LAMBDA_RUNTIME_API`.
    #[must_use]
    pub fn new(runtime_api: &str) -> Self {
        Self::with_base_url(format!("http://{runtime_api}/{API_VERSION}"))
    }

    fn with_base_url(base_url: String) -> Self {
        Self {
            // the next-event poll blocks for as long as the function is idle: no timeout
            client: reqwest::Client::new(),
            base_url,
            extension_id: None,
        }
    }

    pub async fn register(
        &mut self,
        extension_name: &str,
    ) -> Result<RegistrationResponse, ExtensionApiError> {
        let response = self
            .client
            .post(format!("{}/extension/register", self.base_url))
            .header(EXTENSION_NAME_HEADER, extension_name)
            .json(&RegistrationRequest {
                events: [EventType::Invoke, EventType::Shutdown],
            })
            .send()
            .await?;
        let response = check_status(response).await?;

        let extension_id = response
            .headers()
            .get(EXTENSION_ID_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string)
            .ok_or(ExtensionApiError::MissingIdentifier)?;
        let registration: RegistrationResponse = response.json().await?;
        debug!(
            "Registered as {extension_id} for function {}",
            registration.function_name
        );

        self.extension_id = Some(extension_id);
        Ok(registration)
    }

    pub async fn next_event(&self) -> Result<NextEventResponse, ExtensionApiError> {
        let extension_id = self.extension_id()?;
        let response = self
            .client
            .get(format!("{}/extension/event/next", self.base_url))
            .header(EXTENSION_ID_HEADER, extension_id)
            .send()
            .await?;
        Ok(check_status(response).await?.json().await?)
    }

    /// Reports a failure during initialisation. The platform then shuts the environment
    /// down.
    pub async fn init_error(&self, error_type: &str) -> Result<(), ExtensionApiError> {
        self.report_error("init", error_type).await
    }

    /// Reports a failure that makes the extension exit.
    pub async fn exit_error(&self, error_type: &str) -> Result<(), ExtensionApiError> {
        self.report_error("exit", error_type).await
    }

    async fn report_error(&self, phase: &str, error_type: &str) -> Result<(), ExtensionApiError> {
        let extension_id = self.extension_id()?;
        let response = self
            .client
            .post(format!("{}/extension/{phase}/error", self.base_url))
            .header(EXTENSION_ID_HEADER, extension_id)
            .header(FUNCTION_ERROR_TYPE_HEADER, error_type)
            .send()
            .await?;
        check_status(response).await?;
        Ok(())
    }

    fn extension_id(&self) -> Result<&str, ExtensionApiError> {
        self.extension_id
            .as_deref()
            .ok_or(ExtensionApiError::NotRegistered)
    }
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, ExtensionApiError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(ExtensionApiError::Status { status, body })
}
