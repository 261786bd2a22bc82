// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

mod config;
mod extension_api;
mod logger;

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use nr_telemetry::{
    batch::InvocationStore,
    constants::{EXTENSION_NAME, EXTENSION_VERSION, TELEMETRY_PIPE_PATH},
    dispatcher::{Dispatcher, InvocationEvent},
    flusher::Flusher,
    ipc::init_telemetry_channel,
};

use config::Config;
use extension_api::{EventType, ExtensionClient, NextEventResponse};

/// Time kept back from the shutdown deadline so the process exits before it is killed.
const SHUTDOWN_MARGIN: Duration = Duration::from_millis(200);

#[tokio::main]
pub async fn main() {
    let subscriber = logger::subscriber(&config::log_level());
    #[allow(clippy::expect_used)]
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    let config = match Config::from_env() {
        Ok(config) => Arc::new(config),
        Err(e) => {
            error!("Invalid configuration: {e}. Shutting down extension.");
            return;
        }
    };
    let Some(runtime_api) = config.runtime_api.as_deref() else {
        error!("AWS_LAMBDA_RUNTIME_API is not set. Shutting down extension.");
        return;
    };

    let mut client = ExtensionClient::new(runtime_api);
    match client.register(EXTENSION_NAME).await {
        Ok(registration) => debug!(
            "Registered for function {} ({})",
            registration.function_name, registration.function_version
        ),
        Err(e) => {
            error!("Unable to register with the extensions API: {e}");
            return;
        }
    }

    if !config.enabled {
        info!("New Relic extension is disabled, idling until shutdown");
        idle(&client).await;
        return;
    }

    let telemetry_rx = match init_telemetry_channel(Path::new(TELEMETRY_PIPE_PATH)) {
        Ok((telemetry_rx, _reader)) => telemetry_rx,
        Err(e) => {
            error!("Unable to open the telemetry pipe: {e}");
            if let Err(e) = client.init_error("Extension.TelemetryPipe").await {
                warn!("Unable to report init error: {e}");
            }
            return;
        }
    };

    let store = Arc::new(InvocationStore::new(
        config.ripe_window,
        config.rot_window,
        config.collect_trace_id,
    ));
    let flusher = match Flusher::new(config.flusher_config()) {
        Ok(flusher) => flusher,
        Err(e) => {
            error!("Unable to create the telemetry flusher: {e}");
            if let Err(e) = client.init_error("Extension.HttpClient").await {
                warn!("Unable to report init error: {e}");
            }
            return;
        }
    };
    let mut dispatcher = Dispatcher::new(store, flusher, telemetry_rx, true);
    info!("New Relic extension {EXTENSION_VERSION} started");

    let cancel = CancellationToken::new();
    let mut invoked_function_arn = String::new();
    loop {
        let next = match client.next_event().await {
            Ok(next) => next,
            Err(e) => {
                error!("Unable to poll the extensions API: {e}");
                if let Err(e) = client.exit_error("Extension.NextEvent").await {
                    warn!("Unable to report exit error: {e}");
                }
                return;
            }
        };

        match next.event_type {
            EventType::Invoke => {
                if !next.invoked_function_arn.is_empty() {
                    invoked_function_arn.clone_from(&next.invoked_function_arn);
                }
                let event = InvocationEvent {
                    request_id: next.request_id.clone(),
                    invoked_function_arn: invoked_function_arn.clone(),
                };
                dispatcher.start_invocation(&event);
                dispatcher.dispatch(&cancel, &event, false).await;
            }
            EventType::Shutdown => {
                info!(
                    "Shutting down: {}",
                    next.shutdown_reason.as_deref().unwrap_or("unknown reason")
                );
                let event = InvocationEvent {
                    request_id: next.request_id.clone(),
                    invoked_function_arn: invoked_function_arn.clone(),
                };
                let shutdown = cancel.child_token();
                let timer = cancel_at_deadline(&next, shutdown.clone());
                let sent = dispatcher.dispatch(&shutdown, &event, true).await;
                timer.abort();
                debug!("Final harvest sent {sent} buffers");
                break;
            }
        }
    }
}

/// Cancels `token` shortly before the platform's shutdown deadline.
fn cancel_at_deadline(
    next: &NextEventResponse,
    token: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    let now_ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or_default();
    let deadline_ms = u128::try_from(next.deadline_ms).unwrap_or_default();
    let remaining = Duration::from_millis(
        u64::try_from(deadline_ms.saturating_sub(now_ms)).unwrap_or(u64::MAX),
    )
    .saturating_sub(SHUTDOWN_MARGIN);

    tokio::spawn(async move {
        tokio::time::sleep(remaining).await;
        warn!("Shutdown deadline reached, abandoning remaining telemetry");
        token.cancel();
    })
}

async fn idle(client: &ExtensionClient) {
    loop {
        match client.next_event().await {
            Ok(next) if next.event_type == EventType::Shutdown => return,
            Ok(_) => {}
            Err(e) => {
                error!("Unable to poll the extensions API: {e}");
                return;
            }
        }
    }
}
