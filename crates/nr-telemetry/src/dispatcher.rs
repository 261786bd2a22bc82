// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;
use std::time::SystemTime;

use bytes::Bytes;
use tokio::sync::mpsc::{self, error::TryRecvError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn, Level};

use crate::batch::{Invocation, InvocationStore};
use crate::codec;
use crate::flusher::Flusher;

/// Lifecycle event the dispatcher acts on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvocationEvent {
    pub request_id: String,
    pub invoked_function_arn: String,
}

/// Moves telemetry from the ingress channel into the store and ships what the store
/// harvests.
pub struct Dispatcher {
    store: Arc<InvocationStore>,
    flusher: Flusher,
    telemetry_rx: mpsc::Receiver<Bytes>,
    collect_agent_data: bool,
    ingress_closed: bool,
}

impl Dispatcher {
    #[must_use]
    pub fn new(
        store: Arc<InvocationStore>,
        flusher: Flusher,
        telemetry_rx: mpsc::Receiver<Bytes>,
        collect_agent_data: bool,
    ) -> Self {
        Self {
            store,
            flusher,
            telemetry_rx,
            collect_agent_data,
            ingress_closed: false,
        }
    }

    #[must_use]
    pub fn store(&self) -> &Arc<InvocationStore> {
        &self.store
    }

    #[must_use]
    pub fn flusher(&self) -> &Flusher {
        &self.flusher
    }

    /// Records the start of an invocation.
    pub fn start_invocation(&self, event: &InvocationEvent) {
        if self.collect_agent_data {
            self.store
                .add_invocation(&event.request_id, SystemTime::now());
        }
    }

    /// Attributes at most one pending fragment to `event`, then harvests and sends.
    ///
    /// With `force` every invocation holding telemetry is sent and the store is closed. A
    /// fragment written during this call is picked up by a later one. Returns the number of
    /// buffers the collector accepted.
    pub async fn dispatch(
        &mut self,
        cancel: &CancellationToken,
        event: &InvocationEvent,
        force: bool,
    ) -> usize {
        match self.telemetry_rx.try_recv() {
            Ok(fragment) => {
                if !self.collect_agent_data {
                    return 0;
                }
                log_payload_summary(&fragment);
                self.store
                    .add_invocation(&event.request_id, SystemTime::now());
                if self.store.add_telemetry(&event.request_id, fragment).is_none() {
                    debug!(
                        "Telemetry for {} arrived after its invocation was harvested",
                        event.request_id
                    );
                }
            }
            Err(TryRecvError::Empty) => {
                if !self.collect_agent_data {
                    return 0;
                }
            }
            Err(TryRecvError::Disconnected) => {
                if !self.ingress_closed {
                    warn!("Telemetry pipe reader stopped, no more agent telemetry will be received");
                    self.ingress_closed = true;
                }
                if !self.collect_agent_data {
                    return 0;
                }
            }
        }

        let harvested = if force {
            self.store.close()
        } else {
            self.store.harvest(SystemTime::now())
        };
        self.send_harvest(cancel, &event.invoked_function_arn, harvested)
            .await
    }

    async fn send_harvest(
        &self,
        cancel: &CancellationToken,
        invoked_function_arn: &str,
        harvested: Vec<Invocation>,
    ) -> usize {
        if harvested.is_empty() {
            return 0;
        }
        debug!(
            "Sending agent harvest with {} invocations",
            harvested.len()
        );
        let invocations = harvested.len();
        let fragments: Vec<Bytes> = harvested
            .into_iter()
            .flat_map(|invocation| invocation.fragments)
            .collect();

        match self
            .flusher
            .send_telemetry(cancel, invoked_function_arn, &fragments)
            .await
        {
            Ok(successes) => successes,
            Err(e) => {
                error!("Failed to send harvested telemetry for {invocations} invocations: {e}");
                0
            }
        }
    }
}

fn log_payload_summary(fragment: &Bytes) {
    if !tracing::enabled!(Level::DEBUG) {
        return;
    }
    match codec::decode(fragment) {
        Ok(payload) => debug!(
            "Agent payload v{} from {} {}: {} metrics, {} analytic events, {} spans, {} errors",
            payload.protocol_version.as_u8(),
            payload.metadata.agent_language,
            payload.metadata.agent_version,
            payload.data.metrics().len(),
            payload.data.analytic_events().len(),
            payload.data.span_events().len(),
            payload.data.traced_errors().len(),
        ),
        Err(e) => debug!("Received telemetry that is not an agent payload: {e}"),
    }
}
