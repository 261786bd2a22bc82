// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Invocation store and harvest policy.
//!
//! Telemetry fragments arrive out of band and are attached to the invocation identified by
//! the request id current at the time they were read. The store decides when accumulated
//! fragments can be shipped:
//!
//! - **ripe**: once the eldest pending invocation is older than the ripe window, every
//!   invocation holding at least [`RIPE_FRAGMENT_COUNT`] fragments is harvested.
//! - **rot**: once nothing has been harvested for longer than the rot window, every
//!   invocation holding at least one fragment is harvested regardless of age.
//!
//! Harvested invocations stay in the map as tombstones so late telemetry is dropped instead
//! of resurrecting them, and so their trace id can still be looked up for log correlation.

use std::collections::HashMap;
use std::mem;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use tracing::debug;

use crate::codec;
use crate::constants::RIPE_FRAGMENT_COUNT;

/// Snapshot of one function execution and the telemetry attributed to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub request_id: String,
    pub start: SystemTime,
    pub trace_id: Option<String>,
    pub fragments: Vec<Bytes>,
}

impl Invocation {
    fn new(request_id: &str, start: SystemTime) -> Self {
        Self {
            request_id: request_id.to_string(),
            start,
            trace_id: None,
            fragments: Vec::new(),
        }
    }

    #[must_use]
    pub fn is_ripe(&self) -> bool {
        self.fragments.len() >= RIPE_FRAGMENT_COUNT
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fragments.is_empty()
    }
}

#[derive(Debug)]
struct Entry {
    invocation: Invocation,
    sent: bool,
}

#[derive(Debug)]
struct State {
    invocations: HashMap<String, Entry>,
    last_harvest: SystemTime,
    eldest: SystemTime,
    closed: bool,
}

impl State {
    fn pending(&self) -> impl Iterator<Item = &Entry> {
        self.invocations.values().filter(|entry| !entry.sent)
    }

    /// Marks every pending entry matching `take` as sent and moves its fragments out.
    fn take_where(&mut self, take: impl Fn(&Invocation) -> bool) -> Vec<Invocation> {
        let mut harvested: Vec<Invocation> = self
            .invocations
            .values_mut()
            .filter(|entry| !entry.sent && take(&entry.invocation))
            .map(|entry| {
                entry.sent = true;
                Invocation {
                    request_id: entry.invocation.request_id.clone(),
                    start: entry.invocation.start,
                    trace_id: entry.invocation.trace_id.clone(),
                    fragments: mem::take(&mut entry.invocation.fragments),
                }
            })
            .collect();
        harvested.sort_by(|a, b| {
            a.start
                .cmp(&b.start)
                .then_with(|| a.request_id.cmp(&b.request_id))
        });
        harvested
    }

    fn aggressive_harvest(&mut self, now: SystemTime) -> Vec<Invocation> {
        let harvested = self.take_where(|invocation| !invocation.is_empty());
        self.last_harvest = now;
        self.eldest = UNIX_EPOCH;
        harvested
    }

    fn ripe_harvest(&mut self, now: SystemTime) -> Vec<Invocation> {
        let harvested = self.take_where(Invocation::is_ripe);
        self.eldest = self
            .pending()
            .map(|entry| entry.invocation.start)
            .min()
            .unwrap_or(UNIX_EPOCH);
        if !harvested.is_empty() {
            self.last_harvest = now;
        }
        harvested
    }

    /// Drops tombstones that are older than `horizon`.
    fn prune_sent(&mut self, now: SystemTime, horizon: Duration) {
        self.invocations
            .retain(|_, entry| !entry.sent || elapsed(entry.invocation.start, now) <= horizon);
    }
}

fn elapsed(since: SystemTime, now: SystemTime) -> Duration {
    now.duration_since(since).unwrap_or_default()
}

/// Thread-safe set of invocations awaiting telemetry.
#[derive(Debug)]
pub struct InvocationStore {
    state: RwLock<State>,
    ripe_window: Duration,
    rot_window: Duration,
    extract_trace_id: bool,
}

impl InvocationStore {
    #[must_use]
    pub fn new(ripe_window: Duration, rot_window: Duration, extract_trace_id: bool) -> Self {
        Self {
            state: RwLock::new(State {
                invocations: HashMap::new(),
                last_harvest: UNIX_EPOCH,
                eldest: UNIX_EPOCH,
                closed: false,
            }),
            ripe_window,
            rot_window,
            extract_trace_id,
        }
    }

    fn write(&self) -> RwLockWriteGuard<'_, State> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn read(&self) -> RwLockReadGuard<'_, State> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers an invocation. A request id that is already known keeps its first record.
    pub fn add_invocation(&self, request_id: &str, start: SystemTime) {
        let mut state = self.write();
        if state.closed || state.invocations.contains_key(request_id) {
            return;
        }
        state.invocations.insert(
            request_id.to_string(),
            Entry {
                invocation: Invocation::new(request_id, start),
                sent: false,
            },
        );
        if state.eldest == UNIX_EPOCH || start < state.eldest {
            state.eldest = start;
        }
    }

    /// Appends a fragment to a pending invocation and returns a snapshot of it.
    ///
    /// Unknown and already harvested request ids are a silent miss: the fragment is dropped
    /// and `None` is returned.
    pub fn add_telemetry(&self, request_id: &str, payload: Bytes) -> Option<Invocation> {
        if !self.is_pending(request_id) {
            debug!("dropping telemetry for unknown or harvested request {request_id}");
            return None;
        }

        // decoding is the expensive part, keep it outside the lock
        let trace_id = if self.extract_trace_id {
            match codec::extract_trace_id(&payload) {
                Ok(trace_id) => trace_id.filter(|id| !id.is_empty()),
                Err(e) => {
                    debug!("no trace id extracted for {request_id}: {e}");
                    None
                }
            }
        } else {
            None
        };

        let mut state = self.write();
        let entry = match state.invocations.get_mut(request_id) {
            Some(entry) if !entry.sent => entry,
            _ => {
                debug!("dropping telemetry for unknown or harvested request {request_id}");
                return None;
            }
        };
        entry.invocation.fragments.push(payload);
        if trace_id.is_some() {
            entry.invocation.trace_id = trace_id;
        }
        Some(entry.invocation.clone())
    }

    fn is_pending(&self, request_id: &str) -> bool {
        self.read()
            .invocations
            .get(request_id)
            .is_some_and(|entry| !entry.sent)
    }

    /// Applies the rot then ripe policy at `now` and returns what was harvested.
    pub fn harvest(&self, now: SystemTime) -> Vec<Invocation> {
        let mut state = self.write();
        if state.closed {
            return Vec::new();
        }
        state.prune_sent(now, self.rot_window);
        if state.pending().next().is_none() {
            return Vec::new();
        }

        // before the first harvest, rot age is counted from the eldest invocation
        let rot_reference = if state.last_harvest == UNIX_EPOCH {
            state.eldest
        } else {
            state.last_harvest
        };
        if elapsed(rot_reference, now) > self.rot_window {
            let harvested = state.aggressive_harvest(now);
            debug!("rot harvest of {} invocations", harvested.len());
            return harvested;
        }

        if elapsed(state.eldest, now) > self.ripe_window {
            let harvested = state.ripe_harvest(now);
            debug!("ripe harvest of {} invocations", harvested.len());
            return harvested;
        }

        Vec::new()
    }

    /// Harvests every invocation holding telemetry and stops accepting new data.
    pub fn close(&self) -> Vec<Invocation> {
        let mut state = self.write();
        if state.closed {
            return Vec::new();
        }
        state.closed = true;
        state.aggressive_harvest(SystemTime::now())
    }

    #[must_use]
    pub fn retrieve_trace_id(&self, request_id: &str) -> Option<String> {
        self.read()
            .invocations
            .get(request_id)
            .and_then(|entry| entry.invocation.trace_id.clone())
    }

    /// Number of invocations not yet harvested.
    #[must_use]
    pub fn len(&self) -> usize {
        self.read().pending().count()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
