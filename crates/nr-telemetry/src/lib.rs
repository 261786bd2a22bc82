// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Telemetry correlation, harvest and delivery for the New Relic Lambda extension.
//!
//! Agent payloads arrive out of band over a named pipe ([`ipc`]), are attached to the
//! invocation that produced them ([`batch`]), harvested once they are ripe or rotten and
//! shipped to the collector by the [`flusher`]. The [`dispatcher`] glues the three together
//! for each lifecycle event.

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod agent_data;
pub mod batch;
pub mod codec;
pub mod constants;
pub mod dispatcher;
pub mod endpoints;
pub mod errors;
pub mod flusher;
pub mod http;
pub mod ipc;
pub mod license_key;
pub mod logs;
pub mod payload;
pub mod retry;
