// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Log line format of the extension.
//!
//! Lines share the function's log stream, so every line carries a fixed prefix:
//!
//! ```text
//! [NR_EXT] INFO | Sent 1/1 New Relic telemetry payload batches ...
//! [NR_EXT] DEBUG | dispatch{request_id=8476a536}: Sending agent harvest with 2 invocations
//! ```

use std::fmt;
use tracing_core::{Event, Subscriber};
use tracing_subscriber::fmt::{
    format::{self, FormatEvent, FormatFields},
    FmtContext, FormattedFields, MakeWriter,
};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::EnvFilter;

pub const LOG_PREFIX: &str = "[NR_EXT]";
const QUIET_CRATES: &str = "h2=off,hyper=off,hyper_util=off,rustls=off,reqwest=off";

#[derive(Debug, Clone, Copy)]
pub struct Formatter;

impl<S, N> FormatEvent<S, N> for Formatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: format::Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        write!(&mut writer, "{LOG_PREFIX} {} | ", event.metadata().level())?;

        if let Some(scope) = ctx.event_scope() {
            for span in scope.from_root() {
                write!(writer, "{}", span.name())?;
                let ext = span.extensions();
                if let Some(fields) = ext.get::<FormattedFields<N>>() {
                    if !fields.is_empty() {
                        write!(writer, "{{{fields}}}")?;
                    }
                }
                write!(writer, ": ")?;
            }
        }

        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

/// Filter directives for `log_level`. Noisy HTTP stack crates are always silenced.
pub fn env_filter(log_level: &str) -> Result<EnvFilter, tracing_subscriber::filter::ParseError> {
    EnvFilter::try_new(format!("{QUIET_CRATES},{log_level}"))
}

/// Subscriber writing prefixed lines to stdout. An invalid `log_level` falls back to `info`.
pub fn subscriber(log_level: &str) -> impl Subscriber + Send + Sync + 'static {
    subscriber_with_writer(log_level, std::io::stdout)
}

fn subscriber_with_writer<W>(log_level: &str, writer: W) -> impl Subscriber + Send + Sync + 'static
where
    W: for<'a> MakeWriter<'a> + Send + Sync + 'static,
{
    let filter = env_filter(log_level)
        .unwrap_or_else(|_| EnvFilter::new(format!("{QUIET_CRATES},info")));
    // the formatter writes no timestamp, the log stream adds its own
    tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(filter)
        .event_format(Formatter)
        .with_writer(writer)
        .finish()
}
