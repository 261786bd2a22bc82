// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Typed views over the positional records inside [`LambdaData`].
//!
//! The agent emits every category as a JSON array whose layout depends on the category.
//! Nothing here fails: records that do not have the expected shape are skipped.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde_json::{Map, Value};

use crate::codec::LambdaData;
use crate::constants::MAX_METRIC_NAME_LEN;

type Attributes = Map<String, Value>;

/// Converts an agent timestamp to a point in time. Agents report either seconds or
/// milliseconds since the epoch; anything below 10^10 is taken as seconds.
#[must_use]
pub fn to_timestamp(value: f64) -> SystemTime {
    let millis = if value < 10_000_000_000.0 {
        value * 1000.0
    } else {
        value
    };
    if !millis.is_finite() || millis <= 0.0 {
        return UNIX_EPOCH;
    }
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let millis = millis.round() as u64;
    UNIX_EPOCH + Duration::from_millis(millis)
}

/// One analytic, span, error or custom event.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AgentEvent {
    pub intrinsics: Attributes,
    pub user_attributes: Attributes,
    pub agent_attributes: Attributes,
}

impl AgentEvent {
    fn from_value(value: &Value) -> Option<Self> {
        let parts = value.as_array()?;
        let intrinsics = parts.first()?.as_object()?.clone();
        let user_attributes = parts
            .get(1)
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();
        let agent_attributes = parts
            .get(2)
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();
        Some(Self {
            intrinsics,
            user_attributes,
            agent_attributes,
        })
    }

    /// Looks `key` up in intrinsics, then user attributes, then agent attributes.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.intrinsics
            .get(key)
            .or_else(|| self.user_attributes.get(key))
            .or_else(|| self.agent_attributes.get(key))
    }

    /// Merges the three attribute sets into one map. Intrinsics win over user attributes,
    /// which win over agent attributes. Only scalar user attributes are kept and the
    /// intrinsic `type` is dropped.
    #[must_use]
    pub fn flatten(&self) -> Attributes {
        let mut flat = self.agent_attributes.clone();
        for (key, value) in &self.user_attributes {
            if matches!(value, Value::Number(_) | Value::String(_) | Value::Bool(_)) {
                flat.insert(key.clone(), value.clone());
            }
        }
        for (key, value) in &self.intrinsics {
            if key != "type" {
                flat.insert(key.clone(), value.clone());
            }
        }
        flat
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MetricData {
    pub name: String,
    pub values: Vec<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TracedError {
    pub timestamp: SystemTime,
    pub transaction_name: String,
    pub message: String,
    pub error_type: String,
    pub attributes: Attributes,
}

impl TracedError {
    fn from_value(value: &Value) -> Option<Self> {
        let parts = value.as_array()?;
        Some(Self {
            timestamp: to_timestamp(parts.first()?.as_f64()?),
            transaction_name: parts.get(1)?.as_str()?.to_string(),
            message: parts.get(2)?.as_str()?.to_string(),
            error_type: parts.get(3)?.as_str()?.to_string(),
            attributes: parts
                .get(4)
                .and_then(Value::as_object)
                .cloned()
                .unwrap_or_default(),
        })
    }
}

fn truncate_name(name: &str) -> String {
    match name.char_indices().nth(MAX_METRIC_NAME_LEN) {
        Some((end, _)) => name[..end].to_string(),
        None => name.to_string(),
    }
}

/// Event categories are `[run_id, reservoir, [event, ...]]`.
fn events_of(category: &[Value]) -> Vec<AgentEvent> {
    category
        .get(2)
        .and_then(Value::as_array)
        .map(|events| events.iter().filter_map(AgentEvent::from_value).collect())
        .unwrap_or_default()
}

impl LambdaData {
    #[must_use]
    pub fn analytic_events(&self) -> Vec<AgentEvent> {
        events_of(&self.analytic_event_data)
    }

    #[must_use]
    pub fn span_events(&self) -> Vec<AgentEvent> {
        events_of(&self.span_event_data)
    }

    #[must_use]
    pub fn error_events(&self) -> Vec<AgentEvent> {
        events_of(&self.error_event_data)
    }

    #[must_use]
    pub fn custom_events(&self) -> Vec<AgentEvent> {
        events_of(&self.custom_event_data)
    }

    /// Metrics live at index 3 as `[[{"name": ..}, [values..]], ...]`.
    #[must_use]
    pub fn metrics(&self) -> Vec<MetricData> {
        let Some(raw_metrics) = self.metric_data.get(3).and_then(Value::as_array) else {
            return Vec::new();
        };
        raw_metrics
            .iter()
            .filter_map(|raw| {
                let parts = raw.as_array()?;
                let name = parts.first()?.get("name")?.as_str()?;
                let values = parts
                    .get(1)?
                    .as_array()?
                    .iter()
                    .filter_map(Value::as_f64)
                    .collect();
                Some(MetricData {
                    name: truncate_name(name),
                    values,
                })
            })
            .collect()
    }

    /// Traced errors live at index 1.
    #[must_use]
    pub fn traced_errors(&self) -> Vec<TracedError> {
        self.error_data
            .get(1)
            .and_then(Value::as_array)
            .map(|errors| errors.iter().filter_map(TracedError::from_value).collect())
            .unwrap_or_default()
    }
}
