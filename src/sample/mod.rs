pub mod sanitize;

use std::collections::HashMap;
use std::sync::Arc;

use regex::Regex;
use serde::Serialize;
use thiserror::Error;

use crate::cache::AliasCache;

use self::sanitize::instance_with_device;

/// Label set of one upstream record, readable by field name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Labels(HashMap<String, String>);

impl Labels {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the value stored under `field`, if any.
    pub fn get(&self, field: &str) -> Option<&str> {
        self.0.get(field).map(String::as_str)
    }

    pub fn insert(&mut self, field: impl Into<String>, value: impl Into<String>) {
        self.0.insert(field.into(), value.into());
    }

    /// Returns the first non-empty value among `fields`, in order.
    pub fn first_non_empty(&self, fields: &[String]) -> Option<&str> {
        fields
            .iter()
            .filter_map(|f| self.get(f))
            .find(|v| !v.is_empty())
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Labels {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

/// One time-series sample as produced by a source client.
#[derive(Debug, Clone, PartialEq)]
pub struct RawSample {
    pub labels: Labels,
    /// Upstream metric (or item) name.
    pub metric: String,
    /// Scalar value, already stringified.
    pub value: String,
    /// Epoch seconds. Fractional parts are truncated during normalization.
    pub timestamp: f64,
}

/// Composite buffer key: samples sharing both fields merge into one row.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NormalizedKey {
    pub timestamp_ms: i64,
    pub instance: String,
}

/// Instance-to-component association forwarded as instance metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentMap {
    pub instance_name: String,
    pub component_name: String,
}

/// A sample in canonical `(timestamp, instance, field, value)` form.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedSample {
    pub key: NormalizedKey,
    pub field: String,
    pub value: String,
    pub component: Option<ComponentMap>,
}

/// Per-sample parse failures. The sample is skipped and the run continues.
#[derive(Debug, Error, PartialEq)]
pub enum NormalizeError {
    #[error("no instance value in fields [{0}]")]
    MissingInstance(String),

    #[error("empty metric name")]
    MissingMetric,

    #[error("timestamp {0} is not a valid unix time")]
    InvalidTimestamp(f64),
}

/// Which labels identify instances, devices, metric names and components.
#[derive(Debug, Clone, Default)]
pub struct FieldMapping {
    /// Candidate instance fields; the first non-empty value wins.
    pub instance_fields: Vec<String>,
    /// Candidate device fields; the first non-empty value wins.
    pub device_fields: Vec<String>,
    /// Labels joined with `_` to form the metric name.
    pub metric_name_fields: Vec<String>,
    pub component_field: Option<String>,
    /// Start-anchored whitelist applied to the raw instance value.
    pub instance_whitelist: Option<Regex>,
    /// Offset added to every timestamp, in milliseconds.
    pub offset_ms: i64,
}

/// Converts raw samples into buffer-ready samples.
pub struct Normalizer {
    mapping: FieldMapping,
    cache: Option<Arc<dyn AliasCache>>,
}

impl Normalizer {
    pub fn new(mapping: FieldMapping) -> Self {
        Self {
            mapping,
            cache: None,
        }
    }

    /// Rewrites resolved instances through the given alias cache.
    pub fn with_cache(mut self, cache: Arc<dyn AliasCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Normalizes one sample.
    ///
    /// Returns `Ok(None)` for samples that are deliberately dropped: an
    /// instance outside the whitelist, or a zero timestamp.
    pub fn normalize(&self, raw: &RawSample) -> Result<Option<NormalizedSample>, NormalizeError> {
        let m = &self.mapping;

        let instance = raw
            .labels
            .first_non_empty(&m.instance_fields)
            .ok_or_else(|| NormalizeError::MissingInstance(m.instance_fields.join(", ")))?;

        if let Some(ref whitelist) = m.instance_whitelist {
            if !whitelist.is_match(instance) {
                return Ok(None);
            }
        }

        let secs = raw.timestamp.trunc();
        if !secs.is_finite() || secs >= i64::MAX as f64 || secs < i64::MIN as f64 {
            return Err(NormalizeError::InvalidTimestamp(raw.timestamp));
        }
        let seconds = secs as i64;
        if seconds <= 0 {
            return Ok(None);
        }
        let timestamp_ms = seconds
            .checked_mul(1000)
            .and_then(|ms| ms.checked_add(m.offset_ms))
            .ok_or(NormalizeError::InvalidTimestamp(raw.timestamp))?;

        let field = self.metric_name(raw);
        if field.is_empty() {
            return Err(NormalizeError::MissingMetric);
        }

        let device = raw.labels.first_non_empty(&m.device_fields);
        let instance = self.resolve_alias(instance_with_device(instance, device));

        let component = m
            .component_field
            .as_deref()
            .and_then(|f| raw.labels.get(f))
            .filter(|c| !c.is_empty())
            .map(|c| ComponentMap {
                instance_name: instance.clone(),
                component_name: c.to_string(),
            });

        Ok(Some(NormalizedSample {
            key: NormalizedKey {
                timestamp_ms,
                instance,
            },
            field,
            value: raw.value.clone(),
            component,
        }))
    }

    fn metric_name(&self, raw: &RawSample) -> String {
        let parts: Vec<&str> = self
            .mapping
            .metric_name_fields
            .iter()
            .filter_map(|f| raw.labels.get(f))
            .filter(|v| !v.is_empty())
            .collect();

        if parts.is_empty() {
            raw.metric.clone()
        } else {
            parts.join("_")
        }
    }

    fn resolve_alias(&self, instance: String) -> String {
        let Some(ref cache) = self.cache else {
            return instance;
        };

        match cache.resolve(&instance) {
            Ok(alias) => alias,
            Err(e) => {
                tracing::warn!(error = %e, instance = %instance, "alias lookup failed, using instance name");
                instance
            }
        }
    }
}
