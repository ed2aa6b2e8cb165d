use indexmap::IndexMap;
use serde::ser::{Serialize, SerializeMap, Serializer};

use crate::sample::{ComponentMap, NormalizedKey, NormalizedSample};

/// One accumulated row: every metric field observed for a single
/// (timestamp, instance) key.
#[derive(Debug, Clone, PartialEq)]
pub struct BufferedRow {
    pub timestamp_ms: i64,
    /// `"{metric}[{instance}]"` -> stringified value, in first-write order.
    pub fields: IndexMap<String, String>,
    /// Side channel forwarded as instance metadata, never serialized with
    /// the row itself.
    pub component: Option<ComponentMap>,
}

impl BufferedRow {
    fn new(timestamp_ms: i64, component: Option<ComponentMap>) -> Self {
        Self {
            timestamp_ms,
            fields: IndexMap::new(),
            component,
        }
    }
}

impl Serialize for BufferedRow {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.fields.len() + 1))?;
        map.serialize_entry("timestamp", &self.timestamp_ms.to_string())?;
        for (k, v) in &self.fields {
            map.serialize_entry(k, v)?;
        }
        map.end()
    }
}

/// In-memory accumulation buffer keyed by (timestamp, instance).
///
/// Rows keep insertion order so a drain emits them in the order their keys
/// were first seen. There is no eviction; callers drain after each fetch.
#[derive(Debug, Default)]
pub struct MetricBuffer {
    rows: IndexMap<NormalizedKey, BufferedRow>,
}

impl MetricBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Writes `value` under `"{field}[{instance}]"` in the row for `key`.
    ///
    /// The component map is only recorded when the row is created. Repeated
    /// writes of the same field overwrite the previous value.
    pub fn insert(
        &mut self,
        key: NormalizedKey,
        field: &str,
        value: String,
        component: Option<ComponentMap>,
    ) {
        let field_key = format!("{}[{}]", field, key.instance);
        let timestamp_ms = key.timestamp_ms;

        self.rows
            .entry(key)
            .or_insert_with(|| BufferedRow::new(timestamp_ms, component))
            .fields
            .insert(field_key, value);
    }

    /// Inserts a normalized sample.
    pub fn push(&mut self, sample: NormalizedSample) {
        self.insert(sample.key, &sample.field, sample.value, sample.component);
    }

    /// Number of distinct keys currently buffered.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Removes every row in insertion order, leaving the buffer empty.
    pub fn drain(&mut self) -> impl Iterator<Item = BufferedRow> {
        std::mem::take(&mut self.rows).into_values()
    }
}
