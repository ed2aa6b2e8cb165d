use std::time::{Duration, Instant};

use indexmap::IndexMap;

use crate::sample::ComponentMap;

use super::buffer::BufferedRow;

/// Default row threshold for HTTP-query sources.
pub const DEFAULT_MAX_ROWS: usize = 100;

/// Default serialized size threshold (2 MiB).
pub const DEFAULT_MAX_BYTES: usize = 2048 * 1024;

/// Flush thresholds for pending rows. Whichever is crossed first wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkPolicy {
    pub max_rows: usize,
    pub max_bytes: usize,
}

impl Default for ChunkPolicy {
    fn default() -> Self {
        Self {
            max_rows: DEFAULT_MAX_ROWS,
            max_bytes: DEFAULT_MAX_BYTES,
        }
    }
}

impl ChunkPolicy {
    /// Checked after each append, so a chunk can exceed `max_bytes` by at
    /// most the row that crossed it.
    pub fn should_flush(&self, pending: &PendingChunk) -> bool {
        pending.len() >= self.max_rows || pending.byte_size() >= self.max_bytes
    }
}

/// Rows waiting to be delivered, kept pre-serialized.
#[derive(Debug)]
pub struct PendingChunk {
    rows: Vec<String>,
    /// Row JSON lengths plus separators, excluding the enclosing brackets.
    row_bytes: usize,
    components: IndexMap<String, ComponentMap>,
    started: Instant,
}

impl Default for PendingChunk {
    fn default() -> Self {
        Self {
            rows: Vec::new(),
            row_bytes: 0,
            components: IndexMap::new(),
            started: Instant::now(),
        }
    }
}

impl PendingChunk {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a row, moving its component map into the chunk metadata.
    pub fn push(&mut self, row: BufferedRow) -> Result<(), serde_json::Error> {
        let json = serde_json::to_string(&row)?;

        if !self.rows.is_empty() {
            self.row_bytes += 1;
        }
        self.row_bytes += json.len();
        self.rows.push(json);

        if let Some(component) = row.component {
            // Last write wins per instance; position stays at first sight.
            self.components
                .insert(component.instance_name.clone(), component);
        }

        Ok(())
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Exact length of the pending rows encoded as a JSON array.
    pub fn byte_size(&self) -> usize {
        self.row_bytes + 2
    }

    /// Hands over the pending rows and restarts the chunk timer.
    pub fn take(&mut self) -> Chunk {
        let pending = std::mem::take(self);
        Chunk {
            byte_size: pending.byte_size(),
            rows: pending.rows,
            components: pending.components.into_values().collect(),
            build_time: pending.started.elapsed(),
        }
    }
}

/// A batch of rows handed to the delivery client.
#[derive(Debug, Clone)]
pub struct Chunk {
    rows: Vec<String>,
    byte_size: usize,
    components: Vec<ComponentMap>,
    build_time: Duration,
}

impl Chunk {
    /// Builds a chunk directly from rows.
    #[cfg(test)]
    pub(crate) fn from_rows(rows: impl IntoIterator<Item = BufferedRow>) -> Result<Self, serde_json::Error> {
        let mut pending = PendingChunk::new();
        for row in rows {
            pending.push(row)?;
        }
        Ok(pending.take())
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn byte_size(&self) -> usize {
        self.byte_size
    }

    /// Time spent accumulating this chunk.
    pub fn build_time(&self) -> Duration {
        self.build_time
    }

    /// Component maps of the rows in this chunk, deduplicated by instance.
    pub fn components(&self) -> &[ComponentMap] {
        &self.components
    }

    /// The rows as one JSON array.
    pub fn rows_json(&self) -> String {
        let mut out = String::with_capacity(self.byte_size);
        out.push('[');
        for (i, row) in self.rows.iter().enumerate() {
            if i > 0 {
                out.push(',');
            }
            out.push_str(row);
        }
        out.push(']');
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sample::NormalizedKey;
    use crate::sink::buffer::MetricBuffer;

    fn row(ts: i64, instance: &str, value: &str) -> BufferedRow {
        let mut buf = MetricBuffer::new();
        buf.insert(
            NormalizedKey {
                timestamp_ms: ts,
                instance: instance.to_string(),
            },
            "cpu",
            value.to_string(),
            None,
        );
        buf.drain().next().expect("one row")
    }

    fn chunk_sizes(policy: ChunkPolicy, rows: Vec<BufferedRow>) -> Vec<usize> {
        let mut pending = PendingChunk::new();
        let mut sizes = Vec::new();
        for r in rows {
            pending.push(r).expect("push");
            if policy.should_flush(&pending) {
                sizes.push(pending.take().len());
            }
        }
        if !pending.is_empty() {
            sizes.push(pending.take().len());
        }
        sizes
    }

    #[test]
    fn test_row_threshold_splits_chunks() {
        let policy = ChunkPolicy {
            max_rows: 2,
            max_bytes: DEFAULT_MAX_BYTES,
        };
        let rows = (0..5).map(|i| row(1000 + i, "h1", "1")).collect();
        assert_eq!(chunk_sizes(policy, rows), vec![2, 2, 1]);
    }

    #[test]
    fn test_byte_size_matches_serialized_array() {
        let mut pending = PendingChunk::new();
        assert_eq!(pending.byte_size(), 2);

        pending.push(row(1000, "h1", "10")).expect("push");
        pending.push(row(2000, "h2", "20")).expect("push");
        let expected = pending.byte_size();

        let chunk = pending.take();
        assert_eq!(chunk.rows_json().len(), expected);
        assert_eq!(chunk.byte_size(), expected);

        let parsed: serde_json::Value =
            serde_json::from_str(&chunk.rows_json()).expect("valid json");
        assert_eq!(parsed.as_array().map(Vec::len), Some(2));
    }

    #[test]
    fn test_byte_threshold_overflows_by_at_most_one_row() {
        let one_row = serde_json::to_string(&row(1000, "h1", "1"))
            .expect("serialize")
            .len();
        let policy = ChunkPolicy {
            max_rows: usize::MAX,
            max_bytes: one_row * 3,
        };

        let mut pending = PendingChunk::new();
        let mut chunks = Vec::new();
        for i in 0..10 {
            pending.push(row(1000 + i, "h1", "1")).expect("push");
            if policy.should_flush(&pending) {
                chunks.push(pending.take());
            }
        }

        assert!(!chunks.is_empty());
        for c in &chunks {
            assert!(c.byte_size() < policy.max_bytes + one_row + 1);
            assert!(c.byte_size() >= policy.max_bytes);
        }
    }

    #[test]
    fn test_oversized_single_row_flushes_alone() {
        let policy = ChunkPolicy {
            max_rows: 100,
            max_bytes: 8,
        };
        assert_eq!(
            chunk_sizes(policy, vec![row(1, "a", "1"), row(2, "b", "2")]),
            vec![1, 1]
        );
    }

    #[test]
    fn test_components_deduplicated_by_instance() {
        let mut pending = PendingChunk::new();
        for (instance, component) in [("h1", "web"), ("h2", "db"), ("h1", "api")] {
            let mut r = row(1000, instance, "1");
            r.component = Some(ComponentMap {
                instance_name: instance.to_string(),
                component_name: component.to_string(),
            });
            pending.push(r).expect("push");
        }

        let chunk = pending.take();
        let names: Vec<(&str, &str)> = chunk
            .components()
            .iter()
            .map(|c| (c.instance_name.as_str(), c.component_name.as_str()))
            .collect();
        assert_eq!(names, vec![("h1", "api"), ("h2", "db")]);
    }

    #[test]
    fn test_take_resets_pending() {
        let mut pending = PendingChunk::new();
        pending.push(row(1, "a", "1")).expect("push");
        let _ = pending.take();
        assert!(pending.is_empty());
        assert_eq!(pending.byte_size(), 2);
    }
}
