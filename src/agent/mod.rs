pub mod slices;
pub mod tracker;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use tracing::{debug, error, info, warn};

use crate::cache::{AliasCache, SqliteAliasCache};
use crate::config::{Config, HistoryRange};
use crate::sample::{NormalizedSample, Normalizer, RawSample};
use crate::sink::buffer::MetricBuffer;
use crate::sink::chunk::{ChunkPolicy, PendingChunk};
use crate::sink::http::{DeliveryClient, DeliveryOutcome};
use crate::source::{FetchWindow, Source, SourceClient};

use self::slices::TimeSlices;
use self::tracker::{RunSummary, RunTracker};

/// Agent drives one configured source through normalization, buffering,
/// chunking and delivery.
pub struct Agent {
    source: SourceClient,
    normalizer: Arc<Normalizer>,
    buffer: MetricBuffer,
    pending: PendingChunk,
    policy: ChunkPolicy,
    delivery: DeliveryClient,
    tracker: RunTracker,
    history: Option<HistoryRange>,
    sampling: Duration,
}

impl Agent {
    /// Creates an agent from a validated config.
    ///
    /// In testing mode chunks are built and measured but never sent.
    pub fn new(cfg: &Config, testing: bool) -> Result<Self> {
        let mut normalizer = Normalizer::new(cfg.field_mapping()?);

        if cfg.cache.enabled {
            match SqliteAliasCache::open(&cfg.cache.path) {
                Ok(cache) => {
                    let cache: Arc<dyn AliasCache> = Arc::new(cache);
                    normalizer = normalizer.with_cache(cache);
                }
                Err(e) => warn!(
                    path = %cfg.cache.path.display(),
                    error = %e,
                    "alias cache unavailable, using raw instance names",
                ),
            }
        }

        let sampling = cfg.sampling_interval();
        let delivery = DeliveryClient::new(&cfg.delivery, sampling.as_secs(), testing)
            .context("creating delivery client")?;
        let source = SourceClient::new(cfg).context("creating source client")?;

        Ok(Self {
            source,
            normalizer: Arc::new(normalizer),
            buffer: MetricBuffer::new(),
            pending: PendingChunk::new(),
            policy: cfg.chunk_policy(),
            delivery,
            tracker: RunTracker::new(),
            history: cfg.history,
            sampling,
        })
    }

    /// Runs the agent to completion: one live fetch, or every slice of the
    /// configured history range.
    ///
    /// Upstream failures end the run early but are not errors; the summary
    /// records what was sent.
    pub async fn run(mut self) -> RunSummary {
        info!(
            source = self.source.name(),
            endpoint = %self.delivery.endpoint(),
            "starting agent",
        );

        if let Err(e) = self.source.prepare().await {
            error!(
                source = self.source.name(),
                error = %format!("{e:#}"),
                "source discovery failed, nothing to send",
            );
            return self.finish();
        }

        match self.history {
            Some(range) => match TimeSlices::new(range.start, range.end, self.sampling) {
                Some(slices) => {
                    for slice in slices {
                        debug!(start = %slice.start, end = %slice.end, "replaying slice");
                        self.cycle(FetchWindow::Slice(slice)).await;
                    }
                }
                None => error!("sampling interval must be positive for history replay"),
            },
            None => self.cycle(FetchWindow::Live { now: Utc::now() }).await,
        }

        // Anything left over from a skipped drain.
        self.flush().await;

        self.finish()
    }

    fn finish(&self) -> RunSummary {
        let summary = self.tracker.snapshot();
        info!(
            chunks_sent = summary.chunks_sent,
            chunks_failed = summary.chunks_failed,
            rows_sent = summary.rows_sent,
            entries_parsed = summary.entries_parsed,
            entries_skipped = summary.entries_skipped,
            elapsed_ms = summary.elapsed.as_millis() as u64,
            "agent finished",
        );
        summary
    }

    /// Fetches one window and ships everything it produced.
    async fn cycle(&mut self, window: FetchWindow) {
        let samples = match self.source.fetch(&window).await {
            Ok(samples) => samples,
            Err(e) => {
                error!(error = %e, "fetching samples failed");
                Vec::new()
            }
        };

        self.ingest(samples).await;
        self.drain().await;
    }

    /// Normalizes on the blocking pool, since alias lookups hit SQLite.
    async fn ingest(&mut self, samples: Vec<RawSample>) {
        let total = samples.len();
        let normalizer = Arc::clone(&self.normalizer);
        let span = tracing::Span::current();

        let normalized = tokio::task::spawn_blocking(move || {
            let _entered = span.enter();
            normalize_all(&normalizer, &samples)
        })
        .await;

        match normalized {
            Ok(parsed) => {
                self.tracker.record_skipped(total - parsed.len());
                self.tracker.record_parsed(parsed.len());
                for sample in parsed {
                    self.buffer.push(sample);
                }
            }
            Err(e) => {
                error!(error = %e, samples = total, "normalization task failed");
                self.tracker.record_skipped(total);
            }
        }
    }

    /// Moves buffered rows into chunks, flushing whenever the policy says
    /// so and once more for the remainder.
    async fn drain(&mut self) {
        for row in self.buffer.drain() {
            if let Err(e) = self.pending.push(row) {
                warn!(error = %e, "dropping row that failed to serialize");
                continue;
            }
            if self.policy.should_flush(&self.pending) {
                self.flush().await;
            }
        }

        self.flush().await;
    }

    async fn flush(&mut self) {
        if self.pending.is_empty() {
            return;
        }

        let chunk = self.pending.take();
        let rows = chunk.len();

        match self.delivery.deliver(&chunk).await {
            Ok(report) => self.tracker.record_chunk(report.outcome, rows),
            Err(e) => {
                error!(error = %e, rows, "building chunk payload failed");
                self.tracker.record_chunk(DeliveryOutcome::Failed, rows);
            }
        }
    }
}

/// Normalizes `samples`, dropping the ones that are filtered or malformed.
fn normalize_all(normalizer: &Normalizer, samples: &[RawSample]) -> Vec<NormalizedSample> {
    samples
        .iter()
        .filter_map(|raw| match normalizer.normalize(raw) {
            Ok(sample) => sample,
            Err(e) => {
                warn!(error = %e, metric = %raw.metric, "skipping sample");
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sample::Labels;

    fn config() -> Config {
        let cfg: Config = serde_yaml::from_str(
            r#"
delivery:
  user_name: alice
  license_key: key
  project_name: infra
  sampling_interval: 1m
  chunk_rows: 2
cache:
  enabled: false
source:
  type: prometheus
  uri: http://localhost:9090
"#,
        )
        .expect("parse config");
        cfg.validate().expect("valid");
        cfg
    }

    fn sample(instance: &str, metric: &str, ts: f64) -> RawSample {
        let mut labels = Labels::new();
        labels.insert("instance", instance);
        RawSample {
            labels,
            metric: metric.to_string(),
            value: "1".to_string(),
            timestamp: ts,
        }
    }

    #[tokio::test]
    async fn test_ingest_and_drain_dry_run() {
        let mut agent = Agent::new(&config(), true).expect("agent");

        agent
            .ingest(vec![
                sample("h1:9100", "cpu", 100.0),
                sample("h1:9100", "mem", 100.0),
                sample("h2:9100", "cpu", 100.0),
                sample("h3:9100", "cpu", 160.0),
                sample("h4:9100", "cpu", 200.0),
                sample("h5:9100", "cpu", 0.0),
                sample("h6:9100", "cpu", 1e17),
            ])
            .await;
        assert_eq!(agent.buffer.len(), 4);

        agent.drain().await;
        assert!(agent.buffer.is_empty());
        assert!(agent.pending.is_empty());

        let summary = agent.tracker.snapshot();
        assert_eq!(summary.entries_parsed, 5);
        assert_eq!(summary.entries_skipped, 2);
        assert_eq!(summary.chunks_sent, 2);
        assert_eq!(summary.rows_sent, 4);
        assert_eq!(summary.chunks_failed, 0);
    }

    #[tokio::test]
    async fn test_missing_instance_is_skipped() {
        let mut agent = Agent::new(&config(), true).expect("agent");

        let raw = RawSample {
            labels: Labels::new(),
            metric: "cpu".to_string(),
            value: "1".to_string(),
            timestamp: 100.0,
        };
        agent.ingest(vec![raw]).await;

        assert!(agent.buffer.is_empty());
        assert_eq!(agent.tracker.snapshot().entries_skipped, 1);
    }

    #[tokio::test]
    async fn test_drain_empty_sends_nothing() {
        let mut agent = Agent::new(&config(), true).expect("agent");
        agent.drain().await;
        assert_eq!(agent.tracker.snapshot().chunks_sent, 0);
    }
}
