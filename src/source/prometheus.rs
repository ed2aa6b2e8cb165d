use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tokio::sync::Semaphore;
use url::Url;

use crate::config::{anchored, PrometheusConfig, QueryFunction};
use crate::sample::{Labels, RawSample};
use crate::sink::retry::RetryPolicy;

use super::{http_client, FetchWindow, Source};

/// One instant query per metric.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricQuery {
    pub metric: String,
    pub query: String,
}

/// Prometheus HTTP API client.
pub struct PrometheusClient {
    http: reqwest::Client,
    api: Url,
    cfg: PrometheusConfig,
    sampling: Duration,
    retry: RetryPolicy,
    queries: Vec<MetricQuery>,
}

impl PrometheusClient {
    pub fn new(cfg: PrometheusConfig, sampling: Duration, retry: RetryPolicy) -> Result<Self> {
        let base = Url::parse(&cfg.uri).with_context(|| format!("parsing prometheus uri {}", cfg.uri))?;
        let api = base.join("/api/v1/").context("building prometheus api url")?;
        let http = http_client(
            cfg.timeout,
            cfg.http_proxy.as_deref(),
            cfg.https_proxy.as_deref(),
        )?;

        Ok(Self {
            http,
            api,
            cfg,
            sampling,
            retry,
            queries: Vec::new(),
        })
    }

    /// Queries resolved by [`Source::prepare`].
    pub fn queries(&self) -> &[MetricQuery] {
        &self.queries
    }

    async fn get_api<T: DeserializeOwned>(&self, path: &str, params: &[(&str, String)]) -> Result<T> {
        get_api(&self.http, &self.api, self.retry, path, params).await
    }

    /// Applies the whitelist, ignore list and function rules to `metrics`.
    fn build_queries(&self, metrics: Vec<String>) -> Result<Vec<MetricQuery>> {
        let whitelist = self.cfg.metrics_whitelist.as_deref().map(anchored).transpose()?;
        let with_function = self
            .cfg
            .metrics_whitelist_with_function
            .as_deref()
            .map(anchored)
            .transpose()?;

        let queries = metrics
            .into_iter()
            .filter(|m| whitelist.as_ref().map_or(true, |re| re.is_match(m)))
            .filter(|m| !self.cfg.metrics_to_ignore.contains(m))
            .map(|metric| {
                let mut query = format!("{}{}", metric, self.cfg.query_label_selector);
                let applies = with_function.as_ref().map_or(true, |re| re.is_match(&metric));
                if applies {
                    if let Some(QueryFunction::Increase) = self.cfg.query_with_function {
                        query = format!("increase({}[{}s])", query, self.sampling.as_secs());
                    }
                }
                MetricQuery { metric, query }
            })
            .collect();

        Ok(queries)
    }
}

impl Source for PrometheusClient {
    async fn prepare(&mut self) -> Result<()> {
        let metrics = if self.cfg.metrics.is_empty() {
            let names: Vec<String> = self
                .get_api("label/__name__/values", &[])
                .await
                .context("discovering metric names")?;
            tracing::info!(count = names.len(), "discovered prometheus metrics");
            names
        } else {
            self.cfg.metrics.clone()
        };

        self.queries = self.build_queries(metrics)?;
        if self.queries.is_empty() {
            bail!("metric list is empty");
        }

        tracing::debug!(queries = self.queries.len(), "prepared prometheus queries");
        Ok(())
    }

    async fn fetch(&self, window: &FetchWindow) -> Result<Vec<RawSample>> {
        let at = match window {
            FetchWindow::Live { now } => *now,
            FetchWindow::Slice(slice) => slice.start,
        };
        let time = at.timestamp().to_string();

        let semaphore = Arc::new(Semaphore::new(self.cfg.thread_pool.max(1)));
        let mut in_flight = tokio::task::JoinSet::new();

        for (index, q) in self.queries.iter().cloned().enumerate() {
            let http = self.http.clone();
            let api = self.api.clone();
            let retry = self.retry;
            let semaphore = Arc::clone(&semaphore);
            let time = time.clone();

            in_flight.spawn(async move {
                let _permit = match semaphore.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(e) => {
                        tracing::warn!(error = %e, "prometheus query semaphore closed");
                        return (index, Vec::new());
                    }
                };

                tracing::debug!(metric = %q.metric, query = %q.query, "querying metric");
                let params = [("query", q.query.clone()), ("time", time)];
                match get_api::<VectorData>(&http, &api, retry, "query", &params).await {
                    Ok(data) => (index, to_samples(&q.metric, data)),
                    Err(e) => {
                        tracing::error!(metric = %q.metric, error = %e, "query metric error");
                        (index, Vec::new())
                    }
                }
            });
        }

        let mut results: Vec<Vec<RawSample>> = vec![Vec::new(); self.queries.len()];
        while let Some(joined) = in_flight.join_next().await {
            match joined {
                Ok((index, samples)) => results[index] = samples,
                Err(e) => tracing::warn!(error = %e, "prometheus query task failed"),
            }
        }

        let samples: Vec<RawSample> = results.into_iter().flatten().collect();
        tracing::info!(samples = samples.len(), time = %at, "fetched prometheus samples");
        Ok(samples)
    }
}

/// GETs `{api}{path}` and unwraps the `{status, data}` envelope.
async fn get_api<T: DeserializeOwned>(
    http: &reqwest::Client,
    api: &Url,
    retry: RetryPolicy,
    path: &str,
    params: &[(&str, String)],
) -> Result<T> {
    let url = api.join(path).with_context(|| format!("building url for {path}"))?;

    let sent = retry.send(url.as_str(), || http.get(url.clone()).query(params)).await;
    let response = sent
        .result
        .with_context(|| format!("requesting {path}"))?;

    let body: ApiResponse<T> = response
        .json()
        .await
        .with_context(|| format!("decoding response from {path}"))?;

    if body.status != "success" {
        bail!(
            "{path} returned status {}: {}",
            body.status,
            body.error.unwrap_or_default()
        );
    }

    body.data
        .with_context(|| format!("{path} returned no data"))
}

fn to_samples(metric: &str, data: VectorData) -> Vec<RawSample> {
    data.result
        .into_iter()
        .map(|item| {
            let (timestamp, value) = item.value;
            RawSample {
                labels: item.metric.into_iter().collect::<Labels>(),
                metric: metric.to_string(),
                value,
                timestamp,
            }
        })
        .collect()
}

// --- JSON response structures ---

#[derive(Deserialize)]
struct ApiResponse<T> {
    status: String,
    data: Option<T>,
    error: Option<String>,
}

#[derive(Deserialize)]
struct VectorData {
    #[serde(default)]
    result: Vec<VectorSample>,
}

#[derive(Deserialize)]
struct VectorSample {
    #[serde(default)]
    metric: HashMap<String, String>,
    /// `[unix_seconds, "value"]`.
    value: (f64, String),
}
