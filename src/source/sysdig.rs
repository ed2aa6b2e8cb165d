use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use url::Url;

use crate::config::SysdigConfig;
use crate::sample::{Labels, RawSample};
use crate::sink::retry::RetryPolicy;

use super::{http_client, FetchWindow, Source};

const HOST_KEY: &str = "host.hostName";
const CONTAINER_KEY: &str = "container.name";

/// Sysdig data API client.
pub struct SysdigClient {
    http: reqwest::Client,
    endpoint: Url,
    cfg: SysdigConfig,
    retry: RetryPolicy,
}

impl SysdigClient {
    pub fn new(cfg: SysdigConfig, retry: RetryPolicy) -> Result<Self> {
        let base = Url::parse(&cfg.url).with_context(|| format!("parsing sysdig url {}", cfg.url))?;
        let endpoint = base.join("/api/data").context("building sysdig data url")?;
        let http = http_client(
            cfg.timeout,
            cfg.http_proxy.as_deref(),
            cfg.https_proxy.as_deref(),
        )?;

        Ok(Self {
            http,
            endpoint,
            cfg,
            retry,
        })
    }

    fn request(&self, window: &FetchWindow) -> DataRequest {
        let mut metrics = vec![
            MetricSpec {
                id: HOST_KEY.to_string(),
                aggregations: None,
            },
            MetricSpec {
                id: CONTAINER_KEY.to_string(),
                aggregations: None,
            },
        ];
        metrics.extend(self.cfg.metrics.iter().map(|m| MetricSpec {
            id: m.clone(),
            aggregations: Some(Aggregations {
                time: "avg",
                group: "avg",
            }),
        }));

        // Negative values are relative to now.
        let (start, end) = match window {
            FetchWindow::Live { .. } => (-(self.cfg.window.as_secs() as i64), 0),
            FetchWindow::Slice(slice) => (slice.start.timestamp(), slice.end.timestamp()),
        };

        DataRequest {
            metrics,
            data_source_type: "container",
            start,
            end,
            sampling: self.cfg.sampling.as_secs().max(1),
            filter: self
                .cfg
                .host_filter
                .as_ref()
                .map(|h| format!("{HOST_KEY} = '{h}'")),
        }
    }
}

impl Source for SysdigClient {
    async fn prepare(&mut self) -> Result<()> {
        Ok(())
    }

    async fn fetch(&self, window: &FetchWindow) -> Result<Vec<RawSample>> {
        let body = self.request(window);

        let sent = self
            .retry
            .send(self.endpoint.as_str(), || {
                self.http
                    .post(self.endpoint.clone())
                    .bearer_auth(&self.cfg.api_key)
                    .json(&body)
            })
            .await;

        let response: DataResponse = sent
            .result
            .context("requesting sysdig data")?
            .json()
            .await
            .context("decoding sysdig data")?;

        let samples = to_samples(&self.cfg.metrics, response);
        tracing::info!(samples = samples.len(), "fetched sysdig samples");
        Ok(samples)
    }
}

/// Expands each `{t, d: [host, container, m1, m2, ..]}` entry into one
/// sample per numeric metric value.
fn to_samples(metrics: &[String], response: DataResponse) -> Vec<RawSample> {
    let mut samples = Vec::with_capacity(response.data.len() * metrics.len());

    for entry in response.data {
        let (host, container) = match (entry.d.first(), entry.d.get(1)) {
            (Some(Value::String(h)), Some(Value::String(c))) => (h.clone(), c.clone()),
            _ => {
                tracing::debug!(t = entry.t, "skipping sysdig entry without host and container");
                continue;
            }
        };

        for (metric, value) in metrics.iter().zip(entry.d.iter().skip(2)) {
            let Value::Number(n) = value else {
                continue;
            };

            let mut labels = Labels::new();
            labels.insert(HOST_KEY, host.clone());
            labels.insert(CONTAINER_KEY, container.clone());

            samples.push(RawSample {
                labels,
                metric: metric.clone(),
                value: n.to_string(),
                timestamp: entry.t,
            });
        }
    }

    samples
}

// --- JSON request/response structures ---

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct DataRequest {
    metrics: Vec<MetricSpec>,
    data_source_type: &'static str,
    start: i64,
    end: i64,
    sampling: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    filter: Option<String>,
}

#[derive(Debug, Serialize)]
struct MetricSpec {
    id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    aggregations: Option<Aggregations>,
}

#[derive(Debug, Serialize)]
struct Aggregations {
    time: &'static str,
    group: &'static str,
}

#[derive(Debug, Deserialize)]
struct DataResponse {
    #[serde(default)]
    data: Vec<DataEntry>,
}

#[derive(Debug, Deserialize)]
struct DataEntry {
    t: f64,
    #[serde(default)]
    d: Vec<Value>,
}

#[cfg(test)]
mod tests {
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    fn config(url: &str) -> SysdigConfig {
        serde_yaml::from_str(&format!("url: {url}\napi_key: token\n")).expect("parse sysdig config")
    }

    #[test]
    fn test_to_samples_positional_values() {
        let response: DataResponse = serde_json::from_value(serde_json::json!({
            "data": [
                {"t": 1700000000, "d": ["node-1", "web", 12.5, 40]},
                {"t": 1700000060, "d": ["node-1", "web", null, 41]},
                {"t": 1700000060, "d": [null, "orphan", 1.0, 1.0]}
            ]
        }))
        .expect("parse");

        let metrics = vec![
            "cpu.used.percent".to_string(),
            "memory.used.percent".to_string(),
        ];
        let samples = to_samples(&metrics, response);

        assert_eq!(samples.len(), 3);
        assert_eq!(samples[0].metric, "cpu.used.percent");
        assert_eq!(samples[0].value, "12.5");
        assert_eq!(samples[0].labels.get(HOST_KEY), Some("node-1"));
        assert_eq!(samples[0].labels.get(CONTAINER_KEY), Some("web"));
        assert_eq!(samples[1].value, "40");
        assert_eq!(samples[2].metric, "memory.used.percent");
        assert_eq!(samples[2].timestamp, 1700000060.0);
    }

    #[test]
    fn test_request_live_window_is_relative() {
        let mut cfg = config("https://app.sysdigcloud.com");
        cfg.host_filter = Some("node-1".to_string());
        let client = SysdigClient::new(cfg, RetryPolicy::default()).expect("client");

        let req = client.request(&FetchWindow::Live {
            now: chrono::Utc::now(),
        });
        let json = serde_json::to_value(&req).expect("serialize");

        assert_eq!(json["start"], -600);
        assert_eq!(json["end"], 0);
        assert_eq!(json["sampling"], 60);
        assert_eq!(json["dataSourceType"], "container");
        assert_eq!(json["filter"], "host.hostName = 'node-1'");
        assert_eq!(json["metrics"][2]["id"], "cpu.used.percent");
        assert_eq!(json["metrics"][2]["aggregations"]["time"], "avg");
    }

    #[tokio::test]
    async fn test_fetch_sends_bearer_token() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/data"))
            .and(header("authorization", "Bearer token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": [{"t": 1000, "d": ["n1", "c1", 1.5, 2.5]}]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client = SysdigClient::new(config(&server.uri()), RetryPolicy::default()).expect("client");
        let samples = client
            .fetch(&FetchWindow::Live {
                now: chrono::Utc::now(),
            })
            .await
            .expect("fetch");

        assert_eq!(samples.len(), 2);
        assert_eq!(samples[1].metric, "memory.used.percent");
        assert_eq!(samples[1].value, "2.5");
    }
}
