use std::io::Write;
use std::time::Instant;

use anyhow::{Context, Result};
use reqwest::header::{CONTENT_ENCODING, CONTENT_TYPE};
use serde::Serialize;
use url::Url;

use crate::config::{Compression, DeliveryConfig, PayloadEncoding, ProjectKind, ProjectType};

use super::chunk::Chunk;
use super::retry::RetryPolicy;

/// Wire envelope posted for every chunk.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub user_name: String,
    pub license_key: String,
    pub project_name: String,
    pub instance_name: String,
    pub agent_type: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sampling_interval: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metric_data: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub incident_data: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deployment_data: Option<String>,
    pub instance_meta_data: String,
}

impl Envelope {
    /// Field/value pairs for form encoding. Every envelope field is a string.
    fn form_pairs(&self) -> Result<Vec<(String, String)>> {
        let value = serde_json::to_value(self).context("serializing envelope")?;
        let serde_json::Value::Object(map) = value else {
            anyhow::bail!("envelope did not serialize to an object");
        };

        Ok(map
            .into_iter()
            .filter_map(|(k, v)| match v {
                serde_json::Value::String(s) => Some((k, s)),
                _ => None,
            })
            .collect())
    }
}

/// How a chunk delivery ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// The endpoint answered `200 OK`.
    Delivered,
    /// Testing mode: the envelope was built and measured but not sent.
    DryRun,
    /// The retry policy gave up.
    Failed,
}

/// Outcome of one chunk delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryReport {
    pub outcome: DeliveryOutcome,
    pub attempts: u32,
    /// Size of the serialized envelope before compression.
    pub bytes: usize,
}

/// Posts chunks to the ingestion endpoint.
pub struct DeliveryClient {
    http: reqwest::Client,
    endpoint: Url,
    project_type: ProjectType,
    user_name: String,
    license_key: String,
    project_name: String,
    instance_name: String,
    sampling_interval: Option<String>,
    encoding: PayloadEncoding,
    compression: Compression,
    retry: RetryPolicy,
    testing: bool,
}

impl DeliveryClient {
    /// Creates a client for the configured endpoint.
    ///
    /// `sampling_interval_secs` is only reported for metric projects.
    pub fn new(cfg: &DeliveryConfig, sampling_interval_secs: u64, testing: bool) -> Result<Self> {
        let base = Url::parse(&cfg.url).with_context(|| format!("parsing delivery url {}", cfg.url))?;
        let endpoint = base
            .join(cfg.project_type.api_path())
            .context("building delivery endpoint")?;

        let mut builder = reqwest::Client::builder()
            .timeout(cfg.timeout)
            .danger_accept_invalid_certs(true);

        if let Some(ref proxy) = cfg.http_proxy {
            builder = builder.proxy(reqwest::Proxy::http(proxy).context("parsing http_proxy")?);
        }
        if let Some(ref proxy) = cfg.https_proxy {
            builder = builder.proxy(reqwest::Proxy::https(proxy).context("parsing https_proxy")?);
        }

        let http = builder.build().context("building HTTP client")?;

        let instance_name = match cfg.instance_name {
            Some(ref name) => name.clone(),
            None => short_hostname(),
        };

        Ok(Self {
            http,
            endpoint,
            project_type: cfg.project_type,
            user_name: cfg.user_name.clone(),
            license_key: cfg.license_key.clone(),
            project_name: cfg.project_name.clone(),
            instance_name,
            sampling_interval: cfg
                .project_type
                .is_metric()
                .then(|| sampling_interval_secs.to_string()),
            encoding: cfg.encoding,
            compression: cfg.compression,
            retry: RetryPolicy {
                max_attempts: cfg.max_attempts,
            },
            testing,
        })
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    /// Wraps a chunk in the wire envelope.
    pub fn envelope(&self, chunk: &Chunk) -> Result<Envelope> {
        let data = chunk.rows_json();
        let instance_meta_data =
            serde_json::to_string(chunk.components()).context("serializing instance metadata")?;

        let (metric_data, incident_data, deployment_data) = match self.project_type.kind {
            ProjectKind::Incident => (None, Some(data), None),
            ProjectKind::Deployment => (None, None, Some(data)),
            _ => (Some(data), None, None),
        };

        Ok(Envelope {
            user_name: self.user_name.clone(),
            license_key: self.license_key.clone(),
            project_name: self.project_name.clone(),
            instance_name: self.instance_name.clone(),
            agent_type: self.project_type.agent_type(),
            sampling_interval: self.sampling_interval.clone(),
            metric_data,
            incident_data,
            deployment_data,
            instance_meta_data,
        })
    }

    /// Delivers one chunk, retrying per the configured policy.
    ///
    /// Errors are local failures (serialization, compression); endpoint
    /// failures are reported through [`DeliveryOutcome::Failed`].
    pub async fn deliver(&self, chunk: &Chunk) -> Result<DeliveryReport> {
        let start = Instant::now();
        let envelope = self.envelope(chunk)?;
        let body = self.encode(&envelope)?;
        let bytes = body.len();

        tracing::info!(
            rows = chunk.len(),
            bytes,
            build_ms = chunk.build_time().as_millis() as u64,
            "prepared chunk",
        );

        if self.testing {
            return Ok(DeliveryReport {
                outcome: DeliveryOutcome::DryRun,
                attempts: 0,
                bytes,
            });
        }

        let body = compress(&body, self.compression).context("compressing chunk")?;
        let content_type = match self.encoding {
            PayloadEncoding::Form => "application/x-www-form-urlencoded",
            PayloadEncoding::Json => "application/json",
        };

        let sent = self
            .retry
            .send(self.endpoint.as_str(), || {
                let mut request = self
                    .http
                    .post(self.endpoint.clone())
                    .header(CONTENT_TYPE, content_type)
                    .body(body.clone());
                if let Some(encoding) = content_encoding(self.compression) {
                    request = request.header(CONTENT_ENCODING, encoding);
                }
                request
            })
            .await;

        let outcome = match sent.result {
            Ok(resp) => {
                // Drain body for connection reuse.
                let _ = resp.bytes().await;
                tracing::info!(
                    bytes,
                    attempts = sent.attempts,
                    send_ms = start.elapsed().as_millis() as u64,
                    "delivered chunk",
                );
                DeliveryOutcome::Delivered
            }
            Err(e) => {
                tracing::error!(error = %e, attempts = sent.attempts, rows = chunk.len(), "chunk delivery failed");
                DeliveryOutcome::Failed
            }
        };

        Ok(DeliveryReport {
            outcome,
            attempts: sent.attempts,
            bytes,
        })
    }

    fn encode(&self, envelope: &Envelope) -> Result<Vec<u8>> {
        match self.encoding {
            PayloadEncoding::Form => {
                let pairs = envelope.form_pairs()?;
                let body = url::form_urlencoded::Serializer::new(String::new())
                    .extend_pairs(pairs)
                    .finish();
                Ok(body.into_bytes())
            }
            PayloadEncoding::Json => serde_json::to_vec(envelope).context("serializing envelope"),
        }
    }
}

/// Hostname up to the first dot.
fn short_hostname() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .and_then(|h| h.split('.').next().map(str::to_string))
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}

// --- Compression ---

fn compress(data: &[u8], compression: Compression) -> Result<Vec<u8>> {
    match compression {
        Compression::None => Ok(data.to_vec()),
        Compression::Gzip => compress_gzip(data),
    }
}

fn content_encoding(compression: Compression) -> Option<&'static str> {
    match compression {
        Compression::None => None,
        Compression::Gzip => Some("gzip"),
    }
}

fn compress_gzip(data: &[u8]) -> Result<Vec<u8>> {
    use flate2::write::GzEncoder;

    let mut encoder = GzEncoder::new(Vec::new(), flate2::Compression::default());
    encoder.write_all(data).context("gzip write")?;
    encoder.finish().context("gzip finish")
}
