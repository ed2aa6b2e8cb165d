pub mod nfdump;
pub mod prometheus;
pub mod sysdig;
pub mod zabbix;

use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};

use crate::agent::slices::TimeSlice;
use crate::config::{Config, SourceConfig};
use crate::sample::RawSample;

pub use self::nfdump::NfdumpClient;
pub use self::prometheus::PrometheusClient;
pub use self::sysdig::SysdigClient;
pub use self::zabbix::ZabbixClient;

/// Time span one fetch covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchWindow {
    /// Latest data as of `now`.
    Live { now: DateTime<Utc> },
    /// One replayed history slice.
    Slice(TimeSlice),
}

/// Upstream monitoring backend.
pub trait Source: Send + Sync {
    /// One-time discovery (login, metric or item lookup) before fetching.
    fn prepare(&mut self) -> impl std::future::Future<Output = Result<()>> + Send;

    /// Fetches the raw samples for one window.
    fn fetch(
        &self,
        window: &FetchWindow,
    ) -> impl std::future::Future<Output = Result<Vec<RawSample>>> + Send;
}

/// Configured source client.
pub enum SourceClient {
    Prometheus(PrometheusClient),
    Sysdig(SysdigClient),
    Zabbix(ZabbixClient),
    Nfdump(NfdumpClient),
}

impl SourceClient {
    pub fn new(cfg: &Config) -> Result<Self> {
        let sampling = cfg.sampling_interval();
        let retry = cfg.retry_policy();

        Ok(match cfg.source {
            SourceConfig::Prometheus(ref c) => {
                Self::Prometheus(PrometheusClient::new(c.clone(), sampling, retry)?)
            }
            SourceConfig::Sysdig(ref c) => Self::Sysdig(SysdigClient::new(c.clone(), retry)?),
            SourceConfig::Zabbix(ref c) => Self::Zabbix(ZabbixClient::new(c.clone(), retry)?),
            SourceConfig::Nfdump(ref c) => Self::Nfdump(NfdumpClient::new(c.clone(), sampling)?),
        })
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Prometheus(_) => "prometheus",
            Self::Sysdig(_) => "sysdig",
            Self::Zabbix(_) => "zabbix",
            Self::Nfdump(_) => "nfdump",
        }
    }
}

impl Source for SourceClient {
    async fn prepare(&mut self) -> Result<()> {
        match self {
            Self::Prometheus(s) => s.prepare().await,
            Self::Sysdig(s) => s.prepare().await,
            Self::Zabbix(s) => s.prepare().await,
            Self::Nfdump(s) => s.prepare().await,
        }
    }

    async fn fetch(&self, window: &FetchWindow) -> Result<Vec<RawSample>> {
        match self {
            Self::Prometheus(s) => s.fetch(window).await,
            Self::Sysdig(s) => s.fetch(window).await,
            Self::Zabbix(s) => s.fetch(window).await,
            Self::Nfdump(s) => s.fetch(window).await,
        }
    }
}

/// Builds the HTTP client shared by a source's requests.
pub(crate) fn http_client(
    timeout: Duration,
    http_proxy: Option<&str>,
    https_proxy: Option<&str>,
) -> Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder().timeout(timeout);

    if let Some(proxy) = http_proxy {
        builder = builder.proxy(reqwest::Proxy::http(proxy).context("parsing http_proxy")?);
    }
    if let Some(proxy) = https_proxy {
        builder = builder.proxy(reqwest::Proxy::https(proxy).context("parsing https_proxy")?);
    }

    builder.build().context("building HTTP client")
}
