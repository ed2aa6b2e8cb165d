use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{bail, Context, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use url::Url;

use crate::config::ZabbixConfig;
use crate::sample::sanitize::sanitize_metric_key;
use crate::sample::{Labels, RawSample};
use crate::sink::retry::RetryPolicy;

use super::{http_client, FetchWindow, Source};

/// Item value types that carry numbers: float and unsigned integer.
const NUMERIC_VALUE_TYPES: [u8; 2] = [0, 3];

/// Zabbix JSON-RPC client.
pub struct ZabbixClient {
    http: reqwest::Client,
    endpoint: Url,
    cfg: ZabbixConfig,
    retry: RetryPolicy,
    request_id: AtomicU64,
    auth: Option<String>,
    /// hostid -> visible host name.
    hosts: HashMap<String, String>,
    /// itemid -> numeric item.
    items: HashMap<String, Item>,
}

impl ZabbixClient {
    pub fn new(cfg: ZabbixConfig, retry: RetryPolicy) -> Result<Self> {
        let endpoint = Url::parse(&cfg.url).with_context(|| format!("parsing zabbix url {}", cfg.url))?;
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
            request_id: AtomicU64::new(1),
            auth: None,
            hosts: HashMap::new(),
            items: HashMap::new(),
        })
    }

    /// Performs one JSON-RPC call and decodes its `result`.
    async fn call<T: DeserializeOwned>(&self, method: &str, params: Value) -> Result<T> {
        let request = RpcRequest {
            jsonrpc: "2.0",
            method,
            params,
            id: self.request_id.fetch_add(1, Ordering::Relaxed),
            auth: self.auth.as_deref(),
        };

        let sent = self
            .retry
            .send(self.endpoint.as_str(), || {
                self.http.post(self.endpoint.clone()).json(&request)
            })
            .await;

        let response: RpcResponse<T> = sent
            .result
            .with_context(|| format!("calling {method}"))?
            .json()
            .await
            .with_context(|| format!("decoding {method} response"))?;

        if let Some(err) = response.error {
            bail!("{method} failed ({}): {} {}", err.code, err.message, err.data);
        }

        response
            .result
            .with_context(|| format!("{method} returned no result"))
    }

    fn item_ids(&self) -> Vec<&str> {
        self.items.keys().map(String::as_str).collect()
    }

    fn host_ids(&self) -> Vec<&str> {
        self.hosts.keys().map(String::as_str).collect()
    }

    /// Converts `(itemid, clock, value)` readings into samples.
    fn to_samples<'a>(&self, readings: impl Iterator<Item = Reading<'a>>) -> Vec<RawSample> {
        let mut samples = Vec::new();

        for r in readings {
            let Some(item) = self.items.get(r.item_id) else {
                continue;
            };

            let timestamp: f64 = match r.clock.parse() {
                Ok(ts) => ts,
                Err(e) => {
                    tracing::warn!(item = %r.item_id, clock = r.clock, error = %e, "invalid zabbix clock");
                    continue;
                }
            };

            let mut labels = Labels::new();
            labels.insert("itemid", item.itemid.clone());
            labels.insert("hostid", item.hostid.clone());
            labels.insert("key_", item.key.clone());
            if let Some(host) = self.hosts.get(&item.hostid) {
                labels.insert("host", host.clone());
            }

            samples.push(RawSample {
                labels,
                metric: sanitize_metric_key(&item.name),
                value: r.value.to_string(),
                timestamp,
            });
        }

        samples
    }
}

impl Source for ZabbixClient {
    async fn prepare(&mut self) -> Result<()> {
        self.auth = None;
        let token: String = self
            .call(
                "user.login",
                json!({"username": self.cfg.user, "password": self.cfg.password}),
            )
            .await
            .context("logging in to zabbix")?;
        self.auth = Some(token);

        let mut params = Map::new();
        params.insert("output".into(), json!("extend"));
        if !self.cfg.host_groups.is_empty() {
            params.insert("filter".into(), json!({"name": self.cfg.host_groups}));
        }
        let groups: Vec<HostGroup> = self.call("hostgroup.get", Value::Object(params)).await?;
        let group_ids: Vec<&str> = groups.iter().map(|g| g.groupid.as_str()).collect();
        tracing::info!(groups = ?groups.iter().map(|g| &g.name).collect::<Vec<_>>(), "zabbix host groups");

        let mut params = Map::new();
        params.insert("output".into(), json!("extend"));
        params.insert("groupids".into(), json!(group_ids));
        if !self.cfg.hosts.is_empty() {
            params.insert("filter".into(), json!({"host": self.cfg.hosts}));
        }
        let hosts: Vec<Host> = self.call("host.get", Value::Object(params)).await?;
        if hosts.is_empty() {
            bail!("hosts list is empty");
        }
        self.hosts = hosts.into_iter().map(|h| (h.hostid, h.name)).collect();
        tracing::info!(hosts = self.hosts.len(), "zabbix hosts");

        let mut params = Map::new();
        params.insert("output".into(), json!("extend"));
        params.insert("hostids".into(), json!(self.host_ids()));

        if !self.cfg.applications.is_empty() {
            let apps: Vec<Application> = self
                .call(
                    "application.get",
                    json!({
                        "output": "extend",
                        "hostids": self.host_ids(),
                        "filter": {"name": self.cfg.applications},
                    }),
                )
                .await?;
            let app_ids: Vec<&str> = apps.iter().map(|a| a.applicationid.as_str()).collect();
            params.insert("applicationids".into(), json!(app_ids));
        }

        let items: Vec<Item> = self.call("item.get", Value::Object(params)).await?;
        self.items = items
            .into_iter()
            .filter(|i| {
                i.value_type
                    .parse::<u8>()
                    .is_ok_and(|t| NUMERIC_VALUE_TYPES.contains(&t))
            })
            .map(|i| (i.itemid.clone(), i))
            .collect();
        if self.items.is_empty() {
            bail!("metric list is empty");
        }
        tracing::info!(items = self.items.len(), "zabbix numeric items");

        Ok(())
    }

    async fn fetch(&self, window: &FetchWindow) -> Result<Vec<RawSample>> {
        let samples = match window {
            FetchWindow::Live { .. } => {
                let latest: Vec<Item> = self
                    .call(
                        "item.get",
                        json!({
                            "output": ["itemid", "hostid", "lastclock", "lastvalue"],
                            "itemids": self.item_ids(),
                        }),
                    )
                    .await?;

                self.to_samples(latest.iter().map(|i| Reading {
                    item_id: &i.itemid,
                    clock: &i.lastclock,
                    value: &i.lastvalue,
                }))
            }
            FetchWindow::Slice(slice) => {
                let mut history = Vec::new();
                for history_type in NUMERIC_VALUE_TYPES {
                    let mut batch: Vec<HistoryEntry> = self
                        .call(
                            "history.get",
                            json!({
                                "output": "extend",
                                "history": history_type,
                                "hostids": self.host_ids(),
                                "itemids": self.item_ids(),
                                "time_from": slice.start.timestamp(),
                                // time_till is inclusive.
                                "time_till": slice.end.timestamp() - 1,
                            }),
                        )
                        .await?;
                    history.append(&mut batch);
                }

                self.to_samples(history.iter().map(|h| Reading {
                    item_id: &h.itemid,
                    clock: &h.clock,
                    value: &h.value,
                }))
            }
        };

        tracing::info!(samples = samples.len(), "fetched zabbix samples");
        Ok(samples)
    }
}

struct Reading<'a> {
    item_id: &'a str,
    clock: &'a str,
    value: &'a str,
}

// --- JSON-RPC structures ---

#[derive(Serialize)]
struct RpcRequest<'a> {
    jsonrpc: &'static str,
    method: &'a str,
    params: Value,
    id: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    auth: Option<&'a str>,
}

#[derive(Deserialize)]
struct RpcResponse<T> {
    result: Option<T>,
    error: Option<RpcError>,
}

#[derive(Deserialize)]
struct RpcError {
    code: i64,
    message: String,
    #[serde(default)]
    data: String,
}

#[derive(Deserialize)]
struct HostGroup {
    groupid: String,
    #[serde(default)]
    name: String,
}

#[derive(Deserialize)]
struct Host {
    hostid: String,
    #[serde(default)]
    name: String,
}

#[derive(Deserialize)]
struct Application {
    applicationid: String,
}

#[derive(Debug, Clone, Deserialize)]
struct Item {
    itemid: String,
    #[serde(default)]
    hostid: String,
    #[serde(default)]
    name: String,
    #[serde(default, rename = "key_")]
    key: String,
    #[serde(default)]
    value_type: String,
    #[serde(default)]
    lastclock: String,
    #[serde(default)]
    lastvalue: String,
}

#[derive(Deserialize)]
struct HistoryEntry {
    itemid: String,
    clock: String,
    value: String,
}
