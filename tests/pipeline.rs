use std::collections::HashMap;
use std::path::Path;

use metricrelay::agent::Agent;
use metricrelay::cache::SqliteAliasCache;
use metricrelay::config::Config;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn write_config(dir: &Path, prometheus: &str, delivery: &str) -> Config {
    let yaml = format!(
        r#"
delivery:
  user_name: alice
  license_key: secret
  project_name: infra
  sampling_interval: 1m
  chunk_rows: 2
  url: {delivery}
  instance_name: relay-host
  timeout: 2s
fields:
  component_field: job
source:
  type: prometheus
  uri: {prometheus}
"#
    );
    let file = dir.join("prometheus.yaml");
    std::fs::write(&file, yaml).expect("write config");
    Config::load(&file).expect("load config")
}

async fn mount_prometheus(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/api/v1/label/__name__/values"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "status": "success",
            "data": ["cpu", "mem"]
        })))
        .mount(server)
        .await;

    for (metric, base) in [("cpu", 10), ("mem", 70)] {
        let result: Vec<serde_json::Value> = ["h1:9100", "h2:9100", "h3:9100"]
            .iter()
            .enumerate()
            .map(|(i, instance)| {
                serde_json::json!({
                    "metric": {"instance": instance, "job": "node"},
                    "value": [1700000000, (base + i).to_string()]
                })
            })
            .collect();

        Mock::given(method("GET"))
            .and(path("/api/v1/query"))
            .and(query_param("query", metric))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "status": "success",
                "data": {"resultType": "vector", "result": result}
            })))
            .mount(server)
            .await;
    }
}

fn delivered_rows(requests: &[wiremock::Request]) -> Vec<Vec<serde_json::Value>> {
    requests
        .iter()
        .map(|r| {
            let form: HashMap<String, String> =
                url::form_urlencoded::parse(&r.body).into_owned().collect();
            assert_eq!(form["userName"], "alice");
            assert_eq!(form["instanceName"], "relay-host");
            assert_eq!(form["samplingInterval"], "60");
            serde_json::from_str(&form["metricData"]).expect("metric data")
        })
        .collect()
}

#[tokio::test]
async fn test_prometheus_to_delivery() {
    let prometheus = MockServer::start().await;
    let ingest = MockServer::start().await;
    mount_prometheus(&prometheus).await;

    Mock::given(method("POST"))
        .and(path("/customprojectrawdata"))
        .respond_with(ResponseTemplate::new(200))
        .expect(2)
        .mount(&ingest)
        .await;

    let dir = tempfile::tempdir().expect("tempdir");
    let cache = SqliteAliasCache::open(&dir.path().join("cache.db")).expect("cache");
    cache.set_alias("h2-9100", "web-2").expect("alias");
    drop(cache);

    let cfg = write_config(dir.path(), &prometheus.uri(), &ingest.uri());
    let summary = Agent::new(&cfg, false).expect("agent").run().await;

    assert_eq!(summary.entries_parsed, 6);
    assert_eq!(summary.entries_skipped, 0);
    assert_eq!(summary.rows_sent, 3);
    assert_eq!(summary.chunks_sent, 2);
    assert_eq!(summary.chunks_failed, 0);

    let requests = ingest.received_requests().await.expect("recorded requests");
    let chunks = delivered_rows(&requests);
    assert_eq!(chunks.iter().map(Vec::len).collect::<Vec<_>>(), vec![2, 1]);

    let first = &chunks[0][0];
    assert_eq!(first["timestamp"], "1700000000000");
    assert_eq!(first["cpu[h1-9100]"], "10");
    assert_eq!(first["mem[h1-9100]"], "70");

    let second = &chunks[0][1];
    assert_eq!(second["cpu[web-2]"], "11");
    assert_eq!(second["mem[web-2]"], "71");
}

#[tokio::test]
async fn test_failed_delivery_is_counted() {
    let prometheus = MockServer::start().await;
    let ingest = MockServer::start().await;
    mount_prometheus(&prometheus).await;

    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503))
        .expect(6)
        .mount(&ingest)
        .await;

    let dir = tempfile::tempdir().expect("tempdir");
    let cfg = write_config(dir.path(), &prometheus.uri(), &ingest.uri());
    let summary = Agent::new(&cfg, false).expect("agent").run().await;

    assert_eq!(summary.chunks_sent, 0);
    assert_eq!(summary.chunks_failed, 2);
    assert_eq!(summary.rows_sent, 0);
}

#[tokio::test]
async fn test_testing_mode_sends_nothing() {
    let prometheus = MockServer::start().await;
    let ingest = MockServer::start().await;
    mount_prometheus(&prometheus).await;

    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&ingest)
        .await;

    let dir = tempfile::tempdir().expect("tempdir");
    let cfg = write_config(dir.path(), &prometheus.uri(), &ingest.uri());
    let summary = Agent::new(&cfg, true).expect("agent").run().await;

    assert_eq!(summary.chunks_sent, 2);
    assert_eq!(summary.rows_sent, 3);
}

#[tokio::test]
async fn test_history_replay_fetches_each_slice() {
    let prometheus = MockServer::start().await;
    let ingest = MockServer::start().await;
    mount_prometheus(&prometheus).await;

    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&ingest)
        .await;

    let dir = tempfile::tempdir().expect("tempdir");
    let mut cfg = write_config(dir.path(), &prometheus.uri(), &ingest.uri());
    cfg.history = Some(metricrelay::config::HistoryRange {
        start: chrono::DateTime::from_timestamp(1700000000, 0).expect("start"),
        end: chrono::DateTime::from_timestamp(1700000180, 0).expect("end"),
    });

    let summary = Agent::new(&cfg, false).expect("agent").run().await;

    // Three one-minute slices, each returning the same six samples.
    assert_eq!(summary.entries_parsed, 18);
    assert_eq!(summary.rows_sent, 9);

    let queries = prometheus
        .received_requests()
        .await
        .expect("recorded requests")
        .iter()
        .filter(|r| r.url.path() == "/api/v1/query")
        .count();
    assert_eq!(queries, 6);
}

#[tokio::test]
async fn test_discovery_failure_ends_run_without_sending() {
    let prometheus = MockServer::start().await;
    let ingest = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/api/v1/label/__name__/values"))
        .respond_with(ResponseTemplate::new(503))
        .expect(3)
        .mount(&prometheus)
        .await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&ingest)
        .await;

    let dir = tempfile::tempdir().expect("tempdir");
    let cfg = write_config(dir.path(), &prometheus.uri(), &ingest.uri());
    let summary = Agent::new(&cfg, false).expect("agent").run().await;

    assert_eq!(summary.entries_parsed, 0);
    assert_eq!(summary.chunks_sent, 0);
    assert_eq!(summary.chunks_failed, 0);
}
