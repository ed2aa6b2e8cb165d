use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;

use crate::config::NfdumpConfig;
use crate::sample::{Labels, RawSample};

use super::{FetchWindow, Source};

/// Aggregation key passed to `-A`.
const AGGREGATION: &str = "proto,srcip,srcport,dstip,dstport";

/// Flow counters emitted per CSV row: (metric name, CSV column).
const FLOW_METRICS: [(&str, &str); 5] = [
    ("Duration", "td"),
    ("InPackets", "ipkt"),
    ("InBytes", "ibyt"),
    ("OutPackets", "opkt"),
    ("OutBytes", "obyt"),
];

/// Runs `nfdump` over rotated capture files and parses its CSV output.
pub struct NfdumpClient {
    cfg: NfdumpConfig,
    sampling: Duration,
    tz: Tz,
}

impl NfdumpClient {
    pub fn new(cfg: NfdumpConfig, sampling: Duration) -> Result<Self> {
        let tz: Tz = cfg
            .timezone
            .parse()
            .map_err(|e| anyhow::anyhow!("unknown nfdump timezone {:?}: {e}", cfg.timezone))?;
        Ok(Self { cfg, sampling, tz })
    }

    /// Capture files covering `window`, relative to the profile channels.
    ///
    /// Live fetches read the most recent completed files spanning one
    /// sampling interval; replay slices read every file rotated within the
    /// slice.
    pub fn capture_files(&self, window: &FetchWindow) -> Vec<String> {
        let interval = self.cfg.file_interval.as_secs().max(1) as i64;
        let floor = |t: DateTime<Utc>| t.timestamp() - t.timestamp().rem_euclid(interval);

        let starts: Vec<i64> = match window {
            FetchWindow::Live { now } => {
                let count = (self.sampling.as_secs() as i64 / interval).max(1);
                let current = floor(*now);
                (1..=count).rev().map(|k| current - k * interval).collect()
            }
            FetchWindow::Slice(slice) => {
                let end = slice.end.timestamp();
                let mut t = floor(slice.start);
                let mut out = Vec::new();
                while t < end {
                    out.push(t);
                    t += interval;
                }
                out
            }
        };

        starts
            .into_iter()
            .filter_map(|secs| DateTime::from_timestamp(secs, 0))
            .map(|t| {
                let local = t.with_timezone(&self.tz);
                format!(
                    "{}/nfcapd.{}",
                    local.format("%Y/%m/%d"),
                    local.format("%Y%m%d%H%M")
                )
            })
            .collect()
    }

    async fn dump(&self, file: &str) -> Result<Vec<u8>> {
        let profile = format!(
            "{}/{}",
            self.cfg.profile_path.display(),
            self.cfg.channels.join(":")
        );

        let output = tokio::process::Command::new(&self.cfg.command)
            .args(["-M", &profile, "-r", file, "-o", "csv", "-a", "-A", AGGREGATION, "-m"])
            .kill_on_drop(true)
            .output()
            .await
            .with_context(|| format!("running {}", self.cfg.command))?;

        if !output.status.success() {
            bail!(
                "{} exited with {}: {}",
                self.cfg.command,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        Ok(output.stdout)
    }
}

impl Source for NfdumpClient {
    async fn prepare(&mut self) -> Result<()> {
        let profile = &self.cfg.profile_path;
        if !profile.is_dir() {
            tracing::warn!(path = %profile.display(), "nfdump profile directory not found");
        }
        Ok(())
    }

    async fn fetch(&self, window: &FetchWindow) -> Result<Vec<RawSample>> {
        let mut samples = Vec::new();

        for file in self.capture_files(window) {
            let csv = match self.dump(&file).await {
                Ok(csv) => csv,
                Err(e) => {
                    tracing::warn!(file = %file, error = %e, "reading capture file failed");
                    continue;
                }
            };

            match parse_csv(&csv, &self.cfg.timestamp_column, self.tz) {
                Ok(mut parsed) => {
                    tracing::debug!(file = %file, samples = parsed.len(), "parsed capture file");
                    samples.append(&mut parsed);
                }
                Err(e) => tracing::warn!(file = %file, error = %e, "parsing nfdump output failed"),
            }
        }

        tracing::info!(samples = samples.len(), "fetched nfdump samples");
        Ok(samples)
    }
}

/// Parses `nfdump -o csv` output into flow samples.
///
/// Rows shorter than the header (the trailing summary block) are skipped.
/// Columns are decoded lossily so stray bytes in one field do not drop the
/// flow.
pub fn parse_csv(data: &[u8], timestamp_column: &str, tz: Tz) -> Result<Vec<RawSample>> {
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(data);

    let headers = reader.headers().context("reading csv header")?.clone();
    let column = |name: &str| {
        headers
            .iter()
            .position(|h| h == name)
            .with_context(|| format!("csv column {name:?} missing"))
    };

    let ts_idx = column(timestamp_column)?;
    let sa = column("sa")?;
    let da = column("da")?;
    let sp = column("sp")?;
    let dp = column("dp")?;
    let pr = column("pr")?;
    let metric_idx = FLOW_METRICS
        .iter()
        .map(|(metric, col)| column(*col).map(|i| (*metric, i)))
        .collect::<Result<Vec<_>>>()?;

    let mut samples = Vec::new();

    for record in reader.byte_records() {
        let record = match record {
            Ok(record) => record,
            Err(e) => {
                tracing::warn!(error = %e, "skipping unreadable csv record");
                continue;
            }
        };
        if record.len() < headers.len() {
            continue;
        }

        let field = |i: usize| String::from_utf8_lossy(record.get(i).unwrap_or_default());

        let timestamp = match parse_timestamp(&field(ts_idx), tz) {
            Some(ts) => ts,
            None => {
                tracing::debug!(value = %field(ts_idx), "skipping flow with unparseable timestamp");
                continue;
            }
        };

        let flow = format!(
            "{}:{}_{}:{}_{}",
            field(sa),
            field(sp),
            field(da),
            field(dp),
            field(pr)
        );

        let mut labels = Labels::new();
        labels.insert("flow", flow);
        labels.insert("sa", field(sa));
        labels.insert("da", field(da));
        labels.insert("sp", field(sp));
        labels.insert("dp", field(dp));
        labels.insert("pr", field(pr));

        for (metric, idx) in &metric_idx {
            samples.push(RawSample {
                labels: labels.clone(),
                metric: metric.to_string(),
                value: field(*idx).into_owned(),
                timestamp: timestamp as f64,
            });
        }
    }

    Ok(samples)
}

fn parse_timestamp(raw: &str, tz: Tz) -> Option<i64> {
    let naive = NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f").ok()?;
    tz.from_local_datetime(&naive)
        .earliest()
        .map(|t| t.timestamp())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::slices::TimeSlice;

    const CSV: &str = "\
ts,te,td,sa,da,sp,dp,pr,flg,fwd,stos,ipkt,ibyt,opkt,obyt
2024-03-01 10:00:00,2024-03-01 10:00:05,5.120,10.0.0.1,10.0.0.2,51000,443,TCP,.AP.SF,0,0,12,3400,10,9800
2024-03-01 10:01:00,2024-03-01 10:01:02.250,2.000,10.0.0.3,8.8.8.8,53000,53,UDP,......,0,0,1,70,1,120
Summary
flows,bytes,packets,avg_bps,avg_pps,avg_bpp
2,13390,24,0,0,0
";

    fn config() -> NfdumpConfig {
        serde_yaml::from_str("profile_path: /var/cache/nfdump/profiles-data/live\nchannels: [http, dns]\n")
            .expect("parse nfdump config")
    }

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(secs, 0).expect("timestamp")
    }

    #[test]
    fn test_parse_csv_skips_summary() {
        let samples = parse_csv(CSV.as_bytes(), "te", chrono_tz::UTC).expect("parse");
        assert_eq!(samples.len(), 10);

        let first = &samples[0];
        assert_eq!(first.metric, "Duration");
        assert_eq!(first.value, "5.120");
        assert_eq!(first.labels.get("flow"), Some("10.0.0.1:51000_10.0.0.2:443_TCP"));
        assert_eq!(first.timestamp, 1709287205.0);

        let in_bytes = samples
            .iter()
            .find(|s| s.metric == "InBytes" && s.labels.get("pr") == Some("UDP"))
            .expect("udp in bytes");
        assert_eq!(in_bytes.value, "70");
        assert_eq!(in_bytes.timestamp, 1709287262.0);
    }

    #[test]
    fn test_parse_csv_keeps_rows_around_bad_bytes() {
        let mut data = Vec::new();
        data.extend_from_slice(b"ts,te,td,sa,da,sp,dp,pr,flg,fwd,stos,ipkt,ibyt,opkt,obyt\n");
        data.extend_from_slice(b"2024-03-01 10:00:00,2024-03-01 10:00:05,5.120,10.0.0.1,10.0.0.2,51000,443,TCP,.AP.SF,0,0,12,3400,10,9800\n");
        data.extend_from_slice(b"2024-03-01 10:00:30,2024-03-01 10:00:31,1.000,10.0.0.5,10.0.0.6,40000,80,TCP,\xff\xfe,0,0,3,180,2,90\n");
        data.extend_from_slice(b"2024-03-01 10:01:00,2024-03-01 10:01:02,2.000,10.0.0.3,8.8.8.8,53000,53,UDP,......,0,0,1,70,1,120\n");

        let samples = parse_csv(&data, "te", chrono_tz::UTC).expect("parse");
        assert_eq!(samples.len(), 15);

        let flows: Vec<&str> = samples
            .iter()
            .filter(|s| s.metric == "InBytes")
            .filter_map(|s| s.labels.get("flow"))
            .collect();
        assert_eq!(
            flows,
            vec![
                "10.0.0.1:51000_10.0.0.2:443_TCP",
                "10.0.0.5:40000_10.0.0.6:80_TCP",
                "10.0.0.3:53000_8.8.8.8:53_UDP",
            ]
        );
    }

    #[test]
    fn test_parse_csv_applies_timezone() {
        let tz: Tz = "Europe/Berlin".parse().expect("tz");
        let samples = parse_csv(CSV.as_bytes(), "te", tz).expect("parse");
        // CET is UTC+1 in March before the DST switch.
        assert_eq!(samples[0].timestamp, 1709287205.0 - 3600.0);
    }

    #[test]
    fn test_parse_csv_missing_column() {
        let err = parse_csv(b"ts,te\n", "te", chrono_tz::UTC).expect_err("should fail");
        assert!(err.to_string().contains("\"sa\""));
    }

    #[test]
    fn test_capture_files_live() {
        let client = NfdumpClient::new(config(), Duration::from_secs(600)).expect("client");
        // 2024-03-01 10:12:30 UTC
        let files = client.capture_files(&FetchWindow::Live { now: at(1709287950) });
        assert_eq!(
            files,
            vec![
                "2024/03/01/nfcapd.202403011000".to_string(),
                "2024/03/01/nfcapd.202403011005".to_string(),
            ]
        );
    }

    #[test]
    fn test_capture_files_slice() {
        let client = NfdumpClient::new(config(), Duration::from_secs(600)).expect("client");
        let slice = TimeSlice {
            start: at(1709287320), // 10:02
            end: at(1709287800),   // 10:10
        };
        let files = client.capture_files(&FetchWindow::Slice(slice));
        assert_eq!(
            files,
            vec![
                "2024/03/01/nfcapd.202403011000".to_string(),
                "2024/03/01/nfcapd.202403011005".to_string(),
            ]
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_fetch_runs_command() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().expect("tempdir");
        let csv_path = dir.path().join("out.csv");
        std::fs::write(&csv_path, CSV).expect("write csv");

        let script = dir.path().join("fake-nfdump");
        std::fs::write(&script, format!("#!/bin/sh\ncat {}\n", csv_path.display())).expect("write script");
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).expect("chmod");

        let mut cfg = config();
        cfg.command = script.display().to_string();
        let client = NfdumpClient::new(cfg, Duration::from_secs(300)).expect("client");

        let samples = client
            .fetch(&FetchWindow::Live { now: at(1709287950) })
            .await
            .expect("fetch");
        assert_eq!(samples.len(), 10);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_fetch_failed_command_yields_nothing() {
        let mut cfg = config();
        cfg.command = "false".to_string();
        let client = NfdumpClient::new(cfg, Duration::from_secs(300)).expect("client");

        let samples = client
            .fetch(&FetchWindow::Live { now: at(1709287950) })
            .await
            .expect("fetch");
        assert!(samples.is_empty());
    }
}
