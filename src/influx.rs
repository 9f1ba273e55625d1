//! Timeseries store client and writer.
//!
//! Speaks the InfluxDB v2 HTTP API directly: line protocol for writes
//! (millisecond precision) and Flux for queries, decoding the CSV response.
//! The writer appends one point per pair and one per fiat currency for each
//! run; history is best-effort, the snapshot store stays authoritative.

use crate::config::Config;
use crate::models::{FiatRateMap, TickerBatch};
use anyhow::{bail, Context, Result};
use futures_util::{stream, StreamExt};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Concurrent point writes per run.
const WRITE_CONCURRENCY: usize = 5;

/// One timeseries point, ready for line-protocol encoding.
#[derive(Debug, Clone)]
pub struct Point {
    pub measurement: String,
    pub tags: Vec<(String, String)>,
    pub fields: Vec<(String, f64)>,
    pub timestamp_ms: i64,
}

impl Point {
    fn to_line(&self) -> String {
        let mut line = escape_measurement(&self.measurement);
        for (key, value) in &self.tags {
            if value.is_empty() {
                continue;
            }
            line.push(',');
            line.push_str(&escape_tag(key));
            line.push('=');
            line.push_str(&escape_tag(value));
        }
        line.push(' ');
        let fields: Vec<String> = self
            .fields
            .iter()
            .map(|(key, value)| format!("{}={}", escape_tag(key), value))
            .collect();
        line.push_str(&fields.join(","));
        line.push(' ');
        line.push_str(&self.timestamp_ms.to_string());
        line
    }
}

fn escape_measurement(s: &str) -> String {
    s.replace(',', "\\,").replace(' ', "\\ ")
}

fn escape_tag(s: &str) -> String {
    s.replace(',', "\\,").replace('=', "\\=").replace(' ', "\\ ")
}

fn escape_flux_string(s: &str) -> String {
    s.replace('\\', "\\\\").replace('"', "\\\"")
}

#[derive(Clone)]
pub struct InfluxClient {
    http: reqwest::Client,
    url: String,
    token: String,
    org: String,
    bucket: String,
}

impl InfluxClient {
    pub fn new(config: &Config) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("failed to build influx client")?;
        Ok(Self {
            http,
            url: config.influxdb_url.clone(),
            token: config.influxdb_token.clone(),
            org: config.influxdb_org.clone(),
            bucket: config.influxdb_bucket.clone(),
        })
    }

    fn authorized(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        if self.token.is_empty() {
            builder
        } else {
            builder.header("Authorization", format!("Token {}", self.token))
        }
    }

    /// Write a single point with millisecond precision.
    pub async fn write_point(&self, point: &Point) -> Result<()> {
        let url = format!(
            "{}/api/v2/write?org={}&bucket={}&precision=ms",
            self.url, self.org, self.bucket
        );
        let response = self
            .authorized(self.http.post(&url))
            .header("Content-Type", "text/plain; charset=utf-8")
            .body(point.to_line())
            .send()
            .await
            .context("influx write request failed")?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            bail!("influx write returned {}: {}", status, body);
        }
        Ok(())
    }

    /// Build a Flux range query over one measurement, mirroring the shape
    /// the read API needs: measurement filter, tag filters, optional pivot
    /// of fields into columns.
    pub fn range_query(
        &self,
        measurement: &str,
        time_start: &str,
        time_stop: Option<&str>,
        tags: &[(&str, &str)],
        pivot: bool,
    ) -> String {
        let mut query = format!(
            "from(bucket: \"{}\") |> range(start: {}, stop: {})",
            escape_flux_string(&self.bucket),
            time_start,
            time_stop.unwrap_or("now()"),
        );
        query.push_str(&format!(
            " |> filter(fn: (r) => (r._measurement == \"{}\"))",
            escape_flux_string(measurement)
        ));
        for (tag, value) in tags {
            query.push_str(&format!(
                " |> filter(fn: (r) => (r.{} == \"{}\"))",
                tag,
                escape_flux_string(value)
            ));
        }
        if pivot {
            query.push_str(
                " |> pivot(rowKey:[\"_time\"], columnKey: [\"_field\"], valueColumn: \"_value\")",
            );
        }
        query
    }

    /// Run a Flux query, returning one map per row.
    pub async fn query(&self, flux: &str) -> Result<Vec<BTreeMap<String, String>>> {
        let url = format!("{}/api/v2/query?org={}", self.url, self.org);
        debug!(query = flux, "running influx query");
        let response = self
            .authorized(self.http.post(&url))
            .header("Accept", "application/csv")
            .json(&json!({
                "query": flux,
                "type": "flux",
                "dialect": {"header": true, "annotations": []},
            }))
            .send()
            .await
            .context("influx query request failed")?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            bail!("influx query returned {}: {}", status, body);
        }
        let body = response.text().await.context("failed to read influx response")?;
        Ok(parse_csv_tables(&body))
    }

    /// Cheap liveness probe: a 5-second range scan over a measurement.
    pub async fn health(&self, measurement: &str) -> Result<()> {
        let query = self.range_query(measurement, "-5s", None, &[], false);
        self.query(&query).await.map(|_| ())
    }
}

/// Decode CSV tables into row maps. Annotation lines (leading `#`) are
/// skipped; an empty line ends the current table and the next non-empty
/// line is a new header. Columns with empty names are ignored.
fn parse_csv_tables(body: &str) -> Vec<BTreeMap<String, String>> {
    let mut rows = Vec::new();
    let mut header: Option<Vec<String>> = None;
    for line in body.lines() {
        let line = line.trim_end_matches('\r');
        if line.is_empty() {
            header = None;
            continue;
        }
        if line.starts_with('#') {
            continue;
        }
        let cells: Vec<&str> = line.split(',').collect();
        match &header {
            None => header = Some(cells.into_iter().map(|c| c.to_string()).collect()),
            Some(columns) => {
                let mut row = BTreeMap::new();
                for (column, cell) in columns.iter().zip(cells) {
                    if !column.is_empty() {
                        row.insert(column.clone(), cell.to_string());
                    }
                }
                rows.push(row);
            }
        }
    }
    rows
}

/// Appends one run's batch to the pairs and fiat measurements.
#[derive(Clone)]
pub struct InfluxUpdater {
    client: Arc<InfluxClient>,
    pairs_measurement: String,
    fiat_measurement: String,
}

impl InfluxUpdater {
    pub fn new(client: Arc<InfluxClient>, config: &Config) -> Self {
        Self {
            client,
            pairs_measurement: config.measurement_pairs.clone(),
            fiat_measurement: config.measurement_fiat.clone(),
        }
    }

    /// Write all points for one run with bounded parallelism. Individual
    /// point failures are logged and swallowed; the snapshot store is the
    /// authoritative record.
    pub async fn write(
        &self,
        exchange_id: i64,
        batch: &TickerBatch,
        fiat_pairs: &FiatRateMap,
    ) -> Result<()> {
        let timestamp_ms = chrono::Utc::now().timestamp_millis();
        let mut points = Vec::with_capacity(batch.len() + fiat_pairs.len());

        for (name, ticker) in batch {
            points.push(Point {
                measurement: self.pairs_measurement.clone(),
                tags: vec![
                    ("base".into(), ticker.base.clone()),
                    ("quote".into(), ticker.quote.clone()),
                    ("symbol".into(), name.clone()),
                    ("exchange_id".into(), exchange_id.to_string()),
                ],
                fields: vec![
                    ("last".into(), ticker.last),
                    ("bid".into(), ticker.bid),
                    ("ask".into(), ticker.ask),
                    ("open".into(), ticker.open),
                    ("close".into(), ticker.close),
                    ("high".into(), ticker.high),
                    ("low".into(), ticker.low),
                    ("volume".into(), ticker.volume),
                ],
                timestamp_ms,
            });
        }
        for (currency, price) in fiat_pairs {
            points.push(Point {
                measurement: self.fiat_measurement.clone(),
                tags: vec![
                    ("currency".into(), currency.clone()),
                    ("exchange_id".into(), exchange_id.to_string()),
                ],
                fields: vec![("price".into(), *price)],
                timestamp_ms,
            });
        }

        let total = points.len();
        let failures = stream::iter(points)
            .map(|point| {
                let client = self.client.clone();
                async move {
                    if let Err(e) = client.write_point(&point).await {
                        warn!(measurement = %point.measurement, error = %e, "influx point write failed");
                        1usize
                    } else {
                        0usize
                    }
                }
            })
            .buffer_unordered(WRITE_CONCURRENCY)
            .fold(0usize, |acc, failed| async move { acc + failed })
            .await;

        if failures > 0 {
            warn!(failures, total, exchange_id, "some timeseries writes failed");
        } else {
            debug!(total, exchange_id, "timeseries write finished");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn line_protocol_escapes_tags_and_orders_sections() {
        let point = Point {
            measurement: "market-pairs".into(),
            tags: vec![
                ("symbol".into(), "BTC-USD".into()),
                ("note".into(), "has space,comma=eq".into()),
            ],
            fields: vec![("last".into(), 30_000.5), ("volume".into(), 10.0)],
            timestamp_ms: 1_700_000_000_000,
        };
        assert_eq!(
            point.to_line(),
            "market-pairs,symbol=BTC-USD,note=has\\ space\\,comma\\=eq last=30000.5,volume=10 1700000000000"
        );
    }

    #[test]
    fn empty_tag_values_are_omitted() {
        let point = Point {
            measurement: "fiat-markets".into(),
            tags: vec![("currency".into(), String::new()), ("exchange_id".into(), "1".into())],
            fields: vec![("price".into(), 1.0)],
            timestamp_ms: 0,
        };
        assert_eq!(point.to_line(), "fiat-markets,exchange_id=1 price=1 0");
    }

    #[test]
    fn csv_rows_map_to_their_header_columns() {
        let body = "\
#group,false,false,true\r
,result,table,currency,_value\r
,_result,0,BTC,30000\r
,_result,0,ETH,1800\r
\r
,result,table,currency,_value\r
,_result,1,LTC,80\r
";
        let rows = parse_csv_tables(body);
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0]["currency"], "BTC");
        assert_eq!(rows[0]["_value"], "30000");
        assert_eq!(rows[2]["currency"], "LTC");
        // The unnamed leading column is dropped.
        assert!(!rows[0].contains_key(""));
    }

    #[test]
    fn range_query_includes_filters_and_pivot() {
        let config = Config::for_tests();
        let client = InfluxClient::new(&config).unwrap();
        let query = client.range_query(
            "market-pairs",
            "-1h",
            None,
            &[("base", "BTC"), ("quote", "USD")],
            true,
        );
        assert!(query.starts_with("from(bucket: \"marketmanager\")"));
        assert!(query.contains("range(start: -1h, stop: now())"));
        assert!(query.contains("r._measurement == \"market-pairs\""));
        assert!(query.contains("r.base == \"BTC\""));
        assert!(query.contains("pivot(rowKey:[\"_time\"]"));
    }
}
