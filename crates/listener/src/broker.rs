//! Client for the broker's HTTP query API.
//!
//! All endpoints take a JSON body via POST and answer with a list of records
//! whose column names are namespaced (`i:jd`, `d:rf_kn_vs_nonkn`, ...).

use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::header::{CONTENT_TYPE, USER_AGENT};
use hyper::{Method, Request, StatusCode};
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use serde_json::{Map, Value, json};
use std::time::{Duration, Instant};
use tokio::time::timeout;

use crate::alert::StampKind;
use crate::config::BrokerConfig;
use crate::enrich::{HistorySource, HistoryTable};
use crate::error::BrokerQueryError;
use crate::stamps::StampImage;
use crate::tls::shared_tls_config;

const CLIENT_USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));

/// Broker endpoints, each with the round-trip time beyond which a failure is
/// most likely the server-side query timeout.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Endpoint {
    Latests,
    Objects,
    Explorer,
    Cutouts,
}

impl Endpoint {
    pub fn path(self) -> &'static str {
        match self {
            Endpoint::Latests => "/api/v1/latests",
            Endpoint::Objects => "/api/v1/objects",
            Endpoint::Explorer => "/api/v1/explorer",
            Endpoint::Cutouts => "/api/v1/cutouts",
        }
    }

    pub fn slow_threshold(self) -> Duration {
        match self {
            Endpoint::Latests => Duration::from_secs(58),
            Endpoint::Objects | Endpoint::Explorer | Endpoint::Cutouts => Duration::from_secs(59),
        }
    }

    /// The broker reports failed queries with 400/404/500/504; any other
    /// non-success status is treated the same way.
    pub fn is_failure(self, status: StatusCode) -> bool {
        !status.is_success()
    }
}

type HttpsClient = Client<HttpsConnector<HttpConnector>, Full<Bytes>>;

#[derive(Clone)]
pub struct BrokerClient {
    base_url: String,
    request_timeout: Duration,
    client: HttpsClient,
}

impl BrokerClient {
    pub fn new(config: &BrokerConfig) -> Result<Self, BrokerQueryError> {
        let tls = shared_tls_config().map_err(|e| BrokerQueryError::Network(e.to_string()))?;
        let connector = HttpsConnectorBuilder::new()
            .with_tls_config((*tls).clone())
            .https_or_http()
            .enable_http1()
            .build();
        let client = Client::builder(TokioExecutor::new()).build(connector);
        Ok(Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            request_timeout: Duration::from_secs(config.request_timeout_secs),
            client,
        })
    }

    pub async fn query_objects(&self, params: &Value) -> Result<HistoryTable, BrokerQueryError> {
        self.query(Endpoint::Objects, params).await
    }

    pub async fn query_latest_alerts(
        &self,
        params: &Value,
    ) -> Result<HistoryTable, BrokerQueryError> {
        self.query(Endpoint::Latests, params).await
    }

    pub async fn query_database(&self, params: &Value) -> Result<HistoryTable, BrokerQueryError> {
        self.query(Endpoint::Explorer, params).await
    }

    /// Fetches one postage stamp as a pixel array. `params` selects the alert
    /// (`objectId`, optionally `candid`). A body that does not hold the stamp
    /// yields `None`; only transport and status failures are errors.
    #[tracing::instrument(skip(self, params), fields(kind = %kind))]
    pub async fn query_cutout(
        &self,
        kind: StampKind,
        params: &Value,
    ) -> Result<Option<StampImage>, BrokerQueryError> {
        let mut body = json!({ "kind": kind.as_str(), "output-format": "array" });
        if let (Some(body), Some(extra)) = (body.as_object_mut(), params.as_object()) {
            body.extend(extra.clone());
        }
        let raw = self.post_json(Endpoint::Cutouts, &body).await?;
        match parse_cutout(kind, &raw) {
            Ok(image) => Ok(Some(image)),
            Err(reason) => {
                tracing::warn!(kind = %kind, reason = %reason, "unusable cutout response");
                Ok(None)
            }
        }
    }

    #[tracing::instrument(skip(self, params), fields(endpoint = endpoint.path()))]
    async fn query(
        &self,
        endpoint: Endpoint,
        params: &Value,
    ) -> Result<HistoryTable, BrokerQueryError> {
        let body = self.post_json(endpoint, params).await?;
        parse_records(&body)
    }

    async fn post_json(
        &self,
        endpoint: Endpoint,
        params: &Value,
    ) -> Result<Bytes, BrokerQueryError> {
        let url = format!("{}{}", self.base_url, endpoint.path());
        let payload = serde_json::to_vec(params)
            .map_err(|e| BrokerQueryError::InvalidResponse(e.to_string()))?;
        let req = Request::builder()
            .method(Method::POST)
            .uri(&url)
            .header(CONTENT_TYPE, "application/json")
            .header(USER_AGENT, CLIENT_USER_AGENT)
            .body(Full::new(Bytes::from(payload)))
            .map_err(|e| BrokerQueryError::Network(e.to_string()))?;

        let started = Instant::now();
        let response = match timeout(self.request_timeout, self.client.request(req)).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => return Err(BrokerQueryError::Network(e.to_string())),
            Err(_) => {
                return Err(BrokerQueryError::Timeout {
                    endpoint: url,
                    elapsed: started.elapsed(),
                });
            }
        };
        let status = response.status();
        let body = response
            .into_body()
            .collect()
            .await
            .map_err(|e| BrokerQueryError::Network(e.to_string()))?
            .to_bytes();
        let elapsed = started.elapsed();

        tracing::info!(
            status = %status,
            elapsed_ms = elapsed.as_millis() as u64,
            "broker query status"
        );

        if endpoint.is_failure(status) {
            let likely_timeout = elapsed > endpoint.slow_threshold();
            tracing::error!(
                name = "broker.query.failed",
                target = concat!(env!("CARGO_PKG_NAME"), "::", module_path!()),
                status = %status,
                likely_timeout = likely_timeout,
                message = "Broker query failed"
            );
            if likely_timeout {
                tracing::error!("likely a timeout error");
            }
            return Err(BrokerQueryError::Status {
                endpoint: url,
                status,
                body: String::from_utf8_lossy(&body).into_owned(),
                likely_timeout,
            });
        }
        Ok(body)
    }
}

#[async_trait]
impl HistorySource for BrokerClient {
    async fn object_history(&self, object_id: &str) -> Result<HistoryTable, BrokerQueryError> {
        self.query_objects(&json!({ "objectId": object_id, "output-format": "json" }))
            .await
    }
}

/// Accepts the record list the broker normally returns, and the
/// column-oriented `{column: {row: value}}` shape as a fallback.
pub fn parse_records(body: &[u8]) -> Result<HistoryTable, BrokerQueryError> {
    let value: Value =
        serde_json::from_slice(body).map_err(|e| BrokerQueryError::InvalidResponse(e.to_string()))?;
    match value {
        Value::Array(rows) => rows
            .into_iter()
            .map(|row| match row {
                Value::Object(map) => Ok(map),
                other => Err(BrokerQueryError::InvalidResponse(format!(
                    "expected a JSON object per row, found {other}"
                ))),
            })
            .collect::<Result<Vec<_>, _>>()
            .map(HistoryTable::new),
        Value::Object(columns) => Ok(HistoryTable::new(pivot_columns(columns)?)),
        other => Err(BrokerQueryError::InvalidResponse(format!(
            "expected a list of records, found {other}"
        ))),
    }
}

/// Reads `b:cutout<Kind>_stampData` from the first record of a cutout
/// response.
pub fn parse_cutout(kind: StampKind, body: &[u8]) -> Result<StampImage, String> {
    let key = format!("b:cutout{kind}_stampData");
    let table = parse_records(body).map_err(|e| e.to_string())?;
    let cell = table
        .records
        .first()
        .and_then(|record| record.get(&key))
        .ok_or_else(|| format!("no {key} in response"))?;
    let rows: Vec<Vec<Option<f64>>> =
        serde_json::from_value(cell.clone()).map_err(|e| format!("{key}: {e}"))?;
    let rows = rows
        .into_iter()
        .map(|row| row.into_iter().map(|v| v.unwrap_or(f64::NAN)).collect())
        .collect();
    StampImage::from_rows(rows).map_err(|e| e.to_string())
}

fn pivot_columns(columns: Map<String, Value>) -> Result<Vec<Map<String, Value>>, BrokerQueryError> {
    let mut rows: std::collections::BTreeMap<String, Map<String, Value>> = Default::default();
    for (column, cells) in columns {
        let Value::Object(cells) = cells else {
            return Err(BrokerQueryError::InvalidResponse(format!(
                "column {column} is not an index map"
            )));
        };
        for (index, cell) in cells {
            rows.entry(index).or_default().insert(column.clone(), cell);
        }
    }
    let mut indexed: Vec<_> = rows.into_iter().collect();
    indexed.sort_by_key(|(index, _)| index.parse::<u64>().unwrap_or(u64::MAX));
    Ok(indexed.into_iter().map(|(_, row)| row).collect())
}
