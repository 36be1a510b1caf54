//! PostgREST-backed progress reads.
//!
//! # Tables
//! - `scans` (`id`, `status`)
//! - `scan_events` (`scan_id`, `provider`, `stage`, `created_at`)
//! - `findings` (`scan_id`), counted with `Prefer: count=exact`
//! - `scan_progress` (one snapshot row per scan)

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{header, Client, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use url::Url;

use crate::observer::signals::{
    ProviderStageEvent, ScanProgressSnapshot, ScanStatus, SignalError,
};
use crate::observer::source::ProgressSource;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Deserialize)]
struct StatusRow {
    status: ScanStatus,
}

pub struct RestSignals {
    client: Client,
    base: String,
    api_key: String,
}

impl RestSignals {
    pub fn new(rest_url: &str, api_key: &str) -> Result<Self, SignalError> {
        Url::parse(rest_url)
            .map_err(|e| SignalError::Unavailable(format!("invalid rest url {rest_url}: {e}")))?;
        let client = Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            client,
            base: rest_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
        })
    }

    fn table(&self, name: &str) -> String {
        format!("{}/{}", self.base, name)
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        if self.api_key.is_empty() {
            return request;
        }
        request
            .header("apikey", &self.api_key)
            .bearer_auth(&self.api_key)
    }

    async fn rows<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<Vec<T>, SignalError> {
        let response = checked(self.authorize(request).send().await?)?;
        let bytes = response.bytes().await?;
        serde_json::from_slice(&bytes).map_err(|e| SignalError::Decode(e.to_string()))
    }
}

fn checked(response: Response) -> Result<Response, SignalError> {
    let status = response.status();
    if status.is_success() {
        Ok(response)
    } else {
        Err(SignalError::Unavailable(format!(
            "{} returned {status}",
            response.url().path()
        )))
    }
}

/// Total from a `Content-Range` header such as `0-24/57` or `*/0`.
pub fn parse_content_range_total(value: &str) -> Option<u64> {
    value.rsplit_once('/')?.1.trim().parse().ok()
}

#[async_trait]
impl ProgressSource for RestSignals {
    async fn scan_status(&self, scan_id: &str) -> Result<Option<ScanStatus>, SignalError> {
        let request = self
            .client
            .get(self.table("scans"))
            .query(&[("id", format!("eq.{scan_id}")), ("select", "status".into())]);
        let rows: Vec<StatusRow> = self.rows(request).await?;
        Ok(rows.into_iter().next().map(|r| r.status))
    }

    async fn stage_events(&self, scan_id: &str) -> Result<Vec<ProviderStageEvent>, SignalError> {
        let request = self.client.get(self.table("scan_events")).query(&[
            ("scan_id", format!("eq.{scan_id}")),
            ("select", "scan_id,provider,stage,created_at".into()),
            ("order", "created_at.asc".into()),
        ]);
        self.rows(request).await
    }

    async fn findings_count(&self, scan_id: &str) -> Result<u64, SignalError> {
        let request = self
            .client
            .head(self.table("findings"))
            .query(&[("scan_id", format!("eq.{scan_id}")), ("select", "id".into())])
            .header("Prefer", "count=exact");
        let response = checked(self.authorize(request).send().await?)?;

        response
            .headers()
            .get(header::CONTENT_RANGE)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_content_range_total)
            .ok_or_else(|| SignalError::Decode("findings count missing Content-Range total".into()))
    }

    async fn snapshot(&self, scan_id: &str) -> Result<Option<ScanProgressSnapshot>, SignalError> {
        let request = self.client.get(self.table("scan_progress")).query(&[
            ("scan_id", format!("eq.{scan_id}")),
            ("select", "*".into()),
            ("limit", "1".into()),
        ]);
        let rows: Vec<ScanProgressSnapshot> = self.rows(request).await?;
        Ok(rows.into_iter().next())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_range_total() {
        assert_eq!(parse_content_range_total("0-24/57"), Some(57));
        assert_eq!(parse_content_range_total("*/0"), Some(0));
        assert_eq!(parse_content_range_total("0-24/*"), None);
        assert_eq!(parse_content_range_total("garbage"), None);
    }

    #[test]
    fn test_rejects_bad_url() {
        assert!(RestSignals::new("not a url", "").is_err());
        let signals = RestSignals::new("http://localhost:54321/rest/v1/", "key").unwrap();
        assert_eq!(signals.table("scans"), "http://localhost:54321/rest/v1/scans");
    }
}
