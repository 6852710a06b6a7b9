use async_trait::async_trait;
use mirror_core::{RecordKind, RemoteRecord, Source, SourceError};
use reqwest::StatusCode;
use serde_json::Value;
use std::time::Duration;

use super::{record_from_body, records_from_body, total_from_body};
use crate::config::SourceConfig;

/// Errors raised while talking to the catalog API.
#[derive(Debug)]
pub enum HttpSourceError {
    /// No base URL configured
    NotConfigured,
    /// Client could not be built
    Client(String),
    /// Transport failure
    Http(String),
    /// Request exceeded the configured timeout
    Timeout(Duration),
    /// Non-success status code
    Status(StatusCode),
    /// Body was not what the endpoint promises
    Decode(String),
}

impl std::fmt::Display for HttpSourceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HttpSourceError::NotConfigured => write!(
                f,
                "Catalog source not configured. Set source.base_url in config or CATALOG_MIRROR_API_URL."
            ),
            HttpSourceError::Client(e) => write!(f, "HTTP client error: {}", e),
            HttpSourceError::Http(e) => write!(f, "HTTP error: {}", e),
            HttpSourceError::Timeout(d) => write!(f, "Request timed out after {:?}", d),
            HttpSourceError::Status(s) => write!(f, "Server returned status {}", s),
            HttpSourceError::Decode(e) => write!(f, "Invalid response: {}", e),
        }
    }
}

impl std::error::Error for HttpSourceError {}

impl From<HttpSourceError> for SourceError {
    fn from(err: HttpSourceError) -> Self {
        match err {
            HttpSourceError::Timeout(d) => SourceError::Timeout(d),
            HttpSourceError::Decode(e) => SourceError::InvalidResponse(e),
            other => SourceError::Unavailable(other.to_string()),
        }
    }
}

/// [`Source`] backed by the catalog's REST API.
pub struct HttpSource {
    client: reqwest::Client,
    base_url: String,
    api_token: Option<String>,
    timeout: Duration,
}

impl HttpSource {
    pub fn from_config(config: &SourceConfig) -> Result<Self, HttpSourceError> {
        let base_url = config
            .base_url
            .clone()
            .ok_or(HttpSourceError::NotConfigured)?;
        Self::new(
            base_url,
            config.api_token.clone(),
            Duration::from_secs(config.timeout_secs.max(1)),
        )
    }

    pub fn new(
        base_url: impl Into<String>,
        api_token: Option<String>,
        timeout: Duration,
    ) -> Result<Self, HttpSourceError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| HttpSourceError::Client(e.to_string()))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_token,
            timeout,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    /// GETs `path` and returns the decoded body with the `X-Total-Count`
    /// header, or `None` on 404.
    async fn get_json(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<Option<(Value, Option<u64>)>, HttpSourceError> {
        let mut request = self.client.get(self.url(path)).query(query);
        if let Some(token) = &self.api_token {
            request = request.header("Authorization", format!("Bearer {}", token));
        }

        let response = request.send().await.map_err(|e| self.transport_error(e))?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(HttpSourceError::Status(status));
        }

        let header_total = response
            .headers()
            .get("X-Total-Count")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok());
        let body: Value = response.json().await.map_err(|e| {
            if e.is_timeout() {
                HttpSourceError::Timeout(self.timeout)
            } else {
                HttpSourceError::Decode(e.to_string())
            }
        })?;

        tracing::debug!("GET {} -> {}", path, status);
        Ok(Some((body, header_total)))
    }

    async fn get_list(&self, path: &str, kind: RecordKind) -> Result<Vec<RemoteRecord>, HttpSourceError> {
        let (body, _) = self
            .get_json(path, &[])
            .await?
            .ok_or(HttpSourceError::Status(StatusCode::NOT_FOUND))?;
        records_from_body(kind, body).map_err(HttpSourceError::Decode)
    }

    fn page_query(page: u32, size: u32) -> [(&'static str, String); 2] {
        [("page", page.to_string()), ("per_page", size.to_string())]
    }

    fn transport_error(&self, e: reqwest::Error) -> HttpSourceError {
        if e.is_timeout() {
            HttpSourceError::Timeout(self.timeout)
        } else {
            HttpSourceError::Http(e.to_string())
        }
    }
}

#[async_trait]
impl Source for HttpSource {
    async fn fetch_categories(&self) -> Result<Vec<RemoteRecord>, SourceError> {
        Ok(self.get_list("categories", RecordKind::Category).await?)
    }

    async fn fetch_procedures(&self) -> Result<Vec<RemoteRecord>, SourceError> {
        Ok(self.get_list("procedures", RecordKind::Procedure).await?)
    }

    async fn fetch_cases_page(
        &self,
        page: u32,
        size: u32,
    ) -> Result<Vec<RemoteRecord>, SourceError> {
        let response = self
            .get_json("cases", &Self::page_query(page, size))
            .await?;
        match response {
            // Some APIs answer past-the-end pages with 404
            None => Ok(Vec::new()),
            Some((body, _)) => Ok(records_from_body(RecordKind::Case, body)
                .map_err(HttpSourceError::Decode)?),
        }
    }

    async fn total_cases(&self) -> Result<u64, SourceError> {
        let response = self.get_json("cases", &Self::page_query(1, 1)).await?;
        Ok(response
            .and_then(|(body, header)| total_from_body(&body).or(header))
            .unwrap_or(0))
    }

    async fn fetch_case(&self, external_id: &str) -> Result<Option<RemoteRecord>, SourceError> {
        let path = format!("cases/{}", external_id);
        match self.get_json(&path, &[]).await? {
            None => Ok(None),
            Some((body, _)) => Ok(Some(
                record_from_body(RecordKind::Case, body).map_err(HttpSourceError::Decode)?,
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_config_requires_base_url() {
        let config = SourceConfig::default();
        assert!(matches!(
            HttpSource::from_config(&config),
            Err(HttpSourceError::NotConfigured)
        ));
    }

    #[test]
    fn test_url_joins_paths() {
        let source =
            HttpSource::new("https://catalog.example.com/api/", None, Duration::from_secs(5))
                .unwrap();
        assert_eq!(
            source.url("/cases/100"),
            "https://catalog.example.com/api/cases/100"
        );
        assert_eq!(source.url("categories"), "https://catalog.example.com/api/categories");
    }

    #[test]
    fn test_errors_map_to_source_errors() {
        let timeout: SourceError = HttpSourceError::Timeout(Duration::from_secs(30)).into();
        assert_eq!(timeout, SourceError::Timeout(Duration::from_secs(30)));

        let decode: SourceError = HttpSourceError::Decode("bad".to_string()).into();
        assert_eq!(decode, SourceError::InvalidResponse("bad".to_string()));

        let status: SourceError = HttpSourceError::Status(StatusCode::BAD_GATEWAY).into();
        assert!(matches!(status, SourceError::Unavailable(msg) if msg.contains("502")));
    }

    #[tokio::test]
    async fn test_unreachable_server_is_unavailable() {
        // Port 9 (discard) on localhost is closed in test environments
        let source =
            HttpSource::new("http://127.0.0.1:9", None, Duration::from_secs(2)).unwrap();
        let err = source.fetch_categories().await.unwrap_err();
        assert!(matches!(
            err,
            SourceError::Unavailable(_) | SourceError::Timeout(_)
        ));
    }
}
