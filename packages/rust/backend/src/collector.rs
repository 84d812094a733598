//! Supplementary document collectors.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use tracing::{debug, info, instrument};
use url::Url;

use reportloom_shared::{CollectorConfig, Document, ReportLoomError, Result};

use crate::{Collector, USER_AGENT};

/// Default timeout in seconds for a collection request.
const DEFAULT_TIMEOUT_SECS: u64 = 300;

/// Collector service reached over `POST {base_url}/collect`.
#[derive(Debug, Clone)]
pub struct HttpCollector {
    client: Client,
    endpoint: String,
}

impl HttpCollector {
    pub fn new(base_url: &str) -> Result<Self> {
        let base = Url::parse(base_url).map_err(|e| {
            ReportLoomError::config(format!("invalid collector base_url '{base_url}': {e}"))
        })?;

        let client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
            .build()
            .map_err(|e| ReportLoomError::config(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            endpoint: format!("{}/collect", base.as_str().trim_end_matches('/')),
        })
    }

    /// `Some` when the `[collector]` section names a service.
    pub fn from_config(config: &CollectorConfig) -> Result<Option<Self>> {
        config.base_url.as_deref().map(Self::new).transpose()
    }
}

#[derive(Debug, Serialize)]
struct CollectRequest<'a> {
    query: &'a str,
    limit: usize,
}

#[async_trait]
impl Collector for HttpCollector {
    #[instrument(skip_all, fields(query = %query, limit = limit))]
    async fn collect(&self, query: &str, limit: usize) -> Result<Vec<Document>> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(&CollectRequest { query, limit })
            .send()
            .await
            .map_err(|e| ReportLoomError::Collector(format!("{}: {e}", self.endpoint)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ReportLoomError::Collector(format!(
                "{}: HTTP {status}",
                self.endpoint
            )));
        }

        let mut documents: Vec<Document> = response.json().await.map_err(|e| {
            ReportLoomError::Collector(format!("malformed collector response: {e}"))
        })?;

        if documents.len() > limit {
            debug!(returned = documents.len(), limit, "collector over-delivered, truncating");
            documents.truncate(limit);
        }

        info!(documents = documents.len(), "supplementary documents collected");
        Ok(documents)
    }
}

/// Collector that never finds anything. Gap-fill then exhausts immediately.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullCollector;

#[async_trait]
impl Collector for NullCollector {
    async fn collect(&self, query: &str, _limit: usize) -> Result<Vec<Document>> {
        debug!(%query, "no collector configured");
        Ok(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use reportloom_shared::SourceType;
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn doc_json(id: &str) -> serde_json::Value {
        serde_json::json!({
            "id": id,
            "title": format!("Doc {id}"),
            "url": format!("https://example.com/{id}"),
            "markdown": "Battery demand rose 30% in 2023.",
            "source_type": "html"
        })
    }

    #[test]
    fn from_config_without_url_is_none() {
        let collector = HttpCollector::from_config(&CollectorConfig::default()).unwrap();
        assert!(collector.is_none());
    }

    #[tokio::test]
    async fn collect_posts_query_and_limit() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/collect"))
            .and(body_json(serde_json::json!({ "query": "market size", "limit": 2 })))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!([doc_json("s1"), doc_json("s2")])),
            )
            .expect(1)
            .mount(&server)
            .await;

        let collector = HttpCollector::new(&server.uri()).unwrap();
        let docs = collector.collect("market size", 2).await.unwrap();
        assert_eq!(docs.len(), 2);
        assert_eq!(docs[0].id, "s1");
        assert_eq!(docs[0].source_type, SourceType::Html);
        assert!(docs[0].summary.is_none());
    }

    #[tokio::test]
    async fn collect_truncates_to_limit() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/collect"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
                doc_json("s1"),
                doc_json("s2"),
                doc_json("s3")
            ])))
            .mount(&server)
            .await;

        let collector = HttpCollector::new(&server.uri()).unwrap();
        let docs = collector.collect("q", 1).await.unwrap();
        assert_eq!(docs.len(), 1);
    }

    #[tokio::test]
    async fn server_error_is_a_collector_error() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/collect"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let collector = HttpCollector::new(&server.uri()).unwrap();
        let err = collector.collect("q", 3).await.unwrap_err();
        assert!(matches!(err, ReportLoomError::Collector(_)));
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn null_collector_returns_nothing() {
        assert!(NullCollector.collect("anything", 10).await.unwrap().is_empty());
    }
}
