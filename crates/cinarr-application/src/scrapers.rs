// SPDX-License-Identifier: GPL-3.0-or-later
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use cinarr_domain::MediaType;
use reqwest::{Client, Url};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::release_parsing::normalize_size_gb;

/// One release as reported by a scraper backend, size already in GB.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawResult {
    pub title: String,
    pub size_gb: f64,
    pub magnet: String,
    /// Backend id.
    pub source: String,
    pub seeders: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScrapeQuery {
    pub imdb_id: Option<String>,
    pub tmdb_id: Option<String>,
    /// Title, alias or translated title to search for.
    pub title: String,
    pub year: Option<i32>,
    pub media_type: MediaType,
    pub season: Option<u32>,
    pub episode: Option<u32>,
    /// Season packs are acceptable.
    pub multi: bool,
}

#[derive(Debug, Error)]
pub enum ScraperError {
    #[error("request failed: {0}")]
    Request(String),
    #[error("unexpected status {status}")]
    HttpStatus { status: u16 },
    #[error("malformed response: {0}")]
    Parse(String),
}

#[async_trait]
pub trait ScraperBackend: Send + Sync {
    fn id(&self) -> &str;

    async fn search(&self, query: &ScrapeQuery) -> Result<Vec<RawResult>, ScraperError>;
}

/// Fans a query out to every backend and merges what comes back. A failing or
/// slow backend only loses its own results.
#[derive(Clone)]
pub struct ScraperManager {
    backends: Vec<Arc<dyn ScraperBackend>>,
    timeout: Duration,
}

impl ScraperManager {
    pub fn new(backends: Vec<Arc<dyn ScraperBackend>>, timeout: Duration) -> Self {
        Self { backends, timeout }
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }

    /// Results are returned in backend registration order.
    pub async fn scrape(&self, query: &ScrapeQuery) -> Vec<RawResult> {
        let mut set = JoinSet::new();
        for (idx, backend) in self.backends.iter().enumerate() {
            let backend = Arc::clone(backend);
            let query = query.clone();
            let timeout = self.timeout;
            set.spawn(async move {
                let id = backend.id().to_string();
                let outcome = tokio::time::timeout(timeout, backend.search(&query)).await;
                (idx, id, outcome)
            });
        }

        let mut per_backend: Vec<(usize, Vec<RawResult>)> = Vec::new();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((idx, id, Ok(Ok(results)))) => {
                    debug!(target: "scraping", backend = %id, count = results.len(), "backend returned results");
                    per_backend.push((idx, results));
                }
                Ok((_, id, Ok(Err(error)))) => {
                    warn!(target: "scraping", backend = %id, %error, "backend failed");
                }
                Ok((_, id, Err(_))) => {
                    warn!(target: "scraping", backend = %id, timeout_secs = self.timeout.as_secs(), "backend timed out");
                }
                Err(error) => {
                    warn!(target: "scraping", %error, "backend task aborted");
                }
            }
        }

        per_backend.sort_by_key(|(idx, _)| *idx);
        per_backend.into_iter().flat_map(|(_, r)| r).collect()
    }
}

// ============================================================================
// JSON search endpoint
// ============================================================================

/// Backend speaking a plain JSON search API:
/// `GET {url}?imdb_id=..&query=..&type=movie|episode[&season=..&episode=..]`
/// answering `[{"title", "size", "magnet", "seeders"}]`.
pub struct HttpJsonScraper {
    id: String,
    client: Client,
    url: String,
}

#[derive(Debug, Deserialize)]
struct JsonSearchHit {
    title: String,
    magnet: String,
    /// Bytes as a number, or a human string such as `"1.4 GB"`.
    #[serde(default)]
    size: Option<serde_json::Value>,
    #[serde(default)]
    seeders: Option<u32>,
}

impl HttpJsonScraper {
    pub fn new(id: impl Into<String>, client: Client, url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            client,
            url: url.into(),
        }
    }

    fn search_url(&self, query: &ScrapeQuery) -> Result<Url, ScraperError> {
        let mut url = Url::parse(&self.url).map_err(|e| ScraperError::Request(e.to_string()))?;
        {
            let mut pairs = url.query_pairs_mut();
            if let Some(imdb) = &query.imdb_id {
                pairs.append_pair("imdb_id", imdb);
            }
            pairs.append_pair("query", &query.title);
            pairs.append_pair("type", query.media_type.as_str());
            if let Some(year) = query.year {
                pairs.append_pair("year", &year.to_string());
            }
            if let Some(season) = query.season {
                pairs.append_pair("season", &season.to_string());
            }
            // Season pack searches leave the episode out.
            if let (Some(episode), false) = (query.episode, query.multi) {
                pairs.append_pair("episode", &episode.to_string());
            }
        }
        Ok(url)
    }
}

fn hit_size_gb(size: Option<&serde_json::Value>) -> f64 {
    match size {
        Some(serde_json::Value::Number(n)) => n
            .as_f64()
            .and_then(|v| normalize_size_gb(&format!("{v}")))
            .unwrap_or(0.0),
        Some(serde_json::Value::String(s)) => normalize_size_gb(s).unwrap_or(0.0),
        _ => 0.0,
    }
}

#[async_trait]
impl ScraperBackend for HttpJsonScraper {
    fn id(&self) -> &str {
        &self.id
    }

    async fn search(&self, query: &ScrapeQuery) -> Result<Vec<RawResult>, ScraperError> {
        let url = self.search_url(query)?;
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| ScraperError::Request(e.to_string()))?;
        if !response.status().is_success() {
            return Err(ScraperError::HttpStatus {
                status: response.status().as_u16(),
            });
        }
        let hits: Vec<JsonSearchHit> = response
            .json()
            .await
            .map_err(|e| ScraperError::Parse(e.to_string()))?;

        Ok(hits
            .into_iter()
            .filter(|hit| hit.magnet.starts_with("magnet:"))
            .map(|hit| RawResult {
                size_gb: hit_size_gb(hit.size.as_ref()),
                title: hit.title,
                magnet: hit.magnet,
                source: self.id.clone(),
                seeders: hit.seeders,
            })
            .collect())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Backend serving canned results for any query.
    pub(crate) struct StaticBackend {
        pub id: String,
        pub results: Vec<RawResult>,
        pub delay: Option<Duration>,
        pub fail: bool,
    }

    #[async_trait]
    impl ScraperBackend for StaticBackend {
        fn id(&self) -> &str {
            &self.id
        }

        async fn search(&self, _query: &ScrapeQuery) -> Result<Vec<RawResult>, ScraperError> {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            if self.fail {
                return Err(ScraperError::HttpStatus { status: 503 });
            }
            Ok(self.results.clone())
        }
    }

    pub(crate) fn raw(title: &str, size_gb: f64, magnet: &str) -> RawResult {
        RawResult {
            title: title.to_string(),
            size_gb,
            magnet: magnet.to_string(),
            source: "static".to_string(),
            seeders: Some(10),
        }
    }

    fn query() -> ScrapeQuery {
        ScrapeQuery {
            imdb_id: Some("tt0133093".into()),
            tmdb_id: None,
            title: "The Matrix".into(),
            year: Some(1999),
            media_type: MediaType::Movie,
            season: None,
            episode: None,
            multi: false,
        }
    }

    #[tokio::test]
    async fn merges_backends_in_registration_order_and_skips_failures() {
        let manager = ScraperManager::new(
            vec![
                Arc::new(StaticBackend {
                    id: "slow".into(),
                    results: vec![raw("A", 1.0, "magnet:?xt=urn:btih:aaa")],
                    delay: Some(Duration::from_millis(30)),
                    fail: false,
                }),
                Arc::new(StaticBackend {
                    id: "broken".into(),
                    results: vec![],
                    delay: None,
                    fail: true,
                }),
                Arc::new(StaticBackend {
                    id: "fast".into(),
                    results: vec![raw("B", 2.0, "magnet:?xt=urn:btih:bbb")],
                    delay: None,
                    fail: false,
                }),
            ],
            Duration::from_secs(5),
        );

        let results = manager.scrape(&query()).await;
        let titles: Vec<_> = results.iter().map(|r| r.title.as_str()).collect();
        assert_eq!(titles, vec!["A", "B"]);
    }

    #[tokio::test]
    async fn json_backend_sends_query_and_normalizes_sizes() {
        use wiremock::matchers::{method, path, query_param};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/search"))
            .and(query_param("imdb_id", "tt0133093"))
            .and(query_param("type", "movie"))
            .and(query_param("year", "1999"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
                {"title": "The.Matrix.1999.1080p.BluRay.x264-GRP", "magnet": "magnet:?xt=urn:btih:aaa", "size": 10737418240_u64, "seeders": 40},
                {"title": "The.Matrix.1999.720p.WEB-DL-GRP", "magnet": "magnet:?xt=urn:btih:bbb", "size": "700 MB"},
                {"title": "Broken", "magnet": "http://not-a-magnet"}
            ])))
            .mount(&server)
            .await;

        let backend = HttpJsonScraper::new("json", Client::new(), format!("{}/search", server.uri()));
        let results = backend.search(&query()).await.unwrap();
        assert_eq!(results.len(), 2);
        assert!((results[0].size_gb - 10.0).abs() < 1e-9);
        assert_eq!(results[0].seeders, Some(40));
        assert_eq!(results[0].source, "json");
        assert!((results[1].size_gb - 700.0 / 1024.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn json_backend_reports_http_status() {
        use wiremock::matchers::method;
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(502))
            .mount(&server)
            .await;
        let backend = HttpJsonScraper::new("json", Client::new(), server.uri());
        assert!(matches!(
            backend.search(&query()).await,
            Err(ScraperError::HttpStatus { status: 502 })
        ));
    }

    #[tokio::test]
    async fn slow_backend_is_cut_off_by_timeout() {
        let manager = ScraperManager::new(
            vec![Arc::new(StaticBackend {
                id: "stuck".into(),
                results: vec![raw("A", 1.0, "magnet:?xt=urn:btih:aaa")],
                delay: Some(Duration::from_secs(10)),
                fail: false,
            })],
            Duration::from_millis(20),
        );
        assert!(manager.scrape(&query()).await.is_empty());
    }
}
