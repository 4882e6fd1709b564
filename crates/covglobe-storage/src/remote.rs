//! GitHub contents/blob client with single-retry rate limit handling.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use covglobe_core::RemoteEntry;
use reqwest::header::{HeaderMap, ACCEPT};
use reqwest::StatusCode;
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{info, info_span, warn, Instrument};

const GITHUB_JSON: &str = "application/vnd.github+json";
const GITHUB_RAW: &str = "application/vnd.github.raw+json";
const GITHUB_API_VERSION: &str = "2022-11-28";

/// Listing + blob capability the ingestion pipeline reads reports through.
#[async_trait]
pub trait ReportSource: Send + Sync {
    async fn list_report_files(&self, path_prefix: &str) -> Result<Vec<RemoteEntry>, FetchError>;

    async fn fetch_file_content(&self, content_id: &str) -> Result<String, FetchError>;
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("rate limit still exhausted after retry for {url}")]
    RateLimited { url: String },
    #[error("secondary rate limit triggered for {url}")]
    AbuseDetected { url: String },
    #[error("client request limiter closed")]
    Closed(#[from] tokio::sync::AcquireError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitDisposition {
    /// Primary quota exhausted; waiting for the reset is enough.
    RateLimited,
    /// Secondary limit / abuse detection. Never retried.
    AbuseLimited,
    NotLimited,
}

pub fn classify_rate_limit(
    status: StatusCode,
    remaining: Option<&str>,
    body: &str,
) -> RateLimitDisposition {
    if status != StatusCode::FORBIDDEN && status != StatusCode::TOO_MANY_REQUESTS {
        return RateLimitDisposition::NotLimited;
    }

    let body = body.to_ascii_lowercase();
    if body.contains("secondary rate limit") || body.contains("abuse") {
        return RateLimitDisposition::AbuseLimited;
    }

    if status == StatusCode::TOO_MANY_REQUESTS || remaining.map(str::trim) == Some("0") {
        RateLimitDisposition::RateLimited
    } else {
        RateLimitDisposition::NotLimited
    }
}

/// How long to wait before re-issuing a rate limited request.
pub fn retry_after_from_headers(headers: &HeaderMap, now: DateTime<Utc>) -> Option<Duration> {
    let header_str = |name: &str| headers.get(name).and_then(|v| v.to_str().ok());

    if let Some(secs) = header_str("retry-after").and_then(|v| v.trim().parse::<u64>().ok()) {
        return Some(Duration::from_secs(secs));
    }

    header_str("x-ratelimit-reset")
        .and_then(|v| v.trim().parse::<i64>().ok())
        .map(|reset| Duration::from_secs((reset - now.timestamp()).max(0) as u64))
}

#[derive(Debug, Clone, Copy)]
pub struct RateLimitPolicy {
    pub max_retries: usize,
    pub fallback_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RateLimitPolicy {
    fn default() -> Self {
        Self {
            max_retries: 1,
            fallback_delay: Duration::from_secs(60),
            max_delay: Duration::from_secs(15 * 60),
        }
    }
}

impl RateLimitPolicy {
    pub fn delay_for(&self, retry_after: Option<Duration>) -> Duration {
        retry_after.unwrap_or(self.fallback_delay).min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct GitHubClientConfig {
    pub api_base: String,
    pub owner: String,
    pub repo: String,
    /// Branch or tag the report directory is listed from.
    pub git_ref: String,
    pub token: Option<String>,
    pub user_agent: String,
    pub timeout: Duration,
    pub max_in_flight: usize,
    pub rate_limit: RateLimitPolicy,
}

impl Default for GitHubClientConfig {
    fn default() -> Self {
        Self {
            api_base: "https://api.github.com".to_string(),
            owner: "CSSEGISandData".to_string(),
            repo: "COVID-19".to_string(),
            git_ref: "master".to_string(),
            token: None,
            user_agent: "covglobe-bot/0.1".to_string(),
            timeout: Duration::from_secs(20),
            max_in_flight: 8,
            rate_limit: RateLimitPolicy::default(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct TreeListing {
    tree: Vec<TreeItem>,
    #[serde(default)]
    truncated: bool,
}

#[derive(Debug, Deserialize)]
struct TreeItem {
    path: String,
    sha: String,
    #[serde(rename = "type")]
    kind: String,
}

#[derive(Debug)]
pub struct GitHubClient {
    client: reqwest::Client,
    repo_url: String,
    git_ref: String,
    token: Option<String>,
    in_flight: Arc<Semaphore>,
    rate_limit: RateLimitPolicy,
}

impl GitHubClient {
    pub fn new(config: GitHubClientConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .user_agent(config.user_agent.clone())
            .build()
            .context("building reqwest client")?;

        Ok(Self {
            client,
            repo_url: format!(
                "{}/repos/{}/{}",
                config.api_base.trim_end_matches('/'),
                config.owner,
                config.repo
            ),
            git_ref: config.git_ref,
            token: config.token.filter(|t| !t.trim().is_empty()),
            in_flight: Arc::new(Semaphore::new(config.max_in_flight.max(1))),
            rate_limit: config.rate_limit,
        })
    }

    fn request(&self, url: &str, accept: &str) -> reqwest::RequestBuilder {
        let builder = self
            .client
            .get(url)
            .header(ACCEPT, accept)
            .header("x-github-api-version", GITHUB_API_VERSION);
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    /// Callers hold an in-flight permit until the body has been read.
    async fn get_with_rate_limit(
        &self,
        url: &str,
        accept: &str,
    ) -> Result<reqwest::Response, FetchError> {
        for attempt in 0..=self.rate_limit.max_retries {
            let resp = self.request(url, accept).send().await?;
            let status = resp.status();
            if status.is_success() {
                return Ok(resp);
            }

            let remaining = resp
                .headers()
                .get("x-ratelimit-remaining")
                .and_then(|v| v.to_str().ok())
                .map(ToString::to_string);
            let retry_after = retry_after_from_headers(resp.headers(), Utc::now());
            let body = if status == StatusCode::FORBIDDEN || status == StatusCode::TOO_MANY_REQUESTS {
                resp.text().await.unwrap_or_default()
            } else {
                String::new()
            };

            match classify_rate_limit(status, remaining.as_deref(), &body) {
                RateLimitDisposition::RateLimited => {
                    warn!(url, attempt, "request quota exhausted");
                    if attempt < self.rate_limit.max_retries {
                        let delay = self.rate_limit.delay_for(retry_after);
                        info!(url, delay_secs = delay.as_secs(), "retrying after rate limit");
                        tokio::time::sleep(delay).await;
                        continue;
                    }
                    return Err(FetchError::RateLimited {
                        url: url.to_string(),
                    });
                }
                RateLimitDisposition::AbuseLimited => {
                    warn!(url, "abuse detected; not retrying");
                    return Err(FetchError::AbuseDetected {
                        url: url.to_string(),
                    });
                }
                RateLimitDisposition::NotLimited => {
                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: url.to_string(),
                    });
                }
            }
        }

        Err(FetchError::RateLimited {
            url: url.to_string(),
        })
    }
}

#[async_trait]
impl ReportSource for GitHubClient {
    async fn list_report_files(&self, path_prefix: &str) -> Result<Vec<RemoteEntry>, FetchError> {
        // the contents API stops at 1000 entries; a directory tree has no such cap
        let url = format!(
            "{}/git/trees/{}:{}",
            self.repo_url,
            self.git_ref,
            path_prefix.trim_matches('/')
        );
        let span = info_span!("github_list", path = path_prefix);
        async {
            let _permit = self.in_flight.acquire().await?;
            let listing: TreeListing = self.get_with_rate_limit(&url, GITHUB_JSON).await?.json().await?;
            if listing.truncated {
                warn!(url = %url, entries = listing.tree.len(), "tree listing truncated by GitHub");
            }
            Ok::<Vec<RemoteEntry>, FetchError>(listing
                .tree
                .into_iter()
                .filter(|item| item.kind == "blob")
                .map(|item| RemoteEntry {
                    name: item.path,
                    content_id: item.sha,
                })
                .collect())
        }
        .instrument(span)
        .await
    }

    async fn fetch_file_content(&self, content_id: &str) -> Result<String, FetchError> {
        let url = format!("{}/git/blobs/{}", self.repo_url, content_id);
        let span = info_span!("github_blob", content_id);
        async {
            let _permit = self.in_flight.acquire().await?;
            let resp = self.get_with_rate_limit(&url, GITHUB_RAW).await?;
            let body = resp.text().await?;
            Ok::<String, FetchError>(body)
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use reqwest::header::HeaderValue;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client_for(server: &MockServer) -> GitHubClient {
        GitHubClient::new(GitHubClientConfig {
            api_base: server.uri(),
            owner: "CSSEGISandData".into(),
            repo: "COVID-19".into(),
            token: Some("test-token".into()),
            rate_limit: RateLimitPolicy {
                max_retries: 1,
                fallback_delay: Duration::ZERO,
                max_delay: Duration::from_millis(10),
            },
            ..Default::default()
        })
        .expect("client")
    }

    const BLOB_PATH: &str = "/repos/CSSEGISandData/COVID-19/git/blobs/abc123";

    #[test]
    fn classifies_primary_and_secondary_limits() {
        assert_eq!(
            classify_rate_limit(StatusCode::TOO_MANY_REQUESTS, None, ""),
            RateLimitDisposition::RateLimited
        );
        assert_eq!(
            classify_rate_limit(StatusCode::FORBIDDEN, Some("0"), "API rate limit exceeded"),
            RateLimitDisposition::RateLimited
        );
        assert_eq!(
            classify_rate_limit(
                StatusCode::FORBIDDEN,
                Some("4999"),
                "You have exceeded a secondary rate limit"
            ),
            RateLimitDisposition::AbuseLimited
        );
        assert_eq!(
            classify_rate_limit(StatusCode::FORBIDDEN, Some("4999"), "Resource not accessible"),
            RateLimitDisposition::NotLimited
        );
        assert_eq!(
            classify_rate_limit(StatusCode::NOT_FOUND, Some("0"), ""),
            RateLimitDisposition::NotLimited
        );
    }

    #[test]
    fn retry_after_prefers_header_then_reset_epoch() {
        let now = Utc.with_ymd_and_hms(2021, 6, 1, 0, 0, 0).single().unwrap();
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-ratelimit-reset",
            HeaderValue::from_str(&(now.timestamp() + 30).to_string()).unwrap(),
        );
        assert_eq!(retry_after_from_headers(&headers, now), Some(Duration::from_secs(30)));

        headers.insert("retry-after", HeaderValue::from_static("7"));
        assert_eq!(retry_after_from_headers(&headers, now), Some(Duration::from_secs(7)));

        assert_eq!(retry_after_from_headers(&HeaderMap::new(), now), None);
    }

    #[test]
    fn delay_is_capped() {
        let policy = RateLimitPolicy {
            max_retries: 1,
            fallback_delay: Duration::from_secs(60),
            max_delay: Duration::from_secs(90),
        };
        assert_eq!(policy.delay_for(None), Duration::from_secs(60));
        assert_eq!(policy.delay_for(Some(Duration::from_secs(5))), Duration::from_secs(5));
        assert_eq!(policy.delay_for(Some(Duration::from_secs(3600))), Duration::from_secs(90));
    }

    #[tokio::test]
    async fn listing_reads_the_directory_tree_and_sends_token() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(
                "/repos/CSSEGISandData/COVID-19/git/trees/master:csse_covid_19_data/csse_covid_19_daily_reports",
            ))
            .and(header("authorization", "Bearer test-token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "sha": "tree0",
                "tree": [
                    {"path": "01-01-2021.csv", "mode": "100644", "type": "blob", "sha": "aaa"},
                    {"path": "nested", "mode": "040000", "type": "tree", "sha": "bbb"},
                    {"path": "README.md", "mode": "100644", "type": "blob", "sha": "ccc"}
                ],
                "truncated": false
            })))
            .expect(1)
            .mount(&server)
            .await;

        let entries = client_for(&server)
            .list_report_files("csse_covid_19_data/csse_covid_19_daily_reports")
            .await
            .expect("listing");
        assert_eq!(
            entries,
            vec![
                RemoteEntry {
                    name: "01-01-2021.csv".into(),
                    content_id: "aaa".into()
                },
                RemoteEntry {
                    name: "README.md".into(),
                    content_id: "ccc".into()
                },
            ]
        );
    }

    #[tokio::test]
    async fn blob_body_is_read_while_holding_the_in_flight_slot() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        use tokio::net::TcpListener;
        use tokio::sync::Notify;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accepted = Arc::new(AtomicUsize::new(0));
        let release = Arc::new(Notify::new());

        let server = tokio::spawn({
            let accepted = accepted.clone();
            let release = release.clone();
            async move {
                loop {
                    let (mut socket, _) = listener.accept().await.unwrap();
                    let n = accepted.fetch_add(1, Ordering::SeqCst);
                    let release = release.clone();
                    tokio::spawn(async move {
                        let mut request = Vec::new();
                        let mut buf = [0u8; 1024];
                        while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                            let read = socket.read(&mut buf).await.unwrap();
                            if read == 0 {
                                break;
                            }
                            request.extend_from_slice(&buf[..read]);
                        }
                        socket
                            .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 4\r\nconnection: close\r\n\r\nab")
                            .await
                            .unwrap();
                        // first response stalls mid-body until released
                        if n == 0 {
                            release.notified().await;
                        }
                        socket.write_all(b"cd").await.unwrap();
                        socket.shutdown().await.unwrap();
                    });
                }
            }
        });

        let client = Arc::new(
            GitHubClient::new(GitHubClientConfig {
                api_base: format!("http://{addr}"),
                max_in_flight: 1,
                ..Default::default()
            })
            .unwrap(),
        );
        let first = tokio::spawn({
            let client = client.clone();
            async move { client.fetch_file_content("first").await }
        });
        let second = tokio::spawn({
            let client = client.clone();
            async move { client.fetch_file_content("second").await }
        });

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(accepted.load(Ordering::SeqCst), 1);

        release.notify_one();
        assert_eq!(first.await.unwrap().unwrap(), "abcd");
        assert_eq!(second.await.unwrap().unwrap(), "abcd");
        assert_eq!(accepted.load(Ordering::SeqCst), 2);
        server.abort();
    }

    #[tokio::test]
    async fn blob_retries_once_after_rate_limit() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(BLOB_PATH))
            .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "0"))
            .up_to_n_times(1)
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path(BLOB_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_string("Lat,Long_\n"))
            .expect(1)
            .mount(&server)
            .await;

        let body = client_for(&server).fetch_file_content("abc123").await.expect("blob");
        assert_eq!(body, "Lat,Long_\n");
    }

    #[tokio::test]
    async fn exhausted_quota_header_is_treated_as_rate_limit() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(BLOB_PATH))
            .respond_with(
                ResponseTemplate::new(403)
                    .insert_header("x-ratelimit-remaining", "0")
                    .insert_header("x-ratelimit-reset", "0")
                    .set_body_string("API rate limit exceeded"),
            )
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path(BLOB_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
            .mount(&server)
            .await;

        let body = client_for(&server).fetch_file_content("abc123").await.expect("blob");
        assert_eq!(body, "ok");
    }

    #[tokio::test]
    async fn second_rate_limit_is_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(BLOB_PATH))
            .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "0"))
            .expect(2)
            .mount(&server)
            .await;

        let err = client_for(&server)
            .fetch_file_content("abc123")
            .await
            .expect_err("should give up");
        assert!(matches!(err, FetchError::RateLimited { .. }));
    }

    #[tokio::test]
    async fn abuse_limit_is_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(BLOB_PATH))
            .respond_with(
                ResponseTemplate::new(403)
                    .insert_header("retry-after", "0")
                    .set_body_string("You have exceeded a secondary rate limit."),
            )
            .expect(1)
            .mount(&server)
            .await;

        let err = client_for(&server)
            .fetch_file_content("abc123")
            .await
            .expect_err("should not retry");
        assert!(matches!(err, FetchError::AbuseDetected { .. }));
    }

    #[tokio::test]
    async fn other_statuses_surface_as_http_errors() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(BLOB_PATH))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&server)
            .await;

        let err = client_for(&server)
            .fetch_file_content("abc123")
            .await
            .expect_err("404");
        assert!(matches!(err, FetchError::HttpStatus { status: 404, .. }));
    }
}
