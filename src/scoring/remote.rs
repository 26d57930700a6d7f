//! HTTP client for the remote scoring service.
//!
//! The service accepts `POST {base}/score` with a JSON body of the form
//! `{"operation": "sentiment", "records": [{"id": "...", "text": "..."}]}` and
//! answers with `{"results": [{"id": "...", "score": 0.4, "category": "...",
//! "keywords": [...]}]}`.

use std::env;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::RETRY_AFTER;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};

use super::RemoteScorer;
use crate::error::{ConfigError, ScorerError};
use crate::types::{OperationType, Record, ScoreResult, ScoreSource, Sentiment};

/// Default request timeout for remote calls.
pub const DEFAULT_REMOTE_TIMEOUT: Duration = Duration::from_secs(30);

/// Remote scorer speaking the `/score` JSON protocol.
pub struct HttpRemoteScorer {
    /// Base URL for the API.
    api_base: String,
    /// Optional bearer token.
    api_key: Option<String>,
    timeout: Duration,
    http_client: Client,
}

impl HttpRemoteScorer {
    /// Create a new client.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidValue` if the base URL is empty or the
    /// HTTP client cannot be constructed.
    pub fn new(
        api_base: impl Into<String>,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Result<Self, ConfigError> {
        let api_base = api_base.into().trim_end_matches('/').to_string();
        if api_base.is_empty() {
            return Err(ConfigError::InvalidValue {
                key: "FEEDBACK_REMOTE_URL".to_string(),
                message: "base URL must not be empty".to_string(),
            });
        }

        let http_client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ConfigError::InvalidValue {
                key: "FEEDBACK_REMOTE_URL".to_string(),
                message: format!("failed to build HTTP client: {}", e),
            })?;

        Ok(Self {
            api_base,
            api_key,
            timeout,
            http_client,
        })
    }

    /// Create a client from environment variables.
    ///
    /// Reads `FEEDBACK_REMOTE_URL` (the client is only built when it is set)
    /// and `FEEDBACK_REMOTE_API_KEY` (optional).
    pub fn from_env(timeout: Duration) -> Result<Option<Self>, ConfigError> {
        let Ok(api_base) = env::var("FEEDBACK_REMOTE_URL") else {
            return Ok(None);
        };
        let api_key = env::var("FEEDBACK_REMOTE_API_KEY")
            .ok()
            .filter(|k| !k.is_empty());
        Self::new(api_base, api_key, timeout).map(Some)
    }

    /// Get the API base URL.
    pub fn api_base(&self) -> &str {
        &self.api_base
    }

    /// Check if an API key is configured.
    pub fn has_api_key(&self) -> bool {
        self.api_key.is_some()
    }
}

#[derive(Debug, Serialize)]
struct ApiRequest<'a> {
    operation: OperationType,
    records: Vec<ApiRecord<'a>>,
}

#[derive(Debug, Serialize)]
struct ApiRecord<'a> {
    id: &'a str,
    text: &'a str,
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    results: Vec<ApiResult>,
}

#[derive(Debug, Deserialize)]
struct ApiResult {
    id: String,
    score: f64,
    #[serde(default)]
    sentiment: Option<Sentiment>,
    #[serde(default)]
    category: Option<String>,
    #[serde(default)]
    keywords: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorResponse {
    error: ApiErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ApiErrorDetail {
    message: String,
}

impl ApiResult {
    fn into_score_result(self) -> Result<ScoreResult, ScorerError> {
        if !self.score.is_finite() {
            return Err(ScorerError::Malformed(format!(
                "non-finite score for record '{}'",
                self.id
            )));
        }
        let mut result = ScoreResult::new(
            self.id,
            self.score,
            self.category.unwrap_or_else(|| "general".to_string()),
        )
        .with_keywords(self.keywords)
        .with_source(ScoreSource::Remote);
        if let Some(sentiment) = self.sentiment {
            result.sentiment = sentiment;
        }
        Ok(result)
    }
}

/// Maps a non-success HTTP response to a scorer error.
fn error_for_status(status: StatusCode, retry_after: Option<&str>, body: &str) -> ScorerError {
    let message = serde_json::from_str::<ApiErrorResponse>(body)
        .map(|e| e.error.message)
        .unwrap_or_else(|_| body.trim().to_string());

    if status == StatusCode::TOO_MANY_REQUESTS {
        return match retry_after {
            Some(after) => ScorerError::RateLimited(format!("{} (retry after {}s)", message, after)),
            None => ScorerError::RateLimited(message),
        };
    }

    ScorerError::ServiceError {
        code: status.as_u16(),
        message,
    }
}

fn error_for_transport(error: reqwest::Error, timeout: Duration) -> ScorerError {
    if error.is_timeout() {
        ScorerError::Timeout(timeout)
    } else {
        ScorerError::ServiceError {
            code: 0,
            message: error.to_string(),
        }
    }
}

#[async_trait]
impl RemoteScorer for HttpRemoteScorer {
    async fn score(
        &self,
        operation: OperationType,
        records: &[Record],
    ) -> Result<Vec<ScoreResult>, ScorerError> {
        let request = ApiRequest {
            operation,
            records: records
                .iter()
                .map(|r| ApiRecord {
                    id: &r.id,
                    text: &r.text,
                })
                .collect(),
        };

        let url = format!("{}/score", self.api_base);
        let mut http_request = self
            .http_client
            .post(&url)
            .header("Content-Type", "application/json");

        if let Some(ref api_key) = self.api_key {
            http_request = http_request.header("Authorization", format!("Bearer {}", api_key));
        }

        let http_response = http_request
            .json(&request)
            .send()
            .await
            .map_err(|e| error_for_transport(e, self.timeout))?;

        let status = http_response.status();
        if !status.is_success() {
            let retry_after = http_response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            let body = http_response
                .text()
                .await
                .unwrap_or_else(|_| "Failed to read error response".to_string());
            return Err(error_for_status(status, retry_after.as_deref(), &body));
        }

        let body = http_response.text().await.map_err(|e| error_for_transport(e, self.timeout))?;
        let api_response: ApiResponse = serde_json::from_str(&body)
            .map_err(|e| ScorerError::Malformed(format!("Failed to parse response: {}", e)))?;

        api_response
            .results
            .into_iter()
            .map(ApiResult::into_score_result)
            .collect()
    }

    fn name(&self) -> &str {
        &self.api_base
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    /// Mounts one `/score` response on a fresh mock server.
    async fn score_server(response: ResponseTemplate) -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/score"))
            .respond_with(response)
            .mount(&server)
            .await;
        server
    }

    fn records() -> Vec<Record> {
        vec![Record::new("a", "great"), Record::new("b", "bad")]
    }

    #[test]
    fn test_rejects_empty_base() {
        assert!(HttpRemoteScorer::new("", None, DEFAULT_REMOTE_TIMEOUT).is_err());
        let scorer =
            HttpRemoteScorer::new("http://scorer.local/", Some("k".into()), DEFAULT_REMOTE_TIMEOUT)
                .expect("client");
        assert_eq!(scorer.api_base(), "http://scorer.local");
        assert!(scorer.has_api_key());
    }

    #[test]
    fn test_status_mapping() {
        let err = error_for_status(
            StatusCode::TOO_MANY_REQUESTS,
            Some("12"),
            r#"{"error":{"message":"quota exceeded"}}"#,
        );
        match err {
            ScorerError::RateLimited(msg) => {
                assert!(msg.contains("quota exceeded"));
                assert!(msg.contains("12"));
            }
            other => panic!("unexpected error: {:?}", other),
        }

        let err = error_for_status(StatusCode::SERVICE_UNAVAILABLE, None, "down for maintenance");
        assert!(matches!(err, ScorerError::ServiceError { code: 503, .. }));
    }

    #[tokio::test]
    async fn test_successful_response() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/score"))
            .and(header("Authorization", "Bearer secret"))
            .and(body_partial_json(json!({
                "operation": "sentiment",
                "records": [{"id": "a", "text": "great"}, {"id": "b", "text": "bad"}]
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "results": [
                    {"id": "a", "score": 0.8, "category": "support", "keywords": ["great"]},
                    {"id": "b", "score": -0.6, "sentiment": "negative"}
                ]
            })))
            .expect(1)
            .mount(&server)
            .await;
        let scorer = HttpRemoteScorer::new(server.uri(), Some("secret".into()), Duration::from_secs(5))
            .expect("client");

        let results = scorer
            .score(OperationType::Sentiment, &records())
            .await
            .expect("score");

        assert_eq!(results.len(), 2);
        assert_eq!(results[0].category, "support");
        assert_eq!(results[0].sentiment, Sentiment::Positive);
        assert_eq!(results[1].category, "general");
        assert!(results.iter().all(|r| r.source == ScoreSource::Remote));
    }

    #[tokio::test]
    async fn test_rate_limited_response() {
        let server = score_server(
            ResponseTemplate::new(429)
                .insert_header("Retry-After", "30")
                .set_body_json(json!({"error": {"message": "slow down"}})),
        )
        .await;
        let scorer = HttpRemoteScorer::new(server.uri(), None, Duration::from_secs(5)).expect("client");

        let err = scorer
            .score(OperationType::Sentiment, &records())
            .await
            .expect_err("429 should fail");
        assert!(matches!(err, ScorerError::RateLimited(ref m) if m.contains("slow down") && m.contains("30")));
    }

    #[tokio::test]
    async fn test_server_error_is_service_error() {
        let server = score_server(ResponseTemplate::new(502).set_body_string("bad gateway")).await;
        let scorer = HttpRemoteScorer::new(server.uri(), None, Duration::from_secs(5)).expect("client");

        let err = scorer
            .score(OperationType::Categorization, &records())
            .await
            .expect_err("502 should fail");
        assert!(matches!(err, ScorerError::ServiceError { code: 502, .. }));
        assert!(err.is_recoverable());
    }

    #[tokio::test]
    async fn test_malformed_body() {
        let server = score_server(ResponseTemplate::new(200).set_body_json(json!({"unexpected": true}))).await;
        let scorer = HttpRemoteScorer::new(server.uri(), None, Duration::from_secs(5)).expect("client");

        let err = scorer
            .score(OperationType::Sentiment, &records())
            .await
            .expect_err("bad body should fail");
        assert!(matches!(err, ScorerError::Malformed(_)));
    }

    #[tokio::test]
    async fn test_timeout_maps_to_timeout() {
        let server = score_server(
            ResponseTemplate::new(200)
                .set_body_json(json!({"results": []}))
                .set_delay(Duration::from_secs(5)),
        )
        .await;
        let scorer = HttpRemoteScorer::new(server.uri(), None, Duration::from_millis(100))
            .expect("client");

        let err = scorer
            .score(OperationType::Sentiment, &records())
            .await
            .expect_err("should time out");
        assert!(matches!(err, ScorerError::Timeout(_)));
    }
}
