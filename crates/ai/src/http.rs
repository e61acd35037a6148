//! reqwest-backed generation client.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use tracing::debug;

use crate::client::GenerationClient;
use crate::error::GenerationError;
use crate::request::{GenerationOutput, GenerationRequest};

/// Connection settings for [`HttpGenerationClient`].
#[derive(Debug, Clone)]
pub struct HttpGenerationConfig {
    pub base_url: String,
    pub api_key: String,
    /// Transport-level timeout; the breaker applies its own per-call bound.
    pub request_timeout: Duration,
    pub dependency: String,
}

impl HttpGenerationConfig {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
            request_timeout: Duration::from_secs(120),
            dependency: "generation".to_string(),
        }
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_dependency(mut self, name: impl Into<String>) -> Self {
        self.dependency = name.into();
        self
    }
}

pub struct HttpGenerationClient {
    client: Client,
    endpoint: String,
    api_key: String,
    dependency: String,
}

impl HttpGenerationClient {
    pub fn new(config: HttpGenerationConfig) -> Result<Self, reqwest::Error> {
        let client = Client::builder().timeout(config.request_timeout).build()?;
        Ok(Self {
            client,
            endpoint: format!("{}/generations", config.base_url.trim_end_matches('/')),
            api_key: config.api_key,
            dependency: config.dependency,
        })
    }
}

impl std::fmt::Debug for HttpGenerationClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpGenerationClient")
            .field("endpoint", &self.endpoint)
            .field("dependency", &self.dependency)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    #[serde(default)]
    id: Option<String>,
    content: String,
    #[serde(default)]
    usage: Option<ApiUsage>,
}

#[derive(Debug, Deserialize)]
struct ApiUsage {
    total_tokens: i64,
}

#[derive(Debug, Deserialize)]
struct ApiErrorResponse {
    error: ApiErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ApiErrorDetail {
    message: String,
}

#[async_trait]
impl GenerationClient for HttpGenerationClient {
    fn dependency(&self) -> &str {
        &self.dependency
    }

    async fn generate(&self, request: &GenerationRequest) -> Result<GenerationOutput, GenerationError> {
        debug!(job_id = %request.job_id, endpoint = %self.endpoint, "calling generation service");

        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(request)
            .send()
            .await
            .map_err(|e| GenerationError::transient(format!("request failed: {e}")))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| GenerationError::transient(format!("failed to read response: {e}")))?;

        if !status.is_success() {
            return Err(classify_status(status, &body));
        }

        let parsed: ApiResponse =
            serde_json::from_str(&body).map_err(|e| GenerationError::Decode(e.to_string()))?;

        Ok(GenerationOutput {
            content: parsed.content,
            external_request_id: parsed.id,
            tokens_used: parsed.usage.map(|u| u.total_tokens),
            raw_response: body,
        })
    }
}

fn classify_status(status: StatusCode, body: &str) -> GenerationError {
    let message = serde_json::from_str::<ApiErrorResponse>(body)
        .map(|e| e.error.message)
        .unwrap_or_else(|_| body.to_string());

    if status == StatusCode::TOO_MANY_REQUESTS {
        GenerationError::RateLimited(message)
    } else if status.is_server_error() || status == StatusCode::REQUEST_TIMEOUT {
        GenerationError::Transient(format!("{status}: {message}"))
    } else {
        GenerationError::Rejected {
            status: status.as_u16(),
            message,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use axum::{Json, Router, http::HeaderMap, routing::post};
    use coursegen_core::{AcademicYear, JobId, SubjectId, TemplateId};
    use serde_json::json;

    async fn spawn(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn request() -> GenerationRequest {
        GenerationRequest::from_payload(
            JobId::new(),
            SubjectId::new(),
            AcademicYear::parse("2025").unwrap(),
            TemplateId::new(),
            json!({"outline": true}),
        )
        .unwrap()
    }

    fn client(base_url: &str) -> HttpGenerationClient {
        HttpGenerationClient::new(HttpGenerationConfig::new(base_url, "test-key")).unwrap()
    }

    #[test]
    fn status_classification() {
        assert!(classify_status(StatusCode::BAD_GATEWAY, "").is_transient());
        assert!(classify_status(StatusCode::TOO_MANY_REQUESTS, "").is_transient());
        let err = classify_status(
            StatusCode::UNPROCESSABLE_ENTITY,
            r#"{"error":{"message":"unknown template"}}"#,
        );
        assert_eq!(
            err,
            GenerationError::Rejected {
                status: 422,
                message: "unknown template".into()
            }
        );
    }

    #[tokio::test]
    async fn successful_call_decodes_output_and_sends_bearer_key() {
        let router = Router::new().route(
            "/generations",
            post(|headers: HeaderMap, Json(body): Json<serde_json::Value>| async move {
                let auth = headers
                    .get("authorization")
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or_default()
                    .to_string();
                Json(json!({
                    "id": "req-42",
                    "content": format!("{auth}|{}", body["academic_year"]),
                    "usage": {"total_tokens": 1234},
                }))
            }),
        );
        let base = spawn(router).await;

        let out = client(&base).generate(&request()).await.unwrap();
        assert_eq!(out.content, "Bearer test-key|\"2025\"");
        assert_eq!(out.external_request_id.as_deref(), Some("req-42"));
        assert_eq!(out.tokens_used, Some(1234));
        assert!(out.raw_response.contains("req-42"));
    }

    #[tokio::test]
    async fn server_error_is_transient() {
        let router = Router::new().route(
            "/generations",
            post(|| async { (axum::http::StatusCode::SERVICE_UNAVAILABLE, "overloaded") }),
        );
        let base = spawn(router).await;

        let err = client(&base).generate(&request()).await.unwrap_err();
        assert!(err.is_transient(), "{err:?}");
    }

    #[tokio::test]
    async fn unreachable_service_is_transient() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = client(&format!("http://{addr}"))
            .generate(&request())
            .await
            .unwrap_err();
        assert!(err.is_transient(), "{err:?}");
    }
}
