//! HTTP client for the Fleety support API
//!
//! Every non-success response is decoded into a [`WidgetError`] by a single
//! routine so rate limits, depleted credits and expired sessions read the
//! same no matter which endpoint produced them.

use std::time::Duration;

use reqwest::header::RETRY_AFTER;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::Retry;

use fleety_shared::{
    AddMessageRequest, ChatRequest, CreateTicketRequest, InitSessionRequest, InitSessionResponse,
    MarkReadRequest, ProjectId, Reader, Ticket, TicketSlug, WidgetError, WidgetResult,
};

/// Maximum number of retries for idempotent reads
const MAX_RETRIES: usize = 3;

/// Base delay for exponential backoff (ms)
const RETRY_BASE_DELAY_MS: u64 = 100;

/// Maximum delay between retries
const RETRY_MAX_DELAY: Duration = Duration::from_secs(5);

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Thin typed wrapper over the support REST endpoints
#[derive(Debug, Clone)]
pub struct ApiClient {
    http: Client,
    base_url: String,
    request_timeout: Duration,
}

impl ApiClient {
    pub fn new(base_url: impl Into<String>, request_timeout: Duration) -> WidgetResult<Self> {
        // No client-wide timeout: it would also cut off long chat streams.
        let http = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(WidgetError::transport)?;

        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            request_timeout,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn ticket_url(&self, project_id: &ProjectId, slug: &TicketSlug, suffix: &str) -> String {
        self.url(&format!("/tickets/{}/{}{}", project_id, slug, suffix))
    }

    async fn send(&self, request: RequestBuilder) -> WidgetResult<Response> {
        let response = request.send().await.map_err(WidgetError::transport)?;
        if response.status().is_success() {
            Ok(response)
        } else {
            Err(decode_error(response).await)
        }
    }

    async fn send_json<T: DeserializeOwned>(&self, request: RequestBuilder) -> WidgetResult<T> {
        let response = self.send(request.timeout(self.request_timeout)).await?;
        response.json().await.map_err(WidgetError::transport)
    }

    /// Exchange a project id for an anonymous session token
    pub async fn init_session(&self, project_id: &ProjectId) -> WidgetResult<InitSessionResponse> {
        let body = InitSessionRequest {
            project_id: project_id.clone(),
        };
        self.send_json(self.http.post(self.url("/init-session")).json(&body))
            .await
    }

    /// Start a chat exchange. The body is left unread so the caller can
    /// stream it.
    pub async fn chat(&self, token: &str, request: &ChatRequest) -> WidgetResult<Response> {
        self.send(
            self.http
                .post(self.url("/chat/tools"))
                .bearer_auth(token)
                .json(request),
        )
        .await
    }

    pub async fn create_ticket(&self, request: &CreateTicketRequest) -> WidgetResult<Ticket> {
        self.send_json(self.http.post(self.url("/tickets")).json(request))
            .await
    }

    pub async fn get_ticket(&self, project_id: &ProjectId, slug: &TicketSlug) -> WidgetResult<Ticket> {
        self.send_json(self.http.get(self.ticket_url(project_id, slug, "")))
            .await
    }

    /// Fetch a ticket, retrying transient failures with jittered backoff
    pub async fn get_ticket_with_retry(
        &self,
        project_id: &ProjectId,
        slug: &TicketSlug,
    ) -> WidgetResult<Ticket> {
        let retry_strategy = ExponentialBackoff::from_millis(RETRY_BASE_DELAY_MS)
            .max_delay(RETRY_MAX_DELAY)
            .map(jitter)
            .take(MAX_RETRIES);

        // Transient errors go to the Err side so tokio-retry tries again;
        // everything else is final and rides on the Ok side.
        Retry::spawn(retry_strategy, || async move {
            let result = self.get_ticket(project_id, slug).await;
            match &result {
                Err(e) if e.is_transient() => {
                    tracing::debug!(ticket = %slug, error = %e, "Transient error fetching ticket, will retry");
                    Err(result)
                }
                _ => Ok(result),
            }
        })
        .await
        .unwrap_or_else(|last| last)
    }

    pub async fn add_message(
        &self,
        project_id: &ProjectId,
        slug: &TicketSlug,
        request: &AddMessageRequest,
    ) -> WidgetResult<()> {
        self.send(
            self.http
                .post(self.ticket_url(project_id, slug, "/messages"))
                .json(request)
                .timeout(self.request_timeout),
        )
        .await?;
        Ok(())
    }

    pub async fn mark_read(
        &self,
        project_id: &ProjectId,
        slug: &TicketSlug,
        reader: Reader,
    ) -> WidgetResult<()> {
        self.send(
            self.http
                .patch(self.ticket_url(project_id, slug, "/messages/read"))
                .json(&MarkReadRequest { reader })
                .timeout(self.request_timeout),
        )
        .await?;
        Ok(())
    }
}

/// Turn a non-success response into the error taxonomy
async fn decode_error(response: Response) -> WidgetError {
    let status = response.status();
    let retry_after = response
        .headers()
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs);

    let body: Value = response.json().await.unwrap_or(Value::Null);
    let error = classify(status, error_message(&body), retry_after);

    tracing::debug!(status = status.as_u16(), error = %error, "API request failed");
    error
}

/// Human readable message from the error bodies the backend produces:
/// `{"message": ...}`, `{"error": "..."}` or `{"error": {"message": ...}}`
pub(crate) fn error_message(body: &Value) -> Option<String> {
    body.get("message")
        .and_then(Value::as_str)
        .or_else(|| body.get("error").and_then(Value::as_str))
        .or_else(|| {
            body.get("error")
                .and_then(|e| e.get("message"))
                .and_then(Value::as_str)
        })
        .map(str::to_string)
}

pub(crate) fn classify(
    status: StatusCode,
    message: Option<String>,
    retry_after: Option<Duration>,
) -> WidgetError {
    match status {
        StatusCode::TOO_MANY_REQUESTS => WidgetError::RateLimited {
            message: message.unwrap_or_else(|| "You're sending requests too fast.".to_string()),
            retry_after,
        },
        StatusCode::PAYMENT_REQUIRED => WidgetError::CreditsDepleted(message.unwrap_or_else(|| {
            "This project has run out of credits. AI features are disabled.".to_string()
        })),
        StatusCode::UNAUTHORIZED => WidgetError::AuthExpired,
        StatusCode::FORBIDDEN
            if message
                .as_deref()
                .is_some_and(|m| m.to_lowercase().contains("expired")) =>
        {
            WidgetError::AuthExpired
        }
        StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => {
            WidgetError::Validation(message.unwrap_or_else(|| "Invalid request".to_string()))
        }
        _ => WidgetError::Server {
            status: status.as_u16(),
            message: message.unwrap_or_else(|| format!("HTTP {}", status.as_u16())),
        },
    }
}
