//! HTTP transport shared by the built-in integrations.
//!
//! Integrations describe what to send as an [`ApiRequest`]; a [`Transport`]
//! sends it. [`HttpTransport`] talks to the real destination over `reqwest`
//! and classifies responses so the dispatcher knows what to retry:
//!
//! ```text
//! Response                  | Result
//! --------------------------|-----------------------------------
//! 2xx                       | Ok(ApiResponse)
//! 429, 5xx                  | Err(Unavailable)  -- retryable
//! other 4xx                 | Err(Rejected)     -- fatal
//! connect error / timeout   | Err(Http)         -- retryable
//! ```
//!
//! Retrying itself is the dispatcher's job; the transport makes one attempt.

use super::{Credential, IntegrationError};
use async_trait::async_trait;
use reqwest::{Client, Method, StatusCode};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, warn};

/// Default timeout for destination requests
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

const USER_AGENT: &str = "forwardlytics";

/// Payload of an API request.
#[derive(Debug, Clone, PartialEq)]
pub enum ApiBody {
    /// JSON request body
    Json(Value),
    /// Query string parameters, no body
    Query(Vec<(String, String)>),
}

/// A request to a destination API, relative to the transport's base URL.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiRequest {
    pub method: Method,
    pub endpoint: String,
    pub body: ApiBody,
}

impl ApiRequest {
    pub fn post_json(endpoint: impl Into<String>, payload: Value) -> Self {
        Self {
            method: Method::POST,
            endpoint: endpoint.into(),
            body: ApiBody::Json(payload),
        }
    }

    pub fn get_query(endpoint: impl Into<String>, params: Vec<(String, String)>) -> Self {
        Self {
            method: Method::GET,
            endpoint: endpoint.into(),
            body: ApiBody::Query(params),
        }
    }
}

/// A successful (2xx) destination response.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiResponse {
    pub status: u16,
    pub body: String,
}

/// Sends [`ApiRequest`]s to a destination.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: ApiRequest) -> Result<ApiResponse, IntegrationError>;
}

/// How requests authenticate against the destination.
#[derive(Debug, Clone)]
pub enum Auth {
    None,
    /// HTTP basic auth, credentials resolved per request
    Basic {
        username: Credential,
        password: Option<Credential>,
    },
}

/// [`Transport`] over HTTP.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    /// Base URL, endpoints are appended to it
    base_url: String,

    /// HTTP client (reused for connection pooling)
    client: Client,

    timeout: Duration,

    auth: Auth,
}

impl HttpTransport {
    pub fn new(base_url: impl Into<String>, client: Client) -> Self {
        Self {
            base_url: base_url.into(),
            client,
            timeout: DEFAULT_TIMEOUT,
            auth: Auth::None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_auth(mut self, auth: Auth) -> Self {
        self.auth = auth;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, endpoint: &str) -> String {
        format!("{}{}", self.base_url, endpoint)
    }
}

/// Map a non-success status to the matching error.
fn classify_status(status: StatusCode, body: String) -> IntegrationError {
    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        IntegrationError::Unavailable(format!("{}: {}", status, body))
    } else {
        IntegrationError::Rejected {
            status: status.as_u16(),
            body,
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, request: ApiRequest) -> Result<ApiResponse, IntegrationError> {
        let url = self.url(&request.endpoint);

        debug!(method = %request.method, url = %url, "Sending request to destination");

        let mut builder = self
            .client
            .request(request.method.clone(), &url)
            .timeout(self.timeout)
            .header(reqwest::header::USER_AGENT, USER_AGENT);

        builder = match &request.body {
            ApiBody::Json(payload) => builder.json(payload),
            ApiBody::Query(params) => builder.query(params),
        };

        if let Auth::Basic { username, password } = &self.auth {
            builder = builder.basic_auth(
                username.get().unwrap_or_default(),
                password.as_ref().and_then(Credential::get),
            );
        }

        let response = builder.send().await.map_err(|e| {
            warn!(error = %e, url = %url, "Destination request failed");
            IntegrationError::Http(e)
        })?;

        let status = response.status();
        let body = response.text().await?;

        if status.is_success() {
            return Ok(ApiResponse {
                status: status.as_u16(),
                body,
            });
        }

        warn!(
            status = %status,
            url = %url,
            response = %body,
            "Destination returned an error"
        );
        Err(classify_status(status, body))
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Recording transport standing in for a destination API.

    use super::*;
    use parking_lot::Mutex;
    use std::collections::VecDeque;

    #[derive(Default)]
    pub(crate) struct RecordingTransport {
        requests: Mutex<Vec<ApiRequest>>,
        responses: Mutex<VecDeque<Result<ApiResponse, IntegrationError>>>,
    }

    impl RecordingTransport {
        /// Queue the outcome of the next request. Unscripted requests get `200 ""`.
        pub(crate) fn respond_with(&self, outcome: Result<ApiResponse, IntegrationError>) {
            self.responses.lock().push_back(outcome);
        }

        pub(crate) fn requests(&self) -> Vec<ApiRequest> {
            self.requests.lock().clone()
        }

        pub(crate) fn last(&self) -> ApiRequest {
            self.requests
                .lock()
                .last()
                .cloned()
                .expect("no request was sent")
        }
    }

    #[async_trait]
    impl Transport for RecordingTransport {
        async fn send(&self, request: ApiRequest) -> Result<ApiResponse, IntegrationError> {
            self.requests.lock().push(request);
            self.responses.lock().pop_front().unwrap_or(Ok(ApiResponse {
                status: 200,
                body: String::new(),
            }))
        }
    }
}
