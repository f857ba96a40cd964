//! Generic JSON REST provider.
//!
//! Objects live under `<endpoint>/v1/<kind>`; creation carries the client
//! token in an `Idempotency-Key` header. Failures are classified here so
//! that callers never inspect HTTP details: 429, 5xx and allow-listed error
//! codes are transient, 404 means the object is gone, 401/403 is an
//! authentication failure.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, StatusCode, header};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, trace};

use crate::error::{DeployError, ProviderError, Result};
use crate::poll::{RetryPolicy, retry_transient};

use super::api::{ProviderApi, ProviderObject};

/// Default request timeout in seconds.
const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Error codes that are always retried.
const DEFAULT_TRANSIENT_CODES: &[&str] = &[
    "RequestLimitExceeded",
    "Throttling",
    "InternalError",
    "ServiceUnavailable",
    "IncorrectState",
];

/// Error body returned by the API.
#[derive(Debug, Default, Deserialize)]
struct ApiErrorBody {
    #[serde(default)]
    code: String,
    #[serde(default)]
    message: String,
}

/// REST provider client.
#[derive(Debug, Clone)]
pub struct RestProvider {
    /// Provider name.
    name: String,
    /// HTTP client.
    client: Client,
    /// API base URL, without trailing slash.
    endpoint: String,
    /// Bearer token.
    token: String,
    /// Backoff for transient failures.
    retry: RetryPolicy,
    /// Error codes treated as transient.
    transient_codes: Vec<String>,
}

impl RestProvider {
    /// Creates a new client.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be created.
    pub fn new(name: &str, endpoint: &str, token: &str) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
            .build()
            .map_err(|e| ProviderError::network(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            name: name.to_string(),
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            token: token.to_string(),
            retry: RetryPolicy::default(),
            transient_codes: DEFAULT_TRANSIENT_CODES
                .iter()
                .map(|c| (*c).to_string())
                .collect(),
        })
    }

    /// Replaces the retry policy.
    #[must_use]
    pub const fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Adds provider-specific transient error codes.
    #[must_use]
    pub fn with_transient_codes(mut self, codes: &[String]) -> Self {
        self.transient_codes.extend(codes.iter().cloned());
        self
    }

    fn url(&self, kind: &str, id: Option<&str>, action: Option<&str>) -> String {
        let mut url = format!("{}/v1/{kind}", self.endpoint);
        if let Some(id) = id {
            url.push('/');
            url.push_str(id);
        }
        if let Some(action) = action {
            url.push_str("/actions/");
            url.push_str(action);
        }
        url
    }

    fn request(&self, method: Method, url: &str) -> RequestBuilder {
        self.client
            .request(method, url)
            .header(header::CONTENT_TYPE, "application/json")
            .header(header::AUTHORIZATION, format!("Bearer {}", self.token))
    }

    /// Sends one request and returns the body of a successful response.
    ///
    /// A 404 yields `Ok(None)`.
    async fn send_once(&self, builder: RequestBuilder) -> Result<Option<Value>> {
        let response = builder
            .send()
            .await
            .map_err(|e| ProviderError::network(format!("Request failed: {e}")))?;

        let status = response.status();
        trace!("Provider {} answered {status}", self.name);

        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }

        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(ProviderError::AuthenticationFailed {
                message: format!("{} rejected the API token", self.name),
            }
            .into());
        }

        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let body: ApiErrorBody = serde_json::from_str(&text).unwrap_or_else(|_| ApiErrorBody {
                code: String::new(),
                message: text,
            });
            return Err(self.classify(status, body));
        }

        if status == StatusCode::NO_CONTENT {
            return Ok(Some(Value::Null));
        }

        let body = response.json::<Value>().await.map_err(|e| ProviderError::InvalidResponse {
            message: format!("Failed to parse response: {e}"),
        })?;
        Ok(Some(body))
    }

    fn classify(&self, status: StatusCode, body: ApiErrorBody) -> DeployError {
        let transient = status == StatusCode::TOO_MANY_REQUESTS
            || status.is_server_error()
            || self.transient_codes.iter().any(|c| *c == body.code);

        if transient {
            let code = if body.code.is_empty() {
                status.as_u16().to_string()
            } else {
                body.code
            };
            return ProviderError::Transient {
                code,
                message: body.message,
            }
            .into();
        }

        ProviderError::Api {
            status: status.as_u16(),
            code: body.code,
            message: body.message,
        }
        .into()
    }

    /// Sends a request with transient-error retries.
    async fn send(
        &self,
        what: &str,
        method: Method,
        url: &str,
        body: Option<&Value>,
        idempotency_key: Option<&str>,
    ) -> Result<Option<Value>> {
        retry_transient(&self.retry, what, || {
            let mut builder = self.request(method.clone(), url);
            if let Some(body) = body {
                builder = builder.json(body);
            }
            if let Some(key) = idempotency_key {
                builder = builder.header("Idempotency-Key", key);
            }
            self.send_once(builder)
        })
        .await
    }
}

fn decode_object(value: Value) -> Result<ProviderObject> {
    serde_json::from_value(value).map_err(|e| {
        ProviderError::InvalidResponse {
            message: format!("Unexpected object format: {e}"),
        }
        .into()
    })
}

#[async_trait]
impl ProviderApi for RestProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn create(&self, kind: &str, spec: &Value, client_token: &str) -> Result<ProviderObject> {
        debug!("Creating {kind} on {}", self.name);
        let url = self.url(kind, None, None);
        let body = self
            .send(&format!("create {kind}"), Method::POST, &url, Some(spec), Some(client_token))
            .await?
            .ok_or_else(|| ProviderError::Api {
                status: 404,
                code: String::from("NotFound"),
                message: format!("{kind} is not supported by {}", self.name),
            })?;
        decode_object(body)
    }

    async fn describe(&self, kind: &str, id: &str) -> Result<Option<ProviderObject>> {
        let url = self.url(kind, Some(id), None);
        self.send(&format!("describe {kind} {id}"), Method::GET, &url, None, None)
            .await?
            .map(decode_object)
            .transpose()
    }

    async fn modify(&self, kind: &str, id: &str, changes: &Value) -> Result<ProviderObject> {
        debug!("Modifying {kind} {id} on {}", self.name);
        let url = self.url(kind, Some(id), None);
        let body = self
            .send(&format!("modify {kind} {id}"), Method::PATCH, &url, Some(changes), None)
            .await?
            .ok_or_else(|| ProviderError::disappeared(kind, id))?;
        decode_object(body)
    }

    async fn delete(&self, kind: &str, id: &str) -> Result<()> {
        debug!("Deleting {kind} {id} on {}", self.name);
        let url = self.url(kind, Some(id), None);
        self.send(&format!("delete {kind} {id}"), Method::DELETE, &url, None, None)
            .await?
            .ok_or_else(|| ProviderError::disappeared(kind, id))?;
        Ok(())
    }

    async fn action(
        &self,
        kind: &str,
        id: &str,
        action: &str,
        params: &Value,
    ) -> Result<ProviderObject> {
        debug!("Running {action} on {kind} {id}");
        let url = self.url(kind, Some(id), Some(action));
        let body = self
            .send(&format!("{action} {kind} {id}"), Method::POST, &url, Some(params), None)
            .await?
            .ok_or_else(|| ProviderError::disappeared(kind, id))?;
        decode_object(body)
    }
}
