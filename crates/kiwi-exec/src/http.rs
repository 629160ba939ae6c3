// SPDX-License-Identifier: MIT OR Apache-2.0
//! The http_client primitive.
//!
//! One connection-pooled `reqwest` client is shared across every call in
//! the process. Retries use linear backoff (`retry_delay × (attempt + 1)`)
//! and apply to retryable statuses, timeouts, and connection errors —
//! never to unknown failures.

use kiwi_core::expand::{expand_env, expand_value_env, render_template, render_value};
use kiwi_error::{KernelError, KernelResult};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::OnceLock;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Default request timeout, in seconds.
pub const DEFAULT_TIMEOUT_SECS: f64 = 30.0;

/// Statuses retried by default.
pub const DEFAULT_RETRYABLE: &[u16] = &[502, 503, 504, 429];

static CLIENT: OnceLock<reqwest::Client> = OnceLock::new();

/// The process-wide pooled client (≤20 idle keep-alive per host).
fn client() -> &'static reqwest::Client {
    CLIENT.get_or_init(|| {
        reqwest::Client::builder()
            .pool_max_idle_per_host(20)
            .build()
            .unwrap_or_default()
    })
}

/// Authentication config; every field goes through `${VAR}` expansion.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    /// `bearer`, `basic`, or `api_key`.
    #[serde(rename = "type")]
    pub auth_type: String,
    /// Bearer token.
    #[serde(default)]
    pub token: Option<String>,
    /// Basic-auth username.
    #[serde(default)]
    pub username: Option<String>,
    /// Basic-auth password.
    #[serde(default)]
    pub password: Option<String>,
    /// Header name for api_key auth (default `X-API-Key`).
    #[serde(default)]
    pub header: Option<String>,
    /// Header value for api_key auth.
    #[serde(default)]
    pub value: Option<String>,
}

/// HTTP execution config, deserialized from a merged chain config.
#[derive(Debug, Clone, Deserialize)]
pub struct HttpConfig {
    /// HTTP method, default GET.
    #[serde(default = "default_method")]
    pub method: String,
    /// Literal request URL.
    #[serde(default)]
    pub url: Option<String>,
    /// URL with `{name}` placeholders filled from params.
    #[serde(default)]
    pub url_template: Option<String>,
    /// Request headers; values are param-templated then env-expanded.
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// Literal body (string or JSON).
    #[serde(default)]
    pub body: Option<Value>,
    /// Body with `{name}` templating applied through maps and lists.
    #[serde(default)]
    pub body_template: Option<Value>,
    /// Authentication.
    #[serde(default)]
    pub auth: Option<AuthConfig>,
    /// Seconds before one attempt times out.
    #[serde(default = "default_timeout")]
    pub timeout: f64,
    /// Additional attempts after the first.
    #[serde(default)]
    pub retries: u32,
    /// Base backoff delay in seconds; attempt `n` waits `delay × (n + 1)`.
    #[serde(default = "default_retry_delay")]
    pub retry_delay: f64,
    /// Statuses that trigger a retry.
    #[serde(default = "default_retryable")]
    pub retryable_statuses: Vec<u16>,
    /// JSONPath applied to JSON responses.
    #[serde(default)]
    pub response_transform: Option<String>,
}

fn default_method() -> String {
    "GET".to_string()
}

fn default_timeout() -> f64 {
    DEFAULT_TIMEOUT_SECS
}

fn default_retry_delay() -> f64 {
    1.0
}

fn default_retryable() -> Vec<u16> {
    DEFAULT_RETRYABLE.to_vec()
}

impl HttpConfig {
    /// Build from a merged chain config map.
    pub fn from_config(config: &Map<String, Value>) -> KernelResult<Self> {
        serde_json::from_value(Value::Object(config.clone()))
            .map_err(|e| KernelError::execution_failed(format!("invalid http config: {e}")))
    }
}

/// Result of one http_client execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpOutput {
    /// Final status ∈ [200, 300).
    pub success: bool,
    /// Final HTTP status (0 when no response was ever received).
    pub status_code: u16,
    /// Parsed JSON body when possible (post-transform), else the raw text.
    pub body: Value,
    /// Response headers.
    pub headers: BTreeMap<String, String>,
    /// Wall-clock duration across all attempts.
    pub duration_ms: u64,
    /// Transport-level failure cause, when no response arrived.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

enum AttemptFailure {
    Timeout(String),
    Connect(String),
    Other(String),
}

/// Issue a request, retrying per config.
pub async fn execute(
    config: &HttpConfig,
    params: &BTreeMap<String, Value>,
) -> KernelResult<HttpOutput> {
    let template = config
        .url_template
        .as_deref()
        .or(config.url.as_deref())
        .ok_or_else(|| {
            KernelError::execution_failed("http config declares neither url nor url_template")
        })?;
    let url = expand_env(&render_template(template, params));

    let method = reqwest::Method::from_bytes(config.method.to_uppercase().as_bytes())
        .map_err(|_| {
            KernelError::execution_failed(format!("invalid http method '{}'", config.method))
        })?;

    let start = Instant::now();
    let max_attempts = config.retries + 1;
    let mut last_failure: Option<AttemptFailure> = None;

    for attempt in 0..max_attempts {
        if attempt > 0 {
            let delay = Duration::from_secs_f64(config.retry_delay * attempt as f64);
            tokio::time::sleep(delay).await;
        }

        let request = build_request(config, method.clone(), &url, params)?;
        match request.send().await {
            Ok(response) => {
                let status = response.status().as_u16();
                let retryable = config.retryable_statuses.contains(&status);
                if retryable && attempt + 1 < max_attempts {
                    debug!(target: "kiwi.exec.http", status, attempt, "retryable status, backing off");
                    continue;
                }
                return Ok(finish(config, response, start).await);
            }
            Err(e) => {
                let failure = if e.is_timeout() {
                    AttemptFailure::Timeout(e.to_string())
                } else if e.is_connect() {
                    AttemptFailure::Connect(e.to_string())
                } else {
                    AttemptFailure::Other(e.to_string())
                };

                match &failure {
                    AttemptFailure::Timeout(_) | AttemptFailure::Connect(_)
                        if attempt + 1 < max_attempts =>
                    {
                        warn!(target: "kiwi.exec.http", attempt, error = %e, "transient failure, backing off");
                        last_failure = Some(failure);
                        continue;
                    }
                    _ => last_failure = Some(failure),
                }
                break;
            }
        }
    }

    let duration_ms = start.elapsed().as_millis() as u64;
    match last_failure {
        Some(AttemptFailure::Timeout(detail)) => Err(KernelError::resource_limit(format!(
            "http request to '{url}' timed out after {max_attempts} attempt(s)"
        ))
        .with_context("detail", detail)
        .with_context("duration_ms", duration_ms as i64)),
        Some(AttemptFailure::Connect(detail)) | Some(AttemptFailure::Other(detail)) => {
            Ok(HttpOutput {
                success: false,
                status_code: 0,
                body: Value::Null,
                headers: BTreeMap::new(),
                duration_ms,
                error: Some(detail),
            })
        }
        // Unreachable: the loop either returns or records a failure.
        None => Err(KernelError::execution_failed(format!(
            "http request to '{url}' produced no outcome"
        ))),
    }
}

fn build_request(
    config: &HttpConfig,
    method: reqwest::Method,
    url: &str,
    params: &BTreeMap<String, Value>,
) -> KernelResult<reqwest::RequestBuilder> {
    let mut request = client()
        .request(method, url)
        .timeout(Duration::from_secs_f64(config.timeout.max(0.001)));

    for (name, value) in &config.headers {
        request = request.header(name, expand_env(&render_template(value, params)));
    }

    if let Some(auth) = &config.auth {
        request = apply_auth(request, auth)?;
    }

    let body = match (&config.body_template, &config.body) {
        (Some(template), _) => Some(expand_value_env(&render_value(template, params))),
        (None, Some(body)) => Some(expand_value_env(body)),
        (None, None) => None,
    };
    if let Some(body) = body {
        request = match body {
            Value::String(text) => request.body(text),
            other => request.json(&other),
        };
    }

    Ok(request)
}

fn apply_auth(
    request: reqwest::RequestBuilder,
    auth: &AuthConfig,
) -> KernelResult<reqwest::RequestBuilder> {
    match auth.auth_type.as_str() {
        "bearer" => {
            let token = auth.token.as_deref().ok_or_else(|| {
                KernelError::execution_failed("bearer auth requires a token")
            })?;
            Ok(request.header("Authorization", format!("Bearer {}", expand_env(token))))
        }
        "basic" => {
            let username = auth.username.as_deref().unwrap_or_default();
            let password = auth.password.as_deref().map(expand_env);
            Ok(request.basic_auth(expand_env(username), password))
        }
        "api_key" => {
            let header = auth.header.as_deref().unwrap_or("X-API-Key");
            let value = auth.value.as_deref().ok_or_else(|| {
                KernelError::execution_failed("api_key auth requires a value")
            })?;
            Ok(request.header(header, expand_env(value)))
        }
        other => Err(KernelError::execution_failed(format!(
            "unknown auth type '{other}'"
        ))),
    }
}

async fn finish(config: &HttpConfig, response: reqwest::Response, start: Instant) -> HttpOutput {
    let status_code = response.status().as_u16();
    let success = (200..300).contains(&status_code);

    let mut headers = BTreeMap::new();
    for (name, value) in response.headers() {
        if let Ok(v) = value.to_str() {
            headers.insert(name.to_string(), v.to_string());
        }
    }

    let text = response.text().await.unwrap_or_default();
    let mut body = match serde_json::from_str::<Value>(&text) {
        Ok(json) => json,
        Err(_) => Value::String(text),
    };

    if let Some(path) = &config.response_transform {
        if !body.is_string() {
            match jsonpath_lib::select(&body, path) {
                Ok(found) => {
                    body = match found.len() {
                        0 => Value::Null,
                        1 => found[0].clone(),
                        _ => Value::Array(found.into_iter().cloned().collect()),
                    };
                }
                Err(e) => {
                    warn!(target: "kiwi.exec.http", %path, error = %e, "response_transform failed; returning full body");
                }
            }
        }
    }

    HttpOutput {
        success,
        status_code,
        body,
        headers,
        duration_ms: start.elapsed().as_millis() as u64,
        error: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config(url: String) -> HttpConfig {
        HttpConfig {
            method: "GET".into(),
            url: Some(url),
            url_template: None,
            headers: BTreeMap::new(),
            body: None,
            body_template: None,
            auth: None,
            timeout: 5.0,
            retries: 0,
            retry_delay: 0.01,
            retryable_statuses: DEFAULT_RETRYABLE.to_vec(),
            response_transform: None,
        }
    }

    #[tokio::test]
    async fn success_parses_json_body() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/users"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": true})))
            .mount(&server)
            .await;

        let out = execute(&config(format!("{}/users", server.uri())), &BTreeMap::new())
            .await
            .expect("request");
        assert!(out.success);
        assert_eq!(out.status_code, 200);
        assert_eq!(out.body["ok"], true);
    }

    #[tokio::test]
    async fn non_2xx_is_failure_result() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404).set_body_string("nope"))
            .mount(&server)
            .await;

        let out = execute(&config(server.uri()), &BTreeMap::new())
            .await
            .expect("request completes");
        assert!(!out.success);
        assert_eq!(out.status_code, 404);
        assert_eq!(out.body, json!("nope"));
    }

    #[tokio::test]
    async fn url_template_fills_params() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/users/42"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": 42})))
            .mount(&server)
            .await;

        let mut cfg = config(String::new());
        cfg.url = None;
        cfg.url_template = Some(format!("{}/users/{{id}}", server.uri()));
        let mut params = BTreeMap::new();
        params.insert("id".to_string(), json!("42"));

        let out = execute(&cfg, &params).await.expect("request");
        assert!(out.success);
    }

    #[tokio::test]
    async fn retryable_status_is_retried_within_budget() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"recovered": true})))
            .mount(&server)
            .await;

        let mut cfg = config(server.uri());
        cfg.retries = 1;
        let out = execute(&cfg, &BTreeMap::new()).await.expect("request");
        assert!(out.success, "second attempt should have recovered");
    }

    #[tokio::test]
    async fn retry_budget_is_not_exceeded() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .expect(2) // initial attempt + exactly one retry
            .mount(&server)
            .await;

        let mut cfg = config(server.uri());
        cfg.retries = 1;
        let out = execute(&cfg, &BTreeMap::new()).await.expect("request");
        assert!(!out.success);
        assert_eq!(out.status_code, 503);
    }

    #[tokio::test]
    async fn non_retryable_status_is_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(400))
            .expect(1)
            .mount(&server)
            .await;

        let mut cfg = config(server.uri());
        cfg.retries = 3;
        let out = execute(&cfg, &BTreeMap::new()).await.expect("request");
        assert_eq!(out.status_code, 400);
    }

    #[tokio::test]
    async fn connection_error_is_failure_result_after_retries() {
        // Nothing listens on this port.
        let mut cfg = config("http://127.0.0.1:9".to_string());
        cfg.retries = 1;
        let out = execute(&cfg, &BTreeMap::new()).await.expect("result, not panic");
        assert!(!out.success);
        assert_eq!(out.status_code, 0);
        assert!(out.error.is_some());
    }

    #[tokio::test]
    async fn bearer_auth_header_is_sent() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(header("Authorization", "Bearer s3cr3t"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let mut cfg = config(server.uri());
        cfg.auth = Some(AuthConfig {
            auth_type: "bearer".into(),
            token: Some("s3cr3t".into()),
            username: None,
            password: None,
            header: None,
            value: None,
        });
        let out = execute(&cfg, &BTreeMap::new()).await.expect("request");
        assert!(out.success, "mock only matches with the auth header");
    }

    #[tokio::test]
    async fn body_template_renders_params_through_json() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_json(json!({"greeting": {"to": "world"}})))
            .respond_with(ResponseTemplate::new(201))
            .mount(&server)
            .await;

        let mut cfg = config(server.uri());
        cfg.method = "POST".into();
        cfg.body_template = Some(json!({"greeting": {"to": "{name}"}}));
        let mut params = BTreeMap::new();
        params.insert("name".to_string(), json!("world"));

        let out = execute(&cfg, &params).await.expect("request");
        assert_eq!(out.status_code, 201);
    }

    #[tokio::test]
    async fn response_transform_extracts_subvalue() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": {"items": [{"name": "a"}, {"name": "b"}]}
            })))
            .mount(&server)
            .await;

        let mut cfg = config(server.uri());
        cfg.response_transform = Some("$.data.items[*].name".into());
        let out = execute(&cfg, &BTreeMap::new()).await.expect("request");
        assert_eq!(out.body, json!(["a", "b"]));
    }

    #[tokio::test]
    async fn timeout_after_retries_is_resource_limit() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(5)))
            .mount(&server)
            .await;

        let mut cfg = config(server.uri());
        cfg.timeout = 0.1;
        cfg.retries = 1;
        let err = execute(&cfg, &BTreeMap::new())
            .await
            .expect_err("timeout is a resource-limit error");
        assert_eq!(err.kind, kiwi_error::ErrorKind::ResourceLimit);
    }

    #[test]
    fn config_defaults_match_contract() {
        let cfg = HttpConfig::from_config(
            json!({"url": "https://example.com"}).as_object().unwrap(),
        )
        .expect("parse");
        assert_eq!(cfg.method, "GET");
        assert_eq!(cfg.timeout, 30.0);
        assert_eq!(cfg.retries, 0);
        assert_eq!(cfg.retry_delay, 1.0);
        assert_eq!(cfg.retryable_statuses, vec![502, 503, 504, 429]);
    }
}
