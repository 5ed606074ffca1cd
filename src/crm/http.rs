//! HTTP plumbing shared by both CRM clients: request throttle, retry policy,
//! typed errors and bounded log bodies.
use reqwest::{Client, Method, StatusCode};
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::{sleep, Duration, Instant};
use tracing::{debug, error, warn};

use crate::util::env::env_parse;

/// Upper bound for response bodies copied into logs and error messages.
pub const LOG_BODY_LIMIT: usize = 2000;

const DEFAULT_RETRY_AFTER_SECS: u64 = 5;

pub fn truncate_for_log(mut s: String, max_len: usize) -> String {
    if s.len() > max_len {
        let mut cut = max_len;
        while !s.is_char_boundary(cut) {
            cut -= 1;
        }
        s.truncate(cut);
        s.push('…');
    }
    s
}

#[derive(Debug, Error)]
pub enum CrmError {
    #[error("{method} {url} failed: HTTP {status} body={body}")]
    Http {
        method: Method,
        url: String,
        status: StatusCode,
        body: String,
        retry_after: Option<u64>,
    },
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("unexpected response from {url}: {message}")]
    Decode { url: String, message: String },
    #[error("destination returned {received} records for a chunk of {sent}")]
    ResponseMismatch { sent: usize, received: usize },
}

impl CrmError {
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            CrmError::Http { status, .. } => Some(*status),
            CrmError::Transport(e) => e.status(),
            _ => None,
        }
    }

    /// 429, 5xx and connection-level failures are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            CrmError::Http { status, .. } => {
                *status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
            }
            CrmError::Transport(e) => e.is_connect() || e.is_timeout() || e.is_request(),
            CrmError::Decode { .. } | CrmError::ResponseMismatch { .. } => false,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RateLimitSettings {
    pub max_ops_per_window: u32,
    pub window_secs: u64,
}

impl RateLimitSettings {
    /// Both CRMs allow roughly seven requests per second per account.
    pub const CRM_DEFAULT: RateLimitSettings = RateLimitSettings {
        max_ops_per_window: 7,
        window_secs: 1,
    };

    pub const DISABLED: RateLimitSettings = RateLimitSettings {
        max_ops_per_window: 0,
        window_secs: 0,
    };

    pub fn from_env(max_key: &str, window_key: &str, default_max: u32, default_window: u64) -> Self {
        Self {
            max_ops_per_window: env_parse(max_key, default_max),
            window_secs: env_parse(window_key, default_window),
        }
    }

    pub fn per_request_interval(&self) -> Option<Duration> {
        if self.max_ops_per_window == 0 || self.window_secs == 0 {
            None
        } else {
            Some(Duration::from_secs_f64(
                self.window_secs as f64 / self.max_ops_per_window as f64,
            ))
        }
    }
}

/// Spaces calls at least `per_request_interval` apart. Clones share state, so
/// one throttle handed to several callers enforces a single budget.
#[derive(Clone, Debug)]
pub struct RequestThrottle {
    settings: RateLimitSettings,
    state: Option<Arc<Mutex<Instant>>>,
}

impl RequestThrottle {
    pub fn new(settings: RateLimitSettings) -> Self {
        let state = settings
            .per_request_interval()
            .map(|_| Arc::new(Mutex::new(Instant::now())));
        Self { settings, state }
    }

    pub fn disabled() -> Self {
        Self::new(RateLimitSettings::DISABLED)
    }

    /// Block until the next call is permitted.
    pub async fn acquire(&self) {
        let Some(interval) = self.settings.per_request_interval() else {
            return;
        };
        let Some(state) = &self.state else {
            return;
        };

        let mut next_allowed = state.lock().await;
        let now = Instant::now();
        let wait_until = if now >= *next_allowed {
            now
        } else {
            *next_allowed
        };
        let sleep_duration = wait_until.saturating_duration_since(now);
        *next_allowed = wait_until + interval;
        drop(next_allowed);

        if !sleep_duration.is_zero() {
            sleep(sleep_duration).await;
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 4,
            base_delay: Duration::from_millis(1000),
        }
    }
}

impl RetryPolicy {
    fn backoff(&self, attempt: u32) -> Duration {
        self.base_delay
            .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)))
    }

    /// Run `op` until it succeeds, fails permanently or runs out of retries.
    pub async fn run<T, F, Fut>(&self, label: &str, mut op: F) -> Result<T, CrmError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, CrmError>>,
    {
        let mut attempt = 0u32;
        loop {
            let err = match op().await {
                Ok(v) => return Ok(v),
                Err(e) => e,
            };
            attempt += 1;
            if !err.is_retryable() || attempt > self.max_retries {
                error!(request = label, attempt, error = %err, "crm request failed");
                return Err(err);
            }
            let delay = match &err {
                CrmError::Http {
                    status, retry_after, ..
                } if *status == StatusCode::TOO_MANY_REQUESTS => {
                    Duration::from_secs(retry_after.unwrap_or(DEFAULT_RETRY_AFTER_SECS))
                }
                _ => self.backoff(attempt),
            };
            warn!(
                request = label,
                attempt,
                max_retries = self.max_retries,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "crm request failed; retrying"
            );
            sleep(delay).await;
        }
    }
}

/// Bearer-authenticated JSON client for one CRM account.
#[derive(Clone, Debug)]
pub struct CrmHttp {
    name: &'static str,
    base_url: String,
    token: String,
    http: Client,
    retry: RetryPolicy,
}

impl CrmHttp {
    pub fn new(
        name: &'static str,
        base_url: &str,
        token: &str,
        timeout_secs: u64,
        retry: RetryPolicy,
    ) -> anyhow::Result<Self> {
        let http = Client::builder()
            .user_agent(concat!("crm-bridge/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(timeout_secs))
            .build()?;
        Ok(Self {
            name,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
            http,
            retry,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api/v4/{}", self.base_url, path.trim_start_matches('/'))
    }

    /// GET returning `None` for `204 No Content`.
    pub async fn get_json(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<Option<Value>, CrmError> {
        let url = self.url(path);
        let label = format!("{} GET {path}", self.name);
        let (this, url) = (self, url.as_str());
        self.retry
            .run(&label, || async move {
                let resp = this
                    .http
                    .get(url)
                    .bearer_auth(&this.token)
                    .header("Accept", "application/json")
                    .query(query)
                    .send()
                    .await?;
                if resp.status() == StatusCode::NO_CONTENT {
                    return Ok(None);
                }
                read_json(Method::GET, url, resp).await.map(Some)
            })
            .await
    }

    /// POST returning the success status alongside the decoded body.
    pub async fn post_json(&self, path: &str, body: &Value) -> Result<(StatusCode, Value), CrmError> {
        let url = self.url(path);
        let label = format!("{} POST {path}", self.name);
        let (this, url) = (self, url.as_str());
        self.retry
            .run(&label, || async move {
                let resp = this
                    .http
                    .post(url)
                    .bearer_auth(&this.token)
                    .json(body)
                    .send()
                    .await?;
                let status = resp.status();
                read_json(Method::POST, url, resp).await.map(|v| (status, v))
            })
            .await
    }
}

async fn read_json(method: Method, url: &str, resp: reqwest::Response) -> Result<Value, CrmError> {
    let status = resp.status();
    if !status.is_success() {
        let retry_after = resp
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok());
        let body = truncate_for_log(resp.text().await.unwrap_or_default(), LOG_BODY_LIMIT);
        return Err(CrmError::Http {
            method,
            url: url.to_string(),
            status,
            body,
            retry_after,
        });
    }
    let text = resp.text().await?;
    debug!(%url, status = status.as_u16(), bytes = text.len(), "crm response");
    if text.trim().is_empty() {
        return Ok(Value::Null);
    }
    serde_json::from_str(&text).map_err(|e| CrmError::Decode {
        url: url.to_string(),
        message: format!("{e}; body={}", truncate_for_log(text, LOG_BODY_LIMIT)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn truncation_respects_char_boundaries() {
        let s = "ééééé".to_string();
        let out = truncate_for_log(s, 3);
        assert_eq!(out, "é…");
        assert_eq!(truncate_for_log("short".into(), 10), "short");
    }

    #[test]
    fn default_settings_space_requests() {
        let interval = RateLimitSettings::CRM_DEFAULT.per_request_interval().unwrap();
        assert!(interval >= Duration::from_millis(142) && interval <= Duration::from_millis(143));
        assert!(RateLimitSettings::DISABLED.per_request_interval().is_none());
    }

    #[tokio::test]
    async fn throttle_sleeps_between_requests() {
        let settings = RateLimitSettings {
            max_ops_per_window: 100,
            window_secs: 1,
        };
        let delay = settings.per_request_interval().unwrap();
        let throttle = RequestThrottle::new(settings);

        throttle.acquire().await;
        let start = Instant::now();
        throttle.clone().acquire().await;
        let elapsed = start.elapsed();

        assert!(
            elapsed >= delay,
            "expected wait of at least {:?}, but got {:?}",
            delay,
            elapsed
        );
    }

    fn server_error() -> CrmError {
        CrmError::Http {
            method: Method::POST,
            url: "http://x".into(),
            status: StatusCode::BAD_GATEWAY,
            body: String::new(),
            retry_after: None,
        }
    }

    #[tokio::test]
    async fn retries_server_errors_then_succeeds() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let policy = RetryPolicy {
            max_retries: 3,
            base_delay: Duration::from_millis(1),
        };
        let out = policy
            .run("test", || async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(server_error())
                } else {
                    Ok(7)
                }
            })
            .await
            .unwrap();
        assert_eq!(out, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn client_errors_are_not_retried() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let policy = RetryPolicy {
            max_retries: 3,
            base_delay: Duration::from_millis(1),
        };
        let err = policy
            .run("test", || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(CrmError::Http {
                    method: Method::POST,
                    url: "http://x".into(),
                    status: StatusCode::BAD_REQUEST,
                    body: "bad".into(),
                    retry_after: None,
                })
            })
            .await
            .unwrap_err();
        assert_eq!(err.status(), Some(StatusCode::BAD_REQUEST));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn gives_up_after_max_retries() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let policy = RetryPolicy {
            max_retries: 2,
            base_delay: Duration::from_millis(1),
        };
        let res = policy
            .run("test", || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(server_error())
            })
            .await;
        assert!(res.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
