use std::time::Duration;

use chrono::{DateTime, NaiveDateTime, Utc};
use rand::Rng;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::Mutex;
use tracing::{info, warn};

use common::{broker_code, Error, Result};

/// Refresh this long before the reported expiry.
const REFRESH_MARGIN: chrono::Duration = chrono::Duration::seconds(300);

const MAX_ISSUE_RETRIES: u32 = 3;
const ISSUE_BASE_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
struct IssuedToken {
    token: String,
    expires_at: DateTime<Utc>,
}

impl IssuedToken {
    fn needs_refresh(&self) -> bool {
        Utc::now() >= self.expires_at - REFRESH_MARGIN
    }
}

/// OAuth2 client-credentials token manager for the broker API.
///
/// The mutex serializes issuance so concurrent callers converge on a
/// single in-flight refresh.
pub struct TokenManager {
    base_url: String,
    app_key: String,
    secret_key: String,
    http: reqwest::Client,
    token: Mutex<Option<IssuedToken>>,
}

impl TokenManager {
    pub fn new(
        base_url: impl Into<String>,
        app_key: impl Into<String>,
        secret_key: impl Into<String>,
        http: reqwest::Client,
    ) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            app_key: app_key.into(),
            secret_key: secret_key.into(),
            http,
            token: Mutex::new(None),
        }
    }

    /// Return a valid access token, issuing or refreshing as needed.
    pub async fn bearer(&self) -> Result<String> {
        let mut guard = self.token.lock().await;
        let needs_issue = guard.as_ref().map(|t| t.needs_refresh()).unwrap_or(true);
        if needs_issue {
            *guard = Some(self.issue().await?);
        }
        Ok(guard.as_ref().map(|t| t.token.clone()).unwrap_or_default())
    }

    /// Drop the cached token so the next call re-issues. Used after an
    /// upstream authentication error.
    pub async fn force_refresh(&self) {
        *self.token.lock().await = None;
    }

    pub async fn has_valid_token(&self) -> bool {
        self.token
            .lock()
            .await
            .as_ref()
            .map(|t| !t.needs_refresh())
            .unwrap_or(false)
    }

    async fn issue(&self) -> Result<IssuedToken> {
        let body = json!({
            "grant_type": "client_credentials",
            "appkey": self.app_key,
            "secretkey": self.secret_key,
        });

        let mut last_error: Option<Error> = None;
        for attempt in 0..=MAX_ISSUE_RETRIES {
            if attempt > 0 {
                // Exponential backoff with jitter
                let jitter = rand::thread_rng().gen_range(0.0..0.5);
                let delay = ISSUE_BASE_DELAY.mul_f64(2f64.powi(attempt as i32 - 1))
                    + Duration::from_secs_f64(jitter);
                info!(attempt = attempt + 1, delay_ms = delay.as_millis() as u64, "token issue retry");
                tokio::time::sleep(delay).await;
            }

            let response = match self
                .http
                .post(format!("{}/oauth2/token", self.base_url))
                .header("api-id", "au10001")
                .json(&body)
                .send()
                .await
            {
                Ok(r) => r,
                Err(e) => {
                    warn!(error = %e, attempt = attempt + 1, "token issue network error");
                    last_error = Some(Error::Network(format!("token issuance failed: {e}")));
                    continue;
                }
            };

            if response.status().as_u16() == 429 {
                warn!(attempt = attempt + 1, "token issue rate limited (429)");
                last_error = Some(Error::RateLimited("token issuance throttled".into()));
                continue;
            }

            let payload: TokenResponse = match response.json().await {
                Ok(p) => p,
                Err(e) => {
                    last_error = Some(Error::Network(format!("token response decode: {e}")));
                    continue;
                }
            };

            if let Some(code) = payload.return_code_i32() {
                // Rate-limit code inside a 200 body is still retryable.
                if code == 5 {
                    warn!(attempt = attempt + 1, "token issue rate limited (body code)");
                    last_error = Some(Error::RateLimited(
                        payload.return_msg.unwrap_or_else(|| "request quota exceeded".into()),
                    ));
                    continue;
                }
                if code != 0 {
                    return Err(Error::Auth {
                        code,
                        message: payload
                            .return_msg
                            .unwrap_or_else(|| "token issuance failed".into()),
                    });
                }
            }

            let token = payload.token.ok_or(Error::Auth {
                code: broker_code::TOKEN_NOT_FOUND,
                message: "no token in response".into(),
            })?;
            let expires_at = parse_expiry(payload.expires_dt.as_deref());
            info!(expires_at = %expires_at, "access token issued");
            return Ok(IssuedToken { token, expires_at });
        }

        Err(last_error.unwrap_or(Error::RateLimited("token issuance failed".into())))
    }

    /// Revoke the current token upstream, best effort.
    pub async fn revoke(&self) {
        let token = { self.token.lock().await.take() };
        let Some(token) = token else { return };

        let result = self
            .http
            .post(format!("{}/oauth2/revoke", self.base_url))
            .header("api-id", "au10002")
            .header("authorization", format!("Bearer {}", token.token))
            .json(&json!({ "token": token.token }))
            .send()
            .await;

        match result {
            Ok(_) => info!("access token revoked"),
            Err(e) => warn!(error = %e, "token revocation failed"),
        }
    }
}

/// Expiry arrives as `YYYYMMDDHHMMSS` or ISO; unparseable values fall back
/// to 24 hours from now.
fn parse_expiry(raw: Option<&str>) -> DateTime<Utc> {
    let fallback = Utc::now() + chrono::Duration::hours(24);
    let Some(raw) = raw else { return fallback };

    for fmt in ["%Y%m%d%H%M%S", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, fmt) {
            return DateTime::from_naive_utc_and_offset(naive, Utc);
        }
    }
    fallback
}

#[derive(Deserialize)]
struct TokenResponse {
    #[serde(default)]
    return_code: Option<serde_json::Value>,
    #[serde(default)]
    return_msg: Option<String>,
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    expires_dt: Option<String>,
}

impl TokenResponse {
    /// The broker sends return_code as either a number or a string.
    fn return_code_i32(&self) -> Option<i32> {
        match &self.return_code {
            Some(serde_json::Value::Number(n)) => n.as_i64().map(|v| v as i32),
            Some(serde_json::Value::String(s)) => s.parse().ok(),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expiry_parses_compact_format() {
        let dt = parse_expiry(Some("20260801153000"));
        assert_eq!(dt.format("%Y%m%d%H%M%S").to_string(), "20260801153000");
    }

    #[test]
    fn expiry_falls_back_to_24h() {
        let dt = parse_expiry(Some("not-a-date"));
        let lower = Utc::now() + chrono::Duration::hours(23);
        assert!(dt > lower);
    }

    #[test]
    fn return_code_accepts_string_and_number() {
        let from_num: TokenResponse =
            serde_json::from_str(r#"{"return_code": 5}"#).unwrap();
        assert_eq!(from_num.return_code_i32(), Some(5));
        let from_str: TokenResponse =
            serde_json::from_str(r#"{"return_code": "-103"}"#).unwrap();
        assert_eq!(from_str.return_code_i32(), Some(-103));
    }
}
