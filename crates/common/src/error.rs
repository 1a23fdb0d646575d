use thiserror::Error;

/// Stable numeric codes reported by the Korean broker API. Kept as plain
/// constants so error mapping and tests can reference them by name.
pub mod broker_code {
    pub const SUCCESS: i32 = 0;

    // Authentication (-100 .. -199)
    pub const TOKEN_EXPIRED: i32 = -100;
    pub const INVALID_APP_KEY: i32 = -101;
    pub const INVALID_SECRET_KEY: i32 = -102;
    pub const INVALID_TOKEN: i32 = -103;
    pub const TOKEN_NOT_FOUND: i32 = -104;

    // Instruments (-200 .. -299)
    pub const INVALID_TICKER: i32 = -200;
    pub const TICKER_NOT_FOUND: i32 = -201;

    // Orders (-300 .. -399)
    pub const INVALID_ORDER_QTY: i32 = -300;
    pub const INVALID_ORDER_PRICE: i32 = -301;

    // Account (-400 .. -499)
    pub const INSUFFICIENT_BALANCE: i32 = -400;
    pub const ORDER_NOT_FOUND: i32 = -401;

    // Market (-500 .. -599)
    pub const MARKET_CLOSED: i32 = -500;
    pub const TRADING_HALTED: i32 = -501;

    // System (-900 .. -999)
    pub const SYSTEM_ERROR: i32 = -900;
    pub const NETWORK_ERROR: i32 = -901;
    pub const TIMEOUT: i32 = -902;
    pub const RATE_LIMIT_EXCEEDED: i32 = -903;
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("Authentication error [{code}]: {message}")]
    Auth { code: i32, message: String },

    #[error("Rate limit exceeded: {0}")]
    RateLimited(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    /// Domain error reported by the upstream with a stable numeric code
    /// (invalid ticker, insufficient balance, order not found, ...).
    #[error("Exchange error [{code}]: {message}")]
    Broker { code: i32, message: String },

    #[error("WebSocket error: {0}")]
    WebSocket(String),

    #[error("Configuration error: {0}")]
    Config(String),

    /// Violated trading rule (e.g. add/reduce without a position).
    /// Never retried.
    #[error("Business rule violation: {0}")]
    BusinessRule(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Build the broker-side error variant from a response payload,
    /// routing auth / rate-limit codes to their dedicated variants.
    pub fn from_broker_response(code: i32, message: impl Into<String>) -> Self {
        let message = message.into();
        if (-199..=-100).contains(&code) {
            Error::Auth { code, message }
        } else if code == broker_code::RATE_LIMIT_EXCEEDED {
            Error::RateLimited(message)
        } else if code == broker_code::NETWORK_ERROR {
            Error::Network(message)
        } else if code == broker_code::TIMEOUT {
            Error::Timeout(message)
        } else {
            Error::Broker { code, message }
        }
    }

    pub fn is_auth(&self) -> bool {
        matches!(self, Error::Auth { .. })
    }

    pub fn is_rate_limit(&self) -> bool {
        matches!(self, Error::RateLimited(_))
    }

    /// Transient upstream failures worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::RateLimited(_) | Error::Network(_) | Error::Timeout(_)
        ) || matches!(
            self,
            Error::Broker { code, .. } if *code == broker_code::SYSTEM_ERROR
        )
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broker_response_routes_auth_codes() {
        let err = Error::from_broker_response(broker_code::INVALID_TOKEN, "bad token");
        assert!(err.is_auth());
    }

    #[test]
    fn broker_response_routes_rate_limit() {
        let err = Error::from_broker_response(broker_code::RATE_LIMIT_EXCEEDED, "slow down");
        assert!(err.is_rate_limit());
        assert!(err.is_retryable());
    }

    #[test]
    fn domain_errors_are_not_retryable() {
        let err = Error::from_broker_response(broker_code::INSUFFICIENT_BALANCE, "no cash");
        assert!(!err.is_retryable());
        assert!(matches!(err, Error::Broker { code: -400, .. }));
    }
}
