// =============================================================================
// Broker error taxonomy — typed failures for the futures gateway
// =============================================================================
//
// Every gateway operation is total: it returns either a parsed result or one
// of these variants. Venue error codes are mapped so that callers can react
// to the class of failure (pause a symbol, trigger limiter slowdown, abort
// init) without string-matching messages.
// =============================================================================

use thiserror::Error;

/// Venue error code returned when the signed timestamp falls outside the
/// recv-window. Handled internally by the gateway with a single retry after
/// re-synchronising the clock offset.
pub const CODE_TIMESTAMP_OUT_OF_WINDOW: i64 = -1021;

/// Venue error code for "No need to change margin type" — treated as success
/// by `set_margin_mode`.
pub const CODE_NO_NEED_TO_CHANGE_MARGIN: i64 = -4046;

#[derive(Debug, Error)]
pub enum BrokerError {
    /// Transport-level failure: connect, TLS, timeout, malformed body.
    #[error("network error: {0}")]
    Network(String),

    /// API key rejected or signature invalid.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// HTTP 429/418 or venue code -1003. The caller should back off.
    #[error("rate limited: {0}")]
    RateLimited(String),

    /// Order rejected for trade-logical reasons (balance checks aside).
    #[error("order rejected: {0}")]
    Rejected(String),

    /// Quantity or price does not match the symbol's precision filters.
    #[error("precision violation: {0}")]
    Precision(String),

    /// Not enough margin to open or scale the position.
    #[error("insufficient margin: {0}")]
    InsufficientMargin(String),

    /// Any other venue-reported error, carrying the raw code and message.
    #[error("venue error {code}: {message}")]
    Venue { code: i64, message: String },
}

impl BrokerError {
    /// Classify a venue error response from its HTTP status and body code.
    pub fn classify(http_status: u16, code: i64, message: &str) -> Self {
        match (http_status, code) {
            (429, _) | (418, _) => Self::RateLimited(message.to_string()),
            (401, _) => Self::Auth(message.to_string()),
            (_, -1003) => Self::RateLimited(message.to_string()),
            (_, -1022) | (_, -2014) | (_, -2015) => Self::Auth(message.to_string()),
            (_, -1111) | (_, -1013) => Self::Precision(message.to_string()),
            (_, -2019) => Self::InsufficientMargin(message.to_string()),
            (_, -2010) | (_, -2011) | (_, -2022) => Self::Rejected(message.to_string()),
            _ => Self::Venue {
                code,
                message: message.to_string(),
            },
        }
    }

    /// True when a mid-run occurrence should count as an authentication
    /// failure (fatal at init, alert-worthy afterwards).
    pub fn is_auth(&self) -> bool {
        matches!(self, Self::Auth(_))
    }

    /// True for HTTP 429/418-class failures that should slow the caller down.
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::RateLimited(_))
    }
}

impl From<reqwest::Error> for BrokerError {
    fn from(err: reqwest::Error) -> Self {
        Self::Network(err.to_string())
    }
}
