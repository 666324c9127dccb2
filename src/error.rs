//! Error taxonomy shared by the provider, the MCP tools and the agent.
//!
//! Every failure anywhere in the pipeline is eventually classified into an
//! [`ErrorCategory`]. Recoverable categories drive re-planning; fatal ones
//! surface to the caller as `error_message` / `RUN_ERROR`.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Uniform error classification across tools and the agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
pub enum ErrorCategory {
    #[serde(rename = "INVALID_TICKER")]
    InvalidTicker,
    #[serde(rename = "DATE_RANGE_TOO_LARGE")]
    DateRangeTooLarge,
    #[serde(rename = "TOO_MANY_TICKERS")]
    TooManyTickers,
    #[serde(rename = "RATE_LIMIT")]
    RateLimit,
    #[serde(rename = "ISS_TIMEOUT")]
    IssTimeout,
    #[serde(rename = "ISS_5XX")]
    Iss5xx,
    #[serde(rename = "VALIDATION_ERROR")]
    ValidationError,
    #[serde(rename = "UNKNOWN_TOOL")]
    UnknownTool,
    #[serde(rename = "UNKNOWN")]
    Unknown,
}

impl ErrorCategory {
    /// Categories that end a plan outright. Timeouts and upstream 5xx are
    /// already retried inside the provider, so by the time they reach the
    /// orchestrator they count as fatal too.
    pub fn is_fatal(self) -> bool {
        matches!(
            self,
            Self::IssTimeout
                | Self::Iss5xx
                | Self::ValidationError
                | Self::UnknownTool
                | Self::Unknown
        )
    }

    /// Categories for which the basic planner has a rewrite.
    pub fn is_recoverable(self) -> bool {
        matches!(
            self,
            Self::InvalidTicker
                | Self::DateRangeTooLarge
                | Self::TooManyTickers
                | Self::RateLimit
                | Self::IssTimeout
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::InvalidTicker => "INVALID_TICKER",
            Self::DateRangeTooLarge => "DATE_RANGE_TOO_LARGE",
            Self::TooManyTickers => "TOO_MANY_TICKERS",
            Self::RateLimit => "RATE_LIMIT",
            Self::IssTimeout => "ISS_TIMEOUT",
            Self::Iss5xx => "ISS_5XX",
            Self::ValidationError => "VALIDATION_ERROR",
            Self::UnknownTool => "UNKNOWN_TOOL",
            Self::Unknown => "UNKNOWN",
        }
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ErrorCategory {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "INVALID_TICKER" => Ok(Self::InvalidTicker),
            "DATE_RANGE_TOO_LARGE" => Ok(Self::DateRangeTooLarge),
            "TOO_MANY_TICKERS" => Ok(Self::TooManyTickers),
            "RATE_LIMIT" => Ok(Self::RateLimit),
            "ISS_TIMEOUT" => Ok(Self::IssTimeout),
            "ISS_5XX" => Ok(Self::Iss5xx),
            "VALIDATION_ERROR" => Ok(Self::ValidationError),
            "UNKNOWN_TOOL" => Ok(Self::UnknownTool),
            "UNKNOWN" => Ok(Self::Unknown),
            _ => Err(()),
        }
    }
}

/// Typed failure raised by the market-data provider.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("Unknown or malformed ticker: {0}")]
    InvalidTicker(String),
    #[error("Requested window of {days} days exceeds the {max}-day limit")]
    DateRangeTooLarge { days: i64, max: i64 },
    #[error("{count} tickers exceeds the per-tool cap of {max}")]
    TooManyTickers { count: usize, max: usize },
    #[error("Upstream rate limit hit")]
    RateLimit,
    #[error("Request timed out: {0}")]
    Timeout(String),
    #[error("Upstream server error ({status}): {message}")]
    Upstream { status: u16, message: String },
    #[error("Failed to decode upstream response: {0}")]
    Decode(String),
    #[error("Network error: {0}")]
    Network(String),
}

impl ProviderError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::InvalidTicker(_) => ErrorCategory::InvalidTicker,
            Self::DateRangeTooLarge { .. } => ErrorCategory::DateRangeTooLarge,
            Self::TooManyTickers { .. } => ErrorCategory::TooManyTickers,
            Self::RateLimit => ErrorCategory::RateLimit,
            Self::Timeout(_) => ErrorCategory::IssTimeout,
            Self::Upstream { .. } => ErrorCategory::Iss5xx,
            Self::Decode(_) | Self::Network(_) => ErrorCategory::Unknown,
        }
    }
}

/// Failure raised by a risk calculation before any numeric work happens.
#[derive(Debug, Error)]
pub enum RiskError {
    #[error("Invalid portfolio: {0}")]
    InvalidPortfolio(String),
    #[error("{count} tickers exceeds the cap of {max}")]
    TooManyTickers { count: usize, max: usize },
    #[error("Not enough overlapping trading days ({0}) to compute statistics")]
    InsufficientData(usize),
    #[error(transparent)]
    Provider(#[from] ProviderError),
}

impl RiskError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::InvalidPortfolio(_) | Self::InsufficientData(_) => ErrorCategory::ValidationError,
            Self::TooManyTickers { .. } => ErrorCategory::TooManyTickers,
            Self::Provider(e) => e.category(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn category_string_round_trip() {
        for cat in [
            ErrorCategory::InvalidTicker,
            ErrorCategory::DateRangeTooLarge,
            ErrorCategory::TooManyTickers,
            ErrorCategory::RateLimit,
            ErrorCategory::IssTimeout,
            ErrorCategory::Iss5xx,
            ErrorCategory::ValidationError,
            ErrorCategory::UnknownTool,
            ErrorCategory::Unknown,
        ] {
            assert_eq!(ErrorCategory::from_str(cat.as_str()), Ok(cat));
        }
    }

    #[test]
    fn serde_uses_wire_names() {
        let json = serde_json::to_string(&ErrorCategory::Iss5xx).unwrap();
        assert_eq!(json, "\"ISS_5XX\"");
        let back: ErrorCategory = serde_json::from_str("\"DATE_RANGE_TOO_LARGE\"").unwrap();
        assert_eq!(back, ErrorCategory::DateRangeTooLarge);
    }

    #[test]
    fn fatal_and_recoverable_sets() {
        assert!(ErrorCategory::ValidationError.is_fatal());
        assert!(ErrorCategory::UnknownTool.is_fatal());
        assert!(!ErrorCategory::DateRangeTooLarge.is_fatal());
        assert!(ErrorCategory::DateRangeTooLarge.is_recoverable());
        assert!(ErrorCategory::RateLimit.is_recoverable());
        assert!(!ErrorCategory::ValidationError.is_recoverable());
    }

    #[test]
    fn provider_error_categories() {
        assert_eq!(
            ProviderError::InvalidTicker("XX".into()).category(),
            ErrorCategory::InvalidTicker
        );
        assert_eq!(
            ProviderError::DateRangeTooLarge { days: 900, max: 730 }.category(),
            ErrorCategory::DateRangeTooLarge
        );
        assert_eq!(
            ProviderError::Timeout("ohlcv".into()).category(),
            ErrorCategory::IssTimeout
        );
        assert_eq!(
            ProviderError::Upstream {
                status: 502,
                message: "bad gateway".into()
            }
            .category(),
            ErrorCategory::Iss5xx
        );
    }
}
