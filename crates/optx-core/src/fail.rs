//! Exchange failure classification.
//!
//! Gateway adapters translate raw exchange error codes into a [`FailInfo`]
//! through an [`ErrorCodeMap`]. The order slot and the rate controller only
//! ever look at the class, never at the raw code.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Failure class of a rejected request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "class", rename_all = "snake_case")]
pub enum FailClass {
    /// No answer within the gateway timeout. The order may or may not exist.
    Timeout,
    InsufficientFunds,
    /// Order unknown to the exchange (already filled or cancelled).
    NotFound,
    /// Exchange-confirmed transaction-rate violation.
    TransactionLimit { penalty_remaining_ms: Option<u64> },
    Fatal { code: i32 },
    Other,
}

impl FailClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::InsufficientFunds => "insufficient_funds",
            Self::NotFound => "not_found",
            Self::TransactionLimit { .. } => "transaction_limit",
            Self::Fatal { .. } => "fatal",
            Self::Other => "other",
        }
    }
}

/// Classified failure attached to a gateway event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailInfo {
    pub class: FailClass,
    pub code: Option<i32>,
    pub message: String,
}

impl FailInfo {
    pub fn new(class: FailClass, code: Option<i32>, message: impl Into<String>) -> Self {
        Self {
            class,
            code,
            message: message.into(),
        }
    }

    pub fn timeout() -> Self {
        Self::new(FailClass::Timeout, None, "gateway timeout")
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(FailClass::NotFound, None, message)
    }

    pub fn insufficient_funds(message: impl Into<String>) -> Self {
        Self::new(FailClass::InsufficientFunds, None, message)
    }

    pub fn transaction_limit(penalty: Option<Duration>) -> Self {
        Self::new(
            FailClass::TransactionLimit {
                penalty_remaining_ms: penalty.map(|d| d.as_millis() as u64),
            },
            None,
            "transaction limit exceeded",
        )
    }

    pub fn fatal(code: i32, message: impl Into<String>) -> Self {
        Self::new(FailClass::Fatal { code }, Some(code), message)
    }

    pub fn other(message: impl Into<String>) -> Self {
        Self::new(FailClass::Other, None, message)
    }

    pub fn is_order_not_found(&self) -> bool {
        matches!(self.class, FailClass::NotFound)
    }

    pub fn is_not_enough_money(&self) -> bool {
        matches!(self.class, FailClass::InsufficientFunds)
    }

    pub fn is_transaction_limit(&self) -> bool {
        matches!(self.class, FailClass::TransactionLimit { .. })
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self.class, FailClass::Timeout)
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self.class, FailClass::Fatal { .. })
    }

    /// Exchange-reported remaining penalty, if this is a rate violation that carried one.
    pub fn penalty_remaining(&self) -> Option<Duration> {
        match self.class {
            FailClass::TransactionLimit {
                penalty_remaining_ms: Some(ms),
            } => Some(Duration::from_millis(ms)),
            _ => None,
        }
    }
}

impl fmt::Display for FailInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code {
            Some(code) => write!(f, "{} ({}): {}", self.class.as_str(), code, self.message),
            None => write!(f, "{}: {}", self.class.as_str(), self.message),
        }
    }
}

// ============================================================================
// Error code mapping
// ============================================================================

/// Exchange error code lists per failure class.
///
/// Codes not listed anywhere classify as [`FailClass::Other`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorCodeMap {
    #[serde(default = "default_timeout_codes")]
    pub timeout: Vec<i32>,
    #[serde(default = "default_not_found_codes")]
    pub not_found: Vec<i32>,
    #[serde(default = "default_insufficient_funds_codes")]
    pub insufficient_funds: Vec<i32>,
    #[serde(default = "default_transaction_limit_codes")]
    pub transaction_limit: Vec<i32>,
    #[serde(default = "default_fatal_codes")]
    pub fatal: Vec<i32>,
}

fn default_timeout_codes() -> Vec<i32> {
    vec![408]
}

fn default_not_found_codes() -> Vec<i32> {
    vec![404]
}

fn default_insufficient_funds_codes() -> Vec<i32> {
    vec![402]
}

fn default_transaction_limit_codes() -> Vec<i32> {
    vec![429]
}

fn default_fatal_codes() -> Vec<i32> {
    vec![500]
}

impl Default for ErrorCodeMap {
    fn default() -> Self {
        Self {
            timeout: default_timeout_codes(),
            not_found: default_not_found_codes(),
            insufficient_funds: default_insufficient_funds_codes(),
            transaction_limit: default_transaction_limit_codes(),
            fatal: default_fatal_codes(),
        }
    }
}

impl ErrorCodeMap {
    /// Classify a raw exchange reply.
    ///
    /// `penalty` is the remaining penalty the exchange reported alongside a
    /// rate violation; ignored for every other class.
    pub fn classify(&self, code: i32, message: impl Into<String>, penalty: Option<Duration>) -> FailInfo {
        let class = if self.fatal.contains(&code) {
            FailClass::Fatal { code }
        } else if self.transaction_limit.contains(&code) {
            FailClass::TransactionLimit {
                penalty_remaining_ms: penalty.map(|d| d.as_millis() as u64),
            }
        } else if self.timeout.contains(&code) {
            FailClass::Timeout
        } else if self.not_found.contains(&code) {
            FailClass::NotFound
        } else if self.insufficient_funds.contains(&code) {
            FailClass::InsufficientFunds
        } else {
            FailClass::Other
        };
        FailInfo::new(class, Some(code), message)
    }
}
