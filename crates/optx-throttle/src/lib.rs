//! Transaction rate admission control.
//!
//! A single process-wide [`TransactionRateController`] decides whether a
//! New/Move/Cancel may be submitted, based on a rolling window of recent
//! transactions, a sub-quota for brand-new orders, a reserve kept for
//! critical callers and exchange-confirmed penalties.
//!
//! Degradation is graded:
//! `NormalOperation` → `NewOrderLimitExceeded` → `LimitExceeded`, with an
//! optional `MmOnly` phase on recovery that gives market makers priority.

pub mod config;
pub mod controller;
pub mod error;
pub mod window;

pub use config::ControllerConfig;
pub use controller::{
    Admission, AdmitRequest, CancelAll, ControllerState, RejectReason, RestoreAction,
    TransactionRateController,
};
pub use error::{ThrottleError, ThrottleResult};
pub use window::RateWindow;
