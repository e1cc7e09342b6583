//! Application error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Core error: {0}")]
    Core(#[from] optx_core::CoreError),

    #[error("Throttle error: {0}")]
    Throttle(#[from] optx_throttle::ThrottleError),

    #[error("Execution error: {0}")]
    Execution(#[from] optx_execution::ExecutionError),

    #[error("Telemetry error: {0}")]
    Telemetry(#[from] optx_telemetry::TelemetryError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type AppResult<T> = Result<T, AppError>;
