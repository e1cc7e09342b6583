//! optx engine.
//!
//! Wires the rate controller, instrument executors and a gateway into a
//! runnable application:
//! - `config`: TOML configuration with defaults
//! - `paper`: simulated exchange with its own rate limit
//! - `quoter`: static two-sided market-making strategy
//! - `app`: startup, run loop and graceful shutdown

pub mod app;
pub mod config;
pub mod error;
pub mod paper;
pub mod quoter;

pub use app::Application;
pub use config::{AppConfig, InstrumentConfig, TelemetryConfig};
pub use error::{AppError, AppResult};
pub use paper::{PaperConfig, PaperGateway, PaperStats};
pub use quoter::StaticQuoter;
