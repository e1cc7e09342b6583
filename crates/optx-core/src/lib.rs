//! Core domain types for the optx execution engine.
//!
//! This crate provides fundamental types used throughout the engine:
//! - `Price`, `Volume`: Precision-safe numeric types
//! - `TransactionId`, `InstrumentId`, `SlotId`: Identifiers and order routing
//! - `Direction`, `StrategyKind`, `TransactionType`: Trading enums
//! - `FailInfo`, `FailClass`, `ErrorCodeMap`: Gateway failure classification
//! - `Clock`, `Scheduler`, `TimerHandle`: Time source and cancelable deferred actions

pub mod decimal;
pub mod error;
pub mod fail;
pub mod order;
pub mod timer;

pub use decimal::{Price, Volume};
pub use error::{CoreError, Result};
pub use fail::{ErrorCodeMap, FailClass, FailInfo};
pub use order::{
    Direction, InstrumentId, OrderAction, OrderRoute, SlotId, StrategyKind, TransactionId,
    TransactionIdGenerator, TransactionType,
};
pub use timer::{
    Clock, DeferredTask, ManualScheduler, Scheduler, SystemClock, TimerHandle, TokioScheduler,
};
