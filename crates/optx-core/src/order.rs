//! Order-related types and identifiers.
//!
//! Provides direction, transaction id, routing and strategy-kind types
//! shared by the execution core and the rate controller.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::decimal::{Price, Volume};
use crate::error::{CoreError, Result};

/// Order direction: buy or sell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Buy,
    Sell,
}

impl Direction {
    /// Returns the opposite direction.
    pub fn opposite(&self) -> Self {
        match self {
            Self::Buy => Self::Sell,
            Self::Sell => Self::Buy,
        }
    }

    /// Returns 1 for buy, -1 for sell.
    pub fn sign(&self) -> i8 {
        match self {
            Self::Buy => 1,
            Self::Sell => -1,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Buy => write!(f, "buy"),
            Self::Sell => write!(f, "sell"),
        }
    }
}

/// Exchange transaction id of a single order instance.
///
/// Assigned once when the order object is created and never reused
/// within the lifetime of the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransactionId(u64);

impl TransactionId {
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tx{}", self.0)
    }
}

/// Generator for process-unique transaction ids.
///
/// Monotonically increasing, safe to share across instrument executors.
#[derive(Debug)]
pub struct TransactionIdGenerator {
    counter: AtomicU64,
}

impl TransactionIdGenerator {
    /// Create a new generator starting at 1.
    #[must_use]
    pub fn new() -> Self {
        Self::starting_at(1)
    }

    /// Create a generator whose first id is `first`.
    ///
    /// Used after a restart so ids do not collide with orders still
    /// known to the exchange session.
    #[must_use]
    pub fn starting_at(first: u64) -> Self {
        Self {
            counter: AtomicU64::new(first),
        }
    }

    /// Generate the next transaction id.
    pub fn next(&self) -> TransactionId {
        TransactionId(self.counter.fetch_add(1, Ordering::AcqRel))
    }
}

impl Default for TransactionIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

/// Traded instrument (option series) identifier.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstrumentId(String);

impl InstrumentId {
    pub fn new(symbol: impl Into<String>) -> Self {
        Self(symbol.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for InstrumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for InstrumentId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Index of an order slot inside its instrument executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SlotId(u32);

impl SlotId {
    pub fn new(index: u32) -> Self {
        Self(index)
    }

    pub fn index(&self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "slot{}", self.0)
    }
}

/// Where gateway events for an order must be delivered.
///
/// Carried on every ticket and echoed back by the gateway adapter.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OrderRoute {
    pub instrument: InstrumentId,
    pub slot: SlotId,
}

impl OrderRoute {
    pub fn new(instrument: InstrumentId, slot: SlotId) -> Self {
        Self { instrument, slot }
    }
}

impl fmt::Display for OrderRoute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.instrument, self.slot)
    }
}

/// Strategy category as seen by the rate controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    /// Quoting strategy; gets priority admission while the controller recovers.
    #[default]
    MarketMaking,
    /// Delta hedger.
    Hedge,
    /// Anything else.
    Other,
}

impl StrategyKind {
    pub fn is_market_making(&self) -> bool {
        matches!(self, Self::MarketMaking)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MarketMaking => "market_making",
            Self::Hedge => "hedge",
            Self::Other => "other",
        }
    }
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Admission-controlled exchange action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionType {
    NewOrder,
    Move,
    Cancel,
}

impl TransactionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NewOrder => "new_order",
            Self::Move => "move",
            Self::Cancel => "cancel",
        }
    }
}

impl fmt::Display for TransactionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Desired quote handed to an order slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderAction {
    pub direction: Direction,
    pub price: Price,
    pub volume: Volume,
}

impl OrderAction {
    /// Create a validated action.
    ///
    /// Price and volume must both be strictly positive.
    pub fn new(direction: Direction, price: Price, volume: Volume) -> Result<Self> {
        if !price.is_positive() {
            return Err(CoreError::InvalidPrice(price.to_string()));
        }
        if !volume.is_positive() {
            return Err(CoreError::InvalidVolume(volume.to_string()));
        }
        Ok(Self {
            direction,
            price,
            volume,
        })
    }
}
