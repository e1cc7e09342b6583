//! Logical order: one exchange order instance and its lifecycle.

use chrono::{DateTime, Utc};
use optx_core::{Direction, FailInfo, Price, TransactionId, Volume};

use crate::gateway::OrderTicket;

/// Terminal outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DoneKind {
    Matched,
    Canceled,
    Failed(FailInfo),
}

impl DoneKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Matched => "matched",
            Self::Canceled => "canceled",
            Self::Failed(_) => "failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrderLifecycle {
    /// Sent, not yet acknowledged.
    Pending,
    /// Registered on the exchange.
    Active,
    Done(DoneKind),
}

/// An order instance owned by a slot.
///
/// Timestamps are scheduler milliseconds; `created_at` is wall time for logs.
#[derive(Debug, Clone)]
pub struct LogicalOrder {
    ticket: OrderTicket,
    balance: Volume,
    lifecycle: OrderLifecycle,
    created_ms: u64,
    registered_ms: Option<u64>,
    cancel_sent_ms: Option<u64>,
    done_ms: Option<u64>,
    created_at: DateTime<Utc>,
}

impl LogicalOrder {
    pub fn new(ticket: OrderTicket, now_ms: u64) -> Self {
        let balance = ticket.volume;
        Self {
            ticket,
            balance,
            lifecycle: OrderLifecycle::Pending,
            created_ms: now_ms,
            registered_ms: None,
            cancel_sent_ms: None,
            done_ms: None,
            created_at: Utc::now(),
        }
    }

    pub fn txid(&self) -> TransactionId {
        self.ticket.txid
    }

    pub fn ticket(&self) -> &OrderTicket {
        &self.ticket
    }

    pub fn direction(&self) -> Direction {
        self.ticket.direction
    }

    pub fn price(&self) -> Price {
        self.ticket.price
    }

    pub fn volume(&self) -> Volume {
        self.ticket.volume
    }

    /// Unfilled volume.
    pub fn balance(&self) -> Volume {
        self.balance
    }

    pub fn lifecycle(&self) -> &OrderLifecycle {
        &self.lifecycle
    }

    pub fn is_done(&self) -> bool {
        matches!(self.lifecycle, OrderLifecycle::Done(_))
    }

    pub fn is_registered(&self) -> bool {
        self.registered_ms.is_some()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Returns false if the order was already registered or is done.
    pub fn mark_registered(&mut self, now_ms: u64) -> bool {
        if self.lifecycle != OrderLifecycle::Pending {
            return false;
        }
        self.lifecycle = OrderLifecycle::Active;
        self.registered_ms = Some(now_ms);
        true
    }

    pub fn mark_cancel_sent(&mut self, now_ms: u64) {
        if self.cancel_sent_ms.is_none() {
            self.cancel_sent_ms = Some(now_ms);
        }
    }

    /// Cancel request was rejected; the order keeps living.
    pub fn clear_cancel_sent(&mut self) {
        self.cancel_sent_ms = None;
    }

    /// Move to a terminal state. Returns false if already terminal.
    pub fn mark_done(&mut self, kind: DoneKind, now_ms: u64) -> bool {
        if self.is_done() {
            return false;
        }
        if kind == DoneKind::Matched {
            self.balance = Volume::ZERO;
        }
        self.lifecycle = OrderLifecycle::Done(kind);
        self.done_ms = Some(now_ms);
        true
    }

    /// Send to registration.
    pub fn registration_latency_ms(&self) -> Option<u64> {
        self.registered_ms
            .map(|at| at.saturating_sub(self.created_ms))
    }

    /// Cancel request to terminal state.
    pub fn cancel_latency_ms(&self) -> Option<u64> {
        match (self.cancel_sent_ms, self.done_ms) {
            (Some(sent), Some(done)) => Some(done.saturating_sub(sent)),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use optx_core::{InstrumentId, OrderRoute, SlotId};
    use rust_decimal_macros::dec;

    fn order() -> LogicalOrder {
        let ticket = OrderTicket {
            txid: TransactionId::new(11),
            route: OrderRoute::new(InstrumentId::new("OPT"), SlotId::new(0)),
            direction: Direction::Sell,
            price: Price::new(dec!(2.5)),
            volume: Volume::new(dec!(4)),
        };
        LogicalOrder::new(ticket, 1_000)
    }

    #[test]
    fn test_lifecycle_and_latencies() {
        let mut order = order();
        assert_eq!(order.lifecycle(), &OrderLifecycle::Pending);

        assert!(order.mark_registered(1_012));
        assert!(!order.mark_registered(1_020));
        assert_eq!(order.registration_latency_ms(), Some(12));

        order.mark_cancel_sent(2_000);
        assert_eq!(order.cancel_latency_ms(), None);
        assert!(order.mark_done(DoneKind::Canceled, 2_030));
        assert_eq!(order.cancel_latency_ms(), Some(30));
    }

    #[test]
    fn test_done_is_once_only() {
        let mut order = order();
        assert!(order.mark_done(DoneKind::Matched, 1_500));
        assert!(!order.mark_done(DoneKind::Canceled, 1_600));

        assert_eq!(order.lifecycle(), &OrderLifecycle::Done(DoneKind::Matched));
        assert_eq!(order.balance(), Volume::ZERO);
        assert!(!order.mark_registered(1_700));
    }
}
