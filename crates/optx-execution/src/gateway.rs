//! Gateway adapter contract.
//!
//! The exchange gateway is fire-and-forget: every call returns immediately
//! and its outcome, including transport errors, comes back later as a
//! [`GatewayEvent`] delivered to an [`EventSink`].

use optx_core::{Direction, FailInfo, OrderRoute, Price, TransactionId, Volume};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

/// One order instance as submitted to the exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderTicket {
    pub txid: TransactionId,
    /// Echoed back on every event for this order.
    pub route: OrderRoute,
    pub direction: Direction,
    pub price: Price,
    pub volume: Volume,
}

/// One leg of a batched replace.
#[derive(Debug, Clone, Copy)]
pub struct MoveLeg<'a> {
    pub old: &'a OrderTicket,
    pub new: &'a OrderTicket,
}

/// Exchange adapter consumed by order slots.
pub trait Gateway: Send + Sync {
    fn send_order(&self, ticket: &OrderTicket);

    /// Replace `old` by `new` in one exchange request.
    fn move_order(&self, old: &OrderTicket, new: &OrderTicket);

    fn cancel_order(&self, ticket: &OrderTicket);

    /// Replace two orders in a single batch.
    fn move_order_pair(&self, first: MoveLeg<'_>, second: MoveLeg<'_>);
}

/// Arc wrapper for Gateway trait objects.
pub type DynGateway = Arc<dyn Gateway>;

/// What happened to an order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrderEventKind {
    Registered,
    Matched,
    Canceled,
    RegisterFailed(FailInfo),
    CancelFailed(FailInfo),
}

impl OrderEventKind {
    pub fn fail(&self) -> Option<&FailInfo> {
        match self {
            Self::RegisterFailed(fail) | Self::CancelFailed(fail) => Some(fail),
            _ => None,
        }
    }
}

/// Event reported by a gateway adapter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayEvent {
    pub route: OrderRoute,
    pub txid: TransactionId,
    pub kind: OrderEventKind,
}

impl GatewayEvent {
    pub fn new(ticket: &OrderTicket, kind: OrderEventKind) -> Self {
        Self {
            route: ticket.route.clone(),
            txid: ticket.txid,
            kind,
        }
    }
}

/// Receiver of gateway callbacks. Called from any thread.
pub trait EventSink: Send + Sync {
    fn deliver(&self, event: GatewayEvent);

    /// Session-level rate violation not tied to one order.
    fn rate_violation(&self, penalty: Option<Duration>);
}

// ============================================================================
// Recording gateway
// ============================================================================

/// Gateway request captured by [`RecordingGateway`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayCall {
    Send(OrderTicket),
    Move {
        old: OrderTicket,
        new: OrderTicket,
    },
    Cancel(OrderTicket),
    MovePair {
        first: (OrderTicket, OrderTicket),
        second: (OrderTicket, OrderTicket),
    },
}

/// Gateway that only records requests, for tests.
#[derive(Debug, Default)]
pub struct RecordingGateway {
    calls: Mutex<Vec<GatewayCall>>,
}

impl RecordingGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get recorded calls.
    pub fn calls(&self) -> Vec<GatewayCall> {
        self.calls.lock().clone()
    }

    /// Drain recorded calls.
    pub fn take_calls(&self) -> Vec<GatewayCall> {
        std::mem::take(&mut *self.calls.lock())
    }

    pub fn len(&self) -> usize {
        self.calls.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.lock().is_empty()
    }
}

impl Gateway for RecordingGateway {
    fn send_order(&self, ticket: &OrderTicket) {
        self.calls.lock().push(GatewayCall::Send(ticket.clone()));
    }

    fn move_order(&self, old: &OrderTicket, new: &OrderTicket) {
        self.calls.lock().push(GatewayCall::Move {
            old: old.clone(),
            new: new.clone(),
        });
    }

    fn cancel_order(&self, ticket: &OrderTicket) {
        self.calls.lock().push(GatewayCall::Cancel(ticket.clone()));
    }

    fn move_order_pair(&self, first: MoveLeg<'_>, second: MoveLeg<'_>) {
        self.calls.lock().push(GatewayCall::MovePair {
            first: (first.old.clone(), first.new.clone()),
            second: (second.old.clone(), second.new.clone()),
        });
    }
}
