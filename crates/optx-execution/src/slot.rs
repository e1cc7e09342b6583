//! Order slot: dual-order lifecycle state machine.
//!
//! A slot turns desired quotes into New/Move/Cancel requests while tracking
//! at most two in-flight order instances. It is owned by exactly one
//! instrument executor; every method takes `&mut self`, so mutation can only
//! happen on that executor.
//!
//! # States
//!
//! | state              | current | processing | canceling              |
//! |--------------------|---------|------------|------------------------|
//! | `Inactive`         | -       | -          | -                      |
//! | `Active`           | order   | -          | order if cancel pending |
//! | `ProcessingNew`    | order   | order      | -                      |
//! | `ProcessingMove`   | old     | new        | old                    |
//! | `ProcessingCancel` | order (or the order it replaces) | order | order |
//!
//! During a move `current` keeps reporting the old order until the
//! replacement is registered; the target price is read from `processing`.
//!
//! Gateway callbacks never touch the slot directly. They are marshaled onto
//! the owning executor and fed in through [`OrderSlot::handle_event`].
//! Notifications for the strategy are queued and drained with
//! [`OrderSlot::take_events`].

use serde::{Deserialize, Serialize};
use std::fmt;
use std::mem;
use std::sync::Arc;
use std::time::Duration;

use optx_core::{
    FailClass, FailInfo, InstrumentId, OrderAction, OrderRoute, Scheduler, SlotId, TimerHandle,
    TransactionId, TransactionIdGenerator,
};
use optx_telemetry::Metrics;
use tracing::{debug, error, info, warn};

use crate::error::{SlotError, SlotResult};
use crate::gateway::{DynGateway, MoveLeg, OrderEventKind, OrderTicket};
use crate::order::{DoneKind, LogicalOrder};

// ============================================================================
// Configuration
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlotConfig {
    /// Grace period before an ambiguous gateway timeout is treated as a failure.
    #[serde(default = "default_timeout_grace_ms")]
    pub timeout_grace_ms: u64,
    /// Replaced orders kept while waiting for their terminal event.
    #[serde(default = "default_max_superseded")]
    pub max_superseded: usize,
}

fn default_timeout_grace_ms() -> u64 {
    5000
}

fn default_max_superseded() -> usize {
    16
}

impl Default for SlotConfig {
    fn default() -> Self {
        Self {
            timeout_grace_ms: default_timeout_grace_ms(),
            max_superseded: default_max_superseded(),
        }
    }
}

// ============================================================================
// Public types
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SlotStatus {
    Inactive,
    Active,
    ProcessingNew,
    ProcessingMove,
    ProcessingCancel,
}

impl SlotStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Inactive => "inactive",
            Self::Active => "active",
            Self::ProcessingNew => "processing_new",
            Self::ProcessingMove => "processing_move",
            Self::ProcessingCancel => "processing_cancel",
        }
    }

    pub fn is_processing(&self) -> bool {
        matches!(
            self,
            Self::ProcessingNew | Self::ProcessingMove | Self::ProcessingCancel
        )
    }
}

impl fmt::Display for SlotStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why an order changed state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StateChangeReason {
    Matched,
    Canceled,
    Failed(FailClass),
    /// Still unresolved after the timeout grace period.
    TimedOut,
    CancelRejected(FailClass),
}

/// Notification raised by a slot for its strategy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlotEvent {
    CurrentOrderChanged {
        slot: SlotId,
        txid: Option<TransactionId>,
    },
    OrderRegistered {
        slot: SlotId,
        txid: TransactionId,
    },
    OrderStateChanged {
        slot: SlotId,
        txid: TransactionId,
        reason: StateChangeReason,
    },
    /// Recoverable: the exchange refused the order for lack of funds.
    NotEnoughMoney {
        slot: SlotId,
        txid: TransactionId,
    },
    /// Unrecoverable; the owning strategy must stop.
    FatalError {
        slot: SlotId,
        txid: Option<TransactionId>,
        reason: String,
    },
}

impl SlotEvent {
    pub fn slot(&self) -> SlotId {
        match self {
            Self::CurrentOrderChanged { slot, .. }
            | Self::OrderRegistered { slot, .. }
            | Self::OrderStateChanged { slot, .. }
            | Self::NotEnoughMoney { slot, .. }
            | Self::FatalError { slot, .. } => *slot,
        }
    }
}

/// Destination of deferred timeout re-checks.
///
/// The executor implements this by posting a message to itself, so the
/// re-check runs on the slot's own executor.
pub trait RecheckSink: Send + Sync {
    fn post_recheck(&self, slot: SlotId, txid: TransactionId);
}

/// Collaborators shared by every slot of an instrument.
#[derive(Clone)]
pub struct SlotServices {
    pub gateway: DynGateway,
    pub scheduler: Arc<dyn Scheduler>,
    pub ids: Arc<TransactionIdGenerator>,
    pub recheck: Arc<dyn RecheckSink>,
}

// ============================================================================
// Internal state
// ============================================================================

#[derive(Debug, Default)]
enum SlotState {
    #[default]
    Inactive,
    Active {
        order: LogicalOrder,
        cancel_pending: bool,
    },
    ProcessingNew {
        order: LogicalOrder,
    },
    ProcessingMove {
        old: LogicalOrder,
        new: LogicalOrder,
    },
    /// Old order of a move already done; nothing live until the replacement registers.
    ProcessingReplace {
        new: LogicalOrder,
    },
    ProcessingCancel {
        order: LogicalOrder,
        replacing: Option<LogicalOrder>,
    },
}

impl SlotState {
    fn status(&self) -> SlotStatus {
        match self {
            Self::Inactive => SlotStatus::Inactive,
            Self::Active { .. } => SlotStatus::Active,
            Self::ProcessingNew { .. } => SlotStatus::ProcessingNew,
            Self::ProcessingMove { .. } | Self::ProcessingReplace { .. } => {
                SlotStatus::ProcessingMove
            }
            Self::ProcessingCancel { .. } => SlotStatus::ProcessingCancel,
        }
    }

    fn current(&self) -> Option<&LogicalOrder> {
        match self {
            Self::Inactive | Self::ProcessingReplace { .. } => None,
            Self::Active { order, .. } | Self::ProcessingNew { order } => Some(order),
            Self::ProcessingMove { old, .. } => Some(old),
            Self::ProcessingCancel { order, replacing } => Some(replacing.as_ref().unwrap_or(order)),
        }
    }

    fn processing(&self) -> Option<&LogicalOrder> {
        match self {
            Self::Inactive | Self::Active { .. } => None,
            Self::ProcessingNew { order } | Self::ProcessingCancel { order, .. } => Some(order),
            Self::ProcessingMove { new, .. } | Self::ProcessingReplace { new } => Some(new),
        }
    }

    fn canceling(&self) -> Option<&LogicalOrder> {
        match self {
            Self::Active {
                order,
                cancel_pending: true,
            } => Some(order),
            Self::ProcessingMove { old, .. } => Some(old),
            Self::ProcessingCancel { order, .. } => Some(order),
            _ => None,
        }
    }

    fn cancel_requested(&self) -> bool {
        matches!(
            self,
            Self::ProcessingCancel { .. }
                | Self::Active {
                    cancel_pending: true,
                    ..
                }
        )
    }

    fn tracks(&self, txid: TransactionId) -> bool {
        match self {
            Self::Inactive => false,
            Self::Active { order, .. }
            | Self::ProcessingNew { order }
            | Self::ProcessingReplace { new: order } => order.txid() == txid,
            Self::ProcessingMove { old, new } => old.txid() == txid || new.txid() == txid,
            Self::ProcessingCancel { order, replacing } => {
                order.txid() == txid || replacing.as_ref().is_some_and(|o| o.txid() == txid)
            }
        }
    }
}

struct PendingTimeout {
    txid: TransactionId,
    timer: TimerHandle,
}

// ============================================================================
// Order slot
// ============================================================================

pub struct OrderSlot {
    id: SlotId,
    route: OrderRoute,
    config: SlotConfig,
    state: SlotState,
    /// Orders replaced by a confirmed move, awaiting their terminal event.
    superseded: Vec<LogicalOrder>,
    pending_timeouts: Vec<PendingTimeout>,
    services: SlotServices,
    events: Vec<SlotEvent>,
}

impl OrderSlot {
    pub fn new(
        id: SlotId,
        instrument: InstrumentId,
        config: SlotConfig,
        services: SlotServices,
    ) -> Self {
        Self {
            id,
            route: OrderRoute::new(instrument, id),
            config,
            state: SlotState::Inactive,
            superseded: Vec::new(),
            pending_timeouts: Vec::new(),
            services,
            events: Vec::new(),
        }
    }

    pub fn id(&self) -> SlotId {
        self.id
    }

    pub fn route(&self) -> &OrderRoute {
        &self.route
    }

    pub fn status(&self) -> SlotStatus {
        self.state.status()
    }

    pub fn is_inactive(&self) -> bool {
        matches!(self.state, SlotState::Inactive)
    }

    pub fn is_active(&self) -> bool {
        matches!(self.state, SlotState::Active { .. })
    }

    pub fn is_processing(&self) -> bool {
        self.status().is_processing()
    }

    /// Order believed live (or about to be, for a brand-new order).
    pub fn current(&self) -> Option<&LogicalOrder> {
        self.state.current()
    }

    /// Order whose request is in flight.
    pub fn processing(&self) -> Option<&LogicalOrder> {
        self.state.processing()
    }

    /// Order being cancelled, directly or by a move.
    pub fn canceling(&self) -> Option<&LogicalOrder> {
        self.state.canceling()
    }

    pub fn cancel_requested(&self) -> bool {
        self.state.cancel_requested()
    }

    pub fn can_cancel(&self) -> bool {
        self.is_active() || (self.is_processing() && !self.cancel_requested())
    }

    pub fn has_pending_timeout(&self) -> bool {
        !self.pending_timeouts.is_empty()
    }

    pub fn superseded_len(&self) -> usize {
        self.superseded.len()
    }

    /// Drain queued notifications.
    pub fn take_events(&mut self) -> Vec<SlotEvent> {
        mem::take(&mut self.events)
    }

    pub fn has_events(&self) -> bool {
        !self.events.is_empty()
    }

    // ------------------------------------------------------------------------
    // Requests
    // ------------------------------------------------------------------------

    /// Submit a brand-new order. Requires `Inactive`.
    pub fn send_new(&mut self, action: OrderAction) -> SlotResult<TransactionId> {
        if !self.is_inactive() {
            error!(
                instrument = %self.route.instrument,
                slot = %self.id,
                state = %self.status(),
                "send_new on a slot that is not inactive"
            );
            return Err(self.reject("send_new"));
        }

        let order = self.create_order(&action);
        let txid = order.txid();
        self.services.gateway.send_order(order.ticket());
        self.state = SlotState::ProcessingNew { order };

        info!(
            instrument = %self.route.instrument,
            slot = %self.id,
            txid = %txid,
            direction = %action.direction,
            price = %action.price,
            volume = %action.volume,
            from = "inactive",
            to = "processing_new",
            "New order sent"
        );
        self.events.push(SlotEvent::CurrentOrderChanged {
            slot: self.id,
            txid: Some(txid),
        });
        Ok(txid)
    }

    /// Replace the live order. Requires `Active`.
    ///
    /// `current` keeps the old order until the replacement is registered.
    pub fn move_to(&mut self, action: OrderAction) -> SlotResult<TransactionId> {
        if !self.is_active() {
            warn!(
                instrument = %self.route.instrument,
                slot = %self.id,
                state = %self.status(),
                "move_to on a slot that is not active"
            );
            return Err(self.reject("move_to"));
        }

        let new = self.create_order(&action);
        let now = self.now();
        match mem::take(&mut self.state) {
            SlotState::Active { order: mut old, .. } => {
                let txid = new.txid();
                old.mark_cancel_sent(now);
                self.services.gateway.move_order(old.ticket(), new.ticket());

                info!(
                    instrument = %self.route.instrument,
                    slot = %self.id,
                    old_txid = %old.txid(),
                    txid = %txid,
                    old_price = %old.price(),
                    price = %action.price,
                    from = "active",
                    to = "processing_move",
                    "Move sent"
                );
                self.state = SlotState::ProcessingMove { old, new };
                Ok(txid)
            }
            other => {
                self.state = other;
                Err(self.reject("move_to"))
            }
        }
    }

    /// Cancel the live or in-flight order. Requires `can_cancel`.
    pub fn cancel(&mut self) -> SlotResult<()> {
        let now = self.now();
        let from = self.status();

        let (next, ticket) = match mem::take(&mut self.state) {
            SlotState::Active { mut order, .. }
            | SlotState::ProcessingNew { mut order }
            | SlotState::ProcessingReplace { new: mut order } => {
                order.mark_cancel_sent(now);
                let ticket = order.ticket().clone();
                (
                    SlotState::ProcessingCancel {
                        order,
                        replacing: None,
                    },
                    ticket,
                )
            }
            SlotState::ProcessingMove { old, mut new } => {
                new.mark_cancel_sent(now);
                let ticket = new.ticket().clone();
                (
                    SlotState::ProcessingCancel {
                        order: new,
                        replacing: Some(old),
                    },
                    ticket,
                )
            }
            other => {
                self.state = other;
                warn!(
                    instrument = %self.route.instrument,
                    slot = %self.id,
                    state = %from,
                    "cancel on a slot that cannot cancel"
                );
                return Err(self.reject("cancel"));
            }
        };

        self.state = next;
        self.services.gateway.cancel_order(&ticket);
        info!(
            instrument = %self.route.instrument,
            slot = %self.id,
            txid = %ticket.txid,
            from = %from,
            to = "processing_cancel",
            "Cancel sent"
        );
        Ok(())
    }

    /// Move the live orders of two different slots in one gateway batch.
    ///
    /// Both slots must be `Active`; otherwise nothing is sent and neither
    /// slot changes.
    pub fn move_pair(
        first: &mut OrderSlot,
        first_action: OrderAction,
        second: &mut OrderSlot,
        second_action: OrderAction,
    ) -> SlotResult<(TransactionId, TransactionId)> {
        if !first.is_active() || !second.is_active() {
            warn!(
                first = %first.route,
                first_state = %first.status(),
                second = %second.route,
                second_state = %second.status(),
                "move_pair requires both slots active"
            );
            return Err(SlotError::PairNotActive {
                first: first.status(),
                second: second.status(),
            });
        }

        let first_new = first.create_order(&first_action);
        let second_new = second.create_order(&second_action);
        let now = first.now();

        let (mut first_old, mut second_old) =
            match (mem::take(&mut first.state), mem::take(&mut second.state)) {
                (
                    SlotState::Active { order: a, .. },
                    SlotState::Active { order: b, .. },
                ) => (a, b),
                (a, b) => {
                    first.state = a;
                    second.state = b;
                    return Err(SlotError::PairNotActive {
                        first: first.status(),
                        second: second.status(),
                    });
                }
            };

        first_old.mark_cancel_sent(now);
        second_old.mark_cancel_sent(now);
        first.services.gateway.move_order_pair(
            MoveLeg {
                old: first_old.ticket(),
                new: first_new.ticket(),
            },
            MoveLeg {
                old: second_old.ticket(),
                new: second_new.ticket(),
            },
        );

        let txids = (first_new.txid(), second_new.txid());
        info!(
            first = %first.route,
            first_txid = %txids.0,
            second = %second.route,
            second_txid = %txids.1,
            "Move pair sent"
        );

        first.state = SlotState::ProcessingMove {
            old: first_old,
            new: first_new,
        };
        second.state = SlotState::ProcessingMove {
            old: second_old,
            new: second_new,
        };
        Ok(txids)
    }

    /// Drop every order reference without contacting the exchange.
    ///
    /// Abnormal teardown only.
    pub fn force_reset(&mut self) {
        self.cancel_all_timeouts();
        if self.is_inactive() && self.superseded.is_empty() {
            debug!(slot = %self.id, "Force reset on idle slot");
            return;
        }

        let before = self.current_txid();
        let from = self.status();
        let processing = self.processing().map(|o| o.txid());
        let abandoned = self.superseded.len();
        self.state = SlotState::Inactive;
        self.superseded.clear();

        warn!(
            instrument = %self.route.instrument,
            slot = %self.id,
            from = %from,
            current = ?before,
            processing = ?processing,
            abandoned,
            "Order slot force reset"
        );
        Metrics::slot_anomaly(self.route.instrument.as_str(), "force_reset");
        self.commit(before);
    }

    // ------------------------------------------------------------------------
    // Gateway events
    // ------------------------------------------------------------------------

    pub fn handle_event(&mut self, txid: TransactionId, kind: OrderEventKind) {
        match kind {
            OrderEventKind::Registered => self.on_registered(txid),
            OrderEventKind::Matched => self.on_done(txid, DoneKind::Matched),
            OrderEventKind::Canceled => self.on_done(txid, DoneKind::Canceled),
            OrderEventKind::RegisterFailed(fail) => self.on_done(txid, DoneKind::Failed(fail)),
            OrderEventKind::CancelFailed(fail) => self.on_cancel_failed(txid, fail),
        }
    }

    pub fn on_registered(&mut self, txid: TransactionId) {
        self.settle_timeout(txid);
        let now = self.now();
        let before = self.current_txid();
        let from = self.status();

        let (next, promoted, retired) = match mem::take(&mut self.state) {
            SlotState::ProcessingNew { mut order }
            | SlotState::ProcessingReplace { new: mut order }
                if order.txid() == txid =>
            {
                order.mark_registered(now);
                let latency = order.registration_latency_ms();
                (
                    SlotState::Active {
                        order,
                        cancel_pending: false,
                    },
                    Some(latency),
                    None,
                )
            }
            SlotState::ProcessingMove { old, mut new } if new.txid() == txid => {
                new.mark_registered(now);
                let latency = new.registration_latency_ms();
                (
                    SlotState::Active {
                        order: new,
                        cancel_pending: false,
                    },
                    Some(latency),
                    Some(old),
                )
            }
            SlotState::ProcessingCancel { mut order, replacing }
                if order.txid() == txid && !order.is_registered() =>
            {
                // Registered while its cancel is still in flight.
                order.mark_registered(now);
                let latency = order.registration_latency_ms();
                (
                    SlotState::Active {
                        order,
                        cancel_pending: true,
                    },
                    Some(latency),
                    replacing,
                )
            }
            other => (other, None, None),
        };
        self.state = next;

        let Some(latency) = promoted else {
            self.on_untracked_registration(txid, now);
            return;
        };

        if let Some(old) = retired {
            self.retire(old);
        }
        if let Some(ms) = latency {
            Metrics::register_latency(self.route.instrument.as_str(), ms as f64);
        }
        info!(
            instrument = %self.route.instrument,
            slot = %self.id,
            txid = %txid,
            latency_ms = ?latency,
            from = %from,
            to = %self.status(),
            "Order registered"
        );
        self.commit(before);
        self.events.push(SlotEvent::OrderRegistered { slot: self.id, txid });
    }

    /// Terminal event: matched, cancelled or failed.
    pub fn on_done(&mut self, txid: TransactionId, kind: DoneKind) {
        if let DoneKind::Failed(fail) = &kind {
            if fail.is_timeout() && self.state.tracks(txid) {
                self.defer_timeout(txid);
                return;
            }
        }
        self.settle_timeout(txid);
        self.finish(txid, kind, false);
    }

    /// Grace period for an ambiguous timeout elapsed.
    pub fn on_timeout_recheck(&mut self, txid: TransactionId) {
        let Some(pos) = self.pending_timeouts.iter().position(|p| p.txid == txid) else {
            debug!(slot = %self.id, txid = %txid, "Timeout re-check already settled");
            return;
        };
        self.pending_timeouts.remove(pos);

        warn!(
            instrument = %self.route.instrument,
            slot = %self.id,
            txid = %txid,
            grace_ms = self.config.timeout_grace_ms,
            "Order unresolved after timeout grace, finalizing as failed"
        );
        self.finish(txid, DoneKind::Failed(FailInfo::timeout()), true);
    }

    pub fn on_cancel_failed(&mut self, txid: TransactionId, fail: FailInfo) {
        if fail.is_order_not_found() {
            debug!(
                slot = %self.id,
                txid = %txid,
                "Cancel target not found, ignoring"
            );
            return;
        }

        let before = self.current_txid();
        let from = self.status();
        let mut abandoned = None;

        let (next, handled) = match mem::take(&mut self.state) {
            SlotState::Active {
                mut order,
                cancel_pending: true,
            } if order.txid() == txid => {
                order.clear_cancel_sent();
                (
                    SlotState::Active {
                        order,
                        cancel_pending: false,
                    },
                    true,
                )
            }
            SlotState::ProcessingCancel { mut order, replacing } if order.txid() == txid => {
                order.clear_cancel_sent();
                let next = match replacing {
                    Some(old) => SlotState::ProcessingMove { old, new: order },
                    None if order.is_registered() => SlotState::Active {
                        order,
                        cancel_pending: false,
                    },
                    None => SlotState::ProcessingNew { order },
                };
                (next, true)
            }
            SlotState::ProcessingMove { mut old, new } if old.txid() == txid => {
                // Replace rejected: the original survives, the replacement is orphaned.
                old.clear_cancel_sent();
                abandoned = Some(new);
                (
                    SlotState::Active {
                        order: old,
                        cancel_pending: false,
                    },
                    true,
                )
            }
            other => (other, false),
        };
        self.state = next;

        if !handled {
            debug!(
                slot = %self.id,
                txid = %txid,
                fail = %fail,
                "Cancel failure for untracked order"
            );
            return;
        }
        if let Some(order) = abandoned {
            self.retire(order);
        }

        warn!(
            instrument = %self.route.instrument,
            slot = %self.id,
            txid = %txid,
            fail = %fail,
            from = %from,
            to = %self.status(),
            "Cancel rejected"
        );
        self.commit(before);
        self.events.push(SlotEvent::OrderStateChanged {
            slot: self.id,
            txid,
            reason: StateChangeReason::CancelRejected(fail.class),
        });
        if fail.is_fatal() {
            self.escalate_fatal(Some(txid), &fail);
        }
    }

    // ------------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------------

    fn now(&self) -> u64 {
        self.services.scheduler.now_ms()
    }

    fn current_txid(&self) -> Option<TransactionId> {
        self.current().map(|o| o.txid())
    }

    fn create_order(&self, action: &OrderAction) -> LogicalOrder {
        let ticket = OrderTicket {
            txid: self.services.ids.next(),
            route: self.route.clone(),
            direction: action.direction,
            price: action.price,
            volume: action.volume,
        };
        LogicalOrder::new(ticket, self.now())
    }

    fn reject(&self, op: &'static str) -> SlotError {
        Metrics::slot_anomaly(self.route.instrument.as_str(), "invalid_transition");
        SlotError::InvalidState {
            slot: self.id,
            op,
            state: self.status(),
        }
    }

    /// Queue `CurrentOrderChanged` if `current` differs from `before`.
    fn commit(&mut self, before: Option<TransactionId>) {
        let after = self.current_txid();
        if after != before {
            self.events.push(SlotEvent::CurrentOrderChanged {
                slot: self.id,
                txid: after,
            });
        }
    }

    fn finish(&mut self, txid: TransactionId, kind: DoneKind, timed_out: bool) {
        let now = self.now();
        let before = self.current_txid();
        let from = self.status();

        let (next, finished) = match mem::take(&mut self.state) {
            SlotState::Active { order, .. } if order.txid() == txid => {
                (SlotState::Inactive, Some(order))
            }
            SlotState::ProcessingNew { order } | SlotState::ProcessingReplace { new: order }
                if order.txid() == txid =>
            {
                (SlotState::Inactive, Some(order))
            }
            SlotState::ProcessingMove { old, new } if old.txid() == txid => {
                // Old order gone before the replace confirmed: nothing is live
                // until the replacement registers.
                (SlotState::ProcessingReplace { new }, Some(old))
            }
            SlotState::ProcessingMove { old, new } if new.txid() == txid => (
                SlotState::Active {
                    order: old,
                    cancel_pending: false,
                },
                Some(new),
            ),
            SlotState::ProcessingCancel { order, replacing } if order.txid() == txid => {
                let next = match replacing {
                    Some(old) => SlotState::Active {
                        order: old,
                        cancel_pending: false,
                    },
                    None => SlotState::Inactive,
                };
                (next, Some(order))
            }
            SlotState::ProcessingCancel {
                order,
                replacing: Some(old),
            } if old.txid() == txid => (
                SlotState::ProcessingCancel {
                    order,
                    replacing: None,
                },
                Some(old),
            ),
            other => (other, None),
        };
        self.state = next;

        let (order, tracked) = match finished {
            Some(order) => (order, true),
            None => match self.superseded.iter().position(|o| o.txid() == txid) {
                Some(pos) => (self.superseded.remove(pos), false),
                None => {
                    warn!(
                        instrument = %self.route.instrument,
                        slot = %self.id,
                        txid = %txid,
                        outcome = kind.as_str(),
                        "Terminal event for unknown order"
                    );
                    Metrics::slot_anomaly(self.route.instrument.as_str(), "stale_event");
                    return;
                }
            },
        };

        let reason = match &kind {
            DoneKind::Matched => StateChangeReason::Matched,
            DoneKind::Canceled => StateChangeReason::Canceled,
            DoneKind::Failed(_) if timed_out => StateChangeReason::TimedOut,
            DoneKind::Failed(fail) => StateChangeReason::Failed(fail.class),
        };
        let escalation = match &kind {
            DoneKind::Failed(fail) if fail.is_fatal() || fail.is_not_enough_money() => {
                Some(fail.clone())
            }
            _ => None,
        };

        self.finalize(order, kind, now);
        if tracked {
            info!(
                instrument = %self.route.instrument,
                slot = %self.id,
                txid = %txid,
                reason = ?reason,
                from = %from,
                to = %self.status(),
                "Order done"
            );
        }
        self.commit(before);
        self.events.push(SlotEvent::OrderStateChanged {
            slot: self.id,
            txid,
            reason,
        });

        if let Some(fail) = escalation {
            if fail.is_fatal() {
                self.escalate_fatal(Some(txid), &fail);
            } else {
                warn!(
                    instrument = %self.route.instrument,
                    slot = %self.id,
                    txid = %txid,
                    fail = %fail,
                    "Not enough money"
                );
                self.events.push(SlotEvent::NotEnoughMoney { slot: self.id, txid });
            }
        }
    }

    fn finalize(&self, mut order: LogicalOrder, kind: DoneKind, now: u64) {
        let outcome = kind.as_str();
        if !order.mark_done(kind, now) {
            return;
        }
        let instrument = self.route.instrument.as_str();
        Metrics::order_done(instrument, outcome);
        if let Some(ms) = order.cancel_latency_ms() {
            Metrics::cancel_latency(instrument, ms as f64);
        }
        debug!(
            instrument,
            txid = %order.txid(),
            outcome,
            created_at = %order.created_at(),
            registration_latency_ms = ?order.registration_latency_ms(),
            cancel_latency_ms = ?order.cancel_latency_ms(),
            "Order finalized"
        );
    }

    fn escalate_fatal(&mut self, txid: Option<TransactionId>, fail: &FailInfo) {
        error!(
            instrument = %self.route.instrument,
            slot = %self.id,
            txid = ?txid,
            fail = %fail,
            "Fatal order failure"
        );
        Metrics::slot_anomaly(self.route.instrument.as_str(), "fatal");
        self.events.push(SlotEvent::FatalError {
            slot: self.id,
            txid,
            reason: fail.to_string(),
        });
    }

    /// Park an order replaced by a confirmed move until its terminal event.
    fn retire(&mut self, order: LogicalOrder) {
        if order.is_done() {
            return;
        }
        self.superseded.push(order);
        if self.superseded.len() > self.config.max_superseded {
            let dropped = self.superseded.remove(0);
            warn!(
                slot = %self.id,
                txid = %dropped.txid(),
                "Superseded order list full, dropping oldest"
            );
        }
    }

    fn on_untracked_registration(&mut self, txid: TransactionId, now: u64) {
        if let Some(order) = self.superseded.iter_mut().find(|o| o.txid() == txid) {
            order.mark_registered(now);
            warn!(
                instrument = %self.route.instrument,
                slot = %self.id,
                txid = %txid,
                price = %order.price(),
                "Superseded order registered, live order is untracked"
            );
            Metrics::slot_anomaly(self.route.instrument.as_str(), "orphan");
        } else if self.current_txid() == Some(txid) {
            debug!(slot = %self.id, txid = %txid, "Duplicate registration");
        } else {
            warn!(
                instrument = %self.route.instrument,
                slot = %self.id,
                txid = %txid,
                state = %self.status(),
                "Registration for unknown order"
            );
            Metrics::slot_anomaly(self.route.instrument.as_str(), "stale_event");
        }
    }

    fn defer_timeout(&mut self, txid: TransactionId) {
        if self.pending_timeouts.iter().any(|p| p.txid == txid) {
            debug!(slot = %self.id, txid = %txid, "Timeout re-check already scheduled");
            return;
        }

        let slot = self.id;
        let sink = self.services.recheck.clone();
        let timer = self.services.scheduler.schedule(
            Duration::from_millis(self.config.timeout_grace_ms),
            Box::new(move || sink.post_recheck(slot, txid)),
        );
        self.pending_timeouts.push(PendingTimeout { txid, timer });

        warn!(
            instrument = %self.route.instrument,
            slot = %self.id,
            txid = %txid,
            grace_ms = self.config.timeout_grace_ms,
            "Gateway timeout, deferring decision"
        );
    }

    /// A real event arrived: drop the pending re-check for `txid`.
    fn settle_timeout(&mut self, txid: TransactionId) {
        if let Some(pos) = self.pending_timeouts.iter().position(|p| p.txid == txid) {
            let pending = self.pending_timeouts.remove(pos);
            pending.timer.cancel();
            debug!(slot = %self.id, txid = %txid, "Timeout re-check cancelled by real event");
        }
    }

    fn cancel_all_timeouts(&mut self) {
        for pending in self.pending_timeouts.drain(..) {
            pending.timer.cancel();
        }
    }
}

impl Drop for OrderSlot {
    fn drop(&mut self) {
        self.cancel_all_timeouts();
    }
}

impl fmt::Debug for OrderSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OrderSlot")
            .field("route", &self.route)
            .field("state", &self.status())
            .field("current", &self.current_txid())
            .field("processing", &self.processing().map(|o| o.txid()))
            .field("superseded", &self.superseded.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::{GatewayCall, RecordingGateway};
    use optx_core::{Direction, ManualScheduler, Price, Volume};
    use parking_lot::Mutex;
    use rust_decimal_macros::dec;

    #[derive(Default)]
    struct RecordingRecheck {
        posted: Mutex<Vec<(SlotId, TransactionId)>>,
    }

    impl RecheckSink for RecordingRecheck {
        fn post_recheck(&self, slot: SlotId, txid: TransactionId) {
            self.posted.lock().push((slot, txid));
        }
    }

    struct Harness {
        gateway: Arc<RecordingGateway>,
        sched: Arc<ManualScheduler>,
        rechecks: Arc<RecordingRecheck>,
        services: SlotServices,
    }

    impl Harness {
        fn new() -> Self {
            let gateway = Arc::new(RecordingGateway::new());
            let sched = Arc::new(ManualScheduler::new(0));
            let rechecks = Arc::new(RecordingRecheck::default());
            let services = SlotServices {
                gateway: gateway.clone(),
                scheduler: sched.clone(),
                ids: Arc::new(TransactionIdGenerator::new()),
                recheck: rechecks.clone(),
            };
            Self {
                gateway,
                sched,
                rechecks,
                services,
            }
        }

        fn slot(&self, index: u32) -> OrderSlot {
            OrderSlot::new(
                SlotId::new(index),
                InstrumentId::new("OPT-C-100"),
                SlotConfig::default(),
                self.services.clone(),
            )
        }
    }

    fn bid(price: rust_decimal::Decimal) -> OrderAction {
        OrderAction::new(Direction::Buy, Price::new(price), Volume::new(dec!(1))).unwrap()
    }

    fn assert_invariants(slot: &OrderSlot) {
        assert_eq!(
            slot.is_inactive(),
            slot.current().is_none() && slot.processing().is_none()
        );
        assert_eq!(
            slot.is_active(),
            slot.processing().is_none() && slot.current().is_some()
        );
        assert_eq!(slot.is_processing(), slot.processing().is_some());
        assert_eq!(
            slot.can_cancel(),
            slot.is_active() || (slot.is_processing() && !slot.cancel_requested())
        );
    }

    /// Slot with a registered order at `price`.
    fn active_slot(h: &Harness, index: u32, price: rust_decimal::Decimal) -> (OrderSlot, TransactionId) {
        let mut slot = h.slot(index);
        let txid = slot.send_new(bid(price)).unwrap();
        slot.on_registered(txid);
        slot.take_events();
        h.gateway.take_calls();
        (slot, txid)
    }

    #[test]
    fn test_send_new_then_registered() {
        let h = Harness::new();
        let mut slot = h.slot(0);

        let txid = slot.send_new(bid(dec!(1.20))).unwrap();
        assert_eq!(slot.status(), SlotStatus::ProcessingNew);
        assert_eq!(slot.current().map(|o| o.txid()), Some(txid));
        assert_eq!(slot.processing().map(|o| o.txid()), Some(txid));
        assert_invariants(&slot);

        h.sched.advance(Duration::from_millis(7));
        slot.on_registered(txid);
        assert_eq!(slot.status(), SlotStatus::Active);
        assert_invariants(&slot);

        assert_eq!(
            slot.take_events(),
            vec![
                SlotEvent::CurrentOrderChanged {
                    slot: SlotId::new(0),
                    txid: Some(txid)
                },
                SlotEvent::OrderRegistered {
                    slot: SlotId::new(0),
                    txid
                },
            ]
        );
        assert_eq!(slot.current().and_then(|o| o.registration_latency_ms()), Some(7));
        assert!(matches!(&h.gateway.calls()[..], [GatewayCall::Send(t)] if t.txid == txid));
    }

    #[test]
    fn test_double_send_is_rejected_without_mutation() {
        let h = Harness::new();
        let mut slot = h.slot(0);
        let txid = slot.send_new(bid(dec!(1.20))).unwrap();
        slot.take_events();

        let err = slot.send_new(bid(dec!(1.25))).unwrap_err();
        assert!(matches!(
            err,
            SlotError::InvalidState {
                op: "send_new",
                state: SlotStatus::ProcessingNew,
                ..
            }
        ));
        assert_eq!(slot.current().map(|o| o.txid()), Some(txid));
        assert_eq!(slot.current().map(|o| o.price()), Some(Price::new(dec!(1.20))));
        assert_eq!(h.gateway.len(), 1);
        assert!(!slot.has_events());
    }

    #[test]
    fn test_move_promotes_only_on_registered() {
        let h = Harness::new();
        let (mut slot, old) = active_slot(&h, 0, dec!(1.20));

        let new = slot.move_to(bid(dec!(1.25))).unwrap();
        assert_eq!(slot.status(), SlotStatus::ProcessingMove);
        assert_eq!(slot.current().map(|o| o.txid()), Some(old));
        assert_eq!(slot.processing().map(|o| o.price()), Some(Price::new(dec!(1.25))));
        assert_eq!(slot.canceling().map(|o| o.txid()), Some(old));
        assert!(!slot.cancel_requested());
        assert_invariants(&slot);
        assert!(!slot.has_events());

        slot.on_registered(new);
        assert_eq!(slot.status(), SlotStatus::Active);
        assert_eq!(slot.current().map(|o| o.txid()), Some(new));
        assert_eq!(slot.superseded_len(), 1);
        assert_invariants(&slot);

        // The replaced order's cancel arrives afterwards.
        slot.on_done(old, DoneKind::Canceled);
        assert_eq!(slot.status(), SlotStatus::Active);
        assert_eq!(slot.superseded_len(), 0);

        let events = slot.take_events();
        assert!(events.contains(&SlotEvent::CurrentOrderChanged {
            slot: SlotId::new(0),
            txid: Some(new)
        }));
        assert!(events.contains(&SlotEvent::OrderStateChanged {
            slot: SlotId::new(0),
            txid: old,
            reason: StateChangeReason::Canceled
        }));
    }

    #[test]
    fn test_move_with_old_canceled_first() {
        let h = Harness::new();
        let (mut slot, old) = active_slot(&h, 0, dec!(1.20));
        let new = slot.move_to(bid(dec!(1.15))).unwrap();

        slot.on_done(old, DoneKind::Canceled);
        assert_eq!(slot.status(), SlotStatus::ProcessingMove);
        assert!(slot.current().is_none());
        assert!(slot.canceling().is_none());
        assert_eq!(slot.processing().map(|o| o.txid()), Some(new));
        assert!(slot.can_cancel());
        assert_invariants(&slot);
        assert_eq!(
            slot.take_events(),
            vec![
                SlotEvent::CurrentOrderChanged {
                    slot: SlotId::new(0),
                    txid: None
                },
                SlotEvent::OrderStateChanged {
                    slot: SlotId::new(0),
                    txid: old,
                    reason: StateChangeReason::Canceled
                },
            ]
        );

        slot.on_registered(new);
        assert_eq!(slot.status(), SlotStatus::Active);
        assert_eq!(slot.current().map(|o| o.txid()), Some(new));
        assert!(slot.current().is_some_and(|o| o.is_registered()));
        assert_eq!(slot.superseded_len(), 0);
        assert_eq!(
            slot.take_events(),
            vec![
                SlotEvent::CurrentOrderChanged {
                    slot: SlotId::new(0),
                    txid: Some(new)
                },
                SlotEvent::OrderRegistered {
                    slot: SlotId::new(0),
                    txid: new
                },
            ]
        );
    }

    #[test]
    fn test_replacement_failure_after_old_canceled() {
        let h = Harness::new();
        let (mut slot, old) = active_slot(&h, 0, dec!(1.20));
        let new = slot.move_to(bid(dec!(1.15))).unwrap();

        slot.on_done(old, DoneKind::Canceled);
        slot.on_done(new, DoneKind::Failed(FailInfo::other("price band")));
        assert!(slot.is_inactive());
        assert_invariants(&slot);
    }

    #[test]
    fn test_cancel_replacement_after_old_canceled() {
        let h = Harness::new();
        let (mut slot, old) = active_slot(&h, 0, dec!(1.20));
        let new = slot.move_to(bid(dec!(1.15))).unwrap();
        slot.on_done(old, DoneKind::Canceled);
        h.gateway.take_calls();

        slot.cancel().unwrap();
        assert_eq!(slot.status(), SlotStatus::ProcessingCancel);
        assert!(slot.cancel_requested());
        assert_invariants(&slot);

        slot.on_done(new, DoneKind::Canceled);
        assert!(slot.is_inactive());
    }

    #[test]
    fn test_failed_replacement_keeps_original() {
        let h = Harness::new();
        let (mut slot, old) = active_slot(&h, 0, dec!(1.20));
        let new = slot.move_to(bid(dec!(1.30))).unwrap();

        slot.on_done(new, DoneKind::Failed(FailInfo::other("price band")));
        assert_eq!(slot.status(), SlotStatus::Active);
        assert_eq!(slot.current().map(|o| o.txid()), Some(old));
        assert_invariants(&slot);
        assert_eq!(
            slot.take_events(),
            vec![SlotEvent::OrderStateChanged {
                slot: SlotId::new(0),
                txid: new,
                reason: StateChangeReason::Failed(FailClass::Other)
            }]
        );
    }

    #[test]
    fn test_new_order_failure_is_terminal() {
        let h = Harness::new();
        let mut slot = h.slot(0);
        let txid = slot.send_new(bid(dec!(1.20))).unwrap();
        slot.take_events();

        slot.on_done(txid, DoneKind::Failed(FailInfo::other("rejected")));
        assert!(slot.is_inactive());
        assert_invariants(&slot);
        assert_eq!(slot.take_events().len(), 2);
    }

    #[test]
    fn test_cancel_active_order() {
        let h = Harness::new();
        let (mut slot, txid) = active_slot(&h, 0, dec!(1.20));

        slot.cancel().unwrap();
        assert_eq!(slot.status(), SlotStatus::ProcessingCancel);
        assert!(slot.cancel_requested());
        assert!(!slot.can_cancel());
        assert_eq!(slot.canceling().map(|o| o.txid()), Some(txid));
        assert_invariants(&slot);
        assert!(slot.cancel().is_err());

        h.sched.advance(Duration::from_millis(12));
        slot.on_done(txid, DoneKind::Canceled);
        assert!(slot.is_inactive());
        assert_invariants(&slot);
        assert_eq!(h.gateway.len(), 1);
    }

    #[test]
    fn test_cancel_before_registration() {
        let h = Harness::new();
        let mut slot = h.slot(0);
        let txid = slot.send_new(bid(dec!(1.20))).unwrap();

        slot.cancel().unwrap();
        assert_eq!(slot.canceling().map(|o| o.txid()), Some(txid));
        assert_invariants(&slot);

        slot.on_registered(txid);
        assert_eq!(slot.status(), SlotStatus::Active);
        assert!(slot.cancel_requested());
        assert_invariants(&slot);

        slot.on_done(txid, DoneKind::Canceled);
        assert!(slot.is_inactive());
    }

    #[test]
    fn test_cancel_during_move_targets_replacement() {
        let h = Harness::new();
        let (mut slot, old) = active_slot(&h, 0, dec!(1.20));
        let new = slot.move_to(bid(dec!(1.25))).unwrap();
        h.gateway.take_calls();

        slot.cancel().unwrap();
        assert!(matches!(&h.gateway.calls()[..], [GatewayCall::Cancel(t)] if t.txid == new));
        assert_eq!(slot.current().map(|o| o.txid()), Some(old));
        assert_eq!(slot.canceling().map(|o| o.txid()), Some(new));
        assert_invariants(&slot);

        slot.on_done(old, DoneKind::Canceled);
        assert_eq!(slot.current().map(|o| o.txid()), Some(new));
        slot.on_done(new, DoneKind::Canceled);
        assert!(slot.is_inactive());
        assert_invariants(&slot);
    }

    #[test]
    fn test_cancel_not_found_is_benign() {
        let h = Harness::new();
        let (mut slot, txid) = active_slot(&h, 0, dec!(1.20));
        slot.cancel().unwrap();
        slot.take_events();

        slot.on_cancel_failed(txid, FailInfo::not_found("unknown order"));
        assert_eq!(slot.status(), SlotStatus::ProcessingCancel);
        assert!(slot.cancel_requested());
        assert_eq!(slot.processing().map(|o| o.txid()), Some(txid));
        assert!(!slot.has_events());
    }

    #[test]
    fn test_cancel_rejected_restores_active() {
        let h = Harness::new();
        let (mut slot, txid) = active_slot(&h, 0, dec!(1.20));
        slot.cancel().unwrap();

        slot.on_cancel_failed(txid, FailInfo::other("too late"));
        assert_eq!(slot.status(), SlotStatus::Active);
        assert!(!slot.cancel_requested());
        assert!(slot.canceling().is_none());
        assert_invariants(&slot);
        assert_eq!(
            slot.take_events(),
            vec![SlotEvent::OrderStateChanged {
                slot: SlotId::new(0),
                txid,
                reason: StateChangeReason::CancelRejected(FailClass::Other)
            }]
        );
    }

    #[test]
    fn test_rejected_replace_orphans_new_order() {
        let h = Harness::new();
        let (mut slot, old) = active_slot(&h, 0, dec!(1.20));
        let new = slot.move_to(bid(dec!(1.25))).unwrap();

        slot.on_cancel_failed(old, FailInfo::other("replace rejected"));
        assert_eq!(slot.status(), SlotStatus::Active);
        assert_eq!(slot.current().map(|o| o.txid()), Some(old));
        assert_eq!(slot.superseded_len(), 1);

        slot.on_done(new, DoneKind::Failed(FailInfo::other("replace rejected")));
        assert_eq!(slot.status(), SlotStatus::Active);
        assert_eq!(slot.superseded_len(), 0);
    }

    #[test]
    fn test_timeout_deferred_then_finalized() {
        let h = Harness::new();
        let mut slot = h.slot(2);
        let txid = slot.send_new(bid(dec!(1.20))).unwrap();
        slot.take_events();

        slot.on_done(txid, DoneKind::Failed(FailInfo::timeout()));
        assert_eq!(slot.status(), SlotStatus::ProcessingNew);
        assert_eq!(slot.current().map(|o| o.txid()), Some(txid));
        assert!(slot.has_pending_timeout());
        assert!(!slot.has_events());

        h.sched.advance(Duration::from_millis(4_999));
        assert!(h.rechecks.posted.lock().is_empty());
        h.sched.advance(Duration::from_millis(1));
        assert_eq!(*h.rechecks.posted.lock(), vec![(SlotId::new(2), txid)]);

        slot.on_timeout_recheck(txid);
        assert!(slot.is_inactive());
        assert!(!slot.has_pending_timeout());
        assert!(slot.take_events().contains(&SlotEvent::OrderStateChanged {
            slot: SlotId::new(2),
            txid,
            reason: StateChangeReason::TimedOut
        }));
    }

    #[test]
    fn test_real_event_during_grace_wins() {
        let h = Harness::new();
        let mut slot = h.slot(0);
        let txid = slot.send_new(bid(dec!(1.20))).unwrap();

        slot.on_done(txid, DoneKind::Failed(FailInfo::timeout()));
        h.sched.advance(Duration::from_millis(2_000));
        slot.on_registered(txid);

        assert_eq!(slot.status(), SlotStatus::Active);
        assert!(!slot.has_pending_timeout());
        assert_eq!(h.sched.pending_count(), 0);

        h.sched.advance(Duration::from_secs(10));
        assert!(h.rechecks.posted.lock().is_empty());

        // A re-check racing the real event is ignored.
        slot.on_timeout_recheck(txid);
        assert_eq!(slot.status(), SlotStatus::Active);
    }

    #[test]
    fn test_fatal_escalates() {
        let h = Harness::new();
        let mut slot = h.slot(0);
        let txid = slot.send_new(bid(dec!(1.20))).unwrap();
        slot.take_events();

        slot.on_done(txid, DoneKind::Failed(FailInfo::fatal(500, "account blocked")));
        assert!(slot.is_inactive());

        let events = slot.take_events();
        assert!(matches!(
            events.last(),
            Some(SlotEvent::FatalError { txid: Some(t), .. }) if *t == txid
        ));
        assert!(events.iter().any(|e| matches!(e, SlotEvent::OrderStateChanged { .. })));
    }

    #[test]
    fn test_insufficient_funds_signals_not_enough_money() {
        let h = Harness::new();
        let (mut slot, old) = active_slot(&h, 0, dec!(1.20));
        let new = slot.move_to(bid(dec!(1.50))).unwrap();

        slot.on_done(new, DoneKind::Failed(FailInfo::insufficient_funds("margin")));
        assert_eq!(slot.current().map(|o| o.txid()), Some(old));
        assert!(slot
            .take_events()
            .contains(&SlotEvent::NotEnoughMoney {
                slot: SlotId::new(0),
                txid: new
            }));
    }

    #[test]
    fn test_move_pair_requires_both_active() {
        let h = Harness::new();
        let (mut bid_slot, _) = active_slot(&h, 0, dec!(1.20));
        let mut ask_slot = h.slot(1);
        ask_slot.send_new(bid(dec!(1.40))).unwrap();
        ask_slot.take_events();
        h.gateway.take_calls();

        let err = OrderSlot::move_pair(&mut bid_slot, bid(dec!(1.21)), &mut ask_slot, bid(dec!(1.41)))
            .unwrap_err();
        assert!(matches!(
            err,
            SlotError::PairNotActive {
                first: SlotStatus::Active,
                second: SlotStatus::ProcessingNew
            }
        ));
        assert!(h.gateway.is_empty());
        assert_eq!(bid_slot.status(), SlotStatus::Active);
        assert_eq!(ask_slot.status(), SlotStatus::ProcessingNew);
    }

    #[test]
    fn test_move_pair_transitions_both() {
        let h = Harness::new();
        let (mut a, a_old) = active_slot(&h, 0, dec!(1.20));
        let (mut b, b_old) = active_slot(&h, 1, dec!(1.40));

        let (a_new, b_new) =
            OrderSlot::move_pair(&mut a, bid(dec!(1.21)), &mut b, bid(dec!(1.41))).unwrap();

        assert_eq!(a.status(), SlotStatus::ProcessingMove);
        assert_eq!(b.status(), SlotStatus::ProcessingMove);
        assert_invariants(&a);
        assert_invariants(&b);

        let calls = h.gateway.take_calls();
        assert_eq!(calls.len(), 1);
        match &calls[0] {
            GatewayCall::MovePair { first, second } => {
                assert_eq!((first.0.txid, first.1.txid), (a_old, a_new));
                assert_eq!((second.0.txid, second.1.txid), (b_old, b_new));
            }
            other => panic!("unexpected call {other:?}"),
        }
    }

    #[test]
    fn test_force_reset_clears_and_cancels_timer() {
        let h = Harness::new();
        let (mut slot, old) = active_slot(&h, 0, dec!(1.20));
        let new = slot.move_to(bid(dec!(1.25))).unwrap();
        slot.on_done(new, DoneKind::Failed(FailInfo::timeout()));
        assert_eq!(h.sched.pending_count(), 1);

        slot.force_reset();
        assert!(slot.is_inactive());
        assert_invariants(&slot);
        assert_eq!(h.sched.pending_count(), 0);
        assert_eq!(h.gateway.len(), 1);
        assert_eq!(
            slot.take_events(),
            vec![SlotEvent::CurrentOrderChanged {
                slot: SlotId::new(0),
                txid: None
            }]
        );

        // Late events after the reset are tolerated.
        slot.on_done(old, DoneKind::Canceled);
        assert!(slot.is_inactive());
        assert!(!slot.has_events());
    }

    #[test]
    fn test_drop_cancels_pending_timeout() {
        let h = Harness::new();
        let mut slot = h.slot(0);
        let txid = slot.send_new(bid(dec!(1.20))).unwrap();
        slot.on_done(txid, DoneKind::Failed(FailInfo::timeout()));
        assert_eq!(h.sched.pending_count(), 1);

        drop(slot);
        assert_eq!(h.sched.pending_count(), 0);
    }

    #[test]
    fn test_unknown_events_are_ignored() {
        let h = Harness::new();
        let (mut slot, txid) = active_slot(&h, 0, dec!(1.20));

        slot.on_registered(TransactionId::new(9_999));
        slot.on_done(TransactionId::new(9_999), DoneKind::Matched);
        slot.on_cancel_failed(TransactionId::new(9_999), FailInfo::other("?"));

        assert_eq!(slot.status(), SlotStatus::Active);
        assert_eq!(slot.current().map(|o| o.txid()), Some(txid));
        assert!(!slot.has_events());
    }
}
