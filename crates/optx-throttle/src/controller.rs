//! Transaction rate controller.
//!
//! Process-wide admission gate shared by every instrument executor.
//!
//! # State machine
//!
//! ```text
//! NormalOperation ──new-order quota used──▶ NewOrderLimitExceeded
//!        │                                        │
//!        └──capacity-reserve used / penalty──▶ LimitExceeded ◀──┘
//!                                                 │
//!                  restore (penalty over, capacity back)
//!                                                 ▼
//!                          MmOnly (MM registered) or NormalOperation
//! ```
//!
//! # Locking
//!
//! All state lives behind one `parking_lot::Mutex`. Decisions are computed
//! under the lock; logging, metrics, the state broadcast, restore callbacks
//! and cancel-all run after it is released.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use optx_core::{InstrumentId, Scheduler, StrategyKind, TimerHandle, TransactionType};
use optx_telemetry::Metrics;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::ControllerConfig;
use crate::error::ThrottleResult;
use crate::window::RateWindow;

// ============================================================================
// Public types
// ============================================================================

/// Global admission state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ControllerState {
    NormalOperation,
    /// New-order sub-quota used up; moves and cancels still admitted.
    NewOrderLimitExceeded,
    /// Recovering: only market-making strategies are admitted.
    MmOnly,
    /// Only reserve callers are admitted.
    LimitExceeded,
}

impl ControllerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NormalOperation => "normal_operation",
            Self::NewOrderLimitExceeded => "new_order_limit_exceeded",
            Self::MmOnly => "mm_only",
            Self::LimitExceeded => "limit_exceeded",
        }
    }
}

impl fmt::Display for ControllerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One admission request.
#[derive(Debug, Clone)]
pub struct AdmitRequest {
    /// Restore callbacks are keyed by caller.
    pub caller: InstrumentId,
    pub kind: StrategyKind,
    pub tx_type: TransactionType,
    pub use_reserve: bool,
}

impl AdmitRequest {
    pub fn new(caller: InstrumentId, kind: StrategyKind, tx_type: TransactionType) -> Self {
        Self {
            caller,
            kind,
            tx_type,
            use_reserve: false,
        }
    }

    /// Allow the request to consume reserve slots.
    #[must_use]
    pub fn with_reserve(mut self) -> Self {
        self.use_reserve = true;
        self
    }
}

/// Why a request was turned down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    LimitExceeded,
    /// Admitting would eat into the reserve.
    ReserveProtected,
    NewOrderQuota,
    ExchangePenalty,
    MmOnly,
}

impl RejectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LimitExceeded => "limit_exceeded",
            Self::ReserveProtected => "reserve_protected",
            Self::NewOrderQuota => "new_order_quota",
            Self::ExchangePenalty => "exchange_penalty",
            Self::MmOnly => "mm_only",
        }
    }
}

/// Admission decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Admitted,
    Rejected(RejectReason),
}

impl Admission {
    pub fn is_admitted(&self) -> bool {
        matches!(self, Self::Admitted)
    }
}

/// Callback run once when the controller leaves `LimitExceeded`.
pub type RestoreAction = Box<dyn FnOnce() + Send + 'static>;

/// Portfolio-wide cancel of every working order, issued on exchange penalties.
#[cfg_attr(test, mockall::automock)]
pub trait CancelAll: Send + Sync {
    fn cancel_all(&self);
}

// ============================================================================
// Internal state
// ============================================================================

struct Inner {
    window: RateWindow,
    state: ControllerState,
    penalty_until_ms: Option<u64>,
    mm_only_until_ms: Option<u64>,
    restore_timer: Option<TimerHandle>,
    restore_due_ms: Option<u64>,
    restore_actions: HashMap<InstrumentId, RestoreAction>,
    mm_strategies: usize,
    cancel_all_issued: bool,
}

/// Side effects collected under the lock and applied after releasing it.
#[derive(Default)]
struct Effects {
    transitions: Vec<(ControllerState, ControllerState, &'static str)>,
    restore_actions: Vec<RestoreAction>,
    cancel_all: bool,
}

struct Shared {
    config: ControllerConfig,
    new_order_limit: usize,
    inner: Mutex<Inner>,
    scheduler: Arc<dyn Scheduler>,
    cancel_all: Arc<dyn CancelAll>,
    state_tx: watch::Sender<ControllerState>,
}

/// Process-wide transaction admission controller.
///
/// Cheap to clone; all clones share the same window and state.
#[derive(Clone)]
pub struct TransactionRateController {
    shared: Arc<Shared>,
}

impl TransactionRateController {
    pub fn new(
        config: ControllerConfig,
        scheduler: Arc<dyn Scheduler>,
        cancel_all: Arc<dyn CancelAll>,
    ) -> ThrottleResult<Self> {
        config.validate()?;

        let (state_tx, _) = watch::channel(ControllerState::NormalOperation);
        let new_order_limit = config.new_order_limit();
        let inner = Inner {
            window: RateWindow::with_capacity(config.limit as usize),
            state: ControllerState::NormalOperation,
            penalty_until_ms: None,
            mm_only_until_ms: None,
            restore_timer: None,
            restore_due_ms: None,
            restore_actions: HashMap::new(),
            mm_strategies: 0,
            cancel_all_issued: false,
        };

        info!(
            limit = config.limit,
            new_order_limit,
            reserve_slots = config.reserve_slots,
            window_ms = config.window_ms,
            "Rate controller initialized"
        );
        Metrics::controller_state_set(ControllerState::NormalOperation.as_str());

        Ok(Self {
            shared: Arc::new(Shared {
                config,
                new_order_limit,
                inner: Mutex::new(inner),
                scheduler,
                cancel_all,
                state_tx,
            }),
        })
    }

    // ------------------------------------------------------------------------
    // Admission
    // ------------------------------------------------------------------------

    /// Ask for permission to submit one transaction.
    ///
    /// `on_restore` is kept (one per caller, latest wins) when the request is
    /// rejected while in `LimitExceeded`, and run once the controller leaves it.
    pub fn try_admit(&self, request: AdmitRequest, on_restore: Option<RestoreAction>) -> bool {
        self.admit(request, on_restore).is_admitted()
    }

    /// Like [`try_admit`](Self::try_admit), returning the rejection reason.
    pub fn admit(&self, request: AdmitRequest, on_restore: Option<RestoreAction>) -> Admission {
        let now = self.shared.scheduler.now_ms();
        let mut fx = Effects::default();

        let (admission, usage, state) = {
            let mut inner = self.shared.inner.lock();
            inner.window.prune(now, self.shared.config.window_ms);

            // Restore may be overdue if the timer has not been serviced yet.
            if inner.restore_due_ms.is_some_and(|due| due <= now) {
                if let Some(timer) = inner.restore_timer.take() {
                    timer.cancel();
                }
                inner.restore_due_ms = None;
                self.evaluate_restore(now, &mut inner, &mut fx);
            }

            let admission = self.decide(now, &request, &mut inner, &mut fx);
            match admission {
                Admission::Admitted => inner.window.push(now, request.tx_type),
                Admission::Rejected(_) => {
                    if inner.state == ControllerState::LimitExceeded {
                        if let Some(action) = on_restore {
                            inner.restore_actions.insert(request.caller.clone(), action);
                        }
                    }
                }
            }
            (admission, inner.window.len(), inner.state)
        };

        self.apply(fx);
        Metrics::window_usage(usage);

        match admission {
            Admission::Admitted => {
                Metrics::admitted(request.tx_type.as_str());
            }
            Admission::Rejected(reason) => {
                Metrics::rejected(request.tx_type.as_str(), reason.as_str());
                debug!(
                    caller = %request.caller,
                    tx_type = %request.tx_type,
                    reason = reason.as_str(),
                    state = %state,
                    usage,
                    "Transaction rejected"
                );
            }
        }
        admission
    }

    fn decide(
        &self,
        now: u64,
        request: &AdmitRequest,
        inner: &mut Inner,
        fx: &mut Effects,
    ) -> Admission {
        let config = &self.shared.config;
        let limit = config.limit as usize;
        let reserve = config.reserve_slots as usize;
        let used = inner.window.len();

        if inner.penalty_until_ms.is_some_and(|until| now < until) {
            return Admission::Rejected(RejectReason::ExchangePenalty);
        }

        match inner.state {
            ControllerState::LimitExceeded if !request.use_reserve => {
                return Admission::Rejected(RejectReason::LimitExceeded);
            }
            ControllerState::MmOnly
                if !request.kind.is_market_making() && !request.use_reserve =>
            {
                return Admission::Rejected(RejectReason::MmOnly);
            }
            _ => {}
        }

        if request.use_reserve {
            if used >= limit {
                self.enter_limit_exceeded(now, inner, fx, "reserve_exhausted");
                return Admission::Rejected(RejectReason::LimitExceeded);
            }
        } else if used + reserve >= limit {
            self.enter_limit_exceeded(now, inner, fx, "capacity_exhausted");
            return Admission::Rejected(RejectReason::ReserveProtected);
        }

        if request.tx_type == TransactionType::NewOrder
            && inner.window.count(TransactionType::NewOrder) >= self.shared.new_order_limit
        {
            if inner.state == ControllerState::NormalOperation {
                self.transition(inner, ControllerState::NewOrderLimitExceeded, "new_order_quota", fx);
                let oldest = inner
                    .window
                    .oldest_of(TransactionType::NewOrder)
                    .unwrap_or(now);
                self.schedule_restore(now, inner, oldest + config.window_ms + 1);
            }
            return Admission::Rejected(RejectReason::NewOrderQuota);
        }

        Admission::Admitted
    }

    // ------------------------------------------------------------------------
    // External signals
    // ------------------------------------------------------------------------

    /// Exchange confirmed a rate violation.
    ///
    /// Forces `LimitExceeded` until the penalty is over (exchange-supplied
    /// remaining duration, else the configured default). The first penalty of
    /// each `LimitExceeded` episode issues one portfolio-wide cancel-all.
    pub fn on_exchange_penalty(&self, remaining: Option<Duration>) {
        let now = self.shared.scheduler.now_ms();
        let penalty = remaining.unwrap_or_else(|| self.shared.config.default_penalty());
        let mut fx = Effects::default();

        let until = {
            let mut inner = self.shared.inner.lock();
            let until = now + penalty.as_millis() as u64;
            let until = inner.penalty_until_ms.map_or(until, |prev| prev.max(until));
            inner.penalty_until_ms = Some(until);

            if !inner.cancel_all_issued {
                inner.cancel_all_issued = true;
                fx.cancel_all = true;
            }
            self.enter_limit_exceeded(now, &mut inner, &mut fx, "exchange_penalty");
            until
        };

        Metrics::exchange_penalty();
        warn!(
            penalty_ms = penalty.as_millis() as u64,
            until_ms = until,
            cancel_all = fx.cancel_all,
            "Exchange transaction limit penalty"
        );
        self.apply(fx);
    }

    /// Count a strategy. Market makers enable the `MmOnly` recovery phase.
    pub fn register_strategy(&self, kind: StrategyKind) {
        let count = {
            let mut inner = self.shared.inner.lock();
            if kind.is_market_making() {
                inner.mm_strategies += 1;
            }
            inner.mm_strategies
        };
        debug!(kind = %kind, mm_strategies = count, "Strategy registered");
    }

    /// Remove a strategy. The last market maker leaving during `MmOnly`
    /// restores normal operation immediately.
    pub fn deregister_strategy(&self, kind: StrategyKind) {
        let now = self.shared.scheduler.now_ms();
        let mut fx = Effects::default();

        let count = {
            let mut inner = self.shared.inner.lock();
            if kind.is_market_making() {
                inner.mm_strategies = inner.mm_strategies.saturating_sub(1);
            }
            if inner.mm_strategies == 0 && inner.state == ControllerState::MmOnly {
                self.evaluate_restore(now, &mut inner, &mut fx);
            }
            inner.mm_strategies
        };

        debug!(kind = %kind, mm_strategies = count, "Strategy deregistered");
        self.apply(fx);
    }

    // ------------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------------

    /// Whether a strategy of `kind` could currently get anything admitted
    /// without the reserve.
    pub fn can_trade(&self, kind: Option<StrategyKind>) -> bool {
        let now = self.shared.scheduler.now_ms();
        let inner = self.shared.inner.lock();
        if inner.penalty_until_ms.is_some_and(|until| now < until) {
            return false;
        }
        match inner.state {
            ControllerState::LimitExceeded => false,
            ControllerState::MmOnly => kind.is_some_and(|k| k.is_market_making()),
            ControllerState::NormalOperation | ControllerState::NewOrderLimitExceeded => true,
        }
    }

    pub fn state(&self) -> ControllerState {
        self.shared.inner.lock().state
    }

    /// Receive every state change.
    pub fn subscribe(&self) -> watch::Receiver<ControllerState> {
        self.shared.state_tx.subscribe()
    }

    /// Transactions in the current window.
    pub fn window_usage(&self) -> usize {
        let now = self.shared.scheduler.now_ms();
        let mut inner = self.shared.inner.lock();
        inner.window.prune(now, self.shared.config.window_ms);
        inner.window.len()
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.shared.config
    }

    // ------------------------------------------------------------------------
    // Restore machinery
    // ------------------------------------------------------------------------

    fn enter_limit_exceeded(
        &self,
        now: u64,
        inner: &mut Inner,
        fx: &mut Effects,
        cause: &'static str,
    ) {
        self.transition(inner, ControllerState::LimitExceeded, cause, fx);
        inner.mm_only_until_ms = None;

        let capacity_due = inner
            .window
            .oldest()
            .map_or(now, |oldest| oldest + self.shared.config.window_ms + 1);
        let due = inner
            .penalty_until_ms
            .map_or(capacity_due, |until| until.max(capacity_due));
        self.schedule_restore(now, inner, due);
    }

    fn evaluate_restore(&self, now: u64, inner: &mut Inner, fx: &mut Effects) {
        let config = &self.shared.config;
        inner.window.prune(now, config.window_ms);

        match inner.state {
            ControllerState::LimitExceeded => {
                if let Some(until) = inner.penalty_until_ms {
                    if now < until {
                        self.schedule_restore(now, inner, until);
                        return;
                    }
                    inner.penalty_until_ms = None;
                }

                if inner.window.len() + config.reserve_slots as usize >= config.limit as usize {
                    let oldest = inner.window.oldest().unwrap_or(now);
                    self.schedule_restore(now, inner, oldest + config.window_ms + 1);
                    return;
                }

                let next = if inner.mm_strategies > 0 && config.mm_only_delay_ms > 0 {
                    let until = now + config.mm_only_delay_ms;
                    inner.mm_only_until_ms = Some(until);
                    self.schedule_restore(now, inner, until);
                    ControllerState::MmOnly
                } else {
                    ControllerState::NormalOperation
                };

                fx.restore_actions
                    .extend(inner.restore_actions.drain().map(|(_, action)| action));
                inner.cancel_all_issued = false;
                self.transition(inner, next, "restore", fx);
            }
            ControllerState::NewOrderLimitExceeded => {
                if inner.window.count(TransactionType::NewOrder) < self.shared.new_order_limit {
                    self.transition(inner, ControllerState::NormalOperation, "new_order_quota_freed", fx);
                } else {
                    let oldest = inner
                        .window
                        .oldest_of(TransactionType::NewOrder)
                        .unwrap_or(now);
                    self.schedule_restore(now, inner, oldest + config.window_ms + 1);
                }
            }
            ControllerState::MmOnly => {
                let expired = inner.mm_only_until_ms.map_or(true, |until| now >= until);
                if expired || inner.mm_strategies == 0 {
                    inner.mm_only_until_ms = None;
                    if let Some(timer) = inner.restore_timer.take() {
                        timer.cancel();
                    }
                    inner.restore_due_ms = None;
                    let cause = if expired { "mm_only_elapsed" } else { "no_mm_strategies" };
                    self.transition(inner, ControllerState::NormalOperation, cause, fx);
                } else if let Some(until) = inner.mm_only_until_ms {
                    self.schedule_restore(now, inner, until);
                }
            }
            ControllerState::NormalOperation => {}
        }
    }

    /// Replace the single restore timer with one due at `due_ms`.
    fn schedule_restore(&self, now: u64, inner: &mut Inner, due_ms: u64) {
        if let Some(timer) = inner.restore_timer.take() {
            timer.cancel();
        }

        let weak: Weak<Shared> = Arc::downgrade(&self.shared);
        let delay = Duration::from_millis(due_ms.saturating_sub(now));
        let timer = self.shared.scheduler.schedule(
            delay,
            Box::new(move || {
                if let Some(shared) = weak.upgrade() {
                    TransactionRateController { shared }.on_restore_timer();
                }
            }),
        );
        inner.restore_timer = Some(timer);
        inner.restore_due_ms = Some(due_ms);
    }

    fn on_restore_timer(&self) {
        let now = self.shared.scheduler.now_ms();
        let mut fx = Effects::default();
        {
            let mut inner = self.shared.inner.lock();
            // A newer timer may already have replaced the one that fired.
            if inner.restore_timer.as_ref().is_some_and(|t| t.is_pending()) {
                return;
            }
            inner.restore_timer = None;
            inner.restore_due_ms = None;
            self.evaluate_restore(now, &mut inner, &mut fx);
        }
        self.apply(fx);
    }

    /// Change state and publish it while the lock is still held, so
    /// subscribers and the gauge see transitions in the order they happened.
    fn transition(
        &self,
        inner: &mut Inner,
        to: ControllerState,
        cause: &'static str,
        fx: &mut Effects,
    ) {
        if inner.state == to {
            return;
        }
        fx.transitions.push((inner.state, to, cause));
        inner.state = to;
        Metrics::controller_state_set(to.as_str());
        self.shared.state_tx.send_replace(to);
    }

    fn apply(&self, fx: Effects) {
        for (from, to, cause) in &fx.transitions {
            info!(from = %from, to = %to, cause, "Rate controller state changed");
        }

        if fx.cancel_all {
            Metrics::cancel_all_issued();
            warn!("Issuing portfolio-wide cancel-all");
            self.shared.cancel_all.cancel_all();
        }

        if !fx.restore_actions.is_empty() {
            debug!(count = fx.restore_actions.len(), "Running restore actions");
        }
        for action in fx.restore_actions {
            action();
        }
    }
}

impl fmt::Debug for TransactionRateController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.shared.inner.lock();
        f.debug_struct("TransactionRateController")
            .field("state", &inner.state)
            .field("window", &inner.window.len())
            .field("mm_strategies", &inner.mm_strategies)
            .finish()
    }
}
