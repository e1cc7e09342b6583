//! Paper gateway: in-process simulated exchange.
//!
//! Requests are acknowledged after a fixed latency on the scheduler. The
//! exchange enforces its own rolling one-second request limit and answers
//! violations with a transaction-limit failure carrying the penalty, which
//! then blocks every new order and move until it runs out. Cancels count
//! toward the limit but are never rejected.

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Weak};
use std::time::Duration;

use optx_core::{ErrorCodeMap, FailInfo, Scheduler, TransactionId};
use optx_execution::{EventSink, Gateway, GatewayEvent, MoveLeg, OrderEventKind, OrderTicket};
use optx_throttle::CancelAll;
use tracing::{debug, info, warn};

use crate::error::{AppError, AppResult};

const LIMIT_CODE: i32 = 429;
const NOT_FOUND_CODE: i32 = 404;
const EXCHANGE_WINDOW_MS: u64 = 1_000;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaperConfig {
    /// Delay before every exchange reply (ms). Default: 5.
    #[serde(default = "default_ack_latency_ms")]
    pub ack_latency_ms: u64,
    /// Requests accepted per rolling second. Default: 60.
    #[serde(default = "default_exchange_limit")]
    pub exchange_limit: usize,
    /// Penalty imposed on a violation (ms). Default: 2000.
    #[serde(default = "default_penalty_ms")]
    pub penalty_ms: u64,
    /// Every n-th registered order is filled one latency later; 0 disables fills.
    #[serde(default)]
    pub fill_every: u64,
}

fn default_ack_latency_ms() -> u64 {
    5
}

fn default_exchange_limit() -> usize {
    60
}

fn default_penalty_ms() -> u64 {
    2_000
}

impl Default for PaperConfig {
    fn default() -> Self {
        Self {
            ack_latency_ms: default_ack_latency_ms(),
            exchange_limit: default_exchange_limit(),
            penalty_ms: default_penalty_ms(),
            fill_every: 0,
        }
    }
}

impl PaperConfig {
    pub fn validate(&self) -> AppResult<()> {
        if self.exchange_limit == 0 {
            return Err(AppError::Config(
                "paper.exchange_limit must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Counters exposed for tests and shutdown logging.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PaperStats {
    pub accepted: u64,
    pub rate_rejected: u64,
    pub registered: u64,
    pub filled: u64,
}

enum Request {
    Send(OrderTicket),
    Cancel(OrderTicket),
    Move(Vec<(OrderTicket, OrderTicket)>),
}

impl Request {
    fn rejection(self, fail: &FailInfo) -> Vec<GatewayEvent> {
        match self {
            Self::Send(ticket) => vec![GatewayEvent::new(
                &ticket,
                OrderEventKind::RegisterFailed(fail.clone()),
            )],
            Self::Cancel(ticket) => vec![GatewayEvent::new(
                &ticket,
                OrderEventKind::CancelFailed(fail.clone()),
            )],
            // A rejected replace leaves the old order untouched.
            Self::Move(legs) => legs
                .iter()
                .map(|(_, new)| {
                    GatewayEvent::new(new, OrderEventKind::RegisterFailed(fail.clone()))
                })
                .collect(),
        }
    }
}

#[derive(Default)]
struct Book {
    live: HashMap<TransactionId, OrderTicket>,
    requests: VecDeque<u64>,
    penalty_until_ms: Option<u64>,
    stats: PaperStats,
}

impl Book {
    /// Count a request; returns the penalty still to serve if it is rejected.
    fn throttle(&mut self, now: u64, config: &PaperConfig, exempt: bool) -> Option<Duration> {
        while self
            .requests
            .front()
            .is_some_and(|&at| at + EXCHANGE_WINDOW_MS <= now)
        {
            self.requests.pop_front();
        }

        if exempt {
            self.requests.push_back(now);
            self.stats.accepted += 1;
            return None;
        }

        if let Some(until) = self.penalty_until_ms {
            if now < until {
                self.stats.rate_rejected += 1;
                return Some(Duration::from_millis(until - now));
            }
            self.penalty_until_ms = None;
        }

        if self.requests.len() >= config.exchange_limit {
            self.penalty_until_ms = Some(now + config.penalty_ms);
            self.stats.rate_rejected += 1;
            return Some(Duration::from_millis(config.penalty_ms));
        }

        self.requests.push_back(now);
        self.stats.accepted += 1;
        None
    }

    fn register(
        &mut self,
        ticket: OrderTicket,
        fill_every: u64,
        events: &mut Vec<GatewayEvent>,
        fills: &mut Vec<OrderTicket>,
    ) {
        events.push(GatewayEvent::new(&ticket, OrderEventKind::Registered));
        self.stats.registered += 1;
        if fill_every > 0 && self.stats.registered % fill_every == 0 {
            fills.push(ticket.clone());
        }
        self.live.insert(ticket.txid, ticket);
    }
}

struct Inner {
    config: PaperConfig,
    codes: ErrorCodeMap,
    scheduler: Arc<dyn Scheduler>,
    sink: RwLock<Option<Arc<dyn EventSink>>>,
    book: Mutex<Book>,
}

impl Inner {
    fn latency(&self) -> Duration {
        Duration::from_millis(self.config.ack_latency_ms)
    }

    fn not_found(&self) -> FailInfo {
        self.codes.classify(NOT_FOUND_CODE, "order not found", None)
    }

    fn settle(self: &Arc<Self>, request: Request) {
        let mut events = Vec::new();
        let mut fills = Vec::new();
        {
            let mut book = self.book.lock();
            match request {
                Request::Send(ticket) => {
                    book.register(ticket, self.config.fill_every, &mut events, &mut fills);
                }
                Request::Cancel(ticket) => {
                    let kind = match book.live.remove(&ticket.txid) {
                        Some(_) => OrderEventKind::Canceled,
                        None => OrderEventKind::CancelFailed(self.not_found()),
                    };
                    events.push(GatewayEvent::new(&ticket, kind));
                }
                Request::Move(legs) => {
                    for (old, new) in legs {
                        if book.live.remove(&old.txid).is_some() {
                            events.push(GatewayEvent::new(&old, OrderEventKind::Canceled));
                            book.register(new, self.config.fill_every, &mut events, &mut fills);
                        } else {
                            let fail = self.not_found();
                            events.push(GatewayEvent::new(
                                &old,
                                OrderEventKind::CancelFailed(fail.clone()),
                            ));
                            events.push(GatewayEvent::new(
                                &new,
                                OrderEventKind::RegisterFailed(fail),
                            ));
                        }
                    }
                }
            }
        }

        for ticket in fills {
            let weak = Arc::downgrade(self);
            self.scheduler.schedule(
                self.latency(),
                Box::new(move || {
                    if let Some(inner) = weak.upgrade() {
                        inner.fill(&ticket);
                    }
                }),
            );
        }
        self.deliver(events);
    }

    fn fill(&self, ticket: &OrderTicket) {
        let filled = {
            let mut book = self.book.lock();
            let filled = book.live.remove(&ticket.txid).is_some();
            if filled {
                book.stats.filled += 1;
            }
            filled
        };
        if filled {
            debug!(txid = %ticket.txid, price = %ticket.price, "Paper fill");
            self.deliver(vec![GatewayEvent::new(ticket, OrderEventKind::Matched)]);
        }
    }

    fn cancel_everything(&self) {
        let canceled: Vec<OrderTicket> = self.book.lock().live.drain().map(|(_, t)| t).collect();
        info!(count = canceled.len(), "Paper exchange cancelled all orders");
        self.deliver(
            canceled
                .iter()
                .map(|t| GatewayEvent::new(t, OrderEventKind::Canceled))
                .collect(),
        );
    }

    fn deliver(&self, events: Vec<GatewayEvent>) {
        if events.is_empty() {
            return;
        }
        let sink = self.sink.read().clone();
        match sink {
            Some(sink) => {
                for event in events {
                    sink.deliver(event);
                }
            }
            None => debug!(count = events.len(), "No sink attached, events dropped"),
        }
    }
}

/// Simulated exchange implementing the gateway contract and cancel-all.
#[derive(Clone)]
pub struct PaperGateway {
    inner: Arc<Inner>,
}

impl PaperGateway {
    #[must_use]
    pub fn new(config: PaperConfig, codes: ErrorCodeMap, scheduler: Arc<dyn Scheduler>) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                codes,
                scheduler,
                sink: RwLock::new(None),
                book: Mutex::new(Book::default()),
            }),
        }
    }

    /// Route replies to `sink`.
    pub fn attach(&self, sink: Arc<dyn EventSink>) {
        *self.inner.sink.write() = Some(sink);
    }

    pub fn live_count(&self) -> usize {
        self.inner.book.lock().live.len()
    }

    pub fn is_live(&self, txid: TransactionId) -> bool {
        self.inner.book.lock().live.contains_key(&txid)
    }

    pub fn stats(&self) -> PaperStats {
        self.inner.book.lock().stats
    }

    fn submit(&self, request: Request) {
        let now = self.inner.scheduler.now_ms();
        let exempt = matches!(request, Request::Cancel(_));
        let rejected = self
            .inner
            .book
            .lock()
            .throttle(now, &self.inner.config, exempt);

        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        match rejected {
            Some(penalty) => {
                warn!(
                    penalty_ms = penalty.as_millis() as u64,
                    "Paper exchange rejected request over rate limit"
                );
                let fail = self.inner.codes.classify(
                    LIMIT_CODE,
                    "transaction limit exceeded",
                    Some(penalty),
                );
                let events = request.rejection(&fail);
                self.inner.scheduler.schedule(
                    self.inner.latency(),
                    Box::new(move || {
                        if let Some(inner) = weak.upgrade() {
                            inner.deliver(events);
                        }
                    }),
                );
            }
            None => {
                self.inner.scheduler.schedule(
                    self.inner.latency(),
                    Box::new(move || {
                        if let Some(inner) = weak.upgrade() {
                            inner.settle(request);
                        }
                    }),
                );
            }
        }
    }
}

impl Gateway for PaperGateway {
    fn send_order(&self, ticket: &OrderTicket) {
        self.submit(Request::Send(ticket.clone()));
    }

    fn move_order(&self, old: &OrderTicket, new: &OrderTicket) {
        self.submit(Request::Move(vec![(old.clone(), new.clone())]));
    }

    fn cancel_order(&self, ticket: &OrderTicket) {
        self.submit(Request::Cancel(ticket.clone()));
    }

    fn move_order_pair(&self, first: MoveLeg<'_>, second: MoveLeg<'_>) {
        self.submit(Request::Move(vec![
            (first.old.clone(), first.new.clone()),
            (second.old.clone(), second.new.clone()),
        ]));
    }
}

impl CancelAll for PaperGateway {
    fn cancel_all(&self) {
        let weak = Arc::downgrade(&self.inner);
        self.inner.scheduler.schedule(
            self.inner.latency(),
            Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    inner.cancel_everything();
                }
            }),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use optx_core::{Direction, InstrumentId, ManualScheduler, OrderRoute, Price, SlotId, Volume};
    use rust_decimal_macros::dec;

    #[derive(Default)]
    struct CollectingSink {
        events: Mutex<Vec<GatewayEvent>>,
    }

    impl CollectingSink {
        fn take(&self) -> Vec<GatewayEvent> {
            std::mem::take(&mut *self.events.lock())
        }
    }

    impl EventSink for CollectingSink {
        fn deliver(&self, event: GatewayEvent) {
            self.events.lock().push(event);
        }

        fn rate_violation(&self, _penalty: Option<Duration>) {}
    }

    fn setup(config: PaperConfig) -> (PaperGateway, Arc<ManualScheduler>, Arc<CollectingSink>) {
        let sched = Arc::new(ManualScheduler::new(0));
        let gateway = PaperGateway::new(config, ErrorCodeMap::default(), sched.clone());
        let sink = Arc::new(CollectingSink::default());
        gateway.attach(sink.clone());
        (gateway, sched, sink)
    }

    fn ticket(txid: u64) -> OrderTicket {
        OrderTicket {
            txid: TransactionId::new(txid),
            route: OrderRoute::new(InstrumentId::new("OPT"), SlotId::new(0)),
            direction: Direction::Buy,
            price: Price::new(dec!(1.00)),
            volume: Volume::new(dec!(1)),
        }
    }

    fn kinds(events: &[GatewayEvent]) -> Vec<(u64, OrderEventKind)> {
        events
            .iter()
            .map(|e| (e.txid.value(), e.kind.clone()))
            .collect()
    }

    #[test]
    fn test_send_acknowledged_after_latency() {
        let (gateway, sched, sink) = setup(PaperConfig::default());
        gateway.send_order(&ticket(1));

        sched.advance(Duration::from_millis(4));
        assert!(sink.take().is_empty());

        sched.advance(Duration::from_millis(1));
        assert_eq!(kinds(&sink.take()), vec![(1, OrderEventKind::Registered)]);
        assert!(gateway.is_live(TransactionId::new(1)));
    }

    #[test]
    fn test_move_replaces_live_order() {
        let (gateway, sched, sink) = setup(PaperConfig::default());
        gateway.send_order(&ticket(1));
        sched.advance(Duration::from_millis(5));
        sink.take();

        gateway.move_order(&ticket(1), &ticket(2));
        sched.advance(Duration::from_millis(5));

        assert_eq!(
            kinds(&sink.take()),
            vec![
                (1, OrderEventKind::Canceled),
                (2, OrderEventKind::Registered)
            ]
        );
        assert_eq!(gateway.live_count(), 1);
        assert!(gateway.is_live(TransactionId::new(2)));
    }

    #[test]
    fn test_unknown_orders_are_not_found() {
        let (gateway, sched, sink) = setup(PaperConfig::default());
        gateway.cancel_order(&ticket(5));
        gateway.move_order(&ticket(6), &ticket(7));
        sched.advance(Duration::from_millis(5));

        let events = sink.take();
        assert_eq!(events.len(), 3);
        assert!(events
            .iter()
            .all(|e| e.kind.fail().is_some_and(|f| f.is_order_not_found())));
        assert_eq!(gateway.live_count(), 0);
    }

    #[test]
    fn test_rate_limit_rejects_with_penalty() {
        let config = PaperConfig {
            exchange_limit: 2,
            penalty_ms: 1_500,
            ..PaperConfig::default()
        };
        let (gateway, sched, sink) = setup(config);

        for txid in 1..=3 {
            gateway.send_order(&ticket(txid));
        }
        sched.advance(Duration::from_millis(5));

        let events = sink.take();
        assert_eq!(events.len(), 3);
        let fail = events[2].kind.fail().cloned().unwrap();
        assert!(fail.is_transaction_limit());
        assert_eq!(fail.penalty_remaining(), Some(Duration::from_millis(1_500)));

        // Still serving the penalty.
        sched.advance(Duration::from_millis(995));
        gateway.send_order(&ticket(4));
        sched.advance(Duration::from_millis(5));
        let fail = sink.take()[0].kind.fail().cloned().unwrap();
        assert_eq!(fail.penalty_remaining(), Some(Duration::from_millis(500)));

        sched.advance(Duration::from_millis(500));
        gateway.send_order(&ticket(5));
        sched.advance(Duration::from_millis(5));
        assert_eq!(kinds(&sink.take()), vec![(5, OrderEventKind::Registered)]);

        let stats = gateway.stats();
        assert_eq!(stats.accepted, 3);
        assert_eq!(stats.rate_rejected, 2);
    }

    #[test]
    fn test_cancel_accepted_during_penalty() {
        let config = PaperConfig {
            exchange_limit: 1,
            ..PaperConfig::default()
        };
        let (gateway, sched, sink) = setup(config);
        gateway.send_order(&ticket(1));
        gateway.send_order(&ticket(2));
        sched.advance(Duration::from_millis(5));
        sink.take();

        gateway.cancel_order(&ticket(1));
        sched.advance(Duration::from_millis(5));
        assert_eq!(kinds(&sink.take()), vec![(1, OrderEventKind::Canceled)]);
        assert_eq!(gateway.stats().rate_rejected, 1);
    }

    #[test]
    fn test_cancel_all_cancels_live_orders() {
        let (gateway, sched, sink) = setup(PaperConfig::default());
        gateway.send_order(&ticket(1));
        gateway.send_order(&ticket(2));
        sched.advance(Duration::from_millis(5));
        sink.take();

        gateway.cancel_all();
        sched.advance(Duration::from_millis(5));

        let events = sink.take();
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|e| e.kind == OrderEventKind::Canceled));
        assert_eq!(gateway.live_count(), 0);
    }

    #[test]
    fn test_fill_every_matches_orders() {
        let config = PaperConfig {
            fill_every: 2,
            ..PaperConfig::default()
        };
        let (gateway, sched, sink) = setup(config);
        gateway.send_order(&ticket(1));
        gateway.send_order(&ticket(2));
        sched.advance(Duration::from_millis(10));

        assert_eq!(
            kinds(&sink.take()),
            vec![
                (1, OrderEventKind::Registered),
                (2, OrderEventKind::Registered),
                (2, OrderEventKind::Matched)
            ]
        );
        assert_eq!(gateway.stats().filled, 1);
    }

    #[test]
    fn test_zero_exchange_limit_rejected() {
        let config = PaperConfig {
            exchange_limit: 0,
            ..PaperConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
