//! Application wiring and run loop.

use std::sync::Arc;

use optx_core::{InstrumentId, TokioScheduler, TransactionIdGenerator};
use optx_execution::{
    ExecutorServices, GatewayRouter, InstrumentExecutor, InstrumentHandle,
};
use optx_telemetry::Metrics;
use optx_throttle::{ControllerState, TransactionRateController};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::AppConfig;
use crate::error::AppResult;
use crate::paper::PaperGateway;
use crate::quoter::StaticQuoter;

struct RunningExecutor {
    handle: InstrumentHandle,
    join: JoinHandle<()>,
}

/// Main application.
pub struct Application {
    config: AppConfig,
    services: ExecutorServices,
    gateway: PaperGateway,
    router: Arc<GatewayRouter>,
    executors: Vec<RunningExecutor>,
    shutdown: CancellationToken,
}

impl Application {
    /// Wire the controller, paper gateway and router.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(config: AppConfig) -> AppResult<Self> {
        config.validate()?;

        let scheduler = Arc::new(TokioScheduler::current()?);
        let gateway = PaperGateway::new(
            config.paper.clone(),
            config.error_codes.clone(),
            scheduler.clone(),
        );
        let controller = TransactionRateController::new(
            config.controller.clone(),
            scheduler.clone(),
            Arc::new(gateway.clone()),
        )?;
        let router = Arc::new(GatewayRouter::new(controller.clone()));
        gateway.attach(router.clone());

        let services = ExecutorServices {
            gateway: Arc::new(gateway.clone()),
            scheduler,
            ids: Arc::new(TransactionIdGenerator::new()),
            controller,
        };

        Ok(Self {
            config,
            services,
            gateway,
            router,
            executors: Vec::new(),
            shutdown: CancellationToken::new(),
        })
    }

    /// Cancelling this token stops the application like Ctrl-C does.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn controller(&self) -> &TransactionRateController {
        &self.services.controller
    }

    pub fn gateway(&self) -> &PaperGateway {
        &self.gateway
    }

    /// Spawn one executor per configured instrument.
    pub fn start(&mut self) {
        for instrument in &self.config.instruments {
            let id = InstrumentId::new(instrument.symbol.clone());
            let (handle, join) = InstrumentExecutor::spawn(
                id.clone(),
                StaticQuoter::new(instrument.clone()),
                self.services.clone(),
                self.config.executor.clone(),
            );
            self.router.register(handle.clone());
            self.executors.push(RunningExecutor { handle, join });
            info!(instrument = %id, "Instrument started");
        }
    }

    /// Run until Ctrl-C or the shutdown token fires, then stop gracefully.
    pub async fn run(mut self) -> AppResult<()> {
        info!(
            instruments = self.config.instruments.len(),
            limit = self.config.controller.limit,
            "Starting optx engine"
        );
        self.start();

        let mut states = self.services.controller.subscribe();
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    info!("Shutdown requested");
                    break;
                }
                signal = tokio::signal::ctrl_c() => {
                    match signal {
                        Ok(()) => info!("Received Ctrl-C, shutting down"),
                        Err(e) => error!(error = %e, "Failed to listen for Ctrl-C, shutting down"),
                    }
                    break;
                }
                changed = states.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let state = *states.borrow_and_update();
                    match state {
                        ControllerState::LimitExceeded => warn!(state = %state, "Submissions paused"),
                        _ => info!(state = %state, "Rate controller state"),
                    }
                }
            }
        }

        self.stop().await
    }

    /// Stop every executor and wait for it to finish.
    pub async fn stop(&mut self) -> AppResult<()> {
        for executor in &self.executors {
            if let Err(e) = executor.handle.stop() {
                warn!(error = %e, "Executor already stopped");
            }
        }

        for executor in self.executors.drain(..) {
            let instrument = executor.handle.instrument().clone();
            if let Err(e) = executor.join.await {
                error!(instrument = %instrument, error = %e, "Executor task failed");
            }
            self.router.deregister(&instrument);
        }

        let stats = self.gateway.stats();
        info!(
            accepted = stats.accepted,
            rate_rejected = stats.rate_rejected,
            filled = stats.filled,
            live = self.gateway.live_count(),
            "optx engine stopped"
        );

        if let Some(path) = &self.config.telemetry.metrics_snapshot_path {
            Metrics::write_snapshot(path)?;
            info!(path = %path.display(), "Metrics snapshot written");
        }
        Ok(())
    }
}
