//! Delivery Orchestrator
//!
//! Entry point for a batch of events:
//! - `json_batch` sends the whole batch as one unit, rendering URL and headers
//!   against the first event
//! - every other format fans out one unit per event, each in its own task
//!
//! Every unit holds a gate token from its first attempt until it settles, so at
//! most `pool_max` requests are ever outstanding. `deliver` returns only after
//! every unit has been delivered, failed or been abandoned.

use std::sync::Arc;

use hc_common::Event;
use hc_config::{DeliveryConfig, OutputSettings};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::dispatcher::Dispatcher;
use crate::encoder::BodyEncoder;
use crate::error::DeliveryError;
use crate::gate::ConcurrencyGate;
use crate::observer::{DeliveryObserver, TracingObserver};
use crate::retry::{RetryController, UnitOutcome};
use crate::shutdown::{NeverShutdown, ShutdownSignal};
use crate::transport::{ReqwestTransport, Transport};
use crate::Result;

/// Event counts for one `deliver` call
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliverySummary {
    pub delivered: usize,
    pub failed: usize,
    pub abandoned: usize,
}

impl DeliverySummary {
    pub fn total(&self) -> usize {
        self.delivered + self.failed + self.abandoned
    }

    fn record(&mut self, outcome: &UnitOutcome, events: usize) {
        match outcome {
            UnitOutcome::Delivered { .. } => self.delivered += events,
            UnitOutcome::Failed { .. } => self.failed += events,
            UnitOutcome::Abandoned { .. } => self.abandoned += events,
        }
    }
}

struct EngineInner {
    encoder: BodyEncoder,
    gate: ConcurrencyGate,
    controller: RetryController,
}

/// Shared, cloneable delivery engine
#[derive(Clone)]
pub struct DeliveryEngine {
    inner: Arc<EngineInner>,
}

pub struct EngineBuilder {
    config: DeliveryConfig,
    transport: Option<Arc<dyn Transport>>,
    observer: Arc<dyn DeliveryObserver>,
    shutdown: Arc<dyn ShutdownSignal>,
}

impl EngineBuilder {
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn observer(mut self, observer: Arc<dyn DeliveryObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn shutdown(mut self, shutdown: Arc<dyn ShutdownSignal>) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn build(self) -> Result<DeliveryEngine> {
        let config = self.config;
        let transport = match self.transport {
            Some(transport) => transport,
            None => Arc::new(ReqwestTransport::new(&config.transport, config.pool_max)?),
        };

        let dispatcher = Arc::new(Dispatcher::new(&config, transport));
        let controller = RetryController::new(dispatcher, config.retry.clone(), self.observer, self.shutdown)
            .with_request_details(config.log_request_details);

        info!(
            url = %config.url,
            method = %config.method,
            format = %config.format,
            pool_max = config.pool_max,
            "Delivery engine ready"
        );

        Ok(DeliveryEngine {
            inner: Arc::new(EngineInner {
                encoder: BodyEncoder::from_config(&config),
                gate: ConcurrencyGate::new(config.pool_max),
                controller,
            }),
        })
    }
}

impl DeliveryEngine {
    pub fn builder(config: DeliveryConfig) -> EngineBuilder {
        EngineBuilder {
            config,
            transport: None,
            observer: Arc::new(TracingObserver),
            shutdown: Arc::new(NeverShutdown),
        }
    }

    /// Build with the default `reqwest` transport, tracing observer and no shutdown signal
    pub fn new(config: DeliveryConfig) -> Result<Self> {
        Self::builder(config).build()
    }

    /// Validate raw settings and build with defaults
    pub fn from_settings(settings: OutputSettings) -> Result<Self> {
        Self::new(settings.validate()?)
    }

    pub fn gate(&self) -> &ConcurrencyGate {
        &self.inner.gate
    }

    /// Deliver a batch, waiting until every unit has settled.
    ///
    /// Returns [`DeliveryError::Abandoned`] when shutdown interrupted any retry
    /// loop, or when the gate was closed before some units could start. Units
    /// already running are still awaited. Failed events are reported through
    /// the observer and counted, but do not make the call fail.
    pub async fn deliver(&self, batch: Vec<Event>) -> Result<DeliverySummary> {
        if batch.is_empty() {
            return Ok(DeliverySummary::default());
        }

        let summary = if self.inner.encoder.format().is_batch() {
            self.deliver_as_one(&batch).await
        } else {
            self.deliver_each(batch).await
        };

        debug!(
            delivered = summary.delivered,
            failed = summary.failed,
            abandoned = summary.abandoned,
            "Batch settled"
        );

        if summary.abandoned > 0 {
            return Err(DeliveryError::Abandoned {
                abandoned: summary.abandoned,
                delivered: summary.delivered,
                failed: summary.failed,
            });
        }
        Ok(summary)
    }

    async fn deliver_as_one(&self, batch: &[Event]) -> DeliverySummary {
        let context = &batch[0];
        let controller = &self.inner.controller;

        let outcome = match self.inner.encoder.encode_batch(batch) {
            Err(e) => {
                error!(error = %e, events = batch.len(), "Failed to encode batch, dropping it");
                controller.reject(context, batch.len(), &e)
            }
            Ok(body) => match self.inner.gate.acquire().await {
                Ok(token) => {
                    let outcome = controller.run(context, &body, batch.len()).await;
                    drop(token);
                    outcome
                }
                Err(e) => {
                    warn!(error = %e, "Gate stopped admitting units, abandoning batch");
                    controller.abandon(context, 0, batch.len(), None)
                }
            },
        };

        let mut summary = DeliverySummary::default();
        summary.record(&outcome, batch.len());
        summary
    }

    async fn deliver_each(&self, batch: Vec<Event>) -> DeliverySummary {
        let mut summary = DeliverySummary::default();
        let mut tasks = JoinSet::new();
        let mut pending = batch.into_iter();

        while let Some(event) = pending.next() {
            let body = match self.inner.encoder.encode_event(&event) {
                Ok(body) => body,
                Err(e) => {
                    error!(error = %e, "Failed to encode event, dropping it");
                    let outcome = self.inner.controller.reject(&event, 1, &e);
                    summary.record(&outcome, 1);
                    continue;
                }
            };

            let token = match self.inner.gate.acquire().await {
                Ok(token) => token,
                Err(e) => {
                    // Units already spawned keep running and are joined below
                    warn!(error = %e, "Gate stopped admitting units, abandoning the rest of the batch");
                    for event in std::iter::once(event).chain(pending.by_ref()) {
                        let outcome = self.inner.controller.abandon(&event, 0, 1, None);
                        summary.record(&outcome, 1);
                    }
                    break;
                }
            };

            let inner = self.inner.clone();
            tasks.spawn(async move {
                let outcome = inner.controller.run(&event, &body, 1).await;
                drop(token);
                outcome
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(outcome) => summary.record(&outcome, 1),
                Err(e) => {
                    warn!(error = %e, "Delivery task panicked");
                    summary.failed += 1;
                }
            }
        }

        summary
    }
}
