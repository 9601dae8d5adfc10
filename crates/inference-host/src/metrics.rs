//! Prometheus counters fed from the lifecycle event stream.
//!
//! The collector is a plain subscriber: it never sits on the load or request
//! path, and a lagging collector only loses counts.

use prometheus::{Encoder, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::{errors::BroadcastStreamRecvError, BroadcastStream};
use tokio_stream::StreamExt;
use tracing::{debug, warn};

use crate::events::{EventBus, LifecycleEvent};

pub struct LifecycleMetrics {
    registry: Registry,
    loaded: IntCounterVec,
    evicted: IntCounterVec,
    load_failures: IntCounterVec,
    dispatched: IntCounterVec,
    resident: IntGauge,
    dropped: IntGauge,
}

impl LifecycleMetrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();

        let loaded = IntCounterVec::new(
            Opts::new("models_loaded_total", "Models that reached the ready state"),
            &["backend"],
        )?;
        let evicted = IntCounterVec::new(
            Opts::new("models_evicted_total", "Ready models removed from the registry"),
            &["reason"],
        )?;
        let load_failures = IntCounterVec::new(
            Opts::new("model_load_failures_total", "Failed or refused loads"),
            &["code"],
        )?;
        let dispatched = IntCounterVec::new(
            Opts::new("phases_dispatched_total", "Inference phases routed to an execution target"),
            &["phase", "target"],
        )?;
        let resident = IntGauge::new("models_resident", "Models currently ready")?;
        let dropped = IntGauge::new("lifecycle_events_dropped", "Events missed by a lagging collector")?;

        registry.register(Box::new(loaded.clone()))?;
        registry.register(Box::new(evicted.clone()))?;
        registry.register(Box::new(load_failures.clone()))?;
        registry.register(Box::new(dispatched.clone()))?;
        registry.register(Box::new(resident.clone()))?;
        registry.register(Box::new(dropped.clone()))?;

        Ok(Self {
            registry,
            loaded,
            evicted,
            load_failures,
            dispatched,
            resident,
            dropped,
        })
    }

    pub fn record(&self, event: &LifecycleEvent) {
        match event {
            LifecycleEvent::ModelLoaded { backend, .. } => {
                self.loaded.with_label_values(&[backend.as_str()]).inc();
                self.resident.inc();
            }
            LifecycleEvent::ModelEvicted { reason, .. } => {
                self.evicted.with_label_values(&[reason.as_str()]).inc();
                self.resident.dec();
            }
            LifecycleEvent::LoadFailed { code, .. } => {
                self.load_failures.with_label_values(&[*code]).inc();
            }
            LifecycleEvent::PhaseDispatched { phase, target, .. } => {
                self.dispatched
                    .with_label_values(&[&phase.to_string(), &target.to_string()])
                    .inc();
            }
        }
    }

    /// Consumes `events` in the background until the bus is dropped.
    pub fn spawn_collector(self: &Arc<Self>, events: &EventBus) -> JoinHandle<()> {
        let metrics = Arc::clone(self);
        let mut stream = BroadcastStream::new(events.subscribe());
        tokio::spawn(async move {
            while let Some(item) = stream.next().await {
                match item {
                    Ok(event) => metrics.record(&event),
                    Err(BroadcastStreamRecvError::Lagged(missed)) => {
                        warn!("Metrics collector lagged, {} events dropped", missed);
                        metrics.dropped.add(missed as i64);
                    }
                }
            }
            debug!("Metrics collector stopped");
        })
    }

    /// Text exposition format.
    pub fn render(&self) -> String {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = vec![];
        if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
            warn!("Failed to encode metrics: {}", e);
        }
        String::from_utf8_lossy(&buffer).into_owned()
    }
}
