//! ABOUTME: Scheduler metrics and liveness probes
//! ABOUTME: Prometheus counters behind a small actix-web endpoint set

use actix_web::{web, App, HttpResponse, HttpServer, Responder};
use ch_core::{Error, Result};
use prometheus_client::encoding::text::encode;
use prometheus_client::encoding::{EncodeLabelSet, EncodeLabelValue};
use prometheus_client::metrics::{counter::Counter, family::Family};
use prometheus_client::registry::Registry;
use serde_json::json;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex,
};

/// Process readiness flag, flipped once bring-up finishes
#[derive(Debug, Clone, Default)]
pub struct Readiness {
    ready: Arc<AtomicBool>,
}

impl Readiness {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_ready(&self) {
        self.ready.store(true, Ordering::Relaxed);
    }

    pub fn mark_unready(&self) {
        self.ready.store(false, Ordering::Relaxed);
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Relaxed)
    }
}

/// Terminal status label on the task completion counter
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct StatusLabels {
    pub status: TaskOutcome,
}

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum TaskOutcome {
    Success,
    Failed,
    Error,
    Timeout,
    Canceled,
    Stopped,
}

impl TaskOutcome {
    pub fn from_status(status: &str) -> Option<Self> {
        match status {
            "success" => Some(Self::Success),
            "failed" => Some(Self::Failed),
            "error" => Some(Self::Error),
            "timeout" => Some(Self::Timeout),
            "canceled" => Some(Self::Canceled),
            "stopped" => Some(Self::Stopped),
            _ => None,
        }
    }
}

/// Scheduler metrics registry for Prometheus
#[derive(Debug)]
pub struct Metrics {
    registry: Arc<Mutex<Registry>>,
    tasks_dispatched_total: Counter,
    tasks_completed_total: Family<StatusLabels, Counter>,
    tasks_retried_total: Counter,
    lock_contention_total: Counter,
    workflow_steps_activated_total: Counter,
    workflow_executes_total: Counter,
}

impl Metrics {
    pub fn new() -> Self {
        let mut registry = Registry::default();

        // The text encoder appends the counter's `_total` suffix itself
        let tasks_dispatched_total = Counter::default();
        registry.register(
            "cronhub_tasks_dispatched",
            "Tasks materialised and pushed to workers",
            tasks_dispatched_total.clone(),
        );

        let tasks_completed_total = Family::<StatusLabels, Counter>::default();
        registry.register(
            "cronhub_tasks_completed",
            "Tasks that reached a terminal status",
            tasks_completed_total.clone(),
        );

        let tasks_retried_total = Counter::default();
        registry.register(
            "cronhub_tasks_retried",
            "Retry tasks spawned",
            tasks_retried_total.clone(),
        );

        let lock_contention_total = Counter::default();
        registry.register(
            "cronhub_lock_contention",
            "Distributed lock acquisitions lost to another holder",
            lock_contention_total.clone(),
        );

        let workflow_steps_activated_total = Counter::default();
        registry.register(
            "cronhub_workflow_steps_activated",
            "Workflow steps activated",
            workflow_steps_activated_total.clone(),
        );

        let workflow_executes_total = Counter::default();
        registry.register(
            "cronhub_workflow_executes",
            "Workflow executes started",
            workflow_executes_total.clone(),
        );

        Self {
            registry: Arc::new(Mutex::new(registry)),
            tasks_dispatched_total,
            tasks_completed_total,
            tasks_retried_total,
            lock_contention_total,
            workflow_steps_activated_total,
            workflow_executes_total,
        }
    }

    pub fn inc_dispatched(&self) {
        self.tasks_dispatched_total.inc();
    }

    pub fn inc_completed(&self, status: &str) {
        if let Some(outcome) = TaskOutcome::from_status(status) {
            self.tasks_completed_total
                .get_or_create(&StatusLabels { status: outcome })
                .inc();
        }
    }

    pub fn inc_retried(&self) {
        self.tasks_retried_total.inc();
    }

    pub fn inc_lock_contention(&self) {
        self.lock_contention_total.inc();
    }

    pub fn inc_step_activated(&self) {
        self.workflow_steps_activated_total.inc();
    }

    pub fn inc_workflow_execute(&self) {
        self.workflow_executes_total.inc();
    }

    /// Render the registry in the Prometheus text format
    pub fn encode(&self) -> Result<String> {
        let registry = self
            .registry
            .lock()
            .map_err(|_| Error::Config("Metrics registry poisoned".to_string()))?;

        let mut out = String::new();
        encode(&mut out, &registry)
            .map_err(|e| Error::Config(format!("Metrics encoding failed: {}", e)))?;
        Ok(out)
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared state behind the probe endpoints
#[derive(Debug, Clone)]
pub struct ObsState {
    pub readiness: Readiness,
    pub metrics: Arc<Metrics>,
}

impl ObsState {
    pub fn new() -> Self {
        Self {
            readiness: Readiness::new(),
            metrics: Arc::new(Metrics::new()),
        }
    }
}

impl Default for ObsState {
    fn default() -> Self {
        Self::new()
    }
}

async fn healthz() -> impl Responder {
    HttpResponse::Ok().body("ok")
}

async fn readyz(state: web::Data<ObsState>) -> impl Responder {
    if state.readiness.is_ready() {
        HttpResponse::Ok().json(json!({ "ready": true }))
    } else {
        HttpResponse::ServiceUnavailable().json(json!({ "ready": false }))
    }
}

async fn metrics_text(state: web::Data<ObsState>) -> impl Responder {
    match state.metrics.encode() {
        Ok(body) => HttpResponse::Ok()
            .content_type("text/plain; version=0.0.4; charset=utf-8")
            .body(body),
        Err(e) => {
            tracing::error!(error = %e, "Metrics scrape failed");
            HttpResponse::InternalServerError().finish()
        }
    }
}

/// Probe routes, mountable on any actix app
pub fn routes(cfg: &mut web::ServiceConfig) {
    cfg.route("/healthz", web::get().to(healthz))
        .route("/readyz", web::get().to(readyz))
        .route("/metrics", web::get().to(metrics_text));
}

/// Serve the probe endpoints until the process exits
pub async fn serve(bind: &str, state: ObsState) -> Result<()> {
    tracing::info!(bind, "Probe server starting");
    let data = web::Data::new(state);

    HttpServer::new(move || App::new().app_data(data.clone()).configure(routes))
        .bind(bind)
        .map_err(|e| Error::Config(format!("Cannot bind probe server on {}: {}", bind, e)))?
        .run()
        .await
        .map_err(|e| Error::Config(format!("Probe server exited: {}", e)))
}
