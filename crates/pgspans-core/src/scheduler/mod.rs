//! Per-target lifecycle and periodic collection.
//!
//! Every target gets its own tokio task and its own [`TargetWorker`]. Database
//! work runs under `spawn_blocking`; export runs on the runtime. One target's
//! failures never touch another's schedule. A stop request lets the in-flight
//! cycle, export included, run to completion.

pub mod worker;

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::collector::{Connector, PgConnector};
use crate::config::CollectorConfig;
use crate::error::ExportError;
use crate::export::{Exporter, chunk};
use crate::model::SpanRecord;

use worker::{SharedStatus, lock};

pub use worker::{Collected, CycleError, TargetState, TargetStatus, TargetWorker};

#[derive(Debug, Clone, Copy)]
struct ExportSettings {
    enabled: bool,
    batch_bytes: usize,
}

pub struct Scheduler {
    config: CollectorConfig,
    connector: Arc<dyn Connector>,
    exporter: Arc<Exporter>,
}

impl Scheduler {
    pub fn new(config: CollectorConfig, connector: Arc<dyn Connector>, exporter: Arc<Exporter>) -> Self {
        Self {
            config,
            connector,
            exporter,
        }
    }

    /// Real PostgreSQL connections and an HTTP exporter built from `config`.
    pub fn from_config(config: CollectorConfig) -> Result<Self, ExportError> {
        let exporter = Exporter::new(
            config.exporter_url.clone(),
            config.api_key.clone(),
            config.export_timeout,
        )?;
        Ok(Self::new(config, Arc::new(PgConnector), Arc::new(exporter)))
    }

    pub fn config(&self) -> &CollectorConfig {
        &self.config
    }

    fn workers(&self) -> Vec<TargetWorker> {
        self.config
            .targets()
            .into_iter()
            .map(|target| TargetWorker::new(target, &self.config, Arc::clone(&self.connector)))
            .collect()
    }

    fn export_settings(&self) -> ExportSettings {
        ExportSettings {
            enabled: self.config.export_results,
            batch_bytes: self.config.batch_bytes,
        }
    }

    /// Spawns one polling task per target. Must be called inside a tokio runtime.
    pub fn start(&self) -> SchedulerHandle {
        let (stop_tx, stop_rx) = watch::channel(false);
        let interval = self.config.fetch_interval;
        let export = self.export_settings();

        let mut tasks = Vec::new();
        let mut statuses = Vec::new();
        for worker in self.workers() {
            statuses.push(worker.status_handle());
            tasks.push(tokio::spawn(run_target(
                Arc::new(Mutex::new(worker)),
                Arc::clone(&self.exporter),
                interval,
                export,
                stop_rx.clone(),
            )));
        }

        info!(
            targets = tasks.len(),
            interval_ms = interval.as_millis() as u64,
            export = export.enabled,
            "scheduler started"
        );
        SchedulerHandle {
            stop: StopSignal(Arc::new(stop_tx)),
            stop_rx,
            tasks,
            statuses,
        }
    }

    /// Initializes every target, runs exactly one cycle on each in parallel and
    /// exports the result. Returns the spans of all targets.
    pub async fn run_once(&self) -> Vec<SpanRecord> {
        let export = self.export_settings();
        let mut set = JoinSet::new();

        for worker in self.workers() {
            let exporter = Arc::clone(&self.exporter);
            set.spawn(async move {
                let status = worker.status_handle();
                let name = worker.target().name.clone();
                let result = tokio::task::spawn_blocking(move || {
                    let mut worker = worker;
                    let result = worker.cycle();
                    worker.stop();
                    result
                })
                .await;

                match result {
                    Ok(Ok(collected)) => {
                        export_payloads(&exporter, &status, &collected.payloads, export).await;
                        collected.spans
                    }
                    Ok(Err(e)) => {
                        debug!(target = %name, error = %e, "single run produced nothing");
                        Vec::new()
                    }
                    Err(e) => {
                        error!(target = %name, error = %e, "cycle panicked in spawn_blocking");
                        Vec::new()
                    }
                }
            });
        }

        let mut spans = Vec::new();
        while let Some(result) = set.join_next().await {
            match result {
                Ok(s) => spans.extend(s),
                Err(e) => error!(error = %e, "target task failed"),
            }
        }
        spans
    }
}

/// Cloneable, synchronous stop trigger; safe to call from a signal handler.
#[derive(Debug, Clone)]
pub struct StopSignal(Arc<watch::Sender<bool>>);

impl StopSignal {
    pub fn stop(&self) {
        self.0.send_replace(true);
    }
}

pub struct SchedulerHandle {
    stop: StopSignal,
    stop_rx: watch::Receiver<bool>,
    tasks: Vec<JoinHandle<()>>,
    statuses: Vec<SharedStatus>,
}

impl SchedulerHandle {
    /// Asks every target to stop after its current cycle.
    pub fn stop(&self) {
        self.stop.stop();
    }

    pub fn stop_signal(&self) -> StopSignal {
        self.stop.clone()
    }

    pub fn status(&self) -> Vec<TargetStatus> {
        self.statuses.iter().map(|s| lock(s).clone()).collect()
    }

    /// True once every target task has ended, by stop or by becoming unavailable.
    pub fn is_finished(&self) -> bool {
        self.tasks.iter().all(JoinHandle::is_finished)
    }

    pub fn stop_requested(&self) -> bool {
        *self.stop_rx.borrow()
    }

    /// Resolves once a stop has been requested.
    pub async fn stopped(&self) {
        let mut rx = self.stop_rx.clone();
        // The sender lives in `self`, so this cannot fail.
        let _ = rx.wait_for(|stop| *stop).await;
    }

    /// Waits for every target task to end.
    pub async fn join(&mut self) {
        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                error!(error = %e, "target task failed");
            }
        }
    }
}

async fn run_target(
    worker: Arc<Mutex<TargetWorker>>,
    exporter: Arc<Exporter>,
    interval: Duration,
    export: ExportSettings,
    mut stop: watch::Receiver<bool>,
) {
    let (name, status) = {
        let w = lock(&worker);
        (w.target().name.clone(), w.status_handle())
    };
    let mut tick = tokio::time::interval(interval);
    tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        if *stop.borrow() {
            break;
        }
        tokio::select! {
            biased;
            _ = stop.changed() => break,
            _ = tick.tick() => {}
        }

        let worker_clone = Arc::clone(&worker);
        let t0 = Instant::now();
        let result = tokio::task::spawn_blocking(move || lock(&worker_clone).cycle()).await;
        let elapsed = t0.elapsed();

        let collected = match result {
            Ok(Ok(collected)) => collected,
            Ok(Err(CycleError::Unavailable(_))) => break,
            Ok(Err(_)) => continue,
            Err(e) => {
                error!(target = %name, error = %e, "cycle panicked in spawn_blocking");
                continue;
            }
        };

        if elapsed > interval / 2 {
            warn!(
                target = %name,
                duration_ms = elapsed.as_millis() as u64,
                interval_ms = interval.as_millis() as u64,
                "cycle exceeded 50% of interval"
            );
        }

        export_payloads(&exporter, &status, &collected.payloads, export).await;
    }

    let worker_clone = Arc::clone(&worker);
    if let Err(e) = tokio::task::spawn_blocking(move || lock(&worker_clone).stop()).await {
        error!(target = %name, error = %e, "stop panicked in spawn_blocking");
    }
    info!(target = %name, "target stopped");
}

/// Sends `payloads` in byte-bounded batches, one request at a time.
///
/// A failed batch is dropped; the remaining batches are still attempted.
async fn export_payloads(
    exporter: &Exporter,
    status: &SharedStatus,
    payloads: &[String],
    export: ExportSettings,
) {
    if payloads.is_empty() {
        return;
    }
    if !export.enabled {
        debug!(spans = payloads.len(), "export disabled, spans discarded");
        return;
    }

    for batch in chunk(payloads, export.batch_bytes) {
        let result = exporter.send(batch).await;
        let mut s = lock(status);
        match result {
            Ok(()) => s.batches_exported += 1,
            Err(e) => {
                s.batches_failed += 1;
                s.last_error = Some(e.to_string());
            }
        }
    }
}
