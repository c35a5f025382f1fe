// src/vm/supervisor.rs

//! VM lifecycle supervisor.
//!
//! The registry maps a VM id to its slot. A `Starting` slot is a reservation
//! taken under the write lock before any process work, which makes the
//! "not already running" check and the final install atomic for a given id
//! without serialising different VMs behind one lock. Every installed run
//! carries a `run_id`; the watcher and `stop` only remove the slot when the
//! id still matches, so a late watcher can never evict a newer run.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use metrics::{gauge, increment_counter};
use thiserror::Error;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, error, info, warn};

use crate::config::HypervisorConfig;
use crate::error::ErrorKind;
use crate::logging::Logger;
use crate::storage::{StoreError, VmStore};
use crate::vm::cancel::CancelToken;
use crate::vm::hypervisor::{
    resolve_executable, Hypervisor, HypervisorError, LaunchRequest, VmProcess, DEFAULT_BINARY,
    DEFAULT_JAILER_BINARY,
};
use crate::vm::instance::{VmMetrics, VmRecord, VmStatus, VmUpdate};
use crate::vm::logs::{LogEngine, LogEntry};
use crate::vm::machine::{LaunchPlan, VmConfig};

/// Source tag of lifecycle events in the log stream
pub const LIFECYCLE_SOURCE: &str = "supervisor";

/// Process-facing settings of the supervisor
#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    /// Hypervisor binary; `None` looks it up on `PATH`
    pub binary: Option<PathBuf>,

    /// Default jailer binary for VMs that request one
    pub jailer_binary: Option<PathBuf>,

    /// Directory for control sockets and metrics files
    pub socket_dir: PathBuf,

    /// Bound on launch confirmation
    pub launch_timeout: Duration,

    /// Bound on a single control request
    pub request_timeout: Duration,
}

impl From<&HypervisorConfig> for SupervisorSettings {
    fn from(config: &HypervisorConfig) -> Self {
        Self {
            binary: config.binary.clone(),
            jailer_binary: config.jailer_binary.clone(),
            socket_dir: config.socket_dir.clone(),
            launch_timeout: config.launch_timeout(),
            request_timeout: config.request_timeout(),
        }
    }
}

/// VM lifecycle errors
#[derive(Debug, Error)]
pub enum VmError {
    #[error("Invalid VM configuration: {0}")]
    Validation(String),

    #[error("VM not found: {0}")]
    NotFound(String),

    #[error("VM is already running: {0}")]
    AlreadyRunning(String),

    #[error("VM is not running: {0}")]
    NotRunning(String),

    #[error("VM must be stopped before it can be deleted: {0}")]
    DeleteWhileRunning(String),

    #[error("VM must be stopped before it can be updated: {0}")]
    UpdateWhileRunning(String),

    #[error(transparent)]
    Hypervisor(#[from] HypervisorError),

    #[error("Storage error: {0}")]
    Store(StoreError),
}

impl VmError {
    /// Error classification
    pub fn kind(&self) -> ErrorKind {
        match self {
            VmError::Validation(_) => ErrorKind::Validation,
            VmError::NotFound(_) => ErrorKind::NotFound,
            VmError::AlreadyRunning(_)
            | VmError::NotRunning(_)
            | VmError::DeleteWhileRunning(_)
            | VmError::UpdateWhileRunning(_) => ErrorKind::Conflict,
            VmError::Hypervisor(e) => e.kind(),
            VmError::Store(e) => e.kind(),
        }
    }
}

impl From<StoreError> for VmError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound { key, .. } => VmError::NotFound(key),
            other => VmError::Store(other),
        }
    }
}

struct RunningVm {
    run_id: u64,
    process: Arc<dyn VmProcess>,
    cancel: CancelToken,
    started_at: DateTime<Utc>,
}

enum Slot {
    /// Reserved by an in-flight start
    Starting,
    Running(RunningVm),
}

struct Inner {
    vms: VmStore,
    hypervisor: Arc<dyn Hypervisor>,
    logs: Arc<LogEngine>,
    settings: SupervisorSettings,
    registry: RwLock<HashMap<String, Slot>>,
    next_run: AtomicU64,
    logger: Logger,
}

/// Authoritative owner of running VM processes
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<Inner>,
}

impl Supervisor {
    pub fn new(
        vms: VmStore,
        hypervisor: Arc<dyn Hypervisor>,
        logs: Arc<LogEngine>,
        settings: SupervisorSettings,
        logger: Logger,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                vms,
                hypervisor,
                logs,
                settings,
                registry: RwLock::new(HashMap::new()),
                next_run: AtomicU64::new(1),
                logger,
            }),
        }
    }

    /// Log engine lifecycle events are published to
    pub fn logs(&self) -> &Arc<LogEngine> {
        &self.inner.logs
    }

    /// Validates and persists a new stopped VM
    pub fn create(&self, config: VmConfig) -> Result<VmRecord, VmError> {
        config.validate().map_err(VmError::Validation)?;

        let record = VmRecord::new(config);
        self.inner.vms.create(&record)?;

        info!(parent: &self.inner.logger.vm_span(&record.id), name = %record.name, "VM created");
        Ok(record)
    }

    pub fn get(&self, id: &str) -> Result<VmRecord, VmError> {
        Ok(self.inner.vms.get(id)?)
    }

    pub fn list(&self) -> Result<Vec<VmRecord>, VmError> {
        Ok(self.inner.vms.list()?)
    }

    /// Renames and/or replaces the configuration of a VM with no live process
    pub async fn update(&self, id: &str, update: VmUpdate) -> Result<VmRecord, VmError> {
        // held so that no start can reserve the id while the record is rewritten
        let registry = self.inner.registry.read().await;
        if registry.contains_key(id) {
            return Err(VmError::UpdateWhileRunning(id.to_string()));
        }

        let mut record = self.inner.vms.get(id)?;
        let mut config = update.config.unwrap_or_else(|| record.config.clone());
        if let Some(name) = update.name {
            config.name = name;
        }
        config.validate().map_err(VmError::Validation)?;

        record.name = config.name.clone();
        record.config = config;
        self.inner.vms.update(&record)?;
        drop(registry);

        info!(parent: &self.inner.logger.vm_span(id), name = %record.name, "VM updated");
        Ok(record)
    }

    /// Removes a VM that has no live process and discards its log history
    pub async fn delete(&self, id: &str) -> Result<(), VmError> {
        let registry = self.inner.registry.read().await;
        if registry.contains_key(id) {
            return Err(VmError::DeleteWhileRunning(id.to_string()));
        }
        self.inner.vms.delete(id)?;
        drop(registry);

        self.inner.logs.clear_buffer(id);
        info!(parent: &self.inner.logger.vm_span(id), "VM deleted");
        Ok(())
    }

    /// Whether a live run is installed for `id`
    pub async fn is_running(&self, id: &str) -> bool {
        matches!(self.inner.registry.read().await.get(id), Some(Slot::Running(_)))
    }

    /// Ids with a live run
    pub async fn running_ids(&self) -> Vec<String> {
        self.inner
            .registry
            .read()
            .await
            .iter()
            .filter(|(_, slot)| matches!(slot, Slot::Running(_)))
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Launches the VM's hypervisor process
    ///
    /// Any failure after the record was found leaves it in `Error` with the
    /// message attached, and no handle behind. The launch runs on its own
    /// task, so a caller that stops waiting does not strand the reservation.
    pub async fn start(&self, id: &str) -> Result<(), VmError> {
        {
            let mut registry = self.inner.registry.write().await;
            if registry.contains_key(id) {
                return Err(VmError::AlreadyRunning(id.to_string()));
            }
            registry.insert(id.to_string(), Slot::Starting);
        }

        let inner = Arc::clone(&self.inner);
        let vm_id = id.to_string();
        match tokio::spawn(async move { inner.start_reserved(&vm_id).await }).await {
            Ok(result) => result,
            Err(e) => {
                self.inner.registry.write().await.remove(id);
                self.inner.set_status(id, VmStatus::Error);
                Err(VmError::Hypervisor(HypervisorError::Launch(format!(
                    "start task failed: {e}"
                ))))
            }
        }
    }

    /// Forcibly terminates a running VM and marks it stopped
    pub async fn stop(&self, id: &str) -> Result<(), VmError> {
        let (run_id, process, cancel) = self.inner.claim(id, VmStatus::Stopping).await?;
        let span = self.inner.logger.vm_span(id);
        self.inner.event(id, "info", "stop requested");

        if let Err(e) = process.kill().await {
            warn!(parent: &span, error = %e, "kill failed, relying on cancellation");
        }
        cancel.cancel();

        // the watcher may have reconciled an exit in the meantime
        if self.inner.release(id, run_id).await.is_some() {
            increment_counter!("agni_vm_stops_total");
            self.inner.event(id, "info", "VM stopped");
            info!(parent: &span, "VM stopped");
        }
        Ok(())
    }

    /// Asks the guest to shut down; the watcher finalises the stop
    pub async fn shutdown(&self, id: &str) -> Result<(), VmError> {
        let (run_id, process, _) = self.inner.claim(id, VmStatus::Stopping).await?;
        let span = self.inner.logger.vm_span(id);
        self.inner.event(id, "info", "shutdown requested");

        if let Err(e) = process.shutdown().await {
            warn!(parent: &span, error = %e, "graceful shutdown request failed");
            let registry = self.inner.registry.read().await;
            if matches!(registry.get(id), Some(Slot::Running(r)) if r.run_id == run_id) {
                self.inner.set_status(id, VmStatus::Running);
            }
            return Err(e.into());
        }

        info!(parent: &span, "shutdown requested");
        Ok(())
    }

    /// Counters for a running VM
    pub async fn get_metrics(&self, id: &str) -> Result<VmMetrics, VmError> {
        let (process, started_at) = {
            let registry = self.inner.registry.read().await;
            match registry.get(id) {
                Some(Slot::Running(run)) => (Arc::clone(&run.process), run.started_at),
                _ => return Err(VmError::NotRunning(id.to_string())),
            }
        };

        let record = self.inner.vms.get(id)?;
        let sample = process.metrics().await?;
        let now = Utc::now();

        Ok(VmMetrics {
            timestamp: now,
            uptime_seconds: (now - started_at).num_seconds().max(0) as u64,
            vcpu_count: record.config.cpus,
            memory_total_mib: record.config.memory_mib,
            cpu_usage: sample.cpu_usage,
            disk_read_bytes: sample.disk_read_bytes,
            disk_write_bytes: sample.disk_write_bytes,
            net_rx_bytes: sample.net_rx_bytes,
            net_tx_bytes: sample.net_tx_bytes,
        })
    }

    /// Best-effort forced stop of every running VM
    pub async fn stop_all(&self) {
        let ids = self.running_ids().await;
        if ids.is_empty() {
            return;
        }

        info!(parent: self.inner.logger.span(), count = ids.len(), "stopping all VMs");
        let results = join_all(ids.iter().map(|id| self.stop(id))).await;
        for (id, result) in ids.iter().zip(results) {
            if let Err(e) = result {
                warn!(parent: &self.inner.logger.vm_span(id), error = %e, "stop during shutdown failed");
            }
        }
    }
}

impl Inner {
    /// Snapshot of the live run, persisting `status` while the run is held
    async fn claim(
        &self,
        id: &str,
        status: VmStatus,
    ) -> Result<(u64, Arc<dyn VmProcess>, CancelToken), VmError> {
        let registry = self.registry.read().await;
        match registry.get(id) {
            Some(Slot::Running(run)) => {
                self.set_status(id, status);
                Ok((run.run_id, Arc::clone(&run.process), run.cancel.clone()))
            }
            _ => Err(VmError::NotRunning(id.to_string())),
        }
    }

    /// Removes the run if it is still `run_id` and persists `Stopped`
    ///
    /// Returns the status the record held before, or `None` when the run was
    /// already gone. Both steps happen under the write lock so that a new
    /// start cannot interleave.
    async fn release(&self, id: &str, run_id: u64) -> Option<Option<VmStatus>> {
        let mut registry = self.registry.write().await;
        if !matches!(registry.get(id), Some(Slot::Running(r)) if r.run_id == run_id) {
            return None;
        }
        registry.remove(id);
        set_running_gauge(&registry);
        Some(self.mark_stopped(id))
    }

    fn event(&self, id: &str, level: &str, message: impl Into<String>) {
        self.logs
            .publish(id, LogEntry::new(level, message).with_source(LIFECYCLE_SOURCE));
    }

    /// Best-effort status write used on paths that must not fail
    fn set_status(&self, id: &str, status: VmStatus) {
        let result = self.vms.get(id).and_then(|mut record| {
            record.status = status;
            self.vms.update(&record)
        });
        if let Err(e) = result {
            error!(parent: &self.logger.vm_span(id), error = %e, status = %status, "failed to persist VM status");
        }
    }

    fn mark_stopped(&self, id: &str) -> Option<VmStatus> {
        let result = self.vms.get(id).and_then(|mut record| {
            let previous = record.status;
            record.status = VmStatus::Stopped;
            record.stopped_at = Some(Utc::now());
            record.pid = None;
            self.vms.update(&record).map(|_| previous)
        });
        match result {
            Ok(previous) => Some(previous),
            Err(e) => {
                error!(parent: &self.logger.vm_span(id), error = %e, "failed to persist stopped state");
                None
            }
        }
    }

    /// Completes a start whose `Starting` slot is already reserved
    async fn start_reserved(self: Arc<Self>, id: &str) -> Result<(), VmError> {
        let run = match self.launch(id).await {
            Ok(run) => run,
            Err(e) => {
                self.registry.write().await.remove(id);
                return Err(e);
            }
        };

        let started = run.started_at;
        let run_id = run.run_id;
        let process = Arc::clone(&run.process);
        let cancel = run.cancel.clone();
        {
            let mut registry = self.registry.write().await;
            registry.insert(id.to_string(), Slot::Running(run));
            set_running_gauge(&registry);
        }

        tokio::spawn(Arc::clone(&self).watch(id.to_string(), run_id, process, cancel));

        increment_counter!("agni_vm_starts_total");
        self.event(id, "info", format!("VM started at {}", started.to_rfc3339()));
        info!(parent: &self.logger.vm_span(id), "VM started");
        Ok(())
    }

    /// Everything between reservation and install
    async fn launch(&self, id: &str) -> Result<RunningVm, VmError> {
        let mut record = self.vms.get(id)?;
        let span = self.logger.vm_span(id);

        record.status = VmStatus::Starting;
        record.error = None;
        self.vms.update(&record)?;
        self.event(id, "info", "starting VM");

        let cancel = CancelToken::new();
        let (mut process, socket_path) = match self.spawn_process(&record, cancel.clone()).await {
            Ok(launched) => launched,
            Err(e) => {
                let message = e.to_string();
                record.status = VmStatus::Error;
                record.error = Some(message.clone());
                if let Err(store_err) = self.vms.update(&record) {
                    error!(parent: &span, error = %store_err, "failed to persist start failure");
                }
                increment_counter!("agni_vm_start_failures_total");
                self.event(id, "error", format!("start failed: {message}"));
                warn!(parent: &span, error = %message, "VM failed to start");
                return Err(e);
            }
        };

        if let Some(output) = process.take_output() {
            tokio::spawn(pump(Arc::clone(&self.logs), id.to_string(), output));
        }

        let started_at = Utc::now();
        record.status = VmStatus::Running;
        record.started_at = Some(started_at);
        record.socket_path = Some(socket_path);
        record.pid = process.pid();
        record.error = None;
        if let Err(e) = self.vms.update(&record) {
            error!(parent: &span, error = %e, "failed to persist running state");
        }

        Ok(RunningVm {
            run_id: self.next_run.fetch_add(1, Ordering::Relaxed),
            process: Arc::from(process),
            cancel,
            started_at,
        })
    }

    fn plan_for(&self, record: &VmRecord) -> Result<LaunchPlan, HypervisorError> {
        match &record.config.jailer {
            Some(jailer) => {
                let configured = jailer.binary.as_deref().or(self.settings.jailer_binary.as_deref());
                let binary = resolve_executable(configured, DEFAULT_JAILER_BINARY)?;
                Ok(LaunchPlan::jailed(&binary, jailer))
            }
            None => {
                let binary = resolve_executable(self.settings.binary.as_deref(), DEFAULT_BINARY)?;
                Ok(LaunchPlan::direct(&binary, &record.id, &self.settings.socket_dir))
            }
        }
    }

    async fn spawn_process(
        &self,
        record: &VmRecord,
        cancel: CancelToken,
    ) -> Result<(Box<dyn VmProcess>, PathBuf), VmError> {
        let plan = self.plan_for(record)?;
        let socket_path = plan.socket_path.clone();

        if record.config.jailer.is_none() {
            tokio::fs::create_dir_all(&self.settings.socket_dir)
                .await
                .map_err(|e| {
                    HypervisorError::Launch(format!(
                        "cannot create socket directory {}: {e}",
                        self.settings.socket_dir.display()
                    ))
                })?;
        }

        let request = LaunchRequest {
            vm_id: record.id.clone(),
            spec: record.config.launch_spec(&plan.metrics_api_path),
            plan,
            launch_timeout: self.settings.launch_timeout,
            request_timeout: self.settings.request_timeout,
        };

        let process = self.hypervisor.launch(request, cancel).await?;
        Ok((process, socket_path))
    }

    /// Waits for the run to end and reconciles state, unless `stop` got there first
    async fn watch(
        self: Arc<Self>,
        id: String,
        run_id: u64,
        process: Arc<dyn VmProcess>,
        cancel: CancelToken,
    ) {
        let span = self.logger.vm_span(&id);

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!(parent: &span, "watcher cancelled");
                return;
            }
            outcome = process.wait() => outcome,
        };

        let previous = match self.release(&id, run_id).await {
            Some(previous) => previous,
            None => return,
        };
        increment_counter!("agni_vm_exits_total");

        let requested = previous == Some(VmStatus::Stopping);
        match outcome {
            Err(e) => {
                warn!(parent: &span, error = %e, "wait on VM process failed");
                self.event(&id, "warn", format!("VM process lost: {e}"));
            }
            Ok(report) if requested => {
                info!(parent: &span, code = ?report.code, "VM exited after shutdown request");
                self.event(&id, "info", "VM exited");
            }
            Ok(report) => {
                warn!(parent: &span, code = ?report.code, signal = ?report.signal, "VM exited unexpectedly");
                self.event(
                    &id,
                    "warn",
                    format!(
                        "VM exited unexpectedly (code {:?}, signal {:?})",
                        report.code, report.signal
                    ),
                );
            }
        }
    }
}

async fn pump(logs: Arc<LogEngine>, id: String, mut output: mpsc::Receiver<LogEntry>) {
    while let Some(entry) = output.recv().await {
        logs.publish(&id, entry);
    }
}

fn set_running_gauge(registry: &HashMap<String, Slot>) {
    let running = registry
        .values()
        .filter(|slot| matches!(slot, Slot::Running(_)))
        .count();
    gauge!("agni_vms_running", running as f64);
}
