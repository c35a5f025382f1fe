// src/vm/firecracker.rs

//! Firecracker process adapter.
//!
//! The process is configured over its Unix control socket with plain
//! HTTP/1.1 requests. A reaper task owns the child and publishes its exit
//! status through a watch channel so any number of callers can wait on it.

use std::io::ErrorKind as IoErrorKind;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use async_trait::async_trait;
use hyper::client::conn;
use hyper::{Body, Method, Request};
use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::{self, Gid, Pid, Uid};
use serde::Serialize;
use serde_json::json;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::net::UnixStream;
use tokio::process::Command;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn, Span};

use crate::logging::Logger;
use crate::vm::cancel::CancelToken;
use crate::vm::hypervisor::{
    ExitReport, Hypervisor, HypervisorError, LaunchRequest, MetricsSample, VmProcess,
};
use crate::vm::logs::LogEntry;

/// Queue between the output readers and the supervisor's log pump
const OUTPUT_QUEUE: usize = 256;

/// Socket readiness polling interval
const SOCKET_POLL: Duration = Duration::from_millis(10);

/// How long a failed launch waits for the killed process to be reaped
const REAP_GRACE: Duration = Duration::from_secs(2);

type ExitSlot = Option<Result<ExitReport, String>>;

/// Launches real Firecracker processes
pub struct Firecracker {
    logger: Logger,
}

impl Firecracker {
    pub fn new(logger: Logger) -> Self {
        Self { logger }
    }
}

#[async_trait]
impl Hypervisor for Firecracker {
    async fn launch(
        &self,
        request: LaunchRequest,
        cancel: CancelToken,
    ) -> Result<Box<dyn VmProcess>, HypervisorError> {
        let span = self.logger.vm_span(&request.vm_id);
        let plan = &request.plan;

        match tokio::fs::remove_file(&plan.socket_path).await {
            Ok(()) => debug!(parent: &span, path = %plan.socket_path.display(), "removed stale control socket"),
            Err(e) if e.kind() == IoErrorKind::NotFound => {}
            Err(e) => return Err(HypervisorError::Launch(format!("cannot remove stale socket: {e}"))),
        }

        let mut child = Command::new(&plan.program)
            .args(&plan.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| HypervisorError::Launch(format!("{}: {e}", plan.program.display())))?;

        let pid = child.id();
        info!(parent: &span, pid = ?pid, program = %plan.program.display(), "hypervisor process spawned");

        let (out_tx, out_rx) = mpsc::channel(OUTPUT_QUEUE);
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(read_output(stdout, "stdout", out_tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(read_output(stderr, "stderr", out_tx));
        }

        let (exit_tx, exit_rx) = watch::channel::<ExitSlot>(None);
        tokio::spawn(reap(child, cancel.clone(), exit_tx, span.clone()));

        let mut process = FirecrackerProcess {
            pid,
            api: ApiClient::new(plan.socket_path.clone(), request.request_timeout),
            metrics_path: None,
            exit_rx,
            output: Some(out_rx),
        };

        let configured = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(HypervisorError::Cancelled),
            result = tokio::time::timeout(request.launch_timeout, process.configure(&request, &span)) => {
                result.unwrap_or(Err(HypervisorError::LaunchTimeout(request.launch_timeout)))
            }
        };

        match configured {
            Ok(metrics_path) => {
                process.metrics_path = metrics_path;
                info!(parent: &span, "hypervisor instance started");
                Ok(Box::new(process))
            }
            Err(e) => {
                warn!(parent: &span, error = %e, "launch failed, terminating process");
                if let Err(kill_err) = process.kill().await {
                    warn!(parent: &span, error = %kill_err, "failed to kill process after launch failure");
                }
                let _ = tokio::time::timeout(REAP_GRACE, process.wait()).await;
                Err(e)
            }
        }
    }
}

/// A running Firecracker process
pub struct FirecrackerProcess {
    pid: Option<u32>,
    api: ApiClient,
    metrics_path: Option<PathBuf>,
    exit_rx: watch::Receiver<ExitSlot>,
    output: Option<mpsc::Receiver<LogEntry>>,
}

impl FirecrackerProcess {
    fn exit_status(&self) -> ExitSlot {
        self.exit_rx.borrow().clone()
    }

    async fn wait_for_socket(&self) -> Result<(), HypervisorError> {
        loop {
            if let Some(exit) = self.exit_status() {
                let detail = match exit {
                    Ok(report) => format!("{report:?}"),
                    Err(e) => e,
                };
                return Err(HypervisorError::Launch(format!(
                    "process exited before its control socket was ready ({detail})"
                )));
            }
            if UnixStream::connect(&self.api.socket_path).await.is_ok() {
                return Ok(());
            }
            tokio::time::sleep(SOCKET_POLL).await;
        }
    }

    /// Pushes the configuration and starts the instance; returns the metrics
    /// file in use, if metrics could be configured
    async fn configure(&self, request: &LaunchRequest, span: &Span) -> Result<Option<PathBuf>, HypervisorError> {
        self.wait_for_socket().await?;
        debug!(parent: span, "control socket ready");

        let spec = &request.spec;

        if !spec.log_level.is_empty() {
            self.api
                .put("/logger", &json!({ "level": spec.log_level, "show_level": true }))
                .await?;
        }

        let plan = &request.plan;
        let metrics_path = match create_metrics_file(&plan.metrics_host_path, plan.metrics_owner).await {
            Ok(()) => {
                self.api
                    .put("/metrics", &json!({ "metrics_path": spec.metrics_path }))
                    .await?;
                Some(plan.metrics_host_path.clone())
            }
            Err(e) => {
                warn!(parent: span, error = %e, "metrics file unavailable, counters will read zero");
                None
            }
        };

        self.api.put("/boot-source", &spec.boot_source).await?;

        for drive in &spec.drives {
            self.api.put(&format!("/drives/{}", drive.drive_id), drive).await?;
        }

        for nic in &spec.network_interfaces {
            self.api
                .put(&format!("/network-interfaces/{}", nic.iface_id), nic)
                .await?;
        }

        let mmds_ifaces: Vec<&str> = spec
            .network_interfaces
            .iter()
            .filter(|nic| nic.allow_mmds)
            .map(|nic| nic.iface_id.as_str())
            .collect();
        if !mmds_ifaces.is_empty() {
            self.api
                .put("/mmds/config", &json!({ "network_interfaces": mmds_ifaces }))
                .await?;
        }

        for vsock in &spec.vsock {
            self.api.put("/vsock", vsock).await?;
        }

        self.api.put("/machine-config", &spec.machine_config).await?;
        self.api.action("InstanceStart").await?;

        Ok(metrics_path)
    }
}

#[async_trait]
impl VmProcess for FirecrackerProcess {
    fn pid(&self) -> Option<u32> {
        self.pid
    }

    fn take_output(&mut self) -> Option<mpsc::Receiver<LogEntry>> {
        self.output.take()
    }

    async fn shutdown(&self) -> Result<(), HypervisorError> {
        self.api.action("SendCtrlAltDel").await
    }

    async fn kill(&self) -> Result<(), HypervisorError> {
        if self.exit_status().is_some() {
            return Ok(());
        }
        let pid = self
            .pid
            .ok_or_else(|| HypervisorError::Signal("process id unknown".to_string()))?;
        let pid = i32::try_from(pid).map_err(|_| HypervisorError::Signal(format!("pid {pid} out of range")))?;

        match signal::kill(Pid::from_raw(pid), Signal::SIGKILL) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(e) => Err(HypervisorError::Signal(e.to_string())),
        }
    }

    async fn wait(&self) -> Result<ExitReport, HypervisorError> {
        let mut rx = self.exit_rx.clone();
        loop {
            let current = rx.borrow_and_update().clone();
            if let Some(result) = current {
                return result.map_err(HypervisorError::Wait);
            }
            if rx.changed().await.is_err() {
                return Err(HypervisorError::Wait("reaper ended without a status".to_string()));
            }
        }
    }

    async fn metrics(&self) -> Result<MetricsSample, HypervisorError> {
        let path = match &self.metrics_path {
            Some(path) => path,
            None => return Ok(MetricsSample::default()),
        };

        self.api.action("FlushMetrics").await?;

        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| HypervisorError::Metrics(format!("{}: {e}", path.display())))?;

        match content.lines().rev().find(|line| !line.trim().is_empty()) {
            Some(line) => parse_metrics_line(line),
            None => Ok(MetricsSample::default()),
        }
    }
}

/// Creates an empty metrics file, handing it to `owner` when given
async fn create_metrics_file(path: &Path, owner: Option<(u32, u32)>) -> std::io::Result<()> {
    tokio::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(path)
        .await?;
    if let Some((uid, gid)) = owner {
        unistd::chown(path, Some(Uid::from_raw(uid)), Some(Gid::from_raw(gid)))?;
    }
    Ok(())
}

async fn reap(
    mut child: tokio::process::Child,
    cancel: CancelToken,
    exit_tx: watch::Sender<ExitSlot>,
    span: Span,
) {
    let status = tokio::select! {
        status = child.wait() => status,
        _ = cancel.cancelled() => {
            debug!(parent: &span, "run cancelled, killing process");
            if let Err(e) = child.start_kill() {
                debug!(parent: &span, error = %e, "kill after cancel failed");
            }
            child.wait().await
        }
    };

    let report = status.map(exit_report).map_err(|e| e.to_string());
    match &report {
        Ok(r) => debug!(parent: &span, code = ?r.code, signal = ?r.signal, "process reaped"),
        Err(e) => warn!(parent: &span, error = %e, "failed to reap process"),
    }
    exit_tx.send_replace(Some(report));
}

fn exit_report(status: ExitStatus) -> ExitReport {
    ExitReport {
        code: status.code(),
        signal: status.signal(),
    }
}

async fn read_output<R>(reader: R, source: &'static str, tx: mpsc::Sender<LogEntry>)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if line.trim().is_empty() {
            continue;
        }
        let entry = LogEntry::new(parse_level(&line), line).with_source(source);
        if tx.send(entry).await.is_err() {
            break;
        }
    }
}

/// Level from Firecracker's `[instance:thread:LEVEL:origin]` prefix
pub fn parse_level(line: &str) -> &'static str {
    if line.contains(":ERROR") {
        "error"
    } else if line.contains(":WARN") {
        "warn"
    } else if line.contains(":DEBUG") || line.contains(":TRACE") {
        "debug"
    } else {
        "info"
    }
}

/// Extracts counters from one line of Firecracker's metrics output
///
/// Firecracker emits no CPU utilisation figure, so `cpu_usage` stays zero.
pub fn parse_metrics_line(line: &str) -> Result<MetricsSample, HypervisorError> {
    let value: serde_json::Value =
        serde_json::from_str(line).map_err(|e| HypervisorError::Metrics(e.to_string()))?;

    let counter = |group: &str, name: &str| value[group][name].as_u64().unwrap_or(0);

    Ok(MetricsSample {
        cpu_usage: 0.0,
        disk_read_bytes: counter("block", "read_bytes"),
        disk_write_bytes: counter("block", "write_bytes"),
        net_rx_bytes: counter("net", "rx_bytes_count"),
        net_tx_bytes: counter("net", "tx_bytes_count"),
    })
}

/// Minimal HTTP/1.1 client over the control socket
struct ApiClient {
    socket_path: PathBuf,
    timeout: Duration,
}

impl ApiClient {
    fn new(socket_path: PathBuf, timeout: Duration) -> Self {
        Self { socket_path, timeout }
    }

    async fn action(&self, action_type: &str) -> Result<(), HypervisorError> {
        self.put("/actions", &json!({ "action_type": action_type })).await
    }

    async fn put<T: Serialize + ?Sized>(&self, endpoint: &str, body: &T) -> Result<(), HypervisorError> {
        let api_err = |error: String| HypervisorError::Api {
            endpoint: endpoint.to_string(),
            error,
        };

        let payload = serde_json::to_vec(body).map_err(|e| api_err(e.to_string()))?;

        tokio::time::timeout(self.timeout, self.send(Method::PUT, endpoint, payload))
            .await
            .map_err(|_| api_err(format!("timed out after {:?}", self.timeout)))?
            .map_err(api_err)
    }

    async fn send(&self, method: Method, endpoint: &str, payload: Vec<u8>) -> Result<(), String> {
        let stream = UnixStream::connect(&self.socket_path)
            .await
            .map_err(|e| format!("connect {}: {e}", self.socket_path.display()))?;

        let (mut sender, connection) = conn::handshake(stream).await.map_err(|e| e.to_string())?;
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                debug!(error = %e, "control connection closed with error");
            }
        });

        let request = Request::builder()
            .method(method)
            .uri(endpoint)
            .header(hyper::header::HOST, "localhost")
            .header(hyper::header::ACCEPT, "application/json")
            .header(hyper::header::CONTENT_TYPE, "application/json")
            .body(Body::from(payload))
            .map_err(|e| e.to_string())?;

        let response = sender.send_request(request).await.map_err(|e| e.to_string())?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let body = hyper::body::to_bytes(response.into_body())
            .await
            .map(|b| String::from_utf8_lossy(&b).into_owned())
            .unwrap_or_default();
        Err(format!("{status}: {body}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::machine::{tests::sample_config, LaunchPlan};
    use std::os::unix::fs::PermissionsExt;

    #[test]
    fn levels_follow_firecracker_tags() {
        assert_eq!(parse_level("2024-01-01T00:00:00 [fc:main:ERROR:src/main.rs:1] boom"), "error");
        assert_eq!(parse_level("[fc:main:WARN:x] careful"), "warn");
        assert_eq!(parse_level("[fc:main:DEBUG:x] detail"), "debug");
        assert_eq!(parse_level("Linux version 6.1"), "info");
    }

    #[test]
    fn metrics_line_is_parsed() {
        let line = r#"{"utc_timestamp_ms":1,"block":{"read_bytes":10,"write_bytes":20},"net":{"rx_bytes_count":30,"tx_bytes_count":40}}"#;
        let sample = parse_metrics_line(line).unwrap();
        assert_eq!(sample.disk_read_bytes, 10);
        assert_eq!(sample.disk_write_bytes, 20);
        assert_eq!(sample.net_rx_bytes, 30);
        assert_eq!(sample.net_tx_bytes, 40);

        let sparse = parse_metrics_line(r#"{"block":{}}"#).unwrap();
        assert_eq!(sparse, MetricsSample::default());
        assert!(parse_metrics_line("not json").is_err());
    }

    fn script(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("fake-firecracker");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn request(binary: &Path, dir: &Path, timeout: Duration) -> LaunchRequest {
        let plan = LaunchPlan::direct(binary, "test-vm", dir);
        let spec = sample_config("test").launch_spec(&plan.metrics_api_path);
        LaunchRequest {
            vm_id: "test-vm".into(),
            plan,
            spec,
            launch_timeout: timeout,
            request_timeout: Duration::from_millis(200),
        }
    }

    #[tokio::test]
    async fn metrics_file_is_created_for_its_owner() {
        use std::os::unix::fs::MetadataExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metrics.json");
        let (uid, gid) = (unistd::getuid().as_raw(), unistd::getgid().as_raw());

        create_metrics_file(&path, Some((uid, gid))).await.unwrap();
        let meta = std::fs::metadata(&path).unwrap();
        assert_eq!((meta.uid(), meta.gid()), (uid, gid));
        assert_eq!(meta.len(), 0);

        // the chroot must already exist
        let missing = dir.path().join("jail/root/metrics.json");
        assert!(create_metrics_file(&missing, Some((uid, gid))).await.is_err());
    }

    #[tokio::test]
    async fn early_exit_fails_the_launch() {
        let dir = tempfile::tempdir().unwrap();
        let binary = script(dir.path(), "echo starting; exit 3");

        let hv = Firecracker::new(Logger::new("fc-test"));
        let err = hv
            .launch(request(&binary, dir.path(), Duration::from_secs(5)), CancelToken::new())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, HypervisorError::Launch(_)), "{err}");
    }

    #[tokio::test]
    async fn silent_process_times_out_and_is_killed() {
        let dir = tempfile::tempdir().unwrap();
        let binary = script(dir.path(), "exec sleep 30");

        let hv = Firecracker::new(Logger::new("fc-test"));
        let err = hv
            .launch(request(&binary, dir.path(), Duration::from_millis(200)), CancelToken::new())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, HypervisorError::LaunchTimeout(_)), "{err}");
    }
}
