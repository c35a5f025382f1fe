// src/vm/hypervisor.rs

//! Seam between the supervisor and the external hypervisor process.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::error::ErrorKind;
use crate::vm::cancel::CancelToken;
use crate::vm::logs::LogEntry;
use crate::vm::machine::{LaunchPlan, LaunchSpec};

/// Binary looked up on `PATH` when none is configured
pub const DEFAULT_BINARY: &str = "firecracker";

/// Jailer binary looked up on `PATH` when none is configured
pub const DEFAULT_JAILER_BINARY: &str = "jailer";

/// Everything needed to launch one VM run
#[derive(Debug, Clone)]
pub struct LaunchRequest {
    /// VM identity
    pub vm_id: String,

    /// Process invocation and host paths
    pub plan: LaunchPlan,

    /// Hypervisor configuration payloads
    pub spec: LaunchSpec,

    /// Upper bound for the process to accept its configuration
    pub launch_timeout: Duration,

    /// Upper bound for a single control request
    pub request_timeout: Duration,
}

/// How a process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitReport {
    /// Exit code, if it exited normally
    pub code: Option<i32>,

    /// Terminating signal, if any
    pub signal: Option<i32>,
}

impl ExitReport {
    /// Clean zero exit
    pub fn success() -> Self {
        Self {
            code: Some(0),
            signal: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.code == Some(0)
    }
}

/// Raw counters read from the hypervisor's metrics channel
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct MetricsSample {
    pub cpu_usage: f64,
    pub disk_read_bytes: u64,
    pub disk_write_bytes: u64,
    pub net_rx_bytes: u64,
    pub net_tx_bytes: u64,
}

/// Hypervisor process errors
#[derive(Debug, Error)]
pub enum HypervisorError {
    #[error("Hypervisor binary {path} is invalid: {reason}")]
    ExecutableInvalid {
        path: String,
        reason: String,
    },

    #[error("Failed to launch hypervisor: {0}")]
    Launch(String),

    #[error("Hypervisor did not become ready within {0:?}")]
    LaunchTimeout(Duration),

    #[error("Launch cancelled")]
    Cancelled,

    #[error("Hypervisor API request {endpoint} failed: {error}")]
    Api {
        endpoint: String,
        error: String,
    },

    #[error("Failed to signal hypervisor process: {0}")]
    Signal(String),

    #[error("Failed to wait for hypervisor process: {0}")]
    Wait(String),

    #[error("Failed to read hypervisor metrics: {0}")]
    Metrics(String),
}

impl HypervisorError {
    /// Error classification
    pub fn kind(&self) -> ErrorKind {
        match self {
            HypervisorError::ExecutableInvalid { .. } => ErrorKind::ExecutableInvalid,
            _ => ErrorKind::ExternalProcess,
        }
    }
}

/// Launches hypervisor processes
#[async_trait]
pub trait Hypervisor: Send + Sync {
    /// Starts a process and returns once it has accepted its configuration
    /// and begun running
    ///
    /// On error no process is left behind. `cancel` aborts the launch and,
    /// once launched, terminates the process.
    async fn launch(
        &self,
        request: LaunchRequest,
        cancel: CancelToken,
    ) -> Result<Box<dyn VmProcess>, HypervisorError>;
}

/// A live hypervisor process
#[async_trait]
pub trait VmProcess: Send + Sync {
    /// OS process id, if known
    fn pid(&self) -> Option<u32>;

    /// Output stream; yields `Some` at most once
    fn take_output(&mut self) -> Option<mpsc::Receiver<LogEntry>>;

    /// Asks the guest to shut down
    async fn shutdown(&self) -> Result<(), HypervisorError>;

    /// Terminates the process immediately
    async fn kill(&self) -> Result<(), HypervisorError>;

    /// Resolves when the process has exited; callable any number of times
    async fn wait(&self) -> Result<ExitReport, HypervisorError>;

    /// Current counters
    async fn metrics(&self) -> Result<MetricsSample, HypervisorError>;
}

/// Resolves the binary to run: the configured path, else `default_name` on `PATH`
pub fn resolve_executable(configured: Option<&Path>, default_name: &str) -> Result<PathBuf, HypervisorError> {
    let path = match configured {
        Some(path) => path.to_path_buf(),
        None => lookup_path(default_name).ok_or_else(|| HypervisorError::ExecutableInvalid {
            path: default_name.to_string(),
            reason: "not found on PATH".to_string(),
        })?,
    };
    validate_executable(&path)?;
    Ok(path)
}

/// The file must exist, must not be a directory and must carry an execute bit
pub fn validate_executable(path: &Path) -> Result<(), HypervisorError> {
    use std::os::unix::fs::PermissionsExt;

    let invalid = |reason: &str| HypervisorError::ExecutableInvalid {
        path: path.display().to_string(),
        reason: reason.to_string(),
    };

    let metadata = match std::fs::metadata(path) {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Err(invalid("does not exist")),
        Err(e) => return Err(invalid(&format!("cannot stat: {e}"))),
    };

    if metadata.is_dir() {
        return Err(invalid("is a directory"));
    }

    if metadata.permissions().mode() & 0o111 == 0 {
        return Err(invalid("is not executable"));
    }

    Ok(())
}

fn lookup_path(name: &str) -> Option<PathBuf> {
    let paths = std::env::var_os("PATH")?;
    std::env::split_paths(&paths)
        .map(|dir| dir.join(name))
        .find(|candidate| validate_executable(candidate).is_ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    fn file_with_mode(dir: &Path, name: &str, mode: u32) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, "#!/bin/sh\n").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(mode)).unwrap();
        path
    }

    #[test]
    fn executable_validation() {
        let dir = tempfile::tempdir().unwrap();
        let good = file_with_mode(dir.path(), "fc", 0o755);
        let plain = file_with_mode(dir.path(), "plain", 0o644);

        assert!(validate_executable(&good).is_ok());
        assert_eq!(
            validate_executable(&plain).unwrap_err().kind(),
            ErrorKind::ExecutableInvalid
        );
        assert!(validate_executable(dir.path()).is_err());
        assert!(validate_executable(&dir.path().join("missing")).is_err());
    }

    #[test]
    fn configured_path_wins() {
        let dir = tempfile::tempdir().unwrap();
        let good = file_with_mode(dir.path(), "fc", 0o700);
        assert_eq!(resolve_executable(Some(&good), DEFAULT_BINARY).unwrap(), good);

        let err = resolve_executable(Some(&dir.path().join("nope")), DEFAULT_BINARY).unwrap_err();
        assert!(matches!(err, HypervisorError::ExecutableInvalid { .. }));
    }

    #[test]
    fn unknown_binary_is_not_on_path() {
        let err = resolve_executable(None, "agni-definitely-not-a-real-binary").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ExecutableInvalid);
    }
}
