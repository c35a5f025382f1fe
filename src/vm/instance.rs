// src/vm/instance.rs

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::vm::machine::VmConfig;

/// Lifecycle status of a VM
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VmStatus {
    Stopped,
    Starting,
    Running,
    Stopping,
    Error,
}

impl VmStatus {
    /// Whether the state machine allows moving from `self` to `next`
    ///
    /// `Stopped -> Starting -> Running -> Stopping -> Stopped`, any live state
    /// may fail into `Error`, and `Error` recovers only through `Starting`.
    /// A live state may also drop straight to `Stopped` when the process exits
    /// on its own.
    pub fn can_transition_to(self, next: VmStatus) -> bool {
        use VmStatus::*;
        matches!(
            (self, next),
            (Stopped, Starting)
                | (Error, Starting)
                | (Starting, Running)
                | (Running, Stopping)
                | (Stopping, Stopped)
                | (Starting, Stopped)
                | (Running, Stopped)
                | (Starting, Error)
                | (Running, Error)
                | (Stopping, Error)
        )
    }

    /// Whether the status implies a live process
    pub fn is_active(self) -> bool {
        matches!(self, VmStatus::Starting | VmStatus::Running | VmStatus::Stopping)
    }
}

impl fmt::Display for VmStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            VmStatus::Stopped => "stopped",
            VmStatus::Starting => "starting",
            VmStatus::Running => "running",
            VmStatus::Stopping => "stopping",
            VmStatus::Error => "error",
        };
        f.write_str(s)
    }
}

/// Persisted VM record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VmRecord {
    /// Unique identity
    pub id: String,

    /// Human name
    pub name: String,

    /// Declared configuration
    pub config: VmConfig,

    /// Current status
    pub status: VmStatus,

    /// Last failure message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Creation time
    pub created_at: DateTime<Utc>,

    /// Last successful start
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,

    /// Last stop
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stopped_at: Option<DateTime<Utc>>,

    /// Process id of the current run
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,

    /// Control socket of the current run
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub socket_path: Option<PathBuf>,
}

impl VmRecord {
    /// New stopped record with a fresh identity
    pub fn new(config: VmConfig) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: config.name.clone(),
            config,
            status: VmStatus::Stopped,
            error: None,
            created_at: Utc::now(),
            started_at: None,
            stopped_at: None,
            pid: None,
            socket_path: None,
        }
    }
}

/// Partial update of a stopped VM
///
/// `config` replaces the declared configuration as a whole; there is no
/// field-level merge.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VmUpdate {
    /// New name
    #[serde(default)]
    pub name: Option<String>,

    /// New declared configuration
    #[serde(default)]
    pub config: Option<VmConfig>,
}

/// Point-in-time counters for a running VM
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VmMetrics {
    pub timestamp: DateTime<Utc>,
    pub uptime_seconds: u64,
    pub vcpu_count: u32,
    pub memory_total_mib: u64,
    pub cpu_usage: f64,
    pub disk_read_bytes: u64,
    pub disk_write_bytes: u64,
    pub net_rx_bytes: u64,
    pub net_tx_bytes: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::machine::tests::sample_config;

    #[test]
    fn new_records_are_stopped_with_unique_ids() {
        let a = VmRecord::new(sample_config("a"));
        let b = VmRecord::new(sample_config("a"));
        assert_eq!(a.status, VmStatus::Stopped);
        assert_eq!(a.name, "a");
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn state_machine_edges() {
        use VmStatus::*;
        assert!(Stopped.can_transition_to(Starting));
        assert!(Error.can_transition_to(Starting));
        assert!(Running.can_transition_to(Stopping));
        assert!(Stopping.can_transition_to(Stopped));
        assert!(!Stopped.can_transition_to(Running));
        assert!(!Error.can_transition_to(Running));
        assert!(!Stopped.can_transition_to(Error));
    }

    #[test]
    fn status_serialises_lowercase() {
        assert_eq!(serde_json::to_string(&VmStatus::Running).unwrap(), "\"running\"");
        assert_eq!(VmStatus::Stopping.to_string(), "stopping");
        assert!(VmStatus::Starting.is_active());
        assert!(!VmStatus::Error.is_active());
    }
}
