// Virtual machine core

pub mod cancel;
pub mod firecracker;
pub mod hypervisor;
pub mod instance;
pub mod logs;
pub mod machine;
pub mod supervisor;

// Re-exports
pub use cancel::CancelToken;
pub use firecracker::Firecracker;
pub use hypervisor::{ExitReport, Hypervisor, HypervisorError, LaunchRequest, MetricsSample, VmProcess};
pub use instance::{VmMetrics, VmRecord, VmStatus, VmUpdate};
pub use logs::{LogEngine, LogEntry, LogFilter, Severity, Subscription, SubscriptionId};
pub use machine::{Drive, JailerConfig, LaunchPlan, LaunchSpec, NetworkInterface, VmConfig, VsockDevice};
pub use supervisor::{Supervisor, SupervisorSettings, VmError};
