// Shared fixtures for integration tests

#![allow(dead_code)]

use std::os::unix::fs::PermissionsExt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use agni::config::{ConfigManager, ServiceConfig, StorageBackend};
use agni::service::{Caller, Service};
use agni::storage::Store;
use agni::vm::{
    CancelToken, ExitReport, Hypervisor, HypervisorError, LaunchRequest, LogEntry, MetricsSample,
    VmConfig, VmProcess,
};
use agni::vm::{Drive, NetworkInterface};
use async_trait::async_trait;
use secrecy::SecretString;
use tokio::sync::{mpsc, watch};

pub const CLIENT: &str = "127.0.0.1";
pub const ADMIN: (&str, &str) = ("admin", "correct-horse-battery");

/// A launched fake process, as seen from the test
pub struct FakeRun {
    pub request: LaunchRequest,
    pub exit: watch::Sender<Option<ExitReport>>,
    pub output: mpsc::Sender<LogEntry>,
}

impl FakeRun {
    pub fn crash(&self, code: i32) {
        self.exit.send_replace(Some(ExitReport {
            code: Some(code),
            signal: None,
        }));
    }
}

struct FakeProcess {
    output: Option<mpsc::Receiver<LogEntry>>,
    exit: watch::Sender<Option<ExitReport>>,
}

#[async_trait]
impl VmProcess for FakeProcess {
    fn pid(&self) -> Option<u32> {
        Some(31337)
    }

    fn take_output(&mut self) -> Option<mpsc::Receiver<LogEntry>> {
        self.output.take()
    }

    async fn shutdown(&self) -> Result<(), HypervisorError> {
        self.exit.send_replace(Some(ExitReport::success()));
        Ok(())
    }

    async fn kill(&self) -> Result<(), HypervisorError> {
        self.exit.send_replace(Some(ExitReport {
            code: None,
            signal: Some(9),
        }));
        Ok(())
    }

    async fn wait(&self) -> Result<ExitReport, HypervisorError> {
        let mut rx = self.exit.subscribe();
        loop {
            if let Some(report) = *rx.borrow_and_update() {
                return Ok(report);
            }
            if rx.changed().await.is_err() {
                return Err(HypervisorError::Wait("sender dropped".into()));
            }
        }
    }

    async fn metrics(&self) -> Result<MetricsSample, HypervisorError> {
        Ok(MetricsSample::default())
    }
}

/// In-process hypervisor whose runs the test controls
#[derive(Default)]
pub struct FakeHypervisor {
    pub launches: AtomicUsize,
    pub fail_next: Mutex<Option<String>>,
    pub runs: Mutex<Vec<Arc<FakeRun>>>,
}

impl FakeHypervisor {
    pub fn last_run(&self) -> Arc<FakeRun> {
        Arc::clone(self.runs.lock().unwrap().last().expect("no launch yet"))
    }

    pub fn launch_count(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Hypervisor for FakeHypervisor {
    async fn launch(
        &self,
        request: LaunchRequest,
        cancel: CancelToken,
    ) -> Result<Box<dyn VmProcess>, HypervisorError> {
        self.launches.fetch_add(1, Ordering::SeqCst);
        if cancel.is_cancelled() {
            return Err(HypervisorError::Cancelled);
        }
        if let Some(reason) = self.fail_next.lock().unwrap().take() {
            return Err(HypervisorError::Launch(reason));
        }

        let (exit, _) = watch::channel(None);
        let (output_tx, output_rx) = mpsc::channel(32);
        self.runs.lock().unwrap().push(Arc::new(FakeRun {
            request,
            exit: exit.clone(),
            output: output_tx,
        }));

        Ok(Box::new(FakeProcess {
            output: Some(output_rx),
            exit,
        }))
    }
}

pub struct Harness {
    pub service: Service,
    pub hypervisor: Arc<FakeHypervisor>,
    pub dir: tempfile::TempDir,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(|_| {})
    }

    pub fn with_config(adjust: impl FnOnce(&mut ServiceConfig)) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let binary = dir.path().join("firecracker");
        std::fs::write(&binary, "#!/bin/sh\nexit 0\n").unwrap();
        std::fs::set_permissions(&binary, std::fs::Permissions::from_mode(0o755)).unwrap();

        let mut config = ConfigManager::default_config();
        config.data_dir = dir.path().to_path_buf();
        config.storage.backend = StorageBackend::Memory;
        config.hypervisor.binary = Some(binary);
        config.hypervisor.socket_dir = dir.path().join("sockets");
        // cheap hashing keeps the suite fast
        config.auth.password_hashing.memory_kib = 1024;
        config.auth.password_hashing.iterations = 1;
        adjust(&mut config);

        let hypervisor = Arc::new(FakeHypervisor::default());
        let store = Store::open(&config).unwrap();
        let service = Service::from_parts(
            &config,
            store,
            hypervisor.clone(),
            SecretString::new("integration-test-secret".into()),
        )
        .unwrap();

        Self {
            service,
            hypervisor,
            dir,
        }
    }

    /// Runs first-time setup and returns an admin token
    pub async fn admin_token(&self) -> String {
        self.service.setup(CLIENT, ADMIN.0, ADMIN.1).await.unwrap();
        self.service.login(CLIENT, ADMIN.0, ADMIN.1).await.unwrap().token
    }
}

pub fn caller(token: &str) -> Caller<'_> {
    Caller::new(CLIENT, token)
}

pub fn vm_config(name: &str) -> VmConfig {
    VmConfig {
        name: name.to_string(),
        kernel_path: "/images/vmlinux".into(),
        kernel_args: "console=ttyS0".to_string(),
        initrd_path: None,
        root_drive: Drive {
            id: None,
            path: "/images/rootfs.ext4".into(),
            read_only: false,
            part_uuid: None,
        },
        additional_drives: Vec::new(),
        cpus: 1,
        memory_mib: 128,
        cpu_template: None,
        disable_smt: false,
        network_interfaces: vec![NetworkInterface {
            device: "tap0".to_string(),
            mac_address: "AA:FC:00:00:00:02".to_string(),
            allow_mmds: true,
        }],
        vsock_devices: Vec::new(),
        metadata: None,
        jailer: None,
        log_level: "Info".to_string(),
    }
}

/// Polls until `check` holds or two seconds pass
pub async fn eventually<F>(mut check: F)
where
    F: FnMut() -> bool,
{
    tokio::time::timeout(Duration::from_secs(2), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}
