// src/vm/machine.rs

//! Declared VM configuration and its translation into launch parameters.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Socket path the jailed process listens on, relative to its chroot
pub const JAILED_SOCKET_PATH: &str = "/run/firecracker.socket";

/// Metrics file name, created next to the control socket
const METRICS_FILE: &str = "metrics.json";

/// Declared configuration of a VM
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VmConfig {
    /// Human name
    pub name: String,

    /// Guest kernel image
    pub kernel_path: PathBuf,

    /// Kernel command line
    #[serde(default)]
    pub kernel_args: String,

    /// Optional initial ramdisk
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initrd_path: Option<PathBuf>,

    /// Root block device
    pub root_drive: Drive,

    /// Further block devices
    #[serde(default)]
    pub additional_drives: Vec<Drive>,

    /// vCPU count
    pub cpus: u32,

    /// Guest memory in MiB
    pub memory_mib: u64,

    /// CPU template name (e.g. `T2`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_template: Option<String>,

    /// Disable simultaneous multithreading
    #[serde(default)]
    pub disable_smt: bool,

    /// Host tap devices
    #[serde(default)]
    pub network_interfaces: Vec<NetworkInterface>,

    /// Vsock channels
    #[serde(default)]
    pub vsock_devices: Vec<VsockDevice>,

    /// Free-form JSON metadata
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<String>,

    /// Run the hypervisor under the jailer
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jailer: Option<JailerConfig>,

    /// Hypervisor log level
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_log_level() -> String {
    "Info".to_string()
}

/// Block device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Drive {
    /// Drive id; assigned positionally at launch
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    /// Backing file on the host
    pub path: PathBuf,

    /// Attach read-only
    #[serde(default)]
    pub read_only: bool,

    /// Partition UUID for the root device
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub part_uuid: Option<String>,
}

/// Network interface backed by a host tap device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkInterface {
    /// Host device name
    pub device: String,

    /// Guest MAC address
    pub mac_address: String,

    /// Allow access to the metadata service
    #[serde(default)]
    pub allow_mmds: bool,
}

/// Vsock channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VsockDevice {
    /// Host-side Unix socket
    pub path: PathBuf,

    /// Guest context id
    pub cid: u32,
}

/// Jailer parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JailerConfig {
    /// Jailer binary; falls back to the configured default
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub binary: Option<PathBuf>,

    /// Hypervisor binary copied into the jail
    pub exec_file: PathBuf,

    /// Jail id
    pub id: String,

    /// User to drop to
    pub uid: u32,

    /// Group to drop to
    pub gid: u32,

    /// NUMA node to pin to
    #[serde(default)]
    pub numa_node: u32,

    /// Base directory for the chroot
    pub chroot_base_dir: PathBuf,

    /// Detach from the terminal
    #[serde(default)]
    pub daemonize: bool,
}

impl JailerConfig {
    /// Host path of the jail's root directory
    pub fn chroot_root(&self) -> PathBuf {
        let exec_name = self
            .exec_file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "firecracker".to_string());
        self.chroot_base_dir.join(exec_name).join(&self.id).join("root")
    }
}

impl VmConfig {
    /// Checks the declared configuration before it is persisted
    pub fn validate(&self) -> Result<(), String> {
        if self.name.trim().is_empty() {
            return Err("VM name is required".to_string());
        }

        if self.cpus == 0 {
            return Err("cpus must be at least 1".to_string());
        }

        if self.memory_mib == 0 {
            return Err("memory_mib must be at least 1".to_string());
        }

        if self.kernel_path.as_os_str().is_empty() {
            return Err("kernel_path is required".to_string());
        }

        if self.root_drive.path.as_os_str().is_empty() {
            return Err("root_drive.path is required".to_string());
        }

        if self.additional_drives.iter().any(|d| d.path.as_os_str().is_empty()) {
            return Err("drive path is required".to_string());
        }

        for nic in &self.network_interfaces {
            if nic.device.is_empty() || nic.mac_address.is_empty() {
                return Err("network interface needs a device and a MAC address".to_string());
            }
        }

        for vsock in &self.vsock_devices {
            if vsock.path.as_os_str().is_empty() {
                return Err("vsock device path is required".to_string());
            }
            // 0-2 are reserved by the vsock address family
            if vsock.cid < 3 {
                return Err(format!("vsock cid {} is reserved", vsock.cid));
            }
        }

        if let Some(metadata) = &self.metadata {
            serde_json::from_str::<serde_json::Value>(metadata)
                .map_err(|_| "metadata is not valid JSON".to_string())?;
        }

        if let Some(jailer) = &self.jailer {
            if jailer.id.is_empty() {
                return Err("jailer id is required".to_string());
            }
            if jailer.chroot_base_dir.as_os_str().is_empty() {
                return Err("jailer chroot_base_dir is required".to_string());
            }
        }

        Ok(())
    }

    /// Translates the declared configuration into hypervisor API payloads
    pub fn launch_spec(&self, metrics_path: &str) -> LaunchSpec {
        let mut drives = Vec::with_capacity(1 + self.additional_drives.len());
        drives.push(DriveSpec {
            drive_id: "1".to_string(),
            path_on_host: self.root_drive.path.clone(),
            is_root_device: true,
            is_read_only: self.root_drive.read_only,
            partuuid: self.root_drive.part_uuid.clone(),
        });
        drives.extend(self.additional_drives.iter().enumerate().map(|(i, d)| DriveSpec {
            drive_id: (i + 2).to_string(),
            path_on_host: d.path.clone(),
            is_root_device: false,
            is_read_only: d.read_only,
            partuuid: None,
        }));

        let network_interfaces = self
            .network_interfaces
            .iter()
            .enumerate()
            .map(|(i, nic)| NetworkInterfaceSpec {
                iface_id: format!("eth{i}"),
                host_dev_name: nic.device.clone(),
                guest_mac: nic.mac_address.clone(),
                allow_mmds: nic.allow_mmds,
            })
            .collect();

        let vsock = self
            .vsock_devices
            .iter()
            .enumerate()
            .map(|(i, v)| VsockSpec {
                vsock_id: format!("vsock{i}"),
                guest_cid: v.cid,
                uds_path: v.path.clone(),
            })
            .collect();

        LaunchSpec {
            boot_source: BootSource {
                kernel_image_path: self.kernel_path.clone(),
                boot_args: (!self.kernel_args.is_empty()).then(|| self.kernel_args.clone()),
                initrd_path: self.initrd_path.clone(),
            },
            drives,
            network_interfaces,
            vsock,
            machine_config: MachineConfig {
                vcpu_count: self.cpus,
                mem_size_mib: self.memory_mib,
                smt: !self.disable_smt,
                cpu_template: self.cpu_template.clone(),
            },
            metrics_path: metrics_path.to_string(),
            log_level: self.log_level.clone(),
        }
    }
}

/// `PUT /boot-source` body
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BootSource {
    pub kernel_image_path: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub boot_args: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub initrd_path: Option<PathBuf>,
}

/// `PUT /drives/{id}` body
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DriveSpec {
    pub drive_id: String,
    pub path_on_host: PathBuf,
    pub is_root_device: bool,
    pub is_read_only: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub partuuid: Option<String>,
}

/// `PUT /network-interfaces/{id}` body
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NetworkInterfaceSpec {
    pub iface_id: String,
    pub host_dev_name: String,
    pub guest_mac: String,
    #[serde(skip)]
    pub allow_mmds: bool,
}

/// `PUT /vsock` body
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VsockSpec {
    pub vsock_id: String,
    pub guest_cid: u32,
    pub uds_path: PathBuf,
}

/// `PUT /machine-config` body
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MachineConfig {
    pub vcpu_count: u32,
    pub mem_size_mib: u64,
    pub smt: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu_template: Option<String>,
}

/// Everything the hypervisor needs before `InstanceStart`
#[derive(Debug, Clone, PartialEq)]
pub struct LaunchSpec {
    pub boot_source: BootSource,
    pub drives: Vec<DriveSpec>,
    pub network_interfaces: Vec<NetworkInterfaceSpec>,
    pub vsock: Vec<VsockSpec>,
    pub machine_config: MachineConfig,
    /// Metrics file as seen by the hypervisor process
    pub metrics_path: String,
    pub log_level: String,
}

/// Process invocation plus the host-visible paths it will use
#[derive(Debug, Clone, PartialEq)]
pub struct LaunchPlan {
    /// Program to execute
    pub program: PathBuf,

    /// Its arguments
    pub args: Vec<String>,

    /// Control socket as seen from the host
    pub socket_path: PathBuf,

    /// Metrics file as seen from the host
    ///
    /// For jailed plans this lies inside the chroot, which only exists once
    /// the control socket is up, so the file is created after that point.
    pub metrics_host_path: PathBuf,

    /// Metrics file as seen by the hypervisor
    pub metrics_api_path: String,

    /// Owner to hand the metrics file to when the hypervisor drops privileges
    pub metrics_owner: Option<(u32, u32)>,
}

impl LaunchPlan {
    /// Direct invocation: `<binary> --api-sock <socket_dir>/firecracker-<id>.sock`
    pub fn direct(binary: &Path, vm_id: &str, socket_dir: &Path) -> Self {
        let socket_path = socket_path(socket_dir, vm_id);
        let metrics_host_path = socket_dir.join(format!("firecracker-{vm_id}.{METRICS_FILE}"));
        Self {
            program: binary.to_path_buf(),
            args: vec![
                "--api-sock".to_string(),
                socket_path.to_string_lossy().into_owned(),
            ],
            metrics_api_path: metrics_host_path.to_string_lossy().into_owned(),
            socket_path,
            metrics_host_path,
            metrics_owner: None,
        }
    }

    /// Invocation through the jailer; paths live inside the chroot
    pub fn jailed(jailer_binary: &Path, jailer: &JailerConfig) -> Self {
        let root = jailer.chroot_root();
        let mut args = vec![
            "--id".to_string(),
            jailer.id.clone(),
            "--exec-file".to_string(),
            jailer.exec_file.to_string_lossy().into_owned(),
            "--uid".to_string(),
            jailer.uid.to_string(),
            "--gid".to_string(),
            jailer.gid.to_string(),
            "--node".to_string(),
            jailer.numa_node.to_string(),
            "--chroot-base-dir".to_string(),
            jailer.chroot_base_dir.to_string_lossy().into_owned(),
        ];
        if jailer.daemonize {
            args.push("--daemonize".to_string());
        }
        args.extend([
            "--".to_string(),
            "--api-sock".to_string(),
            JAILED_SOCKET_PATH.to_string(),
        ]);

        Self {
            program: jailer_binary.to_path_buf(),
            args,
            socket_path: root.join(JAILED_SOCKET_PATH.trim_start_matches('/')),
            metrics_host_path: root.join(METRICS_FILE),
            metrics_api_path: format!("/{METRICS_FILE}"),
            metrics_owner: Some((jailer.uid, jailer.gid)),
        }
    }
}

/// Control socket path for a VM run without a jailer
pub fn socket_path(socket_dir: &Path, vm_id: &str) -> PathBuf {
    socket_dir.join(format!("firecracker-{vm_id}.sock"))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn sample_config(name: &str) -> VmConfig {
        VmConfig {
            name: name.to_string(),
            kernel_path: PathBuf::from("/images/vmlinux"),
            kernel_args: "console=ttyS0 reboot=k panic=1".to_string(),
            initrd_path: None,
            root_drive: Drive {
                id: None,
                path: PathBuf::from("/images/rootfs.ext4"),
                read_only: false,
                part_uuid: None,
            },
            additional_drives: vec![Drive {
                id: None,
                path: PathBuf::from("/images/data.ext4"),
                read_only: true,
                part_uuid: None,
            }],
            cpus: 2,
            memory_mib: 256,
            cpu_template: None,
            disable_smt: true,
            network_interfaces: vec![NetworkInterface {
                device: "tap0".to_string(),
                mac_address: "AA:FC:00:00:00:01".to_string(),
                allow_mmds: false,
            }],
            vsock_devices: vec![VsockDevice {
                path: PathBuf::from("/tmp/v.sock"),
                cid: 3,
            }],
            metadata: None,
            jailer: None,
            log_level: default_log_level(),
        }
    }

    #[test]
    fn validation_rejects_bad_input() {
        assert!(sample_config("ok").validate().is_ok());

        let mut c = sample_config(" ");
        assert!(c.validate().is_err());

        c = sample_config("x");
        c.cpus = 0;
        assert!(c.validate().is_err());

        c = sample_config("x");
        c.metadata = Some("{not json".into());
        assert_eq!(c.validate().unwrap_err(), "metadata is not valid JSON");

        c = sample_config("x");
        c.metadata = Some(r#"{"role":"db"}"#.into());
        assert!(c.validate().is_ok());

        c = sample_config("x");
        c.vsock_devices[0].cid = 2;
        assert!(c.validate().is_err());
    }

    #[test]
    fn drives_are_numbered_root_first() {
        let spec = sample_config("alpha").launch_spec("/m.json");

        assert_eq!(spec.drives.len(), 2);
        assert_eq!(spec.drives[0].drive_id, "1");
        assert!(spec.drives[0].is_root_device);
        assert_eq!(spec.drives[1].drive_id, "2");
        assert!(!spec.drives[1].is_root_device);
        assert!(spec.drives[1].is_read_only);

        assert!(!spec.machine_config.smt);
        assert_eq!(spec.machine_config.vcpu_count, 2);
        assert_eq!(spec.network_interfaces[0].iface_id, "eth0");
        assert_eq!(spec.vsock[0].guest_cid, 3);
        assert_eq!(spec.boot_source.boot_args.as_deref(), Some("console=ttyS0 reboot=k panic=1"));
    }

    #[test]
    fn direct_plan_uses_socket_dir() {
        let plan = LaunchPlan::direct(Path::new("/usr/bin/firecracker"), "abc", Path::new("/run/agni"));
        assert_eq!(plan.socket_path, PathBuf::from("/run/agni/firecracker-abc.sock"));
        assert_eq!(plan.args, vec!["--api-sock", "/run/agni/firecracker-abc.sock"]);
        assert_eq!(plan.metrics_owner, None);
    }

    #[test]
    fn jailed_plan_points_into_chroot() {
        let jailer = JailerConfig {
            binary: None,
            exec_file: PathBuf::from("/usr/bin/firecracker"),
            id: "vm1".into(),
            uid: 123,
            gid: 100,
            numa_node: 0,
            chroot_base_dir: PathBuf::from("/srv/jailer"),
            daemonize: true,
        };

        let plan = LaunchPlan::jailed(Path::new("/usr/bin/jailer"), &jailer);
        assert_eq!(
            plan.socket_path,
            PathBuf::from("/srv/jailer/firecracker/vm1/root/run/firecracker.socket")
        );
        assert!(plan.args.contains(&"--daemonize".to_string()));
        assert_eq!(&plan.args[plan.args.len() - 3..], &["--", "--api-sock", JAILED_SOCKET_PATH]);
        assert_eq!(plan.metrics_api_path, "/metrics.json");
        assert_eq!(
            plan.metrics_host_path,
            PathBuf::from("/srv/jailer/firecracker/vm1/root/metrics.json")
        );
        assert_eq!(plan.metrics_owner, Some((123, 100)));
    }
}
