#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

use virt_provisioner::contract::VirtualMachineConfig;
use virt_provisioner::error::{ProvisionError, Result, ShellError};
use virt_provisioner::files::FileTransfer;
use virt_provisioner::host::HostAccess;
use virt_provisioner::libvirt::{DomainHandle, Hypervisor};
use virt_provisioner::provisioner::VirtualMachineProvisioner;
use virt_provisioner::shell::{command_line, OutputSink, ShellExecutor};
use virt_provisioner::structs::AppConfig;

pub const SCRATCH_ROOT: &str = "/var/ci";

#[ctor::ctor]
fn init() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("debug")
        .with_test_writer()
        .try_init();
}

pub fn base_xml(name: &str, disk: &str) -> String {
    format!(
        r#"<domain type='kvm'>
  <name>{name}</name>
  <uuid>0f6f3c3e-1111-4d4d-8c8c-000000000001</uuid>
  <memory unit='KiB'>1048576</memory>
  <vcpu placement='static'>1</vcpu>
  <os>
    <type arch='x86_64' machine='q35'>hvm</type>
    <boot dev='hd'/>
  </os>
  <features>
    <acpi/>
  </features>
  <clock offset='utc'/>
  <on_poweroff>destroy</on_poweroff>
  <on_reboot>restart</on_reboot>
  <on_crash>destroy</on_crash>
  <devices>
    <emulator>/usr/bin/qemu-system-x86_64</emulator>
    <disk type='file' device='disk'>
      <driver name='qemu' type='qcow2'/>
      <source file='{disk}'/>
      <target dev='vda' bus='virtio'/>
    </disk>
    <interface type='network'>
      <mac address='52:54:00:12:34:56'/>
      <source network='default'/>
      <model type='virtio'/>
    </interface>
  </devices>
</domain>"#
    )
}

#[derive(Default)]
pub struct HypervisorState {
    /// name -> (uuid, definition)
    pub domains: BTreeMap<String, (String, String)>,
    pub defined: Vec<String>,
    pub started: Vec<String>,
    pub fail_define: bool,
    pub fail_start: bool,
    /// Cancelled once a definition is accepted.
    pub cancel_on_define: Option<CancellationToken>,
}

/// In-memory stand-in for a libvirt connection.
#[derive(Clone, Default)]
pub struct FakeHypervisor {
    pub state: Arc<Mutex<HypervisorState>>,
}

impl FakeHypervisor {
    pub fn with_base(name: &str, disk: &str) -> Self {
        let hv = FakeHypervisor::default();
        hv.add_domain(name, &base_xml(name, disk));
        hv
    }

    pub fn add_domain(&self, name: &str, xml: &str) {
        self.state.lock().unwrap().domains.insert(
            name.to_string(),
            (uuid::Uuid::new_v4().to_string(), xml.to_string()),
        );
    }

    pub fn defined(&self) -> Vec<String> {
        self.state.lock().unwrap().defined.clone()
    }

    pub fn started(&self) -> Vec<String> {
        self.state.lock().unwrap().started.clone()
    }
}

fn element<'a>(xml: &'a str, tag: &str) -> Option<&'a str> {
    let open = format!("<{tag}>");
    let close = format!("</{tag}>");
    let start = xml.find(&open)? + open.len();
    let end = xml[start..].find(&close)? + start;
    Some(&xml[start..end])
}

impl Hypervisor for FakeHypervisor {
    fn lookup_domain(&self, name: &str) -> Result<DomainHandle> {
        let state = self.state.lock().unwrap();
        match state.domains.get(name) {
            Some((uuid, _)) => Ok(DomainHandle {
                name: name.to_string(),
                uuid: uuid.clone(),
            }),
            None => Err(ProvisionError::NotFound {
                domain: name.to_string(),
                reason: "Domain not found".to_string(),
            }),
        }
    }

    fn domain_definition(&self, domain: &DomainHandle) -> Result<String> {
        let state = self.state.lock().unwrap();
        state
            .domains
            .get(&domain.name)
            .map(|(_, xml)| xml.clone())
            .ok_or_else(|| ProvisionError::NotFound {
                domain: domain.name.clone(),
                reason: "Domain not found".to_string(),
            })
    }

    fn define_domain(&self, xml: &str) -> Result<DomainHandle> {
        let mut state = self.state.lock().unwrap();
        if state.fail_define {
            return Err(ProvisionError::Definition("XML error: invalid device".to_string()));
        }
        let name = element(xml, "name")
            .ok_or_else(|| ProvisionError::Definition("missing name".to_string()))?
            .to_string();
        let uuid = uuid::Uuid::new_v4().to_string();
        state.defined.push(xml.to_string());
        if let Some(token) = &state.cancel_on_define {
            token.cancel();
        }
        state
            .domains
            .insert(name.clone(), (uuid.clone(), xml.to_string()));
        Ok(DomainHandle { name, uuid })
    }

    fn start_domain(&self, domain: &DomainHandle) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.fail_start {
            return Err(ProvisionError::Start {
                domain: domain.name.clone(),
                reason: "no bootable device".to_string(),
            });
        }
        state.started.push(domain.name.clone());
        Ok(())
    }

    fn list_domains(&self, _include_inactive: bool) -> Result<Vec<DomainHandle>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .domains
            .iter()
            .map(|(name, (uuid, _))| DomainHandle {
                name: name.clone(),
                uuid: uuid.clone(),
            })
            .collect())
    }
}

/// Records every command line; programs in `failing` exit non-zero.
#[derive(Default)]
pub struct RecordingShell {
    pub lines: Mutex<Vec<String>>,
    pub failing: Mutex<BTreeSet<String>>,
}

impl RecordingShell {
    pub fn fail(&self, program: &str) {
        self.failing.lock().unwrap().insert(program.to_string());
    }

    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().unwrap().clone()
    }

    pub fn ran(&self, program: &str) -> bool {
        self.lines()
            .iter()
            .any(|l| l.split(' ').next() == Some(program))
    }
}

#[async_trait]
impl ShellExecutor for RecordingShell {
    fn name(&self) -> &'static str {
        "recording-shell"
    }

    async fn execute(
        &self,
        _cancel: &CancellationToken,
        _stdout: OutputSink<'_>,
        stderr: OutputSink<'_>,
        command: &str,
        args: &[String],
    ) -> std::result::Result<(), ShellError> {
        let line = command_line(command, args);
        self.lines.lock().unwrap().push(line.clone());
        let fails = self.failing.lock().unwrap().contains(command);
        if fails {
            let _ = stderr.write_all(format!("{command}: simulated failure").as_bytes()).await;
            return Err(ShellError::Run {
                command: line,
                status: "exit status: 1".to_string(),
            });
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct FileState {
    pub dirs: BTreeSet<String>,
    pub files: BTreeMap<String, Vec<u8>>,
    pub removed: Vec<String>,
    pub fail_remove: bool,
}

/// In-memory file transfer.
#[derive(Default)]
pub struct MemoryFiles {
    pub state: Mutex<FileState>,
}

impl MemoryFiles {
    pub fn removed(&self) -> Vec<String> {
        self.state.lock().unwrap().removed.clone()
    }

    pub fn dirs(&self) -> Vec<String> {
        self.state.lock().unwrap().dirs.iter().cloned().collect()
    }

    pub fn file(&self, path: &str) -> Option<String> {
        self.state
            .lock()
            .unwrap()
            .files
            .get(path)
            .map(|b| String::from_utf8_lossy(b).into_owned())
    }
}

#[async_trait]
impl FileTransfer for MemoryFiles {
    fn name(&self) -> &'static str {
        "memory-files"
    }

    async fn mkdir_all(&self, _cancel: &CancellationToken, path: &str) -> Result<()> {
        self.state.lock().unwrap().dirs.insert(path.to_string());
        Ok(())
    }

    async fn write_file(&self, _cancel: &CancellationToken, path: &str, data: &[u8]) -> Result<()> {
        self.state
            .lock()
            .unwrap()
            .files
            .insert(path.to_string(), data.to_vec());
        Ok(())
    }

    async fn remove_all(&self, _cancel: &CancellationToken, path: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.fail_remove {
            return Err(ProvisionError::io(
                path,
                std::io::Error::new(std::io::ErrorKind::PermissionDenied, "read-only file system"),
            ));
        }
        state.dirs.retain(|d| !d.starts_with(path));
        state.files.retain(|f, _| !f.starts_with(path));
        state.removed.push(path.to_string());
        Ok(())
    }
}

/// A provisioner wired to fakes, plus handles to inspect them.
#[derive(Clone)]
pub struct Fixture {
    pub hypervisor: FakeHypervisor,
    pub shell: Arc<RecordingShell>,
    pub files: Arc<MemoryFiles>,
}

impl Fixture {
    pub fn new() -> Self {
        Fixture {
            hypervisor: FakeHypervisor::with_base("base-01", "/images/base-01.qcow2"),
            shell: Arc::new(RecordingShell::default()),
            files: Arc::new(MemoryFiles::default()),
        }
    }

    pub fn settings() -> AppConfig {
        AppConfig {
            cloud_init_dir: SCRATCH_ROOT.to_string(),
            ..Default::default()
        }
    }

    pub fn provisioner(&self) -> VirtualMachineProvisioner {
        VirtualMachineProvisioner::new(
            Box::new(self.hypervisor.clone()),
            HostAccess::custom(self.shell.clone(), self.files.clone()),
            Self::settings(),
        )
    }
}

pub fn web_request(name: &str) -> VirtualMachineConfig {
    let mut vm = VirtualMachineConfig::default();
    vm.general.name = name.to_string();
    vm.general.base_vm_name = "base-01".to_string();
    vm.general.vcpu = 2;
    vm.general.memory_gb = 4.0;
    vm.general.disk_gb = 20.0;
    vm.general.cow_clone = true;
    vm.user.user = "ops".to_string();
    vm.user.authorized_key_contents = vec!["ssh-ed25519 AAAA ops@laptop".to_string()];
    vm.network.ip_address = "10.0.0.5".to_string();
    vm.network.gateway_address = "10.0.0.1".to_string();
    vm
}
