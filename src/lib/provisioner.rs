//! Creation of a single virtual machine from a base domain.

use std::fmt;
use std::path::Path;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::cloud_init::{
    instance_id, resolve_authorized_keys, scratch_dir, timestamp, CloudInitDocumentSet,
    CloudInitGenerator, CloudInitParams,
};
use crate::connect::resolve_uri;
use crate::contract::{HypervisorConnectionConfig, VirtualMachineConfig};
use crate::domain_builder::DomainDefinitionBuilder;
use crate::error::{ProvisionError, Result};
use crate::host::HostAccess;
use crate::libvirt::{Hypervisor, LibvirtHypervisor};
use crate::required::RequiredFieldSet;
use crate::shell::run_tool;
use crate::structs::AppConfig;
use crate::vm_xml::BaseDomainSpec;

const KIB_PER_GIB: f64 = 1024.0 * 1024.0;
const COPY_TOOL: &str = "cp";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ProvisioningStage {
    Init,
    BaseResolved,
    ArtifactsWritten,
    DiskCloned,
    DefinitionBuilt,
    Registered,
    Started,
    Done,
}

impl fmt::Display for ProvisioningStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Whether the cloud-init directory must be removed once the run ends.
/// The cloned disk is only recorded so a rollback can report it.
#[derive(Debug, Default)]
struct Rollback {
    dir: Option<String>,
    disk: Option<String>,
    pending: bool,
}

struct Run<'a> {
    name: &'a str,
    cancel: &'a CancellationToken,
    stage: ProvisioningStage,
    rollback: Rollback,
}

impl<'a> Run<'a> {
    /// Moves to `stage`. Cancellation is honoured only until the domain is
    /// registered; from then on the run finishes by starting it.
    fn advance(&mut self, stage: ProvisioningStage) -> Result<()> {
        info!("{}: {} -> {}", self.name, self.stage, stage);
        self.stage = stage;
        if self.cancel.is_cancelled() && stage < ProvisioningStage::Registered {
            return Err(ProvisionError::Cancelled {
                name: self.name.to_string(),
            });
        }
        Ok(())
    }
}

/// Path of the cloned data disk: next to the base disk, named after the VM.
pub fn clone_path(base_disk: &str, name: &str) -> String {
    match Path::new(base_disk).parent() {
        Some(dir) if !dir.as_os_str().is_empty() => format!("{}/{name}.qcow2", dir.display()),
        _ => format!("{name}.qcow2"),
    }
}

pub fn memory_kib(memory_gb: f64) -> u64 {
    (memory_gb * KIB_PER_GIB).round() as u64
}

fn validate(config: &VirtualMachineConfig) -> Result<()> {
    let general = &config.general;
    let mut required = RequiredFieldSet::new(["name", "base_vm_name", "vcpu", "memory_gb"]);
    if !general.name.is_empty() {
        required.mark("name");
    }
    if !general.base_vm_name.is_empty() {
        required.mark("base_vm_name");
    }
    if general.vcpu > 0 {
        required.mark("vcpu");
    }
    if general.memory_gb > 0.0 {
        required.mark("memory_gb");
    }
    required.verify("virtual machine request")?;

    // the name becomes a path component of the disk and the scratch directory
    let name = general.name.as_str();
    if name == "." || name == ".." || name.contains(['/', '\0']) {
        return Err(ProvisionError::InvalidRequest(format!(
            "'{name}' is not a usable domain name"
        )));
    }
    Ok(())
}

pub struct VirtualMachineProvisioner {
    hypervisor: Box<dyn Hypervisor>,
    host: HostAccess,
    settings: AppConfig,
}

impl VirtualMachineProvisioner {
    pub fn new(hypervisor: Box<dyn Hypervisor>, host: HostAccess, settings: AppConfig) -> Self {
        VirtualMachineProvisioner {
            hypervisor,
            host,
            settings,
        }
    }

    /// Creates and starts the VM, returning its UUID.
    pub async fn create(
        &self,
        cancel: &CancellationToken,
        config: &VirtualMachineConfig,
    ) -> Result<String> {
        validate(config)?;
        let name = config.general.name.as_str();
        let mut run = Run {
            name,
            cancel,
            stage: ProvisioningStage::Init,
            rollback: Rollback::default(),
        };

        let outcome = self.run(&mut run, config).await;
        if let Err(e) = &outcome {
            error!("{name}: Failed({}): {e}", run.stage);
        }

        match (&run.rollback, outcome) {
            (
                Rollback {
                    dir: Some(dir),
                    disk,
                    pending: true,
                },
                Err(primary),
            ) => {
                info!("{name}: rolling back cloud-init artifacts in {dir}");
                if let Some(disk) = disk {
                    warn!("{name}: cloned disk {disk} is left in place");
                }
                // a cancelled request still gets its cleanup
                match self.host.files.remove_all(&CancellationToken::new(), dir).await {
                    Ok(()) => Err(primary),
                    Err(cleanup) => {
                        error!("{name}: rollback of {dir} failed: {cleanup}");
                        Err(ProvisionError::Rollback {
                            primary: Box::new(primary),
                            cleanup: Box::new(cleanup),
                        })
                    }
                }
            }
            (_, outcome) => outcome,
        }
    }

    async fn run(&self, run: &mut Run<'_>, config: &VirtualMachineConfig) -> Result<String> {
        let general = &config.general;
        let name = run.name;

        let base_handle = self.hypervisor.lookup_domain(&general.base_vm_name)?;
        let base = BaseDomainSpec::from_xml(&self.hypervisor.domain_definition(&base_handle)?)?;
        match self.hypervisor.lookup_domain(name) {
            Ok(_) => {
                return Err(ProvisionError::AlreadyExists {
                    domain: name.to_string(),
                })
            }
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }
        run.advance(ProvisioningStage::BaseResolved)?;

        let ts = timestamp();
        let dir = scratch_dir(&self.settings.cloud_init_dir, name, &ts);
        let params = CloudInitParams {
            name: name.to_string(),
            instance_id: instance_id(name, &ts),
            user: config.user.user.clone(),
            authorized_keys: resolve_authorized_keys(&config.user).await?,
            disable_root_pw: config.user.disable_root_pw.unwrap_or(true),
            ip_address: config.network.ip_address.clone(),
            gateway_address: config.network.gateway_address.clone(),
            mac_address: config.network.mac_address.clone(),
            nameservers: config.network.nameservers.clone(),
        };
        let documents = CloudInitDocumentSet::new(&params);
        let iso = CloudInitGenerator::new(&documents, &self.host, &self.settings.iso_tool)
            .write_to_disk(run.cancel, &dir, &self.settings.cloud_init_iso_name)
            .await?;
        run.rollback = Rollback {
            dir: Some(dir),
            disk: None,
            pending: true,
        };
        run.advance(ProvisioningStage::ArtifactsWritten)?;

        let base_disk = base.primary_disk()?.source_file.clone();
        let disk = clone_path(&base_disk, name);
        self.clone_disk(run.cancel, general.cow_clone, general.disk_gb, &base_disk, &disk)
            .await?;
        run.rollback.disk = Some(disk.clone());
        run.advance(ProvisioningStage::DiskCloned)?;

        let builder = DomainDefinitionBuilder::new(&base)
            .with_name(name)
            .with_vcpus(general.vcpu)
            .with_memory(memory_kib(general.memory_gb), "KiB")
            .with_data_disk(&disk)
            .with_seed_disk(&iso)
            .with_mac_address(&config.network.mac_address);
        builder.finalize()?;
        run.advance(ProvisioningStage::DefinitionBuilt)?;

        let handle = builder.register(self.hypervisor.as_ref())?;
        // the definition now persists; a failed start keeps the artifacts
        run.rollback.pending = false;
        run.advance(ProvisioningStage::Registered)?;

        self.hypervisor.start_domain(&handle)?;
        run.advance(ProvisioningStage::Started)?;
        run.advance(ProvisioningStage::Done)?;
        Ok(handle.uuid)
    }

    async fn clone_disk(
        &self,
        cancel: &CancellationToken,
        cow: bool,
        disk_gb: f64,
        base: &str,
        target: &str,
    ) -> Result<()> {
        let (tool, args) = if cow {
            let mut args: Vec<String> =
                ["create", "-f", "qcow2", "-b", base, "-F", "qcow2", target]
                    .iter()
                    .map(|s| s.to_string())
                    .collect();
            if disk_gb > 0.0 {
                args.push(format!("{disk_gb}G"));
            }
            (self.settings.disk_tool.as_str(), args)
        } else {
            (COPY_TOOL, vec![base.to_string(), target.to_string()])
        };
        run_tool(self.host.shell.as_ref(), cancel, tool, &args).await?;
        Ok(())
    }
}

/// Anything that turns one VM request into a running domain's UUID.
#[async_trait(?Send)]
pub trait Provision {
    async fn provision(
        &self,
        cancel: &CancellationToken,
        config: &VirtualMachineConfig,
    ) -> Result<String>;
}

#[async_trait(?Send)]
impl<T: Provision + ?Sized> Provision for Box<T> {
    async fn provision(
        &self,
        cancel: &CancellationToken,
        config: &VirtualMachineConfig,
    ) -> Result<String> {
        (**self).provision(cancel, config).await
    }
}

#[async_trait(?Send)]
impl Provision for VirtualMachineProvisioner {
    async fn provision(
        &self,
        cancel: &CancellationToken,
        config: &VirtualMachineConfig,
    ) -> Result<String> {
        self.create(cancel, config).await
    }
}

/// Opens the hypervisor and host connections named by each request.
#[derive(Debug, Clone, Default)]
pub struct ConnectingProvisioner {
    settings: AppConfig,
}

impl ConnectingProvisioner {
    pub fn new(settings: AppConfig) -> Self {
        ConnectingProvisioner { settings }
    }
}

/// Requests without a connection block use the local hypervisor.
pub fn connection_or_local(
    config: &Option<HypervisorConnectionConfig>,
) -> HypervisorConnectionConfig {
    config.clone().unwrap_or(HypervisorConnectionConfig {
        is_local_shell: true,
        ..Default::default()
    })
}

#[async_trait(?Send)]
impl Provision for ConnectingProvisioner {
    async fn provision(
        &self,
        cancel: &CancellationToken,
        config: &VirtualMachineConfig,
    ) -> Result<String> {
        let connection = connection_or_local(&config.hypervisor_connection);
        let uri = resolve_uri(&connection.libvirt)?;
        let hypervisor = LibvirtHypervisor::open(&uri)?;
        let host = HostAccess::connect(&connection, cancel).await?;

        let settings = self.settings.clone();
        let provisioner =
            VirtualMachineProvisioner::new(Box::new(hypervisor), host.clone(), settings);
        let result = provisioner.create(cancel, config).await;
        host.close().await;
        result
    }
}
