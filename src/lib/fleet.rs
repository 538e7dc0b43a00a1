//! Batch creation of virtual machines sharing a set of defaults.

use std::fmt;

use tokio_util::sync::CancellationToken;

use crate::contract::{
    FleetConfig, FleetResult, FleetSharedConfig, ProvisioningResult, VirtualMachineConfig,
};
use crate::provisioner::Provision;

/// Values that count as "not given" in a request.
pub trait Unset {
    fn is_unset(&self) -> bool;
}

impl Unset for String {
    fn is_unset(&self) -> bool {
        self.is_empty()
    }
}

impl<T> Unset for Vec<T> {
    fn is_unset(&self) -> bool {
        self.is_empty()
    }
}

impl<T> Unset for Option<T> {
    fn is_unset(&self) -> bool {
        self.is_none()
    }
}

/// Fills `value` from `shared` when it was not given.
pub fn set_or_inherit<T: Unset + Clone>(value: &mut T, shared: &T) {
    if value.is_unset() {
        *value = shared.clone();
    }
}

/// The per-VM request after applying the fleet's shared defaults.
pub fn coalesce(shared: &FleetSharedConfig, vm: &VirtualMachineConfig) -> VirtualMachineConfig {
    let mut vm = vm.clone();
    set_or_inherit(&mut vm.general.base_vm_name, &shared.general.base_vm_name);
    set_or_inherit(&mut vm.user.user, &shared.ssh.user);
    set_or_inherit(&mut vm.user.authorized_key_paths, &shared.ssh.authorized_key_paths);
    set_or_inherit(&mut vm.user.authorized_key_contents, &shared.ssh.authorized_key_contents);
    set_or_inherit(&mut vm.user.disable_root_pw, &shared.ssh.disable_root_pw);
    set_or_inherit(&mut vm.network.nameservers, &shared.cloud_init.nameservers);
    set_or_inherit(&mut vm.hypervisor_connection, &shared.hypervisor_connection);
    if !shared.general.fleet_name.is_empty() {
        vm.general.name = format!("{}-{}", shared.general.fleet_name, vm.general.name);
    }
    vm
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FleetStatus {
    Created,
    Failed,
    Partial,
}

impl FleetStatus {
    pub fn message(self) -> &'static str {
        match self {
            FleetStatus::Created => "created",
            FleetStatus::Failed => "failed",
            FleetStatus::Partial => "partial",
        }
    }
}

impl fmt::Display for FleetStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.message())
    }
}

impl FleetResult {
    /// Appends one outcome, keeping the counters in step.
    pub fn record(&mut self, result: ProvisioningResult) {
        if result.succeeded() {
            self.success += 1;
        } else {
            self.failed += 1;
        }
        self.total += 1;
        self.sub_results.push(result);
    }

    pub fn status(&self) -> FleetStatus {
        match (self.success, self.failed) {
            (_, 0) => FleetStatus::Created,
            (0, _) => FleetStatus::Failed,
            _ => FleetStatus::Partial,
        }
    }
}

pub struct FleetOrchestrator<P: Provision> {
    provisioner: P,
}

impl<P: Provision> FleetOrchestrator<P> {
    pub fn new(provisioner: P) -> Self {
        FleetOrchestrator { provisioner }
    }

    /// Creates every VM in order. A failure is recorded and the batch goes on.
    pub async fn create(&self, cancel: &CancellationToken, fleet: &FleetConfig) -> FleetResult {
        let mut result = FleetResult::default();
        for vm in &fleet.virtual_machines {
            let vm = coalesce(&fleet.shared_config, vm);
            let name = vm.general.name.clone();
            match self.provisioner.provision(cancel, &vm).await {
                Ok(uuid) => {
                    info!("fleet member {name} created as {uuid}");
                    result.record(ProvisioningResult {
                        uuid,
                        name,
                        error: String::new(),
                    });
                }
                Err(e) => {
                    warn!("fleet member {name} failed: {e}");
                    result.record(ProvisioningResult {
                        uuid: String::new(),
                        name,
                        error: e.to_string(),
                    });
                }
            }
        }
        info!(
            "fleet {}: {} of {} created",
            fleet.shared_config.general.fleet_name, result.success, result.total
        );
        result
    }
}
