use std::fmt;

use crate::error::Result;
use crate::libvirt::{DomainHandle, Hypervisor};
use crate::required::RequiredFieldSet;
use crate::vm_xml::{BaseDomainSpec, DiskDevice, DomainDefinition};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum DomainField {
    Name,
    Vcpu,
    Memory,
    DataDisk,
    SeedDisk,
}

impl fmt::Display for DomainField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DomainField::Name => "name",
            DomainField::Vcpu => "vcpu",
            DomainField::Memory => "memory",
            DomainField::DataDisk => "data disk path",
            DomainField::SeedDisk => "seed disk path",
        };
        f.write_str(s)
    }
}

/// Derives a new domain definition from a base domain.
pub struct DomainDefinitionBuilder<'a> {
    base: &'a BaseDomainSpec,
    name: String,
    vcpu: u32,
    memory: u64,
    memory_unit: String,
    data_disk: Option<DiskDevice>,
    seed_disk: Option<DiskDevice>,
    mac_address: Option<String>,
    required: RequiredFieldSet<DomainField>,
}

impl<'a> DomainDefinitionBuilder<'a> {
    pub fn new(base: &'a BaseDomainSpec) -> Self {
        DomainDefinitionBuilder {
            base,
            name: String::new(),
            vcpu: 0,
            memory: 0,
            memory_unit: String::from("KiB"),
            data_disk: None,
            seed_disk: None,
            mac_address: None,
            required: RequiredFieldSet::new([
                DomainField::Name,
                DomainField::Vcpu,
                DomainField::Memory,
                DomainField::DataDisk,
                DomainField::SeedDisk,
            ]),
        }
    }

    pub fn with_name(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self.required.mark(DomainField::Name);
        self
    }

    /// Sets the vCPU count; the topology becomes `count` single-core sockets.
    pub fn with_vcpus(mut self, count: u32) -> Self {
        self.vcpu = count;
        self.required.mark(DomainField::Vcpu);
        self
    }

    pub fn with_memory(mut self, value: u64, unit: &str) -> Self {
        self.memory = value;
        self.memory_unit = unit.to_string();
        self.required.mark(DomainField::Memory);
        self
    }

    pub fn with_data_disk(mut self, path: &str) -> Self {
        let order = self.data_disk.as_ref().map(|d| d.boot_order);
        let mut disk = DiskDevice::data_disk(path);
        if let Some(order) = order {
            disk.boot_order = order;
        }
        self.data_disk = Some(disk);
        self.required.mark(DomainField::DataDisk);
        self
    }

    pub fn with_seed_disk(mut self, path: &str) -> Self {
        let order = self.seed_disk.as_ref().map(|d| d.boot_order);
        let mut disk = DiskDevice::seed_disk(path);
        if let Some(order) = order {
            disk.boot_order = order;
        }
        self.seed_disk = Some(disk);
        self.required.mark(DomainField::SeedDisk);
        self
    }

    /// Reorders boot devices. Applies to disks set before or after this call.
    pub fn with_boot_order(mut self, data: u32, seed: u32) -> Self {
        let data_disk = self
            .data_disk
            .get_or_insert_with(|| DiskDevice::data_disk(""));
        data_disk.boot_order = data;
        let seed_disk = self
            .seed_disk
            .get_or_insert_with(|| DiskDevice::seed_disk(""));
        seed_disk.boot_order = seed;
        self
    }

    /// An empty MAC keeps libvirt's generated address.
    pub fn with_mac_address(mut self, mac: &str) -> Self {
        self.mac_address = if mac.is_empty() {
            None
        } else {
            Some(mac.to_string())
        };
        self
    }

    pub fn finalize(&self) -> Result<DomainDefinition> {
        self.required.verify("domain definition")?;

        let disks = [&self.data_disk, &self.seed_disk]
            .into_iter()
            .flatten()
            .cloned()
            .collect();

        Ok(DomainDefinition {
            domain_type: self.base.domain_type.clone(),
            name: self.name.clone(),
            vcpu: self.vcpu,
            memory: self.memory,
            memory_unit: self.memory_unit.clone(),
            metadata: self.base.metadata.clone(),
            os: self.base.os_without_boot_devices(),
            features: self.base.features.clone(),
            cpu_mode: self.base.cpu_mode.clone(),
            clock: self.base.clock.clone(),
            on_poweroff: self.base.on_poweroff.clone(),
            on_reboot: self.base.on_reboot.clone(),
            on_crash: self.base.on_crash.clone(),
            disks,
            other_devices: self.base.devices_with_mac(self.mac_address.as_deref()),
        })
    }

    pub fn to_xml(&self) -> Result<String> {
        Ok(self.finalize()?.to_xml())
    }

    /// Finalizes and defines the domain on `hypervisor`.
    pub fn register(&self, hypervisor: &dyn Hypervisor) -> Result<DomainHandle> {
        let xml = self.to_xml()?;
        debug!("defining domain {}", self.name);
        hypervisor.define_domain(&xml)
    }
}
