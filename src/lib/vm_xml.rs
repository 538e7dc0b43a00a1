//! Reading a base domain's XML and rendering the clone's XML.
//!
//! Only the handful of elements the clone needs are extracted; everything
//! that is copied from the base is carried as a verbatim XML fragment.

use lazy_static::lazy_static;
use regex::Regex;

use crate::error::{ProvisionError, Result};

lazy_static! {
    static ref DOMAIN_TYPE: Regex = Regex::new(r#"<domain\b[^>]*?\stype=['"]([^'"]+)['"]"#).unwrap();
    static ref NAME: Regex = Regex::new(r"(?s)<name>(.*?)</name>").unwrap();
    static ref METADATA: Regex = Regex::new(r"(?s)<metadata(?:\s[^>]*?)?(?:/>|>.*?</metadata>)").unwrap();
    static ref OS: Regex = Regex::new(r"(?s)<os(?:\s[^>]*?)?(?:/>|>.*?</os>)").unwrap();
    static ref FEATURES: Regex = Regex::new(r"(?s)<features(?:\s[^>]*?)?(?:/>|>.*?</features>)").unwrap();
    static ref CLOCK: Regex = Regex::new(r"(?s)<clock(?:\s[^>]*?)?(?:/>|>.*?</clock>)").unwrap();
    static ref CPU_MODE: Regex = Regex::new(r#"<cpu\b[^>]*?\smode=['"]([^'"]+)['"]"#).unwrap();
    static ref ON_POWEROFF: Regex = Regex::new(r"<on_poweroff>\s*([^<]*?)\s*</on_poweroff>").unwrap();
    static ref ON_REBOOT: Regex = Regex::new(r"<on_reboot>\s*([^<]*?)\s*</on_reboot>").unwrap();
    static ref ON_CRASH: Regex = Regex::new(r"<on_crash>\s*([^<]*?)\s*</on_crash>").unwrap();
    static ref DEVICES: Regex = Regex::new(r"(?s)<devices>(.*)</devices>").unwrap();
    static ref DISK: Regex = Regex::new(r"(?s)[ \t]*<disk\b[^>]*?(?:/>|>.*?</disk>)[ \t]*\n?").unwrap();
    static ref DISK_DEVICE: Regex = Regex::new(r#"<disk\b[^>]*?\sdevice=['"]([^'"]+)['"]"#).unwrap();
    static ref DRIVER_TYPE: Regex = Regex::new(r#"<driver\b[^>]*?\stype=['"]([^'"]+)['"]"#).unwrap();
    static ref SOURCE_FILE: Regex = Regex::new(r#"<source\b[^>]*?\sfile=['"]([^'"]+)['"]"#).unwrap();
    static ref MAC: Regex = Regex::new(r"[ \t]*<mac\s[^>]*?/>[ \t]*\n?").unwrap();
    static ref OS_BOOT: Regex = Regex::new(r"[ \t]*<boot\s[^>]*?/>[ \t]*\n?").unwrap();
    static ref INTERFACE_OPEN: Regex = Regex::new(r"<interface\b[^>]*>").unwrap();
}

pub fn xml_escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            _ => out.push(c),
        }
    }
    out
}

pub fn xml_unescape(value: &str) -> String {
    value
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

fn capture(re: &Regex, xml: &str) -> Option<String> {
    re.captures(xml)
        .and_then(|c| c.get(1))
        .map(|m| xml_unescape(m.as_str()))
}

fn fragment(re: &Regex, xml: &str) -> Option<String> {
    re.find(xml).map(|m| m.as_str().trim().to_string())
}

/// A disk of the base domain.
#[derive(Debug, Clone, PartialEq)]
pub struct BaseDisk {
    pub device: String,
    pub driver_type: String,
    pub source_file: String,
}

/// Read-only snapshot of the template domain's definition.
#[derive(Debug, Clone, Default)]
pub struct BaseDomainSpec {
    pub name: String,
    pub domain_type: String,
    pub metadata: Option<String>,
    pub os: Option<String>,
    pub features: Option<String>,
    pub cpu_mode: Option<String>,
    pub clock: Option<String>,
    pub on_poweroff: Option<String>,
    pub on_reboot: Option<String>,
    pub on_crash: Option<String>,
    pub disks: Vec<BaseDisk>,
    /// Every device except disks, verbatim.
    pub other_devices: String,
}

impl BaseDomainSpec {
    pub fn from_xml(xml: &str) -> Result<Self> {
        let name = capture(&NAME, xml).unwrap_or_default();
        let devices = match DEVICES.captures(xml).and_then(|c| c.get(1)) {
            Some(m) => m.as_str(),
            None => {
                return Err(ProvisionError::InvalidBase {
                    domain: name,
                    reason: "definition has no <devices> section".to_string(),
                })
            }
        };

        let disks = DISK
            .find_iter(devices)
            .map(|m| {
                let disk = m.as_str();
                BaseDisk {
                    device: capture(&DISK_DEVICE, disk).unwrap_or_else(|| "disk".to_string()),
                    driver_type: capture(&DRIVER_TYPE, disk).unwrap_or_default(),
                    source_file: capture(&SOURCE_FILE, disk).unwrap_or_default(),
                }
            })
            .collect();
        let other_devices = DISK.replace_all(devices, "").trim().to_string();

        Ok(BaseDomainSpec {
            name,
            domain_type: capture(&DOMAIN_TYPE, xml).unwrap_or_else(|| "kvm".to_string()),
            metadata: fragment(&METADATA, xml),
            os: fragment(&OS, xml),
            features: fragment(&FEATURES, xml),
            cpu_mode: capture(&CPU_MODE, xml),
            clock: fragment(&CLOCK, xml),
            on_poweroff: capture(&ON_POWEROFF, xml),
            on_reboot: capture(&ON_REBOOT, xml),
            on_crash: capture(&ON_CRASH, xml),
            disks,
            other_devices,
        })
    }

    /// The primary data disk: first qcow2 disk device with a backing file.
    pub fn primary_disk(&self) -> Result<&BaseDisk> {
        self.disks
            .iter()
            .find(|d| d.device == "disk" && d.driver_type == "qcow2" && !d.source_file.is_empty())
            .ok_or_else(|| ProvisionError::InvalidBase {
                domain: self.name.clone(),
                reason: "could not find a qcow2 data disk".to_string(),
            })
    }

    /// The base `<os>` without per-device `<boot dev=…/>` entries.
    pub fn os_without_boot_devices(&self) -> Option<String> {
        self.os.as_ref().map(|os| OS_BOOT.replace_all(os, "").to_string())
    }

    /// Non-disk devices with interface MACs dropped or replaced by `mac`.
    pub fn devices_with_mac(&self, mac: Option<&str>) -> String {
        let stripped = MAC.replace_all(&self.other_devices, "");
        match mac {
            Some(mac) if !mac.is_empty() => INTERFACE_OPEN
                .replacen(&stripped, 1, |caps: &regex::Captures| {
                    format!("{}\n      <mac address='{}'/>", &caps[0], xml_escape(mac))
                })
                .to_string(),
            _ => stripped.to_string(),
        }
    }
}

/// A disk attached to the new domain.
#[derive(Debug, Clone, PartialEq)]
pub struct DiskDevice {
    pub device: &'static str,
    pub driver_type: &'static str,
    pub cache: Option<&'static str>,
    pub discard: Option<&'static str>,
    pub source_file: String,
    pub target_dev: &'static str,
    pub target_bus: &'static str,
    pub read_only: bool,
    pub boot_order: u32,
}

impl DiskDevice {
    pub fn data_disk(path: &str) -> Self {
        DiskDevice {
            device: "disk",
            driver_type: "qcow2",
            cache: Some("none"),
            discard: Some("unmap"),
            source_file: path.to_string(),
            target_dev: "vda",
            target_bus: "virtio",
            read_only: false,
            boot_order: 1,
        }
    }

    pub fn seed_disk(path: &str) -> Self {
        DiskDevice {
            device: "cdrom",
            driver_type: "raw",
            cache: None,
            discard: None,
            source_file: path.to_string(),
            target_dev: "sda",
            target_bus: "sata",
            read_only: true,
            boot_order: 2,
        }
    }

    pub fn to_xml(&self) -> String {
        let mut driver = format!("<driver name='qemu' type='{}'", self.driver_type);
        if let Some(cache) = self.cache {
            driver.push_str(&format!(" cache='{cache}'"));
        }
        if let Some(discard) = self.discard {
            driver.push_str(&format!(" discard='{discard}'"));
        }
        driver.push_str("/>");

        let mut xml = format!("    <disk type='file' device='{}'>\n", self.device);
        xml.push_str(&format!("      {driver}\n"));
        xml.push_str(&format!(
            "      <source file='{}'/>\n",
            xml_escape(&self.source_file)
        ));
        xml.push_str(&format!(
            "      <target dev='{}' bus='{}'/>\n",
            self.target_dev, self.target_bus
        ));
        if self.read_only {
            xml.push_str("      <readonly/>\n");
        }
        xml.push_str(&format!("      <boot order='{}'/>\n", self.boot_order));
        xml.push_str("    </disk>\n");
        xml
    }
}

/// Fully specified definition of a new domain.
#[derive(Debug, Clone)]
pub struct DomainDefinition {
    pub domain_type: String,
    pub name: String,
    pub vcpu: u32,
    pub memory: u64,
    pub memory_unit: String,
    pub metadata: Option<String>,
    pub os: Option<String>,
    pub features: Option<String>,
    pub cpu_mode: Option<String>,
    pub clock: Option<String>,
    pub on_poweroff: Option<String>,
    pub on_reboot: Option<String>,
    pub on_crash: Option<String>,
    pub disks: Vec<DiskDevice>,
    pub other_devices: String,
}

impl DomainDefinition {
    pub fn to_xml(&self) -> String {
        let mut xml = format!("<domain type='{}'>\n", xml_escape(&self.domain_type));
        xml.push_str(&format!("  <name>{}</name>\n", xml_escape(&self.name)));
        if let Some(metadata) = &self.metadata {
            xml.push_str(&format!("  {metadata}\n"));
        }
        let unit = xml_escape(&self.memory_unit);
        xml.push_str(&format!("  <memory unit='{unit}'>{}</memory>\n", self.memory));
        xml.push_str(&format!(
            "  <currentMemory unit='{unit}'>{}</currentMemory>\n",
            self.memory
        ));
        xml.push_str(&format!("  <vcpu placement='static'>{}</vcpu>\n", self.vcpu));
        if let Some(os) = &self.os {
            xml.push_str(&format!("  {os}\n"));
        }
        if let Some(features) = &self.features {
            xml.push_str(&format!("  {features}\n"));
        }
        match &self.cpu_mode {
            Some(mode) => xml.push_str(&format!("  <cpu mode='{}'>\n", xml_escape(mode))),
            None => xml.push_str("  <cpu>\n"),
        }
        xml.push_str(&format!(
            "    <topology sockets='{}' cores='1' threads='1'/>\n  </cpu>\n",
            self.vcpu
        ));
        if let Some(clock) = &self.clock {
            xml.push_str(&format!("  {clock}\n"));
        }
        for (tag, value) in [
            ("on_poweroff", &self.on_poweroff),
            ("on_reboot", &self.on_reboot),
            ("on_crash", &self.on_crash),
        ] {
            if let Some(value) = value {
                xml.push_str(&format!("  <{tag}>{}</{tag}>\n", xml_escape(value)));
            }
        }
        xml.push_str("  <pm>\n    <suspend-to-mem enabled='no'/>\n    <suspend-to-disk enabled='no'/>\n  </pm>\n");
        xml.push_str("  <devices>\n");
        for disk in &self.disks {
            xml.push_str(&disk.to_xml());
        }
        if !self.other_devices.is_empty() {
            xml.push_str(&format!("    {}\n", self.other_devices));
        }
        xml.push_str("  </devices>\n</domain>\n");
        xml
    }
}

#[cfg(test)]
pub(crate) const BASE_XML: &str = r###"<domain type='kvm' id='3'>
  <name>base-01</name>
  <uuid>8b5f3a52-5d9b-4c6e-9f7e-6b1f0c3e2a11</uuid>
  <metadata>
    <libosinfo:libosinfo xmlns:libosinfo="http://libosinfo.org/xmlns/libvirt/domain/1.0">
      <libosinfo:os id="http://ubuntu.com/ubuntu/22.04"/>
    </libosinfo:libosinfo>
  </metadata>
  <memory unit='KiB'>2097152</memory>
  <currentMemory unit='KiB'>2097152</currentMemory>
  <vcpu placement='static'>1</vcpu>
  <os>
    <type arch='x86_64' machine='pc-q35-6.2'>hvm</type>
    <boot dev='hd'/>
  </os>
  <features>
    <acpi/>
    <apic/>
  </features>
  <cpu mode='host-passthrough' check='none' migratable='on'/>
  <clock offset='utc'>
    <timer name='rtc' tickpolicy='catchup'/>
    <timer name='hpet' present='no'/>
  </clock>
  <on_poweroff>destroy</on_poweroff>
  <on_reboot>restart</on_reboot>
  <on_crash>destroy</on_crash>
  <pm>
    <suspend-to-mem enabled='yes'/>
    <suspend-to-disk enabled='yes'/>
  </pm>
  <devices>
    <emulator>/usr/bin/qemu-system-x86_64</emulator>
    <disk type='file' device='cdrom'>
      <driver name='qemu' type='raw'/>
      <source file='/var/lib/libvirt/boot/seed.iso'/>
      <target dev='sda' bus='sata'/>
      <readonly/>
    </disk>
    <disk type='file' device='disk'>
      <driver name='qemu' type='qcow2' cache='none'/>
      <source file='/images/base-01.qcow2'/>
      <target dev='vda' bus='virtio'/>
    </disk>
    <interface type='network'>
      <mac address='52:54:00:aa:bb:cc'/>
      <source network='default'/>
      <model type='virtio'/>
    </interface>
    <console type='pty'/>
  </devices>
</domain>
"###;
