use serde::Serialize;
use virt::connect::Connect;
use virt::domain::Domain;
use virt::sys;

use crate::error::{ProvisionError, Result};

/// A domain known to the hypervisor.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct DomainHandle {
    pub name: String,
    pub uuid: String,
}

/// Operations the provisioning core needs from the hypervisor.
pub trait Hypervisor {
    fn lookup_domain(&self, name: &str) -> Result<DomainHandle>;
    fn domain_definition(&self, domain: &DomainHandle) -> Result<String>;
    fn define_domain(&self, xml: &str) -> Result<DomainHandle>;
    fn start_domain(&self, domain: &DomainHandle) -> Result<()>;
    fn list_domains(&self, include_inactive: bool) -> Result<Vec<DomainHandle>>;
}

pub struct LibvirtHypervisor {
    uri: String,
    conn: Option<Connect>,
}

impl LibvirtHypervisor {
    pub fn open(uri: &str) -> Result<Self> {
        debug!("About to connect to {uri}");
        match Connect::open(uri) {
            Ok(conn) => Ok(LibvirtHypervisor {
                uri: uri.to_string(),
                conn: Some(conn),
            }),
            Err(e) => {
                error!("Can't connect to libvirt: {e}");
                Err(ProvisionError::Connection(format!(
                    "could not open libvirt connection {uri}: {e}"
                )))
            }
        }
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    fn conn(&self) -> Result<&Connect> {
        self.conn
            .as_ref()
            .ok_or_else(|| ProvisionError::Connection(format!("{} is closed", self.uri)))
    }

    fn domain(&self, name: &str) -> Result<Domain> {
        Domain::lookup_by_name(self.conn()?, name).map_err(|e| ProvisionError::NotFound {
            domain: name.to_string(),
            reason: e.to_string(),
        })
    }

    fn handle(name: &str, dom: &Domain) -> Result<DomainHandle> {
        let uuid = dom.get_uuid_string().map_err(|e| {
            ProvisionError::Definition(format!("could not read UUID of {name}: {e}"))
        })?;
        Ok(DomainHandle {
            name: name.to_string(),
            uuid,
        })
    }

    fn disconnect(&mut self) {
        if let Some(mut conn) = self.conn.take() {
            if let Err(e) = conn.close() {
                error!("Failed to disconnect from libvirt: {e}");
            };
            debug!("Disconnected from libvirt");
        }
    }
}

impl Drop for LibvirtHypervisor {
    fn drop(&mut self) {
        self.disconnect();
    }
}

impl Hypervisor for LibvirtHypervisor {
    fn lookup_domain(&self, name: &str) -> Result<DomainHandle> {
        let dom = self.domain(name)?;
        Self::handle(name, &dom)
    }

    fn domain_definition(&self, domain: &DomainHandle) -> Result<String> {
        let dom = self.domain(&domain.name)?;
        dom.get_xml_desc(sys::VIR_DOMAIN_XML_SECURE)
            .map_err(|e| ProvisionError::InvalidBase {
                domain: domain.name.clone(),
                reason: format!("could not read definition: {e}"),
            })
    }

    fn define_domain(&self, xml: &str) -> Result<DomainHandle> {
        let dom = Domain::define_xml(self.conn()?, xml)
            .map_err(|e| ProvisionError::Definition(e.to_string()))?;
        let name = dom
            .get_name()
            .map_err(|e| ProvisionError::Definition(e.to_string()))?;
        Self::handle(&name, &dom)
    }

    fn start_domain(&self, domain: &DomainHandle) -> Result<()> {
        let dom = self.domain(&domain.name)?;
        dom.create().map_err(|e| ProvisionError::Start {
            domain: domain.name.clone(),
            reason: e.to_string(),
        })?;
        info!("Successfully submitted libvirt domain {} for startup", domain.name);
        Ok(())
    }

    fn list_domains(&self, include_inactive: bool) -> Result<Vec<DomainHandle>> {
        let mut flags = sys::VIR_CONNECT_LIST_DOMAINS_ACTIVE;
        if include_inactive {
            flags |= sys::VIR_CONNECT_LIST_DOMAINS_INACTIVE;
        }
        let doms = self
            .conn()?
            .list_all_domains(flags)
            .map_err(|e| ProvisionError::Connection(format!("Unable to get domain list: {e}")))?;
        let mut handles = Vec::with_capacity(doms.len());
        for dom in doms {
            match dom.get_name() {
                Ok(name) => handles.push(Self::handle(&name, &dom)?),
                Err(_e) => {
                    warn!("The domain had no name: {}", dom.get_id().unwrap_or_default());
                }
            }
        }
        Ok(handles)
    }
}
