pub mod conn_cache;
pub mod kvm;

use std::collections::HashMap;

use crate::domain_xml::NicOverride;
use crate::error::RangeError;
use crate::model::{Host, ProvisionedGuest};

/// One guest to be cloned under a host, with everything the provider needs
/// to build its overlay, render its domain XML, and attach it to the
/// planned networks.
#[derive(Debug, Clone)]
pub struct CreateGuestSpec {
    pub guest_id: String,
    pub basevm_config_file: Option<String>,
    pub host: Host,
    pub memory_kib: u64,
    pub vcpus: u32,
    pub disk_size: String,
    pub interfaces: Vec<NicOverride>,
    pub seed_user_data: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceStatus {
    Active,
    Stopped,
    Paused,
    Unknown,
    NotFound,
    Error,
}

impl std::fmt::Display for ResourceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ResourceStatus::Active => "active",
            ResourceStatus::Stopped => "stopped",
            ResourceStatus::Paused => "paused",
            ResourceStatus::Unknown => "unknown",
            ResourceStatus::NotFound => "not_found",
            ResourceStatus::Error => "error",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone)]
pub struct ResourceInfo {
    pub domain_name: String,
    pub memory_kib: u64,
    pub vcpus: u32,
    pub ip: Option<String>,
}

/// Public surface of a hypervisor provider. `KvmProvider` is the
/// only implementation; a future cloud provider (`aws`, reserved in
/// [`crate::model::BaseVmKind`]) would implement the same trait.
#[allow(async_fn_in_trait)]
pub trait Provider {
    async fn create_hosts(&self, hosts: &[Host]) -> Result<(), RangeError>;
    async fn destroy_hosts(&self, hosts: &[Host]) -> Result<(), RangeError>;

    async fn create_guests(
        &self,
        range_id: &str,
        specs: &[CreateGuestSpec],
    ) -> Result<Vec<ProvisionedGuest>, RangeError>;

    async fn destroy_guests(&self, domain_names: &[String]) -> Result<(), RangeError>;

    async fn status(&self, domain_names: &[String]) -> HashMap<String, ResourceStatus>;

    async fn resource_info(&self, domain_name: &str) -> Result<ResourceInfo, RangeError>;

    async fn clone_vm(
        &self,
        range_id: &str,
        spec: &CreateGuestSpec,
    ) -> Result<ProvisionedGuest, RangeError>;

    async fn get_vm_ip(&self, domain_name: &str, mac: &str) -> Result<String, RangeError>;

    async fn get_ssh_info(
        &self,
        domain_name: &str,
        mac: &str,
        account: &str,
    ) -> Result<(String, u16, String), RangeError>;
}
