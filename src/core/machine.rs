use serde::{Deserialize, Serialize};

use crate::errors::ProviderResult;

pub const DEFAULT_BRIDGE: &str = "vmbr0";
pub const DEFAULT_CPU_TYPE: &str = "x86-64-v2-AES";

/// Hardware, network and storage layout a machine request asks for, decoded
/// from the request's provider data.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MachineConfig {
    /// Pin the VM to this node instead of ranking the cluster.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node: Option<String>,
    pub storage_selector: String,
    pub cores: u32,
    pub sockets: u32,
    /// MiB
    pub memory: u64,
    /// GiB
    pub disk_size: u64,
    pub disk_ssd: bool,
    pub disk_discard: bool,
    pub disk_iothread: bool,
    pub disk_cache: String,
    pub disk_aio: String,
    pub network_bridge: String,
    pub vlan: u64,
    pub machine_type: String,
    pub cpu_type: String,
    pub numa: bool,
    pub hugepages: String,
    /// Unset keeps the Proxmox default, `false` disables the balloon device.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub balloon: Option<bool>,
    pub additional_disks: Vec<AdditionalDisk>,
    pub additional_nics: Vec<AdditionalNic>,
    pub pci_devices: Vec<PciDevice>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdditionalDisk {
    pub storage_selector: String,
    pub disk_size: u64,
    pub disk_cache: String,
    pub disk_aio: String,
    pub disk_ssd: bool,
    pub disk_discard: bool,
    pub disk_iothread: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdditionalNic {
    pub bridge: String,
    pub vlan: u64,
    pub firewall: bool,
}

/// Passthrough through a Proxmox resource mapping.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PciDevice {
    pub mapping: String,
    pub pcie: bool,
    /// Sets `x-vga=1`.
    pub primary_gpu: bool,
    pub rombar: bool,
}

impl MachineConfig {
    pub fn from_provider_data(data: &str) -> ProviderResult<Self> {
        if data.trim().is_empty() {
            return Ok(Self::default());
        }

        Ok(serde_yaml::from_str(data)?)
    }

    pub fn pinned_node(&self) -> Option<&str> {
        self.node.as_deref().filter(|n| !n.is_empty())
    }

    pub fn bridge(&self) -> &str {
        if self.network_bridge.is_empty() {
            DEFAULT_BRIDGE
        } else {
            &self.network_bridge
        }
    }

    pub fn cpu(&self) -> &str {
        if self.cpu_type.is_empty() {
            DEFAULT_CPU_TYPE
        } else {
            &self.cpu_type
        }
    }
}

/// Everything the provider remembers about one machine between step
/// invocations. Owned and persisted by the caller.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvisioningState {
    pub node: String,
    pub schematic: String,
    pub talos_version: String,
    pub volume_id: String,
    pub volume_upload_task: String,
    pub uuid: String,
    pub vm_create_task: String,
    pub vmid: u32,
    /// Upload of the cloud-init volume, attached once it finishes.
    pub cidata_upload_task: String,
    pub vm_start_task: String,
}
