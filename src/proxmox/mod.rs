pub mod client;
pub mod types;

use async_trait::async_trait;

use crate::errors::ApiResult;

pub use client::ProxmoxClient;
pub use types::{ClusterNode, StoragePool, StorageVolume, TaskStatus, Upid, VmOption, VmSummary};

/// The slice of the Proxmox VE API the provider talks to.
///
/// Every call hits the cluster; implementations must not cache node, storage
/// or VM listings between calls.
#[async_trait]
pub trait ProxmoxApi: Send + Sync {
    async fn nodes(&self) -> ApiResult<Vec<ClusterNode>>;

    async fn virtual_machines(&self, node: &str) -> ApiResult<Vec<VmSummary>>;

    async fn storages(&self, node: &str) -> ApiResult<Vec<StoragePool>>;

    async fn storage_content(
        &self,
        node: &str,
        storage: &str,
        content: &str,
    ) -> ApiResult<Vec<StorageVolume>>;

    async fn download_url(
        &self,
        node: &str,
        storage: &str,
        content: &str,
        filename: &str,
        url: &str,
    ) -> ApiResult<Upid>;

    async fn upload_file(
        &self,
        node: &str,
        storage: &str,
        content: &str,
        filename: &str,
        data: Vec<u8>,
    ) -> ApiResult<Upid>;

    async fn next_vmid(&self) -> ApiResult<u32>;

    async fn create_vm(&self, node: &str, vmid: u32, options: &[VmOption]) -> ApiResult<Upid>;

    async fn update_vm_config(&self, node: &str, vmid: u32, options: &[VmOption]) -> ApiResult<()>;

    /// Fails with [`crate::errors::ApiError::NotFound`] when the VM is not
    /// present on the node.
    async fn virtual_machine(&self, node: &str, vmid: u32) -> ApiResult<VmSummary>;

    async fn start_vm(&self, node: &str, vmid: u32) -> ApiResult<Upid>;

    async fn stop_vm(&self, node: &str, vmid: u32) -> ApiResult<Upid>;

    async fn delete_vm(&self, node: &str, vmid: u32) -> ApiResult<Upid>;

    async fn task_status(&self, upid: &Upid) -> ApiResult<TaskStatus>;
}
