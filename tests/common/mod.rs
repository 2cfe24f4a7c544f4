// In-memory Proxmox cluster and a scripted machine request, shared by the
// integration suites.
#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use proxmox_infra_provider::core::{MachineRequest, SchematicOptions};
use proxmox_infra_provider::errors::{ApiError, ApiResult};
use proxmox_infra_provider::proxmox::{
    ClusterNode, ProxmoxApi, StoragePool, StorageVolume, TaskStatus, Upid, VmOption, VmSummary,
};

pub fn ok() -> TaskStatus {
    TaskStatus {
        status: "stopped".into(),
        exitstatus: Some("OK".into()),
    }
}

pub fn running() -> TaskStatus {
    TaskStatus {
        status: "running".into(),
        exitstatus: None,
    }
}

pub fn failed(exit: &str) -> TaskStatus {
    TaskStatus {
        status: "stopped".into(),
        exitstatus: Some(exit.into()),
    }
}

/// What a task does to the cluster once it reports success.
#[derive(Debug, Clone)]
enum Effect {
    None,
    AddVolume { node: String, storage: String, volid: String },
    RemoveVm { node: String, vmid: u32 },
}

#[derive(Debug)]
struct Task {
    script: VecDeque<TaskStatus>,
    effect: Effect,
}

#[derive(Default)]
struct Inner {
    nodes: Vec<ClusterNode>,
    vms: HashMap<String, Vec<VmSummary>>,
    storages: HashMap<String, Vec<StoragePool>>,
    volumes: HashMap<(String, String), Vec<StorageVolume>>,
    tasks: HashMap<String, Task>,
    scripts: VecDeque<Vec<TaskStatus>>,
    task_counter: u32,
    next_vmid: u32,
    calls: Vec<String>,
    created: Vec<(String, u32, Vec<VmOption>)>,
    config_updates: Vec<(u32, Vec<VmOption>)>,
    uploads: Vec<(String, String, Vec<u8>)>,
}

impl Inner {
    fn new_task(&mut self, node: &str, kind: &str, effect: Effect) -> Upid {
        self.task_counter += 1;
        let upid = format!(
            "UPID:{node}:{:08X}:00C0FFEE:6700{:04X}:{kind}:{}:root@pam:",
            self.task_counter, self.task_counter, self.task_counter
        );
        let script = self
            .scripts
            .pop_front()
            .unwrap_or_else(|| vec![ok()])
            .into();
        self.tasks.insert(upid.clone(), Task { script, effect });
        Upid(upid)
    }

    fn apply(&mut self, effect: Effect) {
        match effect {
            Effect::None => {}
            Effect::AddVolume { node, storage, volid } => {
                self.volumes.entry((node, storage)).or_default().push(StorageVolume {
                    volid,
                    size: 1024,
                    format: Some("iso".into()),
                });
            }
            Effect::RemoveVm { node, vmid } => {
                if let Some(vms) = self.vms.get_mut(&node) {
                    vms.retain(|vm| vm.vmid != vmid);
                }
            }
        }
    }
}

/// A cluster living in memory. Tasks succeed on their first poll unless a
/// script was queued with [`FakeCluster::script_next_task`].
#[derive(Clone, Default)]
pub struct FakeCluster {
    inner: Arc<Mutex<Inner>>,
}

impl FakeCluster {
    pub fn new() -> Self {
        let cluster = Self::default();
        cluster.inner.lock().unwrap().next_vmid = 100;
        cluster
    }

    pub fn with_node(self, name: &str, status: &str, mem: u64, maxmem: u64) -> Self {
        self.inner.lock().unwrap().nodes.push(ClusterNode {
            node: name.into(),
            status: status.into(),
            mem,
            maxmem,
        });
        self
    }

    pub fn with_storage(self, node: &str, name: &str, storage_type: &str, content: &str, avail: u64) -> Self {
        self.inner
            .lock()
            .unwrap()
            .storages
            .entry(node.into())
            .or_default()
            .push(StoragePool {
                storage: name.into(),
                storage_type: storage_type.into(),
                content: content.into(),
                avail,
            });
        self
    }

    pub fn with_vm(self, node: &str, vmid: u32, tags: Option<&str>) -> Self {
        self.inner
            .lock()
            .unwrap()
            .vms
            .entry(node.into())
            .or_default()
            .push(VmSummary {
                vmid,
                name: Some(format!("vm-{vmid}")),
                status: "running".into(),
                tags: tags.map(str::to_string),
            });
        self
    }

    pub fn with_volume(self, node: &str, storage: &str, file_name: &str) -> Self {
        self.inner
            .lock()
            .unwrap()
            .apply(Effect::AddVolume {
                node: node.into(),
                storage: storage.into(),
                volid: format!("{storage}:iso/{file_name}"),
            });
        self
    }

    /// Status sequence for the next task created; the last entry repeats.
    pub fn script_next_task(&self, statuses: Vec<TaskStatus>) {
        self.inner.lock().unwrap().scripts.push_back(statuses);
    }

    pub fn add_task(&self, node: &str, kind: &str, statuses: Vec<TaskStatus>) -> Upid {
        let mut inner = self.inner.lock().unwrap();
        inner.scripts.push_front(statuses);
        inner.new_task(node, kind, Effect::None)
    }

    pub fn calls(&self) -> Vec<String> {
        self.inner.lock().unwrap().calls.clone()
    }

    pub fn calls_starting_with(&self, prefix: &str) -> usize {
        self.calls().iter().filter(|c| c.starts_with(prefix)).count()
    }

    pub fn created(&self) -> Vec<(String, u32, Vec<VmOption>)> {
        self.inner.lock().unwrap().created.clone()
    }

    pub fn config_updates(&self) -> Vec<(u32, Vec<VmOption>)> {
        self.inner.lock().unwrap().config_updates.clone()
    }

    pub fn uploads(&self) -> Vec<(String, String, Vec<u8>)> {
        self.inner.lock().unwrap().uploads.clone()
    }

    pub fn vm_exists(&self, node: &str, vmid: u32) -> bool {
        self.inner
            .lock()
            .unwrap()
            .vms
            .get(node)
            .map(|vms| vms.iter().any(|vm| vm.vmid == vmid))
            .unwrap_or(false)
    }

    fn record(&self, call: String) {
        self.inner.lock().unwrap().calls.push(call);
    }
}

fn option<'a>(options: &'a [VmOption], name: &str) -> Option<&'a str> {
    options
        .iter()
        .find(|o| o.name == name)
        .map(|o| o.value.as_str())
}

#[async_trait]
impl ProxmoxApi for FakeCluster {
    async fn nodes(&self) -> ApiResult<Vec<ClusterNode>> {
        self.record("nodes".into());
        Ok(self.inner.lock().unwrap().nodes.clone())
    }

    async fn virtual_machines(&self, node: &str) -> ApiResult<Vec<VmSummary>> {
        self.record(format!("virtual_machines {node}"));
        Ok(self
            .inner
            .lock()
            .unwrap()
            .vms
            .get(node)
            .cloned()
            .unwrap_or_default())
    }

    async fn storages(&self, node: &str) -> ApiResult<Vec<StoragePool>> {
        self.record(format!("storages {node}"));
        Ok(self
            .inner
            .lock()
            .unwrap()
            .storages
            .get(node)
            .cloned()
            .unwrap_or_default())
    }

    async fn storage_content(
        &self,
        node: &str,
        storage: &str,
        _content: &str,
    ) -> ApiResult<Vec<StorageVolume>> {
        self.record(format!("storage_content {node} {storage}"));
        Ok(self
            .inner
            .lock()
            .unwrap()
            .volumes
            .get(&(node.to_string(), storage.to_string()))
            .cloned()
            .unwrap_or_default())
    }

    async fn download_url(
        &self,
        node: &str,
        storage: &str,
        content: &str,
        filename: &str,
        url: &str,
    ) -> ApiResult<Upid> {
        self.record(format!("download_url {node} {storage} {content} {filename} {url}"));
        let mut inner = self.inner.lock().unwrap();
        Ok(inner.new_task(
            node,
            "download",
            Effect::AddVolume {
                node: node.into(),
                storage: storage.into(),
                volid: format!("{storage}:{content}/{filename}"),
            },
        ))
    }

    async fn upload_file(
        &self,
        node: &str,
        storage: &str,
        content: &str,
        filename: &str,
        data: Vec<u8>,
    ) -> ApiResult<Upid> {
        self.record(format!("upload_file {node} {storage} {content} {filename}"));
        let mut inner = self.inner.lock().unwrap();
        inner
            .uploads
            .push((storage.to_string(), filename.to_string(), data));
        Ok(inner.new_task(
            node,
            "imgcopy",
            Effect::AddVolume {
                node: node.into(),
                storage: storage.into(),
                volid: format!("{storage}:{content}/{filename}"),
            },
        ))
    }

    async fn next_vmid(&self) -> ApiResult<u32> {
        self.record("next_vmid".into());
        let mut inner = self.inner.lock().unwrap();
        let vmid = inner.next_vmid;
        inner.next_vmid += 1;
        Ok(vmid)
    }

    async fn create_vm(&self, node: &str, vmid: u32, options: &[VmOption]) -> ApiResult<Upid> {
        self.record(format!("create_vm {node} {vmid}"));
        let mut inner = self.inner.lock().unwrap();
        inner
            .created
            .push((node.to_string(), vmid, options.to_vec()));
        inner.vms.entry(node.into()).or_default().push(VmSummary {
            vmid,
            name: option(options, "name").map(str::to_string),
            status: "stopped".into(),
            tags: option(options, "tags").map(str::to_string),
        });
        Ok(inner.new_task(node, "qmcreate", Effect::None))
    }

    async fn update_vm_config(&self, node: &str, vmid: u32, options: &[VmOption]) -> ApiResult<()> {
        self.record(format!("update_vm_config {node} {vmid}"));
        self.inner
            .lock()
            .unwrap()
            .config_updates
            .push((vmid, options.to_vec()));
        Ok(())
    }

    async fn virtual_machine(&self, node: &str, vmid: u32) -> ApiResult<VmSummary> {
        self.record(format!("virtual_machine {node} {vmid}"));
        self.inner
            .lock()
            .unwrap()
            .vms
            .get(node)
            .and_then(|vms| vms.iter().find(|vm| vm.vmid == vmid).cloned())
            .ok_or_else(|| ApiError::NotFound {
                resource: format!("VM {vmid} on node {node}"),
            })
    }

    async fn start_vm(&self, node: &str, vmid: u32) -> ApiResult<Upid> {
        self.record(format!("start_vm {node} {vmid}"));
        Ok(self.inner.lock().unwrap().new_task(node, "qmstart", Effect::None))
    }

    async fn stop_vm(&self, node: &str, vmid: u32) -> ApiResult<Upid> {
        self.record(format!("stop_vm {node} {vmid}"));
        Ok(self.inner.lock().unwrap().new_task(node, "qmstop", Effect::None))
    }

    async fn delete_vm(&self, node: &str, vmid: u32) -> ApiResult<Upid> {
        self.record(format!("delete_vm {node} {vmid}"));
        Ok(self.inner.lock().unwrap().new_task(
            node,
            "qmdestroy",
            Effect::RemoveVm {
                node: node.into(),
                vmid,
            },
        ))
    }

    async fn task_status(&self, upid: &Upid) -> ApiResult<TaskStatus> {
        self.record(format!("task_status {upid}"));
        let mut inner = self.inner.lock().unwrap();

        let task = inner
            .tasks
            .get_mut(upid.as_str())
            .ok_or_else(|| ApiError::NotFound {
                resource: format!("task {upid}"),
            })?;

        let status = if task.script.len() > 1 {
            task.script.pop_front().unwrap()
        } else {
            task.script.front().cloned().unwrap_or_else(ok)
        };

        if status.is_successful() {
            let effect = std::mem::replace(&mut task.effect, Effect::None);
            inner.apply(effect);
        }

        Ok(status)
    }
}

/// Machine request with fixed answers; counts schematic generations.
pub struct TestRequest {
    pub request_id: String,
    pub request_set_id: Option<String>,
    pub talos_version: String,
    pub provider_data: String,
    pub join_config: Option<String>,
    pub schematic: String,
    pub schematic_calls: Mutex<Vec<SchematicOptions>>,
    pub machine_uuids: Mutex<Vec<String>>,
}

impl TestRequest {
    pub fn new(provider_data: &str) -> Self {
        Self {
            request_id: "workers-7f3k2".into(),
            request_set_id: Some("workers".into()),
            talos_version: "v1.12.1".into(),
            provider_data: provider_data.into(),
            join_config: Some("apiVersion: v1alpha1\nkind: SideroLinkConfig\napiUrl: https://omni.example:8090\n".into()),
            schematic: "376567988ad370138ad8b2698212367b8edcb69b5fd68c80be1f2ec7d603b4ba".into(),
            schematic_calls: Mutex::new(Vec::new()),
            machine_uuids: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl MachineRequest for TestRequest {
    fn request_id(&self) -> &str {
        &self.request_id
    }

    fn request_set_id(&self) -> Option<&str> {
        self.request_set_id.as_deref()
    }

    fn talos_version(&self) -> &str {
        &self.talos_version
    }

    fn provider_data(&self) -> &str {
        &self.provider_data
    }

    async fn generate_schematic_id(&self, options: &SchematicOptions) -> anyhow::Result<String> {
        self.schematic_calls.lock().unwrap().push(options.clone());
        Ok(self.schematic.clone())
    }

    fn set_machine_uuid(&self, uuid: &str) {
        self.machine_uuids.lock().unwrap().push(uuid.to_string());
    }

    fn join_config(&self) -> Option<&str> {
        self.join_config.as_deref()
    }
}

/// Two online nodes, each with an ISO store and an LVM thin pool.
pub fn two_node_cluster() -> FakeCluster {
    FakeCluster::new()
        .with_node("pve1", "online", 40, 100)
        .with_node("pve2", "online", 70, 100)
        .with_storage("pve1", "local", "dir", "iso,vztmpl,backup", 50 << 30)
        .with_storage("pve1", "local-lvm", "lvmthin", "images,rootdir", 400 << 30)
        .with_storage("pve2", "local", "dir", "iso,vztmpl,backup", 50 << 30)
        .with_storage("pve2", "local-lvm", "lvmthin", "images,rootdir", 100 << 30)
        .with_storage("pve2", "tank", "zfspool", "images", 2000 << 30)
}

pub const PROVIDER_DATA: &str = r#"
cores: 2
sockets: 1
memory: 4096
disk_size: 20
storage_selector: storageType == "lvmthin"
"#;
