/*
* Provisioning Pipeline
* ---------------------
* One machine request, five steps, executed strictly in this order:
*
*   pickNode -> createSchematic -> uploadISO -> syncVM -> startVM
*
* Every step is re-entrant. The orchestrator owns the ProvisioningState and hands it
* to us on each invocation, so anything that has to survive a restart lives there
* and nowhere else. Long remote operations (ISO download, VM create, cloud-init
* upload, VM start) are recorded as task ids and re-polled on the next call instead
* of being waited on, which keeps every step short and cancellable by simply
* dropping its future.
*
* Deprovisioning is the odd one out: it stops and deletes the VM in one go and
* polls the remote tasks itself, racing a CancellationToken the whole way.
*/

use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, Instrument};
use uuid::Uuid;

use crate::config::ProvisioningSettings;
use crate::core::cloud_init::{cidata_file_name, NoCloud};
use crate::core::image::{image_file_name, image_url, ISO_CONTENT};
use crate::core::machine::{MachineConfig, ProvisioningState};
use crate::core::node_selector::select_node;
use crate::core::step::{MachineRequest, ProvisionStep, SchematicOptions, StepResult};
use crate::core::storage_selector::pick_storage;
use crate::core::task::{self, TaskPoll};
use crate::core::vm_options::{build_vm_options, VmSpec};
use crate::errors::{ApiError, ApiResult, ProviderError, ProviderResult, SelectionError};
use crate::predicate::{ExprParser, PredicateParser};
use crate::proxmox::{ProxmoxApi, StoragePool, Upid, VmOption};

pub const GUEST_AGENT_EXTENSION: &str = "siderolabs/qemu-guest-agent";
const CIDATA_DRIVE: &str = "ide0";

pub struct Provisioner<A> {
    api: A,
    parser: Box<dyn PredicateParser>,
    settings: ProvisioningSettings,
}

impl<A: ProxmoxApi> Provisioner<A> {
    pub fn new(api: A, settings: ProvisioningSettings) -> Self {
        Self {
            api,
            parser: Box::new(ExprParser),
            settings,
        }
    }

    /// Swaps the storage selector language.
    pub fn with_parser(mut self, parser: impl PredicateParser + 'static) -> Self {
        self.parser = Box::new(parser);
        self
    }

    pub fn api(&self) -> &A {
        &self.api
    }

    pub fn settings(&self) -> &ProvisioningSettings {
        &self.settings
    }

    pub fn steps(&self) -> &'static [ProvisionStep] {
        &ProvisionStep::ALL
    }

    /// Runs one invocation of `step`. Errors come back as
    /// [`StepResult::Fail`].
    pub async fn run_step<R>(
        &self,
        step: ProvisionStep,
        request: &R,
        state: &mut ProvisioningState,
    ) -> StepResult
    where
        R: MachineRequest + ?Sized,
    {
        let span = info_span!("step", step = step.name(), request = request.request_id());

        let result = async {
            match step {
                ProvisionStep::PickNode => self.pick_node(request, state).await,
                ProvisionStep::CreateSchematic => self.create_schematic(request, state).await,
                ProvisionStep::UploadIso => self.upload_iso(request, state).await,
                ProvisionStep::SyncVm => self.sync_vm(request, state).await,
                ProvisionStep::StartVm => self.start_vm(request, state).await,
            }
        }
        .instrument(span.clone())
        .await;

        if let Err(err) = &result {
            let _entered = span.enter();
            if err.is_cancelled() {
                info!(%err, "step cancelled");
            } else {
                error!(%err, "step failed");
            }
        }

        result.into()
    }

    async fn pick_node<R>(&self, request: &R, state: &mut ProvisioningState) -> ProviderResult<StepResult>
    where
        R: MachineRequest + ?Sized,
    {
        if !state.node.is_empty() {
            return Ok(StepResult::Continue);
        }

        let config = MachineConfig::from_provider_data(request.provider_data())?;
        state.node = select_node(&self.api, config.pinned_node(), request.request_set_id()).await?;

        Ok(StepResult::Continue)
    }

    async fn create_schematic<R>(
        &self,
        request: &R,
        state: &mut ProvisioningState,
    ) -> ProviderResult<StepResult>
    where
        R: MachineRequest + ?Sized,
    {
        if !state.schematic.is_empty() {
            return Ok(StepResult::Continue);
        }

        // the ISO carries the join config through cloud-init, keep it out of
        // the kernel args
        let options = SchematicOptions {
            extra_extensions: vec![GUEST_AGENT_EXTENSION.to_string()],
            with_connection_params: false,
        };

        state.schematic = request
            .generate_schematic_id(&options)
            .await
            .map_err(|e| ProviderError::Schematic(format!("{e:#}")))?;

        info!(schematic = %state.schematic, "generated schematic");

        Ok(StepResult::Continue)
    }

    async fn upload_iso<R>(&self, request: &R, state: &mut ProvisioningState) -> ProviderResult<StepResult>
    where
        R: MachineRequest + ?Sized,
    {
        require(&state.node, "cannot stage the image before a node is picked")?;
        require(&state.schematic, "cannot stage the image without a schematic")?;

        if !state.volume_upload_task.is_empty() {
            let upid = Upid(state.volume_upload_task.clone());
            match task::poll(&self.api, &upid).await? {
                TaskPoll::Running => return Ok(StepResult::RetryAfter(self.settings.task_poll())),
                TaskPoll::Succeeded => return Ok(StepResult::Continue),
                TaskPoll::Failed(err) if err.status() == Some("stopped") => {
                    info!(task = %upid, "retrying download");
                    state.volume_upload_task.clear();
                }
                TaskPoll::Failed(err) => return Err(err.into()),
            }
        }

        state.talos_version = request.talos_version().to_string();

        let url = image_url(
            &self.settings.image_factory_url,
            &state.schematic,
            &state.talos_version,
        )?;
        state.volume_id = image_file_name(&url);

        let storage = self.iso_storage(&state.node).await?;
        if self
            .find_iso(&state.node, &storage.storage, &state.volume_id)
            .await?
            .is_some()
        {
            info!(volume_id = %state.volume_id, "ISO image already present");
            return Ok(StepResult::Continue);
        }

        let upid = self
            .api
            .download_url(
                &state.node,
                &storage.storage,
                ISO_CONTENT,
                &state.volume_id,
                url.as_str(),
            )
            .await?;

        info!(volume_id = %state.volume_id, task = %upid, "uploading new ISO image");
        state.volume_upload_task = upid.0;

        Ok(StepResult::RetryAfter(self.settings.download_retry()))
    }

    async fn sync_vm<R>(&self, request: &R, state: &mut ProvisioningState) -> ProviderResult<StepResult>
    where
        R: MachineRequest + ?Sized,
    {
        if !state.vm_create_task.is_empty() {
            let upid = Upid(state.vm_create_task.clone());
            return task::poll(&self.api, &upid)
                .await?
                .into_step(self.settings.task_poll());
        }

        require(&state.node, "cannot create the VM before a node is picked")?;
        require(&state.volume_id, "cannot create the VM before the ISO is staged")?;
        if state.vmid != 0 {
            return Err(ProviderError::inconsistent(format!(
                "VM {} is recorded without a create task",
                state.vmid
            )));
        }

        if state.uuid.is_empty() {
            state.uuid = Uuid::new_v4().to_string();
            request.set_machine_uuid(&state.uuid);
        }

        let config = MachineConfig::from_provider_data(request.provider_data())?;
        let node = state.node.clone();

        let vmid = self.api.next_vmid().await?;

        let iso_storage = self.iso_storage(&node).await?;
        let iso = self
            .find_iso(&node, &iso_storage.storage, &state.volume_id)
            .await?
            .ok_or_else(|| ApiError::NotFound {
                resource: format!("ISO image {} on storage {}", state.volume_id, iso_storage.storage),
            })?;

        let storage = pick_storage(&self.api, self.parser.as_ref(), &node, &config.storage_selector).await?;

        let mut additional_storages = Vec::with_capacity(config.additional_disks.len());
        for (i, disk) in config.additional_disks.iter().enumerate() {
            let picked = pick_storage(&self.api, self.parser.as_ref(), &node, &disk.storage_selector)
                .await
                .map_err(|source| ProviderError::AdditionalDisk { index: i + 1, source })?;
            additional_storages.push(picked);
        }

        let options = build_vm_options(
            &config,
            &VmSpec {
                uuid: &state.uuid,
                name: request.request_id(),
                iso_volume: &iso,
                storage: &storage,
                additional_storages: &additional_storages,
                request_set_id: request.request_set_id(),
            },
        );

        let upid = self.api.create_vm(&node, vmid, &options).await?;
        info!(node = %node, vmid, task = %upid, storage = %storage, "creating VM");

        state.vm_create_task = upid.0;
        state.vmid = vmid;

        Ok(StepResult::RetryAfter(self.settings.vm_create_retry()))
    }

    async fn start_vm<R>(&self, request: &R, state: &mut ProvisioningState) -> ProviderResult<StepResult>
    where
        R: MachineRequest + ?Sized,
    {
        if !state.vm_start_task.is_empty() {
            let upid = Upid(state.vm_start_task.clone());
            return task::poll(&self.api, &upid)
                .await?
                .into_step(self.settings.task_poll());
        }

        require(&state.node, "cannot start the VM before a node is picked")?;
        if state.vmid == 0 {
            return Err(ProviderError::inconsistent("cannot start the VM before it is created"));
        }

        let node = state.node.clone();
        let vmid = state.vmid;

        self.api.virtual_machine(&node, vmid).await?;

        if let Some(join_config) = request.join_config() {
            if state.cidata_upload_task.is_empty() {
                let upid = self.upload_cloud_init(request, state, join_config).await?;
                state.cidata_upload_task = upid.0;
                return Ok(StepResult::RetryAfter(self.settings.download_retry()));
            }

            // the volume has to exist before it can be attached
            let upid = Upid(state.cidata_upload_task.clone());
            match task::poll(&self.api, &upid).await? {
                TaskPoll::Running => return Ok(StepResult::RetryAfter(self.settings.download_retry())),
                TaskPoll::Succeeded => self.attach_cloud_init(state).await?,
                TaskPoll::Failed(err) => return Err(err.into()),
            }
        }

        let upid = self.api.start_vm(&node, vmid).await?;
        info!(node = %node, vmid, task = %upid, "starting VM");
        state.vm_start_task = upid.0;

        Ok(StepResult::RetryAfter(self.settings.vm_start_retry()))
    }

    /// Builds the NoCloud volume and starts copying it into the node's image
    /// store.
    async fn upload_cloud_init<R>(
        &self,
        request: &R,
        state: &ProvisioningState,
        join_config: &str,
    ) -> ProviderResult<Upid>
    where
        R: MachineRequest + ?Sized,
    {
        let talos_version = if state.talos_version.is_empty() {
            request.talos_version()
        } else {
            &state.talos_version
        };

        let image = NoCloud::new(join_config, talos_version, request.request_id(), &state.uuid)?
            .to_vfat()?;

        let storage = self.iso_storage(&state.node).await?;
        let file_name = cidata_file_name(state.vmid);

        let upid = self
            .api
            .upload_file(&state.node, &storage.storage, ISO_CONTENT, &file_name, image)
            .await?;

        info!(vmid = state.vmid, volume = %file_name, task = %upid, "uploading cloud-init volume");

        Ok(upid)
    }

    async fn attach_cloud_init(&self, state: &ProvisioningState) -> ProviderResult<()> {
        let storage = self.iso_storage(&state.node).await?;
        let file_name = cidata_file_name(state.vmid);

        let drive = VmOption::new(
            CIDATA_DRIVE,
            format!("{}:{ISO_CONTENT}/{file_name},media=cdrom", storage.storage),
        );
        self.api
            .update_vm_config(&state.node, state.vmid, &[drive])
            .await?;

        info!(vmid = state.vmid, volume = %file_name, "attached cloud-init volume");

        Ok(())
    }

    /// Stops and deletes the VM recorded in `state`. Succeeds when there is
    /// nothing to remove.
    pub async fn deprovision(
        &self,
        state: &ProvisioningState,
        request_id: &str,
        cancel: &CancellationToken,
    ) -> ProviderResult<()> {
        let span = info_span!("deprovision", request = request_id, vmid = state.vmid);

        let result = self.remove_vm(state, cancel).instrument(span.clone()).await;

        if let Err(err) = &result {
            let _entered = span.enter();
            if err.is_cancelled() {
                info!(%err, "deprovision cancelled");
            } else {
                error!(%err, "deprovision failed");
            }
        }

        result
    }

    async fn remove_vm(&self, state: &ProvisioningState, cancel: &CancellationToken) -> ProviderResult<()> {
        if state.vmid == 0 {
            return Ok(());
        }

        if state.node.is_empty() {
            return Err(ProviderError::inconsistent("VM is missing the node information"));
        }

        let node = state.node.as_str();
        let vmid = state.vmid;
        let every = self.settings.deprovision_poll();

        match cancellable(cancel, self.api.virtual_machine(node, vmid)).await {
            Ok(_) => {}
            Err(ProviderError::Api(err)) if err.is_not_found() => {
                info!(node, vmid, "VM is already gone");
                return Ok(());
            }
            Err(err) => return Err(err),
        }

        let upid = cancellable(cancel, self.api.stop_vm(node, vmid)).await?;
        info!(node, vmid, task = %upid, "stopping VM");
        task::wait_for_task(&self.api, &upid, every, cancel).await?;

        let upid = cancellable(cancel, self.api.delete_vm(node, vmid)).await?;
        info!(node, vmid, task = %upid, "deleting VM");
        task::wait_for_task(&self.api, &upid, every, cancel).await?;

        Ok(())
    }

    /// First storage on the node that takes ISO images.
    async fn iso_storage(&self, node: &str) -> ProviderResult<StoragePool> {
        let pools = self
            .api
            .storages(node)
            .await
            .map_err(|source| SelectionError::StorageListing {
                node: node.to_string(),
                source,
            })?;

        pools
            .into_iter()
            .find(|pool| pool.accepts(ISO_CONTENT))
            .ok_or_else(|| {
                SelectionError::NoIsoStorage {
                    node: node.to_string(),
                }
                .into()
            })
    }

    /// Volume id of `file_name` in the storage, if it has been staged.
    async fn find_iso(&self, node: &str, storage: &str, file_name: &str) -> ProviderResult<Option<String>> {
        let volumes = self.api.storage_content(node, storage, ISO_CONTENT).await?;
        Ok(volumes
            .into_iter()
            .find(|volume| volume.file_name() == file_name)
            .map(|volume| volume.volid))
    }
}

fn require(field: &str, message: &str) -> ProviderResult<()> {
    if field.is_empty() {
        return Err(ProviderError::inconsistent(message));
    }
    Ok(())
}

async fn cancellable<T>(
    cancel: &CancellationToken,
    call: impl std::future::Future<Output = ApiResult<T>>,
) -> ProviderResult<T> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(ProviderError::Cancelled("deprovision interrupted".to_string())),
        result = call => Ok(result?),
    }
}
