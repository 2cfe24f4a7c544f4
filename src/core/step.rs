use std::fmt;
use std::time::Duration;

use async_trait::async_trait;

use crate::errors::{ProviderError, ProviderResult};

/// Outcome of one step invocation.
#[derive(Debug)]
pub enum StepResult {
    /// The step is done, move on to the next one.
    Continue,
    /// Invoke the same step again once the delay has passed.
    RetryAfter(Duration),
    /// Terminal failure, provisioning stops here.
    Fail(ProviderError),
}

impl StepResult {
    pub fn is_continue(&self) -> bool {
        matches!(self, StepResult::Continue)
    }
}

impl From<ProviderResult<StepResult>> for StepResult {
    fn from(result: ProviderResult<StepResult>) -> Self {
        result.unwrap_or_else(StepResult::Fail)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProvisionStep {
    PickNode,
    CreateSchematic,
    UploadIso,
    SyncVm,
    StartVm,
}

impl ProvisionStep {
    pub const ALL: [ProvisionStep; 5] = [
        ProvisionStep::PickNode,
        ProvisionStep::CreateSchematic,
        ProvisionStep::UploadIso,
        ProvisionStep::SyncVm,
        ProvisionStep::StartVm,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            ProvisionStep::PickNode => "pickNode",
            ProvisionStep::CreateSchematic => "createSchematic",
            ProvisionStep::UploadIso => "uploadISO",
            ProvisionStep::SyncVm => "syncVM",
            ProvisionStep::StartVm => "startVM",
        }
    }
}

impl fmt::Display for ProvisionStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// What the provider asks of the boot image build.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchematicOptions {
    pub extra_extensions: Vec<String>,
    /// Bake the orchestrator connection parameters into the kernel args.
    pub with_connection_params: bool,
}

/// The orchestrator side of a machine request.
#[async_trait]
pub trait MachineRequest: Send + Sync {
    fn request_id(&self) -> &str;

    /// Grouping shared by sibling requests, used for anti-affinity.
    fn request_set_id(&self) -> Option<&str>;

    fn talos_version(&self) -> &str;

    /// Raw YAML, decoded into [`crate::core::MachineConfig`].
    fn provider_data(&self) -> &str;

    async fn generate_schematic_id(&self, options: &SchematicOptions) -> anyhow::Result<String>;

    /// Reports the SMBIOS UUID the VM is created with, so the booted machine
    /// can be matched back to this request.
    fn set_machine_uuid(&self, uuid: &str);

    /// Machine configuration injected through cloud-init, if any.
    fn join_config(&self) -> Option<&str>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_names_in_order() {
        let names: Vec<_> = ProvisionStep::ALL.iter().map(|s| s.name()).collect();
        assert_eq!(
            names,
            ["pickNode", "createSchematic", "uploadISO", "syncVM", "startVM"]
        );
    }

    #[test]
    fn test_error_becomes_fail() {
        let result: StepResult = Err(ProviderError::inconsistent("no node")).into();
        assert!(matches!(result, StepResult::Fail(ProviderError::InconsistentState(_))));
        assert!(StepResult::from(Ok(StepResult::Continue)).is_continue());
    }
}
