pub mod cloud_init;
pub mod image;
pub mod machine;
pub mod node_selector;
pub mod provisioner;
pub mod step;
pub mod storage_selector;
pub mod task;
pub mod vm_options;

// the pipeline surface, everything else is reachable through the modules
pub use machine::{AdditionalDisk, AdditionalNic, MachineConfig, PciDevice, ProvisioningState};
pub use node_selector::{pick_node, NodeStatus};
pub use provisioner::Provisioner;
pub use step::{MachineRequest, ProvisionStep, SchematicOptions, StepResult};
