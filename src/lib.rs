pub mod cli;
pub mod config;
pub mod core;
pub mod errors;
pub mod predicate;
pub mod proxmox;

// Re-exports
pub use crate::config::Settings;
pub use crate::core::{MachineConfig, MachineRequest, Provisioner, ProvisioningState, StepResult};
pub use crate::errors::{ProviderError, ProviderResult};
pub use crate::proxmox::{ProxmoxApi, ProxmoxClient};
