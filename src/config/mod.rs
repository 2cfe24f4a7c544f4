pub mod settings;

pub use settings::{clean_env, ProvisioningSettings, ProxmoxSettings, Settings};
