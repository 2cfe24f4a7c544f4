/*
* Provider Configuration
* ----------------------
* Layered settings for the Proxmox infrastructure provider, lowest priority first:
*
* 1. Hardcoded defaults (sane enough to boot, not enough to connect)
* 2. An optional config file passed with --config-file (YAML or TOML)
* 3. PROXMOX_* environment variables, for the folks who keep secrets out of files
*
* Sections:
* --------
* proxmox:       where the API lives and how we authenticate against it
* provisioning:  image factory location and the retry/poll cadence of the steps
*
* Env values are cleaned before use: surrounding whitespace goes, and so does one
* pair of matching quotes (docker --env-file keeps them, we don't).
*/

use std::path::Path;
use std::time::Duration;

use config::{Config, ConfigError, File};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

pub const DEFAULT_IMAGE_FACTORY_URL: &str = "https://factory.talos.dev";

const MISSING_URL: &str = "proxmox URL is required (set via config file or PROXMOX_URL env var)";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub proxmox: ProxmoxSettings,
    #[serde(default)]
    pub provisioning: ProvisioningSettings,
}

/// Connection and credentials for the Proxmox API.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxmoxSettings {
    pub url: String,
    pub username: String,
    pub password: String,
    pub realm: String,
    #[serde(alias = "tokenID", alias = "tokenid")]
    pub token_id: String,
    #[serde(alias = "tokenSecret", alias = "tokensecret")]
    pub token_secret: String,
    pub token: String,
    #[serde(alias = "insecureSkipVerify", alias = "insecureskipverify")]
    pub insecure_skip_verify: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvisioningSettings {
    pub image_factory_url: String,
    /// Delay after a download has been started.
    pub download_retry_secs: u64,
    /// Delay while a tracked task is still running.
    pub task_poll_secs: u64,
    pub vm_create_retry_secs: u64,
    pub vm_start_retry_secs: u64,
    pub deprovision_poll_secs: u64,
}

impl Default for ProvisioningSettings {
    fn default() -> Self {
        Self {
            image_factory_url: DEFAULT_IMAGE_FACTORY_URL.to_string(),
            download_retry_secs: 1,
            task_poll_secs: 10,
            vm_create_retry_secs: 10,
            vm_start_retry_secs: 1,
            deprovision_poll_secs: 5,
        }
    }
}

impl ProvisioningSettings {
    pub fn download_retry(&self) -> Duration {
        Duration::from_secs(self.download_retry_secs)
    }

    pub fn task_poll(&self) -> Duration {
        Duration::from_secs(self.task_poll_secs)
    }

    pub fn vm_create_retry(&self) -> Duration {
        Duration::from_secs(self.vm_create_retry_secs)
    }

    pub fn vm_start_retry(&self) -> Duration {
        Duration::from_secs(self.vm_start_retry_secs)
    }

    pub fn deprovision_poll(&self) -> Duration {
        // a zero period would make tokio's interval panic
        Duration::from_secs(self.deprovision_poll_secs.max(1))
    }
}

const STRING_OVERRIDES: [(&str, &str); 7] = [
    ("proxmox.url", "PROXMOX_URL"),
    ("proxmox.username", "PROXMOX_USERNAME"),
    ("proxmox.password", "PROXMOX_PASSWORD"),
    ("proxmox.realm", "PROXMOX_REALM"),
    ("proxmox.token_id", "PROXMOX_TOKEN_ID"),
    ("proxmox.token_secret", "PROXMOX_TOKEN_SECRET"),
    ("proxmox.token", "PROXMOX_TOKEN"),
];

impl Settings {
    /// Loads settings from the process environment and an optional file.
    pub fn new(config_file: Option<&Path>) -> Result<Self, ConfigError> {
        Self::load(config_file, |key| std::env::var(key).ok())
    }

    /// Same as [`Settings::new`] with an injectable environment lookup.
    pub fn load<F>(config_file: Option<&Path>, env: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = ProvisioningSettings::default();

        let mut builder = Config::builder()
            .set_default("proxmox.url", "")?
            .set_default("proxmox.insecure_skip_verify", false)?
            .set_default("provisioning.image_factory_url", defaults.image_factory_url)?
            .set_default("provisioning.download_retry_secs", defaults.download_retry_secs)?
            .set_default("provisioning.task_poll_secs", defaults.task_poll_secs)?
            .set_default("provisioning.vm_create_retry_secs", defaults.vm_create_retry_secs)?
            .set_default("provisioning.vm_start_retry_secs", defaults.vm_start_retry_secs)?
            .set_default("provisioning.deprovision_poll_secs", defaults.deprovision_poll_secs)?;

        if let Some(path) = config_file {
            info!("Loading configuration from {}", path.display());
            builder = builder.add_source(File::from(path).required(true));
        }

        for (key, var) in STRING_OVERRIDES {
            let value = env(var).map(|v| clean_env(&v)).filter(|v| !v.is_empty());
            builder = builder.set_override_option(key, value)?;
        }

        let insecure = env("PROXMOX_INSECURE_SKIP_VERIFY")
            .map(|v| clean_env(&v))
            .filter(|v| !v.is_empty())
            .map(|v| {
                parse_bool(&v).unwrap_or_else(|| {
                    warn!(value = %v, "ignoring unparsable PROXMOX_INSECURE_SKIP_VERIFY");
                    false
                })
            });
        builder = builder.set_override_option("proxmox.insecure_skip_verify", insecure)?;

        let settings: Settings = builder.build()?.try_deserialize()?;
        settings.validate()?;

        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.proxmox.url.trim().is_empty() {
            return Err(ConfigError::Message(MISSING_URL.to_string()));
        }

        Ok(())
    }
}

/// Trims whitespace and a single pair of matching surrounding quotes.
pub fn clean_env(value: &str) -> String {
    let value = value.trim();

    for quote in ['"', '\''] {
        if value.len() >= 2 && value.starts_with(quote) && value.ends_with(quote) {
            return value[1..value.len() - 1].to_string();
        }
    }

    value.to_string()
}

fn parse_bool(value: &str) -> Option<bool> {
    match value {
        "1" | "t" | "T" | "true" | "TRUE" | "True" => Some(true),
        "0" | "f" | "F" | "false" | "FALSE" | "False" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env_of(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_clean_env() {
        assert_eq!(clean_env("  https://pve:8006  "), "https://pve:8006");
        assert_eq!(clean_env("\"secret\""), "secret");
        assert_eq!(clean_env("'secret'"), "secret");
        // only one pair is stripped
        assert_eq!(clean_env("\"\"x\"\""), "\"x\"");
        // mismatched quotes stay
        assert_eq!(clean_env("\"x'"), "\"x'");
        assert_eq!(clean_env("\""), "\"");
    }

    #[test]
    fn test_missing_url_is_rejected() {
        let err = Settings::load(None, env_of(&[])).unwrap_err();
        assert!(err.to_string().contains(MISSING_URL));
    }

    #[test]
    fn test_env_overrides_and_defaults() {
        let settings = Settings::load(
            None,
            env_of(&[
                ("PROXMOX_URL", " \"https://pve.lan:8006/api2/json\" "),
                ("PROXMOX_TOKEN_ID", "omni@pve!provider"),
                ("PROXMOX_TOKEN_SECRET", "'abc-123'"),
                ("PROXMOX_INSECURE_SKIP_VERIFY", "true"),
            ]),
        )
        .unwrap();

        assert_eq!(settings.proxmox.url, "https://pve.lan:8006/api2/json");
        assert_eq!(settings.proxmox.token_id, "omni@pve!provider");
        assert_eq!(settings.proxmox.token_secret, "abc-123");
        assert!(settings.proxmox.insecure_skip_verify);
        assert!(settings.proxmox.username.is_empty());

        assert_eq!(settings.provisioning.image_factory_url, DEFAULT_IMAGE_FACTORY_URL);
        assert_eq!(settings.provisioning.task_poll(), Duration::from_secs(10));
        assert_eq!(settings.provisioning.deprovision_poll(), Duration::from_secs(5));
    }

    #[test]
    fn test_zero_deprovision_poll_is_clamped() {
        let provisioning = ProvisioningSettings {
            deprovision_poll_secs: 0,
            ..ProvisioningSettings::default()
        };
        assert_eq!(provisioning.deprovision_poll(), Duration::from_secs(1));
    }
}
