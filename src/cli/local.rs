use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::core::{MachineRequest, ProvisioningState, SchematicOptions};

/// A machine request read from a YAML file, for driving the pipeline
/// without an orchestrator.
///
/// ```yaml
/// request_id: workers-7f3k2
/// request_set_id: workers
/// talos_version: v1.9.2
/// schematic: 376567988ad370138ad8b2698212367b8edcb69b5fd68c80be1f2ec7d603b4ba
/// join_config: |
///   apiVersion: v1alpha1
///   kind: SideroLinkConfig
///   ...
/// provider_data:
///   cores: 2
///   memory: 4096
///   disk_size: 20
///   storage_selector: storageType == "lvmthin"
/// ```
#[derive(Debug, Clone, Deserialize)]
pub struct RequestFile {
    pub request_id: String,
    #[serde(default)]
    pub request_set_id: Option<String>,
    pub talos_version: String,
    /// Skip the image factory round trip when the schematic is known.
    #[serde(default)]
    pub schematic: Option<String>,
    #[serde(default)]
    pub join_config: Option<String>,
    #[serde(default)]
    pub provider_data: serde_yaml::Value,
}

pub struct LocalRequest {
    file: RequestFile,
    provider_data: String,
    factory_url: String,
    http: reqwest::Client,
}

impl LocalRequest {
    pub fn load(path: &Path, factory_url: &str) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read request file {}", path.display()))?;
        Self::parse(&raw, factory_url)
    }

    pub fn parse(raw: &str, factory_url: &str) -> Result<Self> {
        let file: RequestFile = serde_yaml::from_str(raw).context("invalid request file")?;

        let provider_data = if file.provider_data.is_null() {
            String::new()
        } else {
            serde_yaml::to_string(&file.provider_data)?
        };

        Ok(Self {
            file,
            provider_data,
            factory_url: factory_url.trim_end_matches('/').to_string(),
            http: reqwest::Client::new(),
        })
    }
}

#[derive(Serialize)]
struct Schematic {
    customization: Customization,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Customization {
    system_extensions: SystemExtensions,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SystemExtensions {
    official_extensions: Vec<String>,
}

#[derive(Deserialize)]
struct SchematicResponse {
    id: String,
}

#[async_trait]
impl MachineRequest for LocalRequest {
    fn request_id(&self) -> &str {
        &self.file.request_id
    }

    fn request_set_id(&self) -> Option<&str> {
        self.file.request_set_id.as_deref()
    }

    fn talos_version(&self) -> &str {
        &self.file.talos_version
    }

    fn provider_data(&self) -> &str {
        &self.provider_data
    }

    async fn generate_schematic_id(&self, options: &SchematicOptions) -> Result<String> {
        if let Some(schematic) = &self.file.schematic {
            return Ok(schematic.clone());
        }

        // there are no connection parameters to bake in locally
        debug!(with_connection_params = options.with_connection_params, "requesting schematic");

        let body = serde_yaml::to_string(&Schematic {
            customization: Customization {
                system_extensions: SystemExtensions {
                    official_extensions: options.extra_extensions.clone(),
                },
            },
        })?;

        let response: SchematicResponse = self
            .http
            .post(format!("{}/schematics", self.factory_url))
            .header("Content-Type", "application/yaml")
            .body(body)
            .send()
            .await
            .context("image factory request failed")?
            .error_for_status()
            .context("image factory rejected the schematic")?
            .json()
            .await
            .context("unexpected image factory response")?;

        Ok(response.id)
    }

    fn set_machine_uuid(&self, uuid: &str) {
        // the state file already carries it, there is no one else to tell
        info!(request = %self.file.request_id, uuid, "machine UUID assigned");
    }

    fn join_config(&self) -> Option<&str> {
        self.file.join_config.as_deref()
    }
}

/// Reads the persisted state, starting fresh when the file does not exist.
pub fn load_state(path: &Path) -> Result<ProvisioningState> {
    if !path.exists() {
        return Ok(ProvisioningState::default());
    }

    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read state file {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("invalid state file {}", path.display()))
}

pub fn save_state(path: &Path, state: &ProvisioningState) -> Result<()> {
    let raw = serde_json::to_string_pretty(state)?;
    std::fs::write(path, raw)
        .with_context(|| format!("failed to write state file {}", path.display()))
}
