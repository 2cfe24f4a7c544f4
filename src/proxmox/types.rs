use serde::{Deserialize, Deserializer, Serialize};

use crate::errors::TaskError;

/// A node as listed by `/nodes`.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ClusterNode {
    pub node: String,
    /// "online", "offline" or "unknown"
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub mem: u64,
    #[serde(default)]
    pub maxmem: u64,
}

impl ClusterNode {
    pub fn is_online(&self) -> bool {
        self.status == "online"
    }

    /// Free memory as a fraction of the total, 0 when the node reports no
    /// memory at all.
    pub fn memory_free_ratio(&self) -> f64 {
        if self.maxmem == 0 {
            return 0.0;
        }
        self.maxmem.saturating_sub(self.mem) as f64 / self.maxmem as f64
    }
}

/// A QEMU guest as listed by `/nodes/{node}/qemu`.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct VmSummary {
    #[serde(deserialize_with = "number_or_string")]
    pub vmid: u32,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub status: String,
    /// Semicolon separated tag list.
    #[serde(default)]
    pub tags: Option<String>,
}

impl VmSummary {
    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags
            .as_deref()
            .map(|tags| tags.split([';', ',', ' ']).any(|t| t == tag))
            .unwrap_or(false)
    }
}

/// A storage as listed by `/nodes/{node}/storage`.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct StoragePool {
    pub storage: String,
    #[serde(rename = "type", default)]
    pub storage_type: String,
    /// Comma separated content types, e.g. "images,iso,rootdir".
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub avail: u64,
}

impl StoragePool {
    pub fn accepts(&self, content: &str) -> bool {
        self.content.split(',').any(|c| c.trim() == content)
    }
}

/// A volume as listed by `/nodes/{node}/storage/{storage}/content`.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct StorageVolume {
    pub volid: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub format: Option<String>,
}

impl StorageVolume {
    /// File name part of `storage:iso/name.iso`.
    pub fn file_name(&self) -> &str {
        self.volid
            .rsplit_once('/')
            .map(|(_, name)| name)
            .unwrap_or(&self.volid)
    }
}

/// `/nodes/{node}/tasks/{upid}/status`.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct TaskStatus {
    pub status: String,
    #[serde(default)]
    pub exitstatus: Option<String>,
}

impl TaskStatus {
    pub fn is_running(&self) -> bool {
        self.status == "running"
    }

    pub fn is_successful(&self) -> bool {
        !self.is_running() && self.exitstatus.as_deref() == Some("OK")
    }
}

/// Proxmox task id, `UPID:<node>:<pid>:<pstart>:<starttime>:<type>:<id>:<user>:`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Upid(pub String);

impl Upid {
    pub fn node(&self) -> Result<&str, TaskError> {
        let mut parts = self.0.split(':');
        match (parts.next(), parts.next()) {
            (Some("UPID"), Some(node)) if !node.is_empty() => Ok(node),
            _ => Err(TaskError::MalformedUpid {
                upid: self.0.clone(),
            }),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Upid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Upid {
    fn from(value: &str) -> Self {
        Upid(value.to_string())
    }
}

/// A single `name=value` VM creation/config parameter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmOption {
    pub name: String,
    pub value: String,
}

impl VmOption {
    pub fn new(name: impl Into<String>, value: impl ToString) -> Self {
        Self {
            name: name.into(),
            value: value.to_string(),
        }
    }
}

// vmids show up as numbers or strings depending on the endpoint
fn number_or_string<'de, D>(deserializer: D) -> Result<u32, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(u32),
        Text(String),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Number(n) => Ok(n),
        Raw::Text(s) => s.parse().map_err(serde::de::Error::custom),
    }
}
