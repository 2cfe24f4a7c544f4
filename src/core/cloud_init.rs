use std::io::{Cursor, Write};

use fatfs::{FileSystem, FormatVolumeOptions, FsOptions};
use serde::Serialize;

use crate::errors::{ProviderError, ProviderResult};

const VOLUME_LABEL: [u8; 11] = *b"cidata     ";
// The volume is attached as a CD-ROM, which reads in 2048 byte blocks.
const SECTOR_SZ: usize = 2048;
pub const MAX_CIDATA_BYTES: usize = 256 * 1024;

/// Talos version that replaced `machine.network.hostname` with the
/// `HostnameConfig` document.
const HOSTNAME_CONFIG_SINCE: (u64, u64) = (1, 12);

/// Hostname document appended to the join config. Unparsable or empty
/// versions are treated as current.
pub fn hostname_config(talos_version: &str, hostname: &str) -> String {
    match parse_version(talos_version) {
        Some(version) if version < HOSTNAME_CONFIG_SINCE => {
            format!("machine:\n  network:\n    hostname: {hostname}\n")
        }
        _ => format!("apiVersion: v1alpha1\nkind: HostnameConfig\nhostname: {hostname}\n"),
    }
}

fn parse_version(version: &str) -> Option<(u64, u64)> {
    let version = version.trim();
    let version = version.strip_prefix('v').unwrap_or(version);
    let mut parts = version.split('.');
    let major = parts.next()?.parse().ok()?;
    // pre-release suffixes only ever sit on the patch component
    let minor = parts.next()?.parse().ok()?;
    Some((major, minor))
}

#[derive(Serialize)]
#[serde(rename_all = "kebab-case")]
struct MetaData<'a> {
    instance_id: &'a str,
    local_hostname: &'a str,
    hostname: &'a str,
}

/// NoCloud payload for one VM.
#[derive(Debug, Clone, PartialEq)]
pub struct NoCloud {
    pub user_data: String,
    pub meta_data: String,
    pub network_config: String,
}

impl NoCloud {
    pub fn new(
        join_config: &str,
        talos_version: &str,
        hostname: &str,
        instance_id: &str,
    ) -> ProviderResult<Self> {
        let user_data = format!(
            "{}\n---\n{}",
            join_config.trim_end(),
            hostname_config(talos_version, hostname)
        );

        let meta_data = serde_yaml::to_string(&MetaData {
            instance_id,
            local_hostname: hostname,
            hostname,
        })
        .map_err(|e| ProviderError::CloudInit(format!("failed to serialize meta-data: {e}")))?;

        Ok(Self {
            user_data,
            meta_data,
            network_config: "version: 1\n".to_string(),
        })
    }

    fn files(&self) -> [(&'static str, &[u8]); 3] {
        [
            ("meta-data", self.meta_data.as_bytes()),
            ("user-data", self.user_data.as_bytes()),
            ("network-config", self.network_config.as_bytes()),
        ]
    }

    /// FAT12 image labelled `cidata` holding the three files.
    pub fn to_vfat(&self) -> ProviderResult<Vec<u8>> {
        let total: usize = self.files().iter().map(|(_, data)| data.len()).sum();
        if total > MAX_CIDATA_BYTES {
            return Err(ProviderError::CloudInit(format!(
                "cloud-init data is too large: {total} > {MAX_CIDATA_BYTES} bytes"
            )));
        }

        build_vfat(&self.files()).map_err(|e| ProviderError::CloudInit(e.to_string()))
    }
}

pub fn cidata_file_name(vmid: u32) -> String {
    format!("cidata-{vmid}.iso")
}

fn build_vfat(files: &[(&str, &[u8])]) -> std::io::Result<Vec<u8>> {
    let file_sectors: usize = files.iter().map(|(_, data)| data.len().div_ceil(SECTOR_SZ)).sum();

    // fatfs refuses to format anything below 42 sectors, 37 covers the FAT12
    // overhead for the sizes we allow
    let sectors = 42.max(file_sectors + 37);
    let sectors_per_track = u16::try_from(sectors)
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidInput, "volume too large"))?;

    let mut disk = Cursor::new(vec![0; sectors * SECTOR_SZ]);
    fatfs::format_volume(
        &mut disk,
        FormatVolumeOptions::new()
            .bytes_per_sector(SECTOR_SZ as u16)
            .bytes_per_cluster(SECTOR_SZ as u32)
            .sectors_per_track(sectors_per_track)
            .fat_type(fatfs::FatType::Fat12)
            .volume_label(VOLUME_LABEL),
    )?;

    {
        let fs = FileSystem::new(&mut disk, FsOptions::new())?;
        let root_dir = fs.root_dir();
        for (name, data) in files {
            root_dir.create_file(name)?.write_all(data)?;
        }
    }

    Ok(disk.into_inner())
}
