use crate::core::machine::MachineConfig;
use crate::core::node_selector::request_set_tag;
use crate::proxmox::VmOption;

/// Request-specific inputs of the VM definition. Storage names are already
/// resolved, `additional_storages[i]` backs `additional_disks[i]`.
#[derive(Debug, Clone)]
pub struct VmSpec<'a> {
    pub uuid: &'a str,
    pub name: &'a str,
    pub iso_volume: &'a str,
    pub storage: &'a str,
    pub additional_storages: &'a [String],
    pub request_set_id: Option<&'a str>,
}

struct DiskFlags<'a> {
    size: u64,
    ssd: bool,
    discard: bool,
    iothread: bool,
    cache: &'a str,
    aio: &'a str,
}

fn disk(storage: &str, flags: DiskFlags<'_>) -> String {
    let mut parts = vec![format!("{storage}:{}", flags.size)];
    if flags.ssd {
        parts.push("ssd=1".to_string());
    }
    if flags.discard {
        parts.push("discard=on".to_string());
    }
    if flags.iothread {
        parts.push("iothread=1".to_string());
    }
    if !flags.cache.is_empty() {
        parts.push(format!("cache={}", flags.cache));
    }
    if !flags.aio.is_empty() {
        parts.push(format!("aio={}", flags.aio));
    }
    parts.join(",")
}

fn nic(bridge: &str, firewall: bool, vlan: u64) -> String {
    let mut value = format!("virtio,bridge={bridge},firewall={}", u8::from(firewall));
    if vlan != 0 {
        value.push_str(&format!(",tag={vlan}"));
    }
    value
}

/// Maps the accepted hugepage spellings onto what Proxmox expects.
pub fn normalize_hugepages(value: &str) -> &str {
    match value {
        "2MB" | "2" => "2",
        "1GB" | "1024" => "1024",
        "any" => "any",
        other => other,
    }
}

/// The ordered VM creation parameters. Pure, so the same inputs always give
/// the same list.
pub fn build_vm_options(config: &MachineConfig, spec: &VmSpec<'_>) -> Vec<VmOption> {
    let mut options = vec![
        VmOption::new("smbios1", format!("uuid={}", spec.uuid)),
        VmOption::new("name", spec.name),
        VmOption::new("cdrom", spec.iso_volume),
        VmOption::new("cpu", config.cpu()),
        VmOption::new("cores", config.cores),
        VmOption::new("sockets", config.sockets),
        VmOption::new("memory", config.memory),
        VmOption::new(
            "scsi0",
            disk(
                spec.storage,
                DiskFlags {
                    size: config.disk_size,
                    ssd: config.disk_ssd,
                    discard: config.disk_discard,
                    iothread: config.disk_iothread,
                    cache: &config.disk_cache,
                    aio: &config.disk_aio,
                },
            ),
        ),
        VmOption::new("scsihw", "virtio-scsi-single"),
        VmOption::new("onboot", 1),
        VmOption::new("net0", nic(config.bridge(), true, config.vlan)),
        VmOption::new("agent", "enabled=true"),
    ];

    if let Some(set) = spec.request_set_id {
        options.push(VmOption::new("tags", request_set_tag(set)));
    }

    debug_assert_eq!(
        config.additional_disks.len(),
        spec.additional_storages.len(),
        "every additional disk needs a resolved storage"
    );

    // scsi0 is the boot disk
    for (i, (extra, storage)) in config
        .additional_disks
        .iter()
        .zip(spec.additional_storages)
        .enumerate()
    {
        options.push(VmOption::new(
            format!("scsi{}", i + 1),
            disk(
                storage,
                DiskFlags {
                    size: extra.disk_size,
                    ssd: extra.disk_ssd,
                    discard: extra.disk_discard,
                    iothread: extra.disk_iothread,
                    cache: &extra.disk_cache,
                    aio: &extra.disk_aio,
                },
            ),
        ));
    }

    if !config.machine_type.is_empty() {
        options.push(VmOption::new("machine", &config.machine_type));
    }

    if config.numa {
        options.push(VmOption::new("numa", 1));
    }

    if !config.hugepages.is_empty() {
        options.push(VmOption::new("hugepages", normalize_hugepages(&config.hugepages)));
    }

    if config.balloon == Some(false) {
        options.push(VmOption::new("balloon", 0));
    }

    for (i, extra) in config.additional_nics.iter().enumerate() {
        options.push(VmOption::new(
            format!("net{}", i + 1),
            nic(&extra.bridge, extra.firewall, extra.vlan),
        ));
    }

    for (i, device) in config.pci_devices.iter().enumerate() {
        let mut value = format!("mapping={}", device.mapping);
        if device.pcie {
            value.push_str(",pcie=1");
        }
        if device.primary_gpu {
            value.push_str(",x-vga=1");
        }
        if device.rombar {
            value.push_str(",rombar=1");
        }
        options.push(VmOption::new(format!("hostpci{i}"), value));
    }

    options
}
