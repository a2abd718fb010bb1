/// Boundary normalization helpers.
///
/// Everything here turns loosely-typed API payloads into the strict
/// inventory model: version strings, tag lists, and disk config entries.
use crate::inventory::{DiskKind, GuestDisk};
use std::collections::BTreeSet;

/// Extract the major version from a `pveversion` string such as
/// `pve-manager/8.2.4/faa83925c9641325`.
pub fn parse_pve_major(raw: &str) -> Option<u32> {
    raw.split('/')
        .nth(1)
        .and_then(|v| v.split('.').next())
        .and_then(|v| v.trim().parse().ok())
}

/// Split a tag string on the hypervisor's separators (`;` and `,`).
pub fn split_tags(raw: &str) -> BTreeSet<String> {
    raw.split([';', ','])
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

/// Classify one guest config entry as an attached disk, if it is one.
///
/// CD-ROM drives and unused volumes are not disks for migration purposes.
pub fn classify_disk(key: &str, value: &serde_json::Value) -> Option<GuestDisk> {
    let value = value.as_str()?;
    if value.contains("media=cdrom") {
        return None;
    }

    let prefix: String = key.chars().take_while(|c| !c.is_ascii_digit()).collect();
    let indexed = prefix.len() < key.len();
    let kind = match (prefix.as_str(), indexed) {
        ("ide", true) => DiskKind::IdeDisk,
        ("scsi", true) => DiskKind::Scsi,
        ("virtio", true) => DiskKind::Virtio,
        ("sata", true) => DiskKind::Sata,
        ("nvme", true) => DiskKind::Nvme,
        ("rootfs", false) => DiskKind::RootFs,
        // Container mountpoints ride with the rootfs.
        ("mp", true) => DiskKind::RootFs,
        _ => return None,
    };

    Some(GuestDisk {
        slot: key.to_string(),
        kind,
        shared: value.contains("shared=1"),
    })
}
