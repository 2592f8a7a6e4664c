//! PCI identity and IOMMU-group discovery via sysfs.

use std::fs;
use std::path::{Path, PathBuf};

use crate::{BindError, PciAddress};

/// Identity attributes of a physical device as reported by sysfs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SysfsDeviceInfo {
    pub vendor_id: u16,
    pub device_id: u16,
    pub subsystem_vendor_id: u16,
    pub subsystem_id: u16,
    pub revision: u8,
    /// 24-bit class code: class, subclass, programming interface.
    pub class_code: u32,
}

impl SysfsDeviceInfo {
    pub fn class(&self) -> u8 {
        (self.class_code >> 16) as u8
    }

    pub fn subclass(&self) -> u8 {
        (self.class_code >> 8) as u8
    }

    pub fn prog_if(&self) -> u8 {
        self.class_code as u8
    }
}

fn device_dir(address: &PciAddress) -> PathBuf {
    PathBuf::from("/sys/bus/pci/devices").join(address.to_string())
}

/// Reads the device's identity attribute files.
pub fn device_info(address: &PciAddress) -> Result<SysfsDeviceInfo, BindError> {
    let dir = device_dir(address);
    Ok(SysfsDeviceInfo {
        vendor_id: read_hex_attr(&dir.join("vendor"))? as u16,
        device_id: read_hex_attr(&dir.join("device"))? as u16,
        subsystem_vendor_id: read_hex_attr(&dir.join("subsystem_vendor"))? as u16,
        subsystem_id: read_hex_attr(&dir.join("subsystem_device"))? as u16,
        revision: read_hex_attr(&dir.join("revision"))? as u8,
        class_code: read_hex_attr(&dir.join("class"))? as u32,
    })
}

/// Resolves the number of the IOMMU group the device belongs to by following
/// the `iommu_group` symlink.
pub fn iommu_group(address: &PciAddress) -> Result<u32, BindError> {
    let path = device_dir(address).join("iommu_group");
    let target = fs::read_link(&path).map_err(|source| BindError::Sysfs {
        path: path.clone(),
        source,
    })?;
    group_from_link(&target).ok_or(BindError::SysfsParse { path })
}

fn group_from_link(target: &Path) -> Option<u32> {
    target.file_name()?.to_str()?.parse().ok()
}

fn read_hex_attr(path: &Path) -> Result<u64, BindError> {
    let raw = fs::read_to_string(path).map_err(|source| BindError::Sysfs {
        path: path.to_owned(),
        source,
    })?;
    parse_hex_attr(&raw).ok_or_else(|| BindError::SysfsParse {
        path: path.to_owned(),
    })
}

/// Parses a sysfs hex attribute (`0x8086\n` style, `0x` optional).
fn parse_hex_attr(raw: &str) -> Option<u64> {
    let trimmed = raw.trim();
    let digits = trimmed.strip_prefix("0x").unwrap_or(trimmed);
    u64::from_str_radix(digits, 16).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_attrs_parse_with_and_without_prefix() {
        assert_eq!(parse_hex_attr("0x8086\n"), Some(0x8086));
        assert_eq!(parse_hex_attr("1593"), Some(0x1593));
        assert_eq!(parse_hex_attr("  0x020000\n"), Some(0x020000));
        assert_eq!(parse_hex_attr("zz"), None);
        assert_eq!(parse_hex_attr(""), None);
    }

    #[test]
    fn group_number_comes_from_the_link_tail() {
        assert_eq!(
            group_from_link(Path::new("../../../../kernel/iommu_groups/29")),
            Some(29)
        );
        assert_eq!(group_from_link(Path::new("29")), Some(29));
        assert_eq!(group_from_link(Path::new("../groups/not-a-number")), None);
    }

    #[test]
    fn class_code_splits_into_fields() {
        let info = SysfsDeviceInfo {
            vendor_id: 0x8086,
            device_id: 0x1593,
            subsystem_vendor_id: 0x8086,
            subsystem_id: 0x0001,
            revision: 0x02,
            class_code: 0x020000,
        };
        assert_eq!(info.class(), 0x02);
        assert_eq!(info.subclass(), 0x00);
        assert_eq!(info.prog_if(), 0x00);
    }
}
