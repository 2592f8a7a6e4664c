//! VFIO hardware binding: owns the container/group/device handles for one
//! physical PCI device, its mapped regions, its interrupt eventfds and the
//! DMA aperture registered with the IOMMU.
//!
//! Everything here is bind-time plumbing; the virtual-device side only ever
//! sees borrowed views (region descriptors, mirror fds, the DMA window).

#[macro_use]
extern crate vmm_sys_util;

mod address;
mod device;
pub mod sysfs;

use std::io;
use std::path::PathBuf;

use thiserror::Error;

pub use address::{AddressParseError, PciAddress};
pub use device::{
    BoundDevice, DeviceRegion, DmaWindow, InterruptSource, IrqKind, RegionFlags, RegionMapping,
    DEFAULT_DMA_WINDOW_LEN,
};
pub use sysfs::SysfsDeviceInfo;

#[derive(Debug, Error)]
pub enum BindError {
    /// The VFIO character devices are missing or cannot be opened.
    #[error("VFIO framework unavailable ({path}): {source}")]
    FrameworkUnavailable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    /// The host kernel speaks a different VFIO API revision.
    #[error("VFIO API version mismatch: host reports {0}")]
    ApiVersionMismatch(i32),
    /// The container does not support the Type1 v2 IOMMU model.
    #[error("host IOMMU lacks the Type1v2 model")]
    IommuModelUnsupported,
    /// Not every device in the IOMMU group is bound to vfio-pci.
    #[error("IOMMU group {0} is not viable")]
    GroupNotViable(u32),
    /// Another process already drives the device.
    #[error("device {0} is busy")]
    DeviceBusy(PciAddress),
    /// A single region could not be mmapped. Callers are expected to skip
    /// the region, not abort.
    #[error("mapping region {index} failed: {source}")]
    MapFailed {
        index: u32,
        #[source]
        source: io::Error,
    },
    #[error("DMA window setup failed: {0}")]
    DmaSetup(#[source] io::Error),
    #[error("eventfd allocation failed: {0}")]
    EventFd(#[source] io::Error),
    #[error("sysfs attribute {path} unreadable: {source}")]
    Sysfs {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("sysfs attribute {path} did not parse as an id")]
    SysfsParse { path: PathBuf },
    #[error("{name} failed: {source}")]
    Ioctl {
        name: &'static str,
        #[source]
        source: io::Error,
    },
    #[error("device reports no PCI configuration region")]
    NoConfigRegion,
}

impl BindError {
    pub(crate) fn ioctl(name: &'static str) -> Self {
        Self::Ioctl {
            name,
            source: io::Error::last_os_error(),
        }
    }
}
