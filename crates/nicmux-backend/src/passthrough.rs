//! The passthrough backend: copies the physical device's topology into the
//! virtual server and forwards every access to live hardware.

use std::io;
use std::os::unix::io::AsRawFd;
use std::rc::Rc;

use tracing::{debug, warn};

use nicmux_caps::CapabilityId;
use nicmux_server::{
    AccessError, BarFlags, IrqKind as VirtIrqKind, IrqSlot, PciIdentity, RegionAccessFn,
    VirtualDeviceServer,
};
use nicmux_vfio::sysfs::SysfsDeviceInfo;
use nicmux_vfio::{BoundDevice, DeviceRegion, DmaWindow, IrqKind};

use crate::SetupError;

/// BAR slots of a type-0 header; regions past these (config, ROM, VGA) are
/// not re-exposed as BARs.
const NUM_BAR_SLOTS: u32 = 6;

/// Classic capabilities copied from the real device when present.
const COPIED_CAPABILITIES: [CapabilityId; 5] = [
    CapabilityId::PowerManagement,
    CapabilityId::Msi,
    CapabilityId::Msix,
    CapabilityId::PciExpress,
    CapabilityId::VendorSpecific,
];

pub struct PassthroughDevice {
    device: Rc<BoundDevice>,
    dma_window: Rc<DmaWindow>,
    identity: PciIdentity,
}

impl PassthroughDevice {
    /// Wraps a bound device, deriving the virtual PCI identity from the real
    /// device's sysfs attributes.
    pub fn new(device: Rc<BoundDevice>, dma_window: Rc<DmaWindow>) -> Result<Self, SetupError> {
        let info = nicmux_vfio::sysfs::device_info(device.address())?;
        let identity = identity_from_sysfs(&info);
        debug!(
            "derived passthrough identity {:04x}:{:04x}",
            identity.vendor_id, identity.device_id
        );
        Ok(Self {
            device,
            dma_window,
            identity,
        })
    }

    pub fn identity(&self) -> PciIdentity {
        self.identity
    }

    pub(crate) fn setup(&mut self, server: &mut VirtualDeviceServer) -> Result<(), SetupError> {
        // One snapshot of the real config space feeds BAR attribute decoding
        // and the capability copy.
        let config_len = self
            .device
            .config_space_len()
            .unwrap_or(nicmux_caps::PCI_CONFIG_SPACE_SIZE as u64)
            .min(nicmux_caps::PCI_EXT_CONFIG_SPACE_SIZE as u64) as usize;
        let mut config = vec![0u8; config_len];
        self.device.read_config(0, &mut config)?;

        let device = &self.device;
        register_hardware_regions(server, self.device.regions(), &config, |index| {
            let device = Rc::clone(device);
            Box::new(move |offset, buf, is_write| {
                device
                    .region_access(index, offset, buf, is_write)
                    .map_err(access_error)
            })
        })?;

        register_hardware_vectors(server, &interrupt_counts(&self.device))?;
        self.install_interrupt_mirrors(server)?;
        copy_capabilities(&config, server)?;

        let window = Rc::clone(&self.dma_window);
        let on_register = Box::new(move |range: nicmux_server::DmaRange| {
            // The aperture registered with the IOMMU must cover anything the
            // backend will ever hand to the device.
            if window.contains(range.iova, range.len) {
                debug!(iova = range.iova, len = range.len, "guest DMA range registered");
            } else {
                warn!(
                    iova = range.iova,
                    len = range.len,
                    "guest DMA range outside the established window"
                );
            }
        });
        let on_unregister = Box::new(|range: nicmux_server::DmaRange| {
            debug!(iova = range.iova, len = range.len, "guest DMA range unregistered");
        });
        server.register_dma_callbacks(on_register, on_unregister)?;

        let device = Rc::clone(&self.device);
        server.register_reset_callback(Box::new(move || device.reset()))?;
        Ok(())
    }

    fn install_interrupt_mirrors(&self, server: &mut VirtualDeviceServer) -> Result<(), SetupError> {
        let single_vector = [
            (IrqKind::Intx, IrqSlot::Intx),
            (IrqKind::Msi, IrqSlot::Msi),
            (IrqKind::Err, IrqSlot::Err),
            (IrqKind::Req, IrqSlot::Req),
        ];
        for (kind, slot) in single_vector {
            if let Some(source) = self.device.interrupt_source(kind) {
                if let Some(eventfd) = source.eventfds().first() {
                    server.add_interrupt_mirror(eventfd.as_raw_fd(), slot)?;
                }
            }
        }
        if let Some(source) = self.device.interrupt_source(IrqKind::Msix) {
            for (vector, eventfd) in source.eventfds().iter().enumerate() {
                server.add_interrupt_mirror(eventfd.as_raw_fd(), IrqSlot::MsixVector(vector as u32))?;
            }
        }
        Ok(())
    }
}

pub(crate) fn identity_from_sysfs(info: &SysfsDeviceInfo) -> PciIdentity {
    PciIdentity {
        vendor_id: info.vendor_id,
        device_id: info.device_id,
        subsystem_vendor_id: info.subsystem_vendor_id,
        subsystem_id: info.subsystem_id,
        class: info.class(),
        subclass: info.subclass(),
        prog_if: info.prog_if(),
        revision: info.revision,
    }
}

fn access_error(err: io::Error) -> AccessError {
    match err.raw_os_error() {
        Some(errno) => AccessError::Os(errno),
        None => AccessError::OutOfBounds,
    }
}

/// Copies the hardware region table into the server: one virtual region per
/// nonzero-length BAR, each backed by an access callback from `make_access`.
pub(crate) fn register_hardware_regions<F>(
    server: &mut VirtualDeviceServer,
    regions: &[DeviceRegion],
    config: &[u8],
    mut make_access: F,
) -> Result<(), SetupError>
where
    F: FnMut(u32) -> RegionAccessFn,
{
    for region in regions.iter().filter(|r| r.index < NUM_BAR_SLOTS) {
        if region.len == 0 {
            debug!(index = region.index, "skipping zero-length BAR");
            continue;
        }
        let flags = bar_flags_from_config(config, region.index);
        server.register_region(region.index, region.len, flags, make_access(region.index))?;
    }
    Ok(())
}

/// Copies the hardware vector counts into the server.
pub(crate) fn register_hardware_vectors(
    server: &mut VirtualDeviceServer,
    counts: &[(IrqKind, u32)],
) -> Result<(), SetupError> {
    for &(kind, count) in counts {
        if count == 0 {
            continue;
        }
        server.register_interrupt_vectors(virt_irq_kind(kind), count)?;
    }
    Ok(())
}

fn interrupt_counts(device: &BoundDevice) -> Vec<(IrqKind, u32)> {
    device
        .interrupts()
        .iter()
        .map(|source| (source.kind, source.count))
        .collect()
}

pub(crate) fn virt_irq_kind(kind: IrqKind) -> VirtIrqKind {
    match kind {
        IrqKind::Intx => VirtIrqKind::Intx,
        IrqKind::Msi => VirtIrqKind::Msi,
        IrqKind::Msix => VirtIrqKind::Msix,
        IrqKind::Err => VirtIrqKind::Err,
        IrqKind::Req => VirtIrqKind::Req,
    }
}

/// Decodes prefetchable/64-bit attributes from the low bits of the real BAR
/// register. The BAR's true size comes from the region table, never from
/// here.
pub(crate) fn bar_flags_from_config(config: &[u8], index: u32) -> BarFlags {
    let mut flags = BarFlags::READ | BarFlags::WRITE;
    let base = 0x10 + index as usize * 4;
    let Some(raw) = config.get(base..base + 4) else {
        return flags;
    };
    let value = u32::from_le_bytes(raw.try_into().unwrap());
    if value & 0x1 != 0 {
        // I/O BAR: no memory attributes to derive.
        return flags;
    }
    if (value >> 1) & 0x3 == 0b10 {
        flags |= BarFlags::MEM64;
    }
    if value & 0x8 != 0 {
        flags |= BarFlags::PREFETCH;
    }
    flags
}

/// Copies the real device's capability structures into the virtual config
/// space. Absence of any capability is a normal outcome.
pub(crate) fn copy_capabilities(
    config: &[u8],
    server: &mut VirtualDeviceServer,
) -> Result<(), SetupError> {
    for id in COPIED_CAPABILITIES {
        let Some(segment) = nicmux_caps::locate(config, id)? else {
            debug!(?id, "capability absent on the physical device");
            continue;
        };
        let start = usize::from(segment.offset);
        let end = (start + usize::from(segment.len)).min(config.len());
        if end <= start + 2 {
            debug!(?id, "capability truncated by the config region; not copied");
            continue;
        }
        // Body excludes the 2-byte id/next header the server rewrites.
        let body = &config[start + 2..end];
        let offset = server.add_capability(id.code() as u8, body)?;
        debug!(?id, real = segment.offset, virt = offset, "copied capability");
    }

    if let Some(segment) = nicmux_caps::locate(config, CapabilityId::DeviceSerialNumber)? {
        let start = usize::from(segment.offset);
        let end = (start + usize::from(segment.len)).min(config.len());
        if end > start + 4 {
            let body = &config[start + 4..end];
            let offset = server.add_extended_capability(segment.id.code(), 1, body)?;
            debug!(real = segment.offset, virt = offset, "copied device serial number");
        }
    } else {
        debug!("device serial number absent on the physical device");
    }
    Ok(())
}
