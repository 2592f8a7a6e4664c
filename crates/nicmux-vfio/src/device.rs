//! The VFIO container/group/device sequence and everything it yields:
//! region descriptors, live BAR mappings, interrupt eventfds, DMA aperture.

use std::ffi::CString;
use std::fs::{File, OpenOptions};
use std::io;
use std::mem;
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};
use std::path::PathBuf;
use std::ptr;

use bitflags::bitflags;
use tracing::{debug, warn};
use vfio_bindings::bindings::vfio::{
    vfio_device_info, vfio_group_status, vfio_iommu_type1_dma_map, vfio_iommu_type1_dma_unmap,
    vfio_iommu_type1_info, vfio_irq_info, vfio_irq_set, vfio_region_info, VFIO_API_VERSION,
    VFIO_DEVICE_FLAGS_RESET, VFIO_DMA_MAP_FLAG_READ, VFIO_DMA_MAP_FLAG_WRITE,
    VFIO_GROUP_FLAGS_VIABLE, VFIO_IRQ_SET_ACTION_TRIGGER, VFIO_IRQ_SET_DATA_EVENTFD,
    VFIO_PCI_CONFIG_REGION_INDEX, VFIO_PCI_ERR_IRQ_INDEX, VFIO_PCI_INTX_IRQ_INDEX,
    VFIO_PCI_MSIX_IRQ_INDEX, VFIO_PCI_MSI_IRQ_INDEX, VFIO_PCI_REQ_IRQ_INDEX,
    VFIO_REGION_INFO_FLAG_MMAP, VFIO_REGION_INFO_FLAG_READ, VFIO_REGION_INFO_FLAG_WRITE,
    VFIO_TYPE1_IOMMU, VFIO_TYPE1v2_IOMMU,
};
use vmm_sys_util::eventfd::{EventFd, EFD_NONBLOCK};
use vmm_sys_util::ioctl::{ioctl, ioctl_with_mut_ref, ioctl_with_ptr, ioctl_with_ref,
    ioctl_with_val};

use crate::sysfs;
use crate::{BindError, PciAddress};

// Ioctl numbers from <linux/vfio.h>; the bindings crate carries the struct
// and flag definitions but not the _IO() expansions.
const VFIO_TYPE: u32 = b';' as u32;
const VFIO_BASE: u32 = 100;

ioctl_io_nr!(VFIO_GET_API_VERSION, VFIO_TYPE, VFIO_BASE);
ioctl_io_nr!(VFIO_CHECK_EXTENSION, VFIO_TYPE, VFIO_BASE + 1);
ioctl_io_nr!(VFIO_SET_IOMMU, VFIO_TYPE, VFIO_BASE + 2);
ioctl_io_nr!(VFIO_GROUP_GET_STATUS, VFIO_TYPE, VFIO_BASE + 3);
ioctl_io_nr!(VFIO_GROUP_SET_CONTAINER, VFIO_TYPE, VFIO_BASE + 4);
ioctl_io_nr!(VFIO_GROUP_GET_DEVICE_FD, VFIO_TYPE, VFIO_BASE + 6);
ioctl_io_nr!(VFIO_DEVICE_GET_INFO, VFIO_TYPE, VFIO_BASE + 7);
ioctl_io_nr!(VFIO_DEVICE_GET_REGION_INFO, VFIO_TYPE, VFIO_BASE + 8);
ioctl_io_nr!(VFIO_DEVICE_GET_IRQ_INFO, VFIO_TYPE, VFIO_BASE + 9);
ioctl_io_nr!(VFIO_DEVICE_SET_IRQS, VFIO_TYPE, VFIO_BASE + 10);
ioctl_io_nr!(VFIO_DEVICE_RESET, VFIO_TYPE, VFIO_BASE + 11);
ioctl_io_nr!(VFIO_IOMMU_GET_INFO, VFIO_TYPE, VFIO_BASE + 12);
ioctl_io_nr!(VFIO_IOMMU_MAP_DMA, VFIO_TYPE, VFIO_BASE + 13);
ioctl_io_nr!(VFIO_IOMMU_UNMAP_DMA, VFIO_TYPE, VFIO_BASE + 14);

/// Default size of the device-visible DMA aperture (1 MiB at IOVA 0).
pub const DEFAULT_DMA_WINDOW_LEN: usize = 1 << 20;

bitflags! {
    /// Access attributes of a device region.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RegionFlags: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const MMAP = 1 << 2;
    }
}

impl RegionFlags {
    fn from_vfio(raw: u32) -> Self {
        let mut flags = RegionFlags::empty();
        if raw & VFIO_REGION_INFO_FLAG_READ != 0 {
            flags |= RegionFlags::READ;
        }
        if raw & VFIO_REGION_INFO_FLAG_WRITE != 0 {
            flags |= RegionFlags::WRITE;
        }
        if raw & VFIO_REGION_INFO_FLAG_MMAP != 0 {
            flags |= RegionFlags::MMAP;
        }
        flags
    }
}

/// Interrupt vector groups a PCI device can expose through VFIO.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum IrqKind {
    /// Level-triggered legacy INTx.
    Intx,
    /// Single-vector message-signaled.
    Msi,
    /// Multi-vector message-signaled.
    Msix,
    /// Error notification channel.
    Err,
    /// Device-request notification channel.
    Req,
}

impl IrqKind {
    pub const ALL: [IrqKind; 5] = [
        IrqKind::Intx,
        IrqKind::Msi,
        IrqKind::Msix,
        IrqKind::Err,
        IrqKind::Req,
    ];

    pub fn vfio_index(self) -> u32 {
        match self {
            IrqKind::Intx => VFIO_PCI_INTX_IRQ_INDEX,
            IrqKind::Msi => VFIO_PCI_MSI_IRQ_INDEX,
            IrqKind::Msix => VFIO_PCI_MSIX_IRQ_INDEX,
            IrqKind::Err => VFIO_PCI_ERR_IRQ_INDEX,
            IrqKind::Req => VFIO_PCI_REQ_IRQ_INDEX,
        }
    }
}

/// One memory-mapped or I/O window of the physical device.
///
/// Discovered once at bind time; immutable afterwards except for the live
/// mapping, which is installed at most once.
#[derive(Debug)]
pub struct DeviceRegion {
    pub index: u32,
    /// Byte offset of the region within the device fd's mappable space.
    pub offset: u64,
    pub len: u64,
    pub flags: RegionFlags,
    mapping: Option<RegionMapping>,
}

impl DeviceRegion {
    pub fn new(index: u32, offset: u64, len: u64, flags: RegionFlags) -> Self {
        Self {
            index,
            offset,
            len,
            flags,
            mapping: None,
        }
    }

    pub fn is_mapped(&self) -> bool {
        self.mapping.is_some()
    }

    pub fn mapping(&self) -> Option<&RegionMapping> {
        self.mapping.as_ref()
    }
}

/// A live mmap of one device region.
#[derive(Debug)]
pub struct RegionMapping {
    ptr: *mut u8,
    len: usize,
}

impl RegionMapping {
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Copies `buf.len()` bytes out of the mapping at `offset`.
    ///
    /// Device memory: width-matched volatile accesses where the offset is
    /// naturally aligned, byte accesses otherwise.
    pub fn read(&self, offset: usize, buf: &mut [u8]) {
        assert!(offset + buf.len() <= self.len);
        // SAFETY: the range is inside the mapping per the assert above.
        unsafe {
            let src = self.ptr.add(offset);
            match buf.len() {
                2 if offset % 2 == 0 => {
                    buf.copy_from_slice(&src.cast::<u16>().read_volatile().to_ne_bytes())
                }
                4 if offset % 4 == 0 => {
                    buf.copy_from_slice(&src.cast::<u32>().read_volatile().to_ne_bytes())
                }
                8 if offset % 8 == 0 => {
                    buf.copy_from_slice(&src.cast::<u64>().read_volatile().to_ne_bytes())
                }
                _ => {
                    for (i, out) in buf.iter_mut().enumerate() {
                        *out = src.add(i).read_volatile();
                    }
                }
            }
        }
    }

    /// Copies `buf` into the mapping at `offset`.
    pub fn write(&self, offset: usize, buf: &[u8]) {
        assert!(offset + buf.len() <= self.len);
        // SAFETY: the range is inside the mapping per the assert above.
        unsafe {
            let dst = self.ptr.add(offset);
            match buf.len() {
                2 if offset % 2 == 0 => dst
                    .cast::<u16>()
                    .write_volatile(u16::from_ne_bytes(buf.try_into().unwrap())),
                4 if offset % 4 == 0 => dst
                    .cast::<u32>()
                    .write_volatile(u32::from_ne_bytes(buf.try_into().unwrap())),
                8 if offset % 8 == 0 => dst
                    .cast::<u64>()
                    .write_volatile(u64::from_ne_bytes(buf.try_into().unwrap())),
                _ => {
                    for (i, b) in buf.iter().enumerate() {
                        dst.add(i).write_volatile(*b);
                    }
                }
            }
        }
    }
}

impl Drop for RegionMapping {
    fn drop(&mut self) {
        // SAFETY: ptr/len came from a successful mmap and are unmapped once.
        unsafe {
            libc::munmap(self.ptr.cast(), self.len);
        }
    }
}

/// One interrupt vector group of the physical device.
///
/// The eventfds are owned here for the process lifetime; the virtual side
/// only ever receives mirror fds, so real and virtual fd lifetimes stay
/// decoupled.
#[derive(Debug)]
pub struct InterruptSource {
    pub kind: IrqKind,
    pub count: u32,
    eventfds: Vec<EventFd>,
}

impl InterruptSource {
    pub fn eventfds(&self) -> &[EventFd] {
        &self.eventfds
    }

    pub fn mirror_fds(&self) -> Vec<RawFd> {
        self.eventfds.iter().map(|e| e.as_raw_fd()).collect()
    }
}

/// The pinned host buffer registered with the IOMMU as the device-visible
/// DMA aperture.
#[derive(Debug)]
pub struct DmaWindow {
    ptr: *mut u8,
    len: usize,
    iova: u64,
    container: File,
}

impl DmaWindow {
    pub fn iova(&self) -> u64 {
        self.iova
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn host_ptr(&self) -> *mut u8 {
        self.ptr
    }

    /// Whether `[iova, iova + len)` lies entirely within the aperture.
    pub fn contains(&self, iova: u64, len: u64) -> bool {
        let Some(end) = iova.checked_add(len) else {
            return false;
        };
        iova >= self.iova && end <= self.iova + self.len as u64
    }
}

impl Drop for DmaWindow {
    fn drop(&mut self) {
        let mut unmap = vfio_iommu_type1_dma_unmap {
            argsz: mem::size_of::<vfio_iommu_type1_dma_unmap>() as u32,
            iova: self.iova,
            size: self.len as u64,
            ..Default::default()
        };
        // SAFETY: the container fd is alive (owned) and unmap is a plain
        // in/out struct.
        let ret = unsafe { ioctl_with_mut_ref(&self.container, VFIO_IOMMU_UNMAP_DMA(), &mut unmap) };
        if ret < 0 {
            warn!(error = %io::Error::last_os_error(), "failed to unmap DMA window");
        }
        // SAFETY: ptr/len came from a successful anonymous mmap.
        unsafe {
            libc::munmap(self.ptr.cast(), self.len);
        }
    }
}

/// A physical device opened through VFIO.
pub struct BoundDevice {
    address: PciAddress,
    container: File,
    _group: File,
    device: File,
    device_flags: u32,
    num_regions: u32,
    num_irqs: u32,
    regions: Vec<DeviceRegion>,
    interrupts: Vec<InterruptSource>,
}

impl BoundDevice {
    /// Opens the container, attaches the device's IOMMU group and obtains a
    /// device handle.
    ///
    /// The sequence is fixed by the framework: container → group viability →
    /// attach → IOMMU model → device fd. DMA mapping and region mmaps come
    /// afterwards via [`BoundDevice::establish_dma_window`] and
    /// [`BoundDevice::map_region`].
    pub fn bind(address: &PciAddress) -> Result<BoundDevice, BindError> {
        let container_path = PathBuf::from("/dev/vfio/vfio");
        let container = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&container_path)
            .map_err(|source| BindError::FrameworkUnavailable {
                path: container_path,
                source,
            })?;

        // SAFETY: no-argument ioctl on an owned fd.
        let version = unsafe { ioctl(&container, VFIO_GET_API_VERSION()) };
        if version != VFIO_API_VERSION as i32 {
            return Err(BindError::ApiVersionMismatch(version));
        }

        // SAFETY: value-carrying ioctl on an owned fd.
        let ext = unsafe {
            ioctl_with_val(
                &container,
                VFIO_CHECK_EXTENSION(),
                VFIO_TYPE1v2_IOMMU as libc::c_ulong,
            )
        };
        if ext <= 0 {
            return Err(BindError::IommuModelUnsupported);
        }

        let group_nr = sysfs::iommu_group(address)?;
        let group_path = PathBuf::from(format!("/dev/vfio/{group_nr}"));
        let group = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&group_path)
            .map_err(|source| BindError::FrameworkUnavailable {
                path: group_path,
                source,
            })?;

        let mut status = vfio_group_status {
            argsz: mem::size_of::<vfio_group_status>() as u32,
            ..Default::default()
        };
        // SAFETY: status is a plain in/out struct with argsz set.
        let ret = unsafe { ioctl_with_mut_ref(&group, VFIO_GROUP_GET_STATUS(), &mut status) };
        if ret < 0 {
            return Err(BindError::ioctl("VFIO_GROUP_GET_STATUS"));
        }
        if status.flags & VFIO_GROUP_FLAGS_VIABLE == 0 {
            return Err(BindError::GroupNotViable(group_nr));
        }

        let container_fd = container.as_raw_fd();
        // SAFETY: the ioctl reads the fd value and does not retain the pointer.
        let ret = unsafe { ioctl_with_ref(&group, VFIO_GROUP_SET_CONTAINER(), &container_fd) };
        if ret < 0 {
            return Err(BindError::ioctl("VFIO_GROUP_SET_CONTAINER"));
        }

        // SAFETY: value-carrying ioctl; the group is attached at this point.
        let ret = unsafe {
            ioctl_with_val(&container, VFIO_SET_IOMMU(), VFIO_TYPE1_IOMMU as libc::c_ulong)
        };
        if ret < 0 {
            return Err(BindError::ioctl("VFIO_SET_IOMMU"));
        }

        let mut iommu_info = vfio_iommu_type1_info {
            argsz: mem::size_of::<vfio_iommu_type1_info>() as u32,
            ..Default::default()
        };
        // SAFETY: plain in/out struct with argsz set.
        let ret = unsafe { ioctl_with_mut_ref(&container, VFIO_IOMMU_GET_INFO(), &mut iommu_info) };
        if ret < 0 {
            return Err(BindError::ioctl("VFIO_IOMMU_GET_INFO"));
        }
        debug!("IOMMU attached, iova_pgsizes {:#x}", iommu_info.iova_pgsizes);

        let name = CString::new(address.to_string()).expect("PCI address has no NUL bytes");
        // SAFETY: the ioctl copies the NUL-terminated name and returns a new fd.
        let device_fd = unsafe { ioctl_with_ptr(&group, VFIO_GROUP_GET_DEVICE_FD(), name.as_ptr()) };
        if device_fd < 0 {
            let err = io::Error::last_os_error();
            return Err(if err.raw_os_error() == Some(libc::EBUSY) {
                BindError::DeviceBusy(*address)
            } else {
                BindError::Ioctl {
                    name: "VFIO_GROUP_GET_DEVICE_FD",
                    source: err,
                }
            });
        }
        // SAFETY: device_fd is a fresh fd we now own.
        let device = unsafe { File::from_raw_fd(device_fd) };

        let mut device_info = vfio_device_info {
            argsz: mem::size_of::<vfio_device_info>() as u32,
            ..Default::default()
        };
        // SAFETY: plain in/out struct with argsz set.
        let ret = unsafe { ioctl_with_mut_ref(&device, VFIO_DEVICE_GET_INFO(), &mut device_info) };
        if ret < 0 {
            return Err(BindError::ioctl("VFIO_DEVICE_GET_INFO"));
        }
        debug!(
            device = %address,
            group = group_nr,
            regions = device_info.num_regions,
            irqs = device_info.num_irqs,
            "bound device"
        );

        Ok(BoundDevice {
            address: *address,
            container,
            _group: group,
            device,
            device_flags: device_info.flags,
            num_regions: device_info.num_regions,
            num_irqs: device_info.num_irqs,
            regions: Vec::new(),
            interrupts: Vec::new(),
        })
    }

    pub fn address(&self) -> &PciAddress {
        &self.address
    }

    /// Queries every region descriptor once. Zero-length regions are kept in
    /// the table; mapping steps skip them.
    pub fn enumerate_regions(&mut self) -> Result<&[DeviceRegion], BindError> {
        if !self.regions.is_empty() {
            return Ok(&self.regions);
        }
        for index in 0..self.num_regions {
            let mut info = vfio_region_info {
                argsz: mem::size_of::<vfio_region_info>() as u32,
                index,
                ..Default::default()
            };
            // SAFETY: plain in/out struct with argsz set.
            let ret =
                unsafe { ioctl_with_mut_ref(&self.device, VFIO_DEVICE_GET_REGION_INFO(), &mut info) };
            if ret < 0 {
                return Err(BindError::ioctl("VFIO_DEVICE_GET_REGION_INFO"));
            }
            debug!(
                "device region {index}: size {:#x} offset {:#x} flags {:#x}",
                info.size, info.offset, info.flags
            );
            self.regions.push(DeviceRegion::new(
                index,
                info.offset,
                info.size,
                RegionFlags::from_vfio(info.flags),
            ));
        }
        Ok(&self.regions)
    }

    /// Queries every interrupt source once, allocating one eventfd per vector
    /// and wiring it as the trigger target.
    ///
    /// Kinds with zero vectors are kept in the table with an empty fd list.
    /// Wiring failures are downgraded to a warning: the source stays present
    /// but silent, which matches the best-effort contract for hardware that
    /// only supports a subset of interrupt types.
    pub fn enumerate_interrupts(&mut self) -> Result<&[InterruptSource], BindError> {
        if !self.interrupts.is_empty() {
            return Ok(&self.interrupts);
        }
        for kind in IrqKind::ALL {
            let index = kind.vfio_index();
            if index >= self.num_irqs {
                self.interrupts.push(InterruptSource {
                    kind,
                    count: 0,
                    eventfds: Vec::new(),
                });
                continue;
            }
            let mut info = vfio_irq_info {
                argsz: mem::size_of::<vfio_irq_info>() as u32,
                index,
                ..Default::default()
            };
            // SAFETY: plain in/out struct with argsz set.
            let ret =
                unsafe { ioctl_with_mut_ref(&self.device, VFIO_DEVICE_GET_IRQ_INFO(), &mut info) };
            if ret < 0 {
                return Err(BindError::ioctl("VFIO_DEVICE_GET_IRQ_INFO"));
            }
            debug!(?kind, count = info.count, "device interrupt source");

            let mut eventfds = Vec::with_capacity(info.count as usize);
            for _ in 0..info.count {
                eventfds.push(EventFd::new(EFD_NONBLOCK).map_err(BindError::EventFd)?);
            }
            if !eventfds.is_empty() {
                if let Err(err) = self.wire_irq_eventfds(index, &eventfds) {
                    warn!(?kind, error = %err, "could not wire interrupt eventfds; source stays silent");
                }
            }
            self.interrupts.push(InterruptSource {
                kind,
                count: info.count,
                eventfds,
            });
        }
        Ok(&self.interrupts)
    }

    fn wire_irq_eventfds(&self, index: u32, eventfds: &[EventFd]) -> Result<(), BindError> {
        let header = mem::size_of::<vfio_irq_set>();
        let payload = eventfds.len() * mem::size_of::<RawFd>();
        let mut buf = vec![0u8; header + payload];
        // SAFETY: buf holds a zeroed vfio_irq_set header; only POD fields are
        // written.
        unsafe {
            let set = buf.as_mut_ptr().cast::<vfio_irq_set>();
            (*set).argsz = (header + payload) as u32;
            (*set).flags = VFIO_IRQ_SET_DATA_EVENTFD | VFIO_IRQ_SET_ACTION_TRIGGER;
            (*set).index = index;
            (*set).start = 0;
            (*set).count = eventfds.len() as u32;
        }
        for (i, eventfd) in eventfds.iter().enumerate() {
            let fd = eventfd.as_raw_fd();
            buf[header + i * mem::size_of::<RawFd>()..header + (i + 1) * mem::size_of::<RawFd>()]
                .copy_from_slice(&fd.to_ne_bytes());
        }
        // SAFETY: buf outlives the call and argsz matches its length.
        let ret = unsafe {
            ioctl_with_ptr(&self.device, VFIO_DEVICE_SET_IRQS(), buf.as_ptr())
        };
        if ret < 0 {
            return Err(BindError::ioctl("VFIO_DEVICE_SET_IRQS"));
        }
        Ok(())
    }

    pub fn regions(&self) -> &[DeviceRegion] {
        &self.regions
    }

    pub fn interrupts(&self) -> &[InterruptSource] {
        &self.interrupts
    }

    pub fn interrupt_source(&self, kind: IrqKind) -> Option<&InterruptSource> {
        self.interrupts.iter().find(|s| s.kind == kind)
    }

    /// Memory-maps one region read/write.
    ///
    /// Zero-length regions are skipped silently; a refused mmap (regions
    /// exist that the platform will not map) surfaces as [`BindError::MapFailed`]
    /// for the caller to log and skip.
    pub fn map_region(&mut self, index: u32) -> Result<(), BindError> {
        let device_fd = self.device.as_raw_fd();
        let region = self
            .regions
            .iter_mut()
            .find(|r| r.index == index)
            .ok_or(BindError::MapFailed {
                index,
                source: io::Error::from(io::ErrorKind::NotFound),
            })?;
        if region.len == 0 {
            debug!(index, "skipping zero-length region");
            return Ok(());
        }
        if region.mapping.is_some() {
            return Ok(());
        }
        // SAFETY: mmap of an owned device fd; failure is checked below.
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                region.len as usize,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                device_fd,
                region.offset as libc::off_t,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(BindError::MapFailed {
                index,
                source: io::Error::last_os_error(),
            });
        }
        region.mapping = Some(RegionMapping {
            ptr: ptr.cast(),
            len: region.len as usize,
        });
        debug!("mapped region {index}, {:#x} bytes", region.len);
        Ok(())
    }

    /// Reads or writes `buf.len()` bytes of region `index` at `offset`,
    /// through the live mapping when present and the device fd otherwise.
    pub fn region_access(
        &self,
        index: u32,
        offset: u64,
        buf: &mut [u8],
        is_write: bool,
    ) -> io::Result<usize> {
        let region = self
            .regions
            .iter()
            .find(|r| r.index == index)
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotFound))?;
        let in_bounds = offset
            .checked_add(buf.len() as u64)
            .is_some_and(|end| end <= region.len);
        if !in_bounds {
            return Err(io::Error::from(io::ErrorKind::InvalidInput));
        }
        if let Some(mapping) = &region.mapping {
            if is_write {
                mapping.write(offset as usize, buf);
            } else {
                mapping.read(offset as usize, buf);
            }
            return Ok(buf.len());
        }
        let pos = region.offset + offset;
        if is_write {
            self.pwrite(buf, pos)
        } else {
            self.pread(buf, pos)
        }
    }

    /// Reads from the device's PCI configuration region.
    pub fn read_config(&self, offset: u64, buf: &mut [u8]) -> Result<usize, BindError> {
        let region = self
            .regions
            .iter()
            .find(|r| r.index == VFIO_PCI_CONFIG_REGION_INDEX)
            .ok_or(BindError::NoConfigRegion)?;
        let len = buf.len().min(region.len.saturating_sub(offset) as usize);
        self.pread(&mut buf[..len], region.offset + offset)
            .map_err(|source| BindError::Ioctl {
                name: "config pread",
                source,
            })
    }

    /// Writes into the device's PCI configuration region.
    pub fn write_config(&self, offset: u64, buf: &[u8]) -> Result<usize, BindError> {
        let region = self
            .regions
            .iter()
            .find(|r| r.index == VFIO_PCI_CONFIG_REGION_INDEX)
            .ok_or(BindError::NoConfigRegion)?;
        self.pwrite(buf, region.offset + offset)
            .map_err(|source| BindError::Ioctl {
                name: "config pwrite",
                source,
            })
    }

    /// Length of the configuration region, if the device reports one.
    pub fn config_space_len(&self) -> Option<u64> {
        self.regions
            .iter()
            .find(|r| r.index == VFIO_PCI_CONFIG_REGION_INDEX)
            .map(|r| r.len)
    }

    /// Allocates a pinned anonymous buffer and registers it with the IOMMU as
    /// the device-visible DMA aperture at IOVA 0.
    pub fn establish_dma_window(&self, len: usize) -> Result<DmaWindow, BindError> {
        // SAFETY: anonymous mapping; failure is checked below.
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(BindError::DmaSetup(io::Error::last_os_error()));
        }

        let mut dma_map = vfio_iommu_type1_dma_map {
            argsz: mem::size_of::<vfio_iommu_type1_dma_map>() as u32,
            flags: VFIO_DMA_MAP_FLAG_READ | VFIO_DMA_MAP_FLAG_WRITE,
            vaddr: ptr as u64,
            iova: 0,
            size: len as u64,
        };
        // SAFETY: plain in/out struct with argsz set.
        let ret = unsafe { ioctl_with_mut_ref(&self.container, VFIO_IOMMU_MAP_DMA(), &mut dma_map) };
        if ret < 0 {
            let source = io::Error::last_os_error();
            // SAFETY: ptr/len came from the successful mmap above.
            unsafe {
                libc::munmap(ptr, len);
            }
            return Err(BindError::DmaSetup(source));
        }

        let container = self
            .container
            .try_clone()
            .map_err(BindError::DmaSetup)?;
        debug!("DMA window established: {len:#x} bytes at IOVA 0");
        Ok(DmaWindow {
            ptr: ptr.cast(),
            len,
            iova: 0,
            container,
        })
    }

    /// Issues a hardware reset. Best-effort: failures are logged, enumeration
    /// state is untouched either way.
    pub fn reset(&self) {
        if self.device_flags & VFIO_DEVICE_FLAGS_RESET == 0 {
            warn!(device = %self.address, "device does not support reset");
            return;
        }
        // SAFETY: no-argument ioctl on an owned fd.
        let ret = unsafe { ioctl(&self.device, VFIO_DEVICE_RESET()) };
        if ret < 0 {
            warn!(device = %self.address, error = %io::Error::last_os_error(), "device reset failed");
        }
    }

    fn pread(&self, buf: &mut [u8], pos: u64) -> io::Result<usize> {
        // SAFETY: buf's pointer/length pair is valid for the call.
        let ret = unsafe {
            libc::pread(
                self.device.as_raw_fd(),
                buf.as_mut_ptr().cast(),
                buf.len(),
                pos as libc::off_t,
            )
        };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(ret as usize)
    }

    fn pwrite(&self, buf: &[u8], pos: u64) -> io::Result<usize> {
        // SAFETY: buf's pointer/length pair is valid for the call.
        let ret = unsafe {
            libc::pwrite(
                self.device.as_raw_fd(),
                buf.as_ptr().cast(),
                buf.len(),
                pos as libc::off_t,
            )
        };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(ret as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn region_flags_map_from_vfio_bits() {
        let flags = RegionFlags::from_vfio(
            VFIO_REGION_INFO_FLAG_READ | VFIO_REGION_INFO_FLAG_WRITE | VFIO_REGION_INFO_FLAG_MMAP,
        );
        assert_eq!(
            flags,
            RegionFlags::READ | RegionFlags::WRITE | RegionFlags::MMAP
        );
        assert_eq!(RegionFlags::from_vfio(0), RegionFlags::empty());
    }

    #[test]
    fn irq_kinds_cover_the_fixed_vfio_indexes() {
        let indexes: Vec<u32> = IrqKind::ALL.iter().map(|k| k.vfio_index()).collect();
        assert_eq!(indexes, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn fresh_region_is_unmapped() {
        let region = DeviceRegion::new(0, 0x1000, 0x4000, RegionFlags::READ | RegionFlags::WRITE);
        assert!(!region.is_mapped());
        assert!(region.mapping().is_none());
    }
}
