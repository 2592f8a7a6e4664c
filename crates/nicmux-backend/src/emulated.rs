//! The emulated backend: a software device model answers every access.
//!
//! The model itself (register semantics, descriptor rings) is an external
//! collaborator behind [`DeviceModel`]; this backend only wires its hooks
//! into the server. Paths the model does not implement resolve as explicit
//! accepted-no-ops, never as silent state corruption.

use std::cell::RefCell;
use std::rc::Rc;

use tracing::{debug, info};

use nicmux_server::{
    AccessError, BarFlags, DmaRange, IrqKind, PciIdentity, VirtualDeviceServer,
};

use crate::SetupError;

/// One BAR of the modelled device. Zero-length entries are skipped at setup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelRegion {
    pub len: u64,
    pub flags: BarFlags,
}

/// Contract a software NIC model implements to sit behind the virtual
/// device.
pub trait DeviceModel {
    /// Fixed, model-defined identity; never derived from real hardware.
    fn pci_identity(&self) -> PciIdentity;

    /// BAR layout, indexed by slot.
    fn regions(&self) -> Vec<ModelRegion>;

    /// Number of MSI-X vectors the model signals.
    fn msix_vectors(&self) -> u32;

    /// Services one register access. Returns the number of bytes handled.
    fn handle_register_access(
        &mut self,
        bar: u32,
        offset: u64,
        data: &mut [u8],
        is_write: bool,
    ) -> Result<usize, AccessError>;

    /// Device reset (the VM issues one at boot).
    fn handle_reset(&mut self);

    /// Guest memory became DMA-visible.
    fn dma_attached(&mut self, range: DmaRange) {
        debug!(iova = range.iova, len = range.len, "model ignores DMA attach");
    }

    /// Guest memory stopped being DMA-visible.
    fn dma_detached(&mut self, range: DmaRange) {
        debug!(iova = range.iova, len = range.len, "model ignores DMA detach");
    }
}

pub struct EmulatedDevice {
    model: Rc<RefCell<Box<dyn DeviceModel>>>,
    identity: PciIdentity,
}

impl EmulatedDevice {
    pub fn new(model: Box<dyn DeviceModel>) -> Self {
        let identity = model.pci_identity();
        Self {
            model: Rc::new(RefCell::new(model)),
            identity,
        }
    }

    pub fn identity(&self) -> PciIdentity {
        self.identity
    }

    pub(crate) fn setup(&mut self, server: &mut VirtualDeviceServer) -> Result<(), SetupError> {
        let regions = self.model.borrow().regions();
        for (index, region) in regions.iter().enumerate() {
            let index = index as u32;
            if region.len == 0 {
                debug!(index, "model BAR skipped (zero length)");
                continue;
            }
            let model = Rc::clone(&self.model);
            server.register_region(
                index,
                region.len,
                region.flags,
                Box::new(move |offset, buf, is_write| {
                    model
                        .borrow_mut()
                        .handle_register_access(index, offset, buf, is_write)
                }),
            )?;
        }

        let msix = self.model.borrow().msix_vectors();
        if msix > 0 {
            server.register_interrupt_vectors(IrqKind::Msix, msix)?;
        } else {
            server.register_interrupt_vectors(IrqKind::Intx, 1)?;
        }

        // Every interrupt-state path is wired, implemented or not; the
        // unimplemented ones acknowledge and log.
        for kind in IrqKind::ALL {
            server.register_irq_state_callback(
                kind,
                Box::new(move |start, count, mask| {
                    info!(
                        ?kind,
                        start, count, mask,
                        "interrupt state change accepted (model does not implement it)"
                    );
                }),
            )?;
        }

        let model = Rc::clone(&self.model);
        server.register_reset_callback(Box::new(move || {
            debug!("model reset");
            model.borrow_mut().handle_reset();
        }))?;

        let attach_model = Rc::clone(&self.model);
        let detach_model = Rc::clone(&self.model);
        server.register_dma_callbacks(
            Box::new(move |range| attach_model.borrow_mut().dma_attached(range)),
            Box::new(move |range| detach_model.borrow_mut().dma_detached(range)),
        )?;
        Ok(())
    }
}
