//! Pluggable device backends: who actually answers the virtual device's
//! accesses.
//!
//! The variant set is closed and known at compile time, so the backend is a
//! sum type dispatched through one exhaustive `setup` rather than a class
//! hierarchy. Any failure during `setup` is fatal to session startup; a
//! partially wired virtual device is never exposed to a VM.

mod emulated;
mod passthrough;

use thiserror::Error;
use tracing::debug;

use nicmux_caps::ChainError;
use nicmux_server::{PciIdentity, ServerError, VirtualDeviceServer};
use nicmux_vfio::BindError;

pub use emulated::{DeviceModel, EmulatedDevice, ModelRegion};
pub use passthrough::PassthroughDevice;

#[derive(Debug, Error)]
pub enum SetupError {
    #[error(transparent)]
    Server(#[from] ServerError),
    #[error(transparent)]
    Bind(#[from] BindError),
    #[error("capability chain of the physical device is unusable: {0}")]
    Caps(#[from] ChainError),
}

/// The three ways a virtual device can be backed.
pub enum DeviceBackend {
    /// No callbacks beyond defaults; an inert device for smoke-testing the
    /// server without hardware or a model.
    Stub(StubDevice),
    /// Real hardware behind VFIO.
    Passthrough(PassthroughDevice),
    /// A software device model.
    Emulated(EmulatedDevice),
}

impl DeviceBackend {
    pub fn identity(&self) -> PciIdentity {
        match self {
            DeviceBackend::Stub(stub) => stub.identity(),
            DeviceBackend::Passthrough(passthrough) => passthrough.identity(),
            DeviceBackend::Emulated(emulated) => emulated.identity(),
        }
    }

    /// Wires this backend's callbacks, regions and interrupt vectors into
    /// the server.
    pub fn setup(&mut self, server: &mut VirtualDeviceServer) -> Result<(), SetupError> {
        match self {
            DeviceBackend::Stub(stub) => stub.setup(server),
            DeviceBackend::Passthrough(passthrough) => passthrough.setup(server),
            DeviceBackend::Emulated(emulated) => emulated.setup(server),
        }
    }
}

/// The inert backend: a valid identity, nothing else.
#[derive(Debug, Default)]
pub struct StubDevice;

impl StubDevice {
    pub fn identity(&self) -> PciIdentity {
        PciIdentity {
            vendor_id: 0x1de5,
            device_id: 0x0001,
            subsystem_vendor_id: 0x1de5,
            subsystem_id: 0x0001,
            class: 0x02,
            subclass: 0x00,
            prog_if: 0x00,
            revision: 0x01,
        }
    }

    fn setup(&mut self, server: &mut VirtualDeviceServer) -> Result<(), SetupError> {
        // Declaring an empty vector set is the only registration: it moves
        // the server into the configured state without installing anything.
        server.register_interrupt_vectors(nicmux_server::IrqKind::Intx, 0)?;
        debug!("stub backend: no regions or callbacks installed");
        Ok(())
    }
}
