//! The VM-facing half of the multiplexer: a socket server that impersonates
//! one PCI device.
//!
//! The server owns the registration tables (regions, interrupt vectors, DMA
//! hooks), the virtual configuration space, and the session state machine.
//! Backends decide *who answers* a given access by installing callbacks; the
//! server decides *whether it is answerable* (bounds, session state) before
//! any callback runs.

mod config_space;
pub mod proto;
mod runtime;
mod server;

pub use config_space::{
    BarFlags, ConfigSpaceError, PciIdentity, VirtualConfigSpace, PCI_CLASSIC_CONFIG_LEN,
    PCI_CONFIG_SPACE_LEN,
};
pub use runtime::{run_interrupt_loop, LoopConfig, LoopExit};
pub use server::{
    AccessError, DmaRange, IrqKind, IrqSlot, PollPurpose, RegionAccessFn, ServerError,
    ServiceOutcome, SessionState, VirtualDeviceServer, MAX_REGIONS,
};
