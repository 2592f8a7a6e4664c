//! Registration tables, session state machine and protocol dispatch for the
//! virtual device.

use std::fs;
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config_space::{BarFlags, ConfigSpaceError, PciIdentity, VirtualConfigSpace};
use crate::proto::{self, Frame, MessageKind};

/// BAR slots a type-0 endpoint can expose.
pub const MAX_REGIONS: usize = 6;

/// Interrupt kinds the virtual device can declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IrqKind {
    Intx,
    Msi,
    Msix,
    Err,
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

    pub fn index(self) -> usize {
        match self {
            IrqKind::Intx => 0,
            IrqKind::Msi => 1,
            IrqKind::Msix => 2,
            IrqKind::Err => 3,
            IrqKind::Req => 4,
        }
    }
}

/// What a pollable descriptor is for. The runtime loop caches these per
/// session; the order returned by [`VirtualDeviceServer::pollable_descriptors`]
/// is stable for a given session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollPurpose {
    /// The listening socket; readable means a client is waiting to connect.
    Listener,
    /// The connected session socket; readable means a request frame is due.
    Session,
    /// A mirror of a real interrupt eventfd.
    Mirror(IrqSlot),
}

/// Which interrupt a mirror descriptor stands for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IrqSlot {
    Intx,
    Msi,
    Err,
    Req,
    MsixVector(u32),
}

/// Per-session lifecycle. Registration is only legal before a client is
/// attached; interrupt delivery only while one is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Unbound,
    Configured,
    Connected,
    Closing,
    Closed,
}

/// Error sentinel a region callback can return for a single access.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AccessError {
    #[error("access beyond region bounds")]
    OutOfBounds,
    #[error("device access failed (errno {0})")]
    Os(i32),
}

impl AccessError {
    /// Negative errno carried back in the reply status.
    pub fn status(&self) -> i32 {
        match self {
            AccessError::OutOfBounds => -libc::EINVAL,
            AccessError::Os(errno) => -errno.abs(),
        }
    }
}

/// Callback servicing reads/writes inside one registered region.
///
/// Arguments: offset within the region, the access buffer (source for
/// writes, destination for reads), and the direction. Returns the number of
/// bytes handled.
pub type RegionAccessFn = Box<dyn FnMut(u64, &mut [u8], bool) -> Result<usize, AccessError>>;

/// One guest memory range mapped (or unmapped) for DMA visibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DmaRange {
    pub iova: u64,
    pub len: u64,
}

type DmaHookFn = Box<dyn FnMut(DmaRange)>;
type ResetFn = Box<dyn FnMut()>;
type IrqStateFn = Box<dyn FnMut(u32, u32, bool)>;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("operation requires {expected:?} state, server is {actual:?}")]
    InvalidState {
        expected: SessionState,
        actual: SessionState,
    },
    #[error("interrupt kind {0:?} already declared")]
    DuplicateIrqKind(IrqKind),
    #[error("vector {0} out of range")]
    InvalidVector(u32),
    #[error("no VM session is connected")]
    NotConnected,
    #[error("region index {0} out of range")]
    RegionIndex(u32),
    #[error("region {0} must have a nonzero length")]
    ZeroLengthRegion(u32),
    #[error(transparent)]
    ConfigSpace(#[from] ConfigSpaceError),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Outcome of servicing one protocol message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceOutcome {
    Continue,
    Disconnected,
}

struct RegionEntry {
    len: u64,
    flags: BarFlags,
    access: RegionAccessFn,
}

/// The protocol endpoint a VM-side device model connects to.
///
/// Single source of truth for what the virtual device looks like and who
/// answers each kind of access. All callback invocations happen on the
/// thread driving [`service`](Self::service); no internal locking.
pub struct VirtualDeviceServer {
    state: SessionState,
    config: VirtualConfigSpace,
    regions: [Option<RegionEntry>; MAX_REGIONS],
    irq_counts: [Option<u32>; 5],
    mirrors: Vec<(RawFd, IrqSlot)>,
    dma_register: Option<DmaHookFn>,
    dma_unregister: Option<DmaHookFn>,
    reset_fn: Option<ResetFn>,
    irq_state_fns: [Option<IrqStateFn>; 5],
    listener: Option<UnixListener>,
    session: Option<UnixStream>,
    socket_path: Option<PathBuf>,
}

impl VirtualDeviceServer {
    pub fn new(identity: PciIdentity) -> Self {
        Self {
            state: SessionState::Unbound,
            config: VirtualConfigSpace::new(&identity),
            regions: Default::default(),
            irq_counts: [None; 5],
            mirrors: Vec::new(),
            dma_register: None,
            dma_unregister: None,
            reset_fn: None,
            irq_state_fns: Default::default(),
            listener: None,
            session: None,
            socket_path: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn identity(&self) -> PciIdentity {
        self.config.identity()
    }

    /// Reads the virtual configuration space (the ConfigRead path).
    pub fn config_read(&self, offset: u64, buf: &mut [u8]) {
        self.config.read(offset, buf);
    }

    /// Writes the virtual configuration space (the ConfigWrite path).
    pub fn config_write(&mut self, offset: u64, buf: &[u8]) {
        self.config.write(offset, buf);
    }

    fn require_configurable(&mut self) -> Result<(), ServerError> {
        match self.state {
            SessionState::Unbound | SessionState::Configured => {
                self.state = SessionState::Configured;
                Ok(())
            }
            actual => Err(ServerError::InvalidState {
                expected: SessionState::Configured,
                actual,
            }),
        }
    }

    /// Declares a BAR-equivalent window with its access callback.
    ///
    /// Re-registering an index replaces the previous callback; last write
    /// wins.
    pub fn register_region(
        &mut self,
        index: u32,
        len: u64,
        flags: BarFlags,
        access: RegionAccessFn,
    ) -> Result<(), ServerError> {
        self.require_configurable()?;
        let slot = usize::try_from(index)
            .ok()
            .filter(|&i| i < MAX_REGIONS)
            .ok_or(ServerError::RegionIndex(index))?;
        if len == 0 {
            return Err(ServerError::ZeroLengthRegion(index));
        }
        if self.regions[slot].is_some() {
            warn!(index, "overwriting existing region registration");
        }
        self.config.define_bar(slot as u8, len, flags)?;
        self.regions[slot] = Some(RegionEntry { len, flags, access });
        debug!(index, len, "registered region");
        Ok(())
    }

    /// Declares the vector count for one interrupt kind.
    pub fn register_interrupt_vectors(&mut self, kind: IrqKind, count: u32) -> Result<(), ServerError> {
        self.require_configurable()?;
        let slot = &mut self.irq_counts[kind.index()];
        if slot.is_some() {
            return Err(ServerError::DuplicateIrqKind(kind));
        }
        *slot = Some(count);
        debug!(?kind, count, "registered interrupt vectors");
        Ok(())
    }

    /// Installs the advisory hooks invoked when the VM maps or unmaps guest
    /// memory for DMA. Address validity stays the backend's responsibility.
    pub fn register_dma_callbacks(
        &mut self,
        on_register: Box<dyn FnMut(DmaRange)>,
        on_unregister: Box<dyn FnMut(DmaRange)>,
    ) -> Result<(), ServerError> {
        self.require_configurable()?;
        self.dma_register = Some(on_register);
        self.dma_unregister = Some(on_unregister);
        Ok(())
    }

    /// Installs the hook invoked on a VM-initiated device reset.
    pub fn register_reset_callback(&mut self, reset: Box<dyn FnMut()>) -> Result<(), ServerError> {
        self.require_configurable()?;
        self.reset_fn = Some(reset);
        Ok(())
    }

    /// Installs the hook invoked on interrupt mask/unmask state changes for
    /// one kind. Without a hook such changes are acknowledged and logged.
    pub fn register_irq_state_callback(
        &mut self,
        kind: IrqKind,
        hook: Box<dyn FnMut(u32, u32, bool)>,
    ) -> Result<(), ServerError> {
        self.require_configurable()?;
        self.irq_state_fns[kind.index()] = Some(hook);
        Ok(())
    }

    /// Adds a mirror of a real interrupt eventfd to the poll set.
    ///
    /// The fd stays owned by the hardware side; the server only polls it.
    pub fn add_interrupt_mirror(&mut self, fd: RawFd, slot: IrqSlot) -> Result<(), ServerError> {
        self.require_configurable()?;
        self.mirrors.push((fd, slot));
        Ok(())
    }

    /// Adds a capability copied from the real device into the virtual
    /// configuration space.
    pub fn add_capability(&mut self, id: u8, body: &[u8]) -> Result<u8, ServerError> {
        self.require_configurable()?;
        Ok(self.config.add_capability(id, body)?)
    }

    /// Extended-space variant of [`add_capability`](Self::add_capability).
    pub fn add_extended_capability(
        &mut self,
        id: u16,
        version: u8,
        body: &[u8],
    ) -> Result<u16, ServerError> {
        self.require_configurable()?;
        Ok(self.config.add_extended_capability(id, version, body)?)
    }

    /// Binds the protocol socket. Configuration must be complete; a stale
    /// socket file from a previous run is replaced.
    pub fn listen(&mut self, path: &Path) -> Result<(), ServerError> {
        if self.state != SessionState::Configured {
            return Err(ServerError::InvalidState {
                expected: SessionState::Configured,
                actual: self.state,
            });
        }
        match fs::remove_file(path) {
            Ok(()) => debug!(path = %path.display(), "removed stale socket"),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
        self.listener = Some(UnixListener::bind(path)?);
        self.socket_path = Some(path.to_owned());
        info!(path = %path.display(), "listening for a VM connection");
        Ok(())
    }

    /// Accepts the single VM connection, consuming the listener.
    pub fn accept(&mut self) -> Result<(), ServerError> {
        if self.state != SessionState::Configured {
            return Err(ServerError::InvalidState {
                expected: SessionState::Configured,
                actual: self.state,
            });
        }
        let listener = self.listener.take().ok_or_else(|| {
            ServerError::Io(io::Error::new(io::ErrorKind::NotConnected, "not listening"))
        })?;
        let (stream, _) = listener.accept()?;
        self.session = Some(stream);
        self.state = SessionState::Connected;
        info!("VM session connected");
        Ok(())
    }

    /// Every descriptor the runtime loop must watch, in stable order: the
    /// protocol socket first, then the interrupt mirrors in registration
    /// order.
    pub fn pollable_descriptors(&self) -> Vec<(RawFd, PollPurpose)> {
        let mut out = Vec::with_capacity(1 + self.mirrors.len());
        if let Some(session) = &self.session {
            out.push((session.as_raw_fd(), PollPurpose::Session));
        } else if let Some(listener) = &self.listener {
            out.push((listener.as_raw_fd(), PollPurpose::Listener));
        }
        for &(fd, slot) in &self.mirrors {
            out.push((fd, PollPurpose::Mirror(slot)));
        }
        out
    }

    /// Requests delivery of one interrupt to the connected VM.
    ///
    /// Not connected means the interrupt is dropped by contract: there is
    /// nobody to deliver to and a retry is meaningless.
    pub fn trigger_interrupt(&mut self, vector: u32) -> Result<(), ServerError> {
        if self.state != SessionState::Connected {
            return Err(ServerError::NotConnected);
        }
        if vector >= self.active_vector_limit() {
            return Err(ServerError::InvalidVector(vector));
        }
        let session = self.session.as_mut().ok_or(ServerError::NotConnected)?;
        proto::write_frame(session, &Frame::interrupt(vector), &[])?;
        Ok(())
    }

    /// The vector space interrupts are delivered into: MSI-X when declared,
    /// otherwise MSI, otherwise INTx.
    fn active_vector_limit(&self) -> u32 {
        for kind in [IrqKind::Msix, IrqKind::Msi, IrqKind::Intx] {
            if let Some(count) = self.irq_counts[kind.index()] {
                if count > 0 {
                    return count;
                }
            }
        }
        0
    }

    pub fn irq_count(&self, kind: IrqKind) -> u32 {
        self.irq_counts[kind.index()].unwrap_or(0)
    }

    /// Services one request frame from the connected client.
    ///
    /// Per-access failures are answered with an error status and do not tear
    /// the session down; socket-level failures and malformed frames do.
    pub fn service(&mut self) -> Result<ServiceOutcome, ServerError> {
        if self.state != SessionState::Connected {
            return Err(ServerError::NotConnected);
        }
        let mut session = self
            .session
            .take()
            .ok_or(ServerError::NotConnected)?;
        let outcome = self.service_stream(&mut session);
        self.session = Some(session);
        match outcome {
            Ok(outcome) => Ok(outcome),
            Err(err) => {
                warn!(error = %err, "session error; disconnecting");
                Ok(ServiceOutcome::Disconnected)
            }
        }
    }

    fn service_stream(&mut self, session: &mut UnixStream) -> Result<ServiceOutcome, ServerError> {
        let Some((frame, payload)) = proto::read_frame(session)? else {
            info!("VM session closed");
            return Ok(ServiceOutcome::Disconnected);
        };
        let Some(kind) = frame.message_kind() else {
            debug!(kind = frame.kind, "unknown message kind");
            proto::write_frame(session, &Frame::reply(-libc::EINVAL), &[])?;
            return Ok(ServiceOutcome::Continue);
        };

        match kind {
            MessageKind::Hello => {
                let payload = self.hello_payload();
                proto::write_frame(session, &Frame::reply(0), &payload)?;
            }
            MessageKind::ConfigRead => {
                let len = frame.len as usize;
                if len > proto::MAX_PAYLOAD {
                    proto::write_frame(session, &Frame::reply(-libc::EINVAL), &[])?;
                } else {
                    let mut buf = vec![0u8; len];
                    self.config.read(frame.offset, &mut buf);
                    proto::write_frame(session, &Frame::reply(0), &buf)?;
                }
            }
            MessageKind::ConfigWrite => {
                self.config.write(frame.offset, &payload);
                proto::write_frame(session, &Frame::reply(0), &[])?;
            }
            MessageKind::RegionRead => {
                match self.region_access(frame.index, frame.offset, frame.len as usize, None) {
                    Ok(data) => proto::write_frame(session, &Frame::reply(0), &data)?,
                    Err(status) => proto::write_frame(session, &Frame::reply(status), &[])?,
                }
            }
            MessageKind::RegionWrite => {
                match self.region_access(
                    frame.index,
                    frame.offset,
                    payload.len(),
                    Some(&payload),
                ) {
                    Ok(_) => proto::write_frame(session, &Frame::reply(0), &[])?,
                    Err(status) => proto::write_frame(session, &Frame::reply(status), &[])?,
                }
            }
            MessageKind::DmaMap => {
                let range = DmaRange {
                    iova: frame.offset,
                    len: u64::from(frame.len),
                };
                if let Some(hook) = &mut self.dma_register {
                    hook(range);
                } else {
                    debug!(?range, "DMA map with no hook installed");
                }
                proto::write_frame(session, &Frame::reply(0), &[])?;
            }
            MessageKind::DmaUnmap => {
                let range = DmaRange {
                    iova: frame.offset,
                    len: u64::from(frame.len),
                };
                if let Some(hook) = &mut self.dma_unregister {
                    hook(range);
                } else {
                    debug!(?range, "DMA unmap with no hook installed");
                }
                proto::write_frame(session, &Frame::reply(0), &[])?;
            }
            MessageKind::Reset => {
                if let Some(reset) = &mut self.reset_fn {
                    reset();
                } else {
                    debug!("device reset with no hook installed");
                }
                proto::write_frame(session, &Frame::reply(0), &[])?;
            }
            MessageKind::IrqState => {
                let kind_index = frame.index as usize;
                let mask = frame.status != 0;
                match self.irq_state_fns.get_mut(kind_index).and_then(Option::as_mut) {
                    Some(hook) => hook(frame.offset as u32, frame.len, mask),
                    None => {
                        // Accepted, unimplemented: acknowledge so the VM side
                        // never sees undefined behavior.
                        debug!(
                            kind = kind_index,
                            start = frame.offset,
                            count = frame.len,
                            mask,
                            "interrupt state change acknowledged (unimplemented)"
                        );
                    }
                }
                proto::write_frame(session, &Frame::reply(0), &[])?;
            }
            MessageKind::Bye => {
                proto::write_frame(session, &Frame::reply(0), &[])?;
                info!("VM requested disconnect");
                return Ok(ServiceOutcome::Disconnected);
            }
            MessageKind::Reply | MessageKind::Interrupt => {
                debug!(kind = frame.kind, "unexpected server-to-client frame from client");
                proto::write_frame(session, &Frame::reply(-libc::EINVAL), &[])?;
            }
        }
        Ok(ServiceOutcome::Continue)
    }

    /// Bounds-checks and dispatches one region access. `data` is `Some` for
    /// writes. Returns the read bytes or a negative errno; the callback is
    /// never reached for an access that fails validation.
    fn region_access(
        &mut self,
        index: u32,
        offset: u64,
        len: usize,
        data: Option<&[u8]>,
    ) -> Result<Vec<u8>, i32> {
        if len > proto::MAX_PAYLOAD {
            return Err(-libc::EINVAL);
        }
        let entry = usize::try_from(index)
            .ok()
            .filter(|&i| i < MAX_REGIONS)
            .and_then(|i| self.regions[i].as_mut())
            .ok_or(-libc::ENODEV)?;
        let in_bounds = offset
            .checked_add(len as u64)
            .is_some_and(|end| end <= entry.len);
        if !in_bounds {
            debug!(index, offset, len, "region access out of bounds");
            return Err(-libc::EINVAL);
        }
        let is_write = data.is_some();
        let mut buf = match data {
            Some(data) => data.to_vec(),
            None => vec![0u8; len],
        };
        match (entry.access)(offset, &mut buf, is_write) {
            Ok(_) => Ok(if is_write { Vec::new() } else { buf }),
            Err(err) => {
                debug!(index, offset, len, error = %err, "region access failed");
                Err(err.status())
            }
        }
    }

    /// Layout advertised in the Hello reply: identity, registered regions,
    /// declared vector counts.
    fn hello_payload(&self) -> Vec<u8> {
        let identity = self.config.identity();
        let mut out = Vec::new();
        out.extend_from_slice(&identity.vendor_id.to_le_bytes());
        out.extend_from_slice(&identity.device_id.to_le_bytes());
        out.extend_from_slice(&identity.subsystem_vendor_id.to_le_bytes());
        out.extend_from_slice(&identity.subsystem_id.to_le_bytes());
        out.push(identity.class);
        out.push(identity.subclass);
        out.push(identity.prog_if);
        out.push(identity.revision);

        let defined: Vec<(u32, &RegionEntry)> = self
            .regions
            .iter()
            .enumerate()
            .filter_map(|(i, r)| r.as_ref().map(|r| (i as u32, r)))
            .collect();
        out.extend_from_slice(&(defined.len() as u32).to_le_bytes());
        for (index, entry) in defined {
            out.extend_from_slice(&index.to_le_bytes());
            out.extend_from_slice(&entry.len.to_le_bytes());
            out.extend_from_slice(&entry.flags.bits().to_le_bytes());
        }
        for kind in IrqKind::ALL {
            out.extend_from_slice(&self.irq_count(kind).to_le_bytes());
        }
        out
    }

    /// Begins teardown: any state may transition here.
    pub fn begin_close(&mut self) {
        if !matches!(self.state, SessionState::Closing | SessionState::Closed) {
            self.state = SessionState::Closing;
        }
    }

    /// Releases the session, the listener, the mirrors and the registration
    /// tables. Idempotent.
    pub fn shutdown(&mut self) {
        if self.state == SessionState::Closed {
            return;
        }
        self.session = None;
        self.listener = None;
        self.mirrors.clear();
        self.regions = Default::default();
        self.dma_register = None;
        self.dma_unregister = None;
        self.reset_fn = None;
        self.irq_state_fns = Default::default();
        if let Some(path) = self.socket_path.take() {
            if let Err(err) = fs::remove_file(&path) {
                if err.kind() != io::ErrorKind::NotFound {
                    warn!(path = %path.display(), error = %err, "could not remove socket");
                }
            }
        }
        self.state = SessionState::Closed;
        info!("virtual device server closed");
    }
}

impl Drop for VirtualDeviceServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}
