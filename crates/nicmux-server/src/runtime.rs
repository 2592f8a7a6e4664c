//! The single-threaded poll loop tying real interrupts to the virtual
//! device.
//!
//! One iteration services at most one of the legacy/error/request channels
//! and at most one MSI-X vector. That bounds per-iteration work; a burst of
//! simultaneous vectors is caught up over the following cycles since the
//! eventfds stay armed until drained.

use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::server::{
    IrqSlot, PollPurpose, ServerError, ServiceOutcome, VirtualDeviceServer,
};

#[derive(Debug, Clone, Copy)]
pub struct LoopConfig {
    /// Poll timeout; also the shutdown-observation latency bound.
    pub poll_timeout: Duration,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            poll_timeout: Duration::from_millis(500),
        }
    }
}

/// Why the loop returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopExit {
    ShutdownRequested,
    ClientDisconnected,
}

/// Runs until the shutdown flag is observed or the VM disconnects.
///
/// `shutdown` is the only cross-thread state: a signal handler stores it
/// with release ordering, this loop reads it with acquire at every iteration
/// boundary. Cancellation is cooperative; an in-flight callback is never
/// interrupted.
pub fn run_interrupt_loop(
    server: &mut VirtualDeviceServer,
    shutdown: &AtomicBool,
    config: LoopConfig,
) -> Result<LoopExit, ServerError> {
    let timeout_ms = i32::try_from(config.poll_timeout.as_millis()).unwrap_or(i32::MAX);
    loop {
        if shutdown.load(Ordering::Acquire) {
            info!("shutdown flag observed; leaving interrupt loop");
            server.begin_close();
            return Ok(LoopExit::ShutdownRequested);
        }

        let descriptors = server.pollable_descriptors();
        if descriptors.is_empty() {
            std::thread::sleep(config.poll_timeout);
            continue;
        }
        let mut pollfds: Vec<libc::pollfd> = descriptors
            .iter()
            .map(|&(fd, _)| libc::pollfd {
                fd,
                events: libc::POLLIN,
                revents: 0,
            })
            .collect();

        // SAFETY: pollfds is a live array of pollfds.len() entries.
        let ret = unsafe {
            libc::poll(
                pollfds.as_mut_ptr(),
                pollfds.len() as libc::nfds_t,
                timeout_ms,
            )
        };
        if ret < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err.into());
        }
        if ret == 0 {
            continue;
        }

        let mut disconnected = false;
        let mut channel_serviced = false;
        let mut msix_serviced = false;
        for (i, &(fd, purpose)) in descriptors.iter().enumerate() {
            let revents = pollfds[i].revents;
            if revents & (libc::POLLHUP | libc::POLLERR) != 0
                && purpose == PollPurpose::Session
            {
                disconnected = true;
                continue;
            }
            if revents & libc::POLLIN == 0 {
                continue;
            }
            match purpose {
                PollPurpose::Listener => {
                    server.accept()?;
                    // The descriptor set just changed; re-poll.
                    break;
                }
                PollPurpose::Session => match server.service()? {
                    ServiceOutcome::Continue => {}
                    ServiceOutcome::Disconnected => disconnected = true,
                },
                PollPurpose::Mirror(slot) => match slot {
                    IrqSlot::Intx | IrqSlot::Msi | IrqSlot::Err | IrqSlot::Req => {
                        if channel_serviced {
                            continue;
                        }
                        channel_serviced = true;
                        drain_eventfd(fd);
                        forward(server, slot, 0);
                    }
                    IrqSlot::MsixVector(vector) => {
                        if msix_serviced {
                            continue;
                        }
                        msix_serviced = true;
                        drain_eventfd(fd);
                        forward(server, slot, vector);
                    }
                },
            }
        }

        if disconnected {
            info!("VM disconnected; leaving interrupt loop");
            server.begin_close();
            return Ok(LoopExit::ClientDisconnected);
        }
    }
}

fn forward(server: &mut VirtualDeviceServer, slot: IrqSlot, vector: u32) {
    match server.trigger_interrupt(vector) {
        Ok(()) => debug!(?slot, vector, "forwarded interrupt"),
        // Dropped by contract: nobody to deliver to, retrying is meaningless.
        Err(ServerError::NotConnected) => debug!(?slot, vector, "interrupt dropped, not connected"),
        Err(ServerError::InvalidVector(v)) => {
            debug!(?slot, vector = v, "interrupt dropped, no matching virtual vector")
        }
        Err(err) => warn!(?slot, vector, error = %err, "interrupt delivery failed"),
    }
}

/// Clears an edge-triggered eventfd so the next event re-arms it.
fn drain_eventfd(fd: RawFd) {
    let mut counter = 0u64.to_ne_bytes();
    // SAFETY: reading 8 bytes into a local buffer from a valid fd.
    unsafe {
        libc::read(fd, counter.as_mut_ptr().cast(), counter.len());
    }
}
