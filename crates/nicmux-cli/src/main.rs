//! `nicmux`: serves one physical PCI NIC to a VM as a socket-backed virtual
//! device.

use std::path::PathBuf;
use std::process::ExitCode;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use tracing::{error, info, warn};

use nicmux_backend::{DeviceBackend, PassthroughDevice, StubDevice};
use nicmux_server::{run_interrupt_loop, LoopConfig, LoopExit, VirtualDeviceServer};
use nicmux_vfio::{BindError, BoundDevice, PciAddress, DEFAULT_DMA_WINDOW_LEN};

/// Set from the signal handler, read by the runtime loop; the only state
/// shared across threads in the process.
static SHUTDOWN: AtomicBool = AtomicBool::new(false);

#[derive(Debug, Parser)]
#[command(about = "Multiplex a physical PCI NIC behind a socket-served virtual device")]
struct Args {
    /// PCI address of the physical device to multiplex.
    #[arg(short = 'd', long, default_value = "0000:18:00.0")]
    device: String,

    /// Path of the protocol socket the VM connects to.
    #[arg(short = 's', long, default_value = "/tmp/nicmux.sock")]
    socket: PathBuf,

    /// How accesses to the virtual device are backed.
    #[arg(long, value_enum, default_value_t = BackendKind::Passthrough)]
    backend: BackendKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum BackendKind {
    /// Forward every access to the bound hardware.
    Passthrough,
    /// An inert device; smoke-tests the server without hardware.
    Stub,
}

extern "C" fn handle_shutdown_signal(_: libc::c_int) {
    // Nothing but a single release-store is safe in signal context.
    SHUTDOWN.store(true, Ordering::Release);
}

fn install_signal_handlers() -> Result<()> {
    // SAFETY: the installed handler only performs an atomic store.
    unsafe {
        let mut action: libc::sigaction = std::mem::zeroed();
        action.sa_sigaction = handle_shutdown_signal as usize;
        libc::sigfillset(&mut action.sa_mask);
        for sig in [libc::SIGINT, libc::SIGTERM] {
            if libc::sigaction(sig, &action, std::ptr::null_mut()) != 0 {
                return Err(std::io::Error::last_os_error())
                    .with_context(|| format!("installing handler for signal {sig}"));
            }
        }
    }
    Ok(())
}

fn build_backend(args: &Args) -> Result<DeviceBackend> {
    match args.backend {
        BackendKind::Stub => Ok(DeviceBackend::Stub(StubDevice)),
        BackendKind::Passthrough => {
            let address: PciAddress = args
                .device
                .parse()
                .with_context(|| format!("parsing device address {:?}", args.device))?;
            let mut device =
                BoundDevice::bind(&address).with_context(|| format!("binding {address}"))?;
            device.enumerate_regions().context("enumerating regions")?;
            device
                .enumerate_interrupts()
                .context("enumerating interrupts")?;
            device.reset();

            // Not every BAR is mappable; unmapped ones fall back to fd
            // access inside the binding.
            let bar_indexes: Vec<u32> = device
                .regions()
                .iter()
                .filter(|r| r.index < 6)
                .map(|r| r.index)
                .collect();
            for index in bar_indexes {
                match device.map_region(index) {
                    Ok(()) => {}
                    Err(err @ BindError::MapFailed { .. }) => {
                        warn!("BAR {index} not mappable, using fd access: {err}");
                    }
                    Err(err) => {
                        return Err(err).with_context(|| format!("mapping region {index}"))
                    }
                }
            }

            let window = device
                .establish_dma_window(DEFAULT_DMA_WINDOW_LEN)
                .context("establishing DMA window")?;
            let backend = PassthroughDevice::new(Rc::new(device), Rc::new(window))
                .context("deriving the passthrough identity")?;
            Ok(DeviceBackend::Passthrough(backend))
        }
    }
}

fn run(args: &Args) -> Result<LoopExit> {
    install_signal_handlers()?;

    let mut backend = build_backend(args)?;
    let mut server = VirtualDeviceServer::new(backend.identity());
    backend
        .setup(&mut server)
        .context("wiring the virtual device")?;
    server
        .listen(&args.socket)
        .with_context(|| format!("listening on {}", args.socket.display()))?;

    let exit = run_interrupt_loop(&mut server, &SHUTDOWN, LoopConfig::default())
        .context("interrupt loop")?;
    server.shutdown();
    Ok(exit)
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    match run(&args) {
        Ok(exit) => {
            info!(?exit, "clean shutdown");
            ExitCode::SUCCESS
        }
        Err(err) => {
            error!("fatal: {err:#}");
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_documented_flags() {
        let args = Args::parse_from(["nicmux"]);
        assert_eq!(args.device, "0000:18:00.0");
        assert_eq!(args.socket, PathBuf::from("/tmp/nicmux.sock"));
        assert_eq!(args.backend, BackendKind::Passthrough);
    }

    #[test]
    fn backend_and_paths_are_overridable() {
        let args = Args::parse_from([
            "nicmux",
            "-d",
            "0000:3b:00.1",
            "-s",
            "/run/nicmux/vm0.sock",
            "--backend",
            "stub",
        ]);
        assert_eq!(args.device, "0000:3b:00.1");
        assert_eq!(args.backend, BackendKind::Stub);
    }

    #[test]
    fn stub_backend_builds_without_hardware() {
        let args = Args::parse_from(["nicmux", "--backend", "stub"]);
        let backend = build_backend(&args).unwrap();
        assert_eq!(backend.identity().vendor_id, 0x1de5);
    }
}
