//! Runtime-loop behavior: interrupt mirroring and bounded shutdown latency.

use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use nicmux_server::proto::{self, Frame, MessageKind};
use nicmux_server::{
    run_interrupt_loop, AccessError, BarFlags, IrqKind, IrqSlot, LoopConfig, LoopExit,
    PciIdentity, SessionState, VirtualDeviceServer,
};

fn identity() -> PciIdentity {
    PciIdentity {
        vendor_id: 0x1de5,
        device_id: 0x0001,
        subsystem_vendor_id: 0,
        subsystem_id: 0,
        class: 0x02,
        subclass: 0x00,
        prog_if: 0x00,
        revision: 0x01,
    }
}

fn noop_access(_offset: u64, buf: &mut [u8], _is_write: bool) -> Result<usize, AccessError> {
    Ok(buf.len())
}

fn new_eventfd() -> i32 {
    // SAFETY: plain eventfd creation; the fd is closed by the test.
    let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK) };
    assert!(fd >= 0);
    fd
}

fn signal_eventfd(fd: i32) {
    let one = 1u64.to_ne_bytes();
    // SAFETY: writing 8 bytes from a local buffer to a valid eventfd.
    let n = unsafe { libc::write(fd, one.as_ptr().cast(), one.len()) };
    assert_eq!(n, 8);
}

#[test]
fn msix_mirror_is_forwarded_with_its_sub_index() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nicmux.sock");

    let mut server = VirtualDeviceServer::new(identity());
    server
        .register_region(0, 4096, BarFlags::READ | BarFlags::WRITE, Box::new(noop_access))
        .unwrap();
    server.register_interrupt_vectors(IrqKind::Msix, 4).unwrap();

    let eventfds: Vec<i32> = (0..4).map(|_| new_eventfd()).collect();
    for (vector, &fd) in eventfds.iter().enumerate() {
        server
            .add_interrupt_mirror(fd, IrqSlot::MsixVector(vector as u32))
            .unwrap();
    }
    server.listen(&path).unwrap();

    let client_path = path.clone();
    let fired_fd = eventfds[2];
    let client = thread::spawn(move || {
        let mut stream = UnixStream::connect(client_path).unwrap();
        // A Hello round-trip proves the session is attached before the real
        // interrupt fires; the eventfd then stays armed until serviced.
        proto::write_frame(&mut stream, &Frame::request(MessageKind::Hello), &[]).unwrap();
        let (reply, _) = proto::read_frame(&mut stream).unwrap().unwrap();
        assert_eq!(reply.status, 0);

        signal_eventfd(fired_fd);
        let (frame, _) = proto::read_frame(&mut stream).unwrap().unwrap();
        assert_eq!(frame.message_kind(), Some(MessageKind::Interrupt));
        proto::write_frame(&mut stream, &Frame::request(MessageKind::Bye), &[]).unwrap();
        let (reply, _) = proto::read_frame(&mut stream).unwrap().unwrap();
        assert_eq!(reply.status, 0);
        frame.index
    });

    let shutdown = AtomicBool::new(false);
    let config = LoopConfig {
        poll_timeout: Duration::from_millis(100),
    };
    let exit = run_interrupt_loop(&mut server, &shutdown, config).unwrap();
    assert_eq!(exit, LoopExit::ClientDisconnected);

    let vector = client.join().unwrap();
    assert_eq!(vector, 2);

    server.shutdown();
    assert_eq!(server.state(), SessionState::Closed);
    for fd in eventfds {
        // SAFETY: fds created by this test.
        unsafe { libc::close(fd) };
    }
}

#[test]
fn shutdown_flag_is_observed_within_one_timeout() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nicmux.sock");

    let mut server = VirtualDeviceServer::new(identity());
    server
        .register_region(0, 4096, BarFlags::READ | BarFlags::WRITE, Box::new(noop_access))
        .unwrap();
    server.register_interrupt_vectors(IrqKind::Msi, 1).unwrap();
    server.listen(&path).unwrap();

    let shutdown = AtomicBool::new(false);
    let config = LoopConfig {
        poll_timeout: Duration::from_millis(500),
    };

    let start = Instant::now();
    let exit = thread::scope(|scope| {
        scope.spawn(|| {
            thread::sleep(Duration::from_millis(100));
            shutdown.store(true, Ordering::Release);
        });
        run_interrupt_loop(&mut server, &shutdown, config).unwrap()
    });
    let elapsed = start.elapsed();

    assert_eq!(exit, LoopExit::ShutdownRequested);
    // One blocked poll plus the iteration-boundary check.
    assert!(elapsed < Duration::from_millis(1500), "took {elapsed:?}");

    // Teardown releases everything exactly once; a second call is a no-op.
    server.shutdown();
    assert_eq!(server.state(), SessionState::Closed);
    server.shutdown();
    assert_eq!(server.state(), SessionState::Closed);
}
