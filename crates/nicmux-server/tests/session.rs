//! End-to-end session tests over a real Unix socket.

use std::cell::RefCell;
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::rc::Rc;
use std::thread;

use nicmux_server::proto::{self, Frame, MessageKind};
use nicmux_server::{
    AccessError, BarFlags, IrqKind, PciIdentity, ServerError, ServiceOutcome, SessionState,
    VirtualDeviceServer,
};

fn identity() -> PciIdentity {
    PciIdentity {
        vendor_id: 0x8086,
        device_id: 0x1593,
        subsystem_vendor_id: 0x8086,
        subsystem_id: 0x0001,
        class: 0x02,
        subclass: 0x00,
        prog_if: 0x00,
        revision: 0x02,
    }
}

fn socket_path(dir: &tempfile::TempDir) -> PathBuf {
    dir.path().join("nicmux.sock")
}

fn request(kind: MessageKind, index: u32, offset: u64, len: u32) -> Frame {
    let mut frame = Frame::request(kind);
    frame.index = index;
    frame.offset = offset;
    frame.len = len;
    frame
}

#[test]
fn session_flow_dispatches_accesses_through_callbacks() {
    let dir = tempfile::tempdir().unwrap();
    let path = socket_path(&dir);

    let log: Rc<RefCell<Vec<(u64, usize, bool)>>> = Rc::new(RefCell::new(Vec::new()));
    let log_cb = Rc::clone(&log);

    let mut server = VirtualDeviceServer::new(identity());
    server
        .register_region(
            0,
            4096,
            BarFlags::READ | BarFlags::WRITE,
            Box::new(move |offset, buf, is_write| {
                log_cb.borrow_mut().push((offset, buf.len(), is_write));
                if !is_write {
                    buf.fill(0xab);
                }
                Ok(buf.len())
            }),
        )
        .unwrap();
    server.register_interrupt_vectors(IrqKind::Msix, 4).unwrap();
    server.listen(&path).unwrap();

    let client_path = path.clone();
    let client = thread::spawn(move || {
        let mut stream = UnixStream::connect(client_path).unwrap();

        proto::write_frame(&mut stream, &Frame::request(MessageKind::Hello), &[]).unwrap();
        let (reply, layout) = proto::read_frame(&mut stream).unwrap().unwrap();
        assert_eq!(reply.status, 0);
        // Identity leads the layout payload.
        assert_eq!(u16::from_le_bytes([layout[0], layout[1]]), 0x8086);
        assert_eq!(u16::from_le_bytes([layout[2], layout[3]]), 0x1593);
        // One region, then the five vector counts with MSI-X = 4.
        let region_count = u32::from_le_bytes(layout[12..16].try_into().unwrap());
        assert_eq!(region_count, 1);
        let irq_base = 16 + 16;
        let counts: Vec<u32> = (0..5)
            .map(|i| {
                u32::from_le_bytes(layout[irq_base + i * 4..irq_base + i * 4 + 4].try_into().unwrap())
            })
            .collect();
        assert_eq!(counts, vec![0, 0, 4, 0, 0]);

        // A 4-byte write at offset 0 must reach the callback verbatim.
        proto::write_frame(
            &mut stream,
            &request(MessageKind::RegionWrite, 0, 0, 4),
            &[1, 2, 3, 4],
        )
        .unwrap();
        let (reply, _) = proto::read_frame(&mut stream).unwrap().unwrap();
        assert_eq!(reply.status, 0);

        proto::write_frame(&mut stream, &request(MessageKind::RegionRead, 0, 8, 4), &[]).unwrap();
        let (reply, data) = proto::read_frame(&mut stream).unwrap().unwrap();
        assert_eq!(reply.status, 0);
        assert_eq!(data, vec![0xab; 4]);

        // offset + len > region length: rejected before any callback runs.
        proto::write_frame(
            &mut stream,
            &request(MessageKind::RegionWrite, 0, 4094, 4),
            &[0; 4],
        )
        .unwrap();
        let (reply, _) = proto::read_frame(&mut stream).unwrap().unwrap();
        assert_eq!(reply.status, -libc::EINVAL);

        // Unregistered region.
        proto::write_frame(&mut stream, &request(MessageKind::RegionRead, 5, 0, 4), &[]).unwrap();
        let (reply, _) = proto::read_frame(&mut stream).unwrap().unwrap();
        assert_eq!(reply.status, -libc::ENODEV);

        // Config reads come from the virtual config space, not callbacks.
        proto::write_frame(&mut stream, &request(MessageKind::ConfigRead, 0, 0, 4), &[]).unwrap();
        let (reply, data) = proto::read_frame(&mut stream).unwrap().unwrap();
        assert_eq!(reply.status, 0);
        assert_eq!(u16::from_le_bytes([data[0], data[1]]), 0x8086);

        proto::write_frame(&mut stream, &Frame::request(MessageKind::Bye), &[]).unwrap();
        let (reply, _) = proto::read_frame(&mut stream).unwrap().unwrap();
        assert_eq!(reply.status, 0);
    });

    server.accept().unwrap();
    assert_eq!(server.state(), SessionState::Connected);
    loop {
        match server.service().unwrap() {
            ServiceOutcome::Continue => {}
            ServiceOutcome::Disconnected => break,
        }
    }
    client.join().unwrap();

    // The in-bounds accesses reached the callback exactly as requested; the
    // out-of-bounds one never did.
    assert_eq!(&*log.borrow(), &[(0, 4, true), (8, 4, false)]);
}

#[test]
fn trigger_interrupt_honors_session_and_vector_contracts() {
    let dir = tempfile::tempdir().unwrap();
    let path = socket_path(&dir);

    let mut server = VirtualDeviceServer::new(identity());
    server
        .register_region(0, 4096, BarFlags::READ | BarFlags::WRITE, Box::new(noop_access))
        .unwrap();
    server.register_interrupt_vectors(IrqKind::Msix, 4).unwrap();

    // Not connected: reported, dropped, no observable side effect.
    assert!(matches!(
        server.trigger_interrupt(0),
        Err(ServerError::NotConnected)
    ));

    server.listen(&path).unwrap();
    let client_path = path.clone();
    let client = thread::spawn(move || {
        let mut stream = UnixStream::connect(client_path).unwrap();
        let mut vectors = Vec::new();
        for _ in 0..4 {
            let (frame, _) = proto::read_frame(&mut stream).unwrap().unwrap();
            assert_eq!(frame.message_kind(), Some(MessageKind::Interrupt));
            vectors.push(frame.index);
        }
        vectors
    });

    server.accept().unwrap();
    for vector in 0..4 {
        server.trigger_interrupt(vector).unwrap();
    }
    assert!(matches!(
        server.trigger_interrupt(4),
        Err(ServerError::InvalidVector(4))
    ));

    let vectors = client.join().unwrap();
    assert_eq!(vectors, vec![0, 1, 2, 3]);
}

#[test]
fn registration_is_rejected_outside_the_configured_state() {
    let dir = tempfile::tempdir().unwrap();
    let path = socket_path(&dir);

    let mut server = VirtualDeviceServer::new(identity());

    // Listening and accepting both require a configured server.
    assert!(matches!(
        server.listen(&path),
        Err(ServerError::InvalidState { .. })
    ));
    assert!(matches!(
        server.accept(),
        Err(ServerError::InvalidState { .. })
    ));

    server
        .register_region(0, 0x1000, BarFlags::READ | BarFlags::WRITE, Box::new(noop_access))
        .unwrap();
    server.register_interrupt_vectors(IrqKind::Msi, 1).unwrap();
    assert!(matches!(
        server.register_interrupt_vectors(IrqKind::Msi, 1),
        Err(ServerError::DuplicateIrqKind(IrqKind::Msi))
    ));
    assert!(matches!(
        server.register_region(1, 0, BarFlags::READ, Box::new(noop_access)),
        Err(ServerError::ZeroLengthRegion(1))
    ));

    server.listen(&path).unwrap();
    let client_path = path.clone();
    let client = thread::spawn(move || {
        let _stream = UnixStream::connect(client_path).unwrap();
        // Keep the stream open until the main thread is done asserting.
        std::thread::sleep(std::time::Duration::from_millis(200));
    });
    server.accept().unwrap();

    // The tables are immutable once a session is attached.
    assert!(matches!(
        server.register_region(2, 0x1000, BarFlags::READ, Box::new(noop_access)),
        Err(ServerError::InvalidState { .. })
    ));
    assert!(matches!(
        server.register_interrupt_vectors(IrqKind::Intx, 1),
        Err(ServerError::InvalidState { .. })
    ));
    client.join().unwrap();
}

#[test]
fn last_registration_wins_for_a_region_index() {
    let mut server = VirtualDeviceServer::new(identity());
    let hits: Rc<RefCell<u32>> = Rc::new(RefCell::new(0));

    server
        .register_region(0, 0x1000, BarFlags::READ, Box::new(noop_access))
        .unwrap();
    let hits_cb = Rc::clone(&hits);
    server
        .register_region(
            0,
            0x2000,
            BarFlags::READ | BarFlags::WRITE,
            Box::new(move |_, buf, _| {
                *hits_cb.borrow_mut() += 1;
                Ok(buf.len())
            }),
        )
        .unwrap();

    // Reach the dispatch path directly through a connected socket pair would
    // be overkill here; the config space already tells the story: the BAR
    // was re-declared with the larger size.
    let mut bar = [0u8; 4];
    // Probe BAR0.
    server_config_write(&mut server, 0x10, &0xffff_ffffu32.to_le_bytes());
    server_config_read(&server, 0x10, &mut bar);
    assert_eq!(u32::from_le_bytes(bar), 0xffff_e000);
    let _ = hits;
}

fn noop_access(_offset: u64, buf: &mut [u8], _is_write: bool) -> Result<usize, AccessError> {
    Ok(buf.len())
}

// Config space access without a live session, via the public surface used by
// the protocol handlers.
fn server_config_read(server: &VirtualDeviceServer, offset: u64, buf: &mut [u8]) {
    server.config_read(offset, buf);
}

fn server_config_write(server: &mut VirtualDeviceServer, offset: u64, buf: &[u8]) {
    server.config_write(offset, buf);
}
