//! Backend setup through the public `DeviceBackend` surface, driven over a
//! real socket session.

use std::os::unix::net::UnixStream;
use std::sync::mpsc;
use std::thread;

use nicmux_backend::{DeviceBackend, DeviceModel, EmulatedDevice, ModelRegion, StubDevice};
use nicmux_server::proto::{self, Frame, MessageKind};
use nicmux_server::{
    AccessError, BarFlags, DmaRange, IrqKind, PciIdentity, ServiceOutcome, VirtualDeviceServer,
};

/// A scripted model: a handful of registers in BAR0 plus an access log the
/// test can drain through a channel.
struct TestModel {
    registers: [u8; 64],
    events: mpsc::Sender<String>,
}

impl TestModel {
    fn new(events: mpsc::Sender<String>) -> Self {
        Self {
            registers: [0; 64],
            events,
        }
    }
}

impl DeviceModel for TestModel {
    fn pci_identity(&self) -> PciIdentity {
        PciIdentity {
            vendor_id: 0x8086,
            device_id: 0x1593,
            subsystem_vendor_id: 0x0086,
            subsystem_id: 0x0001,
            class: 0x02,
            subclass: 0x00,
            prog_if: 0x00,
            revision: 0x02,
        }
    }

    fn regions(&self) -> Vec<ModelRegion> {
        vec![
            ModelRegion {
                len: 64,
                flags: BarFlags::READ | BarFlags::WRITE,
            },
            ModelRegion {
                len: 0,
                flags: BarFlags::empty(),
            },
        ]
    }

    fn msix_vectors(&self) -> u32 {
        4
    }

    fn handle_register_access(
        &mut self,
        bar: u32,
        offset: u64,
        data: &mut [u8],
        is_write: bool,
    ) -> Result<usize, AccessError> {
        let start = offset as usize;
        if is_write {
            self.registers[start..start + data.len()].copy_from_slice(data);
        } else {
            data.copy_from_slice(&self.registers[start..start + data.len()]);
        }
        self.events
            .send(format!("access bar{bar} off={offset} len={} write={is_write}", data.len()))
            .unwrap();
        Ok(data.len())
    }

    fn handle_reset(&mut self) {
        self.registers = [0; 64];
        self.events.send("reset".to_owned()).unwrap();
    }

    fn dma_attached(&mut self, range: DmaRange) {
        self.events
            .send(format!("dma+ iova={:#x} len={:#x}", range.iova, range.len))
            .unwrap();
    }

    fn dma_detached(&mut self, range: DmaRange) {
        self.events
            .send(format!("dma- iova={:#x} len={:#x}", range.iova, range.len))
            .unwrap();
    }
}

fn serve_until_disconnect(server: &mut VirtualDeviceServer) {
    server.accept().unwrap();
    loop {
        match server.service().unwrap() {
            ServiceOutcome::Continue => {}
            ServiceOutcome::Disconnected => break,
        }
    }
}

#[test]
fn emulated_backend_delegates_to_the_model() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nicmux.sock");

    let (events_tx, events_rx) = mpsc::channel();
    let mut backend = DeviceBackend::Emulated(EmulatedDevice::new(Box::new(TestModel::new(
        events_tx,
    ))));

    let mut server = VirtualDeviceServer::new(backend.identity());
    backend.setup(&mut server).unwrap();
    assert_eq!(server.irq_count(IrqKind::Msix), 4);
    assert_eq!(server.identity().vendor_id, 0x8086);
    server.listen(&path).unwrap();

    let client_path = path.clone();
    let client = thread::spawn(move || {
        let mut stream = UnixStream::connect(client_path).unwrap();

        // Write then read back through the model's registers.
        let mut frame = Frame::request(MessageKind::RegionWrite);
        frame.offset = 16;
        frame.len = 4;
        proto::write_frame(&mut stream, &frame, &[4, 3, 2, 1]).unwrap();
        let (reply, _) = proto::read_frame(&mut stream).unwrap().unwrap();
        assert_eq!(reply.status, 0);

        let mut frame = Frame::request(MessageKind::RegionRead);
        frame.offset = 16;
        frame.len = 4;
        proto::write_frame(&mut stream, &frame, &[]).unwrap();
        let (reply, data) = proto::read_frame(&mut stream).unwrap().unwrap();
        assert_eq!(reply.status, 0);
        assert_eq!(data, vec![4, 3, 2, 1]);

        // Reset, DMA lifecycle and irq-state messages are all acknowledged.
        proto::write_frame(&mut stream, &Frame::request(MessageKind::Reset), &[]).unwrap();
        assert_eq!(proto::read_frame(&mut stream).unwrap().unwrap().0.status, 0);

        let mut frame = Frame::request(MessageKind::DmaMap);
        frame.offset = 0x1000;
        frame.len = 0x2000;
        proto::write_frame(&mut stream, &frame, &[]).unwrap();
        assert_eq!(proto::read_frame(&mut stream).unwrap().unwrap().0.status, 0);

        let mut frame = Frame::request(MessageKind::IrqState);
        frame.index = 2; // MSI-X
        frame.len = 4;
        proto::write_frame(&mut stream, &frame, &[]).unwrap();
        assert_eq!(proto::read_frame(&mut stream).unwrap().unwrap().0.status, 0);

        proto::write_frame(&mut stream, &Frame::request(MessageKind::Bye), &[]).unwrap();
        let _ = proto::read_frame(&mut stream).unwrap();
    });

    serve_until_disconnect(&mut server);
    client.join().unwrap();

    let events: Vec<String> = events_rx.try_iter().collect();
    assert_eq!(
        events,
        vec![
            "access bar0 off=16 len=4 write=true".to_owned(),
            "access bar0 off=16 len=4 write=false".to_owned(),
            "reset".to_owned(),
            "dma+ iova=0x1000 len=0x2000".to_owned(),
        ]
    );
}

#[test]
fn stub_backend_exposes_an_inert_but_valid_device() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nicmux.sock");

    let mut backend = DeviceBackend::Stub(StubDevice);
    let mut server = VirtualDeviceServer::new(backend.identity());
    backend.setup(&mut server).unwrap();
    assert_eq!(server.irq_count(IrqKind::Intx), 0);
    server.listen(&path).unwrap();

    let client_path = path.clone();
    let client = thread::spawn(move || {
        let mut stream = UnixStream::connect(client_path).unwrap();

        proto::write_frame(&mut stream, &Frame::request(MessageKind::Hello), &[]).unwrap();
        let (reply, layout) = proto::read_frame(&mut stream).unwrap().unwrap();
        assert_eq!(reply.status, 0);
        assert_eq!(u16::from_le_bytes([layout[0], layout[1]]), 0x1de5);
        assert_eq!(u32::from_le_bytes(layout[12..16].try_into().unwrap()), 0);

        // Any region access answers with an error, not a hang or a crash.
        let mut frame = Frame::request(MessageKind::RegionRead);
        frame.len = 4;
        proto::write_frame(&mut stream, &frame, &[]).unwrap();
        let (reply, _) = proto::read_frame(&mut stream).unwrap().unwrap();
        assert_eq!(reply.status, -libc::ENODEV);

        proto::write_frame(&mut stream, &Frame::request(MessageKind::Bye), &[]).unwrap();
        let _ = proto::read_frame(&mut stream).unwrap();
    });

    serve_until_disconnect(&mut server);
    client.join().unwrap();
}
