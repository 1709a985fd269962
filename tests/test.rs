use std::io::ErrorKind;

use usbh_midi::{MidiPort, MidiTransport, UsbHostMidiTransport, MIDI_MAX_SYSEX_SIZE};

mod util;
use util::*;

const SEED: u64 = 12523;
const TEST_MESSAGES: usize = 200;

fn send(transport: &mut UsbHostMidiTransport<MockPipe>, msg: &[u8]) {
    assert!(transport.begin_transmission(msg[0]));
    for &b in msg {
        transport.write(b);
    }
    transport.end_transmission().expect("send failed");
}

fn read_bytes(transport: &mut UsbHostMidiTransport<MockPipe>, len: usize) -> Vec<u8> {
    let mut data = Vec::with_capacity(len);
    while data.len() < len {
        let n = transport.available().expect("receive failed");
        assert!(n > 0, "no data after {} of {len} bytes", data.len());
        for _ in 0..n {
            data.push(transport.read().expect("byte announced but not readable"));
        }
    }
    data
}

#[test]
fn sends_channel_messages() {
    init_log();

    let mut transport = UsbHostMidiTransport::with_cable(MockPipe::new(64), 2).unwrap();
    transport.begin();
    send(&mut transport, &[0x90, 60, 100]);
    send(&mut transport, &[0xc3, 12]);
    send(&mut transport, &[0xf8]);
    assert_eq!(transport.tx_status(), 0xf8);

    let sent = &transport.port().get_ref().sent;
    assert_eq!(sent, &[vec![0x29, 0x90, 60, 100], vec![0x2c, 0xc3, 12, 0], vec![0x2f, 0xf8, 0, 0]]);
}

#[test]
fn rejects_invalid_cable() {
    let err = UsbHostMidiTransport::with_cable(MockPipe::new(64), 16).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidInput);

    let transport = UsbHostMidiTransport::from_port(MidiPort::new(MockPipe::new(64)), 15).unwrap();
    assert_eq!(transport.cable(), 15);
}

#[test]
fn sysex_loopback() {
    init_log();

    let mut data = TestData::new(SEED);
    let mut transport = UsbHostMidiTransport::new(MockPipe::loopback(64));
    transport.begin();

    for n in 0..TEST_MESSAGES {
        let len = data.next_len(MIDI_MAX_SYSEX_SIZE);
        let msg = data.sysex(len);
        send(&mut transport, &msg);

        let received = read_bytes(&mut transport, len);
        assert_eq!(received, msg, "message {n} of {len} bytes mismatch");
        assert_eq!(transport.available().unwrap(), 0, "extra data after message {n}");
    }

    let transfers = &transport.port().get_ref().sent;
    assert!(transfers.iter().all(|t| t.len() <= 64 && t.len() % 4 == 0));
}

#[test]
fn sysex_respects_small_max_packet_size() {
    let mut transport = UsbHostMidiTransport::new(MockPipe::new(8));
    send(&mut transport, &[0xf0, 0x43, 0x10, 0x4c, 0x00, 0x00, 0x7e, 0x00, 0xf7]);

    let sent = &transport.port().get_ref().sent;
    assert_eq!(sent, &[vec![0x04, 0xf0, 0x43, 0x10, 0x04, 0x4c, 0x00, 0x00], vec![0x07, 0x7e, 0x00, 0xf7]]);
}

#[test]
fn oversized_sysex_is_rejected() {
    let mut transport = UsbHostMidiTransport::new(MockPipe::new(64));

    transport.begin_transmission(0xf0);
    transport.write(0xf0);
    for _ in 0..300 {
        transport.write(0x11);
    }
    transport.write(0xf7);

    let err = transport.end_transmission().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidInput);
    assert!(transport.port().get_ref().sent.is_empty());

    // the transport stays usable
    send(&mut transport, &[0xb0, 64, 127]);
    assert_eq!(transport.port().get_ref().sent.len(), 1);
}

#[test]
fn receives_only_own_cable() {
    let pipe = MockPipe::new(64).with_incoming(&[
        0x19, 0x91, 60, 100, // cable 1
        0x0b, 0xb0, 1, 64, // cable 0
        0x39, 0x90, 61, 100, // cable 3
    ]);
    let mut transport = UsbHostMidiTransport::new(pipe);
    transport.begin();

    assert_eq!(transport.available().unwrap(), 3);
    assert_eq!(read_bytes(&mut transport, 3), [0xb0, 1, 64]);
    assert_eq!(transport.available().unwrap(), 0);
    assert_eq!(transport.read(), None);
}

#[test]
fn receives_system_messages() {
    let pipe = MockPipe::new(64).with_incoming(&[
        0x0f, 0xf8, 0, 0, // timing clock
        0x05, 0xf6, 0, 0, // tune request
        0x02, 0xf3, 7, 0, // song select
        0x03, 0xf2, 0x10, 0x02, // song position
    ]);
    let mut transport = UsbHostMidiTransport::new(pipe);
    transport.begin();

    assert_eq!(transport.available().unwrap(), 1);
    assert_eq!(transport.read(), Some(0xf8));
    assert_eq!(transport.available().unwrap(), 1);
    assert_eq!(transport.read(), Some(0xf6));
    assert_eq!(transport.available().unwrap(), 2);
    assert_eq!(read_bytes(&mut transport, 2), [0xf3, 7]);
    assert_eq!(read_bytes(&mut transport, 3), [0xf2, 0x10, 0x02]);
}

#[test]
fn begin_discards_pending_bytes() {
    let pipe = MockPipe::new(64).with_incoming(&[0x09, 0x90, 60, 1]);
    let mut transport = UsbHostMidiTransport::new(pipe);

    assert_eq!(transport.available().unwrap(), 3);
    assert_eq!(transport.read(), Some(0x90));
    transport.begin();
    assert_eq!(transport.read(), None);
    assert_eq!(transport.available().unwrap(), 0);
}

#[test]
fn transfer_errors_are_reported() {
    let mut pipe = MockPipe::new(64);
    pipe.fail = Some(ErrorKind::BrokenPipe);
    let mut transport = UsbHostMidiTransport::new(pipe);

    assert_eq!(transport.available().unwrap_err().kind(), ErrorKind::BrokenPipe);
    transport.begin_transmission(0x80);
    transport.write(0x80);
    transport.write(60);
    transport.write(0);
    assert_eq!(transport.end_transmission().unwrap_err().kind(), ErrorKind::BrokenPipe);
}

#[test]
fn port_reads_raw_packets() {
    let pipe = MockPipe::new(64).with_incoming(&[0x24, 0xf0, 0x41, 0x10, 0x26, 0x42, 0xf7, 0]);
    let mut port = MidiPort::new(pipe);

    let mut raw = [0; 4];
    assert_eq!(port.recv_raw(&mut raw).unwrap(), 3);
    assert_eq!(raw, [0x24, 0xf0, 0x41, 0x10]);
    assert_eq!(port.recv_raw(&mut raw).unwrap(), 2);
    assert_eq!(raw, [0x26, 0x42, 0xf7, 0]);
    assert_eq!(port.recv_raw(&mut raw).unwrap(), 0);
}

#[cfg(feature = "host")]
#[tokio::test]
#[ignore = "USB-MIDI device required"]
async fn host() {
    use std::time::Duration;
    use tokio::time::timeout;
    use usbh_midi::host::{connect, find_devices, UsbMidiDevice};

    const IDENTITY_REQUEST: &[u8] = &[0xf0, 0x7e, 0x7f, 0x06, 0x01, 0xf7];

    init_log();

    let devs = find_devices(&rusb::GlobalContext::default()).expect("cannot list devices");
    let dev = devs.first().expect("no USB-MIDI device found");
    println!("Using device: {dev:?}");

    let dev = UsbMidiDevice::open(dev).expect("cannot open device");
    println!("Opened {:04x}:{:04x} on interface {}", dev.id_vendor(), dev.id_product(), dev.interface());
    assert!(dev.is_running());

    let (tx, mut rx) = connect(dev).await.expect("cannot connect");

    println!("Sending identity request");
    tx.send(0, IDENTITY_REQUEST).await.expect("send failed");

    match timeout(Duration::from_secs(2), rx.recv()).await {
        Ok(event) => println!("Received: {:02x?}", event.expect("receive failed")),
        Err(_) => println!("Device did not answer identity request"),
    }

    drop(tx);
    drop(rx);
}
