//! Prints MIDI messages received from the first attached USB-MIDI device.
//!
//! Set `RUST_LOG=debug` to see device selection.

use futures::StreamExt;
use std::sync::Once;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use usbh_midi::host::{connect, find_devices, UsbMidiDevice};

fn init_log() {
    static ONCE: Once = Once::new();
    ONCE.call_once(|| {
        tracing_subscriber::registry().with(fmt::layer()).with(EnvFilter::from_default_env()).init();
        tracing_log::LogTracer::init().unwrap();
    });
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    init_log();

    let devs = find_devices(&rusb::GlobalContext::default()).expect("cannot list USB devices");
    let dev = devs.first().expect("no USB-MIDI device found");
    println!("Using device: {dev:?}");

    let dev = UsbMidiDevice::open(dev).expect("cannot open device");
    println!(
        "Opened {:04x}:{:04x}, interface {}, IN {:?}, OUT {:?}",
        dev.id_vendor(),
        dev.id_product(),
        dev.interface(),
        dev.ep_in(),
        dev.ep_out()
    );

    let (_tx, rx) = connect(dev).await.expect("cannot connect");
    let mut events = rx.into_stream();

    println!("Listening, press Ctrl+C to quit");
    while let Some(event) = events.next().await {
        match event {
            Ok(event) => println!("cable {}: {:02x?}", event.cable, &event.data[..]),
            Err(err) => {
                eprintln!("receive failed: {err}");
                break;
            }
        }
    }
}
