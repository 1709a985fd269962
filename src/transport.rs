//! Byte-stream MIDI transport.
//!
//! MIDI message libraries typically drive their transport as a serial byte stream:
//! outgoing messages are framed by [`begin_transmission`](MidiTransport::begin_transmission)
//! and [`end_transmission`](MidiTransport::end_transmission), incoming bytes are polled with
//! [`available`](MidiTransport::available) and [`read`](MidiTransport::read).
//! [`UsbHostMidiTransport`] provides this surface on top of a [`MidiPort`].

use std::io::Result;

use crate::{
    packet::check_cable,
    port::{MidiPipe, MidiPort},
    MIDI_MAX_SYSEX_SIZE,
};

/// Byte-stream transport used by a MIDI message library.
pub trait MidiTransport {
    /// Whether the transport echoes received messages on its own.
    const THRU_ACTIVATED: bool;

    /// Prepares the transport for use.
    fn begin(&mut self);

    /// Starts an outgoing message with the specified status byte.
    ///
    /// Returns whether the message can be written.
    fn begin_transmission(&mut self, status: u8) -> bool;

    /// Appends a byte to the outgoing message.
    fn write(&mut self, byte: u8);

    /// Sends the outgoing message.
    fn end_transmission(&mut self) -> Result<()>;

    /// Returns the next received byte.
    fn read(&mut self) -> Option<u8>;

    /// Number of received bytes ready to be read.
    ///
    /// Polls the device when no bytes are pending.
    fn available(&mut self) -> Result<usize>;
}

/// MIDI transport over a USB-MIDI device.
///
/// Each transport is bound to one virtual cable. Received packets addressed to other cables
/// are skipped.
#[derive(Debug)]
pub struct UsbHostMidiTransport<P> {
    port: MidiPort<P>,
    cable: u8,

    tx_buffer: [u8; MIDI_MAX_SYSEX_SIZE],
    tx_index: usize,
    tx_status: u8,
    tx_dropped: usize,

    rx_buffer: [u8; MIDI_MAX_SYSEX_SIZE],
    rx_length: usize,
    rx_index: usize,
}

impl<P: MidiPipe> UsbHostMidiTransport<P> {
    /// Creates a transport on virtual cable 0.
    pub fn new(pipe: P) -> Self {
        Self::build(MidiPort::new(pipe), 0)
    }

    /// Creates a transport on the specified virtual cable.
    ///
    /// Fails with [`ErrorKind::InvalidInput`](std::io::ErrorKind::InvalidInput) if the cable
    /// number is above 15.
    pub fn with_cable(pipe: P, cable: u8) -> Result<Self> {
        Self::from_port(MidiPort::new(pipe), cable)
    }

    /// Creates a transport on an existing port.
    pub fn from_port(port: MidiPort<P>, cable: u8) -> Result<Self> {
        check_cable(cable)?;
        Ok(Self::build(port, cable))
    }

    fn build(port: MidiPort<P>, cable: u8) -> Self {
        Self {
            port,
            cable,
            tx_buffer: [0; MIDI_MAX_SYSEX_SIZE],
            tx_index: 0,
            tx_status: 0,
            tx_dropped: 0,
            rx_buffer: [0; MIDI_MAX_SYSEX_SIZE],
            rx_length: 0,
            rx_index: 0,
        }
    }

    /// Virtual cable number.
    pub fn cable(&self) -> u8 {
        self.cable
    }

    /// Status byte of the message passed to the last `begin_transmission`.
    pub fn tx_status(&self) -> u8 {
        self.tx_status
    }

    /// The underlying port.
    pub fn port(&mut self) -> &mut MidiPort<P> {
        &mut self.port
    }

    /// Returns the underlying port.
    pub fn into_port(self) -> MidiPort<P> {
        self.port
    }

    fn fetch(&mut self) -> Result<usize> {
        loop {
            let Some(packet) = self.port.recv_packet()? else { return Ok(0) };

            if packet.cable() != self.cable {
                tracing::trace!("skipping packet for cable {}", packet.cable());
                if self.port.has_buffered() {
                    continue;
                }
                return Ok(0);
            }

            let data = if packet.is_sysex() { packet.sysex_data() } else { packet.message() };
            self.rx_buffer[..data.len()].copy_from_slice(data);
            self.rx_index = 0;
            self.rx_length = data.len();

            if self.rx_length > 0 || !self.port.has_buffered() {
                return Ok(self.rx_length);
            }
        }
    }
}

impl<P: MidiPipe> MidiTransport for UsbHostMidiTransport<P> {
    const THRU_ACTIVATED: bool = false;

    fn begin(&mut self) {
        self.tx_index = 0;
        self.tx_dropped = 0;
        self.rx_index = 0;
        self.rx_length = 0;
    }

    fn begin_transmission(&mut self, status: u8) -> bool {
        self.tx_status = status;
        self.tx_buffer[0] = 0;
        self.tx_index = 0;
        self.tx_dropped = 0;
        true
    }

    fn write(&mut self, byte: u8) {
        if self.tx_index < MIDI_MAX_SYSEX_SIZE {
            self.tx_buffer[self.tx_index] = byte;
            self.tx_index += 1;
        } else {
            if self.tx_dropped == 0 {
                tracing::warn!("outgoing message exceeds {MIDI_MAX_SYSEX_SIZE} bytes, dropping excess");
            }
            self.tx_dropped += 1;
        }
    }

    fn end_transmission(&mut self) -> Result<()> {
        let len = std::mem::take(&mut self.tx_index);
        self.tx_dropped = 0;
        if len == 0 {
            return Ok(());
        }
        self.port.send_data(&self.tx_buffer[..len], self.cable)
    }

    fn read(&mut self) -> Option<u8> {
        if self.rx_length == 0 {
            return None;
        }

        let byte = self.rx_buffer[self.rx_index];
        self.rx_index += 1;
        self.rx_length -= 1;
        Some(byte)
    }

    fn available(&mut self) -> Result<usize> {
        if self.rx_length != 0 {
            return Ok(self.rx_length);
        }
        self.fetch()
    }
}
