#![allow(rustdoc::broken_intra_doc_links)]
//! USB-MIDI host class driver
//!
//! Locates the MIDI streaming interface of a USB device, selects its bulk endpoints and
//! exchanges 4-byte USB-MIDI event packets with it.
//!
//! The crate is split into layers:
//!
//!   * [`descriptor`] parses raw configuration descriptors,
//!   * [`packet`] converts between MIDI messages and USB-MIDI event packets,
//!   * [`port`] buffers event packets over any [`MidiPipe`],
//!   * [`transport`] exposes a byte-stream surface for MIDI message libraries,
//!   * [`host`] (crate feature `host`) talks to real devices through [`rusb`].
//!

pub mod descriptor;
pub mod packet;
pub mod port;
pub mod transport;

#[cfg(feature = "host")]
pub mod host;

pub use packet::EventPacket;
pub use port::{MidiPipe, MidiPort};
pub use transport::{MidiTransport, UsbHostMidiTransport};

/// Audio interface class code.
pub const USB_CLASS_AUDIO: u8 = 0x01;

/// MIDI streaming interface subclass code.
pub const USB_SUBCLASS_MIDISTREAMING: u8 = 0x03;

/// Vendor-specific interface class code.
pub const USB_CLASS_VENDOR_SPECIFIC: u8 = 0xff;

/// Size of the receive buffer and upper bound of a single outgoing SysEx transfer.
pub const MIDI_EVENT_PACKET_SIZE: usize = 64;

/// Maximum length of a SysEx message, including its start and end bytes.
pub const MIDI_MAX_SYSEX_SIZE: usize = 256;

/// USB interface class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Class {
    /// Class code.
    pub class: u8,
    /// Subclass code.
    pub sub_class: u8,
    /// Protocol code.
    pub protocol: u8,
}

impl Class {
    /// USB-MIDI streaming interface.
    pub const MIDI_STREAMING: Class = Class::new(USB_CLASS_AUDIO, USB_SUBCLASS_MIDISTREAMING, 0);

    /// Creates a new USB interface class.
    pub const fn new(class: u8, sub_class: u8, protocol: u8) -> Self {
        Self { class, sub_class, protocol }
    }

    /// Creates a new USB interface class with vendor-specific class code.
    pub const fn vendor_specific(sub_class: u8, protocol: u8) -> Self {
        Self::new(USB_CLASS_VENDOR_SPECIFIC, sub_class, protocol)
    }

    /// Whether class and subclass match, ignoring the protocol code.
    ///
    /// MIDI streaming interfaces do not define a protocol, but some devices report one anyway.
    pub const fn matches(&self, class: u8, sub_class: u8) -> bool {
        self.class == class && self.sub_class == sub_class
    }
}
