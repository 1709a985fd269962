//! USB-MIDI event packets.
//!
//! Every MIDI message travels as one or more 4-byte event packets. The first byte holds
//! the virtual cable number in its high nibble and the code index number (CIN) in its
//! low nibble; the remaining three bytes carry the MIDI bytes, zero-padded.

use bytes::{Bytes, BytesMut};
use std::{
    fmt,
    io::{Error, ErrorKind, Result},
};

use crate::MIDI_MAX_SYSEX_SIZE;

/// Size of an event packet.
pub const PACKET_SIZE: usize = 4;

/// Highest virtual cable number.
pub const MAX_CABLE: u8 = 15;

const SYSEX_START: u8 = 0xf0;
const SYSEX_END: u8 = 0xf7;

/// Code index numbers.
pub mod cin {
    /// Miscellaneous function codes, reserved.
    pub const MISC: u8 = 0x0;
    /// Cable events, reserved.
    pub const CABLE_EVENT: u8 = 0x1;
    /// Two-byte system common message.
    pub const SYSTEM_COMMON_2: u8 = 0x2;
    /// Three-byte system common message.
    pub const SYSTEM_COMMON_3: u8 = 0x3;
    /// SysEx starts or continues.
    pub const SYSEX_CONTINUE: u8 = 0x4;
    /// SysEx ends with the following byte, or single-byte system common message.
    pub const SYSEX_END_1: u8 = 0x5;
    /// SysEx ends with the following two bytes.
    pub const SYSEX_END_2: u8 = 0x6;
    /// SysEx ends with the following three bytes.
    pub const SYSEX_END_3: u8 = 0x7;
    /// Single byte.
    pub const SINGLE_BYTE: u8 = 0xf;
}

/// Returns whether a code index number belongs to a SysEx packet.
pub const fn is_sysex_cin(cin: u8) -> bool {
    cin & 0x0c == 0x04
}

/// Size of the MIDI message starting with `status`.
///
/// The code index number takes precedence for SysEx and single-byte packets; pass `0`
/// when no packet is involved. Returns `0` for undefined messages.
pub const fn message_size(status: u8, cin: u8) -> usize {
    let cin = cin & 0x0f;
    if is_sysex_cin(cin) {
        return match cin {
            cin::SYSEX_CONTINUE | cin::SYSEX_END_3 => 3,
            cin::SYSEX_END_2 => 2,
            _ => 1,
        };
    }
    if cin == cin::SINGLE_BYTE {
        return 1;
    }

    let status = if status < 0xf0 { status & 0xf0 } else { status };
    match status {
        0x80 | 0x90 | 0xa0 | 0xb0 | 0xe0 | 0xf2 => 3,
        0xc0 | 0xd0 | 0xf1 | 0xf3 => 2,
        0xf8..=0xfc | 0xfe | 0xff => 1,
        _ => 0,
    }
}

/// Length of the SysEx message at the start of `data`, including both the start and end byte.
///
/// Returns `None` if `data` does not start a SysEx message or no end byte is found within
/// [`MIDI_MAX_SYSEX_SIZE`] bytes.
pub fn sysex_len(data: &[u8]) -> Option<usize> {
    if data.first() != Some(&SYSEX_START) {
        return None;
    }

    data.iter().take(MIDI_MAX_SYSEX_SIZE).position(|&b| b == SYSEX_END).map(|pos| pos + 1)
}

/// Number of packet bytes needed to carry `n` bytes of SysEx.
pub const fn sysex_transfer_len(n: usize) -> usize {
    n.div_ceil(3) * PACKET_SIZE
}

/// USB-MIDI event packet.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct EventPacket(pub [u8; PACKET_SIZE]);

impl fmt::Debug for EventPacket {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let [h, a, b, c] = self.0;
        write!(f, "EventPacket({h:02x} {a:02x} {b:02x} {c:02x})")
    }
}

impl From<[u8; PACKET_SIZE]> for EventPacket {
    fn from(data: [u8; PACKET_SIZE]) -> Self {
        Self(data)
    }
}

impl EventPacket {
    /// Creates a packet from header fields and MIDI bytes.
    ///
    /// # Panics
    /// Panics if `cable` is above [`MAX_CABLE`].
    pub const fn new(cable: u8, cin: u8, data: [u8; 3]) -> Self {
        assert!(cable <= MAX_CABLE, "cable number out of range");
        Self([(cable << 4) | (cin & 0x0f), data[0], data[1], data[2]])
    }

    /// Encodes a single MIDI message that is not SysEx.
    ///
    /// The message must start with a status byte and hold all bytes of the message.
    pub fn encode(msg: &[u8], cable: u8) -> Result<Self> {
        check_cable(cable)?;

        let Some(&status) = msg.first() else {
            return Err(Error::new(ErrorKind::InvalidInput, "empty MIDI message"));
        };
        if status < 0x80 {
            return Err(Error::new(ErrorKind::InvalidInput, format!("{status:#04x} is not a status byte")));
        }
        if status == SYSEX_START {
            return Err(Error::new(ErrorKind::InvalidInput, "SysEx must be sent as SysEx packets"));
        }

        let size = message_size(status, 0).max(1);
        if msg.len() < size {
            return Err(Error::new(
                ErrorKind::InvalidInput,
                format!("MIDI message {status:#04x} needs {size} bytes but {} were given", msg.len()),
            ));
        }

        let cin = match status {
            0xf1 | 0xf3 => cin::SYSTEM_COMMON_2,
            0xf2 => cin::SYSTEM_COMMON_3,
            _ => status >> 4,
        };

        let mut data = [0; 3];
        data[..size].copy_from_slice(&msg[..size]);
        Ok(Self::new(cable, cin, data))
    }

    /// Virtual cable number.
    pub const fn cable(&self) -> u8 {
        self.0[0] >> 4
    }

    /// Code index number.
    pub const fn cin(&self) -> u8 {
        self.0[0] & 0x0f
    }

    /// Whether all bytes are zero, which devices use as padding.
    pub fn is_empty(&self) -> bool {
        self.0 == [0; PACKET_SIZE]
    }

    /// Whether this packet carries SysEx data.
    ///
    /// CIN 5 also carries single-byte system common messages, which are not SysEx.
    pub const fn is_sysex(&self) -> bool {
        if self.cin() == cin::SYSEX_END_1 {
            let byte = self.0[1];
            return byte == SYSEX_END || byte < 0x80;
        }
        is_sysex_cin(self.cin())
    }

    /// Whether this packet terminates a SysEx message.
    pub const fn is_sysex_end(&self) -> bool {
        matches!(self.cin(), cin::SYSEX_END_1 | cin::SYSEX_END_2 | cin::SYSEX_END_3)
    }

    /// Size of the MIDI message carried.
    pub const fn message_size(&self) -> usize {
        message_size(self.0[1], self.cin())
    }

    /// Bytes of the MIDI message carried.
    pub fn message(&self) -> &[u8] {
        &self.0[1..1 + self.message_size()]
    }

    /// SysEx data bytes carried, empty when this is not a SysEx packet.
    pub fn sysex_data(&self) -> &[u8] {
        if self.is_sysex() {
            self.message()
        } else {
            &[]
        }
    }
}

pub(crate) fn check_cable(cable: u8) -> Result<()> {
    if cable > MAX_CABLE {
        return Err(Error::new(ErrorKind::InvalidInput, format!("cable number {cable} out of range")));
    }
    Ok(())
}

/// Iterates over the non-empty event packets in a transfer.
///
/// Trailing bytes that do not form a complete packet are ignored.
pub fn packets(buf: &[u8]) -> impl Iterator<Item = EventPacket> + '_ {
    buf.chunks_exact(PACKET_SIZE)
        .map(|chunk| EventPacket([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .filter(|packet| !packet.is_empty())
}

/// Splits SysEx data into event packets.
#[derive(Debug, Clone)]
pub struct SysExPackets<'a> {
    data: &'a [u8],
    cable: u8,
}

impl<'a> SysExPackets<'a> {
    /// Splits `data`, which should contain the complete message from `0xf0` to `0xf7`.
    pub fn new(data: &'a [u8], cable: u8) -> Result<Self> {
        check_cable(cable)?;
        Ok(Self { data, cable })
    }
}

impl Iterator for SysExPackets<'_> {
    type Item = EventPacket;

    fn next(&mut self) -> Option<EventPacket> {
        let (cin, n) = match self.data.len() {
            0 => return None,
            1 => (cin::SYSEX_END_1, 1),
            2 => (cin::SYSEX_END_2, 2),
            3 => (cin::SYSEX_END_3, 3),
            _ => (cin::SYSEX_CONTINUE, 3),
        };

        let (chunk, rest) = self.data.split_at(n);
        self.data = rest;

        let mut data = [0; 3];
        data[..n].copy_from_slice(chunk);
        Some(EventPacket::new(self.cable, cin, data))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let n = self.data.len().div_ceil(3);
        (n, Some(n))
    }
}

impl ExactSizeIterator for SysExPackets<'_> {}

/// Encodes a MIDI message, which may be SysEx, into `out`.
///
/// Only the leading message of `msg` is encoded.
pub fn encode_into(msg: &[u8], cable: u8, out: &mut BytesMut) -> Result<()> {
    if msg.first() == Some(&SYSEX_START) {
        let len = sysex_len(msg)
            .ok_or_else(|| Error::new(ErrorKind::InvalidInput, "unterminated or oversized SysEx message"))?;
        out.reserve(sysex_transfer_len(len));
        for packet in SysExPackets::new(&msg[..len], cable)? {
            out.extend_from_slice(&packet.0);
        }
    } else {
        out.extend_from_slice(&EventPacket::encode(msg, cable)?.0);
    }
    Ok(())
}

/// Reassembles SysEx messages from event packets.
#[derive(Debug, Clone)]
pub struct SysExAssembler {
    buffer: BytesMut,
    max_size: usize,
    overflow: bool,
}

impl Default for SysExAssembler {
    fn default() -> Self {
        Self::new()
    }
}

impl SysExAssembler {
    /// Creates a new assembler accepting messages up to [`MIDI_MAX_SYSEX_SIZE`].
    pub fn new() -> Self {
        Self { buffer: BytesMut::new(), max_size: MIDI_MAX_SYSEX_SIZE, overflow: false }
    }

    /// Sets the maximum message size.
    pub fn set_max_size(&mut self, max_size: usize) {
        self.max_size = max_size;
    }

    /// Whether a message is partially assembled.
    pub fn is_pending(&self) -> bool {
        !self.buffer.is_empty() || self.overflow
    }

    /// Discards any partially assembled message.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.overflow = false;
    }

    /// Pushes a packet.
    ///
    /// Returns the complete message once its last packet has been pushed.
    /// Packets that are not SysEx are ignored and return `None`, as are SysEx packets
    /// continuing a message whose start was never seen.
    pub fn push(&mut self, packet: &EventPacket) -> Option<Result<Bytes>> {
        if !packet.is_sysex() {
            return None;
        }

        let data = packet.sysex_data();
        let starts = data.first() == Some(&SYSEX_START);
        if starts && self.is_pending() {
            tracing::warn!("SysEx message interrupted by new message after {} bytes", self.buffer.len());
            self.reset();
        } else if !starts && !self.is_pending() {
            tracing::warn!("dropping {packet:?} of SysEx message without start");
            return None;
        }

        if !self.overflow {
            if self.buffer.len() + data.len() > self.max_size {
                self.buffer.clear();
                self.overflow = true;
            } else {
                self.buffer.extend_from_slice(data);
            }
        }

        if !packet.is_sysex_end() {
            return None;
        }

        if self.overflow {
            self.overflow = false;
            return Some(Err(Error::new(ErrorKind::OutOfMemory, "maximum SysEx size exceeded")));
        }

        Some(Ok(self.buffer.split().freeze()))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn message_sizes() {
        assert_eq!(message_size(0x93, 0), 3);
        assert_eq!(message_size(0xb0, 0), 3);
        assert_eq!(message_size(0xc5, 0), 2);
        assert_eq!(message_size(0xd0, 0), 2);
        assert_eq!(message_size(0xf1, 0), 2);
        assert_eq!(message_size(0xf2, 0), 3);
        assert_eq!(message_size(0xf8, 0), 1);
        assert_eq!(message_size(0xfe, 0), 1);
        assert_eq!(message_size(0xf6, 0), 0);
        assert_eq!(message_size(0xfd, 0), 0);
        assert_eq!(message_size(0x40, 0), 0);

        // CIN overrides the status byte
        assert_eq!(message_size(0x01, 0x14), 3);
        assert_eq!(message_size(0x01, 0x17), 3);
        assert_eq!(message_size(0x01, 0x06), 2);
        assert_eq!(message_size(0xf7, 0x05), 1);
        assert_eq!(message_size(0xf6, 0x0f), 1);
    }

    #[test]
    fn encodes_channel_messages() {
        let note_on = EventPacket::encode(&[0x91, 60, 100], 0).unwrap();
        assert_eq!(note_on.0, [0x09, 0x91, 60, 100]);
        assert_eq!(note_on.message(), &[0x91, 60, 100]);

        let program = EventPacket::encode(&[0xc2, 5, 99], 3).unwrap();
        assert_eq!(program.0, [0x3c, 0xc2, 5, 0]);
        assert_eq!(program.cable(), 3);
        assert_eq!(program.message(), &[0xc2, 5]);
    }

    #[test]
    fn encodes_system_messages() {
        assert_eq!(EventPacket::encode(&[0xf2, 0x10, 0x20], 0).unwrap().0, [0x03, 0xf2, 0x10, 0x20]);
        assert_eq!(EventPacket::encode(&[0xf1, 0x31], 1).unwrap().0, [0x12, 0xf1, 0x31, 0]);
        assert_eq!(EventPacket::encode(&[0xf3, 0x02], 0).unwrap().0, [0x02, 0xf3, 0x02, 0]);
        assert_eq!(EventPacket::encode(&[0xf8], 0).unwrap().0, [0x0f, 0xf8, 0, 0]);
        assert_eq!(EventPacket::encode(&[0xf6, 0x55], 0).unwrap().0, [0x0f, 0xf6, 0, 0]);
    }

    #[test]
    fn rejects_invalid_messages() {
        let kind = |msg: &[u8], cable| EventPacket::encode(msg, cable).unwrap_err().kind();
        assert_eq!(kind(&[], 0), ErrorKind::InvalidInput);
        assert_eq!(kind(&[0x40, 0x40], 0), ErrorKind::InvalidInput);
        assert_eq!(kind(&[0x90, 60], 0), ErrorKind::InvalidInput);
        assert_eq!(kind(&[0xf0, 1, 0xf7], 0), ErrorKind::InvalidInput);
        assert_eq!(kind(&[0x90, 60, 1], 16), ErrorKind::InvalidInput);
    }

    #[test]
    fn counts_sysex() {
        assert_eq!(sysex_len(&[0xf0, 0x7e, 0x7f, 0x06, 0x01, 0xf7, 0x90]), Some(6));
        assert_eq!(sysex_len(&[0xf0, 0xf7]), Some(2));
        assert_eq!(sysex_len(&[0xf0, 1, 2]), None);
        assert_eq!(sysex_len(&[0x90, 0xf7]), None);

        let mut long = vec![0x11; MIDI_MAX_SYSEX_SIZE + 10];
        long[0] = 0xf0;
        long[MIDI_MAX_SYSEX_SIZE - 1] = 0xf7;
        assert_eq!(sysex_len(&long), Some(MIDI_MAX_SYSEX_SIZE));
        long[MIDI_MAX_SYSEX_SIZE - 1] = 0x11;
        long[MIDI_MAX_SYSEX_SIZE] = 0xf7;
        assert_eq!(sysex_len(&long), None);
    }

    #[test]
    fn splits_sysex() {
        let identity = [0xf0, 0x7e, 0x7f, 0x06, 0x01, 0xf7];
        let packets: Vec<_> = SysExPackets::new(&identity, 1).unwrap().collect();
        assert_eq!(packets, [EventPacket([0x14, 0xf0, 0x7e, 0x7f]), EventPacket([0x17, 0x06, 0x01, 0xf7])]);

        let packets: Vec<_> = SysExPackets::new(&[0xf0, 0x01, 0x02, 0x03, 0xf7], 0).unwrap().collect();
        assert_eq!(packets, [EventPacket([0x04, 0xf0, 0x01, 0x02]), EventPacket([0x06, 0x03, 0xf7, 0])]);

        let packets: Vec<_> = SysExPackets::new(&[0xf0, 0x01, 0x02, 0xf7], 0).unwrap().collect();
        assert_eq!(packets, [EventPacket([0x04, 0xf0, 0x01, 0x02]), EventPacket([0x05, 0xf7, 0, 0])]);

        assert_eq!(SysExPackets::new(&[0; 10], 0).unwrap().len(), 4);
        assert_eq!(sysex_transfer_len(10), 16);
        assert_eq!(sysex_transfer_len(6), 8);
    }

    #[test]
    fn extracts_sysex_data() {
        assert_eq!(EventPacket([0x04, 0xf0, 0x41, 0x10]).sysex_data(), &[0xf0, 0x41, 0x10]);
        assert_eq!(EventPacket([0x06, 0x10, 0xf7, 0]).sysex_data(), &[0x10, 0xf7]);
        assert_eq!(EventPacket([0x05, 0xf7, 0, 0]).sysex_data(), &[0xf7]);
        assert!(EventPacket([0x09, 0x90, 0x40, 0x40]).sysex_data().is_empty());

        // tune request travels as CIN 5 too
        let tune = EventPacket([0x05, 0xf6, 0, 0]);
        assert!(!tune.is_sysex());
        assert!(tune.sysex_data().is_empty());
        assert_eq!(tune.message(), &[0xf6]);
    }

    #[test]
    fn skips_padding() {
        let buf = [0x09, 0x90, 60, 1, 0, 0, 0, 0, 0x08, 0x80, 60, 0, 0x0f];
        let found: Vec<_> = packets(&buf).collect();
        assert_eq!(found, [EventPacket([0x09, 0x90, 60, 1]), EventPacket([0x08, 0x80, 60, 0])]);
    }

    #[test]
    fn encodes_into_buffer() {
        let mut out = BytesMut::new();
        encode_into(&[0xb0, 7, 100], 2, &mut out).unwrap();
        encode_into(&[0xf0, 1, 2, 3, 4, 0xf7, 0x90], 2, &mut out).unwrap();
        assert_eq!(&out[..], &[0x2b, 0xb0, 7, 100, 0x24, 0xf0, 1, 2, 0x27, 3, 4, 0xf7][..]);

        let err = encode_into(&[0xf0, 1, 2], 0, &mut out).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
    }

    #[test]
    fn reassembles_sysex() {
        let msg: Vec<u8> = [0xf0].into_iter().chain(0..20).chain([0xf7]).collect();
        let mut asm = SysExAssembler::new();

        let mut complete = None;
        for packet in SysExPackets::new(&msg, 0).unwrap() {
            // real-time messages may interleave
            assert!(asm.push(&EventPacket([0x0f, 0xf8, 0, 0])).is_none());
            if let Some(res) = asm.push(&packet) {
                complete = Some(res.unwrap());
            }
        }
        assert_eq!(complete.as_deref(), Some(&msg[..]));
        assert!(!asm.is_pending());
    }

    #[test]
    fn sysex_overflow_is_reported() {
        let mut msg = vec![0x22; 40];
        msg[0] = 0xf0;
        msg[39] = 0xf7;

        let mut asm = SysExAssembler::new();
        asm.set_max_size(16);
        let results: Vec<_> = SysExPackets::new(&msg, 0).unwrap().filter_map(|p| asm.push(&p)).collect();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].as_ref().unwrap_err().kind(), ErrorKind::OutOfMemory);

        // next message assembles normally
        let short = [0xf0, 0x01, 0xf7];
        let res = SysExPackets::new(&short, 0).unwrap().filter_map(|p| asm.push(&p)).next().unwrap();
        assert_eq!(&res.unwrap()[..], &short);
    }

    #[test]
    fn new_sysex_start_discards_partial_message() {
        let mut asm = SysExAssembler::new();
        assert!(asm.push(&EventPacket([0x04, 0xf0, 0x01, 0x02])).is_none());
        assert!(asm.push(&EventPacket([0x04, 0xf0, 0x05, 0x06])).is_none());
        let res = asm.push(&EventPacket([0x06, 0x07, 0xf7, 0])).unwrap().unwrap();
        assert_eq!(&res[..], &[0xf0, 0x05, 0x06, 0x07, 0xf7]);
    }

    #[test]
    fn sysex_without_start_is_dropped() {
        let mut asm = SysExAssembler::new();

        // joined in the middle of a message
        assert!(asm.push(&EventPacket([0x04, 0x11, 0x12, 0x13])).is_none());
        assert!(asm.push(&EventPacket([0x06, 0x10, 0xf7, 0])).is_none());
        assert!(!asm.is_pending());

        // lone end packet carrying a data byte
        assert!(asm.push(&EventPacket([0x05, 0x10, 0, 0])).is_none());
        assert!(!asm.is_pending());

        // complete single-packet messages still pass
        let res = asm.push(&EventPacket([0x06, 0xf0, 0xf7, 0])).unwrap().unwrap();
        assert_eq!(&res[..], &[0xf0, 0xf7]);
        let res = asm.push(&EventPacket([0x07, 0xf0, 0x7d, 0xf7])).unwrap().unwrap();
        assert_eq!(&res[..], &[0xf0, 0x7d, 0xf7]);
    }

    #[test]
    #[should_panic(expected = "cable number out of range")]
    fn new_rejects_invalid_cable() {
        let _ = EventPacket::new(MAX_CABLE + 1, cin::SINGLE_BYTE, [0xf8, 0, 0]);
    }
}
