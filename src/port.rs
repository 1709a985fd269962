//! Event packet I/O over a USB pipe.

use std::io::{Error, ErrorKind, Result};

use crate::{
    packet::{sysex_len, EventPacket, SysExPackets, PACKET_SIZE},
    MIDI_EVENT_PACKET_SIZE,
};

/// Bulk endpoint pair of a USB-MIDI device.
///
/// This is the boundary to the USB host stack. See [`UsbMidiDevice`](crate::host::UsbMidiDevice)
/// for the implementation backed by libusb.
pub trait MidiPipe {
    /// Reads one transfer from the IN endpoint.
    ///
    /// Returns `0` if the device had no data within the transfer timeout.
    fn read_packets(&mut self, buf: &mut [u8]) -> Result<usize>;

    /// Writes one transfer to the OUT endpoint and returns the number of bytes written.
    fn write_packets(&mut self, data: &[u8]) -> Result<usize>;

    /// Maximum packet size of the OUT endpoint.
    fn max_packet_size(&self) -> usize;
}

impl<P: MidiPipe + ?Sized> MidiPipe for &mut P {
    fn read_packets(&mut self, buf: &mut [u8]) -> Result<usize> {
        (**self).read_packets(buf)
    }

    fn write_packets(&mut self, data: &[u8]) -> Result<usize> {
        (**self).write_packets(data)
    }

    fn max_packet_size(&self) -> usize {
        (**self).max_packet_size()
    }
}

impl<P: MidiPipe + ?Sized> MidiPipe for Box<P> {
    fn read_packets(&mut self, buf: &mut [u8]) -> Result<usize> {
        (**self).read_packets(buf)
    }

    fn write_packets(&mut self, data: &[u8]) -> Result<usize> {
        (**self).write_packets(data)
    }

    fn max_packet_size(&self) -> usize {
        (**self).max_packet_size()
    }
}

/// Largest transfer of whole event packets for an OUT endpoint, at most [`MIDI_EVENT_PACKET_SIZE`].
pub fn transfer_size(max_packet_size: usize) -> usize {
    (max_packet_size.min(MIDI_EVENT_PACKET_SIZE) / PACKET_SIZE * PACKET_SIZE).max(PACKET_SIZE)
}

/// Sends and receives MIDI messages as USB-MIDI event packets.
///
/// Received transfers are buffered and handed out one event packet at a time.
#[derive(Debug)]
pub struct MidiPort<P> {
    pipe: P,
    recv_buf: [u8; MIDI_EVENT_PACKET_SIZE],
    recv_len: usize,
    read_ptr: usize,
}

impl<P: MidiPipe> MidiPort<P> {
    /// Creates a new port on the specified pipe.
    pub fn new(pipe: P) -> Self {
        Self { pipe, recv_buf: [0; MIDI_EVENT_PACKET_SIZE], recv_len: 0, read_ptr: 0 }
    }

    /// The underlying pipe.
    pub fn get_ref(&self) -> &P {
        &self.pipe
    }

    /// The underlying pipe.
    pub fn get_mut(&mut self) -> &mut P {
        &mut self.pipe
    }

    /// Returns the underlying pipe, discarding buffered packets.
    pub fn into_inner(self) -> P {
        self.pipe
    }

    /// Whether received packets remain to be read.
    ///
    /// An all-zero packet marks the end of the data in a transfer.
    pub fn has_buffered(&self) -> bool {
        self.read_ptr + PACKET_SIZE <= self.recv_len
            && self.recv_buf[self.read_ptr..self.read_ptr + PACKET_SIZE] != [0; PACKET_SIZE]
    }

    /// Discards buffered packets.
    pub fn clear(&mut self) {
        self.recv_len = 0;
        self.read_ptr = 0;
    }

    /// Reads one raw transfer from the device, bypassing the packet buffer.
    pub fn recv_data(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.pipe.read_packets(buf)
    }

    /// Receives the next event packet.
    ///
    /// A new transfer is read once all buffered packets have been consumed.
    /// Returns `None` if the device sent no data.
    pub fn recv_packet(&mut self) -> Result<Option<EventPacket>> {
        if !self.has_buffered() {
            self.clear();
            let n = self.pipe.read_packets(&mut self.recv_buf)?;
            self.recv_len = n.min(MIDI_EVENT_PACKET_SIZE);

            #[cfg(feature = "trace-packets")]
            tracing::trace!("received transfer of {n} bytes");

            if !self.has_buffered() {
                return Ok(None);
            }
        }

        let mut packet = [0; PACKET_SIZE];
        packet.copy_from_slice(&self.recv_buf[self.read_ptr..self.read_ptr + PACKET_SIZE]);
        self.read_ptr += PACKET_SIZE;

        Ok(Some(EventPacket(packet)))
    }

    /// Receives the MIDI bytes of the next event packet into `out`.
    ///
    /// Returns the size of the message carried, `0` if nothing was received
    /// or the message is undefined.
    pub fn recv_message(&mut self, out: &mut [u8; 3]) -> Result<usize> {
        match self.recv_packet()? {
            Some(packet) => {
                out.copy_from_slice(&packet.0[1..]);
                Ok(packet.message_size())
            }
            None => Ok(0),
        }
    }

    /// Receives the next event packet including its header byte into `out`.
    ///
    /// Returns the size of the message carried, `0` if nothing was received
    /// or the message is undefined.
    pub fn recv_raw(&mut self, out: &mut [u8; PACKET_SIZE]) -> Result<usize> {
        match self.recv_packet()? {
            Some(packet) => {
                *out = packet.0;
                Ok(packet.message_size())
            }
            None => Ok(0),
        }
    }

    /// Sends a single MIDI message on the specified virtual cable.
    ///
    /// A message starting with `0xf0` is sent as SysEx up to and including its `0xf7`.
    pub fn send_data(&mut self, msg: &[u8], cable: u8) -> Result<()> {
        if msg.first() == Some(&0xf0) {
            let len = sysex_len(msg)
                .ok_or_else(|| Error::new(ErrorKind::InvalidInput, "unterminated or oversized SysEx message"))?;
            return self.send_sysex(&msg[..len], cable);
        }

        let packet = EventPacket::encode(msg, cable)?;
        self.write_all(&packet.0)
    }

    /// Sends SysEx data on the specified virtual cable.
    ///
    /// Packets are grouped into transfers no larger than the OUT endpoint's maximum packet size.
    pub fn send_sysex(&mut self, data: &[u8], cable: u8) -> Result<()> {
        let chunk = transfer_size(self.pipe.max_packet_size());
        tracing::debug!("sending SysEx of {} bytes in transfers of {chunk} bytes", data.len());

        let mut buf = [0; MIDI_EVENT_PACKET_SIZE];
        let mut wptr = 0;
        for packet in SysExPackets::new(data, cable)? {
            buf[wptr..wptr + PACKET_SIZE].copy_from_slice(&packet.0);
            wptr += PACKET_SIZE;

            if wptr >= chunk {
                self.write_all(&buf[..wptr])?;
                wptr = 0;
            }
        }
        if wptr > 0 {
            self.write_all(&buf[..wptr])?;
        }

        Ok(())
    }

    /// Writes a raw transfer to the device.
    pub fn send_raw_data(&mut self, data: &[u8]) -> Result<usize> {
        self.pipe.write_packets(data)
    }

    fn write_all(&mut self, mut data: &[u8]) -> Result<()> {
        while !data.is_empty() {
            match self.pipe.write_packets(data)? {
                0 => return Err(Error::new(ErrorKind::WriteZero, "device accepted no data")),
                n => {
                    #[cfg(feature = "trace-packets")]
                    tracing::trace!("sent transfer of {n} bytes");
                    data = &data[n.min(data.len())..];
                }
            }
        }
        Ok(())
    }
}
