//! Host-side USB-MIDI driver
//!
//! Use [`find_devices`] or [`rusb`] directly to find a device and open it with
//! [`UsbMidiDevice::open`].
//!
//! The opened device can be driven synchronously through [`MidiPort`](crate::MidiPort) and
//! [`UsbHostMidiTransport`](crate::UsbHostMidiTransport), or handed to [`connect`] to obtain
//! an asynchronous sender and receiver pair serviced by background I/O threads.
//!
//! Some errors from this module have an inner error type of [`rusb::Error`].
//!

use bytes::{Bytes, BytesMut};
use futures::{sink, stream, Sink, SinkExt, Stream, StreamExt};
use std::{
    collections::VecDeque,
    fmt,
    future::Future,
    io::{Error, ErrorKind, Result},
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};
use tokio::sync::mpsc;

use crate::packet::{self, packets, EventPacket, SysExAssembler, MAX_CABLE};

mod guard;
mod native;

pub(crate) use guard::InUseGuard;
pub use native::*;

/// MIDI message received on a virtual cable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MidiEvent {
    /// Virtual cable number.
    pub cable: u8,
    /// Complete MIDI message, SysEx included from `0xf0` to `0xf7`.
    pub data: Bytes,
}

/// Sends MIDI messages to a USB-MIDI device.
pub struct MidiSender {
    tx: mpsc::Sender<Bytes>,
    shared: Arc<MidiShared>,
}

impl fmt::Debug for MidiSender {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_tuple("MidiSender").field(&self.shared.name).finish()
    }
}

impl MidiSender {
    /// Send a MIDI message on the specified virtual cable.
    ///
    /// SysEx messages must be complete and are split into event packets.
    ///
    /// ## Cancel safety
    /// If canceled, no data will have been sent.
    pub async fn send(&self, cable: u8, msg: &[u8]) -> Result<()> {
        let mut data = BytesMut::new();
        packet::encode_into(msg, cable, &mut data)?;
        self.send_packets(data.freeze()).await
    }

    /// Send already encoded event packets as one transfer.
    ///
    /// ## Cancel safety
    /// If canceled, no data will have been sent.
    pub async fn send_packets(&self, data: Bytes) -> Result<()> {
        match self.tx.send(data).await {
            Ok(()) => Ok(()),
            Err(_) => Err(self.shared.error()),
        }
    }

    /// Wait until connection is closed.
    pub fn closed(&self) -> impl Future<Output = ()> {
        let tx = self.tx.clone();
        async move { tx.closed().await }
    }

    /// Turns this into a sink for MIDI events.
    pub fn into_sink(self) -> MidiSink {
        let sink = sink::unfold(self, |this, event: MidiEvent| async move {
            this.send(event.cable, &event.data).await?;
            Ok(this)
        });

        MidiSink(Box::pin(sink))
    }
}

/// MIDI event sink into a USB-MIDI device.
pub struct MidiSink(Pin<Box<dyn Sink<MidiEvent, Error = Error> + Send + Sync + 'static>>);

impl fmt::Debug for MidiSink {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_tuple("MidiSink").finish()
    }
}

impl Sink<MidiEvent> for MidiSink {
    type Error = Error;

    fn poll_ready(self: Pin<&mut Self>, cx: &mut Context) -> Poll<Result<()>> {
        Pin::into_inner(self).0.poll_ready_unpin(cx)
    }

    fn start_send(self: Pin<&mut Self>, item: MidiEvent) -> Result<()> {
        Pin::into_inner(self).0.start_send_unpin(item)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context) -> Poll<Result<()>> {
        Pin::into_inner(self).0.poll_flush_unpin(cx)
    }

    fn poll_close(self: Pin<&mut Self>, cx: &mut Context) -> Poll<Result<()>> {
        Pin::into_inner(self).0.poll_close_unpin(cx)
    }
}

/// Receives MIDI messages from a USB-MIDI device.
pub struct MidiReceiver {
    rx: mpsc::Receiver<BytesMut>,
    shared: Arc<MidiShared>,
    pending: VecDeque<MidiEvent>,
    sysex: [SysExAssembler; MAX_CABLE as usize + 1],
}

impl fmt::Debug for MidiReceiver {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_tuple("MidiReceiver").field(&self.shared.name).finish()
    }
}

impl MidiReceiver {
    fn new(rx: mpsc::Receiver<BytesMut>, shared: Arc<MidiShared>) -> Self {
        Self { rx, shared, pending: VecDeque::new(), sysex: Default::default() }
    }

    /// Receive a MIDI message.
    ///
    /// SysEx messages are returned once completely received.
    ///
    /// ## Cancel safety
    /// If canceled, no data will have been removed from the receive queue.
    pub async fn recv(&mut self) -> Result<MidiEvent> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Ok(event);
            }

            let Some(transfer) = self.rx.recv().await else {
                return Err(self.shared.error());
            };

            for packet in packets(&transfer) {
                self.decode(packet);
            }
        }
    }

    fn decode(&mut self, packet: EventPacket) {
        let cable = packet.cable();

        if packet.is_sysex() {
            match self.sysex[usize::from(cable)].push(&packet) {
                Some(Ok(data)) => self.pending.push_back(MidiEvent { cable, data }),
                Some(Err(err)) => tracing::warn!("dropping SysEx message on cable {cable}: {err}"),
                None => (),
            }
        } else if packet.message_size() > 0 {
            self.pending.push_back(MidiEvent { cable, data: Bytes::copy_from_slice(packet.message()) });
        } else {
            tracing::trace!("ignoring {packet:?}");
        }
    }

    /// Sets the maximum SysEx message size.
    pub fn set_max_sysex_size(&mut self, max_size: usize) {
        for asm in &mut self.sysex {
            asm.set_max_size(max_size);
        }
    }

    /// Turns this into a stream of MIDI events.
    pub fn into_stream(self) -> MidiStream {
        let stream = stream::try_unfold(self, |mut this| async move {
            match this.recv().await {
                Ok(event) => Ok(Some((event, this))),
                Err(err) if err.kind() == ErrorKind::BrokenPipe => Ok(None),
                Err(err) => Err(err),
            }
        });

        MidiStream(Box::pin(stream))
    }
}

/// MIDI event stream from a USB-MIDI device.
pub struct MidiStream(Pin<Box<dyn Stream<Item = Result<MidiEvent>> + Send + Sync + 'static>>);

impl fmt::Debug for MidiStream {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_tuple("MidiStream").finish()
    }
}

impl Stream for MidiStream {
    type Item = Result<MidiEvent>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context) -> Poll<Option<Self::Item>> {
        Pin::into_inner(self).0.poll_next_unpin(cx)
    }
}
