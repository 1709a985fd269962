//! libusb host backend

use bytes::{Bytes, BytesMut};
use rusb::{request_type, Device, DeviceHandle, Direction, Recipient, RequestType, UsbContext};
use std::{
    fmt,
    io::{Error, ErrorKind, Result},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};
use tokio::{
    sync::{mpsc, oneshot, oneshot::error::TryRecvError},
    task::spawn_blocking,
};

use super::{InUseGuard, MidiReceiver, MidiSender};
use crate::{
    descriptor::{
        select_configuration, total_length, transfer_type_mask, ConfigInfo, EndpointInfo, InterfaceEndpoints,
        TransferType, CONFIG_DESC_LEN, DESC_TYPE_CONFIGURATION,
    },
    port::{transfer_size, MidiPipe},
    Class, MIDI_EVENT_PACKET_SIZE,
};

const GET_DESCRIPTOR_REQUEST: u8 = request_type(Direction::In, RequestType::Standard, Recipient::Device);
const REQ_GET_DESCRIPTOR: u8 = 0x06;

const TIMEOUT: Duration = Duration::from_secs(1);
const FLUSH_TIMEOUT: Duration = Duration::from_millis(10);
const FLUSH_LIMIT: Duration = Duration::from_millis(100);

pub(crate) fn to_io_err(error: rusb::Error) -> Error {
    let kind = match error {
        rusb::Error::Io => ErrorKind::ConnectionAborted,
        rusb::Error::InvalidParam => ErrorKind::InvalidInput,
        rusb::Error::Access => ErrorKind::PermissionDenied,
        rusb::Error::NoDevice => ErrorKind::NotFound,
        rusb::Error::NotFound => ErrorKind::NotFound,
        rusb::Error::Busy => ErrorKind::ResourceBusy,
        rusb::Error::Timeout => ErrorKind::TimedOut,
        rusb::Error::Overflow => ErrorKind::OutOfMemory,
        rusb::Error::Pipe => ErrorKind::BrokenPipe,
        rusb::Error::Interrupted => ErrorKind::Interrupted,
        rusb::Error::NoMem => ErrorKind::OutOfMemory,
        rusb::Error::NotSupported => ErrorKind::Unsupported,
        rusb::Error::BadDescriptor => ErrorKind::InvalidData,
        rusb::Error::Other => ErrorKind::Other,
    };

    Error::new(kind, error)
}

/// Finds the interface by interface class in the active configuration.
///
/// The protocol code is ignored.
/// Returns the interface number.
pub fn find_interface<C: UsbContext>(dev: &Device<C>, class: Class) -> Result<u8> {
    let cfg = dev.active_config_descriptor().map_err(to_io_err)?;
    for iface in cfg.interfaces() {
        for desc in iface.descriptors() {
            if class.matches(desc.class_code(), desc.sub_class_code()) {
                return Ok(desc.interface_number());
            }
        }
    }

    Err(Error::new(ErrorKind::NotFound, rusb::Error::NotFound))
}

/// Whether the device has a MIDI streaming interface in its active configuration.
pub fn is_midi_device<C: UsbContext>(dev: &Device<C>) -> bool {
    find_interface(dev, Class::MIDI_STREAMING).is_ok()
}

/// Lists all attached devices that have a MIDI streaming interface.
pub fn find_devices<C: UsbContext>(ctx: &C) -> Result<Vec<Device<C>>> {
    let devs = ctx.devices().map_err(to_io_err)?;
    Ok(devs.iter().filter(|dev| is_midi_device(dev)).collect())
}

/// Reads the complete configuration descriptor with the specified index.
pub fn read_config_descriptor<C: UsbContext>(hnd: &DeviceHandle<C>, index: u8) -> Result<Vec<u8>> {
    let value = (u16::from(DESC_TYPE_CONFIGURATION) << 8) | u16::from(index);

    let mut header = [0; CONFIG_DESC_LEN];
    let n = hnd
        .read_control(GET_DESCRIPTOR_REQUEST, REQ_GET_DESCRIPTOR, value, 0, &mut header, TIMEOUT)
        .map_err(to_io_err)?;
    let total = total_length(&header[..n])?;

    let mut buf = vec![0; total.max(CONFIG_DESC_LEN)];
    let n =
        hnd.read_control(GET_DESCRIPTOR_REQUEST, REQ_GET_DESCRIPTOR, value, 0, &mut buf, TIMEOUT).map_err(to_io_err)?;
    buf.truncate(n);

    Ok(buf)
}

/// An opened USB-MIDI device with its MIDI interface claimed.
pub struct UsbMidiDevice<C: UsbContext> {
    hnd: DeviceHandle<C>,
    vid: u16,
    pid: u16,
    config: ConfigInfo,
    iface: InterfaceEndpoints,
    timeout: Duration,
    running: AtomicBool,
    _guard: InUseGuard,
}

impl<C: UsbContext> fmt::Debug for UsbMidiDevice<C> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("UsbMidiDevice")
            .field("vid", &format_args!("{:04x}", self.vid))
            .field("pid", &format_args!("{:04x}", self.pid))
            .field("interface", &self.iface)
            .field("running", &self.is_running())
            .finish()
    }
}

impl<C: UsbContext> UsbMidiDevice<C> {
    /// Opens the device and claims its MIDI interface.
    ///
    /// Configurations are examined in order; the first one with a MIDI streaming interface
    /// or, failing that, a bulk interface is activated. Configurations whose descriptors
    /// cannot be read are skipped.
    ///
    /// A device interface can only be opened once at a time.
    pub fn open(dev: &Device<C>) -> Result<Self> {
        let desc = dev.device_descriptor().map_err(to_io_err)?;
        let (vid, pid) = (desc.vendor_id(), desc.product_id());
        tracing::debug!("opening USB device {vid:04x}:{pid:04x}");

        let hnd = dev.open().map_err(to_io_err)?;
        match hnd.set_auto_detach_kernel_driver(true) {
            Ok(()) | Err(rusb::Error::NotSupported) => (),
            Err(err) => return Err(to_io_err(err)),
        }

        let configs = (0..desc.num_configurations()).map(|index| read_config_descriptor(&hnd, index));
        let Some((config, iface)) = select_configuration(configs, transfer_type_mask(vid, pid)) else {
            return Err(Error::new(ErrorKind::NotFound, "no MIDI streaming or bulk interface found"));
        };
        if !config.is_midi() {
            tracing::warn!("no MIDI streaming interface, trying bulk interface {}", iface.interface);
        }

        let guard = InUseGuard::new(dev.bus_number(), dev.address(), iface.interface)?;

        if hnd.active_configuration().ok() != Some(config.config_value) {
            tracing::debug!("activating configuration {}", config.config_value);
            hnd.set_active_configuration(config.config_value).map_err(to_io_err)?;
        }
        hnd.claim_interface(iface.interface).map_err(to_io_err)?;
        if iface.alternate != 0 {
            hnd.set_alternate_setting(iface.interface, iface.alternate).map_err(to_io_err)?;
        }
        for ep in [iface.ep_in, iface.ep_out].into_iter().flatten() {
            hnd.clear_halt(ep.address).map_err(to_io_err)?;
        }
        tracing::debug!("using interface {} with IN {:?} and OUT {:?}", iface.interface, iface.ep_in, iface.ep_out);

        Ok(Self { hnd, vid, pid, config, iface, timeout: TIMEOUT, running: AtomicBool::new(true), _guard: guard })
    }

    /// Vendor id.
    pub fn id_vendor(&self) -> u16 {
        self.vid
    }

    /// Product id.
    pub fn id_product(&self) -> u16 {
        self.pid
    }

    /// Whether the device is open and its interface claimed.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Parsed configuration in use.
    pub fn config(&self) -> &ConfigInfo {
        &self.config
    }

    /// Claimed interface number.
    pub fn interface(&self) -> u8 {
        self.iface.interface
    }

    /// IN endpoint.
    pub fn ep_in(&self) -> Option<EndpointInfo> {
        self.iface.ep_in
    }

    /// OUT endpoint.
    pub fn ep_out(&self) -> Option<EndpointInfo> {
        self.iface.ep_out
    }

    /// Device handle.
    pub fn handle(&self) -> &DeviceHandle<C> {
        &self.hnd
    }

    /// Sets the transfer timeout.
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    /// Stops transfers and releases the claimed interface.
    pub fn release(&mut self) -> Result<()> {
        if self.running.swap(false, Ordering::AcqRel) {
            tracing::debug!("releasing interface {}", self.iface.interface);
            self.hnd.release_interface(self.iface.interface).map_err(to_io_err)?;
        }
        Ok(())
    }

    fn name(&self) -> String {
        let dev = self.hnd.device();
        format!("{}-{}:{}", dev.bus_number(), dev.address(), self.iface.interface)
    }

    fn read_transfer(&self, buf: &mut [u8], timeout: Duration) -> rusb::Result<usize> {
        if !self.is_running() {
            return Err(rusb::Error::NoDevice);
        }
        let Some(ep) = self.iface.ep_in else { return Err(rusb::Error::NotFound) };

        match ep.transfer_type {
            TransferType::Interrupt => self.hnd.read_interrupt(ep.address, buf, timeout),
            _ => self.hnd.read_bulk(ep.address, buf, timeout),
        }
    }

    fn write_transfer(&self, data: &[u8], timeout: Duration) -> rusb::Result<usize> {
        if !self.is_running() {
            return Err(rusb::Error::NoDevice);
        }
        let Some(ep) = self.iface.ep_out else { return Err(rusb::Error::NotFound) };

        match ep.transfer_type {
            TransferType::Interrupt => self.hnd.write_interrupt(ep.address, data, timeout),
            _ => self.hnd.write_bulk(ep.address, data, timeout),
        }
    }

    fn in_transfer_size(&self) -> usize {
        self.iface.ep_in.map(|ep| usize::from(ep.max_packet_size)).unwrap_or(0).max(MIDI_EVENT_PACKET_SIZE)
    }
}

impl<C: UsbContext> MidiPipe for UsbMidiDevice<C> {
    fn read_packets(&mut self, buf: &mut [u8]) -> Result<usize> {
        match self.read_transfer(buf, self.timeout) {
            Ok(n) => Ok(n),
            Err(rusb::Error::Timeout) => Ok(0),
            Err(rusb::Error::NoDevice) if !self.is_running() => {
                Err(Error::new(ErrorKind::NotConnected, "USB-MIDI device has been released"))
            }
            Err(rusb::Error::NotFound) if self.iface.ep_in.is_none() => {
                Err(Error::new(ErrorKind::NotFound, "USB-MIDI device has no IN endpoint"))
            }
            Err(err) => Err(to_io_err(err)),
        }
    }

    fn write_packets(&mut self, data: &[u8]) -> Result<usize> {
        match self.write_transfer(data, self.timeout) {
            Ok(n) => Ok(n),
            Err(rusb::Error::NoDevice) if !self.is_running() => {
                Err(Error::new(ErrorKind::NotConnected, "USB-MIDI device has been released"))
            }
            Err(rusb::Error::NotFound) if self.iface.ep_out.is_none() => {
                Err(Error::new(ErrorKind::NotFound, "USB-MIDI device has no OUT endpoint"))
            }
            Err(err) => Err(to_io_err(err)),
        }
    }

    fn max_packet_size(&self) -> usize {
        self.iface.ep_out.map(|ep| usize::from(ep.max_packet_size)).unwrap_or(MIDI_EVENT_PACKET_SIZE)
    }
}

impl<C: UsbContext> Drop for UsbMidiDevice<C> {
    fn drop(&mut self) {
        if let Err(err) = self.release() {
            tracing::warn!("releasing USB-MIDI interface failed: {err}");
        }
    }
}

pub(crate) struct MidiShared {
    pub(crate) name: String,
    pub(crate) error: Arc<Mutex<Option<rusb::Error>>>,
    pub(crate) in_thread: Option<JoinHandle<()>>,
    pub(crate) out_thread: Option<JoinHandle<()>>,
    pub(crate) stop_tx: Option<oneshot::Sender<()>>,
}

impl MidiShared {
    pub(crate) fn error(&self) -> Error {
        match *self.error.lock().unwrap() {
            Some(err) => to_io_err(err),
            None => Error::new(ErrorKind::BrokenPipe, "USB-MIDI connection closed"),
        }
    }
}

impl Drop for MidiShared {
    fn drop(&mut self) {
        tracing::debug!("waiting for IO threads");
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        for thread in [self.in_thread.take(), self.out_thread.take()].into_iter().flatten() {
            if thread.join().is_err() {
                tracing::error!("USB-MIDI IO thread panicked");
            }
        }
        tracing::debug!("IO threads finished");
    }
}

/// Starts background I/O on the device.
///
/// The device is released once both the sender and the receiver have been dropped.
pub async fn connect<C: UsbContext + 'static>(dev: UsbMidiDevice<C>) -> Result<(MidiSender, MidiReceiver)> {
    if !dev.is_running() {
        return Err(Error::new(ErrorKind::NotConnected, "USB-MIDI device has been released"));
    }

    let name = dev.name();
    let in_size = dev.in_transfer_size();
    let out_chunk = transfer_size(dev.max_packet_size());
    let dev = Arc::new(dev);

    // Discard data queued before connecting.
    if dev.ep_in().is_some() {
        let dev_task = dev.clone();
        let flushed = spawn_blocking(move || {
            let mut buf = vec![0; in_size];
            flush(|buf| dev_task.read_transfer(buf, FLUSH_TIMEOUT), &mut buf, FLUSH_LIMIT)
        })
        .await
        .map_err(|err| Error::new(ErrorKind::Other, err))?;
        tracing::debug!("flushed {flushed} bytes from IN endpoint");
    }

    // Start handler threads.
    let error = Arc::new(Mutex::new(None));

    let dev_in = dev.clone();
    let error_in = error.clone();
    let (tx_in, rx_in) = mpsc::channel(16);
    let in_thread = thread::Builder::new()
        .name(format!("MIDI {name} in"))
        .spawn(move || in_thread(dev_in, tx_in, error_in, in_size))?;

    let (tx_out, rx_out) = mpsc::channel(16);
    let error_out = error.clone();
    let (stop_tx, stop_rx) = oneshot::channel();
    let out_thread = thread::Builder::new()
        .name(format!("MIDI {name} out"))
        .spawn(move || out_thread(dev, rx_out, error_out, stop_rx, out_chunk))?;

    // Build objects.
    tracing::debug!("connected to {name}");
    let shared = Arc::new(MidiShared {
        name,
        error,
        in_thread: Some(in_thread),
        out_thread: Some(out_thread),
        stop_tx: Some(stop_tx),
    });
    let sender = MidiSender { tx: tx_out, shared: shared.clone() };
    let recv = MidiReceiver::new(rx_in, shared);

    Ok((sender, recv))
}

/// Reads and discards transfers until the device has no data left or `limit` has elapsed.
///
/// Returns the number of bytes discarded.
fn flush(mut read: impl FnMut(&mut [u8]) -> rusb::Result<usize>, buf: &mut [u8], limit: Duration) -> usize {
    let deadline = Instant::now() + limit;
    let mut flushed = 0;

    while Instant::now() < deadline {
        match read(buf) {
            Ok(0) | Err(_) => return flushed,
            Ok(n) => flushed += n,
        }
    }

    tracing::debug!("device still sending after {limit:?}, stopping flush");
    flushed
}

/// Writes the next transfer of at most `chunk` bytes and removes the written bytes from `data`.
fn write_next(
    data: &mut Bytes, chunk: usize, write: impl FnOnce(&[u8]) -> rusb::Result<usize>,
) -> rusb::Result<usize> {
    let n = write(&data[..data.len().min(chunk)])?;
    let _ = data.split_to(n.min(data.len()));
    Ok(n)
}

fn in_thread<C: UsbContext>(
    dev: Arc<UsbMidiDevice<C>>, tx: mpsc::Sender<BytesMut>, error: Arc<Mutex<Option<rusb::Error>>>,
    in_size: usize,
) {
    if dev.ep_in().is_none() {
        tracing::debug!("device has no IN endpoint");
        return;
    }

    while !tx.is_closed() {
        let mut buf = BytesMut::zeroed(in_size);
        match dev.read_transfer(&mut buf, dev.timeout) {
            Ok(0) => (),
            Ok(n) => {
                #[cfg(feature = "trace-packets")]
                tracing::trace!("received transfer of {n} bytes");
                buf.truncate(n);
                if tx.blocking_send(buf).is_err() {
                    break;
                }
            }
            Err(rusb::Error::Timeout) => (),
            Err(err) => {
                tracing::warn!("receiving failed: {err}");
                *error.lock().unwrap() = Some(err);
                break;
            }
        }
    }
}

fn out_thread<C: UsbContext>(
    dev: Arc<UsbMidiDevice<C>>, mut rx: mpsc::Receiver<Bytes>, error: Arc<Mutex<Option<rusb::Error>>>,
    mut stop_rx: oneshot::Receiver<()>, chunk: usize,
) {
    'outer: while let Some(mut data) = rx.blocking_recv() {
        while !data.is_empty() {
            match stop_rx.try_recv() {
                Err(TryRecvError::Empty) => (),
                _ => break 'outer,
            }

            match write_next(&mut data, chunk, |buf| dev.write_transfer(buf, dev.timeout)) {
                Ok(_n) => {
                    #[cfg(feature = "trace-packets")]
                    tracing::trace!("sent transfer of {_n} bytes");
                }
                Err(rusb::Error::Timeout) => (),
                Err(err) => {
                    tracing::warn!("sending failed: {err}");
                    *error.lock().unwrap() = Some(err);
                    break 'outer;
                }
            }
        }
    }
}
