//! Configuration descriptor parsing.
//!
//! Walks the raw bytes returned by a `GET_DESCRIPTOR(CONFIGURATION)` request and picks the
//! endpoints used for MIDI traffic.

use std::io::{Error, ErrorKind, Result};

use crate::Class;

/// Descriptor type of a configuration descriptor.
pub const DESC_TYPE_CONFIGURATION: u8 = 0x02;
/// Descriptor type of an interface descriptor.
pub const DESC_TYPE_INTERFACE: u8 = 0x04;
/// Descriptor type of an endpoint descriptor.
pub const DESC_TYPE_ENDPOINT: u8 = 0x05;

/// Length of the configuration descriptor header.
pub const CONFIG_DESC_LEN: usize = 9;

const INTERFACE_DESC_LEN: usize = 9;
const ENDPOINT_DESC_LEN: usize = 7;

/// Transfer type mask accepting bulk endpoints only.
pub const MASK_BULK: u8 = 0x03;
/// Transfer type mask accepting bulk and interrupt endpoints.
pub const MASK_BULK_OR_INTERRUPT: u8 = 0x02;

const VID_NOVATION: u16 = 0x1235;

/// Endpoint transfer type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferType {
    /// Control transfer.
    Control,
    /// Isochronous transfer.
    Isochronous,
    /// Bulk transfer.
    Bulk,
    /// Interrupt transfer.
    Interrupt,
}

impl From<u8> for TransferType {
    fn from(attributes: u8) -> Self {
        match attributes & 0x03 {
            0 => Self::Control,
            1 => Self::Isochronous,
            2 => Self::Bulk,
            _ => Self::Interrupt,
        }
    }
}

/// Endpoint used for MIDI traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointInfo {
    /// Endpoint address including the direction bit.
    pub address: u8,
    /// Maximum packet size.
    pub max_packet_size: u16,
    /// Transfer type.
    pub transfer_type: TransferType,
    /// Polling interval.
    pub interval: u8,
}

impl EndpointInfo {
    /// Whether this is an IN (device to host) endpoint.
    pub const fn is_in(&self) -> bool {
        self.address & 0x80 != 0
    }

    /// Endpoint number without the direction bit.
    pub const fn number(&self) -> u8 {
        self.address & 0x0f
    }
}

/// Interface and its selected endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterfaceEndpoints {
    /// Interface number.
    pub interface: u8,
    /// Alternate setting.
    pub alternate: u8,
    /// Interface class.
    pub class: Class,
    /// IN endpoint.
    pub ep_in: Option<EndpointInfo>,
    /// OUT endpoint.
    pub ep_out: Option<EndpointInfo>,
}

impl InterfaceEndpoints {
    fn new(interface: u8, alternate: u8, class: Class) -> Self {
        Self { interface, alternate, class, ep_in: None, ep_out: None }
    }

    /// Whether at least one endpoint was found.
    pub fn has_endpoints(&self) -> bool {
        self.ep_in.is_some() || self.ep_out.is_some()
    }

    fn set(&mut self, ep: EndpointInfo) {
        if ep.is_in() {
            self.ep_in = Some(ep);
        } else {
            self.ep_out = Some(ep);
        }
    }
}

/// Result of parsing one configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigInfo {
    /// `bConfigurationValue` used to activate the configuration.
    pub config_value: u8,
    /// First MIDI streaming interface.
    pub midi: Option<InterfaceEndpoints>,
    /// Last other interface carrying an accepted endpoint.
    pub fallback: Option<InterfaceEndpoints>,
    /// Number of accepted endpoints across all interfaces.
    pub num_endpoints: usize,
}

impl ConfigInfo {
    /// Whether a MIDI streaming interface was found.
    pub fn is_midi(&self) -> bool {
        self.midi.is_some()
    }

    /// Interface to use for MIDI traffic.
    ///
    /// Devices without a MIDI streaming interface that still expose bulk endpoints
    /// are driven through their last bulk interface.
    pub fn select(&self) -> Option<&InterfaceEndpoints> {
        match &self.midi {
            Some(midi) if midi.has_endpoints() => Some(midi),
            _ => self.fallback.as_ref().filter(|f| f.has_endpoints()),
        }
    }
}

/// Iterator over the descriptors contained in a buffer.
///
/// Yields `(descriptor type, descriptor bytes)`; the bytes include the two header bytes.
#[derive(Debug, Clone)]
pub struct Descriptors<'a> {
    buf: &'a [u8],
    failed: bool,
}

impl<'a> Descriptors<'a> {
    /// Iterates over the descriptors in `buf`.
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, failed: false }
    }
}

impl<'a> Iterator for Descriptors<'a> {
    type Item = Result<(u8, &'a [u8])>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.buf.is_empty() {
            return None;
        }

        let len = usize::from(self.buf[0]);
        if len < 2 || len > self.buf.len() {
            self.failed = true;
            return Some(Err(Error::new(
                ErrorKind::InvalidData,
                format!("malformed descriptor of length {len} with {} bytes remaining", self.buf.len()),
            )));
        }

        let (desc, rest) = self.buf.split_at(len);
        self.buf = rest;
        Some(Ok((desc[1], desc)))
    }
}

/// Returns the transfer type mask to apply when selecting endpoints of a device.
///
/// Novation LaunchPad and LaunchKey devices declare their MIDI endpoints as interrupt
/// endpoints and are handled like bulk endpoints.
pub fn transfer_type_mask(vid: u16, pid: u16) -> u8 {
    if vid != VID_NOVATION {
        return MASK_BULK;
    }

    match pid {
        // LaunchPad S, Mini, Pro, MK2
        0x20 | 0x36 | 0x51 | 0x69 => MASK_BULK_OR_INTERRUPT,
        // LaunchKey, LaunchKey Mini, LaunchKey MK2
        0x30..=0x32 | 0x35 | 0x7b..=0x7d => MASK_BULK_OR_INTERRUPT,
        _ => MASK_BULK,
    }
}

/// Reads `wTotalLength` from a configuration descriptor header.
pub fn total_length(header: &[u8]) -> Result<usize> {
    if header.len() < 4 || header[1] != DESC_TYPE_CONFIGURATION {
        return Err(Error::new(ErrorKind::InvalidData, "not a configuration descriptor"));
    }
    Ok(usize::from(u16::from_le_bytes([header[2], header[3]])))
}

/// Parses a configuration descriptor and locates the MIDI endpoints.
///
/// An endpoint is accepted if `bmAttributes & transfer_type_mask` equals the bulk
/// transfer type, see [`transfer_type_mask`].
pub fn parse_config_descriptor(buf: &[u8], transfer_type_mask: u8) -> Result<ConfigInfo> {
    if buf.len() < CONFIG_DESC_LEN || usize::from(buf[0]) < CONFIG_DESC_LEN {
        return Err(Error::new(ErrorKind::InvalidData, "configuration descriptor too short"));
    }
    let total = total_length(buf)?.min(buf.len());

    let mut info = ConfigInfo { config_value: buf[5], ..Default::default() };
    let mut current: Option<InterfaceEndpoints> = None;
    let mut current_is_midi = false;

    for desc in Descriptors::new(&buf[..total]) {
        let (ty, desc) = desc?;
        match ty {
            DESC_TYPE_INTERFACE if desc.len() >= INTERFACE_DESC_LEN => {
                finish_interface(&mut info, current.take(), current_is_midi);

                let class = Class::new(desc[5], desc[6], desc[7]);
                current_is_midi = Class::MIDI_STREAMING.matches(class.class, class.sub_class);
                if current_is_midi {
                    tracing::debug!("MIDI streaming interface {} alt {}", desc[2], desc[3]);
                }
                current = Some(InterfaceEndpoints::new(desc[2], desc[3], class));
            }
            DESC_TYPE_ENDPOINT if desc.len() >= ENDPOINT_DESC_LEN => {
                let attributes = desc[3];
                let ep = EndpointInfo {
                    address: desc[2],
                    max_packet_size: u16::from_le_bytes([desc[4], desc[5]]) & 0x07ff,
                    transfer_type: TransferType::from(attributes),
                    interval: desc[6],
                };
                tracing::debug!(
                    "endpoint {:#04x} attributes {attributes:#04x} max packet size {}",
                    ep.address,
                    ep.max_packet_size
                );

                if attributes & transfer_type_mask != 0x02 {
                    continue;
                }
                if let Some(iface) = current.as_mut() {
                    iface.set(ep);
                    info.num_endpoints += 1;
                }
            }
            _ => (),
        }
    }
    finish_interface(&mut info, current, current_is_midi);

    Ok(info)
}

/// Picks the first configuration with a usable interface.
///
/// `configs` yields the raw configuration descriptors in index order. Configurations that
/// cannot be read or parsed are skipped; iteration stops at the first usable one.
pub fn select_configuration<I>(configs: I, transfer_type_mask: u8) -> Option<(ConfigInfo, InterfaceEndpoints)>
where
    I: IntoIterator<Item = Result<Vec<u8>>>,
{
    for (index, raw) in configs.into_iter().enumerate() {
        let config = match raw.and_then(|raw| parse_config_descriptor(&raw, transfer_type_mask)) {
            Ok(config) => config,
            Err(err) => {
                tracing::warn!("skipping configuration {index}: {err}");
                continue;
            }
        };
        tracing::debug!("configuration {index}: {config:?}");

        if let Some(iface) = config.select().copied() {
            return Some((config, iface));
        }
    }

    None
}

fn finish_interface(info: &mut ConfigInfo, iface: Option<InterfaceEndpoints>, is_midi: bool) {
    let Some(iface) = iface else { return };

    if is_midi {
        let replace = match &info.midi {
            None => true,
            Some(midi) => !midi.has_endpoints() && iface.has_endpoints(),
        };
        if replace {
            info.midi = Some(iface);
        }
    } else if iface.has_endpoints() {
        info.fallback = Some(iface);
    }
}
