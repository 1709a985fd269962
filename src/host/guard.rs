//! Device interface guard.

use std::{
    collections::HashSet,
    io::{Error, ErrorKind, Result},
    sync::{LazyLock, Mutex},
};

/// Bus number, device address and interface number.
type InterfaceLocation = (u8, u8, u8);

static OPEN: LazyLock<Mutex<HashSet<InterfaceLocation>>> = LazyLock::new(|| Mutex::new(HashSet::new()));

/// Marks an interface of an attached device as opened by this process until dropped.
pub(crate) struct InUseGuard(InterfaceLocation);

impl InUseGuard {
    pub fn new(bus: u8, address: u8, interface: u8) -> Result<Self> {
        let location = (bus, address, interface);
        let mut open = OPEN.lock().unwrap();

        if !open.insert(location) {
            return Err(Error::new(
                ErrorKind::ResourceBusy,
                format!("MIDI interface {interface} of device {bus}-{address} is already open"),
            ));
        }

        Ok(Self(location))
    }
}

impl Drop for InUseGuard {
    fn drop(&mut self) {
        let mut open = OPEN.lock().unwrap();
        open.remove(&self.0);
    }
}
