//! Transport sessions and the shared event surface.
//!
//! A [`Session`] is an opened, stateful connection to exactly one discovered
//! candidate. The registry owns at most one session at a time and forwards
//! caller operations to it; enum dispatch keeps the two transports behind one
//! surface without trait objects.

pub mod ble;
pub mod framing;
pub mod usb;

use crate::device::TransportKind;
use crate::error::Result;

pub use ble::BleSession;
pub use usb::UsbSession;

/// Event pushed from an open session to a subscribed handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceEvent {
    /// Bytes received from the device.
    Data(Vec<u8>),
    /// The transport link was lost.
    Disconnected,
}

/// Which event stream to subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// Incoming payload bytes.
    Data,
    /// Link loss notification. At most one handler may be active; duplicate
    /// registrations are ignored.
    Disconnect,
}

/// Caller-supplied event handler.
pub type EventHandler = Box<dyn FnMut(DeviceEvent) + Send + 'static>;

/// An opened connection to one candidate, over either transport.
pub enum Session {
    /// BLE GATT session.
    Ble(BleSession),
    /// USB serial session.
    Usb(UsbSession),
}

impl Session {
    /// Transport kind of this session.
    pub fn transport(&self) -> TransportKind {
        match self {
            Self::Ble(_) => TransportKind::Ble,
            Self::Usb(_) => TransportKind::Usb,
        }
    }

    /// Open the underlying transport. Idempotent when already open.
    ///
    /// A USB target that enumerated in bootloader mode is refused; use
    /// [`Session::open_for_upload`] for that case.
    pub async fn open(&mut self) -> Result<()> {
        match self {
            Self::Ble(s) => s.open().await,
            Self::Usb(s) => s.open(),
        }
    }

    /// Open the transport for a firmware upload, skipping the
    /// bootloader-mode refusal on USB.
    pub async fn open_for_upload(&mut self) -> Result<()> {
        match self {
            Self::Ble(s) => s.open().await,
            Self::Usb(s) => s.open_raw(),
        }
    }

    /// Close the transport. Idempotent when already closed.
    pub async fn close(&mut self) -> Result<()> {
        match self {
            Self::Ble(s) => s.close().await,
            Self::Usb(s) => s.close(),
        }
    }

    /// Write a byte buffer to the device.
    pub async fn write(&mut self, data: &[u8]) -> Result<()> {
        match self {
            Self::Ble(s) => s.write(data).await,
            Self::Usb(s) => s.write(data),
        }
    }

    /// Subscribe a handler to an event stream of this session.
    pub async fn subscribe(&mut self, kind: EventKind, handler: EventHandler) -> Result<()> {
        match self {
            Self::Ble(s) => s.subscribe(kind, handler).await,
            Self::Usb(s) => s.subscribe(kind, handler),
        }
    }

    /// Reset the device into bootloader mode.
    pub async fn reset_to_bootloader(&mut self) -> Result<()> {
        match self {
            Self::Ble(s) => s.reset_to_bootloader().await,
            Self::Usb(s) => s.reset_to_bootloader().await,
        }
    }
}
