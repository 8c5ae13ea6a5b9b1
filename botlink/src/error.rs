//! Error types for botlink.
//!
//! Every failure carries a stable `(Domain, code)` pair so callers can route
//! on error class without string matching. A zero code within a domain is the
//! success sentinel; in Rust it is represented by `Ok(())`, never by an
//! `Error` value. Underlying transport causes are preserved unmodified.

use std::io;
use thiserror::Error;

/// Result type for botlink operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error domain tags.
///
/// `Device` covers caller-contract violations at the registry level, `Ble`
/// and `Usb` cover failures of the respective transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Domain {
    /// Registry-level errors.
    Device,
    /// BLE transport errors.
    Ble,
    /// USB serial transport errors.
    Usb,
}

/// Error type for botlink operations.
#[derive(Debug, Error)]
pub enum Error {
    /// The selected id or name matches no candidate in the current list.
    #[error("no such device: {0}")]
    UnknownDevice(String),

    /// An operation was requested while no session is open.
    #[error("no device is open")]
    NoDevice,

    /// Writing the BLE data characteristic failed.
    #[error("BLE write failed: {0}")]
    BleWrite(#[source] btleplug::Error),

    /// Tearing down the BLE link failed.
    #[error("BLE disconnect failed: {0}")]
    BleDisconnect(#[source] btleplug::Error),

    /// Connecting to the BLE peripheral failed.
    #[error("BLE connect failed: {0}")]
    BleConnect(#[source] btleplug::Error),

    /// Writing the GPIO (reset control) characteristic failed.
    #[error("BLE GPIO write failed: {0}")]
    BleGpio(#[source] btleplug::Error),

    /// No open link, or a required GATT characteristic is missing.
    #[error("BLE channel unavailable: {0}")]
    BleNoChannel(String),

    /// The peripheral refused the connection because it is not paired.
    #[error("BLE device is not paired")]
    BleNotPaired,

    /// Opening the serial port failed.
    #[error("serial open failed: {0}")]
    UsbOpen(#[source] serialport::Error),

    /// Closing the serial port failed.
    #[error("serial close failed: {0}")]
    UsbClose(#[source] io::Error),

    /// Enumerating serial ports failed.
    #[error("serial enumeration failed: {0}")]
    UsbList(#[source] serialport::Error),

    /// The bootloader device never appeared within the polling budget.
    #[error("no bootloader device found")]
    UsbNoBootloader,

    /// Writing to the serial port failed; the session closed the port.
    #[error("serial write failed: {0}")]
    UsbWrite(#[source] io::Error),

    /// The target enumerated in bootloader mode; normal open is refused.
    #[error("cannot open device in bootloader mode")]
    UsbUnexpectedBootloader,
}

impl Error {
    /// Domain tag of this error.
    pub fn domain(&self) -> Domain {
        match self {
            Self::UnknownDevice(_) | Self::NoDevice => Domain::Device,
            Self::BleWrite(_)
            | Self::BleDisconnect(_)
            | Self::BleConnect(_)
            | Self::BleGpio(_)
            | Self::BleNoChannel(_)
            | Self::BleNotPaired => Domain::Ble,
            Self::UsbOpen(_)
            | Self::UsbClose(_)
            | Self::UsbList(_)
            | Self::UsbNoBootloader
            | Self::UsbWrite(_)
            | Self::UsbUnexpectedBootloader => Domain::Usb,
        }
    }

    /// Stable numeric code of this error within its domain.
    pub fn code(&self) -> u8 {
        match self {
            Self::UnknownDevice(_) => 0x01,
            Self::NoDevice => 0x02,
            Self::BleWrite(_) => 0x11,
            Self::BleDisconnect(_) => 0x12,
            Self::BleConnect(_) => 0x13,
            Self::BleGpio(_) => 0x14,
            Self::BleNoChannel(_) => 0x15,
            Self::BleNotPaired => 0x16,
            Self::UsbOpen(_) => 0x21,
            Self::UsbClose(_) => 0x22,
            Self::UsbList(_) => 0x23,
            Self::UsbNoBootloader => 0x24,
            Self::UsbWrite(_) => 0x25,
            Self::UsbUnexpectedBootloader => 0x26,
        }
    }

    /// Whether a retry of the failed operation could plausibly succeed.
    ///
    /// Pairing refusals and caller-contract violations never benefit from a
    /// retry; transient I/O failures might.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::BleWrite(_) | Self::UsbWrite(_) | Self::UsbList(_) | Self::UsbNoBootloader
        )
    }
}

/// Classify a BLE connect failure.
///
/// An OS-level pairing refusal is reported distinctly so callers can prompt
/// the user instead of retrying.
pub(crate) fn classify_connect_error(err: btleplug::Error) -> Error {
    match err {
        btleplug::Error::PermissionDenied => Error::BleNotPaired,
        other => Error::BleConnect(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_domain_and_code_pairs() {
        assert_eq!(Error::NoDevice.domain(), Domain::Device);
        assert_eq!(Error::NoDevice.code(), 0x02);
        assert_eq!(Error::UnknownDevice("id: 3".into()).code(), 0x01);

        assert_eq!(Error::BleNotPaired.domain(), Domain::Ble);
        assert_eq!(Error::BleNotPaired.code(), 0x16);

        assert_eq!(Error::UsbNoBootloader.domain(), Domain::Usb);
        assert_eq!(Error::UsbNoBootloader.code(), 0x24);
        assert_eq!(Error::UsbUnexpectedBootloader.code(), 0x26);
    }

    #[test]
    fn test_not_paired_classification() {
        let err = classify_connect_error(btleplug::Error::PermissionDenied);
        assert!(matches!(err, Error::BleNotPaired));

        let err = classify_connect_error(btleplug::Error::NotConnected);
        assert!(matches!(err, Error::BleConnect(_)));
    }

    #[test]
    fn test_transient_classification() {
        assert!(Error::UsbNoBootloader.is_transient());
        assert!(!Error::BleNotPaired.is_transient());
        assert!(!Error::NoDevice.is_transient());
    }

    #[test]
    fn test_cause_is_preserved() {
        let io = io::Error::new(io::ErrorKind::BrokenPipe, "pipe gone");
        let err = Error::UsbWrite(io);
        let source = std::error::Error::source(&err).expect("source");
        assert!(source.to_string().contains("pipe gone"));
    }
}
