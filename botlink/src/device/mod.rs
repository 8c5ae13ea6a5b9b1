//! Device discovery data model and hardware identity tables.
//!
//! A [`DeviceCandidate`] is a discovered, not-yet-opened device. Candidates
//! are immutable after creation, owned by the registry's candidate list, and
//! replaced wholesale on the next scan. Candidate ids are process-unique and
//! monotonic; an id is only meaningful within the scan generation that
//! produced it.

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};

use btleplug::api::BDAddr;
use btleplug::platform::{Adapter, Peripheral, PeripheralId};

/// Transport type for discovered devices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum TransportKind {
    /// Bluetooth Low Energy (GATT UART bridge).
    Ble,
    /// USB CDC serial.
    Usb,
}

/// Mode a USB-attached controller enumerated in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum UsbMode {
    /// Running the application firmware.
    Firmware,
    /// Sitting in the bootloader, ready for upload.
    Bootloader,
}

/// VID/PID pair of the controller running application firmware.
pub const FIRMWARE_USB_ID: (u16, u16) = (0x054C, 0x0BE6);

/// VID/PID pair of the controller's bootloader.
///
/// The bootloader re-enumerates as a distinct USB identity, which is how the
/// touch-1200 sequence detects that the jump succeeded.
pub const BOOTLOADER_USB_ID: (u16, u16) = (0x054C, 0x0BDC);

/// Classify a VID/PID pair against the known controller identities.
#[must_use]
pub fn classify_usb_id(vid: u16, pid: u16) -> Option<UsbMode> {
    if (vid, pid) == FIRMWARE_USB_ID {
        Some(UsbMode::Firmware)
    } else if (vid, pid) == BOOTLOADER_USB_ID {
        Some(UsbMode::Bootloader)
    } else {
        None
    }
}

/// Check whether a port path looks like a USB CDC device file.
///
/// Accepted shapes: `/dev/tty.usb*` and `/dev/cu.usb*` (macOS),
/// `/dev/ttyACM*` (Linux), `COM` followed by one to three digits (Windows).
#[must_use]
pub fn is_usb_port_path(path: &str) -> bool {
    if path.starts_with("/dev/tty.usb") || path.starts_with("/dev/cu.usb") {
        return true;
    }
    if path.starts_with("/dev/ttyACM") {
        return true;
    }
    if let Some(digits) = path.strip_prefix("COM") {
        return !digits.is_empty() && digits.len() <= 3 && digits.bytes().all(|b| b.is_ascii_digit());
    }
    false
}

/// Monotonic candidate-id source.
///
/// Owned by the registry; ids are never reused within a process.
#[derive(Debug, Default)]
pub struct IdAllocator(AtomicU32);

impl IdAllocator {
    /// Create a new allocator starting at zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate the next id.
    pub fn next_id(&self) -> u32 {
        self.0.fetch_add(1, Ordering::Relaxed)
    }
}

/// Transport-specific candidate metadata.
#[derive(Clone)]
pub enum CandidateDetail {
    /// A BLE peripheral observed during the scan window.
    Ble {
        /// Adapter the peripheral was discovered on; needed for the
        /// disconnect event stream once a session opens.
        adapter: Adapter,
        /// Live peripheral handle.
        peripheral: Peripheral,
        /// Transport-native peripheral id (scan dedup and ordering key).
        peripheral_id: PeripheralId,
        /// Advertised address.
        address: BDAddr,
    },
    /// A serial port whose path and USB identity matched the controller.
    Usb {
        /// Device file path, e.g. `/dev/ttyACM0` or `COM3`.
        port_name: String,
        /// USB vendor id.
        vid: u16,
        /// USB product id.
        pid: u16,
        /// Which identity pair matched.
        mode: UsbMode,
    },
}

impl fmt::Debug for CandidateDetail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ble {
                peripheral_id,
                address,
                ..
            } => f
                .debug_struct("Ble")
                .field("peripheral_id", peripheral_id)
                .field("address", address)
                .finish_non_exhaustive(),
            Self::Usb {
                port_name,
                vid,
                pid,
                mode,
            } => f
                .debug_struct("Usb")
                .field("port_name", port_name)
                .field("vid", vid)
                .field("pid", pid)
                .field("mode", mode)
                .finish(),
        }
    }
}

/// A discovered, not-yet-opened device.
#[derive(Debug, Clone)]
pub struct DeviceCandidate {
    /// Process-unique monotonic id assigned at discovery time.
    pub id: u32,
    /// Raw identifier: BLE peripheral name or serial port path.
    pub name: String,
    /// Name plus a transport-specific disambiguator (BLE address).
    pub display_name: String,
    /// Transport-specific metadata.
    pub detail: CandidateDetail,
}

impl DeviceCandidate {
    /// Build a BLE candidate from scan results.
    pub fn ble(
        id: u32,
        name: String,
        adapter: Adapter,
        peripheral: Peripheral,
        peripheral_id: PeripheralId,
        address: BDAddr,
    ) -> Self {
        let display_name = format!("{name} ({address})");
        Self {
            id,
            name,
            display_name,
            detail: CandidateDetail::Ble {
                adapter,
                peripheral,
                peripheral_id,
                address,
            },
        }
    }

    /// Build a USB candidate from an enumerated port.
    pub fn usb(id: u32, port_name: String, vid: u16, pid: u16, mode: UsbMode) -> Self {
        Self {
            id,
            name: port_name.clone(),
            display_name: port_name.clone(),
            detail: CandidateDetail::Usb {
                port_name,
                vid,
                pid,
                mode,
            },
        }
    }

    /// Transport this candidate was discovered on.
    pub fn transport(&self) -> TransportKind {
        match self.detail {
            CandidateDetail::Ble { .. } => TransportKind::Ble,
            CandidateDetail::Usb { .. } => TransportKind::Usb,
        }
    }

    /// Read-only projection for callers.
    pub fn summary(&self) -> DeviceSummary {
        let (address, mode) = match &self.detail {
            CandidateDetail::Ble { address, .. } => (Some(address.to_string()), None),
            CandidateDetail::Usb { mode, .. } => (None, Some(*mode)),
        };
        DeviceSummary {
            id: self.id,
            transport: self.transport(),
            name: self.name.clone(),
            display_name: self.display_name.clone(),
            address,
            mode,
        }
    }
}

/// Read-only summary of a candidate, as returned by the registry's `list`.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DeviceSummary {
    /// Candidate id (valid for the current scan generation).
    pub id: u32,
    /// Transport kind.
    pub transport: TransportKind,
    /// Raw identifier.
    pub name: String,
    /// Disambiguated display name.
    pub display_name: String,
    /// BLE address, for BLE candidates.
    pub address: Option<String>,
    /// Enumerated mode, for USB candidates.
    pub mode: Option<UsbMode>,
}

/// How to resolve a candidate during selection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SelectBy {
    /// By the candidate id assigned at discovery time.
    Id(u32),
    /// By exact match against `name` or `display_name`.
    Name(String),
}

impl SelectBy {
    pub(crate) fn matches(&self, candidate: &DeviceCandidate) -> bool {
        match self {
            Self::Id(id) => candidate.id == *id,
            Self::Name(name) => candidate.name == *name || candidate.display_name == *name,
        }
    }

    pub(crate) fn describe(&self) -> String {
        match self {
            Self::Id(id) => format!("id: {id}"),
            Self::Name(name) => format!("name: {name}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_usb_id() {
        assert_eq!(classify_usb_id(0x054C, 0x0BE6), Some(UsbMode::Firmware));
        assert_eq!(classify_usb_id(0x054C, 0x0BDC), Some(UsbMode::Bootloader));
        assert_eq!(classify_usb_id(0x054C, 0x1234), None);
        assert_eq!(classify_usb_id(0x1A86, 0x7523), None);
    }

    #[test]
    fn test_usb_port_path_patterns() {
        assert!(is_usb_port_path("/dev/tty.usbmodem14101"));
        assert!(is_usb_port_path("/dev/cu.usbserial-0001"));
        assert!(is_usb_port_path("/dev/ttyACM0"));
        assert!(is_usb_port_path("COM3"));
        assert!(is_usb_port_path("COM255"));

        assert!(!is_usb_port_path("/dev/ttyS0"));
        assert!(!is_usb_port_path("/dev/ttyUSB0"));
        assert!(!is_usb_port_path("COM"));
        assert!(!is_usb_port_path("COM1234"));
        assert!(!is_usb_port_path("COMx"));
    }

    #[test]
    fn test_id_allocator_is_monotonic() {
        let ids = IdAllocator::new();
        let a = ids.next_id();
        let b = ids.next_id();
        let c = ids.next_id();
        assert!(a < b && b < c);
    }

    #[test]
    fn test_usb_candidate_summary() {
        let candidate = DeviceCandidate::usb(
            7,
            "/dev/ttyACM0".to_string(),
            BOOTLOADER_USB_ID.0,
            BOOTLOADER_USB_ID.1,
            UsbMode::Bootloader,
        );
        assert_eq!(candidate.transport(), TransportKind::Usb);

        let summary = candidate.summary();
        assert_eq!(summary.id, 7);
        assert_eq!(summary.name, "/dev/ttyACM0");
        assert_eq!(summary.display_name, "/dev/ttyACM0");
        assert_eq!(summary.mode, Some(UsbMode::Bootloader));
        assert_eq!(summary.address, None);
    }

    #[test]
    fn test_select_by_matches_usb() {
        let candidate = DeviceCandidate::usb(
            3,
            "/dev/ttyACM1".to_string(),
            FIRMWARE_USB_ID.0,
            FIRMWARE_USB_ID.1,
            UsbMode::Firmware,
        );
        assert!(SelectBy::Id(3).matches(&candidate));
        assert!(!SelectBy::Id(4).matches(&candidate));
        assert!(SelectBy::Name("/dev/ttyACM1".to_string()).matches(&candidate));
        assert!(!SelectBy::Name("/dev/ttyACM2".to_string()).matches(&candidate));
    }
}
