//! USB serial enumeration for controller discovery.
//!
//! USB discovery is a single enumeration pass: list the serial ports, keep
//! those whose device-file path looks like a USB CDC port and whose USB
//! identity matches either the firmware or the bootloader VID/PID pair of
//! the controller.

use log::{debug, trace};
use serialport::{SerialPortInfo, SerialPortType};

use crate::device::{classify_usb_id, is_usb_port_path, UsbMode};
use crate::error::{Error, Result};

/// A serial port that matched the controller's identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsbScanHit {
    /// Device file path.
    pub port_name: String,
    /// USB vendor id.
    pub vid: u16,
    /// USB product id.
    pub pid: u16,
    /// Which identity pair matched.
    pub mode: UsbMode,
}

/// Enumerate serial ports and keep controller matches.
pub fn scan() -> Result<Vec<UsbScanHit>> {
    let ports = serialport::available_ports().map_err(Error::UsbList)?;
    Ok(filter_ports(ports))
}

/// Filter an enumeration result down to controller ports.
///
/// Enumeration order is preserved, which keeps the aggregate candidate list
/// deterministic across runs with the same attached hardware.
pub(crate) fn filter_ports(ports: Vec<SerialPortInfo>) -> Vec<UsbScanHit> {
    let mut hits = Vec::new();
    for info in ports {
        trace!("enumerated port: {}", info.port_name);
        if !is_usb_port_path(&info.port_name) {
            continue;
        }
        let SerialPortType::UsbPort(usb) = info.port_type else {
            continue;
        };
        if let Some(mode) = classify_usb_id(usb.vid, usb.pid) {
            debug!(
                "controller port: {} (VID: {:04X}, PID: {:04X}, {:?})",
                info.port_name, usb.vid, usb.pid, mode
            );
            hits.push(UsbScanHit {
                port_name: info.port_name,
                vid: usb.vid,
                pid: usb.pid,
                mode,
            });
        }
    }
    hits
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{BOOTLOADER_USB_ID, FIRMWARE_USB_ID};
    use serialport::UsbPortInfo;

    fn usb_port(name: &str, vid: u16, pid: u16) -> SerialPortInfo {
        SerialPortInfo {
            port_name: name.to_string(),
            port_type: SerialPortType::UsbPort(UsbPortInfo {
                vid,
                pid,
                serial_number: None,
                manufacturer: None,
                product: None,
            }),
        }
    }

    fn plain_port(name: &str) -> SerialPortInfo {
        SerialPortInfo {
            port_name: name.to_string(),
            port_type: SerialPortType::Unknown,
        }
    }

    #[test]
    fn test_filter_keeps_controller_ports_in_order() {
        let hits = filter_ports(vec![
            usb_port("/dev/ttyACM0", FIRMWARE_USB_ID.0, FIRMWARE_USB_ID.1),
            usb_port("/dev/ttyACM1", BOOTLOADER_USB_ID.0, BOOTLOADER_USB_ID.1),
        ]);
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].port_name, "/dev/ttyACM0");
        assert_eq!(hits[0].mode, UsbMode::Firmware);
        assert_eq!(hits[1].port_name, "/dev/ttyACM1");
        assert_eq!(hits[1].mode, UsbMode::Bootloader);
    }

    #[test]
    fn test_filter_rejects_foreign_identity() {
        let hits = filter_ports(vec![usb_port("/dev/ttyACM0", 0x1A86, 0x7523)]);
        assert!(hits.is_empty());
    }

    #[test]
    fn test_filter_rejects_non_usb_paths() {
        let hits = filter_ports(vec![
            usb_port("/dev/ttyS0", FIRMWARE_USB_ID.0, FIRMWARE_USB_ID.1),
            plain_port("/dev/ttyACM3"),
        ]);
        assert!(hits.is_empty());
    }
}
