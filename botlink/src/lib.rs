//! # botlink
//!
//! A library for discovering and driving classroom robotics controllers
//! reachable over two physically different transports: Bluetooth Low Energy
//! and USB serial.
//!
//! Callers get one uniform device handle regardless of transport: scan,
//! list, select, open, write bytes, subscribe to the event stream, reset
//! the target into bootloader mode, and close. Whether the channel
//! underneath is a GATT characteristic or a serial port is the library's
//! problem, including the transport-specific bootloader protocols (GPIO
//! reset over BLE, touch-1200 over USB) and the 20-byte write framing BLE
//! requires.
//!
//! ## Example
//!
//! ```rust,no_run
//! use botlink::{DeviceRegistry, SelectBy, DEFAULT_SCAN_TIMEOUT};
//!
//! #[tokio::main]
//! async fn main() -> botlink::Result<()> {
//!     let mut registry = DeviceRegistry::new();
//!     registry.scan(DEFAULT_SCAN_TIMEOUT).await?;
//!
//!     for device in registry.list() {
//!         println!("{}: {}", device.id, device.display_name);
//!     }
//!
//!     registry.select(&SelectBy::Id(0))?;
//!     registry.open().await?;
//!     registry.write(&[0x01, 0x02, 0x03]).await?;
//!     registry.close().await
//! }
//! ```
//!
//! ## Features
//!
//! - `serde`: serialization support for device summaries

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod device;
pub mod discovery;
pub mod error;
pub mod flash;
pub mod registry;
pub mod transport;

// Re-exports for convenience
pub use {
    device::{
        DeviceCandidate, DeviceSummary, SelectBy, TransportKind, UsbMode, BOOTLOADER_USB_ID,
        FIRMWARE_USB_ID,
    },
    discovery::ScanReport,
    error::{Domain, Error, Result},
    flash::FirmwareEngine,
    registry::{DeviceRegistry, DEFAULT_SCAN_TIMEOUT},
    transport::{
        framing::BLE_FRAME_SIZE, BleSession, DeviceEvent, EventHandler, EventKind, Session,
        UsbSession,
    },
};
