//! USB serial transport session.
//!
//! The controller enumerates as a CDC serial device. The baud rate is
//! nominal: there is no physical UART between host and target, so 57600 is
//! kept only because the firmware's stack expects it. Port closure is
//! caller-driven; the one asynchronous edge is a failed write, which this
//! session treats as link loss.
//!
//! Entering the bootloader uses the touch-1200 convention: open the port at
//! 1200 baud and close it, which makes the firmware jump into its
//! bootloader. The bootloader re-enumerates as a *different* serial device,
//! so the sequence is a bounded polling loop over the port list rather than
//! a single call.

use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use log::{debug, info, warn};
use serialport::SerialPortType;
use tokio::time::sleep;

use crate::device::{classify_usb_id, UsbMode};
use crate::error::{Error, Result};
use crate::transport::{DeviceEvent, EventHandler, EventKind};

/// Baud rate for normal payload I/O.
pub const NORMAL_BAUD: u32 = 57_600;

/// Baud rate whose open/close cycle triggers the bootloader jump.
pub const TOUCH_BAUD: u32 = 1200;

/// Read timeout for the port; keeps the reader thread responsive to stop
/// requests.
const READ_TIMEOUT: Duration = Duration::from_millis(50);

/// Maximum polling attempts while waiting for the bootloader to enumerate.
pub const BOOTLOADER_POLL_ATTEMPTS: u32 = 50;

/// Delay between bootloader polling attempts.
pub const BOOTLOADER_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Settle delay after the bootloader device appears. Some platforms need a
/// beat before the fresh device file is reliably openable.
pub const BOOTLOADER_SETTLE: Duration = Duration::from_millis(100);

struct Reader {
    stop: Arc<AtomicBool>,
    handle: thread::JoinHandle<()>,
}

/// An owned connection to one USB serial port.
pub struct UsbSession {
    port_name: String,
    mode: UsbMode,
    port: Option<Box<dyn serialport::SerialPort>>,
    reader: Option<Reader>,
    disconnect_handler: Option<EventHandler>,
}

impl UsbSession {
    /// Create a closed session for a discovered port.
    pub fn new(port_name: String, mode: UsbMode) -> Self {
        Self {
            port_name,
            mode,
            port: None,
            reader: None,
            disconnect_handler: None,
        }
    }

    /// Current target device file path.
    ///
    /// Changes when a bootloader reset adopts the re-enumerated device.
    pub fn port_name(&self) -> &str {
        &self.port_name
    }

    /// Mode the target is currently known to be in.
    pub fn mode(&self) -> UsbMode {
        self.mode
    }

    /// Whether the port is currently open.
    pub fn is_open(&self) -> bool {
        self.port.is_some()
    }

    /// Open the port for normal I/O. Idempotent when already open.
    ///
    /// A target sitting in bootloader mode is a caller error, distinct from
    /// a transport failure: normal I/O makes no sense there.
    pub fn open(&mut self) -> Result<()> {
        if self.mode == UsbMode::Bootloader {
            return Err(Error::UsbUnexpectedBootloader);
        }
        self.open_raw()
    }

    /// Open the port without the bootloader-mode check.
    ///
    /// Used by the provisioning flow, which opens the re-enumerated
    /// bootloader device on purpose.
    pub fn open_raw(&mut self) -> Result<()> {
        if self.port.is_some() {
            debug!("open usb: already open");
            return Ok(());
        }
        debug!("open usb: {}", self.port_name);
        let port = serialport::new(&self.port_name, NORMAL_BAUD)
            .timeout(READ_TIMEOUT)
            .open()
            .map_err(Error::UsbOpen)?;
        self.port = Some(port);
        Ok(())
    }

    /// Close the port. Idempotent when already closed.
    pub fn close(&mut self) -> Result<()> {
        self.stop_reader();
        self.disconnect_handler = None;
        let Some(mut port) = self.port.take() else {
            debug!("close usb: already closed");
            return Ok(());
        };
        let flushed = port.flush();
        drop(port);
        flushed.map_err(Error::UsbClose)
    }

    /// Write a byte buffer to the port.
    ///
    /// A failed write is treated as link loss: the port is closed before the
    /// error is reported, so subsequent calls see a clean closed state
    /// instead of a half-open handle.
    pub fn write(&mut self, data: &[u8]) -> Result<()> {
        let Some(port) = self.port.as_mut() else {
            return Err(Error::NoDevice);
        };
        match port.write_all(data).and_then(|()| port.flush()) {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!("usb write failed, closing port: {e}");
                self.stop_reader();
                self.port = None;
                if let Some(mut handler) = self.disconnect_handler.take() {
                    handler(DeviceEvent::Disconnected);
                }
                Err(Error::UsbWrite(e))
            }
        }
    }

    /// Subscribe a handler to an event stream.
    ///
    /// `Data` spawns a reader thread over a cloned port handle; `Disconnect`
    /// installs the handler invoked if a write fails and drops the link.
    pub fn subscribe(&mut self, kind: EventKind, handler: EventHandler) -> Result<()> {
        match kind {
            EventKind::Disconnect => {
                self.disconnect_handler = Some(handler);
                Ok(())
            }
            EventKind::Data => {
                let Some(port) = self.port.as_ref() else {
                    return Err(Error::NoDevice);
                };
                let reader_port = port.try_clone().map_err(Error::UsbOpen)?;
                self.stop_reader();
                let stop = Arc::new(AtomicBool::new(false));
                let stop_flag = Arc::clone(&stop);
                let handle = thread::spawn(move || read_loop(reader_port, handler, &stop_flag));
                self.reader = Some(Reader { stop, handle });
                Ok(())
            }
        }
    }

    fn stop_reader(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.stop.store(true, Ordering::Relaxed);
            // The thread wakes within READ_TIMEOUT.
            let _ = reader.handle.join();
        }
    }

    /// Reset the target into bootloader mode (touch-1200).
    ///
    /// Short-circuits if a bootloader device is already present from a prior
    /// attempt. Otherwise performs the 1200-baud open/close touch and polls
    /// the port list up to [`BOOTLOADER_POLL_ATTEMPTS`] times for the
    /// bootloader identity. On success the session adopts the re-enumerated
    /// device path as its new target.
    pub async fn reset_to_bootloader(&mut self) -> Result<()> {
        if let Some(path) = find_bootloader_port()? {
            self.switch_to_bootloader_target(path)?;
            sleep(BOOTLOADER_SETTLE).await;
            return Ok(());
        }

        // The touch needs exclusive access to the device file.
        self.close()?;
        self.touch()?;

        let path = wait_for_bootloader(
            find_bootloader_port,
            BOOTLOADER_POLL_ATTEMPTS,
            BOOTLOADER_POLL_INTERVAL,
        )
        .await?;
        self.switch_to_bootloader_target(path)?;
        sleep(BOOTLOADER_SETTLE).await;
        Ok(())
    }

    /// Retarget the session at the bootloader's device file.
    ///
    /// Anything still open on the old firmware path is closed first, so a
    /// later open never reuses a handle to the wrong device.
    fn switch_to_bootloader_target(&mut self, path: String) -> Result<()> {
        self.close()?;
        self.adopt_bootloader_path(path);
        Ok(())
    }

    /// Open at 1200 baud and close again.
    ///
    /// The device reboots mid-transaction, so an open error of the
    /// device-vanished class is expected and tolerated; the polling loop
    /// will time out if the jump actually failed. Any other error is fatal
    /// to the reset attempt.
    fn touch(&self) -> Result<()> {
        debug!("touch1200: {}", self.port_name);
        match serialport::new(&self.port_name, TOUCH_BAUD).open() {
            Ok(mut port) => {
                let flushed = port.flush();
                drop(port);
                flushed.map_err(Error::UsbClose)
            }
            Err(e) if is_vanished(&e) => {
                debug!("touch1200: device vanished during touch: {e}");
                Ok(())
            }
            Err(e) => Err(Error::UsbOpen(e)),
        }
    }

    fn adopt_bootloader_path(&mut self, path: String) {
        info!("switching target from {} to {}", self.port_name, path);
        self.port_name = path;
        self.mode = UsbMode::Bootloader;
    }
}

fn read_loop(
    mut port: Box<dyn serialport::SerialPort>,
    mut handler: EventHandler,
    stop: &AtomicBool,
) {
    let mut buf = [0u8; 64];
    while !stop.load(Ordering::Relaxed) {
        match port.read(&mut buf) {
            Ok(0) => {}
            Ok(n) => handler(DeviceEvent::Data(buf[..n].to_vec())),
            Err(e) if e.kind() == io::ErrorKind::TimedOut => {}
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => {
                debug!("usb read loop ended: {e}");
                break;
            }
        }
    }
}

/// Whether an open error means the device legitimately disappeared while
/// rebooting.
fn is_vanished(err: &serialport::Error) -> bool {
    matches!(
        err.kind(),
        serialport::ErrorKind::NoDevice | serialport::ErrorKind::Io(_)
    )
}

/// Look for a port enumerated with the bootloader identity.
fn find_bootloader_port() -> Result<Option<String>> {
    let ports = serialport::available_ports().map_err(Error::UsbList)?;
    Ok(ports.into_iter().find_map(|info| {
        let SerialPortType::UsbPort(usb) = info.port_type else {
            return None;
        };
        (classify_usb_id(usb.vid, usb.pid) == Some(UsbMode::Bootloader))
            .then_some(info.port_name)
    }))
}

/// Poll `find` up to `attempts` times, `interval` apart, for the bootloader
/// device path.
///
/// Terminates after exactly `attempts` probes when nothing appears; never an
/// unbounded loop.
async fn wait_for_bootloader<F>(mut find: F, attempts: u32, interval: Duration) -> Result<String>
where
    F: FnMut() -> Result<Option<String>>,
{
    for attempt in 1..=attempts {
        sleep(interval).await;
        if let Some(path) = find()? {
            debug!("bootloader appeared after {attempt} attempt(s)");
            return Ok(path);
        }
    }
    Err(Error::UsbNoBootloader)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_close_is_idempotent_without_transport_call() {
        let mut session = UsbSession::new("/dev/ttyACM0".to_string(), UsbMode::Firmware);
        assert!(session.close().is_ok());
        assert!(session.close().is_ok());
        assert!(!session.is_open());
    }

    #[test]
    fn test_open_refuses_bootloader_mode() {
        let mut session = UsbSession::new("/dev/ttyACM0".to_string(), UsbMode::Bootloader);
        let err = session.open().unwrap_err();
        assert!(matches!(err, Error::UsbUnexpectedBootloader));
        assert!(!session.is_open());
    }

    #[test]
    fn test_write_without_open_port() {
        let mut session = UsbSession::new("/dev/ttyACM0".to_string(), UsbMode::Firmware);
        let err = session.write(b"hello").unwrap_err();
        assert!(matches!(err, Error::NoDevice));
    }

    #[test]
    fn test_data_subscribe_without_open_port() {
        let mut session = UsbSession::new("/dev/ttyACM0".to_string(), UsbMode::Firmware);
        let err = session
            .subscribe(EventKind::Data, Box::new(|_| {}))
            .unwrap_err();
        assert!(matches!(err, Error::NoDevice));
    }

    #[cfg(unix)]
    #[test]
    fn test_bootloader_adoption_closes_stale_port() {
        let (master, _slave) = serialport::TTYPort::pair().unwrap();
        let mut session = UsbSession::new("/dev/ttyACM0".to_string(), UsbMode::Firmware);
        session.port = Some(Box::new(master));
        assert!(session.is_open());

        session
            .switch_to_bootloader_target("/dev/ttyACM7".to_string())
            .unwrap();

        // The old firmware-path handle must not survive the retarget; a
        // later open has to hit the bootloader's device file.
        assert!(!session.is_open());
        assert_eq!(session.port_name(), "/dev/ttyACM7");
        assert_eq!(session.mode(), UsbMode::Bootloader);
    }

    #[test]
    fn test_bootloader_adoption_on_closed_session() {
        let mut session = UsbSession::new("/dev/ttyACM0".to_string(), UsbMode::Firmware);
        session
            .switch_to_bootloader_target("/dev/ttyACM7".to_string())
            .unwrap();
        assert!(!session.is_open());
        assert_eq!(session.port_name(), "/dev/ttyACM7");
        assert_eq!(session.mode(), UsbMode::Bootloader);
    }

    #[test]
    fn test_vanished_error_classification() {
        let vanished = serialport::Error::new(serialport::ErrorKind::NoDevice, "gone");
        assert!(is_vanished(&vanished));

        let io_err = serialport::Error::new(
            serialport::ErrorKind::Io(io::ErrorKind::BrokenPipe),
            "pipe",
        );
        assert!(is_vanished(&io_err));

        let other = serialport::Error::new(serialport::ErrorKind::InvalidInput, "bad");
        assert!(!is_vanished(&other));
    }

    #[tokio::test(start_paused = true)]
    async fn test_bootloader_poll_exhausts_after_attempt_ceiling() {
        let mut calls = 0u32;
        let result = wait_for_bootloader(
            || {
                calls += 1;
                Ok(None)
            },
            BOOTLOADER_POLL_ATTEMPTS,
            BOOTLOADER_POLL_INTERVAL,
        )
        .await;

        assert!(matches!(result, Err(Error::UsbNoBootloader)));
        assert_eq!(calls, BOOTLOADER_POLL_ATTEMPTS);
    }

    #[tokio::test(start_paused = true)]
    async fn test_bootloader_poll_stops_on_first_match() {
        let mut calls = 0u32;
        let path = wait_for_bootloader(
            || {
                calls += 1;
                if calls == 3 {
                    Ok(Some("/dev/ttyACM7".to_string()))
                } else {
                    Ok(None)
                }
            },
            BOOTLOADER_POLL_ATTEMPTS,
            BOOTLOADER_POLL_INTERVAL,
        )
        .await
        .unwrap();

        assert_eq!(path, "/dev/ttyACM7");
        assert_eq!(calls, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_bootloader_poll_propagates_list_failure() {
        let result = wait_for_bootloader(
            || {
                Err(Error::UsbList(serialport::Error::new(
                    serialport::ErrorKind::Unknown,
                    "enumeration failed",
                )))
            },
            BOOTLOADER_POLL_ATTEMPTS,
            BOOTLOADER_POLL_INTERVAL,
        )
        .await;

        assert!(matches!(result, Err(Error::UsbList(_))));
    }
}
