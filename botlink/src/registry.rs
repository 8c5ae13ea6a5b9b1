//! Device registry: candidate list plus the single active session.
//!
//! The registry is an explicit owned-state object, not a process-wide
//! global. It holds the candidates from the most recent scan and at most one
//! open [`Session`], and routes every caller operation to that session. The
//! single-active-device invariant is enforced here: opening a new device
//! always closes the prior one first.

use std::time::Duration;

use log::{debug, info};

use crate::device::{
    CandidateDetail, DeviceCandidate, DeviceSummary, IdAllocator, SelectBy,
};
use crate::discovery;
use crate::error::{Error, Result};
use crate::flash::FirmwareEngine;
use crate::transport::{BleSession, EventHandler, EventKind, Session, UsbSession};

/// Scan window used when the caller has no opinion.
pub const DEFAULT_SCAN_TIMEOUT: Duration = Duration::from_secs(1);

/// Candidate list and single active session.
#[derive(Default)]
pub struct DeviceRegistry {
    candidates: Vec<DeviceCandidate>,
    selected: Option<u32>,
    active: Option<Session>,
    ids: IdAllocator,
}

impl DeviceRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Refresh the candidate list by running both transport scans.
    ///
    /// The previous list is replaced wholesale, so previously issued
    /// candidate ids are only meaningful if they reappear. On a partial
    /// scan failure the surviving branch's candidates are still installed
    /// and the branch error is returned; callers may treat it as non-fatal.
    pub async fn scan(&mut self, timeout: Duration) -> Result<()> {
        let report = discovery::scan(timeout, &self.ids).await;
        info!("scan found {} candidate(s)", report.candidates.len());
        self.candidates = report.candidates;
        self.selected = None;
        match report.partial_failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Read-only summaries of the current candidates.
    pub fn list(&self) -> Vec<DeviceSummary> {
        self.candidates.iter().map(DeviceCandidate::summary).collect()
    }

    /// Pick the candidate subsequent `open` calls will target.
    pub fn select(&mut self, by: &SelectBy) -> Result<()> {
        match self.candidates.iter().find(|c| by.matches(c)) {
            Some(candidate) => {
                debug!("selected candidate {} ({})", candidate.id, candidate.display_name);
                self.selected = Some(candidate.id);
                Ok(())
            }
            None => Err(Error::UnknownDevice(by.describe())),
        }
    }

    /// Open a session to the selected candidate.
    ///
    /// Any currently open session is closed first, which keeps the
    /// single-active-device invariant even under rapid re-selection. On an
    /// open failure no session is retained.
    pub async fn open(&mut self) -> Result<()> {
        self.close().await?;

        let id = self
            .selected
            .ok_or_else(|| Error::UnknownDevice("nothing selected".to_string()))?;
        let candidate = self
            .candidates
            .iter()
            .find(|c| c.id == id)
            .ok_or_else(|| Error::UnknownDevice(format!("id: {id}")))?;

        let mut session = build_session(candidate);
        match session.open().await {
            Ok(()) => {
                self.active = Some(session);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Close the active session, if any.
    pub async fn close(&mut self) -> Result<()> {
        match self.active.take() {
            Some(mut session) => session.close().await,
            None => Ok(()),
        }
    }

    /// Write a byte buffer to the open device.
    pub async fn write(&mut self, data: &[u8]) -> Result<()> {
        let session = self.active.as_mut().ok_or(Error::NoDevice)?;
        session.write(data).await
    }

    /// Subscribe a handler to an event stream of the open device.
    pub async fn subscribe(&mut self, kind: EventKind, handler: EventHandler) -> Result<()> {
        let session = self.active.as_mut().ok_or(Error::NoDevice)?;
        session.subscribe(kind, handler).await
    }

    /// Reset the open device into bootloader mode.
    pub async fn reset_to_bootloader(&mut self) -> Result<()> {
        let session = self.active.as_mut().ok_or(Error::NoDevice)?;
        session.reset_to_bootloader().await
    }

    /// Provision firmware onto the open device.
    ///
    /// Resets into bootloader mode, reopens the transport for upload, runs
    /// the engine, and closes the transport regardless of the engine's
    /// outcome. The first failure wins.
    pub async fn provision<E: FirmwareEngine>(
        &mut self,
        engine: &mut E,
        image: &[u8],
        progress: &mut (dyn FnMut(usize, usize) + Send),
    ) -> Result<()> {
        self.reset_to_bootloader().await?;

        let session = self.active.as_mut().ok_or(Error::NoDevice)?;
        session.open_for_upload().await?;
        info!("starting firmware upload ({} bytes)", image.len());
        let upload_result = engine.upload(session, image, progress).await;

        let close_result = session.close().await;
        upload_result.and(close_result)
    }

    /// Whether a session is currently open.
    pub fn is_open(&self) -> bool {
        self.active.is_some()
    }

    #[cfg(test)]
    pub(crate) fn seed_candidates(&mut self, candidates: Vec<DeviceCandidate>) {
        self.candidates = candidates;
        self.selected = None;
    }
}

fn build_session(candidate: &DeviceCandidate) -> Session {
    match &candidate.detail {
        CandidateDetail::Ble {
            adapter,
            peripheral,
            peripheral_id,
            address,
        } => Session::Ble(BleSession::new(
            adapter.clone(),
            peripheral.clone(),
            peripheral_id.clone(),
            *address,
        )),
        CandidateDetail::Usb {
            port_name, mode, ..
        } => Session::Usb(UsbSession::new(port_name.clone(), *mode)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{TransportKind, UsbMode, BOOTLOADER_USB_ID, FIRMWARE_USB_ID};

    fn seeded_registry() -> DeviceRegistry {
        let _ = env_logger::builder().is_test(true).try_init();
        let mut registry = DeviceRegistry::new();
        registry.seed_candidates(vec![
            DeviceCandidate::usb(
                0,
                "/dev/ttyACM0".to_string(),
                FIRMWARE_USB_ID.0,
                FIRMWARE_USB_ID.1,
                UsbMode::Firmware,
            ),
            DeviceCandidate::usb(
                1,
                "/dev/ttyACM1".to_string(),
                BOOTLOADER_USB_ID.0,
                BOOTLOADER_USB_ID.1,
                UsbMode::Bootloader,
            ),
        ]);
        registry
    }

    #[test]
    fn test_list_returns_tagged_summaries() {
        let registry = seeded_registry();
        let summaries = registry.list();
        assert_eq!(summaries.len(), 2);
        assert_eq!(summaries[0].transport, TransportKind::Usb);
        assert_eq!(summaries[0].mode, Some(UsbMode::Firmware));
        assert_eq!(summaries[1].mode, Some(UsbMode::Bootloader));
        // Repeated listings are stable.
        assert_eq!(registry.list(), summaries);
    }

    #[test]
    fn test_select_by_id_and_name() {
        let mut registry = seeded_registry();
        registry.select(&SelectBy::Id(1)).unwrap();
        registry
            .select(&SelectBy::Name("/dev/ttyACM0".to_string()))
            .unwrap();
    }

    #[test]
    fn test_select_unknown_candidate() {
        let mut registry = seeded_registry();
        let err = registry.select(&SelectBy::Id(99)).unwrap_err();
        assert!(matches!(err, Error::UnknownDevice(_)));
        assert_eq!(err.code(), 0x01);

        let err = registry
            .select(&SelectBy::Name("/dev/ttyACM9".to_string()))
            .unwrap_err();
        assert!(matches!(err, Error::UnknownDevice(_)));
    }

    #[tokio::test]
    async fn test_operations_without_open_device() {
        let mut registry = seeded_registry();

        let err = registry.write(b"ping").await.unwrap_err();
        assert!(matches!(err, Error::NoDevice));

        let err = registry
            .subscribe(EventKind::Data, Box::new(|_| {}))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NoDevice));

        let err = registry.reset_to_bootloader().await.unwrap_err();
        assert!(matches!(err, Error::NoDevice));
    }

    #[tokio::test]
    async fn test_close_without_open_device_is_success() {
        let mut registry = DeviceRegistry::new();
        registry.close().await.unwrap();
        registry.close().await.unwrap();
        assert!(!registry.is_open());
    }

    #[tokio::test]
    async fn test_open_without_selection() {
        let mut registry = seeded_registry();
        let err = registry.open().await.unwrap_err();
        assert!(matches!(err, Error::UnknownDevice(_)));
        assert!(!registry.is_open());
    }
}
