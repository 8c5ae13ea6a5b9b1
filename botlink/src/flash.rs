//! Boundary with the firmware-upload protocol engine.
//!
//! The engine that actually streams an image to the bootloader lives
//! outside this crate. This module pins down the seam: the engine receives
//! an already-open, already-in-bootloader-mode [`Session`] plus the raw
//! image bytes, reports per-chunk progress, and returns one final result.
//! The registry's provisioning flow guarantees the transport is closed
//! afterwards regardless of the engine's outcome.

use futures::future::BoxFuture;

use crate::error::Result;
use crate::transport::Session;

/// Firmware-upload protocol engine.
///
/// Implementations stream `image` over `transport` and call `progress` with
/// `(bytes_sent, bytes_total)` as chunks go out. The transport handed in is
/// open and in bootloader mode; the engine must not close it.
pub trait FirmwareEngine {
    /// Stream a firmware image to the device.
    fn upload<'a>(
        &'a mut self,
        transport: &'a mut Session,
        image: &'a [u8],
        progress: &'a mut (dyn FnMut(usize, usize) + Send),
    ) -> BoxFuture<'a, Result<()>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::UsbMode;
    use crate::transport::UsbSession;

    struct CountingEngine {
        uploads: usize,
    }

    impl FirmwareEngine for CountingEngine {
        fn upload<'a>(
            &'a mut self,
            _transport: &'a mut Session,
            image: &'a [u8],
            progress: &'a mut (dyn FnMut(usize, usize) + Send),
        ) -> BoxFuture<'a, Result<()>> {
            Box::pin(async move {
                self.uploads += 1;
                progress(image.len(), image.len());
                Ok(())
            })
        }
    }

    #[tokio::test]
    async fn test_engine_seam_drives_progress() {
        let mut engine = CountingEngine { uploads: 0 };
        let mut session = Session::Usb(UsbSession::new(
            "/dev/ttyACM0".to_string(),
            UsbMode::Bootloader,
        ));
        let mut reported = Vec::new();

        engine
            .upload(&mut session, &[0u8; 256], &mut |sent, total| {
                reported.push((sent, total));
            })
            .await
            .unwrap();

        assert_eq!(engine.uploads, 1);
        assert_eq!(reported, vec![(256, 256)]);
    }
}
