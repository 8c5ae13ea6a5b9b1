//! Concurrent BLE + USB discovery with a single merged candidate list.
//!
//! Both transport scans run concurrently and the merge happens only after
//! both branches have reported. A failed branch contributes no candidates
//! but does not discard the other branch's results; its error is surfaced
//! alongside the merged list so callers can treat partial discovery as
//! non-fatal.

pub mod ble;
pub mod usb;

use std::time::Duration;

use log::{debug, warn};

use crate::device::{DeviceCandidate, IdAllocator};
use crate::error::Error;

/// Outcome of one aggregate scan.
#[derive(Debug)]
pub struct ScanReport {
    /// Merged candidate list: BLE results first, then USB, each branch in
    /// its own deterministic order.
    pub candidates: Vec<DeviceCandidate>,
    /// First branch failure, if any branch failed.
    pub partial_failure: Option<Error>,
}

/// Run both transport scans concurrently and merge the results.
///
/// `timeout` bounds the BLE listen window; USB enumeration is a single
/// synchronous query and does not wait on it. Candidate ids are drawn from
/// `ids` in merge order.
pub async fn scan(timeout: Duration, ids: &IdAllocator) -> ScanReport {
    let (ble_result, usb_result) = tokio::join!(ble::scan(timeout), async { usb::scan() });

    let mut candidates = Vec::new();
    let mut partial_failure = None;

    match ble_result {
        Ok(hits) => {
            for hit in hits {
                let name = hit
                    .name
                    .unwrap_or_else(|| hit.address.to_string());
                candidates.push(DeviceCandidate::ble(
                    ids.next_id(),
                    name,
                    hit.adapter,
                    hit.peripheral,
                    hit.peripheral_id,
                    hit.address,
                ));
            }
        }
        Err(e) => {
            warn!("BLE scan failed: {e}");
            partial_failure = Some(e);
        }
    }

    match usb_result {
        Ok(hits) => {
            for hit in hits {
                candidates.push(DeviceCandidate::usb(
                    ids.next_id(),
                    hit.port_name,
                    hit.vid,
                    hit.pid,
                    hit.mode,
                ));
            }
        }
        Err(e) => {
            warn!("USB scan failed: {e}");
            partial_failure.get_or_insert(e);
        }
    }

    debug!("scan finished with {} candidate(s)", candidates.len());
    ScanReport {
        candidates,
        partial_failure,
    }
}
