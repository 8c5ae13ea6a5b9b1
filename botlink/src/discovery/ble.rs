//! BLE scan for controller discovery.
//!
//! BLE scanning is a timed listen: start the scan, accumulate advertisements
//! for the whole window, stop, then collect the deduplicated peripheral set.
//! The set is sorted by transport-native peripheral id so repeated scans with
//! the same hardware produce the same ordering.
//!
//! On a platform without a working BLE stack (no adapter, or no backend at
//! all) the scan yields an empty result rather than failing; absence of BLE
//! is a normal condition for this library.

use std::time::Duration;

use btleplug::api::{BDAddr, Central, Manager as _, Peripheral as _, ScanFilter};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use log::{debug, warn};
use tokio::time::sleep;

use crate::error::{Error, Result};

/// A BLE peripheral observed during the scan window.
#[derive(Clone)]
pub struct BleScanHit {
    /// Adapter the peripheral was seen on.
    pub adapter: Adapter,
    /// Live peripheral handle.
    pub peripheral: Peripheral,
    /// Transport-native id (dedup and ordering key).
    pub peripheral_id: PeripheralId,
    /// Advertised address.
    pub address: BDAddr,
    /// Advertised local name, if any.
    pub name: Option<String>,
}

/// Listen for advertisements for `timeout`, then return the accumulated set.
pub async fn scan(timeout: Duration) -> Result<Vec<BleScanHit>> {
    let manager = match Manager::new().await {
        Ok(manager) => manager,
        Err(e) => {
            warn!("no BLE backend available: {e}");
            return Ok(Vec::new());
        }
    };
    let adapters = manager.adapters().await.map_err(Error::BleConnect)?;
    let Some(adapter) = adapters.into_iter().next() else {
        debug!("no BLE adapter present, skipping BLE scan");
        return Ok(Vec::new());
    };

    adapter
        .start_scan(ScanFilter::default())
        .await
        .map_err(Error::BleConnect)?;
    sleep(timeout).await;
    let stop_result = adapter.stop_scan().await;

    let peripherals = adapter.peripherals().await.map_err(Error::BleConnect)?;
    let mut hits = Vec::with_capacity(peripherals.len());
    for peripheral in peripherals {
        let peripheral_id = peripheral.id();
        let (address, name) = match peripheral.properties().await {
            Ok(Some(props)) => (props.address, props.local_name),
            Ok(None) => (peripheral.address(), None),
            Err(e) => {
                debug!("dropping peripheral {peripheral_id}: properties failed: {e}");
                continue;
            }
        };
        debug!("discovered peripheral {peripheral_id} ({address})");
        hits.push(BleScanHit {
            adapter: adapter.clone(),
            peripheral,
            peripheral_id,
            address,
            name,
        });
    }

    // Transport-native id order gives reproducible listings across runs.
    hits.sort_by(|a, b| {
        a.peripheral_id
            .to_string()
            .cmp(&b.peripheral_id.to_string())
    });

    stop_result.map_err(Error::BleConnect)?;
    Ok(hits)
}
