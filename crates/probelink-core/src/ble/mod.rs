pub mod advertising;
pub mod characteristic;
pub mod client;
mod error;
pub mod platform;
pub mod scanner;
pub mod session;

#[cfg(test)]
pub(crate) mod mock;

pub use advertising::{
    AdvertisingRecords, Availability, ChargingStatus, ListenPolicy, ProbeStatus, VENDOR_ID,
};
pub use characteristic::{GattTarget, ProbeCharacteristic};
pub use client::{BtleplugAdapter, BtleplugLink};
pub use error::BleError;
pub use platform::{
    AdvertisementEvent, BleAdapter, GattLink, LinkEvent, ScanBackend, ScanResult, WriteMode,
};
pub use scanner::{BtleplugScanBackend, DeviceScanner, ScanConfig, ScanEvent, ScanListener};
pub use session::{GattSession, SessionConfig, SessionEvent, SessionListener, SessionState};
