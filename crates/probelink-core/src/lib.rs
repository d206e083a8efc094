//! Probelink Core Library
//!
//! 无线超声探头的 BLE 控制核心库：发现探头、读取广播状态、通过 GATT 控制电源和 Wi-Fi
//!
//! # 模块
//!
//! - **ble**: 广播解析、扫描、GATT 会话和 btleplug 平台实现
//! - **wifi**: Wi-Fi Published / Wi-Fi Request 文本编解码
//! - **probe**: 探头状态模型和按名称去重的集合
//! - **config**: 持久化设置
//!
//! # 使用示例
//!
//! ## 扫描探头
//!
//! ```ignore
//! use probelink_core::{BtleplugScanBackend, DeviceScanner, ScanConfig, ScanEvent};
//!
//! let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<ScanEvent>();
//! let backend = BtleplugScanBackend::new(0).await?;
//! let scanner = DeviceScanner::new(backend, Arc::new(tx), ScanConfig::default());
//! scanner.start_scan().await;
//!
//! while let Some(event) = rx.recv().await {
//!     // NewProbe / Finished ...
//! }
//! ```
//!
//! ## 控制探头
//!
//! ```ignore
//! use probelink_core::{BtleplugAdapter, GattSession, SessionConfig, SessionEvent};
//!
//! let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<SessionEvent>();
//! let session = GattSession::new(BtleplugAdapter::new(0).await?, Arc::new(tx), SessionConfig::default());
//! session.connect("AA:BB:CC:DD:EE:FF").await?;
//!
//! // 等待 Ready 后再发送请求
//! session.power_on(true).await?;
//! ```

pub mod ble;
pub mod config;
pub mod probe;
pub mod wifi;

// BLE re-exports
pub use ble::{
    AdvertisingRecords, BleAdapter, BleError, BtleplugAdapter, BtleplugScanBackend,
    DeviceScanner, GattSession, ProbeCharacteristic, ProbeStatus, ScanConfig, ScanEvent,
    ScanListener, ScanResult, SessionConfig, SessionEvent, SessionListener, SessionState,
};

// Config re-exports
pub use config::Settings;

// Probe re-exports
pub use probe::{Probe, ProbeRegistry};

// WiFi re-exports
pub use wifi::{WifiInfo, WifiRequest};
