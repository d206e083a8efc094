//! 平台 BLE 能力抽象
//!
//! 扫描器和 GATT 会话只依赖这里的 trait，生产环境由 btleplug 实现
//! （见 [`crate::ble::client`] 和 [`crate::ble::scanner::BtleplugScanBackend`]），
//! 测试中使用内存实现。

use crate::ble::advertising::AdvertisingRecords;
use crate::ble::characteristic::GattTarget;
use crate::ble::BleError;
use tokio::sync::mpsc;
use uuid::Uuid;

/// 一次扫描结果
#[derive(Debug, Clone)]
pub struct ScanResult {
    /// 广播中的设备名称
    pub device_name: Option<String>,
    pub address: String,
    pub rssi: Option<i16>,
    pub records: AdvertisingRecords,
}

/// 扫描后端推送的事件
#[derive(Debug)]
pub enum AdvertisementEvent {
    Result(ScanResult),
    Failed(BleError),
}

#[async_trait::async_trait]
pub trait ScanBackend: Send + Sync + 'static {
    /// 开始扫描，返回扫描结果流
    async fn start(&self) -> Result<mpsc::UnboundedReceiver<AdvertisementEvent>, BleError>;

    async fn stop(&self) -> Result<(), BleError>;
}

/// 特征写入方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    WithResponse,
    WithoutResponse,
}

/// 连接上由平台异步推送的事件
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    Disconnected,
    Notification {
        service: Uuid,
        characteristic: Uuid,
        value: Vec<u8>,
    },
}

/// 单个设备的 GATT 连接
///
/// 每个方法对应一次平台 GATT 操作，返回时操作已完成。
/// 调用方负责串行化，同一连接上不会有并发的操作。
#[async_trait::async_trait]
pub trait GattLink: Send + Sync + 'static {
    /// 设备名称，未知时为地址
    fn device_name(&self) -> String;

    async fn connect(&self) -> Result<(), BleError>;

    async fn discover_services(&self) -> Result<(), BleError>;

    /// 请求更大的 MTU，返回协商结果
    async fn request_mtu(&self, mtu: u16) -> Result<u16, BleError>;

    async fn read(&self, target: GattTarget) -> Result<Vec<u8>, BleError>;

    async fn write(&self, target: GattTarget, value: &[u8], mode: WriteMode)
    -> Result<(), BleError>;

    /// 启用通知：打开本地通知并向 CCCD 写入 `01 00`
    async fn subscribe(&self, target: GattTarget) -> Result<(), BleError>;

    /// 请求断开，完成后平台推送 [`LinkEvent::Disconnected`]
    async fn disconnect(&self) -> Result<(), BleError>;

    /// 无条件释放连接资源，不等待对端确认
    async fn close(&self);
}

/// 可以按地址打开 GATT 连接的适配器
#[async_trait::async_trait]
pub trait BleAdapter: Send + Sync + 'static {
    type Link: GattLink;

    /// 把地址解析为设备并准备连接（尚未发起连接）
    async fn open(
        &self,
        address: &str,
    ) -> Result<(Self::Link, mpsc::UnboundedReceiver<LinkEvent>), BleError>;
}
