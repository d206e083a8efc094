use uuid::Uuid;

/// BLE 层错误
///
/// 会话内部的任何传输错误都会关闭整个会话，调用方决定是否重连。
#[derive(Debug, thiserror::Error)]
pub enum BleError {
    #[error("No Bluetooth adapters found")]
    NoAdapter,

    #[error("Invalid BLE address: {0:?}")]
    InvalidAddress(String),

    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Session is not ready")]
    NotReady,

    #[error("No active connection")]
    NotConnected,

    #[error("Service not found: {0}")]
    ServiceNotFound(Uuid),

    #[error("Characteristic not found: {0}")]
    CharacteristicNotFound(Uuid),

    #[error("Not supported by this backend: {0}")]
    Unsupported(&'static str),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Bluetooth error: {0}")]
    Btleplug(#[from] btleplug::Error),
}
