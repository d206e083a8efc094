//! 探头 GATT 特征目录
//!
//! 每个逻辑特征对应固定的 (service, characteristic) UUID 对。
//! Power Published / Power Request 共用一个服务，读写分离在两个特征上；
//! Wi-Fi Published / Wi-Fi Request 同理。

use std::fmt;
use uuid::Uuid;

/// Client Characteristic Configuration Descriptor
pub const CCCD_UUID: Uuid = Uuid::from_u128(0x00002902_0000_1000_8000_00805f9b34fb);

/// 写入 CCCD 以启用通知的值
pub const ENABLE_NOTIFICATION_VALUE: [u8; 2] = [0x01, 0x00];

/// 标准 Immediate Alert 服务
pub const ALERT_SERVICE_UUID: Uuid = Uuid::from_u128(0x00001802_0000_1000_8000_00805f9b34fb);
pub const ALERT_LEVEL_CHAR_UUID: Uuid = Uuid::from_u128(0x00002a06_0000_1000_8000_00805f9b34fb);

pub const WIFI_SERVICE_UUID: Uuid = Uuid::from_u128(0xf9eb3fae_947a_4e5b_ab7c_c799e91ed780);
pub const WIFI_PUBLISHED_CHAR_UUID: Uuid = Uuid::from_u128(0xf9eb3fae_947a_4e5b_ab7c_c799e91ed781);
pub const WIFI_REQUEST_CHAR_UUID: Uuid = Uuid::from_u128(0xf9eb3fae_947a_4e5b_ab7c_c799e91ed782);

pub const POWER_SERVICE_UUID: Uuid = Uuid::from_u128(0x8c853b6a_2297_44c1_8277_73627c8d2abc);
pub const POWER_PUBLISHED_CHAR_UUID: Uuid = Uuid::from_u128(0x8c853b6a_2297_44c1_8277_73627c8d2abd);
pub const POWER_REQUEST_CHAR_UUID: Uuid = Uuid::from_u128(0x8c853b6a_2297_44c1_8277_73627c8d2abe);

/// 一个 GATT 特征的完整地址
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GattTarget {
    pub service: Uuid,
    pub characteristic: Uuid,
}

impl GattTarget {
    pub const fn new(service: Uuid, characteristic: Uuid) -> Self {
        Self {
            service,
            characteristic,
        }
    }
}

/// 探头协议中的逻辑特征
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProbeCharacteristic {
    Alert,
    WifiPublished,
    WifiRequest,
    PowerPublished,
    PowerRequest,
}

impl ProbeCharacteristic {
    pub const ALL: [ProbeCharacteristic; 5] = [
        ProbeCharacteristic::Alert,
        ProbeCharacteristic::WifiPublished,
        ProbeCharacteristic::WifiRequest,
        ProbeCharacteristic::PowerPublished,
        ProbeCharacteristic::PowerRequest,
    ];

    pub const fn target(self) -> GattTarget {
        match self {
            ProbeCharacteristic::Alert => {
                GattTarget::new(ALERT_SERVICE_UUID, ALERT_LEVEL_CHAR_UUID)
            }
            ProbeCharacteristic::WifiPublished => {
                GattTarget::new(WIFI_SERVICE_UUID, WIFI_PUBLISHED_CHAR_UUID)
            }
            ProbeCharacteristic::WifiRequest => {
                GattTarget::new(WIFI_SERVICE_UUID, WIFI_REQUEST_CHAR_UUID)
            }
            ProbeCharacteristic::PowerPublished => {
                GattTarget::new(POWER_SERVICE_UUID, POWER_PUBLISHED_CHAR_UUID)
            }
            ProbeCharacteristic::PowerRequest => {
                GattTarget::new(POWER_SERVICE_UUID, POWER_REQUEST_CHAR_UUID)
            }
        }
    }

    /// 根据服务和特征 UUID 反查逻辑特征，两者都必须匹配
    pub fn identify(service: Uuid, characteristic: Uuid) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|c| c.target() == GattTarget::new(service, characteristic))
    }

    pub fn name(self) -> &'static str {
        match self {
            ProbeCharacteristic::Alert => "Alert",
            ProbeCharacteristic::WifiPublished => "WiFiPublished",
            ProbeCharacteristic::WifiRequest => "WiFiRequest",
            ProbeCharacteristic::PowerPublished => "PowerPublished",
            ProbeCharacteristic::PowerRequest => "PowerRequest",
        }
    }
}

impl fmt::Display for ProbeCharacteristic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
