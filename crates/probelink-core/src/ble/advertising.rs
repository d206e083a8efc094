//! 广播数据解析
//!
//! 探头在厂商数据 (AD type 0xFF) 中广播自身状态：
//!
//! ```text
//! [vendor id: 2][battery: 1][temperature: 1][packed flags: 1][power flags: 1]
//! ```
//!
//! - vendor id 固定为 0x02FB（小端 `FB 02`）
//! - packed flags: bit 0-2 可用性，bit 3-4 监听策略，bit 6-7 充电状态
//! - power flags: bit 0 是否已开机

use log::{debug, trace};
use std::collections::HashMap;
use std::fmt;

/// AD type: Flags
pub const FIELD_FLAGS: u8 = 0x01;
/// AD type: Complete Local Name
pub const FIELD_COMPLETE_LOCAL_NAME: u8 = 0x09;
/// AD type: Manufacturer Specific Data
pub const FIELD_MANUFACTURER_SPECIFIC_DATA: u8 = 0xff;

/// 探头厂商 ID
pub const VENDOR_ID: u16 = 0x02fb;

const STATUS_MIN_LEN: usize = 6;

/// 按 AD type 索引的广播记录
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AdvertisingRecords {
    records: HashMap<u8, Vec<u8>>,
}

impl AdvertisingRecords {
    pub fn new() -> Self {
        Self::default()
    }

    /// 解析原始 LTV 广播字节流
    ///
    /// 每条记录为 `[length][type][data; length - 1]`。遇到长度或类型为 0 的记录时停止；
    /// 截断的记录被丢弃，只保留之前完整的记录。同一类型出现多次时后者覆盖前者。
    pub fn parse(raw: &[u8]) -> Self {
        let mut records = HashMap::new();
        let mut index = 0;

        while index < raw.len() {
            let length = raw[index] as usize;
            if length == 0 {
                break;
            }
            let Some(&ad_type) = raw.get(index + 1) else {
                break;
            };
            if ad_type == 0 {
                break;
            }
            let end = index + 1 + length;
            if end > raw.len() {
                trace!(
                    "Truncated advertising record at offset {}: length={}, available={}",
                    index,
                    length,
                    raw.len() - index - 1
                );
                break;
            }
            records.insert(ad_type, raw[index + 2..end].to_vec());
            index = end;
        }

        Self { records }
    }

    /// 从按公司 ID 分组的厂商数据构造记录表
    ///
    /// 部分平台只提供 `company id -> payload` 的映射，这里重新拼出完整的 0xFF 记录
    /// （公司 ID 小端在前）。存在多个厂商时优先选择探头厂商。
    pub fn from_manufacturer_data(manufacturer_data: &HashMap<u16, Vec<u8>>) -> Self {
        let mut records = HashMap::new();
        let entry = manufacturer_data
            .get_key_value(&VENDOR_ID)
            .or_else(|| manufacturer_data.iter().min_by_key(|(id, _)| **id));

        if let Some((id, payload)) = entry {
            let mut data = Vec::with_capacity(payload.len() + 2);
            data.extend_from_slice(&id.to_le_bytes());
            data.extend_from_slice(payload);
            records.insert(FIELD_MANUFACTURER_SPECIFIC_DATA, data);
        }

        Self { records }
    }

    pub fn insert(&mut self, ad_type: u8, data: Vec<u8>) {
        self.records.insert(ad_type, data);
    }

    pub fn get(&self, ad_type: u8) -> Option<&[u8]> {
        self.records.get(&ad_type).map(Vec::as_slice)
    }

    pub fn manufacturer_data(&self) -> Option<&[u8]> {
        self.get(FIELD_MANUFACTURER_SPECIFIC_DATA)
    }

    pub fn local_name(&self) -> Option<String> {
        self.get(FIELD_COMPLETE_LOCAL_NAME)
            .map(|b| String::from_utf8_lossy(b).into_owned())
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// 把序号映射到枚举值，超出范围时取最后一个值
///
/// 新固件可能会发送更多的枚举值，此时退化为已知的最后一个值而不是解析失败。
fn enum_from_ordinal<T: Copy>(variants: &[T], ordinal: u8) -> T {
    let index = (ordinal as usize).min(variants.len() - 1);
    variants[index]
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Availability {
    Available,
    ListenOnly,
    NotAvailable,
}

impl Availability {
    pub const VARIANTS: [Availability; 3] = [
        Availability::Available,
        Availability::ListenOnly,
        Availability::NotAvailable,
    ];

    pub fn from_ordinal(ordinal: u8) -> Self {
        enum_from_ordinal(&Self::VARIANTS, ordinal)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Availability::Available => "AVAILABLE",
            Availability::ListenOnly => "LISTEN_ONLY",
            Availability::NotAvailable => "NOT_AVAILABLE",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ListenPolicy {
    Disabled,
    Institution,
    Global,
    Research,
}

impl ListenPolicy {
    pub const VARIANTS: [ListenPolicy; 4] = [
        ListenPolicy::Disabled,
        ListenPolicy::Institution,
        ListenPolicy::Global,
        ListenPolicy::Research,
    ];

    pub fn from_ordinal(ordinal: u8) -> Self {
        enum_from_ordinal(&Self::VARIANTS, ordinal)
    }

    pub fn name(&self) -> &'static str {
        match self {
            ListenPolicy::Disabled => "DISABLED",
            ListenPolicy::Institution => "INSTITUTION",
            ListenPolicy::Global => "GLOBAL",
            ListenPolicy::Research => "RESEARCH",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChargingStatus {
    None,
    Pre,
    Fast,
    Done,
}

impl ChargingStatus {
    pub const VARIANTS: [ChargingStatus; 4] = [
        ChargingStatus::None,
        ChargingStatus::Pre,
        ChargingStatus::Fast,
        ChargingStatus::Done,
    ];

    pub fn from_ordinal(ordinal: u8) -> Self {
        enum_from_ordinal(&Self::VARIANTS, ordinal)
    }

    pub fn name(&self) -> &'static str {
        match self {
            ChargingStatus::None => "NONE",
            ChargingStatus::Pre => "PRE",
            ChargingStatus::Fast => "FAST",
            ChargingStatus::Done => "DONE",
        }
    }
}

/// 从广播厂商数据中解析出的探头状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeStatus {
    /// 电量百分比，0-100
    pub battery: u8,
    /// 温度百分比，0-100
    pub temperature: u8,
    pub availability: Availability,
    pub listen_policy: ListenPolicy,
    pub charging_status: ChargingStatus,
    pub powered: bool,
}

impl ProbeStatus {
    /// 从广播记录中查找厂商数据并解析
    ///
    /// 没有厂商数据或数据不属于探头时返回 `None`。
    pub fn from_records(records: &AdvertisingRecords) -> Option<Self> {
        records.manufacturer_data().and_then(Self::parse)
    }

    /// 解析厂商数据记录（包含 2 字节厂商 ID 前缀）
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < STATUS_MIN_LEN {
            debug!("Manufacturer data too short: {} bytes", data.len());
            return None;
        }
        if data[..2] != VENDOR_ID.to_le_bytes() {
            trace!("Foreign vendor id: {:02x}{:02x}", data[1], data[0]);
            return None;
        }

        let packed = data[4];
        Some(Self {
            battery: data[2].min(100),
            temperature: data[3].min(100),
            availability: Availability::from_ordinal(packed & 0x07),
            listen_policy: ListenPolicy::from_ordinal((packed >> 3) & 0x03),
            charging_status: ChargingStatus::from_ordinal((packed >> 6) & 0x03),
            powered: data[5] & 0x01 != 0,
        })
    }

    /// 编码为厂商数据记录，与 [`ProbeStatus::parse`] 互逆
    pub fn to_manufacturer_data(&self) -> [u8; STATUS_MIN_LEN] {
        let [lo, hi] = VENDOR_ID.to_le_bytes();
        let packed = (self.availability as u8 & 0x07)
            | ((self.listen_policy as u8 & 0x03) << 3)
            | ((self.charging_status as u8 & 0x03) << 6);
        [
            lo,
            hi,
            self.battery,
            self.temperature,
            packed,
            self.powered as u8,
        ]
    }
}

impl fmt::Display for ProbeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "batt: {}% temp: {} avail: {} listen: {} charging: {} on: {}",
            self.battery,
            self.temperature,
            self.availability.name(),
            self.listen_policy.name(),
            self.charging_status.name(),
            self.powered
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status_bytes(battery: u8, temperature: u8, packed: u8, power: u8) -> Vec<u8> {
        vec![0xfb, 0x02, battery, temperature, packed, power]
    }

    #[test]
    fn test_parse_valid_status() {
        // availability=1, listen=2, charging=3
        let packed = 0b11_0_10_001;
        let status = ProbeStatus::parse(&status_bytes(87, 30, packed, 0x01)).unwrap();

        assert_eq!(status.battery, 87);
        assert_eq!(status.temperature, 30);
        assert_eq!(status.availability, Availability::ListenOnly);
        assert_eq!(status.listen_policy, ListenPolicy::Global);
        assert_eq!(status.charging_status, ChargingStatus::Done);
        assert!(status.powered);
    }

    #[test]
    fn test_parse_rejects_short_or_foreign() {
        for len in 0..STATUS_MIN_LEN {
            let data = vec![0xfb; len];
            assert_eq!(ProbeStatus::parse(&data), None, "len {}", len);
        }
        assert_eq!(ProbeStatus::parse(&[0x02, 0xfb, 50, 50, 0, 1]), None);
        assert_eq!(ProbeStatus::parse(&[0x4c, 0x00, 50, 50, 0, 1]), None);
    }

    #[test]
    fn test_battery_and_temperature_clamped() {
        for raw in [100u8, 101, 127, 128, 200, 255] {
            let status = ProbeStatus::parse(&status_bytes(raw, raw, 0, 0)).unwrap();
            assert_eq!(status.battery, 100);
            assert_eq!(status.temperature, 100);
        }
    }

    #[test]
    fn test_out_of_range_ordinal_clamps_to_last() {
        // availability 的 3 位可表示 0-7，但只有 3 个已知值
        for ordinal in 3..8u8 {
            let status = ProbeStatus::parse(&status_bytes(10, 10, ordinal, 0)).unwrap();
            assert_eq!(status.availability, Availability::NotAvailable);
        }
    }

    #[test]
    fn test_reserved_bit_and_power_byte() {
        // bit 5 未使用；power 字节只看 bit 0
        let status = ProbeStatus::parse(&status_bytes(10, 10, 0b0010_0000, 0xfe)).unwrap();
        assert_eq!(status.availability, Availability::Available);
        assert_eq!(status.listen_policy, ListenPolicy::Disabled);
        assert_eq!(status.charging_status, ChargingStatus::None);
        assert!(!status.powered);
    }

    #[test]
    fn test_enum_round_trip() {
        for availability in Availability::VARIANTS {
            for listen_policy in ListenPolicy::VARIANTS {
                for charging_status in ChargingStatus::VARIANTS {
                    let status = ProbeStatus {
                        battery: 42,
                        temperature: 17,
                        availability,
                        listen_policy,
                        charging_status,
                        powered: availability == Availability::Available,
                    };
                    let decoded = ProbeStatus::parse(&status.to_manufacturer_data()).unwrap();
                    assert_eq!(decoded, status);
                }
            }
        }
    }

    #[test]
    fn test_parse_ltv_records() {
        let raw = [
            0x02, FIELD_FLAGS, 0x06, // flags
            0x05, FIELD_COMPLETE_LOCAL_NAME, b'C', b'U', b'S', b'-', // name
            0x07, FIELD_MANUFACTURER_SPECIFIC_DATA, 0xfb, 0x02, 55, 20, 0x00, 0x01,
            0x00, 0x00, // padding
        ];
        let records = AdvertisingRecords::parse(&raw);

        assert_eq!(records.len(), 3);
        assert_eq!(records.get(FIELD_FLAGS), Some(&[0x06][..]));
        assert_eq!(records.local_name().as_deref(), Some("CUS-"));

        let status = ProbeStatus::from_records(&records).unwrap();
        assert_eq!(status.battery, 55);
        assert!(status.powered);
    }

    #[test]
    fn test_parse_ltv_stops_at_zero_type() {
        let raw = [0x02, FIELD_FLAGS, 0x06, 0x03, 0x00, 0xaa, 0xbb, 0x02, 0x09, b'X'];
        let records = AdvertisingRecords::parse(&raw);
        assert_eq!(records.len(), 1);
        assert_eq!(records.local_name(), None);
    }

    #[test]
    fn test_parse_ltv_truncated_record() {
        // 第二条记录声明 10 字节但只剩 3 字节
        let raw = [0x02, FIELD_FLAGS, 0x06, 0x0a, FIELD_MANUFACTURER_SPECIFIC_DATA, 0xfb, 0x02];
        let records = AdvertisingRecords::parse(&raw);
        assert_eq!(records.len(), 1);
        assert_eq!(records.manufacturer_data(), None);

        // 长度字节是最后一个字节
        let records = AdvertisingRecords::parse(&[0x02, FIELD_FLAGS, 0x06, 0x05]);
        assert_eq!(records.len(), 1);
    }

    #[test]
    fn test_from_manufacturer_data_prefers_vendor() {
        let mut map = HashMap::new();
        map.insert(0x004c, vec![0x01, 0x02]);
        map.insert(VENDOR_ID, vec![80, 25, 0x00, 0x00]);

        let records = AdvertisingRecords::from_manufacturer_data(&map);
        assert_eq!(
            records.manufacturer_data(),
            Some(&[0xfb, 0x02, 80, 25, 0x00, 0x00][..])
        );
        assert_eq!(ProbeStatus::from_records(&records).unwrap().battery, 80);
    }

    #[test]
    fn test_missing_manufacturer_record() {
        let records = AdvertisingRecords::parse(&[0x02, FIELD_FLAGS, 0x06]);
        assert_eq!(ProbeStatus::from_records(&records), None);
        assert!(AdvertisingRecords::from_manufacturer_data(&HashMap::new()).is_empty());
    }

    #[test]
    fn test_display() {
        let status = ProbeStatus::parse(&status_bytes(90, 12, 0, 1)).unwrap();
        assert_eq!(
            status.to_string(),
            "batt: 90% temp: 12 avail: AVAILABLE listen: DISABLED charging: NONE on: true"
        );
    }
}
