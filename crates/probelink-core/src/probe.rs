//! 探头模型
//!
//! 每个设备名称对应一个 [`Probe`]，由扫描结果和 GATT 通知原地更新。

use crate::ble::advertising::{Availability, ChargingStatus, ListenPolicy, ProbeStatus};
use crate::ble::platform::ScanResult;
use crate::ble::scanner::PROBE_NAME_PREFIX;
use log::debug;
use std::collections::BTreeMap;
use std::fmt;

/// 从广播名称中取出序列号
///
/// ```
/// use probelink_core::probe::serial_from_device_name;
///
/// assert_eq!(serial_from_device_name("CUS-1234"), Some("1234"));
/// assert_eq!(serial_from_device_name("Speaker"), None);
/// ```
pub fn serial_from_device_name(name: &str) -> Option<&str> {
    name.strip_prefix(PROBE_NAME_PREFIX)
}

/// 已知探头的最新状态
///
/// 状态字段在第一次收到之前都是 `None`。
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Probe {
    pub device_name: String,
    pub ble_address: Option<String>,
    pub rssi: Option<i16>,
    pub battery: Option<u8>,
    pub temperature: Option<u8>,
    pub availability: Option<Availability>,
    pub listen_policy: Option<ListenPolicy>,
    pub charging_status: Option<ChargingStatus>,
    pub powered: Option<bool>,
}

impl Probe {
    pub fn new(device_name: impl Into<String>) -> Self {
        Self {
            device_name: device_name.into(),
            ..Default::default()
        }
    }

    pub fn serial(&self) -> &str {
        serial_from_device_name(&self.device_name).unwrap_or(&self.device_name)
    }

    /// 用一次扫描结果更新地址、信号强度和广播状态
    pub fn update_from_scan(&mut self, result: &ScanResult) {
        self.ble_address = Some(result.address.clone());
        if result.rssi.is_some() {
            self.rssi = result.rssi;
        }
        if let Some(status) = ProbeStatus::from_records(&result.records) {
            self.update_status(&status);
        }
    }

    pub fn update_status(&mut self, status: &ProbeStatus) {
        self.battery = Some(status.battery);
        self.temperature = Some(status.temperature);
        self.availability = Some(status.availability);
        self.listen_policy = Some(status.listen_policy);
        self.charging_status = Some(status.charging_status);
        self.powered = Some(status.powered);
    }

    /// Power Published 通知
    pub fn update_powered(&mut self, powered: bool) {
        self.powered = Some(powered);
    }
}

impl fmt::Display for Probe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn or_dash<T: fmt::Display>(value: Option<T>) -> String {
            value.map_or_else(|| "-".to_string(), |v| v.to_string())
        }

        write!(
            f,
            "{} [{}] rssi: {} batt: {}% temp: {} avail: {} listen: {} charging: {} on: {}",
            self.device_name,
            self.ble_address.as_deref().unwrap_or("-"),
            or_dash(self.rssi),
            or_dash(self.battery),
            or_dash(self.temperature),
            or_dash(self.availability.map(|a| a.name())),
            or_dash(self.listen_policy.map(|p| p.name())),
            or_dash(self.charging_status.map(|c| c.name())),
            or_dash(self.powered),
        )
    }
}

/// 按名称排序的探头集合
///
/// 拥有者在每次新的扫描开始时调用 [`ProbeRegistry::clear`]。
#[derive(Debug, Default)]
pub struct ProbeRegistry {
    probes: BTreeMap<String, Probe>,
}

impl ProbeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 记录一次扫描结果，返回该名称是否第一次出现
    pub fn observe(&mut self, device_name: &str, result: &ScanResult) -> bool {
        let mut created = false;
        let probe = self
            .probes
            .entry(device_name.to_string())
            .or_insert_with(|| {
                created = true;
                Probe::new(device_name)
            });
        probe.update_from_scan(result);
        if created {
            debug!("New probe in registry: {}", device_name);
        }
        created
    }

    pub fn get(&self, device_name: &str) -> Option<&Probe> {
        self.probes.get(device_name)
    }

    pub fn get_mut(&mut self, device_name: &str) -> Option<&mut Probe> {
        self.probes.get_mut(device_name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Probe> {
        self.probes.values()
    }

    pub fn len(&self) -> usize {
        self.probes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.probes.is_empty()
    }

    pub fn clear(&mut self) {
        self.probes.clear();
    }
}
