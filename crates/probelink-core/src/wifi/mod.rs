//! 探头 Wi-Fi 信息编解码
//!
//! Wi-Fi Published 特征的内容是一段扁平的 YAML 文本，例如：
//!
//! ```text
//! state: connected
//! ssid: DIRECT-CUS-1234
//! pw: secret
//! ip4: 192.168.1.1
//! ctl: 5828
//! mac: 00:11:22:33:44:55
//! ```
//!
//! 写入 Wi-Fi Request 特征时使用同样的格式。

use crate::ble::BleError;
use log::{debug, warn};
use serde_yaml::{Mapping, Value};
use std::fmt;

/// 探头未提供 IP 时使用的地址
pub const DEFAULT_IP_ADDRESS: &str = "192.168.1.1";
/// 探头未提供控制端口时使用的端口
pub const DEFAULT_PORT: u16 = 5000;

const DISABLED: &str = "disabled";

/// 探头当前的 Wi-Fi 网络信息
///
/// 网络禁用时所有字段都为 `None`；否则 ssid / passphrase 至少是空字符串，
/// ip 和 port 至少是默认值。
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WifiInfo {
    pub ssid: Option<String>,
    pub passphrase: Option<String>,
    pub ip: Option<String>,
    pub port: Option<u16>,
    pub mac: Option<String>,
}

impl WifiInfo {
    /// 解析 Wi-Fi Published 特征的文本内容，不会失败
    ///
    /// 无法解析的内容（例如探头尚未启动完成时的 `N/A`）按没有可用网络处理。
    pub fn decode(payload: &str) -> Self {
        let map = match serde_yaml::from_str::<Value>(payload) {
            Ok(Value::Mapping(map)) => map,
            Ok(other) => {
                warn!("Wi-Fi payload is not a key/value map: {:?}", other);
                return Self::default();
            }
            Err(e) => {
                warn!("Failed to parse Wi-Fi payload: {}", e);
                return Self::default();
            }
        };

        let disabled = ["status", "state"]
            .iter()
            .any(|key| text(&map, key).as_deref() == Some(DISABLED));
        if disabled {
            debug!("Probe Wi-Fi is disabled");
            return Self::default();
        }

        let ip = text(&map, "ip4")
            .or_else(|| text(&map, "ip6"))
            .unwrap_or_else(|| DEFAULT_IP_ADDRESS.to_string());

        Self {
            ssid: Some(text(&map, "ssid").unwrap_or_default()),
            passphrase: Some(text(&map, "pw").unwrap_or_default()),
            ip: Some(ip),
            port: Some(port(&map, "ctl").unwrap_or(DEFAULT_PORT)),
            mac: text(&map, "mac"),
        }
    }

    /// 字节形式的特征值，非 UTF-8 字节按替换字符处理
    pub fn decode_bytes(payload: &[u8]) -> Self {
        Self::decode(&String::from_utf8_lossy(payload))
    }

    /// 探头是否有可用网络
    pub fn is_enabled(&self) -> bool {
        self.ip.is_some()
    }
}

impl fmt::Display for WifiInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn show<T: fmt::Display>(v: &Option<T>) -> String {
            v.as_ref()
                .map(|v| v.to_string())
                .unwrap_or_else(|| "null".to_string())
        }
        writeln!(f, "SSID: {}", show(&self.ssid))?;
        writeln!(f, "passphrase: {}", show(&self.passphrase))?;
        writeln!(f, "IP: {}", show(&self.ip))?;
        writeln!(f, "TCP port: {}", show(&self.port))?;
        write!(f, "Mac: {}", show(&self.mac))
    }
}

fn text(map: &Mapping, key: &str) -> Option<String> {
    match map.get(key)? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn port(map: &Mapping, key: &str) -> Option<u16> {
    match map.get(key)? {
        Value::Number(n) => n.as_u64().and_then(|p| u16::try_from(p).ok()),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// 写入 Wi-Fi Request 特征的网络切换请求
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WifiRequest {
    /// 加入外部网络（路由器）
    Join {
        ssid: String,
        passphrase: Option<String>,
    },
    /// 切换回探头自身的热点
    AccessPoint,
}

impl WifiRequest {
    pub fn join(ssid: impl Into<String>, passphrase: Option<String>) -> Self {
        WifiRequest::Join {
            ssid: ssid.into(),
            passphrase,
        }
    }

    pub fn encode(&self) -> Result<String, BleError> {
        match self {
            WifiRequest::Join { ssid, passphrase } => {
                if ssid.is_empty() {
                    return Err(BleError::InvalidRequest("SSID must not be empty".into()));
                }
                let mut map = Mapping::new();
                map.insert("ap".into(), Value::Bool(false));
                map.insert("ssid".into(), Value::String(ssid.clone()));
                if let Some(pw) = passphrase.as_deref().filter(|pw| !pw.is_empty()) {
                    map.insert("pw".into(), Value::String(pw.to_string()));
                }
                serde_yaml::to_string(&map)
                    .map_err(|e| BleError::InvalidRequest(format!("Unencodable request: {}", e)))
            }
            WifiRequest::AccessPoint => Ok("ap: true\nch: auto\n".to_string()),
        }
    }
}
