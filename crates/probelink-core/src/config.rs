//! 应用配置和持久化
//!
//! 提供适配器、扫描窗口和 GATT 时序等设置的存储和读取。

use crate::ble::scanner::ScanConfig;
use crate::ble::session::SessionConfig;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// 应用设置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// 使用第几个蓝牙适配器
    pub adapter_index: usize,
    /// 扫描窗口（秒）
    pub scan_window_secs: u64,
    /// 保活写入间隔（秒）
    pub keep_alive_secs: u64,
    /// 服务发现后 GATT 操作之间的间隔（毫秒）
    pub gatt_step_delay_ms: u64,
    pub target_mtu: u16,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            adapter_index: 0,
            scan_window_secs: 10,
            keep_alive_secs: 5,
            gatt_step_delay_ms: 200,
            target_mtu: 256,
        }
    }
}

impl Settings {
    /// 获取配置文件路径
    pub fn config_path() -> PathBuf {
        let config_dir = dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("probelink");
        config_dir.join("settings.toml")
    }

    /// 加载设置（如果文件不存在则使用默认值）
    pub fn load() -> Self {
        Self::load_from(&Self::config_path())
    }

    pub fn load_from(path: &Path) -> Self {
        if path.exists() {
            match fs::read_to_string(path) {
                Ok(content) => match toml::from_str(&content) {
                    Ok(settings) => {
                        debug!("Loaded settings from {:?}", path);
                        return settings;
                    }
                    Err(e) => {
                        warn!("Failed to parse settings: {}, using defaults", e);
                    }
                },
                Err(e) => {
                    warn!("Failed to read settings file: {}, using defaults", e);
                }
            }
        }
        Self::default()
    }

    /// 保存设置
    pub fn save(&self) -> anyhow::Result<()> {
        self.save_to(&Self::config_path())
    }

    pub fn save_to(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        fs::write(path, content)?;
        debug!("Saved settings to {:?}", path);
        Ok(())
    }

    pub fn scan_config(&self) -> ScanConfig {
        ScanConfig {
            window: Duration::from_secs(self.scan_window_secs),
        }
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            keep_alive_interval: Duration::from_secs(self.keep_alive_secs),
            step_delay: Duration::from_millis(self.gatt_step_delay_ms),
            target_mtu: self.target_mtu,
        }
    }
}
