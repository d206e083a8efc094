//! btleplug 平台后端
//!
//! 把 btleplug 的 `Adapter` / `Peripheral` 包装成 [`BleAdapter`] / [`GattLink`]。
//!
//! 与 Android GATT 的差异：
//! - btleplug 不支持 MTU 请求，`request_mtu` 返回 [`BleError::Unsupported`]
//! - `subscribe` 由 btleplug 内部写 CCCD
//! - 通知只携带特征 UUID，服务 UUID 从已发现的特征中反查

use crate::ble::characteristic::GattTarget;
use crate::ble::platform::{BleAdapter, GattLink, LinkEvent, WriteMode};
use crate::ble::BleError;
use btleplug::api::{
    BDAddr, Central, CentralEvent, CharPropFlags, Characteristic, Manager as _, Peripheral as _,
    WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral as PlatformPeripheral};
use futures_util::StreamExt;
use log::{debug, info, trace, warn};
use std::sync::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

/// 按序号获取本机蓝牙适配器
pub async fn find_adapter(index: usize) -> Result<Adapter, BleError> {
    let manager = Manager::new().await?;
    let adapters = manager.adapters().await?;
    debug!("Found {} Bluetooth adapter(s)", adapters.len());
    adapters.into_iter().nth(index).ok_or(BleError::NoAdapter)
}

pub struct BtleplugAdapter {
    adapter: Adapter,
}

impl BtleplugAdapter {
    pub async fn new(adapter_index: usize) -> Result<Self, BleError> {
        Ok(Self::with_adapter(find_adapter(adapter_index).await?))
    }

    pub fn with_adapter(adapter: Adapter) -> Self {
        Self { adapter }
    }

    pub fn adapter(&self) -> &Adapter {
        &self.adapter
    }

    async fn find_device(&self, address: BDAddr) -> Result<PlatformPeripheral, BleError> {
        let peripherals = self.adapter.peripherals().await?;

        for peripheral in peripherals {
            if let Some(props) = peripheral.properties().await? {
                if props.address == address {
                    return Ok(peripheral);
                }
            }
        }

        Err(BleError::DeviceNotFound(address.to_string()))
    }
}

#[async_trait::async_trait]
impl BleAdapter for BtleplugAdapter {
    type Link = BtleplugLink;

    async fn open(
        &self,
        address: &str,
    ) -> Result<(BtleplugLink, mpsc::UnboundedReceiver<LinkEvent>), BleError> {
        let bd_addr: BDAddr = address
            .trim()
            .parse()
            .map_err(|_| BleError::InvalidAddress(address.to_string()))?;
        let peripheral = self.find_device(bd_addr).await?;

        let name = peripheral
            .properties()
            .await?
            .and_then(|p| p.local_name)
            .unwrap_or_else(|| bd_addr.to_string());

        let (tx, rx) = mpsc::unbounded_channel();
        let link = BtleplugLink {
            peripheral,
            name,
            events: tx,
            tasks: Mutex::new(Vec::new()),
        };
        link.watch_disconnect(&self.adapter).await?;

        Ok((link, rx))
    }
}

/// 一个 btleplug 外设上的 GATT 连接
pub struct BtleplugLink {
    peripheral: PlatformPeripheral,
    name: String,
    events: mpsc::UnboundedSender<LinkEvent>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl BtleplugLink {
    fn track(&self, task: JoinHandle<()>) {
        self.tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(task);
    }

    async fn watch_disconnect(&self, adapter: &Adapter) -> Result<(), BleError> {
        let mut central_events = adapter.events().await?;
        let id = self.peripheral.id();
        let tx = self.events.clone();

        self.track(tokio::spawn(async move {
            while let Some(event) = central_events.next().await {
                if let CentralEvent::DeviceDisconnected(gone) = event {
                    if gone == id {
                        let _ = tx.send(LinkEvent::Disconnected);
                        break;
                    }
                }
            }
        }));
        Ok(())
    }

    async fn forward_notifications(&self) -> Result<(), BleError> {
        let mut notifications = self.peripheral.notifications().await?;
        let peripheral = self.peripheral.clone();
        let tx = self.events.clone();

        self.track(tokio::spawn(async move {
            while let Some(n) = notifications.next().await {
                let service = peripheral
                    .characteristics()
                    .iter()
                    .find(|c| c.uuid == n.uuid)
                    .map(|c| c.service_uuid)
                    .unwrap_or_else(Uuid::nil);
                trace!("Notification from {}: {} bytes", n.uuid, n.value.len());
                let event = LinkEvent::Notification {
                    service,
                    characteristic: n.uuid,
                    value: n.value,
                };
                if tx.send(event).is_err() {
                    break;
                }
            }
        }));
        Ok(())
    }

    fn find_characteristic(&self, target: GattTarget) -> Result<Characteristic, BleError> {
        let service = self
            .peripheral
            .services()
            .into_iter()
            .find(|s| s.uuid == target.service)
            .ok_or(BleError::ServiceNotFound(target.service))?;

        service
            .characteristics
            .into_iter()
            .find(|c| c.uuid == target.characteristic)
            .ok_or(BleError::CharacteristicNotFound(target.characteristic))
    }
}

#[async_trait::async_trait]
impl GattLink for BtleplugLink {
    fn device_name(&self) -> String {
        self.name.clone()
    }

    async fn connect(&self) -> Result<(), BleError> {
        info!("Connecting to {}", self.name);
        self.peripheral.connect().await?;
        Ok(())
    }

    async fn discover_services(&self) -> Result<(), BleError> {
        self.peripheral.discover_services().await?;
        debug!(
            "Discovered {} service(s) on {}",
            self.peripheral.services().len(),
            self.name
        );
        self.forward_notifications().await
    }

    async fn request_mtu(&self, _mtu: u16) -> Result<u16, BleError> {
        Err(BleError::Unsupported("MTU negotiation"))
    }

    async fn read(&self, target: GattTarget) -> Result<Vec<u8>, BleError> {
        let characteristic = self.find_characteristic(target)?;
        Ok(self.peripheral.read(&characteristic).await?)
    }

    async fn write(
        &self,
        target: GattTarget,
        value: &[u8],
        mode: WriteMode,
    ) -> Result<(), BleError> {
        let characteristic = self.find_characteristic(target)?;
        let write_type = match mode {
            WriteMode::WithResponse => WriteType::WithResponse,
            WriteMode::WithoutResponse => WriteType::WithoutResponse,
        };
        self.peripheral
            .write(&characteristic, value, write_type)
            .await?;
        Ok(())
    }

    async fn subscribe(&self, target: GattTarget) -> Result<(), BleError> {
        let characteristic = self.find_characteristic(target)?;
        if !characteristic
            .properties
            .intersects(CharPropFlags::NOTIFY | CharPropFlags::INDICATE)
        {
            return Err(BleError::Transport(format!(
                "Characteristic {} does not support notifications",
                target.characteristic
            )));
        }
        self.peripheral.subscribe(&characteristic).await?;
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), BleError> {
        self.peripheral.disconnect().await?;
        Ok(())
    }

    async fn close(&self) {
        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(|e| e.into_inner()));
        for task in tasks {
            task.abort();
        }
        if self.peripheral.is_connected().await.unwrap_or(false) {
            if let Err(e) = self.peripheral.disconnect().await {
                warn!("Failed to release connection to {}: {}", self.name, e);
            }
        }
    }
}
