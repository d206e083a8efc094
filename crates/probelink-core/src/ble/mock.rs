//! 测试用的内存平台实现
//!
//! 所有平台调用和监听器事件都写入同一个日志，便于断言顺序。

use crate::ble::characteristic::{GattTarget, ProbeCharacteristic};
use crate::ble::platform::{
    AdvertisementEvent, BleAdapter, GattLink, LinkEvent, ScanBackend, ScanResult, WriteMode,
};
use crate::ble::scanner::ScanListener;
use crate::ble::session::SessionListener;
use crate::ble::BleError;
use crate::wifi::WifiInfo;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tokio::sync::{Notify, mpsc};

// ============================================================================
// 扫描
// ============================================================================

#[derive(Default)]
struct ScanState {
    tx: Option<mpsc::UnboundedSender<AdvertisementEvent>>,
    starts: usize,
    stops: usize,
    fail_next_start: bool,
    /// 下一次 stop 在该通知到来前不返回
    stop_gate: Option<Arc<Notify>>,
}

#[derive(Clone, Default)]
pub struct MockScanBackend {
    state: Arc<Mutex<ScanState>>,
}

impl MockScanBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn emit(&self, result: ScanResult) {
        if let Some(tx) = &self.state.lock().unwrap().tx {
            let _ = tx.send(AdvertisementEvent::Result(result));
        }
    }

    pub fn fail(&self, error: BleError) {
        if let Some(tx) = &self.state.lock().unwrap().tx {
            let _ = tx.send(AdvertisementEvent::Failed(error));
        }
    }

    pub fn fail_next_start(&self) {
        self.state.lock().unwrap().fail_next_start = true;
    }

    /// 让下一次 `stop` 挂起，直到返回的通知被触发
    pub fn gate_next_stop(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        self.state.lock().unwrap().stop_gate = Some(gate.clone());
        gate
    }

    pub fn start_count(&self) -> usize {
        self.state.lock().unwrap().starts
    }

    pub fn stop_count(&self) -> usize {
        self.state.lock().unwrap().stops
    }
}

#[async_trait::async_trait]
impl ScanBackend for MockScanBackend {
    async fn start(&self) -> Result<mpsc::UnboundedReceiver<AdvertisementEvent>, BleError> {
        let mut state = self.state.lock().unwrap();
        if std::mem::take(&mut state.fail_next_start) {
            return Err(BleError::NoAdapter);
        }
        let (tx, rx) = mpsc::unbounded_channel();
        state.tx = Some(tx);
        state.starts += 1;
        Ok(rx)
    }

    async fn stop(&self) -> Result<(), BleError> {
        let gate = {
            let mut state = self.state.lock().unwrap();
            state.tx = None;
            state.stops += 1;
            state.stop_gate.take()
        };
        if let Some(gate) = gate {
            gate.notified().await;
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingScanListener {
    events: Mutex<Vec<String>>,
}

impl RecordingScanListener {
    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    fn push(&self, event: String) {
        self.events.lock().unwrap().push(event);
    }
}

impl ScanListener for RecordingScanListener {
    fn started(&self) {
        self.push("started".into());
    }

    fn new_probe(&self, device_name: &str, _result: &ScanResult) {
        self.push(format!("new {}", device_name));
    }

    fn failed(&self, error: &BleError) {
        self.push(format!("failed {}", error));
    }

    fn finished(&self, found: &[String]) {
        self.push(format!("finished [{}]", found.join(", ")));
    }
}

// ============================================================================
// GATT
// ============================================================================

#[derive(Default)]
struct LinkState {
    journal: Vec<String>,
    events: Option<mpsc::UnboundedSender<LinkEvent>>,
    /// 会失败的操作，例如 "write Alert"、"subscribe WiFiPublished"、"mtu"
    failing: HashSet<String>,
    values: HashMap<ProbeCharacteristic, Vec<u8>>,
}

/// 测试对模拟平台的控制句柄
#[derive(Clone, Default)]
pub struct MockControl {
    state: Arc<Mutex<LinkState>>,
}

impl MockControl {
    pub fn journal(&self) -> Vec<String> {
        self.state.lock().unwrap().journal.clone()
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.journal()
            .iter()
            .filter(|e| e.starts_with(prefix))
            .count()
    }

    pub fn fail(&self, op: &str) {
        self.state.lock().unwrap().failing.insert(op.to_string());
    }

    pub fn set_value(&self, characteristic: ProbeCharacteristic, value: &[u8]) {
        self.state
            .lock()
            .unwrap()
            .values
            .insert(characteristic, value.to_vec());
    }

    pub fn emit(&self, event: LinkEvent) {
        if let Some(tx) = &self.state.lock().unwrap().events {
            let _ = tx.send(event);
        }
    }

    pub fn notify(&self, characteristic: ProbeCharacteristic, value: &[u8]) {
        let target = characteristic.target();
        self.emit(LinkEvent::Notification {
            service: target.service,
            characteristic: target.characteristic,
            value: value.to_vec(),
        });
    }

    fn record(&self, entry: String) {
        self.state.lock().unwrap().journal.push(entry);
    }

    /// 记录一次操作，如果该操作被设置为失败则返回错误
    fn op(&self, entry: String, key: &str) -> Result<(), BleError> {
        let mut state = self.state.lock().unwrap();
        state.journal.push(entry);
        if state.failing.contains(key) {
            Err(BleError::Transport(format!("{} rejected", key)))
        } else {
            Ok(())
        }
    }
}

fn name_of(target: GattTarget) -> String {
    ProbeCharacteristic::identify(target.service, target.characteristic)
        .map(|c| c.name().to_string())
        .unwrap_or_else(|| target.characteristic.to_string())
}

pub struct MockAdapter {
    control: MockControl,
    known: Vec<String>,
}

impl MockAdapter {
    pub fn new(known: &[&str]) -> Self {
        Self {
            control: MockControl::default(),
            known: known.iter().map(|s| s.to_string()).collect(),
        }
    }

    pub fn control(&self) -> MockControl {
        self.control.clone()
    }
}

#[async_trait::async_trait]
impl BleAdapter for MockAdapter {
    type Link = MockLink;

    async fn open(
        &self,
        address: &str,
    ) -> Result<(MockLink, mpsc::UnboundedReceiver<LinkEvent>), BleError> {
        if !self.known.iter().any(|a| a == address) {
            return Err(BleError::DeviceNotFound(address.to_string()));
        }
        self.control.record(format!("open {}", address));
        let (tx, rx) = mpsc::unbounded_channel();
        self.control.state.lock().unwrap().events = Some(tx);
        let link = MockLink {
            control: self.control.clone(),
            name: format!("CUS-{}", &address[address.len() - 2..]),
        };
        Ok((link, rx))
    }
}

pub struct MockLink {
    control: MockControl,
    name: String,
}

#[async_trait::async_trait]
impl GattLink for MockLink {
    fn device_name(&self) -> String {
        self.name.clone()
    }

    async fn connect(&self) -> Result<(), BleError> {
        self.control.op("connect".into(), "connect")
    }

    async fn discover_services(&self) -> Result<(), BleError> {
        self.control.op("discover".into(), "discover")
    }

    async fn request_mtu(&self, mtu: u16) -> Result<u16, BleError> {
        self.control.op(format!("mtu {}", mtu), "mtu")?;
        Ok(mtu)
    }

    async fn read(&self, target: GattTarget) -> Result<Vec<u8>, BleError> {
        let name = name_of(target);
        self.control.op(format!("read {}", name), &format!("read {}", name))?;
        let state = self.control.state.lock().unwrap();
        let value = ProbeCharacteristic::identify(target.service, target.characteristic)
            .and_then(|c| state.values.get(&c).cloned())
            .unwrap_or_default();
        Ok(value)
    }

    async fn write(
        &self,
        target: GattTarget,
        value: &[u8],
        mode: WriteMode,
    ) -> Result<(), BleError> {
        let name = name_of(target);
        let hex: String = value.iter().map(|b| format!("{:02x}", b)).collect();
        let mode = match mode {
            WriteMode::WithResponse => "ack",
            WriteMode::WithoutResponse => "nr",
        };
        self.control.op(
            format!("write {} {} {}", name, hex, mode),
            &format!("write {}", name),
        )
    }

    async fn subscribe(&self, target: GattTarget) -> Result<(), BleError> {
        let name = name_of(target);
        self.control
            .op(format!("subscribe {}", name), &format!("subscribe {}", name))
    }

    async fn disconnect(&self) -> Result<(), BleError> {
        self.control.op("disconnect".into(), "disconnect")
    }

    async fn close(&self) {
        self.control.record("close".into());
    }
}

/// 把会话事件写入模拟平台的日志
pub struct RecordingSessionListener {
    control: MockControl,
}

impl RecordingSessionListener {
    pub fn new(control: MockControl) -> Self {
        Self { control }
    }
}

impl SessionListener for RecordingSessionListener {
    fn connected(&self, device_name: &str) {
        self.control.record(format!("event connected {}", device_name));
    }

    fn disconnected(&self) {
        self.control.record("event disconnected".into());
    }

    fn ready(&self, device_name: &str) {
        self.control.record(format!("event ready {}", device_name));
    }

    fn power_changed(&self, _device_name: &str, powered: bool) {
        self.control.record(format!("event power {}", powered));
    }

    fn wifi_changed(&self, _device_name: &str, wifi: &WifiInfo) {
        self.control.record(format!(
            "event wifi {}",
            wifi.ssid.as_deref().unwrap_or("<none>")
        ));
    }

    fn error(&self, message: &str) {
        self.control.record(format!("event error {}", message));
    }
}
