//! BLE Scanner - 发现探头
//!
//! 扫描在固定时间窗口后自动停止以节省电量。
//!
//! # 设备识别
//!
//! 探头通过广播名称识别：名称以 `CUS-` 开头，后缀是序列号。
//! 同一扫描窗口内按名称去重，每个名称只通知一次。
//! 调用方从原始扫描结果中自行解析 RSSI 和 [`ProbeStatus`](crate::ble::ProbeStatus)。

use log::{debug, error, info, trace};

use crate::ble::advertising::{AdvertisingRecords, FIELD_COMPLETE_LOCAL_NAME};
use crate::ble::client;
use crate::ble::platform::{AdvertisementEvent, ScanBackend, ScanResult};
use crate::ble::BleError;
use btleplug::api::{Central, CentralEvent, Peripheral as _, ScanFilter};
use btleplug::platform::{Adapter, PeripheralId};
use futures_util::StreamExt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// 探头广播名称前缀
pub const PROBE_NAME_PREFIX: &str = "CUS-";

pub const DEFAULT_SCAN_WINDOW: Duration = Duration::from_secs(10);

/// 扫描回调接口
pub trait ScanListener: Send + Sync {
    fn started(&self);
    fn new_probe(&self, device_name: &str, result: &ScanResult);
    fn failed(&self, error: &BleError);
    fn finished(&self, found: &[String]);
}

/// [`ScanListener`] 回调的消息形式
#[derive(Debug, Clone)]
pub enum ScanEvent {
    Started,
    NewProbe {
        device_name: String,
        result: ScanResult,
    },
    Failed(String),
    Finished(Vec<String>),
}

/// 把扫描回调转发到通道
impl ScanListener for mpsc::UnboundedSender<ScanEvent> {
    fn started(&self) {
        let _ = self.send(ScanEvent::Started);
    }

    fn new_probe(&self, device_name: &str, result: &ScanResult) {
        let _ = self.send(ScanEvent::NewProbe {
            device_name: device_name.to_string(),
            result: result.clone(),
        });
    }

    fn failed(&self, error: &BleError) {
        let _ = self.send(ScanEvent::Failed(error.to_string()));
    }

    fn finished(&self, found: &[String]) {
        let _ = self.send(ScanEvent::Finished(found.to_vec()));
    }
}

#[derive(Debug, Clone)]
pub struct ScanConfig {
    /// 扫描自动停止前的时长
    pub window: Duration,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            window: DEFAULT_SCAN_WINDOW,
        }
    }
}

/// 有时间窗口的探头扫描器
///
/// `start_scan` / `stop_scan` 都是幂等的，可以从任意任务并发调用。
pub struct DeviceScanner<B: ScanBackend> {
    inner: Arc<ScannerInner<B>>,
}

struct ScannerInner<B> {
    backend: B,
    listener: Arc<dyn ScanListener>,
    config: ScanConfig,
    scanning: AtomicBool,
    /// 每次开始扫描加一，过期的定时器和结果流据此失效
    generation: AtomicU64,
    /// 串行化后端的 start/stop 调用
    transition: tokio::sync::Mutex<()>,
    found: Mutex<Vec<String>>,
}

impl<B: ScanBackend> DeviceScanner<B> {
    pub fn new(backend: B, listener: Arc<dyn ScanListener>, config: ScanConfig) -> Self {
        Self {
            inner: Arc::new(ScannerInner {
                backend,
                listener,
                config,
                scanning: AtomicBool::new(false),
                generation: AtomicU64::new(0),
                transition: tokio::sync::Mutex::new(()),
                found: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn is_scanning(&self) -> bool {
        self.inner.scanning.load(Ordering::SeqCst)
    }

    /// 本次扫描窗口内已发现的探头名称
    pub fn found(&self) -> Vec<String> {
        self.inner.found_snapshot()
    }

    /// 开始扫描
    ///
    /// 已在扫描时直接返回 `false`。后端启动失败时通过 `failed` 回调汇报，不重试。
    pub async fn start_scan(&self) -> bool {
        let inner = &self.inner;
        // 标志只在持有 transition 时翻转，与定时器和手动停止互斥
        let _guard = inner.transition.lock().await;
        if inner
            .scanning
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("Scan already running");
            return false;
        }

        let generation = inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        inner.lock_found().clear();

        let events = match inner.backend.start().await {
            Ok(events) => events,
            Err(e) => {
                error!("Failed to start scan: {}", e);
                inner.scanning.store(false, Ordering::SeqCst);
                inner.listener.failed(&e);
                return false;
            }
        };

        inner.listener.started();
        info!(
            "Scan started for {} seconds",
            inner.config.window.as_secs_f32()
        );

        tokio::spawn(ScannerInner::pump(inner.clone(), generation, events));

        let timer = inner.clone();
        tokio::spawn(async move {
            tokio::time::sleep(timer.config.window).await;
            timer.stop(Some(generation)).await;
        });

        true
    }

    /// 停止扫描并汇报本次发现的探头，未在扫描时什么也不做
    pub async fn stop_scan(&self) {
        self.inner.stop(None).await;
    }
}

impl<B: ScanBackend> ScannerInner<B> {
    fn lock_found(&self) -> std::sync::MutexGuard<'_, Vec<String>> {
        self.found.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn found_snapshot(&self) -> Vec<String> {
        self.lock_found().clone()
    }

    fn is_current(&self, generation: u64) -> bool {
        self.scanning.load(Ordering::SeqCst) && self.generation.load(Ordering::SeqCst) == generation
    }

    /// `expected` 为定时器持有的扫描代数；不匹配说明该扫描已经结束
    async fn stop(&self, expected: Option<u64>) {
        let _guard = self.transition.lock().await;
        if let Some(generation) = expected {
            if self.generation.load(Ordering::SeqCst) != generation {
                trace!("Stale scan timer for generation {}", generation);
                return;
            }
        }
        if self
            .scanning
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }

        let found = self.found_snapshot();
        debug!("Scan finished, found {} probe(s)", found.len());
        if let Err(e) = self.backend.stop().await {
            error!("Failed to stop scan: {}", e);
        }
        self.listener.finished(&found);
    }

    async fn pump(
        inner: Arc<Self>,
        generation: u64,
        mut events: mpsc::UnboundedReceiver<AdvertisementEvent>,
    ) {
        while let Some(event) = events.recv().await {
            if !inner.is_current(generation) {
                break;
            }
            match event {
                AdvertisementEvent::Result(result) => inner.handle_result(&result),
                AdvertisementEvent::Failed(e) => {
                    inner.fail(generation, e).await;
                    break;
                }
            }
        }
        trace!("Scan event stream for generation {} closed", generation);
    }

    fn handle_result(&self, result: &ScanResult) {
        let Some(name) = result.device_name.as_deref() else {
            return;
        };
        if !name.starts_with(PROBE_NAME_PREFIX) {
            return;
        }
        if self.add_if_missing(name) {
            info!(
                "Found probe: {} with address: {}, rssi={:?}",
                name, result.address, result.rssi
            );
            self.listener.new_probe(name, result);
        }
    }

    fn add_if_missing(&self, name: &str) -> bool {
        let mut found = self.lock_found();
        if found.iter().any(|n| n == name) {
            false
        } else {
            found.push(name.to_string());
            true
        }
    }

    async fn fail(&self, generation: u64, error: BleError) {
        let _guard = self.transition.lock().await;
        if self.generation.load(Ordering::SeqCst) != generation {
            return;
        }
        if self
            .scanning
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            error!("Scan failed: {}", error);
            self.listener.failed(&error);
        }
    }
}

/// 基于 btleplug 的扫描后端
pub struct BtleplugScanBackend {
    adapter: Adapter,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl BtleplugScanBackend {
    pub async fn new(adapter_index: usize) -> Result<Self, BleError> {
        let adapter = client::find_adapter(adapter_index).await?;
        Ok(Self::with_adapter(adapter))
    }

    pub fn with_adapter(adapter: Adapter) -> Self {
        Self {
            adapter,
            task: Mutex::new(None),
        }
    }

    fn replace_task(&self, task: Option<JoinHandle<()>>) {
        let mut slot = self.task.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(old) = std::mem::replace(&mut *slot, task) {
            old.abort();
        }
    }
}

#[async_trait::async_trait]
impl ScanBackend for BtleplugScanBackend {
    async fn start(&self) -> Result<mpsc::UnboundedReceiver<AdvertisementEvent>, BleError> {
        let mut events = self.adapter.events().await?;
        self.adapter.start_scan(ScanFilter::default()).await?;

        let (tx, rx) = mpsc::unbounded_channel();
        let adapter = self.adapter.clone();
        let task = tokio::spawn(async move {
            while let Some(event) = events.next().await {
                let id = match event {
                    CentralEvent::DeviceDiscovered(id)
                    | CentralEvent::DeviceUpdated(id)
                    | CentralEvent::ManufacturerDataAdvertisement { id, .. } => id,
                    _ => continue,
                };
                match scan_result(&adapter, &id).await {
                    Ok(Some(result)) => {
                        if tx.send(AdvertisementEvent::Result(result)).is_err() {
                            break;
                        }
                    }
                    Ok(None) => {}
                    Err(e) => trace!("Skipping peripheral {:?}: {}", id, e),
                }
            }
        });
        self.replace_task(Some(task));

        Ok(rx)
    }

    async fn stop(&self) -> Result<(), BleError> {
        self.replace_task(None);
        self.adapter.stop_scan().await?;
        Ok(())
    }
}

async fn scan_result(adapter: &Adapter, id: &PeripheralId) -> Result<Option<ScanResult>, BleError> {
    let peripheral = adapter.peripheral(id).await?;
    let Some(props) = peripheral.properties().await? else {
        return Ok(None);
    };

    let mut records = AdvertisingRecords::from_manufacturer_data(&props.manufacturer_data);
    if let Some(name) = &props.local_name {
        records.insert(FIELD_COMPLETE_LOCAL_NAME, name.as_bytes().to_vec());
    }

    Ok(Some(ScanResult {
        device_name: props.local_name,
        address: props.address.to_string(),
        rssi: props.rssi,
        records,
    }))
}
