//! GATT 会话 - 与单个探头的连接
//!
//! 流程:
//! 1. 连接设备
//! 2. 发现服务
//! 3. 请求更大的 MTU（失败只记录日志）
//! 4. 订阅 Power Published 和 Wi-Fi Published 通知
//! 5. 读取一次 Wi-Fi Published 作为初始快照
//! 6. 进入 Ready，开始保活
//!
//! 每次 GATT 操作之间间隔一小段时间，部分控制器会拒绝连续的操作。
//! 同一连接上的操作严格串行。会话内任何传输错误都会关闭整个会话并触发
//! `error` 回调，是否重连由调用方决定。

use crate::ble::characteristic::ProbeCharacteristic;
use crate::ble::platform::{BleAdapter, GattLink, LinkEvent, WriteMode};
use crate::ble::BleError;
use crate::wifi::{WifiInfo, WifiRequest};
use log::{debug, error, info, warn};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

pub const DEFAULT_KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_STEP_DELAY: Duration = Duration::from_millis(200);
pub const DEFAULT_TARGET_MTU: u16 = 256;

/// 写入 Alert 特征的保活值
const PING_VALUE: u8 = 0x00;
/// Alert Level: Mild Alert
const ALERT_MILD: u8 = 0x01;
/// Alert Level: High Alert
const ALERT_HIGH: u8 = 0x02;

/// 会话回调接口
pub trait SessionListener: Send + Sync {
    fn connected(&self, device_name: &str);
    fn disconnected(&self);
    fn ready(&self, device_name: &str);
    fn power_changed(&self, device_name: &str, powered: bool);
    fn wifi_changed(&self, device_name: &str, wifi: &WifiInfo);
    fn error(&self, message: &str);
}

/// [`SessionListener`] 回调的消息形式
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Connected(String),
    Disconnected,
    Ready(String),
    PowerChanged { device_name: String, powered: bool },
    WifiChanged { device_name: String, wifi: WifiInfo },
    Error(String),
}

impl SessionListener for mpsc::UnboundedSender<SessionEvent> {
    fn connected(&self, device_name: &str) {
        let _ = self.send(SessionEvent::Connected(device_name.to_string()));
    }

    fn disconnected(&self) {
        let _ = self.send(SessionEvent::Disconnected);
    }

    fn ready(&self, device_name: &str) {
        let _ = self.send(SessionEvent::Ready(device_name.to_string()));
    }

    fn power_changed(&self, device_name: &str, powered: bool) {
        let _ = self.send(SessionEvent::PowerChanged {
            device_name: device_name.to_string(),
            powered,
        });
    }

    fn wifi_changed(&self, device_name: &str, wifi: &WifiInfo) {
        let _ = self.send(SessionEvent::WifiChanged {
            device_name: device_name.to_string(),
            wifi: wifi.clone(),
        });
    }

    fn error(&self, message: &str) {
        let _ = self.send(SessionEvent::Error(message.to_string()));
    }
}

/// 会话状态
///
/// 出错或断开后直接回到 `Idle`。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Connecting,
    ServicesDiscovering,
    Ready,
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// 保活写入间隔
    pub keep_alive_interval: Duration,
    /// 服务发现后各个 GATT 操作之间的间隔
    pub step_delay: Duration,
    pub target_mtu: u16,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            keep_alive_interval: DEFAULT_KEEP_ALIVE_INTERVAL,
            step_delay: DEFAULT_STEP_DELAY,
            target_mtu: DEFAULT_TARGET_MTU,
        }
    }
}

struct ActiveSession<L> {
    id: u64,
    link: Arc<L>,
    device_name: String,
    state: SessionState,
    /// 连接已建立且没有请求断开；保活只在此期间运行
    connected: bool,
    /// 调用方已请求断开，连接流程不再继续
    disconnecting: bool,
    /// 串行化该连接上的 GATT 操作
    op_lock: Arc<tokio::sync::Mutex<()>>,
    cancel: CancellationToken,
}

struct Shared<A: BleAdapter> {
    adapter: A,
    listener: Arc<dyn SessionListener>,
    config: SessionConfig,
    active: Mutex<Option<ActiveSession<A::Link>>>,
    next_id: AtomicU64,
}

/// 与单个探头的 GATT 会话
///
/// 同一时间最多只有一个连接，新的 `connect` 会先关闭旧连接。
/// 平台事件和调用方操作可以交错到达，每个后台任务都按会话 ID 检查自己是否过期。
pub struct GattSession<A: BleAdapter> {
    shared: Arc<Shared<A>>,
}

impl<A: BleAdapter> GattSession<A> {
    pub fn new(adapter: A, listener: Arc<dyn SessionListener>, config: SessionConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                adapter,
                listener,
                config,
                active: Mutex::new(None),
                next_id: AtomicU64::new(0),
            }),
        }
    }

    pub fn state(&self) -> SessionState {
        self.shared
            .lock()
            .as_ref()
            .map_or(SessionState::Idle, |s| s.state)
    }

    pub fn device_name(&self) -> Option<String> {
        self.shared.lock().as_ref().map(|s| s.device_name.clone())
    }

    /// 连接到指定地址的探头
    ///
    /// 地址无法解析时返回错误且不影响现有会话；否则先关闭现有会话再发起连接。
    /// 连接结果通过回调汇报。
    pub async fn connect(&self, address: &str) -> Result<(), BleError> {
        if address.trim().is_empty() {
            return Err(BleError::InvalidAddress(address.to_string()));
        }
        let (link, events) = self.shared.adapter.open(address).await?;

        self.shared.close().await;

        let link = Arc::new(link);
        let id = self.shared.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let cancel = CancellationToken::new();
        let device_name = link.device_name();
        info!("Connecting to probe: {}", device_name);

        let previous = self.shared.lock().replace(ActiveSession {
            id,
            link: link.clone(),
            device_name,
            state: SessionState::Connecting,
            connected: false,
            disconnecting: false,
            op_lock: Arc::new(tokio::sync::Mutex::new(())),
            cancel: cancel.clone(),
        });
        // 并发的 connect 可能在 close 之后又装入了一个会话
        if let Some(previous) = previous {
            self.shared.close_session(previous).await;
        }

        tokio::spawn(Shared::drive(self.shared.clone(), id, events, cancel));
        Ok(())
    }

    /// 让探头发出提示音
    pub async fn send_alert(&self, high: bool) -> Result<(), BleError> {
        debug!("Sending alert to probe");
        let level = if high { ALERT_HIGH } else { ALERT_MILD };
        self.request(ProbeCharacteristic::Alert, vec![level], WriteMode::WithoutResponse)
            .await
    }

    /// 开机或关机
    pub async fn power_on(&self, on: bool) -> Result<(), BleError> {
        debug!("Powering probe {}", if on { "on" } else { "off" });
        self.request(
            ProbeCharacteristic::PowerRequest,
            vec![on as u8],
            WriteMode::WithoutResponse,
        )
        .await
    }

    /// 主动读取 Wi-Fi 信息，同时触发 `wifi_changed`
    pub async fn read_wifi_info(&self) -> Result<WifiInfo, BleError> {
        let id = self.shared.ready_id()?;
        debug!("Reading probe's Wi-Fi info");
        let result = self.shared.read_wifi(id).await;
        if let Err(e) = &result {
            self.shared
                .fail(id, format!("Failed to read Wi-Fi info: {}", e))
                .await;
        }
        result
    }

    /// 请求探头切换 Wi-Fi 网络
    pub async fn request_wifi(&self, request: &WifiRequest) -> Result<(), BleError> {
        let payload = request.encode()?;
        match request {
            WifiRequest::Join { ssid, .. } => debug!("Requesting probe to join {:?}", ssid),
            WifiRequest::AccessPoint => debug!("Requesting probe access point mode"),
        }
        self.request(
            ProbeCharacteristic::WifiRequest,
            payload.into_bytes(),
            WriteMode::WithResponse,
        )
        .await
    }

    /// 请求断开
    ///
    /// 会话保持到平台确认断开后才释放。连接流程中途调用时，剩余步骤不再执行，
    /// 也不会触发 `ready`。
    pub async fn disconnect(&self) -> Result<(), BleError> {
        let id = {
            let mut guard = self.shared.lock();
            let session = guard.as_mut().ok_or(BleError::NotConnected)?;
            session.connected = false;
            session.disconnecting = true;
            session.id
        };
        info!("Disconnecting from probe");
        let result = self
            .shared
            .execute(id, |link| async move { link.disconnect().await })
            .await;
        if let Err(e) = &result {
            self.shared
                .fail(id, format!("Failed to disconnect: {}", e))
                .await;
        }
        result
    }

    /// 立即释放连接，不等待对端确认
    pub async fn close(&self) {
        self.shared.close().await;
    }

    async fn request(
        &self,
        characteristic: ProbeCharacteristic,
        value: Vec<u8>,
        mode: WriteMode,
    ) -> Result<(), BleError> {
        let id = self.shared.ready_id()?;
        let target = characteristic.target();
        let result = self
            .shared
            .execute(id, |link| async move { link.write(target, &value, mode).await })
            .await;
        match result {
            Ok(()) => Ok(()),
            Err(e) => {
                let message = format!("Failed to write {}: {}", characteristic, e);
                self.shared.fail(id, message).await;
                Err(e)
            }
        }
    }
}

impl<A: BleAdapter> Drop for GattSession<A> {
    fn drop(&mut self) {
        let shared = self.shared.clone();
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move { shared.close().await });
        } else if let Some(session) = shared.lock().take() {
            session.cancel.cancel();
        }
    }
}

impl<A: BleAdapter> Shared<A> {
    fn lock(&self) -> MutexGuard<'_, Option<ActiveSession<A::Link>>> {
        self.active.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn with_current<T>(&self, id: u64, f: impl FnOnce(&mut ActiveSession<A::Link>) -> T) -> Option<T> {
        self.lock().as_mut().filter(|s| s.id == id).map(f)
    }

    fn ready_id(&self) -> Result<u64, BleError> {
        match self.lock().as_ref() {
            Some(s) if s.state == SessionState::Ready && s.connected => Ok(s.id),
            _ => Err(BleError::NotReady),
        }
    }

    fn is_connected(&self, id: u64) -> bool {
        self.with_current(id, |s| s.connected).unwrap_or(false)
    }

    /// 会话已请求断开或已结束
    fn disconnect_requested(&self, id: u64) -> bool {
        self.with_current(id, |s| s.disconnecting).unwrap_or(true)
    }

    /// 连接流程中的错误；调用方已请求断开时只记录日志，等待平台确认断开
    async fn abort_setup(&self, id: u64, message: String) {
        if self.with_current(id, |s| s.disconnecting).unwrap_or(false) {
            debug!("Setup interrupted by disconnect: {}", message);
        } else {
            self.fail(id, message).await;
        }
    }

    fn device_name_of(&self, id: u64) -> Option<String> {
        self.with_current(id, |s| s.device_name.clone())
    }

    /// 在会话 `id` 的连接上串行执行一个 GATT 操作
    ///
    /// 会话已被关闭或替换时返回 [`BleError::NotConnected`]。
    async fn execute<T, F, Fut>(&self, id: u64, op: F) -> Result<T, BleError>
    where
        F: FnOnce(Arc<A::Link>) -> Fut,
        Fut: Future<Output = Result<T, BleError>>,
    {
        let (link, op_lock) = self
            .with_current(id, |s| (s.link.clone(), s.op_lock.clone()))
            .ok_or(BleError::NotConnected)?;
        let _guard = op_lock.lock().await;
        if self.with_current(id, |_| ()).is_none() {
            return Err(BleError::NotConnected);
        }
        op(link).await
    }

    async fn close(&self) {
        let session = self.lock().take();
        if let Some(session) = session {
            self.close_session(session).await;
        }
    }

    async fn close_session(&self, session: ActiveSession<A::Link>) {
        session.cancel.cancel();
        session.link.close().await;
        info!("Closed session with {}", session.device_name);
        self.listener.disconnected();
    }

    /// 会话级错误：关闭会话并汇报。会话已经结束时只记录日志。
    async fn fail(&self, id: u64, message: String) {
        match self.take_if_current(id) {
            Some(session) => {
                error!("{}", message);
                self.close_session(session).await;
                self.listener.error(&message);
            }
            None => debug!("Session {} already closed: {}", id, message),
        }
    }

    fn take_if_current(&self, id: u64) -> Option<ActiveSession<A::Link>> {
        let mut guard = self.lock();
        match guard.as_ref() {
            Some(s) if s.id == id => guard.take(),
            _ => None,
        }
    }

    /// 等待一个步骤间隔；返回 `false` 表示会话已关闭或已请求断开
    async fn next_step(&self, id: u64, cancel: &CancellationToken) -> bool {
        tokio::select! {
            _ = cancel.cancelled() => false,
            _ = tokio::time::sleep(self.config.step_delay) => !self.disconnect_requested(id),
        }
    }

    async fn drive(
        self: Arc<Self>,
        id: u64,
        mut events: mpsc::UnboundedReceiver<LinkEvent>,
        cancel: CancellationToken,
    ) {
        let device_name = self.device_name_of(id).unwrap_or_default();
        self.setup(id, &cancel).await;

        // 连接流程中途请求断开时也在这里等待平台确认
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                event = events.recv() => match event {
                    Some(LinkEvent::Notification { service, characteristic, value }) => {
                        self.dispatch(id, service, characteristic, &value);
                    }
                    Some(LinkEvent::Disconnected) => {
                        info!("Probe {} disconnected", device_name);
                        self.close_if_current(id).await;
                        break;
                    }
                    None => {
                        self.fail(id, "Platform event stream closed".to_string()).await;
                        break;
                    }
                },
            }
        }
        debug!("Event loop for session {} finished", id);
    }

    async fn close_if_current(&self, id: u64) {
        if let Some(session) = self.take_if_current(id) {
            self.close_session(session).await;
        }
    }

    /// 连接、发现服务并完成初始化
    ///
    /// 返回时会话要么已 Ready，要么已结束，要么正在等待平台确认断开。
    async fn setup(self: &Arc<Self>, id: u64, cancel: &CancellationToken) {
        if self.disconnect_requested(id) {
            return;
        }
        if let Err(e) = self
            .execute(id, |link| async move { link.connect().await })
            .await
        {
            self.abort_setup(id, format!("Failed to connect: {}", e))
                .await;
            return;
        }

        let connected = self.with_current(id, |s| {
            if s.disconnecting {
                return None;
            }
            s.connected = true;
            s.state = SessionState::ServicesDiscovering;
            Some(s.device_name.clone())
        });
        let Some(device_name) = connected.flatten() else {
            return;
        };
        debug!("Connected to probe {}", device_name);
        self.listener.connected(&device_name);

        if let Err(e) = self
            .execute(id, |link| async move { link.discover_services().await })
            .await
        {
            self.abort_setup(id, format!("Failed to discover services: {}", e))
                .await;
            return;
        }
        if self.disconnect_requested(id) {
            return;
        }
        self.on_services_discovered(id, cancel).await;
    }

    async fn on_services_discovered(self: &Arc<Self>, id: u64, cancel: &CancellationToken) {
        debug!("Probe services discovered");

        let mtu = self.config.target_mtu;
        match self
            .execute(id, |link| async move { link.request_mtu(mtu).await })
            .await
        {
            Ok(negotiated) => debug!("MTU changed to {}", negotiated),
            Err(BleError::NotConnected) => return,
            Err(e) => warn!("Failed to change MTU (wifi info might be truncated): {}", e),
        }
        if self.disconnect_requested(id) {
            return;
        }

        for characteristic in [
            ProbeCharacteristic::PowerPublished,
            ProbeCharacteristic::WifiPublished,
        ] {
            if !self.next_step(id, cancel).await {
                return;
            }
            debug!("Subscribing to probe's service: {}", characteristic);
            let target = characteristic.target();
            if let Err(e) = self
                .execute(id, |link| async move { link.subscribe(target).await })
                .await
            {
                self.abort_setup(id, format!("Failed to subscribe to {}: {}", characteristic, e))
                    .await;
                return;
            }
        }

        if !self.next_step(id, cancel).await {
            return;
        }
        if let Err(e) = self.read_wifi(id).await {
            self.abort_setup(id, format!("Failed to read Wi-Fi info: {}", e))
                .await;
            return;
        }

        let ready = self.with_current(id, |s| {
            if s.disconnecting {
                return None;
            }
            s.state = SessionState::Ready;
            Some(s.device_name.clone())
        });
        let Some(device_name) = ready.flatten() else {
            return;
        };
        info!("Probe {} ready", device_name);
        self.listener.ready(&device_name);

        tokio::spawn(self.clone().keep_alive(id, cancel.clone()));
    }

    async fn read_wifi(&self, id: u64) -> Result<WifiInfo, BleError> {
        let target = ProbeCharacteristic::WifiPublished.target();
        let value = self
            .execute(id, |link| async move { link.read(target).await })
            .await?;
        let wifi = WifiInfo::decode_bytes(&value);
        self.publish_wifi(id, &wifi);
        Ok(wifi)
    }

    /// 周期性写 Alert 特征保持连接；只在连接存活时重新计时
    async fn keep_alive(self: Arc<Self>, id: u64, cancel: CancellationToken) {
        let target = ProbeCharacteristic::Alert.target();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.config.keep_alive_interval) => {}
            }
            if !self.is_connected(id) {
                break;
            }
            let result = self
                .execute(id, |link| async move {
                    link.write(target, &[PING_VALUE], WriteMode::WithoutResponse)
                        .await
                })
                .await;
            if let Err(e) = result {
                self.fail(id, format!("Keep-alive ping failed: {}", e)).await;
                break;
            }
        }
        debug!("Keep-alive for session {} stopped", id);
    }

    fn dispatch(&self, id: u64, service: Uuid, characteristic: Uuid, value: &[u8]) {
        match ProbeCharacteristic::identify(service, characteristic) {
            Some(ProbeCharacteristic::PowerPublished) => {
                let Some(&byte) = value.first() else {
                    warn!("Empty power notification");
                    return;
                };
                let powered = byte == 0x01;
                info!("Probe power changed: {}", powered);
                if let Some(name) = self.device_name_of(id) {
                    self.listener.power_changed(&name, powered);
                }
            }
            Some(ProbeCharacteristic::WifiPublished) => {
                let wifi = WifiInfo::decode_bytes(value);
                self.publish_wifi(id, &wifi);
            }
            _ => debug!(
                "Retrieved unknown characteristic value: {:02x?} service: {} characteristic: {}",
                value, service, characteristic
            ),
        }
    }

    fn publish_wifi(&self, id: u64, wifi: &WifiInfo) {
        info!(
            "Probe wifi changed: ssid={:?} ip={:?} port={:?}",
            wifi.ssid, wifi.ip, wifi.port
        );
        if let Some(name) = self.device_name_of(id) {
            self.listener.wifi_changed(&name, wifi);
        }
    }
}
