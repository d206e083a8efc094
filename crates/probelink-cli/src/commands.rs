//! 子命令实现
//!
//! 会话类命令的流程都是：短暂扫描找到探头 -> 连接 -> 等待 Ready -> 执行操作 -> 断开。

use anyhow::{Result, anyhow, bail};
use btleplug::platform::Adapter;
use probelink_core::ble::client::find_adapter;
use probelink_core::{
    BtleplugAdapter, BtleplugScanBackend, DeviceScanner, GattSession, ProbeRegistry,
    ScanEvent, SessionEvent, Settings, WifiRequest,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// 连接到 Ready 的最长等待时间
const READY_TIMEOUT: Duration = Duration::from_secs(20);
/// 请求发出后等待探头推送结果的时间
const NOTIFY_TIMEOUT: Duration = Duration::from_secs(10);
/// 会话先发 disconnected 再发 error，断开后再等这么久取出错误原因
const ERROR_GRACE: Duration = Duration::from_millis(100);

pub async fn scan(settings: &Settings, window: Option<u64>) -> Result<()> {
    let adapter = find_adapter(settings.adapter_index).await?;
    let mut config = settings.scan_config();
    if let Some(secs) = window {
        config.window = Duration::from_secs(secs);
    }

    let (tx, mut rx) = mpsc::unbounded_channel();
    let scanner = DeviceScanner::new(
        BtleplugScanBackend::with_adapter(adapter),
        Arc::new(tx),
        config.clone(),
    );
    scanner.start_scan().await;

    let mut registry = ProbeRegistry::new();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => scanner.stop_scan().await,
            event = rx.recv() => match event {
                Some(ScanEvent::Started) => {
                    println!("🔍 扫描探头 ({}s)...", config.window.as_secs());
                }
                Some(ScanEvent::NewProbe { device_name, result }) => {
                    registry.observe(&device_name, &result);
                    if let Some(probe) = registry.get(&device_name) {
                        println!("   {}", probe);
                    }
                }
                Some(ScanEvent::Failed(message)) => bail!("Scan failed: {}", message),
                Some(ScanEvent::Finished(_)) | None => break,
            },
        }
    }

    if registry.is_empty() {
        println!("   未发现探头");
    } else {
        println!("共发现 {} 个探头", registry.len());
    }
    Ok(())
}

pub async fn monitor(settings: &Settings, address: &str) -> Result<()> {
    let (session, mut events) = open_session(settings, address).await?;
    println!("👀 监听探头事件，Ctrl-C 退出");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Some(SessionEvent::Disconnected) | None => {
                    println!("🔌 探头已断开");
                    session.close().await;
                    return Ok(());
                }
                Some(SessionEvent::Error(message)) => {
                    session.close().await;
                    bail!("Session failed: {}", message);
                }
                Some(event) => print_event(&event),
            },
        }
    }

    finish(session).await;
    Ok(())
}

pub async fn power(settings: &Settings, address: &str, on: bool) -> Result<()> {
    let (session, mut events) = open_session(settings, address).await?;

    session.power_on(on).await?;
    println!("⚡ 已发送{}请求", if on { "开机" } else { "关机" });
    await_event(&mut events, |e| matches!(e, SessionEvent::PowerChanged { .. })).await;

    finish(session).await;
    Ok(())
}

pub async fn alert(settings: &Settings, address: &str, high: bool) -> Result<()> {
    let (session, _events) = open_session(settings, address).await?;

    session.send_alert(high).await?;
    println!("🔔 已发送提示音");

    finish(session).await;
    Ok(())
}

pub async fn wifi(settings: &Settings, address: &str) -> Result<()> {
    let (session, _events) = open_session(settings, address).await?;

    let info = session.read_wifi_info().await?;
    if info.is_enabled() {
        println!("📶 {}", info.to_string().replace('\n', "\n   "));
    } else {
        println!("📶 探头 Wi-Fi 未启用");
    }

    finish(session).await;
    Ok(())
}

pub async fn join(
    settings: &Settings,
    address: &str,
    ssid: String,
    password: Option<String>,
) -> Result<()> {
    let request = WifiRequest::join(ssid, password);
    request.encode()?;
    send_wifi_request(settings, address, request).await
}

pub async fn access_point(settings: &Settings, address: &str) -> Result<()> {
    send_wifi_request(settings, address, WifiRequest::AccessPoint).await
}

async fn send_wifi_request(settings: &Settings, address: &str, request: WifiRequest) -> Result<()> {
    let (session, mut events) = open_session(settings, address).await?;

    session.request_wifi(&request).await?;
    println!("📡 已发送 Wi-Fi 请求，等待探头切换网络...");
    await_event(&mut events, |e| matches!(e, SessionEvent::WifiChanged { .. })).await;

    finish(session).await;
    Ok(())
}

/// 扫描直到看到目标地址，再建立会话并等待 Ready
///
/// btleplug 只能连接扫描中出现过的外设。
async fn open_session(
    settings: &Settings,
    address: &str,
) -> Result<(
    GattSession<BtleplugAdapter>,
    mpsc::UnboundedReceiver<SessionEvent>,
)> {
    let adapter = find_adapter(settings.adapter_index).await?;
    locate(settings, &adapter, address).await?;

    let (tx, mut events) = mpsc::unbounded_channel();
    let session = GattSession::new(
        BtleplugAdapter::with_adapter(adapter),
        Arc::new(tx),
        settings.session_config(),
    );
    session.connect(address).await?;

    match tokio::time::timeout(READY_TIMEOUT, wait_ready(&mut events)).await {
        Ok(Ok(name)) => {
            println!("✅ 已连接 {}", name);
            Ok((session, events))
        }
        Ok(Err(e)) => Err(e),
        Err(_) => {
            session.close().await;
            Err(anyhow!("Timed out waiting for {} to become ready", address))
        }
    }
}

async fn locate(
    settings: &Settings,
    adapter: &Adapter,
    address: &str,
) -> Result<()> {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let scanner = DeviceScanner::new(
        BtleplugScanBackend::with_adapter(adapter.clone()),
        Arc::new(tx),
        settings.scan_config(),
    );
    scanner.start_scan().await;
    tracing::debug!("Looking for {}", address);

    let mut found = false;
    while let Some(event) = rx.recv().await {
        match event {
            ScanEvent::NewProbe { result, .. } if result.address.eq_ignore_ascii_case(address) => {
                found = true;
                scanner.stop_scan().await;
            }
            ScanEvent::Failed(message) => bail!("Scan failed: {}", message),
            ScanEvent::Finished(_) => break,
            _ => {}
        }
    }

    if !found {
        bail!("Probe {} not found nearby", address);
    }
    Ok(())
}

async fn wait_ready(events: &mut mpsc::UnboundedReceiver<SessionEvent>) -> Result<String> {
    while let Some(event) = events.recv().await {
        match event {
            SessionEvent::Ready(name) => return Ok(name),
            SessionEvent::Error(message) => bail!("Failed to set up session: {}", message),
            SessionEvent::Disconnected => {
                if let Ok(Some(SessionEvent::Error(message))) =
                    tokio::time::timeout(ERROR_GRACE, events.recv()).await
                {
                    bail!("Failed to set up session: {}", message);
                }
                bail!("Probe disconnected during setup");
            }
            other => tracing::debug!("Setup event: {:?}", other),
        }
    }
    Err(anyhow!("Session event stream closed"))
}

/// 打印事件直到出现满足条件的事件或超时
async fn await_event(
    events: &mut mpsc::UnboundedReceiver<SessionEvent>,
    done: impl Fn(&SessionEvent) -> bool,
) {
    let wait = async {
        while let Some(event) = events.recv().await {
            print_event(&event);
            if done(&event) || matches!(event, SessionEvent::Disconnected | SessionEvent::Error(_)) {
                break;
            }
        }
    };
    if tokio::time::timeout(NOTIFY_TIMEOUT, wait).await.is_err() {
        println!("   (探头未在 {}s 内响应)", NOTIFY_TIMEOUT.as_secs());
    }
}

async fn finish(session: GattSession<BtleplugAdapter>) {
    if let Err(e) = session.disconnect().await {
        tracing::warn!("Disconnect failed: {}", e);
    }
    session.close().await;
}

fn print_event(event: &SessionEvent) {
    match event {
        SessionEvent::Connected(name) => println!("   已连接 {}", name),
        SessionEvent::Ready(name) => println!("   {} 就绪", name),
        SessionEvent::PowerChanged {
            device_name,
            powered,
        } => println!(
            "⚡ {} 电源: {}",
            device_name,
            if *powered { "开" } else { "关" }
        ),
        SessionEvent::WifiChanged { device_name, wifi } => {
            if wifi.is_enabled() {
                println!("📶 {} Wi-Fi:\n   {}", device_name, wifi.to_string().replace('\n', "\n   "));
            } else {
                println!("📶 {} Wi-Fi 未启用", device_name);
            }
        }
        SessionEvent::Disconnected => println!("🔌 已断开"),
        SessionEvent::Error(message) => println!("❌ {}", message),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use probelink_core::WifiInfo;

    #[tokio::test]
    async fn test_wait_ready_skips_setup_events() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        tx.send(SessionEvent::Connected("CUS-1".into())).unwrap();
        tx.send(SessionEvent::WifiChanged {
            device_name: "CUS-1".into(),
            wifi: WifiInfo::default(),
        })
        .unwrap();
        tx.send(SessionEvent::Ready("CUS-1".into())).unwrap();

        assert_eq!(wait_ready(&mut rx).await.unwrap(), "CUS-1");
    }

    #[tokio::test]
    async fn test_wait_ready_reports_setup_error() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        tx.send(SessionEvent::Connected("CUS-1".into())).unwrap();
        tx.send(SessionEvent::Disconnected).unwrap();
        tx.send(SessionEvent::Error("Failed to discover services".into()))
            .unwrap();

        let err = wait_ready(&mut rx).await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "Failed to set up session: Failed to discover services"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_ready_plain_disconnect() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        tx.send(SessionEvent::Connected("CUS-1".into())).unwrap();
        tx.send(SessionEvent::Disconnected).unwrap();

        let err = wait_ready(&mut rx).await.unwrap_err();
        assert_eq!(err.to_string(), "Probe disconnected during setup");
        drop(tx);
    }

    #[tokio::test(start_paused = true)]
    async fn test_await_event_times_out() {
        let (_tx, mut rx) = mpsc::unbounded_channel();
        await_event(&mut rx, |_| true).await;
    }
}
