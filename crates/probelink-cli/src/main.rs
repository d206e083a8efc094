//! Probelink CLI
//!
//! 命令行客户端，直接通过本机蓝牙适配器控制探头

mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use probelink_core::Settings;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "probelink", version, about = "无线超声探头 BLE 控制工具")]
struct Cli {
    /// 输出调试日志
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// 扫描附近的探头
    Scan {
        /// 扫描时长 (秒)，默认使用配置文件中的值
        #[arg(short, long)]
        window: Option<u64>,
    },
    /// 连接探头并持续打印事件，Ctrl-C 退出
    Monitor {
        /// 探头蓝牙地址
        address: String,
    },
    /// 开机或关机
    Power {
        address: String,
        state: PowerState,
    },
    /// 让探头发出提示音
    Alert {
        address: String,
        /// 使用高级别提示
        #[arg(long)]
        high: bool,
    },
    /// 读取探头的 Wi-Fi 信息
    Wifi { address: String },
    /// 让探头加入指定的 Wi-Fi 网络
    Join {
        address: String,
        #[arg(long)]
        ssid: String,
        #[arg(long)]
        password: Option<String>,
    },
    /// 让探头切换到热点模式
    Ap { address: String },
}

#[derive(Clone, Copy, ValueEnum)]
enum PowerState {
    On,
    Off,
}

fn init_logging(verbose: bool) {
    // 桥接 log crate（probelink-core 使用）到 tracing
    let _ = tracing_log::LogTracer::init();

    let default_filter = if verbose {
        "debug"
    } else {
        "info,probelink_core=debug"
    };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let settings = Settings::load();
    tracing::debug!("Using settings: {:?}", settings);

    match cli.command {
        Commands::Scan { window } => commands::scan(&settings, window).await?,
        Commands::Monitor { address } => commands::monitor(&settings, &address).await?,
        Commands::Power { address, state } => {
            commands::power(&settings, &address, matches!(state, PowerState::On)).await?
        }
        Commands::Alert { address, high } => commands::alert(&settings, &address, high).await?,
        Commands::Wifi { address } => commands::wifi(&settings, &address).await?,
        Commands::Join {
            address,
            ssid,
            password,
        } => commands::join(&settings, &address, ssid, password).await?,
        Commands::Ap { address } => commands::access_point(&settings, &address).await?,
    }

    Ok(())
}
