//! GPU 比特币挖矿 - 主程序
//!
//! 使用方式:
//!   cargo run -- -s 127.0.0.1 -p 8332 -a user:password
//!   cargo run -- -G 0,2 -i 8192 -v
//!   cargo run -- -d Cypress

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use log::info;

use rust_gpuminer::{DeviceSelection, MinerConfig, MiningSummary, RpcEndpoint};

/// 命令行参数
#[derive(Parser, Debug)]
#[command(name = "rust-gpuminer")]
#[command(about = "GPU 比特币挖矿 (getwork, 补丁 BFI_INT 内核)")]
#[command(version = "0.1.0")]
struct Args {
    /// RPC 用户名和密码
    #[arg(short, long, default_value = "bitcoin:password", value_name = "USER:PWD")]
    auth: String,

    /// 只为指定设备 (序号或名称) 编译并打印补丁后的内核
    #[arg(short, long, value_name = "DEVICE")]
    disassemble: Option<String>,

    /// 只使用这些设备 (逗号分隔的序号)
    #[arg(short = 'G', long, value_delimiter = ',', conflicts_with = "max_devices")]
    devices: Option<Vec<usize>>,

    /// 最多使用前 n 台设备 (0 表示全部)
    #[arg(short = 'g', long)]
    max_devices: Option<usize>,

    /// 每次调度中每个 lane 的迭代次数
    #[arg(short, long, default_value_t = rust_gpuminer::config::DEFAULT_ITERATIONS)]
    iterations: u32,

    /// RPC 端口
    #[arg(short, long, default_value_t = 8332)]
    port: u16,

    /// RPC 服务器
    #[arg(short, long, default_value = "localhost")]
    server: String,

    /// 每个 SIMD 的线程数
    #[arg(short, long, default_value_t = rust_gpuminer::config::DEFAULT_THREADS_PER_SIMD)]
    threads: u32,

    /// 日志详细程度 (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// 调度循环节拍 (毫秒)
    #[arg(long, default_value_t = 1)]
    poll_interval_ms: u64,

    /// 汇总算力输出周期 (毫秒)
    #[arg(long, default_value_t = 1000)]
    stats_interval_ms: u64,

    /// 只提交主机端校验通过的候选
    #[arg(long, default_value_t = false)]
    submit_only_valid: bool,
}

fn log_filter(verbosity: u8) -> &'static str {
    match verbosity {
        0 => "info",
        1 => "debug",
        _ => "trace",
    }
}

/// 把命令行参数转换为不可变的运行配置
fn build_config(args: &Args) -> anyhow::Result<MinerConfig> {
    let endpoint = RpcEndpoint {
        server: args.server.clone(),
        port: args.port,
        ..RpcEndpoint::default()
    }
    .with_auth(&args.auth)?;

    let config = MinerConfig {
        devices: DeviceSelection::from_args(args.devices.clone(), args.max_devices)?,
        iterations: args.iterations,
        threads_per_simd: args.threads,
        verbosity: args.verbose,
        endpoint,
        poll_interval: Duration::from_millis(args.poll_interval_ms),
        stats_interval: Duration::from_millis(args.stats_interval_ms),
        submit_only_valid: args.submit_only_valid,
        ..MinerConfig::default()
    };
    config.validate()?;
    Ok(config)
}

#[cfg(feature = "opencl")]
fn mine(config: &MinerConfig, shutdown: Arc<AtomicBool>) -> anyhow::Result<MiningSummary> {
    rust_gpuminer::run_miner(config, shutdown)
}

#[cfg(not(feature = "opencl"))]
fn mine(_config: &MinerConfig, _shutdown: Arc<AtomicBool>) -> anyhow::Result<MiningSummary> {
    anyhow::bail!("built without the opencl feature, no compute backend available")
}

#[cfg(feature = "opencl")]
fn print_disassembly(config: &MinerConfig, device: &str) -> anyhow::Result<()> {
    let disassembly = rust_gpuminer::disassemble(config, device)?;
    let report = disassembly.report;
    println!(
        "; device {} ({}), first opcode at {:#x}",
        disassembly.profile.id, disassembly.profile.name, report.first_opcode_offset
    );
    println!(
        "; {} instructions scanned: {} BFE_INT, {} BFE_UINT, {} BYTE_ALIGN, {} patched to BFI_INT",
        report.instructions_scanned, report.bfe_int, report.bfe_uint, report.byte_align, report.patched
    );
    print!("{}", disassembly.listing);
    Ok(())
}

#[cfg(not(feature = "opencl"))]
fn print_disassembly(_config: &MinerConfig, _device: &str) -> anyhow::Result<()> {
    anyhow::bail!("built without the opencl feature, no compute backend available")
}

/// 主函数
fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_filter(args.verbose)))
        .init();

    let config = build_config(&args)?;
    if let Some(device) = &args.disassemble {
        return print_disassembly(&config, device);
    }

    info!("启动 GPU 挖矿");
    info!("配置: {:?}", config);

    let shutdown = Arc::new(AtomicBool::new(false));
    let handler_flag = Arc::clone(&shutdown);
    ctrlc::set_handler(move || handler_flag.store(true, Ordering::SeqCst))
        .context("failed to install Ctrl-C handler")?;

    let summary = mine(&config, shutdown)?;

    println!();
    println!("========================================");
    println!("运行时间: {:.2} 秒", summary.elapsed.as_secs_f64());
    println!("设备数: {}", summary.devices);
    println!(
        "调度次数: {} | 换新工作: {} | 等待槽位: {} 次 ({:.2} 秒)",
        summary.scheduler.dispatches,
        summary.scheduler.promotions,
        summary.scheduler.stalls,
        summary.scheduler.stalled.as_secs_f64()
    );
    println!(
        "候选: {} | 已提交: {} | 被接受: {}",
        summary.controller.candidates, summary.controller.submitted, summary.controller.accepted
    );
    println!("========================================");

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<Args, clap::Error> {
        Args::try_parse_from(std::iter::once("rust-gpuminer").chain(args.iter().copied()))
    }

    #[test]
    fn test_defaults() {
        let config = build_config(&parse(&[]).unwrap()).unwrap();
        assert_eq!(config.devices, DeviceSelection::All);
        assert_eq!(config.iterations, 0x1000);
        assert_eq!(config.threads_per_simd, 320);
        assert_eq!(config.endpoint.url(), "http://localhost:8332/");
        assert_eq!(config.endpoint.user, "bitcoin");
        assert_eq!(config.endpoint.password, "password");
        assert_eq!(config.poll_interval, Duration::from_millis(1));
        assert_eq!(config.stats_interval, Duration::from_millis(1000));
    }

    #[test]
    fn test_device_list_and_endpoint() {
        let args = parse(&["-G", "0,2", "-s", "10.0.0.5", "-p", "18332", "-a", "me:pw", "-vv"]).unwrap();
        let config = build_config(&args).unwrap();
        assert!(config.devices.includes(2));
        assert!(!config.devices.includes(1));
        assert_eq!(config.endpoint.url(), "http://10.0.0.5:18332/");
        assert_eq!(config.endpoint.user, "me");
        assert_eq!(log_filter(args.verbose), "trace");
    }

    #[test]
    fn test_logged_config_hides_password() {
        let config = build_config(&parse(&["-a", "miner:hunter2"]).unwrap()).unwrap();
        let logged = format!("配置: {:?}", config);
        assert!(logged.contains("miner"));
        assert!(!logged.contains("hunter2"), "{}", logged);
    }

    #[test]
    fn test_device_filters_conflict() {
        assert!(parse(&["-G", "0", "-g", "2"]).is_err());
        let config = build_config(&parse(&["-g", "1"]).unwrap()).unwrap();
        assert!(config.devices.includes(0));
        assert!(!config.devices.includes(1));
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        assert!(build_config(&parse(&["-a", "nopassword"]).unwrap()).is_err());
        assert!(build_config(&parse(&["-i", "0"]).unwrap()).is_err());
        assert_eq!(log_filter(0), "info");
        assert_eq!(log_filter(1), "debug");
    }
}
