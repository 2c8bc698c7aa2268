//! 对外提供的 Rust 调用接口
//!
//! 挖矿运行: 控制线程 (消费调度队列) 与调度循环 (运行在调用线程) 是
//! 仅有的两个并发单元，通过调度队列和每台设备的 next 槽位通信。

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, anyhow, bail};
use log::debug;

use crate::backend::{DeviceHandle, DeviceProfile, KernelToolchain};
use crate::config::MinerConfig;
use crate::dispatch::{Controller, ControllerStats, DispatchMessage, dispatch_queue, next_slot};
use crate::kernel_loader::{KernelParams, render_kernel_source};
use crate::patcher::{self, PatchReport};
use crate::pipeline::DevicePipeline;
use crate::rpc::WorkSource;
use crate::scheduler::{Scheduler, SchedulerStats};
use crate::work::{SharedTarget, WorkItem};

/// 一次挖矿运行的汇总
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MiningSummary {
    pub devices: usize,
    pub scheduler: SchedulerStats,
    pub controller: ControllerStats,
    pub elapsed: Duration,
}

/// disassemble 模式的输出
#[derive(Debug, Clone)]
pub struct Disassembly {
    pub profile: DeviceProfile,
    pub report: PatchReport,
    pub listing: String,
}

fn kernel_params(config: &MinerConfig) -> KernelParams {
    KernelParams {
        threads_per_group: config.threads_per_simd,
        iterations: config.iterations,
    }
}

/// 用给定的工具链、设备和工作源运行，直到 `shutdown` 被置位或出错
pub fn run_with<T, D, W>(
    toolchain: T,
    devices: Vec<D>,
    source: W,
    config: &MinerConfig,
    shutdown: Arc<AtomicBool>,
) -> anyhow::Result<MiningSummary>
where
    T: KernelToolchain + 'static,
    D: DeviceHandle<Image = T::Image>,
    W: WorkSource + 'static,
{
    config.validate()?;
    if devices.is_empty() {
        bail!("no usable devices");
    }
    let device_count = devices.len();

    let (queue_tx, queue_rx) = dispatch_queue();
    let mut controller = Controller::new(
        toolchain,
        source,
        kernel_params(config),
        config.patch,
        SharedTarget::default(),
    )
    .with_submit_only_valid(config.submit_only_valid);

    let mut pipelines = Vec::with_capacity(device_count);
    for device in devices {
        let profile = device.profile().clone();
        let (next_tx, next_rx) = next_slot();
        // 先为每台设备准备第一份工作
        queue_tx.send(DispatchMessage::CreateNextWorkItem { device_id: profile.id })?;
        debug!("Registered device {} ({})", profile.id, profile.name);
        controller.register_device(profile, next_tx);
        pipelines.push(DevicePipeline::new(device, config, next_rx, queue_tx.clone()));
    }
    drop(queue_tx);

    let controller_shutdown = Arc::clone(&shutdown);
    let handle = thread::Builder::new()
        .name("controller".into())
        .spawn(move || controller.run(queue_rx, &controller_shutdown))
        .context("failed to spawn controller thread")?;

    let started = Instant::now();
    let mut scheduler = Scheduler::new(pipelines, config);
    let scheduled = scheduler.run(&shutdown);
    let scheduler_stats = scheduler.stats();
    // 关闭调度队列的发送端，控制线程处理完剩余消息后退出
    drop(scheduler);
    shutdown.store(true, Ordering::SeqCst);

    let controlled = handle
        .join()
        .map_err(|_| anyhow!("controller thread panicked"))?;
    // 控制线程失败时调度循环通常只会看到槽位关闭，前者才是根因
    let controller_stats = controlled.context("controller failed")?;
    scheduled.context("scheduler failed")?;

    Ok(MiningSummary {
        devices: device_count,
        scheduler: scheduler_stats,
        controller: controller_stats,
        elapsed: started.elapsed(),
    })
}

/// 用合成工作编译、补丁，返回补丁报告和指令列表
pub fn disassemble_with<T: KernelToolchain>(
    toolchain: &T,
    profile: &DeviceProfile,
    config: &MinerConfig,
) -> anyhow::Result<Disassembly> {
    let source = render_kernel_source(&kernel_params(config), &WorkItem::synthetic())?;
    let mut compiled = toolchain
        .compile(&source, profile)
        .with_context(|| format!("failed to compile kernel for {}", profile.target))?;
    let report = patcher::patch_bfi_int(compiled.as_mut_bytes(), &config.patch)?;
    let listing = toolchain.disassemble(&compiled, config.patch.bytes_to_scan)?;
    Ok(Disassembly {
        profile: profile.clone(),
        report,
        listing,
    })
}

/// 在所有选中的、支持补丁的 OpenCL GPU 上挖矿
#[cfg(feature = "opencl")]
pub fn run_miner(config: &MinerConfig, shutdown: Arc<AtomicBool>) -> anyhow::Result<MiningSummary> {
    use crate::opencl::{OpenCLDevice, OpenCLToolchain, discover};
    use crate::rpc::GetworkClient;
    use log::info;

    let discovered = discover().context("OpenCL device discovery failed")?;
    let usable: Vec<_> = discovered
        .iter()
        .filter(|dc| {
            let profile = &dc.profile;
            if !config.devices.includes(profile.id) {
                info!("Device {} ({}) not selected, skipping", profile.id, profile.name);
                false
            } else if !profile.supports_bfi_patch {
                info!("Device {} ({}) cannot run BFI_INT, skipping", profile.id, profile.name);
                false
            } else {
                true
            }
        })
        .collect();
    if usable.is_empty() {
        bail!("no usable devices found");
    }

    let toolchain = OpenCLToolchain::new(usable.iter().copied());
    let devices: Vec<OpenCLDevice> = usable
        .iter()
        .map(|dc| OpenCLDevice::new(dc, config.threads_per_simd))
        .collect();
    let source = GetworkClient::new(config.endpoint.clone())?;
    info!(
        "Mining on {} device(s) against {}",
        usable.len(),
        config.endpoint.url()
    );
    run_with(toolchain, devices, source, config, shutdown)
}

/// 为名称或序号匹配 `device` 的 OpenCL 设备生成 disassemble 输出
#[cfg(feature = "opencl")]
pub fn disassemble(config: &MinerConfig, device: &str) -> anyhow::Result<Disassembly> {
    use crate::opencl::{OpenCLToolchain, discover};

    let discovered = discover().context("OpenCL device discovery failed")?;
    let wanted = device.to_lowercase();
    let target = discovered
        .iter()
        .find(|dc| {
            dc.profile.id.to_string() == wanted || dc.profile.name.to_lowercase().contains(&wanted)
        })
        .ok_or_else(|| anyhow!("no OpenCL device matches {device:?}"))?;

    let toolchain = OpenCLToolchain::new([target]);
    disassemble_with(&toolchain, &target.profile, config)
}
