//! 调度循环
//!
//! 以固定节拍轮询所有设备流水线，驱动状态切换，并定期汇总算力。

use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::sleep;
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use crate::backend::DeviceHandle;
use crate::config::MinerConfig;
use crate::error::MinerResult;
use crate::pipeline::DevicePipeline;

/// 所有流水线计数器之和
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct SchedulerStats {
    pub ticks: u64,
    pub dispatches: u64,
    pub promotions: u64,
    pub candidates: u64,
    pub stalls: u64,
    pub stalled: Duration,
}

pub struct Scheduler<D: DeviceHandle> {
    pipelines: Vec<DevicePipeline<D>>,
    poll_interval: Duration,
    stats_interval: Duration,
    last_report: Instant,
    ticks: u64,
}

impl<D: DeviceHandle> Scheduler<D> {
    pub fn new(pipelines: Vec<DevicePipeline<D>>, config: &MinerConfig) -> Self {
        Self {
            pipelines,
            poll_interval: config.poll_interval,
            stats_interval: config.stats_interval,
            last_report: Instant::now(),
            ticks: 0,
        }
    }

    pub fn pipelines(&self) -> &[DevicePipeline<D>] {
        &self.pipelines
    }

    /// 轮询每台设备一次
    pub fn tick(&mut self, shutdown: &AtomicBool) -> MinerResult<()> {
        for pipeline in &mut self.pipelines {
            if shutdown.load(Ordering::SeqCst) {
                break;
            }
            pipeline.step(shutdown)?;
        }
        self.ticks += 1;

        if self.last_report.elapsed() >= self.stats_interval {
            self.report();
            self.last_report = Instant::now();
        }
        Ok(())
    }

    /// 各设备最近一次测得速率之和 (Mhash/s)
    pub fn total_rate(&self) -> f64 {
        self.pipelines.iter().map(DevicePipeline::throughput).sum()
    }

    fn report(&self) {
        for pipeline in &self.pipelines {
            debug!(
                "Device {}: {:.2} Mhash/s, {} stalls",
                pipeline.device_id(),
                pipeline.throughput(),
                pipeline.stats().stalls
            );
        }
        info!("Overall rate: {:.2} Mhash/s", self.total_rate());
    }

    /// 运行直到关闭标志被置位或出现错误。出错时置位关闭标志，
    /// 让控制线程也退出。
    pub fn run(&mut self, shutdown: &AtomicBool) -> MinerResult<SchedulerStats> {
        info!("Scheduling {} device(s)", self.pipelines.len());
        while !shutdown.load(Ordering::SeqCst) {
            if let Err(err) = self.tick(shutdown) {
                shutdown.store(true, Ordering::SeqCst);
                if let Err(teardown_err) = self.teardown() {
                    warn!("Teardown after failure also failed: {}", teardown_err);
                }
                return Err(err);
            }
            sleep(self.poll_interval);
        }
        info!("Shutdown requested, releasing devices");
        self.teardown()?;
        Ok(self.stats())
    }

    pub fn teardown(&mut self) -> MinerResult<()> {
        for pipeline in &mut self.pipelines {
            pipeline.teardown()?;
        }
        Ok(())
    }

    pub fn stats(&self) -> SchedulerStats {
        let mut stats = SchedulerStats {
            ticks: self.ticks,
            ..SchedulerStats::default()
        };
        for pipeline in &self.pipelines {
            let p = pipeline.stats();
            stats.dispatches += p.dispatches;
            stats.promotions += p.promotions;
            stats.candidates += p.candidates;
            stats.stalls += p.stalls;
            stats.stalled += p.stalled;
        }
        stats
    }
}
