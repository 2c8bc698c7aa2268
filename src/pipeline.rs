//! 单台设备的工作流水线
//!
//! 状态机: `Idle` (从未运行) → `Running` (内核已启动) → `Harvesting`
//! (设备报告完成，读取 lane 结果) → `Running` ...，只在关闭时终止。
//!
//! 流水线持有 "current" 工作 (正在执行)；"next" 工作由控制线程准备好后
//! 放进容量为 1 的槽位通道，在设备需要新工作时被提升为 current。

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError};
use log::{debug, info, trace, warn};

use crate::backend::DeviceHandle;
use crate::config::{LaneRecord, LaneStatus, MinerConfig};
use crate::dispatch::{DispatchMessage, PreparedWork};
use crate::error::{MinerError, MinerResult};
use crate::partition::reset_lanes;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    /// 设备从未运行，或等待新工作时被关闭打断
    Idle,
    /// 内核已启动，完成事件未到
    Running,
    /// 设备已完成，等待读取结果
    Harvesting,
}

/// 设备找到的候选 nonce
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Candidate {
    pub lane: usize,
    pub nonce: u32,
}

/// 一次收获中所有 lane 的检查结果
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LaneAssessment {
    pub candidates: Vec<Candidate>,
    /// 任一 lane 走完区间 (Exhausted，或候选正好在区间末尾) 时整台设备换新工作
    pub ready_for_new_work: bool,
}

impl LaneAssessment {
    pub fn from_lanes(device: usize, lanes: &[LaneRecord]) -> MinerResult<Self> {
        let mut assessment = Self::default();
        for (lane, record) in lanes.iter().enumerate() {
            match record.status() {
                Some(LaneStatus::Searching) => {}
                Some(LaneStatus::CandidateFound) => {
                    // lane 已经越过了它找到的 nonce
                    assessment.candidates.push(Candidate {
                        lane,
                        nonce: record.current_nonce.wrapping_sub(1),
                    });
                    if record.at_boundary() {
                        assessment.ready_for_new_work = true;
                    }
                }
                Some(LaneStatus::Exhausted) => assessment.ready_for_new_work = true,
                None => {
                    return Err(MinerError::InvalidLaneStatus {
                        device,
                        lane,
                        raw: record.status,
                    });
                }
            }
        }
        Ok(assessment)
    }
}

/// 流水线计数器
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct PipelineStats {
    pub dispatches: u64,
    pub promotions: u64,
    pub candidates: u64,
    /// 提升时 next 槽位还没准备好的次数
    pub stalls: u64,
    pub stalled: Duration,
}

pub struct DevicePipeline<D: DeviceHandle> {
    device: D,
    state: PipelineState,
    lanes: Vec<LaneRecord>,
    current: Option<PreparedWork<D::Image>>,
    next_rx: Receiver<PreparedWork<D::Image>>,
    queue: Sender<DispatchMessage>,
    iterations: u32,
    stall_poll: Duration,
    started: Option<Instant>,
    /// 最近一次收获计算的速率 (Mhash/s)
    throughput: f64,
    stats: PipelineStats,
}

impl<D: DeviceHandle> DevicePipeline<D> {
    pub fn new(
        device: D,
        config: &MinerConfig,
        next_rx: Receiver<PreparedWork<D::Image>>,
        queue: Sender<DispatchMessage>,
    ) -> Self {
        let lane_count = config.lanes_for(device.profile().simd_count);
        Self {
            device,
            state: PipelineState::Idle,
            lanes: vec![LaneRecord::default(); lane_count],
            current: None,
            next_rx,
            queue,
            iterations: config.iterations,
            stall_poll: config.poll_interval,
            started: None,
            throughput: 0.0,
            stats: PipelineStats::default(),
        }
    }

    pub fn device_id(&self) -> usize {
        self.device.profile().id
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    pub fn lanes(&self) -> &[LaneRecord] {
        &self.lanes
    }

    pub fn throughput(&self) -> f64 {
        self.throughput
    }

    pub fn stats(&self) -> PipelineStats {
        self.stats
    }

    /// 非阻塞检查设备是否仍在运行。完成时切换到 `Harvesting`。
    pub fn poll(&mut self) -> MinerResult<bool> {
        match self.state {
            PipelineState::Idle | PipelineState::Harvesting => Ok(false),
            PipelineState::Running => {
                if self.device.is_complete()? {
                    trace!("Device {} finished its dispatch", self.device_id());
                    self.state = PipelineState::Harvesting;
                    Ok(false)
                } else {
                    Ok(true)
                }
            }
        }
    }

    /// 读取 lane 结果，上报候选，返回设备是否需要新工作
    pub fn harvest(&mut self) -> MinerResult<bool> {
        let device_id = self.device_id();
        self.device.read_lanes(&mut self.lanes)?;

        if let Some(started) = self.started {
            let secs = started.elapsed().as_secs_f64();
            if secs > 0.0 {
                let hashes = self.iterations as f64 * self.lanes.len() as f64;
                self.throughput = hashes / secs / 1e6;
            }
            debug!("Device {}: {:.2} Mhash/s", device_id, self.throughput);
        }

        let assessment = LaneAssessment::from_lanes(device_id, &self.lanes)?;
        if !assessment.candidates.is_empty() {
            let work = self
                .current
                .as_ref()
                .map(|prepared| prepared.work.data_words)
                .ok_or_else(|| MinerError::Backend(format!("device {device_id} harvested without work")))?;
            for candidate in &assessment.candidates {
                debug!(
                    "Device {} lane {} reported candidate nonce {:#010x}",
                    device_id, candidate.lane, candidate.nonce
                );
                self.queue
                    .send(DispatchMessage::VerifyCandidate {
                        device_id,
                        data_words: work,
                        nonce: candidate.nonce,
                    })
                    .map_err(|_| MinerError::ControllerStopped { device: device_id })?;
            }
            self.stats.candidates += assessment.candidates.len() as u64;

            if !assessment.ready_for_new_work {
                // 已上报的 lane 从停下的位置继续搜索
                for candidate in &assessment.candidates {
                    self.lanes[candidate.lane].status = LaneStatus::Searching.as_u8();
                }
                self.device.write_lanes(&self.lanes)?;
            }
        }
        Ok(assessment.ready_for_new_work)
    }

    /// 卸载当前工作，把 next 提升为 current 并重新划分所有 lane。
    ///
    /// 等待 next 期间收到关闭信号时返回 `Ok(false)`，设备保持卸载状态。
    pub fn promote(&mut self, shutdown: &AtomicBool) -> MinerResult<bool> {
        let device_id = self.device_id();
        if self.current.take().is_some() {
            self.device.unload()?;
        }
        self.state = PipelineState::Idle;

        let Some(prepared) = self.wait_for_next(shutdown)? else {
            return Ok(false);
        };
        self.queue
            .send(DispatchMessage::CreateNextWorkItem { device_id })
            .map_err(|_| MinerError::ControllerStopped { device: device_id })?;

        self.device.load(&prepared.image, self.lanes.len())?;
        reset_lanes(&mut self.lanes);
        self.device.write_lanes(&self.lanes)?;
        self.current = Some(prepared);
        self.stats.promotions += 1;
        debug!("Device {} promoted next work to current", device_id);
        Ok(true)
    }

    fn wait_for_next(&mut self, shutdown: &AtomicBool) -> MinerResult<Option<PreparedWork<D::Image>>> {
        let device_id = self.device_id();
        match self.next_rx.try_recv() {
            Ok(prepared) => return Ok(Some(prepared)),
            Err(TryRecvError::Disconnected) => return Err(MinerError::ControllerStopped { device: device_id }),
            Err(TryRecvError::Empty) => {}
        }

        warn!("Device {} stalled: next work item is not ready", device_id);
        self.stats.stalls += 1;
        let began = Instant::now();
        loop {
            match self.next_rx.recv_timeout(self.stall_poll) {
                Ok(prepared) => {
                    let waited = began.elapsed();
                    self.stats.stalled += waited;
                    info!("Device {} resumed after waiting {:?} for work", device_id, waited);
                    return Ok(Some(prepared));
                }
                Err(RecvTimeoutError::Timeout) => {
                    if shutdown.load(Ordering::SeqCst) {
                        self.stats.stalled += began.elapsed();
                        return Ok(None);
                    }
                }
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(MinerError::ControllerStopped { device: device_id });
                }
            }
        }
    }

    /// 启动设备执行
    pub fn dispatch(&mut self) -> MinerResult<()> {
        self.device.launch()?;
        self.started = Some(Instant::now());
        self.state = PipelineState::Running;
        self.stats.dispatches += 1;
        Ok(())
    }

    /// 调度循环的一步：仍在运行时什么也不做，否则收获、按需提升，再启动
    pub fn step(&mut self, shutdown: &AtomicBool) -> MinerResult<()> {
        if self.poll()? {
            return Ok(());
        }
        let needs_new_work = match self.state {
            PipelineState::Harvesting => self.harvest()?,
            _ => true,
        };
        if needs_new_work && !self.promote(shutdown)? {
            return Ok(());
        }
        self.dispatch()
    }

    /// 释放设备资源
    pub fn teardown(&mut self) -> MinerResult<()> {
        if self.current.take().is_some() {
            self.device.unload()?;
        }
        self.state = PipelineState::Idle;
        debug!("Device {} torn down", self.device_id());
        Ok(())
    }
}
