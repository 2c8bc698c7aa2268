//! 调度消息队列和控制线程
//!
//! 设备流水线把延迟执行的指令 (准备下一份工作、校验候选) 放进一个 FIFO
//! 通道，由唯一的控制线程按顺序同步处理。准备好的工作通过每台设备容量为 1
//! 的 next 槽位通道交还给流水线。

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError};
use log::{debug, info, warn};

use crate::backend::{DeviceProfile, KernelToolchain};
use crate::error::{MinerError, MinerResult};
use crate::kernel_loader::{KernelParams, render_kernel_source};
use crate::patcher::{self, PatchBounds};
use crate::rpc::WorkSource;
use crate::work::{SharedTarget, WorkItem, sha256d_header};

/// 控制线程检查关闭标志的间隔
const SHUTDOWN_CHECK_INTERVAL: Duration = Duration::from_millis(100);

/// 队列中的指令，入队后不可变，按入队顺序被处理一次
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchMessage {
    CreateNextWorkItem {
        device_id: usize,
    },
    VerifyCandidate {
        device_id: usize,
        data_words: [u32; 32],
        nonce: u32,
    },
}

/// 已编译、补丁并链接好的工作，等待被流水线提升
#[derive(Debug)]
pub struct PreparedWork<I> {
    pub work: WorkItem,
    pub image: I,
}

/// 创建调度队列 (多生产者/单消费者)
pub fn dispatch_queue() -> (Sender<DispatchMessage>, Receiver<DispatchMessage>) {
    crossbeam_channel::unbounded()
}

/// 创建一台设备的 next 槽位
pub fn next_slot<I>() -> (Sender<PreparedWork<I>>, Receiver<PreparedWork<I>>) {
    crossbeam_channel::bounded(1)
}

struct DeviceSlot<I> {
    profile: DeviceProfile,
    next_tx: Sender<PreparedWork<I>>,
}

/// 控制线程的统计
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ControllerStats {
    pub work_items: u64,
    pub candidates: u64,
    pub submitted: u64,
    pub accepted: u64,
    /// 主机端校验未通过的候选
    pub below_target: u64,
}

/// 控制器：拉取工作、编译、补丁、链接；提交候选
pub struct Controller<T: KernelToolchain, W: WorkSource> {
    toolchain: T,
    source: W,
    params: KernelParams,
    patch: PatchBounds,
    target: SharedTarget,
    submit_only_valid: bool,
    slots: BTreeMap<usize, DeviceSlot<T::Image>>,
    stats: ControllerStats,
}

impl<T: KernelToolchain, W: WorkSource> Controller<T, W> {
    pub fn new(
        toolchain: T,
        source: W,
        params: KernelParams,
        patch: PatchBounds,
        target: SharedTarget,
    ) -> Self {
        Self {
            toolchain,
            source,
            params,
            patch,
            target,
            submit_only_valid: false,
            slots: BTreeMap::new(),
            stats: ControllerStats::default(),
        }
    }

    pub fn with_submit_only_valid(mut self, submit_only_valid: bool) -> Self {
        self.submit_only_valid = submit_only_valid;
        self
    }

    /// 注册设备的 next 槽位发送端
    pub fn register_device(&mut self, profile: DeviceProfile, next_tx: Sender<PreparedWork<T::Image>>) {
        self.slots.insert(profile.id, DeviceSlot { profile, next_tx });
    }

    pub fn stats(&self) -> ControllerStats {
        self.stats
    }

    /// 同步处理一条指令
    pub fn handle(&mut self, message: DispatchMessage) -> MinerResult<()> {
        match message {
            DispatchMessage::CreateNextWorkItem { device_id } => self.create_next_work_item(device_id),
            DispatchMessage::VerifyCandidate {
                device_id,
                data_words,
                nonce,
            } => self.verify_candidate(device_id, &data_words, nonce),
        }
    }

    /// 获取下一份工作，编译、补丁、链接后放进设备的 next 槽位
    pub fn create_next_work_item(&mut self, device_id: usize) -> MinerResult<()> {
        let slot = self
            .slots
            .get(&device_id)
            .ok_or(MinerError::UnknownDevice(device_id))?;
        debug!("Getting new work for device {}", device_id);

        let work = self.source.fetch_work()?;
        self.target.set(work.target);

        let source = render_kernel_source(&self.params, &work)?;
        let mut compiled = self.toolchain.compile(&source, &slot.profile)?;
        let report = patcher::patch_bfi_int(compiled.as_mut_bytes(), &self.patch)?;
        debug!(
            "Device {}: patched {} BFI_INT instructions ({} scanned)",
            device_id, report.patched, report.instructions_scanned
        );
        let image = self.toolchain.link(compiled, &slot.profile)?;

        match slot.next_tx.try_send(PreparedWork { work, image }) {
            Ok(()) => {
                self.stats.work_items += 1;
                Ok(())
            }
            Err(TrySendError::Full(_)) => Err(MinerError::SlotOccupied { device: device_id }),
            Err(TrySendError::Disconnected(_)) => {
                debug!("Device {} pipeline is gone, dropping prepared work", device_id);
                Ok(())
            }
        }
    }

    /// 提交候选 nonce；结果只记录日志，不回传给设备
    pub fn verify_candidate(&mut self, device_id: usize, data_words: &[u32; 32], nonce: u32) -> MinerResult<()> {
        self.stats.candidates += 1;
        // 按大端数值打印 nonce 字节
        let display_nonce = nonce.swap_bytes();

        let meets_target = self.locally_valid(data_words, nonce);
        if !meets_target {
            self.stats.below_target += 1;
            debug!(
                "Device {} candidate nonce {} does not meet the target locally",
                device_id, display_nonce
            );
            if self.submit_only_valid {
                return Ok(());
            }
        }

        self.stats.submitted += 1;
        if self.source.submit_candidate(data_words, nonce)? {
            self.stats.accepted += 1;
            info!("Device {} solved block with nonce {}.", device_id, display_nonce);
        } else {
            info!("Device {} found false positive with nonce {}.", device_id, display_nonce);
        }
        Ok(())
    }

    /// 主机端双 SHA-256 是否满足当前目标
    fn locally_valid(&self, data_words: &[u32; 32], nonce: u32) -> bool {
        let hash = sha256d_header(data_words, nonce);
        self.target.get().is_met_by(&hash)
    }

    /// 阻塞读取并处理消息，直到所有发送端关闭或收到关闭信号
    pub fn run(mut self, queue: Receiver<DispatchMessage>, shutdown: &AtomicBool) -> MinerResult<ControllerStats> {
        loop {
            match queue.recv_timeout(SHUTDOWN_CHECK_INTERVAL) {
                Ok(message) => {
                    debug!("Controller processing {}", message_kind(&message));
                    if let Err(err) = self.handle(message) {
                        shutdown.store(true, Ordering::SeqCst);
                        return Err(err);
                    }
                }
                Err(RecvTimeoutError::Timeout) => {
                    if shutdown.load(Ordering::SeqCst) {
                        break;
                    }
                }
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        if !queue.is_empty() {
            warn!("Controller stopping with {} queued instructions", queue.len());
        }
        Ok(self.stats)
    }
}

fn message_kind(message: &DispatchMessage) -> String {
    match message {
        DispatchMessage::CreateNextWorkItem { device_id } => format!("CreateNextWorkItem({device_id})"),
        DispatchMessage::VerifyCandidate { device_id, nonce, .. } => {
            format!("VerifyCandidate({device_id}, {nonce:#010x})")
        }
    }
}
