//! 测试公共模块
//!
//! 内存中的假工具链、假设备和脚本化工作源，用于在没有 GPU 的机器上
//! 测试补丁器、流水线和调度循环。

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use rust_gpuminer::config::{LaneRecord, LaneStatus};
use rust_gpuminer::patcher::{self, END_MARKER, Op3Opcode, SECTION_MARKER};
use rust_gpuminer::work::{Target, WorkItem};
use rust_gpuminer::{
    CompiledKernel, DeviceHandle, DeviceProfile, KernelToolchain, MinerError, MinerResult, WorkSource,
};

/// 操作码字段位置
pub const OPCODE_SHIFT: u32 = 45;

/// 每个守卫字段的最低位
pub const GUARD_BITS: [u32; 10] = [63, 60, 44, 41, 29, 26, 25, 22, 12, 9];

/// 所有守卫位 (pred_sel 占 2 位，index_mode 占 3 位)
pub const GUARD_MASK: u64 = (1 << 63)
    | (1 << 60)
    | (1 << 44)
    | (1 << 41)
    | (0x3 << 29)
    | (0x7 << 26)
    | (1 << 25)
    | (1 << 22)
    | (1 << 12)
    | (1 << 9);

pub const OPCODE_MASK: u64 = 0x1f << OPCODE_SHIFT;

pub fn op3_word(opcode: Op3Opcode) -> u64 {
    (opcode as u64) << OPCODE_SHIFT
}

/// 构造带结束标记、17 个段标记和给定指令字的二进制
pub fn synthetic_binary(words: &[u64]) -> Vec<u8> {
    let mut bytes = b"\x7fELF kernel source ... ".to_vec();
    bytes.extend_from_slice(END_MARKER.as_bytes());
    for i in 0..17 {
        bytes.extend_from_slice(format!("<section {i}>").as_bytes());
        bytes.extend_from_slice(SECTION_MARKER.as_bytes());
    }
    // 最后一个标记起 12 字节处是第一条指令
    bytes.extend_from_slice(&[0xEE; 5]);
    for word in words {
        bytes.extend_from_slice(&word.to_le_bytes());
    }
    bytes
}

pub fn profile(id: usize) -> DeviceProfile {
    DeviceProfile {
        id,
        name: format!("Fake GPU {id}"),
        simd_count: 1,
        target: "fake".into(),
        supports_bfi_patch: true,
    }
}

/// 编译结果固定为含 `bfe_int` 条 BFE_INT 的合成二进制
#[derive(Clone)]
pub struct FakeToolchain {
    pub bfe_int: usize,
    pub compiles: Arc<AtomicUsize>,
}

impl FakeToolchain {
    pub fn new(bfe_int: usize) -> Self {
        Self {
            bfe_int,
            compiles: Arc::default(),
        }
    }
}

impl KernelToolchain for FakeToolchain {
    type Image = Vec<u8>;

    fn compile(&self, source: &str, _profile: &DeviceProfile) -> MinerResult<CompiledKernel> {
        assert!(source.contains(END_MARKER));
        self.compiles.fetch_add(1, Ordering::SeqCst);
        let mut words = vec![op3_word(Op3Opcode::BfeInt); self.bfe_int];
        words.push(op3_word(Op3Opcode::BfeUint));
        words.push(op3_word(Op3Opcode::ByteAlignInt));
        Ok(CompiledKernel::new(synthetic_binary(&words)))
    }

    fn link(&self, kernel: CompiledKernel, _profile: &DeviceProfile) -> MinerResult<Vec<u8>> {
        Ok(kernel.into_bytes())
    }
}

/// 假设备的可观察记录
#[derive(Debug, Default)]
pub struct DeviceLog {
    pub loads: usize,
    pub unloads: usize,
    pub launches: usize,
    /// 每次加载后写入的初始 lane 划分
    pub partitions: Vec<Vec<LaneRecord>>,
    /// 加载的镜像里是否还残留 BFE_INT
    pub unpatched_loads: usize,
}

/// 用软件模拟内核: 每次启动每个 lane 前进 `step` 个 nonce，
/// 区间里包含 `solution` 时报告候选
pub struct FakeDevice {
    profile: DeviceProfile,
    lanes: Vec<LaneRecord>,
    step: u32,
    solution: u32,
    polls_until_complete: usize,
    pending_polls: usize,
    fresh_load: bool,
    corrupt_at_launch: Option<usize>,
    launches: usize,
    pub log: Arc<Mutex<DeviceLog>>,
}

impl FakeDevice {
    pub fn new(id: usize, step: u32, solution: u32) -> Self {
        Self {
            profile: profile(id),
            lanes: Vec::new(),
            step,
            solution,
            polls_until_complete: 1,
            pending_polls: 0,
            fresh_load: false,
            corrupt_at_launch: None,
            launches: 0,
            log: Arc::default(),
        }
    }

    /// 第 `launch` 次启动后 lane 0 报告未定义的状态
    pub fn corrupting(mut self, launch: usize) -> Self {
        self.corrupt_at_launch = Some(launch);
        self
    }

    fn run_lane(&self, lane: &mut LaneRecord) {
        if lane.status() != Some(LaneStatus::Searching) {
            return;
        }
        let remaining = lane.end_nonce.wrapping_sub(lane.current_nonce);
        let span = remaining.min(self.step);
        let offset = self.solution.wrapping_sub(lane.current_nonce);
        if offset < span {
            lane.current_nonce = self.solution.wrapping_add(1);
            lane.status = LaneStatus::CandidateFound.as_u8();
        } else if span == remaining {
            lane.current_nonce = lane.end_nonce;
            lane.status = LaneStatus::Exhausted.as_u8();
        } else {
            lane.current_nonce = lane.current_nonce.wrapping_add(span);
        }
    }
}

impl DeviceHandle for FakeDevice {
    type Image = Vec<u8>;

    fn profile(&self) -> &DeviceProfile {
        &self.profile
    }

    fn load(&mut self, image: &Vec<u8>, lane_count: usize) -> MinerResult<()> {
        let report = patcher::scan(image, image.len())?;
        let mut log = self.log.lock().unwrap();
        log.loads += 1;
        if report.bfe_int != 0 {
            log.unpatched_loads += 1;
        }
        self.lanes = vec![LaneRecord::default(); lane_count];
        self.fresh_load = true;
        Ok(())
    }

    fn unload(&mut self) -> MinerResult<()> {
        self.log.lock().unwrap().unloads += 1;
        self.lanes.clear();
        Ok(())
    }

    fn write_lanes(&mut self, lanes: &[LaneRecord]) -> MinerResult<()> {
        if self.lanes.len() != lanes.len() {
            return Err(MinerError::Backend("lane buffer size mismatch".into()));
        }
        self.lanes.copy_from_slice(lanes);
        if self.fresh_load {
            self.fresh_load = false;
            self.log.lock().unwrap().partitions.push(lanes.to_vec());
        }
        Ok(())
    }

    fn read_lanes(&mut self, lanes: &mut [LaneRecord]) -> MinerResult<()> {
        lanes.copy_from_slice(&self.lanes);
        Ok(())
    }

    fn launch(&mut self) -> MinerResult<()> {
        let mut lanes = std::mem::take(&mut self.lanes);
        for lane in &mut lanes {
            self.run_lane(lane);
        }
        self.lanes = lanes;
        self.launches += 1;
        if self.corrupt_at_launch == Some(self.launches) {
            self.lanes[0].status = 9;
        }
        self.pending_polls = self.polls_until_complete;
        self.log.lock().unwrap().launches += 1;
        Ok(())
    }

    fn is_complete(&mut self) -> MinerResult<bool> {
        if self.pending_polls == 0 {
            return Ok(true);
        }
        self.pending_polls -= 1;
        Ok(false)
    }
}

/// 按顺序发放编号工作 (编号写在 data 第 0 个字)，记录所有提交
#[derive(Clone, Default)]
pub struct ScriptedSource {
    pub fetched: Arc<AtomicUsize>,
    pub submitted: Arc<Mutex<Vec<(u32, u32)>>>,
    /// 发放这么多份工作后返回协议错误
    pub fail_after: Option<usize>,
}

impl WorkSource for ScriptedSource {
    fn fetch_work(&mut self) -> MinerResult<WorkItem> {
        let fetched = self.fetched.fetch_add(1, Ordering::SeqCst);
        if self.fail_after.is_some_and(|limit| fetched >= limit) {
            return Err(MinerError::Protocol("work source went away".into()));
        }
        let mut work = WorkItem::synthetic();
        work.data_words[0] = fetched as u32 + 1;
        work.target = Target::DIFFICULTY_ONE;
        Ok(work)
    }

    fn submit_candidate(&mut self, data_words: &[u32; 32], nonce: u32) -> MinerResult<bool> {
        self.submitted.lock().unwrap().push((data_words[0], nonce));
        Ok(true)
    }
}
