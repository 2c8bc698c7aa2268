//! 运行配置和设备共享数据结构定义

use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;

use byteorder::{ByteOrder, LittleEndian};

use crate::error::{MinerError, MinerResult};
use crate::patcher::PatchBounds;

/// 每个 GPU 线程负责的 lane 数量 (必须与内核模板中的 LANES_PER_THREAD 一致)
pub const LANES_PER_THREAD: usize = 4;

/// 单个 lane 记录在设备结果缓冲区中的字节数
pub const LANE_RECORD_SIZE: usize = 16;

/// 每个工作项的默认内循环次数
pub const DEFAULT_ITERATIONS: u32 = 0x1000;

/// 每个 SIMD 的默认线程数
pub const DEFAULT_THREADS_PER_SIMD: u32 = 320;

/// Lane 状态 (设备写入，主机读取)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LaneStatus {
    /// 仍在搜索分配的 nonce 区间
    Searching = 0,
    /// 找到一个候选 nonce (current_nonce 已经越过它)
    CandidateFound = 1,
    /// 区间已搜索完毕
    Exhausted = 2,
}

impl LaneStatus {
    pub fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(Self::Searching),
            1 => Some(Self::CandidateFound),
            2 => Some(Self::Exhausted),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

/// 单个 lane 的状态记录
///
/// 设备端布局 (16 字节, 小端):
///   status @0, _pad[3] @1, current_nonce @4, end_nonce @8, _reserved @12
///
/// `status` 以原始字节保存，未定义的值要等到主机解析时才报告为错误。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LaneRecord {
    pub status: u8,
    pub current_nonce: u32,
    pub end_nonce: u32,
}

impl LaneRecord {
    /// 新分配区间的 lane，从 `start` 开始搜索到 `end` (不含)
    pub fn searching(start: u32, end: u32) -> Self {
        Self {
            status: LaneStatus::Searching.as_u8(),
            current_nonce: start,
            end_nonce: end,
        }
    }

    pub fn status(&self) -> Option<LaneStatus> {
        LaneStatus::from_raw(self.status)
    }

    pub fn at_boundary(&self) -> bool {
        self.current_nonce == self.end_nonce
    }

    pub fn read_from(bytes: &[u8]) -> Self {
        Self {
            status: bytes[0],
            current_nonce: LittleEndian::read_u32(&bytes[4..8]),
            end_nonce: LittleEndian::read_u32(&bytes[8..12]),
        }
    }

    pub fn write_to(&self, bytes: &mut [u8]) {
        bytes[..LANE_RECORD_SIZE].fill(0);
        bytes[0] = self.status;
        LittleEndian::write_u32(&mut bytes[4..8], self.current_nonce);
        LittleEndian::write_u32(&mut bytes[8..12], self.end_nonce);
    }

    /// 把 lane 数组编码为设备缓冲区的字节布局
    pub fn encode_all(lanes: &[LaneRecord]) -> Vec<u8> {
        let mut bytes = vec![0u8; lanes.len() * LANE_RECORD_SIZE];
        for (lane, chunk) in lanes.iter().zip(bytes.chunks_exact_mut(LANE_RECORD_SIZE)) {
            lane.write_to(chunk);
        }
        bytes
    }

    pub fn decode_all(bytes: &[u8], lanes: &mut [LaneRecord]) {
        for (lane, chunk) in lanes.iter_mut().zip(bytes.chunks_exact(LANE_RECORD_SIZE)) {
            *lane = LaneRecord::read_from(chunk);
        }
    }
}

/// 设备选择过滤器 (显式 id 集合与数量上限互斥)
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum DeviceSelection {
    #[default]
    All,
    /// 只使用这些设备 id
    Ids(BTreeSet<usize>),
    /// 只使用前 n 台设备
    First(usize),
}

impl DeviceSelection {
    pub fn from_args(ids: Option<Vec<usize>>, max_devices: Option<usize>) -> MinerResult<Self> {
        match (ids, max_devices) {
            (Some(_), Some(_)) => Err(MinerError::Config(
                "cannot specify a device set and a maximum number of devices concurrently".into(),
            )),
            (Some(ids), None) => Ok(Self::Ids(ids.into_iter().collect())),
            (None, Some(0)) | (None, None) => Ok(Self::All),
            (None, Some(n)) => Ok(Self::First(n)),
        }
    }

    /// `id` 是设备在枚举顺序中的序号
    pub fn includes(&self, id: usize) -> bool {
        match self {
            Self::All => true,
            Self::Ids(ids) => ids.contains(&id),
            Self::First(n) => id < *n,
        }
    }
}

/// getwork 服务器地址和认证
#[derive(Clone, PartialEq, Eq)]
pub struct RpcEndpoint {
    pub server: String,
    pub port: u16,
    pub user: String,
    pub password: String,
}

impl Default for RpcEndpoint {
    fn default() -> Self {
        Self {
            server: "localhost".into(),
            port: 8332,
            user: "bitcoin".into(),
            password: "password".into(),
        }
    }
}

// 配置会整体写进日志，密码不能出现在里面
impl fmt::Debug for RpcEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RpcEndpoint")
            .field("server", &self.server)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &"***")
            .finish()
    }
}

impl RpcEndpoint {
    pub fn url(&self) -> String {
        format!("http://{}:{}/", self.server, self.port)
    }

    /// 设置 `user:password` 形式的认证信息
    pub fn with_auth(mut self, auth: &str) -> MinerResult<Self> {
        let (user, password) = auth
            .split_once(':')
            .ok_or_else(|| MinerError::Config(format!("auth must be user:password, got {auth}")))?;
        self.user = user.to_string();
        self.password = password.to_string();
        Ok(self)
    }
}

/// 进程级配置，启动时构造一次，以引用传给各组件
#[derive(Debug, Clone)]
pub struct MinerConfig {
    pub devices: DeviceSelection,
    /// 每次调度中每个 lane 的迭代次数
    pub iterations: u32,
    pub threads_per_simd: u32,
    pub verbosity: u8,
    pub endpoint: RpcEndpoint,
    /// 调度循环节拍
    pub poll_interval: Duration,
    /// 汇总算力的输出周期
    pub stats_interval: Duration,
    pub patch: PatchBounds,
    /// 只提交通过主机端校验的候选
    pub submit_only_valid: bool,
}

impl Default for MinerConfig {
    fn default() -> Self {
        Self {
            devices: DeviceSelection::All,
            iterations: DEFAULT_ITERATIONS,
            threads_per_simd: DEFAULT_THREADS_PER_SIMD,
            verbosity: 0,
            endpoint: RpcEndpoint::default(),
            poll_interval: Duration::from_millis(1),
            stats_interval: Duration::from_millis(1000),
            patch: PatchBounds::default(),
            submit_only_valid: false,
        }
    }
}

impl MinerConfig {
    pub fn validate(&self) -> MinerResult<()> {
        if self.iterations == 0 {
            return Err(MinerError::Config("iterations must be greater than 0".into()));
        }
        if self.threads_per_simd == 0 {
            return Err(MinerError::Config("threads per SIMD must be greater than 0".into()));
        }
        if self.patch.expected_min > self.patch.expected_max {
            return Err(MinerError::Config(format!(
                "expected patch range is empty: {}-{}",
                self.patch.expected_min, self.patch.expected_max
            )));
        }
        if self.poll_interval.is_zero() {
            return Err(MinerError::Config("poll interval must be non-zero".into()));
        }
        Ok(())
    }

    /// 一台设备上的 lane 总数
    pub fn lanes_for(&self, simd_count: u32) -> usize {
        simd_count as usize * self.threads_per_simd as usize * LANES_PER_THREAD
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lane_record_layout() {
        let lane = LaneRecord {
            status: LaneStatus::CandidateFound.as_u8(),
            current_nonce: 0x12345678,
            end_nonce: 0x9ABCDEF0,
        };
        let mut bytes = [0xFFu8; LANE_RECORD_SIZE];
        lane.write_to(&mut bytes);
        assert_eq!(
            bytes,
            [
                0x01, 0, 0, 0, 0x78, 0x56, 0x34, 0x12, 0xF0, 0xDE, 0xBC, 0x9A, 0, 0, 0, 0
            ]
        );
        assert_eq!(LaneRecord::read_from(&bytes), lane);
    }

    #[test]
    fn test_lane_status_raw_values() {
        assert_eq!(LaneStatus::from_raw(0), Some(LaneStatus::Searching));
        assert_eq!(LaneStatus::from_raw(1), Some(LaneStatus::CandidateFound));
        assert_eq!(LaneStatus::from_raw(2), Some(LaneStatus::Exhausted));
        assert_eq!(LaneStatus::from_raw(3), None);
    }

    #[test]
    fn test_decode_ignores_padding() {
        let mut bytes = LaneRecord::encode_all(&[LaneRecord::searching(1, 2)]);
        bytes[1] = 0xAA;
        bytes[13] = 0xBB;
        let mut lanes = [LaneRecord::default()];
        LaneRecord::decode_all(&bytes, &mut lanes);
        assert_eq!(lanes[0], LaneRecord::searching(1, 2));
    }

    #[test]
    fn test_device_selection_is_exclusive() {
        let err = DeviceSelection::from_args(Some(vec![0]), Some(2)).unwrap_err();
        assert!(err.to_string().contains("concurrently"));

        let ids = DeviceSelection::from_args(Some(vec![2, 0]), None).unwrap();
        assert!(ids.includes(0));
        assert!(!ids.includes(1));
        assert!(ids.includes(2));

        let first = DeviceSelection::from_args(None, Some(2)).unwrap();
        assert!(first.includes(1));
        assert!(!first.includes(2));

        assert_eq!(
            DeviceSelection::from_args(None, None).unwrap(),
            DeviceSelection::All
        );
    }

    #[test]
    fn test_endpoint_auth() {
        let endpoint = RpcEndpoint::default().with_auth("alice:s3:cret").unwrap();
        assert_eq!(endpoint.user, "alice");
        assert_eq!(endpoint.password, "s3:cret");
        assert_eq!(endpoint.url(), "http://localhost:8332/");
        assert!(RpcEndpoint::default().with_auth("nopassword").is_err());
    }

    #[test]
    fn test_debug_hides_password() {
        let config = MinerConfig {
            endpoint: RpcEndpoint::default().with_auth("miner:hunter2").unwrap(),
            ..MinerConfig::default()
        };
        let printed = format!("{:?}", config);
        assert!(!printed.contains("hunter2"), "{}", printed);
        assert!(printed.contains("user: \"miner\""));
        assert!(printed.contains("password: \"***\""));
    }

    #[test]
    fn test_config_validation() {
        let config = MinerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.lanes_for(20), 20 * 320 * 4);

        let bad = MinerConfig {
            iterations: 0,
            ..MinerConfig::default()
        };
        assert!(bad.validate().is_err());
    }
}
