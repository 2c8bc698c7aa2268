//! Nonce 空间划分
//!
//! 32 位 nonce 空间按 lane 顺序均分为 `floor(2^32 / L)` 大小的连续区间。
//! L 不能整除 2^32 时，区间末尾的余数部分不会被搜索 (可接受的近似)。

use crate::config::LaneRecord;

/// 32 位 nonce 空间大小
pub const NONCE_SPACE: u64 = 1 << 32;

/// 半开区间 `[start, end)`。`end` 可能等于 2^32，所以用 u64 表示。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NonceRange {
    pub start: u64,
    pub end: u64,
}

impl NonceRange {
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// 转为设备端的 lane 记录。2^32 截断为 0，内核的 `nonce == end`
    /// 判断在回绕后同样成立。
    ///
    /// 要求区间长度小于 2^32 (即 L >= 2)：整个空间 `[0, 2^32)` 会编码为
    /// `(0, 0)`，设备把它当作空区间。设备的 lane 数总是 4 的倍数。
    pub fn to_lane(self) -> LaneRecord {
        LaneRecord::searching(self.start as u32, self.end as u32)
    }
}

/// 每个 lane 分到的 nonce 数
pub fn nonces_per_lane(lanes: usize) -> u64 {
    if lanes == 0 {
        return 0;
    }
    NONCE_SPACE / lanes as u64
}

/// 为 `lanes` 个 lane 生成区间，从 0 开始按顺序分配
pub fn partition(lanes: usize) -> impl Iterator<Item = NonceRange> {
    let size = nonces_per_lane(lanes);
    (0..lanes as u64).map(move |i| NonceRange {
        start: i * size,
        end: (i + 1) * size,
    })
}

/// 用新区间重置所有 lane
pub fn reset_lanes(lanes: &mut [LaneRecord]) {
    let count = lanes.len();
    for (lane, range) in lanes.iter_mut().zip(partition(count)) {
        *lane = range.to_lane();
    }
}
