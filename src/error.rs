//! 错误类型
//!
//! 所有错误都是致命的：调用方记录错误链后退出进程。

use thiserror::Error;

use crate::patcher::PatchError;

pub type MinerResult<T> = Result<T, MinerError>;

#[derive(Error, Debug)]
pub enum MinerError {
    /// 计算后端调用失败 (驱动/硬件状态不可信)
    #[error("compute backend: {0}")]
    Backend(String),

    /// 工作源不可达或返回了格式错误的数据
    #[error("work source protocol: {0}")]
    Protocol(String),

    /// 内核二进制布局与补丁器的假设不符
    #[error("kernel patch validation failed")]
    PatchValidation(#[from] PatchError),

    /// 设备报告了未定义的 lane 状态
    #[error("*bug*: invalid status {raw:#04x} for device {device} lane {lane}")]
    InvalidLaneStatus { device: usize, lane: usize, raw: u8 },

    #[error("invalid configuration: {0}")]
    Config(String),

    /// 控制线程已退出，下一份工作永远不会到达
    #[error("controller stopped before preparing work for device {device}")]
    ControllerStopped { device: usize },

    /// 设备的 next 槽位已被占用 (每台设备同时最多一个待提升的工作)
    #[error("next work slot of device {device} is already occupied")]
    SlotOccupied { device: usize },

    #[error("unknown device {0}")]
    UnknownDevice(usize),
}

impl MinerError {
    pub fn backend(context: &str, err: impl std::fmt::Display) -> Self {
        Self::Backend(format!("{context} failed: {err}"))
    }

    pub fn protocol(context: &str, err: impl std::fmt::Display) -> Self {
        Self::Protocol(format!("{context}: {err}"))
    }
}

#[cfg(feature = "opencl")]
impl From<ocl::Error> for MinerError {
    fn from(err: ocl::Error) -> Self {
        Self::Backend(err.to_string())
    }
}

impl From<reqwest::Error> for MinerError {
    fn from(err: reqwest::Error) -> Self {
        Self::Protocol(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lane_status_message() {
        let err = MinerError::InvalidLaneStatus {
            device: 1,
            lane: 7,
            raw: 0x2a,
        };
        assert_eq!(
            err.to_string(),
            "*bug*: invalid status 0x2a for device 1 lane 7"
        );
    }

    #[test]
    fn test_patch_error_converts() {
        let err: MinerError = PatchError::UnexpectedPatchCount {
            patched: 3,
            min: 950,
            max: 1024,
        }
        .into();
        assert!(matches!(err, MinerError::PatchValidation(_)));
    }
}
