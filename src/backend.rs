//! 计算后端和内核工具链接口
//!
//! 调度器只通过这两个 trait 访问设备，OpenCL 实现在 `opencl` 模块，
//! 测试使用内存中的假实现。后端任何调用失败都是致命的。

use crate::config::LaneRecord;
use crate::error::MinerResult;
use crate::patcher;

/// 一台计算设备的属性
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceProfile {
    /// 枚举顺序中的序号
    pub id: usize,
    pub name: String,
    pub simd_count: u32,
    /// 设备家族/目标标识
    pub target: String,
    /// 是否支持补丁后的 BFI_INT 指令
    pub supports_bfi_patch: bool,
}

/// 编译后、链接前的内核二进制，由补丁器原地修改
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledKernel {
    bytes: Vec<u8>,
}

impl CompiledKernel {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn as_mut_bytes(&mut self) -> &mut [u8] {
        &mut self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// 内核编译器 (在控制线程中使用)
pub trait KernelToolchain: Send {
    /// 可以加载到设备上的可执行镜像
    type Image: Send + 'static;

    fn compile(&self, source: &str, profile: &DeviceProfile) -> MinerResult<CompiledKernel>;

    fn link(&self, kernel: CompiledKernel, profile: &DeviceProfile) -> MinerResult<Self::Image>;

    /// 可读形式，默认列出补丁区域的指令字
    fn disassemble(&self, kernel: &CompiledKernel, bytes_to_scan: usize) -> MinerResult<String> {
        Ok(patcher::listing(kernel.as_bytes(), bytes_to_scan)?)
    }
}

/// 单台设备的操作 (在调度线程中使用)
pub trait DeviceHandle {
    type Image;

    fn profile(&self) -> &DeviceProfile;

    /// 加载镜像并为 `lane_count` 个 lane 分配结果缓冲区
    fn load(&mut self, image: &Self::Image, lane_count: usize) -> MinerResult<()>;

    /// 释放 `load` 分配的资源
    fn unload(&mut self) -> MinerResult<()>;

    fn write_lanes(&mut self, lanes: &[LaneRecord]) -> MinerResult<()>;

    fn read_lanes(&mut self, lanes: &mut [LaneRecord]) -> MinerResult<()>;

    /// 启动执行网格，不等待完成
    fn launch(&mut self) -> MinerResult<()>;

    /// 非阻塞地查询上一次 `launch` 是否完成
    fn is_complete(&mut self) -> MinerResult<bool>;
}
