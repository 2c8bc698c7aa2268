//! GPU 比特币挖矿工作流水线 - Rust + OpenCL 实现
//!
//! 本库把多台 GPU 驱动在一个循环里: 获取工作、编译并补丁内核二进制、
//! 在设备上执行、轮询完成、收获每个 lane 的结果，然后换新工作。
//! 核心是每台设备的双缓冲流水线和内核二进制的 BFI_INT 指令补丁器。

pub mod api;
pub mod backend;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod kernel_loader;
#[cfg(feature = "opencl")]
pub mod opencl;
pub mod partition;
pub mod patcher;
pub mod pipeline;
pub mod rpc;
pub mod scheduler;
pub mod work;

pub use api::{Disassembly, MiningSummary, disassemble_with, run_with};
#[cfg(feature = "opencl")]
pub use api::{disassemble, run_miner};
pub use backend::{CompiledKernel, DeviceHandle, DeviceProfile, KernelToolchain};
pub use config::{DeviceSelection, LaneRecord, LaneStatus, MinerConfig, RpcEndpoint};
pub use dispatch::{Controller, ControllerStats, DispatchMessage};
pub use error::{MinerError, MinerResult};
pub use patcher::{PatchBounds, PatchError, PatchReport, patch_bfi_int};
pub use pipeline::{DevicePipeline, LaneAssessment, PipelineState};
pub use rpc::{GetworkClient, WorkSource};
pub use scheduler::{Scheduler, SchedulerStats};
pub use work::{Target, WorkItem};
