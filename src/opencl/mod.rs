//! OpenCL 计算后端

pub mod context;
pub mod kernel;

pub use context::{BFI_EXTENSION, DeviceContext, discover};
pub use kernel::{OpenCLDevice, OpenCLToolchain};
