//! OpenCL 平台和设备发现

use ocl::enums::{DeviceInfo, DeviceInfoResult};
use ocl::{Context, Device, Platform, Queue};
use log::{debug, info};

use crate::backend::DeviceProfile;
use crate::error::{MinerError, MinerResult};

/// 补丁后的 BFI_INT 需要的扩展 (`amd_bfe`)
pub const BFI_EXTENSION: &str = "cl_amd_media_ops2";

/// 一台 GPU 设备及其上下文和命令队列
pub struct DeviceContext {
    pub profile: DeviceProfile,
    pub platform: Platform,
    pub device: Device,
    pub context: Context,
    pub queue: Queue,
}

fn compute_units(device: &Device) -> MinerResult<u32> {
    match device.info(DeviceInfo::MaxComputeUnits) {
        Ok(DeviceInfoResult::MaxComputeUnits(units)) => Ok(units),
        Ok(other) => Err(MinerError::Backend(format!("unexpected compute unit info: {other}"))),
        Err(err) => Err(MinerError::backend("query compute units", err)),
    }
}

fn extensions(device: &Device) -> MinerResult<String> {
    match device.info(DeviceInfo::Extensions) {
        Ok(DeviceInfoResult::Extensions(extensions)) => Ok(extensions),
        Ok(other) => Ok(other.to_string()),
        Err(err) => Err(MinerError::backend("query extensions", err)),
    }
}

/// 按平台顺序枚举所有 GPU，序号即设备 id
pub fn discover() -> MinerResult<Vec<DeviceContext>> {
    let platforms: Vec<Platform> = ocl::core::get_platform_ids()
        .map_err(|err| MinerError::backend("list OpenCL platforms", err))?
        .into_iter()
        .map(Platform::new)
        .collect();
    if platforms.is_empty() {
        return Err(MinerError::Backend("no OpenCL platforms found".into()));
    }
    info!("Found {} OpenCL platform(s)", platforms.len());

    let mut found = Vec::new();
    for platform in platforms {
        let devices = match Device::list(platform, Some(ocl::flags::DEVICE_TYPE_GPU)) {
            Ok(devices) => devices,
            Err(err) => {
                debug!("Platform {:?} has no GPU devices: {}", platform.name(), err);
                continue;
            }
        };
        for device in devices {
            let name = device.name()?;
            let profile = DeviceProfile {
                id: found.len(),
                target: name.clone(),
                simd_count: compute_units(&device)?,
                supports_bfi_patch: extensions(&device)?.contains(BFI_EXTENSION),
                name,
            };
            info!(
                "Device {}: {} ({} SIMDs{})",
                profile.id,
                profile.name,
                profile.simd_count,
                if profile.supports_bfi_patch { ", BFI_INT" } else { "" }
            );

            let context = Context::builder().platform(platform).devices(device).build()?;
            let queue = Queue::new(&context, device, None)?;
            found.push(DeviceContext {
                profile,
                platform,
                device,
                context,
                queue,
            });
        }
    }
    Ok(found)
}
