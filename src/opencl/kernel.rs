//! OpenCL 内核编译、链接与执行

use std::collections::BTreeMap;

use ocl::enums::{ProgramInfo, ProgramInfoResult};
use ocl::{Buffer, Context, Device, Event, Kernel, Program, Queue, SpatialDims};
use log::{debug, info};

use super::context::DeviceContext;
use crate::backend::{CompiledKernel, DeviceHandle, DeviceProfile, KernelToolchain};
use crate::config::{LANE_RECORD_SIZE, LANES_PER_THREAD, LaneRecord};
use crate::error::{MinerError, MinerResult};
use crate::kernel_loader::{KERNEL_ENTRY, build_options};

/// 在控制线程中为每台设备编译/链接程序
pub struct OpenCLToolchain {
    targets: BTreeMap<usize, (Context, Device)>,
}

impl OpenCLToolchain {
    pub fn new<'a>(devices: impl IntoIterator<Item = &'a DeviceContext>) -> Self {
        let targets = devices
            .into_iter()
            .map(|dc| (dc.profile.id, (dc.context.clone(), dc.device)))
            .collect();
        Self { targets }
    }

    fn target(&self, profile: &DeviceProfile) -> MinerResult<&(Context, Device)> {
        self.targets
            .get(&profile.id)
            .ok_or(MinerError::UnknownDevice(profile.id))
    }
}

impl KernelToolchain for OpenCLToolchain {
    type Image = Program;

    fn compile(&self, source: &str, profile: &DeviceProfile) -> MinerResult<CompiledKernel> {
        let (context, device) = self.target(profile)?;
        debug!("Compiling kernel for device {} ({})", profile.id, profile.target);
        let program = Program::builder()
            .devices(*device)
            .src(source)
            .cmplr_opt(build_options(profile.supports_bfi_patch))
            .build(context)?;

        match program.info(ProgramInfo::Binaries) {
            Ok(ProgramInfoResult::Binaries(mut binaries)) if !binaries.is_empty() => {
                Ok(CompiledKernel::new(binaries.swap_remove(0)))
            }
            Ok(other) => Err(MinerError::Backend(format!("no program binary: {other}"))),
            Err(err) => Err(MinerError::backend("read program binary", err)),
        }
    }

    fn link(&self, kernel: CompiledKernel, profile: &DeviceProfile) -> MinerResult<Program> {
        let (context, device) = self.target(profile)?;
        let binaries = [kernel.as_bytes()];
        let program = Program::builder()
            .devices(*device)
            .binaries(&binaries)
            .build(context)?;
        Ok(program)
    }
}

/// 加载在设备上的程序和结果缓冲区
struct Loaded {
    kernel: Kernel,
    lanes: Buffer<u8>,
}

/// 在调度线程中驱动一台设备
pub struct OpenCLDevice {
    profile: DeviceProfile,
    queue: Queue,
    threads_per_group: u32,
    loaded: Option<Loaded>,
    event: Option<Event>,
}

impl OpenCLDevice {
    pub fn new(device: &DeviceContext, threads_per_group: u32) -> Self {
        Self {
            profile: device.profile.clone(),
            queue: device.queue.clone(),
            threads_per_group,
            loaded: None,
            event: None,
        }
    }

    fn loaded(&self) -> MinerResult<&Loaded> {
        self.loaded
            .as_ref()
            .ok_or_else(|| MinerError::Backend(format!("device {} has no program loaded", self.profile.id)))
    }
}

impl DeviceHandle for OpenCLDevice {
    type Image = Program;

    fn profile(&self) -> &DeviceProfile {
        &self.profile
    }

    fn load(&mut self, image: &Program, lane_count: usize) -> MinerResult<()> {
        let lanes = Buffer::<u8>::builder()
            .queue(self.queue.clone())
            .flags(ocl::flags::MEM_READ_WRITE)
            .len(lane_count * LANE_RECORD_SIZE)
            .build()?;

        let kernel = Kernel::builder()
            .program(image)
            .name(KERNEL_ENTRY)
            .queue(self.queue.clone())
            .global_work_size(SpatialDims::One(lane_count / LANES_PER_THREAD))
            .local_work_size(SpatialDims::One(self.threads_per_group as usize))
            .arg(&lanes)
            .build()?;

        debug!("Device {} loaded program with {} lanes", self.profile.id, lane_count);
        self.loaded = Some(Loaded { kernel, lanes });
        Ok(())
    }

    fn unload(&mut self) -> MinerResult<()> {
        self.queue.finish()?;
        self.event = None;
        self.loaded = None;
        Ok(())
    }

    fn write_lanes(&mut self, lanes: &[LaneRecord]) -> MinerResult<()> {
        let bytes = LaneRecord::encode_all(lanes);
        self.loaded()?.lanes.write(&bytes).enq()?;
        Ok(())
    }

    fn read_lanes(&mut self, lanes: &mut [LaneRecord]) -> MinerResult<()> {
        let mut bytes = vec![0u8; lanes.len() * LANE_RECORD_SIZE];
        self.loaded()?.lanes.read(&mut bytes).enq()?;
        LaneRecord::decode_all(&bytes, lanes);
        Ok(())
    }

    fn launch(&mut self) -> MinerResult<()> {
        let mut event = Event::empty();
        unsafe {
            self.loaded()?.kernel.cmd().enew(&mut event).enq()?;
        }
        self.queue.flush()?;
        self.event = Some(event);
        Ok(())
    }

    fn is_complete(&mut self) -> MinerResult<bool> {
        match &self.event {
            Some(event) => Ok(event.is_complete().map_err(ocl::Error::from)?),
            None => Ok(true),
        }
    }
}

impl Drop for OpenCLDevice {
    fn drop(&mut self) {
        if self.loaded.is_some() {
            info!("Releasing device {}", self.profile.id);
            let _ = self.queue.finish();
        }
    }
}
