//! Device and subdevice resources.

use rm_cap::{ResourceClass, RmError, RmResult};
use rm_ctrl::allocation::{DeviceAllocParams, SubdeviceAllocParams};

use super::{
    AllocContext, GpuResource, GpuResourceBase, Layers, Resource, RmResourceBase, alloc_params,
};
use crate::env::ServerEnv;
use crate::hal::AddressSpace;

/// A device: every GPU of a broadcast group.
#[derive(Debug)]
pub struct DeviceApi {
    gpu: GpuResourceBase,
    device_id: u32,
}

impl DeviceApi {
    /// Resolve the device token and bind to its GPUs.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` for malformed parameters or an unknown token.
    pub fn construct(ctx: AllocContext<'_>, params: &mut [u8]) -> RmResult<Self> {
        let p: DeviceAllocParams = alloc_params(params)?;
        let identity = ctx.env.hal.resolver.resolve(p.device_id)?;
        log::debug!(
            "device: token {} -> gpus {:#x} as {}",
            p.device_id,
            identity.gpu_mask,
            ctx.base.handle()
        );
        Ok(Self {
            gpu: GpuResourceBase::new(RmResourceBase::new(ctx.base, ctx.owner), identity),
            device_id: p.device_id,
        })
    }

    /// Token the device was resolved from.
    #[inline]
    #[must_use]
    pub const fn device_id(&self) -> u32 {
        self.device_id
    }
}

impl Resource for DeviceApi {
    gpu_resource_views!(gpu);

    fn class(&self) -> ResourceClass {
        ResourceClass::Device
    }

    fn destruct(&mut self, env: &ServerEnv) {
        self.gpu.rm_mut().base_mut().begin_teardown(Layers::OWN);
        self.gpu.destruct(env);
    }
}

impl_rm_resource!(DeviceApi, gpu);

impl GpuResource for DeviceApi {
    fn gpu_base(&self) -> &GpuResourceBase {
        &self.gpu
    }

    fn gpu_base_mut(&mut self) -> &mut GpuResourceBase {
        &mut self.gpu
    }
}

/// A subdevice: one GPU of its device.
#[derive(Debug)]
pub struct SubdeviceApi {
    gpu: GpuResourceBase,
}

impl SubdeviceApi {
    /// Narrow the parent device to one GPU.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` if the subdevice index is out of range.
    pub fn construct(ctx: AllocContext<'_>, params: &mut [u8]) -> RmResult<Self> {
        let p: SubdeviceAllocParams = alloc_params(params)?;
        let device = ctx.parent_identity()?;
        if p.sub_device_id >= ctx.env.hal.resolver.subdevice_count(&device) {
            return Err(RmError::InvalidArgument);
        }
        let identity = device.unicast(p.sub_device_id);
        Ok(Self {
            gpu: GpuResourceBase::new(RmResourceBase::new(ctx.base, ctx.owner), identity),
        })
    }
}

impl Resource for SubdeviceApi {
    gpu_resource_views!(gpu);

    fn class(&self) -> ResourceClass {
        ResourceClass::Subdevice
    }

    fn destruct(&mut self, env: &ServerEnv) {
        self.gpu.rm_mut().base_mut().begin_teardown(Layers::OWN);
        self.gpu.destruct(env);
    }
}

impl_rm_resource!(SubdeviceApi, gpu);

impl GpuResource for SubdeviceApi {
    fn gpu_base(&self) -> &GpuResourceBase {
        &self.gpu
    }

    fn gpu_base_mut(&mut self) -> &mut GpuResourceBase {
        &mut self.gpu
    }

    fn map_region(&self, env: &ServerEnv) -> Option<(AddressSpace, u64)> {
        let (_, size) = env.hal.resolver.register_window(&self.gpu.identity());
        Some((AddressSpace::Register, size))
    }

    fn reg_window(&self, env: &ServerEnv) -> RmResult<(u64, u64)> {
        Ok(env.hal.resolver.register_window(&self.gpu.identity()))
    }
}
