//! Commands and mapping shared by every GPU resource.

use rm_cap::{Handle, RmError, RmResult};
use rm_ctrl::CtrlCmd;
use rm_ctrl::params::GpuIdentityParams;

use super::{GpuResource, Mapping, Resource};
use crate::control::{ControlCall, Export};
use crate::env::ServerEnv;

pub(crate) const EXPORTS: &[Export] = &[Export::new(CtrlCmd::GetGpuIdentity, ctrl_get_gpu_identity)];

fn ctrl_get_gpu_identity(res: &mut dyn Resource, call: &mut ControlCall<'_>) -> RmResult<()> {
    let identity = res.as_gpu().ok_or(RmError::NotSupported)?.identity();
    call.encode(&GpuIdentityParams {
        gpu_instance: identity.gpu_instance,
        gpu_mask: identity.gpu_mask,
        device_instance: identity.device_instance,
        subdevice_instance: identity.subdevice_instance,
        bc_resource: u32::from(identity.bc_resource),
    })
}

/// Map part of a GPU resource into the CPU address space.
///
/// # Errors
///
/// - `NotSupported` if the resource cannot be mapped
/// - `InvalidArgument` for an empty or out-of-range window
pub(crate) fn map(
    res: &mut dyn GpuResource,
    env: &ServerEnv,
    device: Handle,
    offset: u64,
    length: u64,
) -> RmResult<u64> {
    let (space, size) = res.map_region(env).ok_or(RmError::NotSupported)?;
    let end = offset.checked_add(length).ok_or(RmError::InvalidArgument)?;
    if length == 0 || end > size {
        return Err(RmError::InvalidArgument);
    }
    let identity = res.identity();
    let cpu_address = env.hal.mapper.map(&identity, space, offset, length)?;
    res.gpu_base_mut().add_mapping(Mapping {
        cpu_address,
        length,
        device,
    });
    Ok(cpu_address)
}

/// Remove a mapping made by [`map`].
///
/// # Errors
///
/// - `NotFound` if no live mapping of the resource starts at `cpu_address`
/// - `InvalidArgument` if the mapping was made through another device
pub(crate) fn unmap(
    res: &mut dyn GpuResource,
    env: &ServerEnv,
    device: Handle,
    cpu_address: u64,
) -> RmResult<()> {
    let base = res.gpu_base_mut();
    let mapping = base
        .mappings()
        .iter()
        .find(|m| m.cpu_address == cpu_address)
        .ok_or(RmError::NotFound)?;
    if mapping.device != device {
        return Err(RmError::InvalidArgument);
    }
    let identity = base.identity();
    let mapping = base.take_mapping(cpu_address).ok_or(RmError::NotFound)?;
    env.hal
        .mapper
        .unmap(&identity, mapping.cpu_address, mapping.length)
}
