//! Memory and virtual address space resources.

use core::marker::PhantomData;

use rm_cap::objects::{LocalMemory, SystemMemory};
use rm_cap::share::{ShareRequest, default_share_allowed};
use rm_cap::{LastRelease, ResourceClass, ResourceKind, RmError, RmResult, SharedRef};
use rm_ctrl::allocation::{MemoryAllocParams, VaSpaceAllocParams};

use super::{
    AllocContext, DupContext, GpuResource, GpuResourceBase, Layers, Resource, RmResource,
    RmResourceBase, Shareable, alloc_params, write_alloc_params,
};
use crate::env::ServerEnv;
use crate::hal::AddressSpace;

const PAGE_SIZE: u64 = 0x1000;

/// Default size of a virtual address space (1 TiB).
pub const DEFAULT_VA_SIZE: u64 = 1 << 40;

/// Memory classes and where their pages live.
pub trait MemoryKind: ResourceKind + Send {
    /// Address space CPU mappings target.
    const SPACE: AddressSpace;
}

impl MemoryKind for SystemMemory {
    const SPACE: AddressSpace = AddressSpace::System;
}

impl MemoryKind for LocalMemory {
    const SPACE: AddressSpace = AddressSpace::Video;
}

/// Backing allocation shared by duplicated memory handles.
#[derive(Debug)]
pub struct MemoryBacking {
    size: u64,
    space: AddressSpace,
}

impl MemoryBacking {
    /// Allocation size.
    #[inline]
    #[must_use]
    pub const fn size(&self) -> u64 {
        self.size
    }
}

impl LastRelease for MemoryBacking {
    fn last_release(&self) {
        log::debug!("memory: released {:#x} bytes of {:?}", self.size, self.space);
    }
}

/// A memory allocation.
#[derive(Debug)]
pub struct MemoryApi<K: MemoryKind> {
    gpu: GpuResourceBase,
    backing: Option<SharedRef<MemoryBacking>>,
    _kind: PhantomData<K>,
}

impl<K: MemoryKind> MemoryApi<K> {
    /// Allocate `size` bytes, rounded up to a page.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` for a zero size or a parent off the GPU.
    pub fn construct(ctx: AllocContext<'_>, params: &mut [u8]) -> RmResult<Self> {
        let mut p: MemoryAllocParams = alloc_params(params)?;
        if p.size == 0 {
            return Err(RmError::InvalidArgument);
        }
        p.size = p
            .size
            .checked_next_multiple_of(PAGE_SIZE)
            .ok_or(RmError::InvalidArgument)?;
        let identity = ctx.parent_identity()?;
        write_alloc_params(&p, params)?;
        Ok(Self {
            gpu: GpuResourceBase::new(RmResourceBase::new(ctx.base, ctx.owner), identity),
            backing: Some(SharedRef::new(MemoryBacking {
                size: p.size,
                space: K::SPACE,
            })),
            _kind: PhantomData,
        })
    }

    /// Allocation size; zero once torn down.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.backing.as_ref().map_or(0, |b| b.size())
    }
}

impl<K: MemoryKind> Resource for MemoryApi<K> {
    gpu_resource_views!(gpu);

    fn class(&self) -> ResourceClass {
        K::CLASS
    }

    fn as_shareable(&self) -> Option<&dyn Shareable> {
        Some(self)
    }

    fn destruct(&mut self, env: &ServerEnv) {
        if self.gpu.rm_mut().base_mut().begin_teardown(Layers::OWN) {
            self.backing = None;
        }
        self.gpu.destruct(env);
    }
}

impl<K: MemoryKind> RmResource for MemoryApi<K> {
    fn rm_base(&self) -> &RmResourceBase {
        self.gpu.rm()
    }

    fn rm_base_mut(&mut self) -> &mut RmResourceBase {
        self.gpu.rm_mut()
    }

    /// Memory is also shareable within the owning process.
    fn share_callback(&self, req: &ShareRequest<'_>) -> bool {
        self.rm_base()
            .share_policies()
            .evaluate(req)
            .unwrap_or_else(|| default_share_allowed(req) || req.info.pid == req.owner.pid)
    }
}

impl<K: MemoryKind> GpuResource for MemoryApi<K> {
    fn gpu_base(&self) -> &GpuResourceBase {
        &self.gpu
    }

    fn gpu_base_mut(&mut self) -> &mut GpuResourceBase {
        &mut self.gpu
    }

    fn map_region(&self, _env: &ServerEnv) -> Option<(AddressSpace, u64)> {
        self.backing.as_ref().map(|b| (K::SPACE, b.size()))
    }
}

impl<K: MemoryKind> Shareable for MemoryApi<K> {
    fn shared_handles(&self) -> usize {
        self.backing.as_ref().map_or(0, SharedRef::ref_count)
    }

    fn copy_construct(&self, ctx: DupContext<'_>) -> RmResult<Box<dyn Resource>> {
        let backing = self.backing.clone().ok_or(RmError::InvalidState)?;
        Ok(Box::new(Self {
            gpu: GpuResourceBase::new(RmResourceBase::new(ctx.base, ctx.owner), self.gpu.identity()),
            backing: Some(backing),
            _kind: PhantomData,
        }))
    }
}

/// Address space shared by duplicated VA space handles.
#[derive(Debug)]
pub struct VaSpaceRecord {
    size: u64,
    flags: u32,
}

impl LastRelease for VaSpaceRecord {
    fn last_release(&self) {
        log::debug!("vaspace: released {:#x} (flags {:#x})", self.size, self.flags);
    }
}

/// A GPU virtual address space.
#[derive(Debug)]
pub struct VaSpaceApi {
    gpu: GpuResourceBase,
    record: Option<SharedRef<VaSpaceRecord>>,
}

impl VaSpaceApi {
    /// Create an address space; a zero size selects [`DEFAULT_VA_SIZE`].
    ///
    /// # Errors
    ///
    /// `InvalidArgument` for a size that is not page aligned.
    pub fn construct(ctx: AllocContext<'_>, params: &mut [u8]) -> RmResult<Self> {
        let mut p: VaSpaceAllocParams = alloc_params(params)?;
        if p.va_size == 0 {
            p.va_size = DEFAULT_VA_SIZE;
        }
        if p.va_size % PAGE_SIZE != 0 {
            return Err(RmError::InvalidArgument);
        }
        let identity = ctx.parent_identity()?;
        write_alloc_params(&p, params)?;
        Ok(Self {
            gpu: GpuResourceBase::new(RmResourceBase::new(ctx.base, ctx.owner), identity),
            record: Some(SharedRef::new(VaSpaceRecord {
                size: p.va_size,
                flags: p.flags,
            })),
        })
    }

    /// Size of the address space; zero once torn down.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.record.as_ref().map_or(0, |r| r.size)
    }
}

impl Resource for VaSpaceApi {
    gpu_resource_views!(gpu);

    fn class(&self) -> ResourceClass {
        ResourceClass::VaSpace
    }

    fn as_shareable(&self) -> Option<&dyn Shareable> {
        Some(self)
    }

    fn destruct(&mut self, env: &ServerEnv) {
        if self.gpu.rm_mut().base_mut().begin_teardown(Layers::OWN) {
            self.record = None;
        }
        self.gpu.destruct(env);
    }
}

impl_rm_resource!(VaSpaceApi, gpu);

impl GpuResource for VaSpaceApi {
    fn gpu_base(&self) -> &GpuResourceBase {
        &self.gpu
    }

    fn gpu_base_mut(&mut self) -> &mut GpuResourceBase {
        &mut self.gpu
    }
}

impl Shareable for VaSpaceApi {
    fn shared_handles(&self) -> usize {
        self.record.as_ref().map_or(0, SharedRef::ref_count)
    }

    fn copy_construct(&self, ctx: DupContext<'_>) -> RmResult<Box<dyn Resource>> {
        let record = self.record.clone().ok_or(RmError::InvalidState)?;
        Ok(Box::new(Self {
            gpu: GpuResourceBase::new(RmResourceBase::new(ctx.base, ctx.owner), self.gpu.identity()),
            record: Some(record),
        }))
    }
}
