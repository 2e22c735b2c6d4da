//! Resource server
//!
//! Per-client handle tables, the allocation/free/duplicate/share/control
//! entry points and the locks that order them.
//!
//! # Tables
//!
//! ```text
//! Tables
//! ├── client 0xc1d00000 ──► objects
//! │                           0xc1d00000  Client      (root)
//! │                           0xcaf00000  Device      children [0xcaf00001]
//! │                           0xcaf00001  ChannelGroup
//! └── client 0xc1d00001 ──► ...
//! ```
//!
//! Each object entry holds its class, its parent and children, the rights of
//! the handle, and the resource behind its own lock.
//!
//! # Locking
//!
//! | Path              | Order                                           |
//! |-------------------|-------------------------------------------------|
//! | alloc, duplicate  | table → resource → group                        |
//! | control           | (table, released) → GPU → resource → group      |
//! | free              | (table, released) → GPU → resource → group      |
//!
//! The table lock is never taken while a resource or the GPU lock is held.

use std::collections::BTreeMap;
use std::sync::Arc;

use rm_cap::objects::{
    ChannelGroup, Client, ContextShare, Device, LocalMemory, Subdevice, SystemMemory, VaSpace,
};
use rm_cap::share::{SharePolicy, ShareRequest};
use rm_cap::{
    AccessRights, ClientInfo, Handle, IdPool, Privilege, ResourceClass, ResourceKind, RmError,
    RmResult,
};
use rm_ctrl::escape::DupHeader;
use rm_ctrl::{CtrlCmd, CtrlFlags};
use spin::Mutex;
use zerocopy::{FromBytes, Immutable, IntoBytes};

use crate::config::ServerConfig;
use crate::control::{self, ControlCall};
use crate::env::ServerEnv;
use crate::hal::{Hal, SimGpu};
use crate::resource::{
    AllocContext, ClientResource, DupContext, Resource, ResourceBase, construct, gpu as gpu_res,
};

type SharedResource = Arc<Mutex<Box<dyn Resource>>>;

/// Published after every successful control call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ControlEvent {
    /// Calling client.
    pub client: Handle,
    /// Target object.
    pub handle: Handle,
    /// Command the client issued.
    pub cmd: CtrlCmd,
    /// Command that ran after routing.
    pub executed: CtrlCmd,
}

type Observer = Box<dyn Fn(&ControlEvent) + Send + Sync>;

struct ObjectEntry {
    class: ResourceClass,
    parent: Handle,
    rights: AccessRights,
    children: Vec<Handle>,
    resource: SharedResource,
}

impl ObjectEntry {
    fn new(class: ResourceClass, parent: Handle, rights: AccessRights, res: Box<dyn Resource>) -> Self {
        Self {
            class,
            parent,
            rights,
            children: Vec::new(),
            resource: Arc::new(Mutex::new(res)),
        }
    }
}

struct ClientEntry {
    index: u32,
    info: ClientInfo,
    objects: BTreeMap<Handle, ObjectEntry>,
    next_handle: u32,
}

impl ClientEntry {
    fn object(&self, handle: Handle) -> RmResult<&ObjectEntry> {
        self.objects.get(&handle).ok_or(RmError::NotFound)
    }

    /// Objects other than the client root.
    fn object_count(&self) -> usize {
        self.objects.len().saturating_sub(1)
    }

    /// Pick the handle for a new object without consuming it.
    fn pick_handle(&self, requested: Handle) -> RmResult<Handle> {
        if !requested.is_null() {
            if requested.is_client() {
                return Err(RmError::InvalidArgument);
            }
            if self.objects.contains_key(&requested) {
                return Err(RmError::InvalidState);
            }
            return Ok(requested);
        }
        let mut raw = self.next_handle;
        while self.objects.contains_key(&Handle::from_raw(raw)) {
            raw = raw.checked_add(1).ok_or(RmError::NoMemory)?;
        }
        Ok(Handle::from_raw(raw))
    }

    fn insert(&mut self, handle: Handle, entry: ObjectEntry) {
        if let Some(parent) = self.objects.get_mut(&entry.parent) {
            parent.children.push(handle);
        }
        if handle.raw() >= self.next_handle {
            self.next_handle = handle.raw().saturating_add(1);
        }
        self.objects.insert(handle, entry);
    }

    /// Unlink `root` and its subtree, children before parents.
    fn detach(&mut self, root: Handle) -> Vec<(Handle, ObjectEntry)> {
        let mut order = Vec::new();
        let mut stack = vec![root];
        while let Some(handle) = stack.pop() {
            if let Some(entry) = self.objects.get(&handle) {
                stack.extend(entry.children.iter().copied());
                order.push(handle);
            }
        }
        let parent = self.objects.get(&root).map(|e| e.parent);
        if let Some(parent) = parent.and_then(|p| self.objects.get_mut(&p)) {
            parent.children.retain(|&h| h != root);
        }
        order
            .into_iter()
            .rev()
            .filter_map(|h| self.objects.remove(&h).map(|e| (h, e)))
            .collect()
    }
}

struct Tables {
    clients: BTreeMap<Handle, ClientEntry>,
    client_ids: IdPool,
}

impl Tables {
    fn client(&self, handle: Handle) -> RmResult<&ClientEntry> {
        self.clients.get(&handle).ok_or(RmError::NotFound)
    }

    fn client_mut(&mut self, handle: Handle) -> RmResult<&mut ClientEntry> {
        self.clients.get_mut(&handle).ok_or(RmError::NotFound)
    }
}

/// Rights of a freshly allocated handle.
const fn default_rights(class: ResourceClass) -> AccessRights {
    match class {
        ResourceClass::Client => Client::DEFAULT_RIGHTS,
        ResourceClass::Device => Device::DEFAULT_RIGHTS,
        ResourceClass::Subdevice => Subdevice::DEFAULT_RIGHTS,
        ResourceClass::SystemMemory => SystemMemory::DEFAULT_RIGHTS,
        ResourceClass::LocalMemory => LocalMemory::DEFAULT_RIGHTS,
        ResourceClass::VaSpace => VaSpace::DEFAULT_RIGHTS,
        ResourceClass::ChannelGroup => ChannelGroup::DEFAULT_RIGHTS,
        ResourceClass::ContextShare => ContextShare::DEFAULT_RIGHTS,
    }
}

/// The resource server.
pub struct RmServer {
    env: ServerEnv,
    tables: Mutex<Tables>,
    gpu_lock: Mutex<()>,
    observers: Mutex<Vec<Observer>>,
}

impl RmServer {
    /// Create a server over `hal`.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` if the configuration is inconsistent.
    pub fn new(config: ServerConfig, hal: Hal) -> RmResult<Self> {
        let client_ids = IdPool::new(config.max_clients);
        let env = ServerEnv::new(config, hal)?;
        log::info!(
            "server: up ({} clients, {} groups, {} channels)",
            env.config.max_clients,
            env.config.max_channel_groups,
            env.config.max_channels
        );
        Ok(Self {
            env,
            tables: Mutex::new(Tables {
                clients: BTreeMap::new(),
                client_ids,
            }),
            gpu_lock: Mutex::new(()),
            observers: Mutex::new(Vec::new()),
        })
    }

    /// Create a server over a fresh single-GPU simulator.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` if the configuration is inconsistent.
    pub fn simulated(config: ServerConfig) -> RmResult<(Self, Arc<SimGpu>)> {
        let sim = Arc::new(SimGpu::default());
        let server = Self::new(config, Hal::simulated(&sim))?;
        Ok((server, sim))
    }

    /// Shared environment.
    #[inline]
    #[must_use]
    pub const fn env(&self) -> &ServerEnv {
        &self.env
    }

    // -- Clients

    /// Register a client.
    ///
    /// # Errors
    ///
    /// `ResourceExhausted` if the client table is full.
    pub fn alloc_client(&self, info: ClientInfo) -> RmResult<Handle> {
        self.alloc_client_as(info, Handle::NULL)
    }

    /// Register a client under `requested`, or a fresh handle if null.
    ///
    /// # Errors
    ///
    /// - `InvalidArgument` if `requested` is outside the client range
    /// - `InvalidState` if `requested` is taken
    /// - `ResourceExhausted` if the client table is full
    pub fn alloc_client_as(&self, info: ClientInfo, requested: Handle) -> RmResult<Handle> {
        let mut tables = self.tables.lock();
        let index = if requested.is_null() {
            tables.client_ids.allocate()?
        } else if requested.is_client() {
            tables
                .client_ids
                .allocate_specific(requested.raw() - Handle::CLIENT_BASE)?
        } else {
            return Err(RmError::InvalidArgument);
        };
        let handle = Handle::client(index);
        let root = ObjectEntry::new(
            ResourceClass::Client,
            Handle::NULL,
            default_rights(ResourceClass::Client),
            Box::new(ClientResource::new(handle, info)),
        );
        let mut objects = BTreeMap::new();
        objects.insert(handle, root);
        tables.clients.insert(
            handle,
            ClientEntry {
                index,
                info,
                objects,
                next_handle: Handle::OBJECT_BASE,
            },
        );
        log::info!("client {}: allocated (pid {}, {:?})", handle, info.pid, info.privilege);
        Ok(handle)
    }

    /// Free a client and everything it owns, children first.
    ///
    /// # Errors
    ///
    /// `NotFound` for an unknown client.
    pub fn free_client(&self, client: Handle) -> RmResult<()> {
        let entries = {
            let mut tables = self.tables.lock();
            let mut entry = tables.clients.remove(&client).ok_or(RmError::NotFound)?;
            tables.client_ids.free(entry.index);
            entry.detach(client)
        };
        log::info!("client {}: freeing {} objects", client, entries.len());
        self.destroy(entries);
        Ok(())
    }

    /// Number of live clients.
    #[must_use]
    pub fn client_count(&self) -> usize {
        self.tables.lock().clients.len()
    }

    // -- Allocation

    /// Allocate an object of class `class_id` under `parent`.
    ///
    /// `params` holds the class's allocation parameters (empty for all
    /// defaults); in/out fields are written back.
    ///
    /// # Errors
    ///
    /// - `NotFound` if the client or parent is missing
    /// - `NotSupported` for an unknown class
    /// - `InvalidArgument` if the parent class does not accept the child, or
    ///   the requested handle is in the client range
    /// - `InvalidState` if the requested handle is taken
    /// - `NoMemory` if the client's handle quota is used up
    /// - Constructor errors; nothing is left behind
    pub fn allocate(
        &self,
        client: Handle,
        parent: Handle,
        requested: Handle,
        class_id: u32,
        params: &mut [u8],
    ) -> RmResult<Handle> {
        let class = ResourceClass::from_id(class_id).ok_or(RmError::NotSupported)?;
        if class == ResourceClass::Client {
            return Err(RmError::InvalidArgument);
        }

        let mut tables = self.tables.lock();
        let entry = tables.client(client)?;
        if entry.object_count() >= self.env.config.max_handles_per_client as usize {
            log::warn!("client {}: handle quota exhausted", client);
            return Err(RmError::NoMemory);
        }
        let parent_entry = entry.object(parent)?;
        if !class.accepts_parent(parent_entry.class) {
            log::warn!("client {}: {} cannot live under {}", client, class, parent_entry.class);
            return Err(RmError::InvalidArgument);
        }
        let handle = entry.pick_handle(requested)?;

        let resource = {
            let parent_res = parent_entry.resource.lock();
            let objects = &entry.objects;
            let lookup = |h: Handle| objects.get(&h).map(|e| e.class);
            let ctx = AllocContext {
                env: &self.env,
                base: ResourceBase::new(client, handle, parent),
                owner: entry.info,
                parent: &**parent_res,
                lookup: &lookup,
            };
            construct(class, ctx, params)?
        };

        tables.client_mut(client)?.insert(
            handle,
            ObjectEntry::new(class, parent, default_rights(class), resource),
        );
        log::debug!("client {}: allocated {} as {}", client, class, handle);
        Ok(handle)
    }

    /// [`allocate`](Self::allocate) with typed parameters.
    ///
    /// # Errors
    ///
    /// As [`allocate`](Self::allocate).
    pub fn alloc_with<P: IntoBytes + FromBytes + Immutable>(
        &self,
        client: Handle,
        parent: Handle,
        class: ResourceClass,
        params: &mut P,
    ) -> RmResult<Handle> {
        self.allocate(client, parent, Handle::NULL, class.id(), params.as_mut_bytes())
    }

    /// Free an object and its subtree; freeing the client handle frees the
    /// client.
    ///
    /// # Errors
    ///
    /// `NotFound` if the client or object is missing.
    pub fn free(&self, client: Handle, handle: Handle) -> RmResult<()> {
        if handle == client {
            return self.free_client(client);
        }
        let entries = {
            let mut tables = self.tables.lock();
            let entry = tables.client_mut(client)?;
            entry.object(handle)?;
            entry.detach(handle)
        };
        log::debug!("client {}: freeing {} ({} objects)", client, handle, entries.len());
        self.destroy(entries);
        Ok(())
    }

    /// Destruct detached entries in order under the GPU lock.
    fn destroy(&self, entries: Vec<(Handle, ObjectEntry)>) {
        let _gpu = self.gpu_lock.lock();
        for (handle, entry) in entries {
            let mut res = entry.resource.lock();
            log::trace!("destroy: {} {}", entry.class, handle);
            res.destruct(&self.env);
        }
    }

    // -- Duplication and sharing

    /// Duplicate `src` of `src_client` into `dst_client` under `dst_parent`.
    ///
    /// The new handle shares the source's backing state. With
    /// [`DupHeader::FLAG_REJECT_KERNEL_DUP_PRIVILEGE`] a kernel destination
    /// goes through the share policy like anyone else.
    ///
    /// # Errors
    ///
    /// - `NotFound` if a client, the source or the destination parent is
    ///   missing
    /// - `PermissionDenied` if the source handle lacks `DUP` or the share
    ///   policy vetoes the destination
    /// - `NotSupported` if the source cannot be duplicated
    /// - `InvalidArgument` for an unsuitable destination parent
    /// - `NoMemory` if the destination's handle quota is used up
    pub fn duplicate(
        &self,
        src_client: Handle,
        src: Handle,
        dst_client: Handle,
        dst_parent: Handle,
        requested: Handle,
        flags: u32,
    ) -> RmResult<Handle> {
        let mut tables = self.tables.lock();
        let src_entry = tables.client(src_client)?.object(src)?;
        let (class, rights) = (src_entry.class, src_entry.rights);
        let src_res = src_entry.resource.clone();
        let dst = tables.client(dst_client)?;
        let dst_info = dst.info;

        let (handle, resource) = {
            let res = src_res.lock();
            let shareable = res
                .as_shareable()
                .filter(|s| s.can_copy())
                .ok_or(RmError::NotSupported)?;
            if !rights.contains(AccessRights::DUP) {
                return Err(RmError::PermissionDenied);
            }
            let rm = res.as_rm().ok_or(RmError::NotSupported)?;
            let info = if flags & DupHeader::FLAG_REJECT_KERNEL_DUP_PRIVILEGE != 0
                && dst_info.privilege == Privilege::Kernel
            {
                dst_info.with_privilege(Privilege::Admin)
            } else {
                dst_info
            };
            let owner = *rm.rm_base().owner();
            let req = ShareRequest {
                client: dst_client,
                info: &info,
                owner: &owner,
                access: rights,
            };
            if !rm.share_callback(&req) {
                log::warn!("dup: {} {} refused for client {}", class, src, dst_client);
                return Err(RmError::PermissionDenied);
            }

            if dst.object_count() >= self.env.config.max_handles_per_client as usize {
                return Err(RmError::NoMemory);
            }
            let parent_entry = dst.object(dst_parent)?;
            if !class.accepts_parent(parent_entry.class)
                || Arc::ptr_eq(&parent_entry.resource, &src_res)
            {
                return Err(RmError::InvalidArgument);
            }
            let handle = dst.pick_handle(requested)?;
            let parent_res = parent_entry.resource.lock();
            shareable.validate_dup_parent(&**parent_res)?;
            let resource = shareable.copy_construct(DupContext {
                base: ResourceBase::new(dst_client, handle, dst_parent),
                owner: dst_info,
                parent: &**parent_res,
            })?;
            (handle, resource)
        };

        tables
            .client_mut(dst_client)?
            .insert(handle, ObjectEntry::new(class, dst_parent, rights, resource));
        log::debug!(
            "dup: {} {}/{} -> {}/{}",
            class,
            src_client,
            src,
            dst_client,
            handle
        );
        Ok(handle)
    }

    /// Add or revoke a share policy on an object.
    ///
    /// # Errors
    ///
    /// - `NotFound` if the client or object is missing
    /// - `NotSupported` if the object carries no policies
    pub fn share(&self, client: Handle, handle: Handle, policy: SharePolicy) -> RmResult<()> {
        let res = self.resource(client, handle)?;
        let mut res = res.lock();
        let rm = res.as_rm_mut().ok_or(RmError::NotSupported)?;
        rm.rm_base_mut().apply_share(policy);
        log::debug!("share: {} {:?} {:?}", handle, policy.action, policy.share_type);
        Ok(())
    }

    /// Client-visible handles sharing the object's backing state.
    ///
    /// # Errors
    ///
    /// `NotFound` if the client or object is missing.
    pub fn get_ref_count(&self, client: Handle, handle: Handle) -> RmResult<usize> {
        let res = self.resource(client, handle)?;
        let res = res.lock();
        Ok(res.as_shareable().map_or(1, |s| s.shared_handles()))
    }

    // -- Control

    /// Run control command `cmd_id` on an object.
    ///
    /// # Errors
    ///
    /// - `NotSupported` for an unknown command or one the class does not
    ///   export
    /// - `NotFound` if the client or object is missing
    /// - `InvalidArgument` if `params` is not exactly the command's size
    /// - `PermissionDenied` for missing rights or privilege, or an internal
    ///   command
    /// - Handler errors
    pub fn control(&self, client: Handle, handle: Handle, cmd_id: u32, params: &mut [u8]) -> RmResult<()> {
        self.dispatch(client, handle, cmd_id, params, false)
    }

    /// Run a control command from a trusted internal path, with kernel
    /// privilege.
    ///
    /// # Errors
    ///
    /// As [`control`](Self::control), minus the internal-only rejection.
    pub fn internal_control(
        &self,
        client: Handle,
        handle: Handle,
        cmd_id: u32,
        params: &mut [u8],
    ) -> RmResult<()> {
        self.dispatch(client, handle, cmd_id, params, true)
    }

    /// [`control`](Self::control) with typed parameters.
    ///
    /// # Errors
    ///
    /// As [`control`](Self::control).
    pub fn control_with<P: IntoBytes + FromBytes + Immutable>(
        &self,
        client: Handle,
        handle: Handle,
        cmd: CtrlCmd,
        params: &mut P,
    ) -> RmResult<()> {
        self.control(client, handle, cmd.id(), params.as_mut_bytes())
    }

    fn dispatch(
        &self,
        client: Handle,
        handle: Handle,
        cmd_id: u32,
        params: &mut [u8],
        internal: bool,
    ) -> RmResult<()> {
        let cmd = CtrlCmd::from_id(cmd_id).ok_or(RmError::NotSupported)?;
        let (class, rights, resource, mut caller) = {
            let tables = self.tables.lock();
            let entry = tables.client(client)?;
            let object = entry.object(handle)?;
            (object.class, object.rights, object.resource.clone(), entry.info)
        };
        let export = control::lookup(class, cmd).ok_or(RmError::NotSupported)?;
        if internal {
            caller = caller.with_privilege(Privilege::Kernel);
        }
        let info = cmd.info();
        let mut call = ControlCall {
            env: &self.env,
            client,
            caller,
            internal,
            cmd,
            params,
        };
        if let Err(err) = control::check_call(info, rights, &call) {
            log::warn!("control: {} on {} rejected: {}", cmd, handle, err);
            return Err(err);
        }
        let (executed, export) = control::route(class, export, &self.env);
        if executed != cmd {
            call.cmd = executed;
            call.internal = true;
        }

        let result = {
            let _gpu = info
                .flags
                .contains(CtrlFlags::GPU_LOCK)
                .then(|| self.gpu_lock.lock());
            let mut res = resource.lock();
            control::invoke(&mut **res, export, &mut call)
        };

        if result.is_ok() {
            self.notify(&ControlEvent {
                client,
                handle,
                cmd,
                executed,
            });
        }
        result
    }

    /// Register an observer of successful control calls.
    pub fn subscribe(&self, observer: impl Fn(&ControlEvent) + Send + Sync + 'static) {
        self.observers.lock().push(Box::new(observer));
    }

    fn notify(&self, event: &ControlEvent) {
        for observer in self.observers.lock().iter() {
            observer(event);
        }
    }

    // -- Mapping

    /// Map part of `memory` into the CPU address space through `device`.
    ///
    /// # Errors
    ///
    /// - `NotFound` if a handle is missing
    /// - `InvalidArgument` if `device` is not a device or subdevice, is on
    ///   other GPUs, or the window is out of range
    /// - `PermissionDenied` if the handle lacks `MAP`
    /// - `NotSupported` if the object cannot be mapped
    pub fn map(
        &self,
        client: Handle,
        device: Handle,
        memory: Handle,
        offset: u64,
        length: u64,
    ) -> RmResult<u64> {
        let (device_res, memory_res) = self.map_targets(client, device, memory, AccessRights::MAP)?;
        let _gpu = self.gpu_lock.lock();
        let device_mask = match device_res {
            Some(dev) => Some(
                dev.lock()
                    .as_gpu()
                    .map(|g| g.identity().gpu_mask)
                    .ok_or(RmError::InvalidArgument)?,
            ),
            None => None,
        };
        let mut res = memory_res.lock();
        let gpu = res.as_gpu_mut().ok_or(RmError::NotSupported)?;
        if device_mask.is_some_and(|mask| mask & gpu.identity().gpu_mask == 0) {
            return Err(RmError::InvalidArgument);
        }
        let cpu_address = gpu_res::map(gpu, &self.env, device, offset, length)?;
        log::debug!("map: {} via {} at {:#x} (+{:#x})", memory, device, cpu_address, length);
        Ok(cpu_address)
    }

    /// Remove a mapping made by [`map`](Self::map).
    ///
    /// # Errors
    ///
    /// - `NotFound` if a handle is missing or no mapping of `memory` starts
    ///   at `cpu_address`
    /// - `InvalidArgument` if the mapping was made through another device
    pub fn unmap(&self, client: Handle, device: Handle, memory: Handle, cpu_address: u64) -> RmResult<()> {
        let (_, memory_res) = self.map_targets(client, device, memory, AccessRights::NONE)?;
        let _gpu = self.gpu_lock.lock();
        let mut res = memory_res.lock();
        let gpu = res.as_gpu_mut().ok_or(RmError::NotSupported)?;
        gpu_res::unmap(gpu, &self.env, device, cpu_address)
    }

    /// Resolve the device (unless it is `memory` itself) and memory objects
    /// of a map call.
    fn map_targets(
        &self,
        client: Handle,
        device: Handle,
        memory: Handle,
        rights: AccessRights,
    ) -> RmResult<(Option<SharedResource>, SharedResource)> {
        let tables = self.tables.lock();
        let entry = tables.client(client)?;
        let dev = entry.object(device)?;
        if !matches!(dev.class, ResourceClass::Device | ResourceClass::Subdevice) {
            return Err(RmError::InvalidArgument);
        }
        let mem = entry.object(memory)?;
        if !mem.rights.contains(rights) {
            return Err(RmError::PermissionDenied);
        }
        let dev_res = (device != memory).then(|| dev.resource.clone());
        Ok((dev_res, mem.resource.clone()))
    }

    /// Register aperture of a GPU object as `(offset, size)`.
    ///
    /// # Errors
    ///
    /// - `NotFound` if the client or object is missing
    /// - `NotSupported` if the object exposes no register window
    pub fn reg_base_offset_and_size(&self, client: Handle, handle: Handle) -> RmResult<(u64, u64)> {
        let res = self.resource(client, handle)?;
        let res = res.lock();
        res.as_gpu().ok_or(RmError::NotSupported)?.reg_window(&self.env)
    }

    // -- Hardware events

    /// The runlist re-admitted a preempted group.
    ///
    /// # Errors
    ///
    /// - `NotFound` if no live group has `tsg_id`
    /// - `InvalidState` if the group is not preempted
    pub fn runlist_readmitted(&self, tsg_id: u32) -> RmResult<()> {
        let _gpu = self.gpu_lock.lock();
        let group = self.env.sched.lookup(tsg_id).ok_or(RmError::NotFound)?;
        group.readmit()?;
        log::debug!("tsg {}: re-admitted", tsg_id);
        Ok(())
    }

    // -- Inspection

    fn resource(&self, client: Handle, handle: Handle) -> RmResult<SharedResource> {
        let tables = self.tables.lock();
        Ok(tables.client(client)?.object(handle)?.resource.clone())
    }

    /// Run `f` on an object under its lock.
    ///
    /// # Errors
    ///
    /// `NotFound` if the client or object is missing.
    pub fn with_resource<R>(
        &self,
        client: Handle,
        handle: Handle,
        f: impl FnOnce(&dyn Resource) -> R,
    ) -> RmResult<R> {
        let res = self.resource(client, handle)?;
        let res = res.lock();
        Ok(f(&**res))
    }

    /// Identity a client was registered with.
    ///
    /// # Errors
    ///
    /// `NotFound` for an unknown client.
    pub fn client_info(&self, client: Handle) -> RmResult<ClientInfo> {
        Ok(self.tables.lock().client(client)?.info)
    }

    /// Class of an object.
    ///
    /// # Errors
    ///
    /// `NotFound` if the client or object is missing.
    pub fn class_of(&self, client: Handle, handle: Handle) -> RmResult<ResourceClass> {
        let tables = self.tables.lock();
        Ok(tables.client(client)?.object(handle)?.class)
    }

    /// Rights of a handle.
    ///
    /// # Errors
    ///
    /// `NotFound` if the client or object is missing.
    pub fn rights_of(&self, client: Handle, handle: Handle) -> RmResult<AccessRights> {
        let tables = self.tables.lock();
        Ok(tables.client(client)?.object(handle)?.rights)
    }

    /// Objects a client holds, excluding the client itself.
    ///
    /// # Errors
    ///
    /// `NotFound` for an unknown client.
    pub fn object_count(&self, client: Handle) -> RmResult<usize> {
        Ok(self.tables.lock().client(client)?.object_count())
    }

    /// Control calls that reached a handler on an object.
    ///
    /// # Errors
    ///
    /// `NotFound` if the client or object is missing.
    pub fn control_count(&self, client: Handle, handle: Handle) -> RmResult<u64> {
        self.with_resource(client, handle, |res| res.base().control_calls())
    }
}

impl core::fmt::Debug for RmServer {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RmServer")
            .field("config", &self.env.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    use rm_cap::objects::{EngineType, PromoteSize, ScheduleState};
    use rm_cap::share::{ShareAction, ShareType};
    use rm_cap::Interface;
    use rm_ctrl::allocation::{
        ChannelGroupAllocParams, CtxShareAllocParams, DeviceAllocParams, MemoryAllocParams,
        SubdeviceAllocParams, VaSpaceAllocParams,
    };
    use rm_ctrl::params::{
        BindParams, ChannelGroupInfoParams, CwdWatermarkParams, GpfifoScheduleParams,
        GpuIdentityParams, InterleaveLevelParams, LgSectorPromotionParams, MakeRealtimeParams,
        MethodBufferDesc, MmuDebugModeParams, PreemptParams, PromoteFaultMethodBuffersParams,
        TimesliceParams, TpcInfo, TpcPartitionModeParams, TpcPartitionTableParams,
        VidmemPromoteParams,
    };
    use zerocopy::FromZeros;

    use crate::hal::PreemptBehavior;
    use crate::resource::{
        AsGpuResource, AsResource, AsSchedulable, AsShareable, ChannelGroupApi, Layers, cast,
        downcast_ref, has_view,
    };

    const OWNER: ClientInfo = ClientInfo::user(100, 0xAA);
    const STRANGER: ClientInfo = ClientInfo::user(200, 0xBB);

    fn server() -> (RmServer, Arc<SimGpu>) {
        RmServer::simulated(ServerConfig::default()).unwrap()
    }

    fn device(server: &RmServer, client: Handle) -> Handle {
        server
            .alloc_with(client, client, ResourceClass::Device, &mut DeviceAllocParams::default())
            .unwrap()
    }

    fn group(server: &RmServer, client: Handle, device: Handle, channels: u32) -> Handle {
        let mut p = ChannelGroupAllocParams {
            h_va_space: 0,
            engine_type: EngineType::Graphics.raw(),
            channel_count: channels,
            flags: 0,
        };
        server
            .alloc_with(client, device, ResourceClass::ChannelGroup, &mut p)
            .unwrap()
    }

    fn ctxshare(server: &RmServer, client: Handle, group: Handle) -> RmResult<(Handle, u32)> {
        let mut p = CtxShareAllocParams::default();
        let handle = server.alloc_with(client, group, ResourceClass::ContextShare, &mut p)?;
        Ok((handle, p.subctx_id))
    }

    fn tsg_id(server: &RmServer, client: Handle, group: Handle) -> u32 {
        let mut p = ChannelGroupInfoParams::default();
        server.control_with(client, group, CtrlCmd::GetInfo, &mut p).unwrap();
        p.tsg_id
    }

    fn state(server: &RmServer, client: Handle, group: Handle) -> ScheduleState {
        server
            .with_resource(client, group, |r| {
                r.as_schedulable()
                    .map_or(ScheduleState::Destroyed, |s| s.schedule_state())
            })
            .unwrap()
    }

    fn bind(server: &RmServer, client: Handle, group: Handle) -> RmResult<()> {
        let mut p = BindParams {
            engine_type: EngineType::Graphics.raw(),
        };
        server.control_with(client, group, CtrlCmd::Bind, &mut p)
    }

    fn schedule(server: &RmServer, client: Handle, group: Handle, enable: bool) -> RmResult<()> {
        let mut p = GpfifoScheduleParams {
            enable: u8::from(enable),
            ..Default::default()
        };
        server.control_with(client, group, CtrlCmd::GpfifoSchedule, &mut p)
    }

    fn preempt(server: &RmServer, client: Handle, group: Handle, timeout_us: u32) -> RmResult<()> {
        let mut p = PreemptParams {
            wait: 1,
            manual_timeout: 1,
            _pad: [0; 2],
            timeout_us,
        };
        server.control_with(client, group, CtrlCmd::Preempt, &mut p)
    }

    fn subctx_in_use(server: &RmServer, client: Handle, group: Handle, id: u32) -> bool {
        server
            .with_resource(client, group, |r| {
                downcast_ref::<ChannelGroupApi>(r)
                    .and_then(ChannelGroupApi::group)
                    .is_some_and(|g| g.lock().subctx_in_use(id))
            })
            .unwrap()
    }

    #[test]
    fn test_client_lifecycle() {
        let (server, _sim) = server();
        let a = server.alloc_client(OWNER).unwrap();
        let b = server.alloc_client(STRANGER).unwrap();
        assert!(a.is_client() && b.is_client());
        assert_ne!(a, b);
        assert_eq!(server.class_of(a, a), Ok(ResourceClass::Client));
        assert_eq!(server.client_count(), 2);
        server.free_client(a).unwrap();
        assert_eq!(server.free_client(a), Err(RmError::NotFound));
        assert_eq!(server.client_count(), 1);
        assert_eq!(
            server.alloc_client_as(OWNER, b),
            Err(RmError::InvalidState)
        );
        assert_eq!(
            server.alloc_client_as(OWNER, Handle::from_raw(Handle::OBJECT_BASE)),
            Err(RmError::InvalidArgument)
        );
    }

    #[test]
    fn test_allocation_rules() {
        let (server, _sim) = server();
        let client = server.alloc_client(OWNER).unwrap();
        let dev = device(&server, client);
        assert_eq!(dev.raw(), Handle::OBJECT_BASE);

        let mut p = CtxShareAllocParams::default();
        assert_eq!(
            server.alloc_with(client, dev, ResourceClass::ContextShare, &mut p),
            Err(RmError::InvalidArgument)
        );
        assert_eq!(
            server.allocate(client, Handle::from_raw(0x1234), Handle::NULL, ResourceClass::Device.id(), &mut []),
            Err(RmError::NotFound)
        );
        assert_eq!(
            server.allocate(client, dev, Handle::NULL, 0xBEEF, &mut []),
            Err(RmError::NotSupported)
        );
        assert_eq!(
            server.allocate(client, client, dev, ResourceClass::Device.id(), &mut []),
            Err(RmError::InvalidState)
        );
        let chosen = Handle::from_raw(0x5000);
        assert_eq!(
            server.allocate(client, dev, chosen, ResourceClass::Subdevice.id(), &mut []),
            Ok(chosen)
        );
        assert_eq!(server.object_count(client), Ok(2));
    }

    #[test]
    fn test_failed_construction_leaves_nothing() {
        let (server, _sim) = server();
        let client = server.alloc_client(OWNER).unwrap();
        let dev = device(&server, client);
        let mut p = SubdeviceAllocParams { sub_device_id: 4 };
        assert_eq!(
            server.alloc_with(client, dev, ResourceClass::Subdevice, &mut p),
            Err(RmError::InvalidArgument)
        );
        let mut mem = MemoryAllocParams::default();
        assert_eq!(
            server.alloc_with(client, dev, ResourceClass::SystemMemory, &mut mem),
            Err(RmError::InvalidArgument)
        );
        assert_eq!(server.object_count(client), Ok(1));
        assert_eq!(server.env().sched.groups_in_use(), 0);
    }

    #[test]
    fn test_handle_quota() {
        let config = ServerConfig {
            max_handles_per_client: 2,
            ..ServerConfig::default()
        };
        let (server, _sim) = RmServer::simulated(config).unwrap();
        let client = server.alloc_client(OWNER).unwrap();
        let dev = device(&server, client);
        server
            .alloc_with(client, dev, ResourceClass::Subdevice, &mut SubdeviceAllocParams::default())
            .unwrap();
        assert_eq!(
            server.alloc_with(client, dev, ResourceClass::VaSpace, &mut VaSpaceAllocParams::default()),
            Err(RmError::NoMemory)
        );
    }

    #[test]
    fn test_handles_not_reused() {
        let (server, _sim) = server();
        let client = server.alloc_client(OWNER).unwrap();
        let first = device(&server, client);
        server.free(client, first).unwrap();
        let second = device(&server, client);
        assert_ne!(first, second);
        assert_eq!(server.class_of(client, first), Err(RmError::NotFound));
    }

    #[test]
    fn test_cast_follows_declared_interfaces() {
        let (server, _sim) = server();
        let client = server.alloc_client(OWNER).unwrap();
        let dev = device(&server, client);
        let sub = server
            .alloc_with(client, dev, ResourceClass::Subdevice, &mut SubdeviceAllocParams::default())
            .unwrap();
        let mut mem = MemoryAllocParams {
            size: 0x1000,
            ..Default::default()
        };
        let sys = server
            .alloc_with(client, dev, ResourceClass::SystemMemory, &mut mem)
            .unwrap();
        let vid = server
            .alloc_with(client, sub, ResourceClass::LocalMemory, &mut mem)
            .unwrap();
        let va = server
            .alloc_with(client, dev, ResourceClass::VaSpace, &mut VaSpaceAllocParams::default())
            .unwrap();
        let tsg = group(&server, client, dev, 1);
        let (ctx, _) = ctxshare(&server, client, tsg).unwrap();

        let interfaces = [
            Interface::Resource,
            Interface::RmResource,
            Interface::GpuResource,
            Interface::Schedulable,
            Interface::Shareable,
        ];
        for handle in [client, dev, sub, sys, vid, va, tsg, ctx] {
            server
                .with_resource(client, handle, |r| {
                    for iface in interfaces {
                        assert_eq!(
                            has_view(r, iface),
                            r.class().interfaces().contains(iface),
                            "{} {:?}",
                            r.class(),
                            iface
                        );
                    }
                })
                .unwrap();
        }

        server
            .with_resource(client, tsg, |r| {
                let a = cast::<AsSchedulable>(r).unwrap();
                let b = cast::<AsSchedulable>(r).unwrap();
                assert!(core::ptr::addr_eq(a, b));
                let c = cast::<AsResource>(r).unwrap();
                assert!(core::ptr::addr_eq(c, r));
                assert!(cast::<AsGpuResource>(r).is_some());
            })
            .unwrap();
        server
            .with_resource(client, dev, |r| {
                assert!(cast::<AsSchedulable>(r).is_none());
                assert!(cast::<AsShareable>(r).is_none());
            })
            .unwrap();
    }

    #[test]
    fn test_destruct_runs_each_layer_once() {
        let (server, sim) = server();
        let env = server.env();
        let client = Handle::client(0);
        let root = ClientResource::new(client, OWNER);
        let lookup = |_: Handle| -> Option<ResourceClass> { None };
        let dev = construct(
            ResourceClass::Device,
            AllocContext {
                env,
                base: ResourceBase::new(client, Handle::from_raw(Handle::OBJECT_BASE), client),
                owner: OWNER,
                parent: &root,
                lookup: &lookup,
            },
            &mut [],
        )
        .unwrap();
        let mut p = MemoryAllocParams {
            size: 0x2000,
            ..Default::default()
        };
        let handle = Handle::from_raw(Handle::OBJECT_BASE + 1);
        let mut mem = construct(
            ResourceClass::SystemMemory,
            AllocContext {
                env,
                base: ResourceBase::new(client, handle, dev.base().handle()),
                owner: OWNER,
                parent: &*dev,
                lookup: &lookup,
            },
            p.as_mut_bytes(),
        )
        .unwrap();
        let gpu = mem.as_gpu_mut().unwrap();
        gpu_res::map(gpu, env, dev.base().handle(), 0, 0x1000).unwrap();
        assert_eq!(sim.live_mappings(), 1);

        mem.destruct(env);
        let all = Layers::OWN | Layers::GPU | Layers::RM | Layers::RESOURCE;
        assert_eq!(mem.base().torn_down(), all);
        assert_eq!(sim.unmaps(), 1);
        mem.destruct(env);
        assert_eq!(sim.unmaps(), 1);
        assert_eq!(mem.base().torn_down(), all);
        assert!(mem.as_shareable().is_some_and(|s| s.shared_handles() == 0));
    }

    #[test]
    fn test_dup_not_copyable() {
        let (server, _sim) = server();
        let client = server.alloc_client(OWNER).unwrap();
        let dev = device(&server, client);
        let sub = server
            .alloc_with(client, dev, ResourceClass::Subdevice, &mut SubdeviceAllocParams::default())
            .unwrap();
        assert_eq!(
            server.duplicate(client, dev, client, client, Handle::NULL, 0),
            Err(RmError::NotSupported)
        );
        assert_eq!(
            server.duplicate(client, sub, client, dev, Handle::NULL, 0),
            Err(RmError::NotSupported)
        );
        assert_eq!(server.object_count(client), Ok(2));
    }

    #[test]
    fn test_dup_shares_group_until_last_release() {
        let (server, sim) = server();
        let client = server.alloc_client(OWNER).unwrap();
        let dev = device(&server, client);
        let tsg = group(&server, client, dev, 2);
        let id = tsg_id(&server, client, tsg);
        bind(&server, client, tsg).unwrap();

        let dups: Vec<Handle> = (0..3)
            .map(|_| server.duplicate(client, tsg, client, dev, Handle::NULL, 0).unwrap())
            .collect();
        assert_eq!(server.get_ref_count(client, tsg), Ok(4));
        assert_eq!(tsg_id(&server, client, dups[2]), id);

        server.free(client, tsg).unwrap();
        server.free(client, dups[0]).unwrap();
        server.free(client, dups[1]).unwrap();
        assert_eq!(server.get_ref_count(client, dups[2]), Ok(1));
        assert!(sim.runlist_entry(id).is_some());
        assert_eq!(server.env().sched.groups_in_use(), 1);

        server.free(client, dups[2]).unwrap();
        assert!(sim.runlist_entry(id).is_none());
        assert_eq!(sim.removals(), vec![id]);
        assert_eq!(server.env().sched.groups_in_use(), 0);
        assert_eq!(server.env().sched.channels_in_use(), 0);
    }

    #[test]
    fn test_ctxshare_record_freed_with_last_handle() {
        let (server, _sim) = server();
        let client = server.alloc_client(OWNER).unwrap();
        let dev = device(&server, client);
        let tsg = group(&server, client, dev, 1);
        let (ctx, id) = ctxshare(&server, client, tsg).unwrap();
        let dup = server.duplicate(client, ctx, client, tsg, Handle::NULL, 0).unwrap();
        assert_eq!(server.get_ref_count(client, dup), Ok(2));

        server.free(client, ctx).unwrap();
        assert!(subctx_in_use(&server, client, tsg, id));
        server.free(client, dup).unwrap();
        assert!(!subctx_in_use(&server, client, tsg, id));
    }

    #[test]
    fn test_ctxshare_dup_needs_same_group() {
        let (server, _sim) = server();
        let client = server.alloc_client(OWNER).unwrap();
        let dev = device(&server, client);
        let first = group(&server, client, dev, 1);
        let second = group(&server, client, dev, 1);
        let (ctx, _) = ctxshare(&server, client, first).unwrap();
        assert_eq!(
            server.duplicate(client, ctx, client, second, Handle::NULL, 0),
            Err(RmError::InvalidArgument)
        );
        let group_dup = server.duplicate(client, first, client, dev, Handle::NULL, 0).unwrap();
        assert!(server.duplicate(client, ctx, client, group_dup, Handle::NULL, 0).is_ok());
    }

    #[test]
    fn test_share_policy_gates_dup() {
        let (server, _sim) = server();
        let owner = server.alloc_client(OWNER).unwrap();
        let other = server.alloc_client(STRANGER).unwrap();
        let dev = device(&server, owner);
        let other_dev = device(&server, other);
        let tsg = group(&server, owner, dev, 1);

        assert_eq!(
            server.duplicate(owner, tsg, other, other_dev, Handle::NULL, 0),
            Err(RmError::PermissionDenied)
        );
        assert_eq!(server.object_count(other), Ok(1));

        let policy = SharePolicy {
            share_type: ShareType::Pid,
            target: STRANGER.pid,
            access: AccessRights::ALL,
            action: ShareAction::Allow,
        };
        server.share(owner, tsg, policy).unwrap();
        let dup = server.duplicate(owner, tsg, other, other_dev, Handle::NULL, 0).unwrap();
        assert_eq!(server.get_ref_count(other, dup), Ok(2));

        server
            .share(
                owner,
                tsg,
                SharePolicy {
                    action: ShareAction::Revoke,
                    ..policy
                },
            )
            .unwrap();
        assert_eq!(
            server.duplicate(owner, tsg, other, other_dev, Handle::NULL, 0),
            Err(RmError::PermissionDenied)
        );
    }

    #[test]
    fn test_kernel_dup_privilege() {
        let (server, _sim) = server();
        let owner = server.alloc_client(OWNER).unwrap();
        let kernel = server
            .alloc_client(STRANGER.with_privilege(Privilege::Kernel))
            .unwrap();
        let dev = device(&server, owner);
        let kernel_dev = device(&server, kernel);
        let tsg = group(&server, owner, dev, 1);
        assert_eq!(
            server.duplicate(
                owner,
                tsg,
                kernel,
                kernel_dev,
                Handle::NULL,
                DupHeader::FLAG_REJECT_KERNEL_DUP_PRIVILEGE
            ),
            Err(RmError::PermissionDenied)
        );
        assert!(server.duplicate(owner, tsg, kernel, kernel_dev, Handle::NULL, 0).is_ok());
    }

    #[test]
    fn test_memory_shared_within_process() {
        let (server, _sim) = server();
        let owner = server.alloc_client(OWNER).unwrap();
        let sibling = server.alloc_client(ClientInfo::user(OWNER.pid, 0xCC)).unwrap();
        let dev = device(&server, owner);
        let sibling_dev = device(&server, sibling);
        let mut p = MemoryAllocParams {
            size: 0x1800,
            ..Default::default()
        };
        let mem = server
            .alloc_with(owner, dev, ResourceClass::SystemMemory, &mut p)
            .unwrap();
        assert_eq!(p.size, 0x2000);
        assert!(server.duplicate(owner, mem, sibling, sibling_dev, Handle::NULL, 0).is_ok());

        let va = server
            .alloc_with(owner, dev, ResourceClass::VaSpace, &mut VaSpaceAllocParams::default())
            .unwrap();
        assert_eq!(
            server.duplicate(owner, va, sibling, sibling_dev, Handle::NULL, 0),
            Err(RmError::PermissionDenied)
        );
    }

    #[test]
    fn test_timeslice_clamped() {
        let (server, sim) = server();
        let client = server.alloc_client(OWNER).unwrap();
        let dev = device(&server, client);
        let tsg = group(&server, client, dev, 1);
        bind(&server, client, tsg).unwrap();
        let bounds = server.env().config.timeslice_bounds();

        let mut p = TimesliceParams { timeslice_us: 10 };
        server.control_with(client, tsg, CtrlCmd::SetTimeslice, &mut p).unwrap();
        assert_eq!(p.timeslice_us, bounds.min_us);

        let mut p = TimesliceParams {
            timeslice_us: u64::MAX,
        };
        server.control_with(client, tsg, CtrlCmd::SetTimeslice, &mut p).unwrap();
        let mut get = TimesliceParams::default();
        server.control_with(client, tsg, CtrlCmd::GetTimeslice, &mut get).unwrap();
        assert_eq!(get.timeslice_us, bounds.max_us);

        let id = tsg_id(&server, client, tsg);
        assert_eq!(sim.runlist_entry(id).map(|e| e.timeslice_us), Some(bounds.max_us));
    }

    #[test]
    fn test_wrong_size_never_runs_handler() {
        let (server, _sim) = server();
        let client = server.alloc_client(OWNER).unwrap();
        let dev = device(&server, client);
        let tsg = group(&server, client, dev, 1);
        let before = server.control_count(client, tsg).unwrap();
        assert_eq!(
            server.control(client, tsg, CtrlCmd::GetTimeslice.id(), &mut [0u8; 4]),
            Err(RmError::InvalidArgument)
        );
        assert_eq!(server.control_count(client, tsg), Ok(before));
        assert_eq!(
            server.control(client, tsg, 0xA06C_01FF, &mut []),
            Err(RmError::NotSupported)
        );
        assert_eq!(
            server.control(client, dev, CtrlCmd::Bind.id(), &mut [0u8; 4]),
            Err(RmError::NotSupported)
        );
        server.control(client, tsg, CtrlCmd::Null.id(), &mut []).unwrap();
        assert_eq!(server.control_count(client, tsg), Ok(before + 1));
    }

    #[test]
    fn test_bind_schedule_preempt() {
        let (server, sim) = server();
        let client = server.alloc_client(OWNER).unwrap();
        let dev = device(&server, client);
        let tsg = group(&server, client, dev, 4);
        let id = tsg_id(&server, client, tsg);
        assert_eq!(state(&server, client, tsg), ScheduleState::Constructed);
        assert_eq!(schedule(&server, client, tsg, true), Err(RmError::InvalidState));

        bind(&server, client, tsg).unwrap();
        let entry = sim.runlist_entry(id).unwrap();
        assert_eq!(entry.channels.len(), 4);
        assert!(!entry.enabled);
        assert_eq!(bind(&server, client, tsg), Err(RmError::InvalidState));

        schedule(&server, client, tsg, true).unwrap();
        assert_eq!(state(&server, client, tsg), ScheduleState::Scheduled);
        assert!(sim.runlist_entry(id).unwrap().enabled);

        preempt(&server, client, tsg, 1000).unwrap();
        assert_eq!(state(&server, client, tsg), ScheduleState::Preempted);
        assert_eq!(sim.preempts(), vec![id]);
        assert_eq!(preempt(&server, client, tsg, 1000), Err(RmError::InvalidState));

        server.runlist_readmitted(id).unwrap();
        assert_eq!(state(&server, client, tsg), ScheduleState::Scheduled);
        assert_eq!(server.runlist_readmitted(id), Err(RmError::InvalidState));
        assert_eq!(server.runlist_readmitted(id + 100), Err(RmError::NotFound));
    }

    #[test]
    fn test_preempt_timeout_stays_preempted() {
        let (server, sim) = server();
        let client = server.alloc_client(OWNER).unwrap();
        let dev = device(&server, client);
        let tsg = group(&server, client, dev, 4);
        bind(&server, client, tsg).unwrap();
        schedule(&server, client, tsg, true).unwrap();

        sim.set_preempt_behavior(PreemptBehavior::Never);
        assert_eq!(preempt(&server, client, tsg, 1000), Err(RmError::Timeout));
        assert_eq!(state(&server, client, tsg), ScheduleState::Preempted);
        assert_eq!(preempt(&server, client, tsg, 0), Err(RmError::InvalidArgument));

        schedule(&server, client, tsg, true).unwrap();
        assert_eq!(state(&server, client, tsg), ScheduleState::Scheduled);
        sim.set_preempt_behavior(PreemptBehavior::Immediate);
        server.free(client, tsg).unwrap();
    }

    #[test]
    fn test_ctxshare_ids() {
        let (server, sim) = server();
        let client = server.alloc_client(OWNER).unwrap();
        let dev = device(&server, client);
        let tsg = group(&server, client, dev, 1);
        let id = tsg_id(&server, client, tsg);
        let (_, a) = ctxshare(&server, client, tsg).unwrap();
        let (_, b) = ctxshare(&server, client, tsg).unwrap();
        assert_ne!(a, b);
        assert_eq!(sim.watermark(id, a), Some(2));

        let mut p = CtxShareAllocParams {
            h_va_space: 0,
            flags: 2,
            subctx_id: 9,
        };
        server
            .alloc_with(client, tsg, ResourceClass::ContextShare, &mut p)
            .unwrap();
        assert_eq!(p.subctx_id, 9);
        assert_eq!(
            server.alloc_with(client, tsg, ResourceClass::ContextShare, &mut p),
            Err(RmError::InvalidState)
        );
    }

    #[test]
    fn test_ctxshare_needs_graphics_group() {
        let (server, _sim) = server();
        let client = server.alloc_client(OWNER).unwrap();
        let dev = device(&server, client);
        let mut p = ChannelGroupAllocParams {
            engine_type: EngineType::Copy(0).raw(),
            channel_count: 1,
            ..Default::default()
        };
        let copy = server
            .alloc_with(client, dev, ResourceClass::ChannelGroup, &mut p)
            .unwrap();
        assert_eq!(ctxshare(&server, client, copy), Err(RmError::NotSupported));
    }

    #[test]
    fn test_tpc_partition_table_size() {
        let (server, sim) = server();
        let client = server.alloc_client(OWNER).unwrap();
        let dev = device(&server, client);
        let tsg = group(&server, client, dev, 1);
        let id = tsg_id(&server, client, tsg);
        let (ctx, subctx) = ctxshare(&server, client, tsg).unwrap();

        let mut p = TpcPartitionTableParams::new_zeroed();
        for (i, info) in p.tpc_list.iter_mut().enumerate() {
            *info = TpcInfo {
                global_tpc_index: i as u16,
                lmem_block_index: 0,
            };
        }
        p.num_used_tpc = 257;
        assert_eq!(
            server.control_with(client, ctx, CtrlCmd::SetTpcPartitionTable, &mut p),
            Err(RmError::InvalidArgument)
        );
        assert_eq!(sim.tpc_table(id, subctx), None);

        p.num_used_tpc = 256;
        server
            .control_with(client, ctx, CtrlCmd::SetTpcPartitionTable, &mut p)
            .unwrap();
        assert_eq!(sim.tpc_table(id, subctx).map(|t| t.len()), Some(256));
    }

    #[test]
    fn test_cwd_watermark_bounds() {
        let (server, sim) = server();
        let client = server.alloc_client(OWNER).unwrap();
        let dev = device(&server, client);
        let tsg = group(&server, client, dev, 1);
        let id = tsg_id(&server, client, tsg);
        let (ctx, subctx) = ctxshare(&server, client, tsg).unwrap();

        for bad in [0, 257] {
            let mut p = CwdWatermarkParams {
                watermark_value: bad,
            };
            assert_eq!(
                server.control_with(client, ctx, CtrlCmd::SetCwdWatermark, &mut p),
                Err(RmError::InvalidArgument)
            );
        }
        let mut get = CwdWatermarkParams::default();
        server.control_with(client, ctx, CtrlCmd::GetCwdWatermark, &mut get).unwrap();
        assert_eq!(get.watermark_value, 2);

        let mut p = CwdWatermarkParams { watermark_value: 7 };
        server.control_with(client, ctx, CtrlCmd::SetCwdWatermark, &mut p).unwrap();
        server.control_with(client, ctx, CtrlCmd::GetCwdWatermark, &mut get).unwrap();
        assert_eq!(get.watermark_value, 7);
        assert_eq!(sim.watermark(id, subctx), Some(7));
    }

    #[test]
    fn test_privileged_and_internal_commands() {
        let (server, sim) = server();
        let user = server.alloc_client(OWNER).unwrap();
        let dev = device(&server, user);
        let tsg = group(&server, user, dev, 1);
        let id = tsg_id(&server, user, tsg);

        let mut level = InterleaveLevelParams {
            tsg_interleave_level: 2,
        };
        assert_eq!(
            server.control_with(user, tsg, CtrlCmd::SetInterleaveLevel, &mut level),
            Err(RmError::PermissionDenied)
        );

        let admin = server
            .alloc_client(OWNER.with_privilege(Privilege::Admin))
            .unwrap();
        let admin_dev = device(&server, admin);
        let admin_tsg = group(&server, admin, admin_dev, 1);
        server
            .control_with(admin, admin_tsg, CtrlCmd::SetInterleaveLevel, &mut level)
            .unwrap();

        let mut promote = VidmemPromoteParams { l1: 1, t1: 2 };
        assert_eq!(
            server.control_with(user, tsg, CtrlCmd::ProgramVidmemPromote, &mut promote),
            Err(RmError::PermissionDenied)
        );
        assert_eq!(sim.vidmem_promote(id), None);
        server
            .internal_control(
                user,
                tsg,
                CtrlCmd::GrProgramVidmemPromote.id(),
                promote.as_mut_bytes(),
            )
            .unwrap();
        assert!(sim.vidmem_promote(id).is_some());

        let mut sched = GpfifoScheduleParams::default();
        assert_eq!(
            server.control_with(user, tsg, CtrlCmd::InternalGpfifoSchedule, &mut sched),
            Err(RmError::PermissionDenied)
        );
    }

    #[test]
    fn test_route_to_physical() {
        let config = ServerConfig {
            route_to_physical: true,
            ..ServerConfig::default()
        };
        let (server, _sim) = RmServer::simulated(config).unwrap();
        let events = Arc::new(StdMutex::new(Vec::new()));
        let sink = events.clone();
        server.subscribe(move |event| {
            if let Ok(mut events) = sink.lock() {
                events.push(*event);
            }
        });

        let client = server.alloc_client(OWNER).unwrap();
        let dev = device(&server, client);
        let tsg = group(&server, client, dev, 1);
        bind(&server, client, tsg).unwrap();
        schedule(&server, client, tsg, true).unwrap();
        assert_eq!(state(&server, client, tsg), ScheduleState::Scheduled);
        assert_eq!(
            schedule(&server, client, Handle::from_raw(0x77), true),
            Err(RmError::NotFound)
        );

        let events = events.lock().unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].executed, CtrlCmd::Bind);
        assert_eq!(events[1].cmd, CtrlCmd::GpfifoSchedule);
        assert_eq!(events[1].executed, CtrlCmd::InternalGpfifoSchedule);
    }

    #[test]
    fn test_free_cascades() {
        let (server, sim) = server();
        let client = server.alloc_client(OWNER).unwrap();
        let dev = device(&server, client);
        let sub = server
            .alloc_with(client, dev, ResourceClass::Subdevice, &mut SubdeviceAllocParams::default())
            .unwrap();
        let tsg = group(&server, client, sub, 2);
        let id = tsg_id(&server, client, tsg);
        let (ctx, _) = ctxshare(&server, client, tsg).unwrap();
        bind(&server, client, tsg).unwrap();
        schedule(&server, client, tsg, true).unwrap();

        server.free(client, dev).unwrap();
        for handle in [dev, sub, tsg, ctx] {
            assert_eq!(server.class_of(client, handle), Err(RmError::NotFound));
        }
        assert_eq!(server.object_count(client), Ok(0));
        assert_eq!(sim.preempts(), vec![id]);
        assert!(sim.runlist_entry(id).is_none());
        assert_eq!(server.env().sched.groups_in_use(), 0);
    }

    #[test]
    fn test_register_mapping() {
        let (server, sim) = server();
        let client = server.alloc_client(OWNER).unwrap();
        let dev = device(&server, client);
        let sub = server
            .alloc_with(client, dev, ResourceClass::Subdevice, &mut SubdeviceAllocParams::default())
            .unwrap();
        let addr = server.map(client, sub, sub, 0, 0x1000).unwrap();
        assert_eq!(
            server.map(client, sub, sub, SimGpu::REG_SIZE, 0x1000),
            Err(RmError::InvalidArgument)
        );
        assert_eq!(server.map(client, dev, dev, 0, 0x1000), Err(RmError::NotSupported));
        assert_eq!(sim.live_mappings(), 1);
        assert_eq!(server.unmap(client, dev, sub, addr), Err(RmError::InvalidArgument));
        assert_eq!(server.unmap(client, sub, sub, addr + 0x10_0000), Err(RmError::NotFound));
        server.unmap(client, sub, sub, addr).unwrap();
        assert_eq!(sim.live_mappings(), 0);
        assert_eq!(server.unmap(client, sub, sub, addr), Err(RmError::NotFound));

        let mut p = MemoryAllocParams {
            size: 0x4000,
            ..Default::default()
        };
        let mem = server
            .alloc_with(client, dev, ResourceClass::LocalMemory, &mut p)
            .unwrap();
        server.map(client, dev, mem, 0x1000, 0x1000).unwrap();
        server.free_client(client).unwrap();
        assert_eq!(sim.live_mappings(), 0);
    }

    #[test]
    fn test_reg_base_offset_and_size() {
        let (server, _sim) = server();
        let client = server.alloc_client(OWNER).unwrap();
        let dev = device(&server, client);
        let sub = server
            .alloc_with(client, dev, ResourceClass::Subdevice, &mut SubdeviceAllocParams::default())
            .unwrap();
        assert_eq!(
            server.reg_base_offset_and_size(client, sub),
            Ok((SimGpu::REG_BASE, SimGpu::REG_SIZE))
        );
        assert_eq!(server.reg_base_offset_and_size(client, dev), Err(RmError::NotSupported));
        assert_eq!(server.reg_base_offset_and_size(client, client), Err(RmError::NotSupported));
        assert_eq!(
            server.reg_base_offset_and_size(client, Handle::from_raw(0x7777)),
            Err(RmError::NotFound)
        );
    }

    #[test]
    fn test_make_realtime_needs_privilege() {
        let (server, sim) = server();
        let user = server.alloc_client(OWNER).unwrap();
        let dev = device(&server, user);
        let tsg = group(&server, user, dev, 1);
        let mut on = MakeRealtimeParams { realtime: 1 };
        assert_eq!(
            server.control_with(user, tsg, CtrlCmd::MakeRealtime, &mut on),
            Err(RmError::PermissionDenied)
        );

        let admin = server
            .alloc_client(OWNER.with_privilege(Privilege::Admin))
            .unwrap();
        let admin_dev = device(&server, admin);
        let admin_tsg = group(&server, admin, admin_dev, 1);
        let id = tsg_id(&server, admin, admin_tsg);
        bind(&server, admin, admin_tsg).unwrap();
        let mut off = MakeRealtimeParams { realtime: 0 };
        assert_eq!(
            server.control_with(admin, admin_tsg, CtrlCmd::MakeRealtime, &mut off),
            Err(RmError::InvalidArgument)
        );
        assert_eq!(sim.runlist_entry(id).map(|e| e.realtime), Some(false));
        server
            .control_with(admin, admin_tsg, CtrlCmd::MakeRealtime, &mut on)
            .unwrap();
        assert_eq!(sim.runlist_entry(id).map(|e| e.realtime), Some(true));
    }

    #[test]
    fn test_dynamic_partition_rejects_lmem_index() {
        let (server, sim) = server();
        let client = server.alloc_client(OWNER).unwrap();
        let dev = device(&server, client);
        let tsg = group(&server, client, dev, 1);
        let id = tsg_id(&server, client, tsg);
        let (ctx, subctx) = ctxshare(&server, client, tsg).unwrap();

        let mut mode = TpcPartitionModeParams {
            mode: 2,
            enable_all_tpcs: 1,
            _pad: [0; 3],
        };
        server
            .control_with(client, tsg, CtrlCmd::SetTpcPartitionMode, &mut mode)
            .unwrap();
        let mut get = TpcPartitionModeParams::default();
        server
            .control_with(client, tsg, CtrlCmd::GetTpcPartitionMode, &mut get)
            .unwrap();
        assert_eq!(get, mode);

        let mut p = TpcPartitionTableParams::new_zeroed();
        p.tpc_list[0] = TpcInfo {
            global_tpc_index: 0,
            lmem_block_index: 3,
        };
        p.num_used_tpc = 1;
        assert_eq!(
            server.control_with(client, ctx, CtrlCmd::SetTpcPartitionTable, &mut p),
            Err(RmError::InvalidArgument)
        );
        assert_eq!(sim.tpc_table(id, subctx), None);

        mode.mode = 1;
        server
            .control_with(client, tsg, CtrlCmd::SetTpcPartitionMode, &mut mode)
            .unwrap();
        server
            .control_with(client, ctx, CtrlCmd::SetTpcPartitionTable, &mut p)
            .unwrap();
        assert_eq!(sim.tpc_table(id, subctx).map(|t| t.len()), Some(1));
    }

    #[test]
    fn test_ctxshare_ids_exhausted() {
        let config = ServerConfig {
            max_subcontexts: 2,
            ..ServerConfig::default()
        };
        let (server, _sim) = RmServer::simulated(config).unwrap();
        let client = server.alloc_client(OWNER).unwrap();
        let dev = device(&server, client);
        let tsg = group(&server, client, dev, 1);
        let (first, _) = ctxshare(&server, client, tsg).unwrap();
        ctxshare(&server, client, tsg).unwrap();
        let count = server.object_count(client).unwrap();
        assert_eq!(ctxshare(&server, client, tsg), Err(RmError::ResourceExhausted));
        assert_eq!(server.object_count(client), Ok(count));

        server.free(client, first).unwrap();
        assert!(ctxshare(&server, client, tsg).is_ok());
    }

    #[test]
    fn test_fault_method_buffers_internal_only() {
        let (server, sim) = server();
        let client = server.alloc_client(OWNER).unwrap();
        let dev = device(&server, client);
        let tsg = group(&server, client, dev, 1);
        let id = tsg_id(&server, client, tsg);

        let mut p = PromoteFaultMethodBuffersParams::new_zeroed();
        for (i, desc) in p.method_buffer.iter_mut().enumerate() {
            *desc = MethodBufferDesc {
                base: 0x10_0000 * (i as u64 + 1),
                size: 0x1000,
                ..Default::default()
            };
        }
        p.bar2_addr = [0xA000_0000, 0xA001_0000];
        p.num_valid_entries = 2;
        assert_eq!(
            server.control_with(client, tsg, CtrlCmd::InternalPromoteFaultMethodBuffers, &mut p),
            Err(RmError::PermissionDenied)
        );
        assert_eq!(sim.method_buffer_count(id), None);

        let cmd = CtrlCmd::InternalPromoteFaultMethodBuffers.id();
        p.num_valid_entries = 3;
        assert_eq!(
            server.internal_control(client, tsg, cmd, p.as_mut_bytes()),
            Err(RmError::InvalidArgument)
        );
        p.num_valid_entries = 2;
        server.internal_control(client, tsg, cmd, p.as_mut_bytes()).unwrap();
        assert_eq!(sim.method_buffer_count(id), Some(2));
    }

    #[test]
    fn test_gpu_identity() {
        let (server, _sim) = server();
        let client = server.alloc_client(OWNER).unwrap();
        let dev = device(&server, client);
        let sub = server
            .alloc_with(client, dev, ResourceClass::Subdevice, &mut SubdeviceAllocParams::default())
            .unwrap();

        let mut p = GpuIdentityParams::default();
        server.control_with(client, dev, CtrlCmd::GetGpuIdentity, &mut p).unwrap();
        assert_eq!(p.gpu_mask, 1);
        assert_eq!(p.device_instance, 0);
        assert_eq!(p.bc_resource, 1);

        let mut p = GpuIdentityParams::default();
        server.control_with(client, sub, CtrlCmd::GetGpuIdentity, &mut p).unwrap();
        assert_eq!(p.gpu_instance, 0);
        assert_eq!(p.gpu_mask, 1);
        assert_eq!(p.subdevice_instance, 0);
        assert_eq!(p.bc_resource, 0);

        let mut p = GpuIdentityParams::default();
        assert_eq!(
            server.control_with(client, client, CtrlCmd::GetGpuIdentity, &mut p),
            Err(RmError::NotSupported)
        );
    }

    #[test]
    fn test_ctxshare_dup_across_clients() {
        let (server, _sim) = server();
        let owner = server.alloc_client(OWNER).unwrap();
        let other = server.alloc_client(STRANGER).unwrap();
        let dev = device(&server, owner);
        let other_dev = device(&server, other);
        let tsg = group(&server, owner, dev, 1);
        let (ctx, id) = ctxshare(&server, owner, tsg).unwrap();

        let policy = SharePolicy {
            share_type: ShareType::Pid,
            target: STRANGER.pid,
            access: AccessRights::ALL,
            action: ShareAction::Allow,
        };
        server.share(owner, tsg, policy).unwrap();
        server.share(owner, ctx, policy).unwrap();
        let other_tsg = server
            .duplicate(owner, tsg, other, other_dev, Handle::NULL, 0)
            .unwrap();
        let other_ctx = server
            .duplicate(owner, ctx, other, other_tsg, Handle::NULL, 0)
            .unwrap();
        assert_eq!(server.get_ref_count(other, other_ctx), Ok(2));

        server.free_client(owner).unwrap();
        assert_eq!(server.get_ref_count(other, other_ctx), Ok(1));
        assert!(subctx_in_use(&server, other, other_tsg, id));

        server.free(other, other_ctx).unwrap();
        assert!(!subctx_in_use(&server, other, other_tsg, id));
        assert_eq!(server.env().sched.groups_in_use(), 1);
    }

    #[test]
    fn test_mmu_debug_mode() {
        let (server, sim) = server();
        let client = server.alloc_client(OWNER).unwrap();
        let dev = device(&server, client);
        let tsg = group(&server, client, dev, 1);

        let mut p = MmuDebugModeParams::default();
        server.control_with(client, tsg, CtrlCmd::GetMmuDebugMode, &mut p).unwrap();
        assert_eq!(p.mode, 0);
        sim.set_mmu_debug_mode(true);
        server.control_with(client, tsg, CtrlCmd::GetMmuDebugMode, &mut p).unwrap();
        assert_eq!(p.mode, 1);
        assert_eq!(
            server.control_with(client, dev, CtrlCmd::GetMmuDebugMode, &mut p),
            Err(RmError::NotSupported)
        );
    }

    #[test]
    fn test_lg_sector_promotion() {
        let (server, sim) = server();
        let client = server.alloc_client(OWNER).unwrap();
        let dev = device(&server, client);
        let tsg = group(&server, client, dev, 1);
        let id = tsg_id(&server, client, tsg);

        let mut p = LgSectorPromotionParams { promotion: 3 };
        assert_eq!(
            server.control_with(client, tsg, CtrlCmd::SetLgSectorPromotion, &mut p),
            Err(RmError::InvalidArgument)
        );
        assert_eq!(sim.lg_sector_promotion(id), None);

        p.promotion = 2;
        server
            .control_with(client, tsg, CtrlCmd::SetLgSectorPromotion, &mut p)
            .unwrap();
        assert_eq!(sim.lg_sector_promotion(id), Some(PromoteSize::Bytes128));
        let promotion = server
            .with_resource(client, tsg, |r| {
                downcast_ref::<ChannelGroupApi>(r)
                    .and_then(ChannelGroupApi::group)
                    .map(|g| g.lock().lg_sector_promotion())
            })
            .unwrap();
        assert_eq!(promotion, Some(PromoteSize::Bytes128));
    }

    #[test]
    fn test_group_dup_stays_on_its_gpu() {
        let sim = Arc::new(SimGpu::new(2, 1));
        let server = RmServer::new(ServerConfig::default(), Hal::simulated(&sim)).unwrap();
        let client = server.alloc_client(OWNER).unwrap();
        let first = device(&server, client);
        let mut p = DeviceAllocParams {
            device_id: 1,
            ..Default::default()
        };
        let second = server
            .alloc_with(client, client, ResourceClass::Device, &mut p)
            .unwrap();
        let tsg = group(&server, client, first, 1);

        assert_eq!(
            server.duplicate(client, tsg, client, second, Handle::NULL, 0),
            Err(RmError::InvalidArgument)
        );
        assert_eq!(server.get_ref_count(client, tsg), Ok(1));

        let sub = server
            .alloc_with(client, first, ResourceClass::Subdevice, &mut SubdeviceAllocParams::default())
            .unwrap();
        let dup = server.duplicate(client, tsg, client, sub, Handle::NULL, 0).unwrap();
        assert_eq!(tsg_id(&server, client, dup), tsg_id(&server, client, tsg));
    }
}
