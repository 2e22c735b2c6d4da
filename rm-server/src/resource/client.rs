//! Client root resource.

use core::any::Any;

use rm_cap::{ClientInfo, Handle, ResourceClass};

use super::{Layers, Resource, ResourceBase, RmResource, RmResourceBase};
use crate::env::ServerEnv;

/// Root of a client's resource tree.
#[derive(Debug)]
pub struct ClientResource {
    rm: RmResourceBase,
}

impl ClientResource {
    /// Create the root for client `handle`.
    #[must_use]
    pub const fn new(handle: Handle, info: ClientInfo) -> Self {
        Self {
            rm: RmResourceBase::new(ResourceBase::new(handle, handle, Handle::NULL), info),
        }
    }

    /// Identity captured at allocation.
    #[inline]
    #[must_use]
    pub const fn info(&self) -> &ClientInfo {
        self.rm.owner()
    }
}

impl Resource for ClientResource {
    fn class(&self) -> ResourceClass {
        ResourceClass::Client
    }

    fn base(&self) -> &ResourceBase {
        self.rm.base()
    }

    fn base_mut(&mut self) -> &mut ResourceBase {
        self.rm.base_mut()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_rm(&self) -> Option<&dyn RmResource> {
        Some(self)
    }

    fn as_rm_mut(&mut self) -> Option<&mut dyn RmResource> {
        Some(self)
    }

    fn destruct(&mut self, _env: &ServerEnv) {
        if self.rm.base_mut().begin_teardown(Layers::OWN) {
            log::debug!("client: {} freed", self.rm.base().handle());
        }
        self.rm.destruct();
    }
}

impl RmResource for ClientResource {
    fn rm_base(&self) -> &RmResourceBase {
        &self.rm
    }

    fn rm_base_mut(&mut self) -> &mut RmResourceBase {
        &mut self.rm
    }
}
