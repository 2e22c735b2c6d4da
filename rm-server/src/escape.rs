//! Escape entry point
//!
//! The host device layer forwards `(escape number, blob)` here. The blob
//! starts with the command's header; ALLOC and CONTROL headers are followed
//! by `params_size` bytes of inline parameters.
//!
//! ```text
//! escape(caller, 0x2A, blob)
//!   │
//!   ├─ EscapeCmd::from_number        unknown → NotSupported
//!   ├─ header from blob prefix       short   → InvalidArgument
//!   ├─ caller owns h_client?         no      → PermissionDenied
//!   ├─ RmServer::control(..)
//!   └─ status (and outputs) written back into the header
//! ```
//!
//! Kernel callers may act on any client; everyone else only on clients
//! registered with their own pid.

use core::mem::size_of;

use rm_cap::share::{ShareAction, SharePolicy, ShareType};
use rm_cap::{AccessRights, ClientInfo, Handle, Privilege, ResourceClass, RmError, RmResult};
use rm_ctrl::escape::{
    AllocHeader, ControlHeader, DupHeader, FreeHeader, MapMemoryHeader, ShareHeader,
    UnmapMemoryHeader,
};
use rm_ctrl::{EscapeCmd, Status};
use zerocopy::{FromBytes, Immutable, IntoBytes};

use crate::server::RmServer;

/// Header at the front of an escape blob.
trait EscapeHeader: FromBytes + IntoBytes + Immutable {
    fn set_status(&mut self, status: Status);
}

macro_rules! escape_headers {
    ($($ty:ty),* $(,)?) => {
        $(
            impl EscapeHeader for $ty {
                fn set_status(&mut self, status: Status) {
                    self.status = status.as_u32();
                }
            }
        )*
    };
}

escape_headers!(
    AllocHeader,
    FreeHeader,
    ControlHeader,
    DupHeader,
    ShareHeader,
    MapMemoryHeader,
    UnmapMemoryHeader,
);

/// Decode the header, run `f` on it and the bytes after it, and write the
/// header back with the resulting status.
fn run<H: EscapeHeader>(
    blob: &mut [u8],
    f: impl FnOnce(&mut H, &mut [u8]) -> RmResult<()>,
) -> Status {
    let Some((head, rest)) = blob.split_at_mut_checked(size_of::<H>()) else {
        return Status::InvalidArgument;
    };
    let Ok(mut header) = H::read_from_bytes(head) else {
        return Status::InvalidArgument;
    };
    let status = Status::from(f(&mut header, rest));
    header.set_status(status);
    if header.write_to(head).is_err() {
        return Status::InvalidArgument;
    }
    status
}

/// Inline parameters following a header.
fn params(rest: &mut [u8], size: u32) -> RmResult<&mut [u8]> {
    rest.get_mut(..size as usize).ok_or(RmError::InvalidArgument)
}

impl RmServer {
    /// Run one escape call.
    ///
    /// `caller` is the identity of the process making the call, as the host
    /// device layer established it.
    ///
    /// # Returns
    ///
    /// The status also written into the blob's header; `InvalidArgument`
    /// without touching the blob if it is shorter than the header.
    pub fn escape(&self, caller: &ClientInfo, num: u32, blob: &mut [u8]) -> Status {
        let Some(cmd) = EscapeCmd::from_number(num) else {
            log::warn!("escape: invalid number {:#x}", num);
            return Status::NotSupported;
        };

        log::trace!("escape: {} (pid {}, {} bytes)", cmd.name(), caller.pid, blob.len());

        let status = match cmd {
            EscapeCmd::Alloc => run(blob, |h: &mut AllocHeader, rest| self.escape_alloc(caller, h, rest)),
            EscapeCmd::Free => run(blob, |h: &mut FreeHeader, _| {
                let client = Handle::from_raw(h.h_client);
                self.check_caller(caller, client)?;
                self.free(client, Handle::from_raw(h.h_object))
            }),
            EscapeCmd::Control => run(blob, |h: &mut ControlHeader, rest| {
                let client = Handle::from_raw(h.h_client);
                self.check_caller(caller, client)?;
                let params = params(rest, h.params_size)?;
                self.control(client, Handle::from_raw(h.h_object), h.cmd, params)
            }),
            EscapeCmd::DupObject => run(blob, |h: &mut DupHeader, _| {
                let client = Handle::from_raw(h.h_client);
                self.check_caller(caller, client)?;
                let handle = self.duplicate(
                    Handle::from_raw(h.h_client_src),
                    Handle::from_raw(h.h_object_src),
                    client,
                    Handle::from_raw(h.h_parent),
                    Handle::from_raw(h.h_object),
                    h.flags,
                )?;
                h.h_object = handle.raw();
                Ok(())
            }),
            EscapeCmd::Share => run(blob, |h: &mut ShareHeader, _| self.escape_share(caller, h)),
            EscapeCmd::MapMemory => run(blob, |h: &mut MapMemoryHeader, _| {
                let client = Handle::from_raw(h.h_client);
                self.check_caller(caller, client)?;
                h.cpu_address = self.map(
                    client,
                    Handle::from_raw(h.h_device),
                    Handle::from_raw(h.h_memory),
                    h.offset,
                    h.length,
                )?;
                Ok(())
            }),
            EscapeCmd::UnmapMemory => run(blob, |h: &mut UnmapMemoryHeader, _| {
                let client = Handle::from_raw(h.h_client);
                self.check_caller(caller, client)?;
                self.unmap(
                    client,
                    Handle::from_raw(h.h_device),
                    Handle::from_raw(h.h_memory),
                    h.cpu_address,
                )
            }),
        };

        if !status.is_ok() {
            log::debug!("escape: {} failed: {}", cmd.name(), status.name());
        }
        status
    }

    /// A class of zero allocates a client owned by the caller; anything
    /// else allocates into an existing client.
    fn escape_alloc(&self, caller: &ClientInfo, h: &mut AllocHeader, rest: &mut [u8]) -> RmResult<()> {
        if h.h_class == ResourceClass::Client.id() {
            let handle = self.alloc_client_as(*caller, Handle::from_raw(h.h_object))?;
            h.h_client = handle.raw();
            h.h_object = handle.raw();
            return Ok(());
        }
        let client = Handle::from_raw(h.h_client);
        self.check_caller(caller, client)?;
        let params = params(rest, h.params_size)?;
        let handle = self.allocate(
            client,
            Handle::from_raw(h.h_parent),
            Handle::from_raw(h.h_object),
            h.h_class,
            params,
        )?;
        h.h_object = handle.raw();
        Ok(())
    }

    fn escape_share(&self, caller: &ClientInfo, h: &mut ShareHeader) -> RmResult<()> {
        let client = Handle::from_raw(h.h_client);
        self.check_caller(caller, client)?;
        let access = u8::try_from(h.access_mask).map_err(|_| RmError::InvalidArgument)?;
        let policy = SharePolicy {
            share_type: ShareType::from_raw(h.share_type).ok_or(RmError::InvalidArgument)?,
            target: h.target,
            access: AccessRights::from_bits(access),
            action: ShareAction::from_raw(h.action).ok_or(RmError::InvalidArgument)?,
        };
        self.share(client, Handle::from_raw(h.h_object), policy)
    }

    fn check_caller(&self, caller: &ClientInfo, client: Handle) -> RmResult<()> {
        let info = self.client_info(client)?;
        if caller.privilege == Privilege::Kernel || caller.pid == info.pid {
            Ok(())
        } else {
            log::warn!(
                "escape: pid {} may not act on client {} (pid {})",
                caller.pid,
                client,
                info.pid
            );
            Err(RmError::PermissionDenied)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rm_cap::objects::EngineType;
    use rm_ctrl::CtrlCmd;
    use rm_ctrl::allocation::{ChannelGroupAllocParams, DeviceAllocParams, SubdeviceAllocParams};
    use rm_ctrl::params::{ChannelGroupInfoParams, TimesliceParams};

    use crate::config::ServerConfig;
    use crate::hal::SimGpu;
    use std::sync::Arc;

    const OWNER: ClientInfo = ClientInfo::user(100, 0xAA);
    const STRANGER: ClientInfo = ClientInfo::user(200, 0xBB);

    fn server() -> (RmServer, Arc<SimGpu>) {
        RmServer::simulated(ServerConfig::default()).unwrap()
    }

    fn blob<H: IntoBytes + Immutable>(header: &H, params: &[u8]) -> Vec<u8> {
        let mut out = header.as_bytes().to_vec();
        out.extend_from_slice(params);
        out
    }

    fn header<H: FromBytes>(blob: &[u8]) -> H {
        H::read_from_prefix(blob).unwrap().0
    }

    fn params_size(params: &[u8]) -> u32 {
        u32::try_from(params.len()).unwrap()
    }

    fn alloc_client(server: &RmServer, caller: &ClientInfo) -> Handle {
        let mut b = blob(&AllocHeader::default(), &[]);
        assert_eq!(server.escape(caller, EscapeCmd::Alloc as u32, &mut b), Status::Ok);
        Handle::from_raw(header::<AllocHeader>(&b).h_client)
    }

    fn alloc(
        server: &RmServer,
        caller: &ClientInfo,
        client: Handle,
        parent: Handle,
        class: ResourceClass,
        params: &[u8],
    ) -> (Status, AllocHeader) {
        let hdr = AllocHeader {
            h_client: client.raw(),
            h_parent: parent.raw(),
            h_class: class.id(),
            params_size: params_size(params),
            ..Default::default()
        };
        let mut b = blob(&hdr, params);
        let status = server.escape(caller, EscapeCmd::Alloc as u32, &mut b);
        (status, header(&b))
    }

    fn group(server: &RmServer, client: Handle) -> Handle {
        let dev = server
            .alloc_with(client, client, ResourceClass::Device, &mut DeviceAllocParams::default())
            .unwrap();
        let mut p = ChannelGroupAllocParams {
            engine_type: EngineType::Graphics.raw(),
            channel_count: 2,
            ..Default::default()
        };
        server
            .alloc_with(client, dev, ResourceClass::ChannelGroup, &mut p)
            .unwrap()
    }

    #[test]
    fn test_alloc_client_and_device() {
        let (server, _sim) = server();
        let client = alloc_client(&server, &OWNER);
        assert!(client.is_client());
        assert_eq!(server.client_info(client), Ok(OWNER));

        let params = DeviceAllocParams::default();
        let (status, hdr) = alloc(
            &server,
            &OWNER,
            client,
            client,
            ResourceClass::Device,
            params.as_bytes(),
        );
        assert_eq!(status, Status::Ok);
        assert_eq!(hdr.status, Status::Ok.as_u32());
        assert_eq!(hdr.h_object, Handle::OBJECT_BASE);
        assert_eq!(
            server.class_of(client, Handle::from_raw(hdr.h_object)),
            Ok(ResourceClass::Device)
        );
    }

    #[test]
    fn test_alloc_errors_written_back() {
        let (server, _sim) = server();
        let client = alloc_client(&server, &OWNER);
        let (status, hdr) = alloc(&server, &OWNER, client, client, ResourceClass::ContextShare, &[]);
        assert_eq!(status, Status::InvalidArgument);
        assert_eq!(hdr.status, Status::InvalidArgument.as_u32());

        let params = SubdeviceAllocParams::default();
        let mut hdr = AllocHeader {
            h_client: client.raw(),
            h_parent: client.raw(),
            h_class: ResourceClass::Device.id(),
            params_size: 64,
            ..Default::default()
        };
        let mut b = blob(&hdr, params.as_bytes());
        assert_eq!(
            server.escape(&OWNER, EscapeCmd::Alloc as u32, &mut b),
            Status::InvalidArgument
        );
        hdr = header(&b);
        assert_eq!(hdr.status, Status::InvalidArgument.as_u32());
        assert_eq!(server.object_count(client), Ok(0));
    }

    #[test]
    fn test_control_writes_params_back() {
        let (server, _sim) = server();
        let client = server.alloc_client(OWNER).unwrap();
        let tsg = group(&server, client);

        let mut expected = ChannelGroupInfoParams::default();
        server
            .control_with(client, tsg, CtrlCmd::GetInfo, &mut expected)
            .unwrap();

        let params = ChannelGroupInfoParams { tsg_id: 0xFFFF };
        let hdr = ControlHeader {
            h_client: client.raw(),
            h_object: tsg.raw(),
            cmd: CtrlCmd::GetInfo.id(),
            params_size: params_size(params.as_bytes()),
            ..Default::default()
        };
        let mut b = blob(&hdr, params.as_bytes());
        assert_eq!(server.escape(&OWNER, EscapeCmd::Control as u32, &mut b), Status::Ok);
        let out: ChannelGroupInfoParams = header(&b[size_of::<ControlHeader>()..]);
        assert_eq!(out, expected);
    }

    #[test]
    fn test_control_size_checked() {
        let (server, _sim) = server();
        let client = server.alloc_client(OWNER).unwrap();
        let tsg = group(&server, client);
        let params = TimesliceParams::default();

        let mut hdr = ControlHeader {
            h_client: client.raw(),
            h_object: tsg.raw(),
            cmd: CtrlCmd::GetTimeslice.id(),
            params_size: 4,
            ..Default::default()
        };
        let mut b = blob(&hdr, params.as_bytes());
        assert_eq!(
            server.escape(&OWNER, EscapeCmd::Control as u32, &mut b),
            Status::InvalidArgument
        );

        hdr.params_size = 16;
        let mut b = blob(&hdr, params.as_bytes());
        assert_eq!(
            server.escape(&OWNER, EscapeCmd::Control as u32, &mut b),
            Status::InvalidArgument
        );
        assert_eq!(header::<ControlHeader>(&b).status, Status::InvalidArgument.as_u32());
    }

    #[test]
    fn test_caller_must_own_client() {
        let (server, _sim) = server();
        let client = alloc_client(&server, &OWNER);
        let params = DeviceAllocParams::default();

        let (status, hdr) = alloc(
            &server,
            &STRANGER,
            client,
            client,
            ResourceClass::Device,
            params.as_bytes(),
        );
        assert_eq!(status, Status::PermissionDenied);
        assert_eq!(hdr.status, Status::PermissionDenied.as_u32());

        let kernel = STRANGER.with_privilege(Privilege::Kernel);
        let (status, _) = alloc(
            &server,
            &kernel,
            client,
            client,
            ResourceClass::Device,
            params.as_bytes(),
        );
        assert_eq!(status, Status::Ok);

        let (status, _) = alloc(
            &server,
            &OWNER,
            Handle::client(77),
            Handle::client(77),
            ResourceClass::Device,
            params.as_bytes(),
        );
        assert_eq!(status, Status::NotFound);
    }

    #[test]
    fn test_bad_escapes() {
        let (server, _sim) = server();
        let mut b = vec![0u8; 64];
        assert_eq!(server.escape(&OWNER, 0x2C, &mut b), Status::NotSupported);
        assert!(b.iter().all(|&x| x == 0));

        let mut short = vec![0u8; size_of::<ControlHeader>() - 1];
        assert_eq!(
            server.escape(&OWNER, EscapeCmd::Control as u32, &mut short),
            Status::InvalidArgument
        );
    }

    #[test]
    fn test_share_then_dup() {
        let (server, _sim) = server();
        let owner = alloc_client(&server, &OWNER);
        let other = alloc_client(&server, &STRANGER);
        let tsg = group(&server, owner);
        let other_dev = server
            .alloc_with(other, other, ResourceClass::Device, &mut DeviceAllocParams::default())
            .unwrap();

        let dup = DupHeader {
            h_client: other.raw(),
            h_parent: other_dev.raw(),
            h_client_src: owner.raw(),
            h_object_src: tsg.raw(),
            ..Default::default()
        };
        let mut b = blob(&dup, &[]);
        assert_eq!(
            server.escape(&STRANGER, EscapeCmd::DupObject as u32, &mut b),
            Status::PermissionDenied
        );

        let mut share = ShareHeader {
            h_client: owner.raw(),
            h_object: tsg.raw(),
            share_type: 9,
            action: ShareAction::Allow as u16,
            target: STRANGER.pid,
            access_mask: u32::from(AccessRights::ALL.bits()),
            status: 0,
        };
        let mut b = blob(&share, &[]);
        assert_eq!(
            server.escape(&OWNER, EscapeCmd::Share as u32, &mut b),
            Status::InvalidArgument
        );

        share.share_type = ShareType::Pid as u16;
        let mut b = blob(&share, &[]);
        assert_eq!(server.escape(&STRANGER, EscapeCmd::Share as u32, &mut b), Status::PermissionDenied);
        let mut b = blob(&share, &[]);
        assert_eq!(server.escape(&OWNER, EscapeCmd::Share as u32, &mut b), Status::Ok);

        let mut b = blob(&dup, &[]);
        assert_eq!(server.escape(&STRANGER, EscapeCmd::DupObject as u32, &mut b), Status::Ok);
        let handle = Handle::from_raw(header::<DupHeader>(&b).h_object);
        assert_eq!(server.class_of(other, handle), Ok(ResourceClass::ChannelGroup));
        assert_eq!(server.get_ref_count(owner, tsg), Ok(2));
    }

    #[test]
    fn test_map_and_unmap() {
        let (server, sim) = server();
        let client = server.alloc_client(OWNER).unwrap();
        let dev = server
            .alloc_with(client, client, ResourceClass::Device, &mut DeviceAllocParams::default())
            .unwrap();
        let sub = server
            .alloc_with(client, dev, ResourceClass::Subdevice, &mut SubdeviceAllocParams::default())
            .unwrap();

        let map = MapMemoryHeader {
            h_client: client.raw(),
            h_device: sub.raw(),
            h_memory: sub.raw(),
            length: 0x1000,
            ..Default::default()
        };
        let mut b = blob(&map, &[]);
        assert_eq!(server.escape(&OWNER, EscapeCmd::MapMemory as u32, &mut b), Status::Ok);
        let cpu_address = header::<MapMemoryHeader>(&b).cpu_address;
        assert_ne!(cpu_address, 0);
        assert_eq!(sim.live_mappings(), 1);

        let unmap = UnmapMemoryHeader {
            h_client: client.raw(),
            h_device: sub.raw(),
            h_memory: sub.raw(),
            status: 0,
            cpu_address,
        };
        let mut b = blob(&unmap, &[]);
        assert_eq!(server.escape(&OWNER, EscapeCmd::UnmapMemory as u32, &mut b), Status::Ok);
        assert_eq!(sim.live_mappings(), 0);
        let mut b = blob(&unmap, &[]);
        assert_eq!(
            server.escape(&OWNER, EscapeCmd::UnmapMemory as u32, &mut b),
            Status::InvalidArgument
        );
    }

    #[test]
    fn test_free_client_by_handle() {
        let (server, _sim) = server();
        let client = alloc_client(&server, &OWNER);
        let hdr = FreeHeader {
            h_client: client.raw(),
            h_object: client.raw(),
            ..Default::default()
        };
        let mut b = blob(&hdr, &[]);
        assert_eq!(server.escape(&STRANGER, EscapeCmd::Free as u32, &mut b), Status::PermissionDenied);
        assert_eq!(server.client_count(), 1);
        let mut b = blob(&hdr, &[]);
        assert_eq!(server.escape(&OWNER, EscapeCmd::Free as u32, &mut b), Status::Ok);
        assert_eq!(server.client_count(), 0);
        let mut b = blob(&hdr, &[]);
        assert_eq!(server.escape(&OWNER, EscapeCmd::Free as u32, &mut b), Status::NotFound);
    }
}
