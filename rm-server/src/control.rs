//! Control dispatch
//!
//! Every class has a static export table; a class inherits the tables of
//! its base layers, searched after its own:
//!
//! ```text
//! ChannelGroup: [channel_group] → [gpu] → [resource]
//! ContextShare: [ctxshare]      → [gpu] → [resource]
//! Device, ...:                     [gpu] → [resource]
//! Client:                                  [resource]
//! ```
//!
//! # Call Flow
//!
//! 1. Look up the command in the class's chain (`NotSupported` if absent)
//! 2. Check the parameter size (`InvalidArgument`, handler never runs)
//! 3. Check handle rights, privilege and internal-only restrictions
//! 4. Take the GPU lock if the command asks for it, then the object lock
//! 5. Run the handler
//! 6. Release locks and notify observers

use rm_cap::{AccessRights, ClientInfo, Handle, ResourceClass, RmError, RmResult};
use rm_ctrl::{CtrlCmd, CtrlFlags, CtrlInfo};
use zerocopy::{FromBytes, Immutable, IntoBytes};

use crate::env::ServerEnv;
use crate::resource::{Resource, channel_group, ctxshare, gpu};

/// Control handler.
pub type Handler = fn(&mut dyn Resource, &mut ControlCall<'_>) -> RmResult<()>;

/// One export table entry.
#[derive(Clone, Copy)]
pub struct Export {
    /// Command.
    pub cmd: CtrlCmd,
    /// Handler.
    pub handler: Handler,
}

impl Export {
    /// Pair a command with its handler.
    #[must_use]
    pub const fn new(cmd: CtrlCmd, handler: Handler) -> Self {
        Self { cmd, handler }
    }
}

impl core::fmt::Debug for Export {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Export").field("cmd", &self.cmd).finish()
    }
}

/// An in-flight control call.
pub struct ControlCall<'a> {
    /// Server environment.
    pub env: &'a ServerEnv,
    /// Calling client.
    pub client: Handle,
    /// Identity of the caller.
    pub caller: ClientInfo,
    /// Issued by a trusted internal path.
    pub internal: bool,
    /// Command being run.
    pub cmd: CtrlCmd,
    /// Parameter blob, exactly the command's size.
    pub params: &'a mut [u8],
}

impl ControlCall<'_> {
    /// Decode the parameters.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` on a size mismatch.
    pub fn decode<T: FromBytes>(&self) -> RmResult<T> {
        rm_ctrl::decode(self.params)
    }

    /// Write outputs back.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` on a size mismatch.
    pub fn encode<T: IntoBytes + Immutable>(&mut self, params: &T) -> RmResult<()> {
        rm_ctrl::encode(params, self.params)
    }
}

/// Commands every resource exports.
pub(crate) const RESOURCE_EXPORTS: &[Export] = &[Export::new(CtrlCmd::Null, ctrl_null)];

fn ctrl_null(_res: &mut dyn Resource, _call: &mut ControlCall<'_>) -> RmResult<()> {
    Ok(())
}

/// Export tables searched for a class, most derived first.
#[must_use]
pub fn export_chain(class: ResourceClass) -> &'static [&'static [Export]] {
    match class {
        ResourceClass::Client => &[RESOURCE_EXPORTS],
        ResourceClass::Device
        | ResourceClass::Subdevice
        | ResourceClass::SystemMemory
        | ResourceClass::LocalMemory
        | ResourceClass::VaSpace => &[gpu::EXPORTS, RESOURCE_EXPORTS],
        ResourceClass::ChannelGroup => &[channel_group::EXPORTS, gpu::EXPORTS, RESOURCE_EXPORTS],
        ResourceClass::ContextShare => &[ctxshare::EXPORTS, gpu::EXPORTS, RESOURCE_EXPORTS],
    }
}

/// Find the export for `cmd` on `class`.
#[must_use]
pub fn lookup(class: ResourceClass, cmd: CtrlCmd) -> Option<Export> {
    export_chain(class)
        .iter()
        .flat_map(|table| table.iter())
        .find(|export| export.cmd == cmd)
        .copied()
}

/// Checks that precede locking: size, rights, privilege, internal-only.
///
/// # Errors
///
/// - `InvalidArgument` if the blob is not exactly the command's size
/// - `PermissionDenied` if rights or privilege are insufficient, or an
///   internal command arrives from an ordinary client
pub fn check_call(info: CtrlInfo, rights: AccessRights, call: &ControlCall<'_>) -> RmResult<()> {
    if call.params.len() != info.param_size {
        return Err(RmError::InvalidArgument);
    }
    if !rights.contains(info.rights) {
        return Err(RmError::PermissionDenied);
    }
    if info.flags.contains(CtrlFlags::PRIVILEGED) && !call.caller.privilege.is_admin() {
        return Err(RmError::PermissionDenied);
    }
    if info.flags.contains(CtrlFlags::INTERNAL) && !call.internal {
        return Err(RmError::PermissionDenied);
    }
    Ok(())
}

/// Run a handler on an already locked resource.
///
/// # Errors
///
/// Whatever the handler returns.
pub fn invoke(res: &mut dyn Resource, export: Export, call: &mut ControlCall<'_>) -> RmResult<()> {
    res.base_mut().note_control();
    log::trace!(
        "control: {} on {} {}",
        call.cmd,
        res.class(),
        res.base().handle()
    );
    (export.handler)(res, call)
}

/// Re-dispatch a call onto `res` as `cmd`, flagged internal.
///
/// The caller already holds the object lock; rights and privilege of the
/// original call carry over.
///
/// # Errors
///
/// - `NotSupported` if the class does not export `cmd`
/// - `InvalidArgument` if the blob does not fit `cmd`
/// - Whatever the handler returns
pub fn internal_control_forward(
    res: &mut dyn Resource,
    cmd: CtrlCmd,
    call: &mut ControlCall<'_>,
) -> RmResult<()> {
    let export = lookup(res.class(), cmd).ok_or(RmError::NotSupported)?;
    if call.params.len() != cmd.info().param_size {
        return Err(RmError::InvalidArgument);
    }
    let outer_cmd = core::mem::replace(&mut call.cmd, cmd);
    let outer_internal = core::mem::replace(&mut call.internal, true);
    let result = invoke(res, export, call);
    call.cmd = outer_cmd;
    call.internal = outer_internal;
    result
}

/// Pick the export that actually runs, honoring route-to-physical.
#[must_use]
pub fn route(class: ResourceClass, export: Export, env: &ServerEnv) -> (CtrlCmd, Export) {
    if env.config.route_to_physical && export.cmd.info().flags.contains(CtrlFlags::ROUTE_TO_PHYSICAL) {
        if let Some(internal) = export.cmd.internal_variant().and_then(|cmd| lookup(class, cmd)) {
            log::trace!("control: routing {} to {}", export.cmd, internal.cmd);
            return (internal.cmd, internal);
        }
    }
    (export.cmd, export)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rm_cap::Interface;

    const ALL_CLASSES: [ResourceClass; 8] = [
        ResourceClass::Client,
        ResourceClass::Device,
        ResourceClass::Subdevice,
        ResourceClass::SystemMemory,
        ResourceClass::LocalMemory,
        ResourceClass::VaSpace,
        ResourceClass::ChannelGroup,
        ResourceClass::ContextShare,
    ];

    #[test]
    fn test_every_class_exports_null() {
        for class in ALL_CLASSES {
            assert!(lookup(class, CtrlCmd::Null).is_some(), "{}", class);
        }
    }

    #[test]
    fn test_gpu_commands_need_gpu_interface() {
        for class in ALL_CLASSES {
            assert_eq!(
                lookup(class, CtrlCmd::GetGpuIdentity).is_some(),
                class.interfaces().contains(Interface::GpuResource),
                "{}",
                class
            );
        }
    }

    #[test]
    fn test_scheduling_commands_only_on_groups() {
        assert!(lookup(ResourceClass::ChannelGroup, CtrlCmd::Bind).is_some());
        assert!(lookup(ResourceClass::ContextShare, CtrlCmd::Bind).is_none());
        assert!(lookup(ResourceClass::Device, CtrlCmd::Preempt).is_none());
        assert!(lookup(ResourceClass::ContextShare, CtrlCmd::SetCwdWatermark).is_some());
        assert!(lookup(ResourceClass::ChannelGroup, CtrlCmd::SetCwdWatermark).is_none());
    }

    #[test]
    fn test_tables_have_no_duplicates() {
        for class in ALL_CLASSES {
            let cmds: Vec<CtrlCmd> = export_chain(class)
                .iter()
                .flat_map(|t| t.iter().map(|e| e.cmd))
                .collect();
            for (i, cmd) in cmds.iter().enumerate() {
                assert!(!cmds[i + 1..].contains(cmd), "{} exports {} twice", class, cmd);
            }
        }
    }

    #[test]
    fn test_internal_variants_exported_with_public_ones() {
        for export in channel_group::EXPORTS {
            if let Some(internal) = export.cmd.internal_variant() {
                assert!(lookup(ResourceClass::ChannelGroup, internal).is_some());
            }
        }
    }
}
