//! GPU identity
//!
//! The (GPU, GPU group, device, subdevice) tuple a GPU resource is bound to
//! at construction.

/// Identity of the GPU(s) a resource applies to.
///
/// Set once when the resource is constructed and never changed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub struct GpuIdentity {
    /// Instance of the (first) GPU.
    pub gpu_instance: u32,
    /// Mask of GPU instances in the broadcast group.
    pub gpu_mask: u32,
    /// Device instance.
    pub device_instance: u32,
    /// Subdevice instance (meaningful only for unicast resources).
    pub subdevice_instance: u32,
    /// Broadcast resource: applies to every GPU in `gpu_mask`.
    pub bc_resource: bool,
}

impl GpuIdentity {
    /// Identity of a broadcast resource allocated under a device.
    #[must_use]
    pub const fn broadcast(gpu_instance: u32, gpu_mask: u32, device_instance: u32) -> Self {
        Self {
            gpu_instance,
            gpu_mask,
            device_instance,
            subdevice_instance: 0,
            bc_resource: true,
        }
    }

    /// Narrow a device identity to one subdevice.
    #[must_use]
    pub const fn unicast(self, subdevice_instance: u32) -> Self {
        Self {
            gpu_instance: self.gpu_instance + subdevice_instance,
            gpu_mask: 1 << (self.gpu_instance + subdevice_instance),
            device_instance: self.device_instance,
            subdevice_instance,
            bc_resource: false,
        }
    }

    /// Number of GPUs the resource applies to.
    #[inline]
    #[must_use]
    pub const fn gpu_count(&self) -> u32 {
        if self.bc_resource {
            self.gpu_mask.count_ones()
        } else {
            1
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unicast_narrowing() {
        let dev = GpuIdentity::broadcast(0, 0b11, 0);
        assert_eq!(dev.gpu_count(), 2);
        let sub = dev.unicast(1);
        assert!(!sub.bc_resource);
        assert_eq!(sub.gpu_instance, 1);
        assert_eq!(sub.gpu_mask, 0b10);
        assert_eq!(sub.gpu_count(), 1);
    }
}
