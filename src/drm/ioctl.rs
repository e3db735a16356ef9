use crate::utils::{drm_iow, drm_iowr, driver_ior, driver_iow, driver_iowr};

// ===============================================================================================
// Capability Parameters
// ===============================================================================================

pub const I915_PARAM_CHIPSET_ID: i32 = 4;
pub const I915_PARAM_HAS_EXECBUF2: i32 = 9;
pub const I915_PARAM_HAS_RELAXED_DELTA: i32 = 15;
pub const I915_PARAM_HAS_GEN7_SOL_RESET: i32 = 16;
pub const I915_PARAM_HAS_LLC: i32 = 17;
pub const I915_PARAM_HAS_ALIASING_PPGTT: i32 = 18;
pub const I915_PARAM_HAS_WAIT_TIMEOUT: i32 = 19;

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct GetParamArgs {
    pub param: i32,
    pub value_ptr: u64,
}

// ===============================================================================================
// Memory Domains, Tiling, Swizzling
// ===============================================================================================

pub const I915_GEM_DOMAIN_CPU: u32 = 0x0000_0001;
pub const I915_GEM_DOMAIN_RENDER: u32 = 0x0000_0002;
pub const I915_GEM_DOMAIN_SAMPLER: u32 = 0x0000_0004;
pub const I915_GEM_DOMAIN_COMMAND: u32 = 0x0000_0008;
pub const I915_GEM_DOMAIN_INSTRUCTION: u32 = 0x0000_0010;
pub const I915_GEM_DOMAIN_VERTEX: u32 = 0x0000_0020;
pub const I915_GEM_DOMAIN_GTT: u32 = 0x0000_0040;

pub const I915_TILING_NONE: u32 = 0;
pub const I915_TILING_X: u32 = 1;
pub const I915_TILING_Y: u32 = 2;

pub const I915_BIT_6_SWIZZLE_NONE: u32 = 0;
pub const I915_BIT_6_SWIZZLE_9: u32 = 1;
pub const I915_BIT_6_SWIZZLE_9_10: u32 = 2;
pub const I915_BIT_6_SWIZZLE_9_11: u32 = 3;
pub const I915_BIT_6_SWIZZLE_9_10_11: u32 = 4;
pub const I915_BIT_6_SWIZZLE_UNKNOWN: u32 = 5;
pub const I915_BIT_6_SWIZZLE_9_17: u32 = 6;
pub const I915_BIT_6_SWIZZLE_9_10_17: u32 = 7;

// ===============================================================================================
// GEM Object Lifecycle & Sharing
// ===============================================================================================

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct GemCreateArgs {
    pub size: u64,
    pub handle: u32,
    pub pad: u32,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct GemCloseArgs {
    pub handle: u32,
    pub pad: u32,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct GemFlinkArgs {
    pub handle: u32,
    pub name: u32,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct GemOpenArgs {
    pub name: u32,
    pub handle: u32,
    pub size: u64,
}

pub const DRM_CLOEXEC: u32 = libc::O_CLOEXEC as u32;
pub const DRM_RDWR: u32 = libc::O_RDWR as u32;

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct PrimeHandleArgs {
    pub handle: u32,
    pub flags: u32,
    pub fd: i32,
}

pub const I915_USERPTR_READ_ONLY: u32 = 0x1;
pub const I915_USERPTR_UNSYNCHRONIZED: u32 = 0x8000_0000;

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct GemUserptrArgs {
    pub user_ptr: u64,
    pub user_size: u64,
    pub flags: u32,
    pub handle: u32,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct GemSetTilingArgs {
    pub handle: u32,
    pub tiling_mode: u32,
    pub stride: u32,
    pub swizzle_mode: u32,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct GemGetTilingArgs {
    pub handle: u32,
    pub tiling_mode: u32,
    pub swizzle_mode: u32,
    pub phys_swizzle_mode: u32,
}

// ===============================================================================================
// CPU Access
// ===============================================================================================

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct GemMmapArgs {
    pub handle: u32,
    pub pad: u32,
    pub offset: u64,
    pub size: u64,
    pub addr_ptr: u64,
    pub flags: u64,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct GemMmapGttArgs {
    pub handle: u32,
    pub pad: u32,
    pub offset: u64,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct GemSetDomainArgs {
    pub handle: u32,
    pub read_domains: u32,
    pub write_domain: u32,
}

/// Shared by PWRITE and PREAD.
#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct GemRwArgs {
    pub handle: u32,
    pub pad: u32,
    pub offset: u64,
    pub size: u64,
    pub data_ptr: u64,
}

// ===============================================================================================
// Synchronization
// ===============================================================================================

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct GemWaitArgs {
    pub bo_handle: u32,
    pub flags: u32,
    pub timeout_ns: i64,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct GemBusyArgs {
    pub handle: u32,
    pub busy: u32,
}

// ===============================================================================================
// Device Info, Contexts, Registers
// ===============================================================================================

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct GemGetApertureArgs {
    pub aper_size: u64,
    pub aper_available_size: u64,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct GemContextArgs {
    pub ctx_id: u32,
    pub pad: u32,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct RegReadArgs {
    pub offset: u64,
    pub val: u64,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct ResetStatsArgs {
    pub ctx_id: u32,
    pub flags: u32,
    pub reset_count: u32,
    pub batch_active: u32,
    pub batch_pending: u32,
    pub pad: u32,
}

// ===============================================================================================
// Execution
// ===============================================================================================

pub const I915_EXEC_RING_MASK: u64 = 0x3f;
pub const I915_EXEC_DEFAULT: u64 = 0;
pub const I915_EXEC_RENDER: u64 = 1;
pub const I915_EXEC_BSD: u64 = 2;
pub const I915_EXEC_BLT: u64 = 3;
pub const I915_EXEC_VEBOX: u64 = 4;

pub const I915_EXEC_GEN7_SOL_RESET: u64 = 1 << 8;
pub const I915_EXEC_SECURE: u64 = 1 << 9;
pub const I915_EXEC_IS_PINNED: u64 = 1 << 10;
pub const I915_EXEC_NO_RELOC: u64 = 1 << 11;

pub const EXEC_OBJECT_NEEDS_FENCE: u64 = 1 << 0;
pub const EXEC_OBJECT_NEEDS_GTT: u64 = 1 << 1;
pub const EXEC_OBJECT_WRITE: u64 = 1 << 2;

#[repr(C)]
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct RelocationEntry {
    pub target_handle: u32,
    pub delta: u32,
    pub offset: u64,
    pub presumed_offset: u64,
    pub read_domains: u32,
    pub write_domain: u32,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct ExecObject2 {
    pub handle: u32,
    pub relocation_count: u32,
    pub relocs_ptr: u64,
    pub alignment: u64,
    pub offset: u64,
    pub flags: u64,
    pub rsvd1: u64,
    pub rsvd2: u64,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct Execbuffer2Args {
    pub buffers_ptr: u64,
    pub buffer_count: u32,
    pub batch_start_offset: u32,
    pub batch_len: u32,
    pub dr1: u32,
    pub dr4: u32,
    pub num_cliprects: u32,
    pub cliprects_ptr: u64,
    pub flags: u64,
    /// Logical context id (`i915_execbuffer2_set_context_id`).
    pub rsvd1: u64,
    pub rsvd2: u64,
}

const _: () = assert!(std::mem::size_of::<RelocationEntry>() == 32);
const _: () = assert!(std::mem::size_of::<ExecObject2>() == 56);
const _: () = assert!(std::mem::size_of::<Execbuffer2Args>() == 64);
const _: () = assert!(std::mem::size_of::<GetParamArgs>() == 16);

// ===============================================================================================
// Request Codes
// ===============================================================================================

pub const DRM_IOCTL_GEM_CLOSE: u32 = drm_iow::<GemCloseArgs>(0x09);
pub const DRM_IOCTL_GEM_FLINK: u32 = drm_iowr::<GemFlinkArgs>(0x0a);
pub const DRM_IOCTL_GEM_OPEN: u32 = drm_iowr::<GemOpenArgs>(0x0b);
pub const DRM_IOCTL_PRIME_HANDLE_TO_FD: u32 = drm_iowr::<PrimeHandleArgs>(0x2d);
pub const DRM_IOCTL_PRIME_FD_TO_HANDLE: u32 = drm_iowr::<PrimeHandleArgs>(0x2e);

pub const DRM_IOCTL_I915_GETPARAM: u32 = driver_iowr::<GetParamArgs>(0x06);
pub const DRM_IOCTL_I915_GEM_BUSY: u32 = driver_iowr::<GemBusyArgs>(0x17);
pub const DRM_IOCTL_I915_GEM_CREATE: u32 = driver_iowr::<GemCreateArgs>(0x1b);
pub const DRM_IOCTL_I915_GEM_PREAD: u32 = driver_iow::<GemRwArgs>(0x1c);
pub const DRM_IOCTL_I915_GEM_PWRITE: u32 = driver_iow::<GemRwArgs>(0x1d);
pub const DRM_IOCTL_I915_GEM_MMAP: u32 = driver_iowr::<GemMmapArgs>(0x1e);
pub const DRM_IOCTL_I915_GEM_SET_DOMAIN: u32 = driver_iow::<GemSetDomainArgs>(0x1f);
pub const DRM_IOCTL_I915_GEM_SET_TILING: u32 = driver_iowr::<GemSetTilingArgs>(0x21);
pub const DRM_IOCTL_I915_GEM_GET_TILING: u32 = driver_iowr::<GemGetTilingArgs>(0x22);
pub const DRM_IOCTL_I915_GEM_GET_APERTURE: u32 = driver_ior::<GemGetApertureArgs>(0x23);
pub const DRM_IOCTL_I915_GEM_MMAP_GTT: u32 = driver_iowr::<GemMmapGttArgs>(0x24);
pub const DRM_IOCTL_I915_GEM_EXECBUFFER2: u32 = driver_iow::<Execbuffer2Args>(0x29);
pub const DRM_IOCTL_I915_GEM_WAIT: u32 = driver_iowr::<GemWaitArgs>(0x2c);
pub const DRM_IOCTL_I915_GEM_CONTEXT_CREATE: u32 = driver_iowr::<GemContextArgs>(0x2d);
pub const DRM_IOCTL_I915_GEM_CONTEXT_DESTROY: u32 = driver_iow::<GemContextArgs>(0x2e);
pub const DRM_IOCTL_I915_REG_READ: u32 = driver_iowr::<RegReadArgs>(0x31);
pub const DRM_IOCTL_I915_GET_RESET_STATS: u32 = driver_iowr::<ResetStatsArgs>(0x32);
pub const DRM_IOCTL_I915_GEM_USERPTR: u32 = driver_iowr::<GemUserptrArgs>(0x33);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_request_codes() {
        assert_eq!(DRM_IOCTL_GEM_CLOSE, 0x4008_6409);
        assert_eq!(DRM_IOCTL_I915_GEM_CREATE, 0xC010_645B);
        assert_eq!(DRM_IOCTL_I915_GEM_EXECBUFFER2, 0x4040_6469);
        assert_eq!(DRM_IOCTL_I915_GEM_WAIT, 0xC010_646C);
    }
}
