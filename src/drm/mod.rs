//! Kernel-facing layer: the i915 GEM uAPI and the `KernelDriver` seam the
//! buffer engine is written against.

pub mod aperture;
pub mod device;
pub mod ioctl;
pub mod sim;

use crate::drm::ioctl::RelocationEntry;
use std::fmt;
use std::io;
use std::os::fd::RawFd;
use std::ptr::NonNull;

/// GTT sizes reported by the kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ApertureSizes {
    /// CPU-mappable part of the GTT (PCI BAR).
    pub mappable: u64,
    pub total: u64,
}

/// Tiling state as reported by SET_TILING / GET_TILING (raw uAPI values).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TilingState {
    pub tiling_mode: u32,
    pub swizzle_mode: u32,
}

/// Per-context hang accounting (raw GET_RESET_STATS values).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ContextResetStats {
    pub reset_count: u32,
    pub batch_active: u32,
    pub batch_pending: u32,
}

/// Which aperture a CPU mapping goes through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapKind {
    /// Direct CPU mapping of the backing pages.
    Cpu,
    /// Mapping through the GTT, detiled by the fence hardware.
    Gtt,
}

/// One object of an execbuffer call.
#[derive(Debug, Clone, Default)]
pub struct ExecObject {
    pub handle: u32,
    pub relocs: Vec<RelocationEntry>,
    /// In: presumed GPU address. Out: actual GPU address.
    pub offset: u64,
    pub flags: u64,
}

/// An execbuffer call. The batch is the last object.
#[derive(Debug, Clone, Default)]
pub struct ExecBuffer {
    pub objects: Vec<ExecObject>,
    pub batch_len: u32,
    pub flags: u64,
    pub ctx_id: u32,
}

/// The kernel buffer-management facility.
///
/// Handles are scoped to one implementation instance (one open DRM file).
/// Every method maps to one kernel request; errors carry the raw errno.
pub trait KernelDriver: fmt::Debug + Send + Sync {
    /// Query a capability parameter.
    fn get_param(&self, param: i32) -> io::Result<i32>;

    fn aperture_sizes(&self) -> io::Result<ApertureSizes>;

    fn reg_read(&self, reg: u64) -> io::Result<u64>;

    /// Create a zeroed object of `size` bytes, returning its handle.
    fn gem_create(&self, size: u64) -> io::Result<u32>;

    /// Wrap caller memory as an object.
    ///
    /// # Safety
    /// `ptr..ptr + size` must stay valid and page aligned for the lifetime of the handle.
    unsafe fn gem_userptr(&self, ptr: *mut u8, size: u64, flags: u32) -> io::Result<u32>;

    fn gem_close(&self, handle: u32);

    /// Publish a process-global name for the object.
    fn gem_flink(&self, handle: u32) -> io::Result<u32>;

    /// Open a global name, returning `(handle, size)`.
    fn gem_open(&self, name: u32) -> io::Result<(u32, u64)>;

    fn prime_handle_to_fd(&self, handle: u32) -> io::Result<RawFd>;

    /// Import a dma-buf, returning the handle and the size if the kernel knows it.
    fn prime_fd_to_handle(&self, fd: RawFd) -> io::Result<(u32, Option<u64>)>;

    fn set_tiling(&self, handle: u32, tiling_mode: u32, stride: u32) -> io::Result<TilingState>;

    fn get_tiling(&self, handle: u32) -> io::Result<TilingState>;

    fn mmap(&self, handle: u32, size: u64, kind: MapKind) -> io::Result<NonNull<u8>>;

    fn munmap(&self, ptr: NonNull<u8>, size: u64);

    /// Move the object into the given domains, blocking on outstanding GPU work.
    fn set_domain(&self, handle: u32, read_domains: u32, write_domain: u32) -> io::Result<()>;

    fn pwrite(&self, handle: u32, offset: u64, data: &[u8]) -> io::Result<()>;

    fn pread(&self, handle: u32, offset: u64, data: &mut [u8]) -> io::Result<()>;

    /// Wait for the object to go idle. Negative timeout waits forever.
    /// Expiry is reported as `ETIME`.
    fn wait(&self, handle: u32, timeout_ns: i64) -> io::Result<()>;

    fn busy(&self, handle: u32) -> io::Result<bool>;

    fn context_create(&self) -> io::Result<u32>;

    fn context_destroy(&self, ctx_id: u32);

    fn reset_stats(&self, ctx_id: u32) -> io::Result<ContextResetStats>;

    /// Submit a batch. On success every `ExecObject::offset` holds the
    /// address the object was executed at.
    fn execbuffer(&self, exec: &mut ExecBuffer) -> io::Result<()>;
}

pub(crate) fn errno(code: i32) -> io::Error {
    io::Error::from_raw_os_error(code)
}
