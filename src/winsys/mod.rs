//! The buffer, relocation and submission engine.

pub mod bo;
pub(crate) mod bufmgr;
pub mod context;
pub mod decode;
pub mod exec;
pub mod handle;
pub mod map;
pub mod probe;
pub mod reloc;
pub mod tiling;
pub mod wait;

use crate::config::WinsysConfig;
use crate::drm::KernelDriver;
use crate::drm::device::DrmDevice;
use crate::error::{WinsysError, WinsysResult};
use crate::winsys::bo::BufferObject;
use crate::winsys::bufmgr::BufMgr;
use crate::winsys::context::{HwContext, ResetStats};
use crate::winsys::probe::DeviceInfo;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Locks `mutex`, recovering the data if a previous holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ===============================================================================================
// WinSys
// ===============================================================================================

/// One open GPU device: its buffer manager, capability snapshot and logical context.
///
/// Buffers created here may outlive the `WinSys`; they keep the buffer
/// manager alive until the last one is released.
#[derive(Debug)]
pub struct WinSys {
    context: Option<HwContext>,
    bufmgr: Arc<BufMgr>,
    info: DeviceInfo,
    config: WinsysConfig,
}

impl WinSys {
    /// Initializes the buffer manager on `driver` and probes the device.
    ///
    /// Nothing allocated during probing survives a failure.
    ///
    /// # Errors
    /// `Init` when the kernel lacks execbuffer2, `MissingCapability` when a
    /// required capability is absent, `Io` when the aperture cannot be queried.
    pub fn create(driver: Arc<dyn KernelDriver>, config: WinsysConfig) -> WinsysResult<Self> {
        let bufmgr = BufMgr::new(driver, config.clone())?;
        let (info, context) = probe::probe(&bufmgr, &config)?;

        Ok(Self {
            context,
            bufmgr,
            info,
            config,
        })
    }

    /// Opens the first Intel render node on the system.
    ///
    /// # Errors
    /// `Io` when no render node can be opened, otherwise as [`Self::create`].
    pub fn open_render_node(config: WinsysConfig) -> WinsysResult<Self> {
        let device = DrmDevice::open_render_node()?;
        Self::create(Arc::new(device), config)
    }

    #[must_use]
    pub const fn info(&self) -> &DeviceInfo {
        &self.info
    }

    #[must_use]
    pub const fn config(&self) -> &WinsysConfig {
        &self.config
    }

    #[must_use]
    pub const fn context(&self) -> Option<&HwContext> {
        self.context.as_ref()
    }

    #[cfg(test)]
    pub(crate) fn bufmgr(&self) -> &Arc<BufMgr> {
        &self.bufmgr
    }

    /// Reads a whitelisted hardware register.
    ///
    /// # Errors
    /// `Io` when the kernel refuses the read.
    pub fn read_reg(&self, reg: u64) -> WinsysResult<u64> {
        Ok(self.bufmgr.driver().reg_read(reg)?)
    }

    /// Hang accounting for the logical context.
    ///
    /// # Errors
    /// `NoContext` when running without a logical context, `Io` on kernel failure.
    pub fn reset_stats(&self) -> WinsysResult<ResetStats> {
        self.context
            .as_ref()
            .ok_or(WinsysError::NoContext)?
            .reset_stats()
    }

    /// Allocates a page-aligned buffer.
    ///
    /// `cpu_init` picks the path for buffers the CPU fills first; otherwise
    /// the buffer is treated as a GPU render target.
    ///
    /// # Errors
    /// `AllocFailed` when the kernel cannot provide the memory.
    pub fn alloc_bo(&self, name: &str, size: u64, cpu_init: bool) -> WinsysResult<BufferObject> {
        self.bufmgr.alloc(name, size, cpu_init)
    }

    /// Wraps caller memory in a linear buffer without copying.
    ///
    /// # Safety
    /// `ptr` must be page aligned and `ptr..ptr + size` must stay valid, and
    /// not be freed, for as long as the returned buffer or any GPU work
    /// referencing it is alive.
    ///
    /// # Errors
    /// `AllocFailed` when the kernel rejects the range.
    pub unsafe fn import_userptr(
        &self,
        name: &str,
        ptr: *mut u8,
        size: u64,
        flags: u32,
    ) -> WinsysResult<BufferObject> {
        unsafe { self.bufmgr.alloc_userptr(name, ptr, size, flags) }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::WinSys;
    use crate::config::WinsysConfig;
    use crate::drm::sim::SimKernel;
    use std::sync::Arc;

    /// A `WinSys` on a fresh file of `kernel` with default settings.
    pub(crate) fn winsys_on(kernel: &SimKernel) -> WinSys {
        WinSys::create(Arc::new(kernel.open()), WinsysConfig::default())
            .unwrap_or_else(|e| panic!("winsys creation failed: {e}"))
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::winsys_on;
    use super::*;
    use crate::drm::sim::{SimConfig, SimKernel};

    #[test]
    fn test_reset_stats_without_context() {
        let kernel = SimKernel::new(SimConfig::default().fail_context_create());
        let ws = WinSys::create(
            Arc::new(kernel.open()),
            WinsysConfig::default().with_require_logical_context(false),
        )
        .unwrap();
        assert!(ws.context().is_none());
        assert!(matches!(ws.reset_stats(), Err(WinsysError::NoContext)));
    }

    #[test]
    fn test_read_reg() {
        let kernel = SimKernel::new(SimConfig::default().with_register(0x2358, 0x1234));
        let ws = winsys_on(&kernel);
        assert_eq!(ws.read_reg(0x2358).unwrap(), 0x1234);
        assert!(ws.read_reg(0x4000).is_err());
    }

    #[test]
    fn test_userptr_is_linear() {
        let kernel = SimKernel::new(SimConfig::default());
        let ws = winsys_on(&kernel);
        let layout = std::alloc::Layout::from_size_align(8192, 4096).unwrap();

        unsafe {
            let mem = std::alloc::alloc_zeroed(layout);
            let bo = ws.import_userptr("user", mem, 8192, 0).unwrap();
            bo.write_range(0, &[7; 16]).unwrap();
            assert_eq!(*mem.add(15), 7);
            assert!(bo.set_tiling(tiling::Tiling::X, 512).is_err());
            drop(bo);
            std::alloc::dealloc(mem, layout);
        }
    }

    #[test]
    fn test_buffers_outlive_winsys() {
        let kernel = SimKernel::new(SimConfig::default());
        let ws = winsys_on(&kernel);
        let bo = ws.alloc_bo("survivor", 4096, true).unwrap();
        drop(ws);

        assert_eq!(kernel.live_contexts(), 0);
        bo.write_range(0, b"still here").unwrap();
    }
}
