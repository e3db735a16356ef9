#![allow(clippy::cast_possible_truncation)]

use crate::config::WinsysConfig;
use crate::drm::KernelDriver;
use crate::drm::ioctl::I915_TILING_NONE;
use crate::error::{WinsysError, WinsysResult};
use crate::utils::{PAGE_SIZE, align_up};
use crate::winsys::bo::{BoInner, BoKind, BufferObject};
use crate::winsys::lock;
use crate::winsys::tiling::Tiling;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, Weak};
use std::time::Instant;

// ===============================================================================================
// Reuse Cache
// ===============================================================================================

/// A released kernel object waiting to be handed out again.
#[derive(Debug)]
struct CachedBo {
    handle: u32,
    /// GPU address at release, kept as the presumed offset for the next owner.
    offset: u64,
    released: Instant,
}

/// Released objects bucketed by exact size, oldest first.
#[derive(Debug, Default)]
struct BoCache {
    buckets: BTreeMap<u64, VecDeque<CachedBo>>,
}

impl BoCache {
    fn len(&self) -> usize {
        self.buckets.values().map(VecDeque::len).sum()
    }

    /// Removes every entry released before `cutoff`.
    fn expire(&mut self, cutoff: Instant) -> Vec<u32> {
        let mut expired = Vec::new();
        for bucket in self.buckets.values_mut() {
            while bucket.front().is_some_and(|entry| entry.released < cutoff) {
                if let Some(entry) = bucket.pop_front() {
                    expired.push(entry.handle);
                }
            }
        }
        self.buckets.retain(|_, bucket| !bucket.is_empty());
        expired
    }

    fn drain(&mut self) -> Vec<u32> {
        let handles = self
            .buckets
            .values_mut()
            .flat_map(|bucket| bucket.drain(..))
            .map(|entry| entry.handle)
            .collect();
        self.buckets.clear();
        handles
    }
}

// ===============================================================================================
// Shared Object Registry
// ===============================================================================================

/// Buffers whose kernel object is known to other files, so a second import
/// resolves to the existing buffer instead of a second owner of the handle.
#[derive(Debug, Default)]
struct SharedRegistry {
    by_handle: HashMap<u32, Weak<BoInner>>,
    by_name: HashMap<u32, Weak<BoInner>>,
}

// ===============================================================================================
// Buffer Manager
// ===============================================================================================

/// Owns the kernel channel on behalf of every buffer of one `WinSys`.
pub struct BufMgr {
    driver: Arc<dyn KernelDriver>,
    config: WinsysConfig,
    cache: Mutex<BoCache>,
    shared: Mutex<SharedRegistry>,
}

impl std::fmt::Debug for BufMgr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufMgr")
            .field("driver", &self.driver)
            .field("cached", &self.cached_count())
            .finish_non_exhaustive()
    }
}

impl BufMgr {
    /// Initializes the manager on `driver`.
    ///
    /// # Errors
    /// `Init` when the kernel lacks the second-generation execbuffer interface.
    pub(crate) fn new(driver: Arc<dyn KernelDriver>, config: WinsysConfig) -> WinsysResult<Arc<Self>> {
        use crate::drm::ioctl::I915_PARAM_HAS_EXECBUF2;

        match driver.get_param(I915_PARAM_HAS_EXECBUF2) {
            Ok(v) if v > 0 => {}
            _ => {
                return Err(WinsysError::Init(
                    "kernel does not support execbuffer2".to_string(),
                ));
            }
        }

        Ok(Arc::new(Self {
            driver,
            config,
            cache: Mutex::new(BoCache::default()),
            shared: Mutex::new(SharedRegistry::default()),
        }))
    }

    pub(crate) fn driver(&self) -> &dyn KernelDriver {
        self.driver.as_ref()
    }

    pub(crate) fn driver_arc(&self) -> Arc<dyn KernelDriver> {
        Arc::clone(&self.driver)
    }

    pub(crate) const fn config(&self) -> &WinsysConfig {
        &self.config
    }

    /// Objects parked in the reuse cache.
    pub(crate) fn cached_count(&self) -> usize {
        lock(&self.cache).len()
    }

    // ===========================================================================================
    // Allocation
    // ===========================================================================================

    /// Allocates a page-aligned buffer of at least `size` bytes.
    ///
    /// `cpu_init` buffers are filled by the CPU first, so only an idle cached
    /// object will do. Render buffers take the most recently released object
    /// even if the GPU still uses it; the kernel orders the accesses.
    pub(crate) fn alloc(
        self: &Arc<Self>,
        name: &str,
        size: u64,
        cpu_init: bool,
    ) -> WinsysResult<BufferObject> {
        let Some(size) = align_up(size, PAGE_SIZE) else {
            return Err(WinsysError::AllocFailed {
                name: name.to_string(),
                size,
                source: std::io::Error::from_raw_os_error(libc::EINVAL),
            });
        };

        if self.config.bo_reuse
            && let Some(cached) = self.take_cached(size, cpu_init)
        {
            log::debug!(
                "bo '{name}': reusing handle {} ({size} bytes)",
                cached.handle
            );
            return Ok(BufferObject::new(
                Arc::clone(self),
                cached.handle,
                name,
                size,
                BoKind::Allocated,
                cached.offset,
            ));
        }

        let handle = self
            .driver
            .gem_create(size)
            .map_err(|source| WinsysError::AllocFailed {
                name: name.to_string(),
                size,
                source,
            })?;
        log::debug!("bo '{name}': created handle {handle} ({size} bytes)");

        Ok(BufferObject::new(
            Arc::clone(self),
            handle,
            name,
            size,
            BoKind::Allocated,
            0,
        ))
    }

    fn take_cached(&self, size: u64, cpu_init: bool) -> Option<CachedBo> {
        let mut cache = lock(&self.cache);
        let bucket = cache.buckets.get_mut(&size)?;

        let entry = if cpu_init {
            let idle = bucket
                .front()
                .is_some_and(|entry| !self.driver.busy(entry.handle).unwrap_or(false));
            if idle { bucket.pop_front() } else { None }
        } else {
            bucket.pop_back()
        };

        if bucket.is_empty() {
            cache.buckets.remove(&size);
        }
        entry
    }

    /// Wraps caller memory.
    ///
    /// # Safety
    /// `ptr..ptr + size` must stay valid for the lifetime of the returned buffer.
    pub(crate) unsafe fn alloc_userptr(
        self: &Arc<Self>,
        name: &str,
        ptr: *mut u8,
        size: u64,
        flags: u32,
    ) -> WinsysResult<BufferObject> {
        let handle = unsafe { self.driver.gem_userptr(ptr, size, flags) }.map_err(|source| {
            WinsysError::AllocFailed {
                name: name.to_string(),
                size,
                source,
            }
        })?;
        log::debug!("bo '{name}': wrapped {size} bytes at {ptr:p} as handle {handle}");

        Ok(BufferObject::new(
            Arc::clone(self),
            handle,
            name,
            size,
            BoKind::Userptr,
            0,
        ))
    }

    // ===========================================================================================
    // Sharing
    // ===========================================================================================

    /// Opens a global name, reusing the buffer if this manager already owns it.
    pub(crate) fn open_name(self: &Arc<Self>, name: &str, global: u32) -> WinsysResult<BufferObject> {
        if let Some(bo) = self.lookup_name(global) {
            return Ok(bo);
        }

        let (handle, size) = self
            .driver
            .gem_open(global)
            .map_err(|e| WinsysError::Import(format!("cannot open global name {global}: {e}")))?;

        let bo = match self.lookup_handle(handle) {
            Some(bo) => {
                // Same object, already known under its prime handle.
                self.driver.gem_close(handle);
                bo
            }
            None => {
                let bo = BufferObject::new(Arc::clone(self), handle, name, size, BoKind::Imported, 0);
                self.register(&bo);
                bo
            }
        };

        self.register_name(&bo, global);
        Ok(bo)
    }

    /// Imports a dma-buf. `fallback_size` is used when the kernel cannot tell.
    pub(crate) fn open_prime(
        self: &Arc<Self>,
        name: &str,
        fd: std::os::fd::RawFd,
        fallback_size: u64,
    ) -> WinsysResult<BufferObject> {
        let (handle, size) = self
            .driver
            .prime_fd_to_handle(fd)
            .map_err(|e| WinsysError::Import(format!("cannot import dma-buf fd {fd}: {e}")))?;

        // The kernel hands back the existing handle for an object this file already has.
        if let Some(bo) = self.lookup_handle(handle) {
            return Ok(bo);
        }

        let size = size.unwrap_or(fallback_size);
        if size == 0 {
            self.driver.gem_close(handle);
            return Err(WinsysError::Import(format!(
                "dma-buf fd {fd} has unknown size"
            )));
        }

        let bo = BufferObject::new(Arc::clone(self), handle, name, size, BoKind::Imported, 0);
        self.register(&bo);
        Ok(bo)
    }

    /// Records that `bo` is visible outside this manager.
    pub(crate) fn register(&self, bo: &BufferObject) {
        bo.mark_shared();
        lock(&self.shared)
            .by_handle
            .insert(bo.handle(), Arc::downgrade(&bo.0));
    }

    pub(crate) fn register_name(&self, bo: &BufferObject, global: u32) {
        lock(&self.shared)
            .by_name
            .insert(global, Arc::downgrade(&bo.0));
    }

    fn lookup_handle(&self, handle: u32) -> Option<BufferObject> {
        let shared = lock(&self.shared);
        shared
            .by_handle
            .get(&handle)
            .and_then(Weak::upgrade)
            .map(BufferObject)
    }

    fn lookup_name(&self, global: u32) -> Option<BufferObject> {
        let shared = lock(&self.shared);
        shared
            .by_name
            .get(&global)
            .and_then(Weak::upgrade)
            .map(BufferObject)
    }

    /// Drops registry entries of a dying buffer.
    pub(crate) fn forget_shared(&self, handle: u32) {
        let mut shared = lock(&self.shared);
        if shared
            .by_handle
            .get(&handle)
            .is_some_and(|weak| weak.strong_count() == 0)
        {
            shared.by_handle.remove(&handle);
        }
        shared.by_name.retain(|_, weak| weak.strong_count() > 0);
    }

    // ===========================================================================================
    // Release
    // ===========================================================================================

    /// Returns a handle whose last buffer reference is gone.
    pub(crate) fn release_handle(
        &self,
        handle: u32,
        size: u64,
        tiling: Tiling,
        reusable: bool,
        offset: u64,
    ) {
        if !(self.config.bo_reuse && reusable) {
            self.driver.gem_close(handle);
            return;
        }

        if tiling != Tiling::None
            && let Err(e) = self.driver.set_tiling(handle, I915_TILING_NONE, 0)
        {
            log::warn!("handle {handle}: cannot reset tiling before caching: {e}");
            self.driver.gem_close(handle);
            return;
        }

        let now = Instant::now();
        let expired = {
            let mut cache = lock(&self.cache);
            cache.buckets.entry(size).or_default().push_back(CachedBo {
                handle,
                offset,
                released: now,
            });
            now.checked_sub(self.config.cache_expiry)
                .map(|cutoff| cache.expire(cutoff))
                .unwrap_or_default()
        };

        for handle in expired {
            log::debug!("handle {handle}: expired from reuse cache");
            self.driver.gem_close(handle);
        }
    }
}

impl Drop for BufMgr {
    fn drop(&mut self) {
        let handles = lock(&self.cache).drain();
        for handle in handles {
            self.driver.gem_close(handle);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drm::sim::{SimConfig, SimKernel};
    use std::time::Duration;

    fn bufmgr(kernel: &SimKernel, config: WinsysConfig) -> Arc<BufMgr> {
        BufMgr::new(Arc::new(kernel.open()), config).unwrap()
    }

    #[test]
    fn test_requires_execbuffer2() {
        use crate::drm::ioctl::I915_PARAM_HAS_EXECBUF2;

        let kernel = SimKernel::new(SimConfig::default().without_param(I915_PARAM_HAS_EXECBUF2));
        let err = BufMgr::new(Arc::new(kernel.open()), WinsysConfig::default()).unwrap_err();
        assert!(matches!(err, WinsysError::Init(_)));
    }

    #[test]
    fn test_sizes_are_page_aligned() {
        let kernel = SimKernel::new(SimConfig::default());
        let mgr = bufmgr(&kernel, WinsysConfig::default());
        let bo = mgr.alloc("odd", 5000, true).unwrap();
        assert_eq!(bo.size(), 8192);
    }

    #[test]
    fn test_unalignable_size_fails_without_kernel_call() {
        let kernel = SimKernel::new(SimConfig::default());
        let mgr = bufmgr(&kernel, WinsysConfig::default());
        let before = kernel.ioctl_count();

        let err = mgr.alloc("huge", u64::MAX, true).unwrap_err();
        assert!(matches!(err, WinsysError::AllocFailed { size: u64::MAX, .. }));
        assert_eq!(err.errno(), -libc::EINVAL);
        assert_eq!(kernel.ioctl_count(), before);
    }

    #[test]
    fn test_released_buffer_is_reused() {
        let kernel = SimKernel::new(SimConfig::default());
        let mgr = bufmgr(&kernel, WinsysConfig::default());

        let first = mgr.alloc("a", 4096, true).unwrap();
        let handle = first.handle();
        drop(first);
        assert_eq!(mgr.cached_count(), 1);

        let second = mgr.alloc("b", 4096, true).unwrap();
        assert_eq!(second.handle(), handle);
        assert_eq!(mgr.cached_count(), 0);
    }

    #[test]
    fn test_cpu_init_skips_busy_buffer() {
        use crate::winsys::exec::Ring;

        let kernel = SimKernel::new(SimConfig::default().manual_retire());
        let ws = crate::winsys::WinSys::create(
            Arc::new(kernel.open()),
            WinsysConfig::default().with_require_logical_context(false),
        )
        .unwrap();
        let batch = ws.alloc_bo("batch", 4096, true).unwrap();
        ws.submit(Ring::Blt, &batch, 8, crate::winsys::exec::ExecFlags::empty())
            .unwrap();
        let busy_handle = batch.handle();
        drop(batch);

        let cpu = ws.alloc_bo("upload", 4096, true).unwrap();
        assert_ne!(cpu.handle(), busy_handle);

        let render = ws.alloc_bo("target", 4096, false).unwrap();
        assert_eq!(render.handle(), busy_handle);
    }

    #[test]
    fn test_reuse_disabled_closes_handles() {
        let kernel = SimKernel::new(SimConfig::default());
        let mgr = bufmgr(&kernel, WinsysConfig::default().with_bo_reuse(false));
        let bo = mgr.alloc("a", 4096, true).unwrap();
        assert_eq!(kernel.live_objects(), 1);
        drop(bo);
        assert_eq!(mgr.cached_count(), 0);
        assert_eq!(kernel.live_objects(), 0);
    }

    #[test]
    fn test_stale_entries_expire() {
        let kernel = SimKernel::new(SimConfig::default());
        let mgr = bufmgr(
            &kernel,
            WinsysConfig::default().with_cache_expiry(Duration::from_millis(1)),
        );
        drop(mgr.alloc("old", 4096, true).unwrap());
        std::thread::sleep(Duration::from_millis(20));
        drop(mgr.alloc("new", 8192, true).unwrap());

        assert_eq!(mgr.cached_count(), 1);
        assert_eq!(kernel.live_objects(), 1);
    }

    #[test]
    fn test_drop_drains_cache() {
        let kernel = SimKernel::new(SimConfig::default());
        let dev = Arc::new(kernel.open());
        let mgr = BufMgr::new(dev.clone(), WinsysConfig::default()).unwrap();
        drop(mgr.alloc("a", 4096, true).unwrap());
        assert_eq!(kernel.live_objects(), 1);

        drop(mgr);
        assert_eq!(kernel.live_objects(), 0);
        drop(dev);
    }
}
