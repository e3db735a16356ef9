use crate::error::{WinsysError, WinsysResult};
use crate::winsys::WinSys;
use crate::winsys::bo::BufferObject;
use crate::winsys::tiling::{Swizzle, Tiling};
use crate::winsys::lock;
use std::os::fd::RawFd;

/// Kind of handle `export_handle` produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleType {
    /// Process-global flink name.
    Shared,
    /// Raw kernel handle, only meaningful on the same open device.
    Kms,
    /// dma-buf file descriptor.
    Fd,
}

/// A buffer reference that can leave this `WinSys`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExternalHandle {
    Shared(u32),
    KernelObject(u32),
    FileDescriptor(RawFd),
}

/// An external handle with the layout needed to interpret the memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WinsysHandle {
    pub handle: ExternalHandle,
    pub tiling: Tiling,
    pub pitch: u64,
    pub height: u64,
}

/// Result of `import_handle`: the buffer and the layout the kernel reports for it.
#[derive(Debug, Clone)]
pub struct ImportedBo {
    pub bo: BufferObject,
    pub tiling: Tiling,
    pub swizzle: Swizzle,
    pub pitch: u64,
}

impl WinSys {
    /// Rebuilds a buffer from a handle exported elsewhere.
    ///
    /// Tiling and swizzling are read back from the kernel; the pitch is taken
    /// from the handle.
    ///
    /// # Errors
    /// `UnsupportedHandle` for raw kernel handles, `Import` when the kernel
    /// cannot resolve the handle or reports an unknown tiling mode.
    pub fn import_handle(&self, name: &str, handle: &WinsysHandle) -> WinsysResult<ImportedBo> {
        let bo = match handle.handle {
            ExternalHandle::Shared(global) => self.bufmgr.open_name(name, global)?,
            ExternalHandle::FileDescriptor(fd) => {
                let fallback = handle.height.saturating_mul(handle.pitch);
                self.bufmgr.open_prime(name, fd, fallback)?
            }
            ExternalHandle::KernelObject(_) => {
                return Err(WinsysError::UnsupportedHandle(
                    "raw kernel handles cannot be imported",
                ));
            }
        };

        let (tiling, swizzle) = bo.refresh_tiling()?;
        lock(&bo.0.state).pitch = handle.pitch;
        log::debug!(
            "imported '{name}' as handle {} ({} bytes, {tiling:?})",
            bo.handle(),
            bo.size()
        );

        Ok(ImportedBo {
            bo,
            tiling,
            swizzle,
            pitch: handle.pitch,
        })
    }

    /// Produces a handle another process or device can import.
    ///
    /// The export goes through the device that owns `bo`, which need not be
    /// this one. The buffer leaves the reuse cache for good once exported.
    ///
    /// # Errors
    /// `Io` when the kernel refuses to name or export the object.
    pub fn export_handle(
        &self,
        bo: &BufferObject,
        kind: HandleType,
        tiling: Tiling,
        pitch: u64,
        height: u64,
    ) -> WinsysResult<WinsysHandle> {
        let owner = bo.bufmgr();
        let driver = owner.driver();
        let handle = match kind {
            HandleType::Shared => {
                let global = driver.gem_flink(bo.handle())?;
                owner.register_name(bo, global);
                ExternalHandle::Shared(global)
            }
            HandleType::Kms => ExternalHandle::KernelObject(bo.handle()),
            HandleType::Fd => ExternalHandle::FileDescriptor(driver.prime_handle_to_fd(bo.handle())?),
        };
        owner.register(bo);

        Ok(WinsysHandle {
            handle,
            tiling,
            pitch,
            height,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drm::sim::{SimConfig, SimKernel};
    use crate::winsys::test_support::winsys_on;

    #[test]
    fn test_flink_round_trip_across_devices() {
        let kernel = SimKernel::new(SimConfig::default());
        let a = winsys_on(&kernel);
        let b = winsys_on(&kernel);

        let bo = a.alloc_bo("shared", 16384, false).unwrap();
        bo.set_tiling(Tiling::X, 1024).unwrap();
        bo.write_range(0, b"hello").unwrap();

        let exported = a
            .export_handle(&bo, HandleType::Shared, Tiling::X, 1024, 16)
            .unwrap();
        let imported = b.import_handle("peer", &exported).unwrap();

        assert_eq!(imported.tiling, Tiling::X);
        assert_eq!(imported.pitch, 1024);
        assert_eq!(imported.bo.size(), 16384);

        let mut buf = [0u8; 5];
        imported.bo.read_range(0, &mut buf).unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[test]
    fn test_second_import_returns_same_buffer() {
        let kernel = SimKernel::new(SimConfig::default());
        let a = winsys_on(&kernel);
        let b = winsys_on(&kernel);

        let bo = a.alloc_bo("shared", 4096, false).unwrap();
        let exported = a
            .export_handle(&bo, HandleType::Fd, Tiling::None, 0, 0)
            .unwrap();

        let first = b.import_handle("one", &exported).unwrap();
        let second = b.import_handle("two", &exported).unwrap();
        assert!(first.bo.ptr_eq(&second.bo));

        let ExternalHandle::FileDescriptor(fd) = exported.handle else {
            panic!("expected an fd");
        };
        kernel.close_dmabuf(fd);
    }

    #[test]
    fn test_exported_buffer_is_not_cached() {
        let kernel = SimKernel::new(SimConfig::default());
        let ws = winsys_on(&kernel);
        let cached = ws.bufmgr().cached_count();

        let bo = ws.alloc_bo("scanout", 4096, false).unwrap();
        let exported = ws
            .export_handle(&bo, HandleType::Kms, Tiling::None, 256, 16)
            .unwrap();
        assert_eq!(exported.handle, ExternalHandle::KernelObject(bo.handle()));
        assert_eq!(exported.pitch, 256);

        drop(bo);
        assert_eq!(ws.bufmgr().cached_count(), cached);
    }

    #[test]
    fn test_export_uses_the_owning_device() {
        let kernel = SimKernel::new(SimConfig::default());
        let owner = winsys_on(&kernel);
        let other = winsys_on(&kernel);
        let reader = winsys_on(&kernel);

        // Same handle number on both files, different objects.
        let bo = owner.alloc_bo("owned", 4096, true).unwrap();
        let decoy = other.alloc_bo("decoy", 4096, true).unwrap();
        assert_eq!(bo.handle(), decoy.handle());
        bo.write_range(0, b"owner").unwrap();
        decoy.write_range(0, b"decoy").unwrap();

        for kind in [HandleType::Shared, HandleType::Fd] {
            let exported = other
                .export_handle(&bo, kind, Tiling::None, 0, 1)
                .unwrap();
            let imported = reader.import_handle("peer", &exported).unwrap();

            let mut buf = [0u8; 5];
            imported.bo.read_range(0, &mut buf).unwrap();
            assert_eq!(&buf, b"owner");
        }
    }

    #[test]
    fn test_kernel_object_import_is_unsupported() {
        let kernel = SimKernel::new(SimConfig::default());
        let ws = winsys_on(&kernel);
        let handle = WinsysHandle {
            handle: ExternalHandle::KernelObject(1),
            tiling: Tiling::None,
            pitch: 0,
            height: 0,
        };
        assert!(matches!(
            ws.import_handle("raw", &handle),
            Err(WinsysError::UnsupportedHandle(_))
        ));
    }

    #[test]
    fn test_unknown_name_fails_import() {
        let kernel = SimKernel::new(SimConfig::default());
        let ws = winsys_on(&kernel);
        let handle = WinsysHandle {
            handle: ExternalHandle::Shared(999),
            tiling: Tiling::None,
            pitch: 0,
            height: 0,
        };
        assert!(matches!(
            ws.import_handle("missing", &handle),
            Err(WinsysError::Import(_))
        ));
    }
}
