#![allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]

use crate::drm::ioctl::{
    DRM_CLOEXEC, DRM_IOCTL_GEM_CLOSE, DRM_IOCTL_GEM_FLINK,
    DRM_IOCTL_GEM_OPEN, DRM_IOCTL_I915_GEM_BUSY, DRM_IOCTL_I915_GEM_CONTEXT_CREATE,
    DRM_IOCTL_I915_GEM_CONTEXT_DESTROY, DRM_IOCTL_I915_GEM_CREATE,
    DRM_IOCTL_I915_GEM_EXECBUFFER2, DRM_IOCTL_I915_GEM_GET_APERTURE,
    DRM_IOCTL_I915_GEM_GET_TILING, DRM_IOCTL_I915_GEM_MMAP, DRM_IOCTL_I915_GEM_MMAP_GTT,
    DRM_IOCTL_I915_GEM_PREAD, DRM_IOCTL_I915_GEM_PWRITE, DRM_IOCTL_I915_GEM_SET_DOMAIN,
    DRM_IOCTL_I915_GEM_SET_TILING, DRM_IOCTL_I915_GEM_USERPTR, DRM_IOCTL_I915_GEM_WAIT,
    DRM_IOCTL_I915_GETPARAM, DRM_IOCTL_I915_GET_RESET_STATS, DRM_IOCTL_I915_REG_READ,
    DRM_IOCTL_PRIME_FD_TO_HANDLE, DRM_IOCTL_PRIME_HANDLE_TO_FD, DRM_RDWR, ExecObject2, ResetStatsArgs,
    Execbuffer2Args, GemBusyArgs, GemCloseArgs, GemContextArgs, GemCreateArgs, GemFlinkArgs,
    GemGetApertureArgs, GemGetTilingArgs, GemMmapArgs, GemMmapGttArgs, GemOpenArgs, GemRwArgs,
    GemSetDomainArgs, GemSetTilingArgs, GemUserptrArgs, GemWaitArgs, GetParamArgs,
    I915_GEM_DOMAIN_GTT, PrimeHandleArgs, RegReadArgs,
};
use crate::drm::{
    ApertureSizes, ContextResetStats, ExecBuffer, KernelDriver, MapKind, TilingState, errno,
};
use std::fs::{self, File, OpenOptions};
use std::io;
use std::os::fd::RawFd;
use std::os::unix::fs::MetadataExt;
use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::ptr::{self, NonNull};
use std::sync::Arc;

/// PCI resource index of the GTT aperture BAR.
const APERTURE_BAR: usize = 2;

/// A handle to an i915 DRM device node (`/dev/dri/renderD*` or `/dev/dri/card*`).
///
/// Cheap to clone; all clones share the same open file and therefore the same
/// GEM handle namespace.
#[derive(Clone, Debug)]
pub struct DrmDevice {
    pub file: Arc<File>,
}

impl DrmDevice {
    /// Opens a DRM device node by path.
    ///
    /// # Errors
    /// Returns an error if the node cannot be opened.
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;

        Ok(Self {
            file: Arc::new(file),
        })
    }

    /// Opens the first render node that answers the i915 GETPARAM request.
    ///
    /// # Errors
    /// Returns `NotFound` when no i915 render node exists.
    pub fn open_render_node() -> io::Result<Self> {
        for minor in 128..192 {
            let path = format!("/dev/dri/renderD{minor}");
            let Ok(device) = Self::open(&path) else {
                continue;
            };
            if device.get_param(crate::drm::ioctl::I915_PARAM_CHIPSET_ID).is_ok() {
                log::debug!("using DRM render node {path}");
                return Ok(device);
            }
        }
        Err(io::Error::new(
            io::ErrorKind::NotFound,
            "no i915 render node found",
        ))
    }

    /// Wraps an already-open DRM file.
    #[must_use]
    pub fn from_file(file: File) -> Self {
        Self {
            file: Arc::new(file),
        }
    }

    /// Generic unsafe helper to execute an IOCTL, restarting on `EINTR`/`EAGAIN`.
    ///
    /// # Safety
    /// The caller must ensure that `arg` points to valid memory appropriate for the specific `cmd`.
    unsafe fn ioctl<T>(&self, cmd: u32, arg: &mut T) -> io::Result<()> {
        loop {
            let ret = unsafe { libc::ioctl(self.file.as_raw_fd(), cmd as _, arg as *mut T) };
            if ret >= 0 {
                return Ok(());
            }
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EINTR | libc::EAGAIN) => {}
                _ => return Err(err),
            }
        }
    }

    /// Reads the size of PCI BAR 2 from sysfs, which is the CPU-visible GTT window.
    fn mappable_aperture(&self) -> Option<u64> {
        let rdev = self.file.metadata().ok()?.rdev();
        let (major, minor) = (libc::major(rdev), libc::minor(rdev));
        let path = format!("/sys/dev/char/{major}:{minor}/device/resource");
        let resources = fs::read_to_string(path).ok()?;
        let line = resources.lines().nth(APERTURE_BAR)?;

        let mut fields = line
            .split_whitespace()
            .map(|f| u64::from_str_radix(f.trim_start_matches("0x"), 16));
        let start = fields.next()?.ok()?;
        let end = fields.next()?.ok()?;
        (end > start).then(|| end - start + 1)
    }
}

impl KernelDriver for DrmDevice {
    fn get_param(&self, param: i32) -> io::Result<i32> {
        let mut value: i32 = 0;
        let mut args = GetParamArgs {
            param,
            value_ptr: &raw mut value as u64,
        };
        unsafe {
            self.ioctl(DRM_IOCTL_I915_GETPARAM, &mut args)?;
        }
        Ok(value)
    }

    fn aperture_sizes(&self) -> io::Result<ApertureSizes> {
        let mut args = GemGetApertureArgs::default();
        unsafe {
            self.ioctl(DRM_IOCTL_I915_GEM_GET_APERTURE, &mut args)?;
        }
        let total = args.aper_size;
        let mappable = self.mappable_aperture().map_or(total, |m| m.min(total));
        Ok(ApertureSizes { mappable, total })
    }

    fn reg_read(&self, reg: u64) -> io::Result<u64> {
        let mut args = RegReadArgs {
            offset: reg,
            val: 0,
        };
        unsafe {
            self.ioctl(DRM_IOCTL_I915_REG_READ, &mut args)?;
        }
        Ok(args.val)
    }

    fn gem_create(&self, size: u64) -> io::Result<u32> {
        let mut args = GemCreateArgs {
            size,
            ..Default::default()
        };
        unsafe {
            self.ioctl(DRM_IOCTL_I915_GEM_CREATE, &mut args)?;
        }
        Ok(args.handle)
    }

    unsafe fn gem_userptr(&self, ptr: *mut u8, size: u64, flags: u32) -> io::Result<u32> {
        let mut args = GemUserptrArgs {
            user_ptr: ptr as u64,
            user_size: size,
            flags,
            handle: 0,
        };
        unsafe {
            self.ioctl(DRM_IOCTL_I915_GEM_USERPTR, &mut args)?;
        }
        Ok(args.handle)
    }

    fn gem_close(&self, handle: u32) {
        let mut args = GemCloseArgs { handle, pad: 0 };
        if let Err(e) = unsafe { self.ioctl(DRM_IOCTL_GEM_CLOSE, &mut args) } {
            log::warn!("GEM_CLOSE failed for handle {handle}: {e}");
        }
    }

    fn gem_flink(&self, handle: u32) -> io::Result<u32> {
        let mut args = GemFlinkArgs { handle, name: 0 };
        unsafe {
            self.ioctl(DRM_IOCTL_GEM_FLINK, &mut args)?;
        }
        Ok(args.name)
    }

    fn gem_open(&self, name: u32) -> io::Result<(u32, u64)> {
        let mut args = GemOpenArgs {
            name,
            ..Default::default()
        };
        unsafe {
            self.ioctl(DRM_IOCTL_GEM_OPEN, &mut args)?;
        }
        Ok((args.handle, args.size))
    }

    fn prime_handle_to_fd(&self, handle: u32) -> io::Result<RawFd> {
        let mut args = PrimeHandleArgs {
            handle,
            flags: DRM_CLOEXEC | DRM_RDWR,
            fd: -1,
        };
        unsafe {
            self.ioctl(DRM_IOCTL_PRIME_HANDLE_TO_FD, &mut args)?;
        }
        Ok(args.fd)
    }

    fn prime_fd_to_handle(&self, fd: RawFd) -> io::Result<(u32, Option<u64>)> {
        let mut args = PrimeHandleArgs {
            handle: 0,
            flags: 0,
            fd,
        };
        unsafe {
            self.ioctl(DRM_IOCTL_PRIME_FD_TO_HANDLE, &mut args)?;
        }

        // Older kernels cannot seek on a dma-buf; the caller falls back to
        // the size derived from pitch and height.
        let size = unsafe { libc::lseek(fd, 0, libc::SEEK_END) };
        unsafe {
            libc::lseek(fd, 0, libc::SEEK_SET);
        }
        let size = (size > 0).then_some(size as u64);

        Ok((args.handle, size))
    }

    fn set_tiling(&self, handle: u32, tiling_mode: u32, stride: u32) -> io::Result<TilingState> {
        let mut args = GemSetTilingArgs {
            handle,
            tiling_mode,
            stride,
            swizzle_mode: 0,
        };
        unsafe {
            self.ioctl(DRM_IOCTL_I915_GEM_SET_TILING, &mut args)?;
        }
        Ok(TilingState {
            tiling_mode: args.tiling_mode,
            swizzle_mode: args.swizzle_mode,
        })
    }

    fn get_tiling(&self, handle: u32) -> io::Result<TilingState> {
        let mut args = GemGetTilingArgs {
            handle,
            ..Default::default()
        };
        unsafe {
            self.ioctl(DRM_IOCTL_I915_GEM_GET_TILING, &mut args)?;
        }
        Ok(TilingState {
            tiling_mode: args.tiling_mode,
            swizzle_mode: args.swizzle_mode,
        })
    }

    fn mmap(&self, handle: u32, size: u64, kind: MapKind) -> io::Result<NonNull<u8>> {
        let addr = match kind {
            MapKind::Cpu => {
                let mut args = GemMmapArgs {
                    handle,
                    size,
                    ..Default::default()
                };
                unsafe {
                    self.ioctl(DRM_IOCTL_I915_GEM_MMAP, &mut args)?;
                }
                args.addr_ptr as *mut u8
            }
            MapKind::Gtt => {
                let mut args = GemMmapGttArgs {
                    handle,
                    ..Default::default()
                };
                unsafe {
                    self.ioctl(DRM_IOCTL_I915_GEM_MMAP_GTT, &mut args)?;
                }

                let ret = unsafe {
                    libc::mmap(
                        ptr::null_mut(),
                        size as usize,
                        libc::PROT_READ | libc::PROT_WRITE,
                        libc::MAP_SHARED,
                        self.file.as_raw_fd(),
                        args.offset as libc::off_t,
                    )
                };
                if ret == libc::MAP_FAILED {
                    return Err(io::Error::last_os_error());
                }
                ret.cast::<u8>()
            }
        };

        NonNull::new(addr).ok_or_else(|| errno(libc::EFAULT))
    }

    fn munmap(&self, ptr: NonNull<u8>, size: u64) {
        unsafe {
            libc::munmap(ptr.as_ptr().cast(), size as usize);
        }
    }

    fn set_domain(&self, handle: u32, read_domains: u32, write_domain: u32) -> io::Result<()> {
        let mut args = GemSetDomainArgs {
            handle,
            read_domains,
            write_domain,
        };
        unsafe { self.ioctl(DRM_IOCTL_I915_GEM_SET_DOMAIN, &mut args) }
    }

    fn pwrite(&self, handle: u32, offset: u64, data: &[u8]) -> io::Result<()> {
        let mut args = GemRwArgs {
            handle,
            pad: 0,
            offset,
            size: data.len() as u64,
            data_ptr: data.as_ptr() as u64,
        };
        unsafe { self.ioctl(DRM_IOCTL_I915_GEM_PWRITE, &mut args) }
    }

    fn pread(&self, handle: u32, offset: u64, data: &mut [u8]) -> io::Result<()> {
        let mut args = GemRwArgs {
            handle,
            pad: 0,
            offset,
            size: data.len() as u64,
            data_ptr: data.as_mut_ptr() as u64,
        };
        unsafe { self.ioctl(DRM_IOCTL_I915_GEM_PREAD, &mut args) }
    }

    fn wait(&self, handle: u32, timeout_ns: i64) -> io::Result<()> {
        if timeout_ns < 0 {
            // Waiting for rendering is a move into the GTT domain.
            return self.set_domain(handle, I915_GEM_DOMAIN_GTT, I915_GEM_DOMAIN_GTT);
        }

        let mut args = GemWaitArgs {
            bo_handle: handle,
            flags: 0,
            timeout_ns,
        };
        unsafe { self.ioctl(DRM_IOCTL_I915_GEM_WAIT, &mut args) }
    }

    fn busy(&self, handle: u32) -> io::Result<bool> {
        let mut args = GemBusyArgs { handle, busy: 0 };
        unsafe {
            self.ioctl(DRM_IOCTL_I915_GEM_BUSY, &mut args)?;
        }
        Ok(args.busy != 0)
    }

    fn context_create(&self) -> io::Result<u32> {
        let mut args = GemContextArgs::default();
        unsafe {
            self.ioctl(DRM_IOCTL_I915_GEM_CONTEXT_CREATE, &mut args)?;
        }
        Ok(args.ctx_id)
    }

    fn context_destroy(&self, ctx_id: u32) {
        let mut args = GemContextArgs { ctx_id, pad: 0 };
        if let Err(e) = unsafe { self.ioctl(DRM_IOCTL_I915_GEM_CONTEXT_DESTROY, &mut args) } {
            log::warn!("CONTEXT_DESTROY failed for context {ctx_id}: {e}");
        }
    }

    fn reset_stats(&self, ctx_id: u32) -> io::Result<ContextResetStats> {
        let mut args = ResetStatsArgs {
            ctx_id,
            ..Default::default()
        };
        unsafe {
            self.ioctl(DRM_IOCTL_I915_GET_RESET_STATS, &mut args)?;
        }
        Ok(ContextResetStats {
            reset_count: args.reset_count,
            batch_active: args.batch_active,
            batch_pending: args.batch_pending,
        })
    }

    fn execbuffer(&self, exec: &mut ExecBuffer) -> io::Result<()> {
        let mut objects: Vec<ExecObject2> = exec
            .objects
            .iter()
            .map(|obj| ExecObject2 {
                handle: obj.handle,
                relocation_count: obj.relocs.len() as u32,
                relocs_ptr: obj.relocs.as_ptr() as u64,
                offset: obj.offset,
                flags: obj.flags,
                ..Default::default()
            })
            .collect();

        let mut args = Execbuffer2Args {
            buffers_ptr: objects.as_mut_ptr() as u64,
            buffer_count: objects.len() as u32,
            batch_len: exec.batch_len,
            flags: exec.flags,
            rsvd1: u64::from(exec.ctx_id),
            ..Default::default()
        };
        unsafe {
            self.ioctl(DRM_IOCTL_I915_GEM_EXECBUFFER2, &mut args)?;
        }

        for (obj, raw) in exec.objects.iter_mut().zip(&objects) {
            obj.offset = raw.offset;
        }
        Ok(())
    }
}

impl AsRawFd for DrmDevice {
    fn as_raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }
}
