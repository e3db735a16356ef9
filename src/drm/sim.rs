//! An in-process model of the i915 GEM interface.
//!
//! `SimKernel` plays the kernel: it owns every object, the global flink and
//! dma-buf namespaces, the GTT and the logical contexts. Each `SimDevice` is
//! one open file with its own handle table, so buffers can be shared between
//! devices exactly as between processes. Submitted work stays busy until
//! retired, either immediately (the default) or by `SimKernel::retire`.

#![allow(clippy::cast_possible_truncation)]

use crate::drm::aperture::Aperture;
use crate::drm::ioctl::{
    I915_BIT_6_SWIZZLE_NONE, I915_EXEC_DEFAULT, I915_EXEC_RENDER, I915_EXEC_RING_MASK,
    I915_EXEC_VEBOX, I915_PARAM_CHIPSET_ID, I915_PARAM_HAS_ALIASING_PPGTT,
    I915_PARAM_HAS_EXECBUF2, I915_PARAM_HAS_GEN7_SOL_RESET, I915_PARAM_HAS_LLC,
    I915_PARAM_HAS_RELAXED_DELTA, I915_PARAM_HAS_WAIT_TIMEOUT, I915_TILING_NONE, I915_TILING_Y,
};
use crate::drm::{
    ApertureSizes, ContextResetStats, ExecBuffer, KernelDriver, MapKind, TilingState, errno,
};
use crate::utils::PAGE_SIZE;
use std::collections::HashMap;
use std::io;
use std::os::fd::RawFd;
use std::ptr::{self, NonNull};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// GTT offset of the first placed object; offset 0 means "never bound".
const GTT_BASE: u64 = 0x1_0000;
const FIRST_DMABUF_FD: RawFd = 1000;
/// TIMESTAMP register, readable on every simulated device.
const TIMESTAMP_REG: u64 = 0x2358;

/// Capabilities and fault injection for a simulated device.
#[derive(Debug, Clone)]
pub struct SimConfig {
    params: HashMap<i32, i32>,
    aperture: ApertureSizes,
    registers: HashMap<u64, u64>,
    swizzle_mode: u32,
    auto_retire: bool,
    fail_context_create: bool,
    downgrade_tiling: bool,
}

impl Default for SimConfig {
    fn default() -> Self {
        let params = HashMap::from([
            (I915_PARAM_CHIPSET_ID, 0x1616),
            (I915_PARAM_HAS_EXECBUF2, 1),
            (I915_PARAM_HAS_RELAXED_DELTA, 1),
            (I915_PARAM_HAS_GEN7_SOL_RESET, 1),
            (I915_PARAM_HAS_LLC, 1),
            (I915_PARAM_HAS_ALIASING_PPGTT, 1),
            (I915_PARAM_HAS_WAIT_TIMEOUT, 1),
        ]);

        Self {
            params,
            aperture: ApertureSizes {
                mappable: 256 << 20,
                total: 4 << 30,
            },
            registers: HashMap::from([(TIMESTAMP_REG, 0)]),
            swizzle_mode: I915_BIT_6_SWIZZLE_NONE,
            auto_retire: true,
            fail_context_create: false,
            downgrade_tiling: false,
        }
    }
}

impl SimConfig {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_param(mut self, param: i32, value: i32) -> Self {
        self.params.insert(param, value);
        self
    }

    /// Make GETPARAM fail for `param`, as on a kernel that predates it.
    #[must_use]
    pub fn without_param(mut self, param: i32) -> Self {
        self.params.remove(&param);
        self
    }

    #[must_use]
    pub const fn with_aperture(mut self, mappable: u64, total: u64) -> Self {
        self.aperture = ApertureSizes { mappable, total };
        self
    }

    #[must_use]
    pub fn with_register(mut self, reg: u64, value: u64) -> Self {
        self.registers.insert(reg, value);
        self
    }

    #[must_use]
    pub fn without_register(mut self, reg: u64) -> Self {
        self.registers.remove(&reg);
        self
    }

    /// Swizzle mode reported for tiled objects.
    #[must_use]
    pub const fn with_swizzle(mut self, swizzle_mode: u32) -> Self {
        self.swizzle_mode = swizzle_mode;
        self
    }

    /// Keep submitted work busy until `SimKernel::retire` is called.
    #[must_use]
    pub const fn manual_retire(mut self) -> Self {
        self.auto_retire = false;
        self
    }

    #[must_use]
    pub const fn fail_context_create(mut self) -> Self {
        self.fail_context_create = true;
        self
    }

    /// SET_TILING silently leaves objects linear.
    #[must_use]
    pub const fn downgrade_tiling(mut self) -> Self {
        self.downgrade_tiling = true;
        self
    }
}

/// Backing pages of a simulated object.
#[derive(Debug)]
struct Storage {
    ptr: NonNull<u8>,
    len: usize,
    owned: bool,
}

// The pages are only touched under the kernel lock or through a mapping the
// caller owns.
unsafe impl Send for Storage {}

impl Storage {
    fn zeroed(len: usize) -> Self {
        let boxed = vec![0u8; len].into_boxed_slice();
        let raw = Box::into_raw(boxed).cast::<u8>();
        Self {
            // Box never hands out null.
            ptr: NonNull::new(raw).unwrap_or(NonNull::dangling()),
            len,
            owned: true,
        }
    }

    fn write(&mut self, offset: usize, data: &[u8]) {
        unsafe {
            ptr::copy_nonoverlapping(data.as_ptr(), self.ptr.as_ptr().add(offset), data.len());
        }
    }

    fn read(&self, offset: usize, out: &mut [u8]) {
        unsafe {
            ptr::copy_nonoverlapping(self.ptr.as_ptr().add(offset), out.as_mut_ptr(), out.len());
        }
    }
}

impl Drop for Storage {
    fn drop(&mut self) {
        if self.owned {
            unsafe {
                drop(Box::from_raw(ptr::slice_from_raw_parts_mut(
                    self.ptr.as_ptr(),
                    self.len,
                )));
            }
        }
    }
}

#[derive(Debug)]
struct SimObject {
    size: u64,
    storage: Storage,
    tiling: TilingState,
    gtt_offset: Option<u64>,
    last_seqno: u64,
    /// Open handles plus live dma-buf fds.
    refs: usize,
}

#[derive(Debug, Default)]
struct SimFile {
    handles: HashMap<u32, u64>,
    next_handle: u32,
}

#[derive(Debug)]
struct SimContext {
    file: u32,
    stats: ContextResetStats,
}

/// One accepted execbuffer call, for inspection by tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmissionRecord {
    pub ring: u64,
    pub flags: u64,
    pub ctx_id: u32,
    pub batch_len: u32,
    pub handles: Vec<u32>,
}

#[derive(Debug)]
struct SimState {
    objects: HashMap<u64, SimObject>,
    files: HashMap<u32, SimFile>,
    names: HashMap<u32, u64>,
    dmabufs: HashMap<RawFd, u64>,
    contexts: HashMap<u32, SimContext>,
    gtt: Aperture,
    seqno: u64,
    retired: u64,
    next_object: u64,
    next_file: u32,
    next_name: u32,
    next_fd: RawFd,
    next_ctx: u32,
    ioctls: u64,
    submissions: Vec<SubmissionRecord>,
}

impl SimState {
    fn is_busy(&self, obj: &SimObject) -> bool {
        obj.last_seqno > self.retired
    }

    fn lookup(&self, file: u32, handle: u32) -> io::Result<u64> {
        self.files
            .get(&file)
            .and_then(|f| f.handles.get(&handle))
            .copied()
            .ok_or_else(|| errno(libc::ENOENT))
    }

    fn object(&self, file: u32, handle: u32) -> io::Result<&SimObject> {
        let id = self.lookup(file, handle)?;
        self.objects.get(&id).ok_or_else(|| errno(libc::ENOENT))
    }

    fn object_mut(&mut self, file: u32, handle: u32) -> io::Result<&mut SimObject> {
        let id = self.lookup(file, handle)?;
        self.objects.get_mut(&id).ok_or_else(|| errno(libc::ENOENT))
    }

    fn insert_object(&mut self, size: u64, storage: Storage) -> u64 {
        let id = self.next_object;
        self.next_object += 1;
        self.objects.insert(
            id,
            SimObject {
                size,
                storage,
                tiling: TilingState::default(),
                gtt_offset: None,
                last_seqno: 0,
                refs: 0,
            },
        );
        id
    }

    /// Returns the file's handle for `id`, creating one if needed.
    fn attach(&mut self, file: u32, id: u64, reuse: bool) -> io::Result<u32> {
        let f = self.files.get_mut(&file).ok_or_else(|| errno(libc::EBADF))?;
        if reuse
            && let Some((&handle, _)) = f.handles.iter().find(|&(_, &obj)| obj == id)
        {
            return Ok(handle);
        }

        f.next_handle += 1;
        let handle = f.next_handle;
        f.handles.insert(handle, id);
        if let Some(obj) = self.objects.get_mut(&id) {
            obj.refs += 1;
        }
        Ok(handle)
    }

    fn unref(&mut self, id: u64) {
        let Some(obj) = self.objects.get_mut(&id) else {
            return;
        };
        obj.refs = obj.refs.saturating_sub(1);
        if obj.refs > 0 {
            return;
        }

        if let Some(obj) = self.objects.remove(&id) {
            if let Some(offset) = obj.gtt_offset {
                self.gtt.free(offset);
            }
            self.names.retain(|_, &mut target| target != id);
        }
    }
}

#[derive(Debug)]
struct Shared {
    config: SimConfig,
    state: Mutex<SimState>,
    idle: Condvar,
}

/// The simulated kernel. Cheap to clone.
#[derive(Debug, Clone)]
pub struct SimKernel {
    shared: Arc<Shared>,
}

impl SimKernel {
    #[must_use]
    pub fn new(config: SimConfig) -> Self {
        let gtt = Aperture::new(GTT_BASE, GTT_BASE + config.aperture.total, PAGE_SIZE);
        let state = SimState {
            objects: HashMap::new(),
            files: HashMap::new(),
            names: HashMap::new(),
            dmabufs: HashMap::new(),
            contexts: HashMap::new(),
            gtt,
            seqno: 0,
            retired: 0,
            next_object: 1,
            next_file: 0,
            next_name: 0,
            next_fd: FIRST_DMABUF_FD,
            next_ctx: 0,
            ioctls: 0,
            submissions: Vec::new(),
        };

        Self {
            shared: Arc::new(Shared {
                config,
                state: Mutex::new(state),
                idle: Condvar::new(),
            }),
        }
    }

    /// Opens a new file on the device.
    #[must_use]
    pub fn open(&self) -> SimDevice {
        let mut state = self.lock();
        state.next_file += 1;
        let file = state.next_file;
        state.files.insert(file, SimFile::default());
        drop(state);

        SimDevice {
            kernel: self.clone(),
            file,
        }
    }

    /// Completes all submitted work and wakes waiters.
    pub fn retire(&self) {
        let mut state = self.lock();
        state.retired = state.seqno;
        drop(state);
        self.shared.idle.notify_all();
    }

    /// Number of objects still backed by memory.
    #[must_use]
    pub fn live_objects(&self) -> usize {
        self.lock().objects.len()
    }

    #[must_use]
    pub fn live_contexts(&self) -> usize {
        self.lock().contexts.len()
    }

    /// Total requests issued by every file so far.
    #[must_use]
    pub fn ioctl_count(&self) -> u64 {
        self.lock().ioctls
    }

    #[must_use]
    pub fn submissions(&self) -> Vec<SubmissionRecord> {
        self.lock().submissions.clone()
    }

    /// Account a GPU hang against every live context.
    pub fn inject_reset(&self, active: u32, pending: u32) {
        let mut state = self.lock();
        for ctx in state.contexts.values_mut() {
            ctx.stats.reset_count += 1;
            ctx.stats.batch_active += active;
            ctx.stats.batch_pending += pending;
        }
    }

    /// Close a dma-buf fd returned by `prime_handle_to_fd`.
    pub fn close_dmabuf(&self, fd: RawFd) {
        let mut state = self.lock();
        if let Some(id) = state.dmabufs.remove(&fd) {
            state.unref(id);
        }
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.shared
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

/// One open file on a `SimKernel`.
#[derive(Debug)]
pub struct SimDevice {
    kernel: SimKernel,
    file: u32,
}

impl SimDevice {
    #[must_use]
    pub const fn kernel(&self) -> &SimKernel {
        &self.kernel
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        let mut state = self.kernel.lock();
        state.ioctls += 1;
        state
    }

    fn config(&self) -> &SimConfig {
        &self.kernel.shared.config
    }

    /// Blocks until the object is idle or the deadline passes.
    fn wait_idle(&self, handle: u32, deadline: Option<Instant>) -> io::Result<()> {
        let mut state = self.lock();
        loop {
            let obj = state.object(self.file, handle)?;
            if !state.is_busy(obj) {
                return Ok(());
            }

            match deadline {
                None => {
                    state = self
                        .kernel
                        .shared
                        .idle
                        .wait(state)
                        .unwrap_or_else(std::sync::PoisonError::into_inner);
                }
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(errno(libc::ETIME));
                    }
                    state = self
                        .kernel
                        .shared
                        .idle
                        .wait_timeout(state, deadline - now)
                        .unwrap_or_else(std::sync::PoisonError::into_inner)
                        .0;
                }
            }
        }
    }

    fn check_range(obj: &SimObject, offset: u64, len: usize) -> io::Result<(usize, usize)> {
        match offset.checked_add(len as u64) {
            Some(end) if end <= obj.size => Ok((offset as usize, len)),
            _ => Err(errno(libc::EINVAL)),
        }
    }
}

impl Drop for SimDevice {
    fn drop(&mut self) {
        let mut state = self.kernel.lock();
        let Some(file) = state.files.remove(&self.file) else {
            return;
        };
        for id in file.handles.into_values() {
            state.unref(id);
        }
        state.contexts.retain(|_, ctx| ctx.file != self.file);
    }
}

impl KernelDriver for SimDevice {
    fn get_param(&self, param: i32) -> io::Result<i32> {
        let _state = self.lock();
        self.config()
            .params
            .get(&param)
            .copied()
            .ok_or_else(|| errno(libc::EINVAL))
    }

    fn aperture_sizes(&self) -> io::Result<ApertureSizes> {
        let _state = self.lock();
        Ok(self.config().aperture)
    }

    fn reg_read(&self, reg: u64) -> io::Result<u64> {
        let _state = self.lock();
        self.config()
            .registers
            .get(&reg)
            .copied()
            .ok_or_else(|| errno(libc::EINVAL))
    }

    fn gem_create(&self, size: u64) -> io::Result<u32> {
        let mut state = self.lock();
        if size == 0 || size % PAGE_SIZE != 0 {
            return Err(errno(libc::EINVAL));
        }
        let id = state.insert_object(size, Storage::zeroed(size as usize));
        state.attach(self.file, id, false)
    }

    unsafe fn gem_userptr(&self, ptr: *mut u8, size: u64, _flags: u32) -> io::Result<u32> {
        let mut state = self.lock();
        let Some(ptr) = NonNull::new(ptr) else {
            return Err(errno(libc::EFAULT));
        };
        if size == 0 || size % PAGE_SIZE != 0 || (ptr.as_ptr() as u64) % PAGE_SIZE != 0 {
            return Err(errno(libc::EINVAL));
        }

        let storage = Storage {
            ptr,
            len: size as usize,
            owned: false,
        };
        let id = state.insert_object(size, storage);
        state.attach(self.file, id, false)
    }

    fn gem_close(&self, handle: u32) {
        let mut state = self.lock();
        let removed = state
            .files
            .get_mut(&self.file)
            .and_then(|f| f.handles.remove(&handle));
        if let Some(id) = removed {
            state.unref(id);
        }
    }

    fn gem_flink(&self, handle: u32) -> io::Result<u32> {
        let mut state = self.lock();
        let id = state.lookup(self.file, handle)?;
        if let Some((&name, _)) = state.names.iter().find(|&(_, &obj)| obj == id) {
            return Ok(name);
        }
        state.next_name += 1;
        let name = state.next_name;
        state.names.insert(name, id);
        Ok(name)
    }

    fn gem_open(&self, name: u32) -> io::Result<(u32, u64)> {
        let mut state = self.lock();
        let id = *state.names.get(&name).ok_or_else(|| errno(libc::ENOENT))?;
        let size = state.objects.get(&id).map_or(0, |o| o.size);
        let handle = state.attach(self.file, id, false)?;
        Ok((handle, size))
    }

    fn prime_handle_to_fd(&self, handle: u32) -> io::Result<RawFd> {
        let mut state = self.lock();
        let id = state.lookup(self.file, handle)?;
        let fd = state.next_fd;
        state.next_fd += 1;
        state.dmabufs.insert(fd, id);
        if let Some(obj) = state.objects.get_mut(&id) {
            obj.refs += 1;
        }
        Ok(fd)
    }

    fn prime_fd_to_handle(&self, fd: RawFd) -> io::Result<(u32, Option<u64>)> {
        let mut state = self.lock();
        let id = *state.dmabufs.get(&fd).ok_or_else(|| errno(libc::EBADF))?;
        let size = state.objects.get(&id).map(|o| o.size);
        let handle = state.attach(self.file, id, true)?;
        Ok((handle, size))
    }

    fn set_tiling(&self, handle: u32, tiling_mode: u32, _stride: u32) -> io::Result<TilingState> {
        let downgrade = self.config().downgrade_tiling;
        let swizzle = self.config().swizzle_mode;
        let mut state = self.lock();
        let obj = state.object_mut(self.file, handle)?;
        if tiling_mode > I915_TILING_Y {
            return Err(errno(libc::EINVAL));
        }

        let applied = if downgrade { I915_TILING_NONE } else { tiling_mode };
        obj.tiling = TilingState {
            tiling_mode: applied,
            swizzle_mode: if applied == I915_TILING_NONE {
                I915_BIT_6_SWIZZLE_NONE
            } else {
                swizzle
            },
        };
        Ok(obj.tiling)
    }

    fn get_tiling(&self, handle: u32) -> io::Result<TilingState> {
        let state = self.lock();
        Ok(state.object(self.file, handle)?.tiling)
    }

    fn mmap(&self, handle: u32, size: u64, _kind: MapKind) -> io::Result<NonNull<u8>> {
        let state = self.lock();
        let obj = state.object(self.file, handle)?;
        if size > obj.size {
            return Err(errno(libc::EINVAL));
        }
        Ok(obj.storage.ptr)
    }

    fn munmap(&self, _ptr: NonNull<u8>, _size: u64) {
        let _state = self.lock();
    }

    fn set_domain(&self, handle: u32, _read_domains: u32, _write_domain: u32) -> io::Result<()> {
        self.wait_idle(handle, None)
    }

    fn pwrite(&self, handle: u32, offset: u64, data: &[u8]) -> io::Result<()> {
        let mut state = self.lock();
        let obj = state.object_mut(self.file, handle)?;
        let (offset, _) = Self::check_range(obj, offset, data.len())?;
        obj.storage.write(offset, data);
        Ok(())
    }

    fn pread(&self, handle: u32, offset: u64, data: &mut [u8]) -> io::Result<()> {
        let state = self.lock();
        let obj = state.object(self.file, handle)?;
        let (offset, _) = Self::check_range(obj, offset, data.len())?;
        obj.storage.read(offset, data);
        Ok(())
    }

    fn wait(&self, handle: u32, timeout_ns: i64) -> io::Result<()> {
        let deadline = u64::try_from(timeout_ns)
            .ok()
            .map(|ns| Instant::now() + Duration::from_nanos(ns));
        self.wait_idle(handle, deadline)
    }

    fn busy(&self, handle: u32) -> io::Result<bool> {
        let state = self.lock();
        let obj = state.object(self.file, handle)?;
        Ok(state.is_busy(obj))
    }

    fn context_create(&self) -> io::Result<u32> {
        let mut state = self.lock();
        if self.config().fail_context_create {
            return Err(errno(libc::ENODEV));
        }
        state.next_ctx += 1;
        let ctx_id = state.next_ctx;
        state.contexts.insert(
            ctx_id,
            SimContext {
                file: self.file,
                stats: ContextResetStats::default(),
            },
        );
        Ok(ctx_id)
    }

    fn context_destroy(&self, ctx_id: u32) {
        let mut state = self.lock();
        let owned = state
            .contexts
            .get(&ctx_id)
            .is_some_and(|ctx| ctx.file == self.file);
        if owned {
            state.contexts.remove(&ctx_id);
        }
    }

    fn reset_stats(&self, ctx_id: u32) -> io::Result<ContextResetStats> {
        let state = self.lock();
        state
            .contexts
            .get(&ctx_id)
            .filter(|ctx| ctx.file == self.file)
            .map(|ctx| ctx.stats)
            .ok_or_else(|| errno(libc::ENOENT))
    }

    fn execbuffer(&self, exec: &mut ExecBuffer) -> io::Result<()> {
        let auto_retire = self.config().auto_retire;
        let aperture_total = self.config().aperture.total;
        let mut state = self.lock();

        let ring = exec.flags & I915_EXEC_RING_MASK;
        if ring > I915_EXEC_VEBOX || exec.objects.is_empty() {
            return Err(errno(libc::EINVAL));
        }
        if exec.ctx_id != 0 {
            if !state.contexts.contains_key(&exec.ctx_id) {
                return Err(errno(libc::ENOENT));
            }
            if ring != I915_EXEC_RENDER && ring != I915_EXEC_DEFAULT {
                return Err(errno(libc::EINVAL));
            }
        }

        // Resolve handles to objects, in submission order.
        let mut ids = Vec::with_capacity(exec.objects.len());
        for obj in &exec.objects {
            let id = state.lookup(self.file, obj.handle)?;
            if ids.contains(&id) {
                return Err(errno(libc::EINVAL));
            }
            ids.push(id);
        }

        let working_set: u64 = ids
            .iter()
            .filter_map(|id| state.objects.get(id))
            .map(|o| o.size)
            .sum();
        if working_set > aperture_total {
            return Err(errno(libc::ENOSPC));
        }

        let batch_size = ids
            .last()
            .and_then(|id| state.objects.get(id))
            .map_or(0, |o| o.size);
        if u64::from(exec.batch_len) > batch_size {
            return Err(errno(libc::EINVAL));
        }

        // Bind anything not yet in the GTT.
        let mut offsets = HashMap::with_capacity(exec.objects.len());
        for (obj, &id) in exec.objects.iter().zip(&ids) {
            let size = state.objects.get(&id).map_or(0, |o| o.size);
            let bound = state.objects.get(&id).and_then(|o| o.gtt_offset);
            let offset = match bound {
                Some(offset) => offset,
                None => {
                    let offset = state
                        .gtt
                        .allocate(size, PAGE_SIZE)
                        .ok_or_else(|| errno(libc::ENOSPC))?;
                    if let Some(o) = state.objects.get_mut(&id) {
                        o.gtt_offset = Some(offset);
                    }
                    offset
                }
            };
            offsets.insert(obj.handle, offset);
        }

        // Patch relocations in recording order.
        for (obj, &id) in exec.objects.iter().zip(&ids) {
            for reloc in &obj.relocs {
                let target = *offsets
                    .get(&reloc.target_handle)
                    .ok_or_else(|| errno(libc::ENOENT))?;
                let value = target + u64::from(reloc.delta);

                let owner = state.objects.get_mut(&id).ok_or_else(|| errno(libc::ENOENT))?;
                let (at, _) = Self::check_range(owner, reloc.offset, 8)?;
                owner.storage.write(at, &value.to_le_bytes());
            }
        }

        state.seqno += 1;
        let seqno = state.seqno;
        for id in &ids {
            if let Some(o) = state.objects.get_mut(id) {
                o.last_seqno = seqno;
            }
        }
        if auto_retire {
            state.retired = seqno;
        }

        for obj in &mut exec.objects {
            obj.offset = offsets.get(&obj.handle).copied().unwrap_or(0);
        }

        state.submissions.push(SubmissionRecord {
            ring,
            flags: exec.flags,
            ctx_id: exec.ctx_id,
            batch_len: exec.batch_len,
            handles: exec.objects.iter().map(|o| o.handle).collect(),
        });
        drop(state);

        if auto_retire {
            self.kernel.shared.idle.notify_all();
        }
        Ok(())
    }
}
