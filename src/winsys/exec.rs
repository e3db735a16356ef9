#![allow(clippy::cast_possible_truncation)]

use crate::drm::ioctl::{
    EXEC_OBJECT_NEEDS_FENCE, I915_EXEC_BLT, I915_EXEC_BSD, I915_EXEC_GEN7_SOL_RESET,
    I915_EXEC_IS_PINNED, I915_EXEC_NO_RELOC, I915_EXEC_RENDER, I915_EXEC_SECURE, I915_EXEC_VEBOX,
};
use crate::drm::{ExecBuffer, ExecObject};
use crate::error::{WinsysError, WinsysResult};
use crate::utils::align_up;
use crate::winsys::WinSys;
use crate::winsys::bo::{BoInner, BufferObject};
use crate::winsys::reloc::Relocation;
use bitflags::bitflags;
use std::collections::HashSet;
use std::sync::Arc;

/// Hardware command ring.
#[repr(u64)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Ring {
    /// 3D and media; the only ring with logical contexts.
    Render = I915_EXEC_RENDER,
    Bsd = I915_EXEC_BSD,
    Blt = I915_EXEC_BLT,
    Vebox = I915_EXEC_VEBOX,
}

bitflags! {
    /// Submission flags OR'd on top of the ring selector.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ExecFlags: u64 {
        /// Reset the stream-output write offsets (gen7).
        const GEN7_SOL_RESET = I915_EXEC_GEN7_SOL_RESET;
        const SECURE         = I915_EXEC_SECURE;
        const IS_PINNED      = I915_EXEC_IS_PINNED;
        const NO_RELOC       = I915_EXEC_NO_RELOC;
    }
}

/// Merges a ring selector and submission flags into one execbuffer flags word.
#[must_use]
pub const fn exec_flags(ring: Ring, flags: ExecFlags) -> u64 {
    ring as u64 | flags.bits()
}

/// Buffers reachable from a set of roots, each once, targets before referrers.
///
/// Buffers are identified by object, not by kernel handle: handles are only
/// unique within one open device.
#[derive(Debug, Default)]
struct WorkingSet {
    seen: HashSet<*const BoInner>,
    fenced: HashSet<*const BoInner>,
    order: Vec<(BufferObject, ExecObject)>,
}

/// A buffer whose relocations are still being walked.
struct Frame {
    bo: BufferObject,
    relocs: Vec<Relocation>,
    next: usize,
}

impl Frame {
    fn new(bo: BufferObject) -> Self {
        let relocs = bo.relocations();
        Self { bo, relocs, next: 0 }
    }
}

impl WorkingSet {
    fn from_roots<'a>(roots: impl IntoIterator<Item = &'a BufferObject>) -> Self {
        let mut set = Self::default();
        for bo in roots {
            set.visit(bo);
        }
        for (bo, obj) in &mut set.order {
            if set.fenced.contains(&Arc::as_ptr(&bo.0)) {
                obj.flags |= EXEC_OBJECT_NEEDS_FENCE;
            }
        }
        set
    }

    /// Post-order walk from `root` with an explicit stack.
    fn visit(&mut self, root: &BufferObject) {
        if !self.seen.insert(Arc::as_ptr(&root.0)) {
            return;
        }
        let mut stack = vec![Frame::new(root.clone())];

        while let Some(frame) = stack.last_mut() {
            let Some(reloc) = frame.relocs.get(frame.next).cloned() else {
                let Some(done) = stack.pop() else { break };
                let obj = ExecObject {
                    handle: done.bo.handle(),
                    relocs: done.relocs.iter().map(|reloc| reloc.entry).collect(),
                    offset: done.bo.presumed_offset(),
                    flags: 0,
                };
                self.order.push((done.bo, obj));
                continue;
            };
            frame.next += 1;

            let target = reloc.target_of(&frame.bo);
            let key = Arc::as_ptr(&target.0);
            if reloc.needs_fence {
                self.fenced.insert(key);
            }
            if self.seen.insert(key) {
                stack.push(Frame::new(target));
            }
        }
    }

    fn total_size(&self) -> u64 {
        self.order.iter().map(|(bo, _)| bo.size()).sum()
    }

    fn fenced_size(&self) -> u64 {
        self.order
            .iter()
            .filter(|(bo, _)| self.fenced.contains(&Arc::as_ptr(&bo.0)))
            .map(|(bo, _)| bo.size())
            .sum()
    }
}

impl WinSys {
    /// Whether `bos` and everything they reference can be resident at once.
    ///
    /// The kernel does not check this before accepting a batch, so it must
    /// hold before `submit`.
    #[must_use]
    pub fn can_submit(&self, bos: &[&BufferObject]) -> bool {
        let set = WorkingSet::from_roots(bos.iter().copied());
        let total = set.total_size();
        let fenced = set.fenced_size();
        let info = self.info();

        let fits = total <= info.aperture_total && fenced <= info.aperture_mappable;
        if !fits {
            log::debug!(
                "working set of {} buffers does not fit: {total} bytes ({fenced} fenced), aperture {} ({} mappable)",
                set.order.len(),
                info.aperture_total,
                info.aperture_mappable
            );
        }
        fits
    }

    /// Executes the first `used` bytes of `batch` on `ring`.
    ///
    /// Only the render ring runs in the logical context. On success every
    /// buffer of the working set carries the GPU address it executed at.
    ///
    /// # Errors
    /// `Submit` with the kernel's errno when the batch is rejected.
    pub fn submit(
        &self,
        ring: Ring,
        batch: &BufferObject,
        used: usize,
        flags: ExecFlags,
    ) -> WinsysResult<()> {
        let batch_len = u64::try_from(used)
            .ok()
            .and_then(|used| align_up(used, 8))
            .and_then(|len| u32::try_from(len).ok())
            .ok_or_else(|| WinsysError::Submit(std::io::Error::from_raw_os_error(libc::EINVAL)))?;

        let set = WorkingSet::from_roots([batch]);
        let (bos, objects): (Vec<_>, Vec<_>) = set.order.into_iter().unzip();

        let ctx_id = match ring {
            Ring::Render => self.context.as_ref().map_or(0, |ctx| ctx.id()),
            _ => 0,
        };
        let mut exec = ExecBuffer {
            objects,
            batch_len,
            flags: exec_flags(ring, flags),
            ctx_id,
        };

        self.bufmgr
            .driver()
            .execbuffer(&mut exec)
            .map_err(WinsysError::Submit)?;

        for (bo, obj) in bos.iter().zip(&exec.objects) {
            bo.set_presumed_offset(obj.offset);
        }
        log::debug!(
            "submitted '{}' ({batch_len} bytes, {} buffers) on {ring:?}",
            batch.name(),
            bos.len()
        );

        if self.config.debug_batches {
            self.decode_bo(batch, used);
        }
        Ok(())
    }
}
