#![allow(clippy::cast_possible_truncation)]

use crate::drm::MapKind;
use crate::drm::ioctl::{I915_GEM_DOMAIN_CPU, I915_GEM_DOMAIN_GTT};
use crate::error::{WinsysError, WinsysResult};
use crate::format::Format;
use crate::winsys::bo::{BufferObject, Mapping};
use crate::winsys::lock;
use std::ptr::NonNull;

impl BufferObject {
    /// Maps the buffer for CPU access, waiting for the GPU to finish with it.
    ///
    /// # Errors
    /// `Io` when the kernel cannot map the object or move it to the CPU domain.
    pub fn map(&self, write_enable: bool) -> WinsysResult<NonNull<u8>> {
        let ptr = self.map_kind(MapKind::Cpu)?;
        let write = if write_enable { I915_GEM_DOMAIN_CPU } else { 0 };
        self.bufmgr()
            .driver()
            .set_domain(self.handle(), I915_GEM_DOMAIN_CPU, write)?;
        Ok(ptr)
    }

    /// Maps the buffer without synchronizing with the GPU.
    ///
    /// Only valid when the caller knows the GPU is not touching the range it
    /// accesses.
    ///
    /// # Errors
    /// `Io` when the kernel cannot map the object.
    pub fn map_async(&self) -> WinsysResult<NonNull<u8>> {
        self.map_kind(MapKind::Cpu)
    }

    /// Maps through the GTT, where tiled layouts are detiled by the fence hardware.
    ///
    /// # Errors
    /// `Io` when the kernel cannot map the object or move it to the GTT domain.
    pub fn map_gtt(&self) -> WinsysResult<NonNull<u8>> {
        let ptr = self.map_kind(MapKind::Gtt)?;
        self.bufmgr().driver().set_domain(
            self.handle(),
            I915_GEM_DOMAIN_GTT,
            I915_GEM_DOMAIN_GTT,
        )?;
        Ok(ptr)
    }

    /// GTT mapping without synchronization.
    ///
    /// # Errors
    /// `Io` when the kernel cannot map the object.
    pub fn map_gtt_async(&self) -> WinsysResult<NonNull<u8>> {
        self.map_kind(MapKind::Gtt)
    }

    fn map_kind(&self, kind: MapKind) -> WinsysResult<NonNull<u8>> {
        let driver = self.bufmgr().driver();
        let mut state = lock(&self.0.state);

        if let Some(mapping) = state.mapping.take() {
            if mapping.kind == kind {
                let ptr = mapping.ptr;
                state.mapping = Some(mapping);
                return Ok(ptr);
            }
            driver.munmap(mapping.ptr, self.size());
        }

        let ptr = driver.mmap(self.handle(), self.size(), kind)?;
        state.mapping = Some(Mapping { ptr, kind });
        log::debug!("bo '{}': mapped {kind:?} at {ptr:p}", self.name());
        Ok(ptr)
    }

    /// # Errors
    /// `NotMapped` when there is no mapping to drop.
    pub fn unmap(&self) -> WinsysResult<()> {
        let mapping = lock(&self.0.state)
            .mapping
            .take()
            .ok_or_else(|| WinsysError::NotMapped(self.name().to_string()))?;
        self.bufmgr().driver().munmap(mapping.ptr, self.size());
        Ok(())
    }

    /// Current CPU mapping, if any.
    #[must_use]
    pub fn mapped_ptr(&self) -> Option<NonNull<u8>> {
        lock(&self.0.state).mapping.as_ref().map(|m| m.ptr)
    }

    fn check_range(&self, offset: u64, len: usize) -> WinsysResult<()> {
        let len = len as u64;
        if offset.checked_add(len).is_none_or(|end| end > self.size()) {
            return Err(WinsysError::OutOfBounds {
                offset,
                len,
                size: self.size(),
            });
        }
        Ok(())
    }

    /// Copies `data` into the buffer at `offset` without mapping it.
    ///
    /// # Errors
    /// `OutOfBounds` when the range leaves the buffer, `Io` on kernel failure.
    pub fn write_range(&self, offset: u64, data: &[u8]) -> WinsysResult<()> {
        self.check_range(offset, data.len())?;
        self.bufmgr().driver().pwrite(self.handle(), offset, data)?;
        Ok(())
    }

    /// Copies `out.len()` bytes at `offset` out of the buffer.
    ///
    /// # Errors
    /// `OutOfBounds` when the range leaves the buffer, `Io` on kernel failure.
    pub fn read_range(&self, offset: u64, out: &mut [u8]) -> WinsysResult<()> {
        self.check_range(offset, out.len())?;
        self.bufmgr().driver().pread(self.handle(), offset, out)?;
        Ok(())
    }

    /// Writes `count` texels (blocks, for compressed formats) of `format`
    /// taken from the front of `data`.
    ///
    /// # Errors
    /// `OutOfBounds` when `data` is short or the range leaves the buffer.
    pub fn write_texels(
        &self,
        offset: u64,
        format: Format,
        count: usize,
        data: &[u8],
    ) -> WinsysResult<()> {
        let len = format.transfer_size(count);
        let src = data.get(..len).ok_or(WinsysError::OutOfBounds {
            offset: 0,
            len: len as u64,
            size: data.len() as u64,
        })?;
        self.write_range(offset, src)
    }

    /// Reads `count` texels (blocks, for compressed formats) of `format`.
    ///
    /// # Errors
    /// `OutOfBounds` when the range leaves the buffer.
    pub fn read_texels(&self, offset: u64, format: Format, count: usize) -> WinsysResult<Vec<u8>> {
        let mut out = vec![0; format.transfer_size(count)];
        self.read_range(offset, &mut out)?;
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drm::sim::{SimConfig, SimKernel};
    use crate::winsys::test_support::winsys_on;

    #[test]
    fn test_mapping_is_shared_with_range_io() {
        let kernel = SimKernel::new(SimConfig::default());
        let ws = winsys_on(&kernel);
        let bo = ws.alloc_bo("upload", 4096, true).unwrap();

        let ptr = bo.map(true).unwrap();
        unsafe { ptr.as_ptr().add(10).write(0xAB) };
        assert_eq!(bo.mapped_ptr(), Some(ptr));

        let mut byte = [0u8; 1];
        bo.read_range(10, &mut byte).unwrap();
        assert_eq!(byte[0], 0xAB);

        bo.unmap().unwrap();
        assert!(bo.mapped_ptr().is_none());
        assert!(matches!(bo.unmap(), Err(WinsysError::NotMapped(_))));
    }

    #[test]
    fn test_switching_map_kind_replaces_mapping() {
        let kernel = SimKernel::new(SimConfig::default());
        let ws = winsys_on(&kernel);
        let bo = ws.alloc_bo("surface", 4096, false).unwrap();

        bo.map_async().unwrap();
        bo.map_gtt_async().unwrap();
        bo.map_gtt().unwrap();
        bo.unmap().unwrap();
        assert!(bo.mapped_ptr().is_none());
    }

    #[test]
    fn test_range_bounds() {
        let kernel = SimKernel::new(SimConfig::default());
        let ws = winsys_on(&kernel);
        let bo = ws.alloc_bo("small", 4096, true).unwrap();

        let before = kernel.ioctl_count();
        let err = bo.write_range(4000, &[0; 100]).unwrap_err();
        assert!(matches!(
            err,
            WinsysError::OutOfBounds {
                offset: 4000,
                len: 100,
                size: 4096
            }
        ));
        assert_eq!(kernel.ioctl_count(), before);
        assert!(bo.write_range(3996, &[0; 100]).is_ok());
        assert!(bo.write_range(u64::MAX, &[0; 1]).is_err());
    }

    #[test]
    fn test_texel_transfer_sizes() {
        let kernel = SimKernel::new(SimConfig::default());
        let ws = winsys_on(&kernel);
        let bo = ws.alloc_bo("texels", 4096, true).unwrap();

        let rgba: Vec<u8> = (0u8..32).collect();
        bo.write_texels(64, Format::R8G8B8A8Unorm, 8, &rgba).unwrap();
        assert_eq!(bo.read_texels(64, Format::R8G8B8A8Unorm, 8).unwrap(), rgba);

        let err = bo.write_texels(0, Format::R32G32B32A32Float, 4, &rgba).unwrap_err();
        assert!(matches!(err, WinsysError::OutOfBounds { len: 64, size: 32, .. }));
    }
}
