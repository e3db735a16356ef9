use crate::drm::ioctl::{
    I915_BIT_6_SWIZZLE_9, I915_BIT_6_SWIZZLE_9_10, I915_BIT_6_SWIZZLE_9_10_11,
    I915_BIT_6_SWIZZLE_9_10_17, I915_BIT_6_SWIZZLE_9_11, I915_BIT_6_SWIZZLE_9_17,
    I915_BIT_6_SWIZZLE_NONE, I915_TILING_NONE, I915_TILING_X, I915_TILING_Y,
};
use crate::error::{WinsysError, WinsysResult};
use crate::winsys::bo::{BoKind, BufferObject};
use crate::winsys::lock;

/// Memory layout of a buffer.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Tiling {
    #[default]
    None = I915_TILING_NONE,
    /// 512-byte x 8-row tiles.
    X = I915_TILING_X,
    /// 128-byte x 32-row tiles.
    Y = I915_TILING_Y,
}

impl Tiling {
    /// Required pitch alignment in bytes.
    #[must_use]
    pub const fn pitch_alignment(self) -> u64 {
        match self {
            Self::None => 1,
            Self::X => 512,
            Self::Y => 128,
        }
    }

    /// Decodes a kernel tiling mode. Unknown modes yield `None`.
    #[must_use]
    pub const fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            I915_TILING_NONE => Some(Self::None),
            I915_TILING_X => Some(Self::X),
            I915_TILING_Y => Some(Self::Y),
            _ => None,
        }
    }

    #[must_use]
    pub const fn raw(self) -> u32 {
        self as u32
    }

    /// Checks `pitch` against this mode's alignment rule.
    ///
    /// # Errors
    /// `InvalidPitch` when the pitch is not a multiple of the tile width.
    pub fn validate_pitch(self, pitch: u64) -> WinsysResult<()> {
        if pitch % self.pitch_alignment() != 0 {
            return Err(WinsysError::InvalidPitch {
                tiling: self,
                pitch,
            });
        }
        Ok(())
    }
}

/// Address bits the memory controller folds into bit 6 for tiled surfaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Swizzle {
    #[default]
    None,
    Bit9,
    Bit9_10,
    Bit9_11,
    Bit9_10_11,
    Bit9_17,
    Bit9_10_17,
    Unknown,
}

impl Swizzle {
    #[must_use]
    pub const fn from_raw(raw: u32) -> Self {
        match raw {
            I915_BIT_6_SWIZZLE_NONE => Self::None,
            I915_BIT_6_SWIZZLE_9 => Self::Bit9,
            I915_BIT_6_SWIZZLE_9_10 => Self::Bit9_10,
            I915_BIT_6_SWIZZLE_9_11 => Self::Bit9_11,
            I915_BIT_6_SWIZZLE_9_10_11 => Self::Bit9_10_11,
            I915_BIT_6_SWIZZLE_9_17 => Self::Bit9_17,
            I915_BIT_6_SWIZZLE_9_10_17 => Self::Bit9_10_17,
            _ => Self::Unknown,
        }
    }

    #[must_use]
    pub const fn is_swizzled(self) -> bool {
        !matches!(self, Self::None)
    }
}

impl BufferObject {
    /// Applies `tiling` with row `pitch` to the buffer.
    ///
    /// The pitch is validated before the kernel is asked. The kernel's answer
    /// is compared with the request and a silent downgrade is reported.
    ///
    /// # Errors
    /// `InvalidPitch` for a misaligned or oversized pitch, `UnsupportedHandle`
    /// for user-pointer buffers asked to tile, `Io` when the kernel rejects the
    /// request and `TilingMismatch` when it applies a different mode.
    pub fn set_tiling(&self, tiling: Tiling, pitch: u64) -> WinsysResult<()> {
        tiling.validate_pitch(pitch)?;
        let stride = u32::try_from(pitch).map_err(|_| WinsysError::InvalidPitch { tiling, pitch })?;

        if self.0.kind == BoKind::Userptr && tiling != Tiling::None {
            return Err(WinsysError::UnsupportedHandle("user pointer buffers are always linear"));
        }

        let state = self
            .0
            .bufmgr
            .driver()
            .set_tiling(self.0.handle, tiling.raw(), stride)?;

        let applied = Tiling::from_raw(state.tiling_mode).unwrap_or_default();
        if applied != tiling {
            log::error!(
                "bo '{}': requested {tiling:?} tiling, kernel applied {applied:?}",
                self.0.name
            );
            return Err(WinsysError::TilingMismatch {
                requested: tiling,
                applied,
            });
        }

        let mut bo_state = lock(&self.0.state);
        bo_state.tiling = applied;
        bo_state.swizzle = Swizzle::from_raw(state.swizzle_mode);
        bo_state.pitch = if applied == Tiling::None { 0 } else { pitch };
        Ok(())
    }

    /// Re-reads tiling and swizzling from the kernel and caches them.
    pub(crate) fn refresh_tiling(&self) -> WinsysResult<(Tiling, Swizzle)> {
        let state = self.0.bufmgr.driver().get_tiling(self.0.handle)?;
        let tiling = Tiling::from_raw(state.tiling_mode).ok_or_else(|| {
            WinsysError::Import(format!(
                "kernel reports unknown tiling mode {} for '{}'",
                state.tiling_mode, self.0.name
            ))
        })?;
        let swizzle = Swizzle::from_raw(state.swizzle_mode);

        let mut bo_state = lock(&self.0.state);
        bo_state.tiling = tiling;
        bo_state.swizzle = swizzle;
        Ok((tiling, swizzle))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drm::sim::{SimConfig, SimKernel};
    use crate::winsys::test_support::winsys_on;

    #[test]
    fn test_pitch_alignment_rules() {
        assert!(Tiling::X.validate_pitch(1024).is_ok());
        assert!(Tiling::X.validate_pitch(640).is_err());
        assert!(Tiling::Y.validate_pitch(384).is_ok());
        assert!(Tiling::Y.validate_pitch(200).is_err());
        assert!(Tiling::None.validate_pitch(7).is_ok());
    }

    #[test]
    fn test_raw_values_round_trip() {
        for tiling in [Tiling::None, Tiling::X, Tiling::Y] {
            assert_eq!(Tiling::from_raw(tiling.raw()), Some(tiling));
        }
        assert_eq!(Tiling::from_raw(9), None);
        assert_eq!(Swizzle::from_raw(42), Swizzle::Unknown);
    }

    #[test]
    fn test_set_tiling_updates_state() {
        let kernel = SimKernel::new(SimConfig::default().with_swizzle(I915_BIT_6_SWIZZLE_9_10));
        let ws = winsys_on(&kernel);
        let bo = ws.alloc_bo("surface", 64 * 1024, false).unwrap();

        bo.set_tiling(Tiling::Y, 256).unwrap();
        assert_eq!(bo.tiling(), Tiling::Y);
        assert_eq!(bo.pitch(), 256);
        assert_eq!(bo.swizzle(), Swizzle::Bit9_10);

        bo.set_tiling(Tiling::None, 0).unwrap();
        assert_eq!(bo.tiling(), Tiling::None);
        assert_eq!(bo.swizzle(), Swizzle::None);
    }

    #[test]
    fn test_downgrade_is_an_error() {
        let kernel = SimKernel::new(SimConfig::default().downgrade_tiling());
        let ws = winsys_on(&kernel);
        let bo = ws.alloc_bo("surface", 8192, false).unwrap();

        let err = bo.set_tiling(Tiling::X, 512).unwrap_err();
        assert!(matches!(
            err,
            WinsysError::TilingMismatch {
                requested: Tiling::X,
                applied: Tiling::None
            }
        ));
        assert_eq!(bo.tiling(), Tiling::None);
    }
}
