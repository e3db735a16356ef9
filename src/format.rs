//! Pixel format metadata, used only to size buffer transfers.

/// Pixel formats the engine moves between buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Format {
    R8Unorm,
    R8Uint,
    R8G8Unorm,
    R5G6B5Unorm,
    R8G8B8Unorm,
    R8G8B8A8Unorm,
    R8G8B8A8Srgb,
    B8G8R8A8Unorm,
    R10G10B10A2Unorm,
    R16Float,
    R16G16Float,
    R16G16B16Float,
    R16G16B16A16Float,
    R32Uint,
    R32Float,
    R32G32Float,
    R32G32B32Float,
    R32G32B32A32Float,
    S8Uint,
    D16Unorm,
    D24Unorm,
    D32Float,
    D16UnormS8Uint,
    D24UnormS8Uint,
    D32FloatS8Uint,
    Bc1RgbUnorm,
    Bc2Unorm,
    Bc3Unorm,
    Bc4Unorm,
    Bc5Unorm,
}

/// Compatibility class: formats in one class share a texel (or block) size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FormatClass {
    Bits8,
    Bits16,
    Bits24,
    Bits32,
    Bits48,
    Bits64,
    Bits96,
    Bits128,
    Block64,
    Block128,
    S8,
    D16,
    D24,
    D32,
    D16S8,
    D24S8,
    D32S8,
}

impl Format {
    /// `(bytes per texel or block, channels)`.
    const fn info(self) -> (usize, u32) {
        match self {
            Self::R8Unorm | Self::R8Uint | Self::S8Uint => (1, 1),
            Self::R8G8Unorm => (2, 2),
            Self::R5G6B5Unorm => (2, 3),
            Self::R16Float | Self::D16Unorm => (2, 1),
            Self::R8G8B8Unorm => (3, 3),
            Self::D24Unorm => (3, 1),
            Self::D16UnormS8Uint => (3, 2),
            Self::R8G8B8A8Unorm
            | Self::R8G8B8A8Srgb
            | Self::B8G8R8A8Unorm
            | Self::R10G10B10A2Unorm => (4, 4),
            Self::R16G16Float => (4, 2),
            Self::R32Uint | Self::R32Float | Self::D32Float => (4, 1),
            Self::D24UnormS8Uint => (4, 2),
            Self::D32FloatS8Uint => (5, 2),
            Self::R16G16B16Float => (6, 3),
            Self::R16G16B16A16Float => (8, 4),
            Self::R32G32Float => (8, 2),
            Self::R32G32B32Float => (12, 3),
            Self::R32G32B32A32Float => (16, 4),
            Self::Bc1RgbUnorm => (8, 3),
            Self::Bc4Unorm => (8, 1),
            Self::Bc2Unorm | Self::Bc3Unorm => (16, 4),
            Self::Bc5Unorm => (16, 2),
        }
    }

    /// Bytes per texel, or per 4x4 block for compressed formats.
    #[must_use]
    pub const fn byte_size(self) -> usize {
        self.info().0
    }

    #[must_use]
    pub const fn channel_count(self) -> u32 {
        self.info().1
    }

    #[must_use]
    pub const fn is_compressed(self) -> bool {
        matches!(
            self,
            Self::Bc1RgbUnorm | Self::Bc2Unorm | Self::Bc3Unorm | Self::Bc4Unorm | Self::Bc5Unorm
        )
    }

    #[must_use]
    pub const fn is_depth_stencil(self) -> bool {
        matches!(
            self,
            Self::S8Uint
                | Self::D16Unorm
                | Self::D24Unorm
                | Self::D32Float
                | Self::D16UnormS8Uint
                | Self::D24UnormS8Uint
                | Self::D32FloatS8Uint
        )
    }

    #[must_use]
    pub const fn class(self) -> FormatClass {
        if self.is_compressed() {
            return if self.byte_size() == 8 {
                FormatClass::Block64
            } else {
                FormatClass::Block128
            };
        }

        match self {
            Self::S8Uint => FormatClass::S8,
            Self::D16Unorm => FormatClass::D16,
            Self::D24Unorm => FormatClass::D24,
            Self::D32Float => FormatClass::D32,
            Self::D16UnormS8Uint => FormatClass::D16S8,
            Self::D24UnormS8Uint => FormatClass::D24S8,
            Self::D32FloatS8Uint => FormatClass::D32S8,
            _ => match self.byte_size() {
                1 => FormatClass::Bits8,
                2 => FormatClass::Bits16,
                3 => FormatClass::Bits24,
                4 => FormatClass::Bits32,
                6 => FormatClass::Bits48,
                8 => FormatClass::Bits64,
                12 => FormatClass::Bits96,
                _ => FormatClass::Bits128,
            },
        }
    }

    /// Bytes occupied by `count` texels (blocks, when compressed).
    #[must_use]
    pub const fn transfer_size(self, count: usize) -> usize {
        self.byte_size() * count
    }
}
