#![allow(clippy::used_underscore_items, clippy::cast_possible_truncation)]

const _IOC_NRBITS: u32 = 8;
const _IOC_TYPEBITS: u32 = 8;
const _IOC_SIZEBITS: u32 = 14;

const _IOC_NRSHIFT: u32 = 0;
const _IOC_TYPESHIFT: u32 = _IOC_NRSHIFT + _IOC_NRBITS;
const _IOC_SIZESHIFT: u32 = _IOC_TYPESHIFT + _IOC_TYPEBITS;
const _IOC_DIRSHIFT: u32 = _IOC_SIZESHIFT + _IOC_SIZEBITS;

const _IOC_WRITE: u32 = 1;
const _IOC_READ: u32 = 2;

/// `'d'`, the DRM ioctl type.
pub const DRM_IOCTL_BASE: u32 = 0x64;
/// First driver-private command number.
pub const DRM_COMMAND_BASE: u32 = 0x40;

pub const PAGE_SIZE: u64 = 4096;

#[must_use]
pub const fn _ioc(dir: u32, type_: u32, nr: u32, size: usize) -> u32 {
    (dir << _IOC_DIRSHIFT)
        | (type_ << _IOC_TYPESHIFT)
        | (nr << _IOC_NRSHIFT)
        | ((size as u32) << _IOC_SIZESHIFT)
}

#[must_use]
pub const fn ior<T>(type_: u32, nr: u32) -> u32 {
    _ioc(_IOC_READ, type_, nr, std::mem::size_of::<T>())
}

#[must_use]
pub const fn iow<T>(type_: u32, nr: u32) -> u32 {
    _ioc(_IOC_WRITE, type_, nr, std::mem::size_of::<T>())
}

#[must_use]
pub const fn iowr<T>(type_: u32, nr: u32) -> u32 {
    _ioc(_IOC_READ | _IOC_WRITE, type_, nr, std::mem::size_of::<T>())
}

/// Core DRM request (`DRM_IOWR`).
#[must_use]
pub const fn drm_iowr<T>(nr: u32) -> u32 {
    iowr::<T>(DRM_IOCTL_BASE, nr)
}

/// Core DRM request (`DRM_IOW`).
#[must_use]
pub const fn drm_iow<T>(nr: u32) -> u32 {
    iow::<T>(DRM_IOCTL_BASE, nr)
}

/// Driver-private request, `nr` relative to `DRM_COMMAND_BASE`.
#[must_use]
pub const fn driver_iowr<T>(nr: u32) -> u32 {
    iowr::<T>(DRM_IOCTL_BASE, DRM_COMMAND_BASE + nr)
}

#[must_use]
pub const fn driver_iow<T>(nr: u32) -> u32 {
    iow::<T>(DRM_IOCTL_BASE, DRM_COMMAND_BASE + nr)
}

#[must_use]
pub const fn driver_ior<T>(nr: u32) -> u32 {
    ior::<T>(DRM_IOCTL_BASE, DRM_COMMAND_BASE + nr)
}

/// Rounds `val` up to a power-of-two `align`, or `None` if that overflows.
#[must_use]
pub const fn align_up(val: u64, align: u64) -> Option<u64> {
    match val.checked_add(align - 1) {
        Some(v) => Some(v & !(align - 1)),
        None => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[repr(C)]
    struct Args16 {
        a: u64,
        b: u64,
    }

    #[test]
    fn test_getparam_request_code() {
        // DRM_IOCTL_I915_GETPARAM on x86_64
        assert_eq!(driver_iowr::<Args16>(0x06), 0xC010_6446);
    }

    #[test]
    fn test_gem_close_request_code() {
        #[repr(C)]
        struct Close {
            handle: u32,
            pad: u32,
        }
        assert_eq!(drm_iow::<Close>(0x09), 0x4008_6409);
    }

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(1, PAGE_SIZE), Some(4096));
        assert_eq!(align_up(4096, PAGE_SIZE), Some(4096));
        assert_eq!(align_up(4097, PAGE_SIZE), Some(8192));
        assert_eq!(align_up(0, PAGE_SIZE), Some(0));
    }

    #[test]
    fn test_align_up_overflow() {
        assert_eq!(align_up(u64::MAX, PAGE_SIZE), None);
        assert_eq!(align_up(u64::MAX - 4094, PAGE_SIZE), None);
        assert_eq!(align_up(u64::MAX - 7, 8), Some(u64::MAX - 7));
    }
}
