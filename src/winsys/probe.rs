#![allow(clippy::cast_sign_loss)]

use crate::config::WinsysConfig;
use crate::drm::KernelDriver;
use crate::drm::ioctl::{
    I915_PARAM_CHIPSET_ID, I915_PARAM_HAS_ALIASING_PPGTT, I915_PARAM_HAS_GEN7_SOL_RESET,
    I915_PARAM_HAS_LLC, I915_PARAM_HAS_RELAXED_DELTA,
};
use crate::error::{WinsysError, WinsysResult};
use crate::winsys::bufmgr::BufMgr;
use crate::winsys::context::HwContext;
use crate::winsys::tiling::Tiling;
use std::sync::Arc;

/// Render engine TIMESTAMP register.
pub const TIMESTAMP_REG: u64 = 0x2358;

/// Capabilities of the device, captured once when the `WinSys` is created.
#[allow(clippy::struct_excessive_bools)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DeviceInfo {
    /// PCI device id.
    pub devid: u32,
    pub aperture_mappable: u64,
    pub aperture_total: u64,
    pub has_llc: bool,
    pub has_address_swizzling: bool,
    pub has_logical_context: bool,
    pub has_ppgtt: bool,
    pub has_timestamp: bool,
    pub has_gen7_sol_reset: bool,
}

/// A capability parameter, or `None` if the kernel does not know it.
fn get_param(driver: &dyn KernelDriver, param: i32) -> Option<i32> {
    driver.get_param(param).ok()
}

fn has_param(driver: &dyn KernelDriver, param: i32) -> bool {
    get_param(driver, param).is_some_and(|v| v > 0)
}

/// Whether the memory controller swizzles tiled addresses, found by tiling a
/// scratch buffer and asking the kernel. Any failure reads as "no".
fn test_address_swizzling(bufmgr: &Arc<BufMgr>) -> bool {
    // 64x64 texels at 4 bytes, X-tiled: pitch rounds up to one tile row.
    const PITCH: u64 = 512;
    const HEIGHT: u64 = 64;

    let Ok(bo) = bufmgr.alloc("address swizzling test", PITCH * HEIGHT, false) else {
        return false;
    };
    if bo.set_tiling(Tiling::X, PITCH).is_err() {
        return false;
    }
    bo.refresh_tiling()
        .is_ok_and(|(_, swizzle)| swizzle.is_swizzled())
}

/// Queries every capability in a fixed order.
///
/// Returns the snapshot and, when supported, the logical context.
pub(crate) fn probe(
    bufmgr: &Arc<BufMgr>,
    config: &WinsysConfig,
) -> WinsysResult<(DeviceInfo, Option<HwContext>)> {
    let driver = bufmgr.driver();
    let mut info = DeviceInfo::default();

    if !has_param(driver, I915_PARAM_HAS_RELAXED_DELTA) {
        log::error!("kernel does not support relaxed relocation deltas");
        return Err(WinsysError::MissingCapability("relaxed relocation delta"));
    }

    info.devid = get_param(driver, I915_PARAM_CHIPSET_ID).map_or(0, |v| v as u32);

    let aperture = driver.aperture_sizes().map_err(|e| {
        log::error!("failed to query aperture sizes: {e}");
        WinsysError::Io(e)
    })?;
    info.aperture_mappable = aperture.mappable;
    info.aperture_total = aperture.total;

    info.has_llc = has_param(driver, I915_PARAM_HAS_LLC);
    info.has_address_swizzling = test_address_swizzling(bufmgr);

    let context = match HwContext::create(bufmgr.driver_arc()) {
        Ok(ctx) => Some(ctx),
        Err(e) if config.require_logical_context => {
            log::error!("failed to create a logical context: {e}");
            return Err(WinsysError::MissingCapability("logical hardware context"));
        }
        Err(e) => {
            log::warn!("running without a logical context: {e}");
            None
        }
    };
    info.has_logical_context = context.is_some();

    info.has_ppgtt = has_param(driver, I915_PARAM_HAS_ALIASING_PPGTT);
    info.has_timestamp = driver.reg_read(TIMESTAMP_REG).is_ok();
    info.has_gen7_sol_reset = has_param(driver, I915_PARAM_HAS_GEN7_SOL_RESET);

    log::info!(
        "device 0x{:04x}: aperture {} MiB ({} MiB mappable), llc={}, swizzle={}, context={}, ppgtt={}, timestamp={}, sol_reset={}",
        info.devid,
        info.aperture_total >> 20,
        info.aperture_mappable >> 20,
        info.has_llc,
        info.has_address_swizzling,
        info.has_logical_context,
        info.has_ppgtt,
        info.has_timestamp,
        info.has_gen7_sol_reset
    );

    Ok((info, context))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drm::ioctl::I915_BIT_6_SWIZZLE_9_10;
    use crate::drm::sim::{SimConfig, SimKernel};

    fn probe_on(config: SimConfig, winsys: &WinsysConfig) -> WinsysResult<DeviceInfo> {
        let kernel = SimKernel::new(config);
        let bufmgr = BufMgr::new(Arc::new(kernel.open()), winsys.clone())?;
        probe(&bufmgr, winsys).map(|(info, _)| info)
    }

    #[test]
    fn test_default_device() {
        let info = probe_on(SimConfig::default(), &WinsysConfig::default()).unwrap();
        assert_eq!(info.devid, 0x1616);
        assert_eq!(info.aperture_total, 4 << 30);
        assert!(info.has_llc);
        assert!(info.has_logical_context);
        assert!(info.has_timestamp);
        assert!(!info.has_address_swizzling);
    }

    #[test]
    fn test_optional_capabilities_read_as_false() {
        let sim = SimConfig::default()
            .without_param(I915_PARAM_HAS_LLC)
            .without_param(I915_PARAM_HAS_ALIASING_PPGTT)
            .without_register(TIMESTAMP_REG)
            .with_swizzle(I915_BIT_6_SWIZZLE_9_10);
        let info = probe_on(sim, &WinsysConfig::default()).unwrap();

        assert!(!info.has_llc);
        assert!(!info.has_ppgtt);
        assert!(!info.has_timestamp);
        assert!(info.has_address_swizzling);
    }

    #[test]
    fn test_missing_relaxed_delta_is_fatal() {
        let sim = SimConfig::default().without_param(I915_PARAM_HAS_RELAXED_DELTA);
        let err = probe_on(sim, &WinsysConfig::default()).unwrap_err();
        assert!(matches!(err, WinsysError::MissingCapability(_)));
    }

    #[test]
    fn test_context_failure_policy() {
        let strict = probe_on(
            SimConfig::default().fail_context_create(),
            &WinsysConfig::default(),
        );
        assert!(matches!(strict, Err(WinsysError::MissingCapability(_))));

        let relaxed = probe_on(
            SimConfig::default().fail_context_create(),
            &WinsysConfig::default().with_require_logical_context(false),
        )
        .unwrap();
        assert!(!relaxed.has_logical_context);
    }

    #[test]
    fn test_tiling_downgrade_means_no_swizzle() {
        let sim = SimConfig::default()
            .downgrade_tiling()
            .with_swizzle(I915_BIT_6_SWIZZLE_9_10);
        let info = probe_on(sim, &WinsysConfig::default()).unwrap();
        assert!(!info.has_address_swizzling);
    }
}
