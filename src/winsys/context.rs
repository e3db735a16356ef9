use crate::drm::KernelDriver;
use crate::error::WinsysResult;
use std::sync::Arc;

/// Hang accounting for a logical context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ResetStats {
    /// GPU resets seen system-wide.
    pub reset_count: u32,
    /// Batches of this context that were executing when the GPU hung.
    pub active_lost: u32,
    /// Batches of this context that were queued behind the hang.
    pub pending_lost: u32,
}

/// A logical hardware context, destroyed on drop.
#[derive(Debug)]
pub struct HwContext {
    driver: Arc<dyn KernelDriver>,
    id: u32,
}

impl HwContext {
    pub(crate) fn create(driver: Arc<dyn KernelDriver>) -> WinsysResult<Self> {
        let id = driver.context_create()?;
        log::debug!("created logical context {id}");
        Ok(Self { driver, id })
    }

    #[must_use]
    pub const fn id(&self) -> u32 {
        self.id
    }

    /// Reads the context's reset statistics. Does not modify the context.
    ///
    /// # Errors
    /// `Io` when the kernel does not support or refuses the query.
    pub fn reset_stats(&self) -> WinsysResult<ResetStats> {
        let raw = self.driver.reset_stats(self.id)?;
        Ok(ResetStats {
            reset_count: raw.reset_count,
            active_lost: raw.batch_active,
            pending_lost: raw.batch_pending,
        })
    }
}

impl Drop for HwContext {
    fn drop(&mut self) {
        self.driver.context_destroy(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drm::sim::{SimConfig, SimKernel};

    #[test]
    fn test_stats_follow_injected_resets() {
        let kernel = SimKernel::new(SimConfig::default());
        let ctx = HwContext::create(Arc::new(kernel.open())).unwrap();
        assert_eq!(ctx.reset_stats().unwrap(), ResetStats::default());

        kernel.inject_reset(1, 3);
        kernel.inject_reset(0, 2);
        let stats = ctx.reset_stats().unwrap();
        assert_eq!(stats.reset_count, 2);
        assert_eq!(stats.active_lost, 1);
        assert_eq!(stats.pending_lost, 5);
    }

    #[test]
    fn test_drop_destroys_context() {
        let kernel = SimKernel::new(SimConfig::default());
        let dev = Arc::new(kernel.open());
        let ctx = HwContext::create(dev.clone()).unwrap();
        assert_eq!(kernel.live_contexts(), 1);
        drop(ctx);
        assert_eq!(kernel.live_contexts(), 0);
    }
}
