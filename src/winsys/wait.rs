use crate::error::{WinsysError, WinsysResult};
use crate::winsys::bo::BufferObject;

/// Outcome of waiting on a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitStatus {
    /// No outstanding GPU work references the buffer.
    Idle,
    /// The timeout expired first.
    Busy,
}

impl BufferObject {
    /// Waits up to `timeout_ns` for GPU work on the buffer to finish.
    /// A negative timeout waits forever.
    ///
    /// Kernel errors other than expiry are logged and reported as `Idle`, so a
    /// lost device never wedges the caller. Use [`Self::wait_checked`] to see them.
    pub fn wait(&self, timeout_ns: i64) -> WaitStatus {
        match self.wait_checked(timeout_ns) {
            Ok(status) => status,
            Err(e) => {
                log::warn!("bo '{}': wait failed, assuming idle: {e}", self.name());
                WaitStatus::Idle
            }
        }
    }

    /// Like [`Self::wait`] but surfaces kernel errors.
    ///
    /// # Errors
    /// `Wait` with the kernel's errno for anything but an expired timeout.
    pub fn wait_checked(&self, timeout_ns: i64) -> WinsysResult<WaitStatus> {
        match self.bufmgr().driver().wait(self.handle(), timeout_ns) {
            Ok(()) => Ok(WaitStatus::Idle),
            Err(e) if e.raw_os_error() == Some(libc::ETIME) => Ok(WaitStatus::Busy),
            Err(e) => Err(WinsysError::Wait(e)),
        }
    }

    /// Whether the GPU may still be using the buffer. Query failures read as idle.
    #[must_use]
    pub fn is_busy(&self) -> bool {
        self.bufmgr().driver().busy(self.handle()).unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drm::sim::{SimConfig, SimKernel};
    use crate::winsys::exec::{ExecFlags, Ring};
    use crate::winsys::test_support::winsys_on;

    #[test]
    fn test_timeout_reports_busy() {
        let kernel = SimKernel::new(SimConfig::default().manual_retire());
        let ws = winsys_on(&kernel);
        let batch = ws.alloc_bo("batch", 4096, true).unwrap();
        ws.submit(Ring::Render, &batch, 8, ExecFlags::empty()).unwrap();

        assert!(batch.is_busy());
        assert_eq!(batch.wait(0), WaitStatus::Busy);
        assert_eq!(batch.wait(1_000_000), WaitStatus::Busy);

        kernel.retire();
        assert_eq!(batch.wait(0), WaitStatus::Idle);
        assert!(!batch.is_busy());
    }

    #[test]
    fn test_idle_buffer_returns_immediately() {
        let kernel = SimKernel::new(SimConfig::default());
        let ws = winsys_on(&kernel);
        let bo = ws.alloc_bo("idle", 4096, true).unwrap();
        assert_eq!(bo.wait(-1), WaitStatus::Idle);
        assert_eq!(bo.wait_checked(0).unwrap(), WaitStatus::Idle);
    }
}
