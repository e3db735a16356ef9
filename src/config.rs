use std::env;
use std::time::Duration;

/// Default batch size, large enough for the relocation budget of a full command buffer.
pub const DEFAULT_BATCH_SIZE: usize = std::mem::size_of::<u32>() * 150 * 1024;

/// Tunables for a `WinSys` instance.
#[derive(Debug, Clone)]
pub struct WinsysConfig {
    /// Bytes of the largest batch; bounds the relocation count per buffer.
    pub batch_size: usize,
    /// Keep released buffers in a reuse cache instead of closing them.
    pub bo_reuse: bool,
    /// How long a cached buffer may sit unused before it is closed.
    pub cache_expiry: Duration,
    /// Fail creation when no logical hardware context can be created.
    pub require_logical_context: bool,
    /// Decode every submitted batch to the log.
    pub debug_batches: bool,
}

impl Default for WinsysConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            bo_reuse: true,
            cache_expiry: Duration::from_secs(1),
            require_logical_context: true,
            debug_batches: false,
        }
    }
}

impl WinsysConfig {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults overlaid with `INTEL_WINSYS_*` environment variables.
    #[must_use]
    pub fn from_env() -> Self {
        Self::default().apply_env(|key| env::var(key).ok())
    }

    fn apply_env(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if lookup("INTEL_WINSYS_NO_REUSE").is_some_and(|v| v != "0") {
            self.bo_reuse = false;
        }
        if let Some(debug) = lookup("INTEL_WINSYS_DEBUG") {
            self.debug_batches = debug.split(',').any(|flag| flag.trim() == "batch");
        }
        if let Some(size) = lookup("INTEL_WINSYS_BATCH_SIZE") {
            match size.trim().parse::<usize>() {
                Ok(size) if size >= 4096 => self.batch_size = size,
                _ => log::warn!("ignoring invalid INTEL_WINSYS_BATCH_SIZE={size}"),
            }
        }
        self
    }

    #[must_use]
    pub const fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    #[must_use]
    pub const fn with_bo_reuse(mut self, enabled: bool) -> Self {
        self.bo_reuse = enabled;
        self
    }

    #[must_use]
    pub const fn with_cache_expiry(mut self, expiry: Duration) -> Self {
        self.cache_expiry = expiry;
        self
    }

    #[must_use]
    pub const fn with_require_logical_context(mut self, required: bool) -> Self {
        self.require_logical_context = required;
        self
    }

    #[must_use]
    pub const fn with_debug_batches(mut self, enabled: bool) -> Self {
        self.debug_batches = enabled;
        self
    }

    /// Relocation entries one buffer may carry: two dwords per entry, less the
    /// batch terminator.
    #[must_use]
    pub const fn max_relocs(&self) -> usize {
        (self.batch_size / std::mem::size_of::<u32>() / 2).saturating_sub(2)
    }
}
