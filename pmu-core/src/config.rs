//! Engine configuration and fixed limits

/// Number of sequence slots (commands in flight)
pub const MAX_SEQUENCES: usize = 32;

/// Number of hardware mutexes
pub const MUTEX_COUNT: usize = 16;

/// Synchronous wait budget (ELPG acks, ZBC save)
pub const GR_IDLE_TIMEOUT_US: u64 = 3_000_000;

/// Initial poll delay of the wait helper
pub const POLL_DELAY_MIN_US: u64 = 10;

/// Poll delay ceiling of the wait helper
pub const POLL_DELAY_MAX_US: u64 = 1_000;

/// Attempts to get a token and win a hardware mutex
pub const MUTEX_RETRIES: u32 = 40;

/// ZBC table entries saved at the end of bootstrap
pub const ZBC_ENTRIES: u32 = 0xf;

/// Power-gating idle filter thresholds written before ELPG INIT
pub const PG_IDLE_FILTER: u32 = 15_000;
pub const PG_PPU_IDLE_FILTER: u32 = 1_000_000;

/// Adaptive power tuning
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AelpgParams {
    pub sampling_period_us: u32,
    pub min_idle_filter_us: u32,
    pub min_target_saving_us: u32,
    pub power_break_even_us: u32,
    pub cycles_per_sample_max: u32,
}

impl AelpgParams {
    pub const fn new() -> Self {
        Self {
            sampling_period_us: 1_000_000,
            min_idle_filter_us: 100,
            min_target_saving_us: 10_000,
            power_break_even_us: 2_000,
            cycles_per_sample_max: 200,
        }
    }
}

impl Default for AelpgParams {
    fn default() -> Self {
        Self::new()
    }
}

/// Runtime knobs of a [`crate::PmuContext`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PmuConfig {
    /// Enable ELPG at the end of bootstrap
    pub elpg_enabled: bool,
    /// Gate the memory subsystem engine as well as graphics
    pub mscg_enabled: bool,
    /// Initialise adaptive power at the end of bootstrap
    pub aelpg_enabled: bool,
    pub aelpg_params: AelpgParams,
    /// Initialise perfmon after the init message and keep it sampling
    pub perfmon_sampling: bool,
    pub gr_idle_timeout_us: u64,
    pub poll_delay_min_us: u64,
    pub poll_delay_max_us: u64,
    pub mutex_retries: u32,
    /// Sleep bounds between mutex attempts
    pub mutex_backoff_us: (u64, u64),
    pub zbc_entries: u32,
}

impl PmuConfig {
    pub const fn new() -> Self {
        Self {
            elpg_enabled: true,
            mscg_enabled: false,
            aelpg_enabled: false,
            aelpg_params: AelpgParams::new(),
            perfmon_sampling: true,
            gr_idle_timeout_us: GR_IDLE_TIMEOUT_US,
            poll_delay_min_us: POLL_DELAY_MIN_US,
            poll_delay_max_us: POLL_DELAY_MAX_US,
            mutex_retries: MUTEX_RETRIES,
            mutex_backoff_us: (20, 40),
            zbc_entries: ZBC_ENTRIES,
        }
    }
}

impl Default for PmuConfig {
    fn default() -> Self {
        Self::new()
    }
}
