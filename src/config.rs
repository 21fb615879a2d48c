//! Environment-derived configuration (spec §6.3)

use std::env;
use std::time::Duration;

/// Placement policy for newly created datums (`ADLB_PLACEMENT`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    /// Hash-based placement (the default).
    Default,
    /// Always place on the creator's home server.
    Local,
    /// Uniformly random server.
    Random,
}

impl Default for Placement {
    fn default() -> Self {
        Placement::Default
    }
}

/// Hostmap construction mode (`ADLB_HOSTMAP_MODE`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostmapMode {
    /// Build the full host → workers table.
    Enabled,
    /// Register only the lowest-ranked worker per host.
    Leaders,
    /// Do not build a host table; NODE targeting degrades to RANK.
    Disabled,
}

impl Default for HostmapMode {
    fn default() -> Self {
        HostmapMode::Enabled
    }
}

/// Runtime configuration assembled from `ADLB_*` environment variables.
///
/// Every field has a sensible default; `from_env` overrides defaults with
/// whatever is present in the process environment, the same way
/// `ConsensusConfig::default()` is overridden by explicit construction.
#[derive(Debug, Clone)]
pub struct Config {
    /// Idle-detection threshold (`ADLB_EXHAUST_TIME`, seconds).
    pub exhaust_time: Duration,
    /// Fractional load below which the job aborts (`ADLB_LOAD_MIN`).
    pub load_min: f64,
    /// Rank alignment modulus for parallel tasks (`ADLB_PAR_MOD`).
    pub par_mod: u32,
    /// Placement policy for new datums.
    pub placement: Placement,
    /// Hostmap construction mode.
    pub hostmap_mode: HostmapMode,
    /// Size of the sync recv-buffer ring (`ADLB_SYNC_RECVS`).
    pub sync_recvs: usize,
    /// Initial size of the deferred-sync ring (`ADLB_DEBUG_SYNC_BUFFER_SIZE`).
    pub deferred_sync_buffer_size: usize,
    /// Print every unfreed datum at shutdown (`ADLB_REPORT_LEAKS`).
    pub report_leaks: bool,
    /// Print timing summary at shutdown (`ADLB_PRINT_TIME`).
    pub print_time: bool,
    /// Enable performance counters (`ADLB_PERF_COUNTERS`).
    pub perf_counters: bool,
    /// Enable verbose debug logging (`ADLB_DEBUG`).
    pub debug: bool,
    /// Enable per-message tracing (`ADLB_TRACE`).
    pub trace: bool,
    /// Maximum number of concurrent outstanding steal probes per server.
    pub steal_concurrency_limit: usize,
    /// Minimum interval between steal probes to the same peer.
    pub steal_rate_limit: Duration,
    /// Back-off applied after `servers` consecutive failed steal attempts.
    pub steal_backoff: Duration,
    /// Maximum idle time before a server considers itself locally idle.
    pub max_idle: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            exhaust_time: Duration::from_secs(1),
            load_min: 0.0,
            par_mod: 1,
            placement: Placement::default(),
            hostmap_mode: HostmapMode::default(),
            sync_recvs: 64,
            deferred_sync_buffer_size: 128,
            report_leaks: false,
            print_time: false,
            perf_counters: false,
            debug: false,
            trace: false,
            steal_concurrency_limit: 1,
            steal_rate_limit: Duration::from_millis(100),
            steal_backoff: Duration::from_secs(1),
            max_idle: Duration::from_secs(1),
        }
    }
}

impl Config {
    /// Build a configuration from defaults overridden by the process
    /// environment. Unparseable values fall back to the default silently
    /// matched against (logged by the caller if desired).
    pub fn from_env() -> Self {
        let mut cfg = Config::default();

        if let Some(v) = env_f64("ADLB_EXHAUST_TIME") {
            cfg.exhaust_time = Duration::from_secs_f64(v);
        }
        if let Some(v) = env_f64("ADLB_LOAD_MIN") {
            cfg.load_min = v;
        }
        if let Some(v) = env_u32("ADLB_PAR_MOD") {
            cfg.par_mod = v.max(1);
        }
        if let Ok(v) = env::var("ADLB_PLACEMENT") {
            cfg.placement = match v.as_str() {
                "local" => Placement::Local,
                "random" => Placement::Random,
                _ => Placement::Default,
            };
        }
        if let Ok(v) = env::var("ADLB_HOSTMAP_MODE") {
            cfg.hostmap_mode = match v.as_str() {
                "leaders" => HostmapMode::Leaders,
                "disabled" => HostmapMode::Disabled,
                _ => HostmapMode::Enabled,
            };
        }
        if let Some(v) = env_usize("ADLB_SYNC_RECVS") {
            cfg.sync_recvs = v;
        }
        if let Some(v) = env_usize("ADLB_DEBUG_SYNC_BUFFER_SIZE") {
            cfg.deferred_sync_buffer_size = v;
        }
        cfg.report_leaks = env_bool("ADLB_REPORT_LEAKS");
        cfg.print_time = env_bool("ADLB_PRINT_TIME");
        cfg.perf_counters = env_bool("ADLB_PERF_COUNTERS");
        cfg.debug = env_bool("ADLB_DEBUG");
        cfg.trace = env_bool("ADLB_TRACE");

        cfg
    }

    /// Basic sanity checks, mirroring the teacher's `ConsensusConfig::validate`.
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.par_mod == 0 {
            return Err("ADLB_PAR_MOD must be >= 1".to_string());
        }
        if self.sync_recvs == 0 {
            return Err("ADLB_SYNC_RECVS must be >= 1".to_string());
        }
        Ok(())
    }
}

fn env_f64(key: &str) -> Option<f64> {
    env::var(key).ok().and_then(|v| v.parse().ok())
}

fn env_u32(key: &str) -> Option<u32> {
    env::var(key).ok().and_then(|v| v.parse().ok())
}

fn env_usize(key: &str) -> Option<usize> {
    env::var(key).ok().and_then(|v| v.parse().ok())
}

fn env_bool(key: &str) -> bool {
    matches!(
        env::var(key).ok().as_deref(),
        Some("1") | Some("true") | Some("TRUE") | Some("yes")
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let cfg = Config::default();
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn par_mod_zero_rejected() {
        let mut cfg = Config::default();
        cfg.par_mod = 0;
        assert!(cfg.validate().is_err());
    }
}
