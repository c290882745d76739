use std::str::FromStr;
use std::time::Duration;

use relay_store::RequestKind;
use relay_store::repository::DEFAULT_CHUNK_SIZE;

#[derive(Debug, Clone, Default)]
pub struct HostConfig {
    pub scheduler: SchedulerConfig,
    pub dispatch: DispatchConfig,
    pub confirmation: ConfirmationConfig,
    pub persistence: PersistenceConfig,
    pub health: HealthThresholds,
}

impl HostConfig {
    /// Defaults with individual `RELAY_*` environment overrides applied.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(v) = env_override::<usize>("RELAY_BATCH_SIZE") {
            config.scheduler.batch_size = v.max(1);
        }
        if let Some(v) = env_override::<u32>("RELAY_MAX_ATTEMPTS") {
            config.scheduler.max_attempts = v;
        }
        if let Some(v) = env_override::<u64>("RELAY_MIN_INTERVAL_SECS") {
            config.scheduler.min_interval = Duration::from_secs(v);
        }
        if let Some(v) = env_override::<usize>("RELAY_CHUNK_SIZE") {
            config.persistence.chunk_size = v.max(1);
        }
        config
    }
}

fn env_override<T: FromStr>(name: &str) -> Option<T> {
    let raw = std::env::var(name).ok()?;
    match raw.trim().parse::<T>() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(var = name, value = %raw, "ignoring malformed config override");
            None
        }
    }
}

/// One request kind and how often its timer ticks.
#[derive(Debug, Clone)]
pub struct KindSchedule {
    pub kind: RequestKind,
    pub tick: Duration,
}

impl KindSchedule {
    pub fn new(kind: impl Into<String>, tick: Duration) -> Self {
        Self {
            kind: RequestKind::new(kind),
            tick,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Request kinds and their tick periods. Empty by default; the embedding
    /// application decides what it asks sessions for.
    pub kinds: Vec<KindSchedule>,
    pub batch_size: usize,
    pub batch_pause: Duration,
    /// Minimum gap between two dispatches of the same kind to one session.
    pub min_interval: Duration,
    pub max_attempts: u32,
    pub maintenance_interval: Duration,
    pub inactivity_threshold: Duration,
    pub ledger_cap: usize,
    pub confirmation_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            kinds: Vec::new(),
            batch_size: 25,
            batch_pause: Duration::from_millis(500),
            min_interval: Duration::from_secs(30),
            max_attempts: 10,
            maintenance_interval: Duration::from_secs(5 * 60),
            inactivity_threshold: Duration::from_secs(24 * 60 * 60),
            ledger_cap: 20,
            confirmation_interval: Duration::from_secs(15),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// How long a proposed request stays valid; also bounds the wait for an answer.
    pub approval_validity: Duration,
    pub payload_version: u32,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            approval_validity: Duration::from_secs(10 * 60),
            payload_version: 1,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConfirmationConfig {
    pub min_age: Duration,
    /// Chance per sweep that an old-enough attempt is confirmed by the simulated oracle.
    pub probability: f64,
    pub plateau: u32,
}

impl Default for ConfirmationConfig {
    fn default() -> Self {
        Self {
            min_age: Duration::from_secs(60),
            probability: 0.7,
            plateau: 10,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PersistenceConfig {
    pub chunk_size: usize,
    pub essential_limit: usize,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            essential_limit: 5000,
        }
    }
}

#[derive(Debug, Clone)]
pub struct HealthThresholds {
    pub warning_memory_mb: f64,
    pub critical_memory_mb: f64,
    pub warning_pending: usize,
    pub critical_pending: usize,
    /// Above this many sessions health tops out at `Good`.
    pub good_sessions: usize,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            warning_memory_mb: 500.0,
            critical_memory_mb: 1000.0,
            warning_pending: 1000,
            critical_pending: 10_000,
            good_sessions: 100_000,
        }
    }
}
