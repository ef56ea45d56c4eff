//! Runtime knobs for an informer.

use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InformerConfig {
    /// Soft capacity of each listener's delivery queue.
    pub listener_buffer: usize,
    /// Relist interval while watching; `None` disables periodic resync.
    pub resync_period: Option<Duration>,
    pub backoff_initial: Duration,
    pub backoff_max: Duration,
    /// How long `stop` waits for each listener to drain its queue.
    pub drain_timeout: Duration,
    /// Do not notify listeners for a Sync delta whose object equals the stored one.
    pub skip_unchanged_sync: bool,
}

impl Default for InformerConfig {
    fn default() -> Self {
        Self {
            listener_buffer: 1024,
            resync_period: None,
            backoff_initial: Duration::from_millis(200),
            backoff_max: Duration::from_secs(30),
            drain_timeout: Duration::from_secs(5),
            skip_unchanged_sync: true,
        }
    }
}

impl InformerConfig {
    /// Defaults overridden by `KACHE_*` environment variables.
    pub fn from_env() -> Self {
        let d = Self::default();
        let listener_buffer = env_parse::<usize>("KACHE_LISTENER_BUFFER").unwrap_or(d.listener_buffer).max(1);
        let resync_period = match env_parse::<u64>("KACHE_RESYNC_SECS") {
            Some(0) => None,
            Some(secs) => Some(Duration::from_secs(secs)),
            None => d.resync_period,
        };
        let backoff_initial = env_parse::<u64>("KACHE_BACKOFF_INITIAL_MS").map(Duration::from_millis).unwrap_or(d.backoff_initial);
        let backoff_max = env_parse::<u64>("KACHE_WATCH_BACKOFF_MAX_SECS").map(Duration::from_secs).unwrap_or(d.backoff_max);
        let drain_timeout = env_parse::<u64>("KACHE_DRAIN_TIMEOUT_MS").map(Duration::from_millis).unwrap_or(d.drain_timeout);
        let skip_unchanged_sync = std::env::var("KACHE_SKIP_UNCHANGED_SYNC")
            .ok()
            .map(|v| !(v == "0" || v.eq_ignore_ascii_case("false")))
            .unwrap_or(d.skip_unchanged_sync);
        Self { listener_buffer, resync_period, backoff_initial, backoff_max, drain_timeout, skip_unchanged_sync }
    }

    pub fn with_resync_period(mut self, period: Option<Duration>) -> Self {
        self.resync_period = period;
        self
    }

    pub fn with_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.backoff_initial = initial;
        self.backoff_max = max.max(initial);
        self
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|s| s.parse::<T>().ok())
}
