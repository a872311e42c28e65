use log::warn;
use tokio::time::Duration;

use super::{DEFAULT_RETRY_CAP, DEFAULT_RETRY_UNIT, MAX_JITTER};
use crate::utils::parse_bool_ext;

pub const ENV_DSYNC_TRACE: &str = "HULK_DSYNC_TRACE";

// Tolerance limit to wait for lock acquisition before.
pub const DRW_MUTEX_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(1);

// Timeout for the unlock call
pub const DRW_MUTEX_UNLOCK_CALL_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct Config {
    // Log lock/unlock failures of individual lockers.
    pub trace: bool,
    // Combined timeout for a single quorum attempt.
    pub acquire_timeout: Duration,
    // Bound on every single release call.
    pub unlock_call_timeout: Duration,
    pub retry_unit: Duration,
    pub retry_cap: Duration,
    pub retry_jitter: f64,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            trace: false,
            acquire_timeout: DRW_MUTEX_ACQUIRE_TIMEOUT,
            unlock_call_timeout: DRW_MUTEX_UNLOCK_CALL_TIMEOUT,
            retry_unit: DEFAULT_RETRY_UNIT,
            retry_cap: DEFAULT_RETRY_CAP,
            retry_jitter: MAX_JITTER,
        }
    }
}

impl Config {
    pub fn from_env() -> Config {
        let mut config = Config::default();
        if let Ok(v) = std::env::var(ENV_DSYNC_TRACE) {
            match parse_bool_ext(&v) {
                Ok(trace) => config.trace = trace,
                Err(err) => warn!("invalid value {:?} for {}: {}", v, ENV_DSYNC_TRACE, err),
            }
        }
        config
    }

    pub fn with_trace(mut self, trace: bool) -> Config {
        self.trace = trace;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_from_env() {
        std::env::remove_var(ENV_DSYNC_TRACE);
        assert!(!Config::from_env().trace);

        std::env::set_var(ENV_DSYNC_TRACE, "1");
        assert!(Config::from_env().trace);

        std::env::set_var(ENV_DSYNC_TRACE, "on");
        assert!(Config::from_env().trace);

        std::env::set_var(ENV_DSYNC_TRACE, "bogus");
        assert!(!Config::from_env().trace);

        std::env::remove_var(ENV_DSYNC_TRACE);
        let config = Config::from_env();
        assert_eq!(config.acquire_timeout, DRW_MUTEX_ACQUIRE_TIMEOUT);
        assert_eq!(config.retry_jitter, MAX_JITTER);
    }
}
